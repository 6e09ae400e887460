//! Post-processing of worker inspections: attach the request coordinates and
//! resolve documentation for the matched expression.

use evalsession_core::session_api::Inspection;
use serde::Serialize;

use crate::docs::{self, DocRecord};

/// The inspection delivered to `on_success` of an `inspect` call: the
/// worker's report plus the original request coordinates and, when it can be
/// resolved, a documentation record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectionResult {
    #[serde(flatten)]
    pub inspection: Inspection,
    pub code: String,
    #[serde(rename = "cursorPos")]
    pub cursor_pos: usize,
    #[serde(rename = "matchedText")]
    pub matched_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<DocRecord>,
}

/// The inspection delivered without engaging the worker when nothing useful
/// sits under the cursor.
pub fn empty(code: &str, cursor_pos: usize) -> InspectionResult {
    InspectionResult {
        inspection: Inspection {
            string: String::new(),
            type_: String::new(),
            constructor_list: None,
            length: None,
        },
        code: code.to_string(),
        cursor_pos,
        matched_text: String::new(),
        doc: None,
    }
}

/// Documentation for an unscoped expression: probe the matched text itself.
pub fn doc_for_name(matched_text: &str) -> Option<DocRecord> {
    docs::lookup(matched_text).cloned()
}

/// Documentation for a scoped expression: walk the scope's constructor chain
/// probing `{constructor}.prototype.{selector}`, first hit wins.
pub fn doc_from_constructors(constructors: &[String], selector: &str) -> Option<DocRecord> {
    for constructor in constructors {
        let name = format!("{}.prototype.{}", constructor, selector);
        if let Some(record) = docs::lookup(&name) {
            return Some(record.clone());
        }
    }
    None
}
