//! The static documentation lookup table: an opaque map from qualified name
//! to doc record, with two rewrite rules applied on miss.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

const DOCS_JSON: &str = include_str!("docs.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    pub url: String,
}

fn table() -> &'static HashMap<String, DocRecord> {
    static TABLE: OnceLock<HashMap<String, DocRecord>> = OnceLock::new();
    TABLE.get_or_init(|| {
        serde_json::from_str(DOCS_JSON).expect("builtin documentation table is valid JSON")
    })
}

/// Probe the exact name; on miss, fold subclassed error and typed-array
/// names back onto their base entries (`TypeError.x` -> `Error.x`,
/// `Float64Array.x` -> `TypedArray.x`).
pub fn lookup(name: &str) -> Option<&'static DocRecord> {
    let docs = table();
    if let Some(record) = docs.get(name) {
        return Some(record);
    }
    if let Some(rewritten) = rewrite(name, "Error", "Error") {
        if let Some(record) = docs.get(&rewritten) {
            return Some(record);
        }
    }
    if let Some(rewritten) = rewrite(name, "Array", "TypedArray") {
        if let Some(record) = docs.get(&rewritten) {
            return Some(record);
        }
    }
    None
}

fn rewrite(name: &str, suffix: &str, replacement: &str) -> Option<String> {
    let (head, rest) = name.split_once('.')?;
    if head.ends_with(suffix) && head != replacement {
        Some(format!("{}.{}", replacement, rest))
    } else {
        None
    }
}
