use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use evalsession_core::session_api::{content_type, MimeBundle};

use crate::value::{Value, ValueKind};

/// A user-installed encoder. When present it replaces the default rules
/// entirely.
pub type CustomMimer = Box<dyn Fn(&dyn Value) -> MimeBundle + Send + Sync>;

/// Encode a value into a MIME bundle.
///
/// Default rule chain: undefined/null get their literal text form; a
/// `to_mime` hook seeds the bundle; `text/plain` is filled from the canonical
/// inspect form when absent; the remaining hooks fill their content type when
/// absent (image hooks are base64-encoded).
pub fn encode(value: &dyn Value, custom: Option<&CustomMimer>) -> MimeBundle {
    if let Some(custom) = custom {
        return custom(value);
    }
    match value.kind() {
        ValueKind::Undefined => return MimeBundle::text_plain("undefined"),
        ValueKind::Null => return MimeBundle::text_plain("null"),
        _ => {}
    }
    let mut bundle = value.to_mime().unwrap_or_default();
    if !bundle.contains(content_type::TEXT_PLAIN) {
        bundle.insert(content_type::TEXT_PLAIN, text_form(value));
    }
    if !bundle.contains(content_type::TEXT_HTML) {
        if let Some(html) = value.to_html() {
            bundle.insert(content_type::TEXT_HTML, html);
        }
    }
    if !bundle.contains(content_type::IMAGE_SVG) {
        if let Some(svg) = value.to_svg() {
            bundle.insert(content_type::IMAGE_SVG, svg);
        }
    }
    if !bundle.contains(content_type::IMAGE_PNG) {
        if let Some(png) = value.to_png() {
            bundle.insert(content_type::IMAGE_PNG, BASE64.encode(png));
        }
    }
    if !bundle.contains(content_type::IMAGE_JPEG) {
        if let Some(jpeg) = value.to_jpeg() {
            bundle.insert(content_type::IMAGE_JPEG, BASE64.encode(jpeg));
        }
    }
    bundle
}

/// Canonical text form: functions are stringified, everything else is
/// debug-formatted.
fn text_form(value: &dyn Value) -> String {
    if value.kind() == ValueKind::Function {
        if let Some(source) = value.string_value() {
            return source;
        }
    }
    value.inspect()
}
