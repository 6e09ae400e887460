use evalsession_core::session_api::CompletionMatches;

use crate::expression::Expression;

/// Reserved words of the source language, offered alongside global property
/// names when completing at the global scope.
pub const RESERVED_WORDS: &[&str] = &[
    "abstract",
    "arguments",
    "await",
    "boolean",
    "break",
    "byte",
    "case",
    "catch",
    "char",
    "class",
    "const",
    "continue",
    "debugger",
    "default",
    "delete",
    "do",
    "double",
    "else",
    "enum",
    "eval",
    "export",
    "extends",
    "false",
    "final",
    "finally",
    "float",
    "for",
    "function",
    "goto",
    "if",
    "implements",
    "import",
    "in",
    "instanceof",
    "int",
    "interface",
    "let",
    "long",
    "native",
    "new",
    "null",
    "package",
    "private",
    "protected",
    "public",
    "return",
    "short",
    "static",
    "super",
    "switch",
    "synchronized",
    "this",
    "throw",
    "throws",
    "transient",
    "true",
    "try",
    "typeof",
    "var",
    "void",
    "volatile",
    "while",
    "with",
    "yield",
];

/// The completion delivered without engaging the worker when nothing useful
/// sits under the cursor.
pub fn empty(code: &str, cursor_pos: usize) -> CompletionMatches {
    CompletionMatches {
        list: Vec::new(),
        code: code.to_string(),
        cursor_pos,
        matched_text: String::new(),
        cursor_start: cursor_pos,
        cursor_end: cursor_pos,
    }
}

/// Post-process the property names the worker enumerated for the scope into
/// the completion result.
pub fn build(
    expression: &Expression,
    code: &str,
    cursor_pos: usize,
    names: Vec<String>,
) -> CompletionMatches {
    let mut candidates = names;
    if expression.scope.is_empty() {
        candidates.extend(RESERVED_WORDS.iter().map(|w| w.to_string()));
    }
    let mut list: Vec<String> = candidates
        .into_iter()
        .filter(|name| name.starts_with(&expression.selector))
        .map(|name| {
            format!(
                "{}{}{}{}",
                expression.scope, expression.left_op, name, expression.right_op
            )
        })
        .collect();
    list.sort();
    list.dedup();

    let cursor_start = code.find(&expression.matched_text).unwrap_or(0);
    // Advance through the longest common prefix of the code tail and the
    // shortest candidate, so an already-typed tail is replaced rather than
    // duplicated.
    let mut cursor_end = cursor_start;
    if let Some(shortest) = list.iter().min_by_key(|s| s.len()) {
        for (a, b) in code[cursor_start..].chars().zip(shortest.chars()) {
            if a != b {
                break;
            }
            cursor_end += a.len_utf8();
        }
    }

    CompletionMatches {
        list,
        code: code.to_string(),
        cursor_pos,
        matched_text: expression.matched_text.clone(),
        cursor_start,
        cursor_end,
    }
}
