//! Token-level expression extraction for completion and inspection.
//!
//! Works on the prefix of the source up to the cursor, entirely without the
//! worker: the trailing simple identifier becomes the selector, and a
//! preceding `.` or quoted-bracket operator attaches it to a complex
//! identifier scope (`a.b`, `a["b"]`, `a['b']` segments, in any mix).

/// The extracted match. All fields empty means "nothing under the cursor,
/// complete against the global scope".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expression {
    pub matched_text: String,
    pub scope: String,
    pub left_op: String,
    pub right_op: String,
    pub selector: String,
}

/// Extract the expression ending at `cursor_pos`. Returns `None` when the
/// cursor sits after an explicit accessor operator whose scope cannot be
/// parsed (an unsupported construct, e.g. `foo().` or a leading `.`).
pub fn parse(code: &str, cursor_pos: usize) -> Option<Expression> {
    let cursor = clamp_to_char_boundary(code, cursor_pos);
    let prefix = &code[..cursor];
    if prefix.is_empty() || prefix.ends_with(char::is_whitespace) {
        return Some(Expression::default());
    }

    let selector_start = identifier_suffix_start(prefix);
    let selector = &prefix[selector_start..];
    let before = &prefix[..selector_start];

    let (left_op, right_op) = if before.ends_with('.') {
        (".", "")
    } else if before.ends_with("[\"") {
        ("[\"", "\"]")
    } else if before.ends_with("['") {
        ("['", "']")
    } else {
        // A simple identifier in the global scope.
        return Some(Expression {
            matched_text: selector.to_string(),
            selector: selector.to_string(),
            ..Default::default()
        });
    };

    let scope_source = &before[..before.len() - left_op.len()];
    let scope_start = complex_identifier_start(scope_source)?;
    Some(Expression {
        matched_text: prefix[scope_start..].to_string(),
        scope: scope_source[scope_start..].to_string(),
        left_op: left_op.to_string(),
        right_op: right_op.to_string(),
        selector: selector.to_string(),
    })
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn clamp_to_char_boundary(code: &str, pos: usize) -> usize {
    let mut pos = pos.min(code.len());
    while !code.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Start of the longest identifier suffix of `source`, or `source.len()`
/// when the source does not end in one.
fn identifier_suffix_start(source: &str) -> usize {
    let run_start = source
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_identifier_char(*c))
        .last()
        .map(|(i, _)| i)
        .unwrap_or(source.len());
    // The suffix must start like an identifier, not with a digit.
    for (i, c) in source[run_start..].char_indices() {
        if is_identifier_start(c) {
            return run_start + i;
        }
    }
    source.len()
}

/// Start of the longest complex-identifier suffix of `source`: an identifier
/// followed by any mix of `.ident`, `["..."]` and `['...']` segments.
/// `None` when no such suffix exists.
fn complex_identifier_start(source: &str) -> Option<usize> {
    let mut pos = source.len();
    let mut start = None;
    loop {
        let head = &source[..pos];
        if head.ends_with("\"]") || head.ends_with("']") {
            let quote = if head.ends_with("\"]") { '"' } else { '\'' };
            match bracket_segment_start(head, quote) {
                Some(open) => {
                    pos = open;
                    continue;
                }
                None => break,
            }
        }
        let segment = identifier_suffix_start(head);
        if segment == pos {
            break;
        }
        pos = segment;
        // The chain is only valid once it is headed by an identifier.
        start = Some(pos);
        if source[..pos].ends_with('.') {
            pos -= 1;
            continue;
        }
        break;
    }
    start
}

/// `head` ends with a closing quote-bracket; find the matching opener.
/// Escapes and embedded quotes are not supported.
fn bracket_segment_start(head: &str, quote: char) -> Option<usize> {
    let content_end = head.len() - 2;
    let opener = if quote == '"' { "[\"" } else { "['" };
    let open = head[..content_end].rfind(opener)?;
    let content = &head[open + 2..content_end];
    if content.contains(quote) || content.contains('\\') {
        return None;
    }
    Some(open)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(
        matched_text: &str,
        scope: &str,
        left_op: &str,
        right_op: &str,
        selector: &str,
    ) -> Expression {
        Expression {
            matched_text: matched_text.to_string(),
            scope: scope.to_string(),
            left_op: left_op.to_string(),
            right_op: right_op.to_string(),
            selector: selector.to_string(),
        }
    }

    #[test]
    fn test_empty_prefix() {
        assert_eq!(parse("", 0), Some(Expression::default()));
        assert_eq!(parse("abc", 0), Some(Expression::default()));
    }

    #[test]
    fn test_whitespace_before_cursor() {
        assert_eq!(parse("a ", 2), Some(Expression::default()));
        assert_eq!(parse("var x", 4), Some(Expression::default()));
    }

    #[test]
    fn test_simple_identifier() {
        assert_eq!(parse("set", 3), Some(expr("set", "", "", "", "set")));
        assert_eq!(parse("set", 2), Some(expr("se", "", "", "", "se")));
    }

    #[test]
    fn test_identifier_inside_larger_code() {
        assert_eq!(
            parse("var a = [1, 2, 3];", 5),
            Some(expr("a", "", "", "", "a"))
        );
    }

    #[test]
    fn test_dotted_scope() {
        assert_eq!(
            parse("foo.ba", 6),
            Some(expr("foo.ba", "foo", ".", "", "ba"))
        );
        assert_eq!(parse("foo.", 4), Some(expr("foo.", "foo", ".", "", "")));
    }

    #[test]
    fn test_chained_scope() {
        assert_eq!(
            parse("obj.prop.ba", 11),
            Some(expr("obj.prop.ba", "obj.prop", ".", "", "ba"))
        );
    }

    #[test]
    fn test_bracketed_scope() {
        assert_eq!(
            parse(r#"foo["ba"#, 7),
            Some(expr(r#"foo["ba"#, "foo", r#"[""#, r#""]"#, "ba"))
        );
        assert_eq!(
            parse("foo['ba", 7),
            Some(expr("foo['ba", "foo", "['", "']", "ba"))
        );
    }

    #[test]
    fn test_bracket_segment_in_scope() {
        assert_eq!(
            parse(r#"a["x"].ba"#, 9),
            Some(expr(r#"a["x"].ba"#, r#"a["x"]"#, ".", "", "ba"))
        );
    }

    #[test]
    fn test_unsupported_scopes() {
        assert_eq!(parse(".foo", 4), None);
        assert_eq!(parse("foo().ba", 8), None);
        assert_eq!(parse(r#"["x"].y"#, 7), None);
    }

    #[test]
    fn test_scope_falls_back_to_trailing_identifier() {
        // Only the trailing complex identifier is picked up, like a
        // suffix-anchored match would.
        assert_eq!(
            parse("foo().b.sel", 11),
            Some(expr("b.sel", "b", ".", "", "sel"))
        );
    }

    #[test]
    fn test_digits_do_not_start_identifiers() {
        assert_eq!(parse("1+2", 3), Some(expr("", "", "", "", "")));
        assert_eq!(parse("x12", 3), Some(expr("x12", "", "", "", "x12")));
        assert_eq!(parse("12ab", 4), Some(expr("ab", "", "", "", "ab")));
    }

    #[test]
    fn test_cursor_past_the_end_is_clamped() {
        assert_eq!(parse("ab", 10), Some(expr("ab", "", "", "", "ab")));
    }
}
