//! Splits an f-string's raw template (as captured by the lexer) into
//! literal and interpolated parts, recursively parsing each interpolated
//! expression with the ordinary expression grammar (§4.1, §4.2).

use crate::ast::{Expr, FStringPart};
use crate::error::CompileError;
use crate::token::Location;

type PResult<T> = Result<T, CompileError>;

pub fn parse_fstring(template: &str, filename: &str) -> PResult<Vec<FStringPart>> {
    let chars: Vec<char> = template.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '{' => {
                if !literal.is_empty() {
                    parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                }
                let (field, next) = scan_field(&chars, i + 1, filename)?;
                i = next;
                let (expr_src, conversion, format_spec) = split_field(&field);
                let expr = parse_embedded_expr(&expr_src, filename)?;
                parts.push(FStringPart::Expr { expr, conversion, format_spec });
            }
            '}' => {
                return Err(CompileError::syntax(
                    filename,
                    Location::default(),
                    "single `}` is not allowed in an f-string; escape as `}}`",
                ));
            }
            _ => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        parts.push(FStringPart::Literal(literal));
    }
    Ok(parts)
}

/// Scans from just after an opening `{` to its matching `}`, tracking
/// bracket and quote nesting so commas, colons, and braces inside nested
/// literals or format specs don't terminate the field early.
fn scan_field(chars: &[char], start: usize, filename: &str) -> PResult<(String, usize)> {
    let mut depth = 0i32;
    let mut in_str: Option<char> = None;
    let mut i = start;
    let mut field = String::new();
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = in_str {
            field.push(c);
            if c == '\\' && i + 1 < chars.len() {
                field.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == q {
                in_str = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                in_str = Some(c);
                field.push(c);
                i += 1;
            }
            '{' | '(' | '[' => {
                depth += 1;
                field.push(c);
                i += 1;
            }
            ')' | ']' => {
                depth -= 1;
                field.push(c);
                i += 1;
            }
            '}' => {
                if depth == 0 {
                    return Ok((field, i + 1));
                }
                depth -= 1;
                field.push(c);
                i += 1;
            }
            _ => {
                field.push(c);
                i += 1;
            }
        }
    }
    Err(CompileError::syntax(filename, Location::default(), "unterminated f-string expression"))
}

/// Splits a scanned field into `(expr_source, conversion, format_spec)`,
/// respecting that `!=` inside the expression is not a conversion marker
/// and that `:` inside a nested `{}`/string is not a format-spec divider.
fn split_field(field: &str) -> (String, Option<char>, Option<String>) {
    let chars: Vec<char> = field.chars().collect();
    let mut depth = 0i32;
    let mut in_str: Option<char> = None;
    let mut colon_at = None;
    let mut bang_at = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = in_str {
            if c == '\\' {
                i += 2;
                continue;
            }
            if c == q {
                in_str = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => in_str = Some(c),
            '{' | '(' | '[' => depth += 1,
            '}' | ')' | ']' => depth -= 1,
            '!' if depth == 0 && colon_at.is_none() && chars.get(i + 1) != Some(&'=') => {
                bang_at = Some(i);
            }
            ':' if depth == 0 => {
                colon_at = Some(i);
                break;
            }
            _ => {}
        }
        i += 1;
    }
    let expr_end = bang_at.or(colon_at).unwrap_or(chars.len());
    let expr_src: String = chars[..expr_end].iter().collect();
    let conversion = bang_at.map(|p| chars[p + 1]);
    let format_spec = colon_at.map(|p| chars[p + 1..].iter().collect());
    (expr_src.trim().to_owned(), conversion, format_spec)
}

fn parse_embedded_expr(src: &str, filename: &str) -> PResult<Expr> {
    crate::parser::parse_expr_str(src, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_literal_and_expr_parts() {
        let parts = parse_fstring("hello {name}!", "<t>").unwrap();
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], FStringPart::Literal(s) if s == "hello "));
        assert!(matches!(&parts[2], FStringPart::Literal(s) if s == "!"));
    }

    #[test]
    fn escaped_braces_are_literal() {
        let parts = parse_fstring("{{literal}}", "<t>").unwrap();
        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0], FStringPart::Literal(s) if s == "{literal}"));
    }

    #[test]
    fn conversion_and_format_spec_are_split() {
        let parts = parse_fstring("{x!r:>10}", "<t>").unwrap();
        match &parts[0] {
            FStringPart::Expr { conversion, format_spec, .. } => {
                assert_eq!(*conversion, Some('r'));
                assert_eq!(format_spec.as_deref(), Some(">10"));
            }
            other => panic!("{other:?}"),
        }
    }
}
