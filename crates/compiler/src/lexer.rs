//! Indentation-sensitive tokenizer (§4.1).

use crate::error::CompileError;
use crate::token::{Location, Spanned, Tok};
use std::iter::Peekable;
use std::str::Chars;

pub struct Lexer<'a> {
    filename: String,
    chars: Peekable<Chars<'a>>,
    line: u32,
    col: u32,
    /// Stack of indentation widths currently open, innermost last.
    indents: Vec<u32>,
    /// Nesting depth of `(`/`[`/`{`: positive ⇒ implicit line joining.
    paren_depth: i32,
    at_line_start: bool,
    pending: Vec<Spanned>,
    done: bool,
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, filename: &str) -> Self {
        Self {
            filename: filename.to_owned(),
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
            indents: vec![0],
            paren_depth: 0,
            at_line_start: true,
            pending: Vec::new(),
            done: false,
        }
    }

    fn loc(&self) -> Location {
        Location { line: self.line, col: self.col }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek2(&self) -> Option<char> {
        let mut it = self.chars.clone();
        it.next();
        it.next()
    }

    fn err(&self, msg: impl Into<String>) -> CompileError {
        CompileError::syntax(&self.filename, self.loc(), msg)
    }

    /// Tokenize the whole source up front. Simpler to implement correctly
    /// than a fully-streaming lexer given indentation lookback, and the
    /// parser only ever needs bounded lookahead over the result.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, CompileError> {
        let mut out = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.tok == Tok::EndOfFile;
            out.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(out)
    }

    fn next_token(&mut self) -> Result<Spanned, CompileError> {
        if let Some(t) = self.pending.pop() {
            return Ok(t);
        }
        if self.at_line_start && self.paren_depth == 0 {
            if let Some(t) = self.handle_indentation()? {
                return Ok(t);
            }
        }
        self.skip_blanks_and_comments()?;
        let start = self.loc();
        let Some(c) = self.peek() else {
            return self.finish_at_eof(start);
        };

        if is_ident_start(c) {
            return self.lex_name_or_string_prefix(start);
        }
        if c.is_ascii_digit() || (c == '.' && self.peek2().is_some_and(|c| c.is_ascii_digit())) {
            return self.lex_number(start);
        }
        if c == '"' || c == '\'' {
            return self.lex_string(start, false, false);
        }
        if c == '\n' {
            self.bump();
            if self.paren_depth > 0 {
                return self.next_token();
            }
            self.at_line_start = true;
            return Ok(Spanned { tok: Tok::Newline, start, end: self.loc() });
        }
        if c == '\\' {
            // Explicit line join.
            self.bump();
            match self.peek() {
                Some('\n') => {
                    self.bump();
                    return self.next_token();
                }
                _ => return Err(self.err("unexpected character after line continuation")),
            }
        }
        self.lex_operator(start)
    }

    fn finish_at_eof(&mut self, start: Location) -> Result<Spanned, CompileError> {
        if !self.done {
            // Emit a synthetic NEWLINE before DEDENTs/EOF if the source
            // didn't end with one, then unwind the indent stack.
            self.done = true;
            while self.indents.len() > 1 {
                self.indents.pop();
                self.pending.push(Spanned { tok: Tok::Dedent, start, end: start });
            }
            self.pending.push(Spanned { tok: Tok::EndOfFile, start, end: start });
            return Ok(Spanned { tok: Tok::Newline, start, end: start });
        }
        Ok(Spanned { tok: Tok::EndOfFile, start, end: start })
    }

    fn handle_indentation(&mut self) -> Result<Option<Spanned>, CompileError> {
        let line_start = self.loc();
        let mut width = 0u32;
        let mut saw_tab = false;
        let mut saw_space = false;
        loop {
            match self.peek() {
                Some(' ') => {
                    saw_space = true;
                    width += 1;
                    self.bump();
                }
                Some('\t') => {
                    saw_tab = true;
                    width += 8 - (width % 8);
                    self.bump();
                }
                _ => break,
            }
        }
        if saw_tab && saw_space {
            return Err(CompileError::indentation(
                &self.filename,
                line_start,
                "inconsistent use of tabs and spaces in indentation",
            ));
        }
        // Blank line or comment-only line: no INDENT/DEDENT, handled by caller.
        match self.peek() {
            None | Some('\n') | Some('#') => {
                self.at_line_start = false; // handled line-by-line in skip_blanks_and_comments
                return Ok(None);
            }
            _ => {}
        }
        self.at_line_start = false;
        let current = *self.indents.last().unwrap();
        if width > current {
            self.indents.push(width);
            return Ok(Some(Spanned { tok: Tok::Indent, start: line_start, end: self.loc() }));
        }
        if width < current {
            let mut dedents = Vec::new();
            while *self.indents.last().unwrap() > width {
                self.indents.pop();
                dedents.push(Spanned { tok: Tok::Dedent, start: line_start, end: self.loc() });
            }
            if *self.indents.last().unwrap() != width {
                return Err(CompileError::indentation(
                    &self.filename,
                    line_start,
                    "unindent does not match any outer indentation level",
                ));
            }
            let first = dedents.remove(0);
            for d in dedents.into_iter().rev() {
                self.pending.push(d);
            }
            return Ok(Some(first));
        }
        Ok(None)
    }

    fn skip_blanks_and_comments(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('\n') if self.paren_depth > 0 => {
                    self.bump();
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn lex_name_or_string_prefix(&mut self, start: Location) -> Result<Spanned, CompileError> {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // String prefixes: r, b, f, rb, br, rf, fr (case-insensitive).
        let lower = s.to_lowercase();
        let is_prefix = matches!(lower.as_str(), "r" | "b" | "f" | "rb" | "br" | "rf" | "fr")
            && matches!(self.peek(), Some('"') | Some('\''));
        if is_prefix {
            let raw = lower.contains('r');
            let is_bytes = lower.contains('b');
            let is_fstring = lower.contains('f');
            return self.lex_string_with_flags(start, raw, is_bytes, is_fstring);
        }
        if let Some(kw) = Tok::keyword_from_str(&s) {
            return Ok(Spanned { tok: kw, start, end: self.loc() });
        }
        Ok(Spanned { tok: Tok::Name(s), start, end: self.loc() })
    }

    fn lex_string(&mut self, start: Location, raw: bool, is_bytes: bool) -> Result<Spanned, CompileError> {
        self.lex_string_with_flags(start, raw, is_bytes, false)
    }

    fn lex_string_with_flags(
        &mut self,
        start: Location,
        raw: bool,
        is_bytes: bool,
        is_fstring: bool,
    ) -> Result<Spanned, CompileError> {
        let quote = self.bump().expect("caller checked for quote");
        let triple = self.peek() == Some(quote) && self.peek2() == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.err("unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.bump();
                    break;
                }
                if self.peek2() == Some(quote) {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    ahead.next();
                    if ahead.peek() == Some(&quote) {
                        self.bump();
                        self.bump();
                        self.bump();
                        break;
                    }
                }
                value.push(c);
                self.bump();
                continue;
            }
            if c == '\n' && !triple {
                return Err(self.err("unterminated string literal (newline in single-line string)"));
            }
            if c == '\\' && !raw {
                self.bump();
                self.lex_escape(&mut value)?;
                continue;
            }
            if c == '\\' && raw {
                // Raw strings keep the backslash but still honor it as an
                // escape for the purposes of not ending the string early.
                value.push(c);
                self.bump();
                if let Some(next) = self.peek() {
                    value.push(next);
                    self.bump();
                }
                continue;
            }
            value.push(c);
            self.bump();
        }
        Ok(Spanned { tok: Tok::Str { value, is_bytes, is_fstring }, start, end: self.loc() })
    }

    fn lex_escape(&mut self, out: &mut String) -> Result<(), CompileError> {
        let Some(c) = self.bump() else {
            return Err(self.err("unterminated escape sequence"));
        };
        match c {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            '0' => out.push('\0'),
            'a' => out.push('\u{7}'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '\n' => {} // escaped newline inside a string: line continuation
            'x' => {
                let h = self.take_hex_digits(2)?;
                out.push(decode_codepoint(h)?);
            }
            'u' => {
                let h = self.take_hex_digits(4)?;
                out.push(decode_codepoint(h)?);
            }
            'U' => {
                let h = self.take_hex_digits(8)?;
                out.push(decode_codepoint(h)?);
            }
            other => {
                // Unknown escapes are kept literally (matches the common
                // "DeprecationWarning, not an error" behavior), except we
                // keep it simple and preserve both characters.
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn take_hex_digits(&mut self, n: usize) -> Result<u32, CompileError> {
        let mut s = String::new();
        for _ in 0..n {
            match self.peek() {
                Some(c) if c.is_ascii_hexdigit() => {
                    s.push(c);
                    self.bump();
                }
                _ => return Err(self.err("invalid \\x/\\u/\\U escape: not enough hex digits")),
            }
        }
        u32::from_str_radix(&s, 16).map_err(|_| self.err("invalid hex escape"))
    }

    fn lex_number(&mut self, start: Location) -> Result<Spanned, CompileError> {
        let mut s = String::new();
        if self.peek() == Some('0')
            && matches!(self.peek2(), Some('x') | Some('X') | Some('o') | Some('O') | Some('b') | Some('B'))
        {
            s.push(self.bump().unwrap());
            let radix_char = self.bump().unwrap();
            s.push(radix_char);
            let radix = match radix_char.to_ascii_lowercase() {
                'x' => 16,
                'o' => 8,
                'b' => 2,
                _ => unreachable!(),
            };
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c.is_digit(radix) || c == '_' {
                    if c != '_' {
                        digits.push(c);
                    }
                    self.bump();
                } else {
                    break;
                }
            }
            if digits.is_empty() {
                return Err(self.err("invalid numeric literal"));
            }
            let value = i64::from_str_radix(&digits, radix)
                .map_err(|_| self.err("integer literal out of range"))?;
            return Ok(Spanned { tok: Tok::Int(value), start, end: self.loc() });
        }

        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    s.push(c);
                }
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') {
            is_float = true;
            s.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() || c == '_' {
                    if c != '_' {
                        s.push(c);
                    }
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let mut ahead = self.chars.clone();
            ahead.next();
            let next_ok = matches!(ahead.peek(), Some(c) if c.is_ascii_digit())
                || matches!(ahead.peek(), Some('+') | Some('-'));
            if next_ok {
                is_float = true;
                s.push(self.bump().unwrap());
                if matches!(self.peek(), Some('+') | Some('-')) {
                    s.push(self.bump().unwrap());
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        s.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        if is_float {
            let value: f64 = s.parse().map_err(|_| self.err("invalid float literal"))?;
            Ok(Spanned { tok: Tok::Float(value), start, end: self.loc() })
        } else {
            let value: i64 = s.parse().map_err(|_| self.err("integer literal out of range"))?;
            Ok(Spanned { tok: Tok::Int(value), start, end: self.loc() })
        }
    }

    fn lex_operator(&mut self, start: Location) -> Result<Spanned, CompileError> {
        macro_rules! two {
            ($second:expr, $two_tok:expr, $one_tok:expr) => {{
                self.bump();
                if self.peek() == Some($second) {
                    self.bump();
                    $two_tok
                } else {
                    $one_tok
                }
            }};
        }
        let c = self.peek().unwrap();
        let tok = match c {
            '(' => { self.bump(); self.paren_depth += 1; Tok::LPar }
            ')' => { self.bump(); self.paren_depth -= 1; Tok::RPar }
            '[' => { self.bump(); self.paren_depth += 1; Tok::LSqb }
            ']' => { self.bump(); self.paren_depth -= 1; Tok::RSqb }
            '{' => { self.bump(); self.paren_depth += 1; Tok::LBrace }
            '}' => { self.bump(); self.paren_depth -= 1; Tok::RBrace }
            ',' => { self.bump(); Tok::Comma }
            ':' => two!('=', Tok::ColonEqual, Tok::Colon),
            ';' => { self.bump(); Tok::Semi }
            '~' => { self.bump(); Tok::Tilde }
            '+' => two!('=', Tok::PlusEqual, Tok::Plus),
            '%' => two!('=', Tok::PercentEqual, Tok::Percent),
            '^' => two!('=', Tok::CircumflexEqual, Tok::Circumflex),
            '&' => two!('=', Tok::AmperEqual, Tok::Amper),
            '|' => two!('=', Tok::VbarEqual, Tok::Vbar),
            '@' => two!('=', Tok::AtEqual, Tok::At),
            '=' => two!('=', Tok::EqEqual, Tok::Assign),
            '-' => {
                self.bump();
                match self.peek() {
                    Some('=') => { self.bump(); Tok::MinusEqual }
                    Some('>') => { self.bump(); Tok::Arrow }
                    _ => Tok::Minus,
                }
            }
            '*' => {
                self.bump();
                match self.peek() {
                    Some('*') => {
                        self.bump();
                        if self.peek() == Some('=') { self.bump(); Tok::DoubleStarEqual } else { Tok::DoubleStar }
                    }
                    Some('=') => { self.bump(); Tok::StarEqual }
                    _ => Tok::Star,
                }
            }
            '/' => {
                self.bump();
                match self.peek() {
                    Some('/') => {
                        self.bump();
                        if self.peek() == Some('=') { self.bump(); Tok::DoubleSlashEqual } else { Tok::DoubleSlash }
                    }
                    Some('=') => { self.bump(); Tok::SlashEqual }
                    _ => Tok::Slash,
                }
            }
            '<' => {
                self.bump();
                match self.peek() {
                    Some('<') => {
                        self.bump();
                        if self.peek() == Some('=') { self.bump(); Tok::LShiftEqual } else { Tok::LShift }
                    }
                    Some('=') => { self.bump(); Tok::LessEqual }
                    _ => Tok::Less,
                }
            }
            '>' => {
                self.bump();
                match self.peek() {
                    Some('>') => {
                        self.bump();
                        if self.peek() == Some('=') { self.bump(); Tok::RShiftEqual } else { Tok::RShift }
                    }
                    Some('=') => { self.bump(); Tok::GreaterEqual }
                    _ => Tok::Greater,
                }
            }
            '!' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::NotEqual
                } else {
                    return Err(self.err("invalid character '!'"));
                }
            }
            '.' => { self.bump(); Tok::Dot }
            other => return Err(self.err(format!("invalid character {other:?}"))),
        };
        Ok(Spanned { tok, start, end: self.loc() })
    }
}

fn decode_codepoint(cp: u32) -> Result<char, CompileError> {
    char::from_u32(cp).ok_or_else(|| {
        CompileError::syntax("<escape>", Location::default(), "invalid unicode escape codepoint")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        Lexer::new(src, "<test>").tokenize().unwrap().into_iter().map(|s| s.tok).collect()
    }

    #[test]
    fn indentation_produces_indent_dedent() {
        let t = toks("if x:\n    y\nz\n");
        assert!(t.iter().any(|tk| *tk == Tok::Indent));
        assert!(t.iter().any(|tk| *tk == Tok::Dedent));
    }

    #[test]
    fn implicit_line_join_suppresses_newline() {
        let t = toks("x = (1 +\n2)\n");
        let newline_count = t.iter().filter(|tk| **tk == Tok::Newline).count();
        assert_eq!(newline_count, 1);
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(toks("0x1F")[0], Tok::Int(31));
        assert_eq!(toks("0b101")[0], Tok::Int(5));
        assert_eq!(toks("0o17")[0], Tok::Int(15));
        assert_eq!(toks("1_000")[0], Tok::Int(1000));
        assert_eq!(toks("1.5e2")[0], Tok::Float(150.0));
    }

    #[test]
    fn string_prefixes() {
        let t = toks("r'a\\nb'");
        match &t[0] {
            Tok::Str { value, is_bytes, is_fstring } => {
                assert_eq!(value, "a\\nb");
                assert!(!is_bytes);
                assert!(!is_fstring);
            }
            _ => panic!("expected string"),
        }
        let t = toks("f\"hello {x}\"");
        match &t[0] {
            Tok::Str { is_fstring, .. } => assert!(is_fstring),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn mixed_tabs_and_spaces_rejected() {
        let src = "if x:\n \t y\n";
        let err = Lexer::new(src, "<test>").tokenize().unwrap_err();
        assert_eq!(err.kind, crate::error::DiagnosticKind::IndentationError);
    }
}
