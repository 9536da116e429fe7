//! Recursive-descent parser: token stream → AST (§4.2).

use crate::ast::*;
use crate::error::CompileError;
use crate::lexer::Lexer;
use crate::token::{Location, Spanned, Tok};
use pylite_bytecode::{BinOp, UnOp};

pub struct Parser {
    toks: Vec<Spanned>,
    pos: usize,
    filename: String,
}

type PResult<T> = Result<T, CompileError>;

pub fn parse_module(source: &str, filename: &str) -> PResult<Module> {
    let toks = Lexer::new(source, filename).tokenize()?;
    let mut p = Parser { toks, pos: 0, filename: filename.to_owned() };
    p.parse_module()
}

/// Parses a single expression, used for f-string interpolation segments.
pub fn parse_expr_str(source: &str, filename: &str) -> PResult<Expr> {
    let toks = Lexer::new(source, filename).tokenize()?;
    let mut p = Parser { toks, pos: 0, filename: filename.to_owned() };
    let e = p.parse_test_list()?;
    Ok(e)
}

impl Parser {
    fn cur(&self) -> &Tok {
        &self.toks[self.pos].tok
    }

    fn loc(&self) -> Location {
        self.toks[self.pos].start
    }

    fn at(&self, t: &Tok) -> bool {
        self.cur() == t
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].tok.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Tok) -> bool {
        if self.at(t) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Tok) -> PResult<()> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(self.err(format!("expected {t:?}, found {:?}", self.cur())))
        }
    }

    fn err(&self, msg: impl Into<String>) -> CompileError {
        CompileError::syntax(&self.filename, self.loc(), msg)
    }

    fn skip_extra_newlines(&mut self) {
        while self.at(&Tok::Newline) {
            self.advance();
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.cur().clone() {
            Tok::Name(s) => {
                self.advance();
                Ok(s)
            }
            other => Err(self.err(format!("expected identifier, found {other:?}"))),
        }
    }

    // ---- top level ----

    fn parse_module(&mut self) -> PResult<Module> {
        let mut body = Vec::new();
        self.skip_extra_newlines();
        while !self.at(&Tok::EndOfFile) {
            body.extend(self.parse_statement()?);
            self.skip_extra_newlines();
        }
        Ok(Module { body })
    }

    fn parse_statement(&mut self) -> PResult<Vec<Stmt>> {
        match self.cur() {
            Tok::If => Ok(vec![self.parse_if()?]),
            Tok::While => Ok(vec![self.parse_while()?]),
            Tok::For => Ok(vec![self.parse_for()?]),
            Tok::Try => Ok(vec![self.parse_try()?]),
            Tok::With => Ok(vec![self.parse_with()?]),
            Tok::Def => Ok(vec![self.parse_funcdef(Vec::new())?]),
            Tok::Class => Ok(vec![self.parse_classdef(Vec::new())?]),
            Tok::At => {
                let decorators = self.parse_decorators()?;
                match self.cur() {
                    Tok::Def => Ok(vec![self.parse_funcdef(decorators)?]),
                    Tok::Class => Ok(vec![self.parse_classdef(decorators)?]),
                    _ => Err(self.err("expected function or class definition after decorator")),
                }
            }
            _ => self.parse_simple_stmt_line(),
        }
    }

    fn parse_decorators(&mut self) -> PResult<Vec<Expr>> {
        let mut out = Vec::new();
        while self.eat(&Tok::At) {
            out.push(self.parse_test()?);
            self.expect(&Tok::Newline)?;
            self.skip_extra_newlines();
        }
        Ok(out)
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(&Tok::Colon)?;
        if self.eat(&Tok::Newline) {
            self.skip_extra_newlines();
            self.expect(&Tok::Indent)?;
            let mut body = Vec::new();
            loop {
                self.skip_extra_newlines();
                if self.eat(&Tok::Dedent) {
                    break;
                }
                body.extend(self.parse_statement()?);
            }
            Ok(body)
        } else {
            // Single-line suite: `if x: y; z`
            self.parse_simple_stmt_line()
        }
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        self.expect(&Tok::If)?;
        self.parse_if_tail()
    }

    /// Parses the `test: body (elif ...)* (else: ...)?` shared by `if` and
    /// `elif`, so a chain of `elif`s nests as `If { orelse: [If { .. }] }`
    /// without needing to rewind the token stream.
    fn parse_if_tail(&mut self) -> PResult<Stmt> {
        let test = self.parse_named_test()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&Tok::Elif) {
            vec![self.parse_if_tail()?]
        } else if self.eat(&Tok::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt::If { test, body, orelse })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        self.expect(&Tok::While)?;
        let test = self.parse_named_test()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&Tok::Else) { self.parse_block()? } else { Vec::new() };
        Ok(Stmt::While { test, body, orelse })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        self.expect(&Tok::For)?;
        let target = self.parse_target_list()?;
        self.expect(&Tok::In)?;
        let iter = self.parse_test_list()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&Tok::Else) { self.parse_block()? } else { Vec::new() };
        Ok(Stmt::For { target, iter, body, orelse })
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        self.expect(&Tok::Try)?;
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        let mut saw_star = false;
        let mut saw_plain = false;
        while self.at(&Tok::Except) {
            self.advance();
            let is_star = self.eat(&Tok::Star);
            if is_star {
                saw_star = true;
            } else {
                saw_plain = true;
            }
            if saw_star && saw_plain {
                return Err(self.err("cannot mix `except` and `except*` in the same `try`"));
            }
            let (types, name) = if self.at(&Tok::Colon) {
                if is_star {
                    return Err(self.err("bare `except*:` is not allowed"));
                }
                (Vec::new(), None)
            } else {
                // `except (A, B) as e:` parses the parenthesized group as a
                // tuple via `parse_test`; a bare type is wrapped singly.
                let types = match self.parse_test()? {
                    Expr::Tuple(items) => items,
                    other => vec![other],
                };
                let name = if self.eat(&Tok::As) { Some(self.expect_name()?) } else { None };
                (types, name)
            };
            let hbody = self.parse_block()?;
            handlers.push(ExceptHandler { types, name, body: hbody, is_star });
        }
        let orelse = if self.eat(&Tok::Else) { self.parse_block()? } else { Vec::new() };
        let finalbody = if self.eat(&Tok::Finally) { self.parse_block()? } else { Vec::new() };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.err("expected `except` or `finally` after `try`"));
        }
        Ok(Stmt::Try { body, handlers, orelse, finalbody })
    }

    fn parse_with(&mut self) -> PResult<Stmt> {
        self.expect(&Tok::With)?;
        let mut items = Vec::new();
        loop {
            let context_expr = self.parse_test()?;
            let optional_vars = if self.eat(&Tok::As) { Some(self.parse_target()?) } else { None };
            items.push(WithItem { context_expr, optional_vars });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        let body = self.parse_block()?;
        Ok(Stmt::With { items, body })
    }

    fn parse_params(&mut self) -> PResult<Arguments> {
        self.expect(&Tok::LPar)?;
        let mut args = Vec::new();
        let mut defaults = Vec::new();
        let mut vararg = None;
        let mut kwonly_args = Vec::new();
        let mut kwonly_defaults = Vec::new();
        let mut kwarg = None;
        let mut seen_star = false;
        while !self.at(&Tok::RPar) {
            if self.eat(&Tok::Star) {
                if self.at(&Tok::Comma) || self.at(&Tok::RPar) {
                    seen_star = true;
                } else {
                    vararg = Some(self.expect_name()?);
                    seen_star = true;
                }
            } else if self.eat(&Tok::DoubleStar) {
                kwarg = Some(self.expect_name()?);
            } else {
                let name = self.expect_name()?;
                self.skip_annotation();
                let default = if self.eat(&Tok::Assign) { Some(self.parse_test()?) } else { None };
                if seen_star {
                    kwonly_args.push(name);
                    kwonly_defaults.push(default);
                } else {
                    args.push(name);
                    if let Some(d) = default {
                        defaults.push(d);
                    } else if !defaults.is_empty() {
                        return Err(self.err("non-default argument follows default argument"));
                    }
                }
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RPar)?;
        Ok(Arguments { args, defaults, vararg, kwonly_args, kwonly_defaults, kwarg })
    }

    /// Type annotations are accepted and ignored at runtime (§6).
    fn skip_annotation(&mut self) {
        if self.eat(&Tok::Colon) {
            let _ = self.parse_test();
        }
    }

    fn parse_funcdef(&mut self, decorators: Vec<Expr>) -> PResult<Stmt> {
        self.expect(&Tok::Def)?;
        let name = self.expect_name()?;
        let args = self.parse_params()?;
        if self.eat(&Tok::Arrow) {
            let _ = self.parse_test()?;
        }
        let body = self.parse_block()?;
        let is_generator = block_contains_yield(&body);
        Ok(Stmt::FunctionDef(FunctionDef { name, args, body, decorators, is_generator }))
    }

    fn parse_classdef(&mut self, decorators: Vec<Expr>) -> PResult<Stmt> {
        self.expect(&Tok::Class)?;
        let name = self.expect_name()?;
        let mut bases = Vec::new();
        let mut keywords = Vec::new();
        if self.eat(&Tok::LPar) {
            while !self.at(&Tok::RPar) {
                if let Tok::Name(n) = self.cur().clone() {
                    if self.peek_is(1, &Tok::Assign) {
                        self.advance();
                        self.advance();
                        let v = self.parse_test()?;
                        keywords.push((n, v));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        continue;
                    }
                }
                bases.push(self.parse_test()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(&Tok::RPar)?;
        }
        let body = self.parse_block()?;
        Ok(Stmt::ClassDef(ClassDef { name, bases, keywords, body, decorators }))
    }

    fn peek_is(&self, ahead: usize, t: &Tok) -> bool {
        self.toks.get(self.pos + ahead).map(|s| &s.tok) == Some(t)
    }

    // ---- simple statements ----

    fn parse_simple_stmt_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut out = Vec::new();
        loop {
            out.push(self.parse_small_stmt()?);
            if self.eat(&Tok::Semi) {
                if self.at(&Tok::Newline) || self.at(&Tok::EndOfFile) {
                    break;
                }
                continue;
            }
            break;
        }
        if self.at(&Tok::Newline) {
            self.advance();
        } else if !self.at(&Tok::EndOfFile) && !self.at(&Tok::Dedent) {
            return Err(self.err(format!("expected newline, found {:?}", self.cur())));
        }
        Ok(out)
    }

    fn parse_small_stmt(&mut self) -> PResult<Stmt> {
        match self.cur() {
            Tok::Pass => {
                self.advance();
                Ok(Stmt::Pass)
            }
            Tok::Break => {
                self.advance();
                Ok(Stmt::Break)
            }
            Tok::Continue => {
                self.advance();
                Ok(Stmt::Continue)
            }
            Tok::Return => {
                self.advance();
                let value = if self.at_stmt_end() { None } else { Some(self.parse_test_list()?) };
                Ok(Stmt::Return(value))
            }
            Tok::Del => {
                self.advance();
                let mut targets = vec![self.parse_target()?];
                while self.eat(&Tok::Comma) {
                    if self.at_stmt_end() {
                        break;
                    }
                    targets.push(self.parse_target()?);
                }
                Ok(Stmt::Delete(targets))
            }
            Tok::Global => {
                self.advance();
                Ok(Stmt::Global(self.parse_name_list()?))
            }
            Tok::Nonlocal => {
                self.advance();
                Ok(Stmt::Nonlocal(self.parse_name_list()?))
            }
            Tok::Assert => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat(&Tok::Comma) { Some(self.parse_test()?) } else { None };
                Ok(Stmt::Assert { test, msg })
            }
            Tok::Raise => {
                self.advance();
                if self.at_stmt_end() {
                    return Ok(Stmt::Raise { exc: None, cause: None });
                }
                let exc = self.parse_test()?;
                let cause = if self.eat(&Tok::From) { Some(self.parse_test()?) } else { None };
                Ok(Stmt::Raise { exc: Some(exc), cause })
            }
            Tok::Import => {
                self.advance();
                let mut names = Vec::new();
                loop {
                    let module = self.parse_dotted_name()?;
                    let alias = if self.eat(&Tok::As) { Some(self.expect_name()?) } else { None };
                    names.push((module, alias));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                Ok(Stmt::Import { names })
            }
            Tok::From => {
                self.advance();
                let module = self.parse_dotted_name()?;
                self.expect(&Tok::Import)?;
                if self.eat(&Tok::Star) {
                    return Ok(Stmt::ImportFrom { module, names: Vec::new(), is_star: true });
                }
                let paren = self.eat(&Tok::LPar);
                let mut names = Vec::new();
                loop {
                    let n = self.expect_name()?;
                    let alias = if self.eat(&Tok::As) { Some(self.expect_name()?) } else { None };
                    names.push((n, alias));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                    if paren && self.at(&Tok::RPar) {
                        break;
                    }
                }
                if paren {
                    self.expect(&Tok::RPar)?;
                }
                Ok(Stmt::ImportFrom { module, names, is_star: false })
            }
            _ => self.parse_expr_stmt(),
        }
    }

    fn at_stmt_end(&self) -> bool {
        matches!(self.cur(), Tok::Newline | Tok::Semi | Tok::EndOfFile)
    }

    fn parse_name_list(&mut self) -> PResult<Vec<String>> {
        let mut out = vec![self.expect_name()?];
        while self.eat(&Tok::Comma) {
            out.push(self.expect_name()?);
        }
        Ok(out)
    }

    fn parse_dotted_name(&mut self) -> PResult<String> {
        let mut s = self.expect_name()?;
        while self.eat(&Tok::Dot) {
            s.push('.');
            s.push_str(&self.expect_name()?);
        }
        Ok(s)
    }

    fn parse_expr_stmt(&mut self) -> PResult<Stmt> {
        let first = self.parse_test_list_star()?;
        if let Tok::Assign = self.cur() {
            let mut targets = vec![first];
            let mut value = {
                self.advance();
                self.parse_test_list_star()?
            };
            while self.eat(&Tok::Assign) {
                targets.push(value);
                value = self.parse_test_list_star()?;
            }
            return Ok(Stmt::Assign { targets, value });
        }
        if let Some(op) = self.aug_assign_op() {
            self.advance();
            let value = self.parse_test_list()?;
            return Ok(Stmt::AugAssign { target: Box::new(first), op, value });
        }
        if self.eat(&Tok::Colon) {
            // annotated assignment; annotation ignored at runtime (§6)
            let _ = self.parse_test()?;
            let value = if self.eat(&Tok::Assign) { Some(self.parse_test()?) } else { None };
            return Ok(Stmt::AnnAssign { target: Box::new(first), value });
        }
        Ok(Stmt::Expr(first))
    }

    fn aug_assign_op(&self) -> Option<AugOp> {
        Some(match self.cur() {
            Tok::PlusEqual => AugOp::Add,
            Tok::MinusEqual => AugOp::Sub,
            Tok::StarEqual => AugOp::Mul,
            Tok::SlashEqual => AugOp::Div,
            Tok::DoubleSlashEqual => AugOp::FloorDiv,
            Tok::PercentEqual => AugOp::Mod,
            Tok::DoubleStarEqual => AugOp::Pow,
            Tok::LShiftEqual => AugOp::LShift,
            Tok::RShiftEqual => AugOp::RShift,
            Tok::AmperEqual => AugOp::BitAnd,
            Tok::VbarEqual => AugOp::BitOr,
            Tok::CircumflexEqual => AugOp::BitXor,
            _ => return None,
        })
    }

    // ---- targets ----

    fn parse_target(&mut self) -> PResult<Expr> {
        if self.eat(&Tok::Star) {
            return Ok(Expr::Starred(Box::new(self.parse_target()?)));
        }
        if self.at(&Tok::LPar) || self.at(&Tok::LSqb) {
            let close = if self.eat(&Tok::LPar) {
                Tok::RPar
            } else {
                self.advance();
                Tok::RSqb
            };
            let mut items = Vec::new();
            while !self.at(&close) {
                items.push(self.parse_target()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
            self.expect(&close)?;
            return Ok(Expr::Tuple(items));
        }
        self.parse_postfix_from_atom()
    }

    fn parse_target_list(&mut self) -> PResult<Expr> {
        let first = self.parse_target()?;
        if self.at(&Tok::Comma) {
            let mut items = vec![first];
            while self.eat(&Tok::Comma) {
                if self.at(&Tok::In) {
                    break;
                }
                items.push(self.parse_target()?);
            }
            return Ok(Expr::Tuple(items));
        }
        Ok(first)
    }

    // ---- expressions ----

    fn parse_test_list(&mut self) -> PResult<Expr> {
        let first = self.parse_test()?;
        if self.at(&Tok::Comma) {
            let mut items = vec![first];
            while self.eat(&Tok::Comma) {
                if self.at_stmt_end() || self.at(&Tok::Assign) || self.at(&Tok::Colon) {
                    break;
                }
                items.push(self.parse_test()?);
            }
            return Ok(Expr::Tuple(items));
        }
        Ok(first)
    }

    /// Like `parse_test_list` but also accepts `*expr` items (for
    /// assignment targets / right-hand sides with starred unpacking).
    fn parse_test_list_star(&mut self) -> PResult<Expr> {
        let first = self.parse_star_or_test()?;
        if self.at(&Tok::Comma) {
            let mut items = vec![first];
            while self.eat(&Tok::Comma) {
                if self.at_stmt_end() || self.at(&Tok::Assign) || self.aug_assign_op().is_some() {
                    break;
                }
                items.push(self.parse_star_or_test()?);
            }
            return Ok(Expr::Tuple(items));
        }
        Ok(first)
    }

    fn parse_star_or_test(&mut self) -> PResult<Expr> {
        if self.eat(&Tok::Star) {
            return Ok(Expr::Starred(Box::new(self.parse_or_test()?)));
        }
        self.parse_test()
    }

    fn parse_named_test(&mut self) -> PResult<Expr> {
        self.parse_test()
    }

    /// `test := lambda | or_test ['if' or_test 'else' test] | named_expr`
    fn parse_test(&mut self) -> PResult<Expr> {
        if self.at(&Tok::Lambda) {
            return self.parse_lambda();
        }
        let e = self.parse_named_expr()?;
        if self.eat(&Tok::If) {
            let test = self.parse_or_test()?;
            self.expect(&Tok::Else)?;
            let orelse = self.parse_test()?;
            return Ok(Expr::IfExp { test: Box::new(test), body: Box::new(e), orelse: Box::new(orelse) });
        }
        Ok(e)
    }

    fn parse_named_expr(&mut self) -> PResult<Expr> {
        let e = self.parse_or_test()?;
        if self.eat(&Tok::ColonEqual) {
            let value = self.parse_test()?;
            return Ok(Expr::NamedExpr { target: Box::new(e), value: Box::new(value) });
        }
        Ok(e)
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        self.expect(&Tok::Lambda)?;
        let mut args = Vec::new();
        let mut defaults = Vec::new();
        let mut kwonly_args = Vec::new();
        let mut kwonly_defaults = Vec::new();
        let mut vararg = None;
        let mut kwarg = None;
        let mut seen_star = false;
        while !self.at(&Tok::Colon) {
            if self.eat(&Tok::Star) {
                vararg = Some(self.expect_name()?);
                seen_star = true;
            } else if self.eat(&Tok::DoubleStar) {
                kwarg = Some(self.expect_name()?);
            } else {
                let name = self.expect_name()?;
                let default = if self.eat(&Tok::Assign) { Some(self.parse_test()?) } else { None };
                if seen_star {
                    kwonly_args.push(name);
                    kwonly_defaults.push(default);
                } else {
                    args.push(name);
                    if let Some(d) = default {
                        defaults.push(d);
                    }
                }
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::Colon)?;
        let body = self.parse_test()?;
        Ok(Expr::Lambda {
            args: Arguments { args, defaults, vararg, kwonly_args, kwonly_defaults, kwarg },
            body: Box::new(body),
        })
    }

    fn parse_or_test(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and_test()?;
        if self.at(&Tok::Or) {
            let mut values = vec![left];
            while self.eat(&Tok::Or) {
                values.push(self.parse_and_test()?);
            }
            left = Expr::BoolOp { op: BoolOp::Or, values };
        }
        Ok(left)
    }

    fn parse_and_test(&mut self) -> PResult<Expr> {
        let mut left = self.parse_not_test()?;
        if self.at(&Tok::And) {
            let mut values = vec![left];
            while self.eat(&Tok::And) {
                values.push(self.parse_not_test()?);
            }
            left = Expr::BoolOp { op: BoolOp::And, values };
        }
        Ok(left)
    }

    fn parse_not_test(&mut self) -> PResult<Expr> {
        if self.eat(&Tok::Not) {
            let operand = self.parse_not_test()?;
            return Ok(Expr::UnaryOp { op: UnOp::Not, operand: Box::new(operand) });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        loop {
            let op = match self.cur() {
                Tok::Less => CmpOp::Lt,
                Tok::LessEqual => CmpOp::Le,
                Tok::Greater => CmpOp::Gt,
                Tok::GreaterEqual => CmpOp::Ge,
                Tok::EqEqual => CmpOp::Eq,
                Tok::NotEqual => CmpOp::Ne,
                Tok::Is => {
                    self.advance();
                    if self.eat(&Tok::Not) {
                        comparators.push(self.parse_bitor()?);
                        ops.push(CmpOp::IsNot);
                        continue;
                    }
                    comparators.push(self.parse_bitor()?);
                    ops.push(CmpOp::Is);
                    continue;
                }
                Tok::Not => {
                    self.advance();
                    self.expect(&Tok::In)?;
                    comparators.push(self.parse_bitor()?);
                    ops.push(CmpOp::NotIn);
                    continue;
                }
                Tok::In => {
                    self.advance();
                    comparators.push(self.parse_bitor()?);
                    ops.push(CmpOp::In);
                    continue;
                }
                _ => break,
            };
            self.advance();
            comparators.push(self.parse_bitor()?);
            ops.push(op);
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare { left: Box::new(left), ops, comparators })
        }
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        let mut left = self.parse_bitxor()?;
        while self.eat(&Tok::Vbar) {
            let right = self.parse_bitxor()?;
            left = Expr::BinOp { left: Box::new(left), op: BinOp::BitOr, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_bitxor(&mut self) -> PResult<Expr> {
        let mut left = self.parse_bitand()?;
        while self.eat(&Tok::Circumflex) {
            let right = self.parse_bitand()?;
            left = Expr::BinOp { left: Box::new(left), op: BinOp::BitXor, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        let mut left = self.parse_shift()?;
        while self.eat(&Tok::Amper) {
            let right = self.parse_shift()?;
            left = Expr::BinOp { left: Box::new(left), op: BinOp::BitAnd, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        let mut left = self.parse_arith()?;
        loop {
            let op = if self.eat(&Tok::LShift) {
                BinOp::LShift
            } else if self.eat(&Tok::RShift) {
                BinOp::RShift
            } else {
                break;
            };
            let right = self.parse_arith()?;
            left = Expr::BinOp { left: Box::new(left), op, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_arith(&mut self) -> PResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = if self.eat(&Tok::Plus) {
                BinOp::Add
            } else if self.eat(&Tok::Minus) {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.parse_term()?;
            left = Expr::BinOp { left: Box::new(left), op, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        let mut left = self.parse_factor()?;
        loop {
            let op = if self.eat(&Tok::Star) {
                BinOp::Mul
            } else if self.eat(&Tok::Slash) {
                BinOp::Div
            } else if self.eat(&Tok::DoubleSlash) {
                BinOp::FloorDiv
            } else if self.eat(&Tok::Percent) {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.parse_factor()?;
            left = Expr::BinOp { left: Box::new(left), op, right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        if self.eat(&Tok::Plus) {
            return Ok(Expr::UnaryOp { op: UnOp::Pos, operand: Box::new(self.parse_factor()?) });
        }
        if self.eat(&Tok::Minus) {
            return Ok(Expr::UnaryOp { op: UnOp::Neg, operand: Box::new(self.parse_factor()?) });
        }
        if self.eat(&Tok::Tilde) {
            return Ok(Expr::UnaryOp { op: UnOp::Invert, operand: Box::new(self.parse_factor()?) });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_postfix()?;
        if self.eat(&Tok::DoubleStar) {
            let exp = self.parse_factor()?;
            return Ok(Expr::BinOp { left: Box::new(base), op: BinOp::Pow, right: Box::new(exp) });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let atom = self.parse_atom()?;
        self.parse_trailers(atom)
    }

    /// Used by target parsing: an atom followed by trailers, but the atom
    /// must itself be a valid assignment target (a `Name`) or a
    /// parenthesized/bracketed target handled separately by `parse_target`.
    fn parse_postfix_from_atom(&mut self) -> PResult<Expr> {
        let atom = self.parse_atom()?;
        self.parse_trailers(atom)
    }

    fn parse_trailers(&mut self, mut expr: Expr) -> PResult<Expr> {
        loop {
            if self.eat(&Tok::Dot) {
                let attr = self.expect_name()?;
                expr = Expr::Attribute { value: Box::new(expr), attr };
            } else if self.eat(&Tok::LPar) {
                let (args, keywords) = self.parse_call_args()?;
                self.expect(&Tok::RPar)?;
                expr = Expr::Call { func: Box::new(expr), args, keywords };
            } else if self.eat(&Tok::LSqb) {
                let slice = self.parse_subscript()?;
                self.expect(&Tok::RSqb)?;
                expr = Expr::Subscript { value: Box::new(expr), slice: Box::new(slice) };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> PResult<(Vec<Expr>, Vec<(Option<String>, Expr)>)> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();
        while !self.at(&Tok::RPar) {
            if self.eat(&Tok::DoubleStar) {
                let v = self.parse_test()?;
                keywords.push((None, v));
            } else if self.eat(&Tok::Star) {
                let v = self.parse_test()?;
                args.push(Expr::Starred(Box::new(v)));
            } else if let Tok::Name(n) = self.cur().clone() {
                if self.peek_is(1, &Tok::Assign) {
                    self.advance();
                    self.advance();
                    let v = self.parse_test()?;
                    keywords.push((Some(n), v));
                } else {
                    args.push(self.parse_test_comp_aware()?);
                }
            } else {
                args.push(self.parse_test()?);
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok((args, keywords))
    }

    /// A single positional call arg may be a bare generator expression
    /// without extra parens: `sum(x for x in y)`.
    fn parse_test_comp_aware(&mut self) -> PResult<Expr> {
        let e = self.parse_test()?;
        if self.at(&Tok::For) {
            let generators = self.parse_comp_clauses()?;
            return Ok(Expr::Comp(Box::new(Comprehension::Generator { elt: Box::new(e), generators })));
        }
        Ok(e)
    }

    fn parse_subscript(&mut self) -> PResult<Expr> {
        // Single slice/index only (no tuple-of-slices); sufficient for the
        // accepted subset.
        self.parse_slice_item()
    }

    fn parse_slice_item(&mut self) -> PResult<Expr> {
        let lower = if self.at(&Tok::Colon) { None } else { Some(Box::new(self.parse_test()?)) };
        if !self.eat(&Tok::Colon) {
            return Ok(*lower.unwrap());
        }
        let upper = if matches!(self.cur(), Tok::Colon | Tok::RSqb) {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        let step = if self.eat(&Tok::Colon) {
            if self.at(&Tok::RSqb) { None } else { Some(Box::new(self.parse_test()?)) }
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let start_tok = self.cur().clone();
        match start_tok {
            Tok::None => { self.advance(); Ok(Expr::None) }
            Tok::True => { self.advance(); Ok(Expr::True) }
            Tok::False => { self.advance(); Ok(Expr::False) }
            Tok::Int(v) => { self.advance(); Ok(Expr::Int(v)) }
            Tok::Float(v) => { self.advance(); Ok(Expr::Float(v)) }
            Tok::Str { value, is_bytes, is_fstring } => {
                self.advance();
                let mut combined_fstring = is_fstring;
                let mut parts_raw: Vec<(String, bool)> = vec![(value, is_fstring)];
                // Adjacent string literal concatenation.
                loop {
                    if let Tok::Str { value: v2, is_bytes: b2, is_fstring: f2 } = self.cur().clone() {
                        if b2 != is_bytes {
                            break;
                        }
                        self.advance();
                        combined_fstring |= f2;
                        parts_raw.push((v2, f2));
                    } else {
                        break;
                    }
                }
                if is_bytes {
                    let mut bytes = Vec::new();
                    for (s, _) in &parts_raw {
                        bytes.extend(s.as_bytes());
                    }
                    return Ok(Expr::Bytes(bytes));
                }
                if combined_fstring {
                    let mut parts = Vec::new();
                    for (s, f) in parts_raw {
                        if f {
                            parts.extend(crate::fstring::parse_fstring(&s, &self.filename)?);
                        } else {
                            parts.push(FStringPart::Literal(s));
                        }
                    }
                    return Ok(Expr::FString(parts));
                }
                let mut joined = String::new();
                for (s, _) in parts_raw {
                    joined.push_str(&s);
                }
                Ok(Expr::Str(joined))
            }
            Tok::Name(n) => { self.advance(); Ok(Expr::Name(n)) }
            Tok::LPar => {
                self.advance();
                if self.eat(&Tok::RPar) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_star_or_test()?;
                if self.at(&Tok::For) {
                    let generators = self.parse_comp_clauses()?;
                    self.expect(&Tok::RPar)?;
                    return Ok(Expr::Comp(Box::new(Comprehension::Generator {
                        elt: Box::new(first),
                        generators,
                    })));
                }
                if self.at(&Tok::Comma) {
                    let mut items = vec![first];
                    while self.eat(&Tok::Comma) {
                        if self.at(&Tok::RPar) {
                            break;
                        }
                        items.push(self.parse_star_or_test()?);
                    }
                    self.expect(&Tok::RPar)?;
                    return Ok(Expr::Tuple(items));
                }
                self.expect(&Tok::RPar)?;
                Ok(first)
            }
            Tok::LSqb => {
                self.advance();
                if self.eat(&Tok::RSqb) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_star_or_test()?;
                if self.at(&Tok::For) {
                    let generators = self.parse_comp_clauses()?;
                    self.expect(&Tok::RSqb)?;
                    return Ok(Expr::Comp(Box::new(Comprehension::List { elt: Box::new(first), generators })));
                }
                let mut items = vec![first];
                while self.eat(&Tok::Comma) {
                    if self.at(&Tok::RSqb) {
                        break;
                    }
                    items.push(self.parse_star_or_test()?);
                }
                self.expect(&Tok::RSqb)?;
                Ok(Expr::List(items))
            }
            Tok::LBrace => {
                self.advance();
                if self.eat(&Tok::RBrace) {
                    return Ok(Expr::Dict(Vec::new()));
                }
                if self.eat(&Tok::DoubleStar) {
                    let v = self.parse_or_test()?;
                    let mut pairs = vec![(None, v)];
                    while self.eat(&Tok::Comma) {
                        if self.at(&Tok::RBrace) {
                            break;
                        }
                        pairs.push(self.parse_dict_pair()?);
                    }
                    self.expect(&Tok::RBrace)?;
                    return Ok(Expr::Dict(pairs));
                }
                let first_key = self.parse_test()?;
                if self.eat(&Tok::Colon) {
                    let first_val = self.parse_test()?;
                    if self.at(&Tok::For) {
                        let generators = self.parse_comp_clauses()?;
                        self.expect(&Tok::RBrace)?;
                        return Ok(Expr::Comp(Box::new(Comprehension::Dict {
                            key: Box::new(first_key),
                            value: Box::new(first_val),
                            generators,
                        })));
                    }
                    let mut pairs = vec![(Some(first_key), first_val)];
                    while self.eat(&Tok::Comma) {
                        if self.at(&Tok::RBrace) {
                            break;
                        }
                        pairs.push(self.parse_dict_pair()?);
                    }
                    self.expect(&Tok::RBrace)?;
                    return Ok(Expr::Dict(pairs));
                }
                // Set display / set comprehension.
                if self.at(&Tok::For) {
                    let generators = self.parse_comp_clauses()?;
                    self.expect(&Tok::RBrace)?;
                    return Ok(Expr::Comp(Box::new(Comprehension::Set { elt: Box::new(first_key), generators })));
                }
                let mut items = vec![first_key];
                while self.eat(&Tok::Comma) {
                    if self.at(&Tok::RBrace) {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect(&Tok::RBrace)?;
                Ok(Expr::Set(items))
            }
            Tok::Yield => {
                self.advance();
                if self.eat(&Tok::From) {
                    let e = self.parse_test()?;
                    return Ok(Expr::YieldFrom(Box::new(e)));
                }
                if self.at_stmt_end() || self.at(&Tok::RPar) {
                    return Ok(Expr::Yield(None));
                }
                Ok(Expr::Yield(Some(Box::new(self.parse_test_list()?))))
            }
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_dict_pair(&mut self) -> PResult<(Option<Expr>, Expr)> {
        if self.eat(&Tok::DoubleStar) {
            let v = self.parse_or_test()?;
            return Ok((None, v));
        }
        let k = self.parse_test()?;
        self.expect(&Tok::Colon)?;
        let v = self.parse_test()?;
        Ok((Some(k), v))
    }

    fn parse_comp_clauses(&mut self) -> PResult<Vec<CompFor>> {
        let mut out = Vec::new();
        while self.eat(&Tok::For) {
            let target = self.parse_target_list()?;
            self.expect(&Tok::In)?;
            let iter = self.parse_or_test()?;
            let mut ifs = Vec::new();
            while self.eat(&Tok::If) {
                ifs.push(self.parse_or_test()?);
            }
            out.push(CompFor { target, iter, ifs });
        }
        Ok(out)
    }
}

fn block_contains_yield(body: &[Stmt]) -> bool {
    body.iter().any(stmt_contains_yield)
}

fn stmt_contains_yield(s: &Stmt) -> bool {
    match s {
        Stmt::Expr(e) => expr_contains_yield(e),
        Stmt::Assign { value, .. } => expr_contains_yield(value),
        Stmt::AugAssign { value, .. } => expr_contains_yield(value),
        Stmt::AnnAssign { value, .. } => value.as_ref().is_some_and(expr_contains_yield),
        Stmt::Return(e) => e.as_ref().is_some_and(expr_contains_yield),
        Stmt::If { test, body, orelse } => {
            expr_contains_yield(test) || block_contains_yield(body) || block_contains_yield(orelse)
        }
        Stmt::While { test, body, orelse } => {
            expr_contains_yield(test) || block_contains_yield(body) || block_contains_yield(orelse)
        }
        Stmt::For { iter, body, orelse, .. } => {
            expr_contains_yield(iter) || block_contains_yield(body) || block_contains_yield(orelse)
        }
        Stmt::Try { body, handlers, orelse, finalbody } => {
            block_contains_yield(body)
                || handlers.iter().any(|h| block_contains_yield(&h.body))
                || block_contains_yield(orelse)
                || block_contains_yield(finalbody)
        }
        Stmt::With { body, .. } => block_contains_yield(body),
        // Nested function/class defs introduce their own scope: a yield
        // there does not make the enclosing function a generator.
        _ => false,
    }
}

fn expr_contains_yield(e: &Expr) -> bool {
    match e {
        Expr::Yield(_) | Expr::YieldFrom(_) => true,
        Expr::BoolOp { values, .. } => values.iter().any(expr_contains_yield),
        Expr::BinOp { left, right, .. } => expr_contains_yield(left) || expr_contains_yield(right),
        Expr::UnaryOp { operand, .. } => expr_contains_yield(operand),
        Expr::Compare { left, comparators, .. } => {
            expr_contains_yield(left) || comparators.iter().any(expr_contains_yield)
        }
        Expr::Call { func, args, keywords } => {
            expr_contains_yield(func)
                || args.iter().any(expr_contains_yield)
                || keywords.iter().any(|(_, v)| expr_contains_yield(v))
        }
        Expr::Attribute { value, .. } => expr_contains_yield(value),
        Expr::Subscript { value, slice } => expr_contains_yield(value) || expr_contains_yield(slice),
        Expr::IfExp { test, body, orelse } => {
            expr_contains_yield(test) || expr_contains_yield(body) || expr_contains_yield(orelse)
        }
        Expr::Tuple(items) | Expr::List(items) | Expr::Set(items) => items.iter().any(expr_contains_yield),
        Expr::NamedExpr { value, .. } => expr_contains_yield(value),
        Expr::Starred(e) => expr_contains_yield(e),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_function() {
        let m = parse_module("def f(x, y=1):\n    return x + y\n", "<t>").unwrap();
        assert_eq!(m.body.len(), 1);
        match &m.body[0] {
            Stmt::FunctionDef(f) => {
                assert_eq!(f.name, "f");
                assert_eq!(f.args.args, vec!["x", "y"]);
                assert_eq!(f.args.defaults.len(), 1);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn chained_comparison_parses_as_compare_node() {
        let m = parse_module("a < b < c\n", "<t>").unwrap();
        match &m.body[0] {
            Stmt::Expr(Expr::Compare { ops, comparators, .. }) => {
                assert_eq!(ops, &vec![CmpOp::Lt, CmpOp::Lt]);
                assert_eq!(comparators.len(), 2);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn decorators_parse_in_order() {
        let m = parse_module("@f\n@g\ndef h():\n    pass\n", "<t>").unwrap();
        match &m.body[0] {
            Stmt::FunctionDef(f) => assert_eq!(f.decorators.len(), 2),
            _ => panic!(),
        }
    }

    #[test]
    fn except_star_mixed_with_except_is_rejected() {
        let src = "try:\n    pass\nexcept ValueError:\n    pass\nexcept* TypeError:\n    pass\n";
        assert!(parse_module(src, "<t>").is_err());
    }

    #[test]
    fn bare_except_star_is_rejected() {
        let src = "try:\n    pass\nexcept*:\n    pass\n";
        assert!(parse_module(src, "<t>").is_err());
    }

    #[test]
    fn starred_assignment_target() {
        let m = parse_module("a, *b, c = x\n", "<t>").unwrap();
        match &m.body[0] {
            Stmt::Assign { targets, .. } => match &targets[0] {
                Expr::Tuple(items) => {
                    assert!(matches!(items[1], Expr::Starred(_)));
                }
                other => panic!("{other:?}"),
            },
            _ => panic!(),
        }
    }

    #[test]
    fn metaclass_keyword_in_class_header() {
        let m = parse_module("class C(Base, metaclass=Meta):\n    pass\n", "<t>").unwrap();
        match &m.body[0] {
            Stmt::ClassDef(c) => {
                assert_eq!(c.bases.len(), 1);
                assert_eq!(c.keywords.len(), 1);
                assert_eq!(c.keywords[0].0, "metaclass");
            }
            _ => panic!(),
        }
    }
}
