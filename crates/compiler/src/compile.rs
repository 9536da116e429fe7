//! AST + symbol table → [`CodeObject`] (§4.2, §4.3).
//!
//! `try`/`except`/`finally` and `with` never compile to a runtime
//! block-stack walk: every statement's exceptional path is a single
//! [`ExceptionTableEntry`] pointing at inline dispatch bytecode, and every
//! normal exit edge (fallthrough, `break`, `continue`, `return`) gets its
//! own inlined copy of the enclosing cleanup code, so `finally`/`__exit__`
//! bodies run exactly once regardless of how control leaves the block.

use crate::ast::*;
use crate::error::{CompileError, CompileErrors};
use crate::symtable::{self, ScopeKind, SymTable};
use pylite_bytecode::*;
use std::sync::Arc;

pub fn compile(source: &str, filename: &str) -> Result<CodeObject, CompileErrors> {
    let module = crate::parser::parse_module(source, filename).map_err(|e| vec![e])?;
    let symtab = symtable::build(&module);
    let mut c = Compiler::new_for_scope(filename.to_owned(), &symtab, symtable::MODULE_SCOPE);
    c.compile_module(&module).map_err(|e| vec![e])?;
    Ok(c.finish("<module>", 0, CodeFlags::empty(), Arguments::empty()))
}

impl Arguments {
    fn empty() -> Self {
        Arguments { args: vec![], defaults: vec![], vararg: None, kwonly_args: vec![], kwonly_defaults: vec![], kwarg: None }
    }
}

type CResult<T> = Result<T, CompileError>;

#[derive(Clone)]
enum Cleanup {
    Finally(Vec<Stmt>),
    With,
}

struct LoopCtx {
    continue_target: u32,
    break_jumps: Vec<usize>,
    cleanup_depth: usize,
}

struct Layout {
    locals: Vec<String>,
    cells: Vec<String>,
    frees: Vec<String>,
}

impl Layout {
    fn local_idx(&self, name: &str) -> Option<u32> {
        self.locals.iter().position(|n| n == name).map(|i| i as u32)
    }

    fn cellfree_idx(&self, name: &str) -> Option<u32> {
        if let Some(p) = self.cells.iter().position(|n| n == name) {
            return Some(p as u32);
        }
        self.frees.iter().position(|n| n == name).map(|p| (self.cells.len() + p) as u32)
    }
}

struct Compiler<'a> {
    filename: String,
    symtab: &'a SymTable,
    instructions: Vec<Instruction>,
    constants: Vec<ConstantData>,
    names: Vec<String>,
    line_table: Vec<(u32, u32)>,
    exception_table: Vec<ExceptionTableEntry>,
    cleanup_stack: Vec<Cleanup>,
    loop_stack: Vec<LoopCtx>,
    layout: Layout,
    scope: usize,
    child_cursor: usize,
    current_line: u32,
    max_stack: u32,
    cur_stack: u32,
}

impl<'a> Compiler<'a> {
    fn new_for_scope(filename: String, symtab: &'a SymTable, scope: usize) -> Self {
        let kind = symtab.kind(scope);
        let bound = symtab.bound_names(scope);
        let cells = symtab.cell_names(scope);
        let frees = symtab.free_names(scope);
        let locals: Vec<String> = if matches!(kind, ScopeKind::Module | ScopeKind::Class) {
            Vec::new()
        } else {
            bound.into_iter().filter(|n| !cells.contains(n)).collect()
        };
        Compiler {
            filename,
            symtab,
            instructions: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            line_table: Vec::new(),
            exception_table: Vec::new(),
            cleanup_stack: Vec::new(),
            loop_stack: Vec::new(),
            layout: Layout { locals, cells, frees },
            scope,
            child_cursor: 0,
            current_line: 0,
            max_stack: 0,
            cur_stack: 0,
        }
    }

    fn emit(&mut self, instr: Instruction) -> usize {
        self.stack_effect(&instr);
        self.instructions.push(instr);
        let offset = self.instructions.len() as u32 - 1;
        if self.line_table.last().map(|&(_, ln)| ln) != Some(self.current_line) {
            self.line_table.push((offset, self.current_line));
        }
        offset as usize
    }

    fn stack_effect(&mut self, instr: &Instruction) {
        let delta: i32 = match instr {
            Instruction::LoadConst { .. }
            | Instruction::LoadLocal { .. }
            | Instruction::LoadGlobal { .. }
            | Instruction::LoadCell { .. }
            | Instruction::DupTop
            | Instruction::GetIter
            | Instruction::LoadSuper => 1,
            Instruction::StoreLocal { .. }
            | Instruction::StoreGlobal { .. }
            | Instruction::StoreCell { .. }
            | Instruction::Pop
            | Instruction::PopBlock => -1,
            Instruction::DeleteLocal { .. } | Instruction::DeleteGlobal { .. } | Instruction::DeleteCell { .. } => 0,
            Instruction::LoadAttr { .. } | Instruction::UnaryOp { .. } => 0,
            Instruction::StoreAttr { .. } => -2,
            Instruction::DeleteAttr { .. } => -1,
            Instruction::StoreSubscr => -3,
            Instruction::DeleteSubscr => -2,
            Instruction::BinaryOp { .. } | Instruction::InplaceOp { .. } | Instruction::CompareOp { .. } => -1,
            Instruction::LoadSubscr => -1,
            Instruction::BuildSlice { has_step } => -(1 + i32::from(*has_step)),
            Instruction::BuildList { count }
            | Instruction::BuildTuple { count }
            | Instruction::BuildSet { count }
            | Instruction::BuildString { count } => 1 - *count as i32,
            Instruction::BuildDict { count } => 1 - 2 * (*count as i32),
            Instruction::ListAppend { .. } | Instruction::SetAdd { .. } | Instruction::ListExtend { .. } | Instruction::DictMerge { .. } => -1,
            Instruction::MapAdd { .. } => -2,
            Instruction::ListToTuple | Instruction::RotTwo | Instruction::Nop | Instruction::EndFinally => 0,
            Instruction::Jump { .. } => 0,
            Instruction::JumpIfFalse { .. } | Instruction::JumpIfTrue { .. } => -1,
            Instruction::JumpIfFalseOrPop { .. } | Instruction::JumpIfTrueOrPop { .. } => 0,
            Instruction::ForIter { .. } => 1,
            Instruction::Call { .. } => 0,
            Instruction::MakeFunction { .. } => 0,
            Instruction::MakeClass { .. } => -1,
            Instruction::Return | Instruction::Raise { .. } => -1,
            Instruction::PushBlock { .. } => 0,
            Instruction::WithCleanup => 0,
            Instruction::Yield | Instruction::YieldFrom => 0,
            Instruction::ImportName { .. } => 1,
            Instruction::ImportFrom { .. } => 1,
            Instruction::ImportStar => -1,
            Instruction::CheckExcMatch { .. } => 1,
        };
        self.cur_stack = (self.cur_stack as i32 + delta).max(0) as u32;
        self.max_stack = self.max_stack.max(self.cur_stack);
    }

    fn here(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn patch_jump_target(&mut self, at: usize, target: u32) {
        let slot = &mut self.instructions[at];
        match slot {
            Instruction::Jump { target: t }
            | Instruction::JumpIfFalse { target: t }
            | Instruction::JumpIfTrue { target: t }
            | Instruction::JumpIfFalseOrPop { target: t }
            | Instruction::JumpIfTrueOrPop { target: t }
            | Instruction::ForIter { target: t } => *t = target,
            other => unreachable!("patch_jump_target on non-jump instruction {other:?}"),
        }
    }

    fn add_const(&mut self, c: ConstantData) -> u32 {
        for (i, existing) in self.constants.iter().enumerate() {
            if const_eq(existing, &c) {
                return i as u32;
            }
        }
        self.constants.push(c);
        self.constants.len() as u32 - 1
    }

    fn add_name(&mut self, name: &str) -> u32 {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return i as u32;
        }
        self.names.push(name.to_owned());
        self.names.len() as u32 - 1
    }

    fn err(&self, msg: impl Into<String>) -> CompileError {
        CompileError::syntax(&self.filename, crate::token::Location { line: self.current_line, col: 0 }, msg)
    }

    fn finish(self, name: &str, first_line: u32, flags: CodeFlags, args: Arguments) -> CodeObject {
        let mut varnames = Vec::new();
        for n in &self.layout.locals {
            let kind = if args.args.contains(n)
                || args.kwonly_args.contains(n)
                || args.vararg.as_deref() == Some(n.as_str())
                || args.kwarg.as_deref() == Some(n.as_str())
            {
                VarKind::Parameter
            } else {
                VarKind::Local
            };
            varnames.push(VarInfo { name: n.clone(), kind });
        }
        for n in &self.layout.cells {
            varnames.push(VarInfo { name: n.clone(), kind: VarKind::Cell });
        }
        for n in &self.layout.frees {
            varnames.push(VarInfo { name: n.clone(), kind: VarKind::Free });
        }
        CodeObject {
            name: name.to_owned(),
            filename: self.filename,
            instructions: self.instructions,
            constants: self.constants,
            names: self.names,
            varnames,
            line_table: LineTable(self.line_table),
            exception_table: self.exception_table,
            arg_count: args.args.len() as u32,
            default_count: args.defaults.len() as u32,
            param_names: args.args.clone(),
            vararg_name: args.vararg.clone(),
            kw_default_count: args.kwonly_defaults.iter().filter(|d| d.is_some()).count() as u32,
            kwonly_args: args.kwonly_args,
            kwarg_name: args.kwarg.clone(),
            flags,
            max_stack_size: self.max_stack,
            first_line,
        }
    }

    // ---- module / function / class bodies ----

    fn compile_module(&mut self, module: &Module) -> CResult<()> {
        self.compile_stmts(&module.body)?;
        self.emit(Instruction::LoadConst { idx: self.add_const(ConstantData::None) });
        self.emit(Instruction::Return);
        Ok(())
    }

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> CResult<()> {
        for s in stmts {
            self.compile_stmt(s)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, s: &Stmt) -> CResult<()> {
        match s {
            Stmt::Expr(e) => {
                self.compile_expr(e)?;
                self.emit(Instruction::Pop);
            }
            Stmt::Assign { targets, value } => {
                self.compile_expr(value)?;
                for (i, t) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.emit(Instruction::DupTop);
                    }
                    self.compile_store(t)?;
                }
            }
            Stmt::AugAssign { target, op, value } => {
                self.compile_aug_assign(target, op, value)?;
            }
            Stmt::AnnAssign { target, value } => {
                if let Some(v) = value {
                    self.compile_expr(v)?;
                    self.compile_store(target)?;
                }
            }
            Stmt::Return(e) => {
                match e {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        let idx = self.add_const(ConstantData::None);
                        self.emit(Instruction::LoadConst { idx });
                    }
                }
                self.inline_all_cleanups()?;
                self.emit(Instruction::Return);
            }
            Stmt::Pass => {}
            Stmt::Break => {
                let depth = self
                    .loop_stack
                    .last()
                    .map(|l| l.cleanup_depth)
                    .ok_or_else(|| self.err("'break' outside loop"))?;
                self.inline_cleanups_above(depth)?;
                let at = self.emit(Instruction::Jump { target: 0 });
                self.loop_stack.last_mut().unwrap().break_jumps.push(at);
            }
            Stmt::Continue => {
                let (target, depth) = {
                    let l = self.loop_stack.last().ok_or_else(|| self.err("'continue' outside loop"))?;
                    (l.continue_target, l.cleanup_depth)
                };
                self.inline_cleanups_above(depth)?;
                self.emit(Instruction::Jump { target });
            }
            Stmt::Delete(targets) => {
                for t in targets {
                    self.compile_delete(t)?;
                }
            }
            Stmt::Global(_) | Stmt::Nonlocal(_) => {}
            Stmt::Assert { test, msg } => {
                self.compile_expr(test)?;
                let at = self.emit(Instruction::JumpIfTrue { target: 0 });
                let assertion_error = self.add_name("AssertionError");
                self.emit(Instruction::LoadGlobal { name_idx: assertion_error });
                if let Some(m) = msg {
                    self.compile_expr(m)?;
                    let names_idx = self.add_const(ConstantData::Tuple(vec![]));
                    self.emit(Instruction::Call { argc: 1, kwarg_names_idx: names_idx, unpack_args: false, unpack_kwargs: false });
                } else {
                    let names_idx = self.add_const(ConstantData::Tuple(vec![]));
                    self.emit(Instruction::Call { argc: 0, kwarg_names_idx: names_idx, unpack_args: false, unpack_kwargs: false });
                }
                self.emit(Instruction::Raise { form: RaiseForm::Exception });
                let after = self.here();
                self.patch_jump_target(at, after);
            }
            Stmt::Raise { exc, cause } => {
                match (exc, cause) {
                    (None, _) => {
                        self.emit(Instruction::Raise { form: RaiseForm::Reraise });
                    }
                    (Some(e), None) => {
                        self.compile_expr(e)?;
                        self.emit(Instruction::Raise { form: RaiseForm::Exception });
                    }
                    (Some(e), Some(c)) => {
                        self.compile_expr(e)?;
                        self.compile_expr(c)?;
                        self.emit(Instruction::Raise { form: RaiseForm::ExceptionFrom });
                    }
                }
            }
            Stmt::If { test, body, orelse } => self.compile_if(test, body, orelse)?,
            Stmt::While { test, body, orelse } => self.compile_while(test, body, orelse)?,
            Stmt::For { target, iter, body, orelse } => self.compile_for(target, iter, body, orelse)?,
            Stmt::Try { body, handlers, orelse, finalbody } => self.compile_try(body, handlers, orelse, finalbody)?,
            Stmt::With { items, body } => self.compile_with(items, body)?,
            Stmt::FunctionDef(f) => self.compile_funcdef(f)?,
            Stmt::ClassDef(c) => self.compile_classdef(c)?,
            Stmt::Import { names } => {
                for (module, alias) in names {
                    let idx = self.add_name(module);
                    self.emit(Instruction::ImportName { name_idx: idx });
                    let bound = alias.clone().unwrap_or_else(|| module.split('.').next().unwrap().to_owned());
                    self.compile_store(&Expr::Name(bound))?;
                }
            }
            Stmt::ImportFrom { module, names, is_star } => {
                let midx = self.add_name(module);
                self.emit(Instruction::ImportName { name_idx: midx });
                if *is_star {
                    self.emit(Instruction::ImportStar);
                } else {
                    for (name, alias) in names {
                        self.emit(Instruction::DupTop);
                        let nidx = self.add_name(name);
                        self.emit(Instruction::ImportFrom { name_idx: nidx });
                        let bound = alias.clone().unwrap_or_else(|| name.clone());
                        self.compile_store(&Expr::Name(bound))?;
                    }
                    self.emit(Instruction::Pop);
                }
            }
        }
        Ok(())
    }

    fn inline_all_cleanups(&mut self) -> CResult<()> {
        self.inline_cleanups_above(0)
    }

    fn inline_cleanups_above(&mut self, depth: usize) -> CResult<()> {
        let pending: Vec<Cleanup> = self.cleanup_stack[depth..].to_vec();
        for cleanup in pending.iter().rev() {
            match cleanup {
                Cleanup::Finally(body) => self.compile_stmts(body)?,
                Cleanup::With => {
                    self.emit(Instruction::WithCleanup);
                    self.emit(Instruction::PopBlock);
                }
            }
        }
        Ok(())
    }

    fn compile_if(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CResult<()> {
        self.compile_expr(test)?;
        let else_jump = self.emit(Instruction::JumpIfFalse { target: 0 });
        self.compile_stmts(body)?;
        if orelse.is_empty() {
            let after = self.here();
            self.patch_jump_target(else_jump, after);
        } else {
            let end_jump = self.emit(Instruction::Jump { target: 0 });
            let else_start = self.here();
            self.patch_jump_target(else_jump, else_start);
            self.compile_stmts(orelse)?;
            let after = self.here();
            self.patch_jump_target(end_jump, after);
        }
        Ok(())
    }

    fn compile_while(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CResult<()> {
        let top = self.here();
        self.compile_expr(test)?;
        let exit_jump = self.emit(Instruction::JumpIfFalse { target: 0 });
        self.loop_stack.push(LoopCtx { continue_target: top, break_jumps: Vec::new(), cleanup_depth: self.cleanup_stack.len() });
        self.compile_stmts(body)?;
        self.emit(Instruction::Jump { target: top });
        let after = self.here();
        self.patch_jump_target(exit_jump, after);
        let ctx = self.loop_stack.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump_target(j, after);
        }
        self.compile_stmts(orelse)?;
        Ok(())
    }

    fn compile_for(&mut self, target: &Expr, iter: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CResult<()> {
        self.compile_expr(iter)?;
        self.emit(Instruction::GetIter);
        let top = self.here();
        let for_iter = self.emit(Instruction::ForIter { target: 0 });
        self.compile_store(target)?;
        self.loop_stack.push(LoopCtx { continue_target: top, break_jumps: Vec::new(), cleanup_depth: self.cleanup_stack.len() });
        self.compile_stmts(body)?;
        self.emit(Instruction::Jump { target: top });
        let after = self.here();
        self.patch_jump_target(for_iter, after);
        let ctx = self.loop_stack.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump_target(j, after);
        }
        self.compile_stmts(orelse)?;
        Ok(())
    }

    fn compile_try(&mut self, body: &[Stmt], handlers: &[ExceptHandler], orelse: &[Stmt], finalbody: &[Stmt]) -> CResult<()> {
        if !finalbody.is_empty() {
            self.cleanup_stack.push(Cleanup::Finally(finalbody.to_vec()));
        }
        let body_start = self.here();
        self.compile_stmts(body)?;
        if !finalbody.is_empty() {
            self.cleanup_stack.pop();
        }
        self.compile_stmts(orelse)?;
        if !finalbody.is_empty() {
            self.compile_stmts(finalbody)?;
        }
        let skip_handlers = self.emit(Instruction::Jump { target: 0 });
        let body_end = self.here();

        let dispatch_start = self.here();
        let mut clause_end_jumps = Vec::new();
        let mut prev_fail_jump: Option<usize> = None;
        let has_star = handlers.iter().any(|h| h.is_star);
        for h in handlers {
            if let Some(at) = prev_fail_jump.take() {
                let here = self.here();
                self.patch_jump_target(at, here);
            }
            let types_tuple = self.build_type_names_const(&h.types)?;
            self.emit(Instruction::CheckExcMatch { types_const_idx: types_tuple });
            prev_fail_jump = Some(self.emit(Instruction::JumpIfFalse { target: 0 }));
            if let Some(n) = &h.name {
                self.compile_store(&Expr::Name(n.clone()))?;
            } else {
                self.emit(Instruction::Pop);
            }
            self.compile_stmts(&h.body)?;
            self.emit(Instruction::EndFinally);
            if let Some(n) = &h.name {
                self.compile_delete(&Expr::Name(n.clone()))?;
            }
            if !finalbody.is_empty() {
                self.compile_stmts(finalbody)?;
            }
            clause_end_jumps.push(self.emit(Instruction::Jump { target: 0 }));
        }
        if let Some(at) = prev_fail_jump {
            let here = self.here();
            self.patch_jump_target(at, here);
        }
        if !finalbody.is_empty() {
            self.compile_stmts(finalbody)?;
        }
        self.emit(Instruction::Raise { form: RaiseForm::Reraise });

        let after = self.here();
        self.patch_jump_target(skip_handlers, after);
        for j in clause_end_jumps {
            self.patch_jump_target(j, after);
        }

        if !handlers.is_empty() {
            let kind = if has_star {
                HandlerKind::CatchStar { type_names: Vec::new(), bind_local: None }
            } else {
                HandlerKind::Catch { type_names: Vec::new(), bind_local: None }
            };
            self.exception_table.push(ExceptionTableEntry { start: body_start, end: body_end, target: dispatch_start, kind });
        } else {
            self.exception_table.push(ExceptionTableEntry { start: body_start, end: body_end, target: dispatch_start, kind: HandlerKind::Finally });
        }
        Ok(())
    }

    fn build_type_names_const(&mut self, types: &[Expr]) -> CResult<u32> {
        let mut names = Vec::new();
        for t in types {
            match t {
                Expr::Name(n) => names.push(ConstantData::Str(n.clone())),
                _ => return Err(self.err("except clause type must be a plain name or a parenthesized tuple of names")),
            }
        }
        Ok(self.add_const(ConstantData::Tuple(names)))
    }

    fn compile_with(&mut self, items: &[WithItem], body: &[Stmt]) -> CResult<()> {
        match items.split_first() {
            None => self.compile_stmts(body),
            Some((first, rest)) => {
                self.compile_expr(&first.context_expr)?;
                let handler_placeholder = self.emit(Instruction::PushBlock { kind: BlockKind::With, handler: 0 });
                let body_start = self.here();
                match &first.optional_vars {
                    Some(t) => self.compile_store(t)?,
                    None => {
                        self.emit(Instruction::Pop);
                    }
                }
                self.cleanup_stack.push(Cleanup::With);
                if rest.is_empty() {
                    self.compile_stmts(body)?;
                } else {
                    self.compile_with(rest, body)?;
                }
                self.cleanup_stack.pop();
                self.emit(Instruction::WithCleanup);
                self.emit(Instruction::PopBlock);
                let skip = self.emit(Instruction::Jump { target: 0 });
                let body_end = self.here();

                let handler_target = self.here();
                self.emit(Instruction::WithCleanup);
                let swallow = self.emit(Instruction::JumpIfTrue { target: 0 });
                self.emit(Instruction::Raise { form: RaiseForm::Reraise });
                let after = self.here();
                self.patch_jump_target(swallow, after);
                self.patch_jump_target(skip, after);
                self.patch_jump_target(handler_placeholder, handler_target);

                self.exception_table.push(ExceptionTableEntry { start: body_start, end: body_end, target: handler_target, kind: HandlerKind::Finally });
                Ok(())
            }
        }
    }

    fn compile_funcdef(&mut self, f: &FunctionDef) -> CResult<()> {
        for d in &f.decorators {
            self.compile_expr(d)?;
        }
        for d in &f.args.defaults {
            self.compile_expr(d)?;
        }
        self.compile_kwonly_defaults(&f.args)?;
        let child_scope = self.next_child_scope();
        let mut child = Compiler::new_for_scope(self.filename.clone(), self.symtab, child_scope);
        child.compile_stmts(&f.body)?;
        let none = child.add_const(ConstantData::None);
        child.emit(Instruction::LoadConst { idx: none });
        child.emit(Instruction::Return);

        let mut flags = CodeFlags::empty();
        if f.is_generator {
            flags |= CodeFlags::IS_GENERATOR;
        }
        if f.args.vararg.is_some() {
            flags |= CodeFlags::HAS_VARARGS;
        }
        if f.args.kwarg.is_some() {
            flags |= CodeFlags::HAS_KWARGS;
        }
        let code = child.finish(&f.name, 0, flags, f.args.clone());
        let code_idx = self.add_const(ConstantData::Code(Arc::new(code)));
        self.emit(Instruction::LoadConst { idx: code_idx });

        let frees = self.symtab.free_names(child_scope);
        for free in &frees {
            let idx = self.layout.cellfree_idx(free).ok_or_else(|| self.err(format!("internal error: free var '{free}' has no cell in enclosing scope")))?;
            self.emit(Instruction::LoadCell { idx });
        }
        self.emit(Instruction::MakeFunction {
            has_defaults: !f.args.defaults.is_empty(),
            has_kw_defaults: f.args.kwonly_defaults.iter().any(|d| d.is_some()),
            num_cells: frees.len() as u32,
            is_generator: f.is_generator,
        });
        for dec in f.decorators.iter().rev() {
            self.compile_expr(dec)?;
            self.emit(Instruction::RotTwo);
            let names_idx = self.add_const(ConstantData::Tuple(vec![]));
            self.emit(Instruction::Call { argc: 1, kwarg_names_idx: names_idx, unpack_args: false, unpack_kwargs: false });
        }
        self.compile_store(&Expr::Name(f.name.clone()))
    }

    /// Pushes `(name_const, value)` pairs for each keyword-only parameter
    /// that has a default, skipping those that don't — `kw_default_count`
    /// on the resulting `CodeObject` tells `MakeFunction` how many pairs
    /// to expect.
    fn compile_kwonly_defaults(&mut self, args: &Arguments) -> CResult<()> {
        for (name, default) in args.kwonly_args.iter().zip(args.kwonly_defaults.iter()) {
            if let Some(expr) = default {
                let name_idx = self.add_const(ConstantData::Str(name.clone()));
                self.emit(Instruction::LoadConst { idx: name_idx });
                self.compile_expr(expr)?;
            }
        }
        Ok(())
    }

    fn compile_classdef(&mut self, c: &ClassDef) -> CResult<()> {
        let child_scope = self.next_child_scope();
        let mut child = Compiler::new_for_scope(self.filename.clone(), self.symtab, child_scope);
        let qualname_idx = child.add_const(ConstantData::Str(c.name.clone()));
        child.emit(Instruction::LoadConst { idx: qualname_idx });
        let name_name = child.add_name("__qualname__");
        child.emit(Instruction::StoreGlobal { name_idx: name_name });
        child.compile_stmts(&c.body)?;
        let none = child.add_const(ConstantData::None);
        child.emit(Instruction::LoadConst { idx: none });
        child.emit(Instruction::Return);
        let code = child.finish(&c.name, 0, CodeFlags::empty(), Arguments::empty());
        let code_idx = self.add_const(ConstantData::Code(Arc::new(code)));
        self.emit(Instruction::LoadConst { idx: code_idx });
        self.emit(Instruction::MakeFunction { has_defaults: false, has_kw_defaults: false, num_cells: 0, is_generator: false });

        let name_const = self.add_const(ConstantData::Str(c.name.clone()));
        self.emit(Instruction::LoadConst { idx: name_const });
        for b in &c.bases {
            self.compile_expr(b)?;
        }
        let has_metaclass = c.keywords.iter().any(|(k, _)| k == "metaclass");
        if has_metaclass {
            let (_, mc) = c.keywords.iter().find(|(k, _)| k == "metaclass").unwrap();
            self.compile_expr(mc)?;
        }
        self.emit(Instruction::MakeClass { bases_count: c.bases.len() as u32, has_metaclass_kw: has_metaclass });
        for dec in c.decorators.iter().rev() {
            self.compile_expr(dec)?;
            self.emit(Instruction::RotTwo);
            let names_idx = self.add_const(ConstantData::Tuple(vec![]));
            self.emit(Instruction::Call { argc: 1, kwarg_names_idx: names_idx, unpack_args: false, unpack_kwargs: false });
        }
        self.compile_store(&Expr::Name(c.name.clone()))
    }

    fn next_child_scope(&mut self) -> usize {
        // Children are visited in the same order the symtable builder
        // encountered them; track how many of this scope's children we've
        // already consumed via a side-channel counter keyed by discovery
        // order (first FunctionDef/ClassDef/Lambda/Comp met == child 0).
        let count = self.child_cursor;
        self.child_cursor += 1;
        self.symtab.child(self.scope, count)
    }

    // ---- targets ----

    fn compile_store(&mut self, target: &Expr) -> CResult<()> {
        match target {
            Expr::Name(n) => {
                match self.symtab.kind_of(self.scope, n) {
                    pylite_bytecode::VarKind::Global => {
                        let idx = self.add_name(n);
                        self.emit(Instruction::StoreGlobal { name_idx: idx });
                    }
                    pylite_bytecode::VarKind::Cell | pylite_bytecode::VarKind::Free => {
                        let idx = self.layout.cellfree_idx(n).ok_or_else(|| self.err(format!("unresolved cell/free '{n}'")))?;
                        self.emit(Instruction::StoreCell { idx });
                    }
                    _ => {
                        if matches!(self.symtab.kind(self.scope), ScopeKind::Module | ScopeKind::Class) {
                            let idx = self.add_name(n);
                            self.emit(Instruction::StoreGlobal { name_idx: idx });
                        } else {
                            let idx = self.layout.local_idx(n).ok_or_else(|| self.err(format!("unresolved local '{n}'")))?;
                            self.emit(Instruction::StoreLocal { idx });
                        }
                    }
                }
                Ok(())
            }
            Expr::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.add_name(attr);
                self.emit(Instruction::StoreAttr { name_idx: idx });
                Ok(())
            }
            Expr::Subscript { value, slice } => {
                self.compile_expr(value)?;
                self.compile_expr(slice)?;
                self.emit(Instruction::StoreSubscr);
                Ok(())
            }
            Expr::Tuple(items) | Expr::List(items) => self.compile_unpack_targets(items),
            Expr::Starred(inner) => self.compile_store(inner),
            other => Err(self.err(format!("cannot assign to {other:?}"))),
        }
    }

    /// Unpacking lowers to repeated indexing of a materialized `list(...)`
    /// rather than a dedicated `UNPACK_SEQUENCE`/`UNPACK_EX` opcode: the
    /// value being unpacked is already on the stack (pushed by the
    /// caller), so this first converts it in place to a list, then reads
    /// each target by constant index — negative indices for names after a
    /// starred target, and a slice for the starred target itself — before
    /// popping the leftover list copy.
    fn compile_unpack_targets(&mut self, items: &[Expr]) -> CResult<()> {
        let star_pos = items.iter().position(|i| matches!(i, Expr::Starred(_)));
        let list_name = self.add_name("list");
        self.emit(Instruction::LoadGlobal { name_idx: list_name });
        self.emit(Instruction::RotTwo);
        let names_idx = self.add_const(ConstantData::Tuple(vec![]));
        self.emit(Instruction::Call { argc: 1, kwarg_names_idx: names_idx, unpack_args: false, unpack_kwargs: false });

        match star_pos {
            None => {
                for (i, item) in items.iter().enumerate() {
                    self.emit(Instruction::DupTop);
                    let idx = self.add_const(ConstantData::Int(i as i64));
                    self.emit(Instruction::LoadConst { idx });
                    self.emit(Instruction::LoadSubscr);
                    self.compile_store(item)?;
                }
            }
            Some(star_pos) => {
                let tail_count = items.len() - star_pos - 1;
                for (i, item) in items.iter().enumerate().take(star_pos) {
                    self.emit(Instruction::DupTop);
                    let idx = self.add_const(ConstantData::Int(i as i64));
                    self.emit(Instruction::LoadConst { idx });
                    self.emit(Instruction::LoadSubscr);
                    self.compile_store(item)?;
                }
                self.emit(Instruction::DupTop);
                let lo = self.add_const(ConstantData::Int(star_pos as i64));
                self.emit(Instruction::LoadConst { idx: lo });
                let hi = if tail_count > 0 {
                    self.add_const(ConstantData::Int(-(tail_count as i64)))
                } else {
                    self.add_const(ConstantData::None)
                };
                self.emit(Instruction::LoadConst { idx: hi });
                self.emit(Instruction::BuildSlice { has_step: false });
                self.emit(Instruction::LoadSubscr);
                match &items[star_pos] {
                    Expr::Starred(inner) => self.compile_store(inner)?,
                    other => self.compile_store(other)?,
                }
                for (j, item) in items[star_pos + 1..].iter().enumerate() {
                    self.emit(Instruction::DupTop);
                    let idx = self.add_const(ConstantData::Int(-(tail_count as i64 - j as i64)));
                    self.emit(Instruction::LoadConst { idx });
                    self.emit(Instruction::LoadSubscr);
                    self.compile_store(item)?;
                }
            }
        }
        self.emit(Instruction::Pop);
        Ok(())
    }

    fn compile_delete(&mut self, target: &Expr) -> CResult<()> {
        match target {
            Expr::Name(n) => {
                match self.symtab.kind_of(self.scope, n) {
                    pylite_bytecode::VarKind::Global => {
                        let idx = self.add_name(n);
                        self.emit(Instruction::DeleteGlobal { name_idx: idx });
                    }
                    pylite_bytecode::VarKind::Cell | pylite_bytecode::VarKind::Free => {
                        let idx = self.layout.cellfree_idx(n).ok_or_else(|| self.err(format!("unresolved cell/free '{n}'")))?;
                        self.emit(Instruction::DeleteCell { idx });
                    }
                    _ => {
                        if matches!(self.symtab.kind(self.scope), ScopeKind::Module | ScopeKind::Class) {
                            let idx = self.add_name(n);
                            self.emit(Instruction::DeleteGlobal { name_idx: idx });
                        } else {
                            let idx = self.layout.local_idx(n).ok_or_else(|| self.err(format!("unresolved local '{n}'")))?;
                            self.emit(Instruction::DeleteLocal { idx });
                        }
                    }
                }
                Ok(())
            }
            Expr::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.add_name(attr);
                self.emit(Instruction::DeleteAttr { name_idx: idx });
                Ok(())
            }
            Expr::Subscript { value, slice } => {
                self.compile_expr(value)?;
                self.compile_expr(slice)?;
                self.emit(Instruction::DeleteSubscr);
                Ok(())
            }
            other => Err(self.err(format!("cannot delete {other:?}"))),
        }
    }

    fn compile_aug_assign(&mut self, target: &Expr, op: &AugOp, value: &Expr) -> CResult<()> {
        let binop = aug_to_binop(op);
        match target {
            Expr::Name(_) => {
                self.compile_expr(target)?;
                self.compile_expr(value)?;
                self.emit(Instruction::InplaceOp { op: binop });
                self.compile_store(target)
            }
            Expr::Attribute { value: obj, attr } => {
                self.compile_expr(obj)?;
                self.emit(Instruction::DupTop);
                let idx = self.add_name(attr);
                self.emit(Instruction::LoadAttr { name_idx: idx });
                self.compile_expr(value)?;
                self.emit(Instruction::InplaceOp { op: binop });
                self.emit(Instruction::RotTwo);
                self.emit(Instruction::StoreAttr { name_idx: idx });
                Ok(())
            }
            Expr::Subscript { value: obj, slice } => self.compile_aug_subscript(obj, slice, value, binop),
            other => Err(self.err(format!("cannot augmented-assign to {other:?}"))),
        }
    }

    /// `obj`/`slice` are evaluated twice (once to load the current value,
    /// once to store the result back) since there is no stack op to
    /// duplicate two items at once; safe as long as they're side-effect
    /// free, which holds for ordinary subscript targets.
    fn compile_aug_subscript(&mut self, obj: &Expr, slice: &Expr, value: &Expr, op: BinOp) -> CResult<()> {
        self.compile_expr(obj)?;
        self.compile_expr(slice)?;
        self.emit(Instruction::LoadSubscr);
        self.compile_expr(value)?;
        self.emit(Instruction::InplaceOp { op });
        self.compile_expr(obj)?;
        self.compile_expr(slice)?;
        self.emit(Instruction::StoreSubscr);
        Ok(())
    }

    // ---- expressions ----

    fn compile_expr(&mut self, e: &Expr) -> CResult<()> {
        match e {
            Expr::None => {
                let idx = self.add_const(ConstantData::None);
                self.emit(Instruction::LoadConst { idx });
            }
            Expr::True => {
                let idx = self.add_const(ConstantData::Bool(true));
                self.emit(Instruction::LoadConst { idx });
            }
            Expr::False => {
                let idx = self.add_const(ConstantData::Bool(false));
                self.emit(Instruction::LoadConst { idx });
            }
            Expr::Int(v) => {
                let idx = self.add_const(ConstantData::Int(*v));
                self.emit(Instruction::LoadConst { idx });
            }
            Expr::Float(v) => {
                let idx = self.add_const(ConstantData::Float(*v));
                self.emit(Instruction::LoadConst { idx });
            }
            Expr::Str(s) => {
                let idx = self.add_const(ConstantData::Str(s.clone()));
                self.emit(Instruction::LoadConst { idx });
            }
            Expr::Bytes(b) => {
                let idx = self.add_const(ConstantData::Bytes(b.clone()));
                self.emit(Instruction::LoadConst { idx });
            }
            Expr::FString(parts) => {
                for p in parts {
                    match p {
                        FStringPart::Literal(s) => {
                            let idx = self.add_const(ConstantData::Str(s.clone()));
                            self.emit(Instruction::LoadConst { idx });
                        }
                        FStringPart::Expr { expr, .. } => {
                            self.compile_expr(expr)?;
                        }
                    }
                }
                self.emit(Instruction::BuildString { count: parts.len() as u32 });
            }
            Expr::Name(n) => {
                match self.symtab.kind_of(self.scope, n) {
                    pylite_bytecode::VarKind::Global => {
                        let idx = self.add_name(n);
                        self.emit(Instruction::LoadGlobal { name_idx: idx });
                    }
                    pylite_bytecode::VarKind::Cell | pylite_bytecode::VarKind::Free => {
                        let idx = self.layout.cellfree_idx(n).ok_or_else(|| self.err(format!("unresolved cell/free '{n}'")))?;
                        self.emit(Instruction::LoadCell { idx });
                    }
                    _ => {
                        if matches!(self.symtab.kind(self.scope), ScopeKind::Module | ScopeKind::Class) {
                            let idx = self.add_name(n);
                            self.emit(Instruction::LoadGlobal { name_idx: idx });
                        } else {
                            let idx = self.layout.local_idx(n).ok_or_else(|| self.err(format!("unresolved local '{n}'")))?;
                            self.emit(Instruction::LoadLocal { idx });
                        }
                    }
                }
            }
            Expr::Tuple(items) => {
                self.compile_exprs_plain(items)?;
                self.emit(Instruction::BuildTuple { count: items.len() as u32 });
            }
            Expr::List(items) => {
                self.compile_exprs_plain(items)?;
                self.emit(Instruction::BuildList { count: items.len() as u32 });
            }
            Expr::Set(items) => {
                self.compile_exprs_plain(items)?;
                self.emit(Instruction::BuildSet { count: items.len() as u32 });
            }
            Expr::Dict(pairs) => {
                for (k, v) in pairs {
                    match k {
                        Some(k) => self.compile_expr(k)?,
                        None => return Err(self.err("dict-unpacking `**expr` in a dict display is not supported")),
                    }
                    self.compile_expr(v)?;
                }
                self.emit(Instruction::BuildDict { count: pairs.len() as u32 });
            }
            Expr::Starred(_) => return Err(self.err("starred expression not allowed in this context")),
            Expr::BoolOp { op, values } => self.compile_bool_op(*op, values)?,
            Expr::BinOp { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Instruction::BinaryOp { op: *op });
            }
            Expr::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                self.emit(Instruction::UnaryOp { op: *op });
            }
            Expr::Compare { left, ops, comparators } => self.compile_compare(left, ops, comparators)?,
            Expr::Call { func, args, keywords } => self.compile_call(func, args, keywords)?,
            Expr::Attribute { value, attr } => {
                self.compile_expr(value)?;
                let idx = self.add_name(attr);
                self.emit(Instruction::LoadAttr { name_idx: idx });
            }
            Expr::Subscript { value, slice } => {
                self.compile_expr(value)?;
                self.compile_expr(slice)?;
                self.emit(Instruction::LoadSubscr);
            }
            Expr::Slice { lower, upper, step } => {
                match lower {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        let idx = self.add_const(ConstantData::None);
                        self.emit(Instruction::LoadConst { idx });
                    }
                }
                match upper {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        let idx = self.add_const(ConstantData::None);
                        self.emit(Instruction::LoadConst { idx });
                    }
                }
                if let Some(e) = step {
                    self.compile_expr(e)?;
                }
                self.emit(Instruction::BuildSlice { has_step: step.is_some() });
            }
            Expr::IfExp { test, body, orelse } => {
                self.compile_expr(test)?;
                let else_jump = self.emit(Instruction::JumpIfFalse { target: 0 });
                self.compile_expr(body)?;
                let end_jump = self.emit(Instruction::Jump { target: 0 });
                let else_start = self.here();
                self.patch_jump_target(else_jump, else_start);
                self.compile_expr(orelse)?;
                let after = self.here();
                self.patch_jump_target(end_jump, after);
            }
            Expr::Lambda { args, body } => self.compile_lambda(args, body)?,
            Expr::Comp(c) => self.compile_comprehension(c)?,
            Expr::Yield(e) => {
                match e {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        let idx = self.add_const(ConstantData::None);
                        self.emit(Instruction::LoadConst { idx });
                    }
                }
                self.emit(Instruction::Yield);
            }
            Expr::YieldFrom(e) => {
                self.compile_expr(e)?;
                self.emit(Instruction::GetIter);
                self.emit(Instruction::YieldFrom);
            }
            Expr::Await(e) => {
                // Not a distinct suspension point in this subset (no
                // async/await in scope); treat as a pass-through so
                // parsing `await` inside translated generator helpers
                // doesn't hard-fail.
                self.compile_expr(e)?;
            }
            Expr::NamedExpr { target, value } => {
                self.compile_expr(value)?;
                self.emit(Instruction::DupTop);
                self.compile_store(target)?;
            }
        }
        Ok(())
    }

    fn compile_exprs_plain(&mut self, items: &[Expr]) -> CResult<()> {
        for i in items {
            if matches!(i, Expr::Starred(_)) {
                return Err(self.err("starred expressions inside list/set/tuple displays are not supported"));
            }
            self.compile_expr(i)?;
        }
        Ok(())
    }

    fn compile_bool_op(&mut self, op: BoolOp, values: &[Expr]) -> CResult<()> {
        let mut end_jumps = Vec::new();
        for (i, v) in values.iter().enumerate() {
            self.compile_expr(v)?;
            if i + 1 < values.len() {
                let j = match op {
                    BoolOp::And => self.emit(Instruction::JumpIfFalseOrPop { target: 0 }),
                    BoolOp::Or => self.emit(Instruction::JumpIfTrueOrPop { target: 0 }),
                };
                end_jumps.push(j);
            }
        }
        let after = self.here();
        for j in end_jumps {
            self.patch_jump_target(j, after);
        }
        Ok(())
    }

    fn compile_compare(&mut self, left: &Expr, ops: &[CmpOp], comparators: &[Expr]) -> CResult<()> {
        self.compile_expr(left)?;
        let mut end_jumps = Vec::new();
        for (i, (op, comp)) in ops.iter().zip(comparators.iter()).enumerate() {
            self.compile_expr(comp)?;
            let is_last = i + 1 == ops.len();
            if !is_last {
                self.emit(Instruction::DupTop);
                self.emit(Instruction::RotTwo);
            }
            self.emit(Instruction::CompareOp { op: ast_to_bytecode_cmp(op) });
            if !is_last {
                let j = self.emit(Instruction::JumpIfFalseOrPop { target: 0 });
                end_jumps.push(j);
                self.emit(Instruction::RotTwo);
                self.emit(Instruction::Pop);
            }
        }
        let after = self.here();
        for j in end_jumps {
            self.patch_jump_target(j, after);
        }
        Ok(())
    }

    fn compile_call(&mut self, func: &Expr, args: &[Expr], keywords: &[(Option<String>, Expr)]) -> CResult<()> {
        if let Expr::Name(n) = func {
            if n == "super" && args.is_empty() && keywords.is_empty() {
                self.emit(Instruction::LoadSuper);
                let names_idx = self.add_const(ConstantData::Tuple(vec![]));
                self.emit(Instruction::Call { argc: 0, kwarg_names_idx: names_idx, unpack_args: false, unpack_kwargs: false });
                return Ok(());
            }
        }
        self.compile_expr(func)?;

        let has_star_arg = args.iter().any(|a| matches!(a, Expr::Starred(_)));
        let unpack_args = has_star_arg;
        if has_star_arg {
            self.emit(Instruction::BuildList { count: 0 });
            for a in args {
                match a {
                    Expr::Starred(inner) => {
                        self.compile_expr(inner)?;
                        self.emit(Instruction::ListExtend { depth: 0 });
                    }
                    other => {
                        self.compile_expr(other)?;
                        self.emit(Instruction::ListAppend { depth: 0 });
                    }
                }
            }
            self.emit(Instruction::ListToTuple);
        } else {
            for a in args {
                self.compile_expr(a)?;
            }
        }

        let has_kw_unpack = keywords.iter().any(|(k, _)| k.is_none());
        let unpack_kwargs = has_kw_unpack;
        let kwarg_names_idx = if has_kw_unpack {
            self.emit(Instruction::BuildDict { count: 0 });
            for (name, value) in keywords {
                match name {
                    Some(n) => {
                        let kidx = self.add_const(ConstantData::Str(n.clone()));
                        self.emit(Instruction::LoadConst { idx: kidx });
                        self.compile_expr(value)?;
                        self.emit(Instruction::MapAdd { depth: 0 });
                    }
                    None => {
                        self.compile_expr(value)?;
                        self.emit(Instruction::DictMerge { depth: 0 });
                    }
                }
            }
            0
        } else {
            let names: Vec<ConstantData> = keywords.iter().map(|(n, _)| ConstantData::Str(n.clone().unwrap())).collect();
            for (_, v) in keywords {
                self.compile_expr(v)?;
            }
            self.add_const(ConstantData::Tuple(names))
        };

        let argc = if unpack_args { 0 } else { args.len() as u32 };
        self.emit(Instruction::Call { argc, kwarg_names_idx, unpack_args, unpack_kwargs });
        Ok(())
    }

    fn compile_lambda(&mut self, args: &Arguments, body: &Expr) -> CResult<()> {
        for d in &args.defaults {
            self.compile_expr(d)?;
        }
        self.compile_kwonly_defaults(args)?;
        let child_scope = self.next_child_scope();
        let mut child = Compiler::new_for_scope(self.filename.clone(), self.symtab, child_scope);
        child.compile_expr(body)?;
        child.emit(Instruction::Return);
        let code = child.finish("<lambda>", 0, CodeFlags::empty(), args.clone());
        let code_idx = self.add_const(ConstantData::Code(Arc::new(code)));
        self.emit(Instruction::LoadConst { idx: code_idx });
        let frees = self.symtab.free_names(child_scope);
        for free in &frees {
            let idx = self.layout.cellfree_idx(free).ok_or_else(|| self.err(format!("unresolved cell/free '{free}'")))?;
            self.emit(Instruction::LoadCell { idx });
        }
        self.emit(Instruction::MakeFunction {
            has_defaults: !args.defaults.is_empty(),
            has_kw_defaults: args.kwonly_defaults.iter().any(|d| d.is_some()),
            num_cells: frees.len() as u32,
            is_generator: false,
        });
        Ok(())
    }

    fn compile_comprehension(&mut self, c: &Comprehension) -> CResult<()> {
        let (generators, kind) = match c {
            Comprehension::List { generators, .. } => (generators, CompKind::List),
            Comprehension::Set { generators, .. } => (generators, CompKind::Set),
            Comprehension::Dict { generators, .. } => (generators, CompKind::Dict),
            Comprehension::Generator { generators, .. } => (generators, CompKind::Generator),
        };
        let first_iter = generators.first().map(|g| g.iter.clone());
        if let Some(iter) = &first_iter {
            self.compile_expr(iter)?;
        } else {
            let idx = self.add_const(ConstantData::None);
            self.emit(Instruction::LoadConst { idx });
        }
        self.emit(Instruction::GetIter);

        let child_scope = self.next_child_scope();
        let mut child = Compiler::new_for_scope(self.filename.clone(), self.symtab, child_scope);
        // The symtable never binds a name for the comprehension's hidden
        // sole argument, so it must be registered into the local layout
        // by hand rather than discovered from the scope tree.
        child.layout.locals.insert(0, ".0".to_owned());
        match kind {
            CompKind::List => {
                child.emit(Instruction::BuildList { count: 0 });
            }
            CompKind::Set => {
                child.emit(Instruction::BuildSet { count: 0 });
            }
            CompKind::Dict => {
                child.emit(Instruction::BuildDict { count: 0 });
            }
            CompKind::Generator => {}
        }
        child.compile_comp_body(generators, c, 0)?;
        if matches!(kind, CompKind::Generator) {
            let none = child.add_const(ConstantData::None);
            child.emit(Instruction::LoadConst { idx: none });
        }
        child.emit(Instruction::Return);

        let is_generator = matches!(kind, CompKind::Generator);
        let flags = if is_generator { CodeFlags::IS_GENERATOR } else { CodeFlags::empty() };
        let mut args = Arguments::empty();
        args.args.push(".0".to_owned());
        let code = child.finish("<comprehension>", 0, flags, args);
        let code_idx = self.add_const(ConstantData::Code(Arc::new(code)));
        self.emit(Instruction::LoadConst { idx: code_idx });
        let frees = self.symtab.free_names(child_scope);
        for free in &frees {
            let idx = self.layout.cellfree_idx(free).ok_or_else(|| self.err(format!("unresolved cell/free '{free}'")))?;
            self.emit(Instruction::LoadCell { idx });
        }
        self.emit(Instruction::MakeFunction { has_defaults: false, has_kw_defaults: false, num_cells: frees.len() as u32, is_generator });
        self.emit(Instruction::RotTwo);
        let names_idx = self.add_const(ConstantData::Tuple(vec![]));
        self.emit(Instruction::Call { argc: 1, kwarg_names_idx: names_idx, unpack_args: false, unpack_kwargs: false });
        Ok(())
    }

    /// Compiles nested `for`/`if` clauses of a comprehension, innermost
    /// body last. `gen_index` 0 consumes the hidden `.0` parameter as its
    /// iterator (already on the stack via `GetIter` in the parent scope,
    /// passed in as the sole positional argument); deeper generators
    /// evaluate their own `iter` expression inline.
    fn compile_comp_body(&mut self, generators: &[CompFor], owner: &Comprehension, gen_index: usize) -> CResult<()> {
        if gen_index == 0 {
            let idx = self.layout.local_idx(".0").unwrap();
            self.emit(Instruction::LoadLocal { idx });
        } else {
            self.compile_expr(&generators[gen_index].iter)?;
            self.emit(Instruction::GetIter);
        }
        let top = self.here();
        let for_iter = self.emit(Instruction::ForIter { target: 0 });
        self.compile_store(&generators[gen_index].target)?;
        for cond in &generators[gen_index].ifs {
            self.compile_expr(cond)?;
            let skip = self.emit(Instruction::JumpIfFalse { target: 0 });
            self.compile_comp_inner(generators, owner, gen_index)?;
            let here = self.here();
            self.patch_jump_target(skip, here);
        }
        if generators[gen_index].ifs.is_empty() {
            self.compile_comp_inner(generators, owner, gen_index)?;
        }
        self.emit(Instruction::Jump { target: top });
        let after = self.here();
        self.patch_jump_target(for_iter, after);
        Ok(())
    }

    fn compile_comp_inner(&mut self, generators: &[CompFor], owner: &Comprehension, gen_index: usize) -> CResult<()> {
        if gen_index + 1 < generators.len() {
            self.compile_comp_body(generators, owner, gen_index + 1)
        } else {
            match owner {
                Comprehension::List { elt, .. } => {
                    self.compile_expr(elt)?;
                    self.emit(Instruction::ListAppend { depth: 0 });
                }
                Comprehension::Set { elt, .. } => {
                    self.compile_expr(elt)?;
                    self.emit(Instruction::SetAdd { depth: 0 });
                }
                Comprehension::Dict { key, value, .. } => {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                    self.emit(Instruction::MapAdd { depth: 0 });
                }
                Comprehension::Generator { elt, .. } => {
                    self.compile_expr(elt)?;
                    self.emit(Instruction::Yield);
                    self.emit(Instruction::Pop);
                }
            }
            Ok(())
        }
    }
}

#[derive(Clone, Copy)]
enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

fn aug_to_binop(op: &AugOp) -> BinOp {
    match op {
        AugOp::Add => BinOp::Add,
        AugOp::Sub => BinOp::Sub,
        AugOp::Mul => BinOp::Mul,
        AugOp::Div => BinOp::Div,
        AugOp::FloorDiv => BinOp::FloorDiv,
        AugOp::Mod => BinOp::Mod,
        AugOp::Pow => BinOp::Pow,
        AugOp::LShift => BinOp::LShift,
        AugOp::RShift => BinOp::RShift,
        AugOp::BitAnd => BinOp::BitAnd,
        AugOp::BitOr => BinOp::BitOr,
        AugOp::BitXor => BinOp::BitXor,
    }
}

fn ast_to_bytecode_cmp(op: &CmpOp) -> pylite_bytecode::CmpOp {
    match op {
        CmpOp::Lt => pylite_bytecode::CmpOp::Lt,
        CmpOp::Le => pylite_bytecode::CmpOp::Le,
        CmpOp::Gt => pylite_bytecode::CmpOp::Gt,
        CmpOp::Ge => pylite_bytecode::CmpOp::Ge,
        CmpOp::Eq => pylite_bytecode::CmpOp::Eq,
        CmpOp::Ne => pylite_bytecode::CmpOp::Ne,
        CmpOp::Is => pylite_bytecode::CmpOp::Is,
        CmpOp::IsNot => pylite_bytecode::CmpOp::IsNot,
        CmpOp::In => pylite_bytecode::CmpOp::In,
        CmpOp::NotIn => pylite_bytecode::CmpOp::NotIn,
    }
}

fn const_eq(a: &ConstantData, b: &ConstantData) -> bool {
    match (a, b) {
        (ConstantData::None, ConstantData::None) => true,
        (ConstantData::Bool(x), ConstantData::Bool(y)) => x == y,
        (ConstantData::Int(x), ConstantData::Int(y)) => x == y,
        (ConstantData::Float(x), ConstantData::Float(y)) => x.to_bits() == y.to_bits(),
        (ConstantData::Str(x), ConstantData::Str(y)) => x == y,
        (ConstantData::Bytes(x), ConstantData::Bytes(y)) => x == y,
        _ => false,
    }
}

