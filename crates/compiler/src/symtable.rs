//! Scope analysis: classifies every name a function, lambda, comprehension,
//! or class body touches as a parameter, plain local, free variable, cell,
//! or global (§3 CodeObject, §4.2 compiler overview).
//!
//! Built as a tree of [`RawScope`]s by walking the AST once. A second pass
//! resolves free/cell relationships by walking each scope's unbound names
//! up through its enclosing function scopes (class bodies are transparent
//! to `nonlocal`/closures, matching Python).

use crate::ast::*;
use indexmap::IndexSet;
use pylite_bytecode::VarKind;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Lambda,
    Class,
    Comprehension,
}

#[derive(Debug)]
struct RawScope {
    kind: ScopeKind,
    parent: Option<usize>,
    /// Names bound by assignment, `def`/`class`, `for`, `with ... as`,
    /// `except ... as`, `import`, or parameters, in first-seen order.
    bound: IndexSet<String>,
    explicit_global: HashSet<String>,
    explicit_nonlocal: HashSet<String>,
    used: IndexSet<String>,
    cells: HashSet<String>,
    frees: HashSet<String>,
    children: Vec<usize>,
}

pub struct SymTable {
    scopes: Vec<RawScope>,
}

impl SymTable {
    pub fn kind_of(&self, scope: usize, name: &str) -> VarKind {
        let s = &self.scopes[scope];
        if s.explicit_global.contains(name) {
            return VarKind::Global;
        }
        if matches!(s.kind, ScopeKind::Module) {
            return VarKind::Global;
        }
        if s.cells.contains(name) {
            return VarKind::Cell;
        }
        if s.frees.contains(name) {
            return VarKind::Free;
        }
        if s.bound.contains(name) {
            if matches!(s.kind, ScopeKind::Class) {
                return VarKind::Local;
            }
            return VarKind::Local;
        }
        VarKind::Global
    }

    pub fn child(&self, scope: usize, which: usize) -> usize {
        self.scopes[scope].children[which]
    }

    pub fn bound_names(&self, scope: usize) -> Vec<String> {
        self.scopes[scope].bound.iter().cloned().collect()
    }

    pub fn cell_names(&self, scope: usize) -> Vec<String> {
        let mut v: Vec<String> = self.scopes[scope].cells.iter().cloned().collect();
        v.sort();
        v
    }

    pub fn free_names(&self, scope: usize) -> Vec<String> {
        let mut v: Vec<String> = self.scopes[scope].frees.iter().cloned().collect();
        v.sort();
        v
    }

    pub fn kind(&self, scope: usize) -> ScopeKind {
        self.scopes[scope].kind
    }
}

pub const MODULE_SCOPE: usize = 0;

pub fn build(module: &Module) -> SymTable {
    let mut scopes = vec![RawScope {
        kind: ScopeKind::Module,
        parent: None,
        bound: IndexSet::new(),
        explicit_global: HashSet::new(),
        explicit_nonlocal: HashSet::new(),
        used: IndexSet::new(),
        cells: HashSet::new(),
        frees: HashSet::new(),
        children: Vec::new(),
    }];
    visit_stmts(&module.body, &mut scopes, MODULE_SCOPE);
    resolve(&mut scopes);
    SymTable { scopes }
}

fn new_scope(scopes: &mut Vec<RawScope>, kind: ScopeKind, parent: usize) -> usize {
    scopes.push(RawScope {
        kind,
        parent: Some(parent),
        bound: IndexSet::new(),
        explicit_global: HashSet::new(),
        explicit_nonlocal: HashSet::new(),
        used: IndexSet::new(),
        cells: HashSet::new(),
        frees: HashSet::new(),
        children: Vec::new(),
    });
    let idx = scopes.len() - 1;
    scopes[parent].children.push(idx);
    idx
}

fn bind(scopes: &mut [RawScope], scope: usize, name: &str) {
    scopes[scope].bound.insert(name.to_owned());
}

fn use_name(scopes: &mut [RawScope], scope: usize, name: &str) {
    scopes[scope].used.insert(name.to_owned());
}

fn visit_stmts(stmts: &[Stmt], scopes: &mut Vec<RawScope>, scope: usize) {
    for s in stmts {
        visit_stmt(s, scopes, scope);
    }
}

fn visit_stmt(s: &Stmt, scopes: &mut Vec<RawScope>, scope: usize) {
    match s {
        Stmt::Expr(e) => visit_expr(e, scopes, scope),
        Stmt::Assign { targets, value } => {
            visit_expr(value, scopes, scope);
            for t in targets {
                visit_target(t, scopes, scope);
            }
        }
        Stmt::AugAssign { target, value, .. } => {
            visit_expr(value, scopes, scope);
            visit_target(target, scopes, scope);
            visit_expr(target, scopes, scope);
        }
        Stmt::AnnAssign { target, value } => {
            if let Some(v) = value {
                visit_expr(v, scopes, scope);
            }
            visit_target(target, scopes, scope);
        }
        Stmt::Return(e) => {
            if let Some(e) = e {
                visit_expr(e, scopes, scope);
            }
        }
        Stmt::Pass | Stmt::Break | Stmt::Continue => {}
        Stmt::Delete(targets) => {
            for t in targets {
                visit_expr(t, scopes, scope);
            }
        }
        Stmt::Global(names) => {
            for n in names {
                scopes[scope].explicit_global.insert(n.clone());
            }
        }
        Stmt::Nonlocal(names) => {
            for n in names {
                scopes[scope].explicit_nonlocal.insert(n.clone());
            }
        }
        Stmt::Assert { test, msg } => {
            visit_expr(test, scopes, scope);
            if let Some(m) = msg {
                visit_expr(m, scopes, scope);
            }
        }
        Stmt::Raise { exc, cause } => {
            if let Some(e) = exc {
                visit_expr(e, scopes, scope);
            }
            if let Some(c) = cause {
                visit_expr(c, scopes, scope);
            }
        }
        Stmt::If { test, body, orelse } => {
            visit_expr(test, scopes, scope);
            visit_stmts(body, scopes, scope);
            visit_stmts(orelse, scopes, scope);
        }
        Stmt::While { test, body, orelse } => {
            visit_expr(test, scopes, scope);
            visit_stmts(body, scopes, scope);
            visit_stmts(orelse, scopes, scope);
        }
        Stmt::For { target, iter, body, orelse } => {
            visit_expr(iter, scopes, scope);
            visit_target(target, scopes, scope);
            visit_stmts(body, scopes, scope);
            visit_stmts(orelse, scopes, scope);
        }
        Stmt::Try { body, handlers, orelse, finalbody } => {
            visit_stmts(body, scopes, scope);
            for h in handlers {
                for t in &h.types {
                    visit_expr(t, scopes, scope);
                }
                if let Some(n) = &h.name {
                    bind(scopes, scope, n);
                }
                visit_stmts(&h.body, scopes, scope);
            }
            visit_stmts(orelse, scopes, scope);
            visit_stmts(finalbody, scopes, scope);
        }
        Stmt::With { items, body } => {
            for it in items {
                visit_expr(&it.context_expr, scopes, scope);
                if let Some(t) = &it.optional_vars {
                    visit_target(t, scopes, scope);
                }
            }
            visit_stmts(body, scopes, scope);
        }
        Stmt::FunctionDef(f) => {
            bind(scopes, scope, &f.name);
            for d in &f.decorators {
                visit_expr(d, scopes, scope);
            }
            for d in &f.args.defaults {
                visit_expr(d, scopes, scope);
            }
            for d in f.args.kwonly_defaults.iter().flatten() {
                visit_expr(d, scopes, scope);
            }
            let child = new_scope(scopes, ScopeKind::Function, scope);
            for a in &f.args.args {
                bind(scopes, child, a);
            }
            for a in &f.args.kwonly_args {
                bind(scopes, child, a);
            }
            if let Some(v) = &f.args.vararg {
                bind(scopes, child, v);
            }
            if let Some(k) = &f.args.kwarg {
                bind(scopes, child, k);
            }
            visit_stmts(&f.body, scopes, child);
        }
        Stmt::ClassDef(c) => {
            bind(scopes, scope, &c.name);
            for b in &c.bases {
                visit_expr(b, scopes, scope);
            }
            for (_, v) in &c.keywords {
                visit_expr(v, scopes, scope);
            }
            for d in &c.decorators {
                visit_expr(d, scopes, scope);
            }
            let child = new_scope(scopes, ScopeKind::Class, scope);
            visit_stmts(&c.body, scopes, child);
        }
        Stmt::Import { names } => {
            for (module, alias) in names {
                let bound_name = alias.clone().unwrap_or_else(|| module.split('.').next().unwrap().to_owned());
                bind(scopes, scope, &bound_name);
            }
        }
        Stmt::ImportFrom { names, is_star, .. } => {
            if *is_star {
                return;
            }
            for (name, alias) in names {
                bind(scopes, scope, alias.as_deref().unwrap_or(name));
            }
        }
    }
}

/// A target appears on the left of `=`, as a `for` loop variable, or after
/// `as`; walking it both binds `Name`s and visits any subscript/attribute
/// sub-expressions that are themselves reads (e.g. `obj.attr = x` reads
/// `obj`).
fn visit_target(e: &Expr, scopes: &mut Vec<RawScope>, scope: usize) {
    match e {
        Expr::Name(n) => bind(scopes, scope, n),
        Expr::Tuple(items) | Expr::List(items) => {
            for i in items {
                visit_target(i, scopes, scope);
            }
        }
        Expr::Starred(inner) => visit_target(inner, scopes, scope),
        Expr::Attribute { value, .. } => visit_expr(value, scopes, scope),
        Expr::Subscript { value, slice } => {
            visit_expr(value, scopes, scope);
            visit_expr(slice, scopes, scope);
        }
        _ => visit_expr(e, scopes, scope),
    }
}

fn visit_expr(e: &Expr, scopes: &mut Vec<RawScope>, scope: usize) {
    match e {
        Expr::None | Expr::True | Expr::False | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bytes(_) => {}
        Expr::FString(parts) => {
            for p in parts {
                if let FStringPart::Expr { expr, .. } = p {
                    visit_expr(expr, scopes, scope);
                }
            }
        }
        Expr::Name(n) => use_name(scopes, scope, n),
        Expr::Tuple(items) | Expr::List(items) | Expr::Set(items) => {
            for i in items {
                visit_expr(i, scopes, scope);
            }
        }
        Expr::Dict(pairs) => {
            for (k, v) in pairs {
                if let Some(k) = k {
                    visit_expr(k, scopes, scope);
                }
                visit_expr(v, scopes, scope);
            }
        }
        Expr::Starred(inner) => visit_expr(inner, scopes, scope),
        Expr::BoolOp { values, .. } => {
            for v in values {
                visit_expr(v, scopes, scope);
            }
        }
        Expr::BinOp { left, right, .. } => {
            visit_expr(left, scopes, scope);
            visit_expr(right, scopes, scope);
        }
        Expr::UnaryOp { operand, .. } => visit_expr(operand, scopes, scope),
        Expr::Compare { left, comparators, .. } => {
            visit_expr(left, scopes, scope);
            for c in comparators {
                visit_expr(c, scopes, scope);
            }
        }
        Expr::Call { func, args, keywords } => {
            visit_expr(func, scopes, scope);
            for a in args {
                visit_expr(a, scopes, scope);
            }
            for (_, v) in keywords {
                visit_expr(v, scopes, scope);
            }
        }
        Expr::Attribute { value, .. } => visit_expr(value, scopes, scope),
        Expr::Subscript { value, slice } => {
            visit_expr(value, scopes, scope);
            visit_expr(slice, scopes, scope);
        }
        Expr::Slice { lower, upper, step } => {
            if let Some(e) = lower {
                visit_expr(e, scopes, scope);
            }
            if let Some(e) = upper {
                visit_expr(e, scopes, scope);
            }
            if let Some(e) = step {
                visit_expr(e, scopes, scope);
            }
        }
        Expr::IfExp { test, body, orelse } => {
            visit_expr(test, scopes, scope);
            visit_expr(body, scopes, scope);
            visit_expr(orelse, scopes, scope);
        }
        Expr::Lambda { args, body } => {
            for d in &args.defaults {
                visit_expr(d, scopes, scope);
            }
            for d in args.kwonly_defaults.iter().flatten() {
                visit_expr(d, scopes, scope);
            }
            let child = new_scope(scopes, ScopeKind::Lambda, scope);
            for a in &args.args {
                bind(scopes, child, a);
            }
            for a in &args.kwonly_args {
                bind(scopes, child, a);
            }
            if let Some(v) = &args.vararg {
                bind(scopes, child, v);
            }
            if let Some(k) = &args.kwarg {
                bind(scopes, child, k);
            }
            visit_expr(body, scopes, child);
        }
        Expr::Comp(c) => visit_comprehension(c, scopes, scope),
        Expr::Yield(e) => {
            if let Some(e) = e {
                visit_expr(e, scopes, scope);
            }
        }
        Expr::YieldFrom(e) => visit_expr(e, scopes, scope),
        Expr::Await(e) => visit_expr(e, scopes, scope),
        Expr::NamedExpr { target, value } => {
            visit_expr(value, scopes, scope);
            visit_target(target, scopes, scope);
        }
    }
}

fn visit_comprehension(c: &Comprehension, scopes: &mut Vec<RawScope>, scope: usize) {
    let (generators, elt_exprs): (&[CompFor], Vec<&Expr>) = match c {
        Comprehension::List { elt, generators } => (generators, vec![elt]),
        Comprehension::Set { elt, generators } => (generators, vec![elt]),
        Comprehension::Generator { elt, generators } => (generators, vec![elt]),
        Comprehension::Dict { key, value, generators } => (generators, vec![key, value]),
    };
    // The outermost iterable is evaluated in the enclosing scope; Python
    // passes it in as the comprehension function's sole argument.
    if let Some(first) = generators.first() {
        visit_expr(&first.iter, scopes, scope);
    }
    let child = new_scope(scopes, ScopeKind::Comprehension, scope);
    for (i, gen) in generators.iter().enumerate() {
        visit_target(&gen.target, scopes, child);
        if i > 0 {
            visit_expr(&gen.iter, scopes, child);
        }
        for cond in &gen.ifs {
            visit_expr(cond, scopes, child);
        }
    }
    for e in elt_exprs {
        visit_expr(e, scopes, child);
    }
}

fn resolve(scopes: &mut Vec<RawScope>) {
    let n = scopes.len();
    for idx in 0..n {
        let names: Vec<String> = scopes[idx]
            .used
            .iter()
            .filter(|n| !scopes[idx].bound.contains(*n) && !scopes[idx].explicit_global.contains(*n))
            .cloned()
            .collect();
        for name in names {
            mark_free_chain(scopes, idx, &name);
        }
        let nonlocals: Vec<String> = scopes[idx].explicit_nonlocal.iter().cloned().collect();
        for name in nonlocals {
            mark_free_chain(scopes, idx, &name);
        }
    }
}

/// Walks from `start` up through enclosing scopes (skipping class bodies,
/// which are not valid closure targets) looking for a scope that binds
/// `name`. If found, that scope's variable becomes a cell and every
/// function scope on the path (including `start`) gets it marked free.
fn mark_free_chain(scopes: &mut [RawScope], start: usize, name: &str) {
    let mut chain = vec![start];
    let mut cur = start;
    loop {
        let parent = match scopes[cur].parent {
            Some(p) => p,
            None => return,
        };
        if scopes[parent].kind == ScopeKind::Class {
            cur = parent;
            continue;
        }
        if matches!(scopes[parent].kind, ScopeKind::Module) {
            return;
        }
        if scopes[parent].bound.contains(name) {
            scopes[parent].cells.insert(name.to_owned());
            for &c in &chain {
                scopes[c].frees.insert(name.to_owned());
            }
            return;
        }
        chain.push(parent);
        cur = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn closure_variable_becomes_cell_and_free() {
        let m = parse_module("def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n", "<t>").unwrap();
        let st = build(&m);
        // outer is scopes[1] (module=0, outer=1, inner=2)
        assert_eq!(st.kind_of(1, "x"), VarKind::Cell);
        assert_eq!(st.kind_of(2, "x"), VarKind::Free);
    }

    #[test]
    fn global_declaration_is_honored() {
        let m = parse_module("def f():\n    global x\n    x = 1\n", "<t>").unwrap();
        let st = build(&m);
        assert_eq!(st.kind_of(1, "x"), VarKind::Global);
    }

    #[test]
    fn plain_local_stays_local() {
        let m = parse_module("def f():\n    y = 1\n    return y\n", "<t>").unwrap();
        let st = build(&m);
        assert_eq!(st.kind_of(1, "y"), VarKind::Local);
    }

    #[test]
    fn class_body_does_not_leak_into_nested_method_closure() {
        let src = "class C:\n    x = 1\n    def m(self):\n        return x\n";
        let m = parse_module(src, "<t>").unwrap();
        let st = build(&m);
        // `x` inside `m` cannot see the class body's `x`; it resolves as
        // a module global instead, matching Python's own scoping rule.
        let class_idx = 1;
        let method_idx = 2;
        assert_eq!(st.kind(class_idx), ScopeKind::Class);
        assert_eq!(st.kind_of(method_idx, "x"), VarKind::Global);
    }
}
