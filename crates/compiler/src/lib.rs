//! Lexer, parser, scope analysis, and code generation for pylite's Python
//! subset (§4.1–§4.3). The only entry point a host or the `pylite-vm` crate
//! needs is [`compile`], which turns source text into a [`CodeObject`]
//! ready for the VM to run, or a list of diagnostics if it doesn't parse.

mod ast;
mod compile;
mod error;
mod fstring;
mod lexer;
mod parser;
mod symtable;
mod token;

pub use ast::{Arguments, Module};
pub use error::{CompileError, CompileErrors, DiagnosticKind};
pub use token::Location;

pub use compile::compile;

/// Parses `source` into an [`ast::Module`] without compiling it. Exposed
/// for tooling (e.g. a host that wants to pretty-print or lint a module)
/// that doesn't need a `CodeObject`.
pub fn parse(source: &str, filename: &str) -> Result<Module, CompileError> {
    parser::parse_module(source, filename)
}
