//! Instruction set and code-object representation.
//!
//! A [`CodeObject`] is the immutable output of the compiler: a flat
//! instruction stream operating on a value stack, a constant pool, a name
//! pool, and a local-variable table classified into parameters / locals /
//! cells / free variables. Exception handling is table-driven: a `try`
//! block does not compile to jumps, it compiles to an
//! [`ExceptionTableEntry`] that the VM consults when a `raise` unwinds the
//! frame.

use is_macro::Is;
use std::fmt;
use std::sync::Arc;

/// Binary operators dispatched through `BINARY_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinOp {
    /// The dunder method name consulted first for `a <op> b`.
    pub fn method_name(self) -> &'static str {
        match self {
            BinOp::Add => "__add__",
            BinOp::Sub => "__sub__",
            BinOp::Mul => "__mul__",
            BinOp::Div => "__truediv__",
            BinOp::FloorDiv => "__floordiv__",
            BinOp::Mod => "__mod__",
            BinOp::Pow => "__pow__",
            BinOp::LShift => "__lshift__",
            BinOp::RShift => "__rshift__",
            BinOp::BitAnd => "__and__",
            BinOp::BitOr => "__or__",
            BinOp::BitXor => "__xor__",
        }
    }

    /// The reflected dunder method name, e.g. `__radd__` for `Add`.
    pub fn reflected_method_name(self) -> &'static str {
        match self {
            BinOp::Add => "__radd__",
            BinOp::Sub => "__rsub__",
            BinOp::Mul => "__rmul__",
            BinOp::Div => "__rtruediv__",
            BinOp::FloorDiv => "__rfloordiv__",
            BinOp::Mod => "__rmod__",
            BinOp::Pow => "__rpow__",
            BinOp::LShift => "__rlshift__",
            BinOp::RShift => "__rrshift__",
            BinOp::BitAnd => "__rand__",
            BinOp::BitOr => "__ror__",
            BinOp::BitXor => "__rxor__",
        }
    }

    /// The in-place dunder, e.g. `__iadd__`, tried before falling back to
    /// the plain binary form on `AUGASSIGN`.
    pub fn inplace_method_name(self) -> &'static str {
        match self {
            BinOp::Add => "__iadd__",
            BinOp::Sub => "__isub__",
            BinOp::Mul => "__imul__",
            BinOp::Div => "__itruediv__",
            BinOp::FloorDiv => "__ifloordiv__",
            BinOp::Mod => "__imod__",
            BinOp::Pow => "__ipow__",
            BinOp::LShift => "__ilshift__",
            BinOp::RShift => "__irshift__",
            BinOp::BitAnd => "__iand__",
            BinOp::BitOr => "__ior__",
            BinOp::BitXor => "__ixor__",
        }
    }
}

/// Unary operators dispatched through `UNARY_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Pos,
    Not,
    Invert,
}

/// Comparison operators. Distinct from [`BinOp`] because `==`/`!=` default
/// to identity and `in`/`is` never consult reflected methods the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Is,
    IsNot,
    In,
    NotIn,
}

/// Tags the syntactic form of a `raise` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaiseForm {
    /// Bare `raise` — re-raise the currently handled exception.
    Reraise,
    /// `raise <exc>`.
    Exception,
    /// `raise <exc> from <cause>`.
    ExceptionFrom,
}

/// Distinguishes `with` block bookkeeping from loop bookkeeping on the
/// runtime block stack (see [`crate::Instruction::PushBlock`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Is)]
pub enum BlockKind {
    Loop,
    With,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeFlags: u8 {
        const IS_GENERATOR = 0b0001;
        const HAS_VARARGS  = 0b0010;
        const HAS_KWARGS   = 0b0100;
        /// Reserve an implicit `__class__` cell for zero-argument `super()`.
        const HAS_CLASS_CELL = 0b1000;
    }
}

/// One instruction. Operands are inlined; indices resolve against the
/// owning [`CodeObject`]'s constant/name/local tables.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    LoadConst { idx: u32 },
    LoadLocal { idx: u32 },
    StoreLocal { idx: u32 },
    DeleteLocal { idx: u32 },
    LoadGlobal { name_idx: u32 },
    StoreGlobal { name_idx: u32 },
    DeleteGlobal { name_idx: u32 },
    LoadCell { idx: u32 },
    StoreCell { idx: u32 },
    LoadAttr { name_idx: u32 },
    StoreAttr { name_idx: u32 },
    DeleteAttr { name_idx: u32 },
    LoadSubscr,
    StoreSubscr,
    DeleteSubscr,
    BuildSlice { has_step: bool },

    BinaryOp { op: BinOp },
    InplaceOp { op: BinOp },
    UnaryOp { op: UnOp },
    CompareOp { op: CmpOp },

    BuildList { count: u32 },
    BuildTuple { count: u32 },
    BuildDict { count: u32 },
    BuildSet { count: u32 },
    BuildString { count: u32 },
    ListAppend { depth: u32 },
    SetAdd { depth: u32 },
    MapAdd { depth: u32 },
    /// Pops an iterable and extends the list `depth` slots below the top
    /// with its elements. Used to compile `*expr` items in call arguments.
    ListExtend { depth: u32 },
    /// Pops a mapping and merges its items into the dict `depth` slots
    /// below the top. Used to compile `**expr` items in call keywords.
    DictMerge { depth: u32 },
    /// Pops a list, pushes an equivalent tuple.
    ListToTuple,

    Pop,
    DupTop,
    RotTwo,

    Jump { target: u32 },
    JumpIfFalse { target: u32 },
    JumpIfTrue { target: u32 },
    JumpIfFalseOrPop { target: u32 },
    JumpIfTrueOrPop { target: u32 },

    GetIter,
    ForIter { target: u32 },

    /// Calls the callable pushed before the arguments. When `unpack_args`
    /// is false, `argc` plain positional values precede the call on the
    /// stack and `argc` is their count; when true, a single pre-built
    /// tuple holds all positional arguments instead and `argc` is unused.
    /// Symmetrically, `kwarg_names_idx` indexes a constant tuple of
    /// keyword names (possibly empty) whose length gives the keyword
    /// count when `unpack_kwargs` is false; when true, a single pre-built
    /// dict holds all keyword arguments instead and `kwarg_names_idx` is
    /// unused.
    Call { argc: u32, kwarg_names_idx: u32, unpack_args: bool, unpack_kwargs: bool },
    MakeFunction { has_defaults: bool, has_kw_defaults: bool, num_cells: u32, is_generator: bool },
    MakeClass { bases_count: u32, has_metaclass_kw: bool },

    Return,
    Raise { form: RaiseForm },

    PushBlock { kind: BlockKind, handler: u32 },
    PopBlock,
    WithCleanup,

    Yield,
    YieldFrom,

    ImportName { name_idx: u32 },
    ImportFrom { name_idx: u32 },
    ImportStar,

    LoadSuper,
    CheckExcMatch { types_const_idx: u32 },
    /// Marks the end of a matched handler's own body: pops the
    /// currently-handled exception that a nested `raise` would have
    /// chained onto via `__context__`.
    EndFinally,

    Nop,
}

/// What kind of handler an [`ExceptionTableEntry`] installs.
#[derive(Debug, Clone, PartialEq, Is)]
pub enum HandlerKind {
    /// `except`/`except as` — `type_names` indexes into the constant pool
    /// for a tuple of exception class names to test against, in order.
    Catch { type_names: Vec<u32>, bind_local: Option<u32> },
    /// `except*` — same shape as `Catch` but the VM splits an
    /// `ExceptionGroup` instead of matching the raw exception.
    CatchStar { type_names: Vec<u32>, bind_local: Option<u32> },
    /// `finally` — always runs; the VM remembers the pending action.
    Finally,
}

/// One entry in a frame's exception table: the instruction range
/// `[start, end)` is guarded by `handler` at offset `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionTableEntry {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub kind: HandlerKind,
}

/// A compile-time constant. `Code` constants let nested functions /
/// comprehensions / classes embed their own `CodeObject`.
#[derive(Debug, Clone, Is)]
pub enum ConstantData {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<ConstantData>),
    Code(Arc<CodeObject>),
}

impl fmt::Display for ConstantData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantData::None => write!(f, "None"),
            ConstantData::Bool(b) => write!(f, "{b}"),
            ConstantData::Int(i) => write!(f, "{i}"),
            ConstantData::Float(x) => write!(f, "{x}"),
            ConstantData::Str(s) => write!(f, "{s:?}"),
            ConstantData::Bytes(b) => write!(f, "{b:?}"),
            ConstantData::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            ConstantData::Code(c) => write!(f, "<code {}>", c.name),
        }
    }
}

/// Classification of a name local to a function, per §3 CodeObject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Is)]
pub enum VarKind {
    Parameter,
    Local,
    /// Closed over by an inner scope: storage is a cell.
    Cell,
    /// Captured from an outer scope.
    Free,
    /// Module-global or implicitly global (module/class scope, or an
    /// explicit `global` declaration). Never appears in a `CodeObject`'s
    /// `varnames` table — only returned by scope-resolution queries.
    Global,
}

#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: String,
    pub kind: VarKind,
}

/// Maps an instruction offset to a source line, sparsely (one entry per
/// line change).
#[derive(Debug, Clone, Default)]
pub struct LineTable(pub Vec<(u32, u32)>);

impl LineTable {
    pub fn line_for(&self, offset: u32) -> u32 {
        let mut line = 0;
        for &(off, ln) in &self.0 {
            if off > offset {
                break;
            }
            line = ln;
        }
        line
    }
}

/// The immutable compiled form of a function, module, class body, or
/// comprehension.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub name: String,
    pub filename: String,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<ConstantData>,
    /// Names used for LOAD_GLOBAL/LOAD_ATTR/IMPORT_* etc.
    pub names: Vec<String>,
    pub varnames: Vec<VarInfo>,
    pub line_table: LineTable,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub arg_count: u32,
    pub default_count: u32,
    /// Positional parameter names in declaration order. A name here may
    /// still show up in `varnames` with `VarKind::Cell` rather than
    /// `Parameter`, when an inner scope closes over it — argument binding
    /// needs the name regardless of which storage class it ended up with.
    pub param_names: Vec<String>,
    pub vararg_name: Option<String>,
    pub kwonly_args: Vec<String>,
    /// How many `(name, value)` constant/stack pairs `MakeFunction` should
    /// consume for keyword-only defaults — not all of `kwonly_args`
    /// necessarily have one, so a plain count of `kwonly_args` wouldn't do.
    pub kw_default_count: u32,
    pub kwarg_name: Option<String>,
    pub flags: CodeFlags,
    /// Compile-time estimate of the deepest the value stack grows; the
    /// frame preallocates this many slots.
    pub max_stack_size: u32,
    pub first_line: u32,
}

impl CodeObject {
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::IS_GENERATOR)
    }

    pub fn has_varargs(&self) -> bool {
        self.flags.contains(CodeFlags::HAS_VARARGS)
    }

    pub fn has_kwargs(&self) -> bool {
        self.flags.contains(CodeFlags::HAS_KWARGS)
    }

    /// The innermost handler table entry enclosing `offset`: the entry
    /// whose `[start, end)` range is narrowest among those that contain
    /// it. A narrower range is always nested inside a wider one because
    /// the compiler only ever emits properly-nested `try`/`with` ranges.
    pub fn find_handler(&self, offset: u32) -> Option<&ExceptionTableEntry> {
        self.exception_table
            .iter()
            .filter(|e| offset >= e.start && offset < e.end)
            .min_by_key(|e| e.end - e.start)
    }
}

impl fmt::Display for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<code {} at {}>", self.name, self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_table_finds_enclosing_line() {
        let lt = LineTable(vec![(0, 1), (5, 2), (10, 4)]);
        assert_eq!(lt.line_for(0), 1);
        assert_eq!(lt.line_for(4), 1);
        assert_eq!(lt.line_for(5), 2);
        assert_eq!(lt.line_for(9), 2);
        assert_eq!(lt.line_for(10), 4);
        assert_eq!(lt.line_for(100), 4);
    }

    #[test]
    fn find_handler_picks_innermost_first() {
        let code = CodeObject {
            name: "t".into(),
            filename: "<t>".into(),
            instructions: vec![],
            constants: vec![],
            names: vec![],
            varnames: vec![],
            line_table: LineTable::default(),
            exception_table: vec![
                ExceptionTableEntry { start: 0, end: 10, target: 20, kind: HandlerKind::Finally },
                ExceptionTableEntry {
                    start: 2,
                    end: 6,
                    target: 30,
                    kind: HandlerKind::Catch { type_names: vec![], bind_local: None },
                },
            ],
            arg_count: 0,
            default_count: 0,
            param_names: vec![],
            vararg_name: None,
            kwonly_args: vec![],
            kw_default_count: 0,
            kwarg_name: None,
            flags: CodeFlags::empty(),
            max_stack_size: 0,
            first_line: 1,
        };
        // offset 3 is inside both ranges; the narrower one (2..6) is the
        // innermost and must win even though it's listed second.
        assert_eq!(code.find_handler(3).unwrap().target, 30);
    }
}
