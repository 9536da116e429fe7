//! The frame interpreter loop (§4.5). One [`Frame`] per live Python call;
//! calling a function recurses through Rust's own call stack (bounded by
//! the governor's recursion cap), except for generators, whose frame
//! outlives any single `execute` call and is driven by `next()`/`send()`
//! (see [`crate::generator`]).
//!
//! Exception unwinding is table-driven (§4.5, §7): `PushBlock`/`PopBlock`
//! track `with`/loop bookkeeping on `block_stack`, a structure separate
//! from the value stack. When an instruction raises, the VM (not any
//! single instruction) consults `CodeObject::find_handler` for the
//! innermost table entry covering the instruction that raised, stores the
//! exception in `active_exception`, pushes it onto the value stack for a
//! handler to bind, and jumps to the handler's target. `Raise::Reraise`
//! reads `active_exception` directly rather than the value stack, since
//! `Frame::stack` is a plain growable `Vec` and not the fixed-depth array
//! the compiler's stack-effect table assumes.

use crate::exceptions::{new_exception, vm_name_error, vm_recursion_error, vm_type_error};
use crate::function::{Cell, PyFunction};
use crate::host::{PyResult, VirtualMachine, VmError};
use crate::object_protocol;
use crate::value::{PyObjectRef, PyPayload};
use indexmap::IndexMap;
use pylite_bytecode::{BinOp, BlockKind, CmpOp, CodeObject, ConstantData, HandlerKind, Instruction, RaiseForm, UnOp, VarKind};
use std::cell::RefCell;
use std::rc::Rc;

pub enum FrameStep {
    Return(PyObjectRef),
    Yield(PyObjectRef),
}

enum BlockEntry {
    Loop,
    With { manager: PyObjectRef },
}

pub struct Frame {
    code: Rc<CodeObject>,
    locals: Vec<Option<PyObjectRef>>,
    cellfree: Vec<Cell>,
    globals: Rc<RefCell<IndexMap<String, PyObjectRef>>>,
    module_name: String,
    class_cell: Option<Cell>,
    stack: Vec<PyObjectRef>,
    ip: u32,
    block_stack: Vec<BlockEntry>,
    active_exception: Option<PyObjectRef>,
    in_star_handler: bool,
    /// Exceptions whose handler bodies are currently executing, innermost
    /// last — gives a freshly raised exception's implicit `__context__`
    /// (§9 "set implicitly whenever an exception is raised while another
    /// is being handled"). Pushed on a successful `CheckExcMatch`, popped
    /// by the `EndFinally` emitted at the end of each handler body.
    handling_stack: Vec<PyObjectRef>,
    /// The sub-iterator a `yield from` is currently delegating to, held
    /// here rather than on the value stack so each resume only carries
    /// the value being sent in, not the iterator itself.
    yield_from_delegate: Option<PyObjectRef>,
}

impl Frame {
    pub fn new(
        code: Rc<CodeObject>,
        locals: Vec<Option<PyObjectRef>>,
        cellfree: Vec<Cell>,
        globals: Rc<RefCell<IndexMap<String, PyObjectRef>>>,
        module_name: String,
        class_cell: Option<Cell>,
    ) -> Self {
        Frame {
            code,
            locals,
            cellfree,
            globals,
            module_name,
            class_cell,
            stack: Vec::new(),
            ip: 0,
            block_stack: Vec::new(),
            active_exception: None,
            in_star_handler: false,
            handling_stack: Vec::new(),
            yield_from_delegate: None,
        }
    }

    /// Binds `args` against `func`'s calling convention, then builds the
    /// `[cells..., frees...]` array `LoadCell`/`StoreCell` address: the
    /// leading slots are this call's own cell-kind locals (fresh, empty
    /// cells bound by `bind_arguments`' `cell_init`), the trailing slots
    /// are `func.closure`, captured from the defining frame.
    pub fn for_call(vm: &mut VirtualMachine, func: &PyFunction, args: &crate::function::CallArgs) -> PyResult<Self> {
        let bound = crate::function::bind_arguments(vm, func, args)?;
        let n_locals = crate::function::locals_count(&func.code);
        let n_cells = func.code.varnames.len() - n_locals;
        let n_cell_only = n_cells - func.closure.len();
        let mut cellfree: Vec<Cell> = (0..n_cell_only).map(|_| Cell::new(None)).collect();
        cellfree.extend(func.closure.iter().cloned());
        for (idx, value) in bound.cell_init {
            cellfree[idx].set(value);
        }
        Ok(Frame::new(
            func.code.clone(),
            bound.locals,
            cellfree,
            vm.globals_for_module(&func.module_name),
            func.module_name.clone(),
            func.class_cell.clone(),
        ))
    }

    pub fn push_value(&mut self, v: PyObjectRef) {
        self.stack.push(v);
    }

    pub fn resume_execute(&mut self, vm: &mut VirtualMachine) -> PyResult<FrameStep> {
        self.run(vm)
    }

    pub fn execute(mut self, vm: &mut VirtualMachine) -> PyResult<PyObjectRef> {
        match self.run(vm)? {
            FrameStep::Return(v) => Ok(v),
            FrameStep::Yield(_) => unreachable!("a non-generator CodeObject cannot contain Yield"),
        }
    }

    fn const_at(&self, idx: u32) -> ConstantData {
        self.code.constants[idx as usize].clone()
    }

    fn name_at(&self, idx: u32) -> String {
        self.code.names[idx as usize].clone()
    }

    fn pop(&mut self) -> PyObjectRef {
        self.stack.pop().expect("stack underflow: compiler-emitted bytecode is balanced")
    }

    fn top(&self) -> PyObjectRef {
        self.stack.last().expect("stack underflow: compiler-emitted bytecode is balanced").clone()
    }

    fn pop_n(&mut self, n: usize) -> Vec<PyObjectRef> {
        let at = self.stack.len() - n;
        self.stack.split_off(at)
    }

    fn run(&mut self, vm: &mut VirtualMachine) -> PyResult<FrameStep> {
        vm.governor_mut().enter_call().map_err(|_| vm_recursion_error(vm, "maximum recursion depth exceeded"))?;
        let result = self.run_inner(vm);
        vm.governor_mut().exit_call();
        result
    }

    fn run_inner(&mut self, vm: &mut VirtualMachine) -> PyResult<FrameStep> {
        loop {
            if self.ip as usize >= self.code.instructions.len() {
                return Ok(FrameStep::Return(vm.none()));
            }
            vm.governor_mut().tick().map_err(|trip| governor_trip_exception(vm, trip))?;
            let instr = self.code.instructions[self.ip as usize].clone();
            self.ip += 1;
            match self.step(vm, &instr) {
                Ok(Some(step)) => return Ok(step),
                Ok(None) => continue,
                Err(VmError::Raised(exc)) => match self.dispatch_exception(exc) {
                    Some(()) => continue,
                    None => return Err(VmError::Raised(self.active_exception.take().unwrap())),
                },
            }
        }
    }

    /// On a raise, finds the innermost handler covering the instruction
    /// that raised and resumes there; with no handler, leaves
    /// `active_exception` set so the caller can propagate it.
    fn dispatch_exception(&mut self, exc: PyObjectRef) -> Option<()> {
        let raise_at = self.ip - 1;
        match self.code.find_handler(raise_at) {
            Some(entry) => {
                self.in_star_handler = matches!(entry.kind, HandlerKind::CatchStar { .. });
                self.active_exception = Some(exc.clone());
                self.stack.push(exc);
                self.ip = entry.target;
                Some(())
            }
            None => {
                self.active_exception = Some(exc);
                None
            }
        }
    }

    fn step(&mut self, vm: &mut VirtualMachine, instr: &Instruction) -> PyResult<Option<FrameStep>> {
        match instr {
            Instruction::LoadConst { idx } => {
                let v = load_const(vm, &self.const_at(*idx));
                self.stack.push(v);
            }
            Instruction::LoadLocal { idx } => {
                let v = self.locals[*idx as usize]
                    .clone()
                    .ok_or_else(|| vm_name_error(vm, &format!("local variable '{}' referenced before assignment", self.code.varnames[*idx as usize].name)))?;
                self.stack.push(v);
            }
            Instruction::StoreLocal { idx } => {
                let v = self.pop();
                self.locals[*idx as usize] = Some(v);
            }
            Instruction::DeleteLocal { idx } => {
                self.locals[*idx as usize] = None;
            }
            Instruction::LoadGlobal { name_idx } => {
                let name = self.name_at(*name_idx);
                let v = self
                    .globals
                    .borrow()
                    .get(&name)
                    .cloned()
                    .or_else(|| vm.builtin(&name))
                    .ok_or_else(|| vm_name_error(vm, &format!("name '{name}' is not defined")))?;
                self.stack.push(v);
            }
            Instruction::StoreGlobal { name_idx } => {
                let v = self.pop();
                let name = self.name_at(*name_idx);
                self.globals.borrow_mut().insert(name, v);
            }
            Instruction::DeleteGlobal { name_idx } => {
                let name = self.name_at(*name_idx);
                if self.globals.borrow_mut().shift_remove(&name).is_none() {
                    return Err(vm_name_error(vm, &format!("name '{name}' is not defined")));
                }
            }
            Instruction::LoadCell { idx } => {
                let v = self.cellfree[*idx as usize]
                    .get()
                    .ok_or_else(|| vm_name_error(vm, "free variable referenced before assignment in enclosing scope"))?;
                self.stack.push(v);
            }
            Instruction::StoreCell { idx } => {
                let v = self.pop();
                self.cellfree[*idx as usize].set(v);
            }
            Instruction::LoadAttr { name_idx } => {
                let obj = self.pop();
                let name = self.name_at(*name_idx);
                let v = object_protocol::get_attribute(vm, &obj, &name)?;
                self.stack.push(v);
            }
            Instruction::StoreAttr { name_idx } => {
                let obj = self.pop();
                let v = self.pop();
                let name = self.name_at(*name_idx);
                object_protocol::set_attribute(vm, &obj, &name, v)?;
            }
            Instruction::DeleteAttr { name_idx } => {
                let obj = self.pop();
                let name = self.name_at(*name_idx);
                object_protocol::delete_attribute(vm, &obj, &name)?;
            }
            Instruction::LoadSubscr => {
                let index = self.pop();
                let obj = self.pop();
                let v = vm.getitem(&obj, &index)?;
                self.stack.push(v);
            }
            Instruction::StoreSubscr => {
                let index = self.pop();
                let obj = self.pop();
                let v = self.pop();
                vm.setitem(&obj, &index, v)?;
            }
            Instruction::DeleteSubscr => {
                let index = self.pop();
                let obj = self.pop();
                vm.delitem(&obj, &index)?;
            }
            Instruction::BuildSlice { has_step } => {
                let step = if *has_step { Some(self.pop()) } else { None };
                let stop = self.pop();
                let start = self.pop();
                self.stack.push(vm.new_slice(start, stop, step));
            }
            Instruction::BinaryOp { op } => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.stack.push(binary_op(vm, *op, &lhs, &rhs)?);
            }
            Instruction::InplaceOp { op } => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.stack.push(inplace_op(vm, *op, &lhs, &rhs)?);
            }
            Instruction::UnaryOp { op } => {
                let v = self.pop();
                self.stack.push(unary_op(vm, *op, &v)?);
            }
            Instruction::CompareOp { op } => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.stack.push(compare_op(vm, *op, &lhs, &rhs)?);
            }
            Instruction::BuildList { count } => {
                let items = self.pop_n(*count as usize);
                self.stack.push(vm.new_list(items));
            }
            Instruction::BuildTuple { count } => {
                let items = self.pop_n(*count as usize);
                self.stack.push(vm.new_tuple(items));
            }
            Instruction::BuildDict { count } => {
                let pairs = self.pop_n(2 * *count as usize);
                let dict = vm.new_dict();
                if let PyPayload::Dict(d) = &dict.payload {
                    for pair in pairs.chunks(2) {
                        d.borrow_mut().insert(vm, pair[0].clone(), pair[1].clone())?;
                    }
                }
                self.stack.push(dict);
            }
            Instruction::BuildSet { count } => {
                let items = self.pop_n(*count as usize);
                let set = vm.new_set();
                if let PyPayload::Set(d) = &set.payload {
                    for item in items {
                        crate::dict::set_insert(&mut d.borrow_mut(), vm, item)?;
                    }
                }
                self.stack.push(set);
            }
            Instruction::BuildString { count } => {
                let items = self.pop_n(*count as usize);
                let joined: String = items.iter().map(|v| vm.to_display_string(v)).collect();
                self.stack.push(vm.new_str(joined));
            }
            Instruction::ListAppend { depth } => {
                let v = self.pop();
                let at = self.stack.len() - *depth as usize;
                let PyPayload::List(items) = &self.stack[at - 1].payload else { unreachable!() };
                items.borrow_mut().push(v);
            }
            Instruction::SetAdd { depth } => {
                let v = self.pop();
                let at = self.stack.len() - *depth as usize;
                let PyPayload::Set(d) = &self.stack[at - 1].payload else { unreachable!() };
                crate::dict::set_insert(&mut d.borrow_mut(), vm, v)?;
            }
            Instruction::MapAdd { depth } => {
                let v = self.pop();
                let k = self.pop();
                let at = self.stack.len() - *depth as usize;
                let PyPayload::Dict(d) = &self.stack[at - 1].payload else { unreachable!() };
                d.borrow_mut().insert(vm, k, v)?;
            }
            Instruction::ListExtend { depth } => {
                let iterable = self.pop();
                let at = self.stack.len() - *depth as usize;
                let extra = vm.iterable_to_vec(&iterable)?;
                let PyPayload::List(items) = &self.stack[at - 1].payload else { unreachable!() };
                items.borrow_mut().extend(extra);
            }
            Instruction::DictMerge { depth } => {
                let mapping = self.pop();
                let at = self.stack.len() - *depth as usize;
                let pairs = vm.mapping_to_pairs(&mapping)?;
                let PyPayload::Dict(d) = &self.stack[at - 1].payload else { unreachable!() };
                for (k, v) in pairs {
                    d.borrow_mut().insert(vm, k, v)?;
                }
            }
            Instruction::ListToTuple => {
                let v = self.pop();
                let PyPayload::List(items) = &v.payload else { unreachable!() };
                let cloned = items.borrow().clone();
                self.stack.push(vm.new_tuple(cloned));
            }
            Instruction::Pop => {
                self.pop();
            }
            Instruction::DupTop => {
                let v = self.top();
                self.stack.push(v);
            }
            Instruction::RotTwo => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Instruction::Jump { target } => self.ip = *target,
            Instruction::JumpIfFalse { target } => {
                let v = self.pop();
                if !vm.is_truthy(&v)? {
                    self.ip = *target;
                }
            }
            Instruction::JumpIfTrue { target } => {
                let v = self.pop();
                if vm.is_truthy(&v)? {
                    self.ip = *target;
                }
            }
            Instruction::JumpIfFalseOrPop { target } => {
                if !vm.is_truthy(&self.top())? {
                    self.ip = *target;
                } else {
                    self.pop();
                }
            }
            Instruction::JumpIfTrueOrPop { target } => {
                if vm.is_truthy(&self.top())? {
                    self.ip = *target;
                } else {
                    self.pop();
                }
            }
            Instruction::GetIter => {
                let v = self.pop();
                self.stack.push(crate::iterator::get_iter(vm, &v)?);
            }
            Instruction::ForIter { target } => {
                let iter = self.top();
                match crate::iterator::next_value(vm, &iter)? {
                    Some(v) => self.stack.push(v),
                    None => {
                        self.pop();
                        self.ip = *target;
                    }
                }
            }
            Instruction::Call { argc, kwarg_names_idx, unpack_args, unpack_kwargs } => {
                self.exec_call(vm, *argc, *kwarg_names_idx, *unpack_args, *unpack_kwargs)?;
            }
            Instruction::MakeFunction { has_defaults, has_kw_defaults, num_cells, is_generator } => {
                self.exec_make_function(vm, *has_defaults, *has_kw_defaults, *num_cells, *is_generator)?;
            }
            Instruction::MakeClass { bases_count, has_metaclass_kw } => {
                self.exec_make_class(vm, *bases_count, *has_metaclass_kw)?;
            }
            Instruction::Return => {
                let v = self.pop();
                return Ok(Some(FrameStep::Return(v)));
            }
            Instruction::Raise { form } => {
                self.exec_raise(vm, *form)?;
            }
            Instruction::PushBlock { kind, handler: _ } => {
                self.exec_push_block(vm, *kind)?;
            }
            Instruction::PopBlock => {
                self.block_stack.pop();
            }
            Instruction::WithCleanup => {
                self.exec_with_cleanup(vm)?;
            }
            Instruction::Yield => {
                let v = self.pop();
                return Ok(Some(FrameStep::Yield(v)));
            }
            Instruction::YieldFrom => {
                return self.exec_yield_from(vm);
            }
            Instruction::ImportName { name_idx } => {
                let name = self.name_at(*name_idx);
                let fromlist = self.pop();
                let _level = self.pop();
                let module = vm.import_module(&name, &fromlist)?;
                self.stack.push(module);
            }
            Instruction::ImportFrom { name_idx } => {
                let module = self.top();
                let name = self.name_at(*name_idx);
                let v = vm.import_from(&module, &name)?;
                self.stack.push(v);
            }
            Instruction::ImportStar => {
                let module = self.pop();
                vm.import_star(&module, &self.globals)?;
            }
            Instruction::LoadSuper => {
                let v = self.exec_load_super(vm)?;
                self.stack.push(v);
            }
            Instruction::CheckExcMatch { types_const_idx } => {
                let result = self.exec_check_exc_match(vm, *types_const_idx)?;
                self.stack.push(vm.new_bool(result));
            }
            Instruction::EndFinally => {
                self.handling_stack.pop();
            }
            Instruction::Nop => {}
        }
        Ok(None)
    }

    fn exec_call(&mut self, vm: &mut VirtualMachine, argc: u32, kwarg_names_idx: u32, unpack_args: bool, unpack_kwargs: bool) -> PyResult<()> {
        let kwargs_dict = if unpack_kwargs { Some(self.pop()) } else { None };
        let kwarg_names: Vec<String> = if unpack_kwargs {
            vec![]
        } else {
            match self.const_at(kwarg_names_idx) {
                ConstantData::Tuple(names) => names
                    .iter()
                    .map(|c| match c {
                        ConstantData::Str(s) => s.clone(),
                        _ => unreachable!(),
                    })
                    .collect(),
                _ => vec![],
            }
        };
        let mut keywords = Vec::new();
        if let Some(dict) = &kwargs_dict {
            for (k, v) in vm.mapping_to_pairs(dict)? {
                keywords.push((vm.to_display_string(&k), v));
            }
        } else if !kwarg_names.is_empty() {
            let values = self.pop_n(kwarg_names.len());
            for (name, value) in kwarg_names.into_iter().zip(values) {
                keywords.push((name, value));
            }
        }

        let positional = if unpack_args {
            let seq = self.pop();
            vm.iterable_to_vec(&seq)?
        } else {
            self.pop_n(argc as usize)
        };

        let callee = self.pop();
        let args = crate::function::CallArgs { positional, keywords };
        let result = vm.call_value(&callee, &args)?;
        self.stack.push(result);
        Ok(())
    }

    /// The stack carries `num_cells` values pushed by `LoadCell` purely to
    /// keep the compiler's static stack-depth accounting balanced; the
    /// actual closure cells are recovered by name from this frame's own
    /// `cellfree`, since a `Cell`'s identity (not a snapshot of its current
    /// value) is what the new function must share.
    fn exec_make_function(&mut self, vm: &mut VirtualMachine, has_defaults: bool, has_kw_defaults: bool, num_cells: u32, _is_generator: bool) -> PyResult<()> {
        self.pop_n(num_cells as usize);
        let code_val = self.pop();
        let code = vm.code_from_const(&code_val);

        let mut kw_defaults = Vec::new();
        if has_kw_defaults {
            let n_pairs = code.kw_default_count as usize;
            let flat = self.pop_n(n_pairs * 2);
            for pair in flat.chunks(2) {
                let name = vm.to_display_string(&pair[0]);
                kw_defaults.push((name, pair[1].clone()));
            }
        }
        let defaults = if has_defaults { self.pop_n(code.default_count as usize) } else { Vec::new() };

        let free_names: Vec<String> = code.varnames.iter().filter(|v| v.kind == VarKind::Free).map(|v| v.name.clone()).collect();
        let mut cells = Vec::with_capacity(free_names.len());
        for name in &free_names {
            let cell = match crate::function::resolve_slot(&self.code, name) {
                Some(crate::function::NameSlot::CellFree(i)) => self.cellfree[i].clone(),
                _ => Cell::new(None),
            };
            cells.push(cell);
        }

        let class_cell = if code.flags.contains(pylite_bytecode::CodeFlags::HAS_CLASS_CELL) { self.class_cell.clone() } else { None };

        let func = PyFunction {
            name: code.name.clone(),
            code: code.clone(),
            defaults,
            kw_defaults,
            closure: cells,
            module_name: self.module_name.clone(),
            class_cell,
        };
        self.stack.push(vm.new_function(func));
        Ok(())
    }

    fn exec_make_class(&mut self, vm: &mut VirtualMachine, bases_count: u32, has_metaclass_kw: bool) -> PyResult<()> {
        let metaclass = if has_metaclass_kw {
            let m = self.pop();
            Some(vm.class_from_value(&m)?)
        } else {
            None
        };
        let base_values = self.pop_n(bases_count as usize);
        let mut bases = Vec::new();
        for b in base_values {
            bases.push(vm.class_from_value(&b)?);
        }
        let name_val = self.pop();
        let name = vm.to_display_string(&name_val);
        let body_func = self.pop();
        let namespace = vm.run_class_body(&body_func, &bases)?;
        let class = crate::class::new_class(&name, bases, namespace, metaclass).map_err(|msg| vm_type_error(vm, &msg))?;
        self.stack.push(vm.class_value(class));
        Ok(())
    }

    /// Points `exc.__context__` at the exception whose handler body is
    /// currently executing, if any, unless `exc` is that very exception
    /// (a bare `raise` never reaches here — it reuses the caught object
    /// rather than constructing a new one).
    fn set_implicit_context(&self, vm: &mut VirtualMachine, exc: &PyObjectRef) {
        if let Some(handling) = self.handling_stack.last() {
            if !std::rc::Rc::ptr_eq(handling, exc) {
                vm.set_context(exc, handling.clone());
            }
        }
    }

    fn exec_raise(&mut self, vm: &mut VirtualMachine, form: RaiseForm) -> PyResult<()> {
        match form {
            RaiseForm::Reraise => match self.active_exception.clone() {
                Some(exc) => Err(VmError::Raised(exc)),
                None => Ok(()),
            },
            RaiseForm::Exception => {
                let v = self.pop();
                let exc = vm.ensure_exception_instance(v)?;
                self.set_implicit_context(vm, &exc);
                Err(VmError::Raised(exc))
            }
            RaiseForm::ExceptionFrom => {
                let cause = self.pop();
                let v = self.pop();
                let exc = vm.ensure_exception_instance(v)?;
                self.set_implicit_context(vm, &exc);
                vm.set_cause(&exc, cause);
                Err(VmError::Raised(exc))
            }
        }
    }

    fn exec_push_block(&mut self, vm: &mut VirtualMachine, kind: BlockKind) -> PyResult<()> {
        match kind {
            BlockKind::Loop => self.block_stack.push(BlockEntry::Loop),
            BlockKind::With => {
                let manager = self.top();
                let entered = vm.call_dunder_required(&manager, "__enter__", vec![])?;
                *self.stack.last_mut().unwrap() = entered;
                self.block_stack.push(BlockEntry::With { manager });
            }
        }
        Ok(())
    }

    fn exec_with_cleanup(&mut self, vm: &mut VirtualMachine) -> PyResult<()> {
        let manager = match self.block_stack.last() {
            Some(BlockEntry::With { manager }) => manager.clone(),
            _ => return Ok(()),
        };
        match self.active_exception.clone() {
            None => {
                vm.call_dunder_required(&manager, "__exit__", vec![vm.none(), vm.none(), vm.none()])?;
            }
            Some(exc) => {
                if !self.stack.is_empty() && Rc::ptr_eq(&self.top(), &exc) {
                    self.pop();
                }
                let exc_type = vm.class_value(exc.class.clone());
                let tb = vm.none();
                let suppress = vm.call_dunder_required(&manager, "__exit__", vec![exc_type, exc.clone(), tb])?;
                if vm.is_truthy(&suppress)? {
                    self.active_exception = None;
                    self.stack.push(vm.new_bool(true));
                } else {
                    self.stack.push(vm.new_bool(false));
                }
            }
        }
        Ok(())
    }

    /// `yield from <expr>` (§4.5, §6): on first entry pops `<expr>` and
    /// stashes its iterator in `yield_from_delegate` rather than on the
    /// value stack, so a later resume only needs to hand the sent value
    /// to the already-known delegate instead of re-deriving an iterator
    /// from whatever the stack happens to hold. Pushes the delegate's
    /// return value once it's exhausted, matching `YieldFrom`'s net-zero
    /// compiled stack effect.
    fn exec_yield_from(&mut self, vm: &mut VirtualMachine) -> PyResult<Option<FrameStep>> {
        let (iter, sent) = match self.yield_from_delegate.clone() {
            Some(iter) => (iter, self.pop()),
            None => {
                let iterable = self.pop();
                let iter = crate::iterator::get_iter(vm, &iterable)?;
                self.yield_from_delegate = Some(iter.clone());
                (iter, vm.none())
            }
        };
        match crate::iterator::yield_from_poll(vm, &iter, sent)? {
            crate::iterator::YieldFromStep::Yielded(v) => {
                // Re-run this same instruction next resume so the delegate
                // is polled again with whatever value gets sent in.
                self.ip -= 1;
                Ok(Some(FrameStep::Yield(v)))
            }
            crate::iterator::YieldFromStep::Done(v) => {
                self.yield_from_delegate = None;
                self.stack.push(v);
                Ok(None)
            }
        }
    }

    fn exec_load_super(&mut self, vm: &mut VirtualMachine) -> PyResult<PyObjectRef> {
        let cell = self.class_cell.as_ref().ok_or_else(|| vm_type_error(vm, "super(): no enclosing class"))?;
        let class_val = cell.get().ok_or_else(|| vm_type_error(vm, "super(): __class__ cell is empty"))?;
        let class = vm.class_from_value(&class_val)?;
        let self_name = self.code.param_names.first().cloned().unwrap_or_default();
        let instance = match crate::function::resolve_slot(&self.code, &self_name) {
            Some(crate::function::NameSlot::Local(i)) => self.locals[i].clone(),
            Some(crate::function::NameSlot::CellFree(i)) => self.cellfree[i].get(),
            None => None,
        }
        .ok_or_else(|| vm_type_error(vm, "super(): no arguments"))?;
        Ok(object_protocol::make_super(vm, class, instance))
    }

    /// Tests `active_exception` against the class names named at
    /// `types_const_idx` (an empty tuple matches bare `except:`). In
    /// `except*` handlers this splits an exception group instead of
    /// testing the raw exception, pushing the matched subgroup for
    /// binding and keeping the unmatched remainder in `active_exception`
    /// for the next `except*` clause or an eventual re-raise.
    fn exec_check_exc_match(&mut self, vm: &mut VirtualMachine, types_const_idx: u32) -> PyResult<bool> {
        let names: Vec<String> = match self.const_at(types_const_idx) {
            ConstantData::Tuple(items) => items
                .iter()
                .map(|c| match c {
                    ConstantData::Str(s) => s.clone(),
                    _ => unreachable!(),
                })
                .collect(),
            _ => vec![],
        };
        let Some(exc) = self.active_exception.clone() else { return Ok(false) };

        if self.in_star_handler {
            let group = if crate::exceptions::group_exceptions(&exc).is_some() {
                exc
            } else {
                crate::exceptions::new_exception_group(vm, "", vec![exc], false)
            };
            let mut matched: Option<PyObjectRef> = None;
            let mut rest = Some(group);
            for name in &names {
                let Some(cur) = rest.take() else { break };
                let (m, r) = crate::exceptions::split_group(vm, &cur, name);
                matched = match (matched, m) {
                    (None, x) => x,
                    (Some(a), None) => Some(a),
                    (Some(a), Some(b)) => {
                        let mut items = crate::exceptions::group_exceptions(&a).unwrap_or_default();
                        items.extend(crate::exceptions::group_exceptions(&b).unwrap_or_default());
                        Some(crate::exceptions::derive_group(vm, &a, items))
                    }
                };
                rest = r;
            }
            self.active_exception = rest;
            match matched {
                Some(m) => {
                    self.handling_stack.push(m.clone());
                    self.stack.push(m);
                    Ok(true)
                }
                None => Ok(false),
            }
        } else if names.is_empty() {
            self.active_exception = None;
            self.handling_stack.push(exc);
            Ok(true)
        } else {
            let matched = names.iter().any(|n| crate::exceptions::is_instance_of(vm, &exc, n));
            if matched {
                self.active_exception = None;
                self.handling_stack.push(exc);
            }
            Ok(matched)
        }
    }
}

pub(crate) fn governor_trip_exception(vm: &mut VirtualMachine, trip: crate::governor::GovernorTrip) -> VmError {
    use crate::governor::GovernorTrip::*;
    let (kind, msg) = match trip {
        Deadline => ("TimeoutError", "execution deadline exceeded"),
        Cancelled => ("CancelledError", "execution cancelled"),
        RecursionDepth => ("RecursionError", "maximum recursion depth exceeded"),
        MemoryBudget => ("MemoryError", "memory budget exceeded"),
        CollectionSize => ("QuotaError", "collection size limit exceeded"),
    };
    VmError::Raised(new_exception(vm, kind, msg))
}

fn load_const(vm: &mut VirtualMachine, c: &ConstantData) -> PyObjectRef {
    match c {
        ConstantData::None => vm.none(),
        ConstantData::Bool(b) => vm.new_bool(*b),
        ConstantData::Int(i) => vm.new_int(*i),
        ConstantData::Float(f) => vm.new_float(*f),
        ConstantData::Str(s) => vm.new_str(s.clone()),
        ConstantData::Bytes(b) => vm.new_bytes(b.clone()),
        ConstantData::Tuple(items) => {
            let values: Vec<PyObjectRef> = items.iter().map(|c| load_const(vm, c)).collect();
            vm.new_tuple(values)
        }
        ConstantData::Code(code) => vm.new_code_value(code.clone()),
    }
}

fn binary_op(vm: &mut VirtualMachine, op: BinOp, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<PyObjectRef> {
    if let Some(v) = vm.try_fast_arith(op, lhs, rhs)? {
        return Ok(v);
    }
    object_protocol::binary_op(vm, op.method_name(), op.reflected_method_name(), lhs, rhs)
}

fn inplace_op(vm: &mut VirtualMachine, op: BinOp, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<PyObjectRef> {
    if let Some(method) = lhs.class.get_dunder(op.inplace_method_name()) {
        let v = vm.call_value(&method, &crate::function::CallArgs::positional(vec![lhs.clone(), rhs.clone()]))?;
        if !vm.is_not_implemented(&v) {
            return Ok(v);
        }
    }
    binary_op(vm, op, lhs, rhs)
}

fn unary_op(vm: &mut VirtualMachine, op: UnOp, operand: &PyObjectRef) -> PyResult<PyObjectRef> {
    if let Some(v) = vm.try_fast_unary(op, operand)? {
        return Ok(v);
    }
    match op {
        UnOp::Not => {
            let truthy = vm.is_truthy(operand)?;
            Ok(vm.new_bool(!truthy))
        }
        UnOp::Neg => object_protocol::unary_op(vm, "__neg__", operand),
        UnOp::Pos => object_protocol::unary_op(vm, "__pos__", operand),
        UnOp::Invert => object_protocol::unary_op(vm, "__invert__", operand),
    }
}

fn compare_op(vm: &mut VirtualMachine, op: CmpOp, lhs: &PyObjectRef, rhs: &PyObjectRef) -> PyResult<PyObjectRef> {
    match op {
        CmpOp::Is => Ok(vm.new_bool(Rc::ptr_eq(lhs, rhs))),
        CmpOp::IsNot => Ok(vm.new_bool(!Rc::ptr_eq(lhs, rhs))),
        CmpOp::In => {
            let b = vm.contains(rhs, lhs)?;
            Ok(vm.new_bool(b))
        }
        CmpOp::NotIn => {
            let b = vm.contains(rhs, lhs)?;
            Ok(vm.new_bool(!b))
        }
        CmpOp::Eq => {
            let b = vm.values_eq(lhs, rhs)?;
            Ok(vm.new_bool(b))
        }
        CmpOp::Ne => {
            let b = vm.values_eq(lhs, rhs)?;
            Ok(vm.new_bool(!b))
        }
        CmpOp::Lt => object_protocol::binary_op(vm, "__lt__", "__gt__", lhs, rhs),
        CmpOp::Le => object_protocol::binary_op(vm, "__le__", "__ge__", lhs, rhs),
        CmpOp::Gt => object_protocol::binary_op(vm, "__gt__", "__lt__", lhs, rhs),
        CmpOp::Ge => object_protocol::binary_op(vm, "__ge__", "__le__", lhs, rhs),
    }
}
