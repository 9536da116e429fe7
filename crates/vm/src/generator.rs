//! Generators as suspendable frames (§3 Generator, §4.5). A generator's
//! frame is driven explicitly by `next()`/`send()` rather than nested
//! inside whatever frame is currently running, so suspension is just
//! "stop calling `execute` and hang onto the `Frame`".

use crate::exceptions::{new_exception, vm_stop_iteration};
use crate::frame::{Frame, FrameStep};
use crate::host::{PyResult, VirtualMachine};
use crate::value::PyObjectRef;

pub enum GeneratorState {
    Created(Frame),
    Suspended(Frame),
    Running,
    Done,
}

/// Advances a generator with `sent` pushed as the value its last `yield`
/// expression evaluates to (`None` the first time, since there is no
/// pending `yield` to resume).
pub fn resume(vm: &mut VirtualMachine, gen: &PyObjectRef, sent: PyObjectRef) -> PyResult<PyObjectRef> {
    let state = {
        let crate::value::PyPayload::Generator(cell) = &gen.payload else { unreachable!("resume called on non-generator") };
        std::mem::replace(&mut *cell.borrow_mut(), GeneratorState::Running)
    };
    let mut frame = match state {
        GeneratorState::Done => return Err(vm_stop_iteration(vm, vm.none())),
        GeneratorState::Running => {
            let crate::value::PyPayload::Generator(cell) = &gen.payload else { unreachable!() };
            *cell.borrow_mut() = GeneratorState::Running;
            return Err(crate::host::VmError::Raised(new_exception(vm, "ValueError", "generator already executing")));
        }
        GeneratorState::Created(f) => f,
        GeneratorState::Suspended(mut f) => {
            f.push_value(sent);
            f
        }
    };

    let result = frame.resume_execute(vm);
    let crate::value::PyPayload::Generator(cell) = &gen.payload else { unreachable!() };
    match result {
        Ok(FrameStep::Yield(v)) => {
            *cell.borrow_mut() = GeneratorState::Suspended(frame);
            Ok(v)
        }
        Ok(FrameStep::Return(v)) => {
            *cell.borrow_mut() = GeneratorState::Done;
            Err(vm_stop_iteration(vm, v))
        }
        Err(e) => {
            *cell.borrow_mut() = GeneratorState::Done;
            Err(e)
        }
    }
}

pub fn close(vm: &mut VirtualMachine, gen: &PyObjectRef) -> PyResult<()> {
    let crate::value::PyPayload::Generator(cell) = &gen.payload else { unreachable!() };
    let was_running = matches!(&*cell.borrow(), GeneratorState::Suspended(_) | GeneratorState::Created(_));
    *cell.borrow_mut() = GeneratorState::Done;
    let _ = (vm, was_running);
    Ok(())
}
