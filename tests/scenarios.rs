//! End-to-end scenarios seeded in spec §8 ("Concrete end-to-end
//! scenarios"), run through the public `Interpreter` facade exactly the
//! way a host would.

use pylite::{Interpreter, PyPayload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init() {
    let _ = env_logger::try_init();
}

#[test]
fn diamond_mro_cooperative_super() {
    init();
    let mut interp = Interpreter::new();
    let source = r#"
class A:
    def method(self):
        return ["A"]

class B(A):
    def method(self):
        return ["B"] + super().method()

class C(A):
    def method(self):
        return ["C"] + super().method()

class D(B, C):
    def method(self):
        return ["D"] + super().method()

result = D().method()
"#;
    interp.run(source).expect("script runs");
    let result = interp.get_global("result").expect("result is bound");
    let PyPayload::List(items) = &result.payload else { panic!("expected a list") };
    let names: Vec<String> = items
        .borrow()
        .iter()
        .map(|v| match &v.payload {
            PyPayload::Str(s) => s.clone(),
            other => panic!("expected a string element, got {other:?}"),
        })
        .collect();
    assert_eq!(names, vec!["D", "B", "C", "A"]);
}

#[test]
fn except_star_splits_a_group() {
    init();
    let mut interp = Interpreter::new();
    let source = r#"
caught = []

try:
    raise ExceptionGroup("g", [ValueError("v"), TypeError("t")])
except* ValueError:
    caught.append("value")
except* TypeError:
    caught.append("type")
"#;
    interp.run(source).expect("both except* clauses run, nothing propagates");
    let caught = interp.get_global("caught").expect("caught is bound");
    let PyPayload::List(items) = &caught.payload else { panic!("expected a list") };
    let mut names: Vec<String> = items
        .borrow()
        .iter()
        .map(|v| match &v.payload {
            PyPayload::Str(s) => s.clone(),
            other => panic!("expected a string element, got {other:?}"),
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["type", "value"]);
}

#[test]
fn deadline_interrupts_an_infinite_loop() {
    init();
    let mut interp = Interpreter::new();
    interp.set_check_interval(100);
    let source = "x = 0\nwhile True:\n    x = x + 1\n";
    let start = std::time::Instant::now();
    let err = interp
        .run_with_deadline(source, Duration::from_millis(50))
        .expect_err("an infinite loop must be interrupted by the deadline");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(err.class_name(), "TimeoutError");
}

#[test]
fn cancellation_token_interrupts_a_loop() {
    init();
    let mut interp = Interpreter::new();
    interp.set_check_interval(100);
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        cancel_clone.store(true, Ordering::Relaxed);
    });
    let source = "x = 0\nwhile True:\n    x = x + 1\n";
    let err = interp
        .run_with_cancellation(source, cancel)
        .expect_err("cancellation must interrupt the loop");
    assert_eq!(err.class_name(), "CancelledError");
}

#[test]
fn modulo_and_floor_division_sign_convention() {
    init();
    let mut interp = Interpreter::new();
    let source = r#"
a = (-7) % 3
b = 7 % -3
c = (-7) // 3
d = 7 // -3
"#;
    interp.run(source).expect("script runs");
    let expect_int = |interp: &mut Interpreter, name: &str, want: i64| {
        let v = interp.get_global(name).unwrap();
        match &v.payload {
            PyPayload::Int(n) => assert_eq!(*n, want, "{name}"),
            other => panic!("expected an int for {name}, got {other:?}"),
        }
    };
    expect_int(&mut interp, "a", 2);
    expect_int(&mut interp, "b", -2);
    expect_int(&mut interp, "c", -3);
    expect_int(&mut interp, "d", -3);
}

#[test]
fn unhashable_key_rejected_at_construction() {
    init();
    let mut interp = Interpreter::new();
    let err = interp.run("d = {[1, 2]: 'x'}").expect_err("a list key is unhashable");
    assert_eq!(err.class_name(), "TypeError");
    assert!(err.message.contains("unhashable"), "message was: {}", err.message);
}

#[test]
fn raise_inside_an_except_block_chains_implicit_context() {
    init();
    let mut interp = Interpreter::new();
    let source = r#"
context_is_value_error = None
context_message = None
try:
    try:
        raise ValueError("v")
    except ValueError:
        raise TypeError("t")
except TypeError as e:
    context_is_value_error = isinstance(e.__context__, ValueError)
    context_message = e.__context__.args[0]
"#;
    interp.run(source).expect("the TypeError propagates out of the inner handler and is caught outside");
    let context_is_value_error = interp.get_global("context_is_value_error").expect("context_is_value_error is bound");
    match &context_is_value_error.payload {
        PyPayload::Bool(b) => assert!(*b, "expected the outer TypeError's __context__ to be the inner ValueError"),
        other => panic!("expected a bool, got {other:?}"),
    }
    let context_message = interp.get_global("context_message").expect("context_message is bound");
    match &context_message.payload {
        PyPayload::Str(s) => assert_eq!(s, "v"),
        other => panic!("expected a string, got {other:?}"),
    }
}

#[test]
fn raise_from_sets_cause_without_touching_context() {
    init();
    let mut interp = Interpreter::new();
    let source = r#"
cause_is_value_error = None
try:
    try:
        raise ValueError("v")
    except ValueError as e:
        raise TypeError("t") from e
except TypeError as e:
    cause_is_value_error = isinstance(e.__cause__, ValueError)
"#;
    interp.run(source).expect("script runs");
    let cause_is_value_error = interp.get_global("cause_is_value_error").expect("cause_is_value_error is bound");
    match &cause_is_value_error.payload {
        PyPayload::Bool(b) => assert!(*b, "expected the TypeError's __cause__ to be the inner ValueError"),
        other => panic!("expected a bool, got {other:?}"),
    }
}

#[test]
fn yield_from_delegates_every_element_and_captures_the_return_value() {
    init();
    let mut interp = Interpreter::new();
    let source = r#"
def inner():
    yield 1
    yield 2
    return 99

def outer():
    x = yield from inner()
    yield x

result = list(outer())
"#;
    interp.run(source).expect("delegation must survive past the first yielded element");
    let result = interp.get_global("result").expect("result is bound");
    let PyPayload::List(items) = &result.payload else { panic!("expected a list") };
    let values: Vec<i64> = items
        .borrow()
        .iter()
        .map(|v| match &v.payload {
            PyPayload::Int(n) => *n,
            other => panic!("expected an int element, got {other:?}"),
        })
        .collect();
    assert_eq!(values, vec![1, 2, 99]);
}

#[test]
fn generator_pipeline() {
    init();
    let mut interp = Interpreter::new();
    let source = r#"
def nums(n):
    i = 0
    while i < n:
        yield i
        i = i + 1

def sq(g):
    for x in g:
        yield x * x

def big(g):
    for x in g:
        if x >= 25:
            yield x

result = list(big(sq(nums(10))))
"#;
    interp.run(source).expect("script runs");
    let result = interp.get_global("result").expect("result is bound");
    let PyPayload::List(items) = &result.payload else { panic!("expected a list") };
    let values: Vec<i64> = items
        .borrow()
        .iter()
        .map(|v| match &v.payload {
            PyPayload::Int(n) => *n,
            other => panic!("expected an int element, got {other:?}"),
        })
        .collect();
    assert_eq!(values, vec![25, 36, 49, 64, 81]);
}
