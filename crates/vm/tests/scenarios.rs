//! End-to-end scenarios driving [`Vm`] through `run_string` exactly as a
//! host embedder would, asserting on captured stdout and the reported
//! [`RunOutcome`].

use std::cell::RefCell;
use std::rc::Rc;

use pocket_vm::{HostConfig, RunOutcome, Vm};

/// Builds a `Vm` whose stdout is captured into a `String` the caller can
/// inspect after the run.
fn vm_with_captured_stdout() -> (Vm, Rc<RefCell<String>>) {
    let captured = Rc::new(RefCell::new(String::new()));
    let sink = captured.clone();
    let mut host = HostConfig::new();
    host.stdout_write = Some(Box::new(move |text| sink.borrow_mut().push_str(text)));
    (Vm::new(host), captured)
}

fn run(source: &str) -> (RunOutcome, String) {
    let (mut vm, out) = vm_with_captured_stdout();
    let outcome = vm.run_string(source, "main", "<test>");
    let text = out.borrow().clone();
    (outcome, text)
}

#[test]
fn closure_counter_prints_one_two_three() {
    let source = r#"
def counter()
  i = 0
  def inc() i = i + 1; return i end
  return inc
end
c = counter(); print(c(), c(), c())
"#;
    let (outcome, stdout) = run(source);
    assert!(outcome.is_success(), "expected success, got {outcome:?}");
    assert_eq!(stdout, "1 2 3\n");
}

#[test]
fn fiber_yield_and_resume_interleave_values() {
    let source = r#"
def gen()
  for i in 0..3 do yield(i) end
end
f = Fiber.new(gen)
print(Fiber.run(f), Fiber.resume(f), Fiber.resume(f))
"#;
    let (outcome, stdout) = run(source);
    assert!(outcome.is_success(), "expected success, got {outcome:?}");
    assert_eq!(stdout, "0 1 2\n");
}

#[test]
fn map_remove_then_reinsert_preserves_other_keys() {
    let source = r#"
m = {"a":1, "b":2, "c":3}
map_remove(m, "b")
m["b"] = 20
print(m["a"], m["b"], m["c"])
"#;
    let (outcome, stdout) = run(source);
    assert!(outcome.is_success(), "expected success, got {outcome:?}");
    assert_eq!(stdout, "1 20 3\n");
}

#[test]
fn tail_call_recursion_ten_thousand_deep_does_not_overflow() {
    let source = r#"
def sum(n, acc) if n == 0 then return acc end; return sum(n-1, acc+n) end
print(sum(10000, 0))
"#;
    let (outcome, stdout) = run(source);
    assert!(outcome.is_success(), "expected success, got {outcome:?}");
    assert_eq!(stdout, "50005000\n");
}

#[test]
fn gc_collection_mid_run_preserves_live_list_contents() {
    let source = r#"
a = []
for i in 0..1000 do list_append(a, "s" + to_string(i)) end
gc()
print(a[0], a[999])
"#;
    let (outcome, stdout) = run(source);
    assert!(outcome.is_success(), "expected success, got {outcome:?}");
    assert_eq!(stdout, "s0 s999\n");
}

#[test]
fn calling_with_too_few_arguments_is_a_runtime_error() {
    let source = r#"
def f(x, y) return x + y end
f(1)
"#;
    let (outcome, _stdout) = run(source);
    match outcome {
        RunOutcome::RuntimeError(message) => {
            assert!(message.contains("Expected exactly 2 argument(s)."), "unexpected message: {message}");
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
    assert_eq!(outcome_exit_code(&run(source).0), 70);
}

fn outcome_exit_code(outcome: &RunOutcome) -> i32 {
    outcome.exit_code()
}

#[test]
fn string_and_list_concatenation_allocate_new_values() {
    let source = r#"
print("foo" + "bar")
print((["a"] + ["b"])[1])
"#;
    let (outcome, stdout) = run(source);
    assert!(outcome.is_success(), "expected success, got {outcome:?}");
    assert_eq!(stdout, "foobar\nb\n");
}

#[test]
fn negative_list_indices_count_from_the_end() {
    let source = r#"
a = [10, 20, 30]
print(a[-1], a[-2])
"#;
    let (outcome, stdout) = run(source);
    assert!(outcome.is_success(), "expected success, got {outcome:?}");
    assert_eq!(stdout, "30 20\n");
}

#[test]
fn class_constructor_initializes_fields_and_binds_methods() {
    let source = r#"
class Point
  def _init(x, y) self.x = x; self.y = y end
  def sum() return self.x + self.y end
end
p = Point(3, 4)
print(p.sum())
"#;
    let (outcome, stdout) = run(source);
    assert!(outcome.is_success(), "expected success, got {outcome:?}");
    assert_eq!(stdout, "7\n");
}

#[test]
fn compile_error_reports_failure_without_running() {
    let source = "def f( return end";
    let (outcome, stdout) = run(source);
    assert!(stdout.is_empty());
    match outcome {
        RunOutcome::CompileError(errors) => assert!(!errors.is_empty()),
        other => panic!("expected a compile error, got {other:?}"),
    }
}
