//! End-to-end attach/detach/replace coverage against real executable
//! functions in this process — the integration-level counterpart to the
//! `#[cfg(test)]` unit suites inside `arch::x86::{decoder,writer,relocator}`
//! and `interceptor::mod`, which exercise the pieces that don't need live
//! patchable memory.
//!
//! Only exercised on x86-64: the thunk-generation layer that these tests
//! drive is x64-only today (see DESIGN.md's scope note).
#![cfg(target_arch = "x86_64")]

use interceptor::{Interceptor, InvocationContext, Listener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type FnAdd = extern "C" fn(i32, i32) -> i32;

#[inline(never)]
extern "C" fn add(x: i32, y: i32) -> i32 {
  unsafe { std::ptr::read_volatile(&x as *const i32) + y }
}

#[inline(never)]
extern "C" fn sub(x: i32, y: i32) -> i32 {
  unsafe { std::ptr::read_volatile(&x as *const i32) - y }
}

/// Counts enter/leave calls without inspecting arguments.
struct CountingListener {
  enters: AtomicUsize,
  leaves: AtomicUsize,
}

impl CountingListener {
  fn new() -> Arc<Self> {
    Arc::new(CountingListener { enters: AtomicUsize::new(0), leaves: AtomicUsize::new(0) })
  }
}

impl Listener for CountingListener {
  fn on_enter(&self, _ctx: &mut InvocationContext) {
    self.enters.fetch_add(1, Ordering::SeqCst);
  }
  fn on_leave(&self, _ctx: &mut InvocationContext) {
    self.leaves.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn attach_observes_every_call_without_changing_its_result() {
  let interceptor = Interceptor::new();
  let counter = CountingListener::new();
  let handle = interceptor
    .attach(add as *const (), counter.clone())
    .expect("add() should be a valid attach target");

  assert_eq!(add(2, 3), 5, "attaching a listener must not change the function's behaviour");
  assert_eq!(counter.enters.load(Ordering::SeqCst), 1);
  assert_eq!(counter.leaves.load(Ordering::SeqCst), 1);

  interceptor.detach(handle).expect("detach should succeed on a live handle");
  assert_eq!(add(2, 3), 5);
  // no further dispatch once detached
  assert_eq!(counter.enters.load(Ordering::SeqCst), 1);
  assert_eq!(counter.leaves.load(Ordering::SeqCst), 1);
}

/// Mutates the second argument before the real body reads it.
struct ArgumentRewriter;

impl Listener for ArgumentRewriter {
  fn on_enter(&self, ctx: &mut InvocationContext) {
    assert_eq!(ctx.get_nth_argument(0), 10);
    assert_eq!(ctx.get_nth_argument(1), 5);
    ctx.replace_nth_argument(1, 1);
  }
}

#[test]
fn replace_nth_argument_is_seen_by_the_original_body() {
  let interceptor = Interceptor::new();
  let handle = interceptor.attach(add as *const (), Arc::new(ArgumentRewriter)).unwrap();

  // add(10, 5) would be 15; the listener rewrites the second argument to 1.
  assert_eq!(add(10, 5), 11);

  interceptor.detach(handle).unwrap();
  assert_eq!(add(10, 5), 15);
}

/// Overwrites the return value once the real body has already run.
struct ReturnValueRewriter;

impl Listener for ReturnValueRewriter {
  fn on_leave(&self, ctx: &mut InvocationContext) {
    assert_eq!(ctx.get_return_value() as i32, 7);
    ctx.replace_return_value(42);
  }
}

#[test]
fn replace_return_value_is_seen_by_the_caller() {
  let interceptor = Interceptor::new();
  let handle = interceptor.attach(add as *const (), Arc::new(ReturnValueRewriter)).unwrap();

  assert_eq!(add(3, 4), 42);

  interceptor.detach(handle).unwrap();
  assert_eq!(add(3, 4), 7);
}

/// Records which listener ran, in enter/leave order, so ordering can be
/// asserted against attach order.
struct OrderRecorder {
  name: &'static str,
  log: Arc<Mutex<Vec<&'static str>>>,
}

impl Listener for OrderRecorder {
  fn on_enter(&self, _ctx: &mut InvocationContext) {
    self.log.lock().unwrap().push(self.name);
  }
  fn on_leave(&self, _ctx: &mut InvocationContext) {
    self.log.lock().unwrap().push(self.name);
  }
}

#[test]
fn listeners_fire_enter_in_attach_order_and_leave_in_reverse() {
  let interceptor = Interceptor::new();
  let log = Arc::new(Mutex::new(Vec::new()));

  let first = interceptor
    .attach(add as *const (), Arc::new(OrderRecorder { name: "first", log: log.clone() }))
    .unwrap();
  let second = interceptor
    .attach(add as *const (), Arc::new(OrderRecorder { name: "second", log: log.clone() }))
    .unwrap();

  add(1, 1);

  assert_eq!(*log.lock().unwrap(), vec!["first", "second", "second", "first"]);

  interceptor.detach(second).unwrap();
  interceptor.detach(first).unwrap();
}

#[test]
fn attaching_the_same_listener_twice_is_rejected() {
  let interceptor = Interceptor::new();
  let counter = CountingListener::new();
  let handle = interceptor.attach(add as *const (), counter.clone()).unwrap();

  let err = interceptor.attach(add as *const (), counter).unwrap_err();
  assert!(matches!(err, interceptor::Error::AlreadyAttached));

  interceptor.detach(handle).unwrap();
}

#[test]
fn replace_fully_swaps_the_function_and_detach_restores_it() {
  let interceptor = Interceptor::new();
  let trampoline: FnAdd = add;
  assert_eq!(trampoline(10, 5), 15);

  let handle = interceptor.replace(add as *const (), sub as *const (), 0).unwrap();
  assert_eq!(add(10, 5), 5, "a replaced target should run the replacement, not the original body");

  interceptor.detach(handle).unwrap();
  assert_eq!(add(10, 5), 15, "detaching a replacement should restore the original function");
}

#[test]
fn replace_and_attach_are_mutually_exclusive_on_the_same_target() {
  let interceptor = Interceptor::new();

  let replace_handle = interceptor.replace(add as *const (), sub as *const (), 0).unwrap();
  let err = interceptor.attach(add as *const (), CountingListener::new()).unwrap_err();
  assert!(matches!(err, interceptor::Error::AlreadyReplaced));
  interceptor.detach(replace_handle).unwrap();

  let attach_handle = interceptor.attach(add as *const (), CountingListener::new()).unwrap();
  let err = interceptor.replace(add as *const (), sub as *const (), 0).unwrap_err();
  assert!(matches!(err, interceptor::Error::AlreadyReplaced));
  interceptor.detach(attach_handle).unwrap();
}

/// Calls the intercepted function from inside its own listener while
/// ignoring the current thread, verifying the inner call isn't re-dispatched
/// and doesn't deadlock on the context's listener lock.
struct ReentrantCaller {
  interceptor_calls: AtomicUsize,
}

impl Listener for ReentrantCaller {
  fn on_enter(&self, _ctx: &mut InvocationContext) {
    self.interceptor_calls.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn ignore_current_thread_suppresses_dispatch_but_still_calls_through() {
  let interceptor = Interceptor::new();
  let listener = Arc::new(ReentrantCaller { interceptor_calls: AtomicUsize::new(0) });
  let handle = interceptor.attach(add as *const (), listener.clone()).unwrap();

  assert_eq!(add(1, 1), 2);
  assert_eq!(listener.interceptor_calls.load(Ordering::SeqCst), 1);

  interceptor.ignore_current_thread();
  assert_eq!(add(1, 1), 2, "an ignored thread must still run the original function body");
  assert_eq!(listener.interceptor_calls.load(Ordering::SeqCst), 1, "dispatch must be suppressed while ignored");
  interceptor.unignore_current_thread();

  assert_eq!(add(1, 1), 2);
  assert_eq!(listener.interceptor_calls.load(Ordering::SeqCst), 2, "dispatch resumes once unignored");

  interceptor.detach(handle).unwrap();
}

#[test]
fn transactions_coalesce_reclamation_across_nested_attach_detach() {
  let interceptor = Interceptor::new();

  interceptor.begin_transaction();
  let handle = interceptor.attach(add as *const (), CountingListener::new()).unwrap();
  interceptor.detach(handle).unwrap();
  interceptor.end_transaction().unwrap();

  // The context is fully gone and the target is re-attachable.
  let handle = interceptor.attach(add as *const (), CountingListener::new()).unwrap();
  assert_eq!(add(2, 2), 4);
  interceptor.detach(handle).unwrap();
}
