#![cfg(unix)]
//! Attaches a listener to `open()` that redirects every call to
//! `/etc/timezone`, regardless of the path the caller asked for.
//!
//! Demonstrates `Interceptor::attach` + `InvocationContext::replace_nth_argument`:
//! unlike a full [`Interceptor::replace`], the original `open()` body still
//! runs — only the argument it sees has changed.

use interceptor::{Interceptor, InvocationContext, Listener};
use lazy_static::lazy_static;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

extern "C" {
  fn open(pathname: *const c_char, flags: c_int) -> c_int;
}

lazy_static! {
  static ref REDIRECT_PATH: CString = CString::new("/etc/timezone").unwrap();
}

struct RedirectOpen;

impl Listener for RedirectOpen {
  fn on_enter(&self, ctx: &mut InvocationContext) {
    ctx.replace_nth_argument(0, REDIRECT_PATH.as_ptr() as usize);
  }

  fn on_leave(&self, ctx: &mut InvocationContext) {
    let fd = ctx.get_return_value() as c_int;
    assert!(fd > 0, "redirected open() should still succeed");
  }
}

#[ctor::ctor]
fn install_hook() {
  Interceptor::global()
    .attach(open as *const (), Arc::new(RedirectOpen))
    .expect("failed to attach to open()");
}
