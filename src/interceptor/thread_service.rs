//! Thread enumeration/suspension collaborator (§6 "Collaborator: Thread
//! Service"). Used only during arm/disarm, never from listener callbacks
//! (§5 "Suspension points").
//!
//! `libc` on unix, `winapi`'s `tlhelp32`/`processthreadsapi` on windows,
//! selected with the same `cfg_if!` pattern `arch::mod` uses to pick its
//! target architecture.

/// Opaque handle identifying a native thread, returned by
/// [`enumerate_other_threads`] and consumed by the rest of this module.
pub type ThreadId = u64;

/// The subset of a suspended thread's register file the Interceptor needs:
/// just the instruction pointer, to check it against the bytes about to
/// be overwritten (§4.D "Atomic patch policy").
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext {
  pub instruction_pointer: usize,
}

cfg_if::cfg_if! {
  if #[cfg(windows)] {
    mod windows_impl;
    pub use windows_impl::*;
  } else if #[cfg(unix)] {
    mod unix_impl;
    pub use unix_impl::*;
  } else {
    compile_error!("interceptor requires a unix or windows thread service backend");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn current_thread_id_is_stable_within_a_call() {
    assert_eq!(current_thread_id(), current_thread_id());
  }
}
