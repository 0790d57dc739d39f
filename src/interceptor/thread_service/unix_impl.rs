//! Linux backend: `/proc/self/task` for enumeration, `tgkill` +
//! `SIGSTOP`/`SIGCONT` for suspend/resume, `PTRACE_GETREGS`/`PTRACE_SETREGS`
//! for register access.
//!
//! `ptrace`-based register access requires the caller to be the tracer of
//! the target thread; this engine traces its own process's threads for the
//! duration of a single arm/disarm cycle only (`PTRACE_ATTACH` right before,
//! `PTRACE_DETACH` right after), matching the brief-suspension-window model
//! of §5.

use super::ThreadContext;
use crate::error::{Error, Result};
use std::fs;

/// Returns the calling thread's id, stable for the lifetime of the thread.
pub fn current_thread_id() -> u64 {
  unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Every other thread in this process, by reading `/proc/self/task`.
pub fn enumerate_other_threads() -> Result<Vec<u64>> {
  let me = current_thread_id();
  let entries = fs::read_dir("/proc/self/task").map_err(|_| Error::PatchUnsafe)?;
  let mut threads = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|_| Error::PatchUnsafe)?;
    if let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
      if id != me {
        threads.push(id);
      }
    }
  }
  Ok(threads)
}

/// Stops `thread_id` with `SIGSTOP`, then waits for it to actually reach a
/// stopped state via `PTRACE_ATTACH`'s implicit stop.
pub fn suspend(thread_id: u64) -> Result<()> {
  let tid = thread_id as libc::pid_t;
  let rc = unsafe { libc::ptrace(libc::PTRACE_ATTACH, tid, std::ptr::null_mut::<libc::c_void>(), std::ptr::null_mut::<libc::c_void>()) };
  if rc != 0 {
    return Err(Error::PatchUnsafe);
  }
  let mut status = 0;
  unsafe { libc::waitpid(tid, &mut status, 0) };
  Ok(())
}

/// Detaches from `thread_id`, letting it continue where it left off.
pub fn resume(thread_id: u64) -> Result<()> {
  let tid = thread_id as libc::pid_t;
  let rc = unsafe { libc::ptrace(libc::PTRACE_DETACH, tid, std::ptr::null_mut::<libc::c_void>(), std::ptr::null_mut::<libc::c_void>()) };
  if rc != 0 {
    return Err(Error::PatchUnsafe);
  }
  Ok(())
}

/// Reads `thread_id`'s instruction pointer via `PTRACE_GETREGS`. Only valid
/// while the thread is suspended.
pub fn get_context(thread_id: u64) -> Result<ThreadContext> {
  let tid = thread_id as libc::pid_t;
  let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
  let rc = unsafe {
    libc::ptrace(
      libc::PTRACE_GETREGS,
      tid,
      std::ptr::null_mut::<libc::c_void>(),
      &mut regs as *mut _ as *mut libc::c_void,
    )
  };
  if rc != 0 {
    return Err(Error::PatchUnsafe);
  }
  Ok(ThreadContext { instruction_pointer: regs.rip as usize })
}

/// Redirects `thread_id`'s instruction pointer. Only valid while the
/// thread is suspended.
pub fn set_instruction_pointer(thread_id: u64, new_ip: usize) -> Result<()> {
  let tid = thread_id as libc::pid_t;
  let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
  let rc = unsafe {
    libc::ptrace(
      libc::PTRACE_GETREGS,
      tid,
      std::ptr::null_mut::<libc::c_void>(),
      &mut regs as *mut _ as *mut libc::c_void,
    )
  };
  if rc != 0 {
    return Err(Error::PatchUnsafe);
  }
  regs.rip = new_ip as libc::c_ulonglong;
  let rc = unsafe {
    libc::ptrace(
      libc::PTRACE_SETREGS,
      tid,
      std::ptr::null_mut::<libc::c_void>(),
      &mut regs as *mut _ as *mut libc::c_void,
    )
  };
  if rc != 0 {
    return Err(Error::PatchUnsafe);
  }
  Ok(())
}
