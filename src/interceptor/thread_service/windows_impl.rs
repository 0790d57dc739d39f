//! Windows backend: `CreateToolhelp32Snapshot`/`Thread32First`/`Next` for
//! enumeration, `SuspendThread`/`ResumeThread` for suspend/resume,
//! `GetThreadContext`/`SetThreadContext` for register access.

use super::ThreadContext;
use crate::error::{Error, Result};
use std::mem;
use winapi::shared::minwindef::DWORD;
use winapi::um::handleapi::CloseHandle;
use winapi::um::processthreadsapi::{
  GetCurrentThreadId, GetThreadContext, OpenThread, ResumeThread, SetThreadContext, SuspendThread,
};
use winapi::um::tlhelp32::{
  CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winnt::{CONTEXT, CONTEXT_CONTROL, THREAD_GET_CONTEXT, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME};

pub fn current_thread_id() -> u64 {
  unsafe { GetCurrentThreadId() as u64 }
}

/// Walks a process-wide thread snapshot, keeping only entries belonging to
/// this process and excluding the caller.
pub fn enumerate_other_threads() -> Result<Vec<u64>> {
  let me = current_thread_id();
  let own_pid = std::process::id();

  let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
  if snapshot.is_null() {
    return Err(Error::PatchUnsafe);
  }

  let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
  entry.dwSize = mem::size_of::<THREADENTRY32>() as DWORD;

  let mut threads = Vec::new();
  let mut ok = unsafe { Thread32First(snapshot, &mut entry) };
  while ok != 0 {
    if entry.th32OwnerProcessID == own_pid && entry.th32ThreadID as u64 != me {
      threads.push(entry.th32ThreadID as u64);
    }
    ok = unsafe { Thread32Next(snapshot, &mut entry) };
  }

  unsafe { CloseHandle(snapshot) };
  Ok(threads)
}

fn open(thread_id: u64, access: DWORD) -> Result<winapi::um::winnt::HANDLE> {
  let handle = unsafe { OpenThread(access, 0, thread_id as DWORD) };
  if handle.is_null() {
    Err(Error::PatchUnsafe)
  } else {
    Ok(handle)
  }
}

pub fn suspend(thread_id: u64) -> Result<()> {
  let handle = open(thread_id, THREAD_SUSPEND_RESUME)?;
  let rc = unsafe { SuspendThread(handle) };
  unsafe { CloseHandle(handle) };
  if rc == u32::MAX {
    Err(Error::PatchUnsafe)
  } else {
    Ok(())
  }
}

pub fn resume(thread_id: u64) -> Result<()> {
  let handle = open(thread_id, THREAD_SUSPEND_RESUME)?;
  let rc = unsafe { ResumeThread(handle) };
  unsafe { CloseHandle(handle) };
  if rc == u32::MAX {
    Err(Error::PatchUnsafe)
  } else {
    Ok(())
  }
}

pub fn get_context(thread_id: u64) -> Result<ThreadContext> {
  let handle = open(thread_id, THREAD_GET_CONTEXT)?;
  let mut context: CONTEXT = unsafe { mem::zeroed() };
  context.ContextFlags = CONTEXT_CONTROL;
  let rc = unsafe { GetThreadContext(handle, &mut context) };
  unsafe { CloseHandle(handle) };
  if rc == 0 {
    return Err(Error::PatchUnsafe);
  }
  Ok(ThreadContext { instruction_pointer: context.Rip as usize })
}

pub fn set_instruction_pointer(thread_id: u64, new_ip: usize) -> Result<()> {
  let handle = open(thread_id, THREAD_GET_CONTEXT | THREAD_SET_CONTEXT)?;
  let mut context: CONTEXT = unsafe { mem::zeroed() };
  context.ContextFlags = CONTEXT_CONTROL;
  if unsafe { GetThreadContext(handle, &mut context) } == 0 {
    unsafe { CloseHandle(handle) };
    return Err(Error::PatchUnsafe);
  }
  context.Rip = new_ip as u64;
  let rc = unsafe { SetThreadContext(handle, &context) };
  unsafe { CloseHandle(handle) };
  if rc == 0 {
    Err(Error::PatchUnsafe)
  } else {
    Ok(())
  }
}
