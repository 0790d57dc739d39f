#![cfg(windows)]
//! A `MessageBoxW` instrumentation example.
//!
//! Ensure the crate is compiled as a 'cdylib' library to allow C interop.
use interceptor::{Interceptor, InvocationContext, Listener};
use lazy_static::lazy_static;
use std::error::Error;
use std::sync::Arc;
use std::{ffi::CString, iter, mem};
use winapi::ctypes::c_int;
use winapi::shared::minwindef::{BOOL, DWORD, HINSTANCE, LPVOID, TRUE, UINT};
use winapi::shared::windef::HWND;
use winapi::um::libloaderapi::{GetModuleHandleW, GetProcAddress};
use winapi::um::winnt::{DLL_PROCESS_ATTACH, LPCWSTR};

// A type alias for `MessageBoxW` (makes the transmute easy on the eyes)
type FnMessageBoxW = unsafe extern "system" fn(HWND, LPCWSTR, LPCWSTR, UINT) -> c_int;

lazy_static! {
  static ref REPLACED_CAPTION: Vec<u16> = "Detoured!\0".encode_utf16().collect();
}

/// Rewrites the `lpCaption` argument (the 3rd, index 2) on entry; the real
/// `MessageBoxW` body still runs with the new caption, unlike a full
/// `Interceptor::replace`.
struct ReplaceCaption;

impl Listener for ReplaceCaption {
  fn on_enter(&self, ctx: &mut InvocationContext) {
    ctx.replace_nth_argument(2, REPLACED_CAPTION.as_ptr() as usize);
  }
}

/// Called when the DLL is attached to the process.
unsafe fn install_hook() -> Result<(), Box<dyn Error>> {
  // Retrieve an absolute address of `MessageBoxW`. This is required for
  // libraries due to the import address table. If `MessageBoxW` would be
  // provided directly as the target, it would only hook this DLL's
  // `MessageBoxW`. Using the method below an absolute address is retrieved
  // instead, instrumenting every invocation of `MessageBoxW` in the process.
  let address = get_module_symbol_address("user32.dll", "MessageBoxW")
    .expect("could not find 'MessageBoxW' address");
  let target: FnMessageBoxW = mem::transmute(address);

  Interceptor::global().attach(target as *const (), Arc::new(ReplaceCaption))?;
  Ok(())
}

/// Returns a module symbol's absolute address.
fn get_module_symbol_address(module: &str, symbol: &str) -> Option<usize> {
  let module = module
    .encode_utf16()
    .chain(iter::once(0))
    .collect::<Vec<u16>>();
  let symbol = CString::new(symbol).unwrap();
  unsafe {
    let handle = GetModuleHandleW(module.as_ptr());
    match GetProcAddress(handle, symbol.as_ptr()) as usize {
      0 => None,
      n => Some(n),
    }
  }
}

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn DllMain(
  _module: HINSTANCE,
  call_reason: DWORD,
  _reserved: LPVOID,
) -> BOOL {
  if call_reason == DLL_PROCESS_ATTACH {
    // A console may be useful for printing to 'stdout'
    // winapi::um::consoleapi::AllocConsole();

    // Preferably a thread should be created here instead, since as few
    // operations as possible should be performed within `DllMain`.
    install_hook().is_ok() as BOOL
  } else {
    TRUE
  }
}
