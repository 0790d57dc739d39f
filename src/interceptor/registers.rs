//! The on-trampoline thunks save the complete integer register file (plus
//! flags) to a private stack before calling into Rust. [`RegisterFile`] is
//! the `#[repr(C)]` view of exactly that memory layout, so a raw `*mut
//! RegisterFile` handed up from assembly aliases the pushed bytes directly
//! — no copying, no marshalling.
//!
//! Field order matters: it is the *reverse* of push order (the last thing
//! pushed ends up at the lowest address, i.e. the first field). See
//! `interceptor::trampoline` for the actual push sequence this mirrors.

/// The complete integer register file captured on entry to an intercepted
/// function, plus `rflags`. Exposed to listeners only indirectly, through
/// [`InvocationContext`](super::InvocationContext)'s argument/return-value
/// accessors — the raw fields are crate-private.
#[repr(C)]
#[derive(Debug)]
pub struct RegisterFile {
  pub(crate) rflags: u64,
  pub(crate) r15: u64,
  pub(crate) r14: u64,
  pub(crate) r13: u64,
  pub(crate) r12: u64,
  pub(crate) r11: u64,
  pub(crate) r10: u64,
  pub(crate) r9: u64,
  pub(crate) r8: u64,
  pub(crate) rdi: u64,
  pub(crate) rsi: u64,
  pub(crate) rbp: u64,
  pub(crate) rbx: u64,
  pub(crate) rdx: u64,
  pub(crate) rcx: u64,
  pub(crate) rax: u64,
}

/// Number of 8-byte slots `RegisterFile` occupies on the stack. Kept as a
/// named constant because the trampoline builder needs it to compute the
/// stack-argument spill offset and the original-return-address slot.
pub const REGISTER_FILE_SLOTS: usize = 16;

/// The small block the on-leave thunk saves: just the raw return value and
/// flags, captured before the Rust dispatcher runs so listeners can inspect
/// and mutate it.
#[repr(C)]
#[derive(Debug)]
pub struct ReturnValue {
  pub(crate) rflags: u64,
  pub(crate) rax: u64,
}

/// Calling convention used for `get_nth_argument`/`replace_nth_argument`.
/// Fixed per build target — mixing ABIs within one process is not a
/// supported configuration.
#[derive(Debug, Clone, Copy)]
enum Abi {
  /// System V AMD64 (Linux, macOS, *BSD): integer args in
  /// `rdi,rsi,rdx,rcx,r8,r9`, then the stack.
  SystemV,
  /// Microsoft x64 (Windows): integer args in `rcx,rdx,r8,r9`, then the
  /// stack (with 32 bytes of caller-allocated shadow space below them).
  Win64,
}

#[cfg(windows)]
const ABI: Abi = Abi::Win64;
#[cfg(not(windows))]
const ABI: Abi = Abi::SystemV;

/// Bytes of caller-allocated shadow (home) space below the return address
/// on Win64, which sits below the first stack-passed argument even though
/// no argument is ever spilled into it. Zero on System V, which has none.
fn shadow_space() -> usize {
  match ABI {
    Abi::SystemV => 0,
    Abi::Win64 => 32,
  }
}

impl RegisterFile {
  /// Reads the `n`th integer/pointer argument, per the platform calling
  /// convention. `entry_rsp` is the stack pointer at the moment the target
  /// function was entered (i.e. pointing at the return address) — needed
  /// to read stack-spilled arguments beyond the register ones.
  pub(crate) unsafe fn nth_argument(&self, n: usize, entry_rsp: usize) -> usize {
    let register_args: [u64; 6] = match ABI {
      Abi::SystemV => [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9],
      Abi::Win64 => [self.rcx, self.rdx, self.r8, self.r9, 0, 0],
    };
    let register_count = match ABI {
      Abi::SystemV => 6,
      Abi::Win64 => 4,
    };

    if n < register_count {
      register_args[n] as usize
    } else {
      // Stack arguments sit above the return address; on Win64 the first
      // stack argument additionally sits above the 32-byte shadow space the
      // caller reserved for the register arguments, so `n=4` lands at
      // `rsp+40`, not `rsp+8`.
      let slot = entry_rsp + 8 + shadow_space() + 8 * (n - register_count);
      *(slot as *const usize)
    }
  }

  /// Overwrites the `n`th argument. See [`Self::nth_argument`] for the
  /// register/stack split. Arguments beyond the register-argument count
  /// are spilled through the stack slot directly — see
  /// `InvocationContext::replace_nth_argument` for why a no-op was
  /// rejected.
  pub(crate) unsafe fn set_nth_argument(&mut self, n: usize, value: usize, entry_rsp: usize) {
    let register_count = match ABI {
      Abi::SystemV => 6,
      Abi::Win64 => 4,
    };

    if n < register_count {
      let slot = match (ABI, n) {
        (Abi::SystemV, 0) => &mut self.rdi,
        (Abi::SystemV, 1) => &mut self.rsi,
        (Abi::SystemV, 2) => &mut self.rdx,
        (Abi::SystemV, 3) => &mut self.rcx,
        (Abi::SystemV, 4) => &mut self.r8,
        (Abi::SystemV, 5) => &mut self.r9,
        (Abi::Win64, 0) => &mut self.rcx,
        (Abi::Win64, 1) => &mut self.rdx,
        (Abi::Win64, 2) => &mut self.r8,
        (Abi::Win64, 3) => &mut self.r9,
        _ => unreachable!("n < register_count"),
      };
      *slot = value as u64;
    } else {
      let slot = entry_rsp + 8 + shadow_space() + 8 * (n - register_count);
      *(slot as *mut usize) = value;
    }
  }
}
