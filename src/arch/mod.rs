//! Architecture specific code.
//!
//! The engine is split so each target architecture exposes the same four
//! building blocks: a [`Decoder`](x86::Decoder), a [`Writer`](x86::Writer), a
//! [`Relocator`](x86::Relocator) and the patch-area sizing helpers the
//! Interceptor uses to arm/disarm a target. Only x86/x86-64 are implemented;
//! other architectures are an explicit non-goal (see `arch::arm` placeholder
//! removed from the teacher tree).

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        pub mod x86;
        pub use self::x86 as target;
    } else {
        compile_error!("only x86 and x86-64 are supported");
    }
}

/// The architecture a block of relocated code is being generated for.
///
/// Fixed once at engine creation. Determines pointer width, register
/// encodings and the maximum instruction length (15 bytes on both modes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
  /// 32-bit x86 (`ia32`).
  Ia32,
  /// 64-bit x86 (`x64`).
  X64,
}

impl Target {
  /// The target matching the process this code is compiled for.
  pub const NATIVE: Target = {
    #[cfg(target_arch = "x86_64")]
    {
      Target::X64
    }
    #[cfg(target_arch = "x86")]
    {
      Target::Ia32
    }
  };

  /// Pointer width in bytes for this target.
  pub fn pointer_width(self) -> usize {
    match self {
      Target::Ia32 => 4,
      Target::X64 => 8,
    }
  }

  /// The maximum length of a single x86 instruction, in bytes.
  pub const MAX_INSTRUCTION_LEN: usize = 15;
}

/// The furthest distance between a target and a patch destination reachable
/// with a rel32 branch (2 GiB, biased down by a page so near-allocation
/// always has slack — see `alloc::pages::alloc_pages_near`).
pub const DETOUR_RANGE: usize = 0x8000_0000;

/// Returns true if the displacement is within rel32 branch range.
pub fn is_within_range(displacement: isize) -> bool {
  let range = DETOUR_RANGE as i64;
  (-range..range).contains(&(displacement as i64))
}
