//! Patch-area sizing and hot-patch detection.
//!
//! Grounded on the teacher's `arch::x86::patcher::Patcher::get_patch_area`/
//! `is_patchable`/`is_code_padding` (`darfink-detour-rs`), restated against
//! the new [`can_relocate`] probe instead of a fixed "does a rel32 jump
//! fit" check, since the Interceptor needs to know the whole-instruction
//! prologue length *before* it knows whether the trampoline will land close
//! enough for a 5-byte jump or needs the 14-byte absolute form.

use crate::arch::x86::relocator::can_relocate;
use crate::arch::Target;
use crate::error::{Error, Result};

/// `jmp rel32`, the short redirect form.
pub const REL32_JUMP_LEN: usize = 5;
/// `jmp [rip+0]; dq target` (x64 only), the long redirect form used when
/// the trampoline lands outside rel32 range of the target.
pub const ABS_JUMP_LEN: usize = 14;

/// Bytes considered padding between functions: `int3`, `nop`, zero.
const PADDING: [u8; 3] = [0xCC, 0x90, 0x00];

/// Computes the prologue length *N* to overwrite at `target`: the smallest
/// whole-instruction span covering at least `jump_len` bytes, using a
/// hot-patch area above the function when the function body alone is too
/// short and is preceded by padding.
///
/// Returns `(prologue_length, used_hot_patch)`.
pub fn prologue_length(target: *const (), target_arch: Target, jump_len: usize) -> Result<(usize, bool)> {
  let direct = can_relocate(target, jump_len);
  if direct >= jump_len {
    return Ok((direct, false));
  }

  // The function body alone doesn't have enough whole instructions to
  // cover `jump_len` — see if there's a short-jump-sized hot patch area
  // immediately before the function, entirely padding, that a short jump
  // could redirect through into a full-size jump written over that
  // padding. This only helps when the function itself has room for at
  // least a 2-byte short jump.
  let short_jump_len = 2;
  let direct_short = can_relocate(target, short_jump_len);
  if direct_short < short_jump_len {
    return Err(Error::NoPatchArea);
  }

  let hot_patch_start = (target as usize).wrapping_sub(jump_len);
  let hot_patch = unsafe { std::slice::from_raw_parts(hot_patch_start as *const u8, jump_len) };

  if !is_code_padding(hot_patch) || !crate::util::is_executable_address(hot_patch_start as *const ())? {
    return Err(Error::NoPatchArea);
  }

  let _ = target_arch;
  Ok((direct_short, true))
}

fn is_code_padding(bytes: &[u8]) -> bool {
  bytes.iter().all(|b| PADDING.contains(b))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn padding_detection() {
    assert!(is_code_padding(&[0x90, 0x90, 0xCC, 0x00]));
    assert!(!is_code_padding(&[0x90, 0x41]));
  }
}
