//! Builds the on-trampoline layout: relocated prologue, tail jump back into
//! the target, and the on-enter/on-leave dispatcher thunks (§3 "Function
//! context" / §4.D step 3-4).
//!
//! Grounded on the teacher's `arch::detour::Detour::new` choreography (lock,
//! relocate prologue, build trampoline, patch) for the overall shape, and on
//! Frida-gum's own thunk layout (`original_source/` does not carry the
//! assembly itself — the gum headers describe the *interface*, not the
//! trampoline bytes — so the push/pop sequence here is original to this
//! crate, built directly on Component B/C).

use crate::arch::x86::relocator::Relocator;
use crate::arch::x86::thunk;
use crate::arch::x86::writer::Writer;
use crate::arch::Target;
use crate::error::Result;
use crate::interceptor::function_context::FunctionContextData;
use crate::interceptor::listener_dispatch;
use crate::interceptor::registers::{RegisterFile, ReturnValue};

/// Raw register index constants, matching `arch::x86::thunk::{push,pop}_reg`.
mod reg {
  pub const RAX: u8 = 0;
  pub const RCX: u8 = 1;
  pub const RDX: u8 = 2;
  pub const RBX: u8 = 3;
  pub const RSP: u8 = 4;
  pub const RBP: u8 = 5;
  pub const RSI: u8 = 6;
  pub const RDI: u8 = 7;
  pub const R8: u8 = 8;
  pub const R9: u8 = 9;
  pub const R10: u8 = 10;
  pub const R11: u8 = 11;
  pub const R12: u8 = 12;
  pub const R13: u8 = 13;
  pub const R14: u8 = 14;
  pub const R15: u8 = 15;
}

cfg_if::cfg_if! {
  if #[cfg(windows)] {
    const ARG1: u8 = reg::RCX;
    const ARG2: u8 = reg::RDX;
    const SHADOW_SPACE: usize = 32;
  } else {
    const ARG1: u8 = reg::RDI;
    const ARG2: u8 = reg::RSI;
    const SHADOW_SPACE: usize = 0;
  }
}

/// Everything the Interceptor needs to know about a built trampoline.
pub struct TrampolineLayout {
  /// Length of the prologue overwritten at the target (`N`).
  pub prologue_length: usize,
  /// Byte length of the whole trampoline.
  pub total_length: usize,
  /// Input-offset → output-offset mapping for the relocated prologue,
  /// inherited from the `Relocator` session (§3) — used to adjust a
  /// suspended thread's IP onto the equivalent trampoline offset when it
  /// is caught mid-prologue during a patch.
  pub mapping: Vec<(usize, usize)>,
  /// Offset of the on-enter thunk — where the redirect jump at the target
  /// must point.
  pub on_enter_offset: usize,
  /// Offset of the on-leave thunk — where the enter dispatcher points a
  /// call's forged return address.
  pub on_leave_offset: usize,
}

/// Builds the trampoline into `buffer` (already allocated at `base`,
/// executable once `flush_icache`d) for `target`, given the already-decided
/// prologue length `prologue_length`. `context` is a raw, stable pointer to
/// the function context's shared dispatch data — baked into the thunks as
/// an immediate, read by the dispatcher functions below without taking the
/// global interceptor lock (§5).
pub fn build(
  target: *const (),
  target_arch: Target,
  prologue_length: usize,
  base: usize,
  buffer: &mut [u8],
  context: *const FunctionContextData,
) -> Result<TrampolineLayout> {
  let mut writer = Writer::new(target_arch, base, buffer);

  // (a) relocated copy of the overwritten prologue.
  let mut relocator = Relocator::init(target, target_arch, &mut writer);
  let mut consumed = 0;
  while consumed < prologue_length {
    match relocator.read_one()? {
      crate::arch::x86::relocator::ReadOutcome::Decoded(len) => consumed += len,
      crate::arch::x86::relocator::ReadOutcome::EndOfBlock(len) => {
        consumed += len;
        break;
      }
    }
  }
  relocator.write_all()?;
  let mapping = relocator.mapping().to_vec();

  // (b) tail jump back to target + N, unless the prologue itself already
  // ended in an unconditional transfer (a very short function whose entire
  // body fit in the margin — then there is nothing to return to).
  if !relocator.eoi() {
    writer.put_jmp(target as usize + prologue_length)?;
  }

  // (c) on-enter thunk. The redirect jump at `target` lands here, *ahead
  // of* the relocated prologue; after the enter thunk restores the saved
  // registers it jumps back to offset 0 to actually run the prologue. The
  // on-leave thunk is reached later, by the hijacked return address rather
  // than by falling through from here (see `listener_dispatch`).
  let on_enter_offset = writer.offset();
  emit_enter_thunk(&mut writer, context as usize)?;
  writer.put_jmp(base)?;

  // (d) on-leave thunk.
  let on_leave_offset = writer.offset();
  emit_leave_thunk(&mut writer, context as usize)?;

  writer.flush()?;

  let total_length = writer.offset();

  Ok(TrampolineLayout { prologue_length, total_length, mapping, on_enter_offset, on_leave_offset })
}

/// Saves the full integer register file + flags, calls into
/// [`enter_dispatch`] with `(context, regs_ptr)`, then restores the
/// (possibly listener-mutated) registers.
///
/// Push order is `rax, rcx, rdx, rbx, rbp, rsi, rdi, r8..r15, rflags` — 16
/// slots of 8 bytes, a multiple of 16, so stack alignment at the `call`
/// below is preserved automatically (see `registers::RegisterFile` docs).
fn emit_enter_thunk(writer: &mut Writer, context: usize) -> Result<()> {
  for r in [reg::RAX, reg::RCX, reg::RDX, reg::RBX, reg::RBP, reg::RSI, reg::RDI,
            reg::R8, reg::R9, reg::R10, reg::R11, reg::R12, reg::R13, reg::R14, reg::R15] {
    writer.put_bytes(&thunk::push_reg(r))?;
  }
  writer.put_bytes(&[thunk::PUSHF])?;

  if SHADOW_SPACE > 0 {
    writer.put_bytes(&sub_rsp(SHADOW_SPACE))?;
  }

  writer.put_bytes(&thunk::mov_reg_imm64(ARG1, context as u64))?;
  writer.put_bytes(&mov_reg_from_rsp(ARG2, if SHADOW_SPACE > 0 { SHADOW_SPACE } else { 0 }))?;
  writer.put_bytes(&thunk::mov_reg_imm64(reg::RAX, enter_dispatch as usize as u64))?;
  writer.put_bytes(&thunk::call_reg(reg::RAX))?;

  if SHADOW_SPACE > 0 {
    writer.put_bytes(&add_rsp(SHADOW_SPACE))?;
  }

  writer.put_bytes(&[thunk::POPF])?;
  for r in [reg::R15, reg::R14, reg::R13, reg::R12, reg::R11, reg::R10, reg::R9, reg::R8,
            reg::RDI, reg::RSI, reg::RBP, reg::RBX, reg::RDX, reg::RCX, reg::RAX] {
    writer.put_bytes(&thunk::pop_reg(r))?;
  }
  Ok(())
}

/// Mirrors `emit_enter_thunk` for the leave side: only `rax`/`rflags` are
/// meaningful by the time a function returns, so only those are saved.
fn emit_leave_thunk(writer: &mut Writer, context: usize) -> Result<()> {
  writer.put_bytes(&thunk::push_reg(reg::RAX))?;
  writer.put_bytes(&[thunk::PUSHF])?;

  if SHADOW_SPACE > 0 {
    writer.put_bytes(&sub_rsp(SHADOW_SPACE))?;
  }

  writer.put_bytes(&thunk::mov_reg_imm64(ARG1, context as u64))?;
  writer.put_bytes(&mov_reg_from_rsp(ARG2, if SHADOW_SPACE > 0 { SHADOW_SPACE } else { 0 }))?;
  writer.put_bytes(&thunk::mov_reg_imm64(reg::R11, leave_dispatch as usize as u64))?;
  writer.put_bytes(&thunk::call_reg(reg::R11))?;

  if SHADOW_SPACE > 0 {
    writer.put_bytes(&add_rsp(SHADOW_SPACE))?;
  }

  // `leave_dispatch` returns the real return address in `rax`; stash it in
  // `r11` (caller-saved, free in both ABIs here) before restoring the
  // listener-visible `rax`/`rflags` pair, then jump there.
  writer.put_bytes(&mov_r11_from_rax())?;
  writer.put_bytes(&[thunk::POPF])?;
  writer.put_bytes(&thunk::pop_reg(reg::RAX))?;
  writer.put_bytes(&thunk::jmp_reg(reg::R11))?;
  Ok(())
}

fn sub_rsp(amount: u8) -> [u8; 4] {
  [0x48, 0x83, 0xEC, amount]
}

fn add_rsp(amount: u8) -> [u8; 4] {
  [0x48, 0x83, 0xC4, amount]
}

/// `mov dst, rsp`, REX.W + `89` /r, then adds `extra` via a following `add`
/// if the shadow space was already reserved (so the pointer handed to the
/// dispatcher still points at the saved register block, not the shadow
/// space above it).
fn mov_reg_from_rsp(dst: u8, extra: usize) -> Vec<u8> {
  let mut out = vec![0x48 | if dst >= 8 { 0x01 } else { 0x00 }, 0x89, 0xE0 | (dst & 0x7)];
  if extra > 0 {
    out.extend_from_slice(&[0x48 | if dst >= 8 { 0x01 } else { 0x00 }, 0x83, 0xC0 | (dst & 0x7), extra as u8]);
  }
  out
}

/// `mov r11, rax`, REX.WB + `89` /r.
fn mov_r11_from_rax() -> [u8; 3] {
  [0x49, 0x89, 0xC3]
}

/// Called from the on-enter thunk. Pushes a new invocation frame, runs
/// every listener's `on_enter` in insertion order (unless this thread has
/// opted out), and overwrites the saved return-address slot so the
/// function's eventual `ret` lands on the on-leave thunk instead of the
/// real caller.
extern "C" fn enter_dispatch(context: *const FunctionContextData, regs: *mut RegisterFile) {
  unsafe { listener_dispatch::dispatch_enter(context, regs) }
}

/// Called from the on-leave thunk. Pops the matching invocation frame, runs
/// every listener's `on_leave` in reverse insertion order, and returns the
/// real original return address for the thunk to jump to.
extern "C" fn leave_dispatch(context: *const FunctionContextData, regs: *mut ReturnValue) -> usize {
  unsafe { listener_dispatch::dispatch_leave(context, regs) }
}
