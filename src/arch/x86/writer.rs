//! Component B — Code Writer.
//!
//! A single-pass emitter over a caller-owned executable buffer. Every typed
//! emitter either writes a complete instruction and advances the cursor, or
//! leaves the cursor untouched and returns [`Error::BufferFull`]. Internal
//! branches are written through labels and patched once, in [`flush`],
//! which is the only place the writer re-reads memory it has already
//! written.
//!
//! [`flush`]: Writer::flush

use crate::arch::x86::thunk;
use crate::arch::Target;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// An opaque label. Bound at most once with [`Writer::put_label`] and
/// referenced any number of times with [`Writer::put_branch_to_label`]
/// before the first (and only) call to [`Writer::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub usize);

/// What kind of branch a pending label reference should resolve to.
#[derive(Debug, Clone, Copy)]
pub enum BranchKind {
  /// `jmp rel32`.
  Jmp,
  /// `Jcc rel32`, condition is the low nibble of the opcode.
  Jcc(u8),
  /// `jmp rel8` — only ever used for the short hop the LOOP/JCXZ expansion
  /// emits over its own `jmp rel32`, where the target is always in range.
  JmpShort,
  /// Prefix/opcode bytes with a trailing rel8, reusing the original
  /// instruction's own bytes (e.g. `LOOP`/`LOOPE`/`LOOPNE`/`JCXZ`, including
  /// any address-size override prefix `JECXZ` needs). Used so the LOOP/JCXZ
  /// expansion's leading branch still tests the original condition instead
  /// of jumping unconditionally.
  RawShort(Vec<u8>),
}

struct PendingBranch {
  /// Offset of the start of the displacement field.
  field_offset: usize,
  /// Width of the displacement field, in bytes (1 or 4).
  width: u8,
  /// Offset of the byte immediately after the branch instruction — the
  /// origin relative displacements are computed from.
  next_offset: usize,
  label: Label,
}

/// Component B. Emits instructions into `buffer`, starting at `base`
/// (the address `buffer[0]` will have once it is executed — not necessarily
/// equal to `buffer.as_ptr()` during construction in tests).
pub struct Writer<'a> {
  target: Target,
  base: usize,
  buffer: &'a mut [u8],
  cursor: usize,
  labels: HashMap<Label, usize>,
  pending: Vec<PendingBranch>,
}

impl<'a> Writer<'a> {
  pub fn new(target: Target, base: usize, buffer: &'a mut [u8]) -> Self {
    Writer { target, base, buffer, cursor: 0, labels: HashMap::new(), pending: Vec::new() }
  }

  /// Current cursor position, in bytes from `base`.
  pub fn offset(&self) -> usize {
    self.cursor
  }

  /// The address the next emitted byte will end up at once executed.
  pub fn address(&self) -> usize {
    self.base + self.cursor
  }

  /// The address `buffer[0]` will have once executed.
  pub fn base(&self) -> usize {
    self.base
  }

  fn reserve(&mut self, len: usize) -> Result<usize> {
    if self.cursor + len > self.buffer.len() {
      return Err(Error::BufferFull);
    }
    let at = self.cursor;
    self.cursor += len;
    Ok(at)
  }

  /// Copies raw bytes verbatim, advancing the cursor.
  pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
    let at = self.reserve(bytes.len())?;
    self.buffer[at..at + bytes.len()].copy_from_slice(bytes);
    Ok(())
  }

  pub fn put_nop(&mut self) -> Result<()> {
    self.put_bytes(&[thunk::NOP])
  }

  /// `jmp rel32` to an already-known absolute address.
  pub fn put_jmp(&mut self, destination: usize) -> Result<()> {
    let at = self.reserve(5)?;
    let code = thunk::relative32(self.base + at + 5, destination, false);
    self.buffer[at..at + 5].copy_from_slice(&code);
    Ok(())
  }

  /// `call rel32` to an already-known absolute address.
  pub fn put_call(&mut self, destination: usize) -> Result<()> {
    let at = self.reserve(5)?;
    let code = thunk::relative32(self.base + at + 5, destination, true);
    self.buffer[at..at + 5].copy_from_slice(&code);
    Ok(())
  }

  /// `Jcc rel32` to an already-known absolute address.
  pub fn put_jcc(&mut self, condition: u8, destination: usize) -> Result<()> {
    let at = self.reserve(6)?;
    let code = thunk::jcc_rel32(self.base + at + 6, destination, condition);
    self.buffer[at..at + 6].copy_from_slice(&code);
    Ok(())
  }

  /// Absolute jump, x64 only, 14 bytes. On x86 this degrades to `jmp rel32`
  /// since the full 32-bit address space is always in rel32 range.
  pub fn put_jmp_abs(&mut self, destination: usize) -> Result<()> {
    match self.target {
      Target::X64 => {
        let at = self.reserve(14)?;
        let code = thunk::jmp_abs(destination);
        self.buffer[at..at + 14].copy_from_slice(&code);
        Ok(())
      }
      Target::Ia32 => self.put_jmp(destination),
    }
  }

  /// Absolute call, x64 only, 16 bytes. Degrades to `call rel32` on x86.
  pub fn put_call_abs(&mut self, destination: usize) -> Result<()> {
    match self.target {
      Target::X64 => {
        let at = self.reserve(16)?;
        let code = thunk::call_abs(destination);
        self.buffer[at..at + 16].copy_from_slice(&code);
        Ok(())
      }
      Target::Ia32 => self.put_call(destination),
    }
  }

  /// Absolute `Jcc`, x64 only, 16 bytes. Degrades to `Jcc rel32` on x86.
  pub fn put_jcc_abs(&mut self, condition: u8, destination: usize) -> Result<()> {
    match self.target {
      Target::X64 => {
        let at = self.reserve(16)?;
        let code = thunk::jcc_abs(destination, condition);
        self.buffer[at..at + 16].copy_from_slice(&code);
        Ok(())
      }
      Target::Ia32 => self.put_jcc(condition, destination),
    }
  }

  /// Binds `label` to the current cursor position. A label may be bound at
  /// most once.
  pub fn put_label(&mut self, label: Label) -> Result<()> {
    if self.labels.insert(label, self.cursor).is_some() {
      // Re-binding silently would make `flush` resolve against whichever
      // binding happened to win; that's an invariant violation upstream
      // (the relocator only ever binds the instruction-start offset once).
      return Err(Error::UnboundLabel);
    }
    Ok(())
  }

  /// Emits a branch whose displacement cannot be known until `label` is
  /// bound, and records it for patching in [`flush`].
  pub fn put_branch_to_label(&mut self, label: Label, kind: BranchKind) -> Result<()> {
    match kind {
      BranchKind::Jmp => {
        let at = self.reserve(5)?;
        self.buffer[at] = 0xE9;
        self.pending.push(PendingBranch { field_offset: at + 1, width: 4, next_offset: at + 5, label });
      }
      BranchKind::Jcc(condition) => {
        let at = self.reserve(6)?;
        self.buffer[at] = 0x0F;
        self.buffer[at + 1] = 0x80 | (condition & 0x0F);
        self.pending.push(PendingBranch { field_offset: at + 2, width: 4, next_offset: at + 6, label });
      }
      BranchKind::JmpShort => {
        let at = self.reserve(2)?;
        self.buffer[at] = 0xEB;
        self.pending.push(PendingBranch { field_offset: at + 1, width: 1, next_offset: at + 2, label });
      }
      BranchKind::RawShort(prefix_and_opcode) => {
        let len = prefix_and_opcode.len() + 1;
        let at = self.reserve(len)?;
        self.buffer[at..at + prefix_and_opcode.len()].copy_from_slice(&prefix_and_opcode);
        self.pending.push(PendingBranch {
          field_offset: at + prefix_and_opcode.len(),
          width: 1,
          next_offset: at + len,
          label,
        });
      }
    }
    Ok(())
  }

  /// Resolves every pending label reference. Must be called exactly once,
  /// after every branch target has been bound with `put_label`.
  pub fn flush(&mut self) -> Result<()> {
    for pending in &self.pending {
      let target_offset = *self
        .labels
        .get(&pending.label)
        .ok_or(Error::UnboundLabel)?;

      let displacement = target_offset as isize - pending.next_offset as isize;

      match pending.width {
        1 => {
          if displacement < i8::MIN as isize || displacement > i8::MAX as isize {
            return Err(Error::DisplacementOverflow);
          }
          self.buffer[pending.field_offset] = displacement as i8 as u8;
        }
        4 => {
          if displacement < i32::MIN as isize || displacement > i32::MAX as isize {
            return Err(Error::DisplacementOverflow);
          }
          let bytes = (displacement as i32).to_le_bytes();
          self.buffer[pending.field_offset..pending.field_offset + 4].copy_from_slice(&bytes);
        }
        _ => unreachable!("only 1- and 4-byte displacement fields are ever recorded"),
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn jmp_rel32_encoding() {
    let mut buf = [0u8; 16];
    let base = 0x5000_0000usize;
    {
      let mut w = Writer::new(Target::X64, base, &mut buf);
      w.put_jmp(base + 0x15).unwrap();
    }
    assert_eq!(buf[0], 0xE9);
    let disp = i32::from_le_bytes(buf[1..5].try_into().unwrap());
    assert_eq!(disp, 0x15 - 5);
  }

  #[test]
  fn label_round_trip() {
    let mut buf = [0u8; 32];
    {
      let mut w = Writer::new(Target::X64, 0x1000, &mut buf);
      w.put_branch_to_label(Label(1), BranchKind::Jcc(0x4)).unwrap();
      w.put_nop().unwrap();
      w.put_label(Label(1)).unwrap();
      w.flush().unwrap();
    }
    assert_eq!(buf[0], 0x0F);
    assert_eq!(buf[1], 0x84);
    let disp = i32::from_le_bytes(buf[2..6].try_into().unwrap());
    assert_eq!(disp, 1); // one nop byte between the jcc and its target
  }

  #[test]
  fn buffer_full_leaves_cursor_unchanged() {
    let mut buf = [0u8; 3];
    let mut w = Writer::new(Target::X64, 0, &mut buf);
    assert!(matches!(w.put_jmp(0x100), Err(Error::BufferFull)));
    assert_eq!(w.offset(), 0);
  }
}
