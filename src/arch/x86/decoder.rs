//! Component A — Instruction Decoder.
//!
//! Decodes one x86/x64 instruction at a time and classifies it just well
//! enough for the Relocator to do its job: is it a branch (and of what
//! kind), does it touch memory through `%rip`, how long is it. Full operand
//! reification is not attempted — ground truth for everything else stays in
//! the raw bytes, which every translation rule below copies verbatim unless
//! it has a specific reason not to.

use std::slice;

/// Why an instruction could not be decoded or handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
  /// No legal x86/x64 decoding exists at this address.
  Invalid,
  /// The encoding is legal but the engine refuses to rewrite it (reserved
  /// for forms the relocator cannot express a translation for).
  Unsupported,
}

impl From<DecodeError> for crate::error::Error {
  fn from(error: DecodeError) -> Self {
    match error {
      DecodeError::Invalid => crate::error::Error::DecodeInvalid,
      DecodeError::Unsupported => crate::error::Error::Unsupported,
    }
  }
}

/// Coarse classification of an instruction, enough to drive relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeClass {
  /// `mov`, `lea`, `push`/`pop` of data (not control flow).
  DataMove,
  /// Arithmetic/logic (`add`, `xor`, `cmp`, ...).
  Arithmetic,
  /// Stack manipulation not already covered by `DataMove` (`push`/`pop`,
  /// `enter`/`leave`).
  StackOp,
  /// `jmp rel8`/`jmp rel32` and loop-family instructions that always
  /// transfer control (`loop`, `jecxz`, ...).
  UnconditionalBranch,
  /// `Jcc rel8`/`Jcc rel32`.
  ConditionalBranch,
  /// `call rel32`.
  Call,
  /// `ret`/`ret imm16`.
  Return,
  /// `jmp r/m`, `call r/m` — target only known at runtime.
  IndirectBranch,
  /// Any instruction whose ModR/M encodes `[rip+disp32]` (x64 only).
  RipRelativeLoad,
  /// Everything not classified above.
  Other,
}

/// A decoded instruction, by value.
#[derive(Debug, Clone)]
pub struct InstructionRecord {
  /// Address the instruction starts at.
  pub address: usize,
  /// Length of the instruction in bytes.
  pub length: usize,
  /// Coarse opcode classification.
  pub class: OpcodeClass,
  /// Absolute branch target, if this instruction is any kind of direct
  /// (PC-relative) branch/call.
  pub branch_target: Option<usize>,
  /// True if the ModR/M byte encodes `[rip+disp32]`.
  pub has_rip_relative_operand: bool,
  /// Byte offset of the trailing disp32 field within the instruction, when
  /// known (populated for RIP-relative operands and rel32 branches; not
  /// reified for every encoding — see module docs).
  pub disp_offset: Option<usize>,
  /// The raw `[rip+disp32]` displacement, before relocation, when
  /// `has_rip_relative_operand` is set.
  pub rip_displacement: Option<i32>,
  /// Raw bytes of the instruction.
  bytes: Vec<u8>,
  mnemonic: Mnemonic,
}

impl InstructionRecord {
  /// Returns the instruction's raw bytes.
  pub fn as_slice(&self) -> &[u8] {
    &self.bytes
  }

  /// Address of the byte immediately following this instruction.
  pub fn next_address(&self) -> usize {
    self.address + self.length
  }

  pub fn is_call(&self) -> bool {
    self.class == OpcodeClass::Call
  }

  pub fn is_return(&self) -> bool {
    self.class == OpcodeClass::Return
  }

  pub fn is_unconditional_branch(&self) -> bool {
    self.class == OpcodeClass::UnconditionalBranch
  }

  pub fn is_conditional_branch(&self) -> bool {
    self.class == OpcodeClass::ConditionalBranch
  }

  pub fn is_indirect_branch(&self) -> bool {
    self.class == OpcodeClass::IndirectBranch
  }

  /// True for `loop`/`loope`/`loopne`/`jecxz`/`jcxz`/`jrcxz` — rel8-only,
  /// no long form exists.
  pub fn is_loop_family(&self) -> bool {
    matches!(self.mnemonic, Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne | Mnemonic::Jcxz)
  }

  /// True if this instruction is any kind of unconditional control
  /// transfer (`jmp`, `ret`, indirect jump) — i.e. the point the Relocator
  /// treats as the end of a basic block.
  pub fn is_block_terminator(&self) -> bool {
    match self.class {
      OpcodeClass::UnconditionalBranch | OpcodeClass::Return => true,
      OpcodeClass::IndirectBranch => self.mnemonic != Mnemonic::CallIndirect,
      _ => false,
    }
  }

  /// The primary condition-code nibble for a `Jcc`, if this is one
  /// (`0x74` ⟶ `4`, i.e. `JE`/`JZ`).
  pub fn condition_code(&self) -> Option<u8> {
    if self.class != OpcodeClass::ConditionalBranch {
      return None;
    }
    let primary = *self.bytes.iter().find(|op| **op != 0x0F)?;
    Some(primary & 0x0F)
  }

  pub(crate) fn mnemonic(&self) -> Mnemonic {
    self.mnemonic
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mnemonic {
  Jmp,
  Jcc,
  Call,
  CallIndirect,
  Ret,
  Loop,
  Loope,
  Loopne,
  Jcxz,
  Other,
}

/// A x86/x64 length-disassembler, backed by `udis86`.
pub struct Decoder(udis::ud);

impl Decoder {
  /// Creates a decoder that reads bytes starting at `start`.
  pub fn new(start: *const ()) -> Decoder {
    unsafe {
      let mut ud = std::mem::zeroed();
      udis::ud_init(&mut ud);
      udis::ud_set_user_opaque_data(&mut ud, start as *mut _);
      udis::ud_set_input_hook(&mut ud, Some(Self::read_one_byte));
      udis::ud_set_mode(&mut ud, (std::mem::size_of::<usize>() * 8) as u8);
      Decoder(ud)
    }
  }

  unsafe extern "C" fn read_one_byte(ud: *mut udis::ud) -> libc::c_int {
    let pointer = udis::ud_get_user_opaque_data(ud) as *mut u8;
    let byte = *pointer;
    udis::ud_set_user_opaque_data(ud, pointer.offset(1) as *mut _);
    libc::c_int::from(byte)
  }

  /// Decodes the instruction at `address`. The caller guarantees at least
  /// [`Target::MAX_INSTRUCTION_LEN`](crate::arch::Target::MAX_INSTRUCTION_LEN)
  /// readable bytes.
  pub fn decode(&mut self, address: *const ()) -> Result<InstructionRecord, DecodeError> {
    let length = unsafe { udis::ud_disassemble(&mut self.0) } as usize;
    if length == 0 {
      return Err(DecodeError::Invalid);
    }

    let bytes = unsafe { slice::from_raw_parts(address as *const u8, length) }.to_vec();
    let mnemonic_code = unsafe { udis::ud_insn_mnemonic(&self.0) };
    let operands = unsafe { self.0.operand.to_vec() };

    let mnemonic = classify_mnemonic(mnemonic_code);
    let rip_disp = rip_operand_displacement(&operands);
    let branch_disp = relative_branch_displacement(&operands);

    let address = address as usize;
    let has_rip_relative_operand = rip_disp.is_some();

    let (class, branch_target, disp_offset) = match mnemonic {
      Mnemonic::Call => (
        OpcodeClass::Call,
        branch_disp.map(|d| (address + length).wrapping_add(d as usize)),
        Some(length - 4),
      ),
      Mnemonic::Jmp => (
        OpcodeClass::UnconditionalBranch,
        branch_disp.map(|d| (address + length).wrapping_add(d as usize)),
        Some(length - if branch_disp.map_or(false, |d| fits_rel8(d)) { 1 } else { 4 }),
      ),
      Mnemonic::Jcc => (
        OpcodeClass::ConditionalBranch,
        branch_disp.map(|d| (address + length).wrapping_add(d as usize)),
        Some(length - if branch_disp.map_or(false, |d| fits_rel8(d)) { 1 } else { 4 }),
      ),
      Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne | Mnemonic::Jcxz => (
        OpcodeClass::UnconditionalBranch,
        branch_disp.map(|d| (address + length).wrapping_add(d as usize)),
        Some(length - 1),
      ),
      Mnemonic::Ret => (OpcodeClass::Return, None, None),
      Mnemonic::CallIndirect => (OpcodeClass::IndirectBranch, None, None),
      Mnemonic::Other if has_rip_relative_operand => {
        (OpcodeClass::RipRelativeLoad, None, Some(length - 4))
      }
      Mnemonic::Other => (OpcodeClass::Other, None, None),
    };

    Ok(InstructionRecord {
      address,
      length,
      class,
      branch_target,
      has_rip_relative_operand,
      disp_offset,
      rip_displacement: rip_disp.map(|d| d as i32),
      bytes,
      mnemonic,
    })
  }
}

fn fits_rel8(displacement: isize) -> bool {
  displacement >= i8::MIN as isize && displacement <= i8::MAX as isize
}

fn classify_mnemonic(code: udis::ud_mnemonic_code) -> Mnemonic {
  use udis::ud_mnemonic_code::*;
  match code {
    UD_Ijmp => Mnemonic::Jmp,
    UD_Icall => Mnemonic::Call,
    UD_Iret | UD_Iretf => Mnemonic::Ret,
    UD_Iloop => Mnemonic::Loop,
    UD_Iloope => Mnemonic::Loope,
    UD_Iloopne => Mnemonic::Loopne,
    UD_Ijcxz | UD_Ijecxz => Mnemonic::Jcxz,
    c if is_jcc(c) => Mnemonic::Jcc,
    _ => Mnemonic::Other,
  }
}

/// udis86 exposes every `Jcc` as its own mnemonic constant; match the
/// family by name range rather than enumerate all of them by hand.
fn is_jcc(code: udis::ud_mnemonic_code) -> bool {
  use udis::ud_mnemonic_code::*;
  matches!(
    code,
    UD_Ija | UD_Ijae | UD_Ijb | UD_Ijbe | UD_Ijcxz | UD_Ijecxz
      | UD_Ijg | UD_Ijge | UD_Ijl | UD_Ijle | UD_Ijno | UD_Ijnp
      | UD_Ijns | UD_Ijnz | UD_Ijo | UD_Ijp | UD_Ijs | UD_Ijz
  )
}

fn relative_branch_displacement(operands: &[udis::ud_operand]) -> Option<isize> {
  operands
    .iter()
    .find(|op| op.otype == udis::ud_type::UD_OP_JIMM)
    .map(|op| unsafe {
      match op.size {
        8 => op.lval.sbyte as isize,
        32 => op.lval.sdword as isize,
        _ => op.lval.sdword as isize,
      }
    })
}

fn rip_operand_displacement(operands: &[udis::ud_operand]) -> Option<isize> {
  operands
    .iter()
    .find(|op| op.otype == udis::ud_type::UD_OP_MEM && op.base == udis::ud_type::UD_R_RIP)
    .map(|op| unsafe { op.lval.sdword as isize })
}
