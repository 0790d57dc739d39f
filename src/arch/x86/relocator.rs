//! Component C — Relocator.
//!
//! Reads instructions from an input window through the [`Decoder`] and hands
//! semantics-preserving translations to a [`Writer`], maintaining the
//! input-offset → output-offset mapping that lets branches inside the
//! relocated window resolve correctly however much earlier instructions in
//! the window grew or shrank.

use crate::arch::x86::decoder::{Decoder, InstructionRecord};
use crate::arch::x86::writer::{BranchKind, Label, Writer};
use crate::arch::{is_within_range, Target};
use crate::error::{Error, Result};

/// What `read_one` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
  /// An instruction was decoded and queued; more may follow.
  Decoded(usize),
  /// An instruction was decoded, queued, *and* it was an unconditional
  /// control transfer — the caller should treat the prologue as complete.
  EndOfBlock(usize),
}

/// Component C. One relocation session, reading from `input` and writing
/// through `writer`.
pub struct Relocator<'a, 'b> {
  target: Target,
  input_base: usize,
  decoder: Decoder,
  end_offset: usize,
  finished: bool,
  queue: Vec<InstructionRecord>,
  /// (input_offset, output_offset), strictly increasing by input_offset.
  mapping: Vec<(usize, usize)>,
  writer: &'a mut Writer<'b>,
}

impl<'a, 'b> Relocator<'a, 'b> {
  /// Begins a relocation session reading from `input`.
  pub fn init(input: *const (), target: Target, writer: &'a mut Writer<'b>) -> Self {
    Relocator {
      target,
      input_base: input as usize,
      decoder: Decoder::new(input),
      end_offset: 0,
      finished: false,
      queue: Vec::new(),
      mapping: vec![(0, 0)],
      writer,
    }
  }

  /// Decodes the next input instruction and enqueues it for translation.
  pub fn read_one(&mut self) -> Result<ReadOutcome> {
    let address = (self.input_base + self.end_offset) as *const ();
    let instr = self.decoder.decode(address).map_err(Error::from)?;
    let len = instr.length;
    let is_end = instr.is_block_terminator();

    self.end_offset += len;
    self.queue.push(instr);
    self.finished = self.finished || is_end;

    Ok(if is_end { ReadOutcome::EndOfBlock(len) } else { ReadOutcome::Decoded(len) })
  }

  /// Have all unconditionals been encountered yet?
  pub fn eoi(&self) -> bool {
    self.finished
  }

  /// Dequeues one instruction and emits its translation. Returns `false` if
  /// nothing was queued.
  pub fn write_one(&mut self) -> Result<bool> {
    if self.queue.is_empty() {
      return Ok(false);
    }
    let instr = self.queue.remove(0);
    let input_offset = instr.address - self.input_base;
    let output_offset = self.writer.offset();

    // Bind a label at this instruction's translated start *before*
    // translating it, so any earlier-queued branch whose target is this
    // instruction's address (an in-window branch, §4.C rule 3) resolves
    // correctly at `flush`.
    self.writer.put_label(Label(instr.address))?;
    self.translate(&instr)?;

    self.mapping.push((input_offset, output_offset));
    Ok(true)
  }

  /// Drains the queue, translating every instruction in order.
  pub fn write_all(&mut self) -> Result<()> {
    while self.write_one()? {}
    Ok(())
  }

  /// Resolves an absolute input address to its output offset, if that
  /// address was the start of a translated instruction.
  pub fn relocated_offset(&self, input_address: usize) -> Option<usize> {
    let target = input_address.checked_sub(self.input_base)?;
    self
      .mapping
      .iter()
      .find(|(input_offset, _)| *input_offset == target)
      .map(|(_, output_offset)| *output_offset)
  }

  /// Total bytes consumed from the input so far.
  pub fn input_length(&self) -> usize {
    self.end_offset
  }

  /// The full input-offset → output-offset mapping built so far. Used by
  /// the Interceptor to adjust a suspended thread's instruction pointer
  /// onto the equivalent trampoline offset when it is caught mid-prologue
  /// during a patch (§4.D "Atomic patch policy").
  pub fn mapping(&self) -> &[(usize, usize)] {
    &self.mapping
  }

  fn in_window(&self, absolute_address: usize) -> bool {
    absolute_address >= self.input_base && absolute_address < self.input_base + self.end_offset
  }

  fn translate(&mut self, instr: &InstructionRecord) -> Result<()> {
    if instr.has_rip_relative_operand {
      return self.translate_rip_relative(instr);
    }

    if instr.is_loop_family() {
      return self.translate_loop_family(instr);
    }

    if instr.is_call() {
      return self.translate_call(instr);
    }

    if instr.is_unconditional_branch() || instr.is_conditional_branch() {
      return self.translate_branch(instr);
    }

    // Identity: returns, indirect branches, and everything else copy
    // verbatim — they carry no position-dependent operand.
    self.writer.put_bytes(instr.as_slice())
  }

  fn translate_call(&mut self, instr: &InstructionRecord) -> Result<()> {
    let target = instr.branch_target.expect("CALL rel32 always carries a branch target");
    let source_of_next = self.writer.address() + 5;
    let displacement = target as isize - source_of_next as isize;

    if is_within_range(displacement) {
      self.writer.put_call(target)
    } else {
      // Calls always return to the instruction after them, regardless of
      // where they're relocated to, so there is no window-membership case
      // to consider here — only reachability.
      self.writer.put_call_abs(target)
    }
  }

  fn translate_branch(&mut self, instr: &InstructionRecord) -> Result<()> {
    let target = instr.branch_target.expect("Jcc/JMP rel* always carry a branch target");
    let condition = instr.condition_code();

    if self.in_window(target) {
      let label = Label(target);
      return match condition {
        Some(c) => self.writer.put_branch_to_label(label, BranchKind::Jcc(c)),
        None => self.writer.put_branch_to_label(label, BranchKind::Jmp),
      };
    }

    // Target is outside the relocated window: widen unconditionally to a
    // long-form branch at the original absolute destination.
    let field_width = if condition.is_some() { 6 } else { 5 };
    let displacement = target as isize - (self.writer.address() + field_width) as isize;

    if is_within_range(displacement) {
      match condition {
        Some(c) => self.writer.put_jcc(c, target),
        None => self.writer.put_jmp(target),
      }
    } else {
      match condition {
        Some(c) => self.writer.put_jcc_abs(c, target),
        None => self.writer.put_jmp_abs(target),
      }
    }
  }

  /// `LOOP`/`LOOPE`/`LOOPNE`/`JCXZ`/`JECXZ`/`JRCXZ` — rel8-only, no long
  /// form. Expanded to: `<opcode> +2; jmp rel32 over; jmp rel32 target`,
  /// where the leading instruction reuses the original opcode byte (so it
  /// still tests the original loop/jcxz condition) and branches over the
  /// unconditional jump when the loop would not be taken.
  fn translate_loop_family(&mut self, instr: &InstructionRecord) -> Result<()> {
    let target = instr.branch_target.expect("loop-family instructions always carry a target");
    // The rel8 is always the trailing byte; everything before it (the
    // opcode, plus any address-size override prefix `JECXZ` needs in
    // 64-bit mode) is reused verbatim.
    let prefix_and_opcode = instr.as_slice()[..instr.length - 1].to_vec();

    // Offsets a fair distance past any real input offset so it never
    // collides with a genuine branch target inside the window.
    let over_label = Label(instr.next_address() + 0xFFFF_0000);
    self.writer.put_branch_to_label(over_label, BranchKind::RawShort(prefix_and_opcode))?;

    if self.in_window(target) {
      self.writer.put_branch_to_label(Label(target), BranchKind::Jmp)?;
    } else {
      let source_of_next = self.writer.address() + 5;
      let displacement = target as isize - source_of_next as isize;
      if is_within_range(displacement) {
        self.writer.put_jmp(target)?;
      } else {
        self.writer.put_jmp_abs(target)?;
      }
    }

    self.writer.put_label(over_label)
  }

  fn translate_rip_relative(&mut self, instr: &InstructionRecord) -> Result<()> {
    debug_assert_eq!(self.target, Target::X64, "RIP-relative operands only occur in 64-bit mode");

    let disp = instr.rip_displacement.expect("has_rip_relative_operand implies a displacement");
    let original_target = (instr.next_address() as isize + disp as isize) as usize;

    let new_instruction_address = self.writer.address();
    let new_disp = original_target as isize - (new_instruction_address + instr.length) as isize;

    if !is_within_range(new_disp) {
      return Err(Error::OutOfRange);
    }

    let mut bytes = instr.as_slice().to_vec();
    let disp_offset = instr.disp_offset.expect("RIP-relative operands carry a disp32 offset");
    bytes[disp_offset..disp_offset + 4].copy_from_slice(&(new_disp as i32).to_le_bytes());
    self.writer.put_bytes(&bytes)
  }
}

/// Decodes forward from `pointer` without emitting anything, and returns the
/// smallest whole-instruction prefix length `>= min_bytes`, or `0` if a
/// non-relocatable instruction is encountered before that span is covered.
pub fn can_relocate(pointer: *const (), min_bytes: usize) -> usize {
  let mut decoder = Decoder::new(pointer);
  let base = pointer as usize;
  let mut offset = 0usize;

  while offset < min_bytes {
    let here = (base + offset) as *const ();
    match decoder.decode(here) {
      Ok(instr) => offset += instr.length,
      Err(_) => return 0,
    }
  }

  offset
}
