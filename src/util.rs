use crate::error::Result;

/// Returns true if an address is executable.
pub fn is_executable_address(address: *const ()) -> Result<bool> {
  Ok(
    region::query(address as *const _)?
      .protection
      .contains(region::Protection::EXECUTE),
  )
}

/// Flushes the instruction cache over `[address, address + len)`.
///
/// x86/x86-64 maintain I/D cache coherence in hardware, so this is a no-op
/// on every platform the engine currently targets. The call site is kept
/// (rather than relying on implicit coherence) so the engine stays
/// portable to architectures that require an explicit flush.
pub fn flush_icache(_address: *const (), _len: usize) {}
