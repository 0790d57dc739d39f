//! Page Allocator collaborator surface (spec: memory pages the Interceptor
//! and Relocator need, independent of any particular target).
//!
//! Thin wrappers over [`ThreadAllocator`] and `region`'s protection calls,
//! named the way the Interceptor's arm/disarm choreography calls them.

use super::{ExecutableMemory, ThreadAllocator};
use crate::arch::DETOUR_RANGE;
use crate::error::Result;
use lazy_static::lazy_static;

lazy_static! {
  static ref POOL: ThreadAllocator = ThreadAllocator::new(DETOUR_RANGE);
}

/// Allocates `size` bytes of read/write/execute memory anywhere.
pub fn alloc_pages(size: usize) -> Result<ExecutableMemory> {
  alloc_pages_near(std::ptr::null(), size)
}

/// Allocates `size` bytes of read/write/execute memory within rel32 range
/// of `origin`, for trampolines and relays that branch back with a direct
/// branch.
pub fn alloc_pages_near(origin: *const (), size: usize) -> Result<ExecutableMemory> {
  POOL.allocate(origin, size)
}

/// Changes the protection of `size` bytes starting at `address`. Used while
/// arming/disarming a target so the prologue bytes are writable only for the
/// duration of the patch.
pub fn set_protection(address: *const (), size: usize, protection: region::Protection) -> Result<region::ProtectGuard> {
  Ok(unsafe { region::protect_with_handle(address, size, protection)? })
}

/// Instruction-cache flush for freshly written executable memory. A
/// documented no-op on x86/x64 — the ISA is cache-coherent between
/// instruction and data views — kept as an explicit call site so the
/// Interceptor's arm sequence reads the same on every architecture.
pub fn flush_icache(address: *const (), len: usize) {
  crate::util::flush_icache(address, len)
}
