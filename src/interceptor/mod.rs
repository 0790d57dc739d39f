//! The Interceptor (§4.D) — installs and removes trampolines on target
//! functions and dispatches enter/leave listeners.
//!
//! Grounded on the teacher's `arch::detour::Detour::new`/`enable`/`disable`
//! choreography (suspend, patch, resume) and its `RawDetour`/`GenericDetour`
//! split between "the raw patch" and "the typed, listener-bearing wrapper"
//! — generalized here from a single detour-swap into the richer multi-
//! listener, enter/leave topology `spec.md` §4.D actually describes.

mod function_context;
mod invocation;
mod listener;
mod listener_dispatch;
mod margin;
mod registers;
mod thread_service;
mod trampoline;
mod transaction;

pub use invocation::{InvocationContext, ParentHandle};
pub use listener::{Listener, ListenerHandle};

use crate::alloc::pages;
use crate::arch::x86::thunk;
use crate::arch::{is_within_range, Target};
use crate::error::{Error, Result};
use function_context::{FunctionContext, FunctionContextData, ListenerEntry, Replacement};
use lazy_static::lazy_static;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use transaction::{EpochReclaimer, Transaction};

lazy_static! {
  /// The process-wide instance every free-standing `Interceptor::global`
  /// caller shares. Tests that need isolation build their own
  /// `Interceptor::new()` instead (§9 "Global state").
  static ref GLOBAL: Interceptor = Interceptor::new();
}

/// A rough but generous upper bound on how much bigger the relocated copy
/// of a prologue can be than the prologue itself: a `Jcc rel8` (2 bytes)
/// widens to `Jcc rel32` (6), and a LOOP/JCXZ instruction (2 bytes)
/// expands to an 11-byte three-instruction sequence — worst case a little
/// over 5x, rounded up with slack for the RIP-relative rewrite case.
const RELOCATION_GROWTH_FACTOR: usize = 6;

/// Generous fixed allowance for the on-enter/on-leave thunks plus the tail
/// jump, sized well above the ~150-200 bytes `trampoline::build` actually
/// emits for them on either ABI.
const THUNK_RESERVE: usize = 320;

type BuiltTrampoline = (crate::alloc::ExecutableMemory, usize, bool, Box<FunctionContextData>, trampoline::TrampolineLayout);

/// Installs and removes trampolines; owns the topology table. See module
/// docs for the overall choreography.
pub struct Interceptor {
  state: Mutex<TopologyState>,
  /// Threads this `Interceptor` currently has suspended, between a
  /// `with_suspended_threads` call and its matching `resume_suspended_threads`.
  /// Kept separate from `state` so `arm`/`disarm` (called while `attach`/
  /// `detach`/`replace` hold `state` to serialise the topology check-and-
  /// install) can suspend/resume without taking `state` a second time.
  suspended: Mutex<Vec<u64>>,
  reclaimer: EpochReclaimer,
  next_id: AtomicU64,
}

struct TopologyState {
  contexts: HashMap<usize, FunctionContext>,
}

impl Interceptor {
  pub fn new() -> Self {
    Interceptor {
      state: Mutex::new(TopologyState { contexts: HashMap::new() }),
      suspended: Mutex::new(Vec::new()),
      reclaimer: EpochReclaimer::new(),
      next_id: AtomicU64::new(1),
    }
  }

  /// The process-wide singleton.
  pub fn global() -> &'static Interceptor {
    &GLOBAL
  }

  /// Adds `listener` to the function context at `target`, creating and
  /// arming the context on the first attach.
  pub fn attach(&self, target: *const (), listener: Arc<dyn Listener>) -> Result<ListenerHandle> {
    if target.is_null() {
      return Err(Error::NotExecutable);
    }
    let target_addr = target as usize;
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let _transaction = Transaction::begin();
    let mut state = self.state.lock().unwrap();

    if let Some(ctx) = state.contexts.get(&target_addr) {
      if ctx.data.replacement.lock().unwrap().is_some() {
        return Err(Error::AlreadyReplaced);
      }
      let mut listeners = ctx.data.listeners.lock().unwrap();
      if listeners.iter().any(|entry| Arc::ptr_eq(&entry.listener, &listener)) {
        return Err(Error::AlreadyAttached);
      }
      listeners.push(ListenerEntry { id, listener });
      trace!("attached listener {} to already-armed target {:#x}", id, target_addr);
      return Ok(ListenerHandle { target_address: target_addr, id });
    }

    debug!("arming target {:#x}", target_addr);
    let ctx = self.arm(target, None)?;
    ctx.data.listeners.lock().unwrap().push(ListenerEntry { id, listener });
    state.contexts.insert(target_addr, ctx);

    Ok(ListenerHandle { target_address: target_addr, id })
  }

  /// Removes a previously attached listener or a previously installed
  /// replacement, disarming and freeing the function context once nothing
  /// is left on it. Detaching a replacement reverts `target` to its
  /// original behaviour — there is no second listener it could fall back
  /// to, so "remove the only thing installed" and "restore the original"
  /// are the same operation here.
  pub fn detach(&self, handle: ListenerHandle) -> Result<()> {
    let transaction = Transaction::begin();
    let mut state = self.state.lock().unwrap();

    let is_empty = {
      let ctx = state.contexts.get(&handle.target_address).ok_or(Error::NotInitialized)?;
      let mut listeners = ctx.data.listeners.lock().unwrap();
      listeners.retain(|entry| entry.id != handle.id);
      drop(listeners);

      let mut replacement = ctx.data.replacement.lock().unwrap();
      if replacement.as_ref().map_or(false, |r| r.id == handle.id) {
        *replacement = None;
      }
      drop(replacement);

      ctx.is_empty()
    };

    if is_empty {
      debug!("disarming target {:#x}, no listeners left", handle.target_address);
      let ctx = state.contexts.remove(&handle.target_address).unwrap();
      drop(state);
      self.disarm(ctx, transaction.should_commit())?;
    }

    Ok(())
  }

  /// Installs a full replacement at `target`: the redirect jump goes
  /// straight to `replacement`, bypassing listener dispatch entirely.
  /// Mutually exclusive with `attach` on the same target. `user_data` is
  /// opaque to the engine; the replacement function recovers it by calling
  /// [`Interceptor::get_replacement_data`] with the same `target` (the
  /// redirect never runs through a marshaling thunk, so it can't be handed
  /// to `replacement` as an argument the way listeners see it through an
  /// invocation context).
  pub fn replace(&self, target: *const (), replacement: *const (), user_data: usize) -> Result<ListenerHandle> {
    let target_addr = target as usize;
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let _transaction = Transaction::begin();
    let mut state = self.state.lock().unwrap();

    if state.contexts.contains_key(&target_addr) {
      return Err(Error::AlreadyReplaced);
    }

    let ctx = self.arm(target, Some(replacement as usize))?;
    *ctx.data.replacement.lock().unwrap() = Some(Replacement { id, function: replacement as usize, user_data });
    state.contexts.insert(target_addr, ctx);

    Ok(ListenerHandle { target_address: target_addr, id })
  }

  /// The `user_data` passed to the `replace` call currently installed at
  /// `target`, if any. The usual way a replacement function gets at its own
  /// opaque data, since the redirect that reaches it carries no invocation
  /// context (see `replace`'s docs).
  pub fn get_replacement_data(&self, target: *const ()) -> Option<usize> {
    let state = self.state.lock().unwrap();
    let ctx = state.contexts.get(&(target as usize))?;
    let replacement = ctx.data.replacement.lock().unwrap();
    replacement.as_ref().map(|r| r.user_data)
  }

  /// Begins a (possibly nested) transaction coalescing the epoch-reclaim
  /// timing of the topology changes made until the matching
  /// `end_transaction` (§4.D, §5 "a form of epoch reclamation").
  pub fn begin_transaction(&self) {
    transaction::enter();
  }

  /// Ends the innermost open transaction. Only the call that closes the
  /// outermost one actually advances the epoch and reclaims contexts
  /// retired since.
  pub fn end_transaction(&self) -> Result<()> {
    if transaction::leave() == 0 {
      self.reclaimer.advance();
      self.reclaimer.collect();
    }
    Ok(())
  }

  /// Opts the calling thread out of listener dispatch until
  /// `unignore_current_thread` — the original/replacement function is
  /// still called, just without running any listener.
  pub fn ignore_current_thread(&self) {
    invocation::ignore_current_thread();
  }

  pub fn unignore_current_thread(&self) {
    invocation::unignore_current_thread();
  }

  /// The innermost in-flight invocation on this thread, if any.
  pub fn get_current_invocation(&self) -> Option<ParentHandle> {
    invocation::top_frame()
  }

  /// The choreography of §4.D "Arming a target": decide *N*, allocate a
  /// trampoline near the target, relocate the prologue into it, write the
  /// enter/leave thunks, then atomically patch `target` under thread
  /// suspension.
  ///
  /// `forced_destination` is `Some` for `replace` (redirect goes straight
  /// to the replacement function) and `None` for `attach` (redirect goes
  /// to the trampoline's on-enter thunk).
  fn arm(&self, target: *const (), forced_destination: Option<usize>) -> Result<FunctionContext> {
    let target_arch = Target::NATIVE;

    let (mut trampoline, mut prologue_length, mut used_hot_patch, mut data, mut layout) =
      Self::build_trampoline(target, target_arch, margin::REL32_JUMP_LEN, true)
        .or_else(|_| Self::build_trampoline(target, target_arch, margin::ABS_JUMP_LEN, false))?;

    let mut jump_len = margin::REL32_JUMP_LEN;
    let mut destination = forced_destination.unwrap_or_else(|| trampoline.as_ptr() as usize + layout.on_enter_offset);
    let mut patch_at = Self::patch_address(target, jump_len, used_hot_patch);
    let mut source_of_next = patch_at + jump_len;

    if !is_within_range(destination as isize - source_of_next as isize) {
      trace!("trampoline for {:#x} out of rel32 range, rebuilding with an absolute jump", target as usize);
      jump_len = margin::ABS_JUMP_LEN;
      let rebuilt = Self::build_trampoline(target, target_arch, jump_len, false)?;
      trampoline = rebuilt.0;
      prologue_length = rebuilt.1;
      used_hot_patch = rebuilt.2;
      data = rebuilt.3;
      layout = rebuilt.4;
      destination = forced_destination.unwrap_or_else(|| trampoline.as_ptr() as usize + layout.on_enter_offset);
      patch_at = Self::patch_address(target, jump_len, used_hot_patch);
      source_of_next = patch_at + jump_len;
    }

    self.finish_arm(
      target as usize,
      trampoline,
      prologue_length,
      used_hot_patch,
      jump_len,
      destination,
      patch_at,
      source_of_next,
      data,
      layout,
    )
  }

  fn patch_address(target: *const (), jump_len: usize, used_hot_patch: bool) -> usize {
    if used_hot_patch {
      (target as usize).wrapping_sub(jump_len)
    } else {
      target as usize
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn finish_arm(
    &self,
    target_addr: usize,
    trampoline: crate::alloc::ExecutableMemory,
    prologue_length: usize,
    used_hot_patch: bool,
    jump_len: usize,
    destination: usize,
    patch_at: usize,
    source_of_next: usize,
    data: Box<FunctionContextData>,
    layout: trampoline::TrampolineLayout,
  ) -> Result<FunctionContext> {
    data.on_leave_address.set(trampoline.as_ptr() as usize + layout.on_leave_offset);

    let big_jump =
      if jump_len == margin::ABS_JUMP_LEN { thunk::jmp_abs(destination).to_vec() } else { thunk::relative32(source_of_next, destination, false).to_vec() };

    let patch_at_target_len = if used_hot_patch { 2 } else { jump_len };
    let patch_at_target = if used_hot_patch { thunk::jmp_rel8(target_addr + 2, patch_at).to_vec() } else { big_jump.clone() };

    let trampoline_base = trampoline.as_ptr() as usize;
    self.with_suspended_threads(
      target_addr,
      prologue_length.max(patch_at_target_len),
      Some((trampoline_base, layout.mapping.as_slice())),
    )?;

    let mut original_prologue = Self::patch(target_addr, &patch_at_target)?;
    let mut hot_patch = None;
    if used_hot_patch {
      let hot_patch_original = Self::patch(patch_at, &big_jump)?;
      hot_patch = Some((patch_at, big_jump.len()));
      // The bytes restored at `target_addr` on disarm are just the short
      // jump; the hot-patch-area bytes get their own slot so disarm can
      // put both regions back exactly as found.
      original_prologue.extend(hot_patch_original);
    }

    self.resume_suspended_threads();

    Ok(FunctionContext::new(
      target_addr,
      original_prologue,
      patch_at_target_len,
      hot_patch,
      trampoline,
      layout.on_enter_offset,
      layout.on_leave_offset,
      layout.mapping,
      data,
    ))
  }

  fn disarm(&self, ctx: FunctionContext, commit: bool) -> Result<()> {
    let target_addr = ctx.target_address;
    let suspend_len = ctx.redirect_len.max(ctx.hot_patch.map_or(0, |(_, len)| len));

    // The trampoline is still live at this point (it's only freed once the
    // reclaimer's epoch retires `ctx`, after `resume_suspended_threads`
    // below) so a thread caught mid-prologue can still be redirected onto
    // it, the same as during `arm`.
    self.with_suspended_threads(
      target_addr,
      suspend_len,
      Some((ctx.trampoline_base(), ctx.prologue_mapping.as_slice())),
    )?;
    Self::patch(target_addr, &ctx.original_prologue[..ctx.redirect_len])?;
    if let Some((hot_patch_at, hot_patch_len)) = ctx.hot_patch {
      Self::patch(hot_patch_at, &ctx.original_prologue[ctx.redirect_len..ctx.redirect_len + hot_patch_len])?;
    }
    self.resume_suspended_threads();

    if commit {
      self.reclaimer.advance();
      self.reclaimer.collect();
    }
    self.reclaimer.retire(ctx);
    Ok(())
  }

  /// Overwrites `bytes.len()` bytes at `address`, returning what was there.
  fn patch(address: usize, bytes: &[u8]) -> Result<Vec<u8>> {
    let guard = pages::set_protection(address as *const (), bytes.len(), region::Protection::READ_WRITE_EXECUTE)?;
    let slice = unsafe { std::slice::from_raw_parts_mut(address as *mut u8, bytes.len()) };
    let original = slice.to_vec();
    slice.copy_from_slice(bytes);
    drop(guard);
    pages::flush_icache(address as *const (), bytes.len());
    Ok(original)
  }

  /// Suspends every other thread and checks each one's instruction pointer
  /// against the `len` bytes about to be overwritten at `target_addr`
  /// (§4.D "Atomic patch policy"). A thread caught outside that span is
  /// left alone. A thread caught inside it is redirected, when `redirect`
  /// is `Some((trampoline_base, mapping))`, onto the equivalent offset in
  /// the relocated prologue the mapping names for its exact IP — the
  /// mapping only ever names whole-instruction boundaries (§3 "Relocation
  /// mapping"), and an instruction pointer is never anywhere else, so any
  /// IP inside the span has a matching entry unless `redirect` is `None`
  /// (no trampoline yet/any more to redirect into) or the lookup fails,
  /// either of which aborts the patch with `PatchUnsafe` and resumes
  /// everything already suspended.
  fn with_suspended_threads(
    &self,
    target_addr: usize,
    len: usize,
    redirect: Option<(usize, &[(usize, usize)])>,
  ) -> Result<()> {
    let threads = thread_service::enumerate_other_threads()?;
    for &thread in &threads {
      thread_service::suspend(thread)?;
    }

    let abort = |threads: &[u64]| {
      for &t in threads {
        let _ = thread_service::resume(t);
      }
      Error::PatchUnsafe
    };

    for &thread in &threads {
      let ip = match thread_service::get_context(thread) {
        Ok(context) => context.instruction_pointer,
        Err(_) => return Err(abort(&threads)),
      };
      if ip < target_addr || ip >= target_addr + len {
        continue;
      }

      let redirected = redirect.and_then(|(trampoline_base, mapping)| {
        mapping
          .iter()
          .find(|(input_offset, _)| target_addr + input_offset == ip)
          .map(|(_, output_offset)| trampoline_base + output_offset)
      });

      match redirected {
        Some(new_ip) => {
          debug!("redirecting thread {} from {:#x} into trampoline at {:#x}", thread, ip, new_ip);
          if thread_service::set_instruction_pointer(thread, new_ip).is_err() {
            return Err(abort(&threads));
          }
        }
        None => {
          warn!("thread {} has its IP inside the patch area at {:#x}, aborting", thread, target_addr);
          return Err(abort(&threads));
        }
      }
    }
    *self.suspended.lock().unwrap() = threads;
    Ok(())
  }

  fn resume_suspended_threads(&self) {
    let threads = std::mem::take(&mut *self.suspended.lock().unwrap());
    for thread in threads {
      let _ = thread_service::resume(thread);
    }
  }

  #[allow(clippy::type_complexity)]
  fn build_trampoline(target: *const (), target_arch: Target, jump_len: usize, near: bool) -> Result<BuiltTrampoline> {
    let target_addr = target as usize;
    let (prologue_length, used_hot_patch) = margin::prologue_length(target, target_arch, jump_len)?;

    let trampoline_size = prologue_length * RELOCATION_GROWTH_FACTOR + THUNK_RESERVE;
    let mut mem =
      if near { pages::alloc_pages_near(target, trampoline_size)? } else { pages::alloc_pages(trampoline_size)? };
    let base = mem.as_ptr() as usize;

    let data = Box::new(FunctionContextData::new(target_addr));
    let context_ptr: *const FunctionContextData = &*data;

    let layout = trampoline::build(target, target_arch, prologue_length, base, &mut mem[..], context_ptr)?;
    Ok((mem, prologue_length, used_hot_patch, data, layout))
  }
}

impl Default for Interceptor {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct CountingListener {
    enters: std::sync::atomic::AtomicUsize,
    leaves: std::sync::atomic::AtomicUsize,
  }

  impl Listener for CountingListener {
    fn on_enter(&self, _ctx: &mut InvocationContext) {
      self.enters.fetch_add(1, Ordering::SeqCst);
    }
    fn on_leave(&self, _ctx: &mut InvocationContext) {
      self.leaves.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn duplicate_listener_detection_is_by_identity() {
    // Exercises the bookkeeping `attach` uses to reject a second attach of
    // the same listener (`Arc::ptr_eq`), independent of real arming, which
    // needs live executable memory and is covered by the `tests/`
    // integration suite instead.
    let listener = Arc::new(CountingListener {
      enters: std::sync::atomic::AtomicUsize::new(0),
      leaves: std::sync::atomic::AtomicUsize::new(0),
    });
    let other: Arc<dyn Listener> = listener.clone();
    let mut listeners: Vec<ListenerEntry> = Vec::new();
    listeners.push(ListenerEntry { id: 1, listener: listener.clone() });
    assert!(listeners.iter().any(|entry| Arc::ptr_eq(&entry.listener, &other)));
  }

  #[test]
  fn transaction_nesting_only_advances_epoch_once() {
    let interceptor = Interceptor::new();
    interceptor.begin_transaction();
    interceptor.begin_transaction();
    interceptor.end_transaction().unwrap();
    let before = interceptor.reclaimer.current();
    interceptor.end_transaction().unwrap();
    assert_eq!(interceptor.reclaimer.current(), before + 1);
  }
}
