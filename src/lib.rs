//! A dynamic binary instrumentation toolkit for x86/x86-64, written in Rust.
//!
//! ## Components
//!
//! - [`arch::x86::Decoder`] — a length-disassembler over the x86/x86-64
//!   instruction set, enough to walk a function's prologue one instruction
//!   at a time without a full disassembly.
//! - [`arch::x86::Writer`] — a single-pass code emitter into a caller-owned
//!   executable buffer.
//! - [`arch::x86::Relocator`] — rewrites a decoded prologue into a
//!   trampoline elsewhere in the address space, widening PC-relative
//!   operands that would otherwise fall out of range.
//! - [`Interceptor`] — the `attach`/`detach`/`replace` surface: installs a
//!   redirect at a target function, relocates its overwritten prologue into
//!   a trampoline, and dispatches [`Listener`] callbacks around every call.
//!
//! ## Platforms
//!
//! Both `x86` and `x86-64` are supported, on Linux and Windows.

#[macro_use]
extern crate cfg_if;
#[macro_use]
extern crate lazy_static;
extern crate mmap;
extern crate region;
extern crate slice_pool;

pub use error::Error;
pub use interceptor::{InvocationContext, Interceptor, Listener, ListenerHandle, ParentHandle};

pub mod arch;
mod alloc;
mod error;
mod interceptor;
mod util;
