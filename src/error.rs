//! Error types and utilities.

use std::error::Error as StdError;
use std::fmt;

/// The result of any operation in this crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// A representation of all possible errors.
#[derive(Debug)]
pub enum Error {
  /// The address for the target and detour/replacement are identical.
  SameAddress,
  /// The address is not executable memory.
  NotExecutable,
  /// The address does not contain a legal instruction encoding.
  DecodeInvalid,
  /// The address contains an instruction the engine refuses to rewrite.
  Unsupported,
  /// A PC-relative operand could not be rewritten within a 32-bit range
  /// after relocation.
  OutOfRange,
  /// A code emitter ran out of space in its caller-supplied buffer.
  BufferFull,
  /// A branch displacement did not fit the width of its encoded operand.
  DisplacementOverflow,
  /// A label was referenced but never bound before `flush`.
  UnboundLabel,
  /// No inline patch area (prolog + hot-patch padding) of sufficient size
  /// could be found at the target.
  NoPatchArea,
  /// The system is out of (near-enough) executable memory.
  OutOfMemory,
  /// `replace` was called on a target that already has listeners attached,
  /// or `attach` was called on a target that has been `replace`d.
  AlreadyReplaced,
  /// The same listener has already been attached to this target.
  AlreadyAttached,
  /// Another thread's instruction pointer was found inside the bytes being
  /// patched and could not be safely redirected or deferred.
  PatchUnsafe,
  /// A static/global construct was used before it was initialized.
  NotInitialized,
  /// A memory query/protect operation failed.
  RegionFailure(region::Error),
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    if let Error::RegionFailure(error) = self {
      Some(error)
    } else {
      None
    }
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::SameAddress => write!(f, "Target and detour address is the same"),
      Error::NotExecutable => write!(f, "Address is not executable"),
      Error::DecodeInvalid => write!(f, "Address contains invalid assembly"),
      Error::Unsupported => write!(f, "Address contains an unsupported instruction"),
      Error::OutOfRange => write!(f, "A PC-relative operand could not be rewritten in range"),
      Error::BufferFull => write!(f, "Code emitter buffer is full"),
      Error::DisplacementOverflow => write!(f, "Branch displacement does not fit its operand"),
      Error::UnboundLabel => write!(f, "Referenced a label that was never bound"),
      Error::NoPatchArea => write!(f, "Cannot find an inline patch area"),
      Error::OutOfMemory => write!(f, "Cannot allocate executable memory near the target"),
      Error::AlreadyReplaced => write!(f, "Target already has a full replacement installed"),
      Error::AlreadyAttached => write!(f, "Listener is already attached to this target"),
      Error::PatchUnsafe => write!(f, "Another thread's IP is inside the patched bytes"),
      Error::NotInitialized => write!(f, "Detour/interceptor is not initialized"),
      Error::RegionFailure(ref error) => write!(f, "{}", error),
    }
  }
}

impl From<region::Error> for Error {
  fn from(error: region::Error) -> Self {
    Error::RegionFailure(error)
  }
}
