//! VM error taxonomy.
//!
//! All errors escape the engine through `VmResult`; the unwinder in
//! `quill_vm` attaches the stack trace text before the error reaches the
//! embedder. Load-time errors (`BytecodeMalformed`,
//! `BytecodeVersionMismatch`) are fatal before a VM exists; `StackOverflow`
//! and `InternalAssertion` leave the VM inconsistent and skip variable
//! dumping; the rest are recoverable up to the unwind point.

use std::fmt;

/// Behavioral classification of a VM error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    /// The image verifier rejected the buffer. Load time, fatal.
    BytecodeMalformed,
    /// The image was produced by a different bytecode format version.
    BytecodeVersionMismatch,
    /// Stack doubling hit the configured maximum. Serious.
    StackOverflow,
    /// Runtime bounds failure, recoverable up to unwind.
    IndexOutOfRange,
    /// Runtime type failure (e.g. worker write of a non-class).
    TypeMismatch,
    /// Worker spawned from a worker, or double-start.
    WorkerMisuse,
    /// Programmer error inside the VM itself. Serious.
    InternalAssertion,
    /// Raised by script code.
    UserError,
}

impl VmErrorKind {
    /// Serious errors skip variable dumping: the VM state may already be
    /// inconsistent when they are raised.
    #[inline]
    pub fn is_serious(self) -> bool {
        matches!(self, VmErrorKind::StackOverflow | VmErrorKind::InternalAssertion)
    }
}

/// An error escaping the VM. `message` is the full accumulated text,
/// including the stack trace when one was built.
#[derive(Debug, Clone)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub message: String,
}

impl VmError {
    pub fn new(kind: VmErrorKind, message: impl Into<String>) -> VmError {
        VmError { kind, message: message.into() }
    }

    pub fn malformed(message: impl Into<String>) -> VmError {
        VmError::new(VmErrorKind::BytecodeMalformed, message)
    }

    pub fn version_mismatch(message: impl Into<String>) -> VmError {
        VmError::new(VmErrorKind::BytecodeVersionMismatch, message)
    }

    pub fn stack_overflow(message: impl Into<String>) -> VmError {
        VmError::new(VmErrorKind::StackOverflow, message)
    }

    pub fn index_out_of_range(message: impl Into<String>) -> VmError {
        VmError::new(VmErrorKind::IndexOutOfRange, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> VmError {
        VmError::new(VmErrorKind::TypeMismatch, message)
    }

    pub fn worker_misuse(message: impl Into<String>) -> VmError {
        VmError::new(VmErrorKind::WorkerMisuse, message)
    }

    pub fn internal(message: impl Into<String>) -> VmError {
        VmError::new(VmErrorKind::InternalAssertion, message)
    }

    pub fn user(message: impl Into<String>) -> VmError {
        VmError::new(VmErrorKind::UserError, message)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for VmError {}

pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seriousness() {
        assert!(VmErrorKind::StackOverflow.is_serious());
        assert!(VmErrorKind::InternalAssertion.is_serious());
        assert!(!VmErrorKind::IndexOutOfRange.is_serious());
        assert!(!VmErrorKind::UserError.is_serious());
    }

    #[test]
    fn test_display_is_message() {
        let e = VmError::index_out_of_range("VM error: index 5 out of range 3");
        assert_eq!(e.to_string(), "VM error: index 5 out of range 3");
    }
}
