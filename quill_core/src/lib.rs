//! Core data model for the Quill virtual machine.
//!
//! This crate provides the pieces every other Quill crate agrees on:
//!
//! - **`Value`**: the 8-byte tagged cell that lives on the VM stack, in
//!   globals, and inside heap objects. Both the interpreter and the AOT
//!   generated code must agree bit-for-bit on this layout.
//! - **`ValueType`**: the runtime type tag, doubling as the base kind of
//!   static type descriptors in the bytecode type table.
//! - **`VmError`** / **`VmResult`**: the single error channel the engine
//!   unwinds through.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod value;

pub use error::{VmError, VmErrorKind, VmResult};
pub use value::{PrintPrefs, RefId, Value, ValueType};

/// Version reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
