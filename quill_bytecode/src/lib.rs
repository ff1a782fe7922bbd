//! Bytecode image format and instruction set for the Quill VM.
//!
//! A compiled program is a flat little-endian buffer of 32-bit words: a
//! header, a section directory, then tagged sections (code, type table,
//! symbols, line info, vtables, string pool, enums, UDTs). The loader
//! verifies structural integrity once; after that the image is read-only
//! and may be shared across worker VMs behind an `Arc`.
//!
//! The instruction set is partitioned into five arity-shape families
//! (base / call / vararg / jump1 / jump2); every handler in the engine and
//! every helper prototype in AOT output follows its family's signature.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod builder;
pub mod image;
pub mod opcodes;

pub use builder::{ImageBuilder, Label};
pub use image::{
    BytecodeImage, EnumDef, EnumVal, FunctionDef, Ident, LineEntry, SpecIdent, TypeInfo, Udt,
    BYTECODE_VERSION,
};
pub use opcodes::{parse_op_and_get_arity, FunHeader, OpFamily, Opcode, ParsedOp, MAX_OPS};
