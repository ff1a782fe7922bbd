//! Reference-counted runtime object model for the Quill VM.
//!
//! All heap payloads (strings, vectors, class instances, resources) share
//! a common header holding a reference count and a type-table index. The
//! heap is a slot pool private to one VM; cells reference slots through
//! `RefId` handles. There is no cycle collector: objects still live at
//! teardown are reported by the leak finder, never reclaimed.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod heap;

pub use heap::{Heap, HeapStats, ObjHeader, ObjPayload, ResourceType};
