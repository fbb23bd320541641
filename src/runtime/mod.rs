//! The runtime as seen from the backend.
//!
//! Everything in here belongs to collaborators outside the code generator:
//! the tagged-word object model, the class table, the canonical heap image,
//! stub and runtime entry addresses. The backend only reads these tables;
//! they are threaded into the compiler through [`CompilerContext`].

mod context;
mod heap;
mod stubs;
mod types;

pub use context::{
    CompilerContext, DeclaredInstantiator, InstantiatorResolver, InstantiatorSource, NoInstantiator, Runtime,
};
pub use heap::{Heap, HeapObject, ObjectKind};
pub use stubs::{RuntimeEntry, StubCode, StubEntry, StubTable};
pub use types::{AbstractType, Class, ClassDecl, ClassId, ClassTable, CoreClasses, TypeArguments};

use serde::{Deserialize, Serialize};

/// Object layout constants shared with the runtime.
///
/// Offsets are in bytes and untagged; generated code addresses fields of a
/// tagged reference with [`field_offset`].
pub mod layout {
    pub const WORD_SIZE: i32 = 8;

    pub const HEAP_OBJECT_TAG: i32 = 1;
    pub const SMI_TAG_MASK: i32 = 1;
    pub const SMI_TAG_SIZE: u8 = 1;

    pub const CLASS_OFFSET: i32 = 0;

    pub const ARRAY_TYPE_ARGUMENTS_OFFSET: i32 = 8;
    pub const ARRAY_LENGTH_OFFSET: i32 = 16;
    pub const ARRAY_DATA_OFFSET: i32 = 24;

    pub const TYPE_ARGUMENTS_LENGTH_OFFSET: i32 = 8;
    pub const TYPE_ARGUMENTS_DATA_OFFSET: i32 = 16;

    pub const FIELD_NAME_OFFSET: i32 = 8;
    pub const FIELD_VALUE_OFFSET: i32 = 16;

    /// Displacement that reaches the untagged `offset` of a tagged reference.
    pub const fn field_offset(offset: i32) -> i32 {
        offset - HEAP_OBJECT_TAG
    }
}

/// Raw tagged value of a Smi.
pub const fn smi_raw(value: i64) -> i64 {
    value << layout::SMI_TAG_SIZE
}

/// Whether `value` survives Smi tagging without losing its top bit.
pub const fn smi_fits(value: i64) -> bool {
    let raw = value << layout::SMI_TAG_SIZE;
    (raw >> layout::SMI_TAG_SIZE) == value
}

/// A tagged reference to a heap object (low bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(pub u64);

impl ObjectRef {
    /// Address of the first word of the object.
    pub fn untagged(self) -> u64 {
        self.0 - layout::HEAP_OBJECT_TAG as u64
    }

    pub fn raw(self) -> i64 {
        self.0 as i64
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A compile-time constant: either an immediate or a heap reference.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Object {
    #[default]
    Null,
    Bool(bool),
    Smi(i64),
    Ref(ObjectRef),
}

impl Object {
    pub fn is_smi(&self) -> bool {
        matches!(self, Object::Smi(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Object::Null)
    }
}
