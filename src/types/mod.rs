// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly type definitions.
//!
//! This module contains the type definitions used for reading and
//! representing WASM modules: value types, function signatures, imports,
//! exports, segments, and the section framing itself. Entities that carry
//! byte ranges or names borrow them from the module's input buffer.

mod instr;
pub use instr::*;

use core::cmp;
use core::fmt;
use core::ops;

use num_enum::TryFromPrimitive;

/// A decoded value paired with the byte offset it was decoded from.
///
/// The offset exists purely for diagnostics; equality ignores it so
/// fixtures can compare decoded values directly.
#[derive(Clone, Copy)]
pub struct At<T> {
    value: T,
    offset: usize,
}

impl<T> At<T> {
    pub fn new(offset: usize, value: T) -> Self {
        Self { value, offset }
    }

    /// The byte offset within the input at which this value began.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> ops::Deref for At<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for At<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} @ {:#x}", self.value, self.offset)
    }
}

impl<T: PartialEq> PartialEq for At<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: Eq> Eq for At<T> {}

/// WebAssembly module version.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum Version {
    V1 = 1,
}

/// The type of a reference to an object in the runtime store.
///
/// `Nullref` belongs to the reference-types extension and never appears
/// without it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ReferenceType {
    /// Function reference type.
    Funcref = 0x70,
    /// External reference type.
    Externref = 0x6f,
    /// The type of a null reference.
    Nullref = 0x6e,
}

/// Value types classify the individual values that WebAssembly code can
/// compute with and the values that a variable accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueType {
    /// 32-bit integer.
    I32 = 0x7f,
    /// 64-bit integer.
    I64 = 0x7e,
    /// 32-bit floating point number.
    F32 = 0x7d,
    /// 64-bit floating point number.
    F64 = 0x7c,
    /// 128-bit SIMD vector.
    V128 = 0x7b,
    /// Function reference.
    Funcref = ReferenceType::Funcref as u8,
    /// External reference.
    Externref = ReferenceType::Externref as u8,
    /// Null reference.
    Nullref = ReferenceType::Nullref as u8,
}

impl ValueType {
    /// Whether this is one of the reference types.
    pub fn is_reference(self) -> bool {
        matches!(self, Self::Funcref | Self::Externref | Self::Nullref)
    }
}

impl From<ReferenceType> for ValueType {
    fn from(value: ReferenceType) -> Self {
        match value {
            ReferenceType::Funcref => Self::Funcref,
            ReferenceType::Externref => Self::Externref,
            ReferenceType::Nullref => Self::Nullref,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::V128 => "v128",
            Self::Funcref => "funcref",
            Self::Externref => "externref",
            Self::Nullref => "nullref",
        };
        f.write_str(name)
    }
}

/// What kind of entity an import, export, or element-segment index names.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExternalKind {
    Function = 0x00,
    Table = 0x01,
    Memory = 0x02,
    Global = 0x03,
    /// Exception event (exceptions extension).
    Event = 0x04,
}

impl fmt::Display for ExternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Function => "function",
            Self::Table => "table",
            Self::Memory => "memory",
            Self::Global => "global",
            Self::Event => "event",
        };
        f.write_str(name)
    }
}

/// The mutability of a global variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum Mutability {
    /// Immutable.
    Const = 0x00,
    /// Mutable.
    Var = 0x01,
}

/// Whether a linear memory may be shared between threads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shared {
    No,
    Yes,
}

/// The size range of the resizeable storage associated with memory (# of
/// pages) and table types (# of elements).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Limits {
    /// Minimum size.
    pub min: u32,
    /// Maximum size, with None indicating that there is no upper limit.
    pub max: Option<u32>,
    /// Shared flag (threads extension; meaningful for memories only).
    pub shared: Shared,
}

/// A linear memory type with its size limits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryType {
    pub limits: Limits,
}

impl MemoryType {
    /// The WebAssembly page size.
    pub const PAGE_SIZE: usize = 0x1_0000; // 64 KiB

    /// The upper bound on a memory's page count.
    pub const MAX_PAGES: u32 = 65536;
}

/// WebAssembly table type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableType {
    /// Type of references stored in the table.
    pub elemtype: ReferenceType,
    /// Table size limits.
    pub limits: Limits,
}

/// Represents the type of a global variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GlobalType {
    /// The type of the global's value.
    pub valtype: ValueType,
    /// The mutability of the global.
    pub mutability: Mutability,
}

/// The type of an exception event (exceptions extension).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventType {
    /// Event attribute; only `0` (exception) is defined.
    pub attribute: u32,
    /// Index of the event's function type, whose results must be empty.
    pub type_index: u32,
}

/// The signature of a function, mapping parameters to results. Signatures
/// also classify the inputs and outputs of blocks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FunctionType {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

/// A function declaration: an entry of the function section (or a function
/// import), carrying the index of its type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Function {
    pub type_index: u32,
}

/// Section identifier within a module.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SectionId {
    /// Custom section with arbitrary data.
    Custom = 0,
    /// Function type declarations.
    Type = 1,
    /// Import declarations.
    Import = 2,
    /// Function type indices for module functions.
    Function = 3,
    /// Table declarations.
    Table = 4,
    /// Memory declarations.
    Memory = 5,
    /// Global declarations.
    Global = 6,
    /// Export declarations.
    Export = 7,
    /// Start function index.
    Start = 8,
    /// Element segments for table initialization.
    Element = 9,
    /// Function bodies.
    Code = 10,
    /// Data segments for memory initialization.
    Data = 11,
    /// Data segment count (bulk-memory extension).
    DataCount = 12,
    /// Exception events (exceptions extension).
    Event = 13,
}

impl SectionId {
    // The position each known section must occupy in a module. DataCount
    // was retrofitted before Code/Data, and Event between Memory and
    // Global, so the raw ids are not usable for ordering.
    fn rank(self) -> u8 {
        match self {
            SectionId::Custom => 0,
            SectionId::Type => 1,
            SectionId::Import => 2,
            SectionId::Function => 3,
            SectionId::Table => 4,
            SectionId::Memory => 5,
            SectionId::Event => 6,
            SectionId::Global => 7,
            SectionId::Export => 8,
            SectionId::Start => 9,
            SectionId::Element => 10,
            SectionId::DataCount => 11,
            SectionId::Code => 12,
            SectionId::Data => 13,
        }
    }
}

// An ID is less than another precisely when, for non-custom sections, the
// former must appear before the latter when both are present.
impl PartialOrd for SectionId {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        self.rank().partial_cmp(&other.rank())
    }
}

/// Custom section: a name tag plus an opaque payload.
#[derive(Clone, Copy, Debug)]
pub struct CustomSection<'a> {
    /// Section name.
    pub name: At<&'a str>,
    /// Section payload, excluding the name.
    pub data: &'a [u8],
}

/// Import descriptor types.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ImportDescriptor {
    /// Import a function with the given type index.
    Function(u32),
    /// Import a table with the given type.
    Table(TableType),
    /// Import a memory with the given type.
    Memory(MemoryType),
    /// Import a global with the given type.
    Global(GlobalType),
    /// Import an exception event with the given type.
    Event(EventType),
}

impl ImportDescriptor {
    pub fn kind(&self) -> ExternalKind {
        match self {
            Self::Function(_) => ExternalKind::Function,
            Self::Table(_) => ExternalKind::Table,
            Self::Memory(_) => ExternalKind::Memory,
            Self::Global(_) => ExternalKind::Global,
            Self::Event(_) => ExternalKind::Event,
        }
    }
}

/// An import declaration.
#[derive(Clone, Copy, Debug)]
pub struct Import<'a> {
    /// Name of the module to import from.
    pub module: At<&'a str>,
    /// Name of the imported entity.
    pub field: At<&'a str>,
    /// Type of the imported entity.
    pub descriptor: ImportDescriptor,
}

/// An export declaration.
#[derive(Clone, Copy, Debug)]
pub struct Export<'a> {
    /// Name of the exported entity.
    pub name: At<&'a str>,
    /// What kind of entity is exported.
    pub kind: ExternalKind,
    /// Index of the exported entity within its kind's index space.
    pub index: At<u32>,
}

/// The start section: the index of the function run at instantiation.
#[derive(Clone, Copy, Debug)]
pub struct Start {
    pub func_index: At<u32>,
}

/// The data-count section (bulk-memory extension).
#[derive(Clone, Copy, Debug)]
pub struct DataCount {
    pub count: u32,
}

/// An expression restricted to a single constant-producing instruction,
/// used by global initializers and segment offsets.
///
/// The instruction list is as decoded; that it holds exactly one
/// instruction is a validation-time rule, not a decoding one.
#[derive(Clone, Debug)]
pub struct ConstantExpression {
    pub instructions: Vec<At<Instruction>>,
}

/// A global declaration.
#[derive(Clone, Debug)]
pub struct Global {
    /// Global type and mutability.
    pub global_type: At<GlobalType>,
    /// Initialization expression.
    pub init: ConstantExpression,
}

/// How an element segment is applied to a table.
#[derive(Clone, Debug)]
pub enum ElementMode {
    /// Copied into a table at instantiation.
    Active {
        table_index: At<u32>,
        offset: ConstantExpression,
    },
    /// Available to `table.init` only.
    Passive,
    /// Exists only to declare its members referenceable via `ref.func`.
    Declared,
}

/// The members of an element segment.
#[derive(Clone, Debug)]
pub enum ElementInit {
    /// A list of indices into the index space named by `kind`.
    Indices {
        kind: ExternalKind,
        list: Vec<At<u32>>,
    },
    /// A list of constant element expressions of type `elemtype`.
    Expressions {
        elemtype: ReferenceType,
        list: Vec<At<ConstantExpression>>,
    },
}

/// WebAssembly element segment.
#[derive(Clone, Debug)]
pub struct ElementSegment {
    /// How this segment should be placed.
    pub mode: ElementMode,
    /// The segment's members.
    pub init: ElementInit,
}

impl ElementSegment {
    /// The reference type of the segment's elements.
    pub fn elemtype(&self) -> ReferenceType {
        match &self.init {
            ElementInit::Indices { .. } => ReferenceType::Funcref,
            ElementInit::Expressions { elemtype, .. } => *elemtype,
        }
    }
}

/// How a data segment is applied to a memory.
#[derive(Clone, Debug)]
pub enum DataMode {
    /// Copied into a memory at instantiation.
    Active {
        memory_index: At<u32>,
        offset: ConstantExpression,
    },
    /// Available to `memory.init` only.
    Passive,
}

/// A data segment for initializing linear memory.
#[derive(Clone, Debug)]
pub struct DataSegment<'a> {
    /// How this data segment should be placed.
    pub mode: DataMode,
    /// The initial bytes, borrowed from the input.
    pub init: &'a [u8],
}

/// A run of local variables sharing one type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Locals {
    pub count: u32,
    pub valtype: ValueType,
}

/// An undecoded expression: a borrowed byte range holding an instruction
/// sequence terminated by `end`. Instructions are pulled out of it lazily
/// by [`crate::decode::ExpressionReader`].
#[derive(Clone, Copy, Debug)]
pub struct Expression<'a> {
    /// The raw instruction bytes.
    pub bytes: &'a [u8],
    /// Offset of `bytes` within the input, for diagnostics.
    pub offset: usize,
}

/// A code-section entry: one function body.
#[derive(Clone, Debug)]
pub struct Code<'a> {
    /// Local variable declarations, as (count, type) runs.
    pub locals: Vec<At<Locals>>,
    /// The body, left undecoded.
    pub body: Expression<'a>,
}
