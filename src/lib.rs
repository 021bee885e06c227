// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Lazy reading and validation of WebAssembly binary modules.
//!
//! The input is a borrowed byte range. [`decode::SectionsReader`] streams
//! its sections, each known section streams typed entries, and code bodies
//! stream instructions; nothing is decoded until pulled. [`validate`]
//! drives those streams through the full type- and structure-checking
//! rules, reporting every problem to an [`errors::ErrorSink`]. A module
//! only needs to be materialized as a [`Module`] when the decoded entries
//! themselves are wanted.
//!
//! ```
//! use gauze::{errors::CollectedErrors, Features};
//!
//! let module = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
//! let mut errors = CollectedErrors::new();
//! assert!(gauze::validate(&module, Features::default(), &mut errors));
//! assert!(errors.is_empty());
//! ```

pub mod decode;
pub mod errors;
mod features;
pub mod types;
pub mod validate;

pub use features::Features;
pub use validate::validate;

use decode::{Decode, DecodeError, LazySection, Section, SectionEntries, SectionsReader};
use errors::ErrorSink;
use types::{
    At, Code, CustomSection, DataCount, DataSegment, ElementSegment, EventType, Export, Function,
    FunctionType, Global, Import, MemoryType, Start, TableType,
};

/// A fully decoded module, borrowing names, body bytes, and data segments
/// from the input buffer.
///
/// Decoding stops at the first malformed byte; for exhaustive diagnostics
/// over malformed input, use the streaming [`validate`] instead.
#[derive(Debug, Default)]
pub struct Module<'a> {
    /// The feature set the module was decoded under.
    pub features: Features,
    /// Function type declarations.
    pub types: Vec<At<FunctionType>>,
    /// Import declarations.
    pub imports: Vec<At<Import<'a>>>,
    /// Type indices of the module's own functions.
    pub functions: Vec<At<Function>>,
    /// Table declarations.
    pub tables: Vec<At<TableType>>,
    /// Memory declarations.
    pub memories: Vec<At<MemoryType>>,
    /// Global variable declarations.
    pub globals: Vec<At<Global>>,
    /// Exception event declarations.
    pub events: Vec<At<EventType>>,
    /// Export declarations.
    pub exports: Vec<At<Export<'a>>>,
    /// Start function index.
    pub start: Option<At<Start>>,
    /// Element segments.
    pub elements: Vec<At<ElementSegment>>,
    /// Declared data segment count.
    pub data_count: Option<At<DataCount>>,
    /// Function bodies.
    pub codes: Vec<At<Code<'a>>>,
    /// Data segments.
    pub data: Vec<At<DataSegment<'a>>>,
    /// Custom sections, in order of appearance.
    pub customs: Vec<CustomSection<'a>>,
}

fn collect<'a, T: Decode<'a>>(entries: LazySection<'a, T>) -> Result<Vec<At<T>>, DecodeError> {
    entries.collect()
}

impl<'a> Module<'a> {
    /// Decodes a module from `bytes`, which must outlive it.
    pub fn decode(bytes: &'a [u8], features: Features) -> Result<Self, DecodeError> {
        let mut module = Module {
            features,
            ..Module::default()
        };
        for section in SectionsReader::new(bytes, features)? {
            match section? {
                Section::Custom(custom) => module.customs.push(custom),
                Section::Known(section) => match section.entries()? {
                    SectionEntries::Type(entries) => module.types = collect(entries)?,
                    SectionEntries::Import(entries) => module.imports = collect(entries)?,
                    SectionEntries::Function(entries) => module.functions = collect(entries)?,
                    SectionEntries::Table(entries) => module.tables = collect(entries)?,
                    SectionEntries::Memory(entries) => module.memories = collect(entries)?,
                    SectionEntries::Global(entries) => module.globals = collect(entries)?,
                    SectionEntries::Export(entries) => module.exports = collect(entries)?,
                    SectionEntries::Start(start) => module.start = Some(start),
                    SectionEntries::Element(entries) => module.elements = collect(entries)?,
                    SectionEntries::Code(entries) => module.codes = collect(entries)?,
                    SectionEntries::Data(entries) => module.data = collect(entries)?,
                    SectionEntries::DataCount(count) => module.data_count = Some(count),
                    SectionEntries::Event(entries) => module.events = collect(entries)?,
                },
            }
        }
        Ok(module)
    }

    /// Validates the decoded module, reporting every problem to `errors`.
    pub fn validate(&self, errors: &mut dyn ErrorSink) -> bool {
        validate::validate_module(self, errors)
    }
}
