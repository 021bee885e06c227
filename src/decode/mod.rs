// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Lazy reading of the WebAssembly binary format.
//!
//! A module is a framed sequence of sections; each known section is a
//! counted sequence of entries. Both layers are exposed as pull-based
//! streams over the borrowed input: [`SectionsReader`] yields sections,
//! [`LazySection`] yields typed entries, and [`ExpressionReader`] yields
//! instructions out of a function body. Nothing is decoded until pulled.

mod expr;
mod impls;
mod leb128;

pub use expr::ExpressionReader;

use core::marker::PhantomData;

use log::trace;
use thiserror::Error;

use crate::errors::ErrorKind;
use crate::features::Features;
use crate::types::{
    At, Code, CustomSection, DataCount, DataSegment, ElementSegment, EventType, Export, Function,
    FunctionType, Global, Import, MemoryType, SectionId, Start, TableType, Version,
};

/// A decoding failure: what went wrong and where.
///
/// Decoding stops at the first problem with the entity being decoded; the
/// enclosing lazy stream decides whether later entries are still
/// reachable.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind} at offset {offset:#x}")]
pub struct DecodeError {
    /// Byte offset within the input.
    pub offset: usize,
    /// What went wrong.
    pub kind: ErrorKind,
}

/// A cursor over a borrowed byte range.
///
/// Offsets are absolute within the original input, even for sub-ranges, so
/// every diagnostic can cite a real input position.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
    pub(crate) features: Features,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], base: usize, features: Features) -> Self {
        Self {
            data,
            pos: 0,
            base,
            features,
        }
    }

    /// The absolute offset of the next byte to be read.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn error(&self, kind: ErrorKind) -> DecodeError {
        DecodeError {
            offset: self.offset(),
            kind,
        }
    }

    pub(crate) fn error_at(&self, offset: usize, kind: ErrorKind) -> DecodeError {
        DecodeError { offset, kind }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.pos < self.data.len() {
            let byte = self.data[self.pos];
            self.pos += 1;
            Ok(byte)
        } else {
            Err(self.error(ErrorKind::UnexpectedEnd))
        }
    }

    // The LEB128 readers pin failures to the first byte of the integer.

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let offset = self.offset();
        let result = {
            let this = &mut *self;
            leb128::read_u32(move || this.read_u8().map_err(|e| e.kind))
        };
        result.map_err(|kind| DecodeError { offset, kind })
    }

    pub(crate) fn read_s32(&mut self) -> Result<i32, DecodeError> {
        let offset = self.offset();
        let result = {
            let this = &mut *self;
            leb128::read_s32(move || this.read_u8().map_err(|e| e.kind))
        };
        result.map_err(|kind| DecodeError { offset, kind })
    }

    pub(crate) fn read_s64(&mut self) -> Result<i64, DecodeError> {
        let offset = self.offset();
        let result = {
            let this = &mut *self;
            leb128::read_s64(move || this.read_u8().map_err(|e| e.kind))
        };
        result.map_err(|kind| DecodeError { offset, kind })
    }

    pub(crate) fn read_s33(&mut self) -> Result<i64, DecodeError> {
        let offset = self.offset();
        let result = {
            let this = &mut *self;
            leb128::read_s33(move || this.read_u8().map_err(|e| e.kind))
        };
        result.map_err(|kind| DecodeError { offset, kind })
    }

    pub(crate) fn read_f32(&mut self) -> Result<f32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len <= self.remaining() {
            let bytes = &self.data[self.pos..self.pos + len];
            self.pos += len;
            Ok(bytes)
        } else {
            Err(self.error(ErrorKind::UnexpectedEnd))
        }
    }

    /// Reads a length-prefixed UTF-8 string, borrowed from the input.
    pub(crate) fn read_string(&mut self) -> Result<At<&'a str>, DecodeError> {
        let len = self.read_u32()?;
        let offset = self.offset();
        let bytes = self.read_bytes(len as usize)?;
        let string = core::str::from_utf8(bytes)
            .map_err(|_| self.error_at(offset, ErrorKind::InvalidUtf8))?;
        Ok(At::new(offset, string))
    }

    /// Reads a vector count, rejecting counts that could not possibly fit
    /// in the remaining bytes (each element takes at least one).
    pub(crate) fn read_count(&mut self) -> Result<u32, DecodeError> {
        let offset = self.offset();
        let count = self.read_u32()?;
        if count as usize > self.remaining() {
            return Err(self.error_at(offset, ErrorKind::UnexpectedEnd));
        }
        Ok(count)
    }

    /// Splits off the next `len` bytes as their own cursor.
    pub(crate) fn subreader(&mut self, len: usize) -> Result<Reader<'a>, DecodeError> {
        let base = self.offset();
        let bytes = self.read_bytes(len)?;
        Ok(Reader::new(bytes, base, self.features))
    }

    /// Reads a counted vector with the given element reader.
    pub(crate) fn read_vec<T>(
        &mut self,
        mut element: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Vec<T>, DecodeError> {
        let count = self.read_count()?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(element(self)?);
        }
        Ok(items)
    }
}

/// Types that can be decoded from a [`Reader`].
pub trait Decode<'a>: Sized {
    /// Whether the enclosing lazy stream can recover after this entity
    /// fails to decode. True only for size-framed entries.
    const RESYNCS: bool = false;

    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError>;
}

/// A top-level section: either a known section or a custom one.
#[derive(Clone, Debug)]
pub enum Section<'a> {
    Known(KnownSection<'a>),
    Custom(CustomSection<'a>),
}

/// A known section whose payload has not been decoded yet.
#[derive(Clone, Copy, Debug)]
pub struct KnownSection<'a> {
    pub id: SectionId,
    /// The undecoded payload.
    pub content: &'a [u8],
    /// Absolute offset of `content` within the input.
    pub offset: usize,
    features: Features,
}

/// The typed entry streams of the known sections.
pub enum SectionEntries<'a> {
    Type(LazySection<'a, FunctionType>),
    Import(LazySection<'a, Import<'a>>),
    Function(LazySection<'a, Function>),
    Table(LazySection<'a, TableType>),
    Memory(LazySection<'a, MemoryType>),
    Global(LazySection<'a, Global>),
    Export(LazySection<'a, Export<'a>>),
    Start(At<Start>),
    Element(LazySection<'a, ElementSegment>),
    Code(LazySection<'a, Code<'a>>),
    Data(LazySection<'a, DataSegment<'a>>),
    DataCount(At<DataCount>),
    Event(LazySection<'a, EventType>),
}

impl<'a> KnownSection<'a> {
    /// Begins decoding the payload, yielding the section's typed entry
    /// stream (or its single entry, for the uncounted sections).
    pub fn entries(&self) -> Result<SectionEntries<'a>, DecodeError> {
        let mut reader = Reader::new(self.content, self.offset, self.features);
        let entries = match self.id {
            SectionId::Type => SectionEntries::Type(LazySection::new(reader)?),
            SectionId::Import => SectionEntries::Import(LazySection::new(reader)?),
            SectionId::Function => SectionEntries::Function(LazySection::new(reader)?),
            SectionId::Table => SectionEntries::Table(LazySection::new(reader)?),
            SectionId::Memory => SectionEntries::Memory(LazySection::new(reader)?),
            SectionId::Global => SectionEntries::Global(LazySection::new(reader)?),
            SectionId::Export => SectionEntries::Export(LazySection::new(reader)?),
            SectionId::Start => {
                let entry = decode_single::<Start>(&mut reader)?;
                SectionEntries::Start(entry)
            }
            SectionId::Element => SectionEntries::Element(LazySection::new(reader)?),
            SectionId::Code => SectionEntries::Code(LazySection::new(reader)?),
            SectionId::Data => SectionEntries::Data(LazySection::new(reader)?),
            SectionId::DataCount => {
                let entry = decode_single::<DataCount>(&mut reader)?;
                SectionEntries::DataCount(entry)
            }
            SectionId::Event => SectionEntries::Event(LazySection::new(reader)?),
            // Custom sections never become a KnownSection.
            SectionId::Custom => unreachable!(),
        };
        Ok(entries)
    }
}

// Decodes the whole payload of an uncounted (single-entry) section.
fn decode_single<'a, T: Decode<'a>>(reader: &mut Reader<'a>) -> Result<At<T>, DecodeError> {
    let offset = reader.offset();
    let value = T::decode(reader)?;
    if !reader.is_empty() {
        return Err(reader.error(ErrorKind::SectionLengthMismatch {
            declared: (reader.offset() - offset + reader.remaining()) as u32,
            actual: (reader.offset() - offset) as u32,
        }));
    }
    Ok(At::new(offset, value))
}

/// A lazy, counted entry stream over one known section's payload.
///
/// Pulling the next entry advances the cursor and yields
/// `Option<Result<At<T>>>`. After a failure the stream stays exhausted,
/// except for size-framed entries (code bodies) where the cursor can
/// resync to the next entry.
pub struct LazySection<'a, T: Decode<'a>> {
    reader: Reader<'a>,
    remaining: u32,
    count: u32,
    poisoned: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Decode<'a>> LazySection<'a, T> {
    fn new(mut reader: Reader<'a>) -> Result<Self, DecodeError> {
        let count = reader.read_count()?;
        Ok(Self {
            reader,
            remaining: count,
            count,
            poisoned: false,
            _marker: PhantomData,
        })
    }

    /// The declared number of entries.
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl<'a, T: Decode<'a>> Iterator for LazySection<'a, T> {
    type Item = Result<At<T>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned {
            return None;
        }
        if self.remaining == 0 {
            self.poisoned = true;
            if !self.reader.is_empty() {
                // Entries exhausted but payload bytes remain.
                let consumed = self.reader.offset() - (self.reader.base);
                return Some(Err(self.reader.error(ErrorKind::SectionLengthMismatch {
                    declared: (consumed + self.reader.remaining()) as u32,
                    actual: consumed as u32,
                })));
            }
            return None;
        }

        let offset = self.reader.offset();
        match T::decode(&mut self.reader) {
            Ok(value) => {
                self.remaining -= 1;
                Some(Ok(At::new(offset, value)))
            }
            Err(error) => {
                if T::RESYNCS && error.kind != ErrorKind::UnexpectedEnd {
                    self.remaining -= 1;
                } else {
                    self.poisoned = true;
                }
                Some(Err(error))
            }
        }
    }
}

/// The top-level section stream of a module.
///
/// Construction checks the magic and version; iteration yields sections
/// until the input is exhausted. Any framing failure is fatal to the
/// stream.
#[derive(Debug)]
pub struct SectionsReader<'a> {
    reader: Reader<'a>,
    last: Option<SectionId>,
    done: bool,
}

impl<'a> SectionsReader<'a> {
    pub fn new(data: &'a [u8], features: Features) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data, 0, features);

        let offset = reader.offset();
        let magic = reader.read_bytes(4)?;
        if magic != b"\0asm" {
            let value = u32::from_le_bytes(magic.try_into().unwrap());
            return Err(reader.error_at(offset, ErrorKind::BadMagic(value)));
        }

        let offset = reader.offset();
        let version = u32::from_le_bytes(reader.read_bytes(4)?.try_into().unwrap());
        Version::try_from(version)
            .map_err(|_| reader.error_at(offset, ErrorKind::BadVersion(version)))?;

        Ok(Self {
            reader,
            last: None,
            done: false,
        })
    }

    fn next_section(&mut self) -> Result<Option<Section<'a>>, DecodeError> {
        // There is no in-band signal for the end of a module; the best we
        // can do is expect the input to end at a section boundary.
        if self.reader.is_empty() {
            return Ok(None);
        }

        let id_offset = self.reader.offset();
        let id_byte = self.reader.read_u8()?;
        let id = SectionId::try_from(id_byte)
            .map_err(|_| self.reader.error_at(id_offset, ErrorKind::UnknownSection(id_byte)))?;

        match id {
            SectionId::DataCount if !self.reader.features.bulk_memory => {
                return Err(self
                    .reader
                    .error_at(id_offset, ErrorKind::FeatureDisabled("data count section")));
            }
            SectionId::Event if !self.reader.features.exceptions => {
                return Err(self
                    .reader
                    .error_at(id_offset, ErrorKind::FeatureDisabled("event section")));
            }
            _ => {}
        }

        // Apart from custom sections, which can appear anywhere, sections
        // appear at most once and in order.
        if id != SectionId::Custom {
            if let Some(last) = self.last {
                if !(last < id) {
                    return Err(self.reader.error_at(
                        id_offset,
                        ErrorKind::SectionOrder {
                            before: last,
                            after: id,
                        },
                    ));
                }
            }
            self.last = Some(id);
        }

        let len = self.reader.read_u32()?;
        let offset = self.reader.offset();
        let content = self.reader.read_bytes(len as usize)?;
        trace!("section {id:?}: {len} bytes at {offset:#x}");

        if id == SectionId::Custom {
            let mut sub = Reader::new(content, offset, self.reader.features);
            let name = sub.read_string()?;
            return Ok(Some(Section::Custom(CustomSection {
                name,
                data: sub.rest(),
            })));
        }
        Ok(Some(Section::Known(KnownSection {
            id,
            content,
            offset,
            features: self.reader.features,
        })))
    }
}

impl<'a> Iterator for SectionsReader<'a> {
    type Item = Result<Section<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_section() {
            Ok(Some(section)) => Some(Ok(section)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}
