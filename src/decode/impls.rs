// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Decode implementations for the WebAssembly entity types.

use crate::errors::ErrorKind;
use crate::types::{
    At, Code, ConstantExpression, DataCount, DataMode, DataSegment, ElementInit, ElementMode,
    ElementSegment, EventType, Export, Expression, ExternalKind, Function, FunctionType, Global,
    GlobalType, Import, ImportDescriptor, Limits, Locals, MemoryType, Mutability, ReferenceType,
    Shared, Start, TableType, ValueType,
};

use super::expr::read_expression;
use super::{Decode, DecodeError, Reader};

// Reads a LEB128 index, remembering where it started.
pub(super) fn read_index<'a>(reader: &mut Reader<'a>) -> Result<At<u32>, DecodeError> {
    let offset = reader.offset();
    Ok(At::new(offset, reader.read_u32()?))
}

fn read_at<'a, T: Decode<'a>>(reader: &mut Reader<'a>) -> Result<At<T>, DecodeError> {
    let offset = reader.offset();
    Ok(At::new(offset, T::decode(reader)?))
}

impl<'a> Decode<'a> for ValueType {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let byte = reader.read_u8()?;
        let valtype = ValueType::try_from(byte)
            .map_err(|_| reader.error_at(offset, ErrorKind::InvalidImmediate("value type")))?;
        match valtype {
            ValueType::V128 if !reader.features.simd => {
                Err(reader.error_at(offset, ErrorKind::FeatureDisabled("v128 value type")))
            }
            ValueType::Funcref | ValueType::Externref | ValueType::Nullref
                if !reader.features.reference_types =>
            {
                Err(reader.error_at(offset, ErrorKind::FeatureDisabled("reference value type")))
            }
            _ => Ok(valtype),
        }
    }
}

impl<'a> Decode<'a> for ReferenceType {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let byte = reader.read_u8()?;
        let reftype = ReferenceType::try_from(byte)
            .map_err(|_| reader.error_at(offset, ErrorKind::InvalidImmediate("reference type")))?;
        if reftype != ReferenceType::Funcref && !reader.features.reference_types {
            return Err(reader.error_at(offset, ErrorKind::FeatureDisabled("reference type")));
        }
        Ok(reftype)
    }
}

impl<'a> Decode<'a> for Mutability {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let byte = reader.read_u8()?;
        Mutability::try_from(byte)
            .map_err(|_| reader.error_at(offset, ErrorKind::InvalidImmediate("mutability")))
    }
}

impl<'a> Decode<'a> for Limits {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let flag = reader.read_u8()?;
        let (has_max, shared) = match flag {
            0x00 => (false, Shared::No),
            0x01 => (true, Shared::No),
            0x03 => {
                if !reader.features.threads {
                    return Err(reader.error_at(offset, ErrorKind::FeatureDisabled("shared limits")));
                }
                (true, Shared::Yes)
            }
            _ => return Err(reader.error_at(offset, ErrorKind::InvalidImmediate("limits flag"))),
        };
        let min = reader.read_u32()?;
        let max = if has_max {
            Some(reader.read_u32()?)
        } else {
            None
        };
        Ok(Limits { min, max, shared })
    }
}

impl<'a> Decode<'a> for TableType {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(TableType {
            elemtype: ReferenceType::decode(reader)?,
            limits: Limits::decode(reader)?,
        })
    }
}

impl<'a> Decode<'a> for MemoryType {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(MemoryType {
            limits: Limits::decode(reader)?,
        })
    }
}

impl<'a> Decode<'a> for GlobalType {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(GlobalType {
            valtype: ValueType::decode(reader)?,
            mutability: Mutability::decode(reader)?,
        })
    }
}

impl<'a> Decode<'a> for EventType {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let attribute = reader.read_u32()?;
        // Only the exception attribute is defined.
        if attribute != 0 {
            return Err(reader.error_at(offset, ErrorKind::InvalidImmediate("event attribute")));
        }
        Ok(EventType {
            attribute,
            type_index: reader.read_u32()?,
        })
    }
}

impl<'a> Decode<'a> for FunctionType {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let token = reader.read_u8()?;
        if token != 0x60 {
            return Err(reader.error_at(offset, ErrorKind::InvalidImmediate("function type")));
        }
        Ok(FunctionType {
            params: reader.read_vec(ValueType::decode)?,
            results: reader.read_vec(ValueType::decode)?,
        })
    }
}

impl<'a> Decode<'a> for Function {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(Function {
            type_index: reader.read_u32()?,
        })
    }
}

impl<'a> Decode<'a> for Import<'a> {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let module = reader.read_string()?;
        let field = reader.read_string()?;

        let offset = reader.offset();
        let byte = reader.read_u8()?;
        let kind = ExternalKind::try_from(byte).map_err(|_| {
            reader.error_at(offset, ErrorKind::InvalidImmediate("import descriptor"))
        })?;
        let descriptor = match kind {
            ExternalKind::Function => ImportDescriptor::Function(reader.read_u32()?),
            ExternalKind::Table => ImportDescriptor::Table(TableType::decode(reader)?),
            ExternalKind::Memory => ImportDescriptor::Memory(MemoryType::decode(reader)?),
            ExternalKind::Global => ImportDescriptor::Global(GlobalType::decode(reader)?),
            ExternalKind::Event => {
                if !reader.features.exceptions {
                    return Err(reader.error_at(offset, ErrorKind::FeatureDisabled("event import")));
                }
                ImportDescriptor::Event(EventType::decode(reader)?)
            }
        };
        Ok(Import {
            module,
            field,
            descriptor,
        })
    }
}

impl<'a> Decode<'a> for Export<'a> {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let name = reader.read_string()?;
        let offset = reader.offset();
        let byte = reader.read_u8()?;
        let kind = ExternalKind::try_from(byte)
            .map_err(|_| reader.error_at(offset, ErrorKind::InvalidImmediate("export kind")))?;
        if kind == ExternalKind::Event && !reader.features.exceptions {
            return Err(reader.error_at(offset, ErrorKind::FeatureDisabled("event export")));
        }
        Ok(Export {
            name,
            kind,
            index: read_index(reader)?,
        })
    }
}

impl<'a> Decode<'a> for Start {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(Start {
            func_index: read_index(reader)?,
        })
    }
}

impl<'a> Decode<'a> for DataCount {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(DataCount {
            count: reader.read_u32()?,
        })
    }
}

impl<'a> Decode<'a> for ConstantExpression {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(ConstantExpression {
            instructions: read_expression(reader)?,
        })
    }
}

impl<'a> Decode<'a> for Global {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(Global {
            global_type: read_at(reader)?,
            init: ConstantExpression::decode(reader)?,
        })
    }
}

impl<'a> Decode<'a> for ElementSegment {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let flags = reader.read_u32()?;
        if flags > 7 {
            return Err(reader.error_at(offset, ErrorKind::InvalidImmediate("element segment kind")));
        }
        if flags != 0 && !reader.features.bulk_memory {
            return Err(
                reader.error_at(offset, ErrorKind::FeatureDisabled("element segment kind"))
            );
        }

        let mode = match flags {
            0 | 4 => ElementMode::Active {
                table_index: At::new(offset, 0),
                offset: ConstantExpression::decode(reader)?,
            },
            2 | 6 => {
                let table_index = read_index(reader)?;
                ElementMode::Active {
                    table_index,
                    offset: ConstantExpression::decode(reader)?,
                }
            }
            1 | 5 => ElementMode::Passive,
            _ => ElementMode::Declared,
        };

        let init = if flags & 0x04 == 0 {
            // Index-list form. Forms 0 carries an implicit function kind;
            // the others spell the external kind out.
            let kind = if flags == 0 {
                ExternalKind::Function
            } else {
                let kind_offset = reader.offset();
                let byte = reader.read_u8()?;
                ExternalKind::try_from(byte).map_err(|_| {
                    reader.error_at(kind_offset, ErrorKind::InvalidImmediate("element kind"))
                })?
            };
            ElementInit::Indices {
                kind,
                list: reader.read_vec(read_index)?,
            }
        } else {
            // Expression-list form.
            let elemtype = if flags == 4 {
                ReferenceType::Funcref
            } else {
                ReferenceType::decode(reader)?
            };
            ElementInit::Expressions {
                elemtype,
                list: reader.read_vec(read_at)?,
            }
        };

        Ok(ElementSegment { mode, init })
    }
}

impl<'a> Decode<'a> for DataSegment<'a> {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let flags = reader.read_u32()?;
        if flags != 0 && !reader.features.bulk_memory {
            return Err(reader.error_at(offset, ErrorKind::FeatureDisabled("data segment kind")));
        }
        let mode = match flags {
            0 => DataMode::Active {
                memory_index: At::new(offset, 0),
                offset: ConstantExpression::decode(reader)?,
            },
            1 => DataMode::Passive,
            2 => {
                let memory_index = read_index(reader)?;
                DataMode::Active {
                    memory_index,
                    offset: ConstantExpression::decode(reader)?,
                }
            }
            _ => {
                return Err(reader.error_at(offset, ErrorKind::InvalidImmediate("data segment kind")))
            }
        };
        let len = reader.read_u32()?;
        Ok(DataSegment {
            mode,
            init: reader.read_bytes(len as usize)?,
        })
    }
}

impl<'a> Decode<'a> for Locals {
    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        Ok(Locals {
            count: reader.read_u32()?,
            valtype: ValueType::decode(reader)?,
        })
    }
}

impl<'a> Decode<'a> for Code<'a> {
    // Code entries are size-framed, so one bad body does not take the
    // rest of the section with it.
    const RESYNCS: bool = true;

    fn decode(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let size = reader.read_u32()?;
        let mut body = reader.subreader(size as usize)?;
        let locals = body.read_vec(read_at)?;
        Ok(Code {
            locals,
            body: Expression {
                bytes: body.rest(),
                offset: body.offset(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Features;

    fn reader(bytes: &[u8]) -> Reader<'_> {
        Reader::new(bytes, 0, Features::default())
    }

    fn reader_with(bytes: &[u8], features: Features) -> Reader<'_> {
        Reader::new(bytes, 0, features)
    }

    #[test]
    fn function_type_decodes_params_and_results() {
        // (i32, i64) -> f32
        let mut r = reader(&[0x60, 0x02, 0x7f, 0x7e, 0x01, 0x7d]);
        let ty = FunctionType::decode(&mut r).unwrap();
        assert_eq!(ty.params, [ValueType::I32, ValueType::I64]);
        assert_eq!(ty.results, [ValueType::F32]);
        assert!(r.is_empty());
    }

    #[test]
    fn function_type_requires_its_token() {
        let mut r = reader(&[0x61, 0x00, 0x00]);
        let error = FunctionType::decode(&mut r).unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidImmediate("function type"));
    }

    #[test]
    fn value_types_gate_on_features() {
        let mut r = reader(&[0x7b]);
        assert_eq!(
            ValueType::decode(&mut r).unwrap_err().kind,
            ErrorKind::FeatureDisabled("v128 value type")
        );

        let mut features = Features::default();
        features.simd = true;
        let mut r = reader_with(&[0x7b], features);
        assert_eq!(ValueType::decode(&mut r).unwrap(), ValueType::V128);
    }

    #[test]
    fn limits_flags() {
        let mut r = reader(&[0x00, 0x01]);
        assert_eq!(
            Limits::decode(&mut r).unwrap(),
            Limits {
                min: 1,
                max: None,
                shared: Shared::No
            }
        );

        let mut r = reader(&[0x01, 0x01, 0x02]);
        assert_eq!(
            Limits::decode(&mut r).unwrap(),
            Limits {
                min: 1,
                max: Some(2),
                shared: Shared::No
            }
        );

        let mut r = reader(&[0x02, 0x01]);
        assert_eq!(
            Limits::decode(&mut r).unwrap_err().kind,
            ErrorKind::InvalidImmediate("limits flag")
        );

        // Shared limits need the threads feature.
        let mut r = reader(&[0x03, 0x01, 0x02]);
        assert_eq!(
            Limits::decode(&mut r).unwrap_err().kind,
            ErrorKind::FeatureDisabled("shared limits")
        );
        let mut features = Features::default();
        features.threads = true;
        let mut r = reader_with(&[0x03, 0x01, 0x02], features);
        assert_eq!(Limits::decode(&mut r).unwrap().shared, Shared::Yes);
    }

    #[test]
    fn import_decodes_each_descriptor() {
        // "env" "f" (func 2)
        let mut r = reader(&[
            0x03, b'e', b'n', b'v', 0x01, b'f', 0x00, 0x02,
        ]);
        let import = Import::decode(&mut r).unwrap();
        assert_eq!(*import.module, "env");
        assert_eq!(*import.field, "f");
        assert_eq!(import.descriptor, ImportDescriptor::Function(2));

        // "env" "g" (global i32 mut)
        let mut r = reader(&[
            0x03, b'e', b'n', b'v', 0x01, b'g', 0x03, 0x7f, 0x01,
        ]);
        let import = Import::decode(&mut r).unwrap();
        assert_eq!(
            import.descriptor,
            ImportDescriptor::Global(GlobalType {
                valtype: ValueType::I32,
                mutability: Mutability::Var,
            })
        );
    }

    #[test]
    fn import_with_bad_name_is_invalid_utf8() {
        let mut r = reader(&[0x01, 0xff, 0x01, b'f', 0x00, 0x00]);
        assert_eq!(
            Import::decode(&mut r).unwrap_err().kind,
            ErrorKind::InvalidUtf8
        );
    }

    #[test]
    fn element_segment_form_zero() {
        // (elem (i32.const 1) 0 2)
        let mut r = reader(&[0x00, 0x41, 0x01, 0x0b, 0x02, 0x00, 0x02]);
        let segment = ElementSegment::decode(&mut r).unwrap();
        match &segment.mode {
            ElementMode::Active {
                table_index,
                offset,
            } => {
                assert_eq!(**table_index, 0u32);
                assert_eq!(offset.instructions.len(), 1);
            }
            _ => panic!("expected an active segment"),
        }
        match &segment.init {
            ElementInit::Indices { kind, list } => {
                assert_eq!(*kind, ExternalKind::Function);
                assert_eq!(list.len(), 2);
            }
            _ => panic!("expected an index list"),
        }
    }

    #[test]
    fn element_segment_forms_require_bulk_memory() {
        let mut r = reader(&[0x01, 0x00, 0x00]);
        assert_eq!(
            ElementSegment::decode(&mut r).unwrap_err().kind,
            ErrorKind::FeatureDisabled("element segment kind")
        );

        let mut features = Features::default();
        features.bulk_memory = true;
        let mut r = reader_with(&[0x01, 0x00, 0x01, 0x04], features);
        let segment = ElementSegment::decode(&mut r).unwrap();
        assert!(matches!(segment.mode, ElementMode::Passive));
    }

    #[test]
    fn declared_segment_with_expressions() {
        let mut features = Features::default();
        features.bulk_memory = true;
        features.reference_types = true;
        // (elem declare funcref (ref.func 3))
        let mut r = reader_with(&[0x07, 0x70, 0x01, 0xd2, 0x03, 0x0b], features);
        let segment = ElementSegment::decode(&mut r).unwrap();
        assert!(matches!(segment.mode, ElementMode::Declared));
        match &segment.init {
            ElementInit::Expressions { elemtype, list } => {
                assert_eq!(*elemtype, ReferenceType::Funcref);
                assert_eq!(list.len(), 1);
            }
            _ => panic!("expected expressions"),
        }
    }

    #[test]
    fn data_segment_active_and_passive() {
        let mut r = reader(&[0x00, 0x41, 0x00, 0x0b, 0x03, 1, 2, 3]);
        let segment = DataSegment::decode(&mut r).unwrap();
        assert!(matches!(segment.mode, DataMode::Active { .. }));
        assert_eq!(segment.init, [1, 2, 3]);

        let mut features = Features::default();
        features.bulk_memory = true;
        let mut r = reader_with(&[0x01, 0x02, 9, 9], features);
        let segment = DataSegment::decode(&mut r).unwrap();
        assert!(matches!(segment.mode, DataMode::Passive));
        assert_eq!(segment.init, [9, 9]);
    }

    #[test]
    fn code_entry_frames_its_locals_and_body() {
        // size 6: locals [(2 x i32)], body [local.get 0, end]
        let mut r = reader(&[0x06, 0x01, 0x02, 0x7f, 0x20, 0x00, 0x0b]);
        let code = Code::decode(&mut r).unwrap();
        assert_eq!(code.locals.len(), 1);
        assert_eq!(
            *code.locals[0],
            Locals {
                count: 2,
                valtype: ValueType::I32
            }
        );
        assert_eq!(code.body.bytes, [0x20, 0x00, 0x0b]);
        assert_eq!(code.body.offset, 4);
        assert!(r.is_empty());
    }
}
