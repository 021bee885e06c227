// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Instruction decoding.
//!
//! One instruction is one opcode (possibly behind a prefix byte) plus the
//! immediate shape that opcode is statically paired with. Expressions are
//! instruction sequences terminated by the `end` matching their opening
//! nesting depth; [`ExpressionReader`] yields them lazily.

use crate::decode::Decode;
use crate::errors::ErrorKind;
use crate::features::Features;
use crate::types::{
    At, BlockType, BrTableImmediate, CallIndirectImmediate, CopyImmediate, Expression,
    ImmediateKind, Immediate, InitImmediate, Instruction, MemArg, MiscOpcode, Op, Opcode,
    ReferenceType, SimdOpcode, ThreadOpcode, ValueType,
};

use super::impls::read_index;
use super::{DecodeError, Reader};

// Value type of a byte already read (block types fold the byte into a
// signed LEB), with the same feature gating as ValueType decoding.
fn value_type_from_byte(features: &Features, byte: u8) -> Result<ValueType, ErrorKind> {
    let valtype =
        ValueType::try_from(byte).map_err(|_| ErrorKind::InvalidImmediate("value type"))?;
    match valtype {
        ValueType::V128 if !features.simd => Err(ErrorKind::FeatureDisabled("v128 value type")),
        ValueType::Funcref | ValueType::Externref | ValueType::Nullref
            if !features.reference_types =>
        {
            Err(ErrorKind::FeatureDisabled("reference value type"))
        }
        _ => Ok(valtype),
    }
}

// Rejects single-byte opcodes whose feature is not enabled.
fn check_basic_opcode(features: &Features, opcode: Opcode) -> Result<(), ErrorKind> {
    use Opcode::*;
    match opcode {
        Try | Catch | Throw | Rethrow if !features.exceptions => {
            Err(ErrorKind::FeatureDisabled("exceptions"))
        }
        ReturnCall | ReturnCallIndirect if !features.tail_call => {
            Err(ErrorKind::FeatureDisabled("tail calls"))
        }
        I32Extend8S | I32Extend16S | I64Extend8S | I64Extend16S | I64Extend32S
            if !features.sign_extension =>
        {
            Err(ErrorKind::FeatureDisabled("sign extension"))
        }
        RefIsNull | SelectT | TableGet | TableSet if !features.reference_types => {
            Err(ErrorKind::FeatureDisabled("reference types"))
        }
        // ref.null and ref.func also appear in bulk-memory element
        // expressions.
        RefNull | RefFunc if !features.reference_types && !features.bulk_memory => {
            Err(ErrorKind::FeatureDisabled("reference types"))
        }
        _ => Ok(()),
    }
}

fn read_op<'a>(reader: &mut Reader<'a>) -> Result<Op, DecodeError> {
    let offset = reader.offset();
    let byte = reader.read_u8()?;
    let opcode = Opcode::try_from(byte).map_err(|_| {
        reader.error_at(
            offset,
            ErrorKind::UnknownOpcode {
                prefix: None,
                code: u32::from(byte),
            },
        )
    })?;

    match opcode {
        Opcode::MiscPrefix => {
            let code = reader.read_u32()?;
            let misc = MiscOpcode::try_from(code).map_err(|_| {
                reader.error_at(
                    offset,
                    ErrorKind::UnknownOpcode {
                        prefix: Some(0xfc),
                        code,
                    },
                )
            })?;
            let (feature_ok, feature) = if code < 8 {
                (
                    reader.features.saturating_float_to_int,
                    "saturating float-to-int",
                )
            } else {
                (reader.features.bulk_memory, "bulk memory")
            };
            if !feature_ok {
                return Err(reader.error_at(offset, ErrorKind::FeatureDisabled(feature)));
            }
            Ok(Op::Misc(misc))
        }
        Opcode::SimdPrefix => {
            if !reader.features.simd {
                return Err(reader.error_at(offset, ErrorKind::FeatureDisabled("simd")));
            }
            let code = reader.read_u32()?;
            let simd = SimdOpcode::try_from(code).map_err(|_| {
                reader.error_at(
                    offset,
                    ErrorKind::UnknownOpcode {
                        prefix: Some(0xfd),
                        code,
                    },
                )
            })?;
            Ok(Op::Simd(simd))
        }
        Opcode::ThreadPrefix => {
            if !reader.features.threads {
                return Err(reader.error_at(offset, ErrorKind::FeatureDisabled("atomics")));
            }
            let code = reader.read_u32()?;
            let atomic = ThreadOpcode::try_from(code).map_err(|_| {
                reader.error_at(
                    offset,
                    ErrorKind::UnknownOpcode {
                        prefix: Some(0xfe),
                        code,
                    },
                )
            })?;
            Ok(Op::Thread(atomic))
        }
        _ => {
            check_basic_opcode(&reader.features, opcode)
                .map_err(|kind| reader.error_at(offset, kind))?;
            Ok(Op::Basic(opcode))
        }
    }
}

fn read_block_type<'a>(reader: &mut Reader<'a>) -> Result<BlockType, DecodeError> {
    let offset = reader.offset();
    let value = reader.read_s33()?;
    if value < 0 {
        // Single-byte encodings: 0x40 for the empty type, otherwise a
        // value type byte.
        let byte = (value & 0x7f) as u8;
        if byte == 0x40 {
            return Ok(BlockType::Empty);
        }
        let valtype = value_type_from_byte(&reader.features, byte)
            .map_err(|kind| reader.error_at(offset, kind))?;
        Ok(BlockType::Result(valtype))
    } else {
        if !reader.features.multi_value {
            return Err(reader.error_at(offset, ErrorKind::FeatureDisabled("multi-value block type")));
        }
        Ok(BlockType::TypeIndex(value as u32))
    }
}

fn read_mem_arg<'a>(reader: &mut Reader<'a>) -> Result<MemArg, DecodeError> {
    Ok(MemArg {
        align: reader.read_u32()?,
        offset: reader.read_u32()?,
    })
}

fn read_immediate<'a>(reader: &mut Reader<'a>, op: Op) -> Result<Immediate, DecodeError> {
    Ok(match op.immediate_kind() {
        ImmediateKind::Empty => Immediate::Empty,
        ImmediateKind::Block => Immediate::Block(read_block_type(reader)?),
        ImmediateKind::Index => Immediate::Index(read_index(reader)?),
        ImmediateKind::CallIndirect => {
            let type_index = read_index(reader)?;
            let offset = reader.offset();
            let table_index = reader.read_u32()?;
            if table_index != 0 && !reader.features.reference_types {
                return Err(
                    reader.error_at(offset, ErrorKind::InvalidImmediate("reserved table byte"))
                );
            }
            Immediate::CallIndirect(CallIndirectImmediate {
                type_index,
                table_index,
            })
        }
        ImmediateKind::BrTable => {
            let targets = reader.read_vec(read_index)?;
            let default_target = read_index(reader)?;
            Immediate::BrTable(BrTableImmediate {
                targets,
                default_target,
            })
        }
        ImmediateKind::Byte => {
            let offset = reader.offset();
            let byte = reader.read_u8()?;
            // A nonzero byte is a memory index under multi-memory; the
            // fence ordering byte is always zero.
            let strict = op == Op::Thread(ThreadOpcode::AtomicFence);
            if byte != 0 && (strict || !reader.features.multi_memory) {
                return Err(reader.error_at(offset, ErrorKind::InvalidImmediate("reserved byte")));
            }
            Immediate::Byte(byte)
        }
        ImmediateKind::MemArg => Immediate::MemArg(read_mem_arg(reader)?),
        ImmediateKind::S32 => Immediate::S32(reader.read_s32()?),
        ImmediateKind::S64 => Immediate::S64(reader.read_s64()?),
        ImmediateKind::F32 => Immediate::F32(reader.read_f32()?),
        ImmediateKind::F64 => Immediate::F64(reader.read_f64()?),
        ImmediateKind::RefType => Immediate::RefType(ReferenceType::decode(reader)?),
        ImmediateKind::Select => {
            Immediate::Select(reader.read_vec(ValueType::decode)?)
        }
        ImmediateKind::Copy => Immediate::Copy(CopyImmediate {
            dst_index: read_index(reader)?,
            src_index: read_index(reader)?,
        }),
        ImmediateKind::Init => Immediate::Init(InitImmediate {
            segment_index: read_index(reader)?,
            dst_index: read_index(reader)?,
        }),
        ImmediateKind::Shuffle => {
            let bytes = reader.read_bytes(16)?;
            Immediate::Shuffle(bytes.try_into().unwrap())
        }
        ImmediateKind::Lane => Immediate::Lane(reader.read_u8()?),
        ImmediateKind::MemArgLane => {
            let memarg = read_mem_arg(reader)?;
            Immediate::MemArgLane {
                memarg,
                lane: reader.read_u8()?,
            }
        }
        ImmediateKind::V128 => {
            let bytes = reader.read_bytes(16)?;
            Immediate::V128(u128::from_le_bytes(bytes.try_into().unwrap()))
        }
    })
}

/// Decodes a single instruction.
pub(crate) fn read_instruction<'a>(reader: &mut Reader<'a>) -> Result<At<Instruction>, DecodeError> {
    let offset = reader.offset();
    let op = read_op(reader)?;
    let immediate = read_immediate(reader, op)?;
    Ok(At::new(offset, Instruction { op, immediate }))
}

// Whether this opcode opens or closes a nesting level. `else` and `catch`
// retarget the frame without changing depth.
fn depth_delta(op: Op) -> i32 {
    match op {
        Op::Basic(Opcode::Block | Opcode::Loop | Opcode::If | Opcode::Try) => 1,
        Op::Basic(Opcode::End) => -1,
        _ => 0,
    }
}

/// Reads an expression eagerly, returning its instructions without the
/// terminating `end`. Used for the short constant expressions.
pub(crate) fn read_expression<'a>(
    reader: &mut Reader<'a>,
) -> Result<Vec<At<Instruction>>, DecodeError> {
    let mut instructions = Vec::new();
    let mut depth = 0i32;
    loop {
        let instruction = read_instruction(reader)?;
        depth += depth_delta(instruction.op);
        if depth < 0 {
            return Ok(instructions);
        }
        instructions.push(instruction);
    }
}

/// A lazy instruction stream over one expression.
///
/// Yields instructions until the `end` matching nesting depth 0, yields
/// that `end`, and then completes. A decode failure ends the stream.
#[derive(Debug)]
pub struct ExpressionReader<'a> {
    reader: Reader<'a>,
    depth: u32,
    done: bool,
}

impl<'a> ExpressionReader<'a> {
    pub fn new(expression: Expression<'a>, features: Features) -> Self {
        Self {
            reader: Reader::new(expression.bytes, expression.offset, features),
            depth: 0,
            done: false,
        }
    }

    /// The absolute offset of the next byte to be read.
    pub fn offset(&self) -> usize {
        self.reader.offset()
    }

    /// The bytes remaining past what has been read so far. Nonempty after
    /// the stream completes means trailing garbage after the final `end`.
    pub fn rest(&self) -> &'a [u8] {
        self.reader.rest()
    }
}

impl<'a> Iterator for ExpressionReader<'a> {
    type Item = Result<At<Instruction>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_instruction(&mut self.reader) {
            Ok(instruction) => {
                match depth_delta(instruction.op) {
                    1 => self.depth += 1,
                    -1 => {
                        if self.depth == 0 {
                            self.done = true;
                        } else {
                            self.depth -= 1;
                        }
                    }
                    _ => {}
                }
                Some(Ok(instruction))
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(bytes: &[u8]) -> Reader<'_> {
        Reader::new(bytes, 0, Features::default())
    }

    fn reader_with(bytes: &[u8], features: Features) -> Reader<'_> {
        Reader::new(bytes, 0, features)
    }

    fn instr(bytes: &[u8]) -> Result<Instruction, DecodeError> {
        read_instruction(&mut reader(bytes)).map(At::into_inner)
    }

    fn instr_with(bytes: &[u8], features: Features) -> Result<Instruction, DecodeError> {
        read_instruction(&mut reader_with(bytes, features)).map(At::into_inner)
    }

    #[test]
    fn empty_immediates() {
        let i = instr(&[0x6a]).unwrap();
        assert_eq!(i.op, Op::Basic(Opcode::I32Add));
        assert_eq!(i.immediate, Immediate::Empty);
    }

    #[test]
    fn const_immediates() {
        assert_eq!(instr(&[0x41, 0x7f]).unwrap().immediate, Immediate::S32(-1));
        assert_eq!(
            instr(&[0x42, 0x80, 0x01]).unwrap().immediate,
            Immediate::S64(128)
        );
        assert_eq!(
            instr(&[0x43, 0x00, 0x00, 0x80, 0x3f]).unwrap().immediate,
            Immediate::F32(1.0)
        );
        assert_eq!(
            instr(&[0x44, 0, 0, 0, 0, 0, 0, 0xf0, 0x3f]).unwrap().immediate,
            Immediate::F64(1.0)
        );
    }

    #[test]
    fn unknown_opcode_is_reported_with_its_byte() {
        assert_eq!(
            instr(&[0x27]).unwrap_err().kind,
            ErrorKind::UnknownOpcode {
                prefix: None,
                code: 0x27
            }
        );
    }

    #[test]
    fn block_types() {
        assert_eq!(
            instr(&[0x02, 0x40, 0x0b]).unwrap().immediate,
            Immediate::Block(BlockType::Empty)
        );
        assert_eq!(
            instr(&[0x02, 0x7f, 0x0b]).unwrap().immediate,
            Immediate::Block(BlockType::Result(ValueType::I32))
        );
        assert_eq!(
            instr(&[0x02, 0x02, 0x0b]).unwrap().immediate,
            Immediate::Block(BlockType::TypeIndex(2))
        );

        let mut features = Features::default();
        features.multi_value = false;
        assert_eq!(
            instr_with(&[0x02, 0x02], features).unwrap_err().kind,
            ErrorKind::FeatureDisabled("multi-value block type")
        );
    }

    #[test]
    fn memargs() {
        let i = instr(&[0x28, 0x02, 0x10]).unwrap();
        assert_eq!(
            i.immediate,
            Immediate::MemArg(MemArg {
                align: 2,
                offset: 16
            })
        );
    }

    #[test]
    fn br_table_immediates() {
        let i = instr(&[0x0e, 0x02, 0x01, 0x00, 0x03]).unwrap();
        match i.immediate {
            Immediate::BrTable(ref imm) => {
                assert_eq!(imm.targets.len(), 2);
                assert_eq!(*imm.targets[0], 1);
                assert_eq!(*imm.targets[1], 0);
                assert_eq!(*imm.default_target, 3);
            }
            _ => panic!("expected a br_table immediate"),
        }
    }

    #[test]
    fn call_indirect_reserves_its_table_byte() {
        let i = instr(&[0x11, 0x05, 0x00]).unwrap();
        assert_eq!(
            i.immediate,
            Immediate::CallIndirect(CallIndirectImmediate {
                type_index: At::new(1, 5),
                table_index: 0,
            })
        );

        assert_eq!(
            instr(&[0x11, 0x05, 0x01]).unwrap_err().kind,
            ErrorKind::InvalidImmediate("reserved table byte")
        );

        let mut features = Features::default();
        features.reference_types = true;
        assert!(instr_with(&[0x11, 0x05, 0x01], features).is_ok());
    }

    #[test]
    fn memory_size_reserved_byte() {
        assert_eq!(instr(&[0x3f, 0x00]).unwrap().immediate, Immediate::Byte(0));
        assert_eq!(
            instr(&[0x3f, 0x01]).unwrap_err().kind,
            ErrorKind::InvalidImmediate("reserved byte")
        );

        let mut features = Features::default();
        features.multi_memory = true;
        assert_eq!(
            instr_with(&[0x3f, 0x01], features).unwrap().immediate,
            Immediate::Byte(1)
        );
    }

    #[test]
    fn feature_gated_opcodes() {
        let mut features = Features::default();
        features.sign_extension = false;
        assert_eq!(
            instr_with(&[0xc0], features).unwrap_err().kind,
            ErrorKind::FeatureDisabled("sign extension")
        );
        assert_eq!(instr(&[0xc0]).unwrap().op, Op::Basic(Opcode::I32Extend8S));

        assert_eq!(
            instr(&[0xd1]).unwrap_err().kind,
            ErrorKind::FeatureDisabled("reference types")
        );
        assert_eq!(
            instr(&[0x06, 0x40]).unwrap_err().kind,
            ErrorKind::FeatureDisabled("exceptions")
        );
        assert_eq!(
            instr(&[0x12, 0x00]).unwrap_err().kind,
            ErrorKind::FeatureDisabled("tail calls")
        );
        assert_eq!(
            instr(&[0xfd, 0x00, 0x00, 0x00]).unwrap_err().kind,
            ErrorKind::FeatureDisabled("simd")
        );
        assert_eq!(
            instr(&[0xfe, 0x00, 0x00, 0x00]).unwrap_err().kind,
            ErrorKind::FeatureDisabled("atomics")
        );
    }

    #[test]
    fn exception_opcodes_carry_their_indices() {
        let mut features = Features::default();
        features.exceptions = true;

        let i = instr_with(&[0x07, 0x02], features).unwrap();
        assert_eq!(i.op, Op::Basic(Opcode::Catch));
        assert_eq!(i.immediate, Immediate::Index(At::new(1, 2)));

        let i = instr_with(&[0x08, 0x00], features).unwrap();
        assert_eq!(i.op, Op::Basic(Opcode::Throw));

        let i = instr_with(&[0x09, 0x01], features).unwrap();
        assert_eq!(i.op, Op::Basic(Opcode::Rethrow));
        assert_eq!(i.immediate, Immediate::Index(At::new(1, 1)));

        assert_eq!(
            instr(&[0x09, 0x00]).unwrap_err().kind,
            ErrorKind::FeatureDisabled("exceptions")
        );
    }

    #[test]
    fn misc_opcodes_split_their_gates() {
        // trunc_sat is on by default; bulk memory is not.
        assert_eq!(
            instr(&[0xfc, 0x00]).unwrap().op,
            Op::Misc(MiscOpcode::I32TruncSatF32S)
        );
        assert_eq!(
            instr(&[0xfc, 0x0a, 0x00, 0x00]).unwrap_err().kind,
            ErrorKind::FeatureDisabled("bulk memory")
        );

        let mut features = Features::default();
        features.bulk_memory = true;
        let i = instr_with(&[0xfc, 0x0a, 0x00, 0x00], features).unwrap();
        assert_eq!(i.op, Op::Misc(MiscOpcode::MemoryCopy));
        assert_eq!(
            instr_with(&[0xfc, 0x12], features).unwrap_err().kind,
            ErrorKind::UnknownOpcode {
                prefix: Some(0xfc),
                code: 0x12
            }
        );
    }

    #[test]
    fn simd_immediates() {
        let mut features = Features::default();
        features.simd = true;

        let shuffle_bytes: Vec<u8> = [0xfd, 0x0d]
            .iter()
            .copied()
            .chain(0..16)
            .collect();
        let i = instr_with(&shuffle_bytes, features).unwrap();
        match i.immediate {
            Immediate::Shuffle(lanes) => assert_eq!(lanes[15], 15),
            _ => panic!("expected a shuffle immediate"),
        }

        let i = instr_with(&[0xfd, 0x15, 0x03], features).unwrap();
        assert_eq!(i.op, Op::Simd(SimdOpcode::I8x16ExtractLaneS));
        assert_eq!(i.immediate, Immediate::Lane(3));

        let i = instr_with(&[0xfd, 0x54, 0x00, 0x04, 0x01], features).unwrap();
        assert_eq!(i.op, Op::Simd(SimdOpcode::V128Load8Lane));
        assert_eq!(
            i.immediate,
            Immediate::MemArgLane {
                memarg: MemArg { align: 0, offset: 4 },
                lane: 1,
            }
        );
    }

    #[test]
    fn expression_reader_tracks_nesting() {
        // block (i32.const 1) (if (then nop)) end end
        let body = [
            0x02, 0x40, // block
            0x41, 0x01, // i32.const 1
            0x04, 0x40, // if
            0x01, // nop
            0x0b, // end (if)
            0x0b, // end (block)
            0x0b, // end (expression)
        ];
        let expression = Expression {
            bytes: &body,
            offset: 0,
        };
        let ops: Vec<Op> = ExpressionReader::new(expression, Features::default())
            .map(|i| i.unwrap().op)
            .collect();
        assert_eq!(ops.len(), 7);
        assert_eq!(ops[6], Op::Basic(Opcode::End));
    }

    #[test]
    fn expression_reader_stops_after_matching_end() {
        let body = [0x01, 0x0b, 0x01, 0x01];
        let expression = Expression {
            bytes: &body,
            offset: 0,
        };
        let mut exprs = ExpressionReader::new(expression, Features::default());
        assert!(exprs.next().unwrap().is_ok()); // nop
        assert!(exprs.next().unwrap().is_ok()); // end
        assert!(exprs.next().is_none());
        assert_eq!(exprs.rest(), [0x01, 0x01]);
    }

    #[test]
    fn truncated_expression_is_unexpected_end() {
        let expression = Expression {
            bytes: &[0x02, 0x40, 0x01],
            offset: 0,
        };
        let mut exprs = ExpressionReader::new(expression, Features::default());
        assert!(exprs.next().unwrap().is_ok()); // block
        assert!(exprs.next().unwrap().is_ok()); // nop
        let error = exprs.next().unwrap().unwrap_err();
        assert_eq!(error.kind, ErrorKind::UnexpectedEnd);
        assert!(exprs.next().is_none());
    }

    #[test]
    fn constant_expressions_read_in_place() {
        let mut r = reader(&[0x41, 0x2a, 0x0b, 0x99]);
        let instructions = read_expression(&mut r).unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].immediate, Immediate::S32(42));
        assert_eq!(r.rest(), [0x99]);
    }
}
