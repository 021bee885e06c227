// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Expression and function-body validation.
//!
//! Constant expressions are checked against a small allowed instruction
//! set. Function bodies get the full stack-based treatment: a value stack
//! of `Option<ValueType>` (`None` is the bottom type that unreachable code
//! introduces), a control stack of labelled frames, and error recovery
//! that pushes bottom so one mistake does not cascade.

use crate::decode::ExpressionReader;
use crate::errors::ErrorKind;
use crate::features::Features;
use crate::types::{
    At, BlockType, Code, ConstantExpression, FunctionType, Immediate, Instruction, MemArg,
    MiscOpcode, Op, Opcode, ReferenceType, SimdOpcode, ThreadOpcode, ValueType,
};

use super::Context;

/// What a constant expression initializes, which decides which globals it
/// may read and whether `ref.func` resolution is deferred.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConstantExpressionKind {
    /// A global's own initializer: only imported globals are addressable,
    /// and `ref.func` indices resolve at end-of-module.
    GlobalInit,
    /// Segment offsets and other constant positions.
    Other,
}

// `None` (bottom) is assignable to everything; null references to every
// reference type; funcref to externref only under reference-types.
fn assignable(actual: Option<ValueType>, expected: ValueType, features: &Features) -> bool {
    match actual {
        None => true,
        Some(actual) => {
            actual == expected
                || (actual == ValueType::Nullref && expected.is_reference())
                || (features.reference_types
                    && actual == ValueType::Funcref
                    && expected == ValueType::Externref)
        }
    }
}

fn ref_assignable(actual: ReferenceType, expected: ReferenceType, features: &Features) -> bool {
    assignable(Some(actual.into()), expected.into(), features)
}

fn type_name(ty: Option<ValueType>) -> String {
    match ty {
        Some(ty) => ty.to_string(),
        None => "unknown".to_string(),
    }
}

fn types_string(types: &[ValueType]) -> String {
    let mut out = String::from("[");
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&ty.to_string());
    }
    out.push(']');
    out
}

pub(crate) fn validate_constant_expression(
    expr: &ConstantExpression,
    at: usize,
    kind: ConstantExpressionKind,
    expected: ValueType,
    ctx: &mut Context,
) -> bool {
    ctx.with_context(at, "constant expression", |ctx| {
        if expr.instructions.len() != 1 {
            ctx.report(
                at,
                ErrorKind::TypeMismatch {
                    expected: "a single constant instruction".to_string(),
                    actual: format!("{} instructions", expr.instructions.len()),
                },
            );
            return false;
        }

        let instruction = &expr.instructions[0];
        let offset = instruction.offset();
        let mut valid = true;
        let actual = match instruction.op {
            Op::Basic(Opcode::I32Const) => ValueType::I32,
            Op::Basic(Opcode::I64Const) => ValueType::I64,
            Op::Basic(Opcode::F32Const) => ValueType::F32,
            Op::Basic(Opcode::F64Const) => ValueType::F64,
            Op::Basic(Opcode::GlobalGet) => {
                let Some(index) = instruction.index_immediate() else {
                    ctx.report(offset, ErrorKind::InvalidImmediate("immediate"));
                    return false;
                };
                if !ctx.check_index(index.offset(), *index, ctx.globals.len(), "global index") {
                    return false;
                }
                // A global's own initializer may only read imported
                // globals. The global still exists, so the remaining
                // checks stay useful.
                if kind == ConstantExpressionKind::GlobalInit
                    && *index as usize >= ctx.imported_global_count
                {
                    ctx.report(
                        index.offset(),
                        ErrorKind::IndexOutOfRange {
                            desc: "global index",
                            index: *index,
                            max: ctx.imported_global_count as u32,
                        },
                    );
                    valid = false;
                }
                let global = ctx.globals[*index as usize];
                if kind == ConstantExpressionKind::GlobalInit
                    && global.mutability == crate::types::Mutability::Var
                {
                    ctx.report(index.offset(), ErrorKind::MutableGlobalInConstExpr);
                    valid = false;
                }
                global.valtype
            }
            Op::Basic(Opcode::RefNull) => {
                let Some(reftype) = instruction.reference_type_immediate() else {
                    ctx.report(offset, ErrorKind::InvalidImmediate("immediate"));
                    return false;
                };
                reftype.into()
            }
            Op::Basic(Opcode::RefFunc) => {
                let Some(index) = instruction.index_immediate() else {
                    ctx.report(offset, ErrorKind::InvalidImmediate("immediate"));
                    return false;
                };
                if kind == ConstantExpressionKind::GlobalInit {
                    // The element section has not been seen yet; resolve
                    // at end-of-module.
                    ctx.deferred_function_references.push(index);
                } else if !ctx.check_index(
                    index.offset(),
                    *index,
                    ctx.functions.len(),
                    "function index",
                ) {
                    return false;
                }
                ValueType::Funcref
            }
            _ => {
                ctx.report(
                    offset,
                    ErrorKind::TypeMismatch {
                        expected: "a constant instruction".to_string(),
                        actual: format!("{:?}", instruction.op),
                    },
                );
                return false;
            }
        };

        if !assignable(Some(actual), expected, &ctx.features) {
            ctx.report(
                offset,
                ErrorKind::TypeMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                },
            );
            valid = false;
        }
        valid
    })
}

pub(crate) fn validate_element_expression(
    expr: &ConstantExpression,
    at: usize,
    elemtype: ReferenceType,
    ctx: &mut Context,
) -> bool {
    ctx.with_context(at, "element expression", |ctx| {
        if expr.instructions.len() != 1 {
            ctx.report(
                at,
                ErrorKind::TypeMismatch {
                    expected: "a single constant instruction".to_string(),
                    actual: format!("{} instructions", expr.instructions.len()),
                },
            );
            return false;
        }

        let instruction = &expr.instructions[0];
        let offset = instruction.offset();
        let mut valid = true;
        let actual = match instruction.op {
            Op::Basic(Opcode::RefNull) => match instruction.reference_type_immediate() {
                Some(reftype) => reftype,
                None => {
                    ctx.report(offset, ErrorKind::InvalidImmediate("immediate"));
                    return false;
                }
            },
            Op::Basic(Opcode::RefFunc) => {
                let Some(index) = instruction.index_immediate() else {
                    ctx.report(offset, ErrorKind::InvalidImmediate("immediate"));
                    return false;
                };
                valid &= ctx.check_index(
                    index.offset(),
                    *index,
                    ctx.functions.len(),
                    "function index",
                );
                ctx.declared_functions.insert(*index);
                ReferenceType::Funcref
            }
            _ => {
                ctx.report(
                    offset,
                    ErrorKind::TypeMismatch {
                        expected: "a constant element instruction".to_string(),
                        actual: format!("{:?}", instruction.op),
                    },
                );
                return false;
            }
        };

        if !ref_assignable(actual, elemtype, &ctx.features) {
            ctx.report(
                offset,
                ErrorKind::TypeMismatch {
                    expected: ValueType::from(elemtype).to_string(),
                    actual: ValueType::from(actual).to_string(),
                },
            );
            valid = false;
        }
        valid
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LabelKind {
    Block,
    Loop,
    If,
    Else,
    Try,
    Catch,
}

// One control frame: the label branches target, the types it was entered
// with, and the value-stack floor beneath which this frame cannot pop.
#[derive(Debug)]
struct Label {
    kind: LabelKind,
    params: Vec<ValueType>,
    results: Vec<ValueType>,
    height: usize,
    unreachable: bool,
}

impl Label {
    // Branches to a loop re-enter it, so they carry its parameters;
    // branches to anything else leave it, carrying its results.
    fn label_types(&self) -> &[ValueType] {
        if self.kind == LabelKind::Loop {
            &self.params
        } else {
            &self.results
        }
    }
}

/// The stack-based type checker for one function body.
pub(crate) struct CodeValidator {
    locals: Vec<ValueType>,
    values: Vec<Option<ValueType>>,
    labels: Vec<Label>,
    // Set once the implicit frame's end has been consumed.
    finished: bool,
    // Set when a stack ceiling was hit; the rest of the body is skipped.
    gave_up: bool,
}

impl CodeValidator {
    pub(crate) fn new(signature: &FunctionType, locals: Vec<ValueType>) -> Self {
        Self {
            locals,
            values: Vec::new(),
            labels: vec![Label {
                kind: LabelKind::Block,
                params: Vec::new(),
                results: signature.results.clone(),
                height: 0,
                unreachable: false,
            }],
            finished: false,
            gave_up: false,
        }
    }

    fn bad_immediate(&mut self, ctx: &mut Context, offset: usize) -> bool {
        ctx.report(offset, ErrorKind::InvalidImmediate("immediate"));
        false
    }

    fn push_value(&mut self, ctx: &mut Context, offset: usize, ty: Option<ValueType>) -> bool {
        if self.values.len() >= ctx.max_stack_height {
            ctx.report(offset, ErrorKind::InternalLimitExceeded("value stack height"));
            self.gave_up = true;
            return false;
        }
        self.values.push(ty);
        true
    }

    fn push_values(&mut self, ctx: &mut Context, offset: usize, types: &[ValueType]) -> bool {
        let mut ok = true;
        for ty in types {
            ok &= self.push_value(ctx, offset, Some(*ty));
        }
        ok
    }

    // Pushes an instruction's outputs; bottom instead when its inputs
    // failed, so one error does not cascade.
    fn push_outputs(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        ok: bool,
        types: &[ValueType],
    ) -> bool {
        let mut all = true;
        for ty in types {
            all &= self.push_value(ctx, offset, if ok { Some(*ty) } else { None });
        }
        all && ok
    }

    // Pops one value, or Err(()) on underflow (not yet reported). Popping
    // beneath an unreachable frame's floor yields bottom.
    fn pop_raw(&mut self) -> Result<Option<ValueType>, ()> {
        let Some(frame) = self.labels.last() else {
            return Err(());
        };
        if self.values.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(());
        }
        Ok(self.values.pop().unwrap_or(None))
    }

    fn pop_any(&mut self, ctx: &mut Context, offset: usize) -> (Option<ValueType>, bool) {
        match self.pop_raw() {
            Ok(value) => (value, true),
            Err(()) => {
                ctx.report(offset, ErrorKind::StackUnderflow);
                (None, false)
            }
        }
    }

    fn pop_expect(&mut self, ctx: &mut Context, offset: usize, expected: ValueType) -> bool {
        match self.pop_raw() {
            Err(()) => {
                ctx.report(
                    offset,
                    ErrorKind::TypeMismatch {
                        expected: expected.to_string(),
                        actual: "nothing".to_string(),
                    },
                );
                false
            }
            Ok(actual) => {
                if !assignable(actual, expected, &ctx.features) {
                    ctx.report(
                        offset,
                        ErrorKind::TypeMismatch {
                            expected: expected.to_string(),
                            actual: type_name(actual),
                        },
                    );
                    return false;
                }
                true
            }
        }
    }

    // Pops `types` (given bottom-to-top) from the top down.
    fn pop_expects(&mut self, ctx: &mut Context, offset: usize, types: &[ValueType]) -> bool {
        let mut ok = true;
        for expected in types.iter().rev() {
            ok &= self.pop_expect(ctx, offset, *expected);
        }
        ok
    }

    fn push_label(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        kind: LabelKind,
        params: Vec<ValueType>,
        results: Vec<ValueType>,
    ) -> bool {
        if self.labels.len() >= ctx.max_stack_height {
            ctx.report(offset, ErrorKind::InternalLimitExceeded("control stack depth"));
            self.gave_up = true;
            return false;
        }
        // The frame's floor excludes its entry values, which the body
        // consumes.
        let height = self.values.len();
        let ok = self.push_values(ctx, offset, &params);
        self.labels.push(Label {
            kind,
            params,
            results,
            height,
            unreachable: false,
        });
        ok
    }

    // Pops the top frame after checking its results are on the stack.
    // Pushes nothing back; callers decide what the outer frame receives.
    fn pop_frame(&mut self, ctx: &mut Context, offset: usize) -> (Option<Label>, bool) {
        let Some(frame) = self.labels.last() else {
            ctx.report(offset, ErrorKind::UnalignedLabel("end without an open block"));
            return (None, false);
        };
        let results = frame.results.clone();
        let height = frame.height;
        let mut ok = self.pop_expects(ctx, offset, &results);
        if self.values.len() != height {
            ctx.report(offset, ErrorKind::UnreachableMismatch);
            self.values.truncate(height);
            ok = false;
        }
        (self.labels.pop(), ok)
    }

    fn set_unreachable(&mut self) {
        if let Some(frame) = self.labels.last_mut() {
            self.values.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    // The types carried by a branch to the label `depth` frames up.
    fn branch_types(&mut self, ctx: &mut Context, depth: At<u32>) -> Option<Vec<ValueType>> {
        let count = self.labels.len();
        if *depth as usize >= count {
            ctx.report(
                depth.offset(),
                ErrorKind::IndexOutOfRange {
                    desc: "label depth",
                    index: *depth,
                    max: count as u32,
                },
            );
            return None;
        }
        Some(self.labels[count - 1 - *depth as usize].label_types().to_vec())
    }

    fn resolve_block_type(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        block_type: BlockType,
    ) -> Option<(Vec<ValueType>, Vec<ValueType>)> {
        match block_type {
            BlockType::Empty => Some((Vec::new(), Vec::new())),
            BlockType::Result(ty) => Some((Vec::new(), vec![ty])),
            BlockType::TypeIndex(index) => {
                if !ctx.check_index(offset, index, ctx.types.len(), "block type index") {
                    return None;
                }
                let ty = &ctx.types[index as usize];
                Some((ty.params.clone(), ty.results.clone()))
            }
        }
    }

    fn check_memory(&mut self, ctx: &mut Context, offset: usize) -> bool {
        if ctx.memories.is_empty() {
            ctx.report(
                offset,
                ErrorKind::IndexOutOfRange {
                    desc: "memory index",
                    index: 0,
                    max: 0,
                },
            );
            return false;
        }
        true
    }

    fn check_align(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        memarg: &MemArg,
        natural: u32,
        exact: bool,
    ) -> bool {
        let bad = if exact {
            memarg.align != natural
        } else {
            memarg.align > natural
        };
        if bad {
            ctx.report(offset, ErrorKind::InvalidImmediate("alignment"));
            return false;
        }
        true
    }

    fn check_lane(&mut self, ctx: &mut Context, offset: usize, lane: u8, count: u8) -> bool {
        if lane >= count {
            ctx.report(offset, ErrorKind::InvalidImmediate("lane index"));
            return false;
        }
        true
    }

    // Typing-rule helpers.

    fn unary(&mut self, ctx: &mut Context, offset: usize, ty: ValueType) -> bool {
        let ok = self.pop_expect(ctx, offset, ty);
        self.push_outputs(ctx, offset, ok, &[ty])
    }

    fn binary(&mut self, ctx: &mut Context, offset: usize, ty: ValueType) -> bool {
        let a = self.pop_expect(ctx, offset, ty);
        let b = self.pop_expect(ctx, offset, ty);
        self.push_outputs(ctx, offset, a && b, &[ty])
    }

    fn test(&mut self, ctx: &mut Context, offset: usize, ty: ValueType) -> bool {
        let ok = self.pop_expect(ctx, offset, ty);
        self.push_outputs(ctx, offset, ok, &[ValueType::I32])
    }

    fn compare(&mut self, ctx: &mut Context, offset: usize, ty: ValueType) -> bool {
        let a = self.pop_expect(ctx, offset, ty);
        let b = self.pop_expect(ctx, offset, ty);
        self.push_outputs(ctx, offset, a && b, &[ValueType::I32])
    }

    fn convert(&mut self, ctx: &mut Context, offset: usize, from: ValueType, to: ValueType) -> bool {
        let ok = self.pop_expect(ctx, offset, from);
        self.push_outputs(ctx, offset, ok, &[to])
    }

    fn load(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        memarg: &MemArg,
        ty: ValueType,
        natural: u32,
    ) -> bool {
        let mut ok = self.check_memory(ctx, offset);
        ok &= self.check_align(ctx, offset, memarg, natural, false);
        ok &= self.pop_expect(ctx, offset, ValueType::I32);
        self.push_outputs(ctx, offset, ok, &[ty])
    }

    fn store(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        memarg: &MemArg,
        ty: ValueType,
        natural: u32,
    ) -> bool {
        let mut ok = self.check_memory(ctx, offset);
        ok &= self.check_align(ctx, offset, memarg, natural, false);
        ok &= self.pop_expect(ctx, offset, ty);
        ok & self.pop_expect(ctx, offset, ValueType::I32)
    }

    /// Feeds one instruction through its typing rule, reporting every
    /// failure and leaving the stacks in a best-effort state.
    pub(crate) fn instruction(&mut self, ctx: &mut Context, instruction: &At<Instruction>) -> bool {
        if self.gave_up {
            return false;
        }
        let offset = instruction.offset();
        let Instruction { op, immediate } = &**instruction;
        match *op {
            Op::Basic(op) => self.basic(ctx, offset, op, immediate),
            Op::Misc(op) => self.misc(ctx, offset, op, immediate),
            Op::Simd(op) => self.simd(ctx, offset, op, immediate),
            Op::Thread(op) => self.thread(ctx, offset, op, immediate),
        }
    }

    /// Final bookkeeping once the instruction stream completes.
    pub(crate) fn finish(&mut self, ctx: &mut Context, offset: usize) -> bool {
        if self.gave_up {
            return false;
        }
        if !self.finished {
            ctx.report(offset, ErrorKind::UnalignedLabel("missing end"));
            return false;
        }
        true
    }

    fn end_frame(&mut self, ctx: &mut Context, offset: usize) -> bool {
        let (frame, mut ok) = self.pop_frame(ctx, offset);
        let Some(frame) = frame else {
            return false;
        };
        // An if with no else runs its implicit else, which produces the
        // parameters unchanged.
        if frame.kind == LabelKind::If && frame.params != frame.results {
            ctx.report(
                offset,
                ErrorKind::TypeMismatch {
                    expected: types_string(&frame.results),
                    actual: types_string(&frame.params),
                },
            );
            ok = false;
        }
        if self.labels.is_empty() {
            self.finished = true;
        } else {
            ok &= self.push_values(ctx, offset, &frame.results);
        }
        ok
    }

    fn switch_frame(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        from: LabelKind,
        to: LabelKind,
        error: &'static str,
    ) -> bool {
        match self.labels.last() {
            Some(frame) if frame.kind == from && self.labels.len() > 1 => {}
            _ => {
                ctx.report(offset, ErrorKind::UnalignedLabel(error));
                return false;
            }
        }
        let (frame, ok) = self.pop_frame(ctx, offset);
        let Some(frame) = frame else {
            return false;
        };
        ok & self.push_label(ctx, offset, to, frame.params, frame.results)
    }

    fn basic(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        op: Opcode,
        immediate: &Immediate,
    ) -> bool {
        use Opcode as O;
        use ValueType::{F32, F64, I32, I64};
        match op {
            O::Unreachable => {
                self.set_unreachable();
                true
            }
            O::Nop => true,

            O::Block | O::Loop | O::If | O::Try => {
                let Immediate::Block(block_type) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let Some((params, results)) = self.resolve_block_type(ctx, offset, *block_type)
                else {
                    return false;
                };
                let mut ok = true;
                if op == O::If {
                    ok &= self.pop_expect(ctx, offset, I32);
                }
                ok &= self.pop_expects(ctx, offset, &params);
                let kind = match op {
                    O::Block => LabelKind::Block,
                    O::Loop => LabelKind::Loop,
                    O::If => LabelKind::If,
                    _ => LabelKind::Try,
                };
                ok & self.push_label(ctx, offset, kind, params, results)
            }
            O::Else => self.switch_frame(
                ctx,
                offset,
                LabelKind::If,
                LabelKind::Else,
                "else without a matching if",
            ),
            O::Catch => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                match self.labels.last() {
                    Some(frame)
                        if matches!(frame.kind, LabelKind::Try | LabelKind::Catch)
                            && self.labels.len() > 1 => {}
                    _ => {
                        ctx.report(
                            offset,
                            ErrorKind::UnalignedLabel("catch without a matching try"),
                        );
                        return false;
                    }
                }
                if !ctx.check_index(index.offset(), **index, ctx.events.len(), "event index") {
                    return false;
                }
                let event = ctx.events[**index as usize];
                let params = ctx
                    .function_type(event.type_index)
                    .map(|ty| ty.params.clone())
                    .unwrap_or_default();
                let (frame, ok) = self.pop_frame(ctx, offset);
                let Some(frame) = frame else {
                    return false;
                };
                // The catch body starts with the exception's payload.
                ok & self.push_label(ctx, offset, LabelKind::Catch, params, frame.results)
            }
            O::End => self.end_frame(ctx, offset),

            O::Br => {
                let Immediate::Index(depth) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let Some(types) = self.branch_types(ctx, *depth) else {
                    return false;
                };
                let ok = self.pop_expects(ctx, offset, &types);
                self.set_unreachable();
                ok
            }
            O::BrIf => {
                let Immediate::Index(depth) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let mut ok = self.pop_expect(ctx, offset, I32);
                let Some(types) = self.branch_types(ctx, *depth) else {
                    return false;
                };
                ok &= self.pop_expects(ctx, offset, &types);
                ok & self.push_values(ctx, offset, &types)
            }
            O::BrTable => {
                let Immediate::BrTable(imm) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let mut ok = self.pop_expect(ctx, offset, I32);
                let Some(default_types) = self.branch_types(ctx, imm.default_target) else {
                    self.set_unreachable();
                    return false;
                };

                // Pop the default target's types into a buffer, then check
                // the buffer against every other target. Bottom matches
                // anything, so unreachable code can take any shape here.
                let mut popped = Vec::with_capacity(default_types.len());
                for expected in default_types.iter().rev() {
                    match self.pop_raw() {
                        Err(()) => {
                            ctx.report(
                                offset,
                                ErrorKind::TypeMismatch {
                                    expected: expected.to_string(),
                                    actual: "nothing".to_string(),
                                },
                            );
                            ok = false;
                            popped.push(None);
                        }
                        Ok(actual) => {
                            if !assignable(actual, *expected, &ctx.features) {
                                ctx.report(
                                    offset,
                                    ErrorKind::TypeMismatch {
                                        expected: expected.to_string(),
                                        actual: type_name(actual),
                                    },
                                );
                                ok = false;
                            }
                            popped.push(actual);
                        }
                    }
                }

                for target in &imm.targets {
                    let count = self.labels.len();
                    if *(*target) as usize >= count {
                        ctx.report(
                            target.offset(),
                            ErrorKind::IndexOutOfRange {
                                desc: "label depth",
                                index: **target,
                                max: count as u32,
                            },
                        );
                        ok = false;
                        continue;
                    }
                    let types = self.labels[count - 1 - **target as usize].label_types();
                    if types.len() != default_types.len() {
                        ctx.report(
                            target.offset(),
                            ErrorKind::UnalignedLabel("br_table targets disagree on arity"),
                        );
                        ok = false;
                        continue;
                    }
                    for (actual, expected) in popped.iter().zip(types.iter().rev()) {
                        if !assignable(*actual, *expected, &ctx.features) {
                            ctx.report(
                                target.offset(),
                                ErrorKind::TypeMismatch {
                                    expected: expected.to_string(),
                                    actual: type_name(*actual),
                                },
                            );
                            ok = false;
                        }
                    }
                }
                self.set_unreachable();
                ok
            }
            O::Return => {
                let Some(frame) = self.labels.first() else {
                    return false;
                };
                let types = frame.results.clone();
                let ok = self.pop_expects(ctx, offset, &types);
                self.set_unreachable();
                ok
            }

            O::Call | O::ReturnCall => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                if !ctx.check_index(index.offset(), **index, ctx.functions.len(), "function index")
                {
                    return false;
                }
                let Some(signature) = ctx.function_signature(**index) else {
                    // The function's type index was invalid; reported at
                    // the function section.
                    return false;
                };
                let (params, results) = (signature.params.clone(), signature.results.clone());
                let mut ok = self.pop_expects(ctx, offset, &params);
                if op == O::ReturnCall {
                    ok &= self.check_tail_results(ctx, offset, &results);
                    self.set_unreachable();
                    ok
                } else {
                    self.push_outputs(ctx, offset, ok, &results)
                }
            }
            O::CallIndirect | O::ReturnCallIndirect => {
                let Immediate::CallIndirect(imm) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let mut ok =
                    ctx.check_index(offset, imm.table_index, ctx.tables.len(), "table index");
                if ok {
                    let table = ctx.tables[imm.table_index as usize];
                    if table.elemtype != ReferenceType::Funcref {
                        ctx.report(
                            offset,
                            ErrorKind::TypeMismatch {
                                expected: "a funcref table".to_string(),
                                actual: ValueType::from(table.elemtype).to_string(),
                            },
                        );
                        ok = false;
                    }
                }
                if !ctx.check_index(
                    imm.type_index.offset(),
                    *imm.type_index,
                    ctx.types.len(),
                    "type index",
                ) {
                    return false;
                }
                let ty = ctx.types[*imm.type_index as usize].clone();
                ok &= self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expects(ctx, offset, &ty.params);
                if op == O::ReturnCallIndirect {
                    ok &= self.check_tail_results(ctx, offset, &ty.results);
                    self.set_unreachable();
                    ok
                } else {
                    self.push_outputs(ctx, offset, ok, &ty.results)
                }
            }
            O::Throw => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                if !ctx.check_index(index.offset(), **index, ctx.events.len(), "event index") {
                    return false;
                }
                let event = ctx.events[**index as usize];
                let params = ctx
                    .function_type(event.type_index)
                    .map(|ty| ty.params.clone())
                    .unwrap_or_default();
                let ok = self.pop_expects(ctx, offset, &params);
                self.set_unreachable();
                ok
            }
            O::Rethrow => {
                let Immediate::Index(depth) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let count = self.labels.len();
                if **depth as usize >= count {
                    ctx.report(
                        depth.offset(),
                        ErrorKind::IndexOutOfRange {
                            desc: "label depth",
                            index: **depth,
                            max: count as u32,
                        },
                    );
                    return false;
                }
                // Not a jump, but the target must be a catch block whose
                // exception is being re-raised.
                if self.labels[count - 1 - **depth as usize].kind != LabelKind::Catch {
                    ctx.report(
                        offset,
                        ErrorKind::UnalignedLabel("rethrow target is not a catch block"),
                    );
                    return false;
                }
                self.set_unreachable();
                true
            }

            O::Drop => self.pop_any(ctx, offset).1,
            O::Select => {
                let mut ok = self.pop_expect(ctx, offset, I32);
                let (first, ok1) = self.pop_any(ctx, offset);
                let (second, ok2) = self.pop_any(ctx, offset);
                ok &= ok1 && ok2;
                let merged = match (first, second) {
                    (None, None) => None,
                    (Some(ty), None) | (None, Some(ty)) => Some(ty),
                    (Some(a), Some(b)) => {
                        if a != b {
                            ctx.report(
                                offset,
                                ErrorKind::TypeMismatch {
                                    expected: a.to_string(),
                                    actual: b.to_string(),
                                },
                            );
                            ok = false;
                            None
                        } else {
                            Some(a)
                        }
                    }
                };
                if let Some(ty) = merged {
                    // Untyped select cannot pick references.
                    if ty.is_reference() {
                        ctx.report(
                            offset,
                            ErrorKind::TypeMismatch {
                                expected: "a numeric type".to_string(),
                                actual: ty.to_string(),
                            },
                        );
                        ok = false;
                    }
                }
                self.push_value(ctx, offset, if ok { merged } else { None });
                ok
            }
            O::SelectT => {
                let Immediate::Select(types) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                if types.len() != 1 {
                    ctx.report(offset, ErrorKind::InvalidImmediate("select type count"));
                    return false;
                }
                let ty = types[0];
                let mut ok = self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, ty);
                ok &= self.pop_expect(ctx, offset, ty);
                self.push_outputs(ctx, offset, ok, &[ty])
            }

            O::LocalGet | O::LocalSet | O::LocalTee => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let count = self.locals.len();
                if !ctx.check_index(index.offset(), **index, count, "local index") {
                    return false;
                }
                let ty = self.locals[**index as usize];
                match op {
                    O::LocalGet => self.push_value(ctx, offset, Some(ty)),
                    O::LocalSet => self.pop_expect(ctx, offset, ty),
                    _ => {
                        let ok = self.pop_expect(ctx, offset, ty);
                        self.push_outputs(ctx, offset, ok, &[ty])
                    }
                }
            }
            O::GlobalGet | O::GlobalSet => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                if !ctx.check_index(index.offset(), **index, ctx.globals.len(), "global index") {
                    return false;
                }
                let global = ctx.globals[**index as usize];
                if op == O::GlobalGet {
                    self.push_value(ctx, offset, Some(global.valtype))
                } else {
                    let mut ok = true;
                    if global.mutability == crate::types::Mutability::Const {
                        ctx.report(
                            index.offset(),
                            ErrorKind::TypeMismatch {
                                expected: "a mutable global".to_string(),
                                actual: "an immutable global".to_string(),
                            },
                        );
                        ok = false;
                    }
                    ok & self.pop_expect(ctx, offset, global.valtype)
                }
            }

            O::TableGet | O::TableSet => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                if !ctx.check_index(index.offset(), **index, ctx.tables.len(), "table index") {
                    return false;
                }
                let elemtype = ValueType::from(ctx.tables[**index as usize].elemtype);
                if op == O::TableGet {
                    let ok = self.pop_expect(ctx, offset, I32);
                    self.push_outputs(ctx, offset, ok, &[elemtype])
                } else {
                    let ok = self.pop_expect(ctx, offset, elemtype);
                    ok & self.pop_expect(ctx, offset, I32)
                }
            }

            O::RefNull => {
                let Immediate::RefType(reftype) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                self.push_value(ctx, offset, Some(ValueType::from(*reftype)))
            }
            O::RefIsNull => {
                let (actual, mut ok) = self.pop_any(ctx, offset);
                if let Some(ty) = actual {
                    if !ty.is_reference() {
                        ctx.report(
                            offset,
                            ErrorKind::TypeMismatch {
                                expected: "a reference type".to_string(),
                                actual: ty.to_string(),
                            },
                        );
                        ok = false;
                    }
                }
                self.push_outputs(ctx, offset, ok, &[I32])
            }
            O::RefFunc => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let mut ok =
                    ctx.check_index(index.offset(), **index, ctx.functions.len(), "function index");
                if ok && !ctx.declared_functions.contains(&**index) {
                    ctx.report(index.offset(), ErrorKind::UndeclaredFunctionRef(**index));
                    ok = false;
                }
                self.push_value(ctx, offset, Some(ValueType::Funcref)) && ok
            }

            O::MemorySize => {
                let ok = self.check_memory(ctx, offset);
                self.push_outputs(ctx, offset, ok, &[I32])
            }
            O::MemoryGrow => {
                let mut ok = self.check_memory(ctx, offset);
                ok &= self.pop_expect(ctx, offset, I32);
                self.push_outputs(ctx, offset, ok, &[I32])
            }

            O::I32Load => self.mem_access(ctx, offset, immediate, I32, 2, true),
            O::I64Load => self.mem_access(ctx, offset, immediate, I64, 3, true),
            O::F32Load => self.mem_access(ctx, offset, immediate, F32, 2, true),
            O::F64Load => self.mem_access(ctx, offset, immediate, F64, 3, true),
            O::I32Load8S | O::I32Load8U => self.mem_access(ctx, offset, immediate, I32, 0, true),
            O::I32Load16S | O::I32Load16U => self.mem_access(ctx, offset, immediate, I32, 1, true),
            O::I64Load8S | O::I64Load8U => self.mem_access(ctx, offset, immediate, I64, 0, true),
            O::I64Load16S | O::I64Load16U => self.mem_access(ctx, offset, immediate, I64, 1, true),
            O::I64Load32S | O::I64Load32U => self.mem_access(ctx, offset, immediate, I64, 2, true),
            O::I32Store => self.mem_access(ctx, offset, immediate, I32, 2, false),
            O::I64Store => self.mem_access(ctx, offset, immediate, I64, 3, false),
            O::F32Store => self.mem_access(ctx, offset, immediate, F32, 2, false),
            O::F64Store => self.mem_access(ctx, offset, immediate, F64, 3, false),
            O::I32Store8 => self.mem_access(ctx, offset, immediate, I32, 0, false),
            O::I32Store16 => self.mem_access(ctx, offset, immediate, I32, 1, false),
            O::I64Store8 => self.mem_access(ctx, offset, immediate, I64, 0, false),
            O::I64Store16 => self.mem_access(ctx, offset, immediate, I64, 1, false),
            O::I64Store32 => self.mem_access(ctx, offset, immediate, I64, 2, false),

            O::I32Const => self.push_value(ctx, offset, Some(I32)),
            O::I64Const => self.push_value(ctx, offset, Some(I64)),
            O::F32Const => self.push_value(ctx, offset, Some(F32)),
            O::F64Const => self.push_value(ctx, offset, Some(F64)),

            O::I32Eqz => self.test(ctx, offset, I32),
            O::I64Eqz => self.test(ctx, offset, I64),
            O::I32Eq
            | O::I32Ne
            | O::I32LtS
            | O::I32LtU
            | O::I32GtS
            | O::I32GtU
            | O::I32LeS
            | O::I32LeU
            | O::I32GeS
            | O::I32GeU => self.compare(ctx, offset, I32),
            O::I64Eq
            | O::I64Ne
            | O::I64LtS
            | O::I64LtU
            | O::I64GtS
            | O::I64GtU
            | O::I64LeS
            | O::I64LeU
            | O::I64GeS
            | O::I64GeU => self.compare(ctx, offset, I64),
            O::F32Eq | O::F32Ne | O::F32Lt | O::F32Gt | O::F32Le | O::F32Ge => {
                self.compare(ctx, offset, F32)
            }
            O::F64Eq | O::F64Ne | O::F64Lt | O::F64Gt | O::F64Le | O::F64Ge => {
                self.compare(ctx, offset, F64)
            }

            O::I32Clz | O::I32Ctz | O::I32Popcnt | O::I32Extend8S | O::I32Extend16S => {
                self.unary(ctx, offset, I32)
            }
            O::I64Clz
            | O::I64Ctz
            | O::I64Popcnt
            | O::I64Extend8S
            | O::I64Extend16S
            | O::I64Extend32S => self.unary(ctx, offset, I64),
            O::I32Add
            | O::I32Sub
            | O::I32Mul
            | O::I32DivS
            | O::I32DivU
            | O::I32RemS
            | O::I32RemU
            | O::I32And
            | O::I32Or
            | O::I32Xor
            | O::I32Shl
            | O::I32ShrS
            | O::I32ShrU
            | O::I32Rotl
            | O::I32Rotr => self.binary(ctx, offset, I32),
            O::I64Add
            | O::I64Sub
            | O::I64Mul
            | O::I64DivS
            | O::I64DivU
            | O::I64RemS
            | O::I64RemU
            | O::I64And
            | O::I64Or
            | O::I64Xor
            | O::I64Shl
            | O::I64ShrS
            | O::I64ShrU
            | O::I64Rotl
            | O::I64Rotr => self.binary(ctx, offset, I64),
            O::F32Abs
            | O::F32Neg
            | O::F32Ceil
            | O::F32Floor
            | O::F32Trunc
            | O::F32Nearest
            | O::F32Sqrt => self.unary(ctx, offset, F32),
            O::F32Add | O::F32Sub | O::F32Mul | O::F32Div | O::F32Min | O::F32Max
            | O::F32Copysign => self.binary(ctx, offset, F32),
            O::F64Abs
            | O::F64Neg
            | O::F64Ceil
            | O::F64Floor
            | O::F64Trunc
            | O::F64Nearest
            | O::F64Sqrt => self.unary(ctx, offset, F64),
            O::F64Add | O::F64Sub | O::F64Mul | O::F64Div | O::F64Min | O::F64Max
            | O::F64Copysign => self.binary(ctx, offset, F64),

            O::I32WrapI64 => self.convert(ctx, offset, I64, I32),
            O::I32TruncF32S | O::I32TruncF32U | O::I32ReinterpretF32 => {
                self.convert(ctx, offset, F32, I32)
            }
            O::I32TruncF64S | O::I32TruncF64U => self.convert(ctx, offset, F64, I32),
            O::I64ExtendI32S | O::I64ExtendI32U => self.convert(ctx, offset, I32, I64),
            O::I64TruncF32S | O::I64TruncF32U => self.convert(ctx, offset, F32, I64),
            O::I64TruncF64S | O::I64TruncF64U | O::I64ReinterpretF64 => {
                self.convert(ctx, offset, F64, I64)
            }
            O::F32ConvertI32S | O::F32ConvertI32U | O::F32ReinterpretI32 => {
                self.convert(ctx, offset, I32, F32)
            }
            O::F32ConvertI64S | O::F32ConvertI64U => self.convert(ctx, offset, I64, F32),
            O::F32DemoteF64 => self.convert(ctx, offset, F64, F32),
            O::F64ConvertI32S | O::F64ConvertI32U => self.convert(ctx, offset, I32, F64),
            O::F64ConvertI64S | O::F64ConvertI64U | O::F64ReinterpretI64 => {
                self.convert(ctx, offset, I64, F64)
            }
            O::F64PromoteF32 => self.convert(ctx, offset, F32, F64),

            // Prefixes are resolved before dispatch.
            O::MiscPrefix | O::SimdPrefix | O::ThreadPrefix => self.bad_immediate(ctx, offset),
        }
    }

    fn mem_access(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        immediate: &Immediate,
        ty: ValueType,
        natural: u32,
        is_load: bool,
    ) -> bool {
        let Immediate::MemArg(memarg) = immediate else {
            return self.bad_immediate(ctx, offset);
        };
        if is_load {
            self.load(ctx, offset, memarg, ty, natural)
        } else {
            self.store(ctx, offset, memarg, ty, natural)
        }
    }

    // A tail call's callee must produce exactly what the caller does.
    fn check_tail_results(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        results: &[ValueType],
    ) -> bool {
        let caller: &[ValueType] = self.labels.first().map(|f| &f.results[..]).unwrap_or(&[]);
        if caller != results {
            let (expected, actual) = (types_string(caller), types_string(results));
            ctx.report(offset, ErrorKind::TypeMismatch { expected, actual });
            return false;
        }
        true
    }

    fn misc(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        op: MiscOpcode,
        immediate: &Immediate,
    ) -> bool {
        use MiscOpcode as M;
        use ValueType::{F32, F64, I32, I64};
        match op {
            M::I32TruncSatF32S | M::I32TruncSatF32U => self.convert(ctx, offset, F32, I32),
            M::I32TruncSatF64S | M::I32TruncSatF64U => self.convert(ctx, offset, F64, I32),
            M::I64TruncSatF32S | M::I64TruncSatF32U => self.convert(ctx, offset, F32, I64),
            M::I64TruncSatF64S | M::I64TruncSatF64U => self.convert(ctx, offset, F64, I64),

            M::MemoryInit => {
                let Immediate::Init(imm) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                // A data segment index means nothing without a data count.
                let max = ctx.declared_data_count.unwrap_or(0) as usize;
                let mut ok = ctx.check_index(
                    imm.segment_index.offset(),
                    *imm.segment_index,
                    max,
                    "data segment index",
                );
                ok &= ctx.check_index(
                    imm.dst_index.offset(),
                    *imm.dst_index,
                    ctx.memories.len(),
                    "memory index",
                );
                ok &= self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, I32);
                ok & self.pop_expect(ctx, offset, I32)
            }
            M::DataDrop => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let max = ctx.declared_data_count.unwrap_or(0) as usize;
                ctx.check_index(index.offset(), **index, max, "data segment index")
            }
            M::MemoryCopy => {
                let Immediate::Copy(imm) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let mut ok = ctx.check_index(
                    imm.dst_index.offset(),
                    *imm.dst_index,
                    ctx.memories.len(),
                    "memory index",
                );
                ok &= ctx.check_index(
                    imm.src_index.offset(),
                    *imm.src_index,
                    ctx.memories.len(),
                    "memory index",
                );
                ok &= self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, I32);
                ok & self.pop_expect(ctx, offset, I32)
            }
            M::MemoryFill => {
                let Immediate::Byte(memory) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let mut ok = ctx.check_index(
                    offset,
                    u32::from(*memory),
                    ctx.memories.len(),
                    "memory index",
                );
                ok &= self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, I32);
                ok & self.pop_expect(ctx, offset, I32)
            }

            M::TableInit => {
                let Immediate::Init(imm) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let table_ok = ctx.check_index(
                    imm.dst_index.offset(),
                    *imm.dst_index,
                    ctx.tables.len(),
                    "table index",
                );
                let elem_ok = ctx.check_index(
                    imm.segment_index.offset(),
                    *imm.segment_index,
                    ctx.element_segments.len(),
                    "element segment index",
                );
                let mut ok = table_ok && elem_ok;
                if ok {
                    let elemtype = ctx.element_segments[*imm.segment_index as usize];
                    let table = ctx.tables[*imm.dst_index as usize];
                    if !ref_assignable(elemtype, table.elemtype, &ctx.features) {
                        ctx.report(
                            offset,
                            ErrorKind::TypeMismatch {
                                expected: ValueType::from(table.elemtype).to_string(),
                                actual: ValueType::from(elemtype).to_string(),
                            },
                        );
                        ok = false;
                    }
                }
                ok &= self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, I32);
                ok & self.pop_expect(ctx, offset, I32)
            }
            M::ElemDrop => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                ctx.check_index(
                    index.offset(),
                    **index,
                    ctx.element_segments.len(),
                    "element segment index",
                )
            }
            M::TableCopy => {
                let Immediate::Copy(imm) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let dst_ok = ctx.check_index(
                    imm.dst_index.offset(),
                    *imm.dst_index,
                    ctx.tables.len(),
                    "table index",
                );
                let src_ok = ctx.check_index(
                    imm.src_index.offset(),
                    *imm.src_index,
                    ctx.tables.len(),
                    "table index",
                );
                let mut ok = dst_ok && src_ok;
                if ok {
                    let dst = ctx.tables[*imm.dst_index as usize];
                    let src = ctx.tables[*imm.src_index as usize];
                    if !ref_assignable(src.elemtype, dst.elemtype, &ctx.features) {
                        ctx.report(
                            offset,
                            ErrorKind::TypeMismatch {
                                expected: ValueType::from(dst.elemtype).to_string(),
                                actual: ValueType::from(src.elemtype).to_string(),
                            },
                        );
                        ok = false;
                    }
                }
                ok &= self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, I32);
                ok & self.pop_expect(ctx, offset, I32)
            }
            M::TableGrow | M::TableSize | M::TableFill => {
                let Immediate::Index(index) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                if !ctx.check_index(index.offset(), **index, ctx.tables.len(), "table index") {
                    return false;
                }
                let elemtype = ValueType::from(ctx.tables[**index as usize].elemtype);
                match op {
                    M::TableGrow => {
                        let mut ok = self.pop_expect(ctx, offset, I32);
                        ok &= self.pop_expect(ctx, offset, elemtype);
                        self.push_outputs(ctx, offset, ok, &[I32])
                    }
                    M::TableSize => self.push_value(ctx, offset, Some(I32)),
                    _ => {
                        let mut ok = self.pop_expect(ctx, offset, I32);
                        ok &= self.pop_expect(ctx, offset, elemtype);
                        ok & self.pop_expect(ctx, offset, I32)
                    }
                }
            }
        }
    }

    fn simd(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        op: SimdOpcode,
        immediate: &Immediate,
    ) -> bool {
        use SimdOpcode as S;
        use ValueType::{F32, F64, I32, I64, V128};
        match op {
            S::V128Load => self.mem_access(ctx, offset, immediate, V128, 4, true),
            S::V128Load8x8S
            | S::V128Load8x8U
            | S::V128Load16x4S
            | S::V128Load16x4U
            | S::V128Load32x2S
            | S::V128Load32x2U => self.mem_access(ctx, offset, immediate, V128, 3, true),
            S::V128Load8Splat => self.mem_access(ctx, offset, immediate, V128, 0, true),
            S::V128Load16Splat => self.mem_access(ctx, offset, immediate, V128, 1, true),
            S::V128Load32Splat | S::V128Load32Zero => {
                self.mem_access(ctx, offset, immediate, V128, 2, true)
            }
            S::V128Load64Splat | S::V128Load64Zero => {
                self.mem_access(ctx, offset, immediate, V128, 3, true)
            }
            S::V128Store => self.mem_access(ctx, offset, immediate, V128, 4, false),

            S::V128Load8Lane
            | S::V128Load16Lane
            | S::V128Load32Lane
            | S::V128Load64Lane
            | S::V128Store8Lane
            | S::V128Store16Lane
            | S::V128Store32Lane
            | S::V128Store64Lane => {
                let Immediate::MemArgLane { memarg, lane } = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let (natural, lanes) = match op {
                    S::V128Load8Lane | S::V128Store8Lane => (0, 16),
                    S::V128Load16Lane | S::V128Store16Lane => (1, 8),
                    S::V128Load32Lane | S::V128Store32Lane => (2, 4),
                    _ => (3, 2),
                };
                let mut ok = self.check_memory(ctx, offset);
                ok &= self.check_align(ctx, offset, memarg, natural, false);
                ok &= self.check_lane(ctx, offset, *lane, lanes);
                ok &= self.pop_expect(ctx, offset, V128);
                ok &= self.pop_expect(ctx, offset, I32);
                let is_load = matches!(
                    op,
                    S::V128Load8Lane | S::V128Load16Lane | S::V128Load32Lane | S::V128Load64Lane
                );
                if is_load {
                    self.push_outputs(ctx, offset, ok, &[V128])
                } else {
                    ok
                }
            }

            S::V128Const => self.push_value(ctx, offset, Some(V128)),

            S::I8x16Shuffle => {
                let Immediate::Shuffle(lanes) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let mut ok = true;
                for lane in lanes {
                    // Each selector indexes the 32 lanes of the two
                    // operands.
                    ok &= self.check_lane(ctx, offset, *lane, 32);
                }
                let a = self.pop_expect(ctx, offset, V128);
                let b = self.pop_expect(ctx, offset, V128);
                self.push_outputs(ctx, offset, ok && a && b, &[V128])
            }

            S::I8x16Splat | S::I16x8Splat | S::I32x4Splat => self.convert(ctx, offset, I32, V128),
            S::I64x2Splat => self.convert(ctx, offset, I64, V128),
            S::F32x4Splat => self.convert(ctx, offset, F32, V128),
            S::F64x2Splat => self.convert(ctx, offset, F64, V128),

            S::I8x16ExtractLaneS
            | S::I8x16ExtractLaneU
            | S::I8x16ReplaceLane
            | S::I16x8ExtractLaneS
            | S::I16x8ExtractLaneU
            | S::I16x8ReplaceLane
            | S::I32x4ExtractLane
            | S::I32x4ReplaceLane
            | S::I64x2ExtractLane
            | S::I64x2ReplaceLane
            | S::F32x4ExtractLane
            | S::F32x4ReplaceLane
            | S::F64x2ExtractLane
            | S::F64x2ReplaceLane => {
                let Immediate::Lane(lane) = immediate else {
                    return self.bad_immediate(ctx, offset);
                };
                let (lanes, scalar) = match op {
                    S::I8x16ExtractLaneS | S::I8x16ExtractLaneU | S::I8x16ReplaceLane => (16, I32),
                    S::I16x8ExtractLaneS | S::I16x8ExtractLaneU | S::I16x8ReplaceLane => (8, I32),
                    S::I32x4ExtractLane | S::I32x4ReplaceLane => (4, I32),
                    S::I64x2ExtractLane | S::I64x2ReplaceLane => (2, I64),
                    S::F32x4ExtractLane | S::F32x4ReplaceLane => (4, F32),
                    _ => (2, F64),
                };
                let mut ok = self.check_lane(ctx, offset, *lane, lanes);
                let replace = matches!(
                    op,
                    S::I8x16ReplaceLane
                        | S::I16x8ReplaceLane
                        | S::I32x4ReplaceLane
                        | S::I64x2ReplaceLane
                        | S::F32x4ReplaceLane
                        | S::F64x2ReplaceLane
                );
                if replace {
                    ok &= self.pop_expect(ctx, offset, scalar);
                    ok &= self.pop_expect(ctx, offset, V128);
                    self.push_outputs(ctx, offset, ok, &[V128])
                } else {
                    ok &= self.pop_expect(ctx, offset, V128);
                    self.push_outputs(ctx, offset, ok, &[scalar])
                }
            }

            S::V128Bitselect => {
                let a = self.pop_expect(ctx, offset, V128);
                let b = self.pop_expect(ctx, offset, V128);
                let c = self.pop_expect(ctx, offset, V128);
                self.push_outputs(ctx, offset, a && b && c, &[V128])
            }

            S::V128AnyTrue
            | S::I8x16AllTrue
            | S::I8x16Bitmask
            | S::I16x8AllTrue
            | S::I16x8Bitmask
            | S::I32x4AllTrue
            | S::I32x4Bitmask
            | S::I64x2AllTrue
            | S::I64x2Bitmask => self.convert(ctx, offset, V128, I32),

            S::I8x16Shl
            | S::I8x16ShrS
            | S::I8x16ShrU
            | S::I16x8Shl
            | S::I16x8ShrS
            | S::I16x8ShrU
            | S::I32x4Shl
            | S::I32x4ShrS
            | S::I32x4ShrU
            | S::I64x2Shl
            | S::I64x2ShrS
            | S::I64x2ShrU => {
                let mut ok = self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, V128);
                self.push_outputs(ctx, offset, ok, &[V128])
            }

            S::V128Not
            | S::I8x16Abs
            | S::I8x16Neg
            | S::I8x16Popcnt
            | S::I16x8Abs
            | S::I16x8Neg
            | S::I16x8ExtaddPairwiseI8x16S
            | S::I16x8ExtaddPairwiseI8x16U
            | S::I16x8ExtendLowI8x16S
            | S::I16x8ExtendHighI8x16S
            | S::I16x8ExtendLowI8x16U
            | S::I16x8ExtendHighI8x16U
            | S::I32x4Abs
            | S::I32x4Neg
            | S::I32x4ExtaddPairwiseI16x8S
            | S::I32x4ExtaddPairwiseI16x8U
            | S::I32x4ExtendLowI16x8S
            | S::I32x4ExtendHighI16x8S
            | S::I32x4ExtendLowI16x8U
            | S::I32x4ExtendHighI16x8U
            | S::I64x2Abs
            | S::I64x2Neg
            | S::I64x2ExtendLowI32x4S
            | S::I64x2ExtendHighI32x4S
            | S::I64x2ExtendLowI32x4U
            | S::I64x2ExtendHighI32x4U
            | S::F32x4Abs
            | S::F32x4Neg
            | S::F32x4Sqrt
            | S::F32x4Ceil
            | S::F32x4Floor
            | S::F32x4Trunc
            | S::F32x4Nearest
            | S::F64x2Abs
            | S::F64x2Neg
            | S::F64x2Sqrt
            | S::F64x2Ceil
            | S::F64x2Floor
            | S::F64x2Trunc
            | S::F64x2Nearest
            | S::I32x4TruncSatF32x4S
            | S::I32x4TruncSatF32x4U
            | S::F32x4ConvertI32x4S
            | S::F32x4ConvertI32x4U
            | S::I32x4TruncSatF64x2SZero
            | S::I32x4TruncSatF64x2UZero
            | S::F64x2ConvertLowI32x4S
            | S::F64x2ConvertLowI32x4U
            | S::F32x4DemoteF64x2Zero
            | S::F64x2PromoteLowF32x4 => self.unary(ctx, offset, V128),

            // Everything else combines two vectors into one.
            _ => self.binary(ctx, offset, V128),
        }
    }

    fn thread(
        &mut self,
        ctx: &mut Context,
        offset: usize,
        op: ThreadOpcode,
        immediate: &Immediate,
    ) -> bool {
        use ThreadOpcode as T;
        use ValueType::{I32, I64};

        if op == T::AtomicFence {
            return true;
        }
        let Immediate::MemArg(memarg) = immediate else {
            return self.bad_immediate(ctx, offset);
        };
        let mut ok = self.check_memory(ctx, offset);

        match op {
            T::MemoryAtomicNotify => {
                ok &= self.check_align(ctx, offset, memarg, 2, true);
                ok &= self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, I32);
                self.push_outputs(ctx, offset, ok, &[I32])
            }
            T::MemoryAtomicWait32 => {
                ok &= self.check_align(ctx, offset, memarg, 2, true);
                ok &= self.pop_expect(ctx, offset, I64);
                ok &= self.pop_expect(ctx, offset, I32);
                ok &= self.pop_expect(ctx, offset, I32);
                self.push_outputs(ctx, offset, ok, &[I32])
            }
            T::MemoryAtomicWait64 => {
                ok &= self.check_align(ctx, offset, memarg, 3, true);
                ok &= self.pop_expect(ctx, offset, I64);
                ok &= self.pop_expect(ctx, offset, I64);
                ok &= self.pop_expect(ctx, offset, I32);
                self.push_outputs(ctx, offset, ok, &[I32])
            }

            T::I32AtomicLoad
            | T::I64AtomicLoad
            | T::I32AtomicLoad8U
            | T::I32AtomicLoad16U
            | T::I64AtomicLoad8U
            | T::I64AtomicLoad16U
            | T::I64AtomicLoad32U => {
                let (ty, natural) = atomic_memarg(op);
                ok &= self.check_align(ctx, offset, memarg, natural, true);
                ok &= self.pop_expect(ctx, offset, I32);
                self.push_outputs(ctx, offset, ok, &[ty])
            }

            T::I32AtomicStore
            | T::I64AtomicStore
            | T::I32AtomicStore8
            | T::I32AtomicStore16
            | T::I64AtomicStore8
            | T::I64AtomicStore16
            | T::I64AtomicStore32 => {
                let (ty, natural) = atomic_memarg(op);
                ok &= self.check_align(ctx, offset, memarg, natural, true);
                ok &= self.pop_expect(ctx, offset, ty);
                ok & self.pop_expect(ctx, offset, I32)
            }

            T::I32AtomicRmwCmpxchg
            | T::I64AtomicRmwCmpxchg
            | T::I32AtomicRmw8CmpxchgU
            | T::I32AtomicRmw16CmpxchgU
            | T::I64AtomicRmw8CmpxchgU
            | T::I64AtomicRmw16CmpxchgU
            | T::I64AtomicRmw32CmpxchgU => {
                let (ty, natural) = atomic_memarg(op);
                ok &= self.check_align(ctx, offset, memarg, natural, true);
                ok &= self.pop_expect(ctx, offset, ty);
                ok &= self.pop_expect(ctx, offset, ty);
                ok &= self.pop_expect(ctx, offset, I32);
                self.push_outputs(ctx, offset, ok, &[ty])
            }

            // The read-modify-write families.
            _ => {
                let (ty, natural) = atomic_memarg(op);
                ok &= self.check_align(ctx, offset, memarg, natural, true);
                ok &= self.pop_expect(ctx, offset, ty);
                ok &= self.pop_expect(ctx, offset, I32);
                self.push_outputs(ctx, offset, ok, &[ty])
            }
        }
    }
}

// Value type and required (exact) alignment of an atomic memory access.
fn atomic_memarg(op: ThreadOpcode) -> (ValueType, u32) {
    use ThreadOpcode as T;
    use ValueType::{I32, I64};
    match op {
        T::I32AtomicLoad8U
        | T::I32AtomicStore8
        | T::I32AtomicRmw8AddU
        | T::I32AtomicRmw8SubU
        | T::I32AtomicRmw8AndU
        | T::I32AtomicRmw8OrU
        | T::I32AtomicRmw8XorU
        | T::I32AtomicRmw8XchgU
        | T::I32AtomicRmw8CmpxchgU => (I32, 0),
        T::I32AtomicLoad16U
        | T::I32AtomicStore16
        | T::I32AtomicRmw16AddU
        | T::I32AtomicRmw16SubU
        | T::I32AtomicRmw16AndU
        | T::I32AtomicRmw16OrU
        | T::I32AtomicRmw16XorU
        | T::I32AtomicRmw16XchgU
        | T::I32AtomicRmw16CmpxchgU => (I32, 1),
        T::I64AtomicLoad8U
        | T::I64AtomicStore8
        | T::I64AtomicRmw8AddU
        | T::I64AtomicRmw8SubU
        | T::I64AtomicRmw8AndU
        | T::I64AtomicRmw8OrU
        | T::I64AtomicRmw8XorU
        | T::I64AtomicRmw8XchgU
        | T::I64AtomicRmw8CmpxchgU => (I64, 0),
        T::I64AtomicLoad16U
        | T::I64AtomicStore16
        | T::I64AtomicRmw16AddU
        | T::I64AtomicRmw16SubU
        | T::I64AtomicRmw16AndU
        | T::I64AtomicRmw16OrU
        | T::I64AtomicRmw16XorU
        | T::I64AtomicRmw16XchgU
        | T::I64AtomicRmw16CmpxchgU => (I64, 1),
        T::I64AtomicLoad32U
        | T::I64AtomicStore32
        | T::I64AtomicRmw32AddU
        | T::I64AtomicRmw32SubU
        | T::I64AtomicRmw32AndU
        | T::I64AtomicRmw32OrU
        | T::I64AtomicRmw32XorU
        | T::I64AtomicRmw32XchgU
        | T::I64AtomicRmw32CmpxchgU => (I64, 2),
        T::I64AtomicLoad
        | T::I64AtomicStore
        | T::I64AtomicRmwAdd
        | T::I64AtomicRmwSub
        | T::I64AtomicRmwAnd
        | T::I64AtomicRmwOr
        | T::I64AtomicRmwXor
        | T::I64AtomicRmwXchg
        | T::I64AtomicRmwCmpxchg => (I64, 3),
        _ => (I32, 2),
    }
}

/// Validates one code-section entry: locates its function declaration,
/// types its locals, and runs the stack checker over its body.
pub(crate) fn validate_code<'a>(code: &At<Code<'a>>, ctx: &mut Context<'a, '_>) -> bool {
    let entry_index = ctx.code_count;
    ctx.code_count += 1;

    let func_index = ctx.imported_function_count + entry_index as usize;
    if func_index >= ctx.functions.len() {
        let max = (ctx.functions.len() - ctx.imported_function_count) as u32;
        ctx.report(
            code.offset(),
            ErrorKind::IndexOutOfRange {
                desc: "code entry",
                index: entry_index,
                max,
            },
        );
        return false;
    }
    let type_index = ctx.functions[func_index].type_index;
    let Some(signature) = ctx.function_type(type_index) else {
        // The function's type index was invalid; reported already.
        return false;
    };
    let signature = signature.clone();

    let mut locals = signature.params.clone();
    let mut total = locals.len() as u64;
    for run in &code.locals {
        total += u64::from(run.count);
        if total > u64::from(u32::MAX) || total as usize > ctx.max_stack_height {
            ctx.report(run.offset(), ErrorKind::InternalLimitExceeded("local count"));
            return false;
        }
        for _ in 0..run.count {
            locals.push(run.valtype);
        }
    }

    let mut checker = CodeValidator::new(&signature, locals);
    let mut valid = true;
    let mut instructions = ExpressionReader::new(code.body, ctx.features);
    loop {
        match instructions.next() {
            None => break,
            Some(Ok(instruction)) => {
                valid &= checker.instruction(ctx, &instruction);
            }
            Some(Err(error)) => {
                ctx.report(error.offset, error.kind);
                return false;
            }
        }
    }
    valid &= checker.finish(ctx, instructions.offset());
    if !instructions.rest().is_empty() {
        let declared = code.body.bytes.len() as u32;
        let actual = declared - instructions.rest().len() as u32;
        ctx.report(
            instructions.offset(),
            ErrorKind::SectionLengthMismatch { declared, actual },
        );
        valid = false;
    }
    valid
}
