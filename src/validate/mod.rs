// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Module validation.
//!
//! Validation runs one [`Context`] per module. Each entity validator
//! appends what it declares to the context (so later entities can be
//! checked against it), reports every problem it finds to the error sink,
//! and returns whether the entity was valid; validation never stops early.
//! [`validate`] drives the lazy section streams directly, so a module can
//! be validated without ever being materialized; [`validate_module`] does
//! the same over a decoded [`crate::Module`].

mod expr;

pub(crate) use expr::{validate_code, validate_constant_expression, validate_element_expression};
pub use expr::ConstantExpressionKind;

use std::collections::HashSet;

use log::debug;

use crate::decode::{Decode, LazySection, Section, SectionEntries, SectionsReader};
use crate::errors::{ErrorKind, ErrorSink};
use crate::features::Features;
use crate::types::{
    At, Code, DataCount, DataMode, DataSegment, ElementInit, ElementMode, ElementSegment,
    EventType, Export, ExternalKind, Function, FunctionType, Global, GlobalType, Import,
    ImportDescriptor, Limits, MemoryType, Mutability, ReferenceType, Shared, Start, TableType,
};
use crate::Module;

/// The mutable accumulator for one module validation.
///
/// Entity lists are append-only and grow in declaration order, imported
/// entries first. The context owns no part of the module; names borrow
/// from the input buffer.
pub struct Context<'a, 'e> {
    pub features: Features,
    /// Ceiling on the checker's value/control stacks and expanded locals.
    pub max_stack_height: usize,

    pub types: Vec<FunctionType>,
    pub functions: Vec<Function>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub globals: Vec<GlobalType>,
    pub events: Vec<EventType>,

    /// How many leading entries of `functions` are imports.
    pub imported_function_count: usize,
    /// How many leading entries of `globals` are imports.
    pub imported_global_count: usize,

    pub export_names: HashSet<&'a str>,
    pub declared_data_count: Option<u32>,
    pub data_segment_count: u32,
    pub code_count: u32,
    /// Element types of the element segments seen so far.
    pub element_segments: Vec<ReferenceType>,
    /// Function indices that `ref.func` may name outside element segments.
    pub declared_functions: HashSet<u32>,
    /// `ref.func` indices from global initializers, resolved at
    /// end-of-module once the element section has been seen.
    pub deferred_function_references: Vec<At<u32>>,

    pub(crate) errors: &'e mut dyn ErrorSink,
}

impl<'a, 'e> Context<'a, 'e> {
    pub fn new(features: Features, errors: &'e mut dyn ErrorSink) -> Self {
        Self {
            features,
            max_stack_height: 100_000,
            types: Vec::new(),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            events: Vec::new(),
            imported_function_count: 0,
            imported_global_count: 0,
            export_names: HashSet::new(),
            declared_data_count: None,
            data_segment_count: 0,
            code_count: 0,
            element_segments: Vec::new(),
            declared_functions: HashSet::new(),
            deferred_function_references: Vec::new(),
            errors,
        }
    }

    pub(crate) fn report(&mut self, offset: usize, kind: ErrorKind) {
        self.errors.report(offset, kind);
    }

    // Runs `f` inside a breadcrumb scope; the pop happens on every path.
    pub(crate) fn with_context<R>(
        &mut self,
        offset: usize,
        desc: &str,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.errors.push_context(offset, desc);
        let result = f(self);
        self.errors.pop_context();
        result
    }

    pub(crate) fn check_index(
        &mut self,
        offset: usize,
        index: u32,
        max: usize,
        desc: &'static str,
    ) -> bool {
        if (index as usize) >= max {
            self.report(
                offset,
                ErrorKind::IndexOutOfRange {
                    desc,
                    index,
                    max: max as u32,
                },
            );
            return false;
        }
        true
    }

    pub(crate) fn function_type(&self, type_index: u32) -> Option<&FunctionType> {
        self.types.get(type_index as usize)
    }

    /// The signature of the function at `func_index`, if both the function
    /// and its type index are valid.
    pub(crate) fn function_signature(&self, func_index: u32) -> Option<&FunctionType> {
        let function = self.functions.get(func_index as usize)?;
        self.function_type(function.type_index)
    }
}

/// Validates one entity against (and into) the context.
pub trait Validate<'a> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool;
}

fn validate_limits(offset: usize, limits: &Limits, ceiling: Option<u32>, ctx: &mut Context) -> bool {
    ctx.with_context(offset, "limits", |ctx| {
        let mut valid = true;
        if let Some(ceiling) = ceiling {
            if limits.min > ceiling {
                ctx.report(
                    offset,
                    ErrorKind::PageCountExceeded {
                        desc: "minimum",
                        count: limits.min,
                    },
                );
                valid = false;
            }
            if let Some(max) = limits.max {
                if max > ceiling {
                    ctx.report(
                        offset,
                        ErrorKind::PageCountExceeded {
                            desc: "maximum",
                            count: max,
                        },
                    );
                    valid = false;
                }
            }
        }
        if let Some(max) = limits.max {
            if limits.min > max {
                ctx.report(
                    offset,
                    ErrorKind::LimitsMismatch {
                        min: limits.min,
                        max,
                    },
                );
                valid = false;
            }
        }
        valid
    })
}

// The per-entity rules below are shared between the dedicated sections and
// the import section, which declares the same kinds of entities.

fn validate_function_entry(offset: usize, function: Function, ctx: &mut Context) -> bool {
    ctx.functions.push(function);
    ctx.check_index(
        offset,
        function.type_index,
        ctx.types.len(),
        "function type index",
    )
}

fn validate_table_entry(offset: usize, table: TableType, ctx: &mut Context) -> bool {
    ctx.tables.push(table);
    let mut valid = validate_limits(offset, &table.limits, None, ctx);
    if table.limits.shared == Shared::Yes {
        ctx.report(offset, ErrorKind::SharedNotAllowed("tables"));
        valid = false;
    }
    if ctx.tables.len() > 1 && !ctx.features.reference_types {
        ctx.report(
            offset,
            ErrorKind::TooManyTables {
                count: ctx.tables.len() as u32,
            },
        );
        valid = false;
    }
    valid
}

fn validate_memory_entry(offset: usize, memory: MemoryType, ctx: &mut Context) -> bool {
    ctx.memories.push(memory);
    let limits = &memory.limits;
    let mut valid = validate_limits(offset, limits, Some(MemoryType::MAX_PAGES), ctx);
    if limits.shared == Shared::Yes {
        if !ctx.features.threads {
            ctx.report(offset, ErrorKind::SharedNotAllowed("memories"));
            valid = false;
        }
        if limits.max.is_none() {
            ctx.report(offset, ErrorKind::SharedNotAllowed("memories without a maximum"));
            valid = false;
        }
    }
    if ctx.memories.len() > 1 && !ctx.features.multi_memory {
        ctx.report(
            offset,
            ErrorKind::TooManyMemories {
                count: ctx.memories.len() as u32,
            },
        );
        valid = false;
    }
    valid
}

fn validate_event_entry(offset: usize, event: EventType, ctx: &mut Context) -> bool {
    ctx.events.push(event);
    ctx.with_context(offset, "event type", |ctx| {
        if !ctx.check_index(offset, event.type_index, ctx.types.len(), "event type index") {
            return false;
        }
        let results = &ctx.types[event.type_index as usize].results;
        if !results.is_empty() {
            let actual = format!("{} results", results.len());
            ctx.report(
                offset,
                ErrorKind::TypeMismatch {
                    expected: "an empty exception result type".to_string(),
                    actual,
                },
            );
            return false;
        }
        true
    })
}

fn validate_global_import(offset: usize, global_type: GlobalType, ctx: &mut Context) -> bool {
    ctx.globals.push(global_type);
    ctx.imported_global_count += 1;
    if global_type.mutability == Mutability::Var && !ctx.features.mutable_globals {
        ctx.report(offset, ErrorKind::FeatureDisabled("mutable global import"));
        return false;
    }
    true
}

impl<'a> Validate<'a> for At<FunctionType> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        let offset = self.offset();
        ctx.types.push((**self).clone());
        if self.results.len() > 1 && !ctx.features.multi_value {
            ctx.report(offset, ErrorKind::FeatureDisabled("multi-value result type"));
            return false;
        }
        true
    }
}

impl<'a> Validate<'a> for At<Import<'a>> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        let offset = self.offset();
        match self.descriptor {
            ImportDescriptor::Function(type_index) => {
                ctx.imported_function_count += 1;
                validate_function_entry(offset, Function { type_index }, ctx)
            }
            ImportDescriptor::Table(table) => validate_table_entry(offset, table, ctx),
            ImportDescriptor::Memory(memory) => validate_memory_entry(offset, memory, ctx),
            ImportDescriptor::Global(global_type) => {
                validate_global_import(offset, global_type, ctx)
            }
            ImportDescriptor::Event(event) => validate_event_entry(offset, event, ctx),
        }
    }
}

impl<'a> Validate<'a> for At<Function> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        validate_function_entry(self.offset(), **self, ctx)
    }
}

impl<'a> Validate<'a> for At<TableType> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        validate_table_entry(self.offset(), **self, ctx)
    }
}

impl<'a> Validate<'a> for At<MemoryType> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        validate_memory_entry(self.offset(), **self, ctx)
    }
}

impl<'a> Validate<'a> for At<EventType> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        validate_event_entry(self.offset(), **self, ctx)
    }
}

impl<'a> Validate<'a> for At<Global> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        let global_type = *self.global_type;
        ctx.globals.push(global_type);
        // Only imported globals are addressable from a global's own
        // initializer, which GlobalInit encodes.
        validate_constant_expression(
            &self.init,
            self.offset(),
            ConstantExpressionKind::GlobalInit,
            global_type.valtype,
            ctx,
        )
    }
}

impl<'a> Validate<'a> for At<Export<'a>> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        let offset = self.offset();
        let mut valid = true;

        if !ctx.export_names.insert(*self.name) {
            ctx.report(
                self.name.offset(),
                ErrorKind::DuplicateExport(self.name.to_string()),
            );
            valid = false;
        }

        let index = *self.index;
        let index_offset = self.index.offset();
        match self.kind {
            ExternalKind::Function => {
                if ctx.check_index(index_offset, index, ctx.functions.len(), "function index") {
                    // Exported functions become referenceable via ref.func.
                    ctx.declared_functions.insert(index);
                } else {
                    valid = false;
                }
            }
            ExternalKind::Table => {
                valid &= ctx.check_index(index_offset, index, ctx.tables.len(), "table index");
            }
            ExternalKind::Memory => {
                valid &= ctx.check_index(index_offset, index, ctx.memories.len(), "memory index");
            }
            ExternalKind::Global => {
                if ctx.check_index(index_offset, index, ctx.globals.len(), "global index") {
                    let global = ctx.globals[index as usize];
                    if global.mutability == Mutability::Var && !ctx.features.mutable_globals {
                        ctx.report(
                            index_offset,
                            ErrorKind::FeatureDisabled("mutable global export"),
                        );
                        valid = false;
                    }
                } else {
                    valid = false;
                }
            }
            ExternalKind::Event => {
                valid &= ctx.check_index(index_offset, index, ctx.events.len(), "event index");
            }
        }
        valid
    }
}

impl<'a> Validate<'a> for At<Start> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        let index = *self.func_index;
        let offset = self.func_index.offset();
        if !ctx.check_index(offset, index, ctx.functions.len(), "function index") {
            return false;
        }
        ctx.declared_functions.insert(index);

        let Some(signature) = ctx.function_signature(index) else {
            // The function's own type index was invalid; already reported.
            return false;
        };
        if !signature.params.is_empty() || !signature.results.is_empty() {
            let (params, results) = (signature.params.len(), signature.results.len());
            ctx.report(
                offset,
                ErrorKind::WrongFunctionSignature { params, results },
            );
            return false;
        }
        true
    }
}

impl<'a> Validate<'a> for At<ElementSegment> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        let offset = self.offset();
        ctx.element_segments.push(self.elemtype());
        let mut valid = true;

        if let ElementMode::Active {
            table_index,
            offset: init_offset,
        } = &self.mode
        {
            valid &= ctx.check_index(
                table_index.offset(),
                **table_index,
                ctx.tables.len(),
                "table index",
            );
            valid &= validate_constant_expression(
                init_offset,
                offset,
                ConstantExpressionKind::GlobalInit,
                crate::types::ValueType::I32,
                ctx,
            );
        }

        match &self.init {
            ElementInit::Indices { kind, list } => {
                let max = match kind {
                    ExternalKind::Function => ctx.functions.len(),
                    ExternalKind::Table => ctx.tables.len(),
                    ExternalKind::Memory => ctx.memories.len(),
                    ExternalKind::Global => ctx.globals.len(),
                    ExternalKind::Event => ctx.events.len(),
                };
                for index in list {
                    valid &= ctx.check_index(index.offset(), **index, max, "index");
                    if *kind == ExternalKind::Function {
                        ctx.declared_functions.insert(**index);
                    }
                }
            }
            ElementInit::Expressions { elemtype, list } => {
                for expression in list {
                    valid &= validate_element_expression(
                        expression,
                        expression.offset(),
                        *elemtype,
                        ctx,
                    );
                }
            }
        }
        valid
    }
}

impl<'a> Validate<'a> for At<DataCount> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        ctx.declared_data_count = Some(self.count);
        true
    }
}

impl<'a> Validate<'a> for At<DataSegment<'a>> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        let offset = self.offset();
        ctx.data_segment_count += 1;
        let mut valid = true;
        if let DataMode::Active {
            memory_index,
            offset: init_offset,
        } = &self.mode
        {
            valid &= ctx.check_index(
                memory_index.offset(),
                **memory_index,
                ctx.memories.len(),
                "memory index",
            );
            valid &= validate_constant_expression(
                init_offset,
                offset,
                ConstantExpressionKind::Other,
                crate::types::ValueType::I32,
                ctx,
            );
        }
        valid
    }
}

impl<'a> Validate<'a> for At<Code<'a>> {
    fn validate(&self, ctx: &mut Context<'a, '_>) -> bool {
        validate_code(self, ctx)
    }
}

/// The end-of-module checks: deferred `ref.func` resolution, and the
/// counts that can only be compared once every section has been seen.
fn end_module(ctx: &mut Context) -> bool {
    let mut valid = true;

    // ref.func in a global initializer cannot be checked against the
    // element section in place, since that section comes later.
    let deferred = std::mem::take(&mut ctx.deferred_function_references);
    for index in &deferred {
        if !ctx.declared_functions.contains(&**index) {
            ctx.report(index.offset(), ErrorKind::UndeclaredFunctionRef(**index));
            valid = false;
        }
    }

    let declared = (ctx.functions.len() - ctx.imported_function_count) as u32;
    if ctx.code_count != declared {
        ctx.report(
            0,
            ErrorKind::SectionLengthMismatch {
                declared,
                actual: ctx.code_count,
            },
        );
        valid = false;
    }

    if let Some(count) = ctx.declared_data_count {
        if count != ctx.data_segment_count {
            ctx.report(
                0,
                ErrorKind::SectionLengthMismatch {
                    declared: count,
                    actual: ctx.data_segment_count,
                },
            );
            valid = false;
        }
    }

    debug!(
        "validated module: {} functions, {} globals, valid={valid}",
        ctx.functions.len(),
        ctx.globals.len(),
    );
    valid
}

// Validates every entry of one lazy section stream, labelling each with
// its module-wide index. A decode failure is reported and the stream
// decides whether later entries are reachable.
fn validate_entries<'a, T>(
    entries: LazySection<'a, T>,
    label: &str,
    index_base: usize,
    ctx: &mut Context<'a, '_>,
) -> bool
where
    T: Decode<'a>,
    At<T>: Validate<'a>,
{
    let mut valid = true;
    for (i, entry) in entries.enumerate() {
        match entry {
            Ok(entry) => {
                let desc = format!("{label} {}", index_base + i);
                valid &= ctx.with_context(entry.offset(), &desc, |ctx| entry.validate(ctx));
            }
            Err(error) => {
                ctx.report(error.offset, error.kind);
                valid = false;
            }
        }
    }
    valid
}

fn validate_section<'a>(entries: SectionEntries<'a>, ctx: &mut Context<'a, '_>) -> bool {
    match entries {
        SectionEntries::Type(entries) => validate_entries(entries, "type", 0, ctx),
        SectionEntries::Import(entries) => validate_entries(entries, "import", 0, ctx),
        SectionEntries::Function(entries) => {
            let base = ctx.functions.len();
            validate_entries(entries, "function", base, ctx)
        }
        SectionEntries::Table(entries) => {
            let base = ctx.tables.len();
            validate_entries(entries, "table", base, ctx)
        }
        SectionEntries::Memory(entries) => {
            let base = ctx.memories.len();
            validate_entries(entries, "memory", base, ctx)
        }
        SectionEntries::Event(entries) => {
            let base = ctx.events.len();
            validate_entries(entries, "event", base, ctx)
        }
        SectionEntries::Global(entries) => {
            let base = ctx.globals.len();
            validate_entries(entries, "global", base, ctx)
        }
        SectionEntries::Export(entries) => validate_entries(entries, "export", 0, ctx),
        SectionEntries::Start(start) => {
            ctx.with_context(start.offset(), "start", |ctx| start.validate(ctx))
        }
        SectionEntries::Element(entries) => validate_entries(entries, "element segment", 0, ctx),
        SectionEntries::DataCount(count) => count.validate(ctx),
        SectionEntries::Code(entries) => {
            let base = ctx.imported_function_count;
            validate_entries(entries, "function", base, ctx)
        }
        SectionEntries::Data(entries) => validate_entries(entries, "data segment", 0, ctx),
    }
}

/// Validates a module from its raw bytes, streaming section by section
/// without materializing it. Returns whether the module is valid; every
/// problem found is reported to `errors`.
pub fn validate(bytes: &[u8], features: Features, errors: &mut dyn ErrorSink) -> bool {
    let sections = match SectionsReader::new(bytes, features) {
        Ok(sections) => sections,
        Err(error) => {
            errors.report(error.offset, error.kind);
            return false;
        }
    };

    let mut ctx = Context::new(features, errors);
    let mut valid = true;
    for section in sections {
        match section {
            Ok(Section::Custom(custom)) => {
                debug!("skipping custom section {:?}", *custom.name);
            }
            Ok(Section::Known(section)) => match section.entries() {
                Ok(entries) => valid &= validate_section(entries, &mut ctx),
                Err(error) => {
                    ctx.report(error.offset, error.kind);
                    valid = false;
                }
            },
            Err(error) => {
                // Top-level framing is broken; nothing more to stream.
                ctx.report(error.offset, error.kind);
                return false;
            }
        }
    }
    valid & end_module(&mut ctx)
}

/// Validates an already-decoded module. Runs the same per-entity rules as
/// [`validate`].
pub fn validate_module<'a>(module: &Module<'a>, errors: &mut dyn ErrorSink) -> bool {
    let mut ctx = Context::new(module.features, errors);
    let mut valid = true;

    fn entries<'a, T>(
        list: &[At<T>],
        label: &str,
        index_base: usize,
        ctx: &mut Context<'a, '_>,
    ) -> bool
    where
        At<T>: Validate<'a>,
    {
        let mut valid = true;
        for (i, entry) in list.iter().enumerate() {
            let desc = format!("{label} {}", index_base + i);
            valid &= ctx.with_context(entry.offset(), &desc, |ctx| entry.validate(ctx));
        }
        valid
    }

    valid &= entries(&module.types, "type", 0, &mut ctx);
    valid &= entries(&module.imports, "import", 0, &mut ctx);
    valid &= entries(&module.functions, "function", ctx.functions.len(), &mut ctx);
    valid &= entries(&module.tables, "table", ctx.tables.len(), &mut ctx);
    valid &= entries(&module.memories, "memory", ctx.memories.len(), &mut ctx);
    valid &= entries(&module.events, "event", ctx.events.len(), &mut ctx);
    valid &= entries(&module.globals, "global", ctx.globals.len(), &mut ctx);
    valid &= entries(&module.exports, "export", 0, &mut ctx);
    if let Some(start) = &module.start {
        valid &= ctx.with_context(start.offset(), "start", |ctx| start.validate(ctx));
    }
    valid &= entries(&module.elements, "element segment", 0, &mut ctx);
    if let Some(count) = &module.data_count {
        valid &= count.validate(&mut ctx);
    }
    valid &= entries(
        &module.codes,
        "function",
        ctx.imported_function_count,
        &mut ctx,
    );
    valid &= entries(&module.data, "data segment", 0, &mut ctx);

    valid & end_module(&mut ctx)
}
