// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Flags for the post-1.0 WebAssembly extensions.

/// The set of enabled WebAssembly features.
///
/// Each flag gates specific opcodes, immediate shapes, and structural
/// rules; anything unlocked only by a disabled feature is rejected with a
/// `FeatureDisabled` error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Features {
    /// Import and export of mutable globals.
    pub mutable_globals: bool,
    /// The `*.extend*_s` sign-extension operators.
    pub sign_extension: bool,
    /// The `*.trunc_sat_*` saturating conversions.
    pub saturating_float_to_int: bool,
    /// More than one function/block result, and type-index block types.
    pub multi_value: bool,
    /// `externref`/`nullref`, typed `select`, table instructions, and
    /// multiple tables.
    pub reference_types: bool,
    /// Passive segments, `memory.copy`/`init`/`fill`, table analogues,
    /// and the data-count section.
    pub bulk_memory: bool,
    /// `return_call` and `return_call_indirect`.
    pub tail_call: bool,
    /// The `v128` type and the 0xfd opcode space.
    pub simd: bool,
    /// Shared memories and the 0xfe opcode space.
    pub threads: bool,
    /// Events, `try`/`catch`/`throw`, and the event section.
    pub exceptions: bool,
    /// More than one linear memory.
    pub multi_memory: bool,
}

impl Features {
    /// Strictly WebAssembly 1.0.
    pub fn none() -> Self {
        Self {
            mutable_globals: false,
            sign_extension: false,
            saturating_float_to_int: false,
            multi_value: false,
            reference_types: false,
            bulk_memory: false,
            tail_call: false,
            simd: false,
            threads: false,
            exceptions: false,
            multi_memory: false,
        }
    }

    /// Every supported extension.
    pub fn all() -> Self {
        Self {
            mutable_globals: true,
            sign_extension: true,
            saturating_float_to_int: true,
            multi_value: true,
            reference_types: true,
            bulk_memory: true,
            tail_call: true,
            simd: true,
            threads: true,
            exceptions: true,
            multi_memory: true,
        }
    }
}

// The proposals merged into the 2.0 core specification.
impl Default for Features {
    fn default() -> Self {
        Self {
            mutable_globals: true,
            sign_extension: true,
            saturating_float_to_int: true,
            multi_value: true,
            ..Self::none()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_sit_between_none_and_all() {
        let default = Features::default();
        assert!(default.mutable_globals);
        assert!(default.multi_value);
        assert!(!default.simd);
        assert!(!Features::none().mutable_globals);
        assert!(Features::all().threads);
    }
}
