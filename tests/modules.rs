// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end validation over hand-assembled module binaries.

use gauze::errors::{CollectedErrors, ErrorKind};
use gauze::{Features, Module};

fn leb(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn section(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![id];
    out.extend(leb(payload.len() as u32));
    out.extend_from_slice(payload);
    out
}

// A counted-entries section from pre-encoded entries.
fn vec_section(id: u8, entries: &[&[u8]]) -> Vec<u8> {
    let mut payload = leb(entries.len() as u32);
    for entry in entries {
        payload.extend_from_slice(entry);
    }
    section(id, &payload)
}

fn module(sections: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
    for section in sections {
        out.extend_from_slice(section);
    }
    out
}

// A code entry wrapping the given locals-and-body bytes in a size prefix.
fn code_entry(content: &[u8]) -> Vec<u8> {
    let mut out = leb(content.len() as u32);
    out.extend_from_slice(content);
    out
}

fn check(bytes: &[u8], features: Features) -> (bool, CollectedErrors) {
    let mut errors = CollectedErrors::new();
    let valid = gauze::validate(bytes, features, &mut errors);
    assert_eq!(valid, errors.is_empty());
    (valid, errors)
}

const VOID_FUNCTYPE: &[u8] = &[0x60, 0x00, 0x00];
const I32_TO_I32_FUNCTYPE: &[u8] = &[0x60, 0x01, 0x7f, 0x01, 0x7f];

#[test]
fn empty_module_validates() {
    let (valid, errors) = check(&module(&[]), Features::default());
    assert!(valid, "{:?}", errors.diagnostics);
}

#[test]
fn minimal_identity_function_validates() {
    let bytes = module(&[
        vec_section(1, &[I32_TO_I32_FUNCTYPE]),
        vec_section(3, &[&[0x00]]),
        vec_section(7, &[&[0x02, b'i', b'd', 0x00, 0x00]]),
        vec_section(10, &[&code_entry(&[0x00, 0x20, 0x00, 0x0b])]),
    ]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(valid, "{:?}", errors.diagnostics);

    // The same module also round-trips through the materialized path.
    let module = Module::decode(&bytes, Features::default()).unwrap();
    assert_eq!(module.types.len(), 1);
    assert_eq!(module.codes.len(), 1);
    let mut errors = CollectedErrors::new();
    assert!(module.validate(&mut errors));
}

#[test]
fn empty_body_for_identity_function_underflows() {
    let bytes = module(&[
        vec_section(1, &[I32_TO_I32_FUNCTYPE]),
        vec_section(3, &[&[0x00]]),
        vec_section(10, &[&code_entry(&[0x00, 0x0b])]),
    ]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert_eq!(errors.diagnostics.len(), 1);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::TypeMismatch {
            expected: "i32".to_string(),
            actual: "nothing".to_string(),
        }
    );
    assert_eq!(errors.diagnostics[0].context, ["function 0"]);
}

#[test]
fn mutable_global_in_constant_expression_is_rejected() {
    // Global 0 is mutable; global 1's initializer reads it.
    let bytes = module(&[vec_section(
        6,
        &[
            &[0x7f, 0x01, 0x41, 0x00, 0x0b],
            &[0x7f, 0x00, 0x23, 0x00, 0x0b],
        ],
    )]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert!(errors
        .diagnostics
        .iter()
        .any(|d| d.kind == ErrorKind::MutableGlobalInConstExpr));
    let mutable = errors
        .diagnostics
        .iter()
        .find(|d| d.kind == ErrorKind::MutableGlobalInConstExpr)
        .unwrap();
    assert_eq!(mutable.context, ["global 1", "constant expression"]);
}

#[test]
fn duplicate_export_names_are_rejected() {
    let bytes = module(&[
        vec_section(1, &[VOID_FUNCTYPE]),
        vec_section(3, &[&[0x00], &[0x00]]),
        vec_section(
            7,
            &[
                &[0x03, b'f', b'o', b'o', 0x00, 0x00],
                &[0x03, b'f', b'o', b'o', 0x00, 0x01],
            ],
        ),
        vec_section(
            10,
            &[&code_entry(&[0x00, 0x0b]), &code_entry(&[0x00, 0x0b])],
        ),
    ]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert_eq!(errors.diagnostics.len(), 1);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::DuplicateExport("foo".to_string())
    );
    // The second export is the duplicate.
    assert_eq!(errors.diagnostics[0].context, ["export 1"]);
}

#[test]
fn global_ref_func_defers_until_an_element_segment_declares_it() {
    let mut features = Features::default();
    features.reference_types = true;
    features.bulk_memory = true;

    let typesec = vec_section(1, &[VOID_FUNCTYPE]);
    let funcsec = vec_section(3, &[&[0x00]]);
    // (global funcref (ref.func 0))
    let globalsec = vec_section(6, &[&[0x70, 0x00, 0xd2, 0x00, 0x0b]]);
    let codesec = vec_section(10, &[&code_entry(&[0x00, 0x0b])]);

    // Without any declaration of function 0, the deferred reference fails
    // at end-of-module.
    let bytes = module(&[
        typesec.clone(),
        funcsec.clone(),
        globalsec.clone(),
        codesec.clone(),
    ]);
    let (valid, errors) = check(&bytes, features);
    assert!(!valid);
    assert_eq!(errors.diagnostics.len(), 1);
    assert_eq!(errors.diagnostics[0].kind, ErrorKind::UndeclaredFunctionRef(0));

    // A declarative element segment naming function 0 resolves it.
    let elemsec = vec_section(9, &[&[0x03, 0x00, 0x01, 0x00]]);
    let bytes = module(&[typesec, funcsec, globalsec, elemsec, codesec]);
    let (valid, errors) = check(&bytes, features);
    assert!(valid, "{:?}", errors.diagnostics);
}

#[test]
fn start_function_must_have_an_empty_signature() {
    let bytes = module(&[
        vec_section(1, &[I32_TO_I32_FUNCTYPE]),
        vec_section(3, &[&[0x00]]),
        section(8, &[0x00]),
        vec_section(10, &[&code_entry(&[0x00, 0x20, 0x00, 0x0b])]),
    ]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::WrongFunctionSignature {
            params: 1,
            results: 1,
        }
    );
    assert_eq!(errors.diagnostics[0].context, ["start"]);
}

#[test]
fn at_most_one_memory_without_multi_memory() {
    let bytes = module(&[vec_section(5, &[&[0x00, 0x01], &[0x00, 0x01]])]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::TooManyMemories { count: 2 }
    );

    let mut features = Features::default();
    features.multi_memory = true;
    let (valid, _) = check(&bytes, features);
    assert!(valid);
}

#[test]
fn memory_limits_are_capped_at_the_page_count() {
    let mut payload = vec![0x01, 0x00];
    payload.extend(leb(70000)); // maximum of 70000 pages
    let bytes = module(&[vec_section(5, &[&payload])]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::PageCountExceeded {
            desc: "maximum",
            count: 70000,
        }
    );
    assert_eq!(errors.diagnostics[0].context, ["memory 0", "limits"]);
}

#[test]
fn limits_minimum_may_not_exceed_maximum() {
    let bytes = module(&[vec_section(5, &[&[0x01, 0x05, 0x02]])]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::LimitsMismatch { min: 5, max: 2 }
    );
}

#[test]
fn a_poisoned_section_reports_once_and_later_sections_still_validate() {
    // The type section's first entry is garbage (0x61 is not a function
    // type token), so the section is skipped past with a single error;
    // the export section afterwards is still validated.
    let bytes = module(&[
        vec_section(1, &[&[0x61, 0x00, 0x00], VOID_FUNCTYPE]),
        vec_section(
            7,
            &[
                &[0x01, b'a', 0x00, 0x00],
                &[0x01, b'a', 0x00, 0x00],
            ],
        ),
    ]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert!(errors
        .diagnostics
        .iter()
        .any(|d| d.kind == ErrorKind::InvalidImmediate("function type")));
    // The duplicate export was found, so the export section ran.
    assert!(errors
        .diagnostics
        .iter()
        .any(|d| matches!(d.kind, ErrorKind::DuplicateExport(_))));
}

#[test]
fn a_bad_code_body_does_not_poison_its_neighbors() {
    // Function 0's body hits an unknown opcode; function 1's body is fine
    // and produces no further diagnostics.
    let bytes = module(&[
        vec_section(1, &[VOID_FUNCTYPE]),
        vec_section(3, &[&[0x00], &[0x00]]),
        vec_section(
            10,
            &[&code_entry(&[0x00, 0x27, 0x0b]), &code_entry(&[0x00, 0x0b])],
        ),
    ]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert_eq!(errors.diagnostics.len(), 1);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::UnknownOpcode {
            prefix: None,
            code: 0x27,
        }
    );
}

#[test]
fn function_and_code_counts_must_agree() {
    let bytes = module(&[
        vec_section(1, &[VOID_FUNCTYPE]),
        vec_section(3, &[&[0x00], &[0x00]]),
        vec_section(10, &[&code_entry(&[0x00, 0x0b])]),
    ]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert!(errors
        .diagnostics
        .iter()
        .any(|d| d.kind == ErrorKind::SectionLengthMismatch { declared: 2, actual: 1 }));
}

#[test]
fn data_count_must_match_the_data_section() {
    let mut features = Features::default();
    features.bulk_memory = true;
    let bytes = module(&[
        vec_section(5, &[&[0x00, 0x01]]),
        section(12, &leb(2)),
        vec_section(11, &[&[0x00, 0x41, 0x00, 0x0b, 0x01, 0xaa]]),
    ]);
    let (valid, errors) = check(&bytes, features);
    assert!(!valid);
    assert!(errors
        .diagnostics
        .iter()
        .any(|d| d.kind == ErrorKind::SectionLengthMismatch { declared: 2, actual: 1 }));
}

#[test]
fn active_element_segments_check_table_and_offset() {
    // No table exists, and the offset is an i64 constant.
    let bytes = module(&[
        vec_section(1, &[VOID_FUNCTYPE]),
        vec_section(3, &[&[0x00]]),
        vec_section(9, &[&[0x00, 0x42, 0x00, 0x0b, 0x01, 0x00]]),
        vec_section(10, &[&code_entry(&[0x00, 0x0b])]),
    ]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert!(errors.diagnostics.iter().any(|d| matches!(
        d.kind,
        ErrorKind::IndexOutOfRange {
            desc: "table index",
            ..
        }
    )));
    assert!(errors.diagnostics.iter().any(|d| d.kind
        == ErrorKind::TypeMismatch {
            expected: "i32".to_string(),
            actual: "i64".to_string(),
        }));
}

#[test]
fn exporting_a_mutable_global_requires_the_feature() {
    let mut features = Features::default();
    features.mutable_globals = false;
    let bytes = module(&[
        vec_section(6, &[&[0x7f, 0x01, 0x41, 0x00, 0x0b]]),
        vec_section(7, &[&[0x01, b'g', 0x03, 0x00]]),
    ]);
    let (valid, errors) = check(&bytes, features);
    assert!(!valid);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::FeatureDisabled("mutable global export")
    );

    let (valid, _) = check(&bytes, Features::default());
    assert!(valid);
}

#[test]
fn truncated_modules_never_panic_and_always_report() {
    let typesec = vec_section(1, &[I32_TO_I32_FUNCTYPE]);
    let funcsec = vec_section(3, &[&[0x00]]);
    let codesec = vec_section(10, &[&code_entry(&[0x00, 0x20, 0x00, 0x0b])]);
    // Truncating exactly at these boundaries leaves a smaller but
    // well-formed module; everywhere else must report.
    let benign = [8, 8 + typesec.len()];
    let full = module(&[typesec, funcsec, codesec]);
    for len in 0..full.len() {
        let mut errors = CollectedErrors::new();
        let valid = gauze::validate(&full[..len], Features::default(), &mut errors);
        if benign.contains(&len) {
            assert!(valid, "truncation to {len} bytes should be a valid module");
        } else {
            assert!(!valid, "truncation to {len} bytes unexpectedly validated");
            assert!(!errors.is_empty());
        }
    }
}

#[test]
fn every_byte_mutation_terminates() {
    let full = module(&[
        vec_section(1, &[I32_TO_I32_FUNCTYPE]),
        vec_section(3, &[&[0x00]]),
        vec_section(10, &[&code_entry(&[0x00, 0x20, 0x00, 0x0b])]),
    ]);
    for index in 8..full.len() {
        for bit in 0..8 {
            let mut mutated = full.clone();
            mutated[index] ^= 1 << bit;
            let mut errors = CollectedErrors::new();
            // Interesting modules may stay valid; the property is that
            // validation terminates without panicking.
            let _ = gauze::validate(&mutated, Features::default(), &mut errors);
        }
    }
}

#[test]
fn events_require_the_exceptions_feature() {
    let eventsec = vec_section(13, &[&[0x00, 0x00]]);
    let bytes = module(&[vec_section(1, &[VOID_FUNCTYPE]), eventsec]);
    let (valid, errors) = check(&bytes, Features::default());
    assert!(!valid);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::FeatureDisabled("event section")
    );

    let mut features = Features::default();
    features.exceptions = true;
    let (valid, errors) = check(&bytes, features);
    assert!(valid, "{:?}", errors.diagnostics);
}

#[test]
fn event_types_must_have_empty_results() {
    let mut features = Features::default();
    features.exceptions = true;
    let bytes = module(&[
        vec_section(1, &[I32_TO_I32_FUNCTYPE]),
        vec_section(13, &[&[0x00, 0x00]]),
    ]);
    let (valid, errors) = check(&bytes, features);
    assert!(!valid);
    assert!(matches!(
        errors.diagnostics[0].kind,
        ErrorKind::TypeMismatch { .. }
    ));
    assert_eq!(errors.diagnostics[0].context, ["event 0", "event type"]);
}

#[test]
fn try_catch_receives_the_tags_payload() {
    let mut features = Features::default();
    features.exceptions = true;

    // Type 0 is the tag's signature (i32) -> (); type 1 the function's.
    let typesec = vec_section(1, &[&[0x60, 0x01, 0x7f, 0x00], VOID_FUNCTYPE]);
    let funcsec = vec_section(3, &[&[0x01]]);
    let eventsec = vec_section(13, &[&[0x00, 0x00]]);

    // try: i32.const 7, throw 0; catch 0: drop the payload; end.
    let body = [
        0x00, // no locals
        0x06, 0x40, // try (empty)
        0x41, 0x07, // i32.const 7
        0x08, 0x00, // throw tag 0
        0x07, 0x00, // catch tag 0
        0x1a, // drop
        0x0b, // end (try/catch)
        0x0b, // end (function)
    ];
    let codesec = vec_section(10, &[&code_entry(&body)]);
    let bytes = module(&[typesec.clone(), funcsec.clone(), eventsec.clone(), codesec]);
    let (valid, errors) = check(&bytes, features);
    assert!(valid, "{:?}", errors.diagnostics);

    // Without the drop, the payload is left behind when the catch ends.
    let body = [
        0x00, 0x06, 0x40, 0x41, 0x07, 0x08, 0x00, 0x07, 0x00, 0x0b, 0x0b,
    ];
    let codesec = vec_section(10, &[&code_entry(&body)]);
    let bytes = module(&[typesec, funcsec, eventsec, codesec]);
    let (valid, errors) = check(&bytes, features);
    assert!(!valid);
    assert!(errors
        .diagnostics
        .iter()
        .any(|d| d.kind == ErrorKind::UnreachableMismatch));
}

#[test]
fn rethrow_must_target_a_catch_frame() {
    let mut features = Features::default();
    features.exceptions = true;

    let typesec = vec_section(1, &[VOID_FUNCTYPE]);
    let funcsec = vec_section(3, &[&[0x00]]);
    let eventsec = vec_section(13, &[&[0x00, 0x00]]);

    // try; catch 0; rethrow 0 (the catch frame itself); end.
    let body = [0x00, 0x06, 0x40, 0x07, 0x00, 0x09, 0x00, 0x0b, 0x0b];
    let codesec = vec_section(10, &[&code_entry(&body)]);
    let bytes = module(&[typesec.clone(), funcsec.clone(), eventsec, codesec]);
    let (valid, errors) = check(&bytes, features);
    assert!(valid, "{:?}", errors.diagnostics);

    // Outside any catch block there is nothing to re-raise.
    let body = [0x00, 0x09, 0x00, 0x0b];
    let codesec = vec_section(10, &[&code_entry(&body)]);
    let bytes = module(&[typesec, funcsec, codesec]);
    let (valid, errors) = check(&bytes, features);
    assert!(!valid);
    assert_eq!(
        errors.diagnostics[0].kind,
        ErrorKind::UnalignedLabel("rethrow target is not a catch block")
    );
}
