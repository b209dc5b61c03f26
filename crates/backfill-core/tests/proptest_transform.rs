//! Property-based tests for the document multiplier.
//!
//! Validates:
//! 1. Output count: S sources × factor N copies, for every N ≥ 1
//! 2. Derived ids are unique when source ids avoid the separator
//! 3. With suffixed source ids, either the collision check rejects the batch
//!    or every copy id is unique and the count is S × N
//! 4. Re-applying over the same sources adds no new ids
//! 5. resume_from(k) yields exactly the tail of the full sequence
//! 6. Overrides land on every copy; other fields are preserved
//! 7. Declared script constants resolve to the expected factor

use std::collections::BTreeSet;

use proptest::prelude::*;
use serde_json::{Map, Value, json};

use backfill_core::cluster::Document;
use backfill_core::transform::{
    TransformConfig, TransformConfigLoader, TransformSpec, TransformerPipeline, script_factor,
};

// =============================================================================
// Strategies
// =============================================================================

fn arb_ids() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[a-z0-9]{1,8}", 0..40)
}

/// Ids that already end in `_<digits>`, the shape copies use.
fn arb_suffixed_ids() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[a-c]{1,2}(_[0-9]{1,2}){0,2}", 0..30)
}

fn arb_factor() -> impl Strategy<Value = u64> {
    1u64..=12
}

fn docs(ids: &BTreeSet<String>) -> Vec<Document> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| Document::new("idx", id.clone(), json!({"title": id, "value": i})))
        .collect()
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn output_count_is_sources_times_factor(ids in arb_ids(), factor in arb_factor()) {
        let spec = TransformSpec::multiply(factor).unwrap();
        let pipeline = TransformerPipeline::new(spec.clone()).unwrap();
        let out = pipeline.apply_batch(&docs(&ids));
        prop_assert_eq!(out.len() as u64, spec.expected_count(ids.len() as u64));
    }

    #[test]
    fn derived_ids_are_unique(ids in arb_ids(), factor in arb_factor()) {
        let pipeline = TransformerPipeline::new(TransformSpec::multiply(factor).unwrap()).unwrap();
        let out = pipeline.apply_batch(&docs(&ids));
        let unique: BTreeSet<&str> = out.iter().map(|d| d.id.as_str()).collect();
        prop_assert_eq!(unique.len(), out.len());
    }

    #[test]
    fn accepted_ids_never_overwrite(ids in arb_suffixed_ids(), factor in arb_factor()) {
        let spec = TransformSpec::multiply(factor).unwrap();
        let pipeline = TransformerPipeline::new(spec.clone()).unwrap();
        let out = pipeline.apply_batch(&docs(&ids));
        let unique: BTreeSet<&str> = out.iter().map(|d| d.id.as_str()).collect();
        match spec.check_unique_ids(ids.iter().map(String::as_str)) {
            Ok(()) => {
                prop_assert_eq!(unique.len(), out.len());
                prop_assert_eq!(out.len() as u64, spec.expected_count(ids.len() as u64));
            }
            Err(_) => prop_assert!(unique.len() < out.len()),
        }
    }

    #[test]
    fn reapplication_is_idempotent(ids in arb_ids(), factor in arb_factor()) {
        let pipeline = TransformerPipeline::new(TransformSpec::multiply(factor).unwrap()).unwrap();
        let sources = docs(&ids);
        let mut target: BTreeSet<String> = BTreeSet::new();
        target.extend(pipeline.apply_batch(&sources).into_iter().map(|d| d.id));
        let after_first = target.len();
        target.extend(pipeline.apply_batch(&sources).into_iter().map(|d| d.id));
        prop_assert_eq!(target.len(), after_first);
    }

    #[test]
    fn resume_yields_the_tail(factor in arb_factor(), skip in 0u64..16) {
        let spec = TransformSpec::multiply(factor).unwrap();
        let pipeline = TransformerPipeline::new(spec).unwrap();
        let source = Document::new("idx", "src", json!({"v": 1}));
        let full: Vec<Document> = pipeline.apply(&source).collect();
        let tail: Vec<Document> = pipeline.apply(&source).resume_from(skip).collect();
        let start = usize::try_from(skip.min(factor)).unwrap();
        prop_assert_eq!(&tail[..], &full[start..]);
    }

    #[test]
    fn overrides_apply_to_every_copy(ids in arb_ids(), factor in arb_factor(), tag in "[a-z]{1,6}") {
        let mut overrides = Map::new();
        overrides.insert("tag".to_string(), Value::String(tag.clone()));
        let spec = TransformSpec::Multiply {
            factor,
            id_separator: "_".to_string(),
            overrides,
        };
        let pipeline = TransformerPipeline::new(spec).unwrap();
        for doc in pipeline.apply_batch(&docs(&ids)) {
            prop_assert_eq!(doc.source["tag"].as_str(), Some(tag.as_str()));
            prop_assert!(doc.source.get("title").is_some());
            prop_assert!(doc.source.get("value").is_some());
        }
    }

    #[test]
    fn declared_factor_constant_resolves(n in 1u64..5000) {
        let script = format!(
            "const MULTIPLICATION_FACTOR = {n};\nfor (let i = 0; i < MULTIPLICATION_FACTOR; i++) {{}}"
        );
        prop_assert_eq!(script_factor(&script), Some(n));

        let inclusive = format!("const N = {n};\nfor (let i = 0; i <= N; i++) {{}}");
        prop_assert_eq!(script_factor(&inclusive), Some(n + 1));
    }

    #[test]
    fn bindings_factor_wins_over_script(n in 1u64..100, script_n in 1u64..100) {
        let loader = TransformConfigLoader::from_config(TransformConfig {
            initialization_script: format!("const MULTIPLICATION_FACTOR = {script_n};"),
            bindings_object: json!({"multiplicationFactor": n}),
        });
        prop_assert_eq!(loader.resolve().unwrap().factor(), n);
    }
}
