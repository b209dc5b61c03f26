#![no_main]

use backfill_core::cluster::Document;
use backfill_core::transform::{TransformConfigLoader, TransformerPipeline, script_factor};
use libfuzzer_sys::fuzz_target;
use serde_json::json;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    // Recognizing a factor must never panic on arbitrary script text.
    let _ = script_factor(raw);

    let Ok(loader) = TransformConfigLoader::from_json(raw) else {
        return;
    };
    let Ok(spec) = loader.resolve() else {
        return;
    };
    assert!(spec.factor() >= 1, "resolved spec with factor 0");

    // Keep the expansion small enough to run per input.
    if spec.factor() > 64 {
        return;
    }
    let pipeline = TransformerPipeline::new(spec.clone()).expect("resolved spec validates");
    let source = Document::new("idx", "doc", json!({"v": 1}));
    let copies: Vec<Document> = pipeline.apply(&source).collect();
    assert_eq!(copies.len() as u64, spec.factor());
    assert_eq!(copies[0].id, "doc");
});
