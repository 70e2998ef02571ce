#![no_main]

use gantry_sanitizer::{CommandSanitizer, SanitizerPolicy};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(sanitizer) = CommandSanitizer::new(SanitizerPolicy::default()) else {
        return;
    };
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    if let Ok(encoded) = sanitizer.sanitize_structured(&value) {
        assert!(!encoded.contains('\n'));
        assert!(serde_json::from_str::<Value>(&encoded).is_ok());
    }
});
