#![no_main]

use gantry_sanitizer::{CommandSanitizer, SanitizerPolicy, DANGEROUS_CHARACTERS};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(sanitizer) = CommandSanitizer::new(SanitizerPolicy::default()) else {
        return;
    };
    let raw = String::from_utf8_lossy(data);
    let args = raw.split('\u{1f}').map(str::to_string).collect::<Vec<_>>();
    if let Ok(argv) = sanitizer.sanitize_strings("docker-mcp", "enable", &args) {
        assert_eq!(argv.len(), args.len() + 2);
        for token in &argv[2..] {
            assert!(!token.is_empty());
            assert!(!token.chars().any(|ch| DANGEROUS_CHARACTERS.contains(&ch)));
            assert!(!token.contains('\0'));
            assert!(!token.contains(".."));
        }
    }
});
