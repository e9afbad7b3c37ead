#![no_main]

use agblogger_sync::is_syncable_rel_path;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if is_syncable_rel_path(text) {
        // Accepted paths never smuggle traversal or hidden segments.
        assert!(!text.contains(".."));
        assert!(!text.starts_with('/'));
        assert!(!text.split('/').any(|seg| seg.starts_with('.')));
    }
});
