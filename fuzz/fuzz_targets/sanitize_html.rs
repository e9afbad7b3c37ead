#![no_main]

use agblogger_sanitize::sanitize;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let out = sanitize(text);
    // No script element survives any input.
    assert!(!out.to_lowercase().contains("<script"));
});
