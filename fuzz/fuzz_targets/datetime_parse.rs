#![no_main]

use agblogger_datetime::{SiteTz, format_canonical, parse};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let tz = SiteTz::utc();
    if let Ok(instant) = parse(text, &tz) {
        // Anything that parses must format canonically and reparse to the
        // same instant.
        let canonical = format_canonical(&instant);
        let reparsed = parse(&canonical, &tz).expect("canonical output must parse");
        assert_eq!(instant, reparsed);
    }
});
