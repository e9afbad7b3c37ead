#![no_main]

use agblogger_datetime::SiteTz;
use agblogger_frontmatter::FrontMatter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let tz = SiteTz::utc();
    // Splitting never panics; serializing the result and re-splitting is
    // stable.
    let (front, body) = FrontMatter::parse(text, &tz);
    let rendered = front.serialize(&body);
    let (front2, body2) = FrontMatter::parse(&rendered, &tz);
    assert_eq!(front, front2);
    assert_eq!(body, body2);
});
