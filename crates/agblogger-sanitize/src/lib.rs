//! Allowlist-based HTML sanitizer.
//!
//! Every HTML string produced by the renderer passes through [`sanitize`]
//! before it leaves the process. The policy is a fixed allowlist of tags
//! and per-tag attributes; URL-bearing attributes must carry an approved
//! scheme; `<iframe>` survives only for the YouTube embed shapes and is
//! rewritten with a forced attribute set. Script-bearing constructs
//! (`<script>`, `on*` handlers, `style`) never survive.
//!
//! The sanitizer streams over the input once, keeping a stack of open
//! elements so that output stays balanced even when children are removed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sanitizer policy knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SanitizeOptions {
    /// Permit `data:image/{png,jpeg,gif,webp};base64,` URLs in `src`.
    #[serde(default)]
    pub allow_data_images: bool,
}

/// Tags whose entire content is dropped along with the tag.
const DROP_CONTENT_TAGS: &[&str] = &["script", "style", "noscript", "template", "object", "embed"];

/// Elements with no closing tag.
const VOID_TAGS: &[&str] = &["br", "hr", "img"];

/// URL-bearing attributes, vetted wherever they appear.
const URL_ATTRS: &[&str] = &["href", "src", "data-src"];

/// The forced attribute tail for surviving iframes.
const IFRAME_FORCED: &str = "allowfullscreen loading=\"lazy\" \
     referrerpolicy=\"no-referrer\" \
     sandbox=\"allow-scripts allow-same-origin allow-popups\"";

/// Allowed tags mapped to their allowed attributes.
fn allowed_attrs(tag: &str) -> Option<&'static [&'static str]> {
    Some(match tag {
        "p" | "blockquote" | "ul" | "ol" | "li" | "table" | "thead" | "tbody" | "tr" | "th"
        | "td" | "figure" | "figcaption" | "details" | "summary" | "hr" | "em" | "strong"
        | "br" | "sup" | "sub" | "del" | "mark" | "kbd" => &[],
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => &["id"],
        "div" | "span" | "code" | "pre" => &["class"],
        "a" => &["href", "title"],
        "img" => &["src", "alt", "title", "width", "height", "loading"],
        "iframe" => &["src"], // further restricted by the YouTube policy
        _ => return None,
    })
}

/// Sanitize rendered HTML with the default options.
pub fn sanitize(html: &str) -> String {
    sanitize_with(html, &SanitizeOptions::default())
}

/// Sanitize rendered HTML.
pub fn sanitize_with(html: &str, opts: &SanitizeOptions) -> String {
    let mut out = String::with_capacity(html.len());
    let mut open_stack: Vec<String> = Vec::new();
    let bytes = html.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let Some(lt) = html[pos..].find('<').map(|i| i + pos) else {
            out.push_str(&html[pos..]);
            break;
        };
        out.push_str(&html[pos..lt]);

        if html[lt..].starts_with("<!--") {
            // Comments are dropped wholesale.
            pos = html[lt..].find("-->").map(|i| lt + i + 3).unwrap_or(bytes.len());
            continue;
        }

        let Some(tag) = parse_tag(&html[lt..]) else {
            // A stray `<` that opens no tag: escape it and move on.
            out.push_str("&lt;");
            pos = lt + 1;
            continue;
        };
        let after_tag = lt + tag.source_len;

        if tag.closing {
            if let Some(depth) = open_stack.iter().rposition(|t| *t == tag.name) {
                // Close everything above the match so output stays nested.
                while open_stack.len() > depth {
                    let Some(t) = open_stack.pop() else { break };
                    out.push_str("</");
                    out.push_str(&t);
                    out.push('>');
                }
            }
            // Close tags for elements never opened are dropped.
            pos = after_tag;
            continue;
        }

        if DROP_CONTENT_TAGS.contains(&tag.name.as_str()) {
            pos = if tag.self_closing {
                after_tag
            } else {
                skip_element_content(html, after_tag, &tag.name)
            };
            continue;
        }

        if tag.name == "iframe" {
            if let Some(src) = vetted_iframe_src(&tag.attrs) {
                out.push_str(&format!("<iframe src=\"{}\" {IFRAME_FORCED}></iframe>", src));
            }
            pos = if tag.self_closing {
                after_tag
            } else {
                skip_element_content(html, after_tag, "iframe")
            };
            continue;
        }

        let Some(allowed) = allowed_attrs(&tag.name) else {
            // Unknown tag: drop the tag, keep its children.
            pos = after_tag;
            continue;
        };

        out.push('<');
        out.push_str(&tag.name);
        for (name, value) in &tag.attrs {
            if name.starts_with("on") || !allowed.contains(&name.as_str()) {
                continue;
            }
            if URL_ATTRS.contains(&name.as_str()) && !is_safe_url(value, opts) {
                continue;
            }
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        }
        let void = VOID_TAGS.contains(&tag.name.as_str());
        if void {
            out.push_str(" />");
        } else {
            out.push('>');
            if !tag.self_closing {
                open_stack.push(tag.name.clone());
            } else {
                out.push_str("</");
                out.push_str(&tag.name);
                out.push('>');
            }
        }
        pos = after_tag;
    }

    // Balance whatever was left open, innermost first, so a truncated or
    // mangled document cannot leak an unclosed element into the page shell.
    while let Some(tag) = open_stack.pop() {
        out.push_str("</");
        out.push_str(&tag);
        out.push('>');
    }
    out
}

#[derive(Debug)]
struct Tag {
    name: String,
    closing: bool,
    self_closing: bool,
    attrs: BTreeMap<String, String>,
    /// Bytes consumed from `<` through `>`.
    source_len: usize,
}

/// Parse one tag starting at a `<`. Returns `None` when the text does not
/// form a tag.
fn parse_tag(input: &str) -> Option<Tag> {
    let mut chars = input.char_indices().peekable();
    let (_, open) = chars.next()?;
    debug_assert_eq!(open, '<');

    let mut closing = false;
    if let Some((_, '/')) = chars.peek() {
        closing = true;
        chars.next();
    }

    // Tag name: ASCII letters then letters/digits.
    let mut name = String::new();
    while let Some((_, c)) = chars.peek() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
            chars.next();
        } else {
            break;
        }
    }
    if name.is_empty() || !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let mut attrs = BTreeMap::new();
    let mut self_closing = false;
    loop {
        // Skip whitespace.
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek().copied() {
            None => return None, // unterminated tag
            Some((i, '>')) => {
                chars.next();
                return Some(Tag { name, closing, self_closing, attrs, source_len: i + 1 });
            }
            Some((_, '/')) => {
                self_closing = true;
                chars.next();
            }
            Some((_, _)) => {
                let (attr_name, attr_value) = parse_attr(&mut chars)?;
                if !attr_name.is_empty() {
                    attrs.entry(attr_name).or_insert(attr_value);
                }
            }
        }
    }
}

type CharStream<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn parse_attr(chars: &mut CharStream<'_>) -> Option<(String, String)> {
    let mut name = String::new();
    while let Some((_, c)) = chars.peek().copied() {
        if c == '=' || c == '>' || c == '/' || c.is_whitespace() {
            break;
        }
        name.push(c.to_ascii_lowercase());
        chars.next();
    }
    if name.is_empty() {
        // Swallow one junk character to guarantee progress.
        chars.next();
        return Some((String::new(), String::new()));
    }
    while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
        chars.next();
    }
    let Some((_, '=')) = chars.peek().copied() else {
        return Some((name, String::new())); // bare attribute
    };
    chars.next();
    while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
        chars.next();
    }
    let mut value = String::new();
    match chars.peek().copied() {
        Some((_, quote @ ('"' | '\''))) => {
            chars.next();
            loop {
                match chars.next() {
                    None => return None, // unterminated value
                    Some((_, c)) if c == quote => break,
                    Some((_, c)) => value.push(c),
                }
            }
        }
        _ => {
            while let Some((_, c)) = chars.peek().copied() {
                if c == '>' || c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
    }
    Some((name, decode_entities(&value)))
}

/// Skip to just past the close tag of `name`, dropping everything between.
/// Byte-wise ASCII-case-insensitive scan; tag names are ASCII.
fn skip_element_content(html: &str, from: usize, name: &str) -> usize {
    let bytes = html.as_bytes();
    let mut i = from;
    while i + 2 + name.len() <= bytes.len() {
        if bytes[i] == b'<'
            && bytes[i + 1] == b'/'
            && bytes[i + 2..i + 2 + name.len()].eq_ignore_ascii_case(name.as_bytes())
        {
            return html[i..].find('>').map(|j| i + j + 1).unwrap_or(html.len());
        }
        i += 1;
    }
    html.len()
}

/// The YouTube-only iframe policy: return the vetted src or `None`.
fn vetted_iframe_src(attrs: &BTreeMap<String, String>) -> Option<String> {
    let src = attrs.get("src")?.trim();
    let id = src
        .strip_prefix("https://www.youtube.com/embed/")
        .or_else(|| src.strip_prefix("https://www.youtube.com/shorts/"))
        .or_else(|| src.strip_prefix("https://www.youtube-nocookie.com/embed/"))?;
    let valid = id.len() == 11
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then(|| src.to_string())
}

/// Scheme vetting for URL-bearing attributes.
fn is_safe_url(value: &str, opts: &SanitizeOptions) -> bool {
    // Strip ASCII controls and whitespace, the classic `java\tscript:`
    // smuggling vector.
    let cleaned: String = value.chars().filter(|c| !c.is_ascii_control() && *c != ' ').collect();
    let lower = cleaned.to_lowercase();

    if opts.allow_data_images {
        for prefix in
            ["data:image/png;", "data:image/jpeg;", "data:image/gif;", "data:image/webp;"]
        {
            if lower.starts_with(prefix) {
                return true;
            }
        }
    }

    // Find a scheme: a `:` that appears before any `/`, `?`, or `#`.
    let scheme_end = lower.find(':');
    let first_delim = lower.find(['/', '?', '#']);
    match (scheme_end, first_delim) {
        (Some(colon), delim) if delim.is_none_or(|d| colon < d) => {
            matches!(&lower[..colon], "http" | "https" | "mailto")
        }
        // No scheme: relative path, scheme-relative, query, or fragment.
        _ => true,
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Minimal entity decoding for attribute values, enough to stop encoded
/// scheme smuggling (`javascript&#58;…`).
fn decode_entities(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn passes_plain_markup() {
        let html = "<p>Hello <em>world</em></p>";
        assert_eq!(sanitize(html), html);
    }

    #[test]
    fn strips_script_and_content() {
        let html = "<p>before</p><script>alert(1)</script><p>after</p>";
        assert_eq!(sanitize(html), "<p>before</p><p>after</p>");
    }

    #[test]
    fn strips_event_handlers() {
        let html = "<a href=\"https://example.com\" onclick=\"evil()\">x</a>";
        assert_eq!(sanitize(html), "<a href=\"https://example.com\">x</a>");
    }

    #[test]
    fn strips_style_attribute_and_element() {
        assert_eq!(
            sanitize("<div style=\"background:url(javascript:1)\">x</div>"),
            "<div>x</div>"
        );
        assert_eq!(sanitize("<style>p{}</style><p>x</p>"), "<p>x</p>");
    }

    #[test]
    fn rejects_javascript_urls() {
        for url in [
            "javascript:alert(1)",
            "JAVASCRIPT:alert(1)",
            "java\tscript:alert(1)",
            " javascript:alert(1)",
            "javascript&#58;alert(1)",
            "vbscript:x",
            "data:text/html;base64,x",
        ] {
            let html = format!("<a href=\"{url}\">x</a>");
            assert_eq!(sanitize(&html), "<a>x</a>", "url not rejected: {url}");
        }
    }

    #[test]
    fn accepts_safe_urls() {
        for url in [
            "https://example.com/a?b=c",
            "http://example.com",
            "mailto:a@b.c",
            "/relative/path",
            "relative.md",
            "#fragment",
            "//cdn.example.com/x.png",
        ] {
            let html = format!("<a href=\"{url}\">x</a>");
            assert!(sanitize(&html).contains("href"), "url rejected: {url}");
        }
    }

    #[test]
    fn data_images_gated_by_option() {
        let html = "<img src=\"data:image/png;base64,AAAA\" alt=\"x\">";
        assert!(!sanitize(html).contains("src"));
        let opts = SanitizeOptions { allow_data_images: true };
        assert!(sanitize_with(html, &opts).contains("data:image/png"));
    }

    #[test]
    fn iframe_youtube_rewritten_with_forced_attrs() {
        let html = "<iframe src=\"https://www.youtube.com/embed/dQw4w9WgXcQ\" \
                    width=\"640\" onload=\"evil()\"></iframe>";
        let out = sanitize(html);
        insta::assert_snapshot!(out, @r#"<iframe src="https://www.youtube.com/embed/dQw4w9WgXcQ" allowfullscreen loading="lazy" referrerpolicy="no-referrer" sandbox="allow-scripts allow-same-origin allow-popups"></iframe>"#);
    }

    #[test]
    fn iframe_shapes() {
        let ok = [
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ",
        ];
        for src in ok {
            let html = format!("<iframe src=\"{src}\"></iframe>");
            assert!(sanitize(&html).contains(src), "rejected {src}");
        }
        let bad = [
            "https://www.youtube.com/embed/short",              // not 11 chars
            "https://evil.com/embed/dQw4w9WgXcQ",               // wrong host
            "http://www.youtube.com/embed/dQw4w9WgXcQ",         // not https
            "https://www.youtube-nocookie.com/shorts/dQw4w9WgXcQ", // nocookie has no shorts form
            "https://www.youtube.com/embed/dQw4w9WgXcQ/extra",  // trailing path
        ];
        for src in bad {
            let html = format!("<iframe src=\"{src}\"></iframe>");
            assert_eq!(sanitize(&html), "", "accepted {src}");
        }
    }

    #[test]
    fn unknown_tags_drop_but_keep_children() {
        assert_eq!(sanitize("<custom><p>kept</p></custom>"), "<p>kept</p>");
    }

    #[test]
    fn balances_output_when_children_removed() {
        // The inner close tag belongs to a dropped element; output must
        // still balance.
        let out = sanitize("<div><p>one<div>two");
        assert_eq!(out, "<div><p>one<div>two</div></p></div>");
    }

    #[test]
    fn stray_close_tags_dropped() {
        assert_eq!(sanitize("</p>text</div>"), "text");
    }

    #[test]
    fn stray_lt_escaped() {
        assert_eq!(sanitize("a < b"), "a &lt; b");
        assert_eq!(sanitize("<3 hearts"), "&lt;3 hearts");
    }

    #[test]
    fn comments_dropped() {
        assert_eq!(sanitize("a<!-- secret -->b"), "ab");
    }

    #[test]
    fn img_keeps_allowed_attrs_only() {
        let html = "<img src=\"/images/x.png\" alt=\"pic\" data-track=\"1\" width=\"10\">";
        let out = sanitize(html);
        assert!(out.contains("src=\"/images/x.png\""));
        assert!(out.contains("alt=\"pic\""));
        assert!(out.contains("width=\"10\""));
        assert!(!out.contains("data-track"));
    }

    #[test]
    fn code_block_classes_survive() {
        let html = "<pre class=\"language-rust\"><code class=\"language-rust\">let x;</code></pre>";
        assert_eq!(sanitize(html), html);
    }

    #[test]
    fn attr_values_escaped_on_output() {
        let out = sanitize("<img alt='a\"b<c' src=\"/x.png\">");
        assert!(out.contains("alt=\"a&quot;b&lt;c\""));
    }

    proptest! {
        /// No input, however mangled, leaves a script element in the
        /// output.
        #[test]
        fn no_script_element_survives(input in ".{0,200}") {
            let out = sanitize(&input);
            prop_assert!(!out.to_lowercase().contains("<script"));
        }

        /// Handler attributes are never emitted, whatever their name.
        #[test]
        fn no_handler_attr_survives(
            suffix in "[a-z]{1,10}",
            value in "[a-zA-Z0-9()]{0,20}",
        ) {
            let html = format!("<p on{suffix}=\"{value}\">x</p>");
            prop_assert_eq!(sanitize(&html), "<p>x</p>");
        }

        /// Sanitizing is idempotent on its own output for simple inputs.
        #[test]
        fn idempotent_on_plain_paragraphs(text in "[a-zA-Z0-9 ]{0,80}") {
            let first = sanitize(&format!("<p>{text}</p>"));
            prop_assert_eq!(sanitize(&first), first.clone());
        }
    }
}
