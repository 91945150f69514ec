//! Content normalization: charset decoding, markup sanitization, and
//! best-effort text/number/date/duration extraction.
//!
//! Extraction helpers return `Option` rather than erroring; "not found" is
//! an expected outcome for scraped text, not an exceptional one.

use std::time::Duration;

use chrono::NaiveDate;
use encoding_rs::{Encoding, UTF_8};
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::Html;

static CHARSET_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"charset=[\s'\x22]*([A-Za-z0-9_\-]+)")
        .case_insensitive(true)
        .build()
        .expect("invalid charset regex")
});

/// Decode raw body bytes using the Content-Type charset, falling back to
/// UTF-8. Never fails; undecodable sequences are replaced.
pub fn decode(bytes: &[u8], headers: &HeaderMap) -> String {
    let encoding = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|content_type| CHARSET_RE.captures(content_type))
        .and_then(|caps| caps.get(1))
        .and_then(|label| Encoding::for_label(label.as_str().as_bytes()))
        .unwrap_or(UTF_8);

    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        log::debug!("lossy decode with charset {}", encoding.name());
    }
    text.into_owned()
}

// Subtrees that never carry content worth keeping. No backreferences in the
// regex crate, so each pair is spelled out.
static STRIP_SUBTREES_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"<script\b[^>]*>.*?</script>|<style\b[^>]*>.*?</style>|<iframe\b[^>]*>.*?</iframe>|<noscript\b[^>]*>.*?</noscript>|<object\b[^>]*>.*?</object>|<embed\b[^>]*/?>|<(?:script|iframe)\b[^>]*/>",
    )
    .case_insensitive(true)
    .dot_matches_new_line(true)
    .build()
    .expect("invalid subtree strip regex")
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"<([a-z][a-z0-9]*)((?:\s[^<>]*)?)(/?)>")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid tag regex")
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"([a-z][a-z0-9\-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .case_insensitive(true)
        .build()
        .expect("invalid attribute regex")
});

/// Attributes allowed to survive sanitization, per element type.
fn allowed_attributes(tag: &str) -> &'static [&'static str] {
    match tag {
        "a" => &["href", "title"],
        "img" => &["src", "alt", "title"],
        _ => &[],
    }
}

/// Remove script/iframe-style subtrees and strip every attribute not on the
/// per-element allow-list.
pub fn sanitize(markup: &str) -> String {
    let stripped = STRIP_SUBTREES_RE.replace_all(markup, "");

    TAG_RE
        .replace_all(&stripped, |caps: &regex::Captures<'_>| {
            let tag = caps[1].to_lowercase();
            let attrs = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let self_close = &caps[3];

            let allowed = allowed_attributes(&tag);
            let mut rebuilt = format!("<{tag}");
            if !allowed.is_empty() {
                for attr in ATTR_RE.captures_iter(attrs) {
                    let name = attr[1].to_lowercase();
                    if !allowed.contains(&name.as_str()) {
                        continue;
                    }
                    let value = attr
                        .get(2)
                        .or_else(|| attr.get(3))
                        .or_else(|| attr.get(4))
                        .map(|m| m.as_str())
                        .unwrap_or("");
                    rebuilt.push(' ');
                    rebuilt.push_str(&name);
                    rebuilt.push_str("=\"");
                    rebuilt.push_str(&html_escape::encode_double_quoted_attribute(value));
                    rebuilt.push('"');
                }
            }
            if !self_close.is_empty() {
                rebuilt.push_str(" /");
            }
            rebuilt.push('>');
            rebuilt
        })
        .into_owned()
}

/// Tag-stripped text content of a markup fragment, whitespace-normalized.
pub fn text_content(markup: &str) -> String {
    let document = Html::parse_document(markup);
    let text: String = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    clean_text(&text)
}

/// Collapse internal whitespace/newlines to single spaces and trim the ends.
/// Idempotent.
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d+(?:[.,]\d+)?").expect("invalid number regex"));

/// First numeric token in the string, if any.
pub fn extract_number(s: &str) -> Option<f64> {
    let token = NUMBER_RE.find(s)?.as_str().replace(',', ".");
    token.parse().ok()
}

static YMD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})").expect("invalid ymd regex"));
static DMY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})[-/.](\d{1,2})[-/.](\d{4})").expect("invalid dmy regex"));

/// First recognizable calendar date. Year-first forms win over day-first.
pub fn extract_date(s: &str) -> Option<NaiveDate> {
    if let Some(caps) = YMD_RE.captures(s) {
        let (y, m, d) = (parse_u32(&caps[1])?, parse_u32(&caps[2])?, parse_u32(&caps[3])?);
        if let Some(date) = NaiveDate::from_ymd_opt(y as i32, m, d) {
            return Some(date);
        }
    }
    if let Some(caps) = DMY_RE.captures(s) {
        let (d, m, y) = (parse_u32(&caps[1])?, parse_u32(&caps[2])?, parse_u32(&caps[3])?);
        if let Some(date) = NaiveDate::from_ymd_opt(y as i32, m, d) {
            return Some(date);
        }
    }
    None
}

fn parse_u32(s: &str) -> Option<u32> {
    s.parse().ok()
}

static CLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3}):(\d{2})(?::(\d{2}))?\b").expect("invalid clock regex"));
static UNIT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(\d+)\s*(hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)\b")
        .case_insensitive(true)
        .build()
        .expect("invalid duration unit regex")
});

/// Best-effort duration extraction. Understands `HH:MM[:SS]` clock forms and
/// unit-suffixed spans like `120 min` or `1h 30m`.
pub fn extract_duration(s: &str) -> Option<Duration> {
    if let Some(caps) = CLOCK_RE.captures(s) {
        let first: u64 = caps[1].parse().ok()?;
        let second: u64 = caps[2].parse().ok()?;
        let total = match caps.get(3) {
            Some(secs) => first * 3600 + second * 60 + secs.as_str().parse::<u64>().ok()?,
            // Two-part clock forms read as minutes:seconds only make sense
            // for trailers; metadata runtimes are hours:minutes.
            None => first * 3600 + second * 60,
        };
        return Some(Duration::from_secs(total));
    }

    let mut total = 0u64;
    for caps in UNIT_RE.captures_iter(s) {
        let amount: u64 = caps[1].parse().ok()?;
        let unit = caps[2].to_lowercase();
        total += match unit.as_str() {
            u if u.starts_with('h') => amount * 3600,
            u if u.starts_with('m') => amount * 60,
            _ => amount,
        };
    }
    (total > 0).then(|| Duration::from_secs(total))
}
