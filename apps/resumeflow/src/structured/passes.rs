//! Ordered text repairs applied to near-JSON model output before strict parsing.
//! Passes 2 to 5 only touch text outside string literals; quoted values are
//! copied through byte for byte.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

/// Upper bound on fixed-point iterations of the key-quote repair.
pub const MAX_FIXED_POINT_PASSES: usize = 5;

struct Patterns {
    bare_key: Regex,
    trailing_comma: Regex,
    escaped_key: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        bare_key: Regex::new(r"([{\[,]\s*)([A-Za-z0-9_]+)\s*:").expect("static pattern"),
        trailing_comma: Regex::new(r",(\s*[}\]])").expect("static pattern"),
        escaped_key: Regex::new(r#"\\?"([^"\\]+)\\?"\\?:"#).expect("static pattern"),
    })
}

/// Pass 1: the first `{` through the last `}`, dropping surrounding prose.
pub fn extract_outer_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Splits `text` into alternating runs outside and inside string literals.
/// An unterminated literal runs to the end of the text. A backslash outside a
/// literal escapes the next byte, so `\"key\"` stays outside.
fn literal_runs(text: &str) -> Vec<(bool, &str)> {
    let bytes = text.as_bytes();
    let mut runs = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'"' if in_string => {
                runs.push((true, &text[start..=i]));
                start = i + 1;
                in_string = false;
            }
            b'"' => {
                if start < i {
                    runs.push((false, &text[start..i]));
                }
                start = i;
                in_string = true;
            }
            _ => {}
        }
        i += 1;
    }
    if start < text.len() {
        runs.push((in_string, &text[start..]));
    }
    runs
}

/// Applies `repair` to every run outside string literals.
fn outside_literals<'a>(text: &'a str, repair: fn(&str) -> Cow<'_, str>) -> Cow<'a, str> {
    let mut out = String::with_capacity(text.len());
    let mut changed = false;
    for (in_string, run) in literal_runs(text) {
        if in_string {
            out.push_str(run);
            continue;
        }
        let repaired = repair(run);
        changed |= matches!(repaired, Cow::Owned(_));
        out.push_str(&repaired);
    }
    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(text)
    }
}

/// Pass 2: drops commas sitting between two digits (`120,000` -> `120000`).
pub fn remove_digit_separators(text: &str) -> Cow<'_, str> {
    outside_literals(text, drop_separators)
}

fn drop_separators(text: &str) -> Cow<'_, str> {
    let bytes = text.as_bytes();
    let is_separator = |i: usize| {
        bytes[i] == b','
            && i > 0
            && i + 1 < bytes.len()
            && bytes[i - 1].is_ascii_digit()
            && bytes[i + 1].is_ascii_digit()
    };
    if !(0..bytes.len()).any(is_separator) {
        return Cow::Borrowed(text);
    }
    // Separators and digits are ASCII, so dropping them keeps char boundaries intact.
    let kept: Vec<u8> = (0..bytes.len())
        .filter(|&i| !is_separator(i))
        .map(|i| bytes[i])
        .collect();
    Cow::Owned(String::from_utf8_lossy(&kept).into_owned())
}

/// Pass 3: `{title: 1}` -> `{"title": 1}`.
pub fn quote_bare_keys(text: &str) -> Cow<'_, str> {
    outside_literals(text, quote_run)
}

fn quote_run(run: &str) -> Cow<'_, str> {
    patterns().bare_key.replace_all(run, r#"$1"$2":"#)
}

/// Pass 4: `[1, 2,]` -> `[1, 2]`.
pub fn strip_trailing_commas(text: &str) -> Cow<'_, str> {
    outside_literals(text, strip_run)
}

fn strip_run(run: &str) -> Cow<'_, str> {
    patterns().trailing_comma.replace_all(run, "$1")
}

/// Pass 5: `\"company\":` -> `"company":`, repeated until nothing changes or
/// the iteration cap is reached.
pub fn unescape_key_quotes(text: &str) -> String {
    let mut current = text.to_string();
    for _ in 0..MAX_FIXED_POINT_PASSES {
        let next = outside_literals(&current, unescape_run);
        if let Cow::Borrowed(_) = next {
            break;
        }
        current = next.into_owned();
    }
    current
}

fn unescape_run(run: &str) -> Cow<'_, str> {
    patterns().escaped_key.replace_all(run, r#""$1":"#)
}
