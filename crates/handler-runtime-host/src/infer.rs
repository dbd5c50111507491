//! Advisory capability inference.
//!
//! Scans handler source for the host API calls it appears to make and
//! returns the minimal token list that would cover them. Literal string
//! arguments infer concrete tokens; dynamic arguments widen to the
//! domain/action wildcard so the suggestion never under-reports.
//!
//! Strictly developer tooling: enforcement always uses the explicitly
//! granted list on the execution request, never this output.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use handler_runtime_common::Capability;

static STATE_READ_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bstate\s*\.\s*(?:get|has)\s*\(\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static STATE_READ_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bstate\s*\.\s*(?:get|has)\s*\(").unwrap());

static STATE_WRITE_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bstate\s*\.\s*(?:set|delete)\s*\(\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static STATE_WRITE_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bstate\s*\.\s*(?:set|delete)\s*\(").unwrap());

static STATE_KEYS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bstate\s*\.\s*keys\s*\(").unwrap());

static EVENTS_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bevents\s*\.\s*emit\s*\(\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static EVENTS_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bevents\s*\.\s*emit\s*\(").unwrap());

static VIEW_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bview\s*\.\s*update\s*\(\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static VIEW_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bview\s*\.\s*update\s*\(").unwrap());

static EXT_MEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bext\s*\.\s*([A-Za-z_$][A-Za-z0-9_$]*)\s*\.\s*[A-Za-z_$][A-Za-z0-9_$]*\s*\(")
        .unwrap()
});
static EXT_COMPUTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bext\s*\[").unwrap());

/// Infer the minimal capability token list for a handler source.
///
/// Returned tokens are deduplicated and sorted by canonical form.
pub fn infer_capabilities(source: &str) -> Vec<Capability> {
    let mut tokens: BTreeSet<String> = BTreeSet::new();

    scan_family(
        source,
        &STATE_READ_LITERAL,
        &STATE_READ_ANY,
        "state:read",
        &mut tokens,
    );
    scan_family(
        source,
        &STATE_WRITE_LITERAL,
        &STATE_WRITE_ANY,
        "state:write",
        &mut tokens,
    );
    scan_family(source, &EVENTS_LITERAL, &EVENTS_ANY, "events:emit", &mut tokens);
    scan_family(source, &VIEW_LITERAL, &VIEW_ANY, "view:update", &mut tokens);

    if STATE_KEYS.is_match(source) {
        tokens.insert("state:read:*".to_string());
    }

    for capture in EXT_MEMBER.captures_iter(source) {
        if let Some(name) = capture.get(1) {
            tokens.insert(format!("ext:{}", name.as_str()));
        }
    }
    if EXT_COMPUTED.is_match(source) {
        tokens.insert("ext:*".to_string());
    }

    tokens
        .into_iter()
        .filter_map(|raw| Capability::parse(&raw))
        .collect()
}

/// Collect concrete tokens for literal arguments; widen to the wildcard
/// when the family is also called with something non-literal.
fn scan_family(
    source: &str,
    literal: &Regex,
    any: &Regex,
    prefix: &str,
    tokens: &mut BTreeSet<String>,
) {
    let mut literal_count = 0usize;
    for capture in literal.captures_iter(source) {
        literal_count += 1;
        let scope = capture
            .get(1)
            .or_else(|| capture.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        if !scope.is_empty() {
            tokens.insert(format!("{prefix}:{scope}"));
        } else {
            tokens.insert(format!("{prefix}:*"));
        }
    }

    let total_count = any.find_iter(source).count();
    if total_count > literal_count {
        tokens.insert(format!("{prefix}:*"));
    }
}
