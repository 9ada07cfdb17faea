use regex::Regex;

use crate::key::derive_key;

/// Query fragment that may trail a media URL in converted text, e.g. `&amp;tp=webp`.
const TRAILING_QUERY_FRAGMENT: &str = "(?:(?:&amp;|&)[A-Za-z0-9_~%=+-]*)*";

/// Replace every allow-listed media URL in `text` with `{public_base_url}/{key}`.
///
/// Trailing `&…` / `&amp;…` query fragments are absorbed into the replacement.
/// URLs without a derivable key are left alone. Idempotent as long as the
/// public base URL is not itself on the allow-list.
pub fn rewrite<I, U, S>(text: &str, urls: I, public_base_url: &str, allowed_host_suffixes: &[S]) -> String
where
    I: IntoIterator<Item = U>,
    U: AsRef<str>,
    S: AsRef<str>,
{
    let base = public_base_url.trim_end_matches('/');
    let mut replacements: Vec<(String, String)> = urls
        .into_iter()
        .filter_map(|url| {
            let url = url.as_ref();
            derive_key(url, allowed_host_suffixes)
                .map(|key| (url.to_string(), format!("{base}/{}", key.key)))
        })
        .collect();
    // Longest first so a URL never clobbers a longer one it prefixes.
    replacements.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    replacements.dedup_by(|a, b| a.0 == b.0);

    let mut output = text.to_string();
    for (url, replacement) in &replacements {
        if let Some(pattern) = url_pattern(url) {
            output = replace_whole_matches(&output, &pattern, replacement);
        }
    }
    output
}

fn url_pattern(url: &str) -> Option<Regex> {
    let normalized = url.replace("&amp;", "&");
    let escaped = normalized
        .split('&')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("(?:&amp;|&)");
    Regex::new(&format!("{escaped}{TRAILING_QUERY_FRAGMENT}")).ok()
}

/// Replace matches that are not immediately followed by more URL characters.
fn replace_whole_matches(text: &str, pattern: &Regex, replacement: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut last = 0;
    for m in pattern.find_iter(text) {
        if continues_url(&text[m.end()..]) {
            continue;
        }
        output.push_str(&text[last..m.start()]);
        output.push_str(replacement);
        last = m.end();
    }
    output.push_str(&text[last..]);
    output
}

/// True when `rest` carries on the URL that just matched. A `.` only counts
/// when more URL text follows it, so sentence punctuation still ends a URL.
fn continues_url(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        Some('.') => chars.next().is_some_and(|c| c.is_ascii_alphanumeric()),
        Some(c) => {
            c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '%' | '~' | '=' | '?' | '#')
        }
        None => false,
    }
}
