use std::collections::BTreeSet;

use regex::Regex;

/// Characters that are never part of a URL but often stick to its end.
const TRAILING_NOISE: &[char] = &['.', ')', ']', ',', ';', '\'', '"'];

/// Finds media URLs on allow-listed origins.
pub trait ReferenceExtractor: Send + Sync {
    /// Union of the references found in the raw markup and in the converted text.
    fn collect_references(&self, raw_markup: &str, converted_text: &str) -> BTreeSet<String>;
}

/// Single-pattern extractor built from the allowed host suffixes.
///
/// A match stops at whitespace, quotes, angle brackets and the markdown
/// delimiters `(`, `)`, `[`, `]`, so images nested in links or placed back
/// to back yield one URL each.
#[derive(Debug, Clone)]
pub struct RegexReferenceExtractor {
    pattern: Option<Regex>,
}

impl RegexReferenceExtractor {
    pub fn new<S: AsRef<str>>(allowed_host_suffixes: &[S]) -> Self {
        let hosts: Vec<String> = allowed_host_suffixes
            .iter()
            .map(|suffix| suffix.as_ref().trim_start_matches('.'))
            .filter(|suffix| !suffix.is_empty())
            .map(regex::escape)
            .collect();
        if hosts.is_empty() {
            return Self { pattern: None };
        }

        let source = format!(
            r#"(?i)https?://(?:[a-z0-9-]+\.)*(?:{})(?::\d+)?/[^\s"'<>\\`()\[\]]*"#,
            hosts.join("|")
        );
        Self {
            pattern: Regex::new(&source).ok(),
        }
    }

    fn scan_into(&self, text: &str, found: &mut BTreeSet<String>) {
        let Some(pattern) = &self.pattern else {
            return;
        };
        for m in pattern.find_iter(text) {
            let url = m.as_str().trim_end_matches(TRAILING_NOISE);
            if !url.is_empty() {
                found.insert(url.to_string());
            }
        }
    }
}

impl ReferenceExtractor for RegexReferenceExtractor {
    fn collect_references(&self, raw_markup: &str, converted_text: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        self.scan_into(raw_markup, &mut found);
        self.scan_into(converted_text, &mut found);
        found
    }
}
