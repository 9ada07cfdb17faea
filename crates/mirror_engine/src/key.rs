use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters that name the media format, checked in order.
const FORMAT_PARAMS: &[&str] = &["wx_fmt", "format", "fmt"];

const DEFAULT_EXTENSION: &str = "jpg";

/// Storage key for one mirrored media URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key: String,
    pub inferred_extension: String,
}

/// Map a media URL to its cache key, or `None` when the host is not allow-listed.
///
/// Key layout: `{host with '.' as '_'}/{path without leading '/'}.{extension}`.
/// Pure: no I/O, same input always yields the same key.
pub fn derive_key<S: AsRef<str>>(url: &str, allowed_host_suffixes: &[S]) -> Option<CacheKey> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    if !host_is_allowed(&host, allowed_host_suffixes) {
        return None;
    }

    let prefix = host.replace('.', "_");
    let path = parsed.path().trim_matches('/');
    let path = if path.is_empty() {
        short_hash(url, 8)
    } else {
        path.to_string()
    };
    let extension = infer_extension(&parsed);

    Some(CacheKey {
        key: format!("{prefix}/{path}.{extension}"),
        inferred_extension: extension.to_string(),
    })
}

/// True when `host` equals an allowed suffix or ends with `.{suffix}`.
pub fn host_is_allowed<S: AsRef<str>>(host: &str, allowed_host_suffixes: &[S]) -> bool {
    allowed_host_suffixes.iter().any(|suffix| {
        let suffix = suffix.as_ref().trim_start_matches('.');
        if suffix.is_empty() {
            return false;
        }
        let (host, suffix) = (host.as_bytes(), suffix.as_bytes());
        host.eq_ignore_ascii_case(suffix)
            || (host.len() > suffix.len()
                && host[host.len() - suffix.len() - 1] == b'.'
                && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix))
    })
}

fn infer_extension(url: &Url) -> &'static str {
    for param in FORMAT_PARAMS {
        let explicit = url
            .query_pairs()
            .find(|(name, _)| name == *param)
            .and_then(|(_, value)| format_extension(&value));
        if let Some(ext) = explicit {
            return ext;
        }
    }

    // Path hint such as `sz_mmbiz_png`.
    let hinted = url.path_segments().and_then(|mut segments| {
        segments.find_map(|segment| segment.rsplit('_').next().and_then(format_extension))
    });
    hinted.unwrap_or(DEFAULT_EXTENSION)
}

fn format_extension(format: &str) -> Option<&'static str> {
    let ext = match format.to_ascii_lowercase().as_str() {
        "png" => "png",
        "jpg" | "jpeg" => "jpg",
        "gif" => "gif",
        "webp" => "webp",
        "bmp" => "bmp",
        "svg" => "svg",
        "avif" => "avif",
        _ => return None,
    };
    Some(ext)
}

/// Lowercase hex of the first `bytes` bytes of the SHA-256 digest.
pub(crate) fn short_hash(input: &str, bytes: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(bytes * 2);
    for byte in digest.iter().take(bytes) {
        use std::fmt::Write;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
