//! Source address normalization.
//!
//! Two submissions of the same page must map to the same document, so the
//! address is parsed with [`url::Url`] and reduced to
//! `scheme://host[:port]/path`. Parsing lowercases the scheme and host,
//! resolves `.` and `..` path segments, and drops a port that is the
//! scheme's default. On top of that the query string, fragment, and any
//! userinfo are removed, and trailing slashes on the path are trimmed.
//! Normalization is the de-duplication key.

use url::Url;

/// Normalize a source address for storage and matching.
///
/// Inputs that do not parse as an absolute URL with a host are treated as
/// opaque identifiers: only the query, fragment, and trailing slashes are
/// stripped.
///
/// ```rust
/// use snapmind_core::address::normalize_address;
///
/// assert_eq!(
///     normalize_address("HTTPS://Docs.Example.com:443/guide/./?ref=nav#intro"),
///     "https://docs.example.com/guide"
/// );
/// ```
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    match Url::parse(address) {
        Ok(url) if url.has_host() && !url.cannot_be_a_base() => canonical(&url),
        _ => opaque(address),
    }
}

fn canonical(url: &Url) -> String {
    let mut out = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path().trim_end_matches('/'));
    out
}

fn opaque(address: &str) -> String {
    let without_fragment = address.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();
    without_query.trim_end_matches('/').to_string()
}
