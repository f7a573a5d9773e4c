//! Cookie header parsing for browser injection.

use serde::Serialize;

/// One cookie in the shape `Network.setCookie` expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CookieParam {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Split a raw `Cookie:` header into per-cookie parameters scoped to
/// `domain`. Segments without `=` and empty names are skipped.
pub fn parse_cookie_pairs(header: &str, domain: &str) -> Vec<CookieParam> {
    header
        .split(';')
        .filter_map(|segment| {
            let (name, value) = segment.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(CookieParam {
                name: name.to_string(),
                value: value.trim().to_string(),
                domain: domain.to_string(),
                path: "/".to_string(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
