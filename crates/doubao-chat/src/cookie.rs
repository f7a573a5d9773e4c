//! Cookie header refresh with the rolling token.

use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};

static MS_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"msToken=[^;]+").expect("static pattern"));

/// Replace or append the `msToken` cookie in `base_cookie`.
///
/// The header sent upstream must carry the same token the signature was
/// built with, or the upstream rejects the pair. With no token captured
/// yet the cookie goes out unchanged.
pub fn with_current_token(base_cookie: &str, token: Option<&str>) -> String {
    let Some(token) = token else {
        tracing::warn!("no rolling token held; sending the cookie as configured");
        return base_cookie.to_string();
    };
    if base_cookie.contains("msToken=") {
        tracing::debug!("replacing msToken in cookie");
        MS_TOKEN_RE
            .replace_all(base_cookie, NoExpand(&format!("msToken={token}")))
            .into_owned()
    } else {
        tracing::debug!("appending msToken to cookie");
        format!("{}; msToken={token}", base_cookie.trim_matches(';'))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
