//! Relay configuration, loaded from environment variables.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Static device fingerprint attached to every signed upstream request.
///
/// The four values are captured once from a real browser session and
/// reused verbatim; the upstream ties its signature check to them.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub device_id: String,
    pub fp: String,
    pub web_id: String,
    pub tea_uuid: String,
}

impl Fingerprint {
    /// Query parameters for this fingerprint, in declaration order.
    /// Callers sort before serializing.
    pub fn as_params(&self) -> [(&'static str, &str); 4] {
        [
            ("device_id", &self.device_id),
            ("fp", &self.fp),
            ("web_id", &self.web_id),
            ("tea_uuid", &self.tea_uuid),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port the HTTP API listens on.
    pub port: u16,
    /// Connect timeout for upstream requests.
    pub request_timeout: Duration,
    /// How long a cached conversation id stays valid without being used.
    pub session_ttl: Duration,
    /// DevTools port the managed Chrome listens on.
    pub chrome_debug_port: u16,
    /// Whether to launch Chrome headless.
    pub headless: bool,
    /// Account cookies, one per upstream account.
    pub cookies: Vec<String>,
    pub fingerprint: Fingerprint,
    /// Exposed model id -> upstream bot id.
    pub model_mapping: HashMap<String, String>,
    pub default_model: String,
}

impl RelayConfig {
    /// Load configuration from the environment.
    ///
    /// Cookies come from `DOUBAO_COOKIE_1`, `DOUBAO_COOKIE_2`, ... scanned
    /// until the first gap; at least one is required. The four fingerprint
    /// variables are all required. Numeric overrides fall back to their
    /// defaults only when unset; a set-but-unparsable value is an error.
    pub fn from_env() -> crate::Result<Self> {
        let mut cookies = Vec::new();
        let mut index = 1;
        while let Ok(cookie) = std::env::var(format!("DOUBAO_COOKIE_{index}")) {
            if cookie.trim().is_empty() {
                break;
            }
            cookies.push(cookie);
            index += 1;
        }
        if cookies.is_empty() {
            return Err(Error::Config(
                "at least one DOUBAO_COOKIE_<n> variable is required (e.g. DOUBAO_COOKIE_1)"
                    .into(),
            ));
        }

        let fingerprint = Fingerprint {
            device_id: require_env("DOUBAO_DEVICE_ID")?,
            fp: require_env("DOUBAO_FP")?,
            web_id: require_env("DOUBAO_WEB_ID")?,
            tea_uuid: require_env("DOUBAO_TEA_UUID")?,
        };

        let model_mapping = match std::env::var("DOUBAO_MODEL_MAPPING") {
            Ok(raw) => serde_json::from_str::<HashMap<String, String>>(&raw)
                .map_err(|e| Error::Config(format!("DOUBAO_MODEL_MAPPING is not valid JSON: {e}")))?,
            Err(_) => default_models(),
        };

        Ok(RelayConfig {
            port: env_or("PORT", 9102)?,
            request_timeout: Duration::from_secs(env_or("API_REQUEST_TIMEOUT", 180)?),
            session_ttl: Duration::from_secs(env_or("SESSION_CACHE_TTL", 3600)?),
            chrome_debug_port: env_or("CHROME_DEBUG_PORT", 9222)?,
            headless: std::env::var("CHROME_HEADLESS")
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
            cookies,
            fingerprint,
            model_mapping,
            default_model: std::env::var("DEFAULT_MODEL")
                .unwrap_or_else(|_| "doubao-pro-chat".into()),
        })
    }
}

/// Built-in model table used when `DOUBAO_MODEL_MAPPING` is unset.
pub fn default_models() -> HashMap<String, String> {
    let mut models = HashMap::new();
    models.insert("doubao-pro-chat".to_string(), "7338286299411103781".to_string());
    models
}

fn require_env(key: &str) -> crate::Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("{key} must be set")))
}

fn env_or<T: FromStr>(key: &str, default: T) -> crate::Result<T> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} is not a valid number: {value}"))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_models_has_pro_chat() {
        let models = default_models();
        assert_eq!(
            models.get("doubao-pro-chat").map(String::as_str),
            Some("7338286299411103781")
        );
    }

    #[test]
    fn test_fingerprint_params_keys() {
        let fp = Fingerprint {
            device_id: "d".into(),
            fp: "f".into(),
            web_id: "w".into(),
            tea_uuid: "t".into(),
        };
        let keys: Vec<&str> = fp.as_params().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["device_id", "fp", "web_id", "tea_uuid"]);
    }

    #[test]
    fn test_parse_bool_rejects_off_spellings() {
        assert!(!parse_bool("false"));
        assert!(!parse_bool("FALSE"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(" no "));
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool("anything-else"));
    }

    // Each test owns a distinct variable name; the environment is
    // process-global.

    #[test]
    fn test_env_or_defaults_when_unset() {
        assert_eq!(env_or("DOUBAO_UNSET_PORT", 9102u16).unwrap(), 9102);
    }

    #[test]
    fn test_env_or_parses_set_values() {
        std::env::set_var("DOUBAO_GOOD_PORT", " 9200 ");
        assert_eq!(env_or("DOUBAO_GOOD_PORT", 9102u16).unwrap(), 9200);
    }

    #[test]
    fn test_env_or_rejects_unparsable_values() {
        std::env::set_var("DOUBAO_BAD_PORT", "ninety-two");
        let err = env_or("DOUBAO_BAD_PORT", 9102u16).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("DOUBAO_BAD_PORT"));
        assert!(message.contains("ninety-two"));
    }
}
