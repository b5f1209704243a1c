//! Environment variable helpers shared by every `from_env()` constructor.

use std::str::FromStr;

/// Read a variable, treating empty values as unset.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First non-empty variable among `keys`.
pub fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| env_string(key))
}

/// Parse a variable, falling back to `default` when unset or unparsable.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
