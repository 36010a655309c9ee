use std::str::FromStr;

use anyhow::Context;

pub(crate) fn required(name: &str) -> anyhow::Result<String> {
    optional(name).with_context(|| format!("environment variable `{name}` is not set"))
}

pub(crate) fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `true`/`TRUE`/`True` count as set; anything else is off.
pub(crate) fn flag(name: &str) -> bool {
    optional(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub(crate) fn integer<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("environment variable `{name}` is not a valid number")),
        None => Ok(default),
    }
}

/// Comma-separated list, entries trimmed, empties dropped.
pub(crate) fn list(name: &str) -> Vec<String> {
    optional(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
