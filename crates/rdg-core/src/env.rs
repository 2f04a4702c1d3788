//! Small helpers shared by the `from_env` constructors of every crate.

use std::str::FromStr;

/// Returns the variable when it is set to a non-blank value.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn env_flag(key: &str, default: bool) -> bool {
    env_opt(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes" | "on"))
        .unwrap_or(default)
}

/// Parses a comma-separated list of hours (`0..=23`), ignoring anything else.
pub fn parse_hour_list(raw: &str) -> Vec<u32> {
    let mut hours = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .filter(|h| *h < 24)
        .collect::<Vec<_>>();
    hours.sort_unstable();
    hours.dedup();
    hours
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_list_skips_garbage_and_out_of_range() {
        assert_eq!(parse_hour_list("5, 1,x,24,1,23"), vec![1, 5, 23]);
        assert!(parse_hour_list("").is_empty());
    }
}
