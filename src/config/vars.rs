//! Environment variable interpolation for configuration files.
//!
//! Supports `${VAR}`, `${VAR:-default}` and the `$$` escape for a literal
//! dollar sign. Interpolation happens on the raw YAML text before parsing so
//! any field can be sourced from the environment.

use crate::error::{ConfigError, EnvInterpolationSnafu};
use regex::Regex;
use std::env;
use std::sync::LazyLock;

static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("interpolation pattern is valid")
});

/// Replace environment variable references in `input`.
///
/// Unset variables without a default are collected and reported together so a
/// config with several gaps fails once with the full list.
pub fn interpolate(input: &str) -> Result<String, ConfigError> {
    let mut missing: Vec<String> = Vec::new();
    let output = VAR_PATTERN.replace_all(input, |caps: &regex::Captures<'_>| {
        let Some(name) = caps.get(1) else {
            // The `$$` escape.
            return "$".to_string();
        };
        match env::var(name.as_str()) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.push(name.as_str().to_string());
                    String::new()
                }
            },
        }
    });
    if missing.is_empty() {
        Ok(output.into_owned())
    } else {
        EnvInterpolationSnafu {
            message: format!("unset variable(s): {}", missing.join(", ")),
        }
        .fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_set_variable() {
        env::set_var("TALLY_TEST_TOKEN", "abc123");
        let out = interpolate("token: ${TALLY_TEST_TOKEN}").unwrap();
        assert_eq!(out, "token: abc123");
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        env::remove_var("TALLY_TEST_UNSET");
        let out = interpolate("region: ${TALLY_TEST_UNSET:-asia-southeast1}").unwrap();
        assert_eq!(out, "region: asia-southeast1");
    }

    #[test]
    fn empty_default_is_allowed() {
        env::remove_var("TALLY_TEST_UNSET2");
        let out = interpolate("x: '${TALLY_TEST_UNSET2:-}'").unwrap();
        assert_eq!(out, "x: ''");
    }

    #[test]
    fn reports_all_missing_variables() {
        env::remove_var("TALLY_TEST_A");
        env::remove_var("TALLY_TEST_B");
        let err = interpolate("a: ${TALLY_TEST_A}\nb: ${TALLY_TEST_B}").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("TALLY_TEST_A"));
        assert!(message.contains("TALLY_TEST_B"));
    }

    #[test]
    fn double_dollar_escapes() {
        let out = interpolate("cost: $$100").unwrap();
        assert_eq!(out, "cost: $100");
    }

    #[test]
    fn plain_text_passes_through() {
        let out = interpolate("plain: value").unwrap();
        assert_eq!(out, "plain: value");
    }
}
