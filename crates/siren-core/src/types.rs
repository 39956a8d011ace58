//! Shared identifiers, validators and helpers.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, SirenError};

/// Maximum length of any identifier (device id, user id).
pub const MAX_ID_LENGTH: usize = 128;

/// Maximum length of a display or contact name.
pub const MAX_NAME_LENGTH: usize = 100;

/// Maximum length of a push token.
pub const MAX_TOKEN_LENGTH: usize = 512;

/// Length of an authentication code.
pub const CODE_LENGTH: usize = 6;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:\-]*$").expect("valid identifier regex"));

static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{6}$").expect("valid code regex"));

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_:.\-]+$").expect("valid token regex"));

/// Returns `true` for an opaque identifier such as a firmware UUID or user id.
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    value.len() <= MAX_ID_LENGTH && IDENTIFIER_RE.is_match(value)
}

/// Returns `true` for a six-digit authentication code.
#[must_use]
pub fn is_valid_code_format(value: &str) -> bool {
    CODE_RE.is_match(value)
}

/// Returns `true` for a plausible push token (APNs hex, FCM registration id).
#[must_use]
pub fn is_valid_push_token(value: &str) -> bool {
    value.len() <= MAX_TOKEN_LENGTH && TOKEN_RE.is_match(value)
}

/// Validate an identifier field.
///
/// # Errors
///
/// Returns [`SirenError::Validation`] naming `field`.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(SirenError::validation(field, "must not be empty"));
    }
    if !is_valid_identifier(value) {
        return Err(SirenError::validation(
            field,
            format!("must be at most {MAX_ID_LENGTH} letters, digits, '.', '_', ':' or '-'"),
        ));
    }
    Ok(())
}

/// Validate a human-readable name, returning it trimmed.
///
/// # Errors
///
/// Returns [`SirenError::Validation`] if the name is blank or too long.
pub fn validate_name(field: &'static str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SirenError::validation(field, "must not be empty"));
    }
    let len = trimmed.chars().count();
    if len > MAX_NAME_LENGTH {
        return Err(SirenError::validation(
            field,
            format!("must be at most {MAX_NAME_LENGTH} characters (got {len})"),
        ));
    }
    Ok(trimmed.to_string())
}

/// Validate a push token.
///
/// # Errors
///
/// Returns [`SirenError::Validation`] if the token is empty or malformed.
pub fn validate_push_token(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(SirenError::validation("apns_token", "must not be empty"));
    }
    if !is_valid_push_token(value) {
        return Err(SirenError::validation(
            "apns_token",
            "contains characters not allowed in a push token",
        ));
    }
    Ok(())
}

/// Shortened form of a push token safe to write to logs.
#[must_use]
pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    if prefix.len() < token.len() {
        format!("{prefix}…")
    } else {
        prefix
    }
}

/// Treats empty and whitespace-only strings as absent.
#[must_use]
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("6E400001-B5A3-F393-E0A9-E50E24DCCA9E"));
        assert!(is_valid_identifier("user123"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("-leading-dash"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier(&"a".repeat(MAX_ID_LENGTH + 1)));
    }

    #[test]
    fn test_code_format() {
        assert!(is_valid_code_format("483920"));
        assert!(is_valid_code_format("000001"));
        assert!(!is_valid_code_format("48392"));
        assert!(!is_valid_code_format("48392a"));
        assert!(!is_valid_code_format("4839201"));
    }

    #[test]
    fn test_validate_name_trims() {
        assert_eq!(validate_name("name", "  Mom ").unwrap(), "Mom");
        assert!(validate_name("name", "   ").is_err());
        assert!(validate_name("name", &"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_push_token_validation() {
        assert!(validate_push_token("a1b2c3d4e5f6").is_ok());
        assert!(validate_push_token("fcm:APA91bH-x_y.z").is_ok());
        assert!(validate_push_token("").is_err());
        assert!(validate_push_token("bad token").is_err());
    }

    #[test]
    fn test_redact_token() {
        assert_eq!(redact_token("abcdef0123456789"), "abcdef01…");
        assert_eq!(redact_token("short"), "short");
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank(Some(String::new())), None);
        assert_eq!(non_blank(Some("  ".into())), None);
        assert_eq!(non_blank(Some("x".into())), Some("x".into()));
    }
}
