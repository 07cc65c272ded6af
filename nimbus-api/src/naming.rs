//! VM name pipeline: sanitize, validate, suffix.
//!
//! Canonical names are DNS-safe: lowercase, digits and dashes, starting
//! with a letter. Uniqueness checks live in the VM service; this module
//! holds the pure parts.

use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

const MAX_NAME_LEN: usize = 40;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-z][a-z0-9-]*[a-z0-9]$").expect("valid pattern"))
}

/// Sanitize a raw name into DNS-safe form. Falls back to `vm` when
/// nothing survives.
pub fn sanitize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        match c {
            ' ' | '_' => out.push('-'),
            'a'..='z' | '0'..='9' | '-' => out.push(c),
            _ => {}
        }
    }
    // Collapse dash runs
    let mut collapsed = String::with_capacity(out.len());
    let mut prev_dash = false;
    for c in out.chars() {
        if c == '-' {
            if !prev_dash {
                collapsed.push(c);
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }
    let trimmed = collapsed.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    let truncated = truncated.trim_matches('-').to_string();
    if truncated.is_empty() {
        "vm".to_string()
    } else {
        truncated
    }
}

/// Validate a canonical name.
pub fn validate(name: &str) -> Result<(), String> {
    if name.len() < 2 || name.len() > MAX_NAME_LEN {
        return Err(format!(
            "name must be between 2 and {} characters",
            MAX_NAME_LEN
        ));
    }
    if !name.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err("name must begin with a letter".to_string());
    }
    if name.ends_with('-') {
        return Err("name must not end with a dash".to_string());
    }
    if !name_pattern().is_match(name) {
        return Err("name may contain only lowercase letters, digits and dashes".to_string());
    }
    Ok(())
}

/// Random lowercase-hex suffix from the system CSPRNG.
pub fn hex_suffix(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = OsRng;
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Append a suffix, truncating the base so the result stays within the
/// length limit.
pub fn with_suffix(base: &str, suffix: &str) -> String {
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len() + 1);
    let base: String = base.chars().take(budget).collect();
    format!("{}-{}", base.trim_end_matches('-'), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_and_strips() {
        assert_eq!(sanitize("My Web_Server"), "my-web-server");
        assert_eq!(sanitize("héllo wörld!"), "hllo-wrld");
        assert_eq!(sanitize("--a--b--"), "a-b");
    }

    #[test]
    fn test_sanitize_truncates_to_limit() {
        let long = "a".repeat(100);
        assert_eq!(sanitize(&long).len(), 40);
    }

    #[test]
    fn test_sanitize_falls_back_to_vm() {
        assert_eq!(sanitize("!!!"), "vm");
        assert_eq!(sanitize(""), "vm");
        assert_eq!(sanitize("---"), "vm");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for raw in ["My Web_Server", "héllo wörld!", "--a--b--", "plain"] {
            let once = sanitize(raw);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn test_validate_rules() {
        assert!(validate("web-1").is_ok());
        assert!(validate("a1").is_ok());
        assert!(validate("x").is_err());
        assert!(validate("1web").is_err());
        assert!(validate("web-").is_err());
        assert!(validate("web server").is_err());
        assert!(validate(&"a".repeat(41)).is_err());
    }

    #[test]
    fn test_hex_suffix_shape() {
        let suffix = hex_suffix(8);
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_with_suffix_respects_limit() {
        let name = with_suffix(&"a".repeat(40), "abcd");
        assert!(name.len() <= 40);
        assert!(name.ends_with("-abcd"));
        assert!(validate(&name).is_ok());
    }
}
