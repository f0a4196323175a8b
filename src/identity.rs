//! Device identity normalization
//!
//! Devices are addressed either by a 12-hex-digit hardware (MAC) address or by a
//! 14-16 digit equipment number (IMEI). Both forms are folded into a canonical
//! key so that `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF` and `aabb.ccdd.eeff`
//! all name the same device.

use crate::error::IdentityError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static HARDWARE_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f:.\-]+$").expect("static regex"));

static HARDWARE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-F]{12}$").expect("static regex"));

/// How a session addresses its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    /// 12 hex digit hardware address
    #[default]
    Mac,
    /// 14-16 digit equipment identity number
    Imei,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mac => "mac",
            Self::Imei => "imei",
        }
    }

    /// Strictly normalize `raw` for this kind.
    pub fn normalize(&self, raw: &str) -> Result<String, IdentityError> {
        match self {
            Self::Mac => normalize_mac(raw),
            Self::Imei => normalize_imei(raw),
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mac" => Ok(Self::Mac),
            "imei" => Ok(Self::Imei),
            other => Err(IdentityError::UnknownKind(other.to_string())),
        }
    }
}

/// Canonical comparison key for a raw device identifier.
///
/// Hardware addresses (any mix of `:`, `-`, `.` separators and letter case)
/// become their 12 character uppercase form. Purely numeric 14-16 digit
/// equipment numbers are returned unchanged. Anything else is returned
/// unchanged as an opaque key.
pub fn normalize(raw: &str) -> String {
    if HARDWARE_CHARSET.is_match(raw) {
        let folded: String = raw
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect::<String>()
            .to_ascii_uppercase();
        if HARDWARE_KEY.is_match(&folded) {
            return folded;
        }
    }

    // Equipment numbers and opaque identifiers pass through untouched.
    // TODO: decide whether non-conforming identifiers should be rejected
    // instead of used as opaque keys; they currently collide only on exact match.
    raw.to_string()
}

/// Whether two raw identifiers name the same device.
pub fn equals(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Strict hardware address normalization.
///
/// Strips `:`, `-`, `.` and spaces, upper-cases, and requires exactly twelve
/// hex digits.
pub fn normalize_mac(raw: &str) -> Result<String, IdentityError> {
    let mac: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .collect::<String>()
        .to_ascii_uppercase();

    if mac.len() != 12 {
        return Err(IdentityError::MacLength(mac.len()));
    }
    if let Some(bad) = mac.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(IdentityError::MacCharacter(bad));
    }

    Ok(mac)
}

/// Strict equipment number validation (14-16 ASCII digits, returned as-is).
pub fn normalize_imei(raw: &str) -> Result<String, IdentityError> {
    if let Some(bad) = raw.chars().find(|c| !c.is_ascii_digit()) {
        return Err(IdentityError::ImeiCharacter(bad));
    }
    if !(14..=16).contains(&raw.len()) {
        return Err(IdentityError::ImeiLength(raw.len()));
    }
    Ok(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separator_spellings_collapse() {
        for raw in [
            "aa:bb:cc:dd:ee:ff",
            "AA-BB-CC-DD-EE-FF",
            "aabb.ccdd.eeff",
            "AaBbCcDdEeFf",
            "AABBCCDDEEFF",
        ] {
            assert_eq!(normalize(raw), "AABBCCDDEEFF", "input {raw}");
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["aa:bb:cc:dd:ee:ff", "861234567890123", "not-a-device", ""] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_imei_passthrough() {
        assert_eq!(normalize("861234567890123"), "861234567890123");
        assert_eq!(normalize("12345678901234"), "12345678901234");
    }

    #[test]
    fn test_opaque_fallback() {
        assert_eq!(normalize("gateway-7"), "gateway-7");
        // 11 hex digits after stripping is not a hardware address
        assert_eq!(normalize("aa:bb:cc:dd:ee:f"), "aa:bb:cc:dd:ee:f");
    }

    #[test]
    fn test_equals_is_reflexive_and_symmetric() {
        let pairs = [
            ("aa:bb:cc:dd:ee:ff", "AABBCCDDEEFF"),
            ("aa-bb-cc-dd-ee-ff", "aabb.ccdd.eeff"),
            ("861234567890123", "861234567890123"),
            ("aa:bb:cc:dd:ee:ff", "AABBCCDDEE00"),
        ];
        for (a, b) in pairs {
            assert!(equals(a, a));
            assert!(equals(b, b));
            assert_eq!(equals(a, b), equals(b, a));
            assert_eq!(equals(a, b), normalize(a) == normalize(b));
        }
    }

    #[test]
    fn test_strict_mac() {
        assert_eq!(normalize_mac("aa bb cc dd ee ff").unwrap(), "AABBCCDDEEFF");
        assert!(matches!(normalize_mac("AABB"), Err(IdentityError::MacLength(4))));
        assert!(matches!(
            normalize_mac("GGBBCCDDEEFF"),
            Err(IdentityError::MacCharacter('G'))
        ));
    }

    #[test]
    fn test_strict_imei() {
        assert_eq!(normalize_imei("861234567890123").unwrap(), "861234567890123");
        assert!(matches!(normalize_imei("1234"), Err(IdentityError::ImeiLength(4))));
        assert!(matches!(
            normalize_imei("86123456789012a"),
            Err(IdentityError::ImeiCharacter('a'))
        ));
    }

    #[test]
    fn test_identifier_kind_parse() {
        assert_eq!("mac".parse::<IdentifierKind>().unwrap(), IdentifierKind::Mac);
        assert_eq!("imei".parse::<IdentifierKind>().unwrap(), IdentifierKind::Imei);
        assert!("serial".parse::<IdentifierKind>().is_err());
    }
}
