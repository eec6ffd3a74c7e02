//! Versioned envelope strings: `"<tag>[:<key_id>]:<base64-ciphertext>"`.
//!
//! | tag      | key id | payload                                   | write path |
//! |----------|--------|-------------------------------------------|------------|
//! | `legacy` | no     | zstd-compressed plaintext, no encryption  | never      |
//! | `v1`     | no     | ciphertext under the implicit default key | yes        |
//! | `v2`     | yes    | ciphertext under the named registry key   | yes        |
//!
//! Parsing is strict and all-or-nothing. [`wrap`] takes a [`WrapVersion`],
//! which has no legacy variant, so a legacy envelope cannot be produced.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::CryptoError;

use crate::crypto::{NONCE_LEN, TAG_LEN};

/// Longest accepted key id.
pub const MAX_KEY_ID_LEN: usize = 64;

const SEPARATOR: char = ':';

/// Envelope format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionTag {
    Legacy,
    V1,
    V2,
}

impl VersionTag {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionTag::Legacy => "legacy",
            VersionTag::V1 => "v1",
            VersionTag::V2 => "v2",
        }
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionTag {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(VersionTag::Legacy),
            "v1" => Ok(VersionTag::V1),
            "v2" => Ok(VersionTag::V2),
            _ => Err(CryptoError::Parse("unrecognised version tag".into())),
        }
    }
}

/// Versions the write path may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapVersion<'a> {
    V1,
    V2 { key_id: &'a str },
}

/// A parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Pre-encryption payload: compressed plaintext.
    Legacy { payload: Vec<u8> },
    /// Encrypted under the implicit default key.
    V1 { ciphertext: Vec<u8> },
    /// Encrypted under `key_id`.
    V2 { key_id: String, ciphertext: Vec<u8> },
}

impl Envelope {
    /// Parse an envelope string.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Parse`] for an unknown tag, a wrong number of
    /// parts, an invalid key id, bad base64, or ciphertext too short to hold a
    /// nonce and tag.
    ///
    /// Parsing happens before the legacy-support check, so an empty `legacy:`
    /// body is a [`CryptoError::Parse`] even when legacy support is disabled.
    /// A non-empty legacy body parses either way and is refused later with
    /// [`CryptoError::MigrationRequired`].
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let (tag, rest) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| CryptoError::Parse("missing version tag".into()))?;

        match tag.parse::<VersionTag>()? {
            VersionTag::Legacy => {
                let payload = decode_body(rest)?;
                if payload.is_empty() {
                    return Err(CryptoError::Parse("empty legacy payload".into()));
                }
                Ok(Envelope::Legacy { payload })
            }
            VersionTag::V1 => Ok(Envelope::V1 {
                ciphertext: decode_ciphertext(rest)?,
            }),
            VersionTag::V2 => {
                let (key_id, body) = rest
                    .split_once(SEPARATOR)
                    .ok_or_else(|| CryptoError::Parse("v2 envelope missing key id".into()))?;
                validate_key_id(key_id)?;
                Ok(Envelope::V2 {
                    key_id: key_id.to_owned(),
                    ciphertext: decode_ciphertext(body)?,
                })
            }
        }
    }

    pub fn tag(&self) -> VersionTag {
        match self {
            Envelope::Legacy { .. } => VersionTag::Legacy,
            Envelope::V1 { .. } => VersionTag::V1,
            Envelope::V2 { .. } => VersionTag::V2,
        }
    }

    /// The explicit key id; only v2 envelopes carry one.
    pub fn key_id(&self) -> Option<&str> {
        match self {
            Envelope::V2 { key_id, .. } => Some(key_id.as_str()),
            _ => None,
        }
    }
}

/// Serialize ciphertext into an envelope string.
///
/// # Errors
///
/// Returns [`CryptoError::Parse`] if a v2 key id is not a valid key id, since
/// the result could not be parsed back.
pub fn wrap(version: WrapVersion<'_>, ciphertext: &[u8]) -> Result<String, CryptoError> {
    let body = URL_SAFE_NO_PAD.encode(ciphertext);
    match version {
        WrapVersion::V1 => Ok(format!("{}{SEPARATOR}{body}", VersionTag::V1)),
        WrapVersion::V2 { key_id } => {
            validate_key_id(key_id)?;
            Ok(format!("{}{SEPARATOR}{key_id}{SEPARATOR}{body}", VersionTag::V2))
        }
    }
}

/// Read only the key id of an envelope without decoding its body.
///
/// Used by rotation to skip records already on the target key.
pub fn peek_key_id(s: &str) -> Option<&str> {
    let rest = s.strip_prefix("v2:")?;
    let (key_id, _) = rest.split_once(SEPARATOR)?;
    is_valid_key_id(key_id).then_some(key_id)
}

/// Key ids are 1–64 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_key_id(key_id: &str) -> bool {
    !key_id.is_empty()
        && key_id.len() <= MAX_KEY_ID_LEN
        && key_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn validate_key_id(key_id: &str) -> Result<(), CryptoError> {
    if is_valid_key_id(key_id) {
        Ok(())
    } else {
        Err(CryptoError::Parse("invalid key id".into()))
    }
}

fn decode_body(body: &str) -> Result<Vec<u8>, CryptoError> {
    if body.contains(SEPARATOR) {
        return Err(CryptoError::Parse("unexpected extra envelope part".into()));
    }
    URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|_| CryptoError::Parse("payload is not valid base64".into()))
}

fn decode_ciphertext(body: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = decode_body(body)?;
    if bytes.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Parse("ciphertext too short".into()));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ct() -> Vec<u8> {
        (0u8..40).collect()
    }

    #[test]
    fn v2_wrap_parse_round_trip() {
        let s = wrap(
            WrapVersion::V2 {
                key_id: "key_20250927_153045_b7c2",
            },
            &sample_ct(),
        )
        .unwrap();
        assert!(s.starts_with("v2:key_20250927_153045_b7c2:"));
        let env = Envelope::parse(&s).unwrap();
        assert_eq!(env.tag(), VersionTag::V2);
        assert_eq!(env.key_id(), Some("key_20250927_153045_b7c2"));
        assert_eq!(
            env,
            Envelope::V2 {
                key_id: "key_20250927_153045_b7c2".into(),
                ciphertext: sample_ct()
            }
        );
    }

    #[test]
    fn v1_has_no_key_id() {
        let s = wrap(WrapVersion::V1, &sample_ct()).unwrap();
        assert!(s.starts_with("v1:"));
        let env = Envelope::parse(&s).unwrap();
        assert_eq!(env.tag(), VersionTag::V1);
        assert_eq!(env.key_id(), None);
    }

    #[test]
    fn legacy_parses_on_read_path() {
        let s = format!("legacy:{}", URL_SAFE_NO_PAD.encode(b"compressed"));
        let env = Envelope::parse(&s).unwrap();
        assert_eq!(env.tag(), VersionTag::Legacy);
    }

    #[test]
    fn rejects_unknown_tags() {
        let body = URL_SAFE_NO_PAD.encode(sample_ct());
        for tag in ["v3", "V2", "", "plain", "legacy2"] {
            assert!(
                matches!(Envelope::parse(&format!("{tag}:{body}")), Err(CryptoError::Parse(_))),
                "tag {tag:?} accepted"
            );
        }
    }

    #[test]
    fn rejects_wrong_part_counts() {
        let body = URL_SAFE_NO_PAD.encode(sample_ct());
        assert!(Envelope::parse("v2").is_err());
        assert!(Envelope::parse(&format!("v2:{body}")).is_err());
        assert!(Envelope::parse(&format!("v1:k:{body}")).is_err());
        assert!(Envelope::parse(&format!("v2:k:{body}:extra")).is_err());
    }

    #[test]
    fn rejects_bad_key_ids_and_base64() {
        let body = URL_SAFE_NO_PAD.encode(sample_ct());
        assert!(Envelope::parse(&format!("v2::{body}")).is_err());
        assert!(Envelope::parse(&format!("v2:bad key:{body}")).is_err());
        assert!(Envelope::parse("v2:key_1:!!!!").is_err());
        assert!(wrap(WrapVersion::V2 { key_id: "a:b" }, &sample_ct()).is_err());
    }

    #[test]
    fn rejects_short_ciphertext() {
        let body = URL_SAFE_NO_PAD.encode([0u8; NONCE_LEN + TAG_LEN - 1]);
        assert!(matches!(
            Envelope::parse(&format!("v1:{body}")),
            Err(CryptoError::Parse(_))
        ));
    }

    #[test]
    fn parse_errors_do_not_echo_input() {
        let err = Envelope::parse("v9:super-secret-value").unwrap_err();
        assert!(!err.to_string().contains("super-secret-value"));
    }

    #[test]
    fn peek_reads_only_v2_key_ids() {
        assert_eq!(peek_key_id("v2:key_a:AAAA"), Some("key_a"));
        assert_eq!(peek_key_id("v1:AAAA"), None);
        assert_eq!(peek_key_id("legacy:AAAA"), None);
        assert_eq!(peek_key_id("v2:bad key:AAAA"), None);
    }
}
