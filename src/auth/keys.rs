use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::SshKey;

/// A parsed `authorized_keys` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    pub key_type: String,
    /// Base64 of the public key wire blob.
    pub key_blob: String,
    pub comment: Option<String>,
    pub fingerprint: String,
}

/// Parses and validates one OpenSSH public key line
/// (`<type> <base64> [comment]`).
pub fn parse_authorized_key(line: &str) -> Result<AuthorizedKey> {
    let mut parts = line.split_whitespace();
    let key_type = parts
        .next()
        .ok_or_else(|| Error::InvalidKey("empty key".to_string()))?;
    let key_blob = parts
        .next()
        .ok_or_else(|| Error::InvalidKey("missing key data".to_string()))?;
    let comment = parts.collect::<Vec<_>>().join(" ");

    let blob = STANDARD
        .decode(key_blob)
        .map_err(|e| Error::InvalidKey(format!("key data is not base64: {e}")))?;

    // The blob starts with its own type name; it must agree with the prefix.
    if embedded_key_type(&blob) != Some(key_type.as_bytes()) {
        return Err(Error::InvalidKey(format!(
            "key data does not match type {key_type}"
        )));
    }

    russh_keys::parse_public_key_base64(key_blob)
        .map_err(|e| Error::InvalidKey(format!("unsupported key: {e}")))?;

    Ok(AuthorizedKey {
        key_type: key_type.to_string(),
        key_blob: key_blob.to_string(),
        comment: (!comment.is_empty()).then_some(comment),
        fingerprint: fingerprint(&blob),
    })
}

fn embedded_key_type(blob: &[u8]) -> Option<&[u8]> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    blob.get(4..4 + len)
}

/// OpenSSH-style `SHA256:` fingerprint of a public key blob.
#[must_use]
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

/// Returns the first stored key whose blob is byte-for-byte equal to the
/// offered one. Every candidate is compared in constant time.
#[must_use]
pub fn find_matching_key<'a>(keys: &'a [SshKey], offered: &[u8]) -> Option<&'a SshKey> {
    keys.iter().find(|key| {
        STANDARD
            .decode(&key.key_blob)
            .is_ok_and(|stored| constant_time_eq(&stored, offered))
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    /// Wire blob of an ed25519 key whose point is the group identity.
    fn ed25519_blob(last: u8) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&11u32.to_be_bytes());
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&32u32.to_be_bytes());
        let mut point = [0u8; 32];
        point[0] = last;
        blob.extend_from_slice(&point);
        blob
    }

    fn stored(id: &str, blob: &[u8]) -> SshKey {
        SshKey {
            id: id.to_string(),
            user_id: format!("user-{id}"),
            title: id.to_string(),
            key_type: "ssh-ed25519".to_string(),
            key_blob: STANDARD.encode(blob),
            fingerprint: fingerprint(blob),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_authorized_key() {
        let blob = ed25519_blob(1);
        let line = format!("ssh-ed25519 {} alice@laptop", STANDARD.encode(&blob));

        let key = parse_authorized_key(&line).unwrap();
        assert_eq!(key.key_type, "ssh-ed25519");
        assert_eq!(key.comment.as_deref(), Some("alice@laptop"));
        assert!(key.fingerprint.starts_with("SHA256:"));
    }

    #[test]
    fn test_parse_rejects_type_mismatch() {
        let line = format!("ssh-rsa {}", STANDARD.encode(ed25519_blob(1)));
        assert!(parse_authorized_key(&line).is_err());
        assert!(parse_authorized_key("ssh-ed25519 not-base64!").is_err());
        assert!(parse_authorized_key("").is_err());
    }

    #[test]
    fn test_find_matching_key_exact_only() {
        let a = ed25519_blob(1);
        let b = ed25519_blob(2);
        let keys = vec![stored("a", &a), stored("b", &b)];

        assert_eq!(find_matching_key(&keys, &b).map(|k| k.id.as_str()), Some("b"));
        assert!(find_matching_key(&keys, &b[..b.len() - 1]).is_none());
        assert!(find_matching_key(&keys, &ed25519_blob(3)).is_none());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
