use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the caller's payload signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

impl VerificationError {
    pub fn message(&self) -> &'static str {
        match self {
            VerificationError::MissingSignature => "Missing X-Hub-Signature-256 header",
            VerificationError::InvalidSignature => "Invalid signature",
        }
    }
}

/// Compute the hex-encoded HMAC-SHA256 of `payload` keyed by `secret`.
///
/// HMAC accepts keys of any length, so the empty string is returned only
/// if the key is rejected, and it never verifies.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a hex signature, with or without a `sha256=` prefix.
///
/// The digest comparison is constant-time. Anything that does not
/// hex-decode is treated as a mismatch.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);

    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&expected).is_ok()
}

/// Verify an inbound payload against a subscription secret.
///
/// An empty secret disables verification entirely and any header (or
/// none) is accepted.
pub fn verify_payload(
    secret: &str,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<(), VerificationError> {
    if secret.is_empty() {
        return Ok(());
    }

    let signature = match signature {
        Some(s) if !s.is_empty() => s,
        _ => return Err(VerificationError::MissingSignature),
    };

    if verify_signature(secret.as_bytes(), payload, signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector_for_example_payload() {
        // printf '{"x":1}' | openssl dgst -sha256 -hmac abc
        let sig = compute_signature(b"abc", br#"{"x":1}"#);
        assert_eq!(sig, "151244191e9fd3d055f407d2825d287f860ad89417a2dcd414fff80158ff976a");
        assert!(verify_signature(b"abc", br#"{"x":1}"#, &sig));
    }

    #[test]
    fn any_key_length_produces_a_digest() {
        for key in [&b""[..], b"k", &[7u8; 64], &[7u8; 200]] {
            let sig = compute_signature(key, b"payload");
            assert_eq!(sig.len(), 64);
            assert!(verify_signature(key, b"payload", &sig));
        }
    }

    #[test]
    fn accepts_prefixed_and_uppercase_hex() {
        let sig = compute_signature(b"secret", b"payload");
        assert!(verify_signature(b"secret", b"payload", &format!("sha256={sig}")));
        assert!(verify_signature(b"secret", b"payload", &sig.to_uppercase()));
    }

    #[test]
    fn rejects_other_secret_payload_or_garbage() {
        let sig = compute_signature(b"secret", b"payload");
        assert!(!verify_signature(b"other", b"payload", &sig));
        assert!(!verify_signature(b"secret", b"payload2", &sig));
        assert!(!verify_signature(b"secret", b"payload", "not-hex"));
        assert!(!verify_signature(b"secret", b"payload", &sig[..62]));
    }

    #[test]
    fn empty_secret_skips_verification() {
        assert_eq!(verify_payload("", b"{}", None), Ok(()));
        assert_eq!(verify_payload("", b"{}", Some("anything")), Ok(()));
    }

    #[test]
    fn secret_requires_matching_header() {
        let body = vec![b'a'; 1 << 16];
        let sig = compute_signature(b"abc", &body);

        assert_eq!(verify_payload("abc", &body, Some(&sig)), Ok(()));
        assert_eq!(
            verify_payload("abc", &body, None),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_payload("abc", &body, Some("")),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_payload("abc", &body, Some(&compute_signature(b"abd", &body))),
            Err(VerificationError::InvalidSignature)
        );
    }
}
