use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the hex HMAC-SHA256 of `payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Build the signature header value for the exact bytes being transmitted.
///
/// Returns `None` when there is no secret (or it is empty), in which case
/// the request goes out unsigned.
pub fn sign(payload: &[u8], secret: Option<&str>) -> Option<String> {
    let secret = secret.filter(|s| !s.is_empty())?;
    let hex = compute_signature(secret.as_bytes(), payload)?;
    Some(format!("{SIGNATURE_PREFIX}{hex}"))
}

/// Verify a received `sha256=<hex>` header against the received body.
pub fn verify_signature(secret: &[u8], payload: &[u8], header_value: &str) -> bool {
    let Some(signature_hex) = header_value.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&signature).is_ok()
}

/// Find the signature header in a list of headers (case-insensitive).
pub fn find_signature_header<'a, I>(headers: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map(|(_, value)| value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let header = find_signature_header(headers).ok_or(VerificationError::MissingSignature)?;
    if verify_signature(secret, payload, header) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"event_type":"message_received"}"#;

    #[test]
    fn no_secret_means_no_signature() {
        assert_eq!(sign(BODY, None), None);
        assert_eq!(sign(BODY, Some("")), None);
    }

    #[test]
    fn signature_has_prefix_and_verifies() {
        let header = sign(BODY, Some("s3cret")).unwrap();
        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), "sha256=".len() + 64);
        assert!(verify_signature(b"s3cret", BODY, &header));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let sig = compute_signature(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn tampered_body_or_wrong_secret_fails() {
        let header = sign(BODY, Some("s3cret")).unwrap();
        assert!(!verify_signature(b"s3cret", br#"{"event_type":"other"}"#, &header));
        assert!(!verify_signature(b"other", BODY, &header));
        assert!(!verify_signature(b"s3cret", BODY, header.trim_start_matches("sha256=")));
        assert!(!verify_signature(b"s3cret", BODY, "sha256=zz"));
    }

    #[test]
    fn verify_request_from_headers() {
        let header = sign(BODY, Some("k")).unwrap();
        let headers = vec![
            ("content-type", "application/json"),
            ("x-webhook-signature", header.as_str()),
        ];
        assert_eq!(verify_webhook_request(headers.iter().copied(), BODY, b"k"), Ok(()));
        assert_eq!(
            verify_webhook_request(vec![("content-type", "application/json")], BODY, b"k"),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_webhook_request(headers.iter().copied(), BODY, b"wrong"),
            Err(VerificationError::InvalidSignature)
        );
    }
}
