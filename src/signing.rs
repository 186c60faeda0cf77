use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature on every outbound request.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Compute the hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take any size key");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take any size key");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Intended for subscriber endpoints; header lookup is case-insensitive.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let signature = headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map(|(_, value)| value)
        .ok_or(VerificationError::MissingSignature)?;

    if verify_signature(secret, body, signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
