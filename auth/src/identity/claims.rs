use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

// JWT segments are base64url without padding, but tokens copied around by
// hand often use the standard alphabet with padding. Accept both.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Returns the `oid` (object ID) claim of a JWT access token, if any.
///
/// The signature is not verified; the value is only used as the Redis
/// username for the identity that requested the token.
pub fn object_id(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let normalized = payload.replace('+', "-").replace('/', "_");
    let decoded = LENIENT.decode(normalized.as_bytes()).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;

    claims.get("oid")?.as_str().map(str::to_string)
}
