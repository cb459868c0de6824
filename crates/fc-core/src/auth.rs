//! Shared-secret token helpers
//!
//! Agents and operator clients authenticate with a pre-shared token taken
//! from the configuration. Tokens are 32 random bytes, hex-encoded.

/// Length of a generated token in bytes (before hex encoding)
const TOKEN_BYTES: usize = 32;

/// Generate a new random authentication token
///
/// Returns a 64-character hex string (32 random bytes)
pub fn generate_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Generate a short random suffix for identifiers (8 hex chars)
pub fn random_suffix() -> String {
    use rand::Rng;
    let bytes: [u8; 4] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Validate a presented token against the expected one.
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn validate_token(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }

    let mut result = 0u8;
    for (a, b) in provided.bytes().zip(expected.bytes()) {
        result |= a ^ b;
    }
    result == 0
}

/// Check an optional presented token against an optional requirement.
///
/// When no token is configured every client is accepted.
pub fn check_token(provided: Option<&str>, expected: Option<&str>) -> bool {
    match (expected, provided) {
        (None, _) => true,
        (Some(expected), Some(provided)) => validate_token(provided, expected),
        (Some(_), None) => false,
    }
}
