use rand::rngs::OsRng;
use rand::RngCore;

/// Access token issuer.
///
/// Tokens are 16 bytes from the OS random source, hex-encoded to 32 chars.
/// Uniqueness is enforced by the store's UNIQUE constraint; callers retry
/// issuance on an insertion conflict rather than surfacing it.
pub struct TokenIssuer;

pub const TOKEN_BYTES: usize = 16;

impl TokenIssuer {
    pub fn issue() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_32_lowercase_hex_chars() {
        let token = TokenIssuer::issue();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn issued_tokens_are_distinct() {
        let tokens: HashSet<String> = (0..1000).map(|_| TokenIssuer::issue()).collect();
        assert_eq!(tokens.len(), 1000);
    }
}
