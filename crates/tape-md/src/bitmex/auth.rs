//! BitMEX WebSocket authentication signing.
//!
//! The `authKeyExpires` handshake signs `"GET" + target + expires` with
//! HMAC-SHA256 over the API secret, hex-encoded, where `expires` is a Unix
//! timestamp a few seconds in the future.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use tape_core::time_util;

type HmacSha256 = Hmac<Sha256>;

/// Signature lifetime in seconds.
const TIME_TO_EXPIRE_SEC: u64 = 10;

/// Unix timestamp (seconds) at which a signature issued now expires.
pub fn expiration_time() -> u64 {
    time_util::now_us() / 1_000_000 + TIME_TO_EXPIRE_SEC
}

/// Compute an HMAC-SHA256 signature and return it as a lowercase hex string.
pub fn signature(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_hex_sha256() {
        let sig = signature("secret", "GET/realtime1640995200");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_depends_on_inputs() {
        assert_ne!(
            signature("secret", "GET/realtime1640995200"),
            signature("secret", "GET/realtime1640995201"),
        );
        assert_ne!(
            signature("secret-a", "GET/realtime1640995200"),
            signature("secret-b", "GET/realtime1640995200"),
        );
    }

    #[test]
    fn expiration_is_in_the_future() {
        let now_sec = tape_core::time_util::now_us() / 1_000_000;
        assert!(expiration_time() >= now_sec + TIME_TO_EXPIRE_SEC);
    }
}
