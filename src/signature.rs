//! Request signatures.
//!
//! Every endpoint that touches counters carries `sig=<hex>`, the lowercase hex
//! HMAC-SHA256 of a canonical message under the shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt::{self, Debug, Display, Formatter};

type HmacSha256 = Hmac<Sha256>;

/// Message signed for a hit or totals request.
pub fn site_message(site_id: impl Display) -> String {
    site_id.to_string()
}

/// Message signed for a history request. Parts are signed exactly as sent.
pub fn history_message(site_id: impl Display, begin: &str, end: &str) -> String {
    format!("{}:{}:{}", site_id, begin, end)
}

pub const FLUSH_MESSAGE: &str = "flush";

pub trait SignatureVerifier: Debug + Send + Sync {
    /// Returns true when `signature` is valid for `message`.
    fn verify(&self, message: &str, signature: &str) -> bool;
}

#[derive(Clone)]
pub struct HmacVerifier {
    keyed: HmacSha256,
}

impl Debug for HmacVerifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacVerifier")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl HmacVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> anyhow::Result<Self> {
        let keyed = <HmacSha256 as Mac>::new_from_slice(secret.as_ref())
            .map_err(|e| anyhow::anyhow!("Invalid HMAC secret: {}", e))?;
        Ok(Self { keyed })
    }

    fn mac(&self, message: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(message.as_bytes());
        mac
    }

    /// Lowercase hex signature for `message`.
    pub fn sign(&self, message: &str) -> String {
        hex::encode(self.mac(message).finalize().into_bytes())
    }
}

impl SignatureVerifier for HmacVerifier {
    fn verify(&self, message: &str, signature: &str) -> bool {
        if signature.bytes().any(|b| b.is_ascii_uppercase()) {
            return false;
        }
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        // verify_slice compares in constant time.
        self.mac(message).verify_slice(&expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_own_signature() {
        let v = HmacVerifier::new("secret").unwrap();
        let sig = v.sign(&site_message(42));
        assert_eq!(sig.len(), 64);
        assert!(v.verify("42", &sig));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let v = HmacVerifier::new("Jefe").unwrap();
        assert_eq!(
            v.sign("what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn rejects_tampering() {
        let v = HmacVerifier::new("secret").unwrap();
        let sig = v.sign(&history_message(42, "2024-01-01", "2024-01-31"));
        assert!(!v.verify(&history_message(42, "2024-01-01", "2024-02-01"), &sig));
        assert!(!v.verify(&history_message(42, "2024-01-01", "2024-01-31"), &sig[..62]));
        assert!(!v.verify(&history_message(42, "2024-01-01", "2024-01-31"), "zz"));
        assert!(!v.verify(
            &history_message(42, "2024-01-01", "2024-01-31"),
            &sig.to_uppercase()
        ));
        let other = HmacVerifier::new("other").unwrap();
        assert!(!other.verify(&history_message(42, "2024-01-01", "2024-01-31"), &sig));
    }
}
