//! VNC DES challenge-response authentication.
//!
//! The proxy authenticates inbound clients on the server leg and answers the
//! upstream server's challenge on the client leg, both through [`VncAuth`].

use cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::Rng;

/// VNC authentication helper bound to one password.
///
/// Passwords live only as long as the handshake that needs them; nothing is
/// persisted.
pub struct VncAuth {
    password: String,
}

impl VncAuth {
    /// Creates an authenticator for the given password.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    /// Generates a random 16-byte challenge for the server side of the
    /// handshake.
    #[must_use]
    pub fn generate_challenge() -> [u8; 16] {
        rand::thread_rng().gen()
    }

    /// Computes the VNC DES response for a 16-byte challenge.
    ///
    /// VNC key derivation differs from plain DES:
    /// 1. The password is truncated or zero-padded to 8 bytes.
    /// 2. The bit order of each key byte is reversed.
    /// 3. DES-ECB encrypts the challenge as two 8-byte blocks.
    #[must_use]
    pub fn encrypt_challenge(&self, challenge: &[u8; 16]) -> [u8; 16] {
        let mut key = [0u8; 8];
        for (slot, &byte) in key.iter_mut().zip(self.password.as_bytes().iter().take(8)) {
            *slot = byte.reverse_bits();
        }

        let cipher = Des::new_from_slice(&key).expect("DES key is always 8 bytes");

        let mut response = *challenge;
        let (block0, block1) = response.split_at_mut(8);
        cipher.encrypt_block(block0.into());
        cipher.encrypt_block(block1.into());
        response
    }

    /// Checks a client's response against the challenge it was sent.
    #[must_use]
    pub fn verify_response(&self, challenge: &[u8; 16], response: &[u8; 16]) -> bool {
        self.encrypt_challenge(challenge) == *response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_roundtrip() {
        let auth = VncAuth::new("secret");
        let challenge = VncAuth::generate_challenge();
        let response = auth.encrypt_challenge(&challenge);
        assert_ne!(response, challenge);
        assert!(auth.verify_response(&challenge, &response));
    }

    #[test]
    fn test_wrong_password_rejected() {
        let challenge = [0x42u8; 16];
        let response = VncAuth::new("secret").encrypt_challenge(&challenge);
        assert!(!VncAuth::new("Secret").verify_response(&challenge, &response));
        assert!(!VncAuth::new("").verify_response(&challenge, &response));
    }

    #[test]
    fn test_password_truncated_to_eight_bytes() {
        // Only the first 8 password bytes participate in the DES key.
        let challenge = [0x10u8; 16];
        let short = VncAuth::new("password").encrypt_challenge(&challenge);
        let long = VncAuth::new("passwordXYZ").encrypt_challenge(&challenge);
        assert_eq!(short, long);
    }

    #[test]
    fn test_deterministic_per_password() {
        let challenge = [0x99u8; 16];
        assert_eq!(
            VncAuth::new("abc").encrypt_challenge(&challenge),
            VncAuth::new("abc").encrypt_challenge(&challenge)
        );
    }
}
