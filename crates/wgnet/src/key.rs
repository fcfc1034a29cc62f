//! 32-byte WireGuard key material

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};
pub use boringtun::x25519::{PublicKey, StaticSecret};
use rand::rngs::OsRng;

use crate::error::DecodeError;

pub const KEY_LEN: usize = 32;

/// Raw key bytes, used for private, public and preshared keys alike.
///
/// The textual form is base64 in configuration documents and lowercase hex
/// on the UAPI control channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// The all-zero key, meaning "no key" for preshared keys.
    pub const ZERO: Key = Key([0; KEY_LEN]);

    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self, DecodeError> {
        let bytes = STANDARD.decode(s.trim())?;
        Self::try_from(bytes.as_slice())
    }

    pub fn from_hex(s: &str) -> Result<Self, DecodeError> {
        let mut bytes = [0; KEY_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| DecodeError::Hex)?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; KEY_LEN]
    }

    /// Derives the X25519 public key for this key used as a private key.
    pub fn public_key(&self) -> Key {
        Key(PublicKey::from(&self.secret()).to_bytes())
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

/// Generate a random keypair, private key first
pub fn keypair() -> (Key, Key) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (Key(secret.to_bytes()), Key(public.to_bytes()))
}

impl TryFrom<&[u8]> for Key {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; KEY_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| DecodeError::KeyLength(bytes.len()))
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Key> for PublicKey {
    fn from(key: Key) -> Self {
        PublicKey::from(key.0)
    }
}

impl FromStr for Key {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::LowerHex for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Never print full key material.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base64();
        f.debug_tuple("Key")
            .field(&format_args!("{}…", &encoded[..6]))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_matches_keypair() {
        let (private, public) = keypair();
        assert_eq!(private.public_key(), public);
    }

    #[test]
    fn hex_is_lowercase_and_reversible() {
        let key = Key::new([0xab; KEY_LEN]);
        assert_eq!(key.to_hex(), "ab".repeat(KEY_LEN));
        assert_eq!(format!("{key:x}"), key.to_hex());
        assert_eq!(Key::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn wrong_length_is_rejected() {
        // 31 bytes
        let short = STANDARD.encode([1u8; 31]);
        assert_eq!(Key::from_base64(&short), Err(DecodeError::KeyLength(31)));
        assert_eq!(Key::from_hex("abcd"), Err(DecodeError::Hex));
    }

    #[test]
    fn debug_does_not_leak() {
        let key = Key::new([7; KEY_LEN]);
        let debug = format!("{key:?}");
        assert!(!debug.contains(&key.to_base64()));
    }
}
