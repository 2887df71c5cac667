// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The cryptographic primitives of the SAS method.
//!
//! The ephemeral Curve25519 key pair comes from vodozemac, the key derivation
//! and MAC calculation are done here directly since both the current and the
//! legacy MAC variant need to be supported.

use std::fmt;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, KeyError};
use zeroize::Zeroizing;

use crate::types::MessageAuthenticationCode;

type HmacSha256 = Hmac<Sha256>;

/// Errors of the SAS key agreement and MAC calculation.
#[derive(Debug, Error)]
pub(crate) enum SasCryptoError {
    #[error("the public key of the other side is invalid: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("the key agreement produced a non-contributory shared secret")]
    NonContributoryKey,
    #[error("couldn't expand the shared secret: {0}")]
    InvalidLength(#[from] hkdf::InvalidLength),
    #[error("the MAC isn't valid base64")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("the MAC doesn't match")]
    MacMismatch,
    #[error("the MAC method {0} isn't supported")]
    UnsupportedMac(MessageAuthenticationCode),
    #[error("there is no ephemeral key pair to run the key agreement with")]
    MissingKeyPair,
}

/// Encode bytes as unpadded base64.
pub(crate) fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(input)
}

/// Decode unpadded base64, padded input is accepted as well.
pub(crate) fn decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_NO_PAD.decode(input.trim_end_matches('='))
}

/// The unpadded base64 encoded SHA-256 hash of the given input.
pub(crate) fn hash(input: &str) -> String {
    encode(Sha256::digest(input.as_bytes()))
}

/// Our half of the key agreement, created once per SAS flow.
pub(crate) struct EphemeralKeys {
    secret: Curve25519SecretKey,
    public_key: Curve25519PublicKey,
}

impl EphemeralKeys {
    pub fn new() -> Self {
        let secret = Curve25519SecretKey::new();
        let public_key = Curve25519PublicKey::from(&secret);

        Self { secret, public_key }
    }

    pub fn public_key(&self) -> Curve25519PublicKey {
        self.public_key
    }

    /// Run the Diffie-Hellman key agreement with the key of the other side.
    ///
    /// The secret key is consumed, the shared secret only lives inside the
    /// returned [`EstablishedKeys`].
    pub fn establish(self, their_key: &str) -> Result<EstablishedKeys, SasCryptoError> {
        let their_public_key = Curve25519PublicKey::from_base64(their_key)?;
        let shared_secret = self.secret.diffie_hellman(&their_public_key);

        if !shared_secret.was_contributory() {
            return Err(SasCryptoError::NonContributoryKey);
        }

        Ok(EstablishedKeys {
            shared_secret: Zeroizing::new(*shared_secret.as_bytes()),
            our_public_key: self.public_key,
            their_public_key,
        })
    }
}

impl fmt::Debug for EphemeralKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// The result of the key agreement.
pub(crate) struct EstablishedKeys {
    shared_secret: Zeroizing<[u8; 32]>,
    our_public_key: Curve25519PublicKey,
    their_public_key: Curve25519PublicKey,
}

impl EstablishedKeys {
    pub fn our_public_key(&self) -> Curve25519PublicKey {
        self.our_public_key
    }

    pub fn their_public_key(&self) -> Curve25519PublicKey {
        self.their_public_key
    }

    fn expand(&self, info: &str, output: &mut [u8]) -> Result<(), SasCryptoError> {
        Hkdf::<Sha256>::new(None, self.shared_secret.as_slice()).expand(info.as_bytes(), output)?;
        Ok(())
    }

    /// Derive `count` bytes for the short authentication string.
    pub fn short_code_bytes(&self, info: &str, count: usize) -> Result<Vec<u8>, SasCryptoError> {
        let mut bytes = vec![0u8; count];
        self.expand(info, &mut bytes)?;

        Ok(bytes)
    }

    fn mac_key(
        &self,
        method: &MessageAuthenticationCode,
        info: &str,
    ) -> Result<Zeroizing<Vec<u8>>, SasCryptoError> {
        let length = match method {
            MessageAuthenticationCode::HkdfHmacSha256 => 32,
            MessageAuthenticationCode::HmacSha256 => 256,
            MessageAuthenticationCode::Unknown(_) => {
                return Err(SasCryptoError::UnsupportedMac(method.clone()));
            }
        };

        let mut key = Zeroizing::new(vec![0u8; length]);
        self.expand(info, &mut key)?;

        Ok(key)
    }

    fn mac(
        &self,
        method: &MessageAuthenticationCode,
        input: &str,
        info: &str,
    ) -> Result<HmacSha256, SasCryptoError> {
        let key = self.mac_key(method, info)?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|_| SasCryptoError::UnsupportedMac(method.clone()))?;
        mac.update(input.as_bytes());

        Ok(mac)
    }

    /// Calculate the unpadded base64 encoded MAC of `input`.
    pub fn calculate_mac(
        &self,
        method: &MessageAuthenticationCode,
        input: &str,
        info: &str,
    ) -> Result<String, SasCryptoError> {
        Ok(encode(self.mac(method, input, info)?.finalize().into_bytes()))
    }

    /// Check a MAC the other side sent us, the comparison runs in constant
    /// time.
    pub fn verify_mac(
        &self,
        method: &MessageAuthenticationCode,
        input: &str,
        info: &str,
        tag: &str,
    ) -> Result<(), SasCryptoError> {
        let tag = decode(tag)?;
        self.mac(method, input, info)?.verify_slice(&tag).map_err(|_| SasCryptoError::MacMismatch)
    }
}

impl fmt::Debug for EstablishedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedKeys")
            .field("our_public_key", &self.our_public_key)
            .field("their_public_key", &self.their_public_key)
            .finish_non_exhaustive()
    }
}

/// The key material of a SAS flow through its lifetime.
#[derive(Debug, Default)]
pub(crate) enum SasKeys {
    /// No key has been generated yet.
    #[default]
    Pending,
    /// We have a key pair but didn't see the key of the other side yet.
    Fresh(EphemeralKeys),
    /// The key agreement finished.
    Established(EstablishedKeys),
    /// The flow is over and the key material is gone.
    Released,
}

impl SasKeys {
    /// Our public key, generating the key pair if needed.
    ///
    /// Returns `None` once the key material has been used up.
    pub fn public_key(&mut self) -> Option<Curve25519PublicKey> {
        match self {
            SasKeys::Pending => {
                let keys = EphemeralKeys::new();
                let public_key = keys.public_key();
                *self = SasKeys::Fresh(keys);

                Some(public_key)
            }
            SasKeys::Fresh(k) => Some(k.public_key()),
            SasKeys::Established(k) => Some(k.our_public_key()),
            SasKeys::Released => None,
        }
    }

    pub fn established(&self) -> Option<&EstablishedKeys> {
        match self {
            SasKeys::Established(k) => Some(k),
            _ => None,
        }
    }

    /// Run the key agreement, this moves `Fresh` keys to `Established`.
    ///
    /// Any other state leaves the keys released, the flow can't continue
    /// without a fresh key pair.
    pub fn establish(&mut self, their_key: &str) -> Result<&EstablishedKeys, SasCryptoError> {
        if let SasKeys::Pending = self {
            self.public_key();
        }

        let SasKeys::Fresh(keys) = std::mem::replace(self, SasKeys::Released) else {
            return Err(SasCryptoError::MissingKeyPair);
        };

        *self = SasKeys::Established(keys.establish(their_key)?);

        self.established().ok_or(SasCryptoError::MissingKeyPair)
    }

    /// Drop all the key material.
    pub fn release(&mut self) {
        *self = SasKeys::Released;
    }

    pub fn is_released(&self) -> bool {
        matches!(self, SasKeys::Released)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{decode, encode, hash, SasCryptoError, SasKeys};
    use crate::types::MessageAuthenticationCode;

    fn established_pair() -> (SasKeys, SasKeys) {
        let mut alice = SasKeys::default();
        let mut bob = SasKeys::default();

        let alice_key = alice.public_key().unwrap().to_base64();
        let bob_key = bob.public_key().unwrap().to_base64();

        alice.establish(&bob_key).unwrap();
        bob.establish(&alice_key).unwrap();

        (alice, bob)
    }

    #[test]
    fn both_sides_derive_the_same_bytes() {
        let (alice, bob) = established_pair();
        let alice = alice.established().unwrap();
        let bob = bob.established().unwrap();

        assert_eq!(
            alice.short_code_bytes("info", 6).unwrap(),
            bob.short_code_bytes("info", 6).unwrap()
        );
        assert_ne!(
            alice.short_code_bytes("info", 6).unwrap(),
            alice.short_code_bytes("other info", 6).unwrap()
        );
    }

    #[test]
    fn macs_are_symmetric() {
        let (alice, bob) = established_pair();
        let alice = alice.established().unwrap();
        let bob = bob.established().unwrap();

        for method in
            [MessageAuthenticationCode::HkdfHmacSha256, MessageAuthenticationCode::HmacSha256]
        {
            let mac = alice.calculate_mac(&method, "key", "info").unwrap();
            bob.verify_mac(&method, "key", "info", &mac).unwrap();

            let mut bytes = decode(&mac).unwrap();
            bytes[0] ^= 1;
            assert_matches!(
                bob.verify_mac(&method, "key", "info", &encode(bytes)),
                Err(SasCryptoError::MacMismatch)
            );
        }

        let legacy =
            alice.calculate_mac(&MessageAuthenticationCode::HmacSha256, "key", "info").unwrap();
        let current =
            alice.calculate_mac(&MessageAuthenticationCode::HkdfHmacSha256, "key", "info").unwrap();
        assert_ne!(legacy, current);
    }

    #[test]
    fn released_keys_are_gone() {
        let (mut alice, _) = established_pair();
        alice.release();

        assert!(alice.is_released());
        assert!(alice.public_key().is_none());
        assert!(alice.established().is_none());
    }

    #[test]
    fn hash_is_unpadded() {
        assert_eq!(hash(""), "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
    }
}
