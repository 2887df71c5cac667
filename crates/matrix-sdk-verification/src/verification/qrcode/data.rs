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

//! The binary payload of a verification QR code.
//!
//! The payload consists of the following parts:
//!
//! * the ASCII string `MATRIX`
//! * one byte for the version, `0x02`
//! * one byte for the mode:
//!     * `0x00` verifying another user with cross-signing
//!     * `0x01` self-verifying, the displaying device trusts the master key
//!     * `0x02` self-verifying, the displaying device doesn't trust the master
//!       key yet
//! * the flow id, as a big-endian `u16` length followed by the UTF-8 bytes
//! * the first key, 32 bytes
//! * the second key, 32 bytes
//! * the shared secret, the rest of the payload
//!
//! The format is defined in the [spec].
//!
//! [spec]: https://spec.matrix.org/unstable/client-server-api/#qr-code-format

use std::{
    io::{Cursor, Read},
    num::TryFromIntError,
    string::FromUtf8Error,
};

use byteorder::{BigEndian, ReadBytesExt};
use ruma::serde::Base64;
use thiserror::Error;
use vodozemac::{Ed25519PublicKey, KeyError};

const HEADER: &[u8] = b"MATRIX";
const VERSION: u8 = 0x2;
const MAX_MODE: u8 = 0x2;
const MIN_SECRET_LEN: usize = 8;

/// Error type describing errors that happen while QR data is being decoded.
#[derive(Debug, Error)]
pub enum DecodingError {
    /// The QR code data is missing the `MATRIX` prefix.
    #[error("the decoded QR code is missing the Matrix header")]
    Header,
    /// The QR code data uses an unsupported version.
    #[error("the decoded QR code has an unsupported version {0}")]
    Version(u8),
    /// The QR code data uses an unknown mode.
    #[error("the QR code has an invalid mode {0}")]
    Mode(u8),
    /// The QR code data ended before all the fields were read.
    #[error(transparent)]
    Read(#[from] std::io::Error),
    /// The shared secret is too short.
    #[error("the QR code contains a too short shared secret, length: {0}")]
    SharedSecret(usize),
    /// One of the keys isn't a valid ed25519 key.
    #[error("the QR code contains an invalid ed25519 key: {0}")]
    Keys(#[from] KeyError),
    /// The flow id isn't valid UTF-8.
    #[error("the QR code contains an invalid flow id: {0}")]
    Identifier(#[from] FromUtf8Error),
}

/// Error type describing errors that happen while QR data is being encoded.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The flow id doesn't fit into the two byte length prefix.
    #[error("the flow id is too long to be encoded into a QR code: {0}")]
    FlowId(#[from] TryFromIntError),
}

/// An enum representing the different modes for a QR verification code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QrVerificationData {
    /// Verification of another user.
    ///
    /// Contains the master key of the displaying user and what the displaying
    /// device believes is the master key of the scanning user. Both sides end
    /// up trusting the master key of the other user.
    Verification(VerificationData),
    /// Self-verification where the displaying device trusts the master key.
    ///
    /// Contains the master key and what the displaying device believes is the
    /// device key of the scanning device. The scanning device ends up
    /// trusting the master key, the displaying device the scanning device.
    SelfVerification(SelfVerificationData),
    /// Self-verification where the displaying device doesn't trust the master
    /// key yet.
    ///
    /// Contains the device key of the displaying device and what it believes
    /// is the master key. The scanning device ends up trusting the displaying
    /// device, the displaying device the master key.
    SelfVerificationNoMasterKey(SelfVerificationNoMasterKey),
}

impl TryFrom<&[u8]> for QrVerificationData {
    type Error = DecodingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

impl TryFrom<Vec<u8>> for QrVerificationData {
    type Error = DecodingError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::from_bytes(value)
    }
}

impl QrVerificationData {
    /// Parse the decoded payload of a QR code.
    ///
    /// # Examples
    /// ```
    /// # use matrix_sdk_verification::{QrVerificationData, DecodingError};
    /// # fn main() -> Result<(), DecodingError> {
    /// let data = b"MATRIX\
    ///              \x02\x02\x00\x07\
    ///              FLOW_ID\
    ///              kS /\x92i\x1e6\xcd'g\xf9#\x11\xd8\x8a\xa2\xf61\x05\x1b6\xef\xfc\xa4%\x80\x1a\x0c\xd2\xe8\x04\
    ///              \xbdR|\xf8n\x07\xa4\x1f\xb4\xcc3\x0eBT\xe7[~\xfd\x87\xd06B\xdfoVv%\x9b\x86\xae\xbcM\
    ///              SHARED_SECRET";
    ///
    /// let result = QrVerificationData::from_bytes(data)?;
    /// assert_eq!(result.flow_id(), "FLOW_ID");
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, DecodingError> {
        let mut decoded = Cursor::new(bytes);

        let mut header = [0u8; 6];
        let mut first_key = [0u8; 32];
        let mut second_key = [0u8; 32];

        decoded.read_exact(&mut header)?;
        let version = decoded.read_u8()?;
        let mode = decoded.read_u8()?;

        if header != HEADER {
            return Err(DecodingError::Header);
        } else if version != VERSION {
            return Err(DecodingError::Version(version));
        } else if mode > MAX_MODE {
            return Err(DecodingError::Mode(mode));
        }

        let flow_id_len = decoded.read_u16::<BigEndian>()?;
        let mut flow_id = vec![0; flow_id_len.into()];

        decoded.read_exact(&mut flow_id)?;
        decoded.read_exact(&mut first_key)?;
        decoded.read_exact(&mut second_key)?;

        let mut shared_secret = Vec::new();
        decoded.read_to_end(&mut shared_secret)?;

        if shared_secret.len() < MIN_SECRET_LEN {
            return Err(DecodingError::SharedSecret(shared_secret.len()));
        }

        let first_key = Ed25519PublicKey::from_slice(&first_key)?;
        let second_key = Ed25519PublicKey::from_slice(&second_key)?;
        let flow_id = String::from_utf8(flow_id)?;
        let shared_secret = Base64::new(shared_secret);

        Ok(match mode {
            VerificationData::QR_MODE => {
                VerificationData::new(flow_id, first_key, second_key, shared_secret).into()
            }
            SelfVerificationData::QR_MODE => {
                SelfVerificationData::new(flow_id, first_key, second_key, shared_secret).into()
            }
            _ => SelfVerificationNoMasterKey::new(flow_id, first_key, second_key, shared_secret)
                .into(),
        })
    }

    /// Encode the data into the bytes that should be put into a QR code.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mode = match self {
            QrVerificationData::Verification(_) => VerificationData::QR_MODE,
            QrVerificationData::SelfVerification(_) => SelfVerificationData::QR_MODE,
            QrVerificationData::SelfVerificationNoMasterKey(_) => {
                SelfVerificationNoMasterKey::QR_MODE
            }
        };

        let flow_id = self.flow_id().as_bytes();
        let flow_id_len = u16::try_from(flow_id.len())?;

        let mut bytes = Vec::with_capacity(HEADER.len() + 4 + flow_id.len() + 64);
        bytes.extend_from_slice(HEADER);
        bytes.push(VERSION);
        bytes.push(mode);
        bytes.extend_from_slice(&flow_id_len.to_be_bytes());
        bytes.extend_from_slice(flow_id);
        bytes.extend_from_slice(self.first_key().as_bytes());
        bytes.extend_from_slice(self.second_key().as_bytes());
        bytes.extend_from_slice(self.secret().as_bytes());

        Ok(bytes)
    }

    /// Get the flow id for this `QrVerificationData`.
    ///
    /// This represents the ID as a string even if it is an event id.
    pub fn flow_id(&self) -> &str {
        match self {
            QrVerificationData::Verification(v) => &v.flow_id,
            QrVerificationData::SelfVerification(v) => &v.transaction_id,
            QrVerificationData::SelfVerificationNoMasterKey(v) => &v.transaction_id,
        }
    }

    /// Get the first key of this `QrVerificationData`.
    pub fn first_key(&self) -> Ed25519PublicKey {
        match self {
            QrVerificationData::Verification(v) => v.first_master_key,
            QrVerificationData::SelfVerification(v) => v.master_key,
            QrVerificationData::SelfVerificationNoMasterKey(v) => v.device_key,
        }
    }

    /// Get the second key of this `QrVerificationData`.
    pub fn second_key(&self) -> Ed25519PublicKey {
        match self {
            QrVerificationData::Verification(v) => v.second_master_key,
            QrVerificationData::SelfVerification(v) => v.device_key,
            QrVerificationData::SelfVerificationNoMasterKey(v) => v.master_key,
        }
    }

    /// Get the secret of this `QrVerificationData`.
    pub fn secret(&self) -> &Base64 {
        match self {
            QrVerificationData::Verification(v) => &v.shared_secret,
            QrVerificationData::SelfVerification(v) => &v.shared_secret,
            QrVerificationData::SelfVerificationNoMasterKey(v) => &v.shared_secret,
        }
    }
}

/// The data of the `0x00` mode, verification between two users using their
/// master cross-signing keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationData {
    flow_id: String,
    first_master_key: Ed25519PublicKey,
    second_master_key: Ed25519PublicKey,
    shared_secret: Base64,
}

impl VerificationData {
    const QR_MODE: u8 = 0x00;

    /// Create a new `VerificationData`.
    ///
    /// # Arguments
    /// * `flow_id` - The flow id of the verification request.
    ///
    /// * `first_master_key` - Our own master key.
    ///
    /// * `second_master_key` - The master key of the other user.
    ///
    /// * `shared_secret` - A random secret, at least 8 bytes long.
    pub fn new(
        flow_id: String,
        first_master_key: Ed25519PublicKey,
        second_master_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { flow_id, first_master_key, second_master_key, shared_secret }
    }
}

impl From<VerificationData> for QrVerificationData {
    fn from(data: VerificationData) -> Self {
        Self::Verification(data)
    }
}

/// The data of the `0x01` mode, self-verification from a device that trusts
/// the master key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfVerificationData {
    transaction_id: String,
    master_key: Ed25519PublicKey,
    device_key: Ed25519PublicKey,
    shared_secret: Base64,
}

impl SelfVerificationData {
    const QR_MODE: u8 = 0x01;

    /// Create a new `SelfVerificationData`.
    ///
    /// # Arguments
    /// * `transaction_id` - The flow id of the verification request.
    ///
    /// * `master_key` - Our own master key.
    ///
    /// * `device_key` - The ed25519 key of the other device.
    ///
    /// * `shared_secret` - A random secret, at least 8 bytes long.
    pub fn new(
        transaction_id: String,
        master_key: Ed25519PublicKey,
        device_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { transaction_id, master_key, device_key, shared_secret }
    }
}

impl From<SelfVerificationData> for QrVerificationData {
    fn from(data: SelfVerificationData) -> Self {
        Self::SelfVerification(data)
    }
}

/// The data of the `0x02` mode, self-verification from a device that doesn't
/// trust the master key yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfVerificationNoMasterKey {
    transaction_id: String,
    device_key: Ed25519PublicKey,
    master_key: Ed25519PublicKey,
    shared_secret: Base64,
}

impl SelfVerificationNoMasterKey {
    const QR_MODE: u8 = 0x02;

    /// Create a new `SelfVerificationNoMasterKey`.
    ///
    /// # Arguments
    /// * `transaction_id` - The flow id of the verification request.
    ///
    /// * `device_key` - The ed25519 key of our own device.
    ///
    /// * `master_key` - What we believe is our own master key.
    ///
    /// * `shared_secret` - A random secret, at least 8 bytes long.
    pub fn new(
        transaction_id: String,
        device_key: Ed25519PublicKey,
        master_key: Ed25519PublicKey,
        shared_secret: Base64,
    ) -> Self {
        Self { transaction_id, device_key, master_key, shared_secret }
    }
}

impl From<SelfVerificationNoMasterKey> for QrVerificationData {
    fn from(data: SelfVerificationNoMasterKey) -> Self {
        Self::SelfVerificationNoMasterKey(data)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::serde::Base64;
    use vodozemac::Ed25519SecretKey;

    use super::{DecodingError, QrVerificationData, SelfVerificationNoMasterKey};

    #[test]
    fn decode_invalid_header() {
        let data = b"NonMatrixCode";
        assert_matches!(QrVerificationData::from_bytes(data), Err(DecodingError::Header));
    }

    #[test]
    fn decode_invalid_mode() {
        let data = b"MATRIX\x02\x03";
        assert_matches!(QrVerificationData::from_bytes(data), Err(DecodingError::Mode(3)));
    }

    #[test]
    fn decode_invalid_version() {
        let data = b"MATRIX\x01\x03";
        assert_matches!(QrVerificationData::from_bytes(data), Err(DecodingError::Version(1)));
    }

    #[test]
    fn decode_missing_data() {
        let data = b"MATRIX\x02\x02";
        assert_matches!(QrVerificationData::from_bytes(data), Err(DecodingError::Read(_)));
    }

    #[test]
    fn decode_short_secret() {
        let data = b"MATRIX\
                   \x02\x02\x00\x07\
                   FLOW_ID\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRET";

        assert_matches!(
            QrVerificationData::from_bytes(data),
            Err(DecodingError::SharedSecret(6))
        );
    }

    #[test]
    fn decode_invalid_keys() {
        let data = b"MATRIX\
                   \x02\x00\x00\x0f\
                   !test:localhost\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRETISLONGENOUGH";

        assert_matches!(QrVerificationData::from_bytes(data), Err(DecodingError::Keys(_)));
    }

    #[test]
    fn decode_known_payload() {
        let data = b"MATRIX\
                     \x02\x02\x00\x07\
                     FLOW_ID\
                     kS /\x92i\x1e6\xcd'g\xf9#\x11\xd8\x8a\xa2\xf61\x05\x1b6\xef\xfc\xa4%\x80\x1a\x0c\xd2\xe8\x04\
                     \xbdR|\xf8n\x07\xa4\x1f\xb4\xcc3\x0eBT\xe7[~\xfd\x87\xd06B\xdfoVv%\x9b\x86\xae\xbcM\
                     SHARED_SECRET";

        let decoded = QrVerificationData::from_bytes(data).unwrap();

        assert_matches!(decoded, QrVerificationData::SelfVerificationNoMasterKey(_));
        assert_eq!(decoded.flow_id(), "FLOW_ID");
        assert_eq!(decoded.secret().as_bytes(), b"SHARED_SECRET");
        assert_eq!(decoded.to_bytes().unwrap(), data.to_vec());
    }

    #[test]
    fn too_long_flow_ids_are_refused() {
        let data: QrVerificationData = SelfVerificationNoMasterKey::new(
            "a".repeat(usize::from(u16::MAX) + 1),
            Ed25519SecretKey::new().public_key(),
            Ed25519SecretKey::new().public_key(),
            Base64::new(vec![0; 16]),
        )
        .into();

        assert!(data.to_bytes().is_err());
    }
}
