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

//! String-backed identifiers used inside verification messages.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident => $value:literal,
            )*
            @unknown $(#[$unknown_meta:meta])* $unknown:ident,
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
            $(#[$unknown_meta])*
            $unknown(String),
        }

        impl $name {
            /// Get the string representation that is used on the wire.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $value,)*
                    Self::$unknown(s) => s,
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                match s {
                    $($value => Self::$variant,)*
                    _ => Self::$unknown(s.to_owned()),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                match s.as_str() {
                    $($value => Self::$variant,)*
                    _ => Self::$unknown(s),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::$unknown(s) => s,
                    other => other.as_str().to_owned(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// A verification method that can be advertised in a request or ready
    /// message.
    pub enum VerificationMethod {
        /// The emoji or decimal short authentication string method.
        SasV1 => "m.sas.v1",
        /// We are able to scan a QR code.
        QrCodeScanV1 => "m.qr_code.scan.v1",
        /// We are able to display a QR code.
        QrCodeShowV1 => "m.qr_code.show.v1",
        /// We are able to confirm a scanned QR code.
        ReciprocateV1 => "m.reciprocate.v1",
        @unknown
        /// A method we don't know about.
        Unknown,
    }
}

string_enum! {
    /// The machine readable code of a cancellation.
    pub enum CancelCode {
        /// The user cancelled the verification.
        User => "m.user",
        /// The verification process timed out.
        Timeout => "m.timeout",
        /// The device does not know about the given flow id.
        UnknownTransaction => "m.unknown_transaction",
        /// The device can't handle the requested method.
        UnknownMethod => "m.unknown_method",
        /// The device received a message it didn't expect.
        UnexpectedMessage => "m.unexpected_message",
        /// A MAC over one of the attested keys didn't match.
        KeyMismatch => "m.key_mismatch",
        /// The expected user did not match the verified user.
        UserMismatch => "m.user_mismatch",
        /// A message could not be understood.
        InvalidMessage => "m.invalid_message",
        /// The request was accepted by a different device.
        Accepted => "m.accepted",
        /// The commitment in the accept message did not match the key.
        MismatchedCommitment => "m.mismatched_commitment",
        /// The user said the short authentication strings differ.
        MismatchedSas => "m.mismatched_sas",
        /// The scanned QR code was invalid.
        QrCodeInvalid => "m.qr_code.invalid",
        @unknown
        /// A code we don't know about.
        Custom,
    }
}

string_enum! {
    /// The key agreement protocol of a SAS verification.
    pub enum KeyAgreementProtocol {
        /// The original protocol, the ephemeral keys are not part of the SAS
        /// info string.
        Curve25519 => "curve25519",
        /// Both ephemeral public keys are mixed into the SAS info string.
        Curve25519HkdfSha256 => "curve25519-hkdf-sha256",
        @unknown
        /// A protocol we don't know about.
        Unknown,
    }
}

string_enum! {
    /// The hash used for the commitment.
    pub enum HashAlgorithm {
        /// SHA-256.
        Sha256 => "sha256",
        @unknown
        /// A hash we don't know about.
        Unknown,
    }
}

string_enum! {
    /// The message authentication code used to attest the long-term keys.
    pub enum MessageAuthenticationCode {
        /// HKDF derives a 32 byte key for HMAC-SHA-256.
        HkdfHmacSha256 => "hkdf-hmac-sha256",
        /// HKDF derives a 256 byte key for HMAC-SHA-256.
        HmacSha256 => "hmac-sha256",
        @unknown
        /// A MAC we don't know about.
        Unknown,
    }
}

string_enum! {
    /// A way to display the short authentication string.
    pub enum ShortAuthenticationString {
        /// Three four digit numbers.
        Decimal => "decimal",
        /// Seven emoji.
        Emoji => "emoji",
        @unknown
        /// A representation we don't know about.
        Unknown,
    }
}

impl KeyAgreementProtocol {
    pub(crate) fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl HashAlgorithm {
    pub(crate) fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl MessageAuthenticationCode {
    pub(crate) fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl ShortAuthenticationString {
    pub(crate) fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelCode, VerificationMethod};

    #[test]
    fn unknown_values_survive_serialization() {
        let method: VerificationMethod = serde_json::from_str("\"org.example.method\"").unwrap();
        assert_eq!(method, VerificationMethod::Unknown("org.example.method".to_owned()));
        assert_eq!(serde_json::to_string(&method).unwrap(), "\"org.example.method\"");

        let code: CancelCode = serde_json::from_str("\"m.mismatched_sas\"").unwrap();
        assert_eq!(code, CancelCode::MismatchedSas);
        assert_eq!(code.as_str(), "m.mismatched_sas");
    }
}
