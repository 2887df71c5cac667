// Copyright 2020 The Matrix.org Foundation C.I.C.
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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod error;
mod identities;
mod settings;
pub mod store;
pub mod transport;
pub mod types;
mod verification;

pub use error::VerificationError;
pub use identities::{DeviceData, MasterPubkey};
pub use settings::VerificationSettings;
pub use store::{KeyGossip, MemoryStore, StoreError, TrustStore};
pub use transport::{
    OutgoingVerificationRequest, Recipient, SentMessage, TransportError, VerificationTransport,
};
pub use verification::{
    emoji_from_index, format_decimals, AcceptedProtocols, CancelInfo, DecodingError, Emoji,
    EmojiShortAuthString, EncodingError, FlowId, QrVerification, QrVerificationData,
    QrVerificationState, RequestSnapshot, Sas, SasState, ScanError, SelfVerificationData,
    SelfVerificationNoMasterKey, Verification, VerificationData, VerificationEvent,
    VerificationMachine, VerificationRequest, VerificationRequestState,
};
