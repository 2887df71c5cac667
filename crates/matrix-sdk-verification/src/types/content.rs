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

//! The untrusted shapes of the verification messages.
//!
//! Every field is optional, these structs describe what a message *might*
//! contain. Nothing in here is trusted until it went through the validation
//! in the verification module.

use std::collections::BTreeMap;

use ruma::{EventId, OwnedRoomId, OwnedTransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::methods::{CancelCode, VerificationMethod};

/// The `m.relates_to` field that ties in-room verification messages to the
/// request event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Relation {
    /// The relation type, `m.reference` for verification messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    /// The event id of the `m.key.verification.request` event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Relation {
    /// Create a `m.reference` relation pointing to the given event.
    pub fn reference(event_id: &EventId) -> Self {
        Self { rel_type: Some("m.reference".to_owned()), event_id: Some(event_id.to_string()) }
    }
}

/// Where a message belongs to, either a to-device transaction or an in-room
/// relation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlowFields {
    /// The transaction id of a to-device flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// The relation of an in-room flow.
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<Relation>,
}

impl FlowFields {
    /// The flow id string these fields carry, if any.
    pub fn flow_id(&self) -> Option<&str> {
        self.transaction_id
            .as_deref()
            .or_else(|| self.relates_to.as_ref().and_then(|r| r.event_id.as_deref()))
    }

    pub(crate) fn to_device(transaction_id: &str) -> Self {
        Self { transaction_id: Some(transaction_id.to_owned()), relates_to: None }
    }

    pub(crate) fn in_room(event_id: &EventId) -> Self {
        Self { transaction_id: None, relates_to: Some(Relation::reference(event_id)) }
    }
}

/// The content of a `m.key.verification.request` message.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RequestContent {
    /// The device that sent the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_device: Option<String>,
    /// The methods the sender supports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<VerificationMethod>>,
    /// Milliseconds since the unix epoch when the request was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// The user an in-room request is addressed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub flow: FlowFields,
}

/// The content of a `m.key.verification.ready` message.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ReadyContent {
    /// The device that accepted the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_device: Option<String>,
    /// The methods both sides support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<VerificationMethod>>,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub flow: FlowFields,
}

/// The content of a `m.key.verification.start` message.
///
/// Fields this crate doesn't know about are kept in `other`, the commitment
/// is calculated over the complete content.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct StartContent {
    /// The device that started the flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_device: Option<String>,
    /// The verification method, `m.sas.v1` or `m.reciprocate.v1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<VerificationMethod>,
    /// The key agreement protocols the sender supports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_agreement_protocols: Option<Vec<String>>,
    /// The hashes the sender supports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Vec<String>>,
    /// The message authentication codes the sender supports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_authentication_codes: Option<Vec<String>>,
    /// The short authentication string representations the sender supports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_authentication_string: Option<Vec<String>>,
    /// The shared secret of a scanned QR code, unpadded base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub flow: FlowFields,
    /// Any other field of the message.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// The content of a `m.key.verification.accept` message.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct AcceptContent {
    /// The verification method, always `m.sas.v1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<VerificationMethod>,
    /// The chosen key agreement protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_agreement_protocol: Option<String>,
    /// The chosen hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// The chosen message authentication code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_authentication_code: Option<String>,
    /// The short authentication string representations both sides support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_authentication_string: Option<Vec<String>>,
    /// Hash of the ephemeral public key and the canonical start content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment: Option<String>,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub flow: FlowFields,
}

/// The content of a `m.key.verification.key` message.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct KeyContent {
    /// The ephemeral Curve25519 public key, unpadded base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub flow: FlowFields,
}

/// The content of a `m.key.verification.mac` message.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MacContent {
    /// Map from key id to the MAC of that key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<BTreeMap<String, String>>,
    /// MAC of the sorted, comma separated list of key ids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<String>,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub flow: FlowFields,
}

/// The content of a `m.key.verification.done` message.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DoneContent {
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub flow: FlowFields,
}

/// The content of a `m.key.verification.cancel` message.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CancelContent {
    /// The machine readable cancel code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// A human readable reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub flow: FlowFields,
}

impl CancelContent {
    pub(crate) fn new(flow: FlowFields, code: &CancelCode, reason: &str) -> Self {
        Self { code: Some(code.as_str().to_owned()), reason: Some(reason.to_owned()), flow }
    }

    /// The parsed cancel code, if one is present.
    pub fn cancel_code(&self) -> Option<CancelCode> {
        self.code.as_deref().map(CancelCode::from)
    }
}

/// Any verification message, tagged with its event type.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "content")]
pub enum VerificationContent {
    /// `m.key.verification.request`
    #[serde(rename = "m.key.verification.request")]
    Request(RequestContent),
    /// `m.key.verification.ready`
    #[serde(rename = "m.key.verification.ready")]
    Ready(ReadyContent),
    /// `m.key.verification.start`
    #[serde(rename = "m.key.verification.start")]
    Start(StartContent),
    /// `m.key.verification.accept`
    #[serde(rename = "m.key.verification.accept")]
    Accept(AcceptContent),
    /// `m.key.verification.key`
    #[serde(rename = "m.key.verification.key")]
    Key(KeyContent),
    /// `m.key.verification.mac`
    #[serde(rename = "m.key.verification.mac")]
    Mac(MacContent),
    /// `m.key.verification.done`
    #[serde(rename = "m.key.verification.done")]
    Done(DoneContent),
    /// `m.key.verification.cancel`
    #[serde(rename = "m.key.verification.cancel")]
    Cancel(CancelContent),
}

impl VerificationContent {
    /// The event type of the message.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Request(_) => "m.key.verification.request",
            Self::Ready(_) => "m.key.verification.ready",
            Self::Start(_) => "m.key.verification.start",
            Self::Accept(_) => "m.key.verification.accept",
            Self::Key(_) => "m.key.verification.key",
            Self::Mac(_) => "m.key.verification.mac",
            Self::Done(_) => "m.key.verification.done",
            Self::Cancel(_) => "m.key.verification.cancel",
        }
    }

    /// The flow fields of the message.
    pub fn flow(&self) -> &FlowFields {
        match self {
            Self::Request(c) => &c.flow,
            Self::Ready(c) => &c.flow,
            Self::Start(c) => &c.flow,
            Self::Accept(c) => &c.flow,
            Self::Key(c) => &c.flow,
            Self::Mac(c) => &c.flow,
            Self::Done(c) => &c.flow,
            Self::Cancel(c) => &c.flow,
        }
    }

    /// The `from_device` field, only request, ready, and start messages carry
    /// one.
    pub fn from_device(&self) -> Option<&str> {
        match self {
            Self::Request(c) => c.from_device.as_deref(),
            Self::Ready(c) => c.from_device.as_deref(),
            Self::Start(c) => c.from_device.as_deref(),
            _ => None,
        }
    }
}

/// A message as it was handed to us by the transport.
#[derive(Clone, Debug)]
pub struct IncomingVerificationMessage {
    /// The user that sent the message.
    pub sender: ruma::OwnedUserId,
    /// The room the message was sent in, `None` for to-device messages.
    pub room_id: Option<OwnedRoomId>,
    /// The event id of the message, in-room requests use it as their flow id.
    pub event_id: Option<ruma::OwnedEventId>,
    /// When the server received the message.
    pub origin_server_ts: Option<ruma::MilliSecondsSinceUnixEpoch>,
    /// The message itself.
    pub content: VerificationContent,
}

impl IncomingVerificationMessage {
    /// Wrap a to-device message.
    pub fn to_device(sender: ruma::OwnedUserId, content: VerificationContent) -> Self {
        Self { sender, room_id: None, event_id: None, origin_server_ts: None, content }
    }

    /// Wrap a room message.
    pub fn in_room(
        sender: ruma::OwnedUserId,
        room_id: OwnedRoomId,
        event_id: ruma::OwnedEventId,
        origin_server_ts: ruma::MilliSecondsSinceUnixEpoch,
        content: VerificationContent,
    ) -> Self {
        Self {
            sender,
            room_id: Some(room_id),
            event_id: Some(event_id),
            origin_server_ts: Some(origin_server_ts),
            content,
        }
    }
}

/// Generate a fresh transaction id for a to-device flow.
pub(crate) fn new_transaction_id() -> OwnedTransactionId {
    ruma::TransactionId::new()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{StartContent, VerificationContent};
    use crate::types::VerificationMethod;

    #[test]
    fn start_keeps_unknown_fields() {
        let json = json!({
            "type": "m.key.verification.start",
            "content": {
                "from_device": "BOBDEVICE",
                "method": "m.sas.v1",
                "transaction_id": "abc",
                "org.example.field": [1, 2, 3],
            }
        });

        let content: VerificationContent = serde_json::from_value(json.clone()).unwrap();
        let VerificationContent::Start(StartContent { method, other, flow, .. }) = &content else {
            panic!("Expected a start message, got {content:?}");
        };

        assert_eq!(method, &Some(VerificationMethod::SasV1));
        assert_eq!(flow.flow_id(), Some("abc"));
        assert!(other.contains_key("org.example.field"));
        assert_eq!(serde_json::to_value(&content).unwrap(), json);
    }

    #[test]
    fn in_room_flow_id_comes_from_the_relation() {
        let json = json!({
            "type": "m.key.verification.done",
            "content": {
                "m.relates_to": { "rel_type": "m.reference", "event_id": "$request" }
            }
        });

        let content: VerificationContent = serde_json::from_value(json).unwrap();
        assert_eq!(content.flow().flow_id(), Some("$request"));
    }
}
