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

//! Validated forms of the verification messages.
//!
//! The functions in here are total, they either return a message that is
//! safe to feed into a state machine or `None`.

use std::collections::BTreeMap;

use ruma::{
    CanonicalJsonValue, EventId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedTransactionId,
    OwnedUserId, UInt,
};

use super::FlowId;
use crate::types::{
    AcceptContent, CancelCode, CancelContent, HashAlgorithm, IncomingVerificationMessage,
    KeyAgreementProtocol, KeyContent, MacContent, MessageAuthenticationCode, ReadyContent,
    RequestContent, ShortAuthenticationString, StartContent, VerificationContent,
    VerificationMethod,
};

/// The kind of a message, used for the acceptance tables of the state
/// machines and for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Request,
    Ready,
    Start,
    Accept,
    Key,
    Mac,
    Done,
    Cancel,
}

impl MessageKind {
    #[cfg(test)]
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Request,
        MessageKind::Ready,
        MessageKind::Start,
        MessageKind::Accept,
        MessageKind::Key,
        MessageKind::Mac,
        MessageKind::Done,
        MessageKind::Cancel,
    ];
}

#[derive(Clone, Debug)]
pub(crate) struct ValidRequest {
    pub from_device: OwnedDeviceId,
    pub methods: Vec<VerificationMethod>,
    pub timestamp: Option<MilliSecondsSinceUnixEpoch>,
    pub to: Option<OwnedUserId>,
}

impl ValidRequest {
    pub fn validate(content: &RequestContent) -> Option<Self> {
        let from_device = non_empty(content.from_device.as_deref())?;
        let methods = content.methods.clone().filter(|m| !m.is_empty())?;
        let to = match content.to.as_deref() {
            Some(to) => Some(OwnedUserId::try_from(to).ok()?),
            None => None,
        };

        Some(Self {
            from_device: from_device.into(),
            methods,
            timestamp: content
                .timestamp
                .map(|t| MilliSecondsSinceUnixEpoch(UInt::new_saturating(t))),
            to,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ValidReady {
    pub from_device: OwnedDeviceId,
    pub methods: Vec<VerificationMethod>,
}

impl ValidReady {
    pub fn validate(content: &ReadyContent) -> Option<Self> {
        let from_device = non_empty(content.from_device.as_deref())?;
        let methods = content.methods.clone().filter(|m| !m.is_empty())?;

        Some(Self { from_device: from_device.into(), methods })
    }
}

/// A `m.sas.v1` start message that offers at least one combination we can
/// work with.
#[derive(Clone, Debug)]
pub(crate) struct SasStart {
    pub from_device: OwnedDeviceId,
    pub key_agreement_protocols: Vec<KeyAgreementProtocol>,
    pub hashes: Vec<HashAlgorithm>,
    pub message_authentication_codes: Vec<MessageAuthenticationCode>,
    pub short_authentication_string: Vec<ShortAuthenticationString>,
    /// The canonical JSON form of the complete content, the accept
    /// commitment is calculated over it.
    pub canonical_json: String,
}

#[derive(Clone, Debug)]
pub(crate) struct ReciprocateStart {
    pub from_device: OwnedDeviceId,
    pub secret: String,
}

#[derive(Clone, Debug)]
pub(crate) enum ValidStart {
    Sas(SasStart),
    Reciprocate(ReciprocateStart),
}

impl ValidStart {
    pub fn validate(content: &StartContent) -> Option<Self> {
        let from_device: OwnedDeviceId = non_empty(content.from_device.as_deref())?.into();

        match content.method.as_ref()? {
            VerificationMethod::SasV1 => {
                let list = |l: &Option<Vec<String>>| l.clone().unwrap_or_default();

                let key_agreement_protocols: Vec<KeyAgreementProtocol> =
                    list(&content.key_agreement_protocols).into_iter().map(From::from).collect();
                let hashes: Vec<HashAlgorithm> =
                    list(&content.hashes).into_iter().map(From::from).collect();
                let message_authentication_codes: Vec<MessageAuthenticationCode> =
                    list(&content.message_authentication_codes)
                        .into_iter()
                        .map(From::from)
                        .collect();
                let short_authentication_string: Vec<ShortAuthenticationString> =
                    list(&content.short_authentication_string)
                        .into_iter()
                        .map(From::from)
                        .collect();

                if key_agreement_protocols.is_empty()
                    || !hashes.contains(&HashAlgorithm::Sha256)
                    || !message_authentication_codes.iter().any(|m| m.is_known())
                    || !short_authentication_string.contains(&ShortAuthenticationString::Decimal)
                {
                    return None;
                }

                Some(Self::Sas(SasStart {
                    from_device,
                    key_agreement_protocols,
                    hashes,
                    message_authentication_codes,
                    short_authentication_string,
                    canonical_json: canonical_json(content)?,
                }))
            }
            VerificationMethod::ReciprocateV1 => {
                let secret = non_empty(content.secret.as_deref())?.to_owned();
                Some(Self::Reciprocate(ReciprocateStart { from_device, secret }))
            }
            _ => None,
        }
    }

    pub fn method(&self) -> VerificationMethod {
        match self {
            ValidStart::Sas(_) => VerificationMethod::SasV1,
            ValidStart::Reciprocate(_) => VerificationMethod::ReciprocateV1,
        }
    }

    pub fn from_device(&self) -> &OwnedDeviceId {
        match self {
            ValidStart::Sas(s) => &s.from_device,
            ValidStart::Reciprocate(r) => &r.from_device,
        }
    }
}

/// The canonical JSON form of a start message, sorted keys and no
/// whitespace.
pub(crate) fn canonical_json(content: &StartContent) -> Option<String> {
    let value = serde_json::to_value(content).ok()?;
    let canonical = CanonicalJsonValue::try_from(value).ok()?;

    Some(canonical.to_string())
}

#[derive(Clone, Debug)]
pub(crate) struct ValidAccept {
    pub key_agreement_protocol: KeyAgreementProtocol,
    pub hash: HashAlgorithm,
    pub message_authentication_code: MessageAuthenticationCode,
    pub short_authentication_string: Vec<ShortAuthenticationString>,
    pub commitment: String,
}

impl ValidAccept {
    pub fn validate(content: &AcceptContent) -> Option<Self> {
        let short_authentication_string = content
            .short_authentication_string
            .as_ref()
            .filter(|s| !s.is_empty())?
            .iter()
            .map(|s| ShortAuthenticationString::from(s.as_str()))
            .collect();

        Some(Self {
            key_agreement_protocol: non_empty(content.key_agreement_protocol.as_deref())?.into(),
            hash: non_empty(content.hash.as_deref())?.into(),
            message_authentication_code: non_empty(
                content.message_authentication_code.as_deref(),
            )?
            .into(),
            short_authentication_string,
            commitment: non_empty(content.commitment.as_deref())?.to_owned(),
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ValidKey {
    pub key: String,
}

impl ValidKey {
    pub fn validate(content: &KeyContent) -> Option<Self> {
        Some(Self { key: non_empty(content.key.as_deref())?.to_owned() })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ValidMac {
    pub mac: BTreeMap<String, String>,
    pub keys: String,
}

impl ValidMac {
    pub fn validate(content: &MacContent) -> Option<Self> {
        let mac = content.mac.clone().filter(|m| !m.is_empty())?;
        let keys = non_empty(content.keys.as_deref())?.to_owned();

        Some(Self { mac, keys })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ValidCancel {
    pub code: CancelCode,
    pub reason: Option<String>,
}

impl ValidCancel {
    pub fn validate(content: &CancelContent) -> Option<Self> {
        non_empty(content.code.as_deref())?;

        Some(Self { code: content.cancel_code()?, reason: content.reason.clone() })
    }
}

#[derive(Clone, Debug)]
pub(crate) enum ValidContent {
    Request(ValidRequest),
    Ready(ValidReady),
    Start(ValidStart),
    Accept(ValidAccept),
    Key(ValidKey),
    Mac(ValidMac),
    Done,
    Cancel(ValidCancel),
}

impl ValidContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            ValidContent::Request(_) => MessageKind::Request,
            ValidContent::Ready(_) => MessageKind::Ready,
            ValidContent::Start(_) => MessageKind::Start,
            ValidContent::Accept(_) => MessageKind::Accept,
            ValidContent::Key(_) => MessageKind::Key,
            ValidContent::Mac(_) => MessageKind::Mac,
            ValidContent::Done => MessageKind::Done,
            ValidContent::Cancel(_) => MessageKind::Cancel,
        }
    }
}

/// A message that passed validation, tied to its flow.
#[derive(Clone, Debug)]
pub(crate) struct ValidMessage {
    pub sender: OwnedUserId,
    pub flow_id: FlowId,
    pub content: ValidContent,
}

/// The outcome of validating an incoming message.
#[derive(Debug)]
pub(crate) enum Validation {
    Valid(ValidMessage),
    /// A start message we can't work with, but we know where to send the
    /// cancellation to.
    MalformedStart { flow_id: FlowId, from_device: Option<OwnedDeviceId> },
    Invalid,
}

/// Figure out the flow a message belongs to.
pub(crate) fn flow_id(message: &IncomingVerificationMessage) -> Option<FlowId> {
    let flow = message.content.flow();

    match &message.room_id {
        None => {
            let transaction_id = non_empty(flow.transaction_id.as_deref())?;
            Some(FlowId::ToDevice(OwnedTransactionId::from(transaction_id)))
        }
        Some(room_id) => {
            let event_id = if let VerificationContent::Request(_) = message.content {
                message.event_id.clone()?
            } else {
                let event_id = flow.relates_to.as_ref()?.event_id.as_deref()?;
                EventId::parse(event_id).ok()?
            };

            Some(FlowId::InRoom(room_id.clone(), event_id))
        }
    }
}

/// Validate an incoming message.
pub(crate) fn validate(message: &IncomingVerificationMessage) -> Validation {
    let Some(flow_id) = flow_id(message) else {
        return Validation::Invalid;
    };

    let content = match &message.content {
        VerificationContent::Request(c) => ValidRequest::validate(c).map(ValidContent::Request),
        VerificationContent::Ready(c) => ValidReady::validate(c).map(ValidContent::Ready),
        VerificationContent::Start(c) => match ValidStart::validate(c) {
            Some(s) => Some(ValidContent::Start(s)),
            None => {
                let from_device = c
                    .from_device
                    .as_deref()
                    .filter(|d| !d.is_empty())
                    .map(OwnedDeviceId::from);

                return Validation::MalformedStart { flow_id, from_device };
            }
        },
        VerificationContent::Accept(c) => ValidAccept::validate(c).map(ValidContent::Accept),
        VerificationContent::Key(c) => ValidKey::validate(c).map(ValidContent::Key),
        VerificationContent::Mac(c) => ValidMac::validate(c).map(ValidContent::Mac),
        VerificationContent::Done(_) => Some(ValidContent::Done),
        VerificationContent::Cancel(c) => ValidCancel::validate(c).map(ValidContent::Cancel),
    };

    match content {
        Some(content) => {
            Validation::Valid(ValidMessage { sender: message.sender.clone(), flow_id, content })
        }
        None => Validation::Invalid,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
