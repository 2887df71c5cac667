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

//! The SAS state machine without any side effects.
//!
//! Every transition mutates the [`InnerSas`] and returns a list of
//! [`SasEffect`]s, the [`Sas`](super::Sas) handle executes them once the lock
//! guarding the state machine is released.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use ruma::{DeviceId, UserId};
use subtle::ConstantTimeEq;
use tracing::{info, trace, warn};
use vodozemac::Curve25519PublicKey;

use super::{
    crypto::SasKeys,
    helpers::{
        calculate_commitment, decimals, extra_info_sas, get_mac_content, receive_mac_event,
        EmojiShortAuthString, SasIds,
    },
};
use crate::{
    identities::DeviceData,
    settings::VerificationSettings,
    types::{
        AcceptContent, CancelCode, HashAlgorithm, KeyAgreementProtocol, KeyContent,
        MessageAuthenticationCode, ShortAuthenticationString, StartContent, VerificationContent,
        VerificationMethod,
    },
    verification::{
        done_content,
        event_enums::{canonical_json, MessageKind, SasStart, ValidAccept, ValidContent, ValidMac},
        CancelInfo, Cancelled, FlowId, VerificationResult,
    },
};

const KEY_AGREEMENT_PROTOCOLS: [KeyAgreementProtocol; 2] =
    [KeyAgreementProtocol::Curve25519HkdfSha256, KeyAgreementProtocol::Curve25519];
const HASHES: [HashAlgorithm; 1] = [HashAlgorithm::Sha256];
const MACS: [MessageAuthenticationCode; 2] =
    [MessageAuthenticationCode::HkdfHmacSha256, MessageAuthenticationCode::HmacSha256];
const STRINGS: [ShortAuthenticationString; 2] =
    [ShortAuthenticationString::Decimal, ShortAuthenticationString::Emoji];

/// The number of bytes the short authentication string is derived from.
const SHORT_CODE_BYTES: usize = 6;

/// Which side of the flow we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    /// We sent the `m.key.verification.start` message.
    Initiator,
    /// We received the `m.key.verification.start` message.
    Responder,
}

/// The protocols that were agreed on for a SAS flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedProtocols {
    /// The key agreement protocol.
    pub key_agreement_protocol: KeyAgreementProtocol,
    /// The hash used for the commitment.
    pub hash: HashAlgorithm,
    /// The MAC used to attest the long-term keys.
    pub message_authentication_code: MessageAuthenticationCode,
    /// The ways the short authentication string can be shown.
    pub short_auth_string: Vec<ShortAuthenticationString>,
}

impl AcceptedProtocols {
    /// Pick the first protocol we support of every kind, in the order of
    /// preference of the start message.
    fn negotiate(start: &SasStart) -> Option<Self> {
        let key_agreement_protocol = start
            .key_agreement_protocols
            .iter()
            .find(|p| KEY_AGREEMENT_PROTOCOLS.contains(p))?
            .clone();
        let hash = start.hashes.iter().find(|h| HASHES.contains(h))?.clone();
        let message_authentication_code =
            start.message_authentication_codes.iter().find(|m| MACS.contains(m))?.clone();
        let short_auth_string: Vec<_> = STRINGS
            .iter()
            .filter(|s| start.short_authentication_string.contains(s))
            .cloned()
            .collect();

        (!short_auth_string.is_empty()).then_some(Self {
            key_agreement_protocol,
            hash,
            message_authentication_code,
            short_auth_string,
        })
    }

    /// Check that the other side picked protocols out of the ones we offered.
    fn from_accept(accept: &ValidAccept) -> Option<Self> {
        let offered = KEY_AGREEMENT_PROTOCOLS.contains(&accept.key_agreement_protocol)
            && HASHES.contains(&accept.hash)
            && MACS.contains(&accept.message_authentication_code)
            && accept.short_authentication_string.iter().all(|s| STRINGS.contains(s));

        offered.then(|| Self {
            key_agreement_protocol: accept.key_agreement_protocol.clone(),
            hash: accept.hash.clone(),
            message_authentication_code: accept.message_authentication_code.clone(),
            short_auth_string: accept.short_authentication_string.clone(),
        })
    }

    pub(crate) fn supports_emoji(&self) -> bool {
        self.short_auth_string.contains(&ShortAuthenticationString::Emoji)
    }
}

/// The states of a SAS flow, the sending states are left once the transport
/// confirmed the delivery of the message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum InnerState {
    Created,
    SendingStart,
    Started,
    OnStarted,
    SendingAccept,
    Accepted,
    OnAccepted,
    SendingKey,
    KeySent,
    ShortCodeReady,
    ShortCodeAccepted,
    SendingMac,
    MacSent,
    Verifying,
    Verified,
    Cancelled(Cancelled),
}

impl InnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InnerState::Verified | InnerState::Cancelled(_))
    }
}

/// A state change that should only happen if the state machine didn't move
/// on in the meantime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StateAdvance {
    pub expected: InnerState,
    pub next: InnerState,
}

#[derive(Clone, Debug)]
pub(crate) enum SasEffect {
    /// Send a message, on success apply the `advance`, on failure cancel the
    /// flow with the `on_failure` code.
    Send {
        content: VerificationContent,
        advance: Option<StateAdvance>,
        on_failure: Option<CancelCode>,
    },
    /// The flow is over, the key material has to go.
    ReleaseKeys,
    /// Persist the trust the MAC verification established.
    ApplyTrust { verified_devices: Vec<DeviceData>, master_key_verified: bool },
}

#[derive(Debug)]
pub(crate) struct InnerSas {
    role: Role,
    state: InnerState,
    ids: SasIds,
    flow_id: FlowId,
    /// The canonical JSON of the start message, ours or theirs.
    start_json: Option<String>,
    their_start: Option<SasStart>,
    accepted: Option<AcceptedProtocols>,
    commitment: Option<String>,
    keys: SasKeys,
    short_code: Option<Vec<u8>>,
    our_mac: Option<VerificationContent>,
    their_mac: Option<ValidMac>,
    /// The keys the MAC of the other side attested, set once the MACs were
    /// checked.
    verified: Option<(Vec<DeviceData>, bool)>,
    their_done: bool,
    /// A concurrent start of the other side replaced this flow.
    superseded: bool,
    started_from_request: bool,
    creation_time: Instant,
    last_event_time: Instant,
    flow_timeout: Duration,
    event_timeout: Duration,
}

impl InnerSas {
    fn new(
        role: Role,
        state: InnerState,
        ids: SasIds,
        flow_id: FlowId,
        started_from_request: bool,
        settings: &VerificationSettings,
    ) -> Self {
        let now = Instant::now();

        Self {
            role,
            state,
            ids,
            flow_id,
            start_json: None,
            their_start: None,
            accepted: None,
            commitment: None,
            keys: SasKeys::default(),
            short_code: None,
            our_mac: None,
            their_mac: None,
            verified: None,
            their_done: false,
            superseded: false,
            started_from_request,
            creation_time: now,
            last_event_time: now,
            flow_timeout: settings.flow_timeout,
            event_timeout: settings.event_timeout,
        }
    }

    /// Create a flow that we are going to start.
    pub fn new_initiator(
        ids: SasIds,
        flow_id: FlowId,
        started_from_request: bool,
        settings: &VerificationSettings,
    ) -> Self {
        Self::new(
            Role::Initiator,
            InnerState::Created,
            ids,
            flow_id,
            started_from_request,
            settings,
        )
    }

    /// Create a flow from a start message the other side sent.
    pub fn from_start(
        ids: SasIds,
        flow_id: FlowId,
        start: SasStart,
        started_from_request: bool,
        settings: &VerificationSettings,
    ) -> Self {
        let mut sas = Self::new(
            Role::Responder,
            InnerState::OnStarted,
            ids,
            flow_id,
            started_from_request,
            settings,
        );

        sas.start_json = Some(start.canonical_json.clone());
        sas.their_start = Some(start);

        sas
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &InnerState {
        &self.state
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn ids(&self) -> &SasIds {
        &self.ids
    }

    pub fn accepted_protocols(&self) -> Option<&AcceptedProtocols> {
        self.accepted.as_ref()
    }

    pub fn started_from_request(&self) -> bool {
        self.started_from_request
    }

    pub fn their_done(&self) -> bool {
        self.their_done
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match &self.state {
            InnerState::Cancelled(c) => Some(c.clone().into()),
            _ => None,
        }
    }

    /// The devices and whether the master key got verified, once the MAC of
    /// the other side was checked.
    pub fn verified(&self) -> Option<(&[DeviceData], bool)> {
        self.verified.as_ref().map(|(devices, master_key)| (devices.as_slice(), *master_key))
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded
    }

    pub fn keys_released(&self) -> bool {
        self.keys.is_released()
    }

    pub fn other_user_id(&self) -> &UserId {
        self.ids.other_device.user_id()
    }

    pub fn other_device_id(&self) -> &DeviceId {
        self.ids.other_device.device_id()
    }

    /// Has the flow been inactive for too long.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > self.flow_timeout
            || self.last_event_time.elapsed() > self.event_timeout
    }

    #[cfg(test)]
    pub fn set_creation_time(&mut self, time: Instant) {
        self.creation_time = time;
    }

    #[cfg(test)]
    pub fn force_state(&mut self, state: InnerState) {
        self.state = state;
    }

    fn set_state(&mut self, state: InnerState) {
        trace!(
            flow_id = self.flow_id.as_str(),
            old_state = ?self.state,
            new_state = ?state,
            "SAS state changed"
        );

        self.state = state;
    }

    fn send(
        &self,
        content: VerificationContent,
        sending: InnerState,
        next: InnerState,
    ) -> SasEffect {
        SasEffect::Send {
            content,
            advance: Some(StateAdvance { expected: sending, next }),
            on_failure: Some(CancelCode::User),
        }
    }

    /// The short authentication string as a tuple of three numbers.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        decimals(self.short_code.as_deref()?)
    }

    /// The short authentication string as seven emojis, if the other side
    /// supports them.
    pub fn emoji(&self) -> Option<EmojiShortAuthString> {
        if self.accepted.as_ref()?.supports_emoji() {
            EmojiShortAuthString::from_bytes(self.short_code.as_deref()?)
        } else {
            None
        }
    }

    /// Build and send our start message.
    pub fn start(&mut self) -> Vec<SasEffect> {
        if self.role != Role::Initiator || self.state != InnerState::Created {
            return Vec::new();
        }

        let content = StartContent {
            from_device: Some(self.ids.own_device.device_id().to_string()),
            method: Some(VerificationMethod::SasV1),
            key_agreement_protocols: Some(
                KEY_AGREEMENT_PROTOCOLS.iter().map(ToString::to_string).collect(),
            ),
            hashes: Some(HASHES.iter().map(ToString::to_string).collect()),
            message_authentication_codes: Some(MACS.iter().map(ToString::to_string).collect()),
            short_authentication_string: Some(STRINGS.iter().map(ToString::to_string).collect()),
            secret: None,
            flow: self.flow_id.flow_fields(),
            other: BTreeMap::new(),
        };

        let Some(start_json) = canonical_json(&content) else {
            return self.cancel(true, CancelCode::InvalidMessage);
        };

        self.start_json = Some(start_json);
        self.set_state(InnerState::SendingStart);

        vec![self.send(
            VerificationContent::Start(content),
            InnerState::SendingStart,
            InnerState::Started,
        )]
    }

    /// Accept the start message of the other side.
    ///
    /// This is a no-op unless we are the responder and didn't accept yet.
    pub fn accept(&mut self) -> Vec<SasEffect> {
        if self.state != InnerState::OnStarted {
            return Vec::new();
        }

        let Some(accepted) = self.their_start.as_ref().and_then(AcceptedProtocols::negotiate)
        else {
            return self.cancel(true, CancelCode::UnknownMethod);
        };

        let (Some(public_key), Some(start_json)) = (self.keys.public_key(), &self.start_json)
        else {
            return self.cancel(true, CancelCode::InvalidMessage);
        };

        let content = AcceptContent {
            method: Some(VerificationMethod::SasV1),
            key_agreement_protocol: Some(accepted.key_agreement_protocol.to_string()),
            hash: Some(accepted.hash.to_string()),
            message_authentication_code: Some(accepted.message_authentication_code.to_string()),
            short_authentication_string: Some(
                accepted.short_auth_string.iter().map(ToString::to_string).collect(),
            ),
            commitment: Some(calculate_commitment(public_key, start_json)),
            flow: self.flow_id.flow_fields(),
        };

        self.accepted = Some(accepted);
        self.set_state(InnerState::SendingAccept);

        vec![self.send(
            VerificationContent::Accept(content),
            InnerState::SendingAccept,
            InnerState::Accepted,
        )]
    }

    /// Is a message of the given kind allowed in our current state.
    fn accepts(&self, kind: MessageKind) -> bool {
        use InnerState::*;

        match (self.role, kind) {
            (_, MessageKind::Cancel) => true,
            (Role::Initiator, MessageKind::Accept) => matches!(self.state, SendingStart | Started),
            (Role::Initiator, MessageKind::Key) => matches!(self.state, SendingKey | KeySent),
            (Role::Initiator, MessageKind::Mac) => matches!(
                self.state,
                KeySent | ShortCodeReady | ShortCodeAccepted | SendingMac | MacSent
            ),
            (Role::Responder, MessageKind::Key) => {
                matches!(self.state, SendingAccept | Accepted)
            }
            (Role::Responder, MessageKind::Mac) => matches!(
                self.state,
                SendingKey | KeySent | ShortCodeReady | ShortCodeAccepted | SendingMac | MacSent
            ),
            (_, MessageKind::Done) => matches!(self.state, SendingMac | MacSent | Verifying),
            _ => false,
        }
    }

    /// Feed a message of the other side into the state machine.
    pub fn receive(&mut self, content: &ValidContent) -> Vec<SasEffect> {
        if self.state.is_terminal() {
            trace!(
                flow_id = self.flow_id.as_str(),
                kind = ?content.kind(),
                "Ignoring a message for a finished SAS flow"
            );
            return Vec::new();
        }

        self.last_event_time = Instant::now();

        if !self.accepts(content.kind()) {
            warn!(
                flow_id = self.flow_id.as_str(),
                kind = ?content.kind(),
                state = ?self.state,
                "Received an unexpected SAS message"
            );
            return self.cancel(true, CancelCode::UnexpectedMessage);
        }

        match content {
            ValidContent::Cancel(c) => self.cancel(false, c.code.clone()),
            ValidContent::Accept(a) => self.receive_accept(a),
            ValidContent::Key(k) => self.receive_key(&k.key),
            ValidContent::Mac(m) => self.receive_mac(m),
            ValidContent::Done => {
                self.their_done = true;
                Vec::new()
            }
            ValidContent::Request(_) | ValidContent::Ready(_) | ValidContent::Start(_) => {
                Vec::new()
            }
        }
    }

    fn receive_accept(&mut self, accept: &ValidAccept) -> Vec<SasEffect> {
        let Some(accepted) = AcceptedProtocols::from_accept(accept) else {
            return self.cancel(true, CancelCode::UnknownMethod);
        };

        self.accepted = Some(accepted);
        self.commitment = Some(accept.commitment.clone());
        self.set_state(InnerState::OnAccepted);

        self.send_key()
    }

    fn send_key(&mut self) -> Vec<SasEffect> {
        let Some(public_key) = self.keys.public_key() else {
            return self.cancel(true, CancelCode::InvalidMessage);
        };

        self.set_state(InnerState::SendingKey);

        let content = VerificationContent::Key(KeyContent {
            key: Some(public_key.to_base64()),
            flow: self.flow_id.flow_fields(),
        });

        vec![self.send(content, InnerState::SendingKey, InnerState::KeySent)]
    }

    fn check_commitment(&self, their_key: &str) -> bool {
        let (Some(commitment), Some(start_json)) = (&self.commitment, &self.start_json) else {
            return false;
        };

        let Ok(their_key) = Curve25519PublicKey::from_base64(their_key) else {
            return false;
        };

        let calculated = calculate_commitment(their_key, start_json);

        calculated.as_bytes().ct_eq(commitment.as_bytes()).into()
    }

    fn receive_key(&mut self, their_key: &str) -> Vec<SasEffect> {
        let mut effects = match self.role {
            Role::Initiator => {
                if !self.check_commitment(their_key) {
                    return self.cancel(true, CancelCode::MismatchedCommitment);
                }

                Vec::new()
            }
            Role::Responder => self.send_key(),
        };

        if self.state.is_terminal() {
            return effects;
        }

        let Some(protocol) = self.accepted.as_ref().map(|a| a.key_agreement_protocol.clone())
        else {
            return self.cancel(true, CancelCode::UnexpectedMessage);
        };

        let we_started = self.role == Role::Initiator;

        let ids = &self.ids;
        let flow_id = self.flow_id.as_str();

        let short_code = self.keys.establish(their_key).and_then(|keys| {
            let info = extra_info_sas(ids, &protocol, keys, flow_id, we_started);
            keys.short_code_bytes(&info, SHORT_CODE_BYTES)
        });

        match short_code {
            Ok(bytes) => {
                self.short_code = Some(bytes);
                self.set_state(InnerState::ShortCodeReady);
            }
            Err(e) => {
                warn!(flow_id = self.flow_id.as_str(), error = ?e, "Invalid SAS key");
                effects.extend(self.cancel(true, CancelCode::KeyMismatch));
            }
        }

        effects
    }

    fn receive_mac(&mut self, mac: &ValidMac) -> Vec<SasEffect> {
        self.their_mac = Some(mac.clone());

        if self.our_mac.is_some() {
            self.verify()
        } else {
            Vec::new()
        }
    }

    /// The user confirmed that the short authentication strings match.
    pub fn confirm(&mut self) -> Vec<SasEffect> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        if self.state != InnerState::ShortCodeReady {
            return self.cancel(true, CancelCode::UnexpectedMessage);
        }

        self.set_state(InnerState::ShortCodeAccepted);

        let (Some(keys), Some(accepted)) = (self.keys.established(), &self.accepted) else {
            return self.cancel(true, CancelCode::UnexpectedMessage);
        };

        let content = match get_mac_content(
            keys,
            &self.ids,
            &self.flow_id,
            &accepted.message_authentication_code,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(flow_id = self.flow_id.as_str(), error = ?e, "Can't calculate our MAC");
                return self.cancel(true, CancelCode::InvalidMessage);
            }
        };

        self.our_mac = Some(content.clone());
        self.set_state(InnerState::SendingMac);

        let mut effects = vec![self.send(content, InnerState::SendingMac, InnerState::MacSent)];

        if self.their_mac.is_some() {
            effects.extend(self.verify());
        }

        effects
    }

    /// The user said the short authentication strings don't match.
    pub fn mismatch(&mut self) -> Vec<SasEffect> {
        self.cancel(true, CancelCode::MismatchedSas)
    }

    fn verify(&mut self) -> Vec<SasEffect> {
        let (Some(keys), Some(accepted), Some(their_mac)) =
            (self.keys.established(), &self.accepted, &self.their_mac)
        else {
            return Vec::new();
        };

        let result = receive_mac_event(
            keys,
            &self.ids,
            self.flow_id.as_str(),
            self.ids.other_device.user_id(),
            &accepted.message_authentication_code,
            their_mac,
        );

        match result {
            Ok((verified_devices, master_key_verified)) => {
                self.verified = Some((verified_devices.clone(), master_key_verified));
                self.set_state(InnerState::Verifying);
                vec![SasEffect::ApplyTrust { verified_devices, master_key_verified }]
            }
            Err(code) => self.cancel(true, code),
        }
    }

    /// The trust store finished marking the verified keys.
    pub fn trust_applied(&mut self, result: VerificationResult) -> Vec<SasEffect> {
        if self.state != InnerState::Verifying {
            return Vec::new();
        }

        match result {
            VerificationResult::Ok => {
                self.set_state(InnerState::Verified);
                self.keys.release();

                vec![
                    SasEffect::ReleaseKeys,
                    SasEffect::Send {
                        content: done_content(&self.flow_id),
                        advance: None,
                        on_failure: None,
                    },
                ]
            }
            VerificationResult::Cancel(code) => self.cancel(true, code),
        }
    }

    /// Apply a confirmed delivery.
    pub fn mark_sent(&mut self, advance: &StateAdvance) {
        if self.state == advance.expected {
            self.set_state(advance.next.clone());
        }
    }

    /// A message couldn't be delivered.
    pub fn send_failed(&mut self, code: CancelCode) -> Vec<SasEffect> {
        self.cancel(true, code)
    }

    /// The flow has been inactive for too long.
    pub fn time_out(&mut self) -> Vec<SasEffect> {
        self.cancel(true, CancelCode::Timeout)
    }

    /// Cancel the flow, does nothing if the flow is already over.
    pub fn cancel(&mut self, cancelled_by_us: bool, code: CancelCode) -> Vec<SasEffect> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        info!(
            flow_id = self.flow_id.as_str(),
            cancelled_by_us,
            code = code.as_str(),
            "Cancelling a SAS verification"
        );

        let cancelled = Cancelled::new(cancelled_by_us, code);
        let content = cancelled.as_content(&self.flow_id);

        self.set_state(InnerState::Cancelled(cancelled));
        self.keys.release();

        let mut effects = Vec::new();

        if cancelled_by_us {
            effects.push(SasEffect::Send { content, advance: None, on_failure: None });
        }

        effects.push(SasEffect::ReleaseKeys);

        effects
    }

    /// Drop the flow without telling the other side, used when a concurrent
    /// start of the other side replaced ours.
    pub fn supersede(&mut self) {
        if !self.state.is_terminal() {
            self.superseded = true;
            self.set_state(InnerState::Cancelled(Cancelled::new(true, CancelCode::User)));
            self.keys.release();
        }
    }
}
