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

use std::sync::Arc;

use futures_core::Stream;
use ruma::{
    to_device::DeviceIdOrAllDevices, DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId,
    RoomId, UserId,
};
use tracing::{debug, info, instrument, trace, warn};

use super::{
    cache::{VerificationCache, VerificationEvent},
    event_enums::{validate, ValidContent, ValidMessage, ValidRequest, ValidStart, Validation},
    requests::VerificationRequest,
    FlowContext, FlowId, QrVerification, Sas, Verification,
};
use crate::{
    error::VerificationError,
    identities::DeviceData,
    settings::VerificationSettings,
    store::{KeyGossip, StoreError, TrustStore, VerificationStore},
    transport::{OutgoingVerificationRequest, Recipient, VerificationTransport},
    types::{
        new_transaction_id, CancelCode, FlowFields, IncomingVerificationMessage,
        VerificationMethod,
    },
};

/// Requests older than this are ignored.
const MAX_REQUEST_AGE_MS: u64 = 10 * 60 * 1000;
/// Requests that are this far into the future are ignored.
const MAX_REQUEST_SKEW_MS: u64 = 5 * 60 * 1000;

/// The entry point for interactive verifications.
///
/// The machine routes incoming verification messages to the requests and
/// flows they belong to, and lets you start new ones.
#[derive(Clone, Debug)]
pub struct VerificationMachine {
    context: FlowContext,
}

impl VerificationMachine {
    /// Create a new machine for our own device.
    pub fn new(
        own_device: DeviceData,
        store: Arc<dyn TrustStore>,
        transport: Arc<dyn VerificationTransport>,
        settings: VerificationSettings,
    ) -> Self {
        let cache = VerificationCache::new(&settings);

        Self {
            context: FlowContext {
                store: VerificationStore::new(own_device, store),
                transport,
                cache,
                settings,
                key_gossip: None,
            },
        }
    }

    /// Get notified once a verification with another one of our own devices
    /// completed.
    pub fn with_key_gossip(mut self, key_gossip: Arc<dyn KeyGossip>) -> Self {
        self.context.key_gossip = Some(key_gossip);
        self
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        self.context.store.user_id()
    }

    /// Our own device id.
    pub fn own_device_id(&self) -> &DeviceId {
        self.context.store.device_id()
    }

    /// The settings the machine was created with.
    pub fn settings(&self) -> &VerificationSettings {
        &self.context.settings
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &VerificationCache {
        &self.context.cache
    }

    /// Request a verification over to-device messages.
    ///
    /// The request goes out to all the devices of the user, our own device
    /// excluded. Previous unfinished to-device requests with the user are
    /// cancelled.
    pub async fn request_verification(
        &self,
        user_id: &UserId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Result<VerificationRequest, VerificationError> {
        let methods = methods.unwrap_or_else(|| self.context.settings.methods.clone());

        let mut devices: Vec<OwnedDeviceId> =
            self.context.store.get_user_devices(user_id).await?.into_keys().collect();

        if user_id == self.own_user_id() {
            devices.retain(|d| **d != *self.own_device_id());
        }

        for old in self.context.cache.get_requests(user_id) {
            if old.room_id().is_none() && !old.is_terminal() {
                info!(
                    user_id = ?user_id,
                    flow_id = old.flow_id().as_str(),
                    "Cancelling a previous verification request, a new one was started"
                );
                old.cancel_with_code(CancelCode::User).await;
            }
        }

        let transaction_id = new_transaction_id();
        let content = VerificationRequest::request_content(
            self.own_device_id(),
            methods.clone(),
            FlowFields::to_device(transaction_id.as_str()),
            None,
        );
        let flow_id = FlowId::ToDevice(transaction_id);

        let recipients = if devices.is_empty() {
            vec![DeviceIdOrAllDevices::AllDevices]
        } else {
            devices.iter().cloned().map(DeviceIdOrAllDevices::DeviceId).collect()
        };

        let request = VerificationRequest::new(
            self.context.clone(),
            flow_id.clone(),
            user_id,
            devices,
            methods,
        );

        let outgoing = OutgoingVerificationRequest::for_flow(
            &flow_id,
            user_id.to_owned(),
            recipients,
            content,
        );
        self.context.send(&outgoing).await?;

        self.context.cache.add_request(request.clone(), request.snapshot());

        Ok(request)
    }

    /// Request a verification inside of a room.
    ///
    /// The room should be a direct message room with the user, the event id of
    /// the request becomes the flow id.
    pub async fn request_verification_in_room(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> Result<VerificationRequest, VerificationError> {
        let methods = methods.unwrap_or_else(|| self.context.settings.methods.clone());

        let content = VerificationRequest::request_content(
            self.own_device_id(),
            methods.clone(),
            FlowFields::default(),
            Some(user_id),
        );

        let recipient = Recipient::InRoom { room_id: room_id.to_owned() };
        let outgoing = OutgoingVerificationRequest::new(recipient, content);
        let event_id =
            self.context.send(&outgoing).await?.event_id.ok_or(VerificationError::MissingEventId)?;

        let flow_id = FlowId::InRoom(room_id.to_owned(), event_id);
        let request =
            VerificationRequest::new(self.context.clone(), flow_id, user_id, Vec::new(), methods);

        self.context.cache.add_request(request.clone(), request.snapshot());

        Ok(request)
    }

    /// Start a SAS verification with the given device without sending a
    /// request first.
    pub async fn start_sas(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Sas, VerificationError> {
        let device = self.context.store.get_device(user_id, device_id).await?.ok_or_else(|| {
            VerificationError::UnknownDevice(user_id.to_owned(), device_id.to_owned())
        })?;

        let flow_id = FlowId::ToDevice(new_transaction_id());
        let sas = Sas::start(self.context.clone(), device, flow_id, None).await?;

        self.context.cache.insert(sas.clone());
        sas.send_start().await;

        Ok(sas)
    }

    /// Get a verification request with the given user and flow id.
    pub fn get_request(
        &self,
        user_id: &UserId,
        flow_id: impl AsRef<str>,
    ) -> Option<VerificationRequest> {
        self.context.cache.get_request(user_id, flow_id.as_ref())
    }

    /// Get all the verification requests with the given user.
    pub fn get_requests(&self, user_id: &UserId) -> Vec<VerificationRequest> {
        self.context.cache.get_requests(user_id)
    }

    /// Get a running verification flow.
    pub fn get_verification(&self, user_id: &UserId, flow_id: &str) -> Option<Verification> {
        self.context.cache.get(user_id, flow_id)
    }

    /// Get a running SAS verification.
    pub fn get_sas(&self, user_id: &UserId, flow_id: &str) -> Option<Sas> {
        self.context.cache.get_sas(user_id, flow_id)
    }

    /// Get a running QR code verification.
    pub fn get_qr(&self, user_id: &UserId, flow_id: &str) -> Option<QrVerification> {
        self.context.cache.get_qr(user_id, flow_id)
    }

    /// Listen to requests and flows being added or changing their state.
    pub fn events(&self) -> impl Stream<Item = VerificationEvent> {
        self.context.cache.events()
    }

    /// Cancel the requests and flows that timed out and forget the ones that
    /// are over.
    pub async fn garbage_collect(&self) {
        for request in self.context.cache.requests() {
            if request.cancel_if_timed_out().await {
                debug!(flow_id = request.flow_id().as_str(), "Verification request timed out");
            }
        }

        for verification in self.context.cache.transactions() {
            let timed_out = match &verification {
                Verification::SasV1(sas) => sas.cancel_if_timed_out().await,
                Verification::QrV1(qr) => qr.cancel_if_timed_out().await,
            };

            if timed_out {
                debug!(flow_id = verification.flow_id().as_str(), "Verification flow timed out");
            }
        }

        self.context.cache.prune();
    }

    fn is_timestamp_valid(timestamp: MilliSecondsSinceUnixEpoch) -> bool {
        let timestamp = u64::from(timestamp.0);
        let now = u64::from(MilliSecondsSinceUnixEpoch::now().0);

        !(now.saturating_sub(timestamp) > MAX_REQUEST_AGE_MS
            || timestamp.saturating_sub(now) > MAX_REQUEST_SKEW_MS)
    }

    fn sent_by_us(&self, message: &IncomingVerificationMessage) -> bool {
        *message.sender == *self.own_user_id()
            && message.content.from_device() == Some(self.own_device_id().as_str())
    }

    /// Hand an incoming verification message to the machine.
    ///
    /// Messages that aren't valid are dropped, protocol violations cancel the
    /// flow they belong to.
    #[instrument(
        skip_all,
        fields(sender = ?message.sender, event_type = message.content.event_type())
    )]
    pub async fn receive_message(
        &self,
        message: IncomingVerificationMessage,
    ) -> Result<(), StoreError> {
        if self.sent_by_us(&message) {
            trace!("Ignoring a verification message we sent ourselves");
            return Ok(());
        }

        match validate(&message) {
            Validation::Valid(valid) => self.receive_valid(&message, valid).await,
            Validation::MalformedStart { flow_id, from_device } => {
                warn!(
                    flow_id = flow_id.as_str(),
                    "Received a start message we can't handle, cancelling"
                );
                self.refuse_start(&message.sender, &flow_id, from_device.as_deref()).await;
                Ok(())
            }
            Validation::Invalid => {
                warn!("Ignoring an invalid verification message");
                Ok(())
            }
        }
    }

    async fn receive_valid(
        &self,
        message: &IncomingVerificationMessage,
        valid: ValidMessage,
    ) -> Result<(), StoreError> {
        let ValidMessage { sender, flow_id, content } = valid;

        // In a room we see what our other devices do with requests that were
        // sent to our user.
        if flow_id.room_id().is_some() && *sender == *self.own_user_id() {
            if let Some(request) = self.context.cache.find_request(&flow_id) {
                if matches!(
                    content,
                    ValidContent::Ready(_) | ValidContent::Done | ValidContent::Cancel(_)
                ) {
                    request.receive(&sender, &content).await;
                }
            }

            return Ok(());
        }

        let request = self.get_request(&sender, flow_id.as_str());
        let verification = self.get_verification(&sender, flow_id.as_str());

        match &content {
            ValidContent::Request(r) => self.receive_request(message, &sender, flow_id, r).await,
            ValidContent::Ready(_) => match request {
                Some(request) => request.receive(&sender, &content).await,
                None => warn!(
                    sender = ?sender,
                    flow_id = flow_id.as_str(),
                    "Received a ready message for an unknown request"
                ),
            },
            ValidContent::Start(start) => match request {
                Some(request) => request.receive(&sender, &content).await,
                None => self.receive_start_without_request(&sender, &flow_id, start).await?,
            },
            ValidContent::Accept(_) | ValidContent::Key(_) | ValidContent::Mac(_) => {
                match verification {
                    Some(verification) => verification.receive(&content).await,
                    None => warn!(
                        sender = ?sender,
                        flow_id = flow_id.as_str(),
                        "Received a verification message for an unknown flow"
                    ),
                }
            }
            ValidContent::Done => {
                if let Some(verification) = verification {
                    verification.receive(&content).await;
                }

                if let Some(request) = request {
                    request.receive(&sender, &content).await;
                }
            }
            ValidContent::Cancel(cancel) => {
                info!(
                    sender = ?sender,
                    flow_id = flow_id.as_str(),
                    code = cancel.code.as_str(),
                    "The other side cancelled the verification"
                );

                if let Some(verification) = verification {
                    verification.receive(&content).await;
                }

                if let Some(request) = request {
                    request.receive(&sender, &content).await;
                }
            }
        }

        Ok(())
    }

    async fn receive_request(
        &self,
        message: &IncomingVerificationMessage,
        sender: &UserId,
        flow_id: FlowId,
        request: &ValidRequest,
    ) {
        info!(
            from_device = request.from_device.as_str(),
            flow_id = flow_id.as_str(),
            "Received a new verification request",
        );

        if flow_id.room_id().is_some() && request.to.as_deref() != Some(self.own_user_id()) {
            trace!(
                flow_id = flow_id.as_str(),
                "Ignoring an in-room verification request that isn't meant for us"
            );
            return;
        }

        let timestamp = match flow_id {
            FlowId::InRoom(..) => message.origin_server_ts,
            FlowId::ToDevice(_) => request.timestamp,
        };

        if let Some(timestamp) = timestamp {
            if !Self::is_timestamp_valid(timestamp) {
                trace!(
                    from_device = request.from_device.as_str(),
                    ?timestamp,
                    "The received verification request was too old or too far into the future",
                );
                return;
            }
        }

        if self.get_request(sender, flow_id.as_str()).is_some() {
            debug!(flow_id = flow_id.as_str(), "Ignoring known verification request");
            return;
        }

        if flow_id.room_id().is_none() {
            for old in self.get_requests(sender) {
                if old.room_id().is_none() && !old.is_terminal() {
                    warn!(
                        flow_id = old.flow_id().as_str(),
                        "Received a new verification request whilst another request with the \
                         same user is ongoing, cancelling the old one"
                    );
                    old.cancel_with_code(CancelCode::User).await;
                }
            }
        }

        let new_request =
            VerificationRequest::from_request(self.context.clone(), flow_id, sender, request);
        self.context.cache.add_request(new_request.clone(), new_request.snapshot());
    }

    /// A start message that doesn't belong to any request, only SAS is
    /// supported for those and only over to-device messages.
    async fn receive_start_without_request(
        &self,
        sender: &UserId,
        flow_id: &FlowId,
        start: &ValidStart,
    ) -> Result<(), StoreError> {
        if flow_id.room_id().is_some() {
            warn!(
                sender = ?sender,
                flow_id = flow_id.as_str(),
                "Received an in-room start message for an unknown request"
            );
            return Ok(());
        }

        if let Some(verification) = self.get_verification(sender, flow_id.as_str()) {
            verification.receive(&ValidContent::Start(start.clone())).await;
            return Ok(());
        }

        let from_device: &DeviceId = start.from_device();

        let Some(device) = self.context.store.get_device(sender, from_device).await? else {
            warn!(
                sender = ?sender,
                device_id = ?from_device,
                "Received a key verification start message from an unknown device",
            );
            self.send_cancel(sender, flow_id, Some(from_device), CancelCode::User).await;
            return Ok(());
        };

        let ValidStart::Sas(sas_start) = start else {
            warn!(
                sender = ?sender,
                flow_id = flow_id.as_str(),
                "Received a reciprocation for a QR code we never showed"
            );
            self.send_cancel(sender, flow_id, Some(from_device), CancelCode::UnexpectedMessage)
                .await;
            return Ok(());
        };

        let running: Vec<Sas> = self
            .context
            .cache
            .get_transactions(sender)
            .into_iter()
            .filter_map(Verification::sas_v1)
            .filter(|s| s.other_device_id() == from_device && s.flow_id() != flow_id)
            .filter(|s| !s.is_done() && !s.is_cancelled())
            .collect();

        if !running.is_empty() {
            warn!(
                sender = ?sender,
                device_id = ?from_device,
                "Received a new SAS start while another SAS verification with the device is \
                 running, cancelling both"
            );

            for sas in running {
                sas.cancel_with_code(CancelCode::UnexpectedMessage).await;
            }

            self.send_cancel(sender, flow_id, Some(from_device), CancelCode::UnexpectedMessage)
                .await;

            return Ok(());
        }

        let sas =
            Sas::from_start(self.context.clone(), device, flow_id.clone(), sas_start.clone(), None)
                .await?;

        info!(flow_id = flow_id.as_str(), "Started a new SAS verification");
        self.context.cache.insert(sas);

        Ok(())
    }

    /// A start we couldn't parse, cancel whatever the flow belongs to.
    async fn refuse_start(
        &self,
        sender: &UserId,
        flow_id: &FlowId,
        from_device: Option<&DeviceId>,
    ) {
        if let Some(request) = self.get_request(sender, flow_id.as_str()) {
            request.cancel_with_code(CancelCode::UnknownMethod).await;
        } else if let Some(verification) = self.get_verification(sender, flow_id.as_str()) {
            verification.cancel_with_code(CancelCode::UnknownMethod).await;
        } else {
            self.send_cancel(sender, flow_id, from_device, CancelCode::UnknownMethod).await;
        }
    }

    /// Cancel a flow we don't keep any state for.
    async fn send_cancel(
        &self,
        user_id: &UserId,
        flow_id: &FlowId,
        device_id: Option<&DeviceId>,
        code: CancelCode,
    ) {
        let recipient = match flow_id {
            FlowId::ToDevice(_) => Recipient::ToDevice {
                user_id: user_id.to_owned(),
                devices: vec![device_id.map_or(DeviceIdOrAllDevices::AllDevices, |d| {
                    DeviceIdOrAllDevices::DeviceId(d.to_owned())
                })],
            },
            FlowId::InRoom(room_id, _) => Recipient::InRoom { room_id: room_id.clone() },
        };

        info!(flow_id = flow_id.as_str(), code = code.as_str(), "Refusing a verification flow");

        if let Err(e) = self.context.transport.cancel(flow_id, recipient, code).await {
            warn!(flow_id = flow_id.as_str(), error = ?e, "Couldn't send the cancellation");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use ruma::{
        event_id, room_id, user_id, EventId, MilliSecondsSinceUnixEpoch, RoomId, UInt,
    };

    use super::VerificationMachine;
    use crate::{
        settings::VerificationSettings,
        transport::Recipient,
        types::{
            CancelCode, FlowFields, IncomingVerificationMessage, RequestContent, StartContent,
            VerificationContent, VerificationMethod,
        },
        verification::{
            done_content,
            tests::{deliver_all, setup_pair, setup_self_pair, TestDevice},
            VerificationRequestState,
        },
    };

    fn request_at(device: &TestDevice, timestamp: Option<u64>) -> VerificationContent {
        VerificationContent::Request(RequestContent {
            from_device: Some(device.device_id().to_string()),
            methods: Some(vec![VerificationMethod::SasV1]),
            timestamp,
            to: None,
            flow: FlowFields::to_device("some_transaction"),
        })
    }

    async fn deliver_in_room(
        to: &TestDevice,
        sender: &TestDevice,
        room_id: &RoomId,
        event_id: &EventId,
        content: VerificationContent,
    ) {
        to.machine
            .receive_message(IncomingVerificationMessage::in_room(
                sender.user_id().to_owned(),
                room_id.to_owned(),
                event_id.to_owned(),
                MilliSecondsSinceUnixEpoch::now(),
                content,
            ))
            .await
            .unwrap();
    }

    fn now_ms() -> u64 {
        u64::from(MilliSecondsSinceUnixEpoch::now().0)
    }

    #[test]
    fn timestamp_window() {
        let now = now_ms();
        let at = |ms: u64| MilliSecondsSinceUnixEpoch(UInt::new_saturating(ms));

        assert!(VerificationMachine::is_timestamp_valid(at(now)));
        assert!(VerificationMachine::is_timestamp_valid(at(now - 9 * 60 * 1000)));
        assert!(!VerificationMachine::is_timestamp_valid(at(now - 11 * 60 * 1000)));
        assert!(VerificationMachine::is_timestamp_valid(at(now + 4 * 60 * 1000)));
        assert!(!VerificationMachine::is_timestamp_valid(at(now + 6 * 60 * 1000)));
    }

    #[tokio::test]
    async fn stale_and_future_requests_are_ignored() {
        let (alice, bob) = setup_pair().await;

        alice.send_to(&bob, request_at(&alice, Some(now_ms() - 11 * 60 * 1000))).await;
        assert!(bob.machine.get_requests(alice.user_id()).is_empty());

        alice.send_to(&bob, request_at(&alice, Some(now_ms() + 6 * 60 * 1000))).await;
        assert!(bob.machine.get_requests(alice.user_id()).is_empty());

        // A missing timestamp is fine.
        alice.send_to(&bob, request_at(&alice, None)).await;
        assert_eq!(bob.machine.get_requests(alice.user_id()).len(), 1);
    }

    #[tokio::test]
    async fn in_room_requests_for_someone_else_are_ignored() {
        let (alice, bob) = setup_pair().await;
        let room_id = room_id!("!room:example.org");

        let content = VerificationContent::Request(RequestContent {
            from_device: Some(alice.device_id().to_string()),
            methods: Some(vec![VerificationMethod::SasV1]),
            timestamp: None,
            to: Some("@carol:example.org".to_owned()),
            flow: FlowFields::default(),
        });

        deliver_in_room(&bob, &alice, room_id, event_id!("$request:example.org"), content).await;

        assert!(bob.machine.get_requests(alice.user_id()).is_empty());
    }

    #[tokio::test]
    async fn our_own_messages_are_ignored() {
        let (phone, laptop) = setup_self_pair().await;

        phone.send_to(&phone, request_at(&phone, None)).await;
        assert!(phone.machine.get_requests(phone.user_id()).is_empty());

        phone.send_to(&laptop, request_at(&phone, None)).await;
        assert_eq!(laptop.machine.get_requests(phone.user_id()).len(), 1);
    }

    #[tokio::test]
    async fn malformed_starts_are_cancelled() {
        let (alice, bob) = setup_pair().await;

        let start = VerificationContent::Start(StartContent {
            from_device: Some(alice.device_id().to_string()),
            method: Some(VerificationMethod::SasV1),
            key_agreement_protocols: Some(vec!["curve25519-hkdf-sha256".to_owned()]),
            hashes: Some(vec!["sha256".to_owned()]),
            message_authentication_codes: Some(vec!["hkdf-hmac-sha256".to_owned()]),
            // Decimal support is mandatory.
            short_authentication_string: Some(vec!["emoji".to_owned()]),
            flow: FlowFields::to_device("malformed"),
            ..Default::default()
        });

        alice.send_to(&bob, start).await;

        assert!(bob.machine.get_verification(alice.user_id(), "malformed").is_none());

        let (cancel, _) = bob.transport.pop().unwrap();
        assert_matches!(cancel.content, VerificationContent::Cancel(content) => {
            assert_eq!(content.cancel_code(), Some(CancelCode::UnknownMethod));
            assert_eq!(content.flow.transaction_id.as_deref(), Some("malformed"));
        });
    }

    #[tokio::test]
    async fn starts_from_unknown_devices_are_refused() {
        let (alice, bob) = setup_pair().await;
        let sas = alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();

        bob.store.remove_device(alice.user_id(), alice.device_id());
        deliver_all(&alice, &bob).await;

        assert!(bob.machine.get_sas(alice.user_id(), sas.flow_id().as_str()).is_none());

        deliver_all(&bob, &alice).await;
        assert_matches!(sas.cancel_info(), Some(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::User);
        });
    }

    #[tokio::test]
    async fn only_one_sas_per_device_pair() {
        let (alice, bob) = setup_pair().await;

        let first = alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        deliver_all(&alice, &bob).await;
        let bob_first = bob.machine.get_sas(alice.user_id(), first.flow_id().as_str()).unwrap();

        let second = alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        deliver_all(&alice, &bob).await;

        assert!(bob.machine.get_sas(alice.user_id(), second.flow_id().as_str()).is_none());
        assert_matches!(bob_first.cancel_info(), Some(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::UnexpectedMessage);
        });

        deliver_all(&bob, &alice).await;
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn a_new_request_replaces_older_ones() {
        let (alice, bob) = setup_pair().await;

        let first = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        deliver_all(&alice, &bob).await;

        let second = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        assert_matches!(first.cancel_info(), Some(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::User);
        });
        assert!(!second.is_cancelled());

        deliver_all(&alice, &bob).await;

        let bob_first = bob.machine.get_request(alice.user_id(), first.flow_id().as_str()).unwrap();
        let bob_second =
            bob.machine.get_request(alice.user_id(), second.flow_id().as_str()).unwrap();

        assert!(bob_first.is_cancelled());
        assert_matches!(bob_second.state(), VerificationRequestState::Requested { .. });
    }

    #[tokio::test]
    async fn passive_when_another_device_answers_in_a_room() {
        let alice = TestDevice::new(user_id!("@alice:example.org"), "ALICEDEVICE").await;
        let bob = TestDevice::new(user_id!("@bob:example.org"), "BOBDEVICE").await;
        let bob_laptop = TestDevice::new(user_id!("@bob:example.org"), "BOBLAPTOP").await;
        TestDevice::introduce(&[&alice, &bob, &bob_laptop]);

        let room_id = room_id!("!dm:example.org");
        let request = alice
            .machine
            .request_verification_in_room(bob.user_id(), room_id, None)
            .await
            .unwrap();

        let (outgoing, event_id) = alice.transport.pop().unwrap();
        let event_id = event_id.unwrap();

        deliver_in_room(&bob, &alice, room_id, &event_id, outgoing.content.clone()).await;
        deliver_in_room(&bob_laptop, &alice, room_id, &event_id, outgoing.content).await;

        let bob_request =
            bob.machine.get_request(alice.user_id(), request.flow_id().as_str()).unwrap();
        bob_request.accept().await.unwrap();

        // The laptop sees the ready message in the room.
        let (ready, ready_event_id) = bob.transport.pop().unwrap();
        deliver_in_room(&bob_laptop, &bob, room_id, &ready_event_id.unwrap(), ready.content).await;

        let laptop_request =
            bob_laptop.machine.get_request(alice.user_id(), request.flow_id().as_str()).unwrap();
        assert!(laptop_request.is_passive());
        assert_matches!(
            laptop_request.state(),
            VerificationRequestState::Passive { other_device_id } => {
                assert_eq!(other_device_id, bob.device_id());
            }
        );

        // Passive requests never talk.
        laptop_request.cancel().await;
        assert!(laptop_request.is_cancelled());
        assert!(bob_laptop.transport.is_empty());
    }

    #[tokio::test]
    async fn self_verification_notifies_key_gossip() {
        let (phone, laptop) = setup_self_pair().await;

        let request = phone.machine.request_verification(phone.user_id(), None).await.unwrap();
        deliver_all(&phone, &laptop).await;

        let laptop_request =
            laptop.machine.get_request(phone.user_id(), request.flow_id().as_str()).unwrap();
        laptop_request.accept().await.unwrap();
        deliver_all(&laptop, &phone).await;

        let phone_sas = request.start_sas().await.unwrap().unwrap();
        deliver_all(&phone, &laptop).await;
        deliver_all(&laptop, &phone).await;
        deliver_all(&phone, &laptop).await;
        deliver_all(&laptop, &phone).await;

        let laptop_sas =
            laptop.machine.get_sas(phone.user_id(), phone_sas.flow_id().as_str()).unwrap();

        phone_sas.confirm().await;
        laptop_sas.confirm().await;
        deliver_all(&phone, &laptop).await;
        deliver_all(&laptop, &phone).await;
        deliver_all(&phone, &laptop).await;

        assert!(phone_sas.is_done());
        assert!(laptop_sas.is_done());
        assert_eq!(phone.gossip.completed(), vec![laptop.device_id().to_owned()]);
        assert_eq!(laptop.gossip.completed(), vec![phone.device_id().to_owned()]);
    }

    #[tokio::test]
    async fn a_done_without_a_mac_does_not_notify_key_gossip() {
        let (phone, laptop) = setup_self_pair().await;

        let request = phone.machine.request_verification(phone.user_id(), None).await.unwrap();
        deliver_all(&phone, &laptop).await;

        let laptop_request =
            laptop.machine.get_request(phone.user_id(), request.flow_id().as_str()).unwrap();
        laptop_request.accept().await.unwrap();
        deliver_all(&laptop, &phone).await;

        let phone_sas = request.start_sas().await.unwrap().unwrap();
        deliver_all(&phone, &laptop).await;
        deliver_all(&laptop, &phone).await;
        deliver_all(&phone, &laptop).await;
        deliver_all(&laptop, &phone).await;

        phone_sas.confirm().await;
        laptop.send_to(&phone, done_content(phone_sas.flow_id())).await;

        assert!(!phone_sas.is_done());
        assert!(!phone_sas.is_cancelled());
        assert!(phone.gossip.completed().is_empty());
        assert!(phone.store.verified_devices().is_empty());
    }

    #[tokio::test]
    async fn garbage_collection_times_out_requests() {
        let settings =
            VerificationSettings { request_timeout: Duration::ZERO, ..Default::default() };
        let alice =
            TestDevice::with_settings(user_id!("@alice:example.org"), "ALICEDEVICE", settings)
                .await;
        let bob = TestDevice::new(user_id!("@bob:example.org"), "BOBDEVICE").await;
        TestDevice::introduce(&[&alice, &bob]);

        let request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        alice.transport.drain();

        tokio::time::sleep(Duration::from_millis(5)).await;
        alice.machine.garbage_collect().await;

        assert_matches!(request.cancel_info(), Some(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::Timeout);
        });
        assert!(alice.machine.get_requests(bob.user_id()).is_empty());

        let (cancel, _) = alice.transport.pop().unwrap();
        assert_matches!(cancel.recipient, Recipient::ToDevice { user_id, .. } => {
            assert_eq!(user_id, bob.user_id());
        });
    }

    #[tokio::test]
    async fn garbage_collection_times_out_flows() {
        let settings = VerificationSettings { flow_timeout: Duration::ZERO, ..Default::default() };
        let alice =
            TestDevice::with_settings(user_id!("@alice:example.org"), "ALICEDEVICE", settings)
                .await;
        let bob = TestDevice::new(user_id!("@bob:example.org"), "BOBDEVICE").await;
        TestDevice::introduce(&[&alice, &bob]);

        let sas = alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        let flow_id = sas.flow_id().as_str().to_owned();
        deliver_all(&alice, &bob).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        alice.machine.garbage_collect().await;

        assert_matches!(sas.cancel_info(), Some(info) => {
            assert!(info.cancelled_by_us());
            assert_eq!(info.cancel_code(), &CancelCode::Timeout);
        });
        assert!(alice.machine.get_verification(bob.user_id(), &flow_id).is_none());
        assert!(alice.cache().get_past_transaction(bob.user_id(), &flow_id).is_some());

        deliver_all(&alice, &bob).await;
        let bob_sas = bob.machine.get_sas(alice.user_id(), &flow_id);
        assert!(bob_sas.is_none());
        assert_matches!(
            bob.cache().get_past_transaction(alice.user_id(), &flow_id),
            Some(v) => assert!(v.is_cancelled())
        );
    }
}
