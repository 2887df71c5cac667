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

mod cache;
mod event_enums;
mod machine;
mod qrcode;
mod requests;
mod sas;

use std::{fmt, sync::Arc};

use as_variant::as_variant;
use cache::VerificationCache;
pub use cache::{RequestSnapshot, VerificationEvent};
use event_enums::ValidContent;
pub use machine::VerificationMachine;
pub use qrcode::{
    DecodingError, EncodingError, QrVerification, QrVerificationData, QrVerificationState,
    ScanError, SelfVerificationData, SelfVerificationNoMasterKey, VerificationData,
};
pub use requests::{VerificationRequest, VerificationRequestState};
use ruma::{DeviceId, EventId, OwnedEventId, OwnedRoomId, OwnedTransactionId, RoomId, UserId};
pub use sas::{
    emoji_from_index, format_decimals, AcceptedProtocols, EmojiShortAuthString, Sas, SasState,
};
use tracing::{debug, info, trace, warn};

use crate::{
    identities::{DeviceData, MasterPubkey},
    settings::VerificationSettings,
    store::{KeyGossip, StoreError, VerificationStore},
    transport::{
        send_with_retries, OutgoingVerificationRequest, SentMessage, TransportError,
        VerificationTransport,
    },
    types::{CancelCode, CancelContent, DoneContent, FlowFields, VerificationContent},
};

/// An emoji that is used for interactive verification using a short auth
/// string.
///
/// This will contain a single emoji and description from the list of emojis
/// from the [spec].
///
/// [spec]: https://spec.matrix.org/unstable/client-server-api/#sas-method-emoji
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd)]
pub struct Emoji {
    /// The emoji symbol that represents a part of the short auth string, for
    /// example: 🐶
    pub symbol: &'static str,
    /// The description of the emoji, for example 'Dog'.
    pub description: &'static str,
}

/// An enum over the different verification types the crate supports.
#[derive(Clone, Debug)]
pub enum Verification {
    /// The `m.sas.v1` verification variant.
    SasV1(Sas),
    /// The `m.qr_code.*.v1` verification variant.
    QrV1(QrVerification),
}

impl Verification {
    /// Try to deconstruct this verification enum into a SAS verification.
    pub fn sas_v1(self) -> Option<Sas> {
        as_variant!(self, Verification::SasV1)
    }

    /// Try to deconstruct this verification enum into a QR code verification.
    pub fn qr_v1(self) -> Option<QrVerification> {
        as_variant!(self, Verification::QrV1)
    }

    /// Has this verification finished successfully.
    pub fn is_done(&self) -> bool {
        match self {
            Verification::SasV1(s) => s.is_done(),
            Verification::QrV1(qr) => qr.is_done(),
        }
    }

    /// Has the verification been cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Verification::SasV1(s) => s.is_cancelled(),
            Verification::QrV1(qr) => qr.is_cancelled(),
        }
    }

    /// Did the verification reach a state it can't leave anymore.
    pub fn is_terminal(&self) -> bool {
        self.is_done() || self.is_cancelled()
    }

    /// Get info about the cancellation if the verification has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match self {
            Verification::SasV1(s) => s.cancel_info(),
            Verification::QrV1(qr) => qr.cancel_info(),
        }
    }

    /// Get the ID that uniquely identifies this verification flow.
    pub fn flow_id(&self) -> &FlowId {
        match self {
            Verification::SasV1(s) => s.flow_id(),
            Verification::QrV1(qr) => qr.flow_id(),
        }
    }

    /// Get our own user id that is participating in this verification.
    pub fn user_id(&self) -> &UserId {
        match self {
            Verification::SasV1(v) => v.user_id(),
            Verification::QrV1(v) => v.user_id(),
        }
    }

    /// Get the other user id that is participating in this verification.
    pub fn other_user(&self) -> &UserId {
        match self {
            Verification::SasV1(s) => s.other_user_id(),
            Verification::QrV1(qr) => qr.other_user_id(),
        }
    }

    /// Get the device id of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        match self {
            Verification::SasV1(s) => s.other_device_id(),
            Verification::QrV1(qr) => qr.other_device_id(),
        }
    }

    /// Is this a verification verifying a device that belongs to us.
    pub fn is_self_verification(&self) -> bool {
        match self {
            Verification::SasV1(v) => v.is_self_verification(),
            Verification::QrV1(v) => v.is_self_verification(),
        }
    }

    /// Has the verification been inactive for too long.
    pub fn timed_out(&self) -> bool {
        match self {
            Verification::SasV1(s) => s.timed_out(),
            Verification::QrV1(qr) => qr.timed_out(),
        }
    }

    /// Cancel the verification with the given code.
    pub async fn cancel_with_code(&self, code: CancelCode) {
        match self {
            Verification::SasV1(s) => s.cancel_with_code(code).await,
            Verification::QrV1(qr) => qr.cancel_with_code(code).await,
        }
    }

    pub(crate) async fn receive(&self, content: &ValidContent) {
        match self {
            Verification::SasV1(s) => s.receive(content).await,
            Verification::QrV1(qr) => qr.receive(content).await,
        }
    }

    pub(crate) fn same_instance(&self, other: &Verification) -> bool {
        match (self, other) {
            (Verification::SasV1(a), Verification::SasV1(b)) => a.same_instance(b),
            (Verification::QrV1(a), Verification::QrV1(b)) => a.same_instance(b),
            _ => false,
        }
    }
}

impl From<Sas> for Verification {
    fn from(sas: Sas) -> Self {
        Self::SasV1(sas)
    }
}

impl From<QrVerification> for Verification {
    fn from(qr: QrVerification) -> Self {
        Self::QrV1(qr)
    }
}

/// The content of the `m.key.verification.done` message of a flow.
pub(crate) fn done_content(flow_id: &FlowId) -> VerificationContent {
    VerificationContent::Done(DoneContent { flow: flow_id.flow_fields() })
}

/// Information about the cancellation of a verification request or verification
/// flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: &'static str,
}

impl CancelInfo {
    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// Get the `CancelCode` that cancelled this verification.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// Was the verification cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

impl From<Cancelled> for CancelInfo {
    fn from(c: Cancelled) -> Self {
        Self { cancelled_by_us: c.cancelled_by_us, cancel_code: c.cancel_code, reason: c.reason }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Cancelled {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: &'static str,
}

impl Cancelled {
    pub fn new(cancelled_by_us: bool, code: CancelCode) -> Self {
        let reason = match code {
            CancelCode::Accepted => {
                "A m.key.verification.request was accepted by a different device."
            }
            CancelCode::InvalidMessage => "The received message was invalid.",
            CancelCode::KeyMismatch => "The expected key did not match the verified one",
            CancelCode::MismatchedCommitment => "The hash commitment did not match.",
            CancelCode::MismatchedSas => "The short authentication string did not match.",
            CancelCode::QrCodeInvalid => "The scanned QR code is invalid.",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::UnknownTransaction => {
                "The device does not know about the given transaction ID."
            }
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::UserMismatch => "The expected user did not match the verified user",
            CancelCode::Custom(_) => "Unknown cancel reason",
        };

        Self { cancelled_by_us, cancel_code: code, reason }
    }

    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }

    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    pub fn as_content(&self, flow_id: &FlowId) -> VerificationContent {
        VerificationContent::Cancel(CancelContent::new(
            flow_id.flow_fields(),
            &self.cancel_code,
            self.reason,
        ))
    }
}

/// The id that correlates all the messages of a single verification flow.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowId {
    /// A flow that uses to-device messages, identified by a transaction id
    /// the initiator picked.
    ToDevice(OwnedTransactionId),
    /// A flow inside a room, identified by the event id of the request.
    InRoom(OwnedRoomId, OwnedEventId),
}

impl FlowId {
    /// The room of an in-room flow.
    pub fn room_id(&self) -> Option<&RoomId> {
        if let FlowId::InRoom(r, _) = &self {
            Some(r)
        } else {
            None
        }
    }

    /// The opaque flow id string.
    pub fn as_str(&self) -> &str {
        match self {
            FlowId::InRoom(_, r) => r.as_str(),
            FlowId::ToDevice(t) => t.as_str(),
        }
    }

    pub(crate) fn flow_fields(&self) -> FlowFields {
        match self {
            FlowId::ToDevice(t) => FlowFields::to_device(t.as_str()),
            FlowId::InRoom(_, e) => FlowFields::in_room(e),
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<OwnedTransactionId> for FlowId {
    fn from(transaction_id: OwnedTransactionId) -> Self {
        FlowId::ToDevice(transaction_id)
    }
}

impl From<(OwnedRoomId, OwnedEventId)> for FlowId {
    fn from(ids: (OwnedRoomId, OwnedEventId)) -> Self {
        FlowId::InRoom(ids.0, ids.1)
    }
}

impl From<(&RoomId, &EventId)> for FlowId {
    fn from(ids: (&RoomId, &EventId)) -> Self {
        FlowId::InRoom(ids.0.to_owned(), ids.1.to_owned())
    }
}

/// A result of a verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationResult {
    /// The verification succeeded, the keys have been marked as trusted.
    Ok,
    /// The verification was canceled.
    Cancel(CancelCode),
}

/// The keys of the other side a verification flow can end up trusting.
#[derive(Clone, Debug)]
pub(crate) struct IdentitiesBeingVerified {
    store: VerificationStore,
    device_being_verified: DeviceData,
    own_master_key: Option<MasterPubkey>,
    identity_being_verified: Option<MasterPubkey>,
}

impl IdentitiesBeingVerified {
    pub async fn new(
        store: VerificationStore,
        device_being_verified: DeviceData,
    ) -> Result<Self, StoreError> {
        let own_master_key = store.get_master_key(store.user_id()).await?;
        let identity_being_verified =
            store.get_master_key(device_being_verified.user_id()).await?;

        Ok(Self { store, device_being_verified, own_master_key, identity_being_verified })
    }

    pub fn user_id(&self) -> &UserId {
        self.store.user_id()
    }

    pub fn own_device(&self) -> &DeviceData {
        &self.store.own_device
    }

    pub fn is_self_verification(&self) -> bool {
        self.user_id() == self.other_user_id()
    }

    pub fn other_user_id(&self) -> &UserId {
        self.device_being_verified.user_id()
    }

    pub fn other_device_id(&self) -> &DeviceId {
        self.device_being_verified.device_id()
    }

    pub fn other_device(&self) -> &DeviceData {
        &self.device_being_verified
    }

    /// Our own master key, if we consider it trusted.
    pub fn own_trusted_master_key(&self) -> Option<&MasterPubkey> {
        self.own_master_key.as_ref().filter(|k| k.is_trusted())
    }

    pub fn own_master_key(&self) -> Option<&MasterPubkey> {
        self.own_master_key.as_ref()
    }

    pub fn other_master_key(&self) -> Option<&MasterPubkey> {
        self.identity_being_verified.as_ref()
    }

    pub fn store(&self) -> &VerificationStore {
        &self.store
    }

    /// Persist the trust the verification established.
    ///
    /// Every device and master key is re-read from the store, keys that
    /// changed while the flow was running don't get marked.
    pub async fn mark_as_done(
        &self,
        verified_devices: &[DeviceData],
        master_key_verified: bool,
    ) -> Result<VerificationResult, StoreError> {
        let mut devices = Vec::new();

        for device in verified_devices {
            if let Some(device) = self.check_device(device).await? {
                devices.push(device);
            }
        }

        let identity = if master_key_verified { self.check_identity().await? } else { None };

        if devices.is_empty() && identity.is_none() {
            // Something went wrong if nothing was verified, we use key
            // mismatch here, since it's the closest to nothing was verified.
            return Ok(VerificationResult::Cancel(CancelCode::KeyMismatch));
        }

        for device in devices {
            self.store
                .inner()
                .mark_device_as_verified(device.user_id(), device.device_id())
                .await?;
        }

        if let Some(identity) = identity {
            self.store.inner().mark_cross_signing_key_as_trusted(identity.user_id()).await?;
        }

        Ok(VerificationResult::Ok)
    }

    async fn check_identity(&self) -> Result<Option<MasterPubkey>, StoreError> {
        let Some(expected) = &self.identity_being_verified else {
            return Ok(None);
        };

        let identity = self.store.get_master_key(self.other_user_id()).await?;

        Ok(match identity {
            Some(identity) if identity.key() == expected.key() => {
                trace!(user_id = ?self.other_user_id(), "Marking the master key as trusted.");
                Some(identity)
            }
            Some(_) => {
                warn!(
                    user_id = ?self.other_user_id(),
                    "The master keys of the user have changed while an interactive \
                     verification was going on, not marking the identity as verified.",
                );
                None
            }
            None => {
                info!(
                    user_id = ?self.other_user_id(),
                    "The identity of the user was deleted while an interactive \
                     verification was going on.",
                );
                None
            }
        })
    }

    async fn check_device(&self, verified: &DeviceData) -> Result<Option<DeviceData>, StoreError> {
        let device = self.store.get_device(verified.user_id(), verified.device_id()).await?;

        Ok(match device {
            Some(device) if device.ed25519_key() == verified.ed25519_key() => {
                trace!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    "Marking device as verified.",
                );
                Some(device)
            }
            Some(device) => {
                warn!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    "The device keys have changed while an interactive \
                     verification was going on, not marking the device as verified.",
                );
                None
            }
            None => {
                info!(
                    user_id = ?verified.user_id(),
                    device_id = ?verified.device_id(),
                    "The device was deleted while an interactive verification was \
                     going on.",
                );
                None
            }
        })
    }
}

/// Shared handle of a verification store and everything else a flow needs to
/// talk to the outside world.
#[derive(Clone, Debug)]
pub(crate) struct FlowContext {
    pub store: VerificationStore,
    pub transport: Arc<dyn VerificationTransport>,
    pub cache: VerificationCache,
    pub settings: VerificationSettings,
    pub key_gossip: Option<Arc<dyn KeyGossip>>,
}

impl FlowContext {
    /// Send a message, retrying as configured.
    pub async fn send(
        &self,
        request: &OutgoingVerificationRequest,
    ) -> Result<SentMessage, TransportError> {
        send_with_retries(
            &*self.transport,
            request,
            self.settings.max_send_attempts,
            self.settings.retry_delay,
        )
        .await
    }

    /// A flow with another one of our own devices reached the done state.
    pub fn own_device_verified(&self, device_id: &DeviceId) {
        if let Some(key_gossip) = &self.key_gossip {
            debug!(?device_id, "Verification with one of our own devices completed");
            key_gossip.device_verification_complete(device_id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{BTreeMap, VecDeque},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, PoisonError,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use ruma::{
        server_name, to_device::DeviceIdOrAllDevices, user_id, DeviceId, EventId,
        MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, UserId,
    };
    use tracing_subscriber::{fmt, EnvFilter};
    use vodozemac::Ed25519SecretKey;

    use super::{VerificationCache, VerificationMachine};
    use crate::{
        identities::{DeviceData, MasterPubkey},
        settings::VerificationSettings,
        store::{KeyGossip, MemoryStore, StoreError, TrustStore},
        transport::{
            OutgoingVerificationRequest, Recipient, SentMessage, TransportError,
            VerificationTransport,
        },
        types::{IncomingVerificationMessage, VerificationContent},
    };

    /// A transport that queues up everything that gets sent.
    #[derive(Debug, Default)]
    pub(crate) struct QueueTransport {
        queue: Mutex<VecDeque<(OutgoingVerificationRequest, Option<OwnedEventId>)>>,
        failing: AtomicBool,
    }

    impl QueueTransport {
        pub fn pop(&self) -> Option<(OutgoingVerificationRequest, Option<OwnedEventId>)> {
            self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
        }

        pub fn drain(&self) {
            self.queue.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }

        pub fn is_empty(&self) -> bool {
            self.queue.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl VerificationTransport for QueueTransport {
        async fn send(
            &self,
            request: &OutgoingVerificationRequest,
        ) -> Result<SentMessage, TransportError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Send("the server is offline".to_owned()));
            }

            let event_id = match request.recipient {
                Recipient::InRoom { .. } => Some(EventId::new(server_name!("example.org"))),
                Recipient::ToDevice { .. } => None,
            };

            self.queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back((request.clone(), event_id.clone()));

            Ok(SentMessage { event_id })
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingGossip {
        completed: Mutex<Vec<OwnedDeviceId>>,
    }

    impl RecordingGossip {
        pub fn completed(&self) -> Vec<OwnedDeviceId> {
            self.completed.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    impl KeyGossip for RecordingGossip {
        fn device_verification_complete(&self, device_id: &DeviceId) {
            let mut completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
            completed.push(device_id.to_owned());
        }
    }

    /// A memory store that lets other tasks run before any trust is written.
    #[derive(Debug)]
    pub(crate) struct YieldingStore(Arc<MemoryStore>);

    #[async_trait]
    impl TrustStore for YieldingStore {
        async fn get_device(
            &self,
            user_id: &UserId,
            device_id: &DeviceId,
        ) -> Result<Option<DeviceData>, StoreError> {
            self.0.get_device(user_id, device_id).await
        }

        async fn get_user_devices(
            &self,
            user_id: &UserId,
        ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>, StoreError> {
            self.0.get_user_devices(user_id).await
        }

        async fn get_master_key(
            &self,
            user_id: &UserId,
        ) -> Result<Option<MasterPubkey>, StoreError> {
            self.0.get_master_key(user_id).await
        }

        async fn mark_device_as_verified(
            &self,
            user_id: &UserId,
            device_id: &DeviceId,
        ) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.mark_device_as_verified(user_id, device_id).await
        }

        async fn mark_cross_signing_key_as_trusted(
            &self,
            user_id: &UserId,
        ) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.mark_cross_signing_key_as_trusted(user_id).await
        }
    }

    pub(crate) struct TestDevice {
        pub device: DeviceData,
        pub store: Arc<MemoryStore>,
        pub transport: Arc<QueueTransport>,
        pub gossip: Arc<RecordingGossip>,
        pub machine: VerificationMachine,
    }

    impl TestDevice {
        pub async fn new(user_id: &UserId, device_id: &str) -> Self {
            Self::with_settings(user_id, device_id, VerificationSettings::default()).await
        }

        pub async fn with_settings(
            user_id: &UserId,
            device_id: &str,
            settings: VerificationSettings,
        ) -> Self {
            init_tracing();

            let settings = VerificationSettings { retry_delay: Duration::ZERO, ..settings };
            let device = DeviceData::new(
                user_id.to_owned(),
                device_id.into(),
                Ed25519SecretKey::new().public_key(),
            );

            let store = Arc::new(MemoryStore::new());
            store.add_device(device.clone());

            let transport = Arc::new(QueueTransport::default());
            let gossip = Arc::new(RecordingGossip::default());

            let machine = VerificationMachine::new(
                device.clone(),
                Arc::new(YieldingStore(store.clone())),
                transport.clone(),
                settings,
            )
            .with_key_gossip(gossip.clone());

            Self { device, store, transport, gossip, machine }
        }

        /// Let every device know about every other device.
        pub fn introduce(devices: &[&TestDevice]) {
            for device in devices {
                for other in devices {
                    device.store.add_device(other.device.clone());
                }
            }
        }

        pub fn user_id(&self) -> &UserId {
            self.device.user_id()
        }

        pub fn device_id(&self) -> &DeviceId {
            self.device.device_id()
        }

        pub fn cache(&self) -> &VerificationCache {
            self.machine.cache()
        }

        /// Deliver a to-device message from us to the other device.
        pub async fn send_to(&self, other: &TestDevice, content: VerificationContent) {
            other
                .machine
                .receive_message(IncomingVerificationMessage::to_device(
                    self.user_id().to_owned(),
                    content,
                ))
                .await
                .unwrap();
        }
    }

    /// Log to the test output, filtered through `RUST_LOG`.
    fn init_tracing() {
        let _ = fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
    }

    pub(crate) async fn setup_pair() -> (TestDevice, TestDevice) {
        let alice = TestDevice::new(user_id!("@alice:example.org"), "ALICEDEVICE").await;
        let bob = TestDevice::new(user_id!("@bob:example.org"), "BOBDEVICE").await;
        TestDevice::introduce(&[&alice, &bob]);

        (alice, bob)
    }

    pub(crate) async fn setup_self_pair() -> (TestDevice, TestDevice) {
        let phone = TestDevice::new(user_id!("@alice:example.org"), "PHONEDEVICE").await;
        let laptop = TestDevice::new(user_id!("@alice:example.org"), "LAPTOPDEVICE").await;
        TestDevice::introduce(&[&phone, &laptop]);

        (phone, laptop)
    }

    /// Empty the outgoing queue of `from`, messages addressed to `to` get
    /// delivered, everything else is dropped.
    pub(crate) async fn deliver_all(from: &TestDevice, to: &TestDevice) {
        while let Some((request, event_id)) = from.transport.pop() {
            match request.recipient {
                Recipient::ToDevice { user_id, devices } => {
                    let device = DeviceIdOrAllDevices::DeviceId(to.device_id().to_owned());
                    let for_them = *user_id == *to.user_id()
                        && devices
                            .iter()
                            .any(|d| *d == device || *d == DeviceIdOrAllDevices::AllDevices);

                    if for_them {
                        from.send_to(to, request.content).await;
                    }
                }
                Recipient::InRoom { room_id } => {
                    let event_id = event_id.unwrap();

                    to.machine
                        .receive_message(IncomingVerificationMessage::in_room(
                            from.user_id().to_owned(),
                            room_id,
                            event_id,
                            MilliSecondsSinceUnixEpoch::now(),
                            request.content,
                        ))
                        .await
                        .unwrap();
                }
            }
        }
    }
}
