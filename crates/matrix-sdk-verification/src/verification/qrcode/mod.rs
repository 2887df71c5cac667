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

mod data;

use std::{sync::Arc, time::Instant};

use as_variant::as_variant;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
pub use data::{
    DecodingError, EncodingError, QrVerificationData, SelfVerificationData,
    SelfVerificationNoMasterKey, VerificationData,
};
use eyeball::{ObservableWriteGuard, SharedObservable};
use futures_core::Stream;
use futures_util::StreamExt;
use rand::{thread_rng, RngCore};
use ruma::{
    serde::Base64, to_device::DeviceIdOrAllDevices, DeviceId, OwnedUserId, RoomId, UserId,
};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use vodozemac::Ed25519PublicKey;

use super::{
    done_content,
    event_enums::{ReciprocateStart, ValidCancel, ValidContent, ValidStart},
    requests::RequestHandle,
    CancelInfo, Cancelled, FlowContext, FlowId, IdentitiesBeingVerified, VerificationResult,
};
use crate::{
    identities::{DeviceData, MasterPubkey},
    store::StoreError,
    transport::OutgoingVerificationRequest,
    types::{CancelCode, StartContent, VerificationContent, VerificationMethod},
};

const SECRET_SIZE: usize = 16;

/// An error for the different failure modes that can happen during the
/// validation of a scanned QR code.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The trust store failed while the scanned QR code was validated.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A key mismatch happened during the validation of the QR code scan.
    #[error("The keys that are being verified didn't match (expected {expected}, found {found})")]
    KeyMismatch {
        /// The expected ed25519 key.
        expected: String,
        /// The ed25519 key that we got.
        found: String,
    },
    /// One of the users that is participating in this verification doesn't have
    /// a valid cross signing identity.
    #[error("The user {0} is missing a valid cross signing identity")]
    MissingCrossSigningIdentity(OwnedUserId),
    /// The ID uniquely identifying this verification flow didn't match to the
    /// one that has been scanned.
    #[error("The unique verification flow id did not match (expected {expected}, found {found})")]
    FlowIdMismatch {
        /// The expected verification flow id.
        expected: String,
        /// The verification flow id that we instead got.
        found: String,
    },
}

/// An Enum describing the state the QrCode verification is in.
#[derive(Clone, Debug, PartialEq)]
pub enum QrVerificationState {
    /// The QR verification has been started, our QR code can be shown.
    Started,
    /// The QR verification has been scanned by the other side.
    Scanned,
    /// We have confirmed the other side's scan of the QR code.
    Confirmed,
    /// We have successfully scanned the QR code of the other side and told
    /// them about it.
    Reciprocated,
    /// The verification process has been successfully concluded.
    Done {
        /// The list of devices that has been verified.
        verified_devices: Vec<DeviceData>,
        /// Did the master key of the other user get verified.
        master_key_verified: bool,
    },
    /// The verification process has been cancelled.
    Cancelled(CancelInfo),
}

impl From<&InnerState> for QrVerificationState {
    fn from(value: &InnerState) -> Self {
        match value {
            InnerState::Created(_) => Self::Started,
            InnerState::Scanned(_) => Self::Scanned,
            InnerState::Confirmed(_) => Self::Confirmed,
            InnerState::Reciprocated(_) => Self::Reciprocated,
            InnerState::Verifying(s) if s.state.reciprocated => Self::Reciprocated,
            InnerState::Verifying(_) => Self::Confirmed,
            InnerState::Done(s) => Self::Done {
                verified_devices: s.state.verified_devices.to_vec(),
                master_key_verified: s.state.master_key_verified,
            },
            InnerState::Cancelled(s) => Self::Cancelled(s.state.cancelled.clone().into()),
        }
    }
}

/// An object controlling QR code style key verification flows.
#[derive(Clone)]
pub struct QrVerification {
    flow_id: Arc<FlowId>,
    inner: Arc<QrVerificationData>,
    state: SharedObservable<InnerState>,
    identities: IdentitiesBeingVerified,
    context: FlowContext,
    request_handle: Option<RequestHandle>,
    we_started: bool,
    creation_time: Arc<Instant>,
}

impl std::fmt::Debug for QrVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrVerification")
            .field("flow_id", &self.flow_id)
            .field("state", &self.state())
            .field("we_started", &self.we_started)
            .finish_non_exhaustive()
    }
}

impl QrVerification {
    /// Has the QR verification been scanned by the other side.
    ///
    /// When the verification object is in this state it's required that the
    /// user confirms that the other side has scanned the QR code.
    pub fn has_been_scanned(&self) -> bool {
        matches!(*self.state.read(), InnerState::Scanned(_))
    }

    /// Has the scanning of the QR code been confirmed by us.
    pub fn has_been_confirmed(&self) -> bool {
        match &*self.state.read() {
            InnerState::Confirmed(_) => true,
            InnerState::Verifying(s) => !s.state.reciprocated,
            _ => false,
        }
    }

    /// Get our own user id.
    pub fn user_id(&self) -> &UserId {
        self.identities.user_id()
    }

    /// Get the user id of the other user that is participating in this
    /// verification flow.
    pub fn other_user_id(&self) -> &UserId {
        self.identities.other_user_id()
    }

    /// Get the device ID of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        self.identities.other_device_id()
    }

    /// Did we initiate the verification request
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Get info about the cancellation if the verification flow has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        as_variant!(&*self.state.read(), InnerState::Cancelled(c) => {
            c.state.cancelled.clone().into()
        })
    }

    /// Has the verification flow completed.
    pub fn is_done(&self) -> bool {
        matches!(*self.state.read(), InnerState::Done(_))
    }

    /// Has the verification flow been cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.read(), InnerState::Cancelled(_))
    }

    /// Is this a verification that is verifying one of our own devices
    pub fn is_self_verification(&self) -> bool {
        self.identities.is_self_verification()
    }

    /// Have we successfully scanned the QR code and told the other side about
    /// it.
    pub fn reciprocated(&self) -> bool {
        match &*self.state.read() {
            InnerState::Reciprocated(_) => true,
            InnerState::Verifying(s) => s.state.reciprocated,
            _ => false,
        }
    }

    /// Get the unique ID that identifies this QR code verification flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Get the room id if the verification is happening inside a room.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.flow_id.room_id()
    }

    /// Has the flow been running for longer than allowed.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > self.context.settings.flow_timeout
    }

    /// Generate the raw bytes that should be encoded as a QR code and shown
    /// to the other side.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        self.inner.to_bytes()
    }

    /// Cancel the verification flow.
    pub async fn cancel(&self) {
        self.cancel_with_code(CancelCode::User).await;
    }

    /// Cancel the verification.
    ///
    /// This cancels the verification with given `CancelCode`.
    ///
    /// **Note**: This method should generally not be used, the [`cancel()`]
    /// method should be preferred. The SDK will automatically cancel with the
    /// appropriate cancel code, user initiated cancellations should only cancel
    /// with the `CancelCode::User`
    ///
    /// [`cancel()`]: #method.cancel
    pub async fn cancel_with_code(&self, code: CancelCode) {
        let cancelled = self.transition(|state| {
            if state.is_terminal() {
                None
            } else {
                Some(InnerState::Cancelled(QrState::<QrCancelled>::new(true, code)))
            }
        });

        if let Some(InnerState::Cancelled(s)) = cancelled {
            self.send_cancel(&s.state.cancelled).await;
        }
    }

    /// Confirm that the other side has scanned our QR code.
    ///
    /// This sends out the done message, the keys of the other side are
    /// trusted once their done message arrives.
    pub async fn confirm_scanning(&self) {
        let confirmed = self.transition(|state| {
            as_variant!(state, InnerState::Scanned(s) => {
                InnerState::Confirmed(s.clone().confirm_scanning())
            })
        });

        if confirmed.is_some() {
            let request = self.outgoing(done_content(&self.flow_id));

            if let Err(e) = self.context.send(&request).await {
                warn!(
                    flow_id = self.flow_id.as_str(),
                    error = ?e,
                    "Couldn't send the done message"
                );
                self.fail();
            }
        }
    }

    /// Listen for changes in the QrCode verification process.
    ///
    /// The changes are presented as a stream of [`QrVerificationState`] values.
    pub fn changes(&self) -> impl Stream<Item = QrVerificationState> {
        self.state.subscribe().map(|s| (&s).into())
    }

    /// Get the current state the verification process is in.
    ///
    /// To listen to changes to the [`QrVerificationState`] use the
    /// [`QrVerification::changes`] method.
    pub fn state(&self) -> QrVerificationState {
        (&*self.state.read()).into()
    }

    /// Tell the other side that we scanned their QR code.
    pub(crate) async fn reciprocate(&self) {
        let content = match &*self.state.read() {
            InnerState::Reciprocated(s) => {
                s.as_content(self.identities.own_device(), &self.flow_id)
            }
            _ => return,
        };

        if let Err(e) = self.context.send(&self.outgoing(content)).await {
            warn!(flow_id = self.flow_id.as_str(), error = ?e, "Couldn't send the reciprocation");
            self.fail();
        }
    }

    /// Feed a validated message of the other side into the flow.
    pub(crate) async fn receive(&self, content: &ValidContent) {
        match content {
            ValidContent::Start(ValidStart::Reciprocate(start)) => {
                self.receive_reciprocation(start).await
            }
            ValidContent::Done => self.receive_done().await,
            ValidContent::Cancel(cancel) => self.receive_cancel(cancel),
            _ => {
                warn!(
                    flow_id = self.flow_id.as_str(),
                    kind = ?content.kind(),
                    "Received an unexpected message for a QR code verification"
                );
                self.cancel_with_code(CancelCode::UnexpectedMessage).await;
            }
        }
    }

    pub(crate) async fn cancel_if_timed_out(&self) -> bool {
        if self.state.read().is_terminal() || !self.timed_out() {
            false
        } else {
            self.cancel_with_code(CancelCode::Timeout).await;
            true
        }
    }

    /// Another flow took the place of this one, drop it without telling the
    /// other side.
    pub(crate) fn supersede(&self) {
        let superseded = {
            let mut state = self.state.write();

            if state.is_terminal() {
                None
            } else {
                let new_state = InnerState::Cancelled(QrState::<QrCancelled>::superseded());
                ObservableWriteGuard::set(&mut state, new_state.clone());
                Some(new_state)
            }
        };

        if let Some(state) = superseded {
            self.publish(&state);
        }
    }

    pub(crate) fn same_instance(&self, other: &QrVerification) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn receive_reciprocation(&self, start: &ReciprocateStart) {
        let new_state = self.transition(|state| {
            as_variant!(state, InnerState::Created(s) => {
                match s.clone().receive_reciprocate(&self.inner, start) {
                    Ok(s) => InnerState::Scanned(s),
                    Err(s) => InnerState::Cancelled(s),
                }
            })
        });

        if let Some(InnerState::Cancelled(s)) = new_state {
            warn!(
                flow_id = self.flow_id.as_str(),
                "The other side scanned our QR code but replied with a different secret"
            );
            self.send_cancel(&s.state.cancelled).await;
        }
    }

    async fn receive_done(&self) {
        // Claim the flow before the store is awaited, a second done message
        // must not apply the trust again.
        let verifying = self.transition(|state| match state {
            InnerState::Confirmed(_) => Some(InnerState::Verifying(QrState {
                state: Verifying { reciprocated: false },
            })),
            InnerState::Reciprocated(_) => Some(InnerState::Verifying(QrState {
                state: Verifying { reciprocated: true },
            })),
            _ => None,
        });

        let Some(InnerState::Verifying(verifying)) = verifying else {
            return;
        };

        let reciprocated = verifying.state.reciprocated;

        let (verified_device, master_key_verified) = match (reciprocated, &*self.inner) {
            (false, QrVerificationData::Verification(_)) => (None, true),
            (false, QrVerificationData::SelfVerification(_)) => {
                (Some(self.identities.other_device()), false)
            }
            (false, QrVerificationData::SelfVerificationNoMasterKey(_)) => (None, true),
            (true, QrVerificationData::Verification(_)) => (None, true),
            (true, QrVerificationData::SelfVerification(_)) => (None, true),
            (true, QrVerificationData::SelfVerificationNoMasterKey(_)) => {
                (Some(self.identities.other_device()), false)
            }
        };

        let verified_devices: Vec<DeviceData> = verified_device.into_iter().cloned().collect();

        let result = self
            .identities
            .mark_as_done(&verified_devices, master_key_verified)
            .await
            .unwrap_or_else(|e| {
                warn!(
                    flow_id = self.flow_id.as_str(),
                    error = ?e,
                    "Couldn't store the verified keys"
                );
                VerificationResult::Cancel(CancelCode::User)
            });

        debug!(flow_id = self.flow_id.as_str(), ?result, "Applied the QR code trust");

        match result {
            VerificationResult::Ok => {
                let done = InnerState::Done(QrState {
                    state: Done { verified_devices: verified_devices.into(), master_key_verified },
                });

                let finished = self
                    .transition(|s| matches!(s, InnerState::Verifying(_)).then(|| done.clone()))
                    .is_some();

                // The scanning side answers with its own done message.
                if finished && reciprocated {
                    let request = self.outgoing(done_content(&self.flow_id));

                    if let Err(e) = self.context.send(&request).await {
                        warn!(
                            flow_id = self.flow_id.as_str(),
                            error = ?e,
                            "Couldn't send the done message, the keys are trusted regardless"
                        );
                    }
                }
            }
            VerificationResult::Cancel(code) => self.cancel_with_code(code).await,
        }
    }

    fn receive_cancel(&self, cancel: &ValidCancel) {
        let cancelled = self.transition(|state| {
            if state.is_terminal() {
                None
            } else {
                Some(InnerState::Cancelled(QrState::<QrCancelled>::new(false, cancel.code.clone())))
            }
        });

        if cancelled.is_some() {
            info!(
                flow_id = self.flow_id.as_str(),
                code = cancel.code.as_str(),
                "Cancelling a QR verification, other user has cancelled"
            );
        }
    }

    fn fail(&self) {
        let cancelled = self.transition(|state| {
            (!state.is_terminal())
                .then(|| InnerState::Cancelled(QrState::<QrCancelled>::new(true, CancelCode::User)))
        });

        if cancelled.is_some() {
            info!(flow_id = self.flow_id.as_str(), "Cancelled a QR verification, sending failed");
        }
    }

    async fn send_cancel(&self, cancelled: &Cancelled) {
        info!(
            flow_id = self.flow_id.as_str(),
            code = cancelled.cancel_code().as_str(),
            "Cancelled a QR verification"
        );

        let request = self.outgoing(cancelled.as_content(&self.flow_id));

        if let Err(e) = self.context.send(&request).await {
            warn!(flow_id = self.flow_id.as_str(), error = ?e, "Couldn't send the cancellation");
        }
    }

    fn outgoing(&self, content: VerificationContent) -> OutgoingVerificationRequest {
        OutgoingVerificationRequest::for_flow(
            &self.flow_id,
            self.other_user_id().to_owned(),
            vec![DeviceIdOrAllDevices::DeviceId(self.other_device_id().to_owned())],
            content,
        )
    }

    /// Run a transition under the write lock, the observers are notified after
    /// the lock is released.
    fn transition(
        &self,
        f: impl FnOnce(&InnerState) -> Option<InnerState>,
    ) -> Option<InnerState> {
        let new_state = {
            let mut state = self.state.write();
            let new_state = f(&state)?;

            trace!(
                flow_id = self.flow_id.as_str(),
                old_state = ?QrVerificationState::from(&*state),
                new_state = ?QrVerificationState::from(&new_state),
                "QR code verification state changed"
            );

            ObservableWriteGuard::set(&mut state, new_state.clone());
            new_state
        };

        self.publish(&new_state);

        Some(new_state)
    }

    fn publish(&self, state: &InnerState) {
        self.context.cache.transaction_updated(&self.clone().into());

        if matches!(state, InnerState::Done(_)) && self.is_self_verification() {
            self.context.own_device_verified(self.other_device_id());
        }

        if let Some(handle) = &self.request_handle {
            match state {
                InnerState::Cancelled(s) if !s.state.superseded => {
                    handle.child_cancelled(&s.state.cancelled.clone().into())
                }
                InnerState::Done(_) => handle.child_done(),
                _ => {}
            }
        }
    }

    fn generate_secret() -> Base64 {
        let mut shared_secret = vec![0u8; SECRET_SIZE];
        let mut rng = thread_rng();
        rng.fill_bytes(&mut shared_secret);

        Base64::new(shared_secret)
    }

    /// A QR code for verifying one of our own devices, we trust our master
    /// key.
    pub(crate) fn new_self(
        flow_id: FlowId,
        own_master_key: Ed25519PublicKey,
        other_device_key: Ed25519PublicKey,
        identities: IdentitiesBeingVerified,
        context: FlowContext,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Self {
        let inner: QrVerificationData = SelfVerificationData::new(
            flow_id.as_str().to_owned(),
            own_master_key,
            other_device_key,
            Self::generate_secret(),
        )
        .into();

        Self::new_helper(flow_id, inner, identities, context, we_started, request_handle)
    }

    /// A QR code for verifying one of our own devices, we don't trust our
    /// master key yet.
    pub(crate) fn new_self_no_master(
        flow_id: FlowId,
        own_master_key: Ed25519PublicKey,
        identities: IdentitiesBeingVerified,
        context: FlowContext,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> QrVerification {
        let inner: QrVerificationData = SelfVerificationNoMasterKey::new(
            flow_id.as_str().to_owned(),
            identities.own_device().ed25519_key(),
            own_master_key,
            Self::generate_secret(),
        )
        .into();

        Self::new_helper(flow_id, inner, identities, context, we_started, request_handle)
    }

    /// A QR code for verifying another user.
    pub(crate) fn new_cross(
        flow_id: FlowId,
        own_master_key: Ed25519PublicKey,
        other_master_key: Ed25519PublicKey,
        identities: IdentitiesBeingVerified,
        context: FlowContext,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Self {
        let inner: QrVerificationData = VerificationData::new(
            flow_id.as_str().to_owned(),
            own_master_key,
            other_master_key,
            Self::generate_secret(),
        )
        .into();

        Self::new_helper(flow_id, inner, identities, context, we_started, request_handle)
    }

    /// Check a QR code we scanned against the keys we know about.
    ///
    /// The returned verification is in the reciprocated state, the start
    /// message still needs to be sent with [`QrVerification::reciprocate`].
    pub(crate) async fn from_scan(
        context: FlowContext,
        other_device: DeviceData,
        flow_id: FlowId,
        qr_code: QrVerificationData,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Result<Self, ScanError> {
        if flow_id.as_str() != qr_code.flow_id() {
            return Err(ScanError::FlowIdMismatch {
                expected: flow_id.as_str().to_owned(),
                found: qr_code.flow_id().to_owned(),
            });
        }

        let identities = IdentitiesBeingVerified::new(context.store.clone(), other_device).await?;

        let own_identity = identities.own_master_key().ok_or_else(|| {
            ScanError::MissingCrossSigningIdentity(identities.user_id().to_owned())
        })?;

        let other_identity = identities.other_master_key().ok_or_else(|| {
            ScanError::MissingCrossSigningIdentity(identities.other_user_id().to_owned())
        })?;

        let check_key = |expected: Ed25519PublicKey, found: Ed25519PublicKey| {
            if expected != found {
                Err(ScanError::KeyMismatch {
                    expected: expected.to_base64(),
                    found: found.to_base64(),
                })
            } else {
                Ok(())
            }
        };
        let check_master_key = |key, identity: &MasterPubkey| check_key(identity.key(), key);

        match qr_code {
            QrVerificationData::Verification(_) => {
                check_master_key(qr_code.first_key(), other_identity)?;
                check_master_key(qr_code.second_key(), own_identity)?;
            }
            QrVerificationData::SelfVerification(_) => {
                check_master_key(qr_code.first_key(), other_identity)?;
                check_key(identities.own_device().ed25519_key(), qr_code.second_key())?;
            }
            QrVerificationData::SelfVerificationNoMasterKey(_) => {
                check_key(identities.other_device().ed25519_key(), qr_code.first_key())?;
                check_master_key(qr_code.second_key(), other_identity)?;
            }
        }

        trace!(flow_id = flow_id.as_str(), "The scanned QR code matches the keys we know about");

        let secret = qr_code.secret().to_owned();

        Ok(Self {
            flow_id: flow_id.into(),
            inner: qr_code.into(),
            state: SharedObservable::new(InnerState::Reciprocated(QrState {
                state: Reciprocated { secret },
            })),
            identities,
            context,
            request_handle,
            we_started,
            creation_time: Instant::now().into(),
        })
    }

    fn new_helper(
        flow_id: FlowId,
        inner: QrVerificationData,
        identities: IdentitiesBeingVerified,
        context: FlowContext,
        we_started: bool,
        request_handle: Option<RequestHandle>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            inner: inner.into(),
            state: SharedObservable::new(InnerState::Created(QrState { state: Created })),
            identities,
            context,
            request_handle,
            we_started,
            creation_time: Instant::now().into(),
        }
    }
}

#[derive(Clone, Debug)]
enum InnerState {
    /// We know the keys of the other device and can show our QR code.
    Created(QrState<Created>),

    /// The other side has scanned our QR code and sent a reciprocation start
    /// message with a matching shared secret.
    Scanned(QrState<Scanned>),

    /// Our user has confirmed that the other device scanned successfully. We
    /// have sent a done message.
    Confirmed(QrState<Confirmed>),

    /// We have scanned the QR code of the other side.
    Reciprocated(QrState<Reciprocated>),

    /// The done message of the other side arrived, the keys are being marked
    /// as trusted.
    Verifying(QrState<Verifying>),

    /// Verification complete, the done message of the other side arrived.
    Done(QrState<Done>),

    /// Verification cancelled or failed.
    Cancelled(QrState<QrCancelled>),
}

impl InnerState {
    fn is_terminal(&self) -> bool {
        matches!(self, InnerState::Done(_) | InnerState::Cancelled(_))
    }
}

#[derive(Clone, Debug)]
struct QrState<S: Clone> {
    state: S,
}

#[derive(Clone, Debug)]
struct Created;

#[derive(Clone, Debug)]
struct Scanned;

#[derive(Clone, Debug)]
struct Confirmed;

#[derive(Clone, Debug)]
struct Reciprocated {
    secret: Base64,
}

#[derive(Clone, Debug)]
struct Verifying {
    reciprocated: bool,
}

#[derive(Clone, Debug)]
struct Done {
    verified_devices: Arc<[DeviceData]>,
    master_key_verified: bool,
}

#[derive(Clone, Debug)]
struct QrCancelled {
    cancelled: Cancelled,
    superseded: bool,
}

impl QrState<Created> {
    fn receive_reciprocate(
        self,
        data: &QrVerificationData,
        start: &ReciprocateStart,
    ) -> Result<QrState<Scanned>, QrState<QrCancelled>> {
        let matches = STANDARD_NO_PAD
            .decode(start.secret.trim_end_matches('='))
            .is_ok_and(|secret| bool::from(secret.ct_eq(data.secret().as_bytes())));

        if matches {
            Ok(QrState { state: Scanned })
        } else {
            Err(QrState::<QrCancelled>::new(true, CancelCode::KeyMismatch))
        }
    }
}

impl QrState<Scanned> {
    fn confirm_scanning(self) -> QrState<Confirmed> {
        QrState { state: Confirmed }
    }
}

impl QrState<Reciprocated> {
    fn as_content(&self, own_device: &DeviceData, flow_id: &FlowId) -> VerificationContent {
        VerificationContent::Start(StartContent {
            from_device: Some(own_device.device_id().to_string()),
            method: Some(VerificationMethod::ReciprocateV1),
            secret: Some(self.state.secret.encode()),
            flow: flow_id.flow_fields(),
            ..Default::default()
        })
    }
}

impl QrState<QrCancelled> {
    fn new(cancelled_by_us: bool, code: CancelCode) -> Self {
        QrState {
            state: QrCancelled {
                cancelled: Cancelled::new(cancelled_by_us, code),
                superseded: false,
            },
        }
    }

    fn superseded() -> Self {
        QrState {
            state: QrCancelled {
                cancelled: Cancelled::new(true, CancelCode::User),
                superseded: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::serde::Base64;
    use stream_assert::{assert_next_matches, assert_pending};
    use vodozemac::Ed25519SecretKey;

    use super::{QrVerificationData, QrVerificationState, ScanError, VerificationData};
    use crate::{
        identities::MasterPubkey,
        types::CancelCode,
        verification::{
            done_content,
            tests::{deliver_all, setup_pair, setup_self_pair, TestDevice},
            VerificationRequest,
        },
    };

    /// Both users have a master key, each of them only trusts their own.
    async fn setup_cross_signed_pair() -> (TestDevice, TestDevice) {
        let (alice, bob) = setup_pair().await;
        let alice_master = Ed25519SecretKey::new().public_key();
        let bob_master = Ed25519SecretKey::new().public_key();

        alice.store.set_master_key(MasterPubkey::new(alice.user_id().into(), alice_master, true));
        alice.store.set_master_key(MasterPubkey::new(bob.user_id().into(), bob_master, false));
        bob.store.set_master_key(MasterPubkey::new(bob.user_id().into(), bob_master, true));
        bob.store.set_master_key(MasterPubkey::new(alice.user_id().into(), alice_master, false));

        (alice, bob)
    }

    /// Alice requests, Bob accepts and shows a QR code.
    async fn ready_requests(
        alice: &TestDevice,
        bob: &TestDevice,
    ) -> (VerificationRequest, VerificationRequest) {
        let alice_request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        deliver_all(alice, bob).await;

        let bob_request =
            bob.machine.get_request(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        bob_request.accept().await.unwrap();
        deliver_all(bob, alice).await;

        (alice_request, bob_request)
    }

    #[tokio::test]
    async fn cross_user_qr_verification() {
        let (alice, bob) = setup_cross_signed_pair().await;
        let (alice_request, bob_request) = ready_requests(&alice, &bob).await;
        let flow_id = alice_request.flow_id().as_str();

        let bob_qr = bob.machine.get_qr(alice.user_id(), flow_id).unwrap();
        assert_eq!(bob_qr.state(), QrVerificationState::Started);
        let mut bob_changes = bob_qr.changes();

        let data = QrVerificationData::from_bytes(bob_qr.to_bytes().unwrap()).unwrap();
        assert_matches!(data, QrVerificationData::Verification(_));

        let alice_qr = alice_request.scan_qr_code(data).await.unwrap().unwrap();
        assert_eq!(alice_qr.state(), QrVerificationState::Reciprocated);
        assert!(alice_qr.reciprocated());

        deliver_all(&alice, &bob).await;
        assert_next_matches!(bob_changes, QrVerificationState::Scanned);
        assert!(bob_qr.has_been_scanned());

        // Nothing gets trusted before the user confirms.
        assert!(bob.store.trusted_master_keys().is_empty());

        bob_qr.confirm_scanning().await;
        assert_next_matches!(bob_changes, QrVerificationState::Confirmed);
        assert!(bob_qr.has_been_confirmed());

        deliver_all(&bob, &alice).await;
        assert_matches!(
            alice_qr.state(),
            QrVerificationState::Done { verified_devices, master_key_verified: true } => {
                assert!(verified_devices.is_empty());
            }
        );

        deliver_all(&alice, &bob).await;
        assert_next_matches!(bob_changes, QrVerificationState::Done { .. });
        assert_pending!(bob_changes);

        assert!(alice_request.is_done());
        assert!(bob_request.is_done());
        assert_eq!(alice.store.trusted_master_keys(), vec![bob.user_id().to_owned()]);
        assert_eq!(bob.store.trusted_master_keys(), vec![alice.user_id().to_owned()]);
        assert!(alice.store.verified_devices().is_empty());
    }

    #[tokio::test]
    async fn concurrent_done_messages_apply_the_trust_once() {
        let (alice, bob) = setup_cross_signed_pair().await;
        let (alice_request, _) = ready_requests(&alice, &bob).await;

        let bob_qr = bob.machine.get_qr(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        let data = QrVerificationData::from_bytes(bob_qr.to_bytes().unwrap()).unwrap();
        let alice_qr = alice_request.scan_qr_code(data).await.unwrap().unwrap();
        deliver_all(&alice, &bob).await;

        bob_qr.confirm_scanning().await;
        bob.transport.drain();

        let done = done_content(alice_qr.flow_id());
        tokio::join!(bob.send_to(&alice, done.clone()), bob.send_to(&alice, done));

        assert!(alice_qr.is_done());
        assert!(alice_request.is_done());
        assert_eq!(alice.store.trusted_master_keys(), vec![bob.user_id().to_owned()]);

        // A single done message goes back.
        assert!(alice.transport.pop().is_some());
        assert!(alice.transport.is_empty());
    }

    #[tokio::test]
    async fn forged_secret_is_refused() {
        let (alice, bob) = setup_cross_signed_pair().await;
        let (alice_request, bob_request) = ready_requests(&alice, &bob).await;

        let bob_qr = bob.machine.get_qr(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        let data = QrVerificationData::from_bytes(bob_qr.to_bytes().unwrap()).unwrap();
        let forged: QrVerificationData = VerificationData::new(
            data.flow_id().to_owned(),
            data.first_key(),
            data.second_key(),
            Base64::new(vec![0u8; 16]),
        )
        .into();

        let alice_qr = alice_request.scan_qr_code(forged).await.unwrap().unwrap();
        deliver_all(&alice, &bob).await;

        assert_matches!(bob_qr.cancel_info(), Some(info) => {
            assert!(info.cancelled_by_us());
            assert_eq!(info.cancel_code(), &CancelCode::KeyMismatch);
        });
        assert!(bob_request.is_cancelled());

        deliver_all(&bob, &alice).await;
        assert_matches!(alice_qr.cancel_info(), Some(info) => {
            assert!(!info.cancelled_by_us());
            assert_eq!(info.cancel_code(), &CancelCode::KeyMismatch);
        });
        assert!(alice_request.is_cancelled());
        assert!(bob.store.trusted_master_keys().is_empty());
    }

    #[tokio::test]
    async fn scanned_codes_are_checked_against_known_keys() {
        let (alice, bob) = setup_cross_signed_pair().await;
        let (alice_request, _) = ready_requests(&alice, &bob).await;

        let bob_qr = bob.machine.get_qr(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        let data = QrVerificationData::from_bytes(bob_qr.to_bytes().unwrap()).unwrap();

        let wrong_flow: QrVerificationData = VerificationData::new(
            "another_flow".to_owned(),
            data.first_key(),
            data.second_key(),
            data.secret().to_owned(),
        )
        .into();
        assert_matches!(
            alice_request.scan_qr_code(wrong_flow).await,
            Err(ScanError::FlowIdMismatch { .. })
        );

        let wrong_key: QrVerificationData = VerificationData::new(
            data.flow_id().to_owned(),
            Ed25519SecretKey::new().public_key(),
            data.second_key(),
            data.secret().to_owned(),
        )
        .into();
        assert_matches!(
            alice_request.scan_qr_code(wrong_key).await,
            Err(ScanError::KeyMismatch { .. })
        );

        // Failed scans leave the request alone.
        assert!(alice_request.is_ready());
        assert!(alice.transport.is_empty());
        assert!(alice_request.scan_qr_code(data).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_qr_code_without_master_keys() {
        let (alice, bob) = setup_pair().await;
        let (alice_request, bob_request) = ready_requests(&alice, &bob).await;

        assert!(bob.machine.get_qr(alice.user_id(), alice_request.flow_id().as_str()).is_none());
        assert!(bob_request.generate_qr_code().await.unwrap().is_none());
        assert!(alice_request.generate_qr_code().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn self_verification_with_qr_code() {
        let (phone, laptop) = setup_self_pair().await;
        let master_key = Ed25519SecretKey::new().public_key();

        // Only the phone trusts our master key so far.
        phone.store.set_master_key(MasterPubkey::new(phone.user_id().into(), master_key, true));
        laptop.store.set_master_key(MasterPubkey::new(phone.user_id().into(), master_key, false));

        let (laptop_request, phone_request) = ready_requests(&laptop, &phone).await;

        let phone_qr =
            phone.machine.get_qr(phone.user_id(), laptop_request.flow_id().as_str()).unwrap();
        let data = QrVerificationData::from_bytes(phone_qr.to_bytes().unwrap()).unwrap();
        assert_matches!(data, QrVerificationData::SelfVerification(_));

        let laptop_qr = laptop_request.scan_qr_code(data).await.unwrap().unwrap();
        deliver_all(&laptop, &phone).await;

        phone_qr.confirm_scanning().await;
        deliver_all(&phone, &laptop).await;
        deliver_all(&laptop, &phone).await;

        assert!(phone_qr.is_done());
        assert!(laptop_qr.is_done());
        assert!(phone_request.is_done());
        assert!(laptop_request.is_done());

        // The phone vouches for the laptop, the laptop learns to trust the
        // master key.
        assert_eq!(
            phone.store.verified_devices(),
            vec![(phone.user_id().to_owned(), laptop.device_id().to_owned())]
        );
        assert_eq!(laptop.store.trusted_master_keys(), vec![phone.user_id().to_owned()]);
        assert_eq!(phone.gossip.completed(), vec![laptop.device_id().to_owned()]);
        assert_eq!(laptop.gossip.completed(), vec![phone.device_id().to_owned()]);
    }

    #[tokio::test]
    async fn starting_sas_replaces_the_qr_code() {
        let (alice, bob) = setup_cross_signed_pair().await;
        let (alice_request, bob_request) = ready_requests(&alice, &bob).await;
        let flow_id = alice_request.flow_id().as_str();

        let bob_qr = bob.machine.get_qr(alice.user_id(), flow_id).unwrap();

        let alice_sas = alice_request.start_sas().await.unwrap().unwrap();
        deliver_all(&alice, &bob).await;

        assert!(bob.machine.get_qr(alice.user_id(), flow_id).is_none());
        let bob_sas = bob.machine.get_sas(alice.user_id(), flow_id).unwrap();
        assert!(bob_sas.has_been_accepted());

        // The QR code is gone without telling anyone, the request lives on.
        assert!(bob_qr.is_cancelled());
        assert!(!bob_request.is_cancelled());
        assert!(!alice_sas.is_cancelled());
    }
}
