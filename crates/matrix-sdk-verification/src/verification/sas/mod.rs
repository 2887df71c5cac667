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

mod crypto;
mod helpers;
mod inner_sas;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use eyeball::SharedObservable;
use futures_core::Stream;
pub use helpers::{emoji_from_index, format_decimals, EmojiShortAuthString};
use helpers::SasIds;
pub use inner_sas::AcceptedProtocols;
use inner_sas::{InnerSas, InnerState, Role, SasEffect};
use ruma::{to_device::DeviceIdOrAllDevices, DeviceId, RoomId, UserId};
use tracing::{debug, trace, warn};

use super::{
    event_enums::{SasStart, ValidContent},
    requests::RequestHandle,
    CancelInfo, FlowContext, FlowId, IdentitiesBeingVerified, VerificationResult,
};
use crate::{
    identities::DeviceData,
    store::StoreError,
    transport::OutgoingVerificationRequest,
    types::{CancelCode, VerificationContent},
    Emoji,
};

/// Short authentication string object.
#[derive(Clone, Debug)]
pub struct Sas {
    inner: Arc<StdMutex<InnerSas>>,
    state: SharedObservable<SasState>,
    identities: IdentitiesBeingVerified,
    context: FlowContext,
    flow_id: Arc<FlowId>,
    request_handle: Option<RequestHandle>,
}

/// An Enum describing the state the SAS verification is in.
#[derive(Clone, Debug, PartialEq)]
pub enum SasState {
    /// We created the verification but the start message hasn't been sent
    /// out yet.
    Created,
    /// The verification has been started, the protocols that should be used
    /// have been proposed and can be accepted.
    Started,
    /// The verification has been accepted and both sides agreed to a set of
    /// protocols that will be used for the verification process.
    Accepted {
        /// The protocols that were accepted in the `m.key.verification.accept`
        /// message.
        accepted_protocols: AcceptedProtocols,
    },
    /// The public keys have been exchanged and the short auth string can be
    /// presented to the user.
    KeysExchanged {
        /// The emojis that represent the short auth string, will be `None` if
        /// the emoji SAS method wasn't part of the [`AcceptedProtocols`].
        emojis: Option<EmojiShortAuthString>,
        /// The list of decimals that represent the short auth string.
        decimals: (u16, u16, u16),
    },
    /// The verification process has been confirmed from our side, we're waiting
    /// for the other side to confirm as well.
    Confirmed,
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

impl From<&InnerSas> for SasState {
    fn from(sas: &InnerSas) -> Self {
        let accepted = || match sas.accepted_protocols() {
            Some(p) => Self::Accepted { accepted_protocols: p.clone() },
            None => Self::Started,
        };

        match sas.state() {
            InnerState::Created | InnerState::SendingStart => Self::Created,
            InnerState::Started | InnerState::OnStarted => Self::Started,
            InnerState::SendingAccept
            | InnerState::Accepted
            | InnerState::OnAccepted
            | InnerState::SendingKey
            | InnerState::KeySent => accepted(),
            InnerState::ShortCodeReady => match sas.decimals() {
                Some(decimals) => Self::KeysExchanged { emojis: sas.emoji(), decimals },
                None => accepted(),
            },
            InnerState::ShortCodeAccepted
            | InnerState::SendingMac
            | InnerState::MacSent
            | InnerState::Verifying => Self::Confirmed,
            InnerState::Verified => {
                let (verified_devices, master_key_verified) =
                    sas.verified().map(|(d, m)| (d.to_vec(), m)).unwrap_or_default();

                Self::Done { verified_devices, master_key_verified }
            }
            InnerState::Cancelled(c) => Self::Cancelled(c.clone().into()),
        }
    }
}

impl Sas {
    async fn new(
        context: FlowContext,
        other_device: DeviceData,
        request_handle: Option<RequestHandle>,
        create: impl FnOnce(SasIds) -> InnerSas,
    ) -> Result<Self, StoreError> {
        let identities =
            IdentitiesBeingVerified::new(context.store.clone(), other_device.clone()).await?;

        let own_device = context.store.own_device.clone();
        let mut other_devices = context.store.get_user_devices(other_device.user_id()).await?;
        if other_device.user_id() == own_device.user_id() {
            other_devices.remove(own_device.device_id());
        }
        other_devices
            .entry(other_device.device_id().to_owned())
            .or_insert_with(|| other_device.clone());

        let ids = SasIds {
            own_device,
            own_master_key: identities.own_trusted_master_key().cloned(),
            other_device,
            other_devices,
            other_master_key: identities.other_master_key().cloned(),
        };

        let inner = create(ids);
        let flow_id = Arc::new(inner.flow_id().clone());
        let state = SharedObservable::new(SasState::from(&inner));

        Ok(Self {
            inner: Arc::new(StdMutex::new(inner)),
            state,
            identities,
            context,
            flow_id,
            request_handle,
        })
    }

    /// Create a new SAS verification flow that we are going to start.
    ///
    /// The start message is only sent out by [`Sas::send_start`].
    pub(crate) async fn start(
        context: FlowContext,
        other_device: DeviceData,
        flow_id: FlowId,
        request_handle: Option<RequestHandle>,
    ) -> Result<Self, StoreError> {
        let started_from_request = request_handle.is_some();
        let settings = context.settings.clone();

        Self::new(context, other_device, request_handle, |ids| {
            InnerSas::new_initiator(ids, flow_id, started_from_request, &settings)
        })
        .await
    }

    /// Create a new SAS verification flow from a start message of the other
    /// side.
    pub(crate) async fn from_start(
        context: FlowContext,
        other_device: DeviceData,
        flow_id: FlowId,
        start: SasStart,
        request_handle: Option<RequestHandle>,
    ) -> Result<Self, StoreError> {
        let started_from_request = request_handle.is_some();
        let settings = context.settings.clone();

        Self::new(context, other_device, request_handle, |ids| {
            InnerSas::from_start(ids, flow_id, start, started_from_request, &settings)
        })
        .await
    }

    fn lock(&self) -> MutexGuard<'_, InnerSas> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get our own user id.
    pub fn user_id(&self) -> &UserId {
        self.identities.user_id()
    }

    /// Get our own device ID.
    pub fn device_id(&self) -> &DeviceId {
        self.identities.own_device().device_id()
    }

    /// Get the user id of the other side.
    pub fn other_user_id(&self) -> &UserId {
        self.identities.other_user_id()
    }

    /// Get the device ID of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        self.identities.other_device_id()
    }

    /// Get the device of the other user.
    pub fn other_device(&self) -> &DeviceData {
        self.identities.other_device()
    }

    /// Get the unique ID that identifies this SAS verification flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Get the room id if the verification is happening inside a room.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.flow_id.room_id()
    }

    /// Does this verification flow support displaying emoji for the short
    /// authentication string.
    pub fn supports_emoji(&self) -> bool {
        self.lock().accepted_protocols().is_some_and(|p| p.supports_emoji())
    }

    /// Did this verification flow start from a verification request.
    pub fn started_from_request(&self) -> bool {
        self.lock().started_from_request()
    }

    /// Is this a verification that is verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.identities.is_self_verification()
    }

    /// Have we confirmed that the short auth string matches.
    pub fn have_we_confirmed(&self) -> bool {
        matches!(self.state(), SasState::Confirmed | SasState::Done { .. })
    }

    /// Has the verification been accepted by both parties.
    pub fn has_been_accepted(&self) -> bool {
        matches!(
            self.state(),
            SasState::Accepted { .. }
                | SasState::KeysExchanged { .. }
                | SasState::Confirmed
                | SasState::Done { .. }
        )
    }

    /// Get info about the cancellation if the verification flow has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        match self.state() {
            SasState::Cancelled(info) => Some(info),
            _ => None,
        }
    }

    /// Did we initiate the verification flow.
    pub fn we_started(&self) -> bool {
        self.lock().role() == Role::Initiator
    }

    /// Is the SAS flow done.
    pub fn is_done(&self) -> bool {
        matches!(self.state(), SasState::Done { .. })
    }

    /// Is the SAS flow cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), SasState::Cancelled(_))
    }

    /// Has the SAS verification flow timed out.
    pub fn timed_out(&self) -> bool {
        self.lock().timed_out()
    }

    /// Are we in a state where we can show the short auth string.
    pub fn can_be_presented(&self) -> bool {
        matches!(self.state(), SasState::KeysExchanged { .. })
    }

    /// Get the emoji version of the short auth string.
    ///
    /// Returns None if we can't yet present the short auth string, otherwise
    /// seven tuples containing the emoji and description.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        self.lock().emoji().map(|e| e.emojis)
    }

    /// Get the index of the emoji representing the short auth string
    ///
    /// Returns None if we can't yet present the short auth string, otherwise
    /// seven u8 numbers in the range from 0 to 63 inclusive which can be
    /// converted to an emoji using the
    /// [relevant spec entry](https://spec.matrix.org/unstable/client-server-api/#sas-method-emoji).
    pub fn emoji_index(&self) -> Option<[u8; 7]> {
        self.lock().emoji().map(|e| e.indices)
    }

    /// Get the decimal version of the short auth string.
    ///
    /// Returns None if we can't yet present the short auth string, otherwise a
    /// tuple containing three 4-digit integers that represent the short auth
    /// string.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        self.lock().decimals()
    }

    /// Accept the SAS verification.
    ///
    /// This does nothing if the verification was already accepted or if we
    /// are the side that started the verification.
    pub async fn accept(&self) {
        let effects = self.lock().accept();
        self.run(effects).await;
    }

    /// Confirm the Sas verification.
    ///
    /// This confirms that the short auth strings match on both sides. The
    /// trust store is only told about the verified keys once the MAC of the
    /// other side arrived and matched.
    pub async fn confirm(&self) {
        let effects = self.lock().confirm();
        self.run(effects).await;
    }

    /// Tell the other side that the short auth strings don't match.
    pub async fn mismatch(&self) {
        let effects = self.lock().mismatch();
        self.run(effects).await;
    }

    /// Cancel the verification.
    ///
    /// This cancels the verification with the `CancelCode::User`.
    pub async fn cancel(&self) {
        self.cancel_with_code(CancelCode::User).await;
    }

    /// Cancel the verification.
    ///
    /// This cancels the verification with given `CancelCode`.
    ///
    /// **Note**: This method should generally not be used, the [`cancel()`]
    /// method should be preferred. The SDK will automatically cancel with the
    /// appropriate cancel code, user initiated cancellations should only
    /// cancel with the `CancelCode::User`
    ///
    /// [`cancel()`]: #method.cancel
    pub async fn cancel_with_code(&self, code: CancelCode) {
        let effects = self.lock().cancel(true, code);
        self.run(effects).await;
    }

    pub(crate) async fn cancel_if_timed_out(&self) -> bool {
        let effects = {
            let mut inner = self.lock();

            if inner.is_terminal() || !inner.timed_out() {
                return false;
            }

            inner.time_out()
        };

        self.run(effects).await;

        true
    }

    /// Listen for changes in the SAS verification process.
    ///
    /// The changes are presented as a stream of [`SasState`] values.
    ///
    /// This method can be used to react to changes in the state of the
    /// verification process, or rather the method can be used to handle
    /// each step of the verification process.
    ///
    /// # Flowchart
    ///
    /// The flow of the verification process is pictured below. Please note
    /// that the process can be cancelled at each step of the process.
    /// Either side can cancel the process.
    ///
    /// ```text
    ///                ┌───────┐
    ///                │Started│
    ///                └───┬───┘
    ///                    │
    ///               ┌────⌄───┐
    ///               │Accepted│
    ///               └────┬───┘
    ///                    │
    ///            ┌───────⌄──────┐
    ///            │Keys Exchanged│
    ///            └───────┬──────┘
    ///                    │
    ///            ________⌄________
    ///           ╱                 ╲       ┌─────────┐
    ///          ╱   Does the short  ╲______│Cancelled│
    ///          ╲ auth string match ╱ no   └─────────┘
    ///           ╲_________________╱
    ///                    │yes
    ///                    │
    ///               ┌────⌄────┐
    ///               │Confirmed│
    ///               └────┬────┘
    ///                    │
    ///                ┌───⌄───┐
    ///                │  Done │
    ///                └───────┘
    /// ```
    /// # Example
    ///
    /// ```no_run
    /// use futures_util::StreamExt;
    /// use matrix_sdk_verification::{Sas, SasState};
    ///
    /// # futures_executor::block_on(async {
    /// # let sas: Sas = unimplemented!();
    /// let mut stream = sas.changes();
    ///
    /// while let Some(state) = stream.next().await {
    ///     match state {
    ///         SasState::KeysExchanged { emojis, decimals } => {
    ///             println!("Do these match {emojis:#?} {decimals:?}");
    ///
    ///             // Ask the user to confirm or cancel here.
    ///         }
    ///         SasState::Done { .. } => {
    ///             let device = sas.other_device();
    ///             println!(
    ///                 "Successfully verified device {} {}",
    ///                 device.user_id(),
    ///                 device.device_id(),
    ///             );
    ///
    ///             break;
    ///         }
    ///         SasState::Cancelled(cancel_info) => {
    ///             println!(
    ///                 "The verification has been cancelled, reason: {}",
    ///                 cancel_info.reason()
    ///             );
    ///             break;
    ///         }
    ///         SasState::Created
    ///         | SasState::Started
    ///         | SasState::Accepted { .. }
    ///         | SasState::Confirmed => (),
    ///     }
    /// }
    /// # });
    /// ```
    pub fn changes(&self) -> impl Stream<Item = SasState> {
        self.state.subscribe()
    }

    /// Get the current state of the verification process.
    pub fn state(&self) -> SasState {
        self.state.get()
    }

    /// Send out our start message.
    pub(crate) async fn send_start(&self) {
        let effects = self.lock().start();
        self.run(effects).await;
    }

    /// Feed a validated message of the other side into the flow.
    pub(crate) async fn receive(&self, content: &ValidContent) {
        let effects = self.lock().receive(content);
        self.run(effects).await;
    }

    /// A concurrent start replaced this flow, drop it without telling the
    /// other side.
    pub(crate) fn supersede(&self) {
        self.lock().supersede();
        self.publish();
    }

    /// Did the other side already send us their done message.
    pub(crate) fn their_done(&self) -> bool {
        self.lock().their_done()
    }

    pub(crate) fn same_instance(&self, other: &Sas) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn outgoing(&self, content: VerificationContent) -> OutgoingVerificationRequest {
        OutgoingVerificationRequest::for_flow(
            &self.flow_id,
            self.other_user_id().to_owned(),
            vec![DeviceIdOrAllDevices::DeviceId(self.other_device_id().to_owned())],
            content,
        )
    }

    /// Execute the effects of a transition, the lock guarding the state
    /// machine is never held across an await point.
    async fn run(&self, effects: Vec<SasEffect>) {
        let mut queue = VecDeque::from(effects);
        self.publish();

        while let Some(effect) = queue.pop_front() {
            let more = match effect {
                SasEffect::Send { content, advance, on_failure } => {
                    let request = self.outgoing(content);

                    match self.context.send(&request).await {
                        Ok(_) => {
                            if let Some(advance) = advance {
                                self.lock().mark_sent(&advance);
                            }

                            Vec::new()
                        }
                        Err(e) => {
                            warn!(
                                flow_id = self.flow_id.as_str(),
                                event_type = request.content.event_type(),
                                error = ?e,
                                "Couldn't send a SAS message"
                            );

                            match on_failure {
                                Some(code) => self.lock().send_failed(code),
                                None => Vec::new(),
                            }
                        }
                    }
                }
                SasEffect::ReleaseKeys => {
                    trace!(flow_id = self.flow_id.as_str(), "Released the SAS key material");
                    Vec::new()
                }
                SasEffect::ApplyTrust { verified_devices, master_key_verified } => {
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

                    debug!(flow_id = self.flow_id.as_str(), ?result, "Applied the SAS trust");

                    self.lock().trust_applied(result)
                }
            };

            self.publish();
            queue.extend(more);
        }
    }

    /// Push the current state out to the observers.
    fn publish(&self) {
        let (state, superseded) = {
            let inner = self.lock();
            let state = SasState::from(&*inner);

            if self.state.set_if_not_eq(state.clone()).is_none() {
                return;
            }

            (state, inner.is_superseded())
        };

        self.context.cache.transaction_updated(&self.clone().into());

        if matches!(state, SasState::Done { .. }) && self.is_self_verification() {
            self.context.own_device_verified(self.other_device_id());
        }

        if let Some(handle) = &self.request_handle {
            match &state {
                SasState::Cancelled(info) if !superseded => handle.child_cancelled(info),
                SasState::Done { .. } => handle.child_done(),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use stream_assert::{assert_next_matches, assert_pending};

    use super::SasState;
    use crate::{
        types::CancelCode,
        verification::tests::{deliver_all, setup_pair},
    };

    #[tokio::test]
    async fn sas_without_a_request() {
        let (alice, bob) = setup_pair().await;

        let alice_sas =
            alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        assert!(alice_sas.we_started());
        assert!(!alice_sas.started_from_request());
        assert_eq!(alice_sas.state(), SasState::Started);

        deliver_all(&alice, &bob).await;

        let bob_sas =
            bob.machine.get_sas(alice.user_id(), alice_sas.flow_id().as_str()).unwrap();
        assert!(!bob_sas.we_started());
        // Flows without a request are never accepted automatically.
        assert_eq!(bob_sas.state(), SasState::Started);

        let mut alice_changes = alice_sas.changes();
        assert_pending!(alice_changes);

        bob_sas.accept().await;
        assert!(bob_sas.has_been_accepted());

        deliver_all(&bob, &alice).await;
        assert_next_matches!(alice_changes, SasState::Accepted { .. });

        deliver_all(&alice, &bob).await;
        deliver_all(&bob, &alice).await;

        assert_next_matches!(alice_changes, SasState::KeysExchanged { .. });
        assert!(alice_sas.can_be_presented());
        assert!(bob_sas.can_be_presented());
        assert!(alice_sas.supports_emoji());
        assert_eq!(alice_sas.emoji(), bob_sas.emoji());
        assert_eq!(alice_sas.emoji_index(), bob_sas.emoji_index());
        assert_eq!(alice_sas.decimals(), bob_sas.decimals());

        alice_sas.confirm().await;
        assert!(alice_sas.have_we_confirmed());
        assert_next_matches!(alice_changes, SasState::Confirmed);

        bob_sas.confirm().await;
        deliver_all(&bob, &alice).await;
        deliver_all(&alice, &bob).await;

        assert!(alice_sas.is_done());
        assert!(bob_sas.is_done());
        assert_next_matches!(alice_changes, SasState::Done { verified_devices, .. } => {
            assert_eq!(verified_devices, vec![bob.device.clone()]);
        });

        assert_eq!(
            alice.store.verified_devices(),
            vec![(bob.user_id().to_owned(), bob.device_id().to_owned())]
        );
        assert_eq!(
            bob.store.verified_devices(),
            vec![(alice.user_id().to_owned(), alice.device_id().to_owned())]
        );

        // Late messages don't change a finished flow.
        deliver_all(&bob, &alice).await;
        assert!(alice_sas.is_done());
        assert_pending!(alice_changes);
    }

    #[tokio::test]
    async fn mismatch_cancels_both_sides() {
        let (alice, bob) = setup_pair().await;

        let alice_sas =
            alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        deliver_all(&alice, &bob).await;

        let bob_sas =
            bob.machine.get_sas(alice.user_id(), alice_sas.flow_id().as_str()).unwrap();
        bob_sas.accept().await;
        deliver_all(&bob, &alice).await;
        deliver_all(&alice, &bob).await;
        deliver_all(&bob, &alice).await;

        bob_sas.mismatch().await;
        deliver_all(&bob, &alice).await;

        assert_matches!(bob_sas.cancel_info(), Some(info) => {
            assert!(info.cancelled_by_us());
            assert_eq!(info.cancel_code(), &CancelCode::MismatchedSas);
        });
        assert_matches!(alice_sas.cancel_info(), Some(info) => {
            assert!(!info.cancelled_by_us());
            assert_eq!(info.cancel_code(), &CancelCode::MismatchedSas);
        });

        // Confirming after the cancellation does nothing.
        alice_sas.confirm().await;
        assert!(alice_sas.is_cancelled());
        assert!(alice.store.verified_devices().is_empty());
        assert!(alice.transport.is_empty());
    }

    #[tokio::test]
    async fn failed_sends_cancel_the_flow() {
        let (alice, bob) = setup_pair().await;

        let alice_sas =
            alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        deliver_all(&alice, &bob).await;

        let bob_sas =
            bob.machine.get_sas(alice.user_id(), alice_sas.flow_id().as_str()).unwrap();

        bob.transport.set_failing(true);
        bob_sas.accept().await;

        assert_matches!(bob_sas.cancel_info(), Some(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::User);
        });

        // Cancelling again doesn't produce a new state.
        let mut changes = bob_sas.changes();
        bob_sas.cancel().await;
        assert_pending!(changes);
    }
}
