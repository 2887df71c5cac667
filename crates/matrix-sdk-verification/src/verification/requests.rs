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

use std::{cmp::Ordering, fmt, sync::Arc, time::Instant};

use as_variant::as_variant;
use eyeball::{ObservableWriteGuard, SharedObservable};
use futures_core::Stream;
use futures_util::StreamExt;
use ruma::{
    to_device::DeviceIdOrAllDevices, DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId,
    OwnedUserId, RoomId, UserId,
};
use tracing::{debug, info, trace, warn};

use super::{
    cache::RequestSnapshot,
    event_enums::{ValidCancel, ValidContent, ValidReady, ValidRequest, ValidStart},
    CancelInfo, Cancelled, FlowContext, FlowId, IdentitiesBeingVerified, QrVerification,
    QrVerificationData, QrVerificationState, Sas, ScanError, Verification,
};
use crate::{
    error::VerificationError,
    store::StoreError,
    transport::OutgoingVerificationRequest,
    types::{
        CancelCode, FlowFields, ReadyContent, RequestContent, VerificationContent,
        VerificationMethod,
    },
};

/// An object controlling key verification requests.
///
/// Interactive verification flows usually start with a verification request,
/// this object lets you send and reply to such a verification request.
///
/// After the initial handshake the verification flow transitions into one of
/// the verification methods.
#[derive(Clone, Debug)]
pub struct VerificationRequest {
    context: FlowContext,
    flow_id: Arc<FlowId>,
    other_user_id: OwnedUserId,
    inner: SharedObservable<InnerRequest>,
    creation_time: Arc<Instant>,
    we_started: bool,
    recipient_devices: Arc<Vec<OwnedDeviceId>>,
}

/// A handle to a request so child verification flows can report back to the
/// request they belong to.
///
/// A verification flow can branch off into different types of verification
/// flows after the initial request handshake is done. Once the child flow
/// finishes or gets cancelled, the request follows it.
#[derive(Clone)]
pub(crate) struct RequestHandle {
    request: VerificationRequest,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle").field("flow_id", &self.request.flow_id).finish()
    }
}

impl RequestHandle {
    /// The child flow got cancelled, the request shares its fate.
    pub fn child_cancelled(&self, info: &CancelInfo) {
        let cancelled = self
            .request
            .transition(|s| s.cancel(info.cancelled_by_us(), info.cancel_code()));

        if cancelled.is_some() {
            debug!(
                flow_id = self.request.flow_id.as_str(),
                code = info.cancel_code().as_str(),
                "The verification flow of a request was cancelled, cancelling the request"
            );
        }
    }

    /// The child flow finished successfully.
    pub fn child_done(&self) {
        self.request.transition(InnerRequest::finish);
    }
}

/// An Enum describing the state the verification request is in.
#[derive(Clone, Debug)]
pub enum VerificationRequestState {
    /// The verification request has been newly created by us.
    Created {
        /// The verification methods supported by us.
        our_methods: Vec<VerificationMethod>,
    },
    /// The verification request was received from the other party.
    Requested {
        /// The verification methods supported by the sender.
        their_methods: Vec<VerificationMethod>,
        /// The device ID of the device that sent the request.
        other_device_id: OwnedDeviceId,
    },
    /// The verification request is ready to start a verification flow.
    Ready {
        /// The verification methods supported by the other side.
        their_methods: Vec<VerificationMethod>,
        /// The verification methods supported by the us.
        our_methods: Vec<VerificationMethod>,
        /// The device ID of the device that responded to the verification
        /// request.
        other_device_id: OwnedDeviceId,
    },
    /// The verification request has transitioned into a concrete verification
    /// flow. For example it transitioned into the emoji based SAS
    /// verification.
    Transitioned {
        /// The concrete [`Verification`] object the verification request
        /// transitioned into.
        verification: Verification,
    },
    /// Another device of ours answered the request, we're only looking.
    Passive {
        /// The device that answered the request.
        other_device_id: OwnedDeviceId,
    },
    /// The verification flow that was started with this request has finished.
    Done,
    /// The verification process has been cancelled.
    Cancelled(CancelInfo),
}

impl From<&InnerRequest> for VerificationRequestState {
    fn from(value: &InnerRequest) -> Self {
        match value {
            InnerRequest::Created(s) => {
                Self::Created { our_methods: s.state.our_methods.to_owned() }
            }
            InnerRequest::Requested(s) => Self::Requested {
                their_methods: s.state.their_methods.to_owned(),
                other_device_id: s.state.other_device_id.to_owned(),
            },
            InnerRequest::Ready(s) => Self::Ready {
                their_methods: s.state.their_methods.to_owned(),
                our_methods: s.state.our_methods.to_owned(),
                other_device_id: s.state.other_device_id.to_owned(),
            },
            InnerRequest::Transitioned(s) => {
                Self::Transitioned { verification: s.state.verification.to_owned() }
            }
            InnerRequest::Passive(s) => {
                Self::Passive { other_device_id: s.state.other_device_id.to_owned() }
            }
            InnerRequest::Done(_) => Self::Done,
            InnerRequest::Cancelled(s) => Self::Cancelled(s.state.to_owned().into()),
        }
    }
}

impl VerificationRequest {
    /// A request we are about to send out.
    pub(crate) fn new(
        context: FlowContext,
        flow_id: FlowId,
        other_user_id: &UserId,
        recipient_devices: Vec<OwnedDeviceId>,
        our_methods: Vec<VerificationMethod>,
    ) -> Self {
        let flow_id = Arc::new(flow_id);
        let inner = InnerRequest::Created(RequestState {
            flow_id: flow_id.clone(),
            other_user_id: other_user_id.to_owned(),
            state: Created { our_methods },
        });

        Self {
            context,
            flow_id,
            other_user_id: other_user_id.to_owned(),
            inner: SharedObservable::new(inner),
            creation_time: Instant::now().into(),
            we_started: true,
            recipient_devices: recipient_devices.into(),
        }
    }

    /// A request the other side sent us.
    pub(crate) fn from_request(
        context: FlowContext,
        flow_id: FlowId,
        sender: &UserId,
        request: &ValidRequest,
    ) -> Self {
        let flow_id = Arc::new(flow_id);
        let inner = InnerRequest::Requested(RequestState {
            flow_id: flow_id.clone(),
            other_user_id: sender.to_owned(),
            state: Requested {
                their_methods: request.methods.to_owned(),
                other_device_id: request.from_device.to_owned(),
            },
        });

        Self {
            context,
            flow_id,
            other_user_id: sender.to_owned(),
            inner: SharedObservable::new(inner),
            creation_time: Instant::now().into(),
            we_started: false,
            recipient_devices: Vec::new().into(),
        }
    }

    /// The content of a `m.key.verification.request` message.
    ///
    /// In-room requests pass an empty [`FlowFields`], their flow id is the
    /// event id the request ends up with.
    pub(crate) fn request_content(
        own_device_id: &DeviceId,
        methods: Vec<VerificationMethod>,
        flow: FlowFields,
        to: Option<&UserId>,
    ) -> VerificationContent {
        VerificationContent::Request(RequestContent {
            from_device: Some(own_device_id.to_string()),
            methods: Some(methods),
            timestamp: Some(MilliSecondsSinceUnixEpoch::now().0.into()),
            to: to.map(|u| u.to_string()),
            flow,
        })
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        self.context.store.user_id()
    }

    /// The id of the other user that is participating in this verification
    /// request.
    pub fn other_user(&self) -> &UserId {
        &self.other_user_id
    }

    /// The id of the other device that is participating in this verification.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        self.inner.read().other_device_id()
    }

    /// Get the room id if the verification is happening inside a room.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.flow_id.room_id()
    }

    /// Get the unique ID of this verification request
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Has the verification request been answered by another device.
    pub fn is_passive(&self) -> bool {
        matches!(*self.inner.read(), InnerRequest::Passive(_))
    }

    /// Is the verification request ready to start a verification flow.
    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.read(), InnerRequest::Ready(_))
    }

    /// Has the verification flow that was started with this request finished.
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.read(), InnerRequest::Done(_))
    }

    /// Has the verification flow that was started with this request been
    /// cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.read(), InnerRequest::Cancelled(_))
    }

    /// Is this a verification that is verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.own_user_id() == self.other_user()
    }

    /// Did we initiate the verification request
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Get info about the cancellation if the verification request has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        as_variant!(&*self.inner.read(), InnerRequest::Cancelled(c) => c.state.clone().into())
    }

    /// Has the verification request been running for longer than allowed.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > self.context.settings.request_timeout
    }

    /// Get the supported verification methods of the other side.
    ///
    /// Will be present only if the other side requested the verification or
    /// if we're in the ready state.
    pub fn their_supported_methods(&self) -> Option<Vec<VerificationMethod>> {
        self.inner.read().their_methods().map(ToOwned::to_owned)
    }

    /// Get our own supported verification methods that we advertised.
    ///
    /// Will be present only we requested the verification or if we're in the
    /// ready state.
    pub fn our_supported_methods(&self) -> Option<Vec<VerificationMethod>> {
        self.inner.read().our_methods().map(ToOwned::to_owned)
    }

    /// Get the current state the verification request is in.
    ///
    /// To listen to changes to the [`VerificationRequestState`] use the
    /// [`VerificationRequest::changes`] method.
    pub fn state(&self) -> VerificationRequestState {
        (&*self.inner.read()).into()
    }

    /// Listen for changes in the verification request.
    ///
    /// The changes are presented as a stream of [`VerificationRequestState`]
    /// values.
    pub fn changes(&self) -> impl Stream<Item = VerificationRequestState> {
        self.inner.subscribe().map(|s| (&s).into())
    }

    /// Accept the verification request.
    ///
    /// This method will accept the request and signal by default that it
    /// supports the methods of the [`VerificationSettings`].
    ///
    /// [`VerificationSettings`]: crate::VerificationSettings
    pub async fn accept(&self) -> Result<(), VerificationError> {
        self.accept_with_methods(self.context.settings.methods.clone()).await
    }

    /// Accept the verification request signaling that our client supports the
    /// given verification methods.
    ///
    /// This does nothing unless the request is in the requested state. A QR
    /// code we can show is prepared right away and can be fetched using
    /// [`VerificationRequest::generate_qr_code`].
    pub async fn accept_with_methods(
        &self,
        methods: Vec<VerificationMethod>,
    ) -> Result<(), VerificationError> {
        let Some(requested) =
            as_variant!(&*self.inner.read(), InnerRequest::Requested(s) => s.state.clone())
        else {
            return Ok(());
        };

        let their_methods = &requested.their_methods;
        let both = |m: &VerificationMethod| methods.contains(m) && their_methods.contains(m);
        let pair = |ours: &VerificationMethod, theirs: &VerificationMethod| {
            methods.contains(ours) && their_methods.contains(theirs)
        };

        let mut ready_methods = Vec::new();

        if both(&VerificationMethod::SasV1) {
            ready_methods.push(VerificationMethod::SasV1);
        }

        let can_show = pair(&VerificationMethod::QrCodeShowV1, &VerificationMethod::QrCodeScanV1);

        let qr_code = if can_show {
            self.build_qr_code(&requested.other_device_id).await?
        } else {
            None
        };

        if qr_code.is_some() {
            ready_methods.push(VerificationMethod::QrCodeShowV1);
        }

        let can_scan = pair(&VerificationMethod::QrCodeScanV1, &VerificationMethod::QrCodeShowV1);

        if can_scan {
            ready_methods.push(VerificationMethod::QrCodeScanV1);
        }

        if qr_code.is_some() || can_scan {
            ready_methods.push(VerificationMethod::ReciprocateV1);
        }

        if ready_methods.is_empty() {
            return Err(VerificationError::NoMethodsInCommon);
        }

        let accepted = self.transition(|s| s.accept(ready_methods.clone()));

        if accepted.is_none() {
            return Ok(());
        }

        if let Some(qr_code) = qr_code {
            self.context.cache.insert(qr_code);
        }

        let content = VerificationContent::Ready(ReadyContent {
            from_device: Some(self.context.store.device_id().to_string()),
            methods: Some(ready_methods),
            flow: self.flow_id.flow_fields(),
        });

        let request = OutgoingVerificationRequest::for_flow(
            &self.flow_id,
            self.other_user_id.clone(),
            vec![DeviceIdOrAllDevices::DeviceId(requested.other_device_id)],
            content,
        );

        if let Err(e) = self.context.send(&request).await {
            warn!(flow_id = self.flow_id.as_str(), error = ?e, "Couldn't send the ready message");
            self.fail();
        }

        Ok(())
    }

    /// Cancel the verification request
    pub async fn cancel(&self) {
        self.cancel_with_code(CancelCode::User).await;
    }

    /// Cancel the verification request with the given code.
    ///
    /// A running verification flow of this request gets cancelled as well.
    pub async fn cancel_with_code(&self, code: CancelCode) {
        if let Some(child) = self.live_child() {
            child.cancel_with_code(code.clone()).await;

            // The request follows its child.
            if self.inner.read().is_terminal() {
                return;
            }
        }

        let mut previous = None;
        let cancelled = self.transition(|s| {
            let cancelled = s.cancel(true, &code)?;
            previous = Some(s.clone());
            Some(cancelled)
        });

        let (Some(InnerRequest::Cancelled(cancelled)), Some(previous)) = (cancelled, previous)
        else {
            return;
        };

        info!(
            flow_id = self.flow_id.as_str(),
            code = code.as_str(),
            "Cancelling a verification request"
        );

        let devices = match &previous {
            InnerRequest::Created(_) => self.recipients(),
            InnerRequest::Passive(_) => return,
            other => match other.other_device_id() {
                Some(device_id) => vec![DeviceIdOrAllDevices::DeviceId(device_id)],
                None => self.recipients(),
            },
        };

        let request = OutgoingVerificationRequest::for_flow(
            &self.flow_id,
            self.other_user_id.clone(),
            devices,
            cancelled.state.as_content(&self.flow_id),
        );

        if let Err(e) = self.context.send(&request).await {
            warn!(flow_id = self.flow_id.as_str(), error = ?e, "Couldn't send the cancellation");
        }
    }

    /// Transition from this verification request into a SAS verification flow.
    ///
    /// Returns `None` if the request isn't ready or if the other side
    /// doesn't support SAS.
    pub async fn start_sas(&self) -> Result<Option<Sas>, StoreError> {
        let Some(ready) =
            as_variant!(&*self.inner.read(), InnerRequest::Ready(s) => s.state.clone())
        else {
            return Ok(None);
        };

        if !ready.their_methods.contains(&VerificationMethod::SasV1)
            || !ready.our_methods.contains(&VerificationMethod::SasV1)
        {
            return Ok(None);
        }

        let Some(device) =
            self.context.store.get_device(&self.other_user_id, &ready.other_device_id).await?
        else {
            warn!(
                user_id = ?self.other_user_id,
                device_id = ?ready.other_device_id,
                "Can't start the SAS verification flow, the device that \
                 accepted the verification doesn't exist"
            );
            return Ok(None);
        };

        let sas = Sas::start(
            self.context.clone(),
            device,
            (*self.flow_id).clone(),
            Some(self.handle()),
        )
        .await?;

        if !self.transition_into(sas.clone().into()) {
            return Ok(None);
        }

        let replaced = self.context.cache.get_qr(&self.other_user_id, self.flow_id.as_str());
        self.context.cache.insert(sas.clone());

        if let Some(qr) = replaced {
            qr.supersede();
        }

        sas.send_start().await;

        Ok(Some(sas))
    }

    /// Generate a QR code that can be used by another client to start a QR
    /// code based verification.
    ///
    /// Returns `None` if the request isn't ready, if we didn't agree on
    /// showing QR codes, or if the keys needed for the QR code are missing.
    pub async fn generate_qr_code(&self) -> Result<Option<QrVerification>, StoreError> {
        if let Some(qr) = self.context.cache.get_qr(&self.other_user_id, self.flow_id.as_str()) {
            return Ok(Some(qr));
        }

        let Some(ready) =
            as_variant!(&*self.inner.read(), InnerRequest::Ready(s) => s.state.clone())
        else {
            return Ok(None);
        };

        // If we didn't state that we support showing QR codes or if the other
        // side doesn't support scanning QR codes bail early.
        if !ready.our_methods.contains(&VerificationMethod::QrCodeShowV1)
            || !ready.their_methods.contains(&VerificationMethod::QrCodeScanV1)
        {
            return Ok(None);
        }

        let qr_code = self.build_qr_code(&ready.other_device_id).await?;

        if let Some(qr_code) = &qr_code {
            self.context.cache.insert(qr_code.clone());
        }

        Ok(qr_code)
    }

    /// Start a QR code verification by providing a scanned QR code for this
    /// verification flow.
    ///
    /// The reciprocation is sent to the other side right away, the keys of
    /// the other side are trusted once they confirm the scan.
    pub async fn scan_qr_code(
        &self,
        data: QrVerificationData,
    ) -> Result<Option<QrVerification>, ScanError> {
        let Some(ready) =
            as_variant!(&*self.inner.read(), InnerRequest::Ready(s) => s.state.clone())
        else {
            return Ok(None);
        };

        let Some(device) =
            self.context.store.get_device(&self.other_user_id, &ready.other_device_id).await?
        else {
            warn!(
                user_id = ?self.other_user_id,
                device_id = ?ready.other_device_id,
                "Can't scan the QR code, the device that accepted the \
                 verification doesn't exist"
            );
            return Ok(None);
        };

        let qr = QrVerification::from_scan(
            self.context.clone(),
            device,
            (*self.flow_id).clone(),
            data,
            self.we_started,
            Some(self.handle()),
        )
        .await?;

        if !self.transition_into(qr.clone().into()) {
            return Ok(None);
        }

        let replaced = self.context.cache.get_qr(&self.other_user_id, self.flow_id.as_str());
        self.context.cache.insert(qr.clone());

        if let Some(replaced) = replaced {
            replaced.supersede();
        }

        qr.reciprocate().await;

        Ok(Some(qr))
    }

    pub(crate) fn handle(&self) -> RequestHandle {
        RequestHandle { request: self.clone() }
    }

    pub(crate) fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            flow_id: (*self.flow_id).clone(),
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.other_device_id(),
            we_started: self.we_started,
            state: self.state(),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.inner.read().is_terminal()
    }

    pub(crate) async fn cancel_if_timed_out(&self) -> bool {
        if self.is_terminal() || !self.timed_out() {
            false
        } else {
            self.cancel_with_code(CancelCode::Timeout).await;
            true
        }
    }

    /// Feed a validated message that belongs to this request into it.
    pub(crate) async fn receive(&self, sender: &UserId, content: &ValidContent) {
        match content {
            ValidContent::Ready(ready) => self.receive_ready(sender, ready).await,
            ValidContent::Start(start) => self.receive_start(sender, start).await,
            ValidContent::Done => self.receive_done(),
            ValidContent::Cancel(cancel) => self.receive_cancel(sender, cancel),
            _ => {
                trace!(
                    flow_id = self.flow_id.as_str(),
                    kind = ?content.kind(),
                    "Ignoring a message that belongs to the verification flow of a request"
                );
            }
        }
    }

    async fn receive_ready(&self, sender: &UserId, ready: &ValidReady) {
        let own_user_id = self.own_user_id().to_owned();
        let own_device_id = self.context.store.device_id().to_owned();

        let new_state = self.transition(|s| match s {
            InnerRequest::Created(s) if *sender == *s.other_user_id => {
                Some(InnerRequest::Ready(s.clone().into_ready(ready)))
            }
            InnerRequest::Requested(s)
                if *sender == *own_user_id && ready.from_device != own_device_id =>
            {
                Some(InnerRequest::Passive(s.clone().into_passive(ready)))
            }
            _ => None,
        });

        match new_state {
            Some(InnerRequest::Ready(_)) => {
                debug!(
                    flow_id = self.flow_id.as_str(),
                    device_id = ?ready.from_device,
                    "The other side accepted our verification request"
                );
                self.cancel_for_other_devices(&ready.from_device).await;
            }
            Some(_) => {
                debug!(
                    flow_id = self.flow_id.as_str(),
                    device_id = ?ready.from_device,
                    "Another one of our devices accepted the verification request"
                );
            }
            None => {
                warn!(
                    sender = ?sender,
                    flow_id = self.flow_id.as_str(),
                    "Ignoring a ready message that doesn't fit the state of the request"
                );
            }
        }
    }

    async fn receive_start(&self, sender: &UserId, start: &ValidStart) {
        let Some(ready) = self.inner.read().ready_state() else {
            warn!(
                sender = ?sender,
                flow_id = self.flow_id.as_str(),
                "Received a start message for a request that isn't ready"
            );
            return;
        };

        info!(
            sender = ?sender,
            device = ?start.from_device(),
            method = start.method().as_str(),
            "Received a new verification start message",
        );

        if start.from_device() != &ready.other_device_id {
            warn!(
                sender = ?sender,
                flow_id = self.flow_id.as_str(),
                "Received a start message from a device that didn't accept the request"
            );
            return;
        }

        let device = match self.context.store.get_device(sender, start.from_device()).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(
                    sender = ?sender,
                    device = ?start.from_device(),
                    "Received a start message from an unknown device",
                );
                self.cancel_with_code(CancelCode::User).await;
                return;
            }
            Err(e) => {
                warn!(error = ?e, "Couldn't load the device that started the verification");
                self.cancel_with_code(CancelCode::User).await;
                return;
            }
        };

        let existing = self
            .context
            .cache
            .get(sender, self.flow_id.as_str())
            .filter(|v| !v.is_terminal());

        match start {
            ValidStart::Sas(sas_start) => {
                match &existing {
                    Some(Verification::SasV1(ours)) if ours.we_started() => {
                        if self.our_start_wins(sender, device.device_id()) {
                            debug!(
                                flow_id = self.flow_id.as_str(),
                                "Both sides started a SAS verification, ignoring theirs"
                            );
                            return;
                        }

                        debug!(
                            flow_id = self.flow_id.as_str(),
                            "Both sides started a SAS verification, dropping ours"
                        );
                    }
                    Some(Verification::SasV1(_)) => {
                        warn!(
                            flow_id = self.flow_id.as_str(),
                            "Received a second SAS start message for a request"
                        );
                        return;
                    }
                    Some(Verification::QrV1(qr)) if qr.state() != QrVerificationState::Started => {
                        warn!(
                            flow_id = self.flow_id.as_str(),
                            "Received a SAS start message during a QR code verification"
                        );
                        qr.cancel_with_code(CancelCode::UnexpectedMessage).await;
                        return;
                    }
                    _ => {}
                }

                let sas = match Sas::from_start(
                    self.context.clone(),
                    device,
                    (*self.flow_id).clone(),
                    sas_start.clone(),
                    Some(self.handle()),
                )
                .await
                {
                    Ok(sas) => sas,
                    Err(e) => {
                        warn!(error = ?e, "Couldn't create a SAS verification from a start");
                        self.cancel_with_code(CancelCode::User).await;
                        return;
                    }
                };

                if !self.transition_into(sas.clone().into()) {
                    return;
                }

                self.context.cache.insert(sas.clone());

                match existing {
                    Some(Verification::SasV1(ours)) => ours.supersede(),
                    Some(Verification::QrV1(qr)) => qr.supersede(),
                    None => {}
                }

                if self.context.settings.auto_accept_sas {
                    sas.accept().await;
                }
            }
            ValidStart::Reciprocate(_) => match existing {
                Some(Verification::QrV1(qr)) => {
                    if qr.state() == QrVerificationState::Started {
                        self.transition_into(qr.clone().into());
                    }

                    qr.receive(&ValidContent::Start(start.clone())).await;
                    trace!(
                        sender = ?sender,
                        device_id = ?start.from_device(),
                        verification = ?qr,
                        "Received a QR code reciprocation"
                    );
                }
                Some(Verification::SasV1(sas)) => {
                    warn!(
                        flow_id = self.flow_id.as_str(),
                        "Received a reciprocation while a SAS verification is going on"
                    );
                    sas.cancel_with_code(CancelCode::UnexpectedMessage).await;
                }
                None => {
                    warn!(
                        flow_id = self.flow_id.as_str(),
                        "Received a reciprocation but we never showed a QR code"
                    );
                    self.cancel_with_code(CancelCode::UnexpectedMessage).await;
                }
            },
        }
    }

    fn receive_done(&self) {
        let done = self.transition(|s| match s {
            // No flow was started, there is nothing that could be done.
            InnerRequest::Ready(_) => None,
            InnerRequest::Transitioned(t) if !t.state.verification.is_done() => None,
            other => other.finish(),
        });

        if done.is_some() {
            debug!(flow_id = self.flow_id.as_str(), "The verification request is done");
        }
    }

    fn receive_cancel(&self, sender: &UserId, cancel: &ValidCancel) {
        let allowed =
            sender == self.other_user() || (self.is_passive() && sender == self.own_user_id());

        if !allowed {
            warn!(
                sender = ?sender,
                flow_id = self.flow_id.as_str(),
                "Ignoring a cancellation from a user that isn't part of the request"
            );
            return;
        }

        if self.transition(|s| s.cancel(false, &cancel.code)).is_some() {
            info!(
                sender = ?sender,
                flow_id = self.flow_id.as_str(),
                code = cancel.code.as_str(),
                reason = cancel.reason.as_deref(),
                "The verification request was cancelled"
            );
        }
    }

    /// The concurrent start tie-break, the start of the smaller user id wins,
    /// devices are compared if the user ids are the same.
    fn our_start_wins(&self, sender: &UserId, sender_device: &DeviceId) -> bool {
        matches!(
            (
                sender.cmp(self.own_user_id()),
                sender_device.cmp(self.context.store.device_id())
            ),
            (Ordering::Greater, _) | (Ordering::Equal, Ordering::Greater)
        )
    }

    /// Tell the devices that didn't answer our request that the request was
    /// accepted somewhere else.
    async fn cancel_for_other_devices(&self, accepted_by: &DeviceId) {
        if self.flow_id.room_id().is_some() {
            return;
        }

        let devices: Vec<_> = self
            .recipient_devices
            .iter()
            .filter(|d| d.as_str() != accepted_by.as_str())
            .map(|d| DeviceIdOrAllDevices::DeviceId(d.clone()))
            .collect();

        if devices.is_empty() {
            return;
        }

        let content = Cancelled::new(true, CancelCode::Accepted).as_content(&self.flow_id);
        let request = OutgoingVerificationRequest::for_flow(
            &self.flow_id,
            self.other_user_id.clone(),
            devices,
            content,
        );

        if let Err(e) = self.context.send(&request).await {
            warn!(
                flow_id = self.flow_id.as_str(),
                error = ?e,
                "Couldn't tell our other devices that the request was accepted"
            );
        }
    }

    fn recipients(&self) -> Vec<DeviceIdOrAllDevices> {
        if self.recipient_devices.is_empty() {
            vec![DeviceIdOrAllDevices::AllDevices]
        } else {
            self.recipient_devices.iter().cloned().map(DeviceIdOrAllDevices::DeviceId).collect()
        }
    }

    fn live_child(&self) -> Option<Verification> {
        self.context
            .cache
            .get(&self.other_user_id, self.flow_id.as_str())
            .filter(|v| !v.is_terminal())
    }

    /// Build the QR code we can show to the device that answered.
    async fn build_qr_code(
        &self,
        other_device_id: &DeviceId,
    ) -> Result<Option<QrVerification>, StoreError> {
        let Some(device) =
            self.context.store.get_device(&self.other_user_id, other_device_id).await?
        else {
            warn!(
                user_id = ?self.other_user_id,
                device_id = ?other_device_id,
                "Can't create a QR code, the device that accepted the \
                 verification doesn't exist"
            );
            return Ok(None);
        };

        let identities = IdentitiesBeingVerified::new(self.context.store.clone(), device).await?;
        let flow_id = (*self.flow_id).clone();
        let context = self.context.clone();
        let handle = Some(self.handle());

        let verification = if identities.is_self_verification() {
            match identities.own_master_key().cloned() {
                Some(master_key) if master_key.is_trusted() => {
                    let device_key = identities.other_device().ed25519_key();
                    Some(QrVerification::new_self(
                        flow_id,
                        master_key.key(),
                        device_key,
                        identities,
                        context,
                        self.we_started,
                        handle,
                    ))
                }
                Some(master_key) => Some(QrVerification::new_self_no_master(
                    flow_id,
                    master_key.key(),
                    identities,
                    context,
                    self.we_started,
                    handle,
                )),
                None => {
                    warn!(
                        user_id = ?self.other_user_id,
                        device_id = ?other_device_id,
                        "Can't create a QR code, we don't have a cross signing identity"
                    );
                    None
                }
            }
        } else {
            let own_master = identities.own_trusted_master_key().map(|k| k.key());
            let other_master = identities.other_master_key().map(|k| k.key());

            match (own_master, other_master) {
                (Some(own_master), Some(other_master)) => Some(QrVerification::new_cross(
                    flow_id,
                    own_master,
                    other_master,
                    identities,
                    context,
                    self.we_started,
                    handle,
                )),
                (None, _) => {
                    warn!(
                        user_id = ?self.other_user_id,
                        device_id = ?other_device_id,
                        "Can't create a QR code, we don't trust our own master key"
                    );
                    None
                }
                (_, None) => {
                    warn!(
                        user_id = ?self.other_user_id,
                        device_id = ?other_device_id,
                        "Can't create a QR code, the user doesn't have a valid cross \
                         signing identity"
                    );
                    None
                }
            }
        };

        Ok(verification)
    }

    /// Move into the transitioned state, or swap the flow we transitioned
    /// into.
    fn transition_into(&self, verification: Verification) -> bool {
        self.transition(|s| s.transition_into(&verification)).is_some()
    }

    /// Sending one of our messages failed, the request is over.
    fn fail(&self) {
        if self.transition(|s| s.cancel(true, &CancelCode::User)).is_some() {
            info!(
                flow_id = self.flow_id.as_str(),
                "Cancelled a verification request, sending failed"
            );
        }
    }

    /// Run a transition under the write lock, the registry is told about the
    /// new state after the lock is released.
    fn transition(
        &self,
        f: impl FnOnce(&InnerRequest) -> Option<InnerRequest>,
    ) -> Option<InnerRequest> {
        let new_state = {
            let mut inner = self.inner.write();
            let new_state = f(&inner)?;

            trace!(
                flow_id = self.flow_id.as_str(),
                old_state = inner.name(),
                new_state = new_state.name(),
                "Verification request state changed"
            );

            ObservableWriteGuard::set(&mut inner, new_state.clone());
            new_state
        };

        self.context.cache.update_request(self.snapshot());

        Some(new_state)
    }
}

#[derive(Clone, Debug)]
enum InnerRequest {
    Created(RequestState<Created>),
    Requested(RequestState<Requested>),
    Ready(RequestState<Ready>),
    Transitioned(RequestState<Transitioned>),
    Passive(RequestState<Passive>),
    Done(RequestState<Done>),
    Cancelled(RequestState<Cancelled>),
}

impl InnerRequest {
    fn name(&self) -> &'static str {
        match self {
            InnerRequest::Created(_) => "created",
            InnerRequest::Requested(_) => "requested",
            InnerRequest::Ready(_) => "ready",
            InnerRequest::Transitioned(_) => "transitioned",
            InnerRequest::Passive(_) => "passive",
            InnerRequest::Done(_) => "done",
            InnerRequest::Cancelled(_) => "cancelled",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, InnerRequest::Done(_) | InnerRequest::Cancelled(_))
    }

    fn other_device_id(&self) -> Option<OwnedDeviceId> {
        match self {
            InnerRequest::Requested(s) => Some(s.state.other_device_id.to_owned()),
            InnerRequest::Ready(s) => Some(s.state.other_device_id.to_owned()),
            InnerRequest::Transitioned(s) => Some(s.state.ready.other_device_id.to_owned()),
            InnerRequest::Passive(s) => Some(s.state.other_device_id.to_owned()),
            InnerRequest::Created(_) | InnerRequest::Done(_) | InnerRequest::Cancelled(_) => None,
        }
    }

    fn their_methods(&self) -> Option<&[VerificationMethod]> {
        match self {
            InnerRequest::Requested(s) => Some(&s.state.their_methods),
            InnerRequest::Ready(s) => Some(&s.state.their_methods),
            InnerRequest::Transitioned(s) => Some(&s.state.ready.their_methods),
            _ => None,
        }
    }

    fn our_methods(&self) -> Option<&[VerificationMethod]> {
        match self {
            InnerRequest::Created(s) => Some(&s.state.our_methods),
            InnerRequest::Ready(s) => Some(&s.state.our_methods),
            InnerRequest::Transitioned(s) => Some(&s.state.ready.our_methods),
            _ => None,
        }
    }

    /// The negotiated state, flows can only be started once we have it.
    fn ready_state(&self) -> Option<Ready> {
        match self {
            InnerRequest::Ready(s) => Some(s.state.clone()),
            InnerRequest::Transitioned(s) => Some(s.state.ready.clone()),
            _ => None,
        }
    }

    fn accept(&self, methods: Vec<VerificationMethod>) -> Option<InnerRequest> {
        as_variant!(self, InnerRequest::Requested(s) => {
            InnerRequest::Ready(s.clone().accept(methods))
        })
    }

    fn transition_into(&self, verification: &Verification) -> Option<InnerRequest> {
        let ready = self.ready_state()?;
        let s = self.request_state()?;

        Some(InnerRequest::Transitioned(s.with_state(Transitioned {
            ready,
            verification: verification.clone(),
        })))
    }

    fn finish(&self) -> Option<InnerRequest> {
        Some(InnerRequest::Done(match self {
            InnerRequest::Ready(s) => s.clone().into_done(),
            InnerRequest::Transitioned(s) => s.clone().into_done(),
            InnerRequest::Passive(s) => s.clone().into_done(),
            InnerRequest::Created(_)
            | InnerRequest::Requested(_)
            | InnerRequest::Done(_)
            | InnerRequest::Cancelled(_) => return None,
        }))
    }

    fn cancel(&self, cancelled_by_us: bool, cancel_code: &CancelCode) -> Option<InnerRequest> {
        let s = self.request_state()?;

        trace!(
            cancelled_by_us,
            code = cancel_code.as_str(),
            "Verification request going into the cancelled state"
        );

        let cancelled = Cancelled::new(cancelled_by_us, cancel_code.clone());

        Some(InnerRequest::Cancelled(s.with_state(cancelled)))
    }

    /// The shared part of a non-terminal state.
    fn request_state(&self) -> Option<RequestState<()>> {
        match self {
            InnerRequest::Created(s) => Some(s.with_state(())),
            InnerRequest::Requested(s) => Some(s.with_state(())),
            InnerRequest::Ready(s) => Some(s.with_state(())),
            InnerRequest::Transitioned(s) => Some(s.with_state(())),
            InnerRequest::Passive(s) => Some(s.with_state(())),
            InnerRequest::Done(_) | InnerRequest::Cancelled(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
struct RequestState<S: Clone> {
    flow_id: Arc<FlowId>,

    /// The id of the user which is participating in this verification request.
    other_user_id: OwnedUserId,

    /// The verification request state we are in.
    state: S,
}

impl<S: Clone> RequestState<S> {
    fn with_state<T: Clone>(&self, state: T) -> RequestState<T> {
        RequestState {
            flow_id: self.flow_id.clone(),
            other_user_id: self.other_user_id.clone(),
            state,
        }
    }

    fn into_done(self) -> RequestState<Done> {
        self.with_state(Done {})
    }
}

impl RequestState<Created> {
    fn into_ready(self, ready: &ValidReady) -> RequestState<Ready> {
        self.with_state(Ready {
            their_methods: ready.methods.to_owned(),
            our_methods: self.state.our_methods.clone(),
            other_device_id: ready.from_device.to_owned(),
        })
    }
}

#[derive(Clone, Debug)]
struct Created {
    /// The verification methods supported by us.
    our_methods: Vec<VerificationMethod>,
}

#[derive(Clone, Debug)]
struct Requested {
    /// The verification methods supported by the sender.
    their_methods: Vec<VerificationMethod>,

    /// The device id of the device that sent us the request.
    other_device_id: OwnedDeviceId,
}

impl RequestState<Requested> {
    fn into_passive(self, ready: &ValidReady) -> RequestState<Passive> {
        self.with_state(Passive { other_device_id: ready.from_device.to_owned() })
    }

    fn accept(self, methods: Vec<VerificationMethod>) -> RequestState<Ready> {
        self.with_state(Ready {
            their_methods: self.state.their_methods.clone(),
            our_methods: methods,
            other_device_id: self.state.other_device_id.clone(),
        })
    }
}

#[derive(Clone, Debug)]
struct Ready {
    /// The verification methods supported by the other side.
    their_methods: Vec<VerificationMethod>,

    /// The verification methods supported by the us.
    our_methods: Vec<VerificationMethod>,

    /// The device id of the device that responded to the verification request.
    other_device_id: OwnedDeviceId,
}

#[derive(Clone, Debug)]
struct Transitioned {
    ready: Ready,
    verification: Verification,
}

#[derive(Clone, Debug)]
struct Passive {
    /// The device id of the device that responded to the verification request.
    other_device_id: OwnedDeviceId,
}

#[derive(Clone, Debug)]
struct Done {}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures_util::pin_mut;
    use ruma::{room_id, user_id};
    use stream_assert::{assert_next_matches, assert_pending};

    use super::VerificationRequestState;
    use crate::{
        error::VerificationError,
        types::{CancelCode, StartContent, VerificationContent, VerificationMethod},
        transport::Recipient,
        verification::{
            tests::{deliver_all, setup_pair, setup_self_pair, TestDevice},
            done_content, FlowId, Verification, VerificationEvent,
        },
    };

    #[tokio::test]
    async fn request_until_done() {
        let (alice, bob) = setup_pair().await;

        let alice_request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        assert!(alice_request.we_started());
        assert_matches!(alice_request.state(), VerificationRequestState::Created { .. });

        deliver_all(&alice, &bob).await;

        let bob_request =
            bob.machine.get_request(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        assert!(!bob_request.we_started());
        assert_matches!(
            bob_request.state(),
            VerificationRequestState::Requested { other_device_id, .. } => {
                assert_eq!(other_device_id, alice.device_id());
            }
        );

        let mut alice_changes = alice_request.changes();

        bob_request.accept().await.unwrap();
        assert!(bob_request.is_ready());
        deliver_all(&bob, &alice).await;

        assert_next_matches!(
            alice_changes,
            VerificationRequestState::Ready { their_methods, .. } => {
                assert!(their_methods.contains(&VerificationMethod::SasV1));
            }
        );
        assert_eq!(alice_request.other_device_id().as_deref(), Some(bob.device_id()));

        let alice_sas = alice_request.start_sas().await.unwrap().unwrap();
        assert_next_matches!(alice_changes, VerificationRequestState::Transitioned { .. });

        // Bob accepts the SAS automatically since it belongs to a request.
        deliver_all(&alice, &bob).await;
        let bob_sas = bob.machine.get_sas(alice.user_id(), alice_sas.flow_id().as_str()).unwrap();
        assert!(bob_sas.has_been_accepted());
        assert!(bob_sas.started_from_request());

        deliver_all(&bob, &alice).await;
        deliver_all(&alice, &bob).await;
        deliver_all(&bob, &alice).await;

        assert_eq!(alice_sas.emoji_index(), bob_sas.emoji_index());

        alice_sas.confirm().await;
        bob_sas.confirm().await;
        deliver_all(&alice, &bob).await;
        deliver_all(&bob, &alice).await;
        deliver_all(&alice, &bob).await;

        assert!(alice_sas.is_done());
        assert!(bob_sas.is_done());
        assert!(alice_request.is_done());
        assert!(bob_request.is_done());
        assert_next_matches!(alice_changes, VerificationRequestState::Done);

        assert_eq!(
            alice.store.verified_devices(),
            vec![(bob.user_id().to_owned(), bob.device_id().to_owned())]
        );
        assert_eq!(
            bob.store.verified_devices(),
            vec![(alice.user_id().to_owned(), alice.device_id().to_owned())]
        );

        // A late done doesn't change anything.
        deliver_all(&bob, &alice).await;
        assert_pending!(alice_changes);
    }

    #[tokio::test]
    async fn in_room_request_uses_the_event_id_as_flow_id() {
        let (alice, bob) = setup_pair().await;
        let room_id = room_id!("!dm:example.org");

        let alice_request = alice
            .machine
            .request_verification_in_room(bob.user_id(), room_id, None)
            .await
            .unwrap();

        assert_matches!(alice_request.flow_id(), FlowId::InRoom(r, _) => assert_eq!(r, room_id));
        assert_eq!(alice_request.room_id(), Some(room_id));

        deliver_all(&alice, &bob).await;

        let bob_request =
            bob.machine.get_request(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        assert_eq!(bob_request.flow_id(), alice_request.flow_id());

        bob_request.accept().await.unwrap();

        let (ready, _) = bob.transport.pop().unwrap();
        assert_matches!(ready.recipient, Recipient::InRoom { room_id: r } => {
            assert_eq!(r, room_id);
        });
        assert_matches!(ready.content, VerificationContent::Ready(content) => {
            assert_eq!(
                content.flow.relates_to.and_then(|r| r.event_id).as_deref(),
                Some(alice_request.flow_id().as_str())
            );
        });
    }

    #[tokio::test]
    async fn accepting_without_common_methods_fails() {
        let (alice, bob) = setup_pair().await;

        alice
            .machine
            .request_verification(bob.user_id(), Some(vec![VerificationMethod::QrCodeScanV1]))
            .await
            .unwrap();
        deliver_all(&alice, &bob).await;

        let bob_request = bob.machine.get_requests(alice.user_id()).pop().unwrap();

        assert_matches!(
            bob_request.accept_with_methods(vec![VerificationMethod::SasV1]).await,
            Err(VerificationError::NoMethodsInCommon)
        );
        assert_matches!(bob_request.state(), VerificationRequestState::Requested { .. });
        assert!(bob.transport.is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_request_cancels_the_flow() {
        let (alice, bob) = setup_pair().await;

        let alice_request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        deliver_all(&alice, &bob).await;

        let bob_request =
            bob.machine.get_request(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        bob_request.accept().await.unwrap();
        deliver_all(&bob, &alice).await;

        let alice_sas = alice_request.start_sas().await.unwrap().unwrap();
        deliver_all(&alice, &bob).await;
        let bob_sas = bob.machine.get_sas(alice.user_id(), alice_sas.flow_id().as_str()).unwrap();

        bob_request.cancel().await;
        assert!(bob_sas.is_cancelled());
        assert_matches!(bob_request.cancel_info(), Some(info) => {
            assert!(info.cancelled_by_us());
            assert_eq!(info.cancel_code(), &CancelCode::User);
        });

        deliver_all(&bob, &alice).await;
        alice.transport.drain();
        assert!(alice_sas.is_cancelled());
        assert_matches!(alice_request.cancel_info(), Some(info) => {
            assert!(!info.cancelled_by_us());
            assert_eq!(info.cancel_code(), &CancelCode::User);
        });

        // Cancellation is sticky, neither a late done nor a second
        // cancellation change the request.
        let mut changes = alice_request.changes();
        alice_request.cancel().await;
        bob.send_to(&alice, done_content(alice_request.flow_id())).await;
        assert_pending!(changes);
        assert!(alice_request.is_cancelled());
        assert!(alice.transport.is_empty());
    }

    #[tokio::test]
    async fn concurrent_sas_starts_agree_on_a_single_flow() {
        let (alice, bob) = setup_pair().await;

        let alice_request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        deliver_all(&alice, &bob).await;

        let bob_request =
            bob.machine.get_request(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        bob_request.accept().await.unwrap();
        deliver_all(&bob, &alice).await;

        // Both sides start at the same time, the messages cross.
        let alice_sas = alice_request.start_sas().await.unwrap().unwrap();
        let bob_sas = bob_request.start_sas().await.unwrap().unwrap();

        deliver_all(&alice, &bob).await;
        deliver_all(&bob, &alice).await;

        // Alice has the smaller user id, her flow survives.
        let alice_flow =
            alice.machine.get_sas(bob.user_id(), alice_sas.flow_id().as_str()).unwrap();
        let bob_flow = bob.machine.get_sas(alice.user_id(), bob_sas.flow_id().as_str()).unwrap();

        assert!(alice_flow.we_started());
        assert!(!bob_flow.we_started());
        assert!(!alice_flow.is_cancelled());
        assert!(!bob_flow.is_cancelled());
        assert!(bob_sas.is_cancelled());
        assert!(!bob_request.is_cancelled());

        deliver_all(&alice, &bob).await;
        deliver_all(&bob, &alice).await;

        assert!(alice_flow.can_be_presented());
        assert!(bob_flow.can_be_presented());
        assert_eq!(alice_flow.decimals(), bob_flow.decimals());
    }

    #[tokio::test]
    async fn other_devices_learn_about_the_acceptance() {
        let alice = TestDevice::new(user_id!("@alice:example.org"), "ALICEDEVICE").await;
        let bob = TestDevice::new(user_id!("@bob:example.org"), "BOBDEVICE").await;
        let bob_laptop = TestDevice::new(user_id!("@bob:example.org"), "BOBLAPTOP").await;
        TestDevice::introduce(&[&alice, &bob, &bob_laptop]);

        let alice_request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        let (request, _) = alice.transport.pop().unwrap();
        alice.send_to(&bob, request.content.clone()).await;
        alice.send_to(&bob_laptop, request.content).await;

        let bob_request =
            bob.machine.get_request(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        bob_request.accept().await.unwrap();
        deliver_all(&bob, &alice).await;

        assert!(alice_request.is_ready());

        let (cancel, _) = alice.transport.pop().unwrap();
        assert_matches!(cancel.recipient, Recipient::ToDevice { devices, .. } => {
            assert_eq!(devices.len(), 1);
        });
        alice.send_to(&bob_laptop, cancel.content).await;

        let laptop_request = bob_laptop
            .machine
            .get_request(alice.user_id(), alice_request.flow_id().as_str())
            .unwrap();
        assert_matches!(laptop_request.cancel_info(), Some(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::Accepted);
        });
    }

    #[tokio::test]
    async fn reciprocation_without_a_qr_code_is_refused() {
        let (alice, bob) = setup_pair().await;

        let alice_request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        deliver_all(&alice, &bob).await;
        let bob_request =
            bob.machine.get_request(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        bob_request.accept_with_methods(vec![VerificationMethod::SasV1]).await.unwrap();
        deliver_all(&bob, &alice).await;

        let start = VerificationContent::Start(StartContent {
            from_device: Some(alice.device_id().to_string()),
            method: Some(VerificationMethod::ReciprocateV1),
            secret: Some("c2VjcmV0c2VjcmV0".to_owned()),
            flow: alice_request.flow_id().flow_fields(),
            ..Default::default()
        });
        alice.send_to(&bob, start).await;

        assert_matches!(bob_request.cancel_info(), Some(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::UnexpectedMessage);
        });
    }

    #[tokio::test]
    async fn done_before_any_flow_is_ignored() {
        let (alice, bob) = setup_pair().await;

        let alice_request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        deliver_all(&alice, &bob).await;
        let bob_request =
            bob.machine.get_request(alice.user_id(), alice_request.flow_id().as_str()).unwrap();
        bob_request.accept().await.unwrap();
        deliver_all(&bob, &alice).await;

        let mut changes = alice_request.changes();
        bob.send_to(&alice, done_content(alice_request.flow_id())).await;

        assert_pending!(changes);
        assert!(alice_request.is_ready());
        assert!(!alice_request.is_done());

        // The request can still go on with a real flow.
        assert!(alice_request.start_sas().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn self_verification_request_goes_to_our_other_devices() {
        let (phone, laptop) = setup_self_pair().await;

        let events = phone.machine.events();
        pin_mut!(events);

        let request = phone.machine.request_verification(phone.user_id(), None).await.unwrap();
        assert!(request.is_self_verification());

        assert_next_matches!(events, VerificationEvent::RequestAdded(snapshot) => {
            assert_eq!(&snapshot.flow_id, request.flow_id());
            assert!(snapshot.we_started);
        });

        let (outgoing, _) = phone.transport.pop().unwrap();
        assert_matches!(&outgoing.recipient, Recipient::ToDevice { devices, .. } => {
            assert_eq!(devices.len(), 1);
        });
        phone.send_to(&laptop, outgoing.content).await;

        let laptop_request =
            laptop.machine.get_request(phone.user_id(), request.flow_id().as_str()).unwrap();
        laptop_request.accept().await.unwrap();
        deliver_all(&laptop, &phone).await;

        assert_next_matches!(events, VerificationEvent::RequestUpdated(snapshot) => {
            assert_matches!(snapshot.state, VerificationRequestState::Ready { .. });
        });

        let sas = request.start_sas().await.unwrap().unwrap();
        assert!(sas.is_self_verification());
        assert_matches!(
            request.state(),
            VerificationRequestState::Transitioned { verification: Verification::SasV1(_) }
        );
    }
}
