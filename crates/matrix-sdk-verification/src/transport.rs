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

//! The outgoing side of the verification machinery.
//!
//! Verification flows never talk to the network directly. Every message they
//! want to send is wrapped into an [`OutgoingVerificationRequest`] and handed
//! to a [`VerificationTransport`], which is responsible for putting it into a
//! to-device or room envelope.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use ruma::{
    to_device::DeviceIdOrAllDevices, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId,
    TransactionId,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    types::{CancelCode, VerificationContent},
    verification::{Cancelled, FlowId},
};

/// Error type of a [`VerificationTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The message couldn't be delivered to the server.
    #[error("the verification message couldn't be sent: {0}")]
    Send(String),

    /// A transport specific error.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// Who should receive an outgoing verification message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    /// Send the message as a to-device message.
    ToDevice {
        /// The user that should receive the message.
        user_id: OwnedUserId,
        /// The devices of the user that should receive the message.
        devices: Vec<DeviceIdOrAllDevices>,
    },
    /// Send the message as a room event.
    InRoom {
        /// The room the message should be sent to.
        room_id: OwnedRoomId,
    },
}

/// A verification message that should be sent out.
#[derive(Clone, Debug)]
pub struct OutgoingVerificationRequest {
    /// Unique id of this request, a transport can use it as the transaction id
    /// of the HTTP request.
    pub request_id: OwnedTransactionId,
    /// Where the message should go.
    pub recipient: Recipient,
    /// The message itself.
    pub content: VerificationContent,
}

impl OutgoingVerificationRequest {
    /// Create a new request with a fresh request id.
    pub fn new(recipient: Recipient, content: VerificationContent) -> Self {
        Self { request_id: TransactionId::new(), recipient, content }
    }

    pub(crate) fn for_flow(
        flow_id: &FlowId,
        user_id: OwnedUserId,
        devices: Vec<DeviceIdOrAllDevices>,
        content: VerificationContent,
    ) -> Self {
        let recipient = match flow_id {
            FlowId::ToDevice(_) => Recipient::ToDevice { user_id, devices },
            FlowId::InRoom(room_id, _) => Recipient::InRoom { room_id: room_id.clone() },
        };

        Self::new(recipient, content)
    }
}

/// The answer of the transport to a successful send.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SentMessage {
    /// The event id of the message, set for room messages.
    pub event_id: Option<OwnedEventId>,
}

/// Trait abstracting the delivery of verification messages.
#[async_trait]
pub trait VerificationTransport: fmt::Debug + Send + Sync {
    /// Send the given message.
    ///
    /// Returning `Ok` means the message was accepted by the server, the
    /// verification state machines advance only after this.
    async fn send(
        &self,
        request: &OutgoingVerificationRequest,
    ) -> Result<SentMessage, TransportError>;

    /// Send a cancellation for the given flow.
    async fn cancel(
        &self,
        flow_id: &FlowId,
        recipient: Recipient,
        code: CancelCode,
    ) -> Result<SentMessage, TransportError> {
        let content = Cancelled::new(true, code).as_content(flow_id);
        self.send(&OutgoingVerificationRequest::new(recipient, content)).await
    }
}

/// Hand a message to the transport, retrying failed attempts with a linear
/// backoff.
pub(crate) async fn send_with_retries(
    transport: &dyn VerificationTransport,
    request: &OutgoingVerificationRequest,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<SentMessage, TransportError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match transport.send(request).await {
            Ok(sent) => {
                debug!(
                    request_id = request.request_id.as_str(),
                    event_type = request.content.event_type(),
                    "Sent a verification message"
                );

                return Ok(sent);
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    request_id = request.request_id.as_str(),
                    attempt,
                    error = ?e,
                    "Failed to send a verification message, retrying"
                );

                tokio::time::sleep(retry_delay * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use ruma::{user_id, TransactionId};

    use super::{
        send_with_retries, OutgoingVerificationRequest, SentMessage, TransportError,
        VerificationTransport,
    };
    use crate::{
        types::{CancelCode, VerificationContent},
        verification::FlowId,
    };

    #[derive(Debug, Default)]
    struct FlakyTransport {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl VerificationTransport for FlakyTransport {
        async fn send(
            &self,
            _: &OutgoingVerificationRequest,
        ) -> Result<SentMessage, TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            if attempt <= self.failures {
                Err(TransportError::Send("offline".to_owned()))
            } else {
                Ok(SentMessage::default())
            }
        }
    }

    fn cancel_request() -> OutgoingVerificationRequest {
        let flow_id = FlowId::ToDevice(TransactionId::new());

        OutgoingVerificationRequest::for_flow(
            &flow_id,
            user_id!("@bob:localhost").to_owned(),
            Vec::new(),
            crate::verification::Cancelled::new(true, CancelCode::User).as_content(&flow_id),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let transport = Arc::new(FlakyTransport { failures: 2, ..Default::default() });
        let request = cancel_request();

        send_with_retries(&*transport, &request, 3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert_matches!(request.content, VerificationContent::Cancel(_));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let transport = FlakyTransport { failures: 5, ..Default::default() };
        let request = cancel_request();

        let result = send_with_retries(&transport, &request, 3, Duration::from_millis(10)).await;
        assert_matches!(result, Err(TransportError::Send(_)));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }
}
