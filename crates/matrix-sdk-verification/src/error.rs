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

use ruma::{OwnedDeviceId, OwnedUserId};
use thiserror::Error;

use crate::{store::StoreError, transport::TransportError};

/// Error type for operations that can't be expressed as a cancellation of a
/// verification flow.
///
/// Protocol failures never show up here, they cancel the flow and are
/// reported through [`CancelInfo`](crate::CancelInfo).
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The storage layer returned an error.
    #[error("failed to read or write to the trust store: {0}")]
    Store(#[from] StoreError),

    /// A message couldn't be handed to the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The device we want to verify isn't known to the trust store.
    #[error("the device {1} of user {0} is unknown")]
    UnknownDevice(OwnedUserId, OwnedDeviceId),

    /// An in-room request was sent but the transport didn't report the event
    /// id, the flow can't be tracked without it.
    #[error("the transport didn't return an event id for an in-room verification request")]
    MissingEventId,

    /// We and the other side don't share a single verification method.
    #[error("no verification methods in common with the other side")]
    NoMethodsInCommon,
}
