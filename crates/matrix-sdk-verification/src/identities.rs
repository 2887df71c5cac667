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

//! The long-term keys that take part in a verification.

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::Ed25519PublicKey;

/// The public part of a device as the trust store knows it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceData {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    ed25519_key: Ed25519PublicKey,
}

impl DeviceData {
    /// Create a new device from its ids and its long-term ed25519 key.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        ed25519_key: Ed25519PublicKey,
    ) -> Self {
        Self { user_id, device_id, ed25519_key }
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The long-term ed25519 key of the device.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.ed25519_key
    }

    /// The key id under which the device key is attested in a MAC message.
    pub fn key_id(&self) -> String {
        format!("ed25519:{}", self.device_id)
    }

    /// The unpadded base64 fingerprint of the device, the ed25519 key.
    pub fn fingerprint(&self) -> String {
        self.ed25519_key.to_base64()
    }
}

/// The public cross-signing master key of a user.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MasterPubkey {
    user_id: OwnedUserId,
    key: Ed25519PublicKey,
    trusted: bool,
}

impl MasterPubkey {
    /// Create a new master key.
    ///
    /// `trusted` tells if we consider the key to be verified already, for our
    /// own user this decides if we attest the key in a MAC or a QR code.
    pub fn new(user_id: OwnedUserId, key: Ed25519PublicKey, trusted: bool) -> Self {
        Self { user_id, key, trusted }
    }

    /// The user the key belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The public key.
    pub fn key(&self) -> Ed25519PublicKey {
        self.key
    }

    /// Is this key already trusted.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// The unpadded base64 form of the key, master keys use it as their key
    /// id as well.
    pub fn to_base64(&self) -> String {
        self.key.to_base64()
    }

    /// The key id under which the master key is attested in a MAC message.
    pub fn key_id(&self) -> String {
        format!("ed25519:{}", self.key.to_base64())
    }
}
