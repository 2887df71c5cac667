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

//! Traits and types to plug a key store into the verification machinery.
//!
//! The verification machinery doesn't store long-term keys itself, it asks a
//! [`TrustStore`] for the devices and master keys of a user and tells it
//! which of them ended up verified. An in-memory only implementation is
//! provided as [`MemoryStore`].
//!
//! ```
//! # use matrix_sdk_verification::{store::MemoryStore, DeviceData};
//! # use ruma::{device_id, user_id};
//! # use vodozemac::Ed25519SecretKey;
//! let store = MemoryStore::new();
//! let key = Ed25519SecretKey::new().public_key();
//!
//! store.add_device(DeviceData::new(
//!     user_id!("@bob:localhost").to_owned(),
//!     device_id!("BOBDEVICE").to_owned(),
//!     key,
//! ));
//! ```

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, PoisonError, RwLock as StdRwLock},
};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use thiserror::Error;

use crate::identities::{DeviceData, MasterPubkey};

/// Error type for the trust store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store backend specific error.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap a backend specific error.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// Trait abstracting the storage and trust computation of long-term keys.
#[async_trait]
pub trait TrustStore: fmt::Debug + Send + Sync {
    /// Get the device of a user with the given device id.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, StoreError>;

    /// Get all the known devices of a user.
    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>, StoreError>;

    /// Get the cross-signing master key of a user.
    async fn get_master_key(&self, user_id: &UserId) -> Result<Option<MasterPubkey>, StoreError>;

    /// Mark the given device as verified, invoked once per successful
    /// verification of the device.
    async fn mark_device_as_verified(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), StoreError>;

    /// Mark the cross-signing master key of the given user as trusted.
    async fn mark_cross_signing_key_as_trusted(&self, user_id: &UserId) -> Result<(), StoreError>;
}

/// Hook that gets notified once another device of our own user finished a
/// verification with us.
///
/// This is the place to kick off secret gossiping or key backup requests.
pub trait KeyGossip: fmt::Debug + Send + Sync {
    /// A verification with our own device `device_id` completed.
    fn device_verification_complete(&self, device_id: &DeviceId);
}

/// An in-memory only trust store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: StdRwLock<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceData>>>,
    master_keys: StdRwLock<BTreeMap<OwnedUserId, MasterPubkey>>,
    verified_devices: StdRwLock<Vec<(OwnedUserId, OwnedDeviceId)>>,
    trusted_master_keys: StdRwLock<Vec<OwnedUserId>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device.
    pub fn add_device(&self, device: DeviceData) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device.user_id().to_owned())
            .or_default()
            .insert(device.device_id().to_owned(), device);
    }

    /// Remove a device, e.g. because the user deleted it.
    pub fn remove_device(&self, user_id: &UserId, device_id: &DeviceId) {
        if let Some(devices) =
            self.devices.write().unwrap_or_else(PoisonError::into_inner).get_mut(user_id)
        {
            devices.remove(device_id);
        }
    }

    /// Add or replace the master key of a user.
    pub fn set_master_key(&self, master_key: MasterPubkey) {
        self.master_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(master_key.user_id().to_owned(), master_key);
    }

    /// Every device that was marked as verified, in the order the calls
    /// happened.
    pub fn verified_devices(&self) -> Vec<(OwnedUserId, OwnedDeviceId)> {
        self.verified_devices.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every user whose master key was marked as trusted, in the order the
    /// calls happened.
    pub fn trusted_master_keys(&self) -> Vec<OwnedUserId> {
        self.trusted_master_keys.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TrustStore for MemoryStore {
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, StoreError> {
        Ok(self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .and_then(|d| d.get(device_id))
            .cloned())
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>, StoreError> {
        Ok(self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_master_key(&self, user_id: &UserId) -> Result<Option<MasterPubkey>, StoreError> {
        Ok(self.master_keys.read().unwrap_or_else(PoisonError::into_inner).get(user_id).cloned())
    }

    async fn mark_device_as_verified(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), StoreError> {
        self.verified_devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user_id.to_owned(), device_id.to_owned()));

        Ok(())
    }

    async fn mark_cross_signing_key_as_trusted(&self, user_id: &UserId) -> Result<(), StoreError> {
        let mut master_keys = self.master_keys.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(key) = master_keys.get_mut(user_id) {
            *key = MasterPubkey::new(key.user_id().to_owned(), key.key(), true);
        }

        self.trusted_master_keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(user_id.to_owned());

        Ok(())
    }
}

/// The store view of a single verification participant, our own device plus
/// the trust store.
#[derive(Clone, Debug)]
pub(crate) struct VerificationStore {
    pub own_device: DeviceData,
    inner: Arc<dyn TrustStore>,
}

impl VerificationStore {
    pub fn new(own_device: DeviceData, inner: Arc<dyn TrustStore>) -> Self {
        Self { own_device, inner }
    }

    pub fn user_id(&self) -> &UserId {
        self.own_device.user_id()
    }

    pub fn device_id(&self) -> &DeviceId {
        self.own_device.device_id()
    }

    /// Get a device of some user, our own device is never returned.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, StoreError> {
        Ok(self.inner.get_device(user_id, device_id).await?.filter(|d| {
            !(d.user_id() == self.own_device.user_id()
                && d.device_id() == self.own_device.device_id())
        }))
    }

    pub async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>, StoreError> {
        self.inner.get_user_devices(user_id).await
    }

    pub async fn get_master_key(
        &self,
        user_id: &UserId,
    ) -> Result<Option<MasterPubkey>, StoreError> {
        self.inner.get_master_key(user_id).await
    }

    /// Our own master key, but only if we trust it.
    pub async fn own_trusted_master_key(&self) -> Result<Option<MasterPubkey>, StoreError> {
        Ok(self.get_master_key(self.user_id()).await?.filter(|k| k.is_trusted()))
    }

    pub fn inner(&self) -> &dyn TrustStore {
        &*self.inner
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use vodozemac::Ed25519SecretKey;

    use super::{MemoryStore, TrustStore};
    use crate::identities::{DeviceData, MasterPubkey};

    #[tokio::test]
    async fn memory_store_records_trust() {
        let store = MemoryStore::new();
        let alice = user_id!("@alice:localhost");
        let device = DeviceData::new(
            alice.to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            Ed25519SecretKey::new().public_key(),
        );

        store.add_device(device.clone());
        store.set_master_key(MasterPubkey::new(
            alice.to_owned(),
            Ed25519SecretKey::new().public_key(),
            false,
        ));

        assert_eq!(store.get_device(alice, device.device_id()).await.unwrap(), Some(device));
        assert!(!store.get_master_key(alice).await.unwrap().unwrap().is_trusted());

        store.mark_device_as_verified(alice, device_id!("ALICEDEVICE")).await.unwrap();
        store.mark_cross_signing_key_as_trusted(alice).await.unwrap();

        assert_eq!(
            store.verified_devices(),
            vec![(alice.to_owned(), device_id!("ALICEDEVICE").to_owned())]
        );
        assert!(store.get_master_key(alice).await.unwrap().unwrap().is_trusted());
        assert_eq!(store.trusted_master_keys(), vec![alice.to_owned()]);
    }
}
