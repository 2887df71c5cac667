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

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, PoisonError, RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, Instant},
};

use futures_core::Stream;
use futures_util::{future, StreamExt};
use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use super::{
    requests::{VerificationRequest, VerificationRequestState},
    FlowId, QrVerification, Sas, Verification,
};
use crate::settings::VerificationSettings;

/// A point in time view of a [`VerificationRequest`].
#[derive(Clone, Debug)]
pub struct RequestSnapshot {
    /// The flow the request belongs to.
    pub flow_id: FlowId,
    /// The user on the other side of the request.
    pub other_user_id: OwnedUserId,
    /// The device on the other side, known once the request was accepted.
    pub other_device_id: Option<OwnedDeviceId>,
    /// Did we send the request.
    pub we_started: bool,
    /// The state the request was in.
    pub state: VerificationRequestState,
}

impl RequestSnapshot {
    /// Is the snapshot of a cancelled request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, VerificationRequestState::Cancelled(_))
    }

    /// Should this snapshot replace the stored one.
    ///
    /// Cancellation is sticky, only another cancellation can replace it.
    fn supersedes(&self, old: &RequestSnapshot) -> bool {
        !old.is_cancelled() || self.is_cancelled()
    }
}

/// Lifecycle events of the requests and flows the
/// [`VerificationMachine`](super::VerificationMachine) knows about.
#[derive(Clone, Debug)]
pub enum VerificationEvent {
    /// A new verification request was sent or received.
    RequestAdded(RequestSnapshot),
    /// A verification request changed its state.
    RequestUpdated(RequestSnapshot),
    /// A new verification flow was started.
    TransactionAdded(Verification),
    /// A verification flow changed its state.
    TransactionUpdated(Verification),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct FlowKey(OwnedUserId, String);

impl FlowKey {
    fn new(user_id: &UserId, flow_id: &str) -> Self {
        Self(user_id.to_owned(), flow_id.to_owned())
    }

    fn of(verification: &Verification) -> Self {
        Self::new(verification.other_user(), verification.flow_id().as_str())
    }
}

#[derive(Debug)]
struct PastTransaction {
    verification: Verification,
    finished_at: Instant,
}

#[derive(Debug, Default)]
struct Maps {
    transactions: BTreeMap<FlowKey, Verification>,
    requests: BTreeMap<FlowKey, (VerificationRequest, RequestSnapshot)>,
    past_transactions: BTreeMap<FlowKey, PastTransaction>,
}

struct CacheInner {
    maps: StdRwLock<Maps>,
    sender: broadcast::Sender<VerificationEvent>,
    past_transaction_lifetime: Duration,
    max_past_transactions: usize,
}

/// The registry of all the verification requests and flows.
///
/// Every map lives behind a single lock, events are dispatched while the lock
/// is held so listeners see them in the order the changes happened.
#[derive(Clone)]
pub(crate) struct VerificationCache {
    inner: Arc<CacheInner>,
}

// The stored flows point back to the cache, the maps aren't printed.
impl fmt::Debug for VerificationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationCache")
            .field("past_transaction_lifetime", &self.inner.past_transaction_lifetime)
            .field("max_past_transactions", &self.inner.max_past_transactions)
            .finish_non_exhaustive()
    }
}

impl VerificationCache {
    pub fn new(settings: &VerificationSettings) -> Self {
        let (sender, _) = broadcast::channel(settings.event_capacity.max(1));

        Self {
            inner: CacheInner {
                maps: Default::default(),
                sender,
                past_transaction_lifetime: settings.past_transaction_lifetime,
                max_past_transactions: settings.max_past_transactions,
            }
            .into(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.inner.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.inner.maps.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, event: VerificationEvent) {
        // Nobody listening isn't an error.
        let _ = self.inner.sender.send(event);
    }

    /// Listen to the lifecycle events of requests and flows.
    ///
    /// Listeners that fall behind lose the oldest events.
    pub fn events(&self) -> impl Stream<Item = VerificationEvent> {
        BroadcastStream::new(self.inner.sender.subscribe()).filter_map(|e| future::ready(e.ok()))
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.read().transactions.is_empty()
    }

    /// Store a new flow, replacing whatever flow was stored under the same
    /// user and flow id.
    pub fn insert(&self, verification: impl Into<Verification>) {
        let verification = verification.into();
        let key = FlowKey::of(&verification);

        let mut maps = self.write();

        trace!(
            user_id = ?key.0,
            flow_id = key.1.as_str(),
            "Inserting a new verification flow"
        );

        maps.past_transactions.remove(&key);
        maps.transactions.insert(key, verification.clone());
        self.dispatch(VerificationEvent::TransactionAdded(verification));
    }

    pub fn get(&self, user_id: &UserId, flow_id: &str) -> Option<Verification> {
        self.read().transactions.get(&FlowKey::new(user_id, flow_id)).cloned()
    }

    pub fn get_sas(&self, user_id: &UserId, flow_id: &str) -> Option<Sas> {
        self.get(user_id, flow_id).and_then(Verification::sas_v1)
    }

    pub fn get_qr(&self, user_id: &UserId, flow_id: &str) -> Option<QrVerification> {
        self.get(user_id, flow_id).and_then(Verification::qr_v1)
    }

    pub fn remove(&self, user_id: &UserId, flow_id: &str) -> Option<Verification> {
        self.write().transactions.remove(&FlowKey::new(user_id, flow_id))
    }

    pub fn get_transactions(&self, user_id: &UserId) -> Vec<Verification> {
        self.read()
            .transactions
            .iter()
            .filter(|(key, _)| key.0 == user_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn get_past_transaction(&self, user_id: &UserId, flow_id: &str) -> Option<Verification> {
        self.read()
            .past_transactions
            .get(&FlowKey::new(user_id, flow_id))
            .map(|p| p.verification.clone())
    }

    /// A flow changed its state.
    ///
    /// Finished flows are moved to the table of past flows, as long as they
    /// are still the flow stored for their key.
    pub fn transaction_updated(&self, verification: &Verification) {
        let key = FlowKey::of(verification);
        let mut maps = self.write();

        let is_stored =
            maps.transactions.get(&key).is_some_and(|stored| stored.same_instance(verification));

        if !is_stored {
            trace!(
                flow_id = key.1.as_str(),
                "Ignoring an update of a verification flow that was replaced or removed"
            );
            return;
        }

        self.dispatch(VerificationEvent::TransactionUpdated(verification.clone()));

        if verification.is_terminal() {
            debug!(
                user_id = ?key.0,
                flow_id = key.1.as_str(),
                done = verification.is_done(),
                "Moving a finished verification flow to the past flows"
            );

            if let Some(verification) = maps.transactions.remove(&key) {
                maps.past_transactions
                    .insert(key, PastTransaction { verification, finished_at: Instant::now() });
            }

            self.prune_past(&mut maps);
        }
    }

    fn prune_past(&self, maps: &mut Maps) {
        let lifetime = self.inner.past_transaction_lifetime;
        maps.past_transactions.retain(|_, p| p.finished_at.elapsed() <= lifetime);

        while maps.past_transactions.len() > self.inner.max_past_transactions {
            let oldest = maps
                .past_transactions
                .iter()
                .min_by_key(|(_, p)| p.finished_at)
                .map(|(key, _)| key.clone());

            match oldest {
                Some(key) => {
                    maps.past_transactions.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn add_request(&self, request: VerificationRequest, snapshot: RequestSnapshot) {
        let key = FlowKey::new(&snapshot.other_user_id, snapshot.flow_id.as_str());
        let mut maps = self.write();

        maps.requests.insert(key, (request, snapshot.clone()));
        self.dispatch(VerificationEvent::RequestAdded(snapshot));
    }

    pub fn get_request(&self, user_id: &UserId, flow_id: &str) -> Option<VerificationRequest> {
        self.read().requests.get(&FlowKey::new(user_id, flow_id)).map(|(r, _)| r.clone())
    }

    /// Find a request by its flow alone, used for messages our other devices
    /// sent into a room.
    pub fn find_request(&self, flow_id: &FlowId) -> Option<VerificationRequest> {
        self.read()
            .requests
            .values()
            .find(|(_, snapshot)| &snapshot.flow_id == flow_id)
            .map(|(r, _)| r.clone())
    }

    pub fn get_request_snapshot(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Option<RequestSnapshot> {
        self.read().requests.get(&FlowKey::new(user_id, flow_id)).map(|(_, s)| s.clone())
    }

    pub fn get_requests(&self, user_id: &UserId) -> Vec<VerificationRequest> {
        self.read()
            .requests
            .iter()
            .filter(|(key, _)| key.0 == user_id)
            .map(|(_, (r, _))| r.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<VerificationRequest> {
        self.read().requests.values().map(|(r, _)| r.clone()).collect()
    }

    pub fn transactions(&self) -> Vec<Verification> {
        self.read().transactions.values().cloned().collect()
    }

    /// Swap the snapshot of a stored request.
    pub fn update_request(&self, snapshot: RequestSnapshot) {
        let key = FlowKey::new(&snapshot.other_user_id, snapshot.flow_id.as_str());
        let mut maps = self.write();

        let Some((_, stored)) = maps.requests.get_mut(&key) else {
            return;
        };

        if !snapshot.supersedes(stored) {
            trace!(
                flow_id = key.1.as_str(),
                state = ?snapshot.state,
                "Not replacing the snapshot of a cancelled verification request"
            );
            return;
        }

        *stored = snapshot.clone();
        self.dispatch(VerificationEvent::RequestUpdated(snapshot));
    }

    /// Forget finished requests and flows that finished too long ago.
    pub fn prune(&self) {
        let mut maps = self.write();

        maps.requests.retain(|_, (_, snapshot)| {
            !matches!(
                snapshot.state,
                VerificationRequestState::Done | VerificationRequestState::Cancelled(_)
            )
        });

        self.prune_past(&mut maps);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures_util::pin_mut;
    use stream_assert::{assert_next_matches, assert_pending};

    use super::{RequestSnapshot, VerificationEvent};
    use crate::{
        types::CancelCode,
        verification::{
            tests::setup_pair,
            Cancelled, VerificationRequestState,
        },
    };

    #[tokio::test]
    async fn finished_flows_move_to_the_past_table() {
        let (alice, bob) = setup_pair().await;

        let sas = alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        let flow_id = sas.flow_id().as_str().to_owned();

        assert!(alice.machine.get_verification(bob.user_id(), &flow_id).is_some());

        sas.cancel().await;

        assert!(alice.machine.get_verification(bob.user_id(), &flow_id).is_none());
        assert_matches!(
            alice.cache().get_past_transaction(bob.user_id(), &flow_id),
            Some(v) => assert!(v.is_cancelled())
        );
    }

    #[tokio::test]
    async fn removed_flows_are_not_remembered() {
        let (alice, bob) = setup_pair().await;

        let sas = alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        let flow_id = sas.flow_id().as_str().to_owned();
        let cache = alice.cache();

        assert!(cache.remove(bob.user_id(), &flow_id).is_some());
        sas.cancel().await;

        assert!(cache.get(bob.user_id(), &flow_id).is_none());
        assert!(cache.get_past_transaction(bob.user_id(), &flow_id).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_sticky() {
        let (alice, bob) = setup_pair().await;

        let request = alice.machine.request_verification(bob.user_id(), None).await.unwrap();
        let flow_id = request.flow_id().as_str().to_owned();
        let cache = alice.cache();

        let created = cache.get_request_snapshot(bob.user_id(), &flow_id).unwrap();
        assert_matches!(created.state, VerificationRequestState::Created { .. });

        request.cancel().await;
        let cancelled = cache.get_request_snapshot(bob.user_id(), &flow_id).unwrap();
        assert!(cancelled.is_cancelled());

        // A stale snapshot can't revive the request.
        cache.update_request(created);
        assert!(cache.get_request_snapshot(bob.user_id(), &flow_id).unwrap().is_cancelled());

        // A newer cancellation replaces the older one.
        let newer = RequestSnapshot {
            state: VerificationRequestState::Cancelled(
                Cancelled::new(false, CancelCode::Timeout).into(),
            ),
            ..cancelled
        };
        cache.update_request(newer);
        assert_matches!(
            cache.get_request_snapshot(bob.user_id(), &flow_id).unwrap().state,
            VerificationRequestState::Cancelled(info) => {
                assert_eq!(info.cancel_code(), &CancelCode::Timeout);
            }
        );
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (alice, bob) = setup_pair().await;

        let events = alice.machine.events();
        pin_mut!(events);
        assert_pending!(events);

        let sas = alice.machine.start_sas(bob.user_id(), bob.device_id()).await.unwrap();
        assert_next_matches!(events, VerificationEvent::TransactionAdded(v) => {
            assert_eq!(v.flow_id(), sas.flow_id());
        });
        assert_next_matches!(events, VerificationEvent::TransactionUpdated(_));

        sas.cancel().await;
        assert_next_matches!(events, VerificationEvent::TransactionUpdated(v) => {
            assert!(v.is_cancelled());
        });

        assert_pending!(events);
    }
}
