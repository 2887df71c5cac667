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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::VerificationMethod;

/// Settings for the [`VerificationMachine`](crate::VerificationMachine).
///
/// Missing fields fall back to their defaults when deserializing.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// The methods we advertise in requests and ready messages.
    pub methods: Vec<VerificationMethod>,
    /// Accept a SAS start automatically if it belongs to a request we
    /// already accepted.
    pub auto_accept_sas: bool,
    /// How many times a message is handed to the transport before the flow
    /// is cancelled.
    pub max_send_attempts: u32,
    /// The delay before the first retry, each further retry waits one more
    /// multiple of it.
    pub retry_delay: Duration,
    /// The maximal lifetime of a single verification flow.
    pub flow_timeout: Duration,
    /// The maximal time between two messages of a verification flow.
    pub event_timeout: Duration,
    /// The maximal lifetime of a verification request.
    pub request_timeout: Duration,
    /// How long finished flows are remembered.
    pub past_transaction_lifetime: Duration,
    /// How many finished flows are remembered.
    pub max_past_transactions: usize,
    /// Capacity of the lifecycle event channel, slow listeners lose the
    /// oldest events.
    pub event_capacity: usize,
}

impl VerificationSettings {
    pub(crate) fn supports(&self, method: &VerificationMethod) -> bool {
        self.methods.contains(method)
    }
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            methods: vec![
                VerificationMethod::SasV1,
                VerificationMethod::QrCodeShowV1,
                VerificationMethod::QrCodeScanV1,
                VerificationMethod::ReciprocateV1,
            ],
            auto_accept_sas: true,
            max_send_attempts: 3,
            retry_delay: Duration::from_millis(250),
            flow_timeout: Duration::from_secs(60 * 5),
            event_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60 * 10),
            past_transaction_lifetime: Duration::from_secs(60 * 10),
            max_past_transactions: 32,
            event_capacity: 64,
        }
    }
}
