// BgpMcast: Multicast distribution-tree engine written in Rust
// Copyright 2023-2025 The bgp-mcast developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cooperative teardown of long-lived managers.
//!
//! Deletion is requested externally but completes only once the manager has
//! drained: the [`DeleteActor`] tracks the three-phase protocol
//! live → deleting → destroyed. The owner answers "may I be deleted" by
//! calling [`DeleteActor::resume`] whenever its state drains; the actor
//! transitions to destroyed exactly once, and the owner runs its final
//! teardown on that transition.

use serde::{Deserialize, Serialize};

/// The phase of a managed deletion.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum DeleteState {
    /// No deletion has been requested.
    Live,
    /// Deletion was requested and is waiting for the owner to drain.
    Deleting,
    /// Final teardown has run.
    Destroyed,
}

/// Tracks one managed deletion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteActor {
    state: DeleteState,
}

impl Default for DeleteActor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteActor {
    /// Create an actor in the live state.
    pub fn new() -> Self {
        Self { state: DeleteState::Live }
    }

    /// The current phase.
    pub fn state(&self) -> DeleteState {
        self.state
    }

    /// Request deletion. Idempotent; has no effect once destroyed.
    pub fn request(&mut self) {
        if self.state == DeleteState::Live {
            self.state = DeleteState::Deleting;
        }
    }

    /// Returns true once deletion has been requested.
    pub fn is_deleted(&self) -> bool {
        self.state != DeleteState::Live
    }

    /// Returns true once final teardown has run.
    pub fn is_destroyed(&self) -> bool {
        self.state == DeleteState::Destroyed
    }

    /// Attempt to complete a pending deletion. Transitions to destroyed and
    /// returns true iff deletion is pending and the owner reports it may be
    /// deleted; the owner must run its final teardown exactly when this
    /// returns true.
    pub fn resume(&mut self, may_delete: bool) -> bool {
        if self.state == DeleteState::Deleting && may_delete {
            self.state = DeleteState::Destroyed;
            true
        } else {
            false
        }
    }
}
