// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bridge between the protocol thread and the control plane. State
//! transitions are posted here by the protocol thread and drained by the
//! control side, which then runs request callbacks. The lock below is held
//! only for a handful of loads and stores on either side; the kick channel
//! is edge-triggered, firing only when a session goes from idle to
//! pending.

use crate::lock;
use crate::{Diag, State};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

/// State a session exposes to the control plane without going through the
/// instance entry mutex.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    pub loc_state: State,
    pub rem_state: State,
    pub loc_diag: Diag,

    /// Whether the session is already on the pending list.
    pub queued: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            loc_state: State::Down,
            rem_state: State::Down,
            loc_diag: Diag::Nothing,
            queued: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    pub snap: Mutex<Snapshot>,
}

pub(crate) struct NotifyEntry {
    pub loc_id: u32,
    pub shared: Arc<SessionShared>,
}

pub(crate) struct NotifyBridge {
    pending: Mutex<Vec<NotifyEntry>>,
    kick: Sender<()>,
}

impl NotifyBridge {
    pub fn new(kick: Sender<()>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            kick,
        }
    }

    /// Record fresh state for a session without scheduling a notification.
    pub fn sync(
        &self,
        shared: &Arc<SessionShared>,
        loc_state: State,
        rem_state: State,
        loc_diag: Diag,
    ) {
        let mut snap = lock!(shared.snap);
        snap.loc_state = loc_state;
        snap.rem_state = rem_state;
        snap.loc_diag = loc_diag;
    }

    /// Record fresh state and schedule the session for notification. Kicks
    /// the control side only if the session was not already pending.
    pub fn post(
        &self,
        loc_id: u32,
        shared: &Arc<SessionShared>,
        loc_state: State,
        rem_state: State,
        loc_diag: Diag,
    ) {
        let newly_queued = {
            let mut snap = lock!(shared.snap);
            snap.loc_state = loc_state;
            snap.rem_state = rem_state;
            snap.loc_diag = loc_diag;
            !std::mem::replace(&mut snap.queued, true)
        };
        if newly_queued {
            lock!(self.pending).push(NotifyEntry {
                loc_id,
                shared: shared.clone(),
            });
            // The drain side exits when the instance goes away; a dead
            // receiver here is not an error.
            let _ = self.kick.send(());
        }
    }

    /// Take all pending sessions, reading each one's consistent snapshot
    /// and clearing its queued mark. Transitions that piled up since the
    /// post are coalesced: only the newest state is observed.
    pub fn take(&self) -> Vec<(u32, Snapshot)> {
        let entries = std::mem::take(&mut *lock!(self.pending));
        entries
            .into_iter()
            .map(|e| {
                let mut snap = lock!(e.shared.snap);
                snap.queued = false;
                (e.loc_id, *snap)
            })
            .collect()
    }

    /// Drop a session from the pending list, for removal paths.
    pub fn unqueue(&self, loc_id: u32, shared: &Arc<SessionShared>) {
        lock!(self.pending).retain(|e| e.loc_id != loc_id);
        lock!(shared.snap).queued = false;
    }
}
