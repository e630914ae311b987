// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request registry. Requests are how routing protocols reserve a
//! liveness probe: each one targets a `(remote, local, link, vrf)` tuple,
//! is claimed by the first instance that accepts it, and rides the session
//! it attached to. Requests without a willing instance park on the wait
//! list until one shows up. The requester owns the handle; dropping it
//! detaches, and a session whose last request leaves is torn down.

use crate::config::SessionOpts;
use crate::iface::Link;
use crate::instance::Instance;
use crate::lock;
use crate::{DaemonState, Diag, State};
use slog::Logger;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};

pub(crate) type ReqId = u64;

/// What a request is asking to monitor.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub addr: IpAddr,
    pub local: IpAddr,
    pub link: Option<Link>,
    pub vrf: Option<u32>,
}

/// The transition a request callback observes. `went_down` is true only
/// for a loss: Up to Down with the remote end not administratively down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestUpdate {
    pub state: State,
    pub old_state: State,
    pub diag: Diag,
    pub went_down: bool,
}

/// Request notification callback. Runs on the control side: either the
/// caller's thread at attach time or the notification drain thread.
pub type RequestHook = Box<dyn FnMut(RequestUpdate) + Send>;

pub(crate) struct ReqState {
    pub state: State,
    pub old_state: State,
    pub diag: Diag,
    pub down: bool,
}

pub(crate) struct ReqShared {
    pub state: Mutex<ReqState>,
    pub hook: Mutex<Option<RequestHook>>,

    /// Thread currently running the hook. Lets a drop from inside the
    /// request's own callback skip waiting on itself, while a drop from
    /// any other thread blocks until the in-flight callback returns.
    pub hook_thread: Mutex<Option<std::thread::ThreadId>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Place {
    Wait,
    Attached { inst: u64, loc_id: u32 },
}

pub(crate) struct ReqEntry {
    pub target: RequestTarget,
    pub opts: SessionOpts,
    pub shared: Arc<ReqShared>,
    pub place: Place,
}

/// Requests attached to one session, in claim order; the head request's
/// overrides are the ones a reconfiguration applies.
#[derive(Default)]
pub(crate) struct Attachment {
    pub reqs: Vec<ReqId>,

    /// Set while the drain runs this session's callbacks, so a request
    /// destroyed by its own callback does not pull the session out from
    /// under the iteration.
    pub notify_running: bool,
}

/// Notifications computed under the registry lock but fired after it is
/// released, since hooks may call back into the API.
pub(crate) type Deferred = Vec<(Arc<ReqShared>, State, State, Diag)>;

pub(crate) struct Registry {
    pub instances: Vec<(u64, Arc<Instance>)>,
    pub requests: HashMap<ReqId, ReqEntry>,
    pub wait_list: Vec<ReqId>,
    pub attachments: HashMap<(u64, u32), Attachment>,
    pub next_req: ReqId,
    pub next_inst: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
            requests: HashMap::new(),
            wait_list: Vec::new(),
            attachments: HashMap::new(),
            next_req: 1,
            next_inst: 1,
        }
    }

    /// Register a new request, initially parked on the wait list.
    pub fn create(
        &mut self,
        target: RequestTarget,
        opts: SessionOpts,
    ) -> (ReqId, Arc<ReqShared>) {
        let id = self.next_req;
        self.next_req += 1;
        let shared = Arc::new(ReqShared {
            state: Mutex::new(ReqState {
                state: State::AdminDown,
                old_state: State::AdminDown,
                diag: Diag::Nothing,
                down: false,
            }),
            hook: Mutex::new(None),
            hook_thread: Mutex::new(None),
        });
        self.requests.insert(
            id,
            ReqEntry {
                target,
                opts,
                shared: shared.clone(),
                place: Place::Wait,
            },
        );
        self.wait_list.push(id);
        (id, shared)
    }

    /// Pull a request off whatever list holds it. A session left without
    /// requests is removed, unless its callbacks are mid-flight (the drain
    /// handles it) or its instance is already gone (the session dies with
    /// it).
    pub fn detach(&mut self, req_id: ReqId) {
        let place = match self.requests.get(&req_id) {
            Some(entry) => entry.place,
            None => return,
        };
        match place {
            Place::Wait => self.wait_list.retain(|r| *r != req_id),
            Place::Attached { inst, loc_id } => {
                let key = (inst, loc_id);
                if let Some(att) = self.attachments.get_mut(&key) {
                    att.reqs.retain(|r| *r != req_id);
                    if att.reqs.is_empty() && !att.notify_running {
                        self.attachments.remove(&key);
                        if let Some((_, instance)) =
                            self.instances.iter().find(|(id, _)| *id == inst)
                        {
                            instance.remove_session(loc_id);
                        }
                    }
                }
            }
        }
    }

    /// Offer a request to one instance. On acceptance the request moves to
    /// the session's attachment list and the current state is returned for
    /// notification.
    pub fn try_attach(
        &mut self,
        inst_id: u64,
        instance: &Arc<Instance>,
        req_id: ReqId,
        log: &Logger,
    ) -> Option<(Arc<ReqShared>, State, State, Diag)> {
        let entry = self.requests.get(&req_id)?;
        if !instance.accepts(&entry.target) {
            return None;
        }
        let target = entry.target.clone();
        let opts = entry.opts.clone();

        match instance.find_or_add_session(&target, &opts) {
            Ok((loc_id, session_shared)) => {
                self.detach(req_id);
                self.attachments
                    .entry((inst_id, loc_id))
                    .or_default()
                    .reqs
                    .push(req_id);
                let entry = self.requests.get_mut(&req_id)?;
                entry.place = Place::Attached {
                    inst: inst_id,
                    loc_id,
                };
                let snap = *lock!(session_shared.snap);
                Some((
                    entry.shared.clone(),
                    snap.loc_state,
                    snap.rem_state,
                    snap.loc_diag,
                ))
            }
            Err(e) => {
                slog::warn!(log, "session setup failed: {e}";
                    "instance" => instance.name(),
                    "peer" => format_args!("{}", target.addr));
                None
            }
        }
    }

    /// Submit a request to the instances in registration order; parks it
    /// on the wait list when nobody accepts.
    pub fn submit(&mut self, log: &Logger, req_id: ReqId) -> Deferred {
        let instances = self.instances.clone();
        for (inst_id, instance) in &instances {
            if let Some(n) = self.try_attach(*inst_id, instance, req_id, log)
            {
                return vec![n];
            }
        }

        self.detach(req_id);
        let Some(entry) = self.requests.get_mut(&req_id) else {
            return Vec::new();
        };
        entry.place = Place::Wait;
        self.wait_list.push(req_id);
        vec![(
            entry.shared.clone(),
            State::AdminDown,
            State::AdminDown,
            Diag::Nothing,
        )]
    }

    /// Overrides of the session's current requester (the head of its
    /// attachment list).
    pub fn head_opts(
        &self,
        inst_id: u64,
        loc_id: u32,
    ) -> Option<SessionOpts> {
        self.attachments
            .get(&(inst_id, loc_id))
            .and_then(|a| a.reqs.first())
            .and_then(|rid| self.requests.get(rid))
            .map(|e| e.opts.clone())
    }
}

/// Update a request's reported state and run its callback if the state
/// actually changed. Never called with any registry lock held.
pub(crate) fn notify_request(
    shared: &ReqShared,
    state: State,
    rem_state: State,
    diag: Diag,
) {
    let update = {
        let mut st = lock!(shared.state);
        if st.state == state {
            None
        } else {
            st.old_state = st.state;
            st.state = state;
            st.diag = diag;
            st.down = st.old_state == State::Up
                && state == State::Down
                && rem_state != State::AdminDown;
            Some(RequestUpdate {
                state: st.state,
                old_state: st.old_state,
                diag: st.diag,
                went_down: st.down,
            })
        }
    };
    if let Some(update) = update {
        let mut hook = lock!(shared.hook);
        *lock!(shared.hook_thread) = Some(std::thread::current().id());
        if let Some(f) = hook.as_mut() {
            f(update);
        }
        *lock!(shared.hook_thread) = None;
    }
}

pub(crate) fn fire_deferred(deferred: Deferred) {
    for (shared, state, rem_state, diag) in deferred {
        notify_request(&shared, state, rem_state, diag);
    }
}

/// Drain pending session transitions for one instance and run the attached
/// request callbacks. Interleaved transitions are coalesced to the newest
/// state. A session whose requests all left during its callbacks is
/// removed here.
pub(crate) fn drain_notifications(state: &DaemonState, instance: &Instance) {
    for (loc_id, snap) in instance.notify_take() {
        let key = (instance.id(), loc_id);

        let shares: Vec<Arc<ReqShared>> = {
            let mut reg = lock!(state.reg);
            let rids = match reg.attachments.get_mut(&key) {
                Some(att) => {
                    att.notify_running = true;
                    att.reqs.clone()
                }
                None => continue,
            };
            rids.iter()
                .filter_map(|rid| {
                    reg.requests.get(rid).map(|e| e.shared.clone())
                })
                .collect()
        };

        for shared in &shares {
            notify_request(
                shared,
                snap.loc_state,
                snap.rem_state,
                snap.loc_diag,
            );
        }

        let mut reg = lock!(state.reg);
        if let Some(att) = reg.attachments.get_mut(&key) {
            att.notify_running = false;
            if att.reqs.is_empty() {
                reg.attachments.remove(&key);
                instance.remove_session(loc_id);
            }
        }
    }
}

/// An externally owned reservation of a BFD session. The request detaches
/// on drop; a session that loses its last request is removed. No callback
/// runs after the drop returns.
pub struct SessionRequest {
    id: ReqId,
    daemon: Weak<DaemonState>,
    shared: Arc<ReqShared>,
}

impl SessionRequest {
    pub(crate) fn new(
        id: ReqId,
        daemon: Weak<DaemonState>,
        shared: Arc<ReqShared>,
    ) -> Self {
        Self { id, daemon, shared }
    }

    /// Last reported session state.
    pub fn state(&self) -> State {
        lock!(self.shared.state).state
    }

    pub fn old_state(&self) -> State {
        lock!(self.shared.state).old_state
    }

    pub fn diag(&self) -> Diag {
        lock!(self.shared.state).diag
    }

    /// Whether the last transition was a loss of connectivity.
    pub fn went_down(&self) -> bool {
        lock!(self.shared.state).down
    }

    /// Install or replace the notification callback.
    pub fn set_hook(&self, hook: Option<RequestHook>) {
        *lock!(self.shared.hook) = hook;
    }

    /// Replace the per-request overrides and reapply the session's
    /// configuration.
    pub fn update(&self, opts: SessionOpts) {
        let Some(state) = self.daemon.upgrade() else {
            return;
        };
        let mut reg = lock!(state.reg);
        let Some(entry) = reg.requests.get_mut(&self.id) else {
            return;
        };
        if entry.opts == opts {
            return;
        }
        entry.opts = opts;
        let place = entry.place;
        if let Place::Attached { inst, loc_id } = place {
            if let Some(head) = reg.head_opts(inst, loc_id) {
                if let Some((_, instance)) =
                    reg.instances.iter().find(|(id, _)| *id == inst)
                {
                    instance.reconfigure_session(loc_id, &head);
                }
            }
        }
    }
}

impl Drop for SessionRequest {
    fn drop(&mut self) {
        // Silence the hook so no callback runs after this drop returns.
        // When the drop comes from inside the request's own callback, the
        // hook mutex is already held by this thread; skipping the wait is
        // what makes that safe.
        let own_callback = *lock!(self.shared.hook_thread)
            == Some(std::thread::current().id());
        if !own_callback {
            *lock!(self.shared.hook) = None;
        }

        let Some(state) = self.daemon.upgrade() else {
            return;
        };
        let mut reg = lock!(state.reg);
        if reg.requests.contains_key(&self.id) {
            reg.detach(self.id);
            reg.requests.remove(&self.id);
        }
    }
}
