// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bidirectional Forwarding Detection (RFC 5880) as an embeddable
//! subsystem for a routing daemon.
//!
//! A [`Daemon`] owns protocol instances and the request API through which
//! routing protocols reserve liveness probes. Each [`Instance`] runs its
//! sessions on a dedicated protocol thread with high-resolution timers;
//! requests, static neighbors, reconfiguration, and state-change callbacks
//! live on the control side and cross over through a per-instance entry
//! mutex and a notification bridge. Packet transport is pluggable through
//! the [`transport`] traits; the [`packet`] module provides the wire
//! codec.
//!
//! Supported standards:
//! - RFC 5880 - main BFD standard
//! - RFC 5881 - BFD for IP links
//! - RFC 5882 - generic application of BFD
//! - RFC 5883 - BFD for multihop paths

use num_enum::TryFromPrimitive;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

pub mod config;
mod engine;
pub mod error;
pub mod iface;
pub mod instance;
pub mod log;
mod neighbor;
mod notify;
pub mod packet;
mod request;
mod session;
pub mod timer;
pub mod transport;

pub use config::{InstanceConfig, SessionOpts};
pub use error::Error;
pub use iface::Link;
pub use instance::{Instance, SessionInfo};
pub use request::{
    RequestHook, RequestTarget, RequestUpdate, SessionRequest,
};

use config::NeighborConfig;
use neighbor::{same_neighbor, NeighborEntry};
use request::{drain_notifications, fire_deferred, Registry, ReqId};
use transport::SocketFactory;

#[macro_export]
macro_rules! lock {
    ($mtx:expr) => {
        $mtx.lock().expect("lock mutex")
    };
}

/// Session states per RFC 5880 §6.2.
#[derive(
    Default,
    PartialEq,
    Eq,
    Debug,
    Copy,
    Clone,
    Hash,
    TryFromPrimitive,
    JsonSchema,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum State {
    /// Administratively held down; absorbs all remote transitions.
    AdminDown = 0,

    /// The initial state: the forwarding path is not known to work.
    #[default]
    Down = 1,

    /// The remote system was seen down; waiting for it to notice us.
    Init = 2,

    /// Both directions confirmed working.
    Up = 3,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::AdminDown => "AdminDown",
            State::Down => "Down",
            State::Init => "Init",
            State::Up => "Up",
        }
    }
}

/// Diagnostic codes carried in control packets.
#[derive(
    Default,
    PartialEq,
    Eq,
    Debug,
    Copy,
    Clone,
    Hash,
    TryFromPrimitive,
    JsonSchema,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Diag {
    #[default]
    Nothing = 0,
    Timeout = 1,
    EchoFailed = 2,
    NeighborDown = 3,
    FwdReset = 4,
    PathDown = 5,
    ConcatPathDown = 6,
    AdminDown = 7,
    RevConcatPathDown = 8,
}

impl Diag {
    pub fn name(&self) -> &'static str {
        match self {
            Diag::Nothing => "None",
            Diag::Timeout => "Time expired",
            Diag::EchoFailed => "Echo failed",
            Diag::NeighborDown => "Neighbor down",
            Diag::FwdReset => "Fwd plane reset",
            Diag::PathDown => "Path down",
            Diag::ConcatPathDown => "Concat path down",
            Diag::AdminDown => "Admin down",
            Diag::RevConcatPathDown => "Rev concat path down",
        }
    }
}

/// Authentication schemes per RFC 5880 §4.2-4.4.
#[derive(
    Default,
    PartialEq,
    Eq,
    Debug,
    Copy,
    Clone,
    Hash,
    TryFromPrimitive,
    JsonSchema,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum AuthType {
    #[default]
    None = 0,
    Simple = 1,
    KeyedMd5 = 2,
    MeticulousKeyedMd5 = 3,
    KeyedSha1 = 4,
    MeticulousKeyedSha1 = 5,
}

impl AuthType {
    /// Whether packets of this scheme carry a cryptographic sequence
    /// number.
    pub fn uses_csn(&self) -> bool {
        !matches!(self, AuthType::None | AuthType::Simple)
    }

    /// Meticulous schemes advance the sequence number on every packet.
    pub fn meticulous(&self) -> bool {
        matches!(
            self,
            AuthType::MeticulousKeyedMd5 | AuthType::MeticulousKeyedSha1
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthType::None => "None",
            AuthType::Simple => "Simple",
            AuthType::KeyedMd5 => "Keyed MD5",
            AuthType::MeticulousKeyedMd5 => "Meticulous keyed MD5",
            AuthType::KeyedSha1 => "Keyed SHA1",
            AuthType::MeticulousKeyedSha1 => "Meticulous keyed SHA1",
        }
    }
}

/// Per-instance receive and transmit error tallies.
#[derive(
    Debug, Default, Clone, Copy, Serialize, Deserialize, JsonSchema,
)]
pub struct Counters {
    pub rx_dropped: u64,
    pub rx_auth_failed: u64,
    pub tx_errors: u64,
}

pub(crate) struct DaemonState {
    pub(crate) reg: Mutex<Registry>,
}

/// The BFD subsystem: a registry of protocol instances plus the request
/// API. Requests outlive instances; ones no instance accepts wait until
/// one shows up.
pub struct Daemon {
    state: Arc<DaemonState>,
    log: Logger,
}

impl Daemon {
    pub fn new(log: Logger) -> Self {
        Self {
            state: Arc::new(DaemonState {
                reg: Mutex::new(Registry::new()),
            }),
            log,
        }
    }

    /// Ask for a liveness probe to `(addr, local, link, vrf)`. The first
    /// instance that accepts the target claims the request; otherwise it
    /// parks on the wait list reporting AdminDown. The hook, if any, fires
    /// on every observed state change after this call returns; current
    /// state is always readable off the handle.
    pub fn request_session(
        &self,
        addr: IpAddr,
        local: IpAddr,
        link: Option<Link>,
        vrf: Option<u32>,
        hook: Option<RequestHook>,
        opts: Option<SessionOpts>,
    ) -> SessionRequest {
        let target = RequestTarget {
            addr,
            local,
            link,
            vrf,
        };
        let (id, shared, deferred) = {
            let mut reg = lock!(self.state.reg);
            let (id, shared) = reg.create(target, opts.unwrap_or_default());
            let deferred = reg.submit(&self.log, id);
            (id, shared, deferred)
        };
        fire_deferred(deferred);

        let request =
            SessionRequest::new(id, Arc::downgrade(&self.state), shared);
        if hook.is_some() {
            request.set_hook(hook);
        }
        request
    }

    /// Start a protocol instance: spawn its protocol and notification
    /// threads, absorb any waiting requests it accepts, and start its
    /// static neighbors.
    pub fn add_instance(
        &self,
        name: &str,
        cf: InstanceConfig,
        factory: Box<dyn SocketFactory>,
    ) -> Result<Arc<Instance>, Error> {
        let mut entries: Vec<NeighborEntry> = Vec::new();
        for n in &cf.neighbors {
            if entries.iter().any(|e| e.cf.addr == n.addr) {
                slog::error!(self.log, "duplicate neighbor {}", n.addr;
                    "instance" => name);
                continue;
            }
            entries.push(NeighborEntry {
                cf: n.clone(),
                req: None,
                active: false,
            });
        }

        let (instance, kick_rx) = {
            let mut reg = lock!(self.state.reg);
            if reg.instances.iter().any(|(_, i)| i.name() == name) {
                return Err(Error::InstanceExists(name.to_string()));
            }
            let id = reg.next_inst;
            reg.next_inst += 1;
            let (instance, kick_rx) =
                Instance::new(name, id, cf, factory, self.log.clone());
            reg.instances.push((id, instance.clone()));
            (instance, kick_rx)
        };
        *lock!(instance.neighbors) = entries;

        // The control-side notification thread for this instance. It holds
        // weak references only, so instance teardown is not kept alive by
        // its own notifier.
        let state_weak = Arc::downgrade(&self.state);
        let instance_weak = Arc::downgrade(&instance);
        std::thread::spawn(move || {
            while kick_rx.recv().is_ok() {
                let (Some(state), Some(instance)) =
                    (state_weak.upgrade(), instance_weak.upgrade())
                else {
                    break;
                };
                drain_notifications(&state, &instance);
            }
        });

        // Adopt waiting requests this instance accepts.
        let deferred = {
            let mut reg = lock!(self.state.reg);
            let waiting: Vec<ReqId> = reg.wait_list.clone();
            let mut deferred = Vec::new();
            for rid in waiting {
                if let Some(n) = reg.try_attach(
                    instance.id(),
                    &instance,
                    rid,
                    &self.log,
                ) {
                    deferred.push(n);
                }
            }
            deferred
        };
        fire_deferred(deferred);

        {
            let mut neighbors = lock!(instance.neighbors);
            for entry in neighbors.iter_mut() {
                if !entry.active {
                    self.start_neighbor(&instance, entry);
                }
            }
        }

        Ok(instance)
    }

    /// Shut an instance down: stop its neighbors, push its requests back
    /// through submission (another instance or the wait list), then stop
    /// the protocol thread and release its sessions and sockets.
    pub fn remove_instance(&self, name: &str) -> Result<(), Error> {
        let instance = {
            let mut reg = lock!(self.state.reg);
            let pos = reg
                .instances
                .iter()
                .position(|(_, i)| i.name() == name)
                .ok_or_else(|| Error::NoSuchInstance(name.to_string()))?;
            let (_, instance) = reg.instances.remove(pos);
            instance
        };

        {
            let mut neighbors = lock!(instance.neighbors);
            for entry in neighbors.iter_mut() {
                entry.req = None;
                entry.active = false;
            }
        }

        let deferred = {
            let mut reg = lock!(self.state.reg);
            let inst_id = instance.id();
            let rids: Vec<ReqId> = reg
                .attachments
                .iter()
                .filter(|((i, _), _)| *i == inst_id)
                .flat_map(|(_, a)| a.reqs.clone())
                .collect();
            let mut deferred = Vec::new();
            for rid in rids {
                deferred.extend(reg.submit(&self.log, rid));
            }
            deferred
        };
        fire_deferred(deferred);

        instance.stop();
        Ok(())
    }

    /// Swap in a new configuration for an instance. Acceptance flags are
    /// frozen; a change there rejects the configuration and keeps the old
    /// one running. Sessions on interfaces whose configuration materially
    /// changed get their parameters reapplied using the current
    /// requester's overrides; the neighbor list is diffed, carrying over
    /// unchanged entries.
    pub fn reconfigure_instance(
        &self,
        name: &str,
        new_cf: InstanceConfig,
    ) -> Result<(), Error> {
        let new_neighbors = new_cf.neighbors.clone();
        let instance = {
            let reg = lock!(self.state.reg);
            let (inst_id, instance) = reg
                .instances
                .iter()
                .find(|(_, i)| i.name() == name)
                .cloned()
                .ok_or_else(|| Error::NoSuchInstance(name.to_string()))?;

            let mut head_opts: HashMap<u32, SessionOpts> = HashMap::new();
            for ((i, loc_id), att) in reg.attachments.iter() {
                if *i != inst_id {
                    continue;
                }
                if let Some(rid) = att.reqs.first() {
                    if let Some(e) = reg.requests.get(rid) {
                        head_opts.insert(*loc_id, e.opts.clone());
                    }
                }
            }

            instance.reconfigure(new_cf, &head_opts)?;
            instance
        };

        self.reconfigure_neighbors(&instance, &new_neighbors);
        Ok(())
    }

    /// Nexthop resolution changed for a directly connected neighbor:
    /// start its internal request when it became reachable, drop it when
    /// it stopped being.
    pub fn neigh_notify(
        &self,
        instance: &Arc<Instance>,
        addr: IpAddr,
        resolvable: bool,
        local: Option<IpAddr>,
    ) {
        let mut neighbors = lock!(instance.neighbors);
        let Some(entry) = neighbors
            .iter_mut()
            .find(|e| e.cf.addr == addr && !e.cf.multihop)
        else {
            return;
        };

        if resolvable && entry.req.is_none() {
            let local = local
                .or(entry.cf.local)
                .unwrap_or_else(|| unspecified(addr));
            entry.req = Some(self.request_session(
                addr,
                local,
                entry.cf.link.clone(),
                instance.vrf(),
                None,
                None,
            ));
        }
        if !resolvable {
            entry.req = None;
        }
    }

    fn start_neighbor(
        &self,
        instance: &Arc<Instance>,
        entry: &mut NeighborEntry,
    ) {
        entry.active = true;

        if entry.cf.multihop {
            let local = entry
                .cf
                .local
                .unwrap_or_else(|| unspecified(entry.cf.addr));
            entry.req = Some(self.request_session(
                entry.cf.addr,
                local,
                None,
                instance.vrf(),
                None,
                None,
            ));
            return;
        }

        slog::debug!(self.log, "waiting for {} to become reachable",
            entry.cf.addr; "instance" => instance.name());
    }

    fn reconfigure_neighbors(
        &self,
        instance: &Arc<Instance>,
        new: &[NeighborConfig],
    ) {
        let mut neighbors = lock!(instance.neighbors);
        let old = std::mem::take(&mut *neighbors);

        let mut next: Vec<NeighborEntry> = Vec::new();
        for n in new {
            if next.iter().any(|e| e.cf.addr == n.addr) {
                slog::error!(self.log, "duplicate neighbor {}", n.addr;
                    "instance" => instance.name());
                continue;
            }
            next.push(NeighborEntry {
                cf: n.clone(),
                req: None,
                active: false,
            });
        }

        for old_entry in old {
            if let Some(entry) = next
                .iter_mut()
                .find(|e| same_neighbor(&e.cf, &old_entry.cf))
            {
                entry.req = old_entry.req;
                entry.active = old_entry.active;
            }
            // Entries with no match drop here, stopping their requests.
        }

        for entry in next.iter_mut() {
            if !entry.active {
                self.start_neighbor(instance, entry);
            }
        }

        *neighbors = next;
    }
}

fn unspecified(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}
