// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One protocol instance: a dedicated protocol thread running the timer
//! loop and receive path over its [`Core`], entered by the control plane
//! through a per-instance mutex. Holding that mutex suspends timer hooks,
//! so control-plane mutations are atomic with respect to the protocol
//! logic; every mutation ends with a kick so the loop recomputes its sleep.

use crate::config::{InstanceConfig, SessionOpts};
use crate::engine::Core;
use crate::lock;
use crate::neighbor::NeighborEntry;
use crate::notify::{NotifyBridge, SessionShared};
use crate::packet;
use crate::request::RequestTarget;
use crate::timer::Clock;
use crate::transport::SocketFactory;
use crate::{AuthType, Counters, Diag, Error, State};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

pub(crate) enum LoopEvent {
    Rx {
        src: IpAddr,
        ifindex: u32,
        pkt: packet::Control,
    },
    Kick,
    Stop,
}

pub(crate) struct InstanceShared {
    pub core: Mutex<Core>,
}

/// A running BFD protocol instance.
pub struct Instance {
    name: String,
    id: u64,
    shared: Arc<InstanceShared>,
    loop_tx: Sender<LoopEvent>,
    notify: Arc<NotifyBridge>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) neighbors: Mutex<Vec<NeighborEntry>>,
    log: Logger,
}

impl Instance {
    /// Build the instance and start its protocol thread. The returned
    /// receiver is the notification wakeup the daemon's control side
    /// drains.
    pub(crate) fn new(
        name: &str,
        id: u64,
        cf: InstanceConfig,
        factory: Box<dyn SocketFactory>,
        log: Logger,
    ) -> (Arc<Self>, Receiver<()>) {
        let (loop_tx, loop_rx) = channel();
        let (kick_tx, kick_rx) = channel();
        let notify = Arc::new(NotifyBridge::new(kick_tx));
        let core = Core::new(cf, factory, notify.clone(), log.clone());
        let clock = core.clock;
        let shared = Arc::new(InstanceShared {
            core: Mutex::new(core),
        });

        let loop_shared = shared.clone();
        let loop_log = log.clone();
        let thread =
            spawn(move || run_loop(loop_shared, loop_rx, clock, loop_log));

        let instance = Arc::new(Self {
            name: name.to_string(),
            id,
            shared,
            loop_tx,
            notify,
            thread: Mutex::new(Some(thread)),
            neighbors: Mutex::new(Vec::new()),
            log,
        });
        (instance, kick_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn vrf(&self) -> Option<u32> {
        lock!(self.shared.core).cf.vrf
    }

    /// Whether this instance takes responsibility for a request target.
    pub(crate) fn accepts(&self, target: &RequestTarget) -> bool {
        let core = lock!(self.shared.core);
        let cf = &core.cf;
        if cf.vrf.is_some() && cf.vrf != target.vrf {
            return false;
        }
        if target.addr.is_ipv4() {
            if !cf.accept_ipv4 {
                return false;
            }
        } else if !cf.accept_ipv6 {
            return false;
        }
        if target.link.is_some() {
            cf.accept_direct
        } else {
            cf.accept_multihop
        }
    }

    /// Look up the session for a request target, creating it if needed.
    pub(crate) fn find_or_add_session(
        &self,
        target: &RequestTarget,
        opts: &SessionOpts,
    ) -> Result<(u32, Arc<SessionShared>), Error> {
        let result = {
            let mut core = lock!(self.shared.core);
            let ifindex =
                target.link.as_ref().map(|l| l.index).unwrap_or(0);
            let loc_id = match core.find_by_peer(target.addr, ifindex) {
                Some(id) => id,
                None => core.add_session(
                    target.addr,
                    target.local,
                    target.link.as_ref(),
                    opts,
                )?,
            };
            match core.session_shared(loc_id) {
                Some(shared) => (loc_id, shared),
                None => {
                    return Err(Error::InvalidConfig(
                        "session lookup after insert failed".into(),
                    ))
                }
            }
        };
        self.kick();
        Ok(result)
    }

    pub(crate) fn remove_session(&self, loc_id: u32) {
        lock!(self.shared.core).remove_session(loc_id);
        self.kick();
    }

    pub(crate) fn reconfigure_session(
        &self,
        loc_id: u32,
        opts: &SessionOpts,
    ) {
        lock!(self.shared.core).reconfigure_session(loc_id, opts);
        self.kick();
    }

    /// Apply a new configuration. Everything happens under one hold of the
    /// entry mutex, so sessions observe the new interface configuration
    /// atomically; acceptance-flag changes reject the whole thing and keep
    /// the old configuration running.
    pub(crate) fn reconfigure(
        &self,
        new_cf: InstanceConfig,
        head_opts: &HashMap<u32, SessionOpts>,
    ) -> Result<(), Error> {
        {
            let mut core = lock!(self.shared.core);
            if !core.cf.same_acceptance(&new_cf) {
                return Err(Error::InvalidConfig(
                    "acceptance flags cannot change across reconfiguration"
                        .into(),
                ));
            }
            core.reconfigure(new_cf, head_opts);
        }
        self.kick();
        Ok(())
    }

    /// Ingress for the packet layer: queue a validated control packet for
    /// the protocol thread.
    pub fn rx_ctl(&self, src: IpAddr, ifindex: u32, pkt: packet::Control) {
        let _ = self.loop_tx.send(LoopEvent::Rx { src, ifindex, pkt });
    }

    pub(crate) fn kick(&self) {
        let _ = self.loop_tx.send(LoopEvent::Kick);
    }

    pub(crate) fn notify_take(
        &self,
    ) -> Vec<(u32, crate::notify::Snapshot)> {
        self.notify.take()
    }

    /// Stop the protocol thread, wait for it to drain, and release the
    /// sessions and their sockets.
    pub(crate) fn stop(&self) {
        let _ = self.loop_tx.send(LoopEvent::Stop);
        if let Some(handle) = lock!(self.thread).take() {
            let _ = handle.join();
        }
        lock!(self.shared.core).clear_sessions();
        slog::debug!(self.log, "instance stopped";
            "instance" => format_args!("{}", self.name));
    }

    pub fn counters(&self) -> Counters {
        lock!(self.shared.core).counters
    }

    /// Display snapshots of every session. This takes the entry mutex
    /// briefly; the protocol thread is paused for the duration of the
    /// copy.
    pub fn session_infos(&self) -> Vec<SessionInfo> {
        let core = lock!(self.shared.core);
        let now = core.clock.now();
        core.sessions().map(|s| session_info(s, now)).collect()
    }
}

fn us(v: u32) -> Duration {
    Duration::from_micros(v as u64)
}

fn session_info(s: &crate::session::Session, now: Duration) -> SessionInfo {
    SessionInfo {
        addr: s.addr,
        ifindex: s.ifindex,
        multihop: s.ifindex == 0,
        loc_state: s.loc_state,
        rem_state: s.rem_state,
        loc_diag: s.loc_diag,
        rem_diag: s.rem_diag,
        loc_id: s.loc_id,
        rem_id: s.rem_id,
        since_state_change: now.saturating_sub(s.last_state_change),
        tx_interval: if s.last_tx.is_some() {
            us(s.tx_int())
        } else {
            Duration::ZERO
        },
        detection_time: s.detection_time(),
        tx_remains: s.tx_timer.active().then(|| s.tx_timer.remains(now)),
        detect_remains: s
            .hold_timer
            .active()
            .then(|| s.hold_timer.remains(now)),
        des_min_tx: us(s.des_min_tx_int),
        req_min_rx: us(s.req_min_rx_int),
        rem_min_tx: us(s.rem_min_tx_int),
        rem_min_rx: us(s.rem_min_rx_int),
        detect_mult: s.detect_mult,
        rem_detect_mult: s.rem_detect_mult,
        rem_demand_mode: s.rem_demand_mode,
        passive: s.passive,
        auth_type: s.cf.auth_type,
        tx_csn: s.tx_csn,
        rx_csn: s.rx_csn_known.then_some(s.rx_csn),
    }
}

/// A point-in-time view of one session for display and management APIs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    pub addr: IpAddr,
    pub ifindex: u32,
    pub multihop: bool,
    pub loc_state: State,
    pub rem_state: State,
    pub loc_diag: Diag,
    pub rem_diag: Diag,
    pub loc_id: u32,
    pub rem_id: u32,
    pub since_state_change: Duration,
    pub tx_interval: Duration,
    pub detection_time: Duration,
    pub tx_remains: Option<Duration>,
    pub detect_remains: Option<Duration>,
    pub des_min_tx: Duration,
    pub req_min_rx: Duration,
    pub rem_min_tx: Duration,
    pub rem_min_rx: Duration,
    pub detect_mult: u8,
    pub rem_detect_mult: u8,
    pub rem_demand_mode: bool,
    pub passive: bool,
    pub auth_type: AuthType,
    pub tx_csn: u32,
    pub rx_csn: Option<u32>,
}

/// The protocol thread: fire due timers under the entry mutex, sleep until
/// the next deadline or an event, feed received packets to the core.
fn run_loop(
    shared: Arc<InstanceShared>,
    rx: Receiver<LoopEvent>,
    clock: Clock,
    log: Logger,
) {
    loop {
        let next = {
            let mut core = lock!(shared.core);
            core.fire_timers(clock.now());
            core.next_deadline()
        };

        let event = match next {
            Some(deadline) => {
                let wait = deadline.saturating_sub(clock.now());
                match rx.recv_timeout(wait) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        match event {
            LoopEvent::Rx { src, ifindex, pkt } => {
                lock!(shared.core).rx_ctl(src, ifindex, &pkt);
            }
            LoopEvent::Kick => {}
            LoopEvent::Stop => break,
        }
    }
    slog::debug!(log, "protocol loop stopped");
}
