// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Everything the protocol thread owns: the session arena with its two
//! indexes, the interface pool, the receive path, packet emission, and
//! timer dispatch. `Core` is only ever touched under the instance entry
//! mutex, so methods take `&mut self` and stay lock-free internally.

use crate::config::{merge_options, InstanceConfig, SessionOpts};
use crate::iface::{Iface, IfaceId, Link};
use crate::notify::{NotifyBridge, SessionShared};
use crate::packet::{self, csn_window_ok, AuthData};
use crate::session::Session;
use crate::timer::Clock;
use crate::transport::SocketFactory;
use crate::{trc, wrn, AuthType, Counters, Diag, Error, State};
use slog::Logger;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

enum TimerKind {
    Tx,
    Hold,
}

pub(crate) struct Core {
    pub cf: InstanceConfig,
    pub clock: Clock,
    pub counters: Counters,

    /// Sessions keyed by local discriminator; `by_peer` is the second
    /// index, by remote address and interface index.
    sessions: HashMap<u32, Session>,
    by_peer: HashMap<(IpAddr, u32), u32>,

    ifaces: Vec<Option<Iface>>,

    factory: Box<dyn SocketFactory>,
    notify: Arc<NotifyBridge>,
    log: Logger,
}

impl Core {
    pub fn new(
        cf: InstanceConfig,
        factory: Box<dyn SocketFactory>,
        notify: Arc<NotifyBridge>,
        log: Logger,
    ) -> Self {
        Self {
            cf,
            clock: Clock::new(),
            counters: Counters::default(),
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            ifaces: Vec::new(),
            factory,
            notify,
            log,
        }
    }

    pub fn find_by_peer(&self, addr: IpAddr, ifindex: u32) -> Option<u32> {
        self.by_peer.get(&(addr, ifindex)).copied()
    }

    pub fn session_shared(&self, loc_id: u32) -> Option<Arc<SessionShared>> {
        self.sessions.get(&loc_id).map(|s| s.shared.clone())
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    #[cfg(test)]
    pub fn session(&self, loc_id: u32) -> Option<&Session> {
        self.sessions.get(&loc_id)
    }

    #[cfg(test)]
    pub fn session_mut(&mut self, loc_id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&loc_id)
    }

    /// Pick an unused nonzero discriminator, probing upward from a random
    /// seed.
    fn get_free_id(&self) -> u32 {
        let mut id: u32 = rand::random();
        loop {
            if id != 0 && !self.sessions.contains_key(&id) {
                return id;
            }
            id = id.wrapping_add(1);
        }
    }

    /// Find or create the interface pool entry for `(local, link)`,
    /// bumping its reference count.
    fn get_iface(
        &mut self,
        local: IpAddr,
        link: Option<&Link>,
    ) -> Result<IfaceId, Error> {
        for (i, slot) in self.ifaces.iter_mut().enumerate() {
            if let Some(ifa) = slot {
                if ifa.matches(local, link) {
                    ifa.uc += 1;
                    return Ok(IfaceId(i));
                }
            }
        }

        let cf = self.cf.iface_config(link);
        let tx = self.factory.open_tx(local, link)?;
        let rx = if self.cf.strict_bind {
            Some(self.factory.open_rx(local, link)?)
        } else {
            None
        };
        let ifa = Iface {
            local,
            link: link.cloned(),
            cf,
            uc: 1,
            changed: false,
            tx,
            rx,
        };

        match self.ifaces.iter().position(|s| s.is_none()) {
            Some(i) => {
                self.ifaces[i] = Some(ifa);
                Ok(IfaceId(i))
            }
            None => {
                self.ifaces.push(Some(ifa));
                Ok(IfaceId(self.ifaces.len() - 1))
            }
        }
    }

    /// Drop one reference to an interface, closing its sockets when the
    /// last session is gone.
    fn free_iface(&mut self, id: IfaceId) {
        if let Some(slot) = self.ifaces.get_mut(id.0) {
            if let Some(ifa) = slot {
                ifa.uc -= 1;
                if ifa.uc == 0 {
                    *slot = None;
                }
            }
        }
    }

    pub fn add_session(
        &mut self,
        addr: IpAddr,
        local: IpAddr,
        link: Option<&Link>,
        opts: &SessionOpts,
    ) -> Result<u32, Error> {
        let ifa = self.get_iface(local, link)?;
        let icf = self
            .ifaces
            .get(ifa.0)
            .and_then(|o| o.as_ref())
            .map(|i| i.cf.clone())
            .unwrap_or_default();

        let loc_id = self.get_free_id();
        let ifindex = link.map(|l| l.index).unwrap_or(0);
        let now = self.clock.now();

        let mut s = Session::new(
            addr,
            ifindex,
            ifa,
            loc_id,
            merge_options(&icf, opts),
            now,
        );
        s.update_tx_interval();
        s.control_tx_timer(now, true);
        s.sync_shared(&self.notify);

        self.by_peer.insert((addr, ifindex), loc_id);
        self.sessions.insert(loc_id, s);

        trc!(self.log, State::Down, addr; "session added");

        Ok(loc_id)
    }

    /// Tear a session down. The caller must have detached all requests
    /// first.
    pub fn remove_session(&mut self, loc_id: u32) {
        let Some(s) = self.sessions.remove(&loc_id) else {
            return;
        };
        self.notify.unqueue(loc_id, &s.shared);
        self.free_iface(s.ifa);
        self.by_peer.remove(&(s.addr, s.ifindex));

        trc!(self.log, s.loc_state, s.addr; "session removed");
    }

    /// Release every session and with them the interface pool. Used on
    /// instance shutdown, after the protocol thread has stopped.
    pub fn clear_sessions(&mut self) {
        let ids: Vec<u32> = self.sessions.keys().copied().collect();
        for id in ids {
            self.remove_session(id);
        }
    }

    /// Re-merge a session's configuration from its interface and the
    /// current requester's overrides, then reapply the negotiable
    /// parameters through the usual poll-sequence machinery.
    pub fn reconfigure_session(&mut self, loc_id: u32, opts: &SessionOpts) {
        let now = self.clock.now();
        let Some(s) = self.sessions.get(&loc_id) else {
            return;
        };
        let icf = self
            .ifaces
            .get(s.ifa.0)
            .and_then(|o| o.as_ref())
            .map(|i| i.cf.clone())
            .unwrap_or_default();

        let Some(s) = self.sessions.get_mut(&loc_id) else {
            return;
        };
        s.cf = merge_options(&icf, opts);

        let tx = if s.loc_state == State::Up {
            s.cf.min_tx_int
        } else {
            s.cf.idle_tx_int
        };
        let rx = s.cf.min_rx_int;
        s.set_min_tx(now, tx);
        s.set_min_rx(now, rx);
        s.detect_mult = s.cf.multiplier;
        s.passive = s.cf.passive;

        s.control_tx_timer(now, false);

        trc!(self.log, s.loc_state, s.addr; "session reconfigured");
    }

    /// Apply a validated new configuration: swap each interface's
    /// configuration, marking the materially changed ones, then reapply
    /// parameters on their sessions. `head_opts` carries the current
    /// requester's overrides per session; sessions without a requester are
    /// left alone.
    pub fn reconfigure(
        &mut self,
        new_cf: InstanceConfig,
        head_opts: &HashMap<u32, SessionOpts>,
    ) {
        for slot in self.ifaces.iter_mut() {
            if let Some(ifa) = slot {
                let nc = new_cf.iface_config(ifa.link.as_ref());
                ifa.changed = nc != ifa.cf;
                ifa.cf = nc;
            }
        }

        let ids: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                self.ifaces
                    .get(s.ifa.0)
                    .and_then(|o| o.as_ref())
                    .map(|i| i.changed)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            if let Some(opts) = head_opts.get(&id) {
                self.reconfigure_session(id, opts);
            }
        }

        self.cf = new_cf;
    }

    /// The receive path. The codec already validated the header; here the
    /// packet is demultiplexed, authenticated, its remote parameters
    /// applied, and the state machine driven.
    pub fn rx_ctl(&mut self, src: IpAddr, ifindex: u32, pkt: &packet::Control) {
        let loc_id = if pkt.your_discriminator != 0 {
            if self.sessions.contains_key(&pkt.your_discriminator) {
                pkt.your_discriminator
            } else {
                self.counters.rx_dropped += 1;
                trc!(self.log, pkt.state(), src;
                    "no session for discriminator {}", pkt.your_discriminator);
                return;
            }
        } else {
            // A packet not yet demultiplexed by discriminator may only
            // carry Down or AdminDown state.
            match pkt.state() {
                State::Down | State::AdminDown => {}
                state => {
                    self.counters.rx_dropped += 1;
                    trc!(self.log, state, src; "invalid initial packet");
                    return;
                }
            }
            match self.find_by_peer(src, ifindex) {
                Some(id) => id,
                None => {
                    self.counters.rx_dropped += 1;
                    trc!(self.log, pkt.state(), src; "no session for peer");
                    return;
                }
            }
        };

        let Some(s) = self.sessions.get_mut(&loc_id) else {
            return;
        };

        if !auth_rx_ok(s, pkt) {
            self.counters.rx_auth_failed += 1;
            wrn!(self.log, s.loc_state, src; "authentication failed");
            return;
        }

        let old_tx_int = s.des_min_tx_int;
        let old_rx_int = s.rem_min_rx_int;

        s.rem_state = pkt.state();
        s.rem_diag = pkt.diag();
        s.rem_demand_mode = pkt.demand();
        s.rem_id = pkt.my_discriminator;
        s.rem_detect_mult = pkt.detect_mult;
        s.rem_min_tx_int = pkt.desired_min_tx;
        s.rem_min_rx_int = pkt.required_min_rx;
        s.sync_shared(&self.notify);

        self.process_ctl(loc_id, pkt.poll(), pkt.is_final(), old_tx_int, old_rx_int);
    }

    /// Evaluate an accepted control packet against the session: close out a
    /// poll on Final, reschedule timers for interval movement, advance the
    /// state machine, and answer a Poll immediately, outside the TX
    /// cadence. `old_tx_int`/`old_rx_int` are the values before the packet
    /// was applied.
    pub fn process_ctl(
        &mut self,
        loc_id: u32,
        poll: bool,
        is_final: bool,
        old_tx_int: u32,
        old_rx_int: u32,
    ) {
        let now = self.clock.now();
        {
            let Some(s) = self.sessions.get_mut(&loc_id) else {
                return;
            };

            if s.poll_active != 0 && is_final {
                s.terminate_poll();
            }

            if s.des_min_tx_int != old_tx_int || s.rem_min_rx_int != old_rx_int
            {
                s.update_tx_interval();
            }

            s.update_detection_time(now, true);

            if s.loc_state == State::AdminDown {
                return;
            }

            if let Some((next, diag)) = s.next_state() {
                s.update_state(now, next, diag, &self.notify, &self.log);
            }

            s.control_tx_timer(now, false);
        }

        if poll {
            self.send_ctl(loc_id, true);
        }
    }

    /// Detection time expired: drop everything learned from the peer and
    /// restart transmission at the idle cadence.
    pub fn hold_timeout(&mut self, loc_id: u32) {
        let now = self.clock.now();
        let Some(s) = self.sessions.get_mut(&loc_id) else {
            return;
        };

        trc!(self.log, s.loc_state, s.addr; "session expired");

        s.clear_remote();
        s.sync_shared(&self.notify);
        s.update_state(now, State::Down, Diag::Timeout, &self.notify, &self.log);
        s.control_tx_timer(now, true);
    }

    /// Emit one control packet for a session, with or without the Final
    /// bit. Send failures are transient: log, count, and let the TX timer
    /// keep firing.
    pub fn send_ctl(&mut self, loc_id: u32, is_final: bool) {
        let now = self.clock.now();
        let (pkt, dst, ifa, state) = {
            let Some(s) = self.sessions.get_mut(&loc_id) else {
                return;
            };
            if s.cf.auth_type.uses_csn() {
                if s.cf.auth_type.meticulous() {
                    s.tx_csn = s.tx_csn.wrapping_add(1);
                } else {
                    let bump = match s.tx_csn_time {
                        Some(t) => now >= t + Duration::from_secs(1),
                        None => true,
                    };
                    if bump {
                        s.tx_csn = s.tx_csn.wrapping_add(1);
                        s.tx_csn_time = Some(now);
                    }
                }
            }
            (s.make_ctl(is_final), s.addr, s.ifa, s.loc_state)
        };

        let Some(ifa) = self.ifaces.get(ifa.0).and_then(|o| o.as_ref()) else {
            return;
        };
        if let Err(e) = ifa.tx.send_ctl(dst, &pkt) {
            self.counters.tx_errors += 1;
            wrn!(self.log, state, dst; "send: {e}");
        }
    }

    /// Fire every due timer. TX firings stamp `last_tx` and emit; hold
    /// firings run the detection timeout.
    pub fn fire_timers(&mut self, now: Duration) {
        let mut due: Vec<(u32, TimerKind)> = Vec::new();
        for (id, s) in &self.sessions {
            if s.tx_timer.due(now) {
                due.push((*id, TimerKind::Tx));
            }
            if s.hold_timer.due(now) {
                due.push((*id, TimerKind::Hold));
            }
        }

        for (id, kind) in due {
            match kind {
                TimerKind::Tx => {
                    let fired = match self.sessions.get_mut(&id) {
                        Some(s) => {
                            let fired = s.tx_timer.fire(now);
                            if fired {
                                s.last_tx = Some(now);
                            }
                            fired
                        }
                        None => false,
                    };
                    if fired {
                        self.send_ctl(id, false);
                    }
                }
                TimerKind::Hold => {
                    let fired = match self.sessions.get_mut(&id) {
                        Some(s) => s.hold_timer.fire(now),
                        None => false,
                    };
                    if fired {
                        self.hold_timeout(id);
                    }
                }
            }
        }
    }

    /// Earliest pending timer deadline across all sessions, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.sessions
            .values()
            .flat_map(|s| {
                [s.tx_timer.deadline(), s.hold_timer.deadline()]
            })
            .flatten()
            .min()
    }
}

/// Validate a packet's authentication section against the session
/// configuration. Digest contents are opaque here; the transport verifies
/// MACs before delivery. On success the receive sequence number is
/// advanced.
fn auth_rx_ok(s: &mut Session, pkt: &packet::Control) -> bool {
    let cfg_type = s.cf.auth_type;
    let Some(auth) = &pkt.auth else {
        return cfg_type == AuthType::None && !pkt.authentication_present();
    };
    if auth.auth_type != cfg_type {
        return false;
    }
    match &auth.data {
        AuthData::Password(p) => s
            .cf
            .keys
            .iter()
            .any(|k| k.id == auth.key_id && k.secret == *p),
        AuthData::Keyed { csn, .. } => {
            if !s.cf.keys.iter().any(|k| k.id == auth.key_id) {
                return false;
            }
            if s.rx_csn_known
                && !csn_window_ok(
                    s.rx_csn,
                    *csn,
                    s.detect_mult,
                    cfg_type.meticulous(),
                )
            {
                return false;
            }
            s.rx_csn = *csn;
            s.rx_csn_known = true;
            true
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{AuthKey, IfaceConfig};
    use crate::packet::{Auth, Control};
    use crate::transport::{ChannelFactory, Wire};
    use pretty_assertions::assert_eq;
    use std::sync::mpsc::{channel, Receiver};

    const PEER: &str = "203.0.113.20";
    const LOCAL: &str = "203.0.113.10";

    fn test_config() -> InstanceConfig {
        InstanceConfig {
            multihop: Some(IfaceConfig {
                min_rx_int: 20_000,
                min_tx_int: 20_000,
                idle_tx_int: 100_000,
                multiplier: 3,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn test_core(cf: InstanceConfig) -> (Core, Receiver<Wire>, Receiver<()>) {
        let (hub_tx, hub_rx) = channel();
        let (kick_tx, kick_rx) = channel();
        let core = Core::new(
            cf,
            Box::new(ChannelFactory::new(hub_tx)),
            Arc::new(NotifyBridge::new(kick_tx)),
            crate::log::build_logger(std::io::sink()),
        );
        (core, hub_rx, kick_rx)
    }

    fn peer_pkt(state: State, your_disc: u32) -> Control {
        let mut pkt = Control {
            detect_mult: 3,
            my_discriminator: 0x9999,
            your_discriminator: your_disc,
            desired_min_tx: 20_000,
            required_min_rx: 20_000,
            ..Default::default()
        };
        pkt.set_state(state);
        pkt
    }

    fn add_test_session(core: &mut Core) -> u32 {
        core.add_session(
            PEER.parse().unwrap(),
            LOCAL.parse().unwrap(),
            None,
            &SessionOpts::default(),
        )
        .unwrap()
    }

    fn establish(core: &mut Core) -> u32 {
        let id = add_test_session(core);
        core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(State::Down, 0));
        core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(State::Init, id));
        assert_eq!(core.session(id).unwrap().loc_state, State::Up);
        id
    }

    #[test]
    fn test_add_session_initializes_and_indexes() {
        let (mut core, _hub, _kick) = test_core(test_config());
        let id = add_test_session(&mut core);

        let s = core.session(id).unwrap();
        assert_ne!(s.loc_id, 0);
        assert_eq!(s.loc_state, State::Down);
        assert_eq!(s.cf.multiplier, 3);
        assert_eq!(s.des_min_tx_int, 100_000);
        assert_eq!(core.find_by_peer(PEER.parse().unwrap(), 0), Some(id));
        assert!(s.tx_timer.active());
        assert!(!s.hold_timer.active());
    }

    #[test]
    fn test_unique_discriminators() {
        let (mut core, _hub, _kick) = test_core(test_config());
        let mut seen = std::collections::HashSet::new();
        for i in 0..32u32 {
            let addr: IpAddr = format!("203.0.113.{}", 100 + i).parse().unwrap();
            let id = core
                .add_session(addr, LOCAL.parse().unwrap(), None, &Default::default())
                .unwrap();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
            assert_eq!(core.find_by_peer(addr, 0), Some(id));
        }
    }

    #[test]
    fn test_bring_up() {
        let (mut core, _hub, kick) = test_core(test_config());
        let id = add_test_session(&mut core);

        core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(State::Down, 0));
        let s = core.session(id).unwrap();
        assert_eq!(s.loc_state, State::Init);
        assert_eq!(s.rem_id, 0x9999);
        assert_eq!(s.rem_min_tx_int, 20_000);
        assert!(s.hold_timer.active());

        core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(State::Init, id));
        let s = core.session(id).unwrap();
        assert_eq!(s.loc_state, State::Up);
        assert_eq!(s.loc_diag, Diag::Nothing);
        // Up: transmit at the negotiated rate, not the idle rate.
        assert_eq!(s.des_min_tx_int, 20_000);

        // Both transitions were posted to the control plane.
        assert!(kick.try_recv().is_ok());
    }

    #[test]
    fn test_initial_packet_must_be_down() {
        let (mut core, _hub, _kick) = test_core(test_config());
        let id = add_test_session(&mut core);

        core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(State::Up, 0));
        assert_eq!(core.session(id).unwrap().loc_state, State::Down);
        assert_eq!(core.counters.rx_dropped, 1);
    }

    #[test]
    fn test_unknown_peer_dropped() {
        let (mut core, _hub, _kick) = test_core(test_config());
        core.rx_ctl("198.51.100.1".parse().unwrap(), 0, &peer_pkt(State::Down, 0));
        assert_eq!(core.counters.rx_dropped, 1);
    }

    #[test]
    fn test_passive_waits_for_peer() {
        let mut cf = test_config();
        cf.multihop.as_mut().unwrap().passive = true;
        let (mut core, _hub, _kick) = test_core(cf);
        let id = add_test_session(&mut core);

        assert!(!core.session(id).unwrap().tx_timer.active());

        core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(State::Down, 0));
        let s = core.session(id).unwrap();
        assert_eq!(s.rem_id, 0x9999);
        assert!(s.tx_timer.active());
    }

    #[test]
    fn test_zero_remote_rx_stops_tx() {
        let (mut core, _hub, _kick) = test_core(test_config());
        let id = establish(&mut core);

        let mut pkt = peer_pkt(State::Up, id);
        pkt.required_min_rx = 0;
        core.rx_ctl(PEER.parse().unwrap(), 0, &pkt);
        assert!(!core.session(id).unwrap().tx_timer.active());
    }

    #[test]
    fn test_poll_answered_with_final() {
        let (mut core, hub, _kick) = test_core(test_config());
        let id = establish(&mut core);

        let mut pkt = peer_pkt(State::Up, id);
        pkt.set_poll();
        core.rx_ctl(PEER.parse().unwrap(), 0, &pkt);

        let wire = hub.try_recv().expect("a final response");
        assert!(wire.pkt.is_final());
        assert!(!wire.pkt.poll());
        assert_eq!(wire.dst, PEER.parse::<IpAddr>().unwrap());
        assert_eq!(wire.src, LOCAL.parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_poll_commit_on_final() {
        let (mut core, _hub, _kick) = test_core(test_config());
        let id = establish(&mut core);

        let now = core.clock.now();
        let s = core.session_mut(id).unwrap();
        s.set_min_tx(now, 200_000);
        assert_eq!(s.des_min_tx_int, 20_000);
        assert_eq!(s.des_min_tx_new, 200_000);

        let mut pkt = peer_pkt(State::Up, id);
        pkt.set_final();
        core.rx_ctl(PEER.parse().unwrap(), 0, &pkt);

        let s = core.session(id).unwrap();
        assert_eq!(s.des_min_tx_int, 200_000);
        assert_eq!(s.des_min_tx_new, 200_000);
        assert_eq!(s.poll_active, 0);
    }

    #[test]
    fn test_outgoing_poll_bit_while_negotiating() {
        let (mut core, hub, _kick) = test_core(test_config());
        let id = establish(&mut core);

        let now = core.clock.now();
        core.session_mut(id).unwrap().set_min_tx(now, 200_000);
        while hub.try_recv().is_ok() {}

        core.fire_timers(now + Duration::from_secs(60));
        let wire = hub.try_recv().expect("periodic packet");
        assert!(wire.pkt.poll());
        assert_eq!(wire.pkt.desired_min_tx, 200_000);
    }

    #[test]
    fn test_hold_timeout_clears_remote_state() {
        let (mut core, _hub, kick) = test_core(test_config());
        let id = establish(&mut core);
        while kick.try_recv().is_ok() {}

        let deadline =
            core.session(id).unwrap().hold_timer.deadline().unwrap();
        core.fire_timers(deadline);

        let s = core.session(id).unwrap();
        assert_eq!(s.loc_state, State::Down);
        assert_eq!(s.loc_diag, Diag::Timeout);
        assert_eq!(s.rem_state, State::Down);
        assert_eq!(s.rem_id, 0);
        assert_eq!(s.rem_min_tx_int, 0);
        assert_eq!(s.rem_min_rx_int, 1);
        assert_eq!(s.rem_detect_mult, 0);
        assert!(!s.rx_csn_known);
        assert_eq!(s.poll_active, 0);
        assert_eq!(s.poll_scheduled, 0);
        // TX restarts immediately at the idle cadence.
        assert!(s.tx_timer.active());
        assert_eq!(s.des_min_tx_new, 100_000);
        // The transition reached the control plane.
        assert!(kick.try_recv().is_ok());
    }

    #[test]
    fn test_admin_down_absorbs() {
        let (mut core, hub, kick) = test_core(test_config());
        let id = establish(&mut core);
        while kick.try_recv().is_ok() {}
        while hub.try_recv().is_ok() {}

        core.session_mut(id).unwrap().loc_state = State::AdminDown;

        for state in [State::Down, State::Init, State::Up] {
            core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(state, id));
            assert_eq!(core.session(id).unwrap().loc_state, State::AdminDown);
        }
        // No notifications, and polls are not answered while absorbed.
        assert!(kick.try_recv().is_err());
    }

    #[test]
    fn test_remove_session_clears_indexes() {
        let (mut core, _hub, _kick) = test_core(test_config());
        let id = add_test_session(&mut core);
        core.remove_session(id);
        assert!(core.session(id).is_none());
        assert_eq!(core.find_by_peer(PEER.parse().unwrap(), 0), None);

        // Packets for the dead session are dropped, not processed.
        core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(State::Down, 0));
        assert_eq!(core.counters.rx_dropped, 1);
    }

    #[test]
    fn test_reconfigure_session_applies_new_intervals() {
        let (mut core, _hub, _kick) = test_core(test_config());
        let id = establish(&mut core);

        let opts = SessionOpts {
            min_tx_int: Some(Duration::from_millis(50)),
            multiplier: Some(4),
            ..Default::default()
        };
        core.reconfigure_session(id, &opts);

        let s = core.session(id).unwrap();
        // Up and raising the interval: deferred to the poll sequence.
        assert_eq!(s.des_min_tx_new, 50_000);
        assert_eq!(s.des_min_tx_int, 20_000);
        assert_ne!(s.poll_active, 0);
        assert_eq!(s.detect_mult, 4);
    }

    #[test]
    fn test_password_auth() {
        let mut cf = test_config();
        {
            let m = cf.multihop.as_mut().unwrap();
            m.auth_type = AuthType::Simple;
            m.keys = vec![AuthKey {
                id: 1,
                secret: b"sesame".to_vec(),
            }];
        }
        let (mut core, _hub, _kick) = test_core(cf);
        let id = add_test_session(&mut core);

        // No auth section at all: rejected.
        core.rx_ctl(PEER.parse().unwrap(), 0, &peer_pkt(State::Down, 0));
        assert_eq!(core.counters.rx_auth_failed, 1);
        assert_eq!(core.session(id).unwrap().loc_state, State::Down);

        // Wrong password: rejected.
        let mut pkt = peer_pkt(State::Down, 0);
        pkt.attach_auth(Auth {
            auth_type: AuthType::Simple,
            key_id: 1,
            data: AuthData::Password(b"grapes".to_vec()),
        });
        core.rx_ctl(PEER.parse().unwrap(), 0, &pkt);
        assert_eq!(core.counters.rx_auth_failed, 2);

        // Right password: accepted and processed.
        let mut pkt = peer_pkt(State::Down, 0);
        pkt.attach_auth(Auth {
            auth_type: AuthType::Simple,
            key_id: 1,
            data: AuthData::Password(b"sesame".to_vec()),
        });
        core.rx_ctl(PEER.parse().unwrap(), 0, &pkt);
        assert_eq!(core.session(id).unwrap().loc_state, State::Init);
    }

    #[test]
    fn test_keyed_auth_csn_replay() {
        let mut cf = test_config();
        {
            let m = cf.multihop.as_mut().unwrap();
            m.auth_type = AuthType::MeticulousKeyedSha1;
            m.keys = vec![AuthKey {
                id: 1,
                secret: b"k".to_vec(),
            }];
        }
        let (mut core, _hub, _kick) = test_core(cf);
        let id = add_test_session(&mut core);

        let keyed = |csn: u32, state: State, your: u32| {
            let mut pkt = peer_pkt(state, your);
            pkt.attach_auth(Auth {
                auth_type: AuthType::MeticulousKeyedSha1,
                key_id: 1,
                data: AuthData::Keyed {
                    csn,
                    digest: vec![0; 20],
                },
            });
            pkt
        };

        core.rx_ctl(PEER.parse().unwrap(), 0, &keyed(1000, State::Down, 0));
        let s = core.session(id).unwrap();
        assert_eq!(s.loc_state, State::Init);
        assert!(s.rx_csn_known);
        assert_eq!(s.rx_csn, 1000);

        // Replayed sequence number: meticulous mode rejects it.
        core.rx_ctl(PEER.parse().unwrap(), 0, &keyed(1000, State::Init, id));
        assert_eq!(core.counters.rx_auth_failed, 1);
        assert_eq!(core.session(id).unwrap().loc_state, State::Init);

        core.rx_ctl(PEER.parse().unwrap(), 0, &keyed(1001, State::Init, id));
        assert_eq!(core.session(id).unwrap().loc_state, State::Up);
    }
}
