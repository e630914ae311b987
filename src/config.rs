// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::iface::Link;
use crate::AuthType;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Default minimum receive interval, 10 ms.
pub const DEFAULT_MIN_RX_INT: u32 = 10_000;
/// Default minimum transmit interval while up, 100 ms.
pub const DEFAULT_MIN_TX_INT: u32 = 100_000;
/// Default transmit interval while not up, 1 s.
pub const DEFAULT_IDLE_TX_INT: u32 = 1_000_000;
/// Default detection multiplier.
pub const DEFAULT_MULTIPLIER: u8 = 5;

/// An authentication key. Multiple keys may be active at once, selected by
/// id on receive.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct AuthKey {
    pub id: u8,
    pub secret: Vec<u8>,
}

/// Timing and authentication configuration for sessions on one interface
/// (or for all multihop sessions). Interval fields are in microseconds.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct IfaceConfig {
    pub min_rx_int: u32,
    pub min_tx_int: u32,
    pub idle_tx_int: u32,
    pub multiplier: u8,
    pub passive: bool,
    pub auth_type: AuthType,
    pub keys: Vec<AuthKey>,
}

impl Default for IfaceConfig {
    fn default() -> Self {
        Self {
            min_rx_int: DEFAULT_MIN_RX_INT,
            min_tx_int: DEFAULT_MIN_TX_INT,
            idle_tx_int: DEFAULT_IDLE_TX_INT,
            multiplier: DEFAULT_MULTIPLIER,
            passive: false,
            auth_type: AuthType::None,
            keys: Vec::new(),
        }
    }
}

/// The effective configuration of one session: the owning interface's
/// configuration with any per-request overrides folded in.
pub type SessionConfig = IfaceConfig;

/// Per-request overrides. `None` fields fall back to the interface
/// configuration at merge time.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct SessionOpts {
    pub min_rx_int: Option<Duration>,
    pub min_tx_int: Option<Duration>,
    pub idle_tx_int: Option<Duration>,
    pub multiplier: Option<u8>,
    pub passive: Option<bool>,
    pub auth_type: Option<AuthType>,
    pub keys: Option<Vec<AuthKey>>,
}

fn us(d: Duration) -> u32 {
    d.as_micros() as u32
}

/// Fold request overrides over an interface configuration.
pub fn merge_options(cf: &IfaceConfig, opts: &SessionOpts) -> SessionConfig {
    SessionConfig {
        min_rx_int: opts.min_rx_int.map(us).unwrap_or(cf.min_rx_int),
        min_tx_int: opts.min_tx_int.map(us).unwrap_or(cf.min_tx_int),
        idle_tx_int: opts.idle_tx_int.map(us).unwrap_or(cf.idle_tx_int),
        multiplier: opts.multiplier.unwrap_or(cf.multiplier),
        passive: opts.passive.unwrap_or(cf.passive),
        auth_type: opts.auth_type.unwrap_or(cf.auth_type),
        keys: opts.keys.clone().unwrap_or_else(|| cf.keys.clone()),
    }
}

/// Named interface configuration entry.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct IfaceProfile {
    pub name: String,
    pub config: IfaceConfig,
}

/// A statically configured peer. Multihop neighbors carry no link and start
/// immediately; direct neighbors wait for their nexthop to resolve.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct NeighborConfig {
    pub addr: IpAddr,
    pub local: Option<IpAddr>,
    pub link: Option<Link>,
    pub multihop: bool,
}

/// Configuration of one protocol instance.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct InstanceConfig {
    pub accept_ipv4: bool,
    pub accept_ipv6: bool,
    pub accept_direct: bool,
    pub accept_multihop: bool,

    /// Open a dedicated, bound RX socket per interface instead of shared
    /// wildcard listeners.
    pub strict_bind: bool,

    /// Accept IPv6 datagrams with a zero UDP checksum.
    pub zero_udp6_checksum_rx: bool,

    /// When set, only requests carrying the same VRF are accepted.
    pub vrf: Option<u32>,

    pub ifaces: Vec<IfaceProfile>,

    /// Configuration applied to multihop sessions, which have no interface.
    pub multihop: Option<IfaceConfig>,

    pub neighbors: Vec<NeighborConfig>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            accept_ipv4: true,
            accept_ipv6: true,
            accept_direct: true,
            accept_multihop: true,
            strict_bind: false,
            zero_udp6_checksum_rx: false,
            vrf: None,
            ifaces: Vec::new(),
            multihop: None,
            neighbors: Vec::new(),
        }
    }
}

impl InstanceConfig {
    /// Resolve the configuration for sessions on `link`, falling back to
    /// defaults when no profile matches.
    pub fn iface_config(&self, link: Option<&Link>) -> IfaceConfig {
        match link {
            Some(link) => self
                .ifaces
                .iter()
                .find(|p| p.name == link.name)
                .map(|p| p.config.clone())
                .unwrap_or_default(),
            None => self.multihop.clone().unwrap_or_default(),
        }
    }

    /// Acceptance and socket-mode flags cannot change across a
    /// reconfiguration; a differing set rejects the new configuration.
    pub fn same_acceptance(&self, other: &Self) -> bool {
        self.accept_ipv4 == other.accept_ipv4
            && self.accept_ipv6 == other.accept_ipv6
            && self.accept_direct == other.accept_direct
            && self.accept_multihop == other.accept_multihop
            && self.strict_bind == other.strict_bind
            && self.zero_udp6_checksum_rx == other.zero_udp6_checksum_rx
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_merge_options() {
        let cf = IfaceConfig::default();
        let merged = merge_options(&cf, &SessionOpts::default());
        assert_eq!(merged, cf);

        let opts = SessionOpts {
            min_tx_int: Some(Duration::from_millis(50)),
            multiplier: Some(3),
            passive: Some(true),
            ..Default::default()
        };
        let merged = merge_options(&cf, &opts);
        assert_eq!(merged.min_tx_int, 50_000);
        assert_eq!(merged.min_rx_int, cf.min_rx_int);
        assert_eq!(merged.multiplier, 3);
        assert!(merged.passive);
    }

    #[test]
    fn test_iface_config_lookup() {
        let mut cf = InstanceConfig::default();
        cf.ifaces.push(IfaceProfile {
            name: "net0".into(),
            config: IfaceConfig {
                multiplier: 3,
                ..Default::default()
            },
        });
        let net0 = Link {
            index: 2,
            name: "net0".into(),
        };
        let net1 = Link {
            index: 3,
            name: "net1".into(),
        };
        assert_eq!(cf.iface_config(Some(&net0)).multiplier, 3);
        assert_eq!(
            cf.iface_config(Some(&net1)).multiplier,
            DEFAULT_MULTIPLIER
        );
        assert_eq!(cf.iface_config(None), IfaceConfig::default());
    }
}
