// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::IfaceConfig;
use crate::transport::{RxSocket, TxSocket};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Identity of a network link as the surrounding daemon knows it. Sessions
/// on the same link share its index; multihop sessions have no link and use
/// index zero in the peer table.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct Link {
    pub index: u32,
    pub name: String,
}

/// Arena handle for an interface pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IfaceId(pub usize);

/// One entry of the interface pool: a (local address, link) pair wrapping
/// the TX socket its sessions transmit through. Entries are created on
/// demand by the first session that needs them and reference counted by the
/// sessions attached; the sockets close when the count drops to zero.
pub(crate) struct Iface {
    pub local: IpAddr,
    pub link: Option<Link>,
    pub cf: IfaceConfig,
    pub uc: u32,

    /// Set by reconfiguration when `cf` materially changed, consumed by the
    /// per-session reapply pass.
    pub changed: bool,

    pub tx: Box<dyn TxSocket>,

    /// Held only for lifecycle under strict-bind configurations.
    #[allow(dead_code)]
    pub rx: Option<Box<dyn RxSocket>>,
}

impl Iface {
    pub fn matches(&self, local: IpAddr, link: Option<&Link>) -> bool {
        self.local == local
            && self.link.as_ref().map(|l| l.index)
                == link.map(|l| l.index)
    }

    pub fn ifindex(&self) -> u32 {
        self.link.as_ref().map(|l| l.index).unwrap_or(0)
    }
}
