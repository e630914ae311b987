// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Statically configured peers. A neighbor is the daemon acting as its own
//! client: when the peer is reachable the neighbor holds an internal
//! request, indistinguishable from one a routing protocol would make, and
//! the session lives exactly as long as that request does. Multihop
//! neighbors skip reachability tracking and hold theirs from the start.

use crate::config::NeighborConfig;
use crate::request::SessionRequest;

pub(crate) struct NeighborEntry {
    pub cf: NeighborConfig,

    /// The internal request keeping this neighbor's session alive, present
    /// while the neighbor is supposed to be probed.
    pub req: Option<SessionRequest>,

    /// Whether the neighbor was started (carried over across
    /// reconfigurations).
    pub active: bool,
}

/// Configuration identity used to carry neighbor state across a
/// reconfiguration.
pub(crate) fn same_neighbor(a: &NeighborConfig, b: &NeighborConfig) -> bool {
    a.addr == b.addr
        && a.local == b.local
        && a.link.as_ref().map(|l| l.index)
            == b.link.as_ref().map(|l| l.index)
        && a.multihop == b.multihop
}
