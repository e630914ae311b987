// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The socket seam. The session engine emits already-encoded control
//! packets through a [`TxSocket`] and receives parsed ones through
//! [`Instance::rx_ctl`](crate::instance::Instance::rx_ctl); how datagrams
//! actually move is the embedder's business. The channel-backed
//! implementation here serves tests and in-process wiring.

use crate::error::Error;
use crate::iface::Link;
use crate::packet;
use std::net::IpAddr;
use std::sync::mpsc::Sender;

/// Transmit side of one interface's socket.
pub trait TxSocket: Send {
    fn send_ctl(&self, dst: IpAddr, pkt: &packet::Control)
        -> Result<(), Error>;
}

/// A bound receive socket held by an interface under strict-bind
/// configurations. The engine only manages its lifetime; delivery happens
/// through the instance ingress path regardless.
pub trait RxSocket: Send {}

/// Opens sockets for interfaces as sessions come and go.
pub trait SocketFactory: Send {
    fn open_tx(
        &self,
        local: IpAddr,
        link: Option<&Link>,
    ) -> Result<Box<dyn TxSocket>, Error>;

    fn open_rx(
        &self,
        _local: IpAddr,
        _link: Option<&Link>,
    ) -> Result<Box<dyn RxSocket>, Error> {
        Err(Error::NotSupported("bound rx sockets"))
    }
}

/// One control packet in flight between two endpoints.
#[derive(Debug, Clone)]
pub struct Wire {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub pkt: packet::Control,
}

/// A [`SocketFactory`] whose sockets push packets onto an mpsc channel.
pub struct ChannelFactory {
    hub: Sender<Wire>,
}

impl ChannelFactory {
    pub fn new(hub: Sender<Wire>) -> Self {
        Self { hub }
    }
}

impl SocketFactory for ChannelFactory {
    fn open_tx(
        &self,
        local: IpAddr,
        _link: Option<&Link>,
    ) -> Result<Box<dyn TxSocket>, Error> {
        Ok(Box::new(ChannelTx {
            local,
            hub: self.hub.clone(),
        }))
    }
}

struct ChannelTx {
    local: IpAddr,
    hub: Sender<Wire>,
}

impl TxSocket for ChannelTx {
    fn send_ctl(
        &self,
        dst: IpAddr,
        pkt: &packet::Control,
    ) -> Result<(), Error> {
        self.hub
            .send(Wire {
                src: self.local,
                dst,
                pkt: pkt.clone(),
            })
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }
}
