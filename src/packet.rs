// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RFC 5880 control packet codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       My Discriminator                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Your Discriminator                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Desired Min TX Interval                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Required Min RX Interval                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Required Min Echo RX Interval                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! An optional Authentication Section MAY follow:
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Auth Type   |   Auth Len    |    Authentication Data...     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::error::Error;
use crate::{AuthType, Diag, State};

// Control packet flags.
const POLL: u8 = 1 << 5;
const FINAL: u8 = 1 << 4;
const CONTROL_PLANE_INDEPENDENT: u8 = 1 << 3;
const AUTHENTICATION_PRESENT: u8 = 1 << 2;
const DEMAND: u8 = 1 << 1;
const MULTIPOINT: u8 = 1;

const STATE_MASK: u8 = 0b1100_0000;
const DIAG_MASK: u8 = 0b0001_1111;
const VERSION_SHIFT: u8 = 5;

/// Protocol version defined by RFC 5880.
pub const VERSION: u8 = 1;

/// Length of a control packet without the authentication section.
pub const BASE_LEN: usize = 24;

/// A BFD control packet. Interval fields are in microseconds, as on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    /// Protocol version in the top three bits, diagnostic code in the rest.
    pub vers_diag: u8,

    /// Session state in the top two bits, then the P/F/C/A/D/M flags.
    pub flags: u8,

    /// Detection time multiplier advertised to the peer.
    pub detect_mult: u8,

    /// Total packet length in bytes, including the authentication section.
    pub length: u8,

    /// Nonzero discriminator of the transmitting session.
    pub my_discriminator: u32,

    /// Reflected discriminator of the receiving session, zero if unknown.
    pub your_discriminator: u32,

    /// Minimum interval the sender would like to use when transmitting.
    pub desired_min_tx: u32,

    /// Minimum interval between received packets the sender supports. Zero
    /// asks the peer to stop sending periodic control packets.
    pub required_min_rx: u32,

    /// Echo function support; zero means none.
    pub required_min_echo_rx: u32,

    pub auth: Option<Auth>,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            vers_diag: VERSION << VERSION_SHIFT,
            flags: (State::Down as u8) << 6,
            detect_mult: 1,
            length: BASE_LEN as u8,
            my_discriminator: 0,
            your_discriminator: 0,
            desired_min_tx: 0,
            required_min_rx: 0,
            required_min_echo_rx: 0,
            auth: None,
        }
    }
}

impl Control {
    /// Parse and validate a received control packet. Anything that fails the
    /// RFC 5880 §6.8.6 header checks is rejected here, before the session
    /// engine sees it.
    pub fn parse(d: &[u8]) -> Result<Self, Error> {
        if d.len() < BASE_LEN {
            return Err(Error::TooSmall(format!(
                "control packet: {} bytes",
                d.len()
            )));
        }
        let version = d[0] >> VERSION_SHIFT;
        if version != VERSION {
            return Err(Error::BadVersion(version));
        }
        let length = d[3] as usize;
        if length < BASE_LEN || length > d.len() {
            return Err(Error::BadLength {
                expected: length,
                found: d.len(),
            });
        }
        if d[2] == 0 {
            return Err(Error::ZeroDetectMult);
        }
        if d[1] & MULTIPOINT != 0 {
            return Err(Error::Multipoint);
        }
        let my_discriminator = u32::from_be_bytes([d[4], d[5], d[6], d[7]]);
        if my_discriminator == 0 {
            return Err(Error::ZeroDiscriminator);
        }
        let auth = if d[1] & AUTHENTICATION_PRESENT != 0 {
            Some(Auth::parse(&d[BASE_LEN..length])?)
        } else {
            None
        };
        Ok(Self {
            vers_diag: d[0],
            flags: d[1],
            detect_mult: d[2],
            length: d[3],
            my_discriminator,
            your_discriminator: u32::from_be_bytes([d[8], d[9], d[10], d[11]]),
            desired_min_tx: u32::from_be_bytes([d[12], d[13], d[14], d[15]]),
            required_min_rx: u32::from_be_bytes([d[16], d[17], d[18], d[19]]),
            required_min_echo_rx: u32::from_be_bytes([
                d[20], d[21], d[22], d[23],
            ]),
            auth,
        })
    }

    /// Serialize to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v =
            vec![self.vers_diag, self.flags, self.detect_mult, self.length];
        v.extend_from_slice(&self.my_discriminator.to_be_bytes());
        v.extend_from_slice(&self.your_discriminator.to_be_bytes());
        v.extend_from_slice(&self.desired_min_tx.to_be_bytes());
        v.extend_from_slice(&self.required_min_rx.to_be_bytes());
        v.extend_from_slice(&self.required_min_echo_rx.to_be_bytes());
        if let Some(auth) = &self.auth {
            auth.append_to(&mut v);
        }
        v
    }

    pub fn version(&self) -> u8 {
        self.vers_diag >> VERSION_SHIFT
    }

    /// Session state carried in the packet.
    pub fn state(&self) -> State {
        // Two bits, all four values defined.
        State::try_from((self.flags & STATE_MASK) >> 6)
            .unwrap_or(State::AdminDown)
    }

    pub fn set_state(&mut self, state: State) {
        self.flags = (self.flags & !STATE_MASK) | ((state as u8) << 6);
    }

    /// Diagnostic code; reserved values map to `Nothing`.
    pub fn diag(&self) -> Diag {
        Diag::try_from(self.vers_diag & DIAG_MASK).unwrap_or(Diag::Nothing)
    }

    pub fn set_diag(&mut self, diag: Diag) {
        self.vers_diag =
            (self.vers_diag & !DIAG_MASK) | (diag as u8 & DIAG_MASK);
    }

    pub fn poll(&self) -> bool {
        (self.flags & POLL) != 0
    }

    pub fn set_poll(&mut self) {
        self.flags |= POLL;
    }

    pub fn is_final(&self) -> bool {
        (self.flags & FINAL) != 0
    }

    pub fn set_final(&mut self) {
        self.flags |= FINAL;
    }

    pub fn control_plane_independent(&self) -> bool {
        (self.flags & CONTROL_PLANE_INDEPENDENT) != 0
    }

    pub fn authentication_present(&self) -> bool {
        (self.flags & AUTHENTICATION_PRESENT) != 0
    }

    pub fn demand(&self) -> bool {
        (self.flags & DEMAND) != 0
    }

    pub fn set_demand(&mut self) {
        self.flags |= DEMAND;
    }

    pub fn multipoint(&self) -> bool {
        (self.flags & MULTIPOINT) != 0
    }

    /// Attach an authentication section, fixing up the flag and length
    /// fields.
    pub fn attach_auth(&mut self, auth: Auth) {
        self.length = (BASE_LEN + auth.wire_len()) as u8;
        self.flags |= AUTHENTICATION_PRESENT;
        self.auth = Some(auth);
    }
}

/// The authentication section of a control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub auth_type: AuthType,
    pub key_id: u8,
    pub data: AuthData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthData {
    /// Simple Password: 1 to 16 bytes of shared secret.
    Password(Vec<u8>),

    /// Keyed or Meticulous Keyed MD5/SHA1: a cryptographic sequence number
    /// plus the digest bytes. Digest contents are opaque to the session
    /// engine; the transport computes and verifies MACs.
    Keyed { csn: u32, digest: Vec<u8> },
}

impl Auth {
    const MD5_DIGEST_LEN: usize = 16;
    const SHA1_DIGEST_LEN: usize = 20;

    /// Length on the wire, including the type and length bytes.
    pub fn wire_len(&self) -> usize {
        match &self.data {
            AuthData::Password(p) => 3 + p.len(),
            AuthData::Keyed { digest, .. } => 8 + digest.len(),
        }
    }

    fn parse(d: &[u8]) -> Result<Self, Error> {
        if d.len() < 3 {
            return Err(Error::TooSmall(format!(
                "auth section: {} bytes",
                d.len()
            )));
        }
        let auth_type = AuthType::try_from(d[0])?;
        let auth_len = d[1] as usize;
        if auth_len != d.len() {
            return Err(Error::BadAuth(format!(
                "length {auth_len} != section {}",
                d.len()
            )));
        }
        let key_id = d[2];
        match auth_type {
            AuthType::None => {
                Err(Error::BadAuth("reserved auth type 0".into()))
            }
            AuthType::Simple => {
                let password = d[3..].to_vec();
                if password.is_empty() || password.len() > 16 {
                    return Err(Error::BadAuth(format!(
                        "password length {}",
                        password.len()
                    )));
                }
                Ok(Self {
                    auth_type,
                    key_id,
                    data: AuthData::Password(password),
                })
            }
            AuthType::KeyedMd5
            | AuthType::MeticulousKeyedMd5
            | AuthType::KeyedSha1
            | AuthType::MeticulousKeyedSha1 => {
                let digest_len = match auth_type {
                    AuthType::KeyedSha1 | AuthType::MeticulousKeyedSha1 => {
                        Self::SHA1_DIGEST_LEN
                    }
                    _ => Self::MD5_DIGEST_LEN,
                };
                if auth_len != 8 + digest_len {
                    return Err(Error::BadAuth(format!(
                        "keyed section length {auth_len}"
                    )));
                }
                let csn = u32::from_be_bytes([d[4], d[5], d[6], d[7]]);
                Ok(Self {
                    auth_type,
                    key_id,
                    data: AuthData::Keyed {
                        csn,
                        digest: d[8..].to_vec(),
                    },
                })
            }
        }
    }

    fn append_to(&self, v: &mut Vec<u8>) {
        v.push(self.auth_type as u8);
        v.push(self.wire_len() as u8);
        v.push(self.key_id);
        match &self.data {
            AuthData::Password(p) => v.extend_from_slice(p),
            AuthData::Keyed { csn, digest } => {
                v.push(0); // reserved
                v.extend_from_slice(&csn.to_be_bytes());
                v.extend_from_slice(digest);
            }
        }
    }
}

/// RFC 5880 §6.7.3 sequence number acceptance window: a received CSN is
/// valid within 3 × Detect Mult of the last one seen; meticulous modes also
/// require it to advance.
pub fn csn_window_ok(last: u32, csn: u32, mult: u8, meticulous: bool) -> bool {
    let delta = csn.wrapping_sub(last);
    if meticulous && delta == 0 {
        return false;
    }
    delta <= 3 * mult as u32
}
