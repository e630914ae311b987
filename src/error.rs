// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_enum::TryFromPrimitiveError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("too small: {0}")]
    TooSmall(String),

    #[error("bad version {0}")]
    BadVersion(u8),

    #[error("bad length: expected {expected}, found {found}")]
    BadLength { expected: usize, found: usize },

    #[error("zero detection multiplier")]
    ZeroDetectMult,

    #[error("multipoint bit set")]
    Multipoint,

    #[error("zero discriminator")]
    ZeroDiscriminator,

    #[error("bad authentication section: {0}")]
    BadAuth(String),

    #[error("auth type error")]
    AuthType(#[from] TryFromPrimitiveError<crate::AuthType>),

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send {0}")]
    ChannelSend(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("instance {0} already exists")]
    InstanceExists(String),

    #[error("no such instance {0}")]
    NoSuchInstance(String),

    #[error("not supported: {0}")]
    NotSupported(&'static str),
}
