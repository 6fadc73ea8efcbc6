//! ## Session Traversal Utilities for NAT (STUN)
//!
//! STUN is intended to be used in the context of one or more NAT
//! traversal solutions.  These solutions are known as "STUN Usages".
//! Each usage describes how STUN is utilized to achieve the NAT
//! traversal solution.  Interactive Connectivity Establishment (ICE)
//! [RFC8445](https://tools.ietf.org/html/rfc8445) is one usage of STUN,
//! and the one this crate serves: it carries the Binding transactions
//! of connectivity checks as well as the TURN
//! [RFC5766](https://tools.ietf.org/html/rfc5766) client methods.
//!
//! ### STUN Message Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                     Transaction ID (96 bits)                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ### STUN Attributes
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Type                  |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Value (variable)                ....
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

pub mod attribute;
pub mod channel;
pub mod message;
pub mod util;

pub use self::{
    attribute::{AttrKind, Transport},
    channel::ChannelData,
    message::{MessageReader, MessageWriter},
};

use std::convert::TryFrom;

use thiserror::Error;

/// codec failure taxonomy.
///
/// a `Malformed` datagram is dropped silently by callers, per STUN
/// processing rules; `UnknownRequired` carries the attribute types the
/// caller must echo in a 420 response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("malformed stun message")]
    Malformed,
    #[error("unknown comprehension-required attributes: {0:?}")]
    UnknownRequired(Vec<u16>),
    #[error("message integrity attribute missing")]
    IntegrityMissing,
    #[error("message integrity check failed")]
    IntegrityMismatch,
}

impl From<std::str::Utf8Error> for StunError {
    fn from(_: std::str::Utf8Error) -> Self {
        Self::Malformed
    }
}

impl From<std::array::TryFromSliceError> for StunError {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Self::Malformed
    }
}

/// message class.
///
/// the class bits are split across the method field: C1 at bit 8,
/// C0 at bit 4 of the 14-bit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Request,
    Indication,
    Response,
    Error,
}

/// message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding(Kind),
    Allocate(Kind),
    Refresh(Kind),
    CreatePermission(Kind),
    ChannelBind(Kind),
    SendIndication,
    DataIndication,
}

impl TryFrom<u16> for Method {
    type Error = StunError;

    /// # Unit Test
    ///
    /// ```
    /// use std::convert::TryFrom;
    /// use stun::{Kind, Method};
    ///
    /// assert_eq!(Method::try_from(0x0001).unwrap(), Method::Binding(Kind::Request));
    /// assert_eq!(Method::try_from(0x0011).unwrap(), Method::Binding(Kind::Indication));
    /// assert_eq!(Method::try_from(0x0101).unwrap(), Method::Binding(Kind::Response));
    /// assert_eq!(Method::try_from(0x0113).unwrap(), Method::Allocate(Kind::Error));
    /// assert!(Method::try_from(0x4001).is_err());
    /// ```
    fn try_from(value: u16) -> Result<Self, StunError> {
        Ok(match value {
            0x0001 => Self::Binding(Kind::Request),
            0x0011 => Self::Binding(Kind::Indication),
            0x0101 => Self::Binding(Kind::Response),
            0x0111 => Self::Binding(Kind::Error),
            0x0003 => Self::Allocate(Kind::Request),
            0x0103 => Self::Allocate(Kind::Response),
            0x0113 => Self::Allocate(Kind::Error),
            0x0004 => Self::Refresh(Kind::Request),
            0x0104 => Self::Refresh(Kind::Response),
            0x0114 => Self::Refresh(Kind::Error),
            0x0008 => Self::CreatePermission(Kind::Request),
            0x0108 => Self::CreatePermission(Kind::Response),
            0x0118 => Self::CreatePermission(Kind::Error),
            0x0009 => Self::ChannelBind(Kind::Request),
            0x0109 => Self::ChannelBind(Kind::Response),
            0x0119 => Self::ChannelBind(Kind::Error),
            0x0016 => Self::SendIndication,
            0x0017 => Self::DataIndication,
            _ => return Err(StunError::Malformed),
        })
    }
}

impl From<Method> for u16 {
    /// the class bits live at 0x0100 (C1) and 0x0010 (C0); every method
    /// in this registry fits below 0x0010, so type = method | class.
    fn from(value: Method) -> Self {
        let (method, kind) = match value {
            Method::Binding(kind) => (0x0001, kind),
            Method::Allocate(kind) => (0x0003, kind),
            Method::Refresh(kind) => (0x0004, kind),
            Method::CreatePermission(kind) => (0x0008, kind),
            Method::ChannelBind(kind) => (0x0009, kind),
            Method::SendIndication => return 0x0016,
            Method::DataIndication => return 0x0017,
        };

        method
            | match kind {
                Kind::Request => 0x0000,
                Kind::Indication => 0x0010,
                Kind::Response => 0x0100,
                Kind::Error => 0x0110,
            }
    }
}

/// datagram payload.
///
/// a relay connection multiplexes plain STUN messages and ChannelData
/// frames over the same 5-tuple; the first two bits tell them apart.
pub enum Payload<'a, 'b> {
    Message(MessageReader<'a, 'b>),
    ChannelData(ChannelData<'a>),
}

/// stun decoder.
pub struct Decoder;

impl Decoder {
    /// # Unit Test
    ///
    /// ```
    /// use stun::*;
    /// use stun::attribute::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d,
    ///     0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Vec::new();
    /// let payload = Decoder::decode(&buffer, &mut attributes).unwrap();
    /// if let Payload::Message(reader) = payload {
    ///     assert!(reader.get::<UserName>().is_none())
    /// } else {
    ///     panic!("not a stun message!")
    /// }
    /// ```
    pub fn decode<'a, 'b>(
        buf: &'a [u8],
        attributes: &'b mut Vec<(AttrKind, &'a [u8])>,
    ) -> Result<Payload<'a, 'b>, StunError> {
        if buf.len() < 4 {
            return Err(StunError::Malformed);
        }

        Ok(if buf[0] >> 6 == 1 {
            Payload::ChannelData(ChannelData::try_from(buf)?)
        } else {
            Payload::Message(MessageReader::decode(buf, attributes)?)
        })
    }
}
