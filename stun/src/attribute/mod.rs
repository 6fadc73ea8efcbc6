pub mod address;
mod error;

use std::convert::TryFrom;
use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

pub use address::Addr;
pub use error::{Error, Kind as ErrKind};

use crate::{util, StunError};

/// transport protocol carried by REQUESTED-TRANSPORT.
///
/// the protocol number occupies the first byte; the rest is RFFU.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum Transport {
    TCP = 0x06000000,
    UDP = 0x11000000,
}

/// attribute type registry.
#[repr(u16)]
#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum AttrKind {
    MappedAddress       = 0x0001,
    UserName            = 0x0006,
    MessageIntegrity    = 0x0008,
    ErrorCode           = 0x0009,
    UnknownAttributes   = 0x000A,
    ChannelNumber       = 0x000C,
    Lifetime            = 0x000D,
    XorPeerAddress      = 0x0012,
    Data                = 0x0013,
    Realm               = 0x0014,
    Nonce               = 0x0015,
    XorRelayedAddress   = 0x0016,
    RequestedTransport  = 0x0019,
    DontFragment        = 0x001A,
    XorMappedAddress    = 0x0020,
    Priority            = 0x0024,
    UseCandidate        = 0x0025,
    Software            = 0x8022,
    Fingerprint         = 0x8028,
    IceControlled       = 0x8029,
    IceControlling      = 0x802A,
}

/// dyn stun/turn message attribute.
pub trait Property<'a> {
    /// current attribute inner type.
    type Inner;
    /// get current attribute type.
    fn kind() -> AttrKind;
    /// write the current attribute to the buffer.
    fn into(value: Self::Inner, buf: &mut BytesMut, token: &'a [u8]);
    /// convert buffer to current attribute.
    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, StunError>;
}

/// The USERNAME attribute is used for message integrity.  It identifies
/// the username and password combination used in the message-integrity
/// check.  For connectivity checks the value is the concatenation of
/// the remote and local ufrag joined by a colon.
pub struct UserName;
impl<'a> Property<'a> for UserName {
    type Inner = &'a str;

    fn kind() -> AttrKind {
        AttrKind::UserName
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The DATA attribute is present in all Send and Data indications.  The
/// value portion of this attribute is variable length and consists of
/// the application data (that is, the data that would immediately follow
/// the UDP header if the data was been sent directly between the client
/// and the peer).
pub struct Data;
impl<'a> Property<'a> for Data {
    type Inner = &'a [u8];

    fn kind() -> AttrKind {
        AttrKind::Data
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(buf)
    }
}

/// The REALM attribute may be present in requests and responses.
/// Presence of the REALM attribute in a request indicates that long-term
/// credentials are being used for authentication.  Presence in certain
/// error responses indicates that the server wishes the client to use a
/// long-term credential in that realm for authentication.
pub struct Realm;
impl<'a> Property<'a> for Realm {
    type Inner = &'a str;

    fn kind() -> AttrKind {
        AttrKind::Realm
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The NONCE attribute may be present in requests and responses; the
/// server uses it to bind long-term-credential requests to a window it
/// controls, and refuses stale values with 438.
pub struct Nonce;
impl<'a> Property<'a> for Nonce {
    type Inner = &'a str;

    fn kind() -> AttrKind {
        AttrKind::Nonce
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The SOFTWARE attribute contains a textual description of the software
/// being used by the agent sending the message.
pub struct Software;
impl<'a> Property<'a> for Software {
    type Inner = &'a str;

    fn kind() -> AttrKind {
        AttrKind::Software
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value.as_bytes());
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(std::str::from_utf8(buf)?)
    }
}

/// The MESSAGE-INTEGRITY attribute contains an HMAC-SHA1 of the
/// message; raw so the reader can verify it against a caller-supplied
/// key.
pub struct MessageIntegrity;
impl<'a> Property<'a> for MessageIntegrity {
    type Inner = &'a [u8];

    fn kind() -> AttrKind {
        AttrKind::MessageIntegrity
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(buf)
    }
}

/// The MAPPED-ADDRESS attribute indicates a reflexive transport address
/// of the client, in plain binary; kept for RFC 3489 compatibility.
pub struct MappedAddress;
impl<'a> Property<'a> for MappedAddress {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::MappedAddress
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &'a [u8]) {
        Addr::into(&value, token, buf, false)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, StunError> {
        Addr::try_from(buf, token, false)
    }
}

/// The XOR-MAPPED-ADDRESS attribute is identical to the MAPPED-ADDRESS
/// attribute, except that the reflexive transport address is obfuscated
/// through the XOR function with the magic cookie (and transaction id
/// for IPv6).
pub struct XorMappedAddress;
impl<'a> Property<'a> for XorMappedAddress {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::XorMappedAddress
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &'a [u8]) {
        Addr::into(&value, token, buf, true)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, StunError> {
        Addr::try_from(buf, token, true)
    }
}

/// The XOR-PEER-ADDRESS attribute specifies the address and port of the
/// peer as seen from the TURN server.
pub struct XorPeerAddress;
impl<'a> Property<'a> for XorPeerAddress {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::XorPeerAddress
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &'a [u8]) {
        Addr::into(&value, token, buf, true)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, StunError> {
        Addr::try_from(buf, token, true)
    }
}

/// The XOR-RELAYED-ADDRESS attribute is present in Allocate responses
/// and specifies the address and port that the server allocated to the
/// client.
pub struct XorRelayedAddress;
impl<'a> Property<'a> for XorRelayedAddress {
    type Inner = SocketAddr;

    fn kind() -> AttrKind {
        AttrKind::XorRelayedAddress
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, token: &'a [u8]) {
        Addr::into(&value, token, buf, true)
    }

    fn try_from(buf: &'a [u8], token: &'a [u8]) -> Result<Self::Inner, StunError> {
        Addr::try_from(buf, token, true)
    }
}

/// The ERROR-CODE attribute is used in error response messages.  It
/// contains a numeric error code value in the range of 300 to 699 plus a
/// textual reason phrase encoded in UTF-8.
pub struct ErrorCode;
impl<'a> Property<'a> for ErrorCode {
    type Inner = Error<'a>;

    fn kind() -> AttrKind {
        AttrKind::ErrorCode
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        value.into(buf)
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Error::try_from(buf)
    }
}

/// The UNKNOWN-ATTRIBUTES attribute is present only in an error response
/// when the response code in the ERROR-CODE attribute is 420, listing
/// the comprehension-required types the server did not understand.
pub struct UnknownAttributes;
impl<'a> Property<'a> for UnknownAttributes {
    type Inner = Vec<u16>;

    fn kind() -> AttrKind {
        AttrKind::UnknownAttributes
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        for kind in value {
            buf.put_u16(kind);
        }
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        if buf.len() % 2 != 0 {
            return Err(StunError::Malformed);
        }

        Ok(buf
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }
}

/// The LIFETIME attribute represents the duration for which the server
/// will maintain an allocation in the absence of a refresh, in seconds.
pub struct Lifetime;
impl<'a> Property<'a> for Lifetime {
    type Inner = u32;

    fn kind() -> AttrKind {
        AttrKind::Lifetime
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}

/// The CHANNEL-NUMBER attribute contains the number of the channel; the
/// trailing 16 bits are RFFU and zeroed.
pub struct ChannelNumber;
impl<'a> Property<'a> for ChannelNumber {
    type Inner = u16;

    fn kind() -> AttrKind {
        AttrKind::ChannelNumber
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u16(value);
        buf.put_u16(0);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        if buf.len() < 2 {
            return Err(StunError::Malformed);
        }

        Ok(util::as_u16(buf))
    }
}

/// The REQUESTED-TRANSPORT attribute is used by the client to request a
/// specific transport protocol for the allocated transport address.
pub struct RequestedTransport;
impl<'a> Property<'a> for RequestedTransport {
    type Inner = Transport;

    fn kind() -> AttrKind {
        AttrKind::RequestedTransport
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value as u32);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        let value = u32::from_be_bytes(buf.try_into()?);
        Transport::try_from(value).map_err(|_| StunError::Malformed)
    }
}

/// The DONT-FRAGMENT attribute is zero-length; its presence requests
/// that the server set the DF bit on relayed UDP datagrams.
pub struct DontFragment;
impl<'a> Property<'a> for DontFragment {
    type Inner = ();

    fn kind() -> AttrKind {
        AttrKind::DontFragment
    }

    fn into(_: Self::Inner, _: &mut BytesMut, _: &[u8]) {}

    fn try_from(_: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(())
    }
}

/// The PRIORITY attribute indicates the priority that is to be
/// associated with a peer-reflexive candidate, if one will be discovered
/// by this check.
pub struct Priority;
impl<'a> Property<'a> for Priority {
    type Inner = u32;

    fn kind() -> AttrKind {
        AttrKind::Priority
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}

/// The USE-CANDIDATE attribute is zero-length; the controlling agent
/// includes it in a check to nominate the pair the check runs on.
pub struct UseCandidate;
impl<'a> Property<'a> for UseCandidate {
    type Inner = ();

    fn kind() -> AttrKind {
        AttrKind::UseCandidate
    }

    fn into(_: Self::Inner, _: &mut BytesMut, _: &[u8]) {}

    fn try_from(_: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(())
    }
}

/// The ICE-CONTROLLED attribute carries the agent's tie-breaker and
/// asserts the controlled role.
pub struct IceControlled;
impl<'a> Property<'a> for IceControlled {
    type Inner = u64;

    fn kind() -> AttrKind {
        AttrKind::IceControlled
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(u64::from_be_bytes(buf.try_into()?))
    }
}

/// The ICE-CONTROLLING attribute carries the agent's tie-breaker and
/// asserts the controlling role.
pub struct IceControlling;
impl<'a> Property<'a> for IceControlling {
    type Inner = u64;

    fn kind() -> AttrKind {
        AttrKind::IceControlling
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u64(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(u64::from_be_bytes(buf.try_into()?))
    }
}

/// The FINGERPRINT attribute, CRC-32 of the message xor'd with
/// 0x5354554E; always the final attribute when present.
pub struct Fingerprint;
impl<'a> Property<'a> for Fingerprint {
    type Inner = u32;

    fn kind() -> AttrKind {
        AttrKind::Fingerprint
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _: &[u8]) {
        buf.put_u32(value);
    }

    fn try_from(buf: &'a [u8], _: &'a [u8]) -> Result<Self::Inner, StunError> {
        Ok(u32::from_be_bytes(buf.try_into()?))
    }
}
