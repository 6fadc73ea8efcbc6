use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::StunError;

/// error codes the agent emits or reacts to.
///
/// the discriminant packs the class into the high byte and the number
/// into the low byte, matching the wire layout after the reserved
/// field.
#[repr(u16)]
#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum Kind {
    TryAlternate                = 0x0300,
    BadRequest                  = 0x0400,
    Unauthorized                = 0x0401,
    Forbidden                   = 0x0403,
    RequestTimedout             = 0x0408,
    UnknownAttribute            = 0x0414,
    AllocationMismatch          = 0x0425,
    StaleNonce                  = 0x0426,
    AddressFamilyNotSupported   = 0x0428,
    WrongCredentials            = 0x0429,
    UnsupportedTransportAddress = 0x042A,
    AllocationQuotaReached      = 0x0456,
    RoleConflict                = 0x0457,
    ServerError                 = 0x0500,
    InsufficientCapacity        = 0x0508,
}

impl Kind {
    /// the decimal code, e.g. 487 for role conflict.
    pub const fn code(self) -> u16 {
        let value = self as u16;
        (value >> 8) * 100 + (value & 0xff)
    }
}

/// The ERROR-CODE attribute value.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// the class is the hundreds digit of the code; the number is the code
/// modulo 100.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error<'a> {
    /// decimal error code, e.g. 401.
    pub code: u16,
    /// reason phrase, diagnostic only.
    pub message: &'a str,
}

impl Error<'_> {
    pub(crate) fn into(self, buf: &mut BytesMut) {
        buf.put_u16(0);
        buf.put_u8((self.code / 100) as u8);
        buf.put_u8((self.code % 100) as u8);
        buf.put(self.message.as_bytes());
    }

    pub(crate) fn try_from(buf: &[u8]) -> Result<Error<'_>, StunError> {
        if buf.len() < 4 {
            return Err(StunError::Malformed);
        }

        let class = (buf[2] & 0x07) as u16;
        let number = buf[3] as u16;
        if !(3..7).contains(&class) || number > 99 {
            return Err(StunError::Malformed);
        }

        Ok(Error {
            code: class * 100 + number,
            message: std::str::from_utf8(&buf[4..])?,
        })
    }
}

impl From<Kind> for Error<'_> {
    /// create an error value with the recommended reason phrase.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use stun::attribute::{ErrKind, Error};
    ///
    /// let error = Error::from(ErrKind::Unauthorized);
    /// assert_eq!(error.code, 401);
    /// assert_eq!(error.message, "Unauthorized");
    /// ```
    #[rustfmt::skip]
    fn from(kind: Kind) -> Self {
        let message = match kind {
            Kind::TryAlternate                => "Try Alternate",
            Kind::BadRequest                  => "Bad Request",
            Kind::Unauthorized                => "Unauthorized",
            Kind::Forbidden                   => "Forbidden",
            Kind::RequestTimedout             => "Request Timed out",
            Kind::UnknownAttribute            => "Unknown Attribute",
            Kind::AllocationMismatch          => "Allocation Mismatch",
            Kind::StaleNonce                  => "Stale Nonce",
            Kind::AddressFamilyNotSupported   => "Address Family not Supported",
            Kind::WrongCredentials            => "Wrong Credentials",
            Kind::UnsupportedTransportAddress => "Unsupported Transport Address",
            Kind::AllocationQuotaReached      => "Allocation Quota Reached",
            Kind::RoleConflict                => "Role Conflict",
            Kind::ServerError                 => "Server Error",
            Kind::InsufficientCapacity        => "Insufficient Capacity",
        };

        Self {
            code: kind.code(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_packing() {
        assert_eq!(Kind::Unauthorized.code(), 401);
        assert_eq!(Kind::UnknownAttribute.code(), 420);
        assert_eq!(Kind::StaleNonce.code(), 438);
        assert_eq!(Kind::RoleConflict.code(), 487);
        assert_eq!(Kind::ServerError.code(), 500);
    }

    #[test]
    fn value_round_trip() {
        let mut buf = BytesMut::new();
        Error::from(Kind::StaleNonce).into(&mut buf);

        let parsed = Error::try_from(&buf[..]).unwrap();
        assert_eq!(parsed.code, 438);
        assert_eq!(parsed.message, "Stale Nonce");
    }
}
