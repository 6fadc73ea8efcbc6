use bytes::{BufMut, BytesMut};

use std::convert::TryFrom;

use crate::{util, StunError};

/// channel numbers sit in the 0x4000-0x7FFE range, which keeps the
/// first two bits of a ChannelData frame distinct from STUN messages.
pub const CHANNEL_RANGE: std::ops::RangeInclusive<u16> = 0x4000..=0x7FFE;

/// The ChannelData Message
///
/// The ChannelData message is used to carry application data between the
/// client and the server.  It has the following format:
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Channel Number        |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// /                       Application Data                        /
/// /                                                               /
/// |                                                               |
/// |                               +-------------------------------+
/// |                               |
/// +-------------------------------+
/// ```
///
/// The Length field specifies the length in bytes of the application
/// data field, excluding the 4-byte header.  Note that 0 is a valid
/// length.
#[derive(Debug)]
pub struct ChannelData<'a> {
    /// channel data bytes.
    pub bytes: &'a [u8],
    /// channel number.
    pub number: u16,
}

impl ChannelData<'_> {
    /// frame application data for a bound channel.
    ///
    /// the header length excludes padding; the frame itself is padded
    /// out to a 4-byte boundary.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use stun::ChannelData;
    ///
    /// let mut buf = BytesMut::new();
    /// ChannelData::encode(0x4000, &[0xaa, 0xbb, 0xcc], &mut buf);
    /// assert_eq!(&buf[..], &[0x40, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc, 0x00]);
    /// ```
    pub fn encode(number: u16, data: &[u8], buf: &mut BytesMut) {
        buf.clear();
        buf.put_u16(number);
        buf.put_u16(data.len() as u16);
        buf.put(data);

        let psize = util::pad_size(data.len());
        if psize > 0 {
            buf.put_bytes(0, psize);
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for ChannelData<'a> {
    type Error = StunError;

    /// # Unit Test
    ///
    /// ```
    /// use std::convert::TryFrom;
    /// use stun::ChannelData;
    ///
    /// let buffer = [0x40u8, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc, 0x00];
    ///
    /// let data = ChannelData::try_from(&buffer[..]).unwrap();
    /// assert_eq!(data.number, 0x4000);
    /// assert_eq!(data.bytes, &[0xaa, 0xbb, 0xcc]);
    /// ```
    fn try_from(buf: &'a [u8]) -> Result<Self, StunError> {
        if buf.len() < 4 {
            return Err(StunError::Malformed);
        }

        let number = util::as_u16(buf);
        if !CHANNEL_RANGE.contains(&number) {
            return Err(StunError::Malformed);
        }

        let size = util::as_u16(&buf[2..]) as usize;
        if buf.len() - 4 < size {
            return Err(StunError::Malformed);
        }

        Ok(Self {
            number,
            bytes: &buf[4..4 + size],
        })
    }
}
