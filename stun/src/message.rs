use bytes::{BufMut, BytesMut};

use std::convert::TryFrom;

use super::attribute::{AttrKind, MessageIntegrity, Property};
use super::{util, Method, StunError};

const ZERO_BUF: [u8; 10] = [0u8; 10];
const COOKIE: [u8; 4] = 0x2112A442u32.to_be_bytes();

pub struct MessageWriter<'a> {
    token: &'a [u8],
    raw: &'a mut BytesMut,
}

impl<'a> MessageWriter<'a> {
    /// begin a new message with a fresh transaction id.
    pub fn new(method: Method, token: &'a [u8; 12], buf: &'a mut BytesMut) -> Self {
        buf.clear();
        buf.put_u16(method.into());
        buf.put_u16(0);
        buf.put(&COOKIE[..]);
        buf.put(token.as_slice());
        Self { raw: buf, token }
    }

    /// begin a reply bound to a received message's transaction id.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use stun::*;
    /// use bytes::BytesMut;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d,
    ///     0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Vec::new();
    /// let mut buf = BytesMut::new();
    /// let old = MessageReader::decode(&buffer[..], &mut attributes).unwrap();
    /// MessageWriter::extend(Method::Binding(Kind::Request), &old, &mut buf);
    /// assert_eq!(&buf[..], &buffer[..]);
    /// ```
    pub fn extend(method: Method, reader: &MessageReader<'a, '_>, buf: &'a mut BytesMut) -> Self {
        buf.clear();
        buf.put_u16(method.into());
        buf.put_u16(0);
        buf.put(&COOKIE[..]);
        buf.put(reader.token);
        Self {
            raw: buf,
            token: reader.token,
        }
    }

    /// append an attribute.
    ///
    /// attributes are emitted in the order given by the caller; the
    /// codec never reorders them.
    pub fn append<T: Property<'a>>(&mut self, value: T::Inner) {
        self.raw.put_u16(T::kind() as u16);

        // reserve the length slot, write the value, then backfill
        // the measured size.
        let os = self.raw.len();
        self.raw.put_u16(0);
        T::into(value, self.raw, self.token);

        let size = self.raw.len() - os - 2;
        let size_buf = (size as u16).to_be_bytes();
        self.raw[os] = size_buf[0];
        self.raw[os + 1] = size_buf[1];

        let psize = util::pad_size(size);
        if psize > 0 {
            self.raw.put(&ZERO_BUF[0..psize]);
        }
    }

    /// finish the message.
    ///
    /// MESSAGE-INTEGRITY is inserted when a key is supplied, then
    /// FINGERPRINT is always appended; both are computed over a
    /// virtually rewritten header length.
    pub fn flush(&mut self, key: Option<&[u8]>) -> Result<(), StunError> {
        let size = (self.raw.len() - 20) as u16;
        let size_buf = size.to_be_bytes();
        self.raw[2] = size_buf[0];
        self.raw[3] = size_buf[1];

        if let Some(key) = key {
            self.integrity(key)?;
        }

        self.fingerprint();
        Ok(())
    }

    /// append the MESSAGE-INTEGRITY attribute.
    ///
    /// the header length is rewritten to cover the integrity TLV
    /// before digesting, so the HMAC commits to the final layout
    /// while excluding the fingerprint that follows.
    fn integrity(&mut self, key: &[u8]) -> Result<(), StunError> {
        let buf_size = (self.raw.len() + 4) as u16;
        let size_buf = buf_size.to_be_bytes();
        self.raw[2] = size_buf[0];
        self.raw[3] = size_buf[1];

        let hmac_output = util::hmac_sha1(key, &[self.raw])?.into_bytes();
        self.raw.put_u16(AttrKind::MessageIntegrity as u16);
        self.raw.put_u16(20);
        self.raw.put(hmac_output.as_slice());
        Ok(())
    }

    /// append the FINGERPRINT attribute, final in the message.
    fn fingerprint(&mut self) {
        let buf_size = (self.raw.len() + 8 - 20) as u16;
        let size_buf = buf_size.to_be_bytes();
        self.raw[2] = size_buf[0];
        self.raw[3] = size_buf[1];

        let crc = util::fingerprint(self.raw);
        self.raw.put_u16(AttrKind::Fingerprint as u16);
        self.raw.put_u16(4);
        self.raw.put_u32(crc);
    }
}

#[derive(Debug)]
pub struct MessageReader<'a, 'b> {
    /// message type.
    pub method: Method,
    /// message transaction id.
    pub token: &'a [u8],
    /// message source bytes.
    buf: &'a [u8],
    /// offset of the MESSAGE-INTEGRITY attribute, 0 when absent.
    integrity_offset: u16,
    /// message attribute list.
    attributes: &'b Vec<(AttrKind, &'a [u8])>,
}

impl<'a, 'b> MessageReader<'a, 'b> {
    /// get an attribute from the message attribute list.
    pub fn get<T: Property<'a>>(&self) -> Option<T::Inner> {
        let kind = T::kind();
        self.attributes
            .iter()
            .find(|(k, _)| k == &kind)
            .and_then(|(_, v)| T::try_from(v, self.token).ok())
    }

    /// whether a MESSAGE-INTEGRITY attribute is present.
    ///
    /// verification is lazy; the caller supplies the key to
    /// [`MessageReader::integrity`] once it knows which one applies.
    pub fn has_integrity(&self) -> bool {
        self.integrity_offset != 0
    }

    /// verify the MESSAGE-INTEGRITY attribute.
    ///
    /// the digest covers the message up to the integrity attribute,
    /// with the header length rewritten to include the integrity TLV
    /// and exclude anything after it.
    pub fn integrity(&self, key: &[u8]) -> Result<(), StunError> {
        if self.integrity_offset < 20 {
            return Err(StunError::IntegrityMissing);
        }

        let expected = self
            .get::<MessageIntegrity>()
            .ok_or(StunError::IntegrityMissing)?;

        let size_buf = (self.integrity_offset + 4).to_be_bytes();
        let body = [
            &self.buf[0..2],
            &size_buf[..],
            &self.buf[4..self.integrity_offset as usize],
        ];

        let hmac_output = util::hmac_sha1(key, &body)?.into_bytes();
        if expected != hmac_output.as_slice() {
            return Err(StunError::IntegrityMismatch);
        }

        Ok(())
    }

    /// try decoding bytes as a message.
    ///
    /// unknown comprehension-required attributes (type < 0x8000) fail
    /// the decode and are reported so the caller can answer 420; a
    /// present FINGERPRINT must be the final attribute and match.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use stun::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d,
    ///     0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Vec::new();
    /// let message = MessageReader::decode(&buffer[..], &mut attributes).unwrap();
    /// assert_eq!(message.method, Method::Binding(Kind::Request));
    /// assert!(!message.has_integrity());
    /// ```
    pub fn decode(
        buf: &'a [u8],
        attributes: &'b mut Vec<(AttrKind, &'a [u8])>,
    ) -> Result<MessageReader<'a, 'b>, StunError> {
        if buf.len() < 20 || buf[0] >> 6 != 0 {
            return Err(StunError::Malformed);
        }

        let method = Method::try_from(util::as_u16(&buf[..2]))?;
        let size = util::as_u16(&buf[2..4]) as usize;
        if size % 4 != 0 || buf[4..8] != COOKIE[..] || buf.len() < 20 + size {
            return Err(StunError::Malformed);
        }

        let token = &buf[8..20];
        let end = 20 + size;
        let mut integrity_offset = 0;
        let mut fingerprint: Option<(usize, &[u8])> = None;
        let mut unknown = Vec::new();
        let mut offset = 20;

        while offset < end {
            if end - offset < 4 {
                return Err(StunError::Malformed);
            }

            let attr_start = offset;
            let key = util::as_u16(&buf[offset..]);
            let value_size = util::as_u16(&buf[offset + 2..]) as usize;

            offset += 4;
            if end - offset < value_size {
                return Err(StunError::Malformed);
            }

            let range = offset..(offset + value_size);
            offset += value_size + util::pad_size(value_size);
            if offset > end {
                return Err(StunError::Malformed);
            }

            let attrkind = match AttrKind::try_from(key) {
                Ok(kind) => kind,
                Err(_) => {
                    if key < 0x8000 {
                        unknown.push(key);
                    }

                    continue;
                }
            };

            if attrkind == AttrKind::MessageIntegrity && integrity_offset == 0 {
                integrity_offset = attr_start as u16;
            }

            if attrkind == AttrKind::Fingerprint {
                fingerprint = Some((attr_start, &buf[range.clone()]));
            }

            attributes.push((attrkind, &buf[range]));
        }

        if !unknown.is_empty() {
            return Err(StunError::UnknownRequired(unknown));
        }

        if let Some((fp_start, value)) = fingerprint {
            if fp_start + 8 != end || value.len() != 4 {
                return Err(StunError::Malformed);
            }

            let crc = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            if util::fingerprint(&buf[..fp_start]) != crc {
                return Err(StunError::Malformed);
            }
        }

        Ok(Self {
            buf,
            token,
            method,
            attributes,
            integrity_offset,
        })
    }
}

impl<'a> AsRef<[u8]> for MessageReader<'a, '_> {
    fn as_ref(&self) -> &'a [u8] {
        self.buf
    }
}

impl<'a> std::ops::Deref for MessageReader<'a, '_> {
    type Target = [u8];

    fn deref(&self) -> &'a Self::Target {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{
        ErrorCode, IceControlled, Priority, Software, UserName, XorMappedAddress,
    };
    use crate::Kind;

    /// RFC 5769 2.1, sample request.
    const SAMPLE_REQUEST: [u8; 108] = [
        0x00, 0x01, 0x00, 0x58, 0x21, 0x12, 0xa4, 0x42, 0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6,
        0x86, 0xfa, 0x87, 0xdf, 0xae, 0x80, 0x22, 0x00, 0x10, 0x53, 0x54, 0x55, 0x4e, 0x20, 0x74,
        0x65, 0x73, 0x74, 0x20, 0x63, 0x6c, 0x69, 0x65, 0x6e, 0x74, 0x00, 0x24, 0x00, 0x04, 0x6e,
        0x00, 0x01, 0xff, 0x80, 0x29, 0x00, 0x08, 0x93, 0x2f, 0xf9, 0xb1, 0x51, 0x26, 0x3b, 0x36,
        0x00, 0x06, 0x00, 0x09, 0x65, 0x76, 0x74, 0x6a, 0x3a, 0x68, 0x36, 0x76, 0x59, 0x20, 0x20,
        0x20, 0x00, 0x08, 0x00, 0x14, 0x9a, 0xea, 0xa7, 0x0c, 0xbf, 0xd8, 0xcb, 0x56, 0x78, 0x1e,
        0xf2, 0xb5, 0xb2, 0xd3, 0xf2, 0x49, 0xc1, 0xb5, 0x71, 0xa2, 0x80, 0x28, 0x00, 0x04, 0xe5,
        0x7a, 0x3b, 0xcf,
    ];

    /// RFC 5769 2.2, sample IPv4 response.
    const SAMPLE_RESPONSE: [u8; 80] = [
        0x01, 0x01, 0x00, 0x3c, 0x21, 0x12, 0xa4, 0x42, 0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6,
        0x86, 0xfa, 0x87, 0xdf, 0xae, 0x80, 0x22, 0x00, 0x0b, 0x74, 0x65, 0x73, 0x74, 0x20, 0x76,
        0x65, 0x63, 0x74, 0x6f, 0x72, 0x20, 0x00, 0x20, 0x00, 0x08, 0x00, 0x01, 0xa1, 0x47, 0xe1,
        0x12, 0xa6, 0x43, 0x00, 0x08, 0x00, 0x14, 0x2b, 0x91, 0xf5, 0x99, 0xfd, 0x9e, 0x90, 0xc3,
        0x8c, 0x74, 0x89, 0xf9, 0x2a, 0xf9, 0xba, 0x53, 0xf0, 0x6b, 0xe7, 0xd7, 0x80, 0x28, 0x00,
        0x04, 0xc0, 0x7d, 0x4c, 0x96,
    ];

    const SAMPLE_PASSWORD: &str = "VOkJxbRl1RmTxUk/WvJxBt";

    #[test]
    fn decode_rfc5769_request() {
        let mut attributes = Vec::new();
        let message = MessageReader::decode(&SAMPLE_REQUEST[..], &mut attributes).unwrap();

        assert_eq!(message.method, Method::Binding(Kind::Request));
        assert_eq!(message.get::<UserName>().unwrap(), "evtj:h6vY");
        assert_eq!(message.get::<Software>().unwrap(), "STUN test client");
        assert_eq!(message.get::<Priority>().unwrap(), 0x6e0001ff);
        assert_eq!(message.get::<IceControlled>().unwrap(), 0x932ff9b151263b36);
        assert!(message.has_integrity());
        message.integrity(SAMPLE_PASSWORD.as_bytes()).unwrap();
    }

    #[test]
    fn decode_rfc5769_request_wrong_key() {
        let mut attributes = Vec::new();
        let message = MessageReader::decode(&SAMPLE_REQUEST[..], &mut attributes).unwrap();

        assert_eq!(
            message.integrity(b"not-the-password"),
            Err(StunError::IntegrityMismatch)
        );
    }

    #[test]
    fn decode_rfc5769_response() {
        let mut attributes = Vec::new();
        let message = MessageReader::decode(&SAMPLE_RESPONSE[..], &mut attributes).unwrap();

        assert_eq!(message.method, Method::Binding(Kind::Response));
        assert_eq!(
            message.get::<XorMappedAddress>().unwrap(),
            "192.0.2.1:32853".parse().unwrap()
        );

        message.integrity(SAMPLE_PASSWORD.as_bytes()).unwrap();
    }

    #[test]
    fn reject_bad_cookie() {
        let mut bytes = SAMPLE_REQUEST;
        bytes[4] = 0x42;

        let mut attributes = Vec::new();
        assert_eq!(
            MessageReader::decode(&bytes[..], &mut attributes).unwrap_err(),
            StunError::Malformed
        );
    }

    #[test]
    fn reject_corrupt_fingerprint() {
        let mut bytes = SAMPLE_REQUEST;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let mut attributes = Vec::new();
        assert_eq!(
            MessageReader::decode(&bytes[..], &mut attributes).unwrap_err(),
            StunError::Malformed
        );
    }

    #[test]
    fn reject_truncated_attribute() {
        // header claims 8 bytes of body, attribute claims 12.
        let mut bytes = Vec::from(&SAMPLE_REQUEST[..20]);
        bytes[2] = 0;
        bytes[3] = 8;
        bytes.extend_from_slice(&[0x00, 0x06, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x00]);

        let mut attributes = Vec::new();
        assert_eq!(
            MessageReader::decode(&bytes[..], &mut attributes).unwrap_err(),
            StunError::Malformed
        );
    }

    #[test]
    fn reject_length_beyond_buffer() {
        let mut bytes = Vec::from(&SAMPLE_REQUEST[..20]);
        bytes[2] = 0xff;
        bytes[3] = 0xfc;

        let mut attributes = Vec::new();
        assert_eq!(
            MessageReader::decode(&bytes[..], &mut attributes).unwrap_err(),
            StunError::Malformed
        );
    }

    #[test]
    fn arbitrary_bytes_never_panic() {
        for len in 0..64usize {
            let bytes: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(37)).collect();
            let mut attributes = Vec::new();
            let _ = MessageReader::decode(&bytes, &mut attributes);
        }
    }

    #[test]
    fn unknown_required_attribute() {
        let mut bytes = Vec::from(&SAMPLE_REQUEST[..20]);
        bytes[2] = 0;
        bytes[3] = 8;
        // type 0x7fff is comprehension-required and unassigned.
        bytes.extend_from_slice(&[0x7f, 0xff, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]);

        let mut attributes = Vec::new();
        assert_eq!(
            MessageReader::decode(&bytes[..], &mut attributes).unwrap_err(),
            StunError::UnknownRequired(vec![0x7fff])
        );
    }

    #[test]
    fn round_trip_with_short_term_key() {
        let token = [7u8; 12];
        let mut buf = BytesMut::with_capacity(1280);
        let mut writer = MessageWriter::new(Method::Binding(Kind::Request), &token, &mut buf);

        writer.append::<UserName>("WmZ6:evtj");
        writer.append::<Priority>(0x6e0001ff);
        writer.flush(Some(b"VOkJxbRl1RmTxUk/WvJxBt")).unwrap();

        let mut attributes = Vec::new();
        let message = MessageReader::decode(&buf[..], &mut attributes).unwrap();
        assert_eq!(message.method, Method::Binding(Kind::Request));
        assert_eq!(message.token, &token[..]);
        assert_eq!(message.get::<UserName>().unwrap(), "WmZ6:evtj");
        assert_eq!(message.get::<Priority>().unwrap(), 0x6e0001ff);
        message.integrity(b"VOkJxbRl1RmTxUk/WvJxBt").unwrap();
    }

    #[test]
    fn error_response_round_trip() {
        use crate::attribute::{ErrKind, Error};

        let token = [3u8; 12];
        let mut buf = BytesMut::with_capacity(1280);
        let mut writer = MessageWriter::new(Method::Binding(Kind::Error), &token, &mut buf);

        writer.append::<ErrorCode>(Error::from(ErrKind::RoleConflict));
        writer.flush(None).unwrap();

        let mut attributes = Vec::new();
        let message = MessageReader::decode(&buf[..], &mut attributes).unwrap();
        let error = message.get::<ErrorCode>().unwrap();
        assert_eq!(error.code, 487);
        assert_eq!(message.integrity(b"any"), Err(StunError::IntegrityMissing));
    }
}
