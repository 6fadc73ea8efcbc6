use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{digest::CtOutput, Hmac, Mac};
use md5::{Digest, Md5};

use crate::StunError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// compute padding size.
///
/// attribute values are padded out to a multiple of 4 bytes;
/// the padding is not counted in the attribute length.
///
/// # Unit Test
///
/// ```
/// assert_eq!(stun::util::pad_size(4), 0);
/// assert_eq!(stun::util::pad_size(0), 0);
/// assert_eq!(stun::util::pad_size(5), 3);
/// ```
#[inline(always)]
pub fn pad_size(size: usize) -> usize {
    let range = size % 4;
    if size == 0 || range == 0 {
        return 0;
    }

    4 - range
}

/// create long term credential key.
///
/// > key = MD5(username ":" OpaqueString(realm) ":" OpaqueString(password))
///
/// # Unit Test
///
/// ```
/// let buffer = [
///     0x3eu8, 0x2f, 0x79, 0x1e, 0x1f, 0x14, 0xd1, 0x73, 0xfc, 0x91, 0xff,
///     0x2f, 0x59, 0xb5, 0x0f, 0xd1,
/// ];
///
/// let key = stun::util::long_term_key("panda", "panda", "raspberry");
/// assert_eq!(key, buffer);
/// ```
pub fn long_term_key(username: &str, password: &str, realm: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update([username, realm, password].join(":"));
    hasher.finalize().into()
}

/// HMAC SHA1 digest over a list of buffer fragments.
///
/// fragments let the caller splice in a virtually rewritten length
/// field without copying the message.
pub fn hmac_sha1(key: &[u8], source: &[&[u8]]) -> Result<CtOutput<Hmac<sha1::Sha1>>, StunError> {
    match Hmac::<sha1::Sha1>::new_from_slice(key) {
        Err(_) => Err(StunError::Malformed),
        Ok(mut mac) => {
            for buf in source {
                mac.update(buf);
            }

            Ok(mac.finalize())
        }
    }
}

/// CRC32 Fingerprint.
///
/// # Unit Test
///
/// ```
/// assert_eq!(stun::util::fingerprint(b"1"), 3498621689);
/// ```
pub fn fingerprint(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes) ^ 0x5354_554e
}

/// read a big-endian u16 from the head of a slice.
#[inline(always)]
pub fn as_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}
