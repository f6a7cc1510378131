//! # RPC wire framing
//!
//! Fixed-layout encoding of records into an `IoBuffer`. Each field type
//! knows its encoded `size()` and moves a shared cursor on encode/decode.
//!
//! Layout (all integers big endian):
//!
//! | type       | encoding                         |
//! |------------|----------------------------------|
//! | `u8..u64`  | fixed width                      |
//! | `String`   | `u32` byte length + UTF-8 bytes  |
//! | `Vec<T>`   | `u32` element count + elements   |
//! | `[u8; N]`  | `N` raw bytes                    |
//!
//! A packet is a 10-byte header followed by a body:
//!
//! ```text
//!   0        1        2               6               10
//!   +--------+--------+---------------+---------------+--------- - -
//!   | opcode | opver  | size (total)  | cksum         | body ...
//!   +--------+--------+---------------+---------------+--------- - -
//! ```
//!
//! `cksum` is Adler-32 over the whole packet with the checksum field read
//! as zero. A mismatch on decode is `Error::Corrupt`.

use bblocks_core::{Adler32, Error, IoBuffer, Result};

/// A value with a fixed wire encoding.
pub trait RpcData {
    fn encode(&self, buf: &IoBuffer, pos: &mut usize) -> Result<()>;
    fn decode(&mut self, buf: &IoBuffer, pos: &mut usize) -> Result<()>;
    /// Encoded size in bytes.
    fn size(&self) -> usize;
}

fn put(buf: &IoBuffer, pos: &mut usize, bytes: &[u8]) -> Result<()> {
    let end = *pos + bytes.len();
    if end > buf.size() {
        return Err(Error::InvalidArgument("encode past end of buffer"));
    }
    buf.write_at(*pos, bytes);
    *pos = end;
    Ok(())
}

fn take<const N: usize>(buf: &IoBuffer, pos: &mut usize) -> Result<[u8; N]> {
    let end = *pos + N;
    if end > buf.size() {
        return Err(Error::Corrupt);
    }
    let mut out = [0u8; N];
    buf.read_at(*pos, &mut out);
    *pos = end;
    Ok(out)
}

macro_rules! rpc_int {
    ($($t:ty),*) => {$(
        impl RpcData for $t {
            fn encode(&self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
                put(buf, pos, &self.to_be_bytes())
            }

            fn decode(&mut self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
                *self = <$t>::from_be_bytes(take(buf, pos)?);
                Ok(())
            }

            #[inline]
            fn size(&self) -> usize {
                std::mem::size_of::<$t>()
            }
        }
    )*};
}

rpc_int!(u8, u16, u32, u64);

fn encode_len(len: usize, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| Error::InvalidArgument("length exceeds u32"))?;
    len.encode(buf, pos)
}

fn decode_len(buf: &IoBuffer, pos: &mut usize) -> Result<usize> {
    let mut len = 0u32;
    len.decode(buf, pos)?;
    let len = len as usize;
    // cheap sanity bound before allocating
    if len > buf.size() {
        return Err(Error::Corrupt);
    }
    Ok(len)
}

impl RpcData for String {
    fn encode(&self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
        encode_len(self.len(), buf, pos)?;
        put(buf, pos, self.as_bytes())
    }

    fn decode(&mut self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
        let len = decode_len(buf, pos)?;
        if *pos + len > buf.size() {
            return Err(Error::Corrupt);
        }
        let mut bytes = vec![0u8; len];
        buf.read_at(*pos, &mut bytes);
        *pos += len;
        *self = String::from_utf8(bytes).map_err(|_| Error::Corrupt)?;
        Ok(())
    }

    fn size(&self) -> usize {
        4 + self.len()
    }
}

impl<T: RpcData + Default> RpcData for Vec<T> {
    fn encode(&self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
        encode_len(self.len(), buf, pos)?;
        self.iter().try_for_each(|v| v.encode(buf, pos))
    }

    fn decode(&mut self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
        let n = decode_len(buf, pos)?;
        self.clear();
        self.reserve(n);
        for _ in 0..n {
            let mut v = T::default();
            v.decode(buf, pos)?;
            self.push(v);
        }
        Ok(())
    }

    fn size(&self) -> usize {
        4 + self.iter().map(RpcData::size).sum::<usize>()
    }
}

impl<const N: usize> RpcData for [u8; N] {
    fn encode(&self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
        put(buf, pos, self)
    }

    fn decode(&mut self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
        *self = take(buf, pos)?;
        Ok(())
    }

    fn size(&self) -> usize {
        N
    }
}

/// Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RpcPacket {
    pub opcode: u8,
    pub opver: u8,
    /// Total encoded size, header included
    pub size: u32,
    pub cksum: u32,
}

impl RpcPacket {
    pub const HEADER_SIZE: usize = 10;
    const CKSUM_OFFSET: usize = 6;

    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            ..Default::default()
        }
    }

    /// Adler-32 of the first `len` bytes with the checksum field zeroed.
    pub fn checksum(buf: &IoBuffer, len: usize) -> u32 {
        buf.with(|b| {
            let mut a = Adler32::new();
            a.update(&b[..Self::CKSUM_OFFSET]);
            a.update(&[0u8; 4]);
            a.update(&b[Self::HEADER_SIZE..len]);
            a.hash()
        })
    }

    /// Compute the checksum of an encoded packet and store it in place.
    pub fn encode_hash(&mut self, buf: &IoBuffer) -> Result<()> {
        let len = self.size as usize;
        if len < Self::HEADER_SIZE || len > buf.size() {
            return Err(Error::InvalidArgument("packet size outside buffer"));
        }
        self.cksum = Self::checksum(buf, len);
        let mut pos = Self::CKSUM_OFFSET;
        self.cksum.encode(buf, &mut pos)
    }

    /// Whether the packet in `buf` carries a matching checksum.
    pub fn is_valid(buf: &IoBuffer) -> bool {
        let mut hdr = RpcPacket::default();
        let mut pos = 0;
        if hdr.decode(buf, &mut pos).is_err() {
            return false;
        }
        let len = hdr.size as usize;
        len >= Self::HEADER_SIZE && len <= buf.size() && Self::checksum(buf, len) == hdr.cksum
    }
}

impl RpcData for RpcPacket {
    fn encode(&self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
        self.opcode.encode(buf, pos)?;
        self.opver.encode(buf, pos)?;
        self.size.encode(buf, pos)?;
        self.cksum.encode(buf, pos)
    }

    fn decode(&mut self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
        self.opcode.decode(buf, pos)?;
        self.opver.decode(buf, pos)?;
        self.size.decode(buf, pos)?;
        self.cksum.decode(buf, pos)
    }

    fn size(&self) -> usize {
        Self::HEADER_SIZE
    }
}

/// A header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet<T> {
    pub header: RpcPacket,
    pub body: T,
}

impl<T: RpcData> Packet<T> {
    pub fn new(opcode: u8, body: T) -> Self {
        Self {
            header: RpcPacket::new(opcode),
            body,
        }
    }

    pub fn size(&self) -> usize {
        RpcPacket::HEADER_SIZE + self.body.size()
    }

    /// Encode at offset 0 and seal with the checksum.
    pub fn encode(&mut self, buf: &IoBuffer) -> Result<()> {
        let size = self.size();
        if buf.size() < size {
            return Err(Error::InvalidArgument("buffer smaller than packet"));
        }
        self.header.size = u32::try_from(size).map_err(|_| Error::InvalidArgument("packet too large"))?;
        self.header.cksum = 0;
        let mut pos = 0;
        self.header.encode(buf, &mut pos)?;
        self.body.encode(buf, &mut pos)?;
        self.header.encode_hash(buf)
    }

    /// Decode from offset 0, verifying the checksum first.
    pub fn decode(&mut self, buf: &IoBuffer) -> Result<()> {
        if !RpcPacket::is_valid(buf) {
            return Err(Error::Corrupt);
        }
        let mut pos = 0;
        self.header.decode(buf, &mut pos)?;
        self.body.decode(buf, &mut pos)?;
        if pos != self.header.size as usize {
            return Err(Error::Corrupt);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Data {
        i16_: u16,
        i32_: u32,
        i64_: u64,
        s: String,
        lu32: Vec<u32>,
        lu64: Vec<u64>,
        lstr: Vec<String>,
        raw: [u8; 10],
    }

    impl RpcData for Data {
        fn encode(&self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
            self.i16_.encode(buf, pos)?;
            self.i32_.encode(buf, pos)?;
            self.i64_.encode(buf, pos)?;
            self.s.encode(buf, pos)?;
            self.lu32.encode(buf, pos)?;
            self.lu64.encode(buf, pos)?;
            self.lstr.encode(buf, pos)?;
            self.raw.encode(buf, pos)
        }

        fn decode(&mut self, buf: &IoBuffer, pos: &mut usize) -> Result<()> {
            self.i16_.decode(buf, pos)?;
            self.i32_.decode(buf, pos)?;
            self.i64_.decode(buf, pos)?;
            self.s.decode(buf, pos)?;
            self.lu32.decode(buf, pos)?;
            self.lu64.decode(buf, pos)?;
            self.lstr.decode(buf, pos)?;
            self.raw.decode(buf, pos)
        }

        fn size(&self) -> usize {
            self.i16_.size()
                + self.i32_.size()
                + self.i64_.size()
                + self.s.size()
                + self.lu32.size()
                + self.lu64.size()
                + self.lstr.size()
                + self.raw.size()
        }
    }

    fn sample() -> Data {
        Data {
            i16_: 257,
            i32_: 55,
            i64_: 555,
            s: "5555".to_string(),
            lu32: vec![2, 4, 16],
            lu64: vec![32, 64, 128],
            lstr: vec!["a".into(), "b".into(), "c".into()],
            raw: [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
        }
    }

    #[test]
    fn test_datatypes_roundtrip_and_size() {
        let data = sample();
        let buf = IoBuffer::alloc(data.size());
        let mut pos = 0;
        data.encode(&buf, &mut pos).unwrap();
        // every field counted, raw block included
        assert_eq!(pos, data.size());
        assert_eq!(data.size(), 2 + 4 + 8 + 8 + 16 + 28 + 19 + 10);

        let mut out = Data::default();
        let mut pos = 0;
        out.decode(&buf, &mut pos).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_big_endian_layout() {
        let buf = IoBuffer::alloc(6);
        let mut pos = 0;
        0x0102u16.encode(&buf, &mut pos).unwrap();
        0x0a0b0c0du32.encode(&buf, &mut pos).unwrap();
        assert_eq!(buf.to_vec(), vec![1, 2, 0x0a, 0x0b, 0x0c, 0x0d]);
    }

    #[test]
    fn test_encode_overflow_rejected() {
        let buf = IoBuffer::alloc(3);
        let mut pos = 0;
        assert!(0u32.encode(&buf, &mut pos).is_err());
        assert_eq!(pos, 0);
    }

    #[test]
    fn test_truncated_decode_is_corrupt() {
        let buf = IoBuffer::from_slice(&[0, 0, 0, 9, b'x']);
        let mut s = String::new();
        let mut pos = 0;
        assert_eq!(s.decode(&buf, &mut pos), Err(Error::Corrupt));
    }

    #[test]
    fn test_packet_roundtrip() {
        let mut pkt = Packet::new(0xdd, 9u32);
        assert_eq!(pkt.size(), 14);
        let buf = IoBuffer::alloc(pkt.size());
        pkt.encode(&buf).unwrap();
        assert_eq!(pkt.header.size, 14);
        assert_ne!(pkt.header.cksum, 0);
        assert!(RpcPacket::is_valid(&buf));

        let mut out = Packet::<u32>::default();
        out.decode(&buf).unwrap();
        assert_eq!(out, pkt);
        assert_eq!(out.body, 9);
        assert_eq!(out.header.opcode, 0xdd);
    }

    #[test]
    fn test_packet_corruption_detected() {
        let mut pkt = Packet::new(0x10, sample());
        let buf = IoBuffer::alloc(pkt.size());
        pkt.encode(&buf).unwrap();

        buf.with_mut(|b| b[20] ^= 0xff);
        assert!(!RpcPacket::is_valid(&buf));
        let mut out = Packet::<Data>::default();
        assert_eq!(out.decode(&buf), Err(Error::Corrupt));
    }
}
