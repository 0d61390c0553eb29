//! Binary codec primitives in TLS presentation-language style.
//!
//! Every integer is big-endian. Variable-length fields carry a `u16` length
//! prefix. Fixed-width fields (ids, key material) are written raw.
//!
//! `Reader` checks the remaining length before every read, so truncated input
//! surfaces as `CodecError::Truncated` and never as an out-of-bounds slice.

use crate::error::CodecError;

pub const MAX_VEC16_LEN: usize = u16::MAX as usize;

#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_fixed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// `u16` length prefix followed by `bytes`.
    pub fn put_vec16(&mut self, field: &'static str, bytes: &[u8]) -> Result<(), CodecError> {
        if bytes.len() > MAX_VEC16_LEN {
            return Err(CodecError::FieldTooLong {
                field,
                len: bytes.len(),
            });
        }
        self.put_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_vec16(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// Succeeds only if every byte was consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_reader_roundtrip() {
        let mut w = Writer::new();
        w.put_u16(0xBEEF);
        w.put_fixed(&[1, 2, 3, 4]);
        w.put_vec16("data", b"xyz").unwrap();
        let bytes = w.finish();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_fixed::<4>().unwrap(), [1, 2, 3, 4]);
        assert_eq!(r.read_vec16().unwrap(), b"xyz");
        r.finish().unwrap();
    }

    #[test]
    fn length_prefix_past_end_is_truncated() {
        // claims 10 bytes, only 2 follow
        let bytes = [0x00, 0x0A, 0x01, 0x02];
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            r.read_vec16(),
            Err(CodecError::Truncated { needed: 10, remaining: 2 })
        ));
    }

    #[test]
    fn oversized_field_rejected() {
        let mut w = Writer::new();
        let big = vec![0u8; MAX_VEC16_LEN + 1];
        assert!(matches!(
            w.put_vec16("name", &big),
            Err(CodecError::FieldTooLong { field: "name", .. })
        ));
    }

    #[test]
    fn trailing_bytes_detected() {
        let r = Reader::new(&[0u8; 3]);
        assert!(matches!(r.finish(), Err(CodecError::TrailingBytes(3))));
    }
}
