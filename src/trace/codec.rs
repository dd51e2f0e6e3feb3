//! Little-endian field helpers shared by the header and packet codecs.

use crate::error::CaptureError;

pub(crate) struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], what: &'static str) -> Self {
        FieldReader { bytes, pos: 0, what }
    }

    pub(crate) fn take<const N: usize>(&mut self) -> Result<[u8; N], CaptureError> {
        let end = self.pos + N;
        if end > self.bytes.len() {
            return Err(CaptureError::InvalidTrace(format!(
                "{} truncated: need {} bytes, have {}",
                self.what,
                end,
                self.bytes.len()
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CaptureError> {
        Ok(self.take::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CaptureError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CaptureError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CaptureError> {
        Ok(u64::from_le_bytes(self.take()?))
    }
}

/// Packs up to 8 bytes of an ASCII tag into a u64, zero padded.
pub(crate) fn pack_tag(tag: &str) -> u64 {
    let mut buf = [0u8; 8];
    for (dst, src) in buf.iter_mut().zip(tag.bytes()) {
        *dst = src;
    }
    u64::from_le_bytes(buf)
}

pub(crate) fn unpack_tag(value: u64) -> String {
    value
        .to_le_bytes()
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}
