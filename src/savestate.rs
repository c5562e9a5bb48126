//! Save-state lump buffer.
//!
//! Each device writes a `{name, size}` header followed by its
//! architected state, serialised field by field.  Restore walks the
//! lumps in the same order, validating name and size before a byte is
//! copied.  Non-serialisable resources (host files, sockets, armed
//! timers) are not part of a lump: devices re-arm them lazily after a
//! restore, the same way they do after power-on.

use crate::error::SaveStateError;

pub struct StateBuf {
    lumps: Vec<(String, Vec<u8>)>,
    cursor: usize,
}

impl Default for StateBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBuf {
    pub fn new() -> Self {
        Self {
            lumps: Vec::new(),
            cursor: 0,
        }
    }

    pub fn write_lump(&mut self, name: &str, data: Vec<u8>) {
        self.lumps.push((name.to_string(), data));
    }

    /// Take the next lump, validating its header.
    pub fn read_lump(&mut self, expected: &str) -> Result<LumpReader, SaveStateError> {
        let (name, data) = self
            .lumps
            .get(self.cursor)
            .ok_or_else(|| SaveStateError::Truncated(expected.to_string()))?;
        if name != expected {
            return Err(SaveStateError::BadHeader {
                expected: expected.to_string(),
                found: name.clone(),
            });
        }
        self.cursor += 1;
        Ok(LumpReader {
            name: name.clone(),
            data: data.clone(),
            pos: 0,
        })
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Flat wire form: repeated (name_len, name, size, data).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in &self.lumps {
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, SaveStateError> {
        let mut lumps = Vec::new();
        let mut pos = 0usize;
        while pos < raw.len() {
            let take = |pos: &mut usize, n: usize| -> Result<Vec<u8>, SaveStateError> {
                if *pos + n > raw.len() {
                    return Err(SaveStateError::Truncated("state buffer".to_string()));
                }
                let v = raw[*pos..*pos + n].to_vec();
                *pos += n;
                Ok(v)
            };
            let name_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
            let name = String::from_utf8(take(&mut pos, name_len)?)
                .map_err(|_| SaveStateError::Truncated("lump name".to_string()))?;
            let size = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
            let data = take(&mut pos, size)?;
            lumps.push((name, data));
        }
        Ok(Self { lumps, cursor: 0 })
    }
}

// ── Field serialisation helpers ───────────────────────────────

#[derive(Default)]
pub struct LumpWriter {
    buf: Vec<u8>,
}

impl LumpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct LumpReader {
    name: String,
    data: Vec<u8>,
    pos: usize,
}

impl LumpReader {
    fn take(&mut self, n: usize) -> Result<&[u8], SaveStateError> {
        if self.pos + n > self.data.len() {
            return Err(SaveStateError::SizeMismatch {
                name: self.name.clone(),
                expected: self.pos + n,
                found: self.data.len(),
            });
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8, SaveStateError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, SaveStateError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16, SaveStateError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, SaveStateError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, SaveStateError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, SaveStateError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, SaveStateError> {
        Ok(self.take(n)?.to_vec())
    }

    /// Restore must consume exactly what save produced.
    pub fn expect_end(&self) -> Result<(), SaveStateError> {
        if self.pos != self.data.len() {
            return Err(SaveStateError::SizeMismatch {
                name: self.name.clone(),
                expected: self.pos,
                found: self.data.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lump_roundtrip_through_wire_form() {
        let mut state = StateBuf::new();
        let mut w = LumpWriter::new();
        w.put_u8(0x42);
        w.put_u16(0xBEEF);
        w.put_u64(123_456_789);
        state.write_lump("pic", w.finish());
        state.write_lump("pit", vec![1, 2, 3]);

        let mut back = StateBuf::from_bytes(&state.to_bytes()).unwrap();
        let mut r = back.read_lump("pic").unwrap();
        assert_eq!(r.get_u8().unwrap(), 0x42);
        assert_eq!(r.get_u16().unwrap(), 0xBEEF);
        assert_eq!(r.get_u64().unwrap(), 123_456_789);
        r.expect_end().unwrap();
        let r = back.read_lump("pit").unwrap();
        drop(r);
    }

    #[test]
    fn wrong_name_is_rejected() {
        let mut state = StateBuf::new();
        state.write_lump("pic", vec![0]);
        let err = state.read_lump("pit").unwrap_err();
        assert!(matches!(err, SaveStateError::BadHeader { .. }));
    }

    #[test]
    fn short_lump_is_rejected() {
        let mut state = StateBuf::new();
        state.write_lump("dma", vec![0]);
        let mut r = state.read_lump("dma").unwrap();
        assert!(r.get_u32().is_err());
    }
}
