//! Run-length column encoders for the V2 wire format.
//!
//! The V2 update layout writes each struct field into its own column
//! so runs of equal or arithmetically related values pack tightly.
//! Encoders buffer one pending run; decoders replay runs without
//! materializing them. A trailing run is not terminated on the wire:
//! the decoder repeats the last value once its column is exhausted.

use weave_buffers::{BufferError, Reader, Writer};

/// Byte column with run-length packing: value, then repeat count minus
/// one before the next distinct value.
pub(crate) struct RleEncoder {
    w: Writer,
    last: Option<u8>,
    count: u32,
}

impl RleEncoder {
    pub fn new() -> Self {
        Self {
            w: Writer::new(),
            last: None,
            count: 0,
        }
    }

    pub fn write(&mut self, value: u8) {
        if self.last == Some(value) {
            self.count += 1;
        } else {
            if self.count > 0 {
                self.w.var_u32(self.count - 1);
            }
            self.w.u8(value);
            self.last = Some(value);
            self.count = 1;
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.w.flush()
    }
}

pub(crate) struct RleDecoder<'a> {
    r: Reader<'a>,
    last: u8,
    /// Remaining repeats; `None` once the column is exhausted and the
    /// last value repeats forever.
    count: Option<u32>,
}

impl<'a> RleDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            r: Reader::new(data),
            last: 0,
            count: Some(0),
        }
    }

    pub fn read(&mut self) -> Result<u8, BufferError> {
        if self.count == Some(0) {
            self.last = self.r.u8()?;
            if self.r.is_empty() {
                self.count = None;
            } else {
                self.count = Some(self.r.var_u32()? + 1);
            }
        }
        if let Some(count) = &mut self.count {
            *count -= 1;
        }
        Ok(self.last)
    }
}

/// Unsigned column with optional runs: the low bit of the header flags
/// a run, in which case the repeat count minus two follows.
pub(crate) struct UintOptRleEncoder {
    w: Writer,
    last: u32,
    count: u32,
}

impl UintOptRleEncoder {
    pub fn new() -> Self {
        Self {
            w: Writer::new(),
            last: 0,
            count: 0,
        }
    }

    pub fn write(&mut self, value: u32) {
        if self.count > 0 && self.last == value {
            self.count += 1;
        } else {
            self.flush_run();
            self.last = value;
            self.count = 1;
        }
    }

    fn flush_run(&mut self) {
        if self.count == 1 {
            self.w.var_u64((self.last as u64) << 1);
        } else if self.count > 1 {
            self.w.var_u64(((self.last as u64) << 1) | 1);
            self.w.var_u32(self.count - 2);
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.flush_run();
        self.w.flush()
    }
}

pub(crate) struct UintOptRleDecoder<'a> {
    r: Reader<'a>,
    last: u32,
    count: u32,
}

impl<'a> UintOptRleDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            r: Reader::new(data),
            last: 0,
            count: 0,
        }
    }

    pub fn read(&mut self) -> Result<u32, BufferError> {
        if self.count == 0 {
            let header = self.r.var_u64()?;
            self.last = (header >> 1) as u32;
            self.count = if header & 1 == 1 {
                self.r.var_u32()? + 2
            } else {
                1
            };
        }
        self.count -= 1;
        Ok(self.last)
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Unsigned column encoded as consecutive differences, with runs of
/// equal differences packed. Clock sequences are mostly arithmetic, so
/// this collapses them to a handful of bytes.
pub(crate) struct IntDiffOptRleEncoder {
    w: Writer,
    last: i64,
    diff: i64,
    count: u32,
}

impl IntDiffOptRleEncoder {
    pub fn new() -> Self {
        Self {
            w: Writer::new(),
            last: 0,
            diff: 0,
            count: 0,
        }
    }

    pub fn write(&mut self, value: u32) {
        let value = value as i64;
        if self.count > 0 && self.diff == value - self.last {
            self.last = value;
            self.count += 1;
        } else {
            self.flush_run();
            self.diff = value - self.last;
            self.last = value;
            self.count = 1;
        }
    }

    fn flush_run(&mut self) {
        if self.count == 0 {
            return;
        }
        let header = zigzag(self.diff) << 1;
        if self.count == 1 {
            self.w.var_u64(header);
        } else {
            self.w.var_u64(header | 1);
            self.w.var_u32(self.count - 2);
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.flush_run();
        self.w.flush()
    }
}

pub(crate) struct IntDiffOptRleDecoder<'a> {
    r: Reader<'a>,
    last: i64,
    diff: i64,
    count: u32,
}

impl<'a> IntDiffOptRleDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            r: Reader::new(data),
            last: 0,
            diff: 0,
            count: 0,
        }
    }

    pub fn read(&mut self) -> Result<u32, BufferError> {
        if self.count == 0 {
            let header = self.r.var_u64()?;
            self.diff = unzigzag(header >> 1);
            self.count = if header & 1 == 1 {
                self.r.var_u32()? + 2
            } else {
                1
            };
        }
        self.last += self.diff;
        self.count -= 1;
        Ok(self.last as u32)
    }
}

/// String column: all strings concatenated into one buffer plus a
/// length column counting chars.
pub(crate) struct StringEncoder {
    s: String,
    lens: UintOptRleEncoder,
}

impl StringEncoder {
    pub fn new() -> Self {
        Self {
            s: String::new(),
            lens: UintOptRleEncoder::new(),
        }
    }

    pub fn write(&mut self, s: &str) {
        self.s.push_str(s);
        self.lens.write(s.chars().count() as u32);
    }

    pub fn finish(self) -> Vec<u8> {
        let mut w = Writer::new();
        w.var_string(&self.s);
        w.buf(&self.lens.finish());
        w.flush()
    }
}

pub(crate) struct StringDecoder<'a> {
    s: &'a str,
    pos: usize,
    lens: UintOptRleDecoder<'a>,
}

impl<'a> StringDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, BufferError> {
        let mut r = Reader::new(data);
        let s = r.var_string()?;
        let rest = r.rest();
        Ok(Self {
            s,
            pos: 0,
            lens: UintOptRleDecoder::new(rest),
        })
    }

    pub fn read(&mut self) -> Result<String, BufferError> {
        let chars = self.lens.read()? as usize;
        let tail = &self.s[self.pos..];
        let byte_len = tail
            .char_indices()
            .nth(chars)
            .map(|(i, _)| i)
            .unwrap_or(tail.len());
        let out = &tail[..byte_len];
        self.pos += byte_len;
        Ok(out.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle_roundtrip() {
        let values = [1u8, 1, 1, 2, 3, 3, 3, 3, 0];
        let mut enc = RleEncoder::new();
        for v in values {
            enc.write(v);
        }
        let data = enc.finish();
        let mut dec = RleDecoder::new(&data);
        for v in values {
            assert_eq!(dec.read().unwrap(), v);
        }
    }

    #[test]
    fn rle_trailing_run_repeats() {
        let mut enc = RleEncoder::new();
        for _ in 0..5 {
            enc.write(7);
        }
        let data = enc.finish();
        let mut dec = RleDecoder::new(&data);
        for _ in 0..5 {
            assert_eq!(dec.read().unwrap(), 7);
        }
    }

    #[test]
    fn uint_opt_rle_roundtrip() {
        let values = [0u32, 0, 0, 1, 5, 5, 5, 5, 2, u32::MAX, u32::MAX];
        let mut enc = UintOptRleEncoder::new();
        for v in values {
            enc.write(v);
        }
        let data = enc.finish();
        let mut dec = UintOptRleDecoder::new(&data);
        for v in values {
            assert_eq!(dec.read().unwrap(), v);
        }
    }

    #[test]
    fn int_diff_opt_rle_roundtrip() {
        let values = [0u32, 1, 2, 3, 10, 20, 30, 29, 28, 1000, 1000];
        let mut enc = IntDiffOptRleEncoder::new();
        for v in values {
            enc.write(v);
        }
        let data = enc.finish();
        let mut dec = IntDiffOptRleDecoder::new(&data);
        for v in values {
            assert_eq!(dec.read().unwrap(), v);
        }
    }

    #[test]
    fn zigzag_roundtrip() {
        for v in [0i64, 1, -1, i64::MAX, i64::MIN + 1] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    #[test]
    fn string_column_roundtrip() {
        let values = ["hello", "", "wörld", "𝄞x", "tail"];
        let mut enc = StringEncoder::new();
        for v in values {
            enc.write(v);
        }
        let data = enc.finish();
        let mut dec = StringDecoder::new(&data).unwrap();
        for v in values {
            assert_eq!(dec.read().unwrap(), v);
        }
    }
}
