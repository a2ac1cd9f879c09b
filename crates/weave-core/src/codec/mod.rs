//! Binary update codecs.
//!
//! Two wire versions share one structural layout and differ only in
//! field encoding: V1 writes every field as a plain varint in stream
//! order, V2 groups fields into per-column run-length encoders and
//! packs runs (see `rle`). Opaque JSON payloads are embedded as CBOR
//! in both versions.

pub(crate) mod rle;

use std::collections::HashMap;
use std::io::Cursor;

use ciborium::value::Value as CborValue;
use serde_json::{Map, Number, Value};
use weave_buffers::{Reader, Writer};

use crate::error::CodecError;
use crate::id::Id;
use self::rle::{
    IntDiffOptRleDecoder, IntDiffOptRleEncoder, RleDecoder, RleEncoder, StringDecoder,
    StringEncoder, UintOptRleDecoder, UintOptRleEncoder,
};

pub(crate) trait UpdateEncoder {
    /// Raw access for framing counts and skip lengths.
    fn rest(&mut self) -> &mut Writer;
    fn reset_ds_cur_val(&mut self);
    fn write_ds_clock(&mut self, clock: u32);
    fn write_ds_len(&mut self, len: u32);
    fn write_left_id(&mut self, id: Id);
    fn write_right_id(&mut self, id: Id);
    fn write_client(&mut self, client: u32);
    fn write_info(&mut self, info: u8);
    fn write_string(&mut self, s: &str);
    fn write_parent_info(&mut self, is_root: bool);
    fn write_type_ref(&mut self, type_ref: u8);
    fn write_len(&mut self, len: u32);
    fn write_any(&mut self, value: &Value);
    fn write_buf(&mut self, data: &[u8]);
    fn write_key(&mut self, key: &str);
    fn finish(self) -> Vec<u8>;
}

pub(crate) trait UpdateDecoder {
    fn read_var_u32(&mut self) -> Result<u32, CodecError>;
    fn reset_ds_cur_val(&mut self);
    fn read_ds_clock(&mut self) -> Result<u32, CodecError>;
    fn read_ds_len(&mut self) -> Result<u32, CodecError>;
    fn read_left_id(&mut self) -> Result<Id, CodecError>;
    fn read_right_id(&mut self) -> Result<Id, CodecError>;
    fn read_client(&mut self) -> Result<u32, CodecError>;
    fn read_info(&mut self) -> Result<u8, CodecError>;
    fn read_string(&mut self) -> Result<String, CodecError>;
    fn read_parent_info(&mut self) -> Result<bool, CodecError>;
    fn read_type_ref(&mut self) -> Result<u8, CodecError>;
    fn read_len(&mut self) -> Result<u32, CodecError>;
    fn read_any(&mut self) -> Result<Value, CodecError>;
    fn read_buf(&mut self) -> Result<Vec<u8>, CodecError>;
    fn read_key(&mut self) -> Result<String, CodecError>;
}

// --- V1 ---

pub(crate) struct EncoderV1 {
    w: Writer,
}

impl EncoderV1 {
    pub fn new() -> Self {
        Self { w: Writer::new() }
    }
}

impl UpdateEncoder for EncoderV1 {
    fn rest(&mut self) -> &mut Writer {
        &mut self.w
    }

    fn reset_ds_cur_val(&mut self) {}

    fn write_ds_clock(&mut self, clock: u32) {
        self.w.var_u32(clock);
    }

    fn write_ds_len(&mut self, len: u32) {
        self.w.var_u32(len);
    }

    fn write_left_id(&mut self, id: Id) {
        self.w.var_u32(id.client);
        self.w.var_u32(id.clock);
    }

    fn write_right_id(&mut self, id: Id) {
        self.w.var_u32(id.client);
        self.w.var_u32(id.clock);
    }

    fn write_client(&mut self, client: u32) {
        self.w.var_u32(client);
    }

    fn write_info(&mut self, info: u8) {
        self.w.u8(info);
    }

    fn write_string(&mut self, s: &str) {
        self.w.var_string(s);
    }

    fn write_parent_info(&mut self, is_root: bool) {
        self.w.var_u32(is_root as u32);
    }

    fn write_type_ref(&mut self, type_ref: u8) {
        self.w.var_u32(type_ref as u32);
    }

    fn write_len(&mut self, len: u32) {
        self.w.var_u32(len);
    }

    fn write_any(&mut self, value: &Value) {
        write_cbor(&mut self.w, value);
    }

    fn write_buf(&mut self, data: &[u8]) {
        self.w.var_buf(data);
    }

    fn write_key(&mut self, key: &str) {
        self.w.var_string(key);
    }

    fn finish(self) -> Vec<u8> {
        self.w.flush()
    }
}

pub(crate) struct DecoderV1<'a> {
    r: Reader<'a>,
}

impl<'a> DecoderV1<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            r: Reader::new(data),
        }
    }
}

impl UpdateDecoder for DecoderV1<'_> {
    fn read_var_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.r.var_u32()?)
    }

    fn reset_ds_cur_val(&mut self) {}

    fn read_ds_clock(&mut self) -> Result<u32, CodecError> {
        Ok(self.r.var_u32()?)
    }

    fn read_ds_len(&mut self) -> Result<u32, CodecError> {
        Ok(self.r.var_u32()?)
    }

    fn read_left_id(&mut self) -> Result<Id, CodecError> {
        Ok(Id::new(self.r.var_u32()?, self.r.var_u32()?))
    }

    fn read_right_id(&mut self) -> Result<Id, CodecError> {
        self.read_left_id()
    }

    fn read_client(&mut self) -> Result<u32, CodecError> {
        Ok(self.r.var_u32()?)
    }

    fn read_info(&mut self) -> Result<u8, CodecError> {
        Ok(self.r.u8()?)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        Ok(self.r.var_string()?.to_string())
    }

    fn read_parent_info(&mut self) -> Result<bool, CodecError> {
        Ok(self.r.var_u32()? == 1)
    }

    fn read_type_ref(&mut self) -> Result<u8, CodecError> {
        Ok(self.r.var_u32()? as u8)
    }

    fn read_len(&mut self) -> Result<u32, CodecError> {
        Ok(self.r.var_u32()?)
    }

    fn read_any(&mut self) -> Result<Value, CodecError> {
        read_cbor(&mut self.r)
    }

    fn read_buf(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(self.r.var_buf()?.to_vec())
    }

    fn read_key(&mut self) -> Result<String, CodecError> {
        self.read_string()
    }
}

// --- V2 ---

pub(crate) struct EncoderV2 {
    rest: Writer,
    ds_cur_val: u32,
    key_clock: IntDiffOptRleEncoder,
    client: UintOptRleEncoder,
    left_clock: IntDiffOptRleEncoder,
    right_clock: IntDiffOptRleEncoder,
    info: RleEncoder,
    string: StringEncoder,
    parent_info: RleEncoder,
    type_ref: UintOptRleEncoder,
    len: UintOptRleEncoder,
    key_map: HashMap<String, u32>,
    next_key: u32,
}

impl EncoderV2 {
    pub fn new() -> Self {
        Self {
            rest: Writer::new(),
            ds_cur_val: 0,
            key_clock: IntDiffOptRleEncoder::new(),
            client: UintOptRleEncoder::new(),
            left_clock: IntDiffOptRleEncoder::new(),
            right_clock: IntDiffOptRleEncoder::new(),
            info: RleEncoder::new(),
            string: StringEncoder::new(),
            parent_info: RleEncoder::new(),
            type_ref: UintOptRleEncoder::new(),
            len: UintOptRleEncoder::new(),
            key_map: HashMap::new(),
            next_key: 0,
        }
    }
}

impl UpdateEncoder for EncoderV2 {
    fn rest(&mut self) -> &mut Writer {
        &mut self.rest
    }

    fn reset_ds_cur_val(&mut self) {
        self.ds_cur_val = 0;
    }

    fn write_ds_clock(&mut self, clock: u32) {
        let diff = clock - self.ds_cur_val;
        self.ds_cur_val = clock;
        self.rest.var_u32(diff);
    }

    fn write_ds_len(&mut self, len: u32) {
        debug_assert!(len > 0);
        self.rest.var_u32(len - 1);
        self.ds_cur_val += len;
    }

    fn write_left_id(&mut self, id: Id) {
        self.client.write(id.client);
        self.left_clock.write(id.clock);
    }

    fn write_right_id(&mut self, id: Id) {
        self.client.write(id.client);
        self.right_clock.write(id.clock);
    }

    fn write_client(&mut self, client: u32) {
        self.client.write(client);
    }

    fn write_info(&mut self, info: u8) {
        self.info.write(info);
    }

    fn write_string(&mut self, s: &str) {
        self.string.write(s);
    }

    fn write_parent_info(&mut self, is_root: bool) {
        self.parent_info.write(is_root as u8);
    }

    fn write_type_ref(&mut self, type_ref: u8) {
        self.type_ref.write(type_ref as u32);
    }

    fn write_len(&mut self, len: u32) {
        self.len.write(len);
    }

    fn write_any(&mut self, value: &Value) {
        write_cbor(&mut self.rest, value);
    }

    fn write_buf(&mut self, data: &[u8]) {
        self.rest.var_buf(data);
    }

    fn write_key(&mut self, key: &str) {
        if let Some(&idx) = self.key_map.get(key) {
            self.key_clock.write(idx);
        } else {
            let idx = self.next_key;
            self.next_key += 1;
            self.key_map.insert(key.to_string(), idx);
            self.key_clock.write(idx);
            self.string.write(key);
        }
    }

    fn finish(self) -> Vec<u8> {
        let mut w = Writer::new();
        // Feature flags, reserved.
        w.var_u32(0);
        w.var_buf(&self.key_clock.finish());
        w.var_buf(&self.client.finish());
        w.var_buf(&self.left_clock.finish());
        w.var_buf(&self.right_clock.finish());
        w.var_buf(&self.info.finish());
        w.var_buf(&self.string.finish());
        w.var_buf(&self.parent_info.finish());
        w.var_buf(&self.type_ref.finish());
        w.var_buf(&self.len.finish());
        w.buf(self.rest.as_slice());
        w.flush()
    }
}

pub(crate) struct DecoderV2<'a> {
    rest: Reader<'a>,
    ds_cur_val: u32,
    key_clock: IntDiffOptRleDecoder<'a>,
    client: UintOptRleDecoder<'a>,
    left_clock: IntDiffOptRleDecoder<'a>,
    right_clock: IntDiffOptRleDecoder<'a>,
    info: RleDecoder<'a>,
    string: StringDecoder<'a>,
    parent_info: RleDecoder<'a>,
    type_ref: UintOptRleDecoder<'a>,
    len: UintOptRleDecoder<'a>,
    keys: Vec<String>,
}

impl<'a> DecoderV2<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        // Feature flags; none are defined for this format revision.
        let flags = r.var_u32()?;
        if flags != 0 {
            return Err(CodecError::UnsupportedVersion(flags as u8));
        }
        let key_clock = r.var_buf()?;
        let client = r.var_buf()?;
        let left_clock = r.var_buf()?;
        let right_clock = r.var_buf()?;
        let info = r.var_buf()?;
        let string = r.var_buf()?;
        let parent_info = r.var_buf()?;
        let type_ref = r.var_buf()?;
        let len = r.var_buf()?;
        Ok(Self {
            rest: Reader::new(r.rest()),
            ds_cur_val: 0,
            key_clock: IntDiffOptRleDecoder::new(key_clock),
            client: UintOptRleDecoder::new(client),
            left_clock: IntDiffOptRleDecoder::new(left_clock),
            right_clock: IntDiffOptRleDecoder::new(right_clock),
            info: RleDecoder::new(info),
            string: StringDecoder::new(string)?,
            parent_info: RleDecoder::new(parent_info),
            type_ref: UintOptRleDecoder::new(type_ref),
            len: UintOptRleDecoder::new(len),
            keys: Vec::new(),
        })
    }
}

impl UpdateDecoder for DecoderV2<'_> {
    fn read_var_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.rest.var_u32()?)
    }

    fn reset_ds_cur_val(&mut self) {
        self.ds_cur_val = 0;
    }

    fn read_ds_clock(&mut self) -> Result<u32, CodecError> {
        self.ds_cur_val += self.rest.var_u32()?;
        Ok(self.ds_cur_val)
    }

    fn read_ds_len(&mut self) -> Result<u32, CodecError> {
        let len = self.rest.var_u32()? + 1;
        self.ds_cur_val += len;
        Ok(len)
    }

    fn read_left_id(&mut self) -> Result<Id, CodecError> {
        Ok(Id::new(self.client.read()?, self.left_clock.read()?))
    }

    fn read_right_id(&mut self) -> Result<Id, CodecError> {
        Ok(Id::new(self.client.read()?, self.right_clock.read()?))
    }

    fn read_client(&mut self) -> Result<u32, CodecError> {
        Ok(self.client.read()?)
    }

    fn read_info(&mut self) -> Result<u8, CodecError> {
        Ok(self.info.read()?)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        Ok(self.string.read()?)
    }

    fn read_parent_info(&mut self) -> Result<bool, CodecError> {
        Ok(self.parent_info.read()? == 1)
    }

    fn read_type_ref(&mut self) -> Result<u8, CodecError> {
        Ok(self.type_ref.read()? as u8)
    }

    fn read_len(&mut self) -> Result<u32, CodecError> {
        Ok(self.len.read()?)
    }

    fn read_any(&mut self) -> Result<Value, CodecError> {
        read_cbor(&mut self.rest)
    }

    fn read_buf(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(self.rest.var_buf()?.to_vec())
    }

    fn read_key(&mut self) -> Result<String, CodecError> {
        let idx = self.key_clock.read()? as usize;
        if idx < self.keys.len() {
            Ok(self.keys[idx].clone())
        } else {
            let key = self.string.read()?;
            self.keys.push(key.clone());
            Ok(key)
        }
    }
}

// --- CBOR payload embedding ---

fn write_cbor(w: &mut Writer, value: &Value) {
    let cbor = json_to_cbor(value);
    let mut tmp = Vec::new();
    ciborium::ser::into_writer(&cbor, &mut tmp).expect("CBOR encode must succeed");
    w.buf(&tmp);
}

fn read_cbor(r: &mut Reader<'_>) -> Result<Value, CodecError> {
    let slice = r.rest();
    let mut cursor = Cursor::new(slice);
    let value: CborValue =
        ciborium::de::from_reader(&mut cursor).map_err(|_| CodecError::InvalidPayload)?;
    let consumed = cursor.position() as usize;
    r.skip(consumed)?;
    cbor_to_json(value)
}

fn json_to_cbor(v: &Value) -> CborValue {
    match v {
        Value::Null => CborValue::Null,
        Value::Bool(b) => CborValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CborValue::Integer(i.into())
            } else if let Some(u) = n.as_u64() {
                CborValue::Integer(u.into())
            } else {
                CborValue::Float(n.as_f64().expect("finite f64"))
            }
        }
        Value::String(s) => CborValue::Text(s.clone()),
        Value::Array(items) => CborValue::Array(items.iter().map(json_to_cbor).collect()),
        Value::Object(map) => CborValue::Map(
            map.iter()
                .map(|(k, v)| (CborValue::Text(k.clone()), json_to_cbor(v)))
                .collect(),
        ),
    }
}

fn cbor_to_json(v: CborValue) -> Result<Value, CodecError> {
    Ok(match v {
        CborValue::Null => Value::Null,
        CborValue::Bool(b) => Value::Bool(b),
        CborValue::Integer(i) => {
            let signed: i128 = i.into();
            if signed >= 0 {
                let u = u64::try_from(signed).map_err(|_| CodecError::InvalidPayload)?;
                Value::Number(Number::from(u))
            } else {
                let s = i64::try_from(signed).map_err(|_| CodecError::InvalidPayload)?;
                Value::Number(Number::from(s))
            }
        }
        CborValue::Float(f) => Number::from_f64(f)
            .map(Value::Number)
            .ok_or(CodecError::InvalidPayload)?,
        CborValue::Text(s) => Value::String(s),
        CborValue::Bytes(bytes) => {
            Value::Array(bytes.into_iter().map(|b| Value::Number(b.into())).collect())
        }
        CborValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(cbor_to_json(item)?);
            }
            Value::Array(out)
        }
        CborValue::Map(entries) => {
            let mut out = Map::new();
            for (k, v) in entries {
                let key = match k {
                    CborValue::Text(s) => s,
                    _ => return Err(CodecError::InvalidPayload),
                };
                out.insert(key, cbor_to_json(v)?);
            }
            Value::Object(out)
        }
        _ => return Err(CodecError::InvalidPayload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cbor_payload_roundtrip() {
        let values = [
            json!(null),
            json!(true),
            json!(42),
            json!(-7),
            json!(1.5),
            json!("text"),
            json!([1, "two", {"three": 3}]),
            json!({"nested": {"deep": [null, false]}}),
        ];
        let mut w = Writer::new();
        for v in &values {
            write_cbor(&mut w, v);
        }
        let data = w.flush();
        let mut r = Reader::new(&data);
        for v in &values {
            assert_eq!(&read_cbor(&mut r).unwrap(), v);
        }
        assert!(r.is_empty());
    }

    #[test]
    fn v1_id_roundtrip() {
        let mut enc = EncoderV1::new();
        enc.write_left_id(Id::new(3, 14));
        enc.write_right_id(Id::new(1, 0));
        let data = enc.finish();
        let mut dec = DecoderV1::new(&data);
        assert_eq!(dec.read_left_id().unwrap(), Id::new(3, 14));
        assert_eq!(dec.read_right_id().unwrap(), Id::new(1, 0));
    }

    #[test]
    fn v2_column_roundtrip() {
        let mut enc = EncoderV2::new();
        enc.write_client(7);
        enc.write_info(0x84);
        enc.write_info(0x84);
        enc.write_string("hello");
        enc.write_key("k");
        enc.write_key("k");
        enc.write_key("other");
        enc.write_len(12);
        enc.write_parent_info(true);
        let data = enc.finish();
        let mut dec = DecoderV2::new(&data).unwrap();
        assert_eq!(dec.read_client().unwrap(), 7);
        assert_eq!(dec.read_info().unwrap(), 0x84);
        assert_eq!(dec.read_info().unwrap(), 0x84);
        assert_eq!(dec.read_string().unwrap(), "hello");
        assert_eq!(dec.read_key().unwrap(), "k");
        assert_eq!(dec.read_key().unwrap(), "k");
        assert_eq!(dec.read_key().unwrap(), "other");
        assert_eq!(dec.read_len().unwrap(), 12);
        assert!(dec.read_parent_info().unwrap());
    }

    #[test]
    fn v2_ds_fields_are_diff_encoded() {
        let mut enc = EncoderV2::new();
        enc.reset_ds_cur_val();
        enc.write_ds_clock(10);
        enc.write_ds_len(5);
        enc.write_ds_clock(20);
        enc.write_ds_len(1);
        let data = enc.finish();
        let mut dec = DecoderV2::new(&data).unwrap();
        dec.reset_ds_cur_val();
        assert_eq!(dec.read_ds_clock().unwrap(), 10);
        assert_eq!(dec.read_ds_len().unwrap(), 5);
        assert_eq!(dec.read_ds_clock().unwrap(), 20);
        assert_eq!(dec.read_ds_len().unwrap(), 1);
    }
}
