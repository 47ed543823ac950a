/* Record layout / decoder: the declarative field-descriptor tables that
 * turn raw register blocks (or PI30 ASCII tokens) into a labelled field
 * stream.
 *
 * Every device record is a `Layout` (ordered `FieldSpec`s) plus a
 * `Record` (the decoded values). Publishers never see device structs;
 * they consume the cooked `Field` stream produced by `Record::fields()`,
 * so stdout, HTTP and MQTT all share one decoder. */

use std::borrow::Cow;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected data length: got {got}, want {want}")]
    LengthMismatch { got: usize, want: usize },

    #[error("field '{0}' has no binary representation")]
    NotBinary(String),

    #[error("field '{field}' at register {addr} not covered by any data block")]
    AddressNotCovered { field: String, addr: u16 },

    #[error("field '{0}' has no register address")]
    MissingAddress(String),

    #[error("error converting value for {field}: '{token}'")]
    BadToken { field: String, token: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

impl Scalar {
    pub fn size(self) -> usize {
        match self {
            Scalar::U8 | Scalar::I8 => 1,
            Scalar::U16 | Scalar::I16 => 2,
            Scalar::U32 | Scalar::I32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(Scalar),
    /* Fixed-width array of scalars; names carry a `%d` placeholder. */
    Array { elem: Scalar, len: usize },
    /* Fixed-width ASCII byte string. */
    Bytes { len: usize },
    /* PI30 token kinds with no packed representation. */
    F32,
    Str,
}

impl FieldKind {
    fn byte_len(&self) -> Option<usize> {
        match self {
            FieldKind::Scalar(s) => Some(s.size()),
            FieldKind::Array { elem, len } => Some(elem.size() * len),
            FieldKind::Bytes { len } => Some(*len),
            FieldKind::F32 | FieldKind::Str => None,
        }
    }
}

/* One declared field: the publish key, its packed representation and the
 * cooking metadata (unit, scale, enumeration, flags, ...). */
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /* Register address for block-stitched layouts. */
    pub addr: Option<u16>,
    pub unit: Cow<'static, str>,
    pub device_class: &'static str,
    pub icon: &'static str,
    pub precision: Option<u8>,
    pub multiplier: Option<f64>,
    pub values: &'static [(&'static str, &'static str)],
    pub flags: &'static [&'static str],
    pub bitgroups: &'static str,
    pub binary_token: bool,
    pub skip: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        FieldSpec {
            name: name.into(),
            kind,
            addr: None,
            unit: Cow::Borrowed(""),
            device_class: "",
            icon: "",
            precision: None,
            multiplier: None,
            values: &[],
            flags: &[],
            bitgroups: "",
            binary_token: false,
            skip: false,
        }
    }

    pub fn at(mut self, addr: u16) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn device_class(mut self, dclass: &'static str) -> Self {
        self.device_class = dclass;
        self
    }

    pub fn icon(mut self, icon: &'static str) -> Self {
        self.icon = icon;
        self
    }

    pub fn precision(mut self, digits: u8) -> Self {
        self.precision = Some(digits);
        self
    }

    pub fn multiplier(mut self, m: f64) -> Self {
        self.multiplier = Some(m);
        self
    }

    pub fn values(mut self, values: &'static [(&'static str, &'static str)]) -> Self {
        self.values = values;
        self
    }

    pub fn flags(mut self, flags: &'static [&'static str]) -> Self {
        self.flags = flags;
        self
    }

    pub fn bitgroups(mut self, groups: &'static str) -> Self {
        self.bitgroups = groups;
        self
    }

    pub fn binary(mut self) -> Self {
        self.binary_token = true;
        self
    }

    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }
}

/* Convenience constructors so layout tables read compactly. */
pub fn u8_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Scalar(Scalar::U8))
}
pub fn i8_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Scalar(Scalar::I8))
}
pub fn u16_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Scalar(Scalar::U16))
}
pub fn i16_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Scalar(Scalar::I16))
}
pub fn u32_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Scalar(Scalar::U32))
}
pub fn i32_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Scalar(Scalar::I32))
}
pub fn array_field(name: &str, elem: Scalar, len: usize) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Array { elem, len })
}
pub fn string_field(name: &str, len: usize) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Bytes { len })
}
pub fn f32_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::F32)
}
pub fn str_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Str)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Uint(u64),
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<RawValue>),
}

impl RawValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Uint(v) => Some(*v as i64),
            RawValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RawValue::Uint(v) => Some(*v),
            RawValue::Int(v) => Some(*v as u64),
            _ => None,
        }
    }
}

/* A cooked value, ready for publishing. */
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Uint(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Uint(v) => serde_json::Value::from(*v),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::from(s.clone()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Uint(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/* Publish metadata attached to each cooked field. */
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub unit: Cow<'static, str>,
    pub device_class: &'static str,
    pub icon: &'static str,
    pub precision: Option<u8>,
}

impl FieldInfo {
    fn from_spec(spec: &FieldSpec, name: String) -> FieldInfo {
        FieldInfo {
            name,
            unit: spec.unit.clone(),
            device_class: spec.device_class,
            icon: spec.icon,
            precision: spec.precision,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub info: FieldInfo,
    pub value: Value,
}

/* An ordered field-descriptor table for one record type. */
#[derive(Debug, Clone)]
pub struct Layout {
    pub fields: Vec<FieldSpec>,
}

impl Layout {
    pub fn new(fields: Vec<FieldSpec>) -> Layout {
        Layout { fields }
    }

    fn packed_len(&self) -> Result<usize, DecodeError> {
        let mut total = 0;
        for f in &self.fields {
            total += f
                .kind
                .byte_len()
                .ok_or_else(|| DecodeError::NotBinary(f.name.clone()))?;
        }
        Ok(total)
    }

    /* Decode a packed byte block. The payload length must match the
     * layout exactly; a mismatch is an error, never a truncation. */
    pub fn decode(&self, bytes: &[u8], endian: Endianness) -> Result<Record, DecodeError> {
        let want = self.packed_len()?;
        if bytes.len() != want {
            return Err(DecodeError::LengthMismatch {
                got: bytes.len(),
                want,
            });
        }
        self.decode_unchecked(bytes, endian)
    }

    /* Decode a packed byte block that may carry trailing bytes beyond
     * the declared fields (command-style protocols report their own
     * lengths). */
    pub fn decode_prefix(&self, bytes: &[u8], endian: Endianness) -> Result<Record, DecodeError> {
        let want = self.packed_len()?;
        if bytes.len() < want {
            return Err(DecodeError::LengthMismatch {
                got: bytes.len(),
                want,
            });
        }
        self.decode_unchecked(&bytes[..want], endian)
    }

    fn decode_unchecked(&self, bytes: &[u8], endian: Endianness) -> Result<Record, DecodeError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut pos = 0;
        for spec in &self.fields {
            let len = spec
                .kind
                .byte_len()
                .ok_or_else(|| DecodeError::NotBinary(spec.name.clone()))?;
            let raw = decode_value(&spec.kind, &bytes[pos..pos + len], endian);
            pos += len;
            fields.push((spec.clone(), raw));
        }
        Ok(Record { fields })
    }

    /* Decode register blocks that are not contiguous: every field
     * carries its register address and is looked up in the block that
     * covers it. */
    pub fn decode_blocks(
        &self,
        blocks: &[(u16, &[u8])],
        endian: Endianness,
    ) -> Result<Record, DecodeError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for spec in &self.fields {
            let addr = spec
                .addr
                .ok_or_else(|| DecodeError::MissingAddress(spec.name.clone()))?;
            let len = spec
                .kind
                .byte_len()
                .ok_or_else(|| DecodeError::NotBinary(spec.name.clone()))?;
            let mut found = None;
            for (start, data) in blocks {
                if addr >= *start {
                    let offset = (addr - *start) as usize * 2;
                    if offset + len <= data.len() {
                        found = Some(&data[offset..offset + len]);
                        break;
                    }
                }
            }
            let Some(slice) = found else {
                return Err(DecodeError::AddressNotCovered {
                    field: spec.name.clone(),
                    addr,
                });
            };
            fields.push((spec.clone(), decode_value(&spec.kind, slice, endian)));
        }
        Ok(Record { fields })
    }

    /* Decode space-separated ASCII tokens (PI30). Extra tokens are
     * ignored; missing tokens shorten the record. */
    pub fn decode_tokens(&self, tokens: &[&str]) -> Result<Record, DecodeError> {
        let n = self.fields.len().min(tokens.len());
        if n < self.fields.len() {
            warn!(got = tokens.len(), want = self.fields.len(), "wrong number of fields");
        }
        let mut fields = Vec::with_capacity(n);
        for (spec, token) in self.fields.iter().zip(tokens.iter()).take(n) {
            let raw = decode_token(spec, token)?;
            fields.push((spec.clone(), raw));
        }
        Ok(Record { fields })
    }

    /* The publish keys this layout produces, arrays expanded, skip
     * fields omitted. Used to emit discovery configs before any data
     * has been read. */
    pub fn field_infos(&self) -> Vec<FieldInfo> {
        let mut infos = Vec::new();
        for spec in &self.fields {
            if spec.skip {
                continue;
            }
            match spec.kind {
                FieldKind::Array { len, .. } => {
                    for i in 0..len {
                        let name = expand_index(&spec.name, i + 1);
                        infos.push(FieldInfo::from_spec(spec, name));
                    }
                }
                _ => infos.push(FieldInfo::from_spec(spec, spec.name.clone())),
            }
        }
        infos
    }
}

fn decode_value(kind: &FieldKind, bytes: &[u8], endian: Endianness) -> RawValue {
    match kind {
        FieldKind::Scalar(s) => decode_scalar(*s, bytes, endian),
        FieldKind::Array { elem, len } => {
            let size = elem.size();
            let mut items = Vec::with_capacity(*len);
            for i in 0..*len {
                items.push(decode_scalar(*elem, &bytes[i * size..(i + 1) * size], endian));
            }
            RawValue::Array(items)
        }
        FieldKind::Bytes { .. } => {
            let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
            RawValue::Text(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
        FieldKind::F32 | FieldKind::Str => RawValue::Text(String::new()),
    }
}

fn decode_scalar(scalar: Scalar, bytes: &[u8], endian: Endianness) -> RawValue {
    match scalar {
        Scalar::U8 => RawValue::Uint(bytes[0] as u64),
        Scalar::I8 => RawValue::Int(bytes[0] as i8 as i64),
        Scalar::U16 => {
            let v = match endian {
                Endianness::Big => u16::from_be_bytes([bytes[0], bytes[1]]),
                Endianness::Little => u16::from_le_bytes([bytes[0], bytes[1]]),
            };
            RawValue::Uint(v as u64)
        }
        Scalar::I16 => {
            let v = match endian {
                Endianness::Big => i16::from_be_bytes([bytes[0], bytes[1]]),
                Endianness::Little => i16::from_le_bytes([bytes[0], bytes[1]]),
            };
            RawValue::Int(v as i64)
        }
        Scalar::U32 => {
            let b = [bytes[0], bytes[1], bytes[2], bytes[3]];
            let v = match endian {
                Endianness::Big => u32::from_be_bytes(b),
                Endianness::Little => u32::from_le_bytes(b),
            };
            RawValue::Uint(v as u64)
        }
        Scalar::I32 => {
            let b = [bytes[0], bytes[1], bytes[2], bytes[3]];
            let v = match endian {
                Endianness::Big => i32::from_be_bytes(b),
                Endianness::Little => i32::from_le_bytes(b),
            };
            RawValue::Int(v as i64)
        }
    }
}

fn decode_token(spec: &FieldSpec, token: &str) -> Result<RawValue, DecodeError> {
    let base = if spec.binary_token { 2 } else { 10 };
    let bad = || DecodeError::BadToken {
        field: spec.name.clone(),
        token: token.to_string(),
    };
    match spec.kind {
        FieldKind::Scalar(Scalar::U8) => u8::from_str_radix(token, base)
            .map(|v| RawValue::Uint(v as u64))
            .map_err(|_| bad()),
        FieldKind::Scalar(Scalar::U16) => u16::from_str_radix(token, base)
            .map(|v| RawValue::Uint(v as u64))
            .map_err(|_| bad()),
        FieldKind::Scalar(Scalar::U32) => u32::from_str_radix(token, base)
            .map(|v| RawValue::Uint(v as u64))
            .map_err(|_| bad()),
        FieldKind::Scalar(Scalar::I8) => i8::from_str_radix(token, base)
            .map(|v| RawValue::Int(v as i64))
            .map_err(|_| bad()),
        FieldKind::Scalar(Scalar::I16) => i16::from_str_radix(token, 10)
            .map(|v| RawValue::Int(v as i64))
            .map_err(|_| bad()),
        FieldKind::Scalar(Scalar::I32) => i32::from_str_radix(token, 10)
            .map(|v| RawValue::Int(v as i64))
            .map_err(|_| bad()),
        FieldKind::F32 => token
            .parse::<f32>()
            .map(|v| RawValue::Float(v as f64))
            .map_err(|_| bad()),
        FieldKind::Str => Ok(RawValue::Text(token.to_string())),
        FieldKind::Array { .. } | FieldKind::Bytes { .. } => Err(bad()),
    }
}

fn expand_index(template: &str, index: usize) -> String {
    template.replace("%d", &index.to_string())
}

/* A decoded record: the layout's specs paired with their raw values.
 * Drivers may adjust raw values (unit conversions, derived fields)
 * before the record is published. */
#[derive(Debug, Clone)]
pub struct Record {
    fields: Vec<(FieldSpec, RawValue)>,
}

impl Record {
    pub fn empty() -> Record {
        Record { fields: Vec::new() }
    }

    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.fields
            .iter()
            .find(|(s, _)| s.name == name)
            .map(|(_, v)| v)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(RawValue::as_u64)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(RawValue::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            RawValue::Float(v) => Some(*v),
            RawValue::Uint(v) => Some(*v as f64),
            RawValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn set(&mut self, name: &str, value: RawValue) {
        if let Some(slot) = self
            .fields
            .iter_mut()
            .find(|(s, _)| s.name == name)
            .map(|(_, v)| v)
        {
            *slot = value;
        }
    }

    pub fn push(&mut self, spec: FieldSpec, value: RawValue) {
        self.fields.push((spec, value));
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /* Cooked traversal: one `Field` per published value, in declaration
     * order, arrays expanded with 1-based indices. */
    pub fn fields(&self) -> Vec<Field> {
        let mut out = Vec::new();
        for (spec, raw) in &self.fields {
            if spec.skip {
                continue;
            }
            match raw {
                RawValue::Array(items) => {
                    /* One pair per element, each cooked with the same
                     * precedence scalars get. */
                    for (i, item) in items.iter().enumerate() {
                        let name = expand_index(&spec.name, i + 1);
                        out.push(Field {
                            info: FieldInfo::from_spec(spec, name),
                            value: cook(spec, item),
                        });
                    }
                }
                _ => out.push(Field {
                    info: FieldInfo::from_spec(spec, spec.name.clone()),
                    value: cook(spec, raw),
                }),
            }
        }
        out
    }
}

fn raw_to_value(raw: &RawValue) -> Value {
    match raw {
        RawValue::Uint(v) => Value::Uint(*v),
        RawValue::Int(v) => Value::Int(*v),
        RawValue::Float(v) => Value::Float(*v),
        RawValue::Text(s) => Value::Text(s.clone()),
        RawValue::Array(_) => Value::Text(String::new()),
    }
}

/* Cooking precedence: values map, then multiplier, then flags, then
 * bitgroups; otherwise the raw value unchanged. */
fn cook(spec: &FieldSpec, raw: &RawValue) -> Value {
    if !spec.values.is_empty() {
        let key = raw_to_value(raw).to_string();
        let label = spec
            .values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_string())
            .unwrap_or(key);
        return Value::Text(label);
    }
    if let (Some(m), Some(v)) = (spec.multiplier, raw.as_i64()) {
        return Value::Float(apply_multiplier(m, v));
    }
    if !spec.flags.is_empty() {
        if let Some(v) = raw.as_u64() {
            let s = cook_flags(spec.flags, v);
            if s.is_empty() {
                return Value::Uint(v);
            }
            return Value::Text(s);
        }
    }
    if !spec.bitgroups.is_empty() {
        if let RawValue::Text(s) = raw {
            if !s.is_empty() {
                return Value::Text(cook_bitgroups(spec.bitgroups, s));
            }
        }
    }
    raw_to_value(raw)
}

/* The rounding keeps displayed values exact at the multiplier's own
 * precision (0.01 x 3353 is exactly 33.53, not 33.530000000000001). */
fn apply_multiplier(m: f64, v: i64) -> f64 {
    let minv = 1.0 / m;
    (m * v as f64 * minv).round() / minv
}

/* Bit table where the first label is the most-significant bit. Labels
 * that are literal hex tokens are reserved slots and never emitted. */
fn cook_flags(labels: &[&str], value: u64) -> String {
    let nbits = labels.len();
    let mut result = String::new();
    for (n, label) in labels.iter().enumerate() {
        let label = label.trim();
        if label.is_empty() || label.starts_with("0x") {
            continue;
        }
        if value & (1u64 << (nbits - n - 1)) != 0 {
            if !result.is_empty() {
                result.push_str(", ");
            }
            result.push_str(label);
        }
    }
    result
}

/* Inverter status strings pack several flag groups into hex-nibble
 * characters; `|` separates the groups, `,` the labels inside one. */
fn cook_bitgroups(bitgroups: &'static str, value: &str) -> String {
    let mut result = String::new();
    let mut idx = 0;
    for group in bitgroups.split('|') {
        let descriptions: Vec<&str> = group.split(',').collect();
        if idx + descriptions.len() > value.len() {
            warn!(value, bitgroups, "bitgroup value shorter than descriptors");
            if result.is_empty() {
                return value.to_string();
            }
            return result;
        }
        let chunk = &value[idx..idx + descriptions.len()];
        idx += descriptions.len();
        let Ok(v) = u64::from_str_radix(chunk, 16) else {
            continue;
        };
        /* Pad to 8 slots so the described labels land on the low bits. */
        let mut labels = Vec::with_capacity(8);
        for m in (0..8usize).rev() {
            if m >= descriptions.len() {
                labels.push("");
            } else {
                labels.push(descriptions[descriptions.len() - 1 - m]);
            }
        }
        let cooked = cook_flags(&labels, v);
        if cooked.is_empty() {
            continue;
        }
        if !result.is_empty() {
            result.push_str(", ");
        }
        result.push_str(&cooked);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_rounding() {
        assert_eq!(apply_multiplier(0.01, 3353), 33.53);
        assert_eq!(apply_multiplier(0.001, 3353), 3.353);
        assert_eq!(apply_multiplier(10.0, 5), 50.0);
        assert_eq!(apply_multiplier(1.5, 2), 3.0);
    }

    #[test]
    fn multiplier_idempotent_at_precision() {
        for raw in [0i64, 1, 3353, 65535, -120] {
            let cooked = apply_multiplier(0.01, raw);
            let displayed = format!("{:.2}", cooked);
            let redisplayed = format!("{:.2}", displayed.parse::<f64>().unwrap());
            assert_eq!(displayed, redisplayed);
        }
    }

    #[test]
    fn flags_msb_first() {
        let labels = ["a", "b", "c", "d", "e", "f", "g", "h"];
        assert_eq!(cook_flags(&labels, 0x03), "g, h");
        assert_eq!(cook_flags(&labels, 127), "b, c, d, e, f, g, h");
        assert_eq!(cook_flags(&labels, 16), "d");
        assert_eq!(cook_flags(&labels, 0), "");
    }

    #[test]
    fn flags_wide_tables() {
        let labels16 = [
            "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p",
        ];
        assert_eq!(cook_flags(&labels16, 16), "l");
        assert_eq!(cook_flags(&labels16, 0xc000), "a, b");
    }

    #[test]
    fn flags_skip_hex_placeholders() {
        let labels = ["0x8000", "0x4000", "real one"];
        assert_eq!(cook_flags(&labels, 0b111), "real one");
        /* Nothing but reserved bits set: fall back to the raw value. */
        assert_eq!(cook_flags(&labels, 0b110), "");
    }

    #[test]
    fn values_mapping() {
        static VALUES: &[(&str, &str)] = &[("0", "standby"), ("1", "charging")];
        let spec = u16_field("status").values(VALUES);
        assert_eq!(
            cook(&spec, &RawValue::Uint(1)),
            Value::Text("charging".into())
        );
        /* Unknown keys publish the stringified raw value. */
        assert_eq!(cook(&spec, &RawValue::Uint(7)), Value::Text("7".into()));
    }

    #[test]
    fn bitgroups_decoding() {
        const GROUPS: &str = "SCC OK|AC charging|SCC charging|Battery over voltage,Battery under voltage|Line loss|Load on|Configuration changed";
        assert_eq!(cook_bitgroups(GROUPS, "1100000"), "SCC OK, AC charging");
        /* Shorter than the descriptors with nothing decoded: raw string. */
        assert_eq!(cook_bitgroups(GROUPS, "0"), "0");
        assert_eq!(cook_bitgroups(GROUPS, "10100000"), "SCC OK, SCC charging");
    }

    #[test]
    fn decode_length_must_match() {
        let layout = Layout::new(vec![u16_field("a"), u16_field("b")]);
        assert!(layout.decode(&[0, 1, 0, 2], Endianness::Big).is_ok());
        match layout.decode(&[0, 1, 0], Endianness::Big) {
            Err(DecodeError::LengthMismatch { got: 3, want: 4 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match layout.decode(&[0, 1, 0, 2, 9], Endianness::Big) {
            Err(DecodeError::LengthMismatch { got: 5, want: 4 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_scalars_and_arrays() {
        let layout = Layout::new(vec![
            u16_field("v"),
            i16_field("i"),
            array_field("cell_%d", Scalar::U16, 2).multiplier(0.001),
            u32_field("total"),
            i8_field("t"),
            u8_field("pad").skip(),
        ]);
        let bytes = [
            0x14, 0xf6, /* 5366 */
            0xff, 0x88, /* -120 */
            0x0d, 0x1a, 0x0d, 0x19, /* 3354, 3353 */
            0x00, 0x01, 0x86, 0xa0, /* 100000 */
            0xe8, /* -24 */
            0x00,
        ];
        let rec = layout.decode(&bytes, Endianness::Big).unwrap();
        assert_eq!(rec.get_u64("v"), Some(5366));
        assert_eq!(rec.get_i64("i"), Some(-120));
        assert_eq!(rec.get_u64("total"), Some(100000));
        assert_eq!(rec.get_i64("t"), Some(-24));

        let fields = rec.fields();
        /* skip field is not published; array expands to two fields */
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[2].info.name, "cell_1");
        assert_eq!(fields[2].value, Value::Float(3.354));
        assert_eq!(fields[3].info.name, "cell_2");
        assert_eq!(fields[3].value, Value::Float(3.353));
    }

    #[test]
    fn array_elements_cook_flags_and_values() {
        static LIMIT_FLAGS: &[&str] = &[
            "0x80",
            "0x40",
            "0x20",
            "0x10",
            "0x08",
            "0x04",
            "upper limit alarm",
            "lower limit alarm",
        ];
        static STATE_VALUES: &[(&str, &str)] = &[("0", "ok"), ("1", "tripped")];
        let layout = Layout::new(vec![
            array_field("cell_%d_alarm", Scalar::U8, 3).flags(LIMIT_FLAGS),
            array_field("breaker_%d", Scalar::U8, 2).values(STATE_VALUES),
        ]);
        let rec = layout
            .decode(&[0x02, 0x01, 0x00, 0x01, 0x07], Endianness::Big)
            .unwrap();
        let fields = rec.fields();
        assert_eq!(fields[0].value, Value::Text("upper limit alarm".into()));
        assert_eq!(fields[1].value, Value::Text("lower limit alarm".into()));
        /* No labels fire: fall back to the raw unsigned integer. */
        assert_eq!(fields[2].value, Value::Uint(0));
        assert_eq!(fields[3].value, Value::Text("tripped".into()));
        /* Unknown keys publish the stringified raw value. */
        assert_eq!(fields[4].value, Value::Text("7".into()));
    }

    #[test]
    fn decode_little_endian() {
        let layout = Layout::new(vec![u16_field("a"), u32_field("b")]);
        let rec = layout
            .decode(&[0x34, 0x12, 0x78, 0x56, 0x34, 0x12], Endianness::Little)
            .unwrap();
        assert_eq!(rec.get_u64("a"), Some(0x1234));
        assert_eq!(rec.get_u64("b"), Some(0x12345678));
    }

    #[test]
    fn decode_string_bytes() {
        let layout = Layout::new(vec![string_field("model", 8)]);
        let rec = layout
            .decode(b"LFP-51.2", Endianness::Big)
            .unwrap();
        assert_eq!(rec.get("model"), Some(&RawValue::Text("LFP-51.2".into())));

        let rec = layout
            .decode(&[b'Z', b'0', b'2', 0, 0, 0, 0, 0], Endianness::Big)
            .unwrap();
        assert_eq!(rec.get("model"), Some(&RawValue::Text("Z02".into())));
    }

    #[test]
    fn decode_blocks_by_address() {
        let layout = Layout::new(vec![
            u16_field("a").at(60),
            u16_field("b").at(64),
            i16_field("c").at(103),
        ]);
        let block1: &[u8] = &[0x00, 0x0a, 0, 0, 0, 0, 0, 0, 0x00, 0x14];
        let block2: &[u8] = &[0xff, 0xf6];
        let rec = layout
            .decode_blocks(&[(60, block1), (103, block2)], Endianness::Big)
            .unwrap();
        assert_eq!(rec.get_u64("a"), Some(10));
        assert_eq!(rec.get_u64("b"), Some(20));
        assert_eq!(rec.get_i64("c"), Some(-10));

        let missing = Layout::new(vec![u16_field("z").at(999)]);
        assert!(matches!(
            missing.decode_blocks(&[(60, block1)], Endianness::Big),
            Err(DecodeError::AddressNotCovered { .. })
        ));
    }

    #[test]
    fn decode_tokens_shortens_and_ignores_extra() {
        let layout = Layout::new(vec![
            f32_field("grid_voltage"),
            i16_field("power"),
            str_field("mode"),
        ]);
        let rec = layout
            .decode_tokens(&["123.5", "2616", "B", "extra", "tokens"])
            .unwrap();
        assert_eq!(rec.len(), 3);
        assert_eq!(rec.get_f64("grid_voltage"), Some(123.5));

        let rec = layout.decode_tokens(&["123.5"]).unwrap();
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn decode_binary_tokens() {
        let layout = Layout::new(vec![u8_field("status").binary()]);
        let rec = layout.decode_tokens(&["00010000"]).unwrap();
        assert_eq!(rec.get_u64("status"), Some(16));
        assert!(layout.decode_tokens(&["00010002"]).is_err());
    }

    #[test]
    fn traversal_visits_declared_order_once() {
        let layout = Layout::new(vec![
            u16_field("one"),
            u16_field("two").skip(),
            u16_field("three"),
        ]);
        let rec = layout.decode(&[0, 1, 0, 2, 0, 3], Endianness::Big).unwrap();
        let names: Vec<String> = rec.fields().into_iter().map(|f| f.info.name).collect();
        assert_eq!(names, ["one", "three"]);
    }

    #[test]
    fn random_payloads_do_not_panic() {
        let layout = Layout::new(vec![
            u16_field("a").multiplier(0.01),
            array_field("c_%d", Scalar::I16, 4).multiplier(0.1),
            u32_field("d").flags(&["x", "y", "z"]),
            string_field("s", 6),
        ]);
        let want = 2 + 8 + 4 + 6;
        let mut seed = 0x2545f4914f6cdd1du64;
        for _ in 0..200 {
            let mut bytes = Vec::with_capacity(want);
            for _ in 0..want {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                bytes.push(seed as u8);
            }
            let rec = layout.decode(&bytes, Endianness::Big).unwrap();
            for f in rec.fields() {
                let _ = f.value.to_string();
            }
        }
    }
}
