//! Typed entry values and their binary encoding.
//!
//! Every value travels behind a one-byte type tag. Scalars are fixed width,
//! strings carry a two-byte length, arrays a one-byte element count. The high
//! nibble `0x1` marks array types.

use std::fmt;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{BadMessage, EncodingError, ProtocolError, UnknownTypeError};

const MAX_ARRAY_LEN: usize = u8::MAX as usize;
const MAX_STRING_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Boolean,
    Double,
    String,
    BooleanArray,
    DoubleArray,
    StringArray,
}

impl ValueType {
    pub const fn tag(self) -> u8 {
        match self {
            ValueType::Boolean => 0x00,
            ValueType::Double => 0x01,
            ValueType::String => 0x02,
            ValueType::BooleanArray => 0x10,
            ValueType::DoubleArray => 0x11,
            ValueType::StringArray => 0x12,
        }
    }

    pub const fn is_array(self) -> bool {
        self.tag() & 0xF0 == 0x10
    }
}

impl TryFrom<u8> for ValueType {
    type Error = UnknownTypeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x00 => Ok(ValueType::Boolean),
            0x01 => Ok(ValueType::Double),
            0x02 => Ok(ValueType::String),
            0x10 => Ok(ValueType::BooleanArray),
            0x11 => Ok(ValueType::DoubleArray),
            0x12 => Ok(ValueType::StringArray),
            other => Err(UnknownTypeError(other)),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Boolean => "boolean",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::BooleanArray => "boolean array",
            ValueType::DoubleArray => "double array",
            ValueType::StringArray => "string array",
        };
        f.write_str(name)
    }
}

/// An entry payload. Array variants hold a single element type by construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    String(String),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::BooleanArray(_) => ValueType::BooleanArray,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::StringArray(_) => ValueType::StringArray,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::BooleanArray(v) => write!(f, "{v:?}"),
            Value::DoubleArray(v) => write!(f, "{v:?}"),
            Value::StringArray(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<bool>> for Value {
    fn from(value: Vec<bool>) -> Self {
        Value::BooleanArray(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::DoubleArray(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::StringArray(value)
    }
}

/// Appends `value` to `buf` using the encoding of `value_type`.
///
/// Nothing is written when an error is returned.
pub fn encode(value_type: ValueType, value: &Value, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    if value.value_type() != value_type {
        return Err(EncodingError::TypeMismatch {
            expected: value_type,
            actual: value.value_type(),
        });
    }

    let start = buf.len();
    let result = encode_checked(value, buf);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

fn encode_checked(value: &Value, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    match value {
        Value::Boolean(v) => buf.push(u8::from(*v)),
        Value::Double(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::String(v) => write_string(buf, v)?,
        Value::BooleanArray(items) => {
            write_array_len(buf, items.len())?;
            buf.extend(items.iter().map(|item| u8::from(*item)));
        }
        Value::DoubleArray(items) => {
            write_array_len(buf, items.len())?;
            for item in items {
                buf.extend_from_slice(&item.to_be_bytes());
            }
        }
        Value::StringArray(items) => {
            write_array_len(buf, items.len())?;
            for item in items {
                write_string(buf, item)?;
            }
        }
    }
    Ok(())
}

/// Reads exactly one value of `value_type` from `reader`.
pub async fn decode<R>(value_type: ValueType, reader: &mut R) -> Result<Value, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let value = match value_type {
        ValueType::Boolean => Value::Boolean(reader.read_u8().await? != 0),
        ValueType::Double => Value::Double(reader.read_f64().await?),
        ValueType::String => Value::String(read_string(reader).await?),
        ValueType::BooleanArray => {
            let len = reader.read_u8().await?;
            let mut items = Vec::with_capacity(len.into());
            for _ in 0..len {
                items.push(reader.read_u8().await? != 0);
            }
            Value::BooleanArray(items)
        }
        ValueType::DoubleArray => {
            let len = reader.read_u8().await?;
            let mut items = Vec::with_capacity(len.into());
            for _ in 0..len {
                items.push(reader.read_f64().await?);
            }
            Value::DoubleArray(items)
        }
        ValueType::StringArray => {
            let len = reader.read_u8().await?;
            let mut items = Vec::with_capacity(len.into());
            for _ in 0..len {
                items.push(read_string(reader).await?);
            }
            Value::StringArray(items)
        }
    };
    Ok(value)
}

pub(crate) fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<(), EncodingError> {
    let len = value.len();
    if len > MAX_STRING_LEN {
        return Err(EncodingError::StringTooLong { len });
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

pub(crate) async fn read_string<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await?;
    let mut bytes = vec![0u8; len.into()];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|err| BadMessage::InvalidUtf8(err).into())
}

fn write_array_len(buf: &mut Vec<u8>, len: usize) -> Result<(), EncodingError> {
    if len > MAX_ARRAY_LEN {
        return Err(EncodingError::ArrayTooLong { len });
    }
    buf.push(len as u8);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(value: &Value) -> Value {
        let mut buf = Vec::new();
        encode(value.value_type(), value, &mut buf).expect("encode");
        let mut reader = buf.as_slice();
        let decoded = decode(value.value_type(), &mut reader)
            .await
            .expect("decode");
        assert!(reader.is_empty(), "decode must consume the whole encoding");
        decoded
    }

    #[tokio::test]
    async fn representative_values_survive_roundtrip() {
        let values = [
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Double(0.0),
            Value::Double(-0.0),
            Value::Double(f64::MAX),
            Value::Double(-1234.5678),
            Value::String(String::new()),
            Value::String("grüße, ロボット 🤖".into()),
            Value::BooleanArray(vec![]),
            Value::BooleanArray(vec![true, false, true]),
            Value::DoubleArray(vec![3.5]),
            Value::DoubleArray(vec![1.0, -2.0, 1e-9]),
            Value::StringArray(vec![]),
            Value::StringArray(vec!["".into(), "left".into(), "right".into()]),
        ];

        for value in &values {
            assert_eq!(&roundtrip(value).await, value);
        }
    }

    #[tokio::test]
    async fn negative_zero_keeps_its_sign() {
        let decoded = roundtrip(&Value::Double(-0.0)).await;
        match decoded {
            Value::Double(v) => assert!(v.is_sign_negative()),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn wire_layout_is_big_endian() {
        let mut buf = Vec::new();
        encode(ValueType::Double, &Value::Double(1.0), &mut buf).unwrap();
        assert_eq!(buf, [0x3F, 0xF0, 0, 0, 0, 0, 0, 0]);

        buf.clear();
        encode(ValueType::String, &Value::from("hi"), &mut buf).unwrap();
        assert_eq!(buf, [0x00, 0x02, b'h', b'i']);

        buf.clear();
        encode(
            ValueType::BooleanArray,
            &Value::BooleanArray(vec![true, false]),
            &mut buf,
        )
        .unwrap();
        assert_eq!(buf, [0x02, 0x01, 0x00]);
    }

    #[test]
    fn encoding_against_the_wrong_tag_fails() {
        let mut buf = vec![0xAA];
        let err = encode(ValueType::Double, &Value::from("3.5"), &mut buf).unwrap_err();
        assert_eq!(
            err,
            EncodingError::TypeMismatch {
                expected: ValueType::Double,
                actual: ValueType::String,
            }
        );
        assert_eq!(buf, [0xAA]);
    }

    #[test]
    fn oversized_arrays_leave_the_buffer_untouched() {
        let mut buf = Vec::new();
        let value = Value::StringArray(vec!["x".to_string(); 256]);
        let err = encode(ValueType::StringArray, &value, &mut buf).unwrap_err();
        assert_eq!(err, EncodingError::ArrayTooLong { len: 256 });
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_tags_report_the_raw_byte() {
        assert_eq!(ValueType::try_from(0x13), Err(UnknownTypeError(0x13)));
        assert_eq!(ValueType::try_from(0x11), Ok(ValueType::DoubleArray));
        assert!(ValueType::StringArray.is_array());
        assert!(!ValueType::String.is_array());
    }

    #[tokio::test]
    async fn truncated_input_is_an_io_error() {
        let mut reader: &[u8] = &[0x3F, 0xF0];
        let err = decode(ValueType::Double, &mut reader).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_bad_message() {
        let mut reader: &[u8] = &[0x00, 0x02, 0xC3, 0x28];
        let err = decode(ValueType::String, &mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BadMessage(BadMessage::InvalidUtf8(_))
        ));
    }
}
