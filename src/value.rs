//! The tagged value carried by every bus message.

use std::borrow::Cow;
use std::fmt;

use crate::error::{ErrorCode, Result};

/// Classifies a binary payload as one of the well-known in-process
/// structures. `None` for free-form payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AppClass {
    #[default]
    None = 0,
    /// Stream sample block (see [`crate::wire::StreamHeader`]).
    Stream = 1,
    /// Statistics block.
    Statistics = 2,
    BufferInfo = 3,
    BufferRequest = 4,
    BufferResponse = 5,
}

/// The payload variant.
///
/// String, JSON and binary payloads are `Cow` so that values borrowed from
/// static storage carry no allocation, while owned payloads are dropped with
/// the carrying message.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Null,
    Str(Cow<'static, str>),
    Json(Cow<'static, str>),
    Bin(Cow<'static, [u8]>),
    F32(f32),
    F64(f64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

#[derive(Debug, Clone, Default)]
pub struct Value {
    pub payload: Payload,
    /// When set, the bus caches this value as the topic's retained value.
    pub retain: bool,
    pub app: AppClass,
}

macro_rules! value_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Value {
                Value::new(Payload::$variant(v))
            }
        }
    };
}

value_from!(f32, F32);
value_from!(f64, F64);
value_from!(u8, U8);
value_from!(u16, U16);
value_from!(u32, U32);
value_from!(u64, U64);
value_from!(i8, I8);
value_from!(i16, I16);
value_from!(i32, I32);
value_from!(i64, I64);

macro_rules! value_narrow {
    ($name:ident, $t:ty) => {
        /// Checked narrowing; fails with `ParameterInvalid` on overflow or a
        /// non-integer payload.
        pub fn $name(&self) -> Result<$t> {
            let wide = self.as_i128().ok_or(ErrorCode::ParameterInvalid)?;
            <$t>::try_from(wide).map_err(|_| ErrorCode::ParameterInvalid)
        }
    };
}

impl Value {
    pub fn new(payload: Payload) -> Self {
        Value {
            payload,
            retain: false,
            app: AppClass::None,
        }
    }

    pub fn null() -> Self {
        Value::new(Payload::Null)
    }

    pub fn str(s: impl Into<Cow<'static, str>>) -> Self {
        Value::new(Payload::Str(s.into()))
    }

    pub fn json(s: impl Into<Cow<'static, str>>) -> Self {
        Value::new(Payload::Json(s.into()))
    }

    pub fn bin(b: impl Into<Cow<'static, [u8]>>) -> Self {
        Value::new(Payload::Bin(b.into()))
    }

    pub fn with_retain(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn with_app(mut self, app: AppClass) -> Self {
        self.app = app;
        self
    }

    pub fn is_null(&self) -> bool {
        matches!(self.payload, Payload::Null)
    }

    /// The raw bytes of a string, JSON, or binary payload.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Str(s) | Payload::Json(s) => Some(s.as_bytes()),
            Payload::Bin(b) => Some(b),
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self.payload {
            Payload::U8(v) => Some(v as i128),
            Payload::U16(v) => Some(v as i128),
            Payload::U32(v) => Some(v as i128),
            Payload::U64(v) => Some(v as i128),
            Payload::I8(v) => Some(v as i128),
            Payload::I16(v) => Some(v as i128),
            Payload::I32(v) => Some(v as i128),
            Payload::I64(v) => Some(v as i128),
            _ => None,
        }
    }

    /// Widens any integer payload to u64; fails on negative values and
    /// non-integer payloads.
    pub fn as_u64(&self) -> Result<u64> {
        let wide = self.as_i128().ok_or(ErrorCode::ParameterInvalid)?;
        u64::try_from(wide).map_err(|_| ErrorCode::ParameterInvalid)
    }

    /// Widens any integer payload to i64; fails on u64 values above
    /// `i64::MAX` and non-integer payloads.
    pub fn as_i64(&self) -> Result<i64> {
        let wide = self.as_i128().ok_or(ErrorCode::ParameterInvalid)?;
        i64::try_from(wide).map_err(|_| ErrorCode::ParameterInvalid)
    }

    value_narrow!(to_u8, u8);
    value_narrow!(to_u16, u16);
    value_narrow!(to_u32, u32);
    value_narrow!(to_u64, u64);
    value_narrow!(to_i8, i8);
    value_narrow!(to_i16, i16);
    value_narrow!(to_i32, i32);
    value_narrow!(to_i64, i64);

    /// Any numeric payload as f64.
    pub fn as_f64(&self) -> Result<f64> {
        match self.payload {
            Payload::F32(v) => Ok(v as f64),
            Payload::F64(v) => Ok(v),
            _ => self.as_i128().map(|v| v as f64).ok_or(ErrorCode::ParameterInvalid),
        }
    }

    /// Copies a string/json/binary payload into `out`.
    ///
    /// String and JSON payloads are NUL-terminated in the destination; the
    /// returned length includes the terminator. Fails with `TooSmall` when
    /// the payload does not fit and `ParameterInvalid` for payloads with no
    /// byte representation.
    pub fn copy_into(&self, out: &mut [u8]) -> Result<usize> {
        match &self.payload {
            Payload::Str(_) | Payload::Json(_) => {
                let bytes = self.bytes().unwrap_or(&[]);
                if bytes.len() + 1 > out.len() {
                    return Err(ErrorCode::TooSmall);
                }
                out[..bytes.len()].copy_from_slice(bytes);
                out[bytes.len()] = 0;
                Ok(bytes.len() + 1)
            }
            Payload::Bin(_) => {
                let bytes = self.bytes().unwrap_or(&[]);
                if bytes.len() > out.len() {
                    return Err(ErrorCode::TooSmall);
                }
                out[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
            _ => Err(ErrorCode::ParameterInvalid),
        }
    }

    /// Boolean coercion from numeric and textual forms.
    pub fn as_bool(&self) -> Result<bool> {
        match &self.payload {
            Payload::Null => Ok(false),
            Payload::F32(v) => Ok(*v != 0.0),
            Payload::F64(v) => Ok(*v != 0.0),
            Payload::Str(s) | Payload::Json(s) => {
                match s.to_ascii_lowercase().as_str() {
                    "" | "0" | "off" | "false" | "no" | "none" | "disable" | "disabled" => {
                        Ok(false)
                    }
                    "1" | "on" | "true" | "yes" | "enable" | "enabled" => Ok(true),
                    _ => Err(ErrorCode::ParameterInvalid),
                }
            }
            _ => self
                .as_i128()
                .map(|v| v != 0)
                .ok_or(ErrorCode::ParameterInvalid),
        }
    }
}

/// Equality over the payload: type-exact for null/str/json/bin/floats,
/// widened-value equivalence across the integer variants. The `retain` and
/// `app` annotations do not participate.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_i128(), other.as_i128()) {
            return a == b;
        }
        match (&self.payload, &other.payload) {
            (Payload::Null, Payload::Null) => true,
            (Payload::Str(a), Payload::Str(b)) => a == b,
            (Payload::Json(a), Payload::Json(b)) => a == b,
            (Payload::Bin(a), Payload::Bin(b)) => a == b,
            (Payload::F32(a), Payload::F32(b)) => a == b,
            (Payload::F64(a), Payload::F64(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Null => write!(f, "null"),
            Payload::Str(s) => write!(f, "str:{s}"),
            Payload::Json(s) => write!(f, "json:{s}"),
            Payload::Bin(b) => write!(f, "bin[{}]", b.len()),
            Payload::F32(v) => write!(f, "f32:{v}"),
            Payload::F64(v) => write!(f, "f64:{v}"),
            Payload::U8(v) => write!(f, "u8:{v}"),
            Payload::U16(v) => write!(f, "u16:{v}"),
            Payload::U32(v) => write!(f, "u32:{v}"),
            Payload::U64(v) => write!(f, "u64:{v}"),
            Payload::I8(v) => write!(f, "i8:{v}"),
            Payload::I16(v) => write!(f, "i16:{v}"),
            Payload::I32(v) => write!(f, "i32:{v}"),
            Payload::I64(v) => write!(f, "i64:{v}"),
        }
    }
}
