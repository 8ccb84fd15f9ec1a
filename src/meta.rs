//! Topic metadata documents.
//!
//! Metadata rides on `{topic}$` as a JSON object describing the value type
//! and UI hints. Recognized keys: `dtype`, `brief`, `detail`, `default`,
//! `options`, `range`, `format`, `flags`.

use serde_derive::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result};

const DTYPES: &[&str] = &[
    "str", "json", "bin", "f32", "f64", "u8", "u16", "u32", "u64", "i8", "i16", "i32", "i64",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Allowed values, each `[value]` or `[value, alias...]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<serde_json::Value>>,
    /// `[min, max]` or `[min, max, step]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

impl Meta {
    pub fn new(dtype: &str, brief: &str) -> Meta {
        Meta {
            dtype: dtype.to_string(),
            brief: Some(brief.to_string()),
            ..Meta::default()
        }
    }

    /// Parses and validates a metadata document.
    pub fn parse(json: &str) -> Result<Meta> {
        let meta: Meta = serde_json::from_str(json).map_err(|_| ErrorCode::SyntaxError)?;
        if !DTYPES.contains(&meta.dtype.as_str()) {
            return Err(ErrorCode::ParameterInvalid);
        }
        Ok(meta)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let meta = Meta {
            dtype: "u32".to_string(),
            brief: Some("timeout in milliseconds".to_string()),
            default: Some(serde_json::json!(1000)),
            range: Some(vec![serde_json::json!(0), serde_json::json!(60_000)]),
            ..Meta::default()
        };
        let json = meta.to_json();
        assert_eq!(Meta::parse(&json).unwrap(), meta);
    }

    #[test]
    fn unknown_dtype_is_invalid() {
        assert_eq!(
            Meta::parse(r#"{"dtype":"u128"}"#),
            Err(ErrorCode::ParameterInvalid)
        );
        assert_eq!(Meta::parse("not json"), Err(ErrorCode::SyntaxError));
    }

    #[test]
    fn optional_keys_are_optional() {
        let meta = Meta::parse(r#"{"dtype":"str"}"#).unwrap();
        assert_eq!(meta.dtype, "str");
        assert!(meta.brief.is_none());
        assert!(meta.options.is_none());
    }
}
