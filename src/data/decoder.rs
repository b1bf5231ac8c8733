// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Conversion of raw chunks into key/value records.

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::config::{BinaryField, Config, DataFormat};

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Parse a number, falling back to text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => FieldValue::Number(n),
            _ => FieldValue::Text(trimmed.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Output of the decoder for one chunk.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decoded {
    pub fields: Fields,
    pub decode_error: Option<String>,
}

impl Decoded {
    fn ok(fields: Fields) -> Self {
        Self {
            fields,
            decode_error: None,
        }
    }

    fn single(name: &str, value: FieldValue) -> Self {
        let mut fields = Fields::new();
        fields.insert(name.to_string(), value);
        Self::ok(fields)
    }
}

/// A decoded record as kept in the history buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedRecord {
    /// Position in the stream, starting at 1.
    pub sequence_number: u64,
    pub received_at: DateTime<Local>,
    pub fields: Fields,
    /// The chunk exactly as received.
    #[serde(skip)]
    pub raw_bytes: Vec<u8>,
    pub decode_error: Option<String>,
}

/// Character encoding of text payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
    Ascii,
}

impl TextEncoding {
    /// Parse an encoding label; unknown labels fall back to UTF-8.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => TextEncoding::Utf8,
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" | "cp1252" => TextEncoding::Latin1,
            "ascii" | "us-ascii" => TextEncoding::Ascii,
            other => {
                warn!("Unsupported encoding '{}', using utf-8", other);
                TextEncoding::Utf8
            }
        }
    }

    /// Decode bytes; invalid sequences are replaced, never fatal.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            TextEncoding::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
                .collect(),
        }
    }
}

/// Upper-case, space separated hex dump.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .chunks(1)
        .map(hex::encode_upper)
        .collect::<Vec<_>>()
        .join(" ")
}

const PAIR_SEPARATORS: &[char] = &[',', ';'];
const KEY_VALUE_SEPARATORS: &[char] = &[':', '='];

/// Turns chunks into fields according to the configured format.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    format: DataFormat,
    encoding: TextEncoding,
    separator: String,
    custom_delimiter: String,
    custom_fields: BTreeMap<String, String>,
    binary_fields: Vec<BinaryField>,
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RecordDecoder {
    pub fn from_config(config: &Config) -> Self {
        Self {
            format: config.data_format,
            encoding: TextEncoding::from_label(&config.encoding),
            separator: config.data_separator.clone(),
            custom_delimiter: config.custom_delimiter.clone(),
            custom_fields: config.custom_fields.clone(),
            binary_fields: config.binary_fields.clone(),
        }
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Decode with the configured format.
    pub fn decode(&self, chunk: &[u8]) -> Decoded {
        self.decode_as(chunk, self.format)
    }

    /// Decode with an explicit format. Never fails: problems end up in
    /// `decode_error`.
    pub fn decode_as(&self, chunk: &[u8], format: DataFormat) -> Decoded {
        let decoded = match format {
            DataFormat::Text => self.decode_text(chunk),
            DataFormat::Json => self.decode_json(chunk),
            DataFormat::Binary => self.decode_binary(chunk),
            DataFormat::Custom => self.decode_custom(chunk),
            DataFormat::Raw => Decoded::single("raw", FieldValue::Text(self.text(chunk))),
        };

        if let Some(e) = &decoded.decode_error {
            debug!("Decode error ({:?}): {}", format, e);
        }
        decoded
    }

    /// Text with surrounding whitespace and message separators removed.
    fn text(&self, chunk: &[u8]) -> String {
        let text = self.encoding.decode(chunk);
        text.trim_matches(|c: char| c.is_whitespace() || self.separator.contains(c))
            .to_string()
    }

    fn decode_text(&self, chunk: &[u8]) -> Decoded {
        let text = self.text(chunk);

        if text.contains(PAIR_SEPARATORS) && text.contains(KEY_VALUE_SEPARATORS) {
            let mut fields = Fields::new();
            for pair in text.split(PAIR_SEPARATORS) {
                if let Some((key, value)) = pair.split_once(KEY_VALUE_SEPARATORS) {
                    let key = key.trim();
                    if !key.is_empty() {
                        fields.insert(key.to_string(), FieldValue::parse(value));
                    }
                }
            }
            if !fields.is_empty() {
                return Decoded::ok(fields);
            }
        }

        Decoded::single("message", FieldValue::Text(text))
    }

    fn decode_json(&self, chunk: &[u8]) -> Decoded {
        let text = self.text(chunk);

        let error = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => {
                let fields = map
                    .into_iter()
                    .map(|(key, value)| {
                        let value = match value {
                            Value::Number(n) => match n.as_f64() {
                                Some(f) => FieldValue::Number(f),
                                None => FieldValue::Text(n.to_string()),
                            },
                            Value::String(s) => FieldValue::Text(s),
                            Value::Null => FieldValue::Text(String::new()),
                            other => FieldValue::Text(other.to_string()),
                        };
                        (key, value)
                    })
                    .collect();
                return Decoded::ok(fields);
            }
            Ok(other) => format!("expected a JSON object, got {}", json_kind(&other)),
            Err(e) => e.to_string(),
        };

        let mut fields = Fields::new();
        fields.insert("error".to_string(), FieldValue::Text("invalid json".to_string()));
        fields.insert("raw".to_string(), FieldValue::Text(text));
        Decoded {
            fields,
            decode_error: Some(error),
        }
    }

    fn decode_binary(&self, chunk: &[u8]) -> Decoded {
        let mut fields = Fields::new();
        let mut missing = Vec::new();

        for field in &self.binary_fields {
            match chunk.get(field.offset) {
                Some(&byte) => {
                    let value = field.min + (byte as f64 / 255.0) * (field.max - field.min);
                    let value = (value * 100.0).round() / 100.0;
                    fields.insert(field.name.clone(), FieldValue::Number(value));
                }
                None => missing.push(field.name.as_str()),
            }
        }
        fields.insert("hex".to_string(), FieldValue::Text(to_hex(chunk)));

        let decode_error = if missing.is_empty() {
            None
        } else {
            Some(format!(
                "chunk of {} bytes too short for {}",
                chunk.len(),
                missing.join(", ")
            ))
        };

        Decoded {
            fields,
            decode_error,
        }
    }

    fn decode_custom(&self, chunk: &[u8]) -> Decoded {
        let text = self.text(chunk);
        let mut fields = Fields::new();
        let mut rejected = Vec::new();

        for token in text.split(self.custom_delimiter.as_str()) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once(':') {
                Some((code, value)) => {
                    let code = code.trim();
                    let name = self
                        .custom_fields
                        .get(code)
                        .cloned()
                        .unwrap_or_else(|| code.to_string());
                    fields.insert(name, FieldValue::parse(value));
                }
                None => rejected.push(token.to_string()),
            }
        }

        if fields.is_empty() {
            return Decoded {
                fields: [("message".to_string(), FieldValue::Text(text))]
                    .into_iter()
                    .collect(),
                decode_error: Some("no key:value tokens found".to_string()),
            };
        }

        let decode_error = if rejected.is_empty() {
            None
        } else {
            Some(format!("ignored malformed tokens: {}", rejected.join(", ")))
        };
        Decoded {
            fields,
            decode_error,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(fields: &Fields, key: &str) -> Option<f64> {
        fields.get(key).and_then(FieldValue::as_f64)
    }

    #[test]
    fn test_text_pairs() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(b"temperatura:25.5,humedad:60.2\n", DataFormat::Text);

        assert_eq!(decoded.decode_error, None);
        assert_eq!(decoded.fields.len(), 2);
        assert_eq!(number(&decoded.fields, "temperatura"), Some(25.5));
        assert_eq!(number(&decoded.fields, "humedad"), Some(60.2));
    }

    #[test]
    fn test_text_value_falls_back_to_string() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(b"status=ok;count=3", DataFormat::Text);

        assert_eq!(
            decoded.fields.get("status"),
            Some(&FieldValue::Text("ok".to_string()))
        );
        assert_eq!(number(&decoded.fields, "count"), Some(3.0));
    }

    #[test]
    fn test_unstructured_text_is_message() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(b"hello world\r\n", DataFormat::Text);

        assert_eq!(
            decoded.fields.get("message"),
            Some(&FieldValue::Text("hello world".to_string()))
        );
        assert_eq!(decoded.fields.len(), 1);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(&[b'o', b'k', 0xFF], DataFormat::Text);

        assert_eq!(
            decoded.fields.get("message"),
            Some(&FieldValue::Text("ok\u{FFFD}".to_string()))
        );
        assert_eq!(decoded.decode_error, None);
    }

    #[test]
    fn test_json_object() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(br#"{"temp": 26.1, "hum": 58.3}"#, DataFormat::Json);

        assert_eq!(decoded.decode_error, None);
        assert_eq!(decoded.fields.len(), 2);
        assert_eq!(number(&decoded.fields, "temp"), Some(26.1));
        assert_eq!(number(&decoded.fields, "hum"), Some(58.3));
    }

    #[test]
    fn test_invalid_json() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(b"{not valid", DataFormat::Json);

        assert!(decoded.decode_error.as_deref().is_some_and(|e| !e.is_empty()));
        assert_eq!(
            decoded.fields.get("error"),
            Some(&FieldValue::Text("invalid json".to_string()))
        );
        assert_eq!(
            decoded.fields.get("raw"),
            Some(&FieldValue::Text("{not valid".to_string()))
        );
    }

    #[test]
    fn test_json_non_object() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(b"[1, 2]", DataFormat::Json);
        assert_eq!(
            decoded.decode_error.as_deref(),
            Some("expected a JSON object, got an array")
        );
    }

    #[test]
    fn test_binary_default_table() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(&[0xFF, 0x00, 0x7F], DataFormat::Binary);

        assert_eq!(decoded.decode_error, None);
        assert_eq!(number(&decoded.fields, "temperatura"), Some(100.0));
        assert_eq!(number(&decoded.fields, "humedad"), Some(0.0));
        assert_eq!(
            decoded.fields.get("hex"),
            Some(&FieldValue::Text("FF 00 7F".to_string()))
        );
    }

    #[test]
    fn test_binary_short_chunk_keeps_hex() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(&[0x80], DataFormat::Binary);

        assert!(decoded.decode_error.is_some());
        assert_eq!(number(&decoded.fields, "temperatura"), Some(50.2));
        assert!(!decoded.fields.contains_key("humedad"));
        assert_eq!(decoded.fields.get("hex"), Some(&FieldValue::Text("80".to_string())));
    }

    #[test]
    fn test_binary_custom_table() {
        let config = Config {
            binary_fields: vec![BinaryField {
                name: "voltage".to_string(),
                offset: 2,
                min: 0.0,
                max: 5.1,
            }],
            ..Config::default()
        };
        let decoder = RecordDecoder::from_config(&config);
        let decoded = decoder.decode_as(&[0, 0, 50], DataFormat::Binary);

        assert_eq!(number(&decoded.fields, "voltage"), Some(1.0));
    }

    #[test]
    fn test_custom_short_codes() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(b"T:24.8;H:62.1;P:1013.2", DataFormat::Custom);

        assert_eq!(decoded.decode_error, None);
        assert_eq!(number(&decoded.fields, "temperatura"), Some(24.8));
        assert_eq!(number(&decoded.fields, "humedad"), Some(62.1));
        assert_eq!(number(&decoded.fields, "presion"), Some(1013.2));
    }

    #[test]
    fn test_custom_unmapped_key_passes_through() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(b"T:20;X:abc;junk", DataFormat::Custom);

        assert_eq!(number(&decoded.fields, "temperatura"), Some(20.0));
        assert_eq!(
            decoded.fields.get("X"),
            Some(&FieldValue::Text("abc".to_string()))
        );
        assert_eq!(
            decoded.decode_error.as_deref(),
            Some("ignored malformed tokens: junk")
        );
    }

    #[test]
    fn test_raw_format() {
        let decoder = RecordDecoder::default();
        let decoded = decoder.decode_as(b"a:1,b:2", DataFormat::Raw);
        assert_eq!(
            decoded.fields.get("raw"),
            Some(&FieldValue::Text("a:1,b:2".to_string()))
        );
    }

    #[test]
    fn test_latin1_encoding() {
        assert_eq!(TextEncoding::from_label("ISO-8859-1"), TextEncoding::Latin1);
        assert_eq!(TextEncoding::Latin1.decode(&[0x63, 0x61, 0xF1]), "ca\u{F1}");
        assert_eq!(TextEncoding::from_label("klingon"), TextEncoding::Utf8);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(to_hex(&[0x01, 0xAB, 0x10]), "01 AB 10");
        assert_eq!(to_hex(&[]), "");
    }
}
