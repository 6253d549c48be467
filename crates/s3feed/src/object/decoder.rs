//! Turning an object body into discrete records.
//!
//! Two built-in decoders cover the common layouts: line-oriented text and
//! JSON (one document, a stream of documents, or NDJSON). Selectors can
//! attach any other [`RecordDecoder`].

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ProcessError;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Root array marker for `expand_event_list_from_field`.
pub const ROOT_ARRAY: &str = ".[]";

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub message: String,
    /// Byte offset of the record within the decompressed body.
    pub offset: u64,
    /// Extra fields merged into the published record.
    pub fields: Option<Map<String, Value>>,
}

impl DecodedRecord {
    pub fn new(message: impl Into<String>, offset: u64) -> Self {
        Self {
            message: message.into(),
            offset,
            fields: None,
        }
    }
}

/// Pluggable payload decoder.
///
/// Records appended to `out` before an error is returned are still published.
pub trait RecordDecoder: Send + Sync + fmt::Debug {
    fn decode(&self, data: &[u8], out: &mut Vec<DecodedRecord>) -> Result<(), ProcessError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineTerminator {
    /// Line feed, with a trailing carriage return stripped.
    #[default]
    Auto,
    LineFeed,
    VerticalTab,
    FormFeed,
    CarriageReturn,
    CarriageReturnLineFeed,
    NextLine,
    LineSeparator,
    ParagraphSeparator,
    NullTerminator,
}

impl LineTerminator {
    fn bytes(self) -> &'static [u8] {
        match self {
            LineTerminator::Auto | LineTerminator::LineFeed => b"\n",
            LineTerminator::VerticalTab => b"\x0b",
            LineTerminator::FormFeed => b"\x0c",
            LineTerminator::CarriageReturn => b"\r",
            LineTerminator::CarriageReturnLineFeed => b"\r\n",
            LineTerminator::NextLine => "\u{0085}".as_bytes(),
            LineTerminator::LineSeparator => "\u{2028}".as_bytes(),
            LineTerminator::ParagraphSeparator => "\u{2029}".as_bytes(),
            LineTerminator::NullTerminator => b"\0",
        }
    }
}

impl FromStr for LineTerminator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(LineTerminator::Auto),
            "line_feed" => Ok(LineTerminator::LineFeed),
            "vertical_tab" => Ok(LineTerminator::VerticalTab),
            "form_feed" => Ok(LineTerminator::FormFeed),
            "carriage_return" => Ok(LineTerminator::CarriageReturn),
            "carriage_return_line_feed" => Ok(LineTerminator::CarriageReturnLineFeed),
            "next_line" => Ok(LineTerminator::NextLine),
            "line_separator" => Ok(LineTerminator::LineSeparator),
            "paragraph_separator" => Ok(LineTerminator::ParagraphSeparator),
            "null_terminator" => Ok(LineTerminator::NullTerminator),
            _ => Err(format!("Invalid line terminator: {}", s)),
        }
    }
}

/// One record per line. A last line without terminator is still emitted;
/// empty lines are skipped.
#[derive(Debug, Clone, Default)]
pub struct LineDecoder {
    terminator: LineTerminator,
}

impl LineDecoder {
    pub fn new(terminator: LineTerminator) -> Self {
        Self { terminator }
    }
}

impl RecordDecoder for LineDecoder {
    fn decode(&self, data: &[u8], out: &mut Vec<DecodedRecord>) -> Result<(), ProcessError> {
        let term = self.terminator.bytes();
        let mut start = 0usize;

        while start < data.len() {
            let rest = &data[start..];
            let (end, next) = match rest.windows(term.len()).position(|w| w == term) {
                Some(pos) => (start + pos, start + pos + term.len()),
                None => (data.len(), data.len()),
            };

            let mut line = &data[start..end];
            if self.terminator == LineTerminator::Auto {
                line = line.strip_suffix(b"\r").unwrap_or(line);
            }
            if !line.is_empty() {
                out.push(DecodedRecord::new(
                    String::from_utf8_lossy(line).into_owned(),
                    start as u64,
                ));
            }
            start = next;
        }
        Ok(())
    }
}

/// JSON documents, concatenated or newline delimited. Each top-level value
/// is a record unless `expand_event_list_from_field` names an array to split.
#[derive(Debug, Clone, Default)]
pub struct JsonDecoder {
    expand_event_list_from_field: Option<String>,
}

impl JsonDecoder {
    pub fn new(expand_event_list_from_field: Option<String>) -> Self {
        Self {
            expand_event_list_from_field: expand_event_list_from_field.filter(|f| !f.is_empty()),
        }
    }

    fn split_event_list(
        &self,
        field: &str,
        raw: &RawValue,
        offset: u64,
        out: &mut Vec<DecodedRecord>,
    ) -> Result<(), ProcessError> {
        let list: &RawValue = if field == ROOT_ARRAY {
            raw
        } else {
            let object: HashMap<String, &RawValue> = serde_json::from_str(raw.get())
                .map_err(|e| ProcessError::Decode(format!("failed to decode json object: {e}")))?;
            object.get(field).copied().ok_or_else(|| {
                ProcessError::Decode(format!(
                    "expand_event_list_from_field key <{field}> is not in event"
                ))
            })?
        };

        let items: Vec<&RawValue> = serde_json::from_str(list.get()).map_err(|_| {
            ProcessError::Decode(format!(
                "expand_event_list_from_field <{field}> is not an array"
            ))
        })?;

        let base = raw.get().as_ptr() as usize;
        for item in items {
            let relative = (item.get().as_ptr() as usize).saturating_sub(base) as u64;
            out.push(DecodedRecord::new(item.get(), offset + relative));
        }
        Ok(())
    }
}

impl RecordDecoder for JsonDecoder {
    fn decode(&self, data: &[u8], out: &mut Vec<DecodedRecord>) -> Result<(), ProcessError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| ProcessError::Decode(format!("json body is not valid UTF-8: {e}")))?;
        let mut stream = serde_json::Deserializer::from_str(text).into_iter::<&RawValue>();

        loop {
            let offset = stream.byte_offset() as u64;
            let raw = match stream.next() {
                None => break,
                Some(Ok(raw)) => raw,
                Some(Err(e)) => {
                    return Err(ProcessError::Decode(format!("failed to decode json: {e}")))
                }
            };

            match &self.expand_event_list_from_field {
                Some(field) => self.split_event_list(field, raw, offset, out)?,
                None => out.push(DecodedRecord::new(raw.get(), offset)),
            }
        }
        Ok(())
    }
}

/// Whether a content type selects the JSON decoder.
pub fn is_json_content_type(content_type: &str) -> bool {
    content_type.starts_with(CONTENT_TYPE_JSON) || content_type.starts_with(CONTENT_TYPE_NDJSON)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn decode(decoder: &dyn RecordDecoder, data: &[u8]) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        decoder.decode(data, &mut out).unwrap();
        out.into_iter().map(|r| (r.message, r.offset)).collect()
    }

    #[test]
    fn test_lines_carry_byte_offsets() {
        let records = decode(&LineDecoder::default(), b"first\r\n\nsecond\nlast");
        assert_eq!(
            records,
            vec![
                ("first".to_string(), 0),
                ("second".to_string(), 8),
                ("last".to_string(), 15),
            ]
        );
    }

    #[test]
    fn test_custom_line_terminator() {
        let decoder = LineDecoder::new(LineTerminator::NullTerminator);
        let records = decode(&decoder, b"a\nb\0c");
        assert_eq!(records, vec![("a\nb".to_string(), 0), ("c".to_string(), 4)]);
        assert_eq!(
            "carriage_return_line_feed".parse::<LineTerminator>().unwrap(),
            LineTerminator::CarriageReturnLineFeed
        );
        assert!("semicolon".parse::<LineTerminator>().is_err());
    }

    #[test]
    fn test_ndjson_stream_keeps_raw_documents() {
        let data = b"{\"b\":1,\"a\":2}\n{\"c\":3}\n";
        let records = decode(&JsonDecoder::default(), data);
        assert_eq!(
            records,
            vec![
                ("{\"b\":1,\"a\":2}".to_string(), 0),
                ("{\"c\":3}".to_string(), 13),
            ]
        );
    }

    #[test]
    fn test_expand_event_list_from_field() {
        let data = br#"{"Records":[{"id":1},{"id":2}]}"#;
        let decoder = JsonDecoder::new(Some("Records".to_string()));
        let records = decode(&decoder, data);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, r#"{"id":1}"#);
        assert_eq!(records[1].0, r#"{"id":2}"#);
        assert!(records[0].1 < records[1].1);
    }

    #[test]
    fn test_root_array_is_split() {
        let decoder = JsonDecoder::new(Some(ROOT_ARRAY.to_string()));
        let records = decode(&decoder, br#"[{"a":1},{"a":2},{"a":3}]"#);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].0, r#"{"a":3}"#);
    }

    #[test]
    fn test_missing_or_scalar_expand_field_is_an_error() {
        let decoder = JsonDecoder::new(Some("Records".to_string()));
        let mut out = Vec::new();
        let err = decoder.decode(br#"{"Other":[]}"#, &mut out).unwrap_err();
        assert!(err.to_string().contains("is not in event"));

        let err = decoder.decode(br#"{"Records":5}"#, &mut out).unwrap_err();
        assert!(err.to_string().contains("is not an array"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_records_before_a_syntax_error_are_kept() {
        let mut out = Vec::new();
        let result = JsonDecoder::default().decode(b"{\"a\":1}\n{broken", &mut out);
        assert!(matches!(result, Err(ProcessError::Decode(_))));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_json_content_types() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/x-ndjson; charset=utf-8"));
        assert!(!is_json_content_type("text/plain"));
    }
}
