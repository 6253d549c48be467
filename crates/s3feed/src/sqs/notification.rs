//! Decoding of S3 event notifications delivered through the queue.
//!
//! Bodies are S3 event documents (`Records[]`), optionally wrapped once in
//! an SNS envelope whose `Message` is the same document as a JSON string or
//! base64 encoded.

use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::aws::bucket_arn;
use crate::error::NotificationError;
use crate::object::ObjectRef;

const S3_EVENT_SOURCE: &str = "aws:s3";
const OBJECT_CREATED_PREFIX: &str = "ObjectCreated:";

#[derive(Debug, Deserialize)]
struct EventNotification {
    #[serde(rename = "Records", default)]
    records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    #[serde(rename = "eventSource", default)]
    event_source: String,
    #[serde(rename = "awsRegion", default)]
    aws_region: String,
    #[serde(rename = "eventName", default)]
    event_name: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
struct BucketEntity {
    name: String,
    #[serde(default)]
    arn: String,
}

#[derive(Debug, Deserialize)]
struct ObjectEntity {
    key: String,
}

/// User hook replacing the built-in decoding of a message body.
pub trait NotificationPreParser: Send + Sync {
    fn parse(&self, body: &str) -> Result<Vec<ObjectRef>, NotificationError>;
}

#[derive(Clone, Default)]
pub struct NotificationParser {
    pre_parser: Option<Arc<dyn NotificationPreParser>>,
}

impl NotificationParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre_parser(pre_parser: Arc<dyn NotificationPreParser>) -> Self {
        Self {
            pre_parser: Some(pre_parser),
        }
    }

    /// Object references named by a message body. Records that are not
    /// `ObjectCreated:*` events from S3 are skipped.
    pub fn parse(&self, body: &str) -> Result<Vec<ObjectRef>, NotificationError> {
        if let Some(pre_parser) = &self.pre_parser {
            return pre_parser.parse(body);
        }

        let value: Value = serde_json::from_str(body)?;
        let value = unwrap_envelope(value)?;
        let notification: EventNotification = serde_json::from_value(value)?;

        let mut refs = Vec::with_capacity(notification.records.len());
        for record in notification.records {
            if record.event_source != S3_EVENT_SOURCE
                || !record.event_name.starts_with(OBJECT_CREATED_PREFIX)
            {
                warn!(
                    event_source = %record.event_source,
                    event_name = %record.event_name,
                    "skipping notification record that is not an S3 ObjectCreated event"
                );
                continue;
            }

            let key = unescape_key(&record.s3.object.key)?;
            let arn = if record.s3.bucket.arn.is_empty() {
                bucket_arn(&record.s3.bucket.name)
            } else {
                record.s3.bucket.arn
            };
            refs.push(ObjectRef::new(record.s3.bucket.name, arn, key).with_region(record.aws_region));
        }

        debug!(references = refs.len(), "decoded notification");
        Ok(refs)
    }
}

/// Replaces an SNS envelope by the notification it carries.
fn unwrap_envelope(value: Value) -> Result<Value, NotificationError> {
    let is_envelope = value.get("TopicArn").is_some() && value.get("Message").is_some();
    if !is_envelope {
        return Ok(value);
    }

    let message = value
        .get("Message")
        .and_then(Value::as_str)
        .ok_or_else(|| NotificationError::Envelope("Message is not a string".to_string()))?;

    if let Ok(inner) = serde_json::from_str::<Value>(message) {
        return Ok(inner);
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(message.trim())
        .map_err(|e| NotificationError::Envelope(format!("Message is neither JSON nor base64: {e}")))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| NotificationError::Envelope(format!("decoded Message is not JSON: {e}")))
}

/// Query-style unescape: `+` is a space, `%XX` is a byte.
fn unescape_key(key: &str) -> Result<String, NotificationError> {
    let spaced = key.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| NotificationError::Unescape {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn s3_event(event_name: &str, key: &str) -> Value {
        json!({
            "Records": [{
                "eventSource": "aws:s3",
                "awsRegion": "us-east-1",
                "eventName": event_name,
                "s3": {
                    "bucket": { "name": "logs", "arn": "arn:aws:s3:::logs" },
                    "object": { "key": key }
                }
            }]
        })
    }

    #[test]
    fn test_object_created_records_become_references() {
        let body = s3_event("ObjectCreated:Put", "2024/app+log%3D1.gz").to_string();
        let refs = NotificationParser::new().parse(&body).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].bucket_name, "logs");
        assert_eq!(refs[0].bucket_arn, "arn:aws:s3:::logs");
        assert_eq!(refs[0].key, "2024/app log=1.gz");
        assert_eq!(refs[0].region, "us-east-1");
    }

    #[test]
    fn test_other_events_are_skipped() {
        let body = s3_event("ObjectRemoved:Delete", "a").to_string();
        assert!(NotificationParser::new().parse(&body).unwrap().is_empty());
        let test_event = json!({ "Service": "Amazon S3", "Event": "s3:TestEvent" }).to_string();
        assert!(NotificationParser::new().parse(&test_event).unwrap().is_empty());
    }

    #[test]
    fn test_sns_envelope_with_json_message() {
        let body = json!({
            "Type": "Notification",
            "TopicArn": "arn:aws:sns:us-east-1:123:topic",
            "Message": s3_event("ObjectCreated:Put", "k").to_string(),
        })
        .to_string();
        let refs = NotificationParser::new().parse(&body).unwrap();
        assert_eq!(refs[0].key, "k");
    }

    #[test]
    fn test_sns_envelope_with_base64_message() {
        let inner = s3_event("ObjectCreated:Copy", "b64").to_string();
        let body = json!({
            "TopicArn": "arn:aws:sns:us-east-1:123:topic",
            "Message": base64::engine::general_purpose::STANDARD.encode(inner),
        })
        .to_string();
        let refs = NotificationParser::new().parse(&body).unwrap();
        assert_eq!(refs[0].key, "b64");
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        assert!(matches!(
            NotificationParser::new().parse("not json"),
            Err(NotificationError::Json(_))
        ));
        let body = json!({ "TopicArn": "t", "Message": "%%%" }).to_string();
        assert!(matches!(
            NotificationParser::new().parse(&body),
            Err(NotificationError::Envelope(_))
        ));
    }

    #[test]
    fn test_pre_parser_replaces_builtin_decoding() {
        struct Fixed;
        impl NotificationPreParser for Fixed {
            fn parse(&self, body: &str) -> Result<Vec<ObjectRef>, NotificationError> {
                Ok(vec![ObjectRef::new("b", "arn:aws:s3:::b", body)])
            }
        }
        let refs = NotificationParser::with_pre_parser(Arc::new(Fixed))
            .parse("custom-key")
            .unwrap();
        assert_eq!(refs[0].key, "custom-key");
    }
}
