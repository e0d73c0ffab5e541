// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use tracing::warn;
use zqueue_common_storage_log::Record;

/// Direction a message was last seen in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum RunType {
    /// Written by a producer.
    #[default]
    Send    = 1,
    /// Handed to a consumer handler.
    Receive = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id assigned at send time; stable across restarts.
    pub id:        String,
    pub topic:     String,
    /// Always 0 for the disk driver.
    pub partition: i32,
    /// Position in the topic, or [`Message::UNASSIGNED_OFFSET`] for a delayed
    /// message that has not been released yet.
    pub offset:    u64,
    pub timestamp: DateTime<Utc>,
    pub run_type:  RunType,
    pub body:      Bytes,
}

impl Message {
    pub const UNASSIGNED_OFFSET: u64 = u64::MAX;

    /// Body as text; invalid UTF-8 is replaced.
    #[must_use]
    pub fn body_string(&self) -> String { String::from_utf8_lossy(&self.body).into_owned() }

    #[must_use]
    pub const fn is_assigned(&self) -> bool { self.offset != Self::UNASSIGNED_OFFSET }

    pub(crate) fn to_record(&self) -> Record {
        Record {
            offset:    self.offset,
            timestamp: self.timestamp.timestamp_millis(),
            run_type:  self.run_type.into(),
            id:        self.id.clone(),
            body:      self.body.clone(),
        }
    }

    pub(crate) fn from_record(topic: &str, record: Record) -> Self {
        let run_type = RunType::try_from(record.run_type).unwrap_or_else(|_| {
            warn!(topic, offset = record.offset, run_type = record.run_type, "Unknown run type on disk");
            RunType::Send
        });
        Self {
            id: record.id,
            topic: topic.to_owned(),
            partition: 0,
            offset: record.offset,
            timestamp: DateTime::from_timestamp_millis(record.timestamp).unwrap_or_default(),
            run_type,
            body: record.body,
        }
    }

    /// Mark the message as delivered to a handler.
    #[must_use]
    pub(crate) fn received(mut self) -> Self {
        self.run_type = RunType::Receive;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            id:        "0b6f".to_owned(),
            topic:     "login_log".to_owned(),
            partition: 0,
            offset:    42,
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            run_type:  RunType::Send,
            body:      Bytes::from_static(b"{\"user\":\"alice\"}"),
        }
    }

    #[test]
    fn test_record_conversion_keeps_fields() {
        let sent = message();
        let record = sent.to_record();
        assert_eq!(record.run_type, 1);
        assert_eq!(record.timestamp, 1_700_000_000_123);

        let received = Message::from_record("login_log", record).received();
        assert_eq!(received.run_type, RunType::Receive);
        assert_eq!(received.id, sent.id);
        assert_eq!(received.timestamp, sent.timestamp);
        assert_eq!(received.body_string(), "{\"user\":\"alice\"}");
    }

    #[test]
    fn test_unknown_run_type_falls_back_to_send() {
        let mut record = message().to_record();
        record.run_type = 9;
        assert_eq!(Message::from_record("t", record).run_type, RunType::Send);
    }

    #[test]
    fn test_lossy_body_string() {
        let mut msg = message();
        msg.body = Bytes::from_static(&[0x66, 0xff, 0x6f]);
        assert_eq!(msg.body_string(), "f\u{fffd}o");
        assert!(msg.is_assigned());
    }

    #[test]
    fn test_json_shape_for_host_logs() {
        let json = serde_json::to_value(message()).unwrap();
        assert_eq!(json["topic"], "login_log");
        assert_eq!(json["offset"], 42);
        assert_eq!(json["run_type"], "Send");
        assert_eq!(json["timestamp"], "2023-11-14T22:13:20.123Z");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, message().body);
    }

    #[test]
    fn test_run_type_values() {
        assert_eq!(u8::from(RunType::Send), 1);
        assert_eq!(RunType::try_from(2_u8).unwrap(), RunType::Receive);
        assert!(RunType::try_from(0_u8).is_err());
    }
}
