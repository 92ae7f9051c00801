//! Typed schemas for change-capture and vote messages.
//!
//! Change events arrive in the canal flat-message shape: `{type, database, table, isDdl, data}`
//! where each `data` row maps column names to values. Column values may be JSON strings (canal
//! renders every column as text) or JSON numbers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{CommunityRecord, PostRecord, VoteBallot};
use crate::domain::types::VoteValue;
use crate::util::time::{format_timestamp, parse_timestamp};

/// Routing key of every vote event.
pub const VOTE_EVENT_KEY: &str = "vote_post";
/// Routing key used for entity change events published by this service.
pub const CHANGE_EVENT_KEY: &str = "change";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("payload is not valid JSON of the expected shape: {0}")]
    Payload(String),
    #[error("field `{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}

impl MessageError {
    fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            field,
            reason: reason.into(),
        }
    }
}

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    #[serde(default, rename = "isDdl", alias = "idDdl")]
    pub is_ddl: bool,
    #[serde(default)]
    pub data: Vec<Row>,
}

impl ChangeEvent {
    pub fn decode(payload: &str) -> Result<Self, MessageError> {
        serde_json::from_str(payload).map_err(|err| MessageError::Payload(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|err| MessageError::Payload(err.to_string()))
    }

    /// Row insertions are the only change kind the cache reacts to.
    pub fn is_insert(&self) -> bool {
        !self.is_ddl && self.kind.eq_ignore_ascii_case("INSERT")
    }

    pub fn community_inserted(community: &CommunityRecord) -> Self {
        Self::insert("communities", CommunityRow::from(community).into_row())
    }

    pub fn post_inserted(post: &PostRecord) -> Self {
        Self::insert("posts", PostRow::from(post).into_row())
    }

    fn insert(table: &str, row: Row) -> Self {
        Self {
            kind: "INSERT".to_string(),
            database: String::new(),
            table: table.to_string(),
            is_ddl: false,
            data: vec![row],
        }
    }
}

// ============================================================================
// Typed rows
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunityRow {
    pub community_id: i64,
    pub community_name: String,
    pub introduction: String,
    pub create_time: OffsetDateTime,
}

impl CommunityRow {
    pub fn parse(row: &Row) -> Result<Self, MessageError> {
        Ok(Self {
            community_id: int_field(row, "community_id")?,
            community_name: text_field(row, "community_name")?,
            introduction: text_field(row, "introduction")?,
            create_time: time_field(row, "create_time")?,
        })
    }

    fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("community_id".into(), self.community_id.to_string().into());
        row.insert("community_name".into(), self.community_name.into());
        row.insert("introduction".into(), self.introduction.into());
        row.insert("create_time".into(), format_timestamp(self.create_time).into());
        row
    }
}

impl From<&CommunityRecord> for CommunityRow {
    fn from(record: &CommunityRecord) -> Self {
        Self {
            community_id: record.id,
            community_name: record.name.clone(),
            introduction: record.introduction.clone(),
            create_time: record.created_at,
        }
    }
}

impl From<CommunityRow> for CommunityRecord {
    fn from(row: CommunityRow) -> Self {
        Self {
            id: row.community_id,
            name: row.community_name,
            introduction: row.introduction,
            created_at: row.create_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRow {
    pub post_id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub community_id: i64,
    pub create_time: OffsetDateTime,
}

impl PostRow {
    pub fn parse(row: &Row) -> Result<Self, MessageError> {
        Ok(Self {
            post_id: int_field(row, "post_id")?,
            title: text_field(row, "title")?,
            content: text_field(row, "content")?,
            author_id: int_field(row, "author_id")?,
            community_id: int_field(row, "community_id")?,
            create_time: time_field(row, "create_time")?,
        })
    }

    fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("post_id".into(), self.post_id.to_string().into());
        row.insert("title".into(), self.title.into());
        row.insert("content".into(), self.content.into());
        row.insert("author_id".into(), self.author_id.to_string().into());
        row.insert("community_id".into(), self.community_id.to_string().into());
        row.insert("create_time".into(), format_timestamp(self.create_time).into());
        row
    }
}

impl From<&PostRecord> for PostRow {
    fn from(record: &PostRecord) -> Self {
        Self {
            post_id: record.id,
            title: record.title.clone(),
            content: record.content.clone(),
            author_id: record.author_id,
            community_id: record.community_id,
            create_time: record.created_at,
        }
    }
}

impl From<PostRow> for PostRecord {
    fn from(row: PostRow) -> Self {
        Self {
            id: row.post_id,
            author_id: row.author_id,
            community_id: row.community_id,
            title: row.title,
            content: row.content,
            created_at: row.create_time,
        }
    }
}

fn int_field(row: &Row, field: &'static str) -> Result<i64, MessageError> {
    match row.get(field) {
        Some(Value::String(raw)) => raw
            .trim()
            .parse()
            .map_err(|err| MessageError::malformed(field, format!("`{raw}`: {err}"))),
        Some(Value::Number(number)) => number
            .as_i64()
            .ok_or_else(|| MessageError::malformed(field, format!("`{number}` is not an integer"))),
        Some(other) => Err(MessageError::malformed(
            field,
            format!("expected an integer, got {other}"),
        )),
        None => Err(MessageError::malformed(field, "missing")),
    }
}

fn text_field(row: &Row, field: &'static str) -> Result<String, MessageError> {
    match row.get(field) {
        Some(Value::String(raw)) => Ok(raw.clone()),
        Some(other) => Err(MessageError::malformed(
            field,
            format!("expected a string, got {other}"),
        )),
        None => Err(MessageError::malformed(field, "missing")),
    }
}

fn time_field(row: &Row, field: &'static str) -> Result<OffsetDateTime, MessageError> {
    match row.get(field) {
        Some(Value::String(raw)) => parse_timestamp(raw)
            .map_err(|err| MessageError::malformed(field, format!("`{raw}`: {err}"))),
        Some(other) => Err(MessageError::malformed(
            field,
            format!("expected a timestamp string, got {other}"),
        )),
        None => Err(MessageError::malformed(field, "missing")),
    }
}

// ============================================================================
// Vote events
// ============================================================================

/// A ballot change to persist into the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEvent {
    pub post_id: i64,
    pub user_id: i64,
    pub vote_type: VoteValue,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
}

impl VoteEvent {
    pub fn decode(payload: &str) -> Result<Self, MessageError> {
        serde_json::from_str(payload).map_err(|err| MessageError::Payload(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|err| MessageError::Payload(err.to_string()))
    }
}

impl From<VoteEvent> for VoteBallot {
    fn from(event: VoteEvent) -> Self {
        Self {
            post_id: event.post_id,
            user_id: event.user_id,
            value: event.vote_type,
            created_at: event.create_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn decodes_canal_flat_message() {
        let payload = json!({
            "type": "INSERT",
            "database": "bluebell",
            "table": "post",
            "isDdl": false,
            "data": [{
                "post_id": "42",
                "title": "hello",
                "content": "world",
                "author_id": "7",
                "community_id": "3",
                "create_time": "2024-03-01 12:30:05"
            }]
        })
        .to_string();

        let event = ChangeEvent::decode(&payload).expect("decode");
        assert!(event.is_insert());
        let post = PostRow::parse(&event.data[0]).expect("row");
        assert_eq!(post.post_id, 42);
        assert_eq!(post.create_time, datetime!(2024-03-01 12:30:05 UTC));
    }

    #[test]
    fn accepts_misspelled_ddl_flag_and_skips_ddl() {
        let event = ChangeEvent::decode(r#"{"type":"INSERT","idDdl":true,"data":[]}"#)
            .expect("decode");
        assert!(event.is_ddl);
        assert!(!event.is_insert());

        let update = ChangeEvent::decode(r#"{"type":"UPDATE","data":[]}"#).expect("decode");
        assert!(!update.is_insert());
    }

    #[test]
    fn numeric_columns_are_accepted() {
        let community = CommunityRow::parse(&row(json!({
            "community_id": 5,
            "community_name": "rust",
            "introduction": "crabs",
            "create_time": "2024-03-01T12:30:05Z"
        })))
        .expect("row");
        assert_eq!(community.community_id, 5);
    }

    #[test]
    fn malformed_fields_name_the_field() {
        let err = PostRow::parse(&row(json!({
            "post_id": "not-a-number",
            "title": "t",
            "content": "c",
            "author_id": "1",
            "community_id": "1",
            "create_time": "2024-03-01 12:30:05"
        })))
        .expect_err("malformed");
        assert!(matches!(err, MessageError::Malformed { field: "post_id", .. }));

        let err = CommunityRow::parse(&row(json!({
            "community_id": "1",
            "community_name": "go",
            "introduction": "gophers",
            "create_time": "yesterday"
        })))
        .expect_err("malformed");
        assert!(matches!(err, MessageError::Malformed { field: "create_time", .. }));

        let err = CommunityRow::parse(&row(json!({"community_id": "1"}))).expect_err("missing");
        assert!(matches!(err, MessageError::Malformed { field: "community_name", .. }));
    }

    #[test]
    fn null_text_columns_are_rejected() {
        let err = PostRow::parse(&row(json!({
            "post_id": "8",
            "title": null,
            "content": "c",
            "author_id": "1",
            "community_id": "1",
            "create_time": "2024-03-01 12:30:05"
        })))
        .expect_err("null title");
        assert!(matches!(err, MessageError::Malformed { field: "title", .. }));

        let err = CommunityRow::parse(&row(json!({
            "community_id": "1",
            "community_name": "go",
            "introduction": null,
            "create_time": "2024-03-01 12:30:05"
        })))
        .expect_err("null introduction");
        assert!(matches!(err, MessageError::Malformed { field: "introduction", .. }));
    }

    #[test]
    fn published_change_events_parse_back() {
        let post = PostRecord {
            id: 9,
            author_id: 2,
            community_id: 4,
            title: "title".to_string(),
            content: "body".to_string(),
            created_at: datetime!(2024-05-06 07:08:09 UTC),
        };
        let payload = ChangeEvent::post_inserted(&post).encode().expect("encode");
        let event = ChangeEvent::decode(&payload).expect("decode");
        assert_eq!(event.table, "posts");
        let parsed = PostRecord::from(PostRow::parse(&event.data[0]).expect("row"));
        assert_eq!(parsed, post);
    }

    #[test]
    fn vote_event_wire_format() {
        let event = VoteEvent {
            post_id: 1,
            user_id: 2,
            vote_type: VoteValue::Down,
            create_time: datetime!(2024-01-01 00:00:00 UTC),
        };
        let json: Value = serde_json::from_str(&event.encode().expect("encode")).expect("json");
        assert_eq!(
            json,
            json!({
                "post_id": 1,
                "user_id": 2,
                "vote_type": -1,
                "create_time": "2024-01-01T00:00:00Z"
            })
        );
        assert!(VoteEvent::decode(r#"{"post_id":1,"user_id":2,"vote_type":3}"#).is_err());
    }
}
