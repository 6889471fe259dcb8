//! Stream events and Jetstream frame parsing.
//!
//! The global event log is consumed as a Jetstream-style JSON stream. Each
//! frame carries a microsecond timestamp (`time_us`) that doubles as the
//! sequence number and resumption cursor. Only `commit` frames describe
//! record mutations; `identity` and `account` frames still advance the
//! cursor but carry no event.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::uri::ResourceUri;

/// The mutation a commit applies to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// String form, as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A single record mutation from one author's repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Position in the global log. Ordered per author, not across authors.
    pub seq: u64,
    /// Author identity.
    pub did: String,
    /// Collection type (NSID).
    pub collection: String,
    /// Record key within the collection.
    pub rkey: String,
    pub operation: Operation,
    /// Record payload; absent for deletes.
    pub record: Option<serde_json::Value>,
    /// Content hash of the record version.
    pub cid: Option<String>,
    /// Repository revision the commit belongs to.
    pub rev: String,
}

impl StreamEvent {
    /// The resource identifier this event mutates.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUri`] when the did, collection or record key is not a
    /// single valid path segment.
    pub fn uri(&self) -> Result<ResourceUri> {
        ResourceUri::from_parts(&self.did, &self.collection, &self.rkey)
    }

    /// Whether the event removes its record.
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }
}

/// One frame read off the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Cursor value to persist once the frame is handled.
    pub seq: u64,
    /// The record mutation, if this was a commit frame.
    pub event: Option<StreamEvent>,
}

#[derive(Deserialize)]
struct RawFrame {
    did: Option<String>,
    time_us: Option<u64>,
    kind: Option<String>,
    commit: Option<RawCommit>,
}

#[derive(Deserialize)]
struct RawCommit {
    rev: Option<String>,
    operation: Option<Operation>,
    collection: Option<String>,
    rkey: Option<String>,
    record: Option<serde_json::Value>,
    cid: Option<String>,
}

/// Parse a Jetstream JSON frame.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] when required envelope or commit fields
/// are missing, and [`Error::Json`] when the text is not JSON at all.
pub fn parse_jetstream_frame(text: &str) -> Result<Frame> {
    let raw: RawFrame = serde_json::from_str(text)?;

    let seq = raw
        .time_us
        .ok_or_else(|| Error::MalformedFrame("missing time_us".to_string()))?;
    let did = raw
        .did
        .filter(|d| !d.is_empty())
        .ok_or_else(|| Error::MalformedFrame("missing did".to_string()))?;

    if raw.kind.as_deref() != Some("commit") {
        return Ok(Frame { seq, event: None });
    }

    let commit = raw
        .commit
        .ok_or_else(|| Error::MalformedFrame("commit frame without commit body".to_string()))?;

    let operation = commit
        .operation
        .ok_or_else(|| Error::MalformedFrame("commit without operation".to_string()))?;
    let collection = commit
        .collection
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::MalformedFrame("commit without collection".to_string()))?;
    let rkey = commit
        .rkey
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::MalformedFrame("commit without rkey".to_string()))?;

    ResourceUri::from_parts(&did, &collection, &rkey)
        .map_err(|e| Error::MalformedFrame(e.to_string()))?;

    if operation != Operation::Delete && commit.record.is_none() {
        return Err(Error::MalformedFrame(format!(
            "{} commit without record",
            operation.as_str()
        )));
    }

    Ok(Frame {
        seq,
        event: Some(StreamEvent {
            seq,
            did,
            collection,
            rkey,
            operation,
            record: commit.record,
            cid: commit.cid,
            rev: commit.rev.unwrap_or_default(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_commit() {
        let text = r#"{
            "did": "did:plc:alice",
            "time_us": 1725911162329308,
            "kind": "commit",
            "commit": {
                "rev": "3l3qo2vutsw2b",
                "operation": "create",
                "collection": "social.arabica.alpha.like",
                "rkey": "3l3qo2vuowo2b",
                "record": {"subject": {"uri": "at://did:plc:bob/social.arabica.alpha.brew/1"}},
                "cid": "bafyrei"
            }
        }"#;

        let frame = parse_jetstream_frame(text).unwrap();
        assert_eq!(frame.seq, 1725911162329308);
        let event = frame.event.unwrap();
        assert_eq!(event.did, "did:plc:alice");
        assert_eq!(event.operation, Operation::Create);
        assert_eq!(event.collection, "social.arabica.alpha.like");
        assert_eq!(
            event.uri().unwrap().to_string(),
            "at://did:plc:alice/social.arabica.alpha.like/3l3qo2vuowo2b"
        );
        assert_eq!(event.cid.as_deref(), Some("bafyrei"));
    }

    #[test]
    fn test_parse_delete_without_record() {
        let text = r#"{"did":"did:plc:a","time_us":5,"kind":"commit",
            "commit":{"rev":"r","operation":"delete","collection":"c.d.e","rkey":"k"}}"#;
        let event = parse_jetstream_frame(text).unwrap().event.unwrap();
        assert!(event.is_delete());
        assert!(event.record.is_none());
    }

    #[test]
    fn test_identity_frame_advances_cursor_only() {
        let text = r#"{"did":"did:plc:a","time_us":42,"kind":"identity","identity":{}}"#;
        let frame = parse_jetstream_frame(text).unwrap();
        assert_eq!(frame.seq, 42);
        assert!(frame.event.is_none());
    }

    #[test]
    fn test_missing_time_is_malformed() {
        let text = r#"{"did":"did:plc:a","kind":"commit"}"#;
        let err = parse_jetstream_frame(text).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_create_without_record_is_malformed() {
        let text = r#"{"did":"did:plc:a","time_us":1,"kind":"commit",
            "commit":{"operation":"create","collection":"c","rkey":"k"}}"#;
        let err = parse_jetstream_frame(text).unwrap_err();
        assert!(err.to_string().contains("without record"));
    }

    #[test]
    fn test_unknown_operation_is_json_error() {
        let text = r#"{"did":"did:plc:a","time_us":1,"kind":"commit",
            "commit":{"operation":"mutate","collection":"c","rkey":"k"}}"#;
        assert!(matches!(
            parse_jetstream_frame(text).unwrap_err(),
            Error::Json(_)
        ));
    }

    #[test]
    fn test_commit_with_unaddressable_parts_is_malformed() {
        let slash_rkey = r#"{"did":"did:plc:a","time_us":1,"kind":"commit",
            "commit":{"operation":"create","collection":"c.d.e","rkey":"x/y","record":{}}}"#;
        let err = parse_jetstream_frame(slash_rkey).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
        assert!(err.to_string().contains("too many path segments"));

        let handle = r#"{"did":"alice.example.com","time_us":1,"kind":"commit",
            "commit":{"operation":"delete","collection":"c.d.e","rkey":"k"}}"#;
        assert!(matches!(
            parse_jetstream_frame(handle).unwrap_err(),
            Error::MalformedFrame(_)
        ));
    }

    #[test]
    fn test_event_uri_rejects_slash_in_rkey() {
        let event = StreamEvent {
            seq: 1,
            did: "did:plc:a".to_string(),
            collection: "c.d.e".to_string(),
            rkey: "x/y".to_string(),
            operation: Operation::Delete,
            record: None,
            cid: None,
            rev: String::new(),
        };
        assert!(matches!(event.uri().unwrap_err(), Error::InvalidUri { .. }));
    }

    #[test]
    fn test_garbage_is_json_error() {
        assert!(matches!(
            parse_jetstream_frame("not json").unwrap_err(),
            Error::Json(_)
        ));
    }
}
