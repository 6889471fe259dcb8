//! Record decoding.
//!
//! Turns a raw record payload into a typed [`DomainRecord`], dispatching on
//! the collection type. Collections outside the app's namespace decode to
//! [`DomainRecord::Unknown`] so that new record types never break ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::StreamEvent;
use crate::uri::{ResourceUri, StrongRef};

/// NSID namespace for every record type this app writes.
pub const NAMESPACE: &str = "social.arabica.alpha";

pub const BREW_COLLECTION: &str = "social.arabica.alpha.brew";
pub const BEAN_COLLECTION: &str = "social.arabica.alpha.bean";
pub const ROASTER_COLLECTION: &str = "social.arabica.alpha.roaster";
pub const GRINDER_COLLECTION: &str = "social.arabica.alpha.grinder";
pub const BREWER_COLLECTION: &str = "social.arabica.alpha.brewer";
pub const LIKE_COLLECTION: &str = "social.arabica.alpha.like";
pub const COMMENT_COLLECTION: &str = "social.arabica.alpha.comment";

/// Collections the indexer subscribes to and backfills.
pub const TRACKED_COLLECTIONS: [&str; 7] = [
    BREW_COLLECTION,
    BEAN_COLLECTION,
    ROASTER_COLLECTION,
    GRINDER_COLLECTION,
    BREWER_COLLECTION,
    LIKE_COLLECTION,
    COMMENT_COLLECTION,
];

const MAX_RATING: u8 = 10;

/// Discriminant of a decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Brew,
    Bean,
    Roaster,
    Grinder,
    Brewer,
    Like,
    Comment,
    Unknown,
}

impl RecordKind {
    /// Classify a collection type.
    pub fn from_collection(collection: &str) -> Self {
        match collection {
            BREW_COLLECTION => Self::Brew,
            BEAN_COLLECTION => Self::Bean,
            ROASTER_COLLECTION => Self::Roaster,
            GRINDER_COLLECTION => Self::Grinder,
            BREWER_COLLECTION => Self::Brewer,
            LIKE_COLLECTION => Self::Like,
            COMMENT_COLLECTION => Self::Comment,
            _ => Self::Unknown,
        }
    }

    /// The collection type for this kind, if it has one.
    pub fn collection(&self) -> Option<&'static str> {
        match self {
            Self::Brew => Some(BREW_COLLECTION),
            Self::Bean => Some(BEAN_COLLECTION),
            Self::Roaster => Some(ROASTER_COLLECTION),
            Self::Grinder => Some(GRINDER_COLLECTION),
            Self::Brewer => Some(BREWER_COLLECTION),
            Self::Like => Some(LIKE_COLLECTION),
            Self::Comment => Some(COMMENT_COLLECTION),
            Self::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brew => "brew",
            Self::Bean => "bean",
            Self::Roaster => "roaster",
            Self::Grinder => "grinder",
            Self::Brewer => "brewer",
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Unknown => "unknown",
        }
    }

    /// Coffee entities: the kinds that show up in feeds and can be liked.
    pub fn is_entity(&self) -> bool {
        matches!(
            self,
            Self::Brew | Self::Bean | Self::Roaster | Self::Grinder | Self::Brewer
        )
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "brew" => Ok(Self::Brew),
            "bean" => Ok(Self::Bean),
            "roaster" => Ok(Self::Roaster),
            "grinder" => Ok(Self::Grinder),
            "brewer" => Ok(Self::Brewer),
            "like" => Ok(Self::Like),
            "comment" => Ok(Self::Comment),
            other => Err(Error::InvalidField {
                field: "kind",
                reason: format!("unknown record kind '{other}'"),
            }),
        }
    }
}

/// A logged brew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Brew {
    #[serde(default)]
    pub bean_ref: Option<ResourceUri>,
    #[serde(default)]
    pub grinder_ref: Option<ResourceUri>,
    #[serde(default)]
    pub brewer_ref: Option<ResourceUri>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub grind_size: Option<String>,
    #[serde(default)]
    pub water_temp: Option<f64>,
    #[serde(default)]
    pub dose_grams: Option<f64>,
    #[serde(default)]
    pub yield_grams: Option<f64>,
    #[serde(default)]
    pub brew_time_seconds: Option<u32>,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub tasting_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bean {
    pub name: String,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub roast_level: Option<String>,
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub roaster_ref: Option<ResourceUri>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Roaster {
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grinder {
    pub name: String,
    #[serde(default)]
    pub grinder_type: Option<String>,
    #[serde(default)]
    pub burr_type: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Brewer {
    pub name: String,
    #[serde(default)]
    pub brewer_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeRecord {
    pub subject: StrongRef,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub subject: StrongRef,
    #[serde(default)]
    pub parent: Option<StrongRef>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A decoded record, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainRecord {
    Brew(Brew),
    Bean(Bean),
    Roaster(Roaster),
    Grinder(Grinder),
    Brewer(Brewer),
    Like(LikeRecord),
    Comment(CommentRecord),
    /// A collection this build does not understand.
    Unknown,
}

impl DomainRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Brew(_) => RecordKind::Brew,
            Self::Bean(_) => RecordKind::Bean,
            Self::Roaster(_) => RecordKind::Roaster,
            Self::Grinder(_) => RecordKind::Grinder,
            Self::Brewer(_) => RecordKind::Brewer,
            Self::Like(_) => RecordKind::Like,
            Self::Comment(_) => RecordKind::Comment,
            Self::Unknown => RecordKind::Unknown,
        }
    }

    /// Author-supplied creation time.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Brew(r) => Some(r.created_at),
            Self::Bean(r) => Some(r.created_at),
            Self::Roaster(r) => Some(r.created_at),
            Self::Grinder(r) => Some(r.created_at),
            Self::Brewer(r) => Some(r.created_at),
            Self::Like(r) => Some(r.created_at),
            Self::Comment(r) => Some(r.created_at),
            Self::Unknown => None,
        }
    }
}

/// Decode a payload for the given collection type.
///
/// # Errors
///
/// Returns an error if a required field is missing, a field has the wrong
/// type, or a value is out of range. Unknown collections are not an error.
pub fn decode(collection: &str, payload: &serde_json::Value) -> Result<DomainRecord> {
    let record = match RecordKind::from_collection(collection) {
        RecordKind::Brew => {
            let brew: Brew = from_payload(payload)?;
            if let Some(rating) = brew.rating
                && !(1..=MAX_RATING).contains(&rating)
            {
                return Err(Error::InvalidField {
                    field: "rating",
                    reason: format!("must be between 1 and {MAX_RATING}, got {rating}"),
                });
            }
            DomainRecord::Brew(brew)
        }
        RecordKind::Bean => {
            let bean: Bean = from_payload(payload)?;
            require_text("name", &bean.name)?;
            DomainRecord::Bean(bean)
        }
        RecordKind::Roaster => {
            let roaster: Roaster = from_payload(payload)?;
            require_text("name", &roaster.name)?;
            DomainRecord::Roaster(roaster)
        }
        RecordKind::Grinder => {
            let grinder: Grinder = from_payload(payload)?;
            require_text("name", &grinder.name)?;
            DomainRecord::Grinder(grinder)
        }
        RecordKind::Brewer => {
            let brewer: Brewer = from_payload(payload)?;
            require_text("name", &brewer.name)?;
            DomainRecord::Brewer(brewer)
        }
        RecordKind::Like => DomainRecord::Like(from_payload(payload)?),
        RecordKind::Comment => {
            let comment: CommentRecord = from_payload(payload)?;
            require_text("text", &comment.text)?;
            DomainRecord::Comment(comment)
        }
        RecordKind::Unknown => DomainRecord::Unknown,
    };
    Ok(record)
}

/// Decode the payload carried by a create/update event.
pub fn decode_event(event: &StreamEvent) -> Result<DomainRecord> {
    if RecordKind::from_collection(&event.collection) == RecordKind::Unknown {
        return Ok(DomainRecord::Unknown);
    }
    let payload = event
        .record
        .as_ref()
        .ok_or(Error::MissingField { field: "record" })?;
    decode(&event.collection, payload)
}

fn from_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T> {
    if !payload.is_object() {
        return Err(Error::InvalidField {
            field: "record",
            reason: "payload is not an object".to_string(),
        });
    }
    if payload.get("createdAt").is_none() {
        return Err(Error::MissingField { field: "createdAt" });
    }
    Ok(T::deserialize(payload)?)
}

fn require_text(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::MissingField { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TS: &str = "2025-01-15T08:30:00Z";

    #[test]
    fn test_decode_brew() {
        let payload = json!({
            "$type": BREW_COLLECTION,
            "beanRef": "at://did:plc:a/social.arabica.alpha.bean/b1",
            "method": "V60",
            "doseGrams": 15.0,
            "yieldGrams": 250.0,
            "rating": 8,
            "createdAt": TS,
        });
        let record = decode(BREW_COLLECTION, &payload).unwrap();
        assert_eq!(record.kind(), RecordKind::Brew);
        match record {
            DomainRecord::Brew(brew) => {
                assert_eq!(brew.method.as_deref(), Some("V60"));
                assert_eq!(brew.rating, Some(8));
                assert_eq!(brew.bean_ref.unwrap().rkey(), "b1");
            }
            other => panic!("expected brew, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_out_of_range_rating() {
        let payload = json!({"rating": 11, "createdAt": TS});
        let err = decode(BREW_COLLECTION, &payload).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "rating", .. }));
    }

    #[test]
    fn test_decode_requires_created_at() {
        let payload = json!({"name": "Ethiopia Guji"});
        let err = decode(BEAN_COLLECTION, &payload).unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "createdAt" }));
    }

    #[test]
    fn test_decode_rejects_blank_name() {
        let payload = json!({"name": "  ", "createdAt": TS});
        let err = decode(ROASTER_COLLECTION, &payload).unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "name" }));
    }

    #[test]
    fn test_decode_wrong_type_is_error() {
        let payload = json!({"name": 42, "createdAt": TS});
        assert!(matches!(
            decode(GRINDER_COLLECTION, &payload).unwrap_err(),
            Error::Json(_)
        ));
    }

    #[test]
    fn test_decode_like_and_comment() {
        let like = json!({
            "subject": {"uri": "at://did:plc:b/social.arabica.alpha.brew/x", "cid": "c"},
            "createdAt": TS,
        });
        assert_eq!(decode(LIKE_COLLECTION, &like).unwrap().kind(), RecordKind::Like);

        let comment = json!({
            "subject": {"uri": "at://did:plc:b/social.arabica.alpha.brew/x"},
            "parent": {"uri": "at://did:plc:c/social.arabica.alpha.comment/p"},
            "text": "nice extraction",
            "createdAt": TS,
        });
        match decode(COMMENT_COLLECTION, &comment).unwrap() {
            DomainRecord::Comment(c) => {
                assert_eq!(c.text, "nice extraction");
                assert_eq!(c.parent.unwrap().uri.owner(), "did:plc:c");
            }
            other => panic!("expected comment, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_comment_requires_text() {
        let comment = json!({
            "subject": {"uri": "at://did:plc:b/social.arabica.alpha.brew/x"},
            "text": "",
            "createdAt": TS,
        });
        assert!(decode(COMMENT_COLLECTION, &comment).is_err());
    }

    #[test]
    fn test_unknown_collection_is_not_an_error() {
        let record = decode("app.bsky.feed.post", &json!({"text": "hi"})).unwrap();
        assert_eq!(record, DomainRecord::Unknown);
        assert_eq!(record.created_at(), None);
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for collection in TRACKED_COLLECTIONS {
            let kind = RecordKind::from_collection(collection);
            assert_eq!(kind.collection(), Some(collection));
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert!("espresso".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_is_entity() {
        assert!(RecordKind::Brew.is_entity());
        assert!(RecordKind::Brewer.is_entity());
        assert!(!RecordKind::Like.is_entity());
        assert!(!RecordKind::Comment.is_entity());
        assert!(!RecordKind::Unknown.is_entity());
    }
}
