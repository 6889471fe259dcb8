//! Resource identifiers.
//!
//! Every record in the network is addressed as `at://{did}/{collection}/{rkey}`.
//! The authority segment is the owning author's identity, which is what
//! ownership checks (self-notification, self-report) compare against.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SCHEME: &str = "at://";

/// A parsed `at://` resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceUri {
    did: String,
    collection: String,
    rkey: String,
}

impl ResourceUri {
    /// Build an identifier from its parts.
    pub fn new(
        did: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Parse an identifier of the form `at://did/collection/rkey`.
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input.strip_prefix(SCHEME).ok_or_else(|| Error::InvalidUri {
            uri: input.to_string(),
            reason: "missing at:// scheme",
        })?;

        let mut parts = rest.splitn(3, '/');
        let did = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();
        Self::from_parts(did, collection, rkey).map_err(|e| match e {
            Error::InvalidUri { reason, .. } => Error::InvalidUri {
                uri: input.to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Build an identifier from parts that must each be a single
    /// non-empty path segment, with a did as authority.
    pub fn from_parts(did: &str, collection: &str, rkey: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidUri {
            uri: format!("{SCHEME}{did}/{collection}/{rkey}"),
            reason,
        };

        if did.is_empty() || collection.is_empty() || rkey.is_empty() {
            return Err(invalid("expected did, collection and record key"));
        }
        if [did, collection, rkey].iter().any(|part| part.contains('/')) {
            return Err(invalid("too many path segments"));
        }
        if !did.starts_with("did:") {
            return Err(invalid("authority is not a did"));
        }

        Ok(Self::new(did, collection, rkey))
    }

    /// The owning author's identity.
    pub fn owner(&self) -> &str {
        &self.did
    }

    /// The collection (record type) segment.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The record key segment.
    pub fn rkey(&self) -> &str {
        &self.rkey
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}/{}", SCHEME, self.did, self.collection, self.rkey)
    }
}

impl FromStr for ResourceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ResourceUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A pinned reference to a specific version of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: ResourceUri,
    #[serde(default)]
    pub cid: Option<String>,
}
