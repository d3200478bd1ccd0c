/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// One create/update/delete operation on a single record URI, as decoded
/// from the origin commit stream by the ingest transport.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommitOp {
    Create,
    Update,
    Delete,
}

/// A decoded commit handed to the indexing engine. `record` is present for
/// create/update and absent for delete.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommitEvent {
    pub op: CommitOp,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// Parsed `at://<authority>/<collection>/<rkey>` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("at://")?;
        let mut parts = rest.splitn(3, '/');
        let did = parts.next()?.trim();
        let collection = parts.next()?.trim();
        let rkey = parts.next()?.trim();
        if did.is_empty() || collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
            return None;
        }
        Some(Self {
            did: did.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }

    pub fn to_uri(&self) -> String {
        format!("at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let uri = "at://did:plc:abc123/app.bsky.feed.post/3kxyz";
        let parsed = AtUri::parse(uri).unwrap();
        assert_eq!(parsed.did, "did:plc:abc123");
        assert_eq!(parsed.collection, "app.bsky.feed.post");
        assert_eq!(parsed.rkey, "3kxyz");
        assert_eq!(parsed.to_uri(), uri);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(AtUri::parse("https://example.com/x/y").is_none());
        assert!(AtUri::parse("at://did:plc:abc123").is_none());
        assert!(AtUri::parse("at://did:plc:abc123/app.bsky.feed.post").is_none());
        assert!(AtUri::parse("at://did:plc:abc/coll/rkey/extra").is_none());
        assert!(AtUri::parse("at:///app.bsky.feed.post/rkey").is_none());
    }

    #[test]
    fn commit_event_delete_has_no_record() {
        let json = r#"{"op":"delete","uri":"at://did:plc:abc/app.bsky.feed.post/1"}"#;
        let evt: CommitEvent = serde_json::from_str(json).unwrap();
        assert_eq!(evt.op, CommitOp::Delete);
        assert!(evt.record.is_none());
    }
}
