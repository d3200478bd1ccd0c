/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use keyhole_protocol::AtUri;
use serde::Deserialize;
use serde_json::Value;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The record collections this instance knows how to index. Anything else on
/// the stream is unsupported and either rejected (live path) or dropped
/// (backfill path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Post,
    Like,
    Repost,
    Follow,
    Profile,
    Generator,
    Subscription,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Post,
        Collection::Like,
        Collection::Repost,
        Collection::Follow,
        Collection::Profile,
        Collection::Generator,
        Collection::Subscription,
    ];

    pub fn from_nsid(nsid: &str) -> Option<Self> {
        match nsid {
            "app.bsky.feed.post" => Some(Self::Post),
            "app.bsky.feed.like" => Some(Self::Like),
            "app.bsky.feed.repost" => Some(Self::Repost),
            "app.bsky.graph.follow" => Some(Self::Follow),
            "app.bsky.actor.profile" => Some(Self::Profile),
            "app.bsky.feed.generator" => Some(Self::Generator),
            "social.keyhole.subscription" => Some(Self::Subscription),
            _ => None,
        }
    }

    pub fn nsid(&self) -> &'static str {
        match self {
            Self::Post => "app.bsky.feed.post",
            Self::Like => "app.bsky.feed.like",
            Self::Repost => "app.bsky.feed.repost",
            Self::Follow => "app.bsky.graph.follow",
            Self::Profile => "app.bsky.actor.profile",
            Self::Generator => "app.bsky.feed.generator",
            Self::Subscription => "social.keyhole.subscription",
        }
    }
}

/// One signed commit's record, as the engine sees it. Identity for dedup is
/// `uri`; `cid` changes when the record is edited.
#[derive(Debug, Clone)]
pub struct Record {
    pub uri: String,
    pub cid: String,
    pub collection: Collection,
    pub did: String,
    pub json: Value,
    pub indexed_at_ms: i64,
}

impl Record {
    /// Builds a record from commit parts. Fails on a malformed URI or an
    /// unsupported collection; the live router treats the latter as fatal for
    /// the commit.
    pub fn from_parts(uri: &str, cid: &str, json: Value) -> Result<Self> {
        let at = AtUri::parse(uri).with_context(|| format!("malformed at-uri: {uri}"))?;
        let collection = Collection::from_nsid(&at.collection)
            .with_context(|| format!("unsupported collection: {}", at.collection))?;
        Ok(Self {
            uri: uri.to_string(),
            cid: cid.to_string(),
            collection,
            did: at.did,
            json,
            indexed_at_ms: now_ms(),
        })
    }

    /// Storage cannot hold NUL bytes; such records are skipped outright.
    pub fn has_nul_byte(&self) -> bool {
        self.uri.contains('\0') || self.cid.contains('\0') || json_contains_nul(&self.json)
    }

    pub fn post(&self) -> Result<PostView> {
        self.parse_view("post")
    }

    pub fn like(&self) -> Result<LikeView> {
        self.parse_view("like")
    }

    pub fn repost(&self) -> Result<RepostView> {
        self.parse_view("repost")
    }

    pub fn follow(&self) -> Result<FollowView> {
        self.parse_view("follow")
    }

    pub fn profile(&self) -> Result<ProfileView> {
        self.parse_view("profile")
    }

    pub fn generator(&self) -> Result<GeneratorView> {
        self.parse_view("generator")
    }

    pub fn subscription(&self) -> Result<SubscriptionView> {
        self.parse_view("subscription")
    }

    fn parse_view<T: serde::de::DeserializeOwned>(&self, what: &str) -> Result<T> {
        serde_json::from_value(self.json.clone())
            .with_context(|| format!("malformed {what} record: {}", self.uri))
    }

    /// Validates that the body parses into its collection's typed view.
    /// Run before any write so malformed records are skipped, not stored.
    pub fn check_parses(&self) -> Result<()> {
        match self.collection {
            Collection::Post => self.post().map(|_| ()),
            Collection::Like => self.like().map(|_| ()),
            Collection::Repost => self.repost().map(|_| ()),
            Collection::Follow => self.follow().map(|_| ()),
            Collection::Profile => self.profile().map(|_| ()),
            Collection::Generator => self.generator().map(|_| ()),
            Collection::Subscription => self.subscription().map(|_| ()),
        }
    }
}

fn json_contains_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(json_contains_nul),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| k.contains('\0') || json_contains_nul(v)),
        _ => false,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostView {
    #[serde(default)]
    pub text: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub embed: Option<Value>,
}

impl PostView {
    /// URI of the quoted post, if the embed is a record (or record-with-media)
    /// embed.
    pub fn quote_uri(&self) -> Option<String> {
        let embed = self.embed.as_ref()?;
        let ty = embed.get("$type").and_then(|v| v.as_str()).unwrap_or("");
        let record = match ty {
            "app.bsky.embed.record" => embed.get("record")?,
            "app.bsky.embed.recordWithMedia" => embed.get("record")?.get("record")?,
            _ => return None,
        };
        record
            .get("uri")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LikeView {
    pub subject: StrongRef,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepostView {
    pub subject: StrongRef,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowView {
    /// DID of the followed actor.
    pub subject: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileView {
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorView {
    /// DID of the feed generator service.
    pub did: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionView {
    /// Identifier of the instance this subscription targets.
    pub instance: String,
    #[serde(rename = "inviteCode")]
    pub invite_code: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_parts_resolves_collection_and_did() {
        let rec = Record::from_parts(
            "at://did:plc:alice/app.bsky.feed.post/3k1",
            "bafyrei1",
            json!({"text": "hello", "createdAt": "2026-01-01T00:00:00Z"}),
        )
        .unwrap();
        assert_eq!(rec.collection, Collection::Post);
        assert_eq!(rec.did, "did:plc:alice");
        assert_eq!(rec.post().unwrap().text, "hello");
    }

    #[test]
    fn from_parts_rejects_unsupported_collection() {
        let err = Record::from_parts(
            "at://did:plc:alice/app.bsky.graph.block/3k1",
            "bafyrei1",
            json!({}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unsupported collection"));
    }

    #[test]
    fn nul_byte_detection_covers_nested_values() {
        let clean = Record::from_parts(
            "at://did:plc:alice/app.bsky.feed.post/1",
            "cid",
            json!({"text": "fine"}),
        )
        .unwrap();
        assert!(!clean.has_nul_byte());

        let dirty = Record::from_parts(
            "at://did:plc:alice/app.bsky.feed.post/2",
            "cid",
            json!({"text": "bad", "embed": {"alt": "x\u{0000}y"}}),
        )
        .unwrap();
        assert!(dirty.has_nul_byte());
    }

    #[test]
    fn quote_uri_from_record_embed() {
        let rec = Record::from_parts(
            "at://did:plc:alice/app.bsky.feed.post/3",
            "cid",
            json!({
                "text": "look at this",
                "embed": {
                    "$type": "app.bsky.embed.record",
                    "record": {"uri": "at://did:plc:bob/app.bsky.feed.post/9", "cid": "c9"}
                }
            }),
        )
        .unwrap();
        assert_eq!(
            rec.post().unwrap().quote_uri().as_deref(),
            Some("at://did:plc:bob/app.bsky.feed.post/9")
        );
    }

    #[test]
    fn check_parses_flags_malformed_like() {
        let rec = Record::from_parts(
            "at://did:plc:alice/app.bsky.feed.like/1",
            "cid",
            json!({"createdAt": "2026-01-01T00:00:00Z"}),
        )
        .unwrap();
        let err = rec.check_parses().unwrap_err();
        assert!(err.to_string().contains(rec.uri.as_str()));
    }

    #[test]
    fn collection_nsid_round_trip() {
        for c in Collection::ALL {
            assert_eq!(Collection::from_nsid(c.nsid()), Some(c));
        }
        assert_eq!(Collection::from_nsid("app.bsky.graph.block"), None);
    }
}
