//! Bluesky adapter (XRPC over HTTP).
//!
//! Implements `wren-core`'s `SocialPort` against an ATProto-style service and
//! runs the notification polling loop that feeds mention/follow events to the
//! core. Wire format and auth live here; the core never sees either.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use wren_core::{
    domain::{ActorId, Author, FeedItem, PostDraft, SocialEvent, SubjectId},
    errors::Error,
    Result,
};

#[derive(Clone, Debug)]
pub struct Credentials {
    pub identifier: String,
    pub password: String,
}

pub struct BskyClient {
    http: reqwest::Client,
    base: String,
    did: String,
    access_jwt: String,
}

impl BskyClient {
    /// Create a session against the service. Auth failure here is fatal; the
    /// binary does not start without a session.
    pub async fn login(base: &str, creds: &Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Remote(format!("http client build: {e}")))?;

        let base = base.trim_end_matches('/').to_string();
        let resp = http
            .post(format!("{base}/xrpc/com.atproto.server.createSession"))
            .json(&json!({
                "identifier": creds.identifier,
                "password": creds.password,
            }))
            .send()
            .await
            .map_err(|e| Error::Auth(format!("createSession request: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Auth(format!(
                "createSession failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("createSession response: {e}")))?;

        let did = str_field(&v, "did")
            .ok_or_else(|| Error::Auth("createSession response missing did".to_string()))?;
        let access_jwt = str_field(&v, "accessJwt")
            .ok_or_else(|| Error::Auth("createSession response missing accessJwt".to_string()))?;

        Ok(Self {
            http,
            base,
            did,
            access_jwt,
        })
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    fn map_err(e: reqwest::Error) -> Error {
        Error::Remote(format!("bsky request error: {e}"))
    }

    async fn xrpc_get(&self, nsid: &str, query: &[(&str, String)]) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/xrpc/{nsid}", self.base))
            .query(query)
            .bearer_auth(&self.access_jwt)
            .send()
            .await
            .map_err(Self::map_err)?;
        Self::read_json(nsid, resp).await
    }

    async fn xrpc_post(&self, nsid: &str, body: Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/xrpc/{nsid}", self.base))
            .bearer_auth(&self.access_jwt)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_err)?;
        Self::read_json(nsid, resp).await
    }

    async fn read_json(nsid: &str, resp: reqwest::Response) -> Result<Value> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Remote(format!(
                "{nsid} failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        resp.json().await.map_err(Self::map_err)
    }

    async fn create_record(&self, collection: &str, record: Value) -> Result<SubjectId> {
        let v = self
            .xrpc_post(
                "com.atproto.repo.createRecord",
                json!({
                    "repo": self.did,
                    "collection": collection,
                    "record": record,
                }),
            )
            .await?;
        let uri = str_field(&v, "uri")
            .ok_or_else(|| Error::Remote("createRecord response missing uri".to_string()))?;
        Ok(SubjectId(uri))
    }

    async fn upload_blob(&self, data: &[u8], mime: &str) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/xrpc/com.atproto.repo.uploadBlob", self.base))
            .bearer_auth(&self.access_jwt)
            .header("content-type", mime)
            .body(data.to_vec())
            .send()
            .await
            .map_err(Self::map_err)?;
        let v = Self::read_json("com.atproto.repo.uploadBlob", resp).await?;
        v.get("blob")
            .cloned()
            .ok_or_else(|| Error::Remote("uploadBlob response missing blob".to_string()))
    }

    /// Poll notifications and deliver mention/follow events until cancelled.
    ///
    /// Redelivery is fine: the core's handlers are ledger-gated, so a
    /// notification seen twice across polls or restarts acts at most once.
    pub async fn poll_notifications(
        &self,
        interval: Duration,
        tx: mpsc::Sender<SocialEvent>,
        cancel: CancellationToken,
    ) {
        let mut last_seen: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let page = match self
                .xrpc_get(
                    "app.bsky.notification.listNotifications",
                    &[("limit", "50".to_string())],
                )
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!("notification poll failed: {e}");
                    continue;
                }
            };

            let (events, newest) = parse_notifications(&page, last_seen.as_deref());
            if let Some(newest) = newest {
                last_seen = Some(newest);
            }

            for event in events {
                if tx.send(event).await.is_err() {
                    debug!("event consumer gone, stopping notification poll");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl wren_core::ports::SocialPort for BskyClient {
    async fn fetch_feed(&self, feed_uri: &str, limit: u32) -> Result<Vec<FeedItem>> {
        let v = self
            .xrpc_get(
                "app.bsky.feed.getFeed",
                &[
                    ("feed", feed_uri.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(parse_feed(&v))
    }

    async fn list_followers(&self) -> Result<Vec<ActorId>> {
        let v = self
            .xrpc_get(
                "app.bsky.graph.getFollowers",
                &[
                    ("actor", self.did.clone()),
                    ("limit", "100".to_string()),
                ],
            )
            .await?;
        Ok(parse_actor_dids(&v, "followers"))
    }

    async fn list_follows(&self) -> Result<Vec<ActorId>> {
        let v = self
            .xrpc_get(
                "app.bsky.graph.getFollows",
                &[
                    ("actor", self.did.clone()),
                    ("limit", "100".to_string()),
                ],
            )
            .await?;
        Ok(parse_actor_dids(&v, "follows"))
    }

    async fn like(&self, subject: &SubjectId, cid: &str) -> Result<()> {
        self.create_record(
            "app.bsky.feed.like",
            json!({
                "$type": "app.bsky.feed.like",
                "subject": { "uri": subject.0, "cid": cid },
                "createdAt": Utc::now().to_rfc3339(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn follow(&self, actor: &ActorId) -> Result<()> {
        self.create_record(
            "app.bsky.graph.follow",
            json!({
                "$type": "app.bsky.graph.follow",
                "subject": actor.0,
                "createdAt": Utc::now().to_rfc3339(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn publish(&self, draft: &PostDraft) -> Result<SubjectId> {
        let mut record = json!({
            "$type": "app.bsky.feed.post",
            "text": draft.text,
            "createdAt": Utc::now().to_rfc3339(),
        });

        if let Some(image) = &draft.image {
            let blob = self.upload_blob(&image.data, &image.mime).await?;
            record["embed"] = json!({
                "$type": "app.bsky.embed.images",
                "images": [{ "image": blob, "alt": image.alt }],
            });
        }

        self.create_record("app.bsky.feed.post", record).await
    }
}

// === Response parsing ===

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|s| s.as_str()).map(str::to_string)
}

fn parse_author(v: &Value) -> Option<Author> {
    Some(Author {
        did: ActorId(str_field(v, "did")?),
        handle: str_field(v, "handle").unwrap_or_default(),
        display_name: str_field(v, "displayName").unwrap_or_default(),
    })
}

fn parse_feed(v: &Value) -> Vec<FeedItem> {
    let Some(entries) = v.get("feed").and_then(|f| f.as_array()) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let post = entry.get("post")?;
            Some(FeedItem {
                subject: SubjectId(str_field(post, "uri")?),
                cid: str_field(post, "cid")?,
                text: post
                    .get("record")
                    .and_then(|r| r.get("text"))
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                author: parse_author(post.get("author")?)?,
            })
        })
        .collect()
}

fn parse_actor_dids(v: &Value, key: &str) -> Vec<ActorId> {
    let Some(actors) = v.get(key).and_then(|a| a.as_array()) else {
        return Vec::new();
    };
    actors
        .iter()
        .filter_map(|a| str_field(a, "did").map(ActorId))
        .collect()
}

/// Convert a `listNotifications` page into events, skipping everything at or
/// before `last_seen` (by `indexedAt`). Returns the newest `indexedAt` seen.
fn parse_notifications(v: &Value, last_seen: Option<&str>) -> (Vec<SocialEvent>, Option<String>) {
    let Some(entries) = v.get("notifications").and_then(|n| n.as_array()) else {
        return (Vec::new(), None);
    };

    let mut events = Vec::new();
    let mut newest: Option<String> = None;

    for entry in entries {
        let Some(indexed_at) = str_field(entry, "indexedAt") else {
            continue;
        };
        // RFC 3339 timestamps order lexicographically.
        if newest.as_deref().map(|n| indexed_at.as_str() > n).unwrap_or(true) {
            newest = Some(indexed_at.clone());
        }
        if last_seen.map(|seen| indexed_at.as_str() <= seen).unwrap_or(false) {
            continue;
        }

        let Some(author) = entry.get("author").and_then(parse_author) else {
            continue;
        };

        match entry.get("reason").and_then(|r| r.as_str()) {
            Some("mention") | Some("reply") => {
                let (Some(uri), Some(cid)) = (str_field(entry, "uri"), str_field(entry, "cid"))
                else {
                    continue;
                };
                events.push(SocialEvent::Mention(FeedItem {
                    subject: SubjectId(uri),
                    cid,
                    text: entry
                        .get("record")
                        .and_then(|r| r.get("text"))
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    author,
                }));
            }
            Some("follow") => events.push(SocialEvent::Follow(author)),
            _ => {}
        }
    }

    (events, newest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_page_parses_into_items_in_order() {
        let page = json!({
            "feed": [
                { "post": {
                    "uri": "at://did:plc:a/app.bsky.feed.post/1",
                    "cid": "cid1",
                    "record": { "text": "hello" },
                    "author": { "did": "did:plc:a", "handle": "a.test", "displayName": "A" }
                }},
                { "post": {
                    "uri": "at://did:plc:b/app.bsky.feed.post/2",
                    "cid": "cid2",
                    "record": { "text": "world" },
                    "author": { "did": "did:plc:b", "handle": "b.test" }
                }}
            ]
        });

        let items = parse_feed(&page);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].subject.0, "at://did:plc:a/app.bsky.feed.post/1");
        assert_eq!(items[0].text, "hello");
        assert_eq!(items[1].author.did.0, "did:plc:b");
        assert_eq!(items[1].author.display_name, "");
    }

    #[test]
    fn malformed_feed_entries_are_dropped_not_fatal() {
        let page = json!({
            "feed": [
                { "post": { "uri": "at://ok", "cid": "c",
                            "author": { "did": "did:plc:a" } } },
                { "post": { "cid": "missing-uri" } },
                { "notAPost": true }
            ]
        });
        let items = parse_feed(&page);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].subject.0, "at://ok");
    }

    #[test]
    fn follower_page_parses_dids() {
        let page = json!({
            "followers": [
                { "did": "did:plc:x", "handle": "x.test" },
                { "did": "did:plc:y" }
            ]
        });
        let dids = parse_actor_dids(&page, "followers");
        assert_eq!(
            dids,
            vec![ActorId("did:plc:x".to_string()), ActorId("did:plc:y".to_string())]
        );
    }

    #[test]
    fn notifications_become_mention_and_follow_events() {
        let page = json!({
            "notifications": [
                {
                    "reason": "mention",
                    "uri": "at://did:plc:a/app.bsky.feed.post/7",
                    "cid": "cid7",
                    "indexedAt": "2026-08-25T10:00:00Z",
                    "record": { "text": "@wren hi" },
                    "author": { "did": "did:plc:a", "handle": "a.test" }
                },
                {
                    "reason": "follow",
                    "indexedAt": "2026-08-25T10:01:00Z",
                    "author": { "did": "did:plc:b", "handle": "b.test" }
                },
                {
                    "reason": "repost",
                    "indexedAt": "2026-08-25T10:02:00Z",
                    "author": { "did": "did:plc:c" }
                }
            ]
        });

        let (events, newest) = parse_notifications(&page, None);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SocialEvent::Mention(item) if item.cid == "cid7"));
        assert!(matches!(&events[1], SocialEvent::Follow(a) if a.did.0 == "did:plc:b"));
        assert_eq!(newest.as_deref(), Some("2026-08-25T10:02:00Z"));
    }

    #[test]
    fn notifications_at_or_before_the_cursor_are_skipped() {
        let page = json!({
            "notifications": [
                {
                    "reason": "follow",
                    "indexedAt": "2026-08-25T10:00:00Z",
                    "author": { "did": "did:plc:old" }
                },
                {
                    "reason": "follow",
                    "indexedAt": "2026-08-25T10:05:00Z",
                    "author": { "did": "did:plc:new" }
                }
            ]
        });

        let (events, newest) = parse_notifications(&page, Some("2026-08-25T10:00:00Z"));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SocialEvent::Follow(a) if a.did.0 == "did:plc:new"));
        assert_eq!(newest.as_deref(), Some("2026-08-25T10:05:00Z"));
    }
}
