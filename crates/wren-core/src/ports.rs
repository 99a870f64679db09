use async_trait::async_trait;

use crate::{
    domain::{ActorId, FeedItem, PostDraft, SubjectId},
    Result,
};

/// Hexagonal port for the remote social service.
///
/// Bluesky is the first implementation; the reconciler and poster depend only
/// on this trait so tests run against an in-memory fake. Transport concerns
/// (auth refresh, wire format, pagination) stay inside the adapter.
#[async_trait]
pub trait SocialPort: Send + Sync {
    /// Candidate items from a feed generator, in the order the service
    /// returns them. Callers act in that order.
    async fn fetch_feed(&self, feed_uri: &str, limit: u32) -> Result<Vec<FeedItem>>;

    async fn list_followers(&self) -> Result<Vec<ActorId>>;
    async fn list_follows(&self) -> Result<Vec<ActorId>>;

    async fn like(&self, subject: &SubjectId, cid: &str) -> Result<()>;
    async fn follow(&self, actor: &ActorId) -> Result<()>;

    /// Publish a post; returns the subject id the service assigned it.
    async fn publish(&self, draft: &PostDraft) -> Result<SubjectId>;
}
