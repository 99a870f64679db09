/// Opaque, stable identifier of the remote object an action targets
/// (an AT-URI for posts, a DID for accounts).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubjectId(pub String);

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Remote account identifier (DID).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActorId(pub String);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Category of outbound write recorded in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Like,
    Comment,
    Follow,
    Post,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Like => "like",
            ActionKind::Comment => "comment",
            ActionKind::Follow => "follow",
            ActionKind::Post => "post",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Author {
    pub did: ActorId,
    pub handle: String,
    pub display_name: String,
}

/// One candidate item from a feed fetch. The `cid` is the content hash the
/// remote service wants echoed back in like records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedItem {
    pub subject: SubjectId,
    pub cid: String,
    pub text: String,
    pub author: Author,
}

#[derive(Clone, Debug)]
pub struct ImageAttachment {
    pub data: Vec<u8>,
    pub mime: String,
    pub alt: String,
}

/// Outgoing post content, before the adapter turns it into a record.
#[derive(Clone, Debug)]
pub struct PostDraft {
    pub text: String,
    pub image: Option<ImageAttachment>,
}

/// Inbound social event delivered by the adapter's polling loop.
///
/// Handlers must stay idempotent: the same mention or follow may be delivered
/// more than once across polls and restarts.
#[derive(Clone, Debug)]
pub enum SocialEvent {
    Mention(FeedItem),
    Follow(Author),
}
