//! Mention/feed reconciliation.
//!
//! One pass: fetch candidates, skip everything the ledger already holds, then
//! for each unseen item commit the ledger entry first, wait for a rate-limit
//! slot, and perform the remote action under a small retry ceiling.
//!
//! The commit-before-act order is deliberate: a crash between commit and call
//! costs one skipped action; the opposite order risks a duplicate remote
//! write, and the remote service's own idempotence is not something we count
//! on. The same `engage` primitive backs the batch passes and the event
//! handlers so the two paths cannot drift apart.

use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    domain::{ActionKind, ActorId, SocialEvent, SubjectId},
    ledger::InteractionLedger,
    ports::SocialPort,
    retry::{self, Backoff, RetryPolicy},
    throttle::RateLimiter,
    Result,
};

/// Outcome of one candidate within a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engagement {
    /// Ledger already held the pair (or a concurrent writer won the insert).
    Skipped,
    /// Remote action performed and committed.
    Acted,
    /// Committed, but the remote action failed after retries. Not re-run on
    /// the next pass; that is the pessimistic trade-off.
    Failed,
}

/// Outcome of one fetch-filter-act pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub fetched: usize,
    pub skipped: usize,
    pub acted: usize,
    pub failed: usize,
}

impl PassReport {
    fn tally(&mut self, engagement: Engagement) {
        match engagement {
            Engagement::Skipped => self.skipped += 1,
            Engagement::Acted => self.acted += 1,
            Engagement::Failed => self.failed += 1,
        }
    }
}

pub struct Reconciler {
    session: Arc<dyn SocialPort>,
    ledger: Arc<InteractionLedger>,
    limiter: Arc<RateLimiter>,
    fetch_policy: RetryPolicy,
    action_policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        session: Arc<dyn SocialPort>,
        ledger: Arc<InteractionLedger>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            session,
            ledger,
            limiter,
            fetch_policy: RetryPolicy::new(3, Duration::from_millis(1000), Backoff::Exponential),
            // Likes and follow-backs are non-critical; two attempts is enough.
            action_policy: RetryPolicy::new(2, Duration::from_millis(1000), Backoff::Exponential),
        }
    }

    pub fn with_policies(mut self, fetch: RetryPolicy, action: RetryPolicy) -> Self {
        self.fetch_policy = fetch;
        self.action_policy = action;
        self
    }

    /// Like every unseen item in the configured feed, in fetch order.
    ///
    /// Fetch failure aborts the pass and propagates to the job wrapper. A
    /// single item's remote failure never does; it is logged, counted and the
    /// pass moves on.
    pub async fn like_pass(&self, feed_uri: &str, limit: u32) -> Result<PassReport> {
        let items = retry::execute_observed(
            self.fetch_policy,
            || self.session.fetch_feed(feed_uri, limit),
            |e, attempt| warn!("feed fetch attempt {attempt} failed: {e}"),
        )
        .await?;

        let mut report = PassReport {
            fetched: items.len(),
            ..Default::default()
        };

        for item in &items {
            let engagement = self
                .engage(&item.subject, ActionKind::Like, || {
                    self.session.like(&item.subject, &item.cid)
                })
                .await?;
            report.tally(engagement);
        }

        info!(
            "like pass done: {} fetched, {} skipped, {} acted, {} failed",
            report.fetched, report.skipped, report.acted, report.failed
        );
        Ok(report)
    }

    /// Follow back every follower we do not already follow.
    pub async fn follow_back_pass(&self) -> Result<PassReport> {
        let followers = retry::execute_observed(
            self.fetch_policy,
            || self.session.list_followers(),
            |e, attempt| warn!("followers fetch attempt {attempt} failed: {e}"),
        )
        .await?;
        let follows = retry::execute_observed(
            self.fetch_policy,
            || self.session.list_follows(),
            |e, attempt| warn!("follows fetch attempt {attempt} failed: {e}"),
        )
        .await?;

        let known: HashSet<&ActorId> = follows.iter().collect();
        let mut report = PassReport {
            fetched: followers.len(),
            ..Default::default()
        };

        for actor in &followers {
            if known.contains(actor) {
                report.skipped += 1;
                continue;
            }
            let subject = SubjectId(actor.0.clone());
            let engagement = self
                .engage(&subject, ActionKind::Follow, || self.session.follow(actor))
                .await?;
            report.tally(engagement);
        }

        info!(
            "follow-back pass done: {} followers, {} skipped, {} followed, {} failed",
            report.fetched, report.skipped, report.acted, report.failed
        );
        Ok(report)
    }

    /// Handler for events delivered by the adapter's polling loop. Reuses the
    /// same record-then-act primitive as the batch passes, so a mention that
    /// also shows up in the feed is still acted on at most once.
    pub async fn handle_event(&self, event: &SocialEvent) -> Result<Engagement> {
        match event {
            SocialEvent::Mention(item) => {
                self.engage(&item.subject, ActionKind::Like, || {
                    self.session.like(&item.subject, &item.cid)
                })
                .await
            }
            SocialEvent::Follow(author) => {
                let subject = SubjectId(author.did.0.clone());
                self.engage(&subject, ActionKind::Follow, || {
                    self.session.follow(&author.did)
                })
                .await
            }
        }
    }

    /// Record-then-act: ledger lookup, pessimistic commit, rate-limit
    /// admission, remote call under retry. Ledger errors propagate (storage
    /// down means the pass cannot make idempotence promises); remote errors
    /// are contained here.
    async fn engage<F, Fut>(
        &self,
        subject: &SubjectId,
        kind: ActionKind,
        act: F,
    ) -> Result<Engagement>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.ledger.exists(subject, kind)? {
            return Ok(Engagement::Skipped);
        }

        if !self.ledger.insert(subject, kind)? {
            // Lost the insert race to a concurrent pass or process.
            return Ok(Engagement::Skipped);
        }

        self.limiter.admit().await;

        let res = retry::execute_observed(self.action_policy, act, |e, attempt| {
            warn!("{kind} {subject}: attempt {attempt} failed: {e}")
        })
        .await;

        match res {
            Ok(()) => {
                info!("{kind} {subject}");
                Ok(Engagement::Acted)
            }
            Err(e) => {
                warn!("{kind} {subject}: giving up: {e}");
                Ok(Engagement::Failed)
            }
        }
    }
}
