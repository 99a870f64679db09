//! Scheduled content posting.
//!
//! Picks a random quote and a random image from the resource directories and
//! publishes them as one post. The publish is ledger-gated on a per-day key,
//! so an overlapping or replayed cron firing publishes at most once per day.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Local;
use rand::Rng;
use tracing::{info, warn};

use crate::{
    domain::{ActionKind, ImageAttachment, PostDraft, SubjectId},
    ledger::InteractionLedger,
    ports::SocialPort,
    retry::{self, Backoff, RetryPolicy},
    throttle::RateLimiter,
    Error, Result,
};

pub struct ContentPoster {
    session: Arc<dyn SocialPort>,
    ledger: Arc<InteractionLedger>,
    limiter: Arc<RateLimiter>,
    quotes_path: PathBuf,
    images_dir: PathBuf,
    policy: RetryPolicy,
}

impl ContentPoster {
    pub fn new(
        session: Arc<dyn SocialPort>,
        ledger: Arc<InteractionLedger>,
        limiter: Arc<RateLimiter>,
        quotes_path: PathBuf,
        images_dir: PathBuf,
    ) -> Self {
        Self {
            session,
            ledger,
            limiter,
            quotes_path,
            images_dir,
            policy: RetryPolicy::new(3, Duration::from_millis(1000), Backoff::Exponential),
        }
    }

    /// Publish today's post if it has not been published yet. Returns whether
    /// a post went out.
    ///
    /// "Today" is the local date, the same clock the cron schedule fires on.
    pub async fn post_daily(&self) -> Result<bool> {
        let key = SubjectId(format!("daily:{}", Local::now().format("%Y-%m-%d")));

        if self.ledger.exists(&key, ActionKind::Post)? {
            info!("daily post already published ({key})");
            return Ok(false);
        }

        let draft = self.build_draft().await?;

        // Commit before publishing, same policy as the reconciler. A crash
        // here skips today's post rather than double-posting it.
        if !self.ledger.insert(&key, ActionKind::Post)? {
            return Ok(false);
        }

        self.limiter.admit().await;

        let uri = retry::execute_observed(
            self.policy,
            || self.session.publish(&draft),
            |e, attempt| warn!("publish attempt {attempt} failed: {e}"),
        )
        .await?;

        info!("published daily post {uri}");
        Ok(true)
    }

    async fn build_draft(&self) -> Result<PostDraft> {
        let text = pick_quote(&self.quotes_path).await?;
        let image = match pick_image(&self.images_dir).await {
            Ok(img) => Some(img),
            Err(e) => {
                // A missing image library should not block the quote.
                warn!("no image for daily post: {e}");
                None
            }
        };
        Ok(PostDraft { text, image })
    }
}

async fn pick_quote(path: &Path) -> Result<String> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("quotes file {}: {e}", path.display())))?;

    let quotes: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if quotes.is_empty() {
        return Err(Error::Config(format!(
            "quotes file {} is empty",
            path.display()
        )));
    }

    let idx = rand::thread_rng().gen_range(0..quotes.len());
    Ok(format!("\"{}\"", quotes[idx]))
}

async fn pick_image(dir: &Path) -> Result<ImageAttachment> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    if files.is_empty() {
        return Err(Error::Config(format!(
            "images dir {} is empty",
            dir.display()
        )));
    }

    let idx = rand::thread_rng().gen_range(0..files.len());
    let path = &files[idx];
    let data = tokio::fs::read(path).await?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    Ok(ImageAttachment {
        data,
        mime: mime_for_ext(&ext).to_string(),
        alt: "wren".to_string(),
    })
}

fn mime_for_ext(ext: &str) -> &'static str {
    match ext {
        "webp" => "image/webp",
        "avif" => "image/avif",
        "png" => "image/png",
        _ => "image/jpeg",
    }
}
