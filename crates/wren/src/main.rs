use std::{sync::Arc, time::Instant};

use tokio::sync::mpsc;
use tracing::{error, info};

use wren_bsky::{BskyClient, Credentials};
use wren_core::{
    config::Config,
    health::{self, HealthState},
    ledger::InteractionLedger,
    ports::SocialPort,
    poster::ContentPoster,
    reconciler::Reconciler,
    retry::{Backoff, RetryPolicy},
    scheduler::{JobFuture, JobRunner},
    shutdown::Shutdown,
    throttle::RateLimiter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wren_core::logging::init("wren")?;

    let cfg = Arc::new(Config::load()?);

    // The storage handle is built once here and injected everywhere that
    // needs it; nothing reconstructs it ad hoc.
    let ledger = Arc::new(InteractionLedger::open(&cfg.db_file)?);

    // Login failure is fatal: no useful work without a session.
    let client = Arc::new(
        BskyClient::login(
            &cfg.service_url,
            &Credentials {
                identifier: cfg.identifier.clone(),
                password: cfg.password.clone(),
            },
        )
        .await?,
    );
    info!("logged in as {} ({})", cfg.identifier, client.did());

    let session: Arc<dyn SocialPort> = client.clone();
    let limiter = Arc::new(RateLimiter::new(
        cfg.rate_limit_requests,
        cfg.rate_limit_window,
    ));
    let retry_policy = RetryPolicy::new(
        cfg.retry_max_attempts,
        cfg.retry_base_delay,
        Backoff::Exponential,
    );
    let reconciler = Arc::new(
        Reconciler::new(session.clone(), ledger.clone(), limiter.clone())
            .with_policies(retry_policy, retry_policy),
    );
    let poster = Arc::new(ContentPoster::new(
        session,
        ledger.clone(),
        limiter,
        cfg.quotes_path.clone(),
        cfg.images_dir.clone(),
    ));

    let mut shutdown = Shutdown::new();
    let runner = JobRunner::new(shutdown.token());

    {
        let rec = reconciler.clone();
        let feed = cfg.feed_uri.clone();
        let limit = cfg.feed_fetch_limit;
        runner
            .add_job(
                "like-mentions",
                &cfg.like_cron,
                Arc::new(move || -> JobFuture {
                    let rec = rec.clone();
                    let feed = feed.clone();
                    Box::pin(async move { rec.like_pass(&feed, limit).await.map(|_| ()) })
                }),
            )
            .await?;
    }

    {
        let rec = reconciler.clone();
        runner
            .add_job(
                "follow-back",
                &cfg.follow_cron,
                Arc::new(move || -> JobFuture {
                    let rec = rec.clone();
                    Box::pin(async move { rec.follow_back_pass().await.map(|_| ()) })
                }),
            )
            .await?;
    }

    {
        let poster = poster.clone();
        runner
            .add_job(
                "daily-post",
                &cfg.post_cron,
                Arc::new(move || -> JobFuture {
                    let poster = poster.clone();
                    Box::pin(async move { poster.post_daily().await.map(|_| ()) })
                }),
            )
            .await?;
    }

    // Notification events (mentions, follows) flow through the same
    // ledger-gated reconciler as the batch passes.
    let (tx, mut rx) = mpsc::channel(64);
    {
        let client = client.clone();
        let interval = cfg.notification_poll_interval;
        let cancel = shutdown.token();
        tokio::spawn(async move {
            client.poll_notifications(interval, tx, cancel).await;
        });
    }
    {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = reconciler.handle_event(&event).await {
                    error!("event handling failed: {e}");
                }
            }
        });
    }

    {
        let state = Arc::new(HealthState {
            ledger: ledger.clone(),
            jobs: runner.clone(),
            quotes_path: cfg.quotes_path.clone(),
            images_dir: cfg.images_dir.clone(),
            started_at: Instant::now(),
        });
        let port = cfg.health_port;
        let cancel = shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = health::serve(state, port, cancel).await {
                error!("health server failed: {e}");
            }
        });
    }

    // Scheduler loops stop and in-flight runs drain first; the ledger handle
    // drops after that, never under a running pass.
    let runner_for_release = runner.clone();
    shutdown.on_release("scheduler", move || async move {
        runner_for_release.stop().await;
    });

    info!("wren running; jobs scheduled, health on port {}", cfg.health_port);
    shutdown.wait_for_signal().await?;

    Ok(())
}
