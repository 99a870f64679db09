//! Explicit shutdown coordination.
//!
//! `main` owns one `Shutdown`; every long-lived component receives a clone of
//! its token at construction, and release hooks run in registration order on
//! a single shutdown path. Register the storage-closing hook last so in-flight
//! ledger commits drain before the handle goes away.

use std::{future::Future, pin::Pin};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;

type ReleaseFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ReleaseFn = Box<dyn FnOnce() -> ReleaseFuture + Send>;

pub struct Shutdown {
    token: CancellationToken,
    hooks: Vec<(String, ReleaseFn)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            hooks: Vec::new(),
        }
    }

    /// Token to hand to components at construction.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a release hook. Hooks run in registration order.
    pub fn on_release<F, Fut>(&mut self, name: &str, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks
            .push((name.to_string(), Box::new(move || Box::pin(hook()))));
    }

    /// Block until SIGINT or SIGTERM, then run the shutdown sequence.
    pub async fn wait_for_signal(self) -> Result<()> {
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                r = tokio::signal::ctrl_c() => r?,
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        info!("shutdown signal received");
        self.run().await;
        Ok(())
    }

    /// Cancel the token and run every hook, in order.
    pub async fn run(mut self) {
        self.token.cancel();
        for (name, hook) in self.hooks.drain(..) {
            info!("releasing {name}");
            hook().await;
        }
        info!("shutdown complete");
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn hooks_run_in_registration_order_after_cancel() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut shutdown = Shutdown::new();
        let token = shutdown.token();

        let o1 = order.clone();
        shutdown.on_release("first", move || async move {
            o1.lock().unwrap().push("first");
        });
        let o2 = order.clone();
        let tok = token.clone();
        shutdown.on_release("second", move || async move {
            // The token is already cancelled by the time hooks run.
            assert!(tok.is_cancelled());
            o2.lock().unwrap().push("second");
        });

        shutdown.run().await;

        assert!(token.is_cancelled());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
