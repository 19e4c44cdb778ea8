//! Hierarchical cancellation for Check and Expand.
//!
//! A token is cancelled when it or any of its ancestors is cancelled. Set
//! operations hand a child token to their branches so a short-circuit can stop
//! the siblings without touching the caller's token.

use futures::future::{select_all, BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancellationToken {
    /// Ancestors first, this token's own signal last.
    chain: Vec<Arc<watch::Sender<bool>>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            chain: vec![Arc::new(sender)],
        }
    }

    /// A token cancelled together with `self`, but cancellable on its own.
    pub fn child(&self) -> Self {
        let (sender, _) = watch::channel(false);
        let mut chain = self.chain.clone();
        chain.push(Arc::new(sender));
        Self { chain }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.chain.last() {
            own.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|signal| *signal.borrow())
    }

    /// Resolves once this token or an ancestor is cancelled.
    pub async fn cancelled(&self) {
        let waiters: Vec<BoxFuture<'static, ()>> = self
            .chain
            .iter()
            .map(|signal| {
                let mut receiver = signal.subscribe();
                async move {
                    // The sender is kept alive by the chain, so this only errors
                    // once every clone of the token is gone.
                    if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                .boxed()
            })
            .collect();
        if waiters.is_empty() {
            return std::future::pending().await;
        }
        select_all(waiters).await;
    }
}
