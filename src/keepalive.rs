//! Keep-alive scheduling.
//!
//! Long-poll sessions idle out server-side; a periodic no-payload handshake
//! keeps them warm. Each armed timer is tagged with the generation of the
//! connect cycle that armed it — a timer from a superseded cycle observes
//! the generation mismatch and retires itself, even if its cancellation
//! races the next connect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

use crate::transport::Transport;

pub(crate) struct KeepAlive {
    token: CancellationToken,
}

impl KeepAlive {
    /// Spawn the keep-alive task for one connect cycle.
    ///
    /// `generation` is the cycle that armed this timer; `current` is the
    /// connector's live generation counter.
    pub(crate) fn arm(
        transport: Arc<dyn Transport>,
        interval: Duration,
        generation: u64,
        current: Arc<AtomicU64>,
    ) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();

        tokio::spawn(async move {
            // First fire is one full interval out, matching a
            // fixed-rate schedule with an initial delay.
            let mut ticker = interval_at(Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if current.load(Ordering::Acquire) != generation {
                            // A newer connect cycle owns the session now.
                            break;
                        }
                        if let Err(e) = transport.handshake().await {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "keep-alive handshake failed");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                    }
                }
            }
        });

        Self { token }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
