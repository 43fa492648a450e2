//! `QualityBackoffController` - actor that owns a [`QualityBackoff`] and its timer.
//!
//! The current limit is published on a `watch` channel so connections can
//! react to it inside their own `select!` loops without a round trip.

use super::backoff::{BackoffConfig, DowngradeOutcome, QualityBackoff};
use crate::errors::ClientError;
use crate::observability::metrics;
use crate::timing::sleep_until_deadline;
use common::types::QualitySetting;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Mailbox capacity; downgrades are tiny and debounced.
const BACKOFF_CHANNEL_BUFFER: usize = 32;

#[derive(Debug)]
enum BackoffMessage {
    Downgrade,
}

/// Handle to a running backoff controller.
#[derive(Clone, Debug)]
pub struct QualityBackoffHandle {
    sender: mpsc::Sender<BackoffMessage>,
    limit: watch::Receiver<QualitySetting>,
    cancel_token: CancellationToken,
}

impl QualityBackoffHandle {
    /// Signal observed degradation.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the controller has stopped.
    pub async fn downgrade_temporarily(&self) -> Result<(), ClientError> {
        self.sender
            .send(BackoffMessage::Downgrade)
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))
    }

    /// Current quality limit.
    #[must_use]
    pub fn quality_limit(&self) -> QualitySetting {
        *self.limit.borrow()
    }

    /// Subscribe to limit changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QualitySetting> {
        self.limit.clone()
    }

    /// Stop the controller and its timer.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Actor driving one [`QualityBackoff`].
pub struct QualityBackoffController {
    scope: &'static str,
    machine: QualityBackoff,
    receiver: mpsc::Receiver<BackoffMessage>,
    limit_tx: watch::Sender<QualitySetting>,
    cancel_token: CancellationToken,
}

impl QualityBackoffController {
    /// Spawn a controller. `scope` labels logs and metrics (`publisher`, `subscriber`).
    #[must_use]
    pub fn spawn(
        scope: &'static str,
        config: &BackoffConfig,
        cancel_token: CancellationToken,
    ) -> (QualityBackoffHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(BACKOFF_CHANNEL_BUFFER);
        let machine = QualityBackoff::new(config);
        let (limit_tx, limit_rx) = watch::channel(machine.limit());

        let actor = Self {
            scope,
            machine,
            receiver,
            limit_tx,
            cancel_token: cancel_token.clone(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = QualityBackoffHandle {
            sender,
            limit: limit_rx,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "cc.quality.backoff", fields(scope = self.scope))]
    async fn run(mut self) {
        debug!(target: "cc.quality", scope = self.scope, "Backoff controller started");

        loop {
            let deadline = self.machine.next_deadline();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(BackoffMessage::Downgrade) => self.handle_downgrade(),
                        None => break,
                    }
                }

                () = sleep_until_deadline(deadline) => {
                    if self.machine.fire(Instant::now()) {
                        self.publish_limit();
                    }
                }
            }
        }

        debug!(target: "cc.quality", scope = self.scope, "Backoff controller stopped");
    }

    fn handle_downgrade(&mut self) {
        if let DowngradeOutcome::Downgraded { .. } = self.machine.downgrade(Instant::now()) {
            self.publish_limit();
        }
    }

    fn publish_limit(&self) {
        let limit = self.machine.limit();
        metrics::set_quality_limit(self.scope, limit);
        self.limit_tx.send_replace(limit);
    }
}
