//! Background task turning connectivity events into resync passes.

use crate::cancel::CancellationToken;
use crate::capabilities::{ConnectivityEvent, HttpClient, KeyValueStore, NetworkStatus};
use crate::resync::{PassOutcome, ResyncOrchestrator, ResyncTrigger};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Owns the observer task. Dropping it without [`NetworkObserver::shutdown`]
/// cancels the current pass and aborts the task.
///
/// Each observer carries its own cancellation token, so stopping one leaves the
/// orchestrator usable for manual resyncs and for the next observer.
pub struct NetworkObserver {
    cancel: CancellationToken,
    status: NetworkStatus,
    handle: Option<JoinHandle<()>>,
}

impl NetworkObserver {
    pub fn spawn<S, H>(
        orchestrator: Arc<ResyncOrchestrator<S, H>>,
        status: NetworkStatus,
        events: mpsc::Receiver<ConnectivityEvent>,
    ) -> Self
    where
        S: KeyValueStore + 'static,
        H: HttpClient + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(orchestrator, status.clone(), events, cancel.clone()));
        Self {
            cancel,
            status,
            handle: Some(handle),
        }
    }

    pub fn status(&self) -> &NetworkStatus {
        &self.status
    }

    pub fn is_finished(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Stops accepting events, lets in-flight passes reach their next entry and joins.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "network observer task failed");
                }
            }
        }
        info!("network observer stopped");
    }
}

impl Drop for NetworkObserver {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            handle.abort();
        }
    }
}

async fn run<S, H>(
    orchestrator: Arc<ResyncOrchestrator<S, H>>,
    status: NetworkStatus,
    mut events: mpsc::Receiver<ConnectivityEvent>,
    cancel: CancellationToken,
) where
    S: KeyValueStore + 'static,
    H: HttpClient + 'static,
{
    let mut passes = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("connectivity sender dropped");
                    break;
                };
                status.set_online(event.is_connected);
                if event.is_connected {
                    debug!("connected, requesting resync");
                    let orchestrator = orchestrator.clone();
                    let cancel = cancel.clone();
                    passes.spawn(async move { orchestrator.request_resync_until(&cancel).await });
                } else {
                    debug!("disconnected");
                }
            }
            Some(joined) = passes.join_next(), if !passes.is_empty() => log_joined(joined),
        }
    }

    events.close();
    while let Some(joined) = passes.join_next().await {
        log_joined(joined);
    }
}

fn log_joined(joined: Result<ResyncTrigger, tokio::task::JoinError>) {
    match joined {
        Ok(ResyncTrigger::Coalesced) => debug!("resync trigger coalesced"),
        Ok(ResyncTrigger::Ran(outcome)) => match outcome {
            PassOutcome::Empty => debug!("resync found nothing queued"),
            PassOutcome::Completed { submitted } => info!(submitted, "resync pass completed"),
            PassOutcome::Cancelled {
                submitted,
                remaining,
            } => warn!(submitted, remaining, "resync pass cancelled"),
            PassOutcome::Aborted {
                submitted,
                remaining,
                error,
            } => warn!(submitted, remaining, error = %error, "resync pass aborted"),
            PassOutcome::PartiallyFailed { submitted, failed } => {
                warn!(submitted, failed, "resync pass had failures")
            }
            PassOutcome::StorageFailed { error } => {
                error!(error = %error, "resync pass hit a storage error")
            }
        },
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "resync task panicked"),
    }
}
