use crate::capabilities::{HttpClient, KeyValueStore, NetworkStatus};
use crate::model::{QueueEntryId, Report};
use crate::queue::ReportQueue;
use crate::resync::{ResyncOrchestrator, ResyncTrigger};
use crate::session::Credentials;
use crate::submission::ReportSubmissionClient;
use crate::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Sent right away; carries the backend's JSON body.
    Submitted(serde_json::Value),
    /// Offline or backend unreachable; the report waits in the queue for the next connection.
    Queued { id: QueueEntryId },
}

/// Entry point the reporting form calls on submit.
pub struct ReportService<S, H> {
    queue: Arc<ReportQueue<S>>,
    client: Arc<ReportSubmissionClient<H>>,
    orchestrator: Arc<ResyncOrchestrator<S, H>>,
    status: NetworkStatus,
    credentials: Credentials,
}

impl<S: KeyValueStore, H: HttpClient> ReportService<S, H> {
    pub fn new(
        queue: Arc<ReportQueue<S>>,
        client: Arc<ReportSubmissionClient<H>>,
        orchestrator: Arc<ResyncOrchestrator<S, H>>,
        status: NetworkStatus,
        credentials: Credentials,
    ) -> Self {
        Self {
            queue,
            client,
            orchestrator,
            status,
            credentials,
        }
    }

    /// Responses the backend rejects come back as errors for the shell to show.
    /// When no response arrives at all the report is queued as if offline.
    #[instrument(skip(self, report), fields(online = self.status.is_online()))]
    pub async fn submit(&self, report: Report) -> Result<SubmissionOutcome, AppError> {
        let submitted_by = self.credentials.user_id();

        if self.status.is_online() {
            match self.client.submit(&report, submitted_by.as_ref(), None).await {
                Ok(body) => return Ok(SubmissionOutcome::Submitted(body)),
                Err(error) if error.is_unreachable() => {
                    warn!(error = %error, "backend unreachable, queueing report");
                }
                Err(error) => return Err(error.into()),
            }
        }

        let entry = self.queue.enqueue(report, submitted_by).await?;
        info!(id = %entry.id, "report queued");
        Ok(SubmissionOutcome::Queued { id: entry.id })
    }

    pub async fn pending_count(&self) -> Result<usize, AppError> {
        Ok(self.queue.len().await?)
    }

    /// Manual "sync now".
    pub async fn request_resync(&self) -> ResyncTrigger {
        self.orchestrator.request_resync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HttpError, MemoryKvStore, ValidatedUrl};
    use crate::model::UserId;
    use crate::resync::{PassOutcome, ResyncOptions};
    use crate::session::Session;
    use crate::testing::{sample_report, MockHttpClient, MockReply};
    use crate::ErrorKind;

    struct Harness {
        http: Arc<MockHttpClient>,
        status: NetworkStatus,
        service: ReportService<MemoryKvStore, MockHttpClient>,
    }

    fn harness(credentials: Credentials) -> Harness {
        let queue = Arc::new(ReportQueue::with_defaults(Arc::new(MemoryKvStore::new())).unwrap());
        let http = Arc::new(MockHttpClient::new());
        let base = ValidatedUrl::new("https://api.fishguard.example").unwrap();
        let client = Arc::new(
            ReportSubmissionClient::new(http.clone(), &base, 5_000, credentials.clone()).unwrap(),
        );
        let orchestrator = Arc::new(ResyncOrchestrator::new(
            queue.clone(),
            client.clone(),
            ResyncOptions::default(),
        ));
        let status = NetworkStatus::default();
        let service =
            ReportService::new(queue, client, orchestrator, status.clone(), credentials);
        Harness {
            http,
            status,
            service,
        }
    }

    #[tokio::test]
    async fn test_online_submits_immediately() {
        let h = harness(Credentials::new());
        h.http.push_reply(MockReply::created("r-1"));

        let outcome = h.service.submit(sample_report("now")).await.unwrap();

        assert_eq!(
            outcome,
            SubmissionOutcome::Submitted(serde_json::json!({ "_id": "r-1" }))
        );
        assert_eq!(h.service.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_queues_with_submitter() {
        let session = Session::new(UserId::new("user-5"), "tok").unwrap();
        let h = harness(Credentials::signed_in(session));
        h.status.set_online(false);

        let outcome = h.service.submit(sample_report("later")).await.unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Queued { .. }));
        assert_eq!(h.http.request_count(), 0);
        assert_eq!(h.service.pending_count().await.unwrap(), 1);

        h.status.set_online(true);
        let result = h.service.request_resync().await;
        assert_eq!(
            result,
            ResyncTrigger::Ran(PassOutcome::Completed { submitted: 1 })
        );
        let requests = h.http.requests();
        assert_eq!(
            requests[0].multipart().unwrap().text_value("userId"),
            Some("user-5")
        );
        assert_eq!(h.service.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_online_failure_is_reported_not_queued() {
        let h = harness(Credentials::new());
        h.http.push_reply(MockReply::status(401, "expired"));

        let err = h.service.submit(sample_report("x")).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(h.service.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_queues_report() {
        let h = harness(Credentials::new());
        h.http.push_reply(MockReply::connection_refused());

        let outcome = h.service.submit(sample_report("no signal")).await.unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Queued { .. }));
        assert_eq!(h.service.pending_count().await.unwrap(), 1);

        let result = h.service.request_resync().await;
        assert_eq!(
            result,
            ResyncTrigger::Ran(PassOutcome::Completed { submitted: 1 })
        );
        assert_eq!(h.http.submitted_tags(), vec!["no signal", "no signal"]);
    }

    #[tokio::test]
    async fn test_unreadable_evidence_is_reported_not_queued() {
        let h = harness(Credentials::new());
        h.http.push_reply(MockReply::Fail(HttpError::Attachment {
            source_uri: "/gone.jpg".into(),
            message: "not found".into(),
        }));

        let err = h.service.submit(sample_report("x")).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Attachment);
        assert_eq!(h.service.pending_count().await.unwrap(), 0);
    }
}
