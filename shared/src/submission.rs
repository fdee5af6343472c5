use crate::capabilities::{HttpClient, HttpError, HttpRequest, MultipartForm, ValidatedUrl};
use crate::model::{QueueEntryId, Report, UserId};
use crate::session::Credentials;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const CREATE_REPORT_PATH: &str = "/api/report/create";
pub const EVIDENCE_FIELD: &str = "evidence";
/// Sent for every evidence part whatever the file really is.
pub const EVIDENCE_MIME_TYPE: &str = "image/jpeg";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("server returned {status} with a body that is not JSON: {reason}")]
    MalformedResponse { status: u16, reason: String },

    #[error("could not encode '{field}': {message}")]
    Encoding { field: &'static str, message: String },
}

impl SubmissionError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SubmissionError::Http(e) => e.status_code(),
            SubmissionError::MalformedResponse { status, .. } => Some(*status),
            SubmissionError::Encoding { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmissionError::Http(e) if e.is_retryable())
    }

    /// No response arrived and the same request may go through later.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SubmissionError::Http(e) if e.is_transport() && e.is_retryable())
    }
}

/// Builds and sends the multipart create-report request.
///
/// Stateless apart from the shared credentials; it never touches the queue.
pub struct ReportSubmissionClient<H> {
    http: Arc<H>,
    endpoint: ValidatedUrl,
    timeout_ms: u64,
    credentials: Credentials,
}

impl<H: HttpClient> ReportSubmissionClient<H> {
    pub fn new(
        http: Arc<H>,
        api_base_url: &ValidatedUrl,
        timeout_ms: u64,
        credentials: Credentials,
    ) -> Result<Self, SubmissionError> {
        Ok(Self {
            http,
            endpoint: api_base_url.join_path(CREATE_REPORT_PATH)?,
            timeout_ms,
            credentials,
        })
    }

    pub fn endpoint(&self) -> &ValidatedUrl {
        &self.endpoint
    }

    pub fn build_request(
        &self,
        report: &Report,
        submitted_by: Option<&UserId>,
        idempotency_key: Option<&QueueEntryId>,
    ) -> Result<HttpRequest, SubmissionError> {
        let mut form = MultipartForm::new();
        if let Some(user_id) = submitted_by {
            form = form.text("userId", user_id.as_str());
        }
        form = form
            .text("locationInfo", encode("locationInfo", &report.location_info)?)
            .text("incidentInfo", encode("incidentInfo", &report.incident_info)?)
            .text("personalInfo", encode("personalInfo", &report.personal_info)?);

        for (index, evidence) in report.evidences.iter().enumerate() {
            form = form.file(
                EVIDENCE_FIELD,
                format!("evidence_{index}.jpg"),
                EVIDENCE_MIME_TYPE,
                evidence.as_str(),
            );
        }

        let mut request = HttpRequest::post(self.endpoint.clone())
            .with_timeout_ms(self.timeout_ms)?
            .with_header("Accept", "application/json")?;

        if let Some(authorization) = self.credentials.authorization() {
            request = request.with_header("Authorization", authorization)?;
        }
        if let Some(key) = idempotency_key {
            request = request.with_header(IDEMPOTENCY_HEADER, key.as_str())?;
        }

        Ok(request.with_multipart(form))
    }

    /// Submits one report and returns the backend's JSON body.
    #[instrument(
        skip(self, report, submitted_by, idempotency_key),
        fields(evidences = report.evidences.len(), replay = idempotency_key.is_some())
    )]
    pub async fn submit(
        &self,
        report: &Report,
        submitted_by: Option<&UserId>,
        idempotency_key: Option<&QueueEntryId>,
    ) -> Result<serde_json::Value, SubmissionError> {
        let request = self.build_request(report, submitted_by, idempotency_key)?;
        let response = self.http.execute(request).await?;
        let status = response.status();

        if !response.is_success() {
            warn!(status, "report submission rejected");
            return Err(HttpError::status(
                status,
                response.body_text(),
                response.request_id(),
            )
            .into());
        }

        let body = response.json().map_err(|e| {
            warn!(
                status,
                content_type = response.headers().get("content-type"),
                "report accepted but response is not JSON"
            );
            SubmissionError::MalformedResponse {
                status,
                reason: e.to_string(),
            }
        })?;

        debug!(status, duration_ms = response.duration_ms(), "report submitted");
        Ok(body)
    }
}

fn encode<T: Serialize>(field: &'static str, value: &T) -> Result<String, SubmissionError> {
    serde_json::to_string(value).map_err(|e| SubmissionError::Encoding {
        field,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::FormPart;
    use crate::model::IncidentInfo;
    use crate::session::Session;
    use crate::testing::{sample_report, sample_report_with_evidence, MockHttpClient, MockReply};

    fn client(mock: Arc<MockHttpClient>, credentials: Credentials) -> ReportSubmissionClient<MockHttpClient> {
        let base = ValidatedUrl::new("https://api.fishguard.example").unwrap();
        ReportSubmissionClient::new(mock, &base, 30_000, credentials).unwrap()
    }

    #[test]
    fn test_multipart_payload_shape() {
        let mock = Arc::new(MockHttpClient::new());
        let client = client(mock, Credentials::new());
        let report = sample_report_with_evidence(
            "two photos",
            &["file:///data/a.png", "file:///data/b.heic"],
        );

        let request = client
            .build_request(&report, Some(&UserId::new("user-9")), None)
            .unwrap();

        assert_eq!(
            request.url().as_str(),
            "https://api.fishguard.example/api/report/create"
        );
        assert_eq!(request.timeout_ms(), 30_000);

        let form = request.multipart().unwrap();
        assert_eq!(form.text_value("userId"), Some("user-9"));

        let incident: IncidentInfo =
            serde_json::from_str(form.text_value("incidentInfo").unwrap()).unwrap();
        assert_eq!(incident, report.incident_info);
        let location: serde_json::Value =
            serde_json::from_str(form.text_value("locationInfo").unwrap()).unwrap();
        assert_eq!(location["description"], "Lagoon mouth");
        assert!(form.text_value("personalInfo").is_some());

        let files: Vec<_> = form.files_named(EVIDENCE_FIELD).collect();
        assert_eq!(files.len(), 2);
        for (index, part) in files.iter().enumerate() {
            match part {
                FormPart::File {
                    file_name,
                    mime_type,
                    source,
                    ..
                } => {
                    assert_eq!(file_name, &format!("evidence_{index}.jpg"));
                    assert_eq!(mime_type, "image/jpeg");
                    assert_eq!(source, report.evidences[index].as_str());
                }
                FormPart::Text { .. } => panic!("expected a file part"),
            }
        }
    }

    #[test]
    fn test_user_id_omitted_when_unknown() {
        let client = client(Arc::new(MockHttpClient::new()), Credentials::new());
        let request = client.build_request(&sample_report("r"), None, None).unwrap();
        let form = request.multipart().unwrap();

        assert!(form.text_value("userId").is_none());
        assert_eq!(form.files_named(EVIDENCE_FIELD).count(), 0);
        assert!(request.headers().get("Authorization").is_none());
        assert!(request.headers().get(IDEMPOTENCY_HEADER).is_none());
    }

    #[test]
    fn test_auth_and_idempotency_headers() {
        let session = Session::new(UserId::new("user-9"), "tok-1").unwrap();
        let client = client(Arc::new(MockHttpClient::new()), Credentials::signed_in(session));
        let key = QueueEntryId::new("entry-1");

        let request = client
            .build_request(&sample_report("r"), None, Some(&key))
            .unwrap();

        assert_eq!(request.headers().get("authorization"), Some("Bearer tok-1"));
        assert_eq!(request.headers().get(IDEMPOTENCY_HEADER), Some("entry-1"));
    }

    #[tokio::test]
    async fn test_submit_returns_body() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_reply(MockReply::created("abc123"));
        let client = client(mock.clone(), Credentials::new());

        let body = client.submit(&sample_report("r"), None, None).await.unwrap();

        assert_eq!(body["_id"], "abc123");
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status_and_body() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_reply(MockReply::status(422, "species is required"));
        let client = client(mock, Credentials::new());

        let err = client.submit(&sample_report("r"), None, None).await.unwrap_err();

        match err {
            SubmissionError::Http(HttpError::HttpStatus { status, message, .. }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "species is required");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_reply(MockReply::connection_refused());
        let client = client(mock, Credentials::new());

        let err = client.submit(&sample_report("r"), None, None).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Http(HttpError::ConnectionError { .. })));
        assert!(err.is_retryable());
        assert!(err.is_unreachable());
    }

    #[test]
    fn test_unreachable_classification() {
        let timeout = SubmissionError::Http(HttpError::Timeout {
            timeout_ms: 30_000,
            request_id: "req".into(),
        });
        assert!(timeout.is_unreachable());

        let attachment = SubmissionError::Http(HttpError::Attachment {
            source_uri: "/gone.jpg".into(),
            message: "not found".into(),
        });
        assert!(!attachment.is_unreachable());

        let rejected = SubmissionError::Http(HttpError::status(503, "down", "req"));
        assert!(!rejected.is_unreachable());
    }

    #[tokio::test]
    async fn test_malformed_success_is_error() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_reply(MockReply::status(200, "OK"));
        let client = client(mock, Credentials::new());

        let err = client.submit(&sample_report("r"), None, None).await.unwrap_err();
        assert!(matches!(err, SubmissionError::MalformedResponse { status: 200, .. }));
        assert_eq!(err.status_code(), Some(200));
    }

    #[test]
    fn test_base_url_prefix_kept() {
        let base = ValidatedUrl::new("https://api.fishguard.example/v2/").unwrap();
        let client = ReportSubmissionClient::new(
            Arc::new(MockHttpClient::new()),
            &base,
            1_000,
            Credentials::new(),
        )
        .unwrap();
        assert_eq!(
            client.endpoint().as_str(),
            "https://api.fishguard.example/v2/api/report/create"
        );
    }
}
