//! Test doubles shared by unit and integration tests.

use crate::capabilities::{
    HttpClient, HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpResult, KeyValueStore,
    KvError, KvKey, StorageErrorCode,
};
use crate::model::{Coordinates, EvidenceUri, IncidentInfo, LocationInfo, PersonalInfo, Report};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A report whose incident description carries `tag`, for order assertions.
pub fn sample_report(tag: &str) -> Report {
    Report {
        location_info: LocationInfo {
            coordinates: Coordinates::new(7.2906, 80.6337),
            description: "Lagoon mouth".into(),
        },
        incident_info: IncidentInfo {
            date: "2024-05-14".into(),
            time: "05:30".into(),
            incident_type: "illegal-net".into(),
            species: "sea cucumber".into(),
            description: tag.into(),
        },
        evidences: Vec::new(),
        personal_info: PersonalInfo {
            anonymous: true,
            ..Default::default()
        },
    }
}

pub fn sample_report_with_evidence(tag: &str, uris: &[&str]) -> Report {
    let mut report = sample_report(tag);
    report.evidences = uris.iter().map(|u| EvidenceUri::new(*u)).collect();
    report
}

/// Wraps a store and injects storage failures on demand.
pub struct FailableKvStore<S> {
    inner: S,
    fail_gets: AtomicBool,
    fail_sets: AtomicBool,
    fail_deletes: AtomicBool,
}

impl<S: KeyValueStore> FailableKvStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_gets: AtomicBool::new(false),
            fail_sets: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn injected() -> KvError {
        KvError::storage(StorageErrorCode::IoError, "Injected failure")
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for FailableKvStore<S> {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.delete(key).await
    }
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Json(u16, serde_json::Value),
    Raw(u16, Vec<u8>),
    Fail(HttpError),
}

impl MockReply {
    pub fn created(id: &str) -> Self {
        MockReply::Json(201, serde_json::json!({ "_id": id }))
    }

    pub fn status(status: u16, body: &str) -> Self {
        MockReply::Raw(status, body.as_bytes().to_vec())
    }

    pub fn connection_refused() -> Self {
        MockReply::Fail(HttpError::ConnectionError {
            host: "mock".into(),
            message: "connection refused".into(),
        })
    }
}

/// Scripted HTTP client that records every request it sees.
///
/// Replies are consumed in order; once the script runs out `fallback` is used.
pub struct MockHttpClient {
    script: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: MockReply::created("generated"),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_fallback(mut self, reply: MockReply) -> Self {
        self.fallback = reply;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: MockReply) {
        lock(&self.script).push_back(reply);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Incident descriptions of every recorded report submission, in order.
    pub fn submitted_tags(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .filter_map(|r| r.multipart()?.text_value("incidentInfo").map(str::to_owned))
            .filter_map(|json| {
                let info: IncidentInfo = serde_json::from_str(&json).ok()?;
                Some(info.description)
            })
            .collect()
    }

    /// Polls until at least `count` requests were recorded or `timeout` passes.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.request_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.request_count() >= count
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let request_id = request.request_id().to_string();
        lock(&self.requests).push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let mut headers = HttpHeaders::new();
        headers.insert("Content-Type", "application/json")?;

        match reply {
            MockReply::Json(status, value) => {
                let body = serde_json::to_vec(&value).map_err(|e| {
                    HttpError::SerializationError {
                        message: e.to_string(),
                    }
                })?;
                Ok(HttpResponse::new(status, headers, body, request_id, 1))
            }
            MockReply::Raw(status, body) => Ok(HttpResponse::new(
                status,
                HttpHeaders::new(),
                body,
                request_id,
                1,
            )),
            MockReply::Fail(error) => Err(error),
        }
    }
}
