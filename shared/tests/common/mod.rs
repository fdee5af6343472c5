#![allow(dead_code)]

use async_trait::async_trait;
use shared::capabilities::{HttpClient, HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpResult};
use shared::{IncidentInfo, Report};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn report(tag: &str) -> Report {
    let mut report = Report::default();
    report.incident_info.species = "skipjack tuna".into();
    report.incident_info.incident_type = "undersized catch".into();
    report.incident_info.description = tag.into();
    report.location_info.description = "Harbour wall".into();
    report
}

/// Backend stand-in. Accepts everything unless told to fail.
#[derive(Default)]
pub struct Backend {
    failing: AtomicBool,
    received: Mutex<Vec<HttpRequest>>,
}

impl Backend {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<HttpRequest> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_tags(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|r| {
                let json = r.multipart().unwrap().text_value("incidentInfo").unwrap();
                serde_json::from_str::<IncidentInfo>(json).unwrap().description
            })
            .collect()
    }
}

#[async_trait]
impl HttpClient for Backend {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let request_id = request.request_id().to_string();
        self.received.lock().unwrap().push(request);

        if self.failing.load(Ordering::SeqCst) {
            return Err(HttpError::ConnectionError {
                host: "api.fishguard.example".into(),
                message: "network unreachable".into(),
            });
        }

        let count = self.received.lock().unwrap().len();
        let body = serde_json::to_vec(&serde_json::json!({ "_id": format!("report-{count}") }))
            .unwrap();
        Ok(HttpResponse::new(201, HttpHeaders::new(), body, request_id, 3))
    }
}

pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
