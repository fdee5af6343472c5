use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_REQUEST_BODY_SIZE: usize = 50 * 1024 * 1024;
pub const MAX_RESPONSE_BODY_SIZE: usize = 100 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        let parsed = Self::validate(&url)?;

        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "missing host".to_string(),
            })?
            .to_lowercase();

        Ok(Self {
            url: parsed.to_string(),
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Appends an absolute API path, keeping any path prefix of the base.
    pub fn join_path(&self, path: &str) -> Result<Self, HttpError> {
        let base = self.url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Self::new(format!("{base}/{path}"))
    }

    fn validate(url: &str) -> Result<Url, HttpError> {
        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url: url.to_string(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
            });
        }

        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!(
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    scheme
                ),
            });
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "URL must have a host".to_string(),
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(parsed)
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            return url.to_string();
        }
        let mut end = 100;
        while !url.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &url[..end])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        if self.headers.len() >= MAX_HEADERS_COUNT {
            return Err(HttpError::TooManyHeaders {
                count: self.headers.len(),
                max: MAX_HEADERS_COUNT,
            });
        }

        let name = name.into();
        let value = value.into();

        Self::validate_header_name(&name)?;
        Self::validate_header_value(&name, &value)?;

        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value));

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn validate_header_name(name: &str) -> Result<(), HttpError> {
        if name.is_empty() {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.chars().take(50).collect::<String>() + "...",
                reason: format!(
                    "header name exceeds maximum length of {} bytes",
                    MAX_HEADER_NAME_LENGTH
                ),
            });
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!("invalid character '{}' in header name", c),
            });
        }

        let lower = name.to_lowercase();
        if lower == "host" || lower == "content-length" || lower == "transfer-encoding" {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "this header is managed automatically".to_string(),
            });
        }

        Ok(())
    }

    fn validate_header_value(name: &str, value: &str) -> Result<(), HttpError> {
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "header value exceeds maximum length of {} bytes",
                    MAX_HEADER_VALUE_LENGTH
                ),
            });
        }

        if value.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header value contains invalid characters (CR, LF, or NULL)".to_string(),
            });
        }

        Ok(())
    }
}

/// Response headers come from the wire and skip request-side validation.
impl From<Vec<(String, String)>> for HttpHeaders {
    fn from(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }
}


/// One part of a `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    /// File contents are read from `source` (a local path or `file://` URI) at send time.
    File {
        name: String,
        file_name: String,
        mime_type: String,
        source: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartForm {
    parts: Vec<FormPart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.parts.push(FormPart::File {
            name: name.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            source: source.into(),
        });
        self
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    pub fn text_value(&self, name: &str) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            FormPart::Text { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn files_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FormPart> + 'a {
        self.parts
            .iter()
            .filter(move |part| matches!(part, FormPart::File { name: n, .. } if n == name))
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}


/// A `POST` to the backend, optionally carrying a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    url: ValidatedUrl,
    headers: HttpHeaders,
    form: Option<MultipartForm>,
    timeout_ms: u64,
    request_id: String,
}

impl HttpRequest {
    pub fn post(url: ValidatedUrl) -> Self {
        Self {
            url,
            headers: HttpHeaders::new(),
            form: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    /// The transport sets the multipart `Content-Type` and boundary.
    #[must_use]
    pub fn with_multipart(mut self, form: MultipartForm) -> Self {
        self.form = Some(form);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Result<Self, HttpError> {
        if timeout_ms == 0 {
            return Err(HttpError::InvalidRequest {
                reason: "timeout cannot be zero".to_string(),
            });
        }
        if timeout_ms > MAX_TIMEOUT_MS {
            return Err(HttpError::InvalidRequest {
                reason: format!("timeout exceeds maximum of {}ms", MAX_TIMEOUT_MS),
            });
        }
        self.timeout_ms = timeout_ms;
        Ok(self)
    }

    pub fn url(&self) -> &ValidatedUrl {
        &self.url
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn multipart(&self) -> Option<&MultipartForm> {
        self.form.as_ref()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("too many headers: {count} exceeds maximum of {max}")]
    TooManyHeaders { count: usize, max: usize },

    #[error("request body too large: {size} bytes exceeds maximum of {max} bytes")]
    BodyTooLarge { size: usize, max: usize },

    #[error("response body too large: {size} bytes exceeds maximum of {max} bytes")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("could not read attachment '{source_uri}': {message}")]
    Attachment { source_uri: String, message: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
        retryable: bool,
    },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

impl HttpError {
    pub fn status(status: u16, body: impl Into<String>, request_id: impl Into<String>) -> Self {
        HttpError::HttpStatus {
            status,
            message: body.into(),
            request_id: request_id.into(),
            retryable: matches!(status, 408 | 429 | 500..=599),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. } | HttpError::ConnectionError { .. } => true,
            HttpError::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// True for failures that happened before any response arrived.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HttpError::Timeout { .. }
                | HttpError::ConnectionError { .. }
                | HttpError::Attachment { .. }
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            HttpError::Timeout { request_id, .. }
            | HttpError::HttpStatus { request_id, .. }
            | HttpError::InvalidResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    request_id: String,
    duration_ms: u64,
}

impl HttpResponse {
    pub fn new(
        status: u16,
        headers: HttpHeaders,
        body: Vec<u8>,
        request_id: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            request_id,
            duration_ms,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }


    /// Lossy, for error messages.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse JSON: {}", e),
            request_id: self.request_id.clone(),
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

pub type HttpResult = Result<HttpResponse, HttpError>;

/// Executes requests. Non-2xx responses are returned as `Ok`; callers decide.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> HttpResult;
}

#[async_trait]
impl<H: HttpClient + ?Sized> HttpClient for Arc<H> {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        (**self).execute(request).await
    }
}

/// Turns an evidence URI into a local filesystem path.
pub fn local_path_for(source: &str) -> Result<std::path::PathBuf, HttpError> {
    if source.starts_with("file://") {
        let url = Url::parse(source).map_err(|e| HttpError::Attachment {
            source_uri: source.to_string(),
            message: e.to_string(),
        })?;
        return url.to_file_path().map_err(|()| HttpError::Attachment {
            source_uri: source.to_string(),
            message: "not a local file URI".to_string(),
        });
    }
    if source.contains("://") {
        return Err(HttpError::Attachment {
            source_uri: source.to_string(),
            message: "unsupported URI scheme".to_string(),
        });
    }
    Ok(std::path::PathBuf::from(source))
}
#[cfg(not(target_arch = "wasm32"))]
pub use self::native::ReqwestHttpClient;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use super::{
        local_path_for, FormPart, HttpClient, HttpError, HttpHeaders, HttpRequest, HttpResponse,
        HttpResult, MultipartForm, MAX_REQUEST_BODY_SIZE, MAX_RESPONSE_BODY_SIZE,
    };
    use async_trait::async_trait;
    use std::time::{Duration, Instant};
    use tracing::{debug, instrument};

    /// `reqwest`-backed transport for the native shells.
    #[derive(Clone, Default)]
    pub struct ReqwestHttpClient {
        client: reqwest::Client,
    }

    impl ReqwestHttpClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }

        /// Reads every file part; their combined size is capped at `MAX_REQUEST_BODY_SIZE`.
        async fn build_form(form: &MultipartForm) -> Result<reqwest::multipart::Form, HttpError> {
            let mut out = reqwest::multipart::Form::new();
            let mut total = 0usize;
            for part in form.parts() {
                out = match part {
                    FormPart::Text { name, value } => {
                        total += value.len();
                        out.text(name.clone(), value.clone())
                    }
                    FormPart::File {
                        name,
                        file_name,
                        mime_type,
                        source,
                    } => {
                        let attachment_error = |e: std::io::Error| HttpError::Attachment {
                            source_uri: source.clone(),
                            message: e.to_string(),
                        };
                        let path = local_path_for(source)?;
                        let size = tokio::fs::metadata(&path)
                            .await
                            .map_err(attachment_error)?
                            .len();
                        total = total.saturating_add(usize::try_from(size).unwrap_or(usize::MAX));
                        if total > MAX_REQUEST_BODY_SIZE {
                            return Err(HttpError::BodyTooLarge {
                                size: total,
                                max: MAX_REQUEST_BODY_SIZE,
                            });
                        }

                        let bytes = tokio::fs::read(&path).await.map_err(attachment_error)?;
                        let file_part = reqwest::multipart::Part::bytes(bytes)
                            .file_name(file_name.clone())
                            .mime_str(mime_type)
                            .map_err(|e| HttpError::InvalidRequest {
                                reason: e.to_string(),
                            })?;
                        out.part(name.clone(), file_part)
                    }
                };
            }
            Ok(out)
        }

        fn classify(error: &reqwest::Error, request: &HttpRequest) -> HttpError {
            if error.is_timeout() {
                HttpError::Timeout {
                    timeout_ms: request.timeout_ms(),
                    request_id: request.request_id().to_string(),
                }
            } else {
                HttpError::ConnectionError {
                    host: request.url().host().to_string(),
                    message: error.to_string(),
                }
            }
        }

        /// Stops reading as soon as the body would exceed `MAX_RESPONSE_BODY_SIZE`.
        async fn read_body(
            mut response: reqwest::Response,
            request: &HttpRequest,
        ) -> Result<Vec<u8>, HttpError> {
            if let Some(declared) = response.content_length() {
                let declared = usize::try_from(declared).unwrap_or(usize::MAX);
                if declared > MAX_RESPONSE_BODY_SIZE {
                    return Err(HttpError::ResponseTooLarge {
                        size: declared,
                        max: MAX_RESPONSE_BODY_SIZE,
                    });
                }
            }

            let mut body = Vec::new();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| Self::classify(&e, request))?
            {
                let size = body.len() + chunk.len();
                if size > MAX_RESPONSE_BODY_SIZE {
                    return Err(HttpError::ResponseTooLarge {
                        size,
                        max: MAX_RESPONSE_BODY_SIZE,
                    });
                }
                body.extend_from_slice(&chunk);
            }
            Ok(body)
        }
    }

    #[async_trait]
    impl HttpClient for ReqwestHttpClient {
        #[instrument(skip(self, request), fields(request_id = %request.request_id(), host = request.url().host()))]
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            let mut builder = self
                .client
                .post(request.url().as_str())
                .timeout(Duration::from_millis(request.timeout_ms()));

            for (name, value) in request.headers().iter() {
                builder = builder.header(name, value);
            }

            if let Some(form) = request.multipart() {
                builder = builder.multipart(Self::build_form(form).await?);
            }

            let started = Instant::now();
            let response = builder
                .send()
                .await
                .map_err(|e| Self::classify(&e, &request))?;

            let status = response.status().as_u16();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            let body = Self::read_body(response, &request).await?;

            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            debug!(status, duration_ms, "response received");

            Ok(HttpResponse::new(
                status,
                HttpHeaders::from(headers),
                body,
                request.request_id().to_string(),
                duration_ms,
            ))
        }
    }
}
