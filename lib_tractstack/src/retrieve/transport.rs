//! # Event Transport
//!
//! Asynchronous client wrapper around `reqwest` with retry middleware. Every
//! outbound call of the visitor subsystem goes through here so that the
//! tenant, session and storyfragment headers are always attached the same
//! way.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::configs::client_config::ClientConfig;

/// Telemetry and belief sink.
pub const STATE_PATH: &str = "/api/v1/state";

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const SESSION_HEADER: &str = "x-tractstack-session-id";
pub const STORYFRAGMENT_HEADER: &str = "x-storyfragment-id";

/// Errors raised while delivering a request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for header {0}")]
    InvalidHeader(&'static str),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Identifying headers attached to a request.
///
/// Callers build this from a session snapshot taken *before* awaiting, so a
/// soft navigation that lands mid-flight cannot change what a request claims
/// to be about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub tenant_id: String,
    pub session_id: Option<String>,
    pub storyfragment_id: Option<String>,
}

impl RequestIdentity {
    pub fn tenant(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        }
    }
}

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a 2xx response.
    pub data: Option<T>,
    /// The raw body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// Turns a non-2xx response into `TransportError::Status`.
    pub fn expect_success(self) -> Result<Option<T>, TransportError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(TransportError::Status {
                status: self.status,
                body: self.error_body.unwrap_or_default(),
            })
        }
    }
}

enum RequestBody {
    Form(String),
    Json(String),
}

#[derive(Clone, Copy)]
enum Attempts {
    Retrying,
    Once,
}

struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    text: String,
}

/// Shared outbound HTTP helper.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct EventTransport {
    inner: ClientWithMiddleware,
    once: ClientWithMiddleware,
    base_url: String,
    timeout: Duration,
}

impl std::fmt::Debug for EventTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTransport")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl EventTransport {
    /// Creates a transport with a per-request timeout. `max_retries` applies
    /// to `post_form`/`post_json`; `send_form` never retries.
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> Result<Self, TransportError> {
        // Fail early on a base that can never produce a valid request URL.
        Url::parse(base_url)?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let once = ClientBuilder::new(client.clone()).build();
        let inner = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            once,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        Self::new(config.backend_url(), config.request_timeout(), config.max_retries())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds the identifying headers for a request.
    pub fn identity_headers(identity: &RequestIdentity) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            TENANT_HEADER,
            HeaderValue::from_str(&identity.tenant_id)
                .map_err(|_| TransportError::InvalidHeader(TENANT_HEADER))?,
        );
        if let Some(session_id) = identity.session_id.as_deref() {
            headers.insert(
                SESSION_HEADER,
                HeaderValue::from_str(session_id)
                    .map_err(|_| TransportError::InvalidHeader(SESSION_HEADER))?,
            );
        }
        if let Some(storyfragment_id) = identity.storyfragment_id.as_deref() {
            headers.insert(
                STORYFRAGMENT_HEADER,
                HeaderValue::from_str(storyfragment_id)
                    .map_err(|_| TransportError::InvalidHeader(STORYFRAGMENT_HEADER))?,
            );
        }
        Ok(headers)
    }

    /// POSTs `fields` as `application/x-www-form-urlencoded`.
    pub async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        identity: &RequestIdentity,
        fields: &[(&str, String)],
    ) -> Result<ApiResponse<T>, TransportError> {
        self.request(Method::POST, path, identity, RequestBody::Form(encode_form(fields)))
            .await
    }

    /// POSTs `fields` form-encoded to an event sink, in a single attempt.
    ///
    /// Delivery is judged by status alone; the body is ignored. Sinks such
    /// as [`STATE_PATH`] record every call they receive, so a retry after a
    /// lost response would count the event twice.
    pub async fn send_form(
        &self,
        path: &str,
        identity: &RequestIdentity,
        fields: &[(&str, String)],
    ) -> Result<(), TransportError> {
        let raw = self
            .execute(
                Method::POST,
                path,
                identity,
                RequestBody::Form(encode_form(fields)),
                Attempts::Once,
            )
            .await?;
        if raw.status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: raw.status.as_u16(),
                body: raw.text,
            })
        }
    }

    /// POSTs `body` serialized as JSON.
    pub async fn post_json<T, B>(
        &self,
        path: &str,
        identity: &RequestIdentity,
        body: &B,
    ) -> Result<ApiResponse<T>, TransportError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let json_body = serde_json::to_string(body)?;
        self.request(Method::POST, path, identity, RequestBody::Json(json_body))
            .await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        identity: &RequestIdentity,
        body: RequestBody,
    ) -> Result<ApiResponse<T>, TransportError> {
        let raw = self
            .execute(method, path, identity, body, Attempts::Retrying)
            .await?;

        if raw.status.is_success() {
            // An empty 2xx body deserializes as JSON null.
            let text = if raw.text.trim().is_empty() { "null" } else { raw.text.as_str() };
            let data = serde_json::from_str::<T>(text)?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: raw.status.as_u16(),
                success: true,
                headers: raw.headers,
            })
        } else {
            Ok(ApiResponse {
                data: None,
                error_body: Some(raw.text),
                status: raw.status.as_u16(),
                success: false,
                headers: raw.headers,
            })
        }
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        identity: &RequestIdentity,
        body: RequestBody,
        attempts: Attempts,
    ) -> Result<RawResponse, TransportError> {
        // 1. Construct the full absolute URL
        let full_url = Url::parse(&format!("{}{}", self.base_url, path))?;
        log::debug!("{} {}", method, full_url);

        // 2. Identifying headers
        let client = match attempts {
            Attempts::Retrying => &self.inner,
            Attempts::Once => &self.once,
        };
        let req = client
            .request(method, full_url)
            .headers(Self::identity_headers(identity)?)
            .header(ACCEPT, "application/json");

        // 3. Encoded body
        let req = match body {
            RequestBody::Form(encoded) => req
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded),
            RequestBody::Json(json) => req.header(CONTENT_TYPE, "application/json").body(json),
        };

        // 4. Execute and capture response metadata
        let response = req.send().await.map_err(|e| match e {
            reqwest_middleware::Error::Reqwest(inner) if inner.is_timeout() => {
                TransportError::Timeout(self.timeout)
            }
            other => TransportError::Middleware(other),
        })?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await?;
        log::debug!("{} <- {}", status, path);

        Ok(RawResponse {
            status,
            headers,
            text,
        })
    }
}

fn encode_form(fields: &[(&str, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish()
}
