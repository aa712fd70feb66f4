use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use url::Url;

pub const AUTHORIZATION: &str = "Authorization";

/// Body of a streaming response, chunked as it arrives on the wire.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> Method {
        match self {
            Self::Get => Method::GET,
            Self::Post => Method::POST,
            Self::Patch => Method::PATCH,
            Self::Delete => Method::DELETE,
        }
    }
}

/// A replayable description of one HTTP call, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Patch, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Token carried in the `Authorization: Bearer` header, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.header(AUTHORIZATION)
            .and_then(|value| value.strip_prefix("Bearer "))
    }

    pub fn set_bearer(&mut self, token: &str) {
        self.clear_bearer();
        self.headers
            .push((AUTHORIZATION.to_string(), format!("Bearer {token}")));
    }

    pub fn clear_bearer(&mut self) {
        self.headers
            .retain(|(key, _)| !key.eq_ignore_ascii_case(AUTHORIZATION));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body)
    }
}

pub struct StreamingResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid base url `{0}`")]
    InvalidUrl(String),
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Self::Body(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// The wire boundary used by the refresh coordinator.
///
/// Implementations report HTTP error statuses as ordinary responses; only
/// failures to exchange bytes at all are `TransportError`s.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;

    async fn open_stream(&self, request: &ApiRequest)
        -> Result<StreamingResponse, TransportError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let base_url =
            Url::parse(base_url).map_err(|_| TransportError::InvalidUrl(base_url.to_string()))?;
        // Only `execute` gets the overall timeout; reply streams stay open while the server writes.
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let url = format!(
            "{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            request.path
        );
        let mut builder = self.client.request(request.method.as_reqwest(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let response = self
            .build(request)
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let bytes = response.bytes().await?;
        Ok(ApiResponse {
            status,
            headers,
            body: decode_body(&bytes),
        })
    }

    async fn open_stream(
        &self,
        request: &ApiRequest,
    ) -> Result<StreamingResponse, TransportError> {
        let response = self
            .build(request)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes_stream().map_err(TransportError::from).boxed();
        Ok(StreamingResponse { status, body })
    }
}

fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Interpret a response body as JSON, keeping non-JSON text as a string value.
pub fn decode_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Drain a streaming body that turned out to be an error response.
pub async fn collect_body(mut body: ByteStream) -> Value {
    let mut buffer = Vec::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => buffer.extend_from_slice(&bytes),
            Err(err) => {
                tracing::debug!(error = %err, "error body truncated");
                break;
            }
        }
    }
    decode_body(&buffer)
}

/// Human-readable message out of a server error payload.
pub fn payload_message(payload: &Value) -> String {
    match payload {
        Value::Null => "no details".to_string(),
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("detail"))
            .map(payload_message)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

/// The server's standard response wrapper: `{status, data, message, timestamp, ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub status: Option<u16>,
    pub data: T,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<T> Envelope<T> {
    pub fn message_text(&self) -> String {
        payload_message(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn bearer_header_is_replaced_not_duplicated() {
        let mut request = ApiRequest::get("/chat/session/");
        request.set_bearer("old");
        request.set_bearer("new");
        assert_eq!(request.bearer(), Some("new"));
        assert_eq!(
            request
                .headers
                .iter()
                .filter(|(key, _)| key == AUTHORIZATION)
                .count(),
            1
        );
        request.clear_bearer();
        assert_eq!(request.bearer(), None);
    }

    #[test]
    fn payload_message_prefers_message_then_detail() {
        assert_eq!(
            payload_message(&json!({"message": "用户名或密码错误", "status": 400})),
            "用户名或密码错误"
        );
        assert_eq!(
            payload_message(&json!({"detail": "Token is invalid"})),
            "Token is invalid"
        );
        assert_eq!(payload_message(&Value::Null), "no details");
    }

    #[test]
    fn non_json_bodies_are_kept_as_text() {
        assert_eq!(decode_body(b""), Value::Null);
        assert_eq!(decode_body(b"{\"a\":1}"), json!({"a": 1}));
        assert_eq!(
            decode_body(b"<html>Bad Gateway</html>"),
            Value::String("<html>Bad Gateway</html>".into())
        );
    }

    #[test]
    fn envelope_keeps_extra_fields() {
        let envelope: Envelope<Value> = serde_json::from_value(json!({
            "status": 200,
            "data": {"id": 3},
            "message": "登录成功",
            "timestamp": "2025-05-01 10:00:00",
            "access": "a1",
        }))
        .expect("envelope");
        assert_eq!(envelope.status, Some(200));
        assert_eq!(envelope.message_text(), "登录成功");
        assert_eq!(envelope.extra.get("access"), Some(&json!("a1")));
    }

    #[tokio::test]
    async fn reqwest_transport_sends_query_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/message/"))
            .and(query_param("session_id", "7"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({"content": "hi"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": 1}})))
            .mount(&server)
            .await;

        let transport =
            ReqwestTransport::new(&server.uri(), Duration::from_secs(5)).expect("transport");
        let mut request = ApiRequest::post("/chat/message/", json!({"content": "hi"}))
            .with_query("session_id", 7);
        request.set_bearer("tok");

        let response = transport.execute(&request).await.expect("response");
        assert_eq!(response.status, 201);
        assert_eq!(response.body, json!({"data": {"id": 1}}));
    }

    #[tokio::test]
    async fn reqwest_transport_reports_error_statuses_as_responses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/query_info/"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"detail": "expired"})),
            )
            .mount(&server)
            .await;

        let transport =
            ReqwestTransport::new(&server.uri(), Duration::from_secs(5)).expect("transport");
        let response = transport
            .execute(&ApiRequest::get("/users/query_info/"))
            .await
            .expect("response");
        assert_eq!(response.status, 401);
        assert_eq!(payload_message(&response.body), "expired");
    }

    #[tokio::test]
    async fn reqwest_transport_streams_body_chunks() {
        let server = MockServer::start().await;
        let body = "data: {\"type\":\"message_start\",\"data\":{\"id\":1}}\n\n";
        Mock::given(method("POST"))
            .and(path("/chat/message/ai-response/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let transport =
            ReqwestTransport::new(&server.uri(), Duration::from_secs(5)).expect("transport");
        let response = transport
            .open_stream(&ApiRequest::post("/chat/message/ai-response/", json!({})))
            .await
            .expect("stream");
        assert_eq!(response.status, 200);
        let chunks: Vec<Bytes> = response.body.try_collect().await.expect("chunks");
        let text: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.to_vec()).collect();
        assert_eq!(String::from_utf8(text).expect("utf8"), body);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = ReqwestTransport::new("not a url", Duration::from_secs(1))
            .err()
            .expect("error");
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }
}
