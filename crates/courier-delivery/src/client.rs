//! HTTP client that replays payloads to their endpoints.
//!
//! Handles request construction, per-request timeouts, and error
//! categorization so the worker can decide between ack and retry.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use courier_core::Payload;
use reqwest::Response;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Upper bound on response body bytes kept for logging.
const MAX_LOGGED_BODY: usize = 1024;

/// Configuration for the replay client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time allowed to establish a connection, independent of the payload's
    /// request timeout.
    pub connect_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
        }
    }
}

/// HTTP client shared by all workers of a pool.
///
/// `reqwest::Client` pools connections internally, so one instance serves
/// every endpoint. Non-2xx responses are returned as responses rather than
/// errors; [`DeliveryResponse::into_result`] converts them.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
}

/// One HTTP replay.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Destination URL.
    pub url: String,
    /// Headers from the payload.
    pub headers: BTreeMap<String, String>,
    /// Request body, already base64-decoded when the payload asked for it.
    pub body: Bytes,
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Failed attempts before this one.
    pub attempt_number: i64,
}

impl DeliveryRequest {
    /// Builds the request a payload describes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` if the content cannot be decoded.
    pub fn from_payload(payload: &Payload, attempt_number: i64) -> Result<Self> {
        Ok(Self {
            url: payload.endpoint.clone(),
            headers: payload.headers.clone(),
            body: payload.body()?,
            timeout: payload.timeout(),
            attempt_number,
        })
    }
}

/// Response from one replay.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated for logging.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Turns a non-2xx response into the matching error.
    ///
    /// # Errors
    ///
    /// Returns `ClientError`, `ServerError` or `UnexpectedStatus` for
    /// anything outside 200..=299.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success {
            Ok(self)
        } else {
            Err(DeliveryError::http_status(self.status_code, self.body))
        }
    }
}

impl DeliveryClient {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client })
    }

    /// Creates a client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&ClientConfig::default())
    }

    /// POSTs the request body to its URL with its headers attached.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the request exceeds its timeout and
    /// `NetworkError` for any other transport failure. HTTP error statuses
    /// are not errors here.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "replay",
            url = %request.url,
            attempt = request.attempt_number,
            timeout_s = request.timeout.as_secs()
        );

        async move {
            debug!("starting replay");

            let mut http_request =
                self.client.post(&request.url).timeout(request.timeout).body(request.body);

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(duration_ms = start_time.elapsed().as_millis(), error = %e, "request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(request.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let response = parse_response(response, start_time.elapsed()).await;

            match response.status_code {
                200..=299 => debug!(status = response.status_code, "replay accepted"),
                400..=499 => warn!(status = response.status_code, "client error response"),
                500..=599 => warn!(status = response.status_code, "server error response"),
                _ => warn!(status = response.status_code, "unexpected status code"),
            }

            Ok(response)
        }
        .instrument(span)
        .await
    }
}

async fn parse_response(response: Response, duration: Duration) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_LOGGED_BODY => {
            let truncated = String::from_utf8_lossy(&bytes[..MAX_LOGGED_BODY]);
            format!("{truncated}... (truncated)")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "failed to read response body");
            String::new()
        },
    };

    DeliveryResponse { status_code, body, duration, is_success }
}

/// Hop-by-hop and transport headers the client computes itself.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn create_test_request(url: String) -> DeliveryRequest {
        let mut headers = BTreeMap::new();
        headers.insert("X-Original-Header".to_string(), "test-value".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        DeliveryRequest {
            url,
            headers,
            body: Bytes::from("test payload"),
            timeout: Duration::from_secs(5),
            attempt_number: 0,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("X-Original-Header", "test-value"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::body_string("test payload"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/hook", mock_server.uri()));

        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
        assert!(response.into_result().is_ok());
    }

    #[tokio::test]
    async fn client_error_is_a_response() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/hook", mock_server.uri()));

        let response = client.deliver(request).await.unwrap();
        assert_eq!(response.status_code, 404);
        assert!(!response.is_success);
        assert!(matches!(
            response.into_result(),
            Err(DeliveryError::ClientError { status_code: 404, .. })
        ));
    }

    #[tokio::test]
    async fn server_error_is_a_response() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Unavailable"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request(format!("{}/hook", mock_server.uri()));

        let error = client.deliver(request).await.unwrap().into_result().unwrap_err();
        assert!(matches!(error, DeliveryError::ServerError { status_code: 503, .. }));
    }

    #[tokio::test]
    async fn request_timeout_handling() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let mut request = create_test_request(format!("{}/hook", mock_server.uri()));
        request.timeout = Duration::from_secs(1);

        let error = client.deliver(request).await.unwrap_err();
        assert!(matches!(error, DeliveryError::Timeout { timeout_seconds: 1 }));
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let client = DeliveryClient::with_defaults().unwrap();
        let request = create_test_request("http://127.0.0.1:1/hook".to_string());

        let error = client.deliver(request).await.unwrap_err();
        assert!(matches!(error, DeliveryError::NetworkError { .. }));
    }

    #[test]
    fn request_from_payload_decodes_base64() {
        let mut payload = Payload::new("http://example.com/hook");
        payload.content = "aGk=".to_string();
        payload.base64_decode = true;
        payload.timeout = 7;

        let request = DeliveryRequest::from_payload(&payload, 2).unwrap();

        assert_eq!(request.body, Bytes::from_static(b"hi"));
        assert_eq!(request.timeout, Duration::from_secs(7));
        assert_eq!(request.attempt_number, 2);
    }

    #[test]
    fn managed_headers_filtered() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("host"));
        assert!(is_managed_header("Transfer-Encoding"));
        assert!(!is_managed_header("Content-Type"));
        assert!(!is_managed_header("Authorization"));
    }
}
