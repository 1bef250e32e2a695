//! Request building and the one-shot / long-poll entry points.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use futures::future::BoxFuture;
use hyper::header::{
    HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, HOST, TRANSFER_ENCODING, USER_AGENT,
};
use hyper::{Body, Method, Request};
use tracing::{debug, error, warn};

use crate::token::TokenState;
use crate::transport::{HttpTransport, HyperTransport, TransportError, TransportResult, WireResponse};

/// Default `User-Agent` presented to the manager.
pub const DEFAULT_USER_AGENT: &str = concat!("warden-agent/", env!("CARGO_PKG_VERSION"));

/// Produces the next request body; awaited at the top of every loop
/// iteration.
pub type MessageGetter = Box<dyn FnMut() -> BoxFuture<'static, String> + Send>;

/// Invoked with the response body of every 200 reply.
pub type SuccessHandler = Box<dyn FnMut(String) -> BoxFuture<'static, ()> + Send>;

/// Invoked on 401/403 replies.
pub type UnauthorizedHandler = Arc<dyn Fn() + Send + Sync>;

/// Keeps the loop alive while it returns `true`.
pub type LoopCondition = Box<dyn Fn() -> bool + Send + Sync>;

/// Everything needed to build one HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequestParams {
    method: Method,
    host: String,
    port: u16,
    endpoint: String,
    use_https: bool,
    user_agent: String,
    bearer: String,
    basic_auth: String,
    body: String,
}

impl HttpRequestParams {
    /// Creates parameters for `method host:port endpoint`.
    #[must_use]
    pub fn new(method: Method, host: impl Into<String>, port: u16, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            port,
            endpoint: endpoint.into(),
            use_https: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            bearer: String::new(),
            basic_auth: String::new(),
            body: String::new(),
        }
    }

    /// Selects HTTPS (the default) or plain TCP.
    #[must_use]
    pub fn with_https(mut self, use_https: bool) -> Self {
        self.use_https = use_https;
        self
    }

    /// Overrides the `User-Agent` header.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Presents a bearer token.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = token.into();
        self
    }

    /// Presents pre-encoded Basic credentials (overrides any bearer).
    #[must_use]
    pub fn with_basic_auth(mut self, encoded: impl Into<String>) -> Self {
        self.basic_auth = encoded.into();
        self
    }

    /// Attaches a request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the target endpoint path.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.endpoint)
    }

    /// Builds the `hyper` request: HTTP/1.1 with `Host`, `User-Agent` and
    /// `Accept` always set, bearer or basic authorization depending on
    /// which credential is populated, and chunked JSON for non-empty
    /// bodies.
    pub(crate) fn build_request(&self) -> TransportResult<Request<Body>> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.url())
            .header(HOST, &self.host)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, HeaderValue::from_static("application/json"));

        if !self.bearer.is_empty() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", self.bearer));
        }

        if !self.basic_auth.is_empty() {
            builder = builder.header(AUTHORIZATION, format!("Basic {}", self.basic_auth));
        }

        let body = if self.body.is_empty() {
            Body::empty()
        } else {
            builder = builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .header(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Body::from(self.body.clone())
        };

        builder
            .body(body)
            .map_err(|err| TransportError::invalid_request(err.to_string()))
    }
}

/// Long-poll / batching loop inputs shared by all three communicator loops.
pub struct LoopRequest {
    /// Request template; the body and bearer are refreshed per iteration.
    pub params: HttpRequestParams,
    /// Shared token; re-read on every iteration so rotations are seen
    /// immediately.
    pub token: Arc<TokenState>,
    /// Sleep applied after connect failures and 401/403 replies.
    pub retry: Duration,
    /// Sleep applied between successful iterations.
    pub batching_interval: Duration,
}

/// HTTP client shared by the communicator and the enrolment flow.
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
}

impl HttpClient {
    /// Creates a client over the supplied transport.
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Creates a client over the production TCP/TLS transport.
    #[must_use]
    pub fn with_default_transport() -> Self {
        Self::new(Arc::new(HyperTransport::new()))
    }

    /// Performs a single request.
    ///
    /// This never fails: any transport error is folded into a synthesized
    /// 500 response whose body carries the error text.
    pub async fn perform(&self, params: &HttpRequestParams) -> WireResponse {
        let request = match params.build_request() {
            Ok(request) => request,
            Err(err) => return synthesized_error(&err),
        };

        match self.transport.send(request).await {
            Ok(response) => {
                debug!(status = response.status, endpoint = params.endpoint(), "response received");
                response
            }
            Err(err) => {
                debug!(endpoint = params.endpoint(), %err, "request failed");
                synthesized_error(&err)
            }
        }
    }

    /// Drives the long-poll / batching loop.
    ///
    /// Each iteration awaits `message_getter` for the body (empty without
    /// one), re-reads the bearer, performs the exchange, then sleeps
    /// `batching_interval` — or `retry` after a connect failure or an
    /// unauthorized reply; write/read failures loop again immediately.
    /// Without a `loop_condition` the loop is single shot.
    pub async fn perform_loop(
        &self,
        request: LoopRequest,
        mut message_getter: Option<MessageGetter>,
        on_unauthorized: Option<UnauthorizedHandler>,
        mut on_success: Option<SuccessHandler>,
        loop_condition: Option<LoopCondition>,
    ) {
        let LoopRequest {
            params,
            token,
            retry,
            batching_interval,
        } = request;

        loop {
            let mut delay = Some(batching_interval);

            let body = match message_getter.as_mut() {
                Some(getter) => getter().await,
                None => String::new(),
            };
            let iteration = params
                .clone()
                .with_body(body)
                .with_bearer(token.bearer().as_str());

            match iteration.build_request() {
                Err(err) => {
                    error!(endpoint = params.endpoint(), %err, "could not build request");
                    delay = Some(retry);
                }
                Ok(built) => match self.transport.send(built).await {
                    Err(TransportError::Connect { reason }) => {
                        warn!(
                            endpoint = params.endpoint(),
                            %reason,
                            retry_in_secs = retry.as_secs(),
                            "failed to send http request, retrying"
                        );
                        delay = Some(retry);
                    }
                    Err(err) => {
                        error!(endpoint = params.endpoint(), %err, "request exchange failed");
                        delay = None;
                    }
                    Ok(response) if response.is_ok() => {
                        if let Some(handler) = on_success.as_mut() {
                            handler(response.body_string()).await;
                        }
                    }
                    Ok(response) if response.is_unauthorized() => {
                        if let Some(handler) = &on_unauthorized {
                            handler();
                        }
                        delay = Some(retry);
                    }
                    Ok(response) => {
                        debug!(
                            endpoint = params.endpoint(),
                            status = response.status,
                            "unexpected response status"
                        );
                    }
                },
            }

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if !loop_condition.as_ref().is_some_and(|condition| condition()) {
                break;
            }
        }
    }

    /// Authenticates with the enrolment uuid/key pair.
    ///
    /// Returns the issued token, or `None` on any failure (logged).
    pub async fn authenticate_with_uuid_and_key(
        &self,
        host: &str,
        port: u16,
        use_https: bool,
        user_agent: &str,
        uuid: &str,
        key: &str,
    ) -> Option<String> {
        let body = serde_json::json!({ "uuid": uuid, "key": key }).to_string();
        let params = HttpRequestParams::new(Method::POST, host, port, "/api/v1/authentication")
            .with_https(use_https)
            .with_user_agent(user_agent)
            .with_body(body);

        let response = self.perform(&params).await;
        if !response.is_ok() {
            debug!(status = response.status, "authentication rejected");
            return None;
        }

        parse_token_field(&response, &["token"])
    }

    /// Authenticates a management user with Basic credentials.
    ///
    /// Returns the issued token, or `None` on any failure (logged).
    pub async fn authenticate_with_user_password(
        &self,
        host: &str,
        port: u16,
        use_https: bool,
        user_agent: &str,
        user: &str,
        password: &str,
    ) -> Option<String> {
        let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
        let params = HttpRequestParams::new(Method::POST, host, port, "/security/user/authenticate")
            .with_https(use_https)
            .with_user_agent(user_agent)
            .with_basic_auth(encoded);

        let response = self.perform(&params).await;
        if !response.is_ok() {
            debug!(status = response.status, "authentication rejected");
            return None;
        }

        parse_token_field(&response, &["data", "token"])
    }

    /// Performs a request, streaming the response body to `dst_path`.
    ///
    /// Like [`perform`](Self::perform), transport errors fold into a
    /// synthesized 500 response.
    pub async fn download(&self, params: &HttpRequestParams, dst_path: &Path) -> WireResponse {
        let request = match params.build_request() {
            Ok(request) => request,
            Err(err) => return synthesized_error(&err),
        };

        match self.transport.send_to_file(request, dst_path).await {
            Ok(response) => response,
            Err(err) => {
                error!(endpoint = params.endpoint(), %err, "download failed");
                synthesized_error(&err)
            }
        }
    }
}

fn synthesized_error(err: &TransportError) -> WireResponse {
    WireResponse::new(500, format!("Internal server error: {err}"))
}

fn parse_token_field(response: &WireResponse, path: &[&str]) -> Option<String> {
    let parsed: serde_json::Value = match serde_json::from_slice(&response.body) {
        Ok(value) => value,
        Err(err) => {
            error!(%err, "error parsing token in response");
            return None;
        }
    };

    let mut node = &parsed;
    for key in path {
        node = node.get(key)?;
    }
    node.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn builds_headers_for_bearer_and_body() {
        let params = HttpRequestParams::new(Method::POST, "manager.local", 27000, "/stateful")
            .with_bearer("jwt1")
            .with_body(r#"{"x":1}"#);

        let request = params.build_request().unwrap();
        let headers = request.headers();

        assert_eq!(request.uri(), "https://manager.local:27000/stateful");
        assert_eq!(headers.get(HOST).unwrap(), "manager.local");
        assert_eq!(headers.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer jwt1");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get(TRANSFER_ENCODING).unwrap(), "chunked");
    }

    #[test]
    fn basic_credentials_override_bearer() {
        let params = HttpRequestParams::new(Method::POST, "manager.local", 55000, "/security/user/authenticate")
            .with_bearer("jwt1")
            .with_basic_auth("dXNlcjpwdw==");

        let request = params.build_request().unwrap();
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Basic dXNlcjpwdw=="
        );
        // No body: no content headers either.
        assert!(request.headers().get(CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn perform_never_fails() {
        let transport = FakeTransport::new(|_| Err(TransportError::connect("refused")));
        let client = HttpClient::new(transport);

        let params = HttpRequestParams::new(Method::GET, "manager.local", 27000, "/commands");
        let response = client.perform(&params).await;

        assert_eq!(response.status, 500);
        assert!(response.body_string().contains("refused"));
    }

    #[tokio::test]
    async fn loop_runs_while_condition_holds() {
        let transport = FakeTransport::new(|_| Ok(WireResponse::new(200, "{}")));
        let client = HttpClient::new(transport.clone());

        let successes = Arc::new(AtomicUsize::new(0));
        let remaining = Arc::new(AtomicUsize::new(2));

        let on_success: SuccessHandler = {
            let successes = Arc::clone(&successes);
            Box::new(move |_body| {
                successes.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            })
        };
        let condition: LoopCondition = {
            let remaining = Arc::clone(&remaining);
            Box::new(move || remaining.fetch_sub(1, Ordering::SeqCst) > 1)
        };

        let token = Arc::new(TokenState::new());
        token.store("jwt1".to_owned(), i64::MAX);

        client
            .perform_loop(
                LoopRequest {
                    params: HttpRequestParams::new(Method::GET, "manager.local", 27000, "/commands"),
                    token,
                    retry: Duration::ZERO,
                    batching_interval: Duration::ZERO,
                },
                None,
                None,
                Some(on_success),
                Some(condition),
            )
            .await;

        assert_eq!(successes.load(Ordering::SeqCst), 2);
        let captured = transport.requests();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].authorization.as_deref(), Some("Bearer jwt1"));
    }

    #[tokio::test]
    async fn unauthorized_reply_invokes_handler() {
        let transport = FakeTransport::new(|_| Ok(WireResponse::new(401, "")));
        let client = HttpClient::new(transport);

        let refreshes = Arc::new(AtomicUsize::new(0));
        let on_unauthorized: UnauthorizedHandler = {
            let refreshes = Arc::clone(&refreshes);
            Arc::new(move || {
                refreshes.fetch_add(1, Ordering::SeqCst);
            })
        };

        client
            .perform_loop(
                LoopRequest {
                    params: HttpRequestParams::new(Method::POST, "manager.local", 27000, "/stateless"),
                    token: Arc::new(TokenState::new()),
                    retry: Duration::ZERO,
                    batching_interval: Duration::ZERO,
                },
                None,
                Some(on_unauthorized),
                None,
                None,
            )
            .await;

        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extracts_tokens_from_both_auth_shapes() {
        let transport = FakeTransport::new(|request| {
            if request.uri.ends_with("/api/v1/authentication") {
                Ok(WireResponse::new(200, r#"{"token":"jwt-uuid"}"#))
            } else {
                Ok(WireResponse::new(200, r#"{"data":{"token":"jwt-user"}}"#))
            }
        });
        let client = HttpClient::new(transport.clone());

        let token = client
            .authenticate_with_uuid_and_key("manager.local", 27000, false, DEFAULT_USER_AGENT, "u-1", "k-1")
            .await;
        assert_eq!(token.as_deref(), Some("jwt-uuid"));

        let token = client
            .authenticate_with_user_password("manager.local", 55000, false, DEFAULT_USER_AGENT, "admin", "pw")
            .await;
        assert_eq!(token.as_deref(), Some("jwt-user"));

        let captured = transport.requests();
        assert_eq!(captured[0].body, r#"{"key":"k-1","uuid":"u-1"}"#);
        assert!(captured[1]
            .authorization
            .as_deref()
            .is_some_and(|auth| auth.starts_with("Basic ")));
    }
}
