//! Token lifecycle and the three manager-facing request loops.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::Method;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::client::{
    HttpClient, HttpRequestParams, LoopCondition, LoopRequest, MessageGetter, SuccessHandler,
    UnauthorizedHandler, DEFAULT_USER_AGENT,
};
use crate::token::{token_expiry, TokenState};

/// The auth task renews this long before the `exp` claim.
const TOKEN_PRE_EXPIRY: Duration = Duration::from_secs(2);
/// Sleep between authentication attempts while the manager rejects us.
const AUTH_RETRY: Duration = Duration::from_secs(1);

/// Manager endpoint and cadence settings for the communicator.
#[derive(Debug, Clone)]
pub struct CommsConfig {
    /// Manager host or address.
    pub host: String,
    /// Agent communications API port.
    pub port: u16,
    /// Whether to speak TLS.
    pub use_https: bool,
    /// `User-Agent` presented on every request.
    pub user_agent: String,
    /// Sleep after connect failures and unauthorized replies.
    pub retry_interval: Duration,
    /// Sleep between successful batch uploads.
    pub batching_interval: Duration,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 27000,
            use_https: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            retry_interval: Duration::from_secs(5),
            batching_interval: Duration::from_secs(10),
        }
    }
}

/// Authentication failures surfaced by the token task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The manager rejected the enrolment credentials.
    #[error("failed to authenticate with the manager")]
    Rejected,
    /// The issued token carried no `exp` claim and was discarded.
    #[error("token does not contain an `exp` claim")]
    MissingExpiry,
}

/// Serializes forced re-authentication so concurrent 401s from the three
/// loops collapse into a single token refresh.
struct ReauthCoordinator {
    lock: Mutex<()>,
    in_progress: AtomicBool,
    cancel: Notify,
}

impl ReauthCoordinator {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            in_progress: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }

    /// First caller cancels the expiry timer; the rest observe the flag
    /// and return. The flag stays set until the auth attempt completes.
    fn request(&self) {
        if let Ok(_guard) = self.lock.try_lock() {
            if !self.in_progress.swap(true, Ordering::SeqCst) {
                info!("forcing token refresh");
                self.cancel.notify_one();
                return;
            }
        }
        debug!("re-authentication already in progress");
    }

    fn attempt_finished(&self) {
        self.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Owns the bearer token and the long-lived request loops.
pub struct Communicator {
    http: Arc<HttpClient>,
    config: CommsConfig,
    uuid: String,
    key: String,
    token: Arc<TokenState>,
    keep_running: Arc<AtomicBool>,
    reauth: Arc<ReauthCoordinator>,
}

impl Communicator {
    /// Creates a communicator for the given manager endpoint and identity.
    #[must_use]
    pub fn new(
        http: Arc<HttpClient>,
        config: CommsConfig,
        uuid: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            config,
            uuid: uuid.into(),
            key: key.into(),
            token: Arc::new(TokenState::new()),
            keep_running: Arc::new(AtomicBool::new(true)),
            reauth: Arc::new(ReauthCoordinator::new()),
        }
    }

    /// Returns the shared token state.
    #[must_use]
    pub fn token(&self) -> Arc<TokenState> {
        Arc::clone(&self.token)
    }

    /// Returns `true` until [`stop`](Self::stop) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    /// Requests every loop to exit at its next suspension point.
    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
        // Wake the auth task out of its expiry sleep so it observes the flag.
        self.reauth.cancel.notify_one();
    }

    /// Coalesced forced re-authentication, invoked on 401/403 replies.
    pub fn try_reauthenticate(&self) {
        self.reauth.request();
    }

    async fn send_authentication_request(&self) -> Result<(), AuthError> {
        let token = self
            .http
            .authenticate_with_uuid_and_key(
                &self.config.host,
                self.config.port,
                self.config.use_https,
                &self.config.user_agent,
                &self.uuid,
                &self.key,
            )
            .await
            .ok_or_else(|| {
                warn!("failed to authenticate with the manager");
                AuthError::Rejected
            })?;

        match token_expiry(&token) {
            Some(exp) => {
                self.token.store(token, exp);
                Ok(())
            }
            None => {
                warn!("token does not contain an `exp` claim, discarding it");
                self.token.clear();
                Err(AuthError::MissingExpiry)
            }
        }
    }

    /// The auth task: authenticates, then sleeps until shortly before the
    /// token expires and authenticates again. A failed attempt retries
    /// after one second; a forced refresh cancels the sleep early (which
    /// is expected, not an error).
    pub async fn wait_for_token_expiration_and_authenticate(&self) {
        while self.is_running() {
            let delay = match self.send_authentication_request().await {
                Ok(()) => {
                    let remaining = Duration::from_secs(
                        u64::try_from(self.token.remaining_secs()).unwrap_or(0),
                    );
                    remaining.saturating_sub(TOKEN_PRE_EXPIRY)
                }
                Err(err) => {
                    warn!(%err, "authentication failed");
                    AUTH_RETRY
                }
            };
            self.reauth.attempt_finished();

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.reauth.cancel.notified() => {
                    info!("token expiration timer was canceled");
                }
            }
        }
    }

    fn loop_condition(&self) -> LoopCondition {
        let keep_running = Arc::clone(&self.keep_running);
        Box::new(move || keep_running.load(Ordering::SeqCst))
    }

    fn unauthorized_handler(&self) -> UnauthorizedHandler {
        let reauth = Arc::clone(&self.reauth);
        Arc::new(move || reauth.request())
    }

    fn loop_request(&self, method: Method, endpoint: &str, batching_interval: Duration) -> LoopRequest {
        LoopRequest {
            params: HttpRequestParams::new(method, &self.config.host, self.config.port, endpoint)
                .with_https(self.config.use_https)
                .with_user_agent(&self.config.user_agent),
            token: self.token(),
            retry: self.config.retry_interval,
            batching_interval,
        }
    }

    /// Long-polls `GET /commands`; `on_success` receives each reply body.
    ///
    /// The server holds the connection open until it has commands, so the
    /// loop turns around immediately on return.
    pub async fn get_commands_from_manager(&self, on_success: SuccessHandler) {
        let request = self.loop_request(Method::GET, "/commands", Duration::ZERO);
        self.http
            .perform_loop(
                request,
                None,
                Some(self.unauthorized_handler()),
                Some(on_success),
                Some(self.loop_condition()),
            )
            .await;
    }

    /// Drains stateful batches through `POST /stateful`.
    pub async fn stateful_message_processing_task(
        &self,
        get_messages: MessageGetter,
        on_success: SuccessHandler,
    ) {
        let request = self.loop_request(Method::POST, "/stateful", self.config.batching_interval);
        self.http
            .perform_loop(
                request,
                Some(get_messages),
                Some(self.unauthorized_handler()),
                Some(on_success),
                Some(self.loop_condition()),
            )
            .await;
    }

    /// Drains stateless batches through `POST /stateless`.
    pub async fn stateless_message_processing_task(
        &self,
        get_messages: MessageGetter,
        on_success: SuccessHandler,
    ) {
        let request = self.loop_request(Method::POST, "/stateless", self.config.batching_interval);
        self.http
            .perform_loop(
                request,
                Some(get_messages),
                Some(self.unauthorized_handler()),
                Some(on_success),
                Some(self.loop_condition()),
            )
            .await;
    }

    /// Fetches one group overlay file into `dst_path`.
    ///
    /// Returns `true` when the manager answered 200 and the file was
    /// written.
    pub async fn get_group_configuration_from_manager(
        &self,
        group: &str,
        dst_path: &Path,
    ) -> bool {
        if group.is_empty() || group.contains('/') || group.contains('\\') {
            warn!(group, "refusing to fetch group file with unsafe name");
            return false;
        }

        let endpoint = format!("/api/v1/files?file_name={group}.conf");
        let params = HttpRequestParams::new(Method::GET, &self.config.host, self.config.port, endpoint)
            .with_https(self.config.use_https)
            .with_user_agent(&self.config.user_agent)
            .with_bearer(self.token.bearer().as_str());

        let response = self.http.download(&params, dst_path).await;
        if response.is_ok() {
            true
        } else {
            warn!(group, status = response.status, "group file fetch failed");
            false
        }
    }
}
