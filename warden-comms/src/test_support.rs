//! Scripted transport doubles shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hyper::header::AUTHORIZATION;
use hyper::{Body, Request};

use crate::transport::{HttpTransport, TransportResult, WireResponse};

/// One request as seen by the fake transport.
#[derive(Debug, Clone)]
pub(crate) struct CapturedRequest {
    pub method: String,
    pub uri: String,
    pub authorization: Option<String>,
    pub body: String,
}

type Responder = dyn Fn(&CapturedRequest) -> TransportResult<WireResponse> + Send + Sync;

/// Transport double that records every request and answers via a closure.
pub(crate) struct FakeTransport {
    requests: Mutex<Vec<CapturedRequest>>,
    responder: Box<Responder>,
}

impl FakeTransport {
    pub(crate) fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&CapturedRequest) -> TransportResult<WireResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    pub(crate) fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_to(&self, endpoint: &str) -> Vec<CapturedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.uri.ends_with(endpoint))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: Request<Body>) -> TransportResult<WireResponse> {
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body_bytes = hyper::body::to_bytes(request.into_body())
            .await
            .expect("test body is readable");

        let captured = CapturedRequest {
            method,
            uri,
            authorization,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        };
        self.requests.lock().unwrap().push(captured.clone());

        (self.responder)(&captured)
    }
}
