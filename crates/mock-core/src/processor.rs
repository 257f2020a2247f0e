use std::future::Future;

use crate::{MockRequest, MockResponse};

/// The matching layer: turns a decoded request into a response plus optional socket directives.
pub trait RequestProcessor: Send + Sync + 'static {
    fn process(&self, request: MockRequest) -> impl Future<Output = MockResponse> + Send;
}

/// Answers every request with an empty `404 Not Found`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFoundProcessor;

impl RequestProcessor for NotFoundProcessor {
    async fn process(&self, request: MockRequest) -> MockResponse {
        tracing::debug!(
            method = %request.method,
            target = %request.target,
            "no expectation matched"
        );
        MockResponse::not_found()
    }
}
