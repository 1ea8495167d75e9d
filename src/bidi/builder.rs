use super::callback::BidirectionalStreamCallback;
use super::stream::BidirectionalStream;
use crate::base::neterror::NetError;
use crate::engine::Engine;
use crate::executor::Executor;
use crate::urlrequest::{validate_parts, ValidatedRequest};
use http::Method;
use std::sync::Arc;

/// Builds a [`BidirectionalStream`]. Validation happens in
/// [`BidirectionalStream::start`].
pub struct BidirectionalStreamBuilder {
    engine: Engine,
    callback: Box<dyn BidirectionalStreamCallback>,
    executor: Arc<dyn Executor>,
    params: StreamParams,
}

pub(crate) struct StreamParams {
    pub(crate) url: String,
    pub(crate) method: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) delay_headers_until_flush: bool,
    pub(crate) allow_direct_executor: bool,
}

impl BidirectionalStreamBuilder {
    pub(crate) fn new(
        engine: Engine,
        url: impl Into<String>,
        callback: Box<dyn BidirectionalStreamCallback>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            engine,
            callback,
            executor,
            params: StreamParams {
                url: url.into(),
                method: None,
                headers: Vec::new(),
                delay_headers_until_flush: false,
                allow_direct_executor: false,
            },
        }
    }

    /// Defaults to `POST`. `GET` and `HEAD` streams cannot write.
    pub fn http_method(mut self, method: impl Into<String>) -> Self {
        self.params.method = Some(method.into());
        self
    }

    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.headers.push((name.into(), value.into()));
        self
    }

    /// Hold the request headers back and send them together with the first
    /// flushed write.
    pub fn delay_request_headers_until_flush(mut self, delay: bool) -> Self {
        self.params.delay_headers_until_flush = delay;
        self
    }

    pub fn allow_direct_executor(mut self) -> Self {
        self.params.allow_direct_executor = true;
        self
    }

    pub fn build(self) -> BidirectionalStream {
        BidirectionalStream::new(self.engine, self.callback, self.executor, self.params)
    }
}

impl StreamParams {
    pub(crate) fn validate(&self) -> Result<ValidatedRequest, NetError> {
        validate_parts(
            &self.url,
            self.method.as_deref(),
            Method::POST,
            &self.headers,
        )
    }
}
