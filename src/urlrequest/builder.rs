use super::callback::UrlRequestCallback;
use super::request::UrlRequest;
use crate::base::neterror::NetError;
use crate::engine::Engine;
use crate::executor::Executor;
use crate::upload::UploadDataProvider;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::Method;
use std::sync::Arc;
use url::Url;

/// Builds a [`UrlRequest`]. Nothing is validated until
/// [`UrlRequest::start`].
pub struct UrlRequestBuilder {
    engine: Engine,
    url: String,
    callback: Box<dyn UrlRequestCallback>,
    executor: Arc<dyn Executor>,
    params: RequestParams,
}

/// What the application asked for, kept raw until `start()`.
pub(crate) struct RequestParams {
    pub(crate) url: String,
    pub(crate) method: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) upload: Option<UploadParams>,
    pub(crate) allow_direct_executor: bool,
}

pub(crate) struct UploadParams {
    pub(crate) provider: Box<dyn UploadDataProvider>,
    pub(crate) executor: Arc<dyn Executor>,
}

/// `RequestParams` after validation.
pub(crate) struct ValidatedRequest {
    pub(crate) url: Url,
    pub(crate) method: Method,
    pub(crate) headers: HeaderMap,
}

impl UrlRequestBuilder {
    pub(crate) fn new(
        engine: Engine,
        url: impl Into<String>,
        callback: Box<dyn UrlRequestCallback>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let url = url.into();
        Self {
            engine,
            url: url.clone(),
            callback,
            executor,
            params: RequestParams {
                url,
                method: None,
                headers: Vec::new(),
                upload: None,
                allow_direct_executor: false,
            },
        }
    }

    /// Defaults to `GET`, or `POST` once an upload provider is set.
    pub fn http_method(mut self, method: impl Into<String>) -> Self {
        self.params.method = Some(method.into());
        self
    }

    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a request body. Provider calls run on `executor`.
    ///
    /// The request must also carry a `Content-Type` header.
    pub fn upload_data_provider(
        mut self,
        provider: Box<dyn UploadDataProvider>,
        executor: impl Executor,
    ) -> Self {
        self.params.upload = Some(UploadParams {
            provider,
            executor: Arc::new(executor),
        });
        self
    }

    /// Permit executors that run tasks inline on the posting thread, for
    /// both callbacks and upload provider calls.
    pub fn allow_direct_executor(mut self) -> Self {
        self.params.allow_direct_executor = true;
        self
    }

    pub fn build(self) -> UrlRequest {
        UrlRequest::new(self.engine, self.callback, self.executor, self.params)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RequestParams {
    /// Check everything a malformed request could get wrong. Leaves the
    /// params untouched so a failed `start()` can be retried.
    pub(crate) fn validate(&self) -> Result<ValidatedRequest, NetError> {
        let default_method = if self.upload.is_some() {
            Method::POST
        } else {
            Method::GET
        };
        let validated = validate_parts(
            &self.url,
            self.method.as_deref(),
            default_method,
            &self.headers,
        )?;

        if self.upload.is_some() && !validated.headers.contains_key(CONTENT_TYPE) {
            return Err(NetError::invalid_argument(
                "Requests with upload data must have a Content-Type.",
            ));
        }
        Ok(validated)
    }
}

/// Parse the URL, method and headers of a request or stream.
pub(crate) fn validate_parts(
    url: &str,
    method: Option<&str>,
    default_method: Method,
    headers: &[(String, String)],
) -> Result<ValidatedRequest, NetError> {
    let url =
        Url::parse(url).map_err(|_| NetError::invalid_argument(format!("Invalid URL {}", url)))?;

    let method = match method {
        Some(method) => Method::from_bytes(method.as_bytes())
            .map_err(|_| NetError::invalid_argument(format!("Invalid http method {}", method)))?,
        None => default_method,
    };

    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let invalid =
            || NetError::invalid_argument(format!("Invalid header with headername: {}", name));
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        map.append(header_name, header_value);
    }

    Ok(ValidatedRequest {
        url,
        method,
        headers: map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadDataProviders;

    fn params(url: &str) -> RequestParams {
        RequestParams {
            url: url.to_string(),
            method: None,
            headers: Vec::new(),
            upload: None,
            allow_direct_executor: false,
        }
    }

    fn upload() -> Option<UploadParams> {
        Some(UploadParams {
            provider: UploadDataProviders::from_bytes("body"),
            executor: Arc::new(crate::executor::DirectExecutor),
        })
    }

    #[test]
    fn test_default_method_follows_upload() {
        let p = params("http://example.com/");
        assert_eq!(p.validate().unwrap().method, Method::GET);

        let mut p = params("http://example.com/");
        p.upload = upload();
        p.headers.push(("Content-Type".into(), "text/plain".into()));
        assert_eq!(p.validate().unwrap().method, Method::POST);
    }

    #[test]
    fn test_bad_method() {
        let mut p = params("http://example.com/");
        p.method = Some("bad:method!".into());
        let err = p.validate().err().unwrap();
        assert_eq!(err.to_string(), "Invalid http method bad:method!");
    }

    #[test]
    fn test_bad_header_name_and_value() {
        let mut p = params("http://example.com/");
        p.headers.push(("header:name".into(), "headervalue".into()));
        let err = p.validate().err().unwrap();
        assert_eq!(err.to_string(), "Invalid header with headername: header:name");

        let mut p = params("http://example.com/");
        p.headers.push(("headername".into(), "bad header\r\nvalue".into()));
        let err = p.validate().err().unwrap();
        assert_eq!(err.to_string(), "Invalid header with headername: headername");
    }

    #[test]
    fn test_upload_needs_content_type() {
        let mut p = params("http://example.com/");
        p.upload = upload();
        let err = p.validate().err().unwrap();
        assert!(err.is_usage_error());
        assert_eq!(
            err.to_string(),
            "Requests with upload data must have a Content-Type."
        );
    }

    #[test]
    fn test_bad_url() {
        let err = params("not a url").validate().err().unwrap();
        assert!(matches!(err, NetError::InvalidArgument(_)));
    }
}
