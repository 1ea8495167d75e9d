use crate::transport::ResponseHead;

/// Response metadata handed to every request callback after the first
/// response byte.
///
/// Each callback gets a snapshot: `received_byte_count` in an earlier
/// snapshot is not updated by later reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlResponseInfo {
    url_chain: Vec<String>,
    http_status_code: u16,
    http_status_text: String,
    headers: Vec<(String, String)>,
    was_cached: bool,
    negotiated_protocol: String,
    proxy_server: String,
    received_byte_count: u64,
}

impl UrlResponseInfo {
    pub(crate) fn from_head(url_chain: Vec<String>, head: &ResponseHead, received: u64) -> Self {
        let headers = head
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self {
            url_chain,
            http_status_code: head.status.as_u16(),
            http_status_text: head.status_text.clone(),
            headers,
            was_cached: head.was_cached,
            negotiated_protocol: head.negotiated_protocol.clone(),
            proxy_server: ":0".to_string(),
            received_byte_count: received,
        }
    }

    pub(crate) fn set_received_byte_count(&mut self, received: u64) {
        self.received_byte_count = received;
    }

    /// The URL this response came from: the last entry of the chain.
    pub fn url(&self) -> &str {
        self.url_chain.last().map(String::as_str).unwrap_or_default()
    }

    /// The original URL followed by every redirect target, up to and
    /// including this response's URL.
    pub fn url_chain(&self) -> &[String] {
        &self.url_chain
    }

    pub fn http_status_code(&self) -> u16 {
        self.http_status_code
    }

    pub fn http_status_text(&self) -> &str {
        &self.http_status_text
    }

    /// Headers in the order received, repeated names kept.
    pub fn all_headers_as_list(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of the header `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn was_cached(&self) -> bool {
        self.was_cached
    }

    pub fn negotiated_protocol(&self) -> &str {
        &self.negotiated_protocol
    }

    pub fn proxy_server(&self) -> &str {
        &self.proxy_server
    }

    /// Body bytes received so far.
    pub fn received_byte_count(&self) -> u64 {
        self.received_byte_count
    }
}
