use cronet::base::{BoxError, ByteBuffer, NetError};
use cronet::executor::ThreadExecutor;
use cronet::transport::{ScriptedTransport, Step};
use cronet::upload::{RewindSink, UploadDataProvider, UploadDataProviders, UploadDataSink, UploadError};
use cronet::urlrequest::{RequestTracker, ResponseStep};
use cronet::Engine;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn executor() -> ThreadExecutor {
    ThreadExecutor::new("upload-callbacks").unwrap()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    Length,
    Read,
    Rewind,
    /// Report a length shorter than the data.
    ShortLength,
}

/// Serves `chunks` one per read, optionally as a chunked upload.
struct TestProvider {
    chunks: Vec<&'static [u8]>,
    next: usize,
    chunked: bool,
    fault: Fault,
    rewinds: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl TestProvider {
    fn new(chunks: Vec<&'static [u8]>) -> Self {
        Self {
            chunks,
            next: 0,
            chunked: false,
            fault: Fault::None,
            rewinds: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn total(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }
}

impl UploadDataProvider for TestProvider {
    fn length(&mut self) -> Result<Option<u64>, BoxError> {
        match self.fault {
            Fault::Length => Err("length failed".into()),
            Fault::ShortLength => Ok(Some(self.total() - 1)),
            _ if self.chunked => Ok(None),
            _ => Ok(Some(self.total())),
        }
    }

    fn read(&mut self, sink: UploadDataSink, mut buffer: ByteBuffer) -> Result<(), BoxError> {
        if self.fault == Fault::Read {
            sink.on_read_error("read failed".into());
            return Ok(());
        }
        let chunk = self.chunks[self.next];
        assert!(buffer.remaining() >= chunk.len());
        buffer.put(chunk);
        self.next += 1;
        let last = self.next == self.chunks.len();
        sink.on_read_succeeded(buffer, self.chunked && last);
        Ok(())
    }

    fn rewind(&mut self, sink: RewindSink) -> Result<(), BoxError> {
        self.rewinds.fetch_add(1, Ordering::SeqCst);
        if self.fault == Fault::Rewind {
            return Err("rewind failed".into());
        }
        self.next = 0;
        sink.on_rewind_succeeded();
        Ok(())
    }

    fn close(&mut self) -> Result<(), BoxError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn upload_error(error: Option<NetError>) -> UploadError {
    match error {
        Some(NetError::Upload(e)) => e,
        other => panic!("expected an upload error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_post_bytes() {
    let transport = ScriptedTransport::ok_with_body(["created"]);
    let engine = Engine::with_transport(transport.clone()).unwrap();
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/post", tracker.clone(), executor())
        .add_header("Content-Type", "text/plain")
        .upload_data_provider(UploadDataProviders::from_bytes("test"), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(tracker.response_step(), ResponseStep::OnSucceeded);
    assert_eq!(tracker.response_as_string(), "created");
    let recorded = transport.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].method, http::Method::POST);
    assert_eq!(recorded[0].body, b"test");
    assert_eq!(recorded[0].headers["content-type"], "text/plain");
}

#[tokio::test]
async fn test_upload_requires_content_type() {
    let engine = Engine::with_transport(ScriptedTransport::ok_with_body(["x"])).unwrap();
    let request = engine
        .new_url_request_builder("http://test/post", RequestTracker::new(), executor())
        .upload_data_provider(UploadDataProviders::from_bytes("test"), executor())
        .build();

    let err = request.start().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Requests with upload data must have a Content-Type."
    );
    assert!(!request.is_done());
}

#[tokio::test]
async fn test_redirect_rewinds_upload() {
    let transport = ScriptedTransport::new(vec![
        Step::ReadBody,
        Step::Redirect {
            status: 307,
            location: "/moved".into(),
        },
        Step::ReadBody,
        Step::ok(),
        Step::data("moved"),
    ]);
    let engine = Engine::with_transport(transport.clone()).unwrap();
    let provider = TestProvider::new(vec![b"abc", b"def"]);
    let rewinds = provider.rewinds.clone();
    let closed = provider.closed.clone();
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/post", tracker.clone(), executor())
        .add_header("Content-Type", "application/octet-stream")
        .upload_data_provider(Box::new(provider), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(tracker.response_step(), ResponseStep::OnSucceeded);
    assert_eq!(rewinds.load(Ordering::SeqCst), 1);
    let recorded = transport.recorded();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].body, b"abcdef");
    assert_eq!(recorded[1].body, b"abcdef");
    assert_eq!(recorded[1].url.as_str(), "http://test/moved");

    // The provider is closed once the request is finished.
    for _ in 0..100 {
        if closed.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_chunked_upload() {
    let transport = ScriptedTransport::ok_with_body(["ok"]);
    let engine = Engine::with_transport(transport.clone()).unwrap();
    let mut provider = TestProvider::new(vec![b"one-", b"two-", b"three"]);
    provider.chunked = true;
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/chunked", tracker.clone(), executor())
        .add_header("Content-Type", "text/plain")
        .upload_data_provider(Box::new(provider), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(tracker.response_step(), ResponseStep::OnSucceeded);
    assert_eq!(transport.recorded()[0].body, b"one-two-three");
}

#[tokio::test]
async fn test_length_failure() {
    let transport = ScriptedTransport::ok_with_body(["never"]);
    let engine = Engine::with_transport(transport.clone()).unwrap();
    let mut provider = TestProvider::new(vec![b"data"]);
    provider.fault = Fault::Length;
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/post", tracker.clone(), executor())
        .add_header("Content-Type", "text/plain")
        .upload_data_provider(Box::new(provider), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(tracker.steps(), vec![ResponseStep::OnFailed]);
    let error = tracker.error();
    assert_eq!(
        error.as_ref().unwrap().to_string(),
        "Exception received from UploadDataProvider"
    );
    assert_eq!(upload_error(error).to_string(), "length failed");
    // Nothing went out.
    assert!(transport.recorded().is_empty());
}

#[tokio::test]
async fn test_read_failure() {
    let engine = Engine::with_transport(ScriptedTransport::ok_with_body(["never"])).unwrap();
    let mut provider = TestProvider::new(vec![b"data"]);
    provider.fault = Fault::Read;
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/post", tracker.clone(), executor())
        .add_header("Content-Type", "text/plain")
        .upload_data_provider(Box::new(provider), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(tracker.response_step(), ResponseStep::OnFailed);
    assert_eq!(upload_error(tracker.error()).to_string(), "read failed");
}

#[tokio::test]
async fn test_rewind_failure() {
    let engine = Engine::with_transport(ScriptedTransport::new(vec![
        Step::ReadBody,
        Step::Redirect {
            status: 308,
            location: "/again".into(),
        },
        Step::ReadBody,
        Step::ok(),
    ]))
    .unwrap();
    let mut provider = TestProvider::new(vec![b"data"]);
    provider.fault = Fault::Rewind;
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/post", tracker.clone(), executor())
        .add_header("Content-Type", "text/plain")
        .upload_data_provider(Box::new(provider), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(
        tracker.steps(),
        vec![ResponseStep::OnReceivedRedirect, ResponseStep::OnFailed]
    );
    assert_eq!(upload_error(tracker.error()).to_string(), "rewind failed");
}

#[tokio::test]
async fn test_body_longer_than_length() {
    let engine = Engine::with_transport(ScriptedTransport::ok_with_body(["never"])).unwrap();
    let mut provider = TestProvider::new(vec![b"12345"]);
    provider.fault = Fault::ShortLength;
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/post", tracker.clone(), executor())
        .add_header("Content-Type", "text/plain")
        .upload_data_provider(Box::new(provider), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(
        upload_error(tracker.error()).to_string(),
        "Read upload data length 5 exceeds expected length 4"
    );
}

#[tokio::test]
async fn test_file_upload_over_http() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"file contents").unwrap();
    file.flush().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (body_tx, body_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        // Read until the whole 13-byte body follows the header block.
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                if received.len() >= end + 4 + 13 {
                    break;
                }
            }
        }
        let _ = body_tx.send(String::from_utf8_lossy(&received).into_owned());
        let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
        let _ = socket.write_all(response.as_bytes()).await;
    });

    let engine = Engine::new().unwrap();
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder(format!("http://{}/upload", addr), tracker.clone(), executor())
        .add_header("Content-Type", "text/plain")
        .upload_data_provider(UploadDataProviders::from_file(file.path()).unwrap(), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(tracker.response_step(), ResponseStep::OnSucceeded);
    assert_eq!(tracker.response_as_string(), "ok");
    let received = body_rx.await.unwrap();
    assert!(received.starts_with("POST /upload HTTP/1.1\r\n"), "{}", received);
    assert!(received.to_ascii_lowercase().contains("content-length: 13"));
    assert!(received.ends_with("file contents"));
}
