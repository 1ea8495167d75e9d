use cronet::base::NetError;
use cronet::executor::ThreadExecutor;
use cronet::urlrequest::{RequestTracker, ResponseStep};
use cronet::{Engine, EngineConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn executor() -> ThreadExecutor {
    ThreadExecutor::new("redirect-callbacks").unwrap()
}

#[tokio::test]
async fn test_redirect_limit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{}", addr);
    let server_url = base_url.clone();
    let hits = Arc::new(AtomicUsize::new(0));
    let server_hits = hits.clone();

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                let server_url = server_url.clone();
                server_hits.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 302 Found\r\nLocation: {}/loop\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        server_url
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        }
    });

    let config = EngineConfig {
        max_redirects: 3,
        ..Default::default()
    };
    let engine = Engine::with_config(config).unwrap();
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder(format!("{}/start", base_url), tracker.clone(), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(tracker.response_step(), ResponseStep::OnFailed);
    assert!(matches!(tracker.error(), Some(NetError::TooManyRedirects)));
    assert_eq!(tracker.redirect_count(), 3);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_redirect_then_target() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{}", addr);
    let server_url = base_url.clone();

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                let server_url = server_url.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);

                    if request.contains("GET /start") {
                        let response = format!(
                            "HTTP/1.1 302 Found\r\nLocation: {}/target\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            server_url
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                    } else {
                        let response = "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nTARGET";
                        let _ = socket.write_all(response.as_bytes()).await;
                    }
                });
            }
        }
    });

    let engine = Engine::new().unwrap();
    let tracker = RequestTracker::new();
    let start_url = format!("{}/start", base_url);
    let request = engine
        .new_url_request_builder(start_url.clone(), tracker.clone(), executor())
        .build();

    request.start().unwrap();
    tracker.done().await;

    assert_eq!(
        tracker.steps(),
        vec![
            ResponseStep::OnReceivedRedirect,
            ResponseStep::OnResponseStarted,
            ResponseStep::OnReadCompleted,
            ResponseStep::OnSucceeded,
        ]
    );
    assert_eq!(tracker.response_as_string(), "TARGET");
    let target_url = format!("{}/target", base_url);
    assert_eq!(tracker.redirect_urls(), vec![target_url.clone()]);
    let info = tracker.response_info().unwrap();
    assert_eq!(info.url_chain(), &[start_url, target_url]);
    assert_eq!(tracker.redirect_response_infos()[0].http_status_code(), 302);
    assert!(tracker.violations().is_empty(), "{:?}", tracker.violations());
}

#[tokio::test]
async fn test_cancel_while_redirect_pending() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{}", addr);
    let server_url = base_url.clone();

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                let server_url = server_url.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 301 Moved Permanently\r\nLocation: {}/moved\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        server_url
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        }
    });

    let engine = Engine::new().unwrap();
    let tracker = RequestTracker::new().with_auto_advance(false);
    let request = engine
        .new_url_request_builder(format!("{}/old", base_url), tracker.clone(), executor())
        .build();

    request.start().unwrap();
    tracker.wait_for_next_step().await;
    assert_eq!(tracker.response_step(), ResponseStep::OnReceivedRedirect);

    request.cancel();
    tracker.done().await;
    assert_eq!(
        tracker.steps(),
        vec![ResponseStep::OnReceivedRedirect, ResponseStep::OnCanceled]
    );
    // Redirect hops never become the response info.
    assert_eq!(tracker.response_info().map(|i| i.http_status_code()), None);
    assert_eq!(engine.active_request_count(), 0);
    engine.shutdown().unwrap();
}
