use cronet::base::BoxError;
use cronet::executor::ThreadExecutor;
use cronet::transport::{ScriptedTransport, Step};
use cronet::urlrequest::{RequestEvent, RequestTracker, ResponseStep, UrlRequest};
use cronet::{Engine, EngineConfig, RequestStatus};
use std::io::Write;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

fn executor() -> ThreadExecutor {
    ThreadExecutor::new("engine-callbacks").unwrap()
}

#[tokio::test]
async fn test_shutdown_waits_for_requests() {
    let engine = Engine::with_transport(ScriptedTransport::new(vec![Step::Hang])).unwrap();
    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/hang", tracker.clone(), executor())
        .build();

    request.start().unwrap();
    assert_eq!(engine.active_request_count(), 1);
    let err = engine.shutdown().unwrap_err();
    assert_eq!(err.to_string(), "Cannot shutdown with running requests.");
    assert!(!engine.is_shut_down());

    request.cancel();
    tracker.done().await;
    assert_eq!(engine.active_request_count(), 0);
    engine.shutdown().unwrap();
    assert!(engine.is_shut_down());

    let late = engine
        .new_url_request_builder("http://test/late", RequestTracker::new(), executor())
        .build();
    let err = late.start().unwrap_err();
    assert_eq!(err.to_string(), "Engine is shut down.");
    assert!(!late.is_done());
}

#[tokio::test]
async fn test_shutdown_from_terminal_callback() {
    let engine = Engine::with_transport(ScriptedTransport::new(vec![Step::Hang])).unwrap();
    let (tx, rx) = std_mpsc::channel();
    let callback_engine = engine.clone();
    let callback = move |_: &UrlRequest, event: RequestEvent| -> Result<(), BoxError> {
        if let RequestEvent::Canceled { .. } = event {
            tx.send(callback_engine.shutdown().map_err(|e| e.to_string()))
                .unwrap();
        }
        Ok(())
    };
    let request = engine
        .new_url_request_builder("http://test/hang", callback, executor())
        .build();

    request.start().unwrap();
    request.cancel();

    let result = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Ok(()));
    assert!(engine.is_shut_down());
}

#[tokio::test]
async fn test_status_after_shutdown() {
    let engine = Engine::with_transport(ScriptedTransport::ok_with_body(["done"])).unwrap();
    let tracker = RequestTracker::new();
    let finished = engine
        .new_url_request_builder("http://test/finished", tracker.clone(), executor())
        .build();
    finished.start().unwrap();
    tracker.done().await;
    let unstarted = engine
        .new_url_request_builder("http://test/unstarted", RequestTracker::new(), executor())
        .build();
    engine.shutdown().unwrap();

    let (tx, rx) = std_mpsc::channel();
    for request in [&finished, &unstarted] {
        let tx = tx.clone();
        request.get_status(move |status| tx.send(status).unwrap());
    }
    let statuses = tokio::task::spawn_blocking(move || {
        (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect::<Vec<_>>()
    })
    .await
    .unwrap();
    assert_eq!(statuses, vec![RequestStatus::Invalid, RequestStatus::Invalid]);
}

#[tokio::test]
async fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"max_redirects": 1, "user_agent": "engine-test/1.0", "retry": {{"max_attempts": 1}}}}"#
    )
    .unwrap();
    file.flush().unwrap();

    let config = EngineConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.max_redirects, 1);
    assert_eq!(config.user_agent, "engine-test/1.0");
    assert_eq!(config.upload_buffer_size, EngineConfig::default().upload_buffer_size);

    let redirect = Step::Redirect {
        status: 302,
        location: "/next".into(),
    };
    let engine = Engine::builder()
        .config(config)
        .transport(ScriptedTransport::new(vec![redirect.clone(), redirect, Step::ok()]))
        .build()
        .unwrap();
    assert_eq!(engine.config().max_redirects, 1);

    let tracker = RequestTracker::new();
    let request = engine
        .new_url_request_builder("http://test/start", tracker.clone(), executor())
        .build();
    request.start().unwrap();
    tracker.done().await;
    assert_eq!(tracker.response_step(), ResponseStep::OnFailed);
    assert_eq!(tracker.redirect_count(), 1);
}

#[test]
fn test_invalid_config_rejected() {
    let config = EngineConfig {
        upload_buffer_size: 0,
        ..Default::default()
    };
    let err = Engine::with_config(config).unwrap_err();
    assert!(err.is_usage_error());

    let missing = std::path::Path::new("/nonexistent/cronet-config.json");
    assert!(EngineConfig::from_json_file(missing).is_err());
}
