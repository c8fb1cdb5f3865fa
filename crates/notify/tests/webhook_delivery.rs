//! Webhook delivery against a mock HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{
    AlertKind, AlertRecord, ChannelError, DispatchResult, DispatchStatus, Dispatcher,
    NotifyChannel, RetryPolicy, Severity, WebhookChannel,
};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn warning() -> AlertRecord {
    AlertRecord::new(
        "kospi-close",
        Severity::Warning,
        AlertKind::Escalation,
        "KOSPI close delayed",
        "25 minutes late",
        Utc::now(),
    )
}

fn channel(server: &MockServer) -> WebhookChannel {
    WebhookChannel::new(
        Some(format!("{}/hook", server.uri())),
        "pubwatch",
        Duration::from_secs(2),
    )
    .unwrap()
}

#[tokio::test]
async fn test_posts_generic_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_json(json!({
            "botName": "pubwatch",
            "text": "KOSPI close delayed",
            "attachments": [{"color": "#f39c12", "text": "25 minutes late\n\n[Warning]"}]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = Dispatcher::new(Arc::new(channel(&server)), RetryPolicy::default());
    let mut alert = warning();

    assert_eq!(dispatcher.send(&mut alert).await, DispatchResult::Sent);
    assert_eq!(alert.status, DispatchStatus::Sent);
    assert_eq!(alert.attempts, 1);
}

#[tokio::test]
async fn test_server_error_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = channel(&server)
        .send(&warning().to_message())
        .await
        .unwrap_err();

    match err {
        ChannelError::Rejected { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_rate_limit_honors_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
        .mount(&server)
        .await;

    let dispatcher = Dispatcher::new(Arc::new(channel(&server)), RetryPolicy::default());
    let mut alert = warning();

    match dispatcher.send(&mut alert).await {
        DispatchResult::RetryScheduled { attempt, retry_in } => {
            assert_eq!(attempt, 1);
            assert_eq!(retry_in, Duration::from_secs(120));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
