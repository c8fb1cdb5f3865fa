//! End-to-end run of the pipeline against mock feed and webhook servers.

use chrono::{FixedOffset, NaiveTime, Utc, Weekday};
use pubwatch::calendar::KST_OFFSET_MINUTES;
use pubwatch::{
    Classification, Config, FeedDefinition, Heartbeat, HttpFeedSource, MonitorState, Pipeline,
    StateStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn late_feed() -> FeedDefinition {
    let mut feed = FeedDefinition::new(
        "late-report",
        "Late report",
        "/feeds/late-report",
        NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(0, 1, 0).unwrap(),
    );
    feed.window.weekdays = vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    feed.business_days_only = false;
    feed.poll_interval_secs = 1;
    feed
}

#[tokio::test]
async fn test_late_publication_alerts_once_and_persists() {
    let dir = TempDir::new().unwrap();
    let api = MockServer::start().await;
    let hook = MockServer::start().await;

    let kst = FixedOffset::east_opt(KST_OFFSET_MINUTES * 60).unwrap();
    let today = Utc::now().with_timezone(&kst).format("%Y%m%d").to_string();
    Mock::given(method("GET"))
        .and(path("/feeds/late-report"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "title": "Nightly report", "date": today, "time": "235900" }
        })))
        .mount(&api)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&hook)
        .await;

    let mut config = Config::default();
    config.feeds = vec![late_feed()];
    config.api.base_url = Some(api.uri());
    config.webhook.url = Some(format!("{}/hook", hook.uri()));
    config.escalation.quiet_hours = None;
    config.escalation.daily_summary = None;
    config.state.path = dir.path().join("state.json");
    config.state.heartbeat_path = dir.path().join("heartbeat.json");
    config.state.heartbeat_interval_secs = 1;
    let config = Arc::new(config);

    let store = Arc::new(StateStore::<MonitorState>::open(&config.state.path).await.unwrap());
    let source = Arc::new(
        HttpFeedSource::new(config.api.base_url.clone(), None, Duration::from_secs(5)).unwrap(),
    );
    let channel = notify::channel_for(
        config.webhook.url.clone(),
        "pubwatch",
        Duration::from_secs(5),
        false,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(Arc::clone(&config), store, source, channel);
    let run = tokio::spawn(pipeline.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    let saved: MonitorState =
        serde_json::from_str(&std::fs::read_to_string(&config.state.path).unwrap()).unwrap();
    let record = &saved.feeds["late-report"];
    assert_eq!(record.state.classification, Classification::Delayed);
    assert_eq!(record.state.last_alerted_tier, Some(notify::Severity::Critical));
    assert!(saved.pending_alerts.is_empty());

    let beat = Heartbeat::read(&config.state.heartbeat_path)
        .await
        .unwrap()
        .expect("heartbeat written");
    assert!(beat.cycles >= 1);

    hook.verify().await;
}
