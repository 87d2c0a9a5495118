//! Raw artifacts, observations and environment clean-up

use std::path::PathBuf;

use mbus_connect::prelude::*;
use mbus_test_utils::{collector, next, topic, TestBus};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn raw_state_reaches_listener_and_late_fetch() {
    let env = TestBus::new();
    let writer = env.connector("agent-a").await;
    let reader = env.connector("agent-b").await;

    let (handler, mut files) = collector::<PathBuf>();
    reader
        .listen_for_raw_state_postings("agent-a", "diagram", handler)
        .await
        .unwrap();

    let source = env.work_folder().join("diagram.svg");
    std::fs::write(&source, "<svg/>").unwrap();
    writer.post_raw_state("diagram", &source).await.unwrap();

    let received = next(&mut files).await;
    assert_eq!(std::fs::read_to_string(&received).unwrap(), "<svg/>");

    let late = env.connector("agent-c").await;
    let fetched = late
        .fetch_raw_state("agent-a", "diagram", "copy.svg")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched, late.repository().local_file_path("copy.svg"));
    assert_eq!(std::fs::read_to_string(fetched).unwrap(), "<svg/>");
}

#[tokio::test]
async fn raw_payload_is_stored_under_agent_tree() {
    let env = TestBus::new();
    let writer = env.connector("agent-a").await;
    let source = env.work_folder().join("blob.bin");
    std::fs::write(&source, [0_u8, 1, 2, 255]).unwrap();

    writer.post_raw_state("blob", &source).await.unwrap();
    assert_eq!(
        env.repository.file(&env.payload_path("agent-a", "artefacts/raw/blob")),
        Some(vec![0, 1, 2, 255])
    );

    writer.delete_raw_artifact("blob").await.unwrap();
    assert!(env.broker.retained(&env.full_topic("agent-a", "artefacts/raw/blob")).is_none());
    assert!(!env.repository.exists(&env.full_topic("agent-a", "artefacts/raw/blob")));
}

#[tokio::test]
async fn missing_local_file_is_reported() {
    let env = TestBus::new();
    let writer = env.connector("agent-a").await;
    let result = writer
        .post_raw_state("ghost", &env.work_folder().join("absent.bin"))
        .await;
    assert!(matches!(result, Err(BusError::Repository(_))));
    assert!(env.broker.retained_topics().is_empty());
}

#[tokio::test]
async fn invalid_identifier_is_rejected_before_posting() {
    let env = TestBus::new();
    let writer = env.connector("agent-a").await;
    let result = writer.post_json_observation("a/b", b"{}").await;
    assert!(matches!(result, Err(BusError::Path(_))));
    assert!(env.broker.retained_topics().is_empty());
}

#[tokio::test]
async fn json_observation_flow() {
    let env = TestBus::new();
    let writer = env.connector("agent-a").await;
    let reader = env.connector("agent-b").await;

    let (mut handler, mut observations) = collector::<(Vec<u8>, Timestamp)>();
    reader
        .listen_for_json_observation_postings("agent-a", "sensor", move |json, stamp| handler((json, stamp)))
        .await
        .unwrap();

    let stamp = writer
        .post_json_observation("sensor", br#"{"temp":21.5}"#)
        .await
        .unwrap();
    assert_eq!(next(&mut observations).await, (br#"{"temp":21.5}"#.to_vec(), stamp.clone()));

    let fetched = reader.fetch_json_observation("agent-a", "sensor").await.unwrap();
    assert_eq!(fetched, Some((br#"{"temp":21.5}"#.to_vec(), stamp)));
}

#[tokio::test]
async fn malformed_json_observation_is_refused() {
    let env = TestBus::new();
    let writer = env.connector("agent-a").await;
    let result = writer.post_json_observation("sensor", b"{temp").await;
    assert!(matches!(result, Err(BusError::Json(_))));
    assert!(env.repository.paths().is_empty());
}

#[tokio::test]
async fn raw_observation_flow() {
    let env = TestBus::new();
    let writer = env.connector("agent-a").await;
    let reader = env.connector("agent-b").await;

    let (mut handler, mut files) = collector::<(PathBuf, Timestamp)>();
    reader
        .listen_for_raw_observation_postings("agent-a", "photo", move |path, stamp| handler((path, stamp)))
        .await
        .unwrap();

    let source = env.work_folder().join("photo.jpg");
    std::fs::write(&source, b"jpeg").unwrap();
    let stamp = writer.post_raw_observation("photo", &source).await.unwrap();

    let (path, received) = next(&mut files).await;
    assert_eq!(received, stamp);
    assert_eq!(std::fs::read(path).unwrap(), b"jpeg".to_vec());
}

#[tokio::test]
async fn delete_environment_clears_own_postings_and_store() {
    let env = TestBus::new();
    let a = env.connector("agent-a").await;
    let b = env.connector("agent-b").await;

    let stamp = a.next_timestamp();
    a.post_json_as_file(&topic("models/m1"), b"{}", &stamp).await.unwrap();
    a.post_json_as_streamed(&topic("live"), b"[]", &stamp).await.unwrap();
    b.post_json_as_file(&topic("models/m2"), b"{}", &stamp).await.unwrap();

    a.delete_environment(None).await.unwrap();

    assert_eq!(
        env.broker.retained_topics(),
        vec![env.full_topic("agent-b", "models/m2")]
    );
    assert!(!env.repository.exists(&format!("mbus/bus-version-1.0/{}", mbus_test_utils::ENVIRONMENT)));
}

#[tokio::test]
async fn payloads_name_the_configured_server() {
    let env = TestBus::new();
    let writer = env.connector("agent-a").await;
    let stamp = writer.next_timestamp();
    writer.post_json_as_file(&topic("doc"), b"1", &stamp).await.unwrap();

    let announced = env.broker.retained(&env.full_topic("agent-a", "doc")).unwrap();
    let event: serde_json::Value = serde_json::from_slice(&announced).unwrap();
    assert_eq!(event["server"], mbus_test_utils::STORE_SERVER);
    assert_eq!(event["port"], mbus_test_utils::STORE_PORT.to_string());
    assert_eq!(event["file path"], env.payload_path("agent-a", "doc"));

    let reader = env.connector("agent-b").await;
    let (json, _) = reader.get_json("agent-a", &topic("doc")).await.unwrap().unwrap();
    assert_eq!(json, b"1".to_vec());
    let last = env.dialer.dialed().pop().unwrap();
    assert!(last.credentials.is_some());
}
