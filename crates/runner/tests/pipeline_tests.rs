//! End-to-end runs of the pipeline against a mock ComfyUI server.

use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;
use gridgen_comfyui::api::{ApiConfig, ComfyUIApiError};
use gridgen_comfyui::tracker::{TrackerConfig, TrackerError};
use gridgen_core::error::CoreError;
use gridgen_core::workflow::{MAX_SEED, MIN_SEED};
use gridgen_runner::config::RunnerConfig;
use gridgen_runner::pipeline::{run, RunError};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const WORKFLOW: &str = r#"{
    "94": {"class_type": "LoadImage", "inputs": {"image": ""}},
    "10": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 20}},
    "11": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 20}},
    "20": {"class_type": "SaveImage", "inputs": {"images": ["10", 0]}}
}"#;

fn config_for(server: &ServerGuard, dir: &Path) -> RunnerConfig {
    RunnerConfig {
        api: ApiConfig {
            api_key: Some("test-key".into()),
            ..ApiConfig::new(server.url())
        },
        workflow_path: dir.join("workflow.json"),
        input_image_path: dir.join("in.jpg"),
        image_node_id: "94".into(),
        output_dir: dir.join("out"),
        tracker: TrackerConfig {
            poll_interval: Duration::from_millis(10),
            timeout: Some(Duration::from_secs(5)),
        },
    }
}

fn write_inputs(dir: &Path, workflow: &str) {
    std::fs::write(dir.join("workflow.json"), workflow).unwrap();
    std::fs::write(dir.join("in.jpg"), b"jpeg-bytes").unwrap();
}

async fn mock_upload(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("POST", "/upload/image")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name": "in.jpg", "subfolder": "runs", "type": "input"}"#)
        .create_async()
        .await
}

#[tokio::test]
async fn full_run_downloads_outputs() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), WORKFLOW);

    let upload = mock_upload(&mut server).await;
    let submit = server
        .mock("POST", "/prompt")
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::PartialJson(json!({
            "prompt": {
                "94": {"inputs": {"image": "runs/in.jpg"}},
                "20": {"inputs": {"images": ["10", 0]}}
            }
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"prompt_id": "abc", "number": 1}"#)
        .create_async()
        .await;
    let history = server
        .mock("GET", "/history/abc")
        .with_status(200)
        .with_body(
            json!({
                "abc": {"outputs": {"20": {"images": [
                    {"filename": "grid_00001_.png", "subfolder": "", "type": "output"}
                ]}}}
            })
            .to_string(),
        )
        .create_async()
        .await;
    let view = server
        .mock("GET", "/view")
        .match_query(Matcher::UrlEncoded("filename".into(), "grid_00001_.png".into()))
        .with_status(200)
        .with_body("png")
        .create_async()
        .await;

    let config = config_for(&server, dir.path());
    let summary = run(&config, &CancellationToken::new()).await.unwrap();

    upload.assert_async().await;
    submit.assert_async().await;
    history.assert_async().await;
    view.assert_async().await;

    assert_eq!(summary.prompt_id, "abc");
    assert!(summary.patch.image_bound);
    assert_eq!(summary.patch.seeds_updated, 2);
    assert!((MIN_SEED..=MAX_SEED).contains(&summary.patch.seed));

    let saved = dir.path().join("out").join("grid_00001_.png");
    assert_eq!(summary.outputs, vec![saved.clone()]);
    assert_eq!(std::fs::read_to_string(saved).unwrap(), "png");
}

#[tokio::test]
async fn missing_image_node_still_submits() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), r#"{"10": {"inputs": {"seed": 0}}}"#);

    let _upload = mock_upload(&mut server).await;
    let submit = server
        .mock("POST", "/prompt")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"prompt_id": "abc", "number": 1}"#)
        .create_async()
        .await;
    let _history = server
        .mock("GET", "/history/abc")
        .with_status(200)
        .with_body(r#"{"abc": {"outputs": {}}}"#)
        .create_async()
        .await;

    let config = config_for(&server, dir.path());
    let summary = run(&config, &CancellationToken::new()).await.unwrap();

    submit.assert_async().await;
    assert!(!summary.patch.image_bound);
    assert_eq!(summary.patch.seeds_updated, 1);
    assert!(summary.outputs.is_empty());
}

#[tokio::test]
async fn missing_input_image_stops_before_submission() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("workflow.json"), WORKFLOW).unwrap();

    let submit = server
        .mock("POST", "/prompt")
        .expect(0)
        .create_async()
        .await;

    let config = config_for(&server, dir.path());
    let result = run(&config, &CancellationToken::new()).await;

    submit.assert_async().await;
    assert_matches!(result, Err(RunError::Api(ComfyUIApiError::NotFound(_))));
}

#[tokio::test]
async fn missing_workflow_file_is_reported() {
    let server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    let config = config_for(&server, dir.path());
    let result = run(&config, &CancellationToken::new()).await;

    assert_matches!(result, Err(RunError::Workflow(CoreError::NotFound(_))));
}

#[tokio::test]
async fn timed_out_prompt_is_cancelled_on_server() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), WORKFLOW);

    let _upload = mock_upload(&mut server).await;
    let _submit = server
        .mock("POST", "/prompt")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"prompt_id": "abc", "number": 1}"#)
        .create_async()
        .await;
    let _history = server
        .mock("GET", "/history/abc")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let cancel_queue = server
        .mock("POST", "/queue")
        .match_body(Matcher::Json(json!({"delete": ["abc"]})))
        .with_status(200)
        .create_async()
        .await;

    let mut config = config_for(&server, dir.path());
    config.tracker.timeout = Some(Duration::from_millis(100));

    let result = run(&config, &CancellationToken::new()).await;

    cancel_queue.assert_async().await;
    assert_matches!(result, Err(RunError::Tracker(TrackerError::TimedOut { .. })));
}

#[tokio::test]
async fn cancelled_while_polling_removes_prompt_from_queue() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), WORKFLOW);

    let _upload = mock_upload(&mut server).await;
    let _submit = server
        .mock("POST", "/prompt")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"prompt_id": "abc", "number": 1}"#)
        .create_async()
        .await;
    let history = server
        .mock("GET", "/history/abc")
        .with_status(200)
        .with_body("{}")
        .expect_at_least(1)
        .create_async()
        .await;
    let cancel_queue = server
        .mock("POST", "/queue")
        .match_body(Matcher::Json(json!({"delete": ["abc"]})))
        .with_status(200)
        .create_async()
        .await;

    let mut config = config_for(&server, dir.path());
    config.tracker.timeout = Some(Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = run(&config, &cancel).await;

    history.assert_async().await;
    cancel_queue.assert_async().await;
    assert_matches!(
        result,
        Err(RunError::Tracker(TrackerError::Cancelled { prompt_id })) if prompt_id == "abc"
    );
}

#[tokio::test]
async fn cancelled_before_start_sends_nothing() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), WORKFLOW);

    let upload = server
        .mock("POST", "/upload/image")
        .expect(0)
        .create_async()
        .await;
    let submit = server
        .mock("POST", "/prompt")
        .expect(0)
        .create_async()
        .await;
    let cancel_queue = server
        .mock("POST", "/queue")
        .expect(0)
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let config = config_for(&server, dir.path());
    let result = run(&config, &cancel).await;

    upload.assert_async().await;
    submit.assert_async().await;
    cancel_queue.assert_async().await;
    assert_matches!(result, Err(RunError::Cancelled));
}

#[tokio::test]
async fn cancellation_interrupts_a_hung_upload() {
    // Accepts connections (via the backlog) but never answers.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), WORKFLOW);

    let mut config = RunnerConfig {
        api: ApiConfig::new(format!("http://{}", silent.local_addr().unwrap())),
        ..config_for(&Server::new_async().await, dir.path())
    };
    config.api.request_timeout = None;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), run(&config, &cancel))
        .await
        .expect("run should stop once cancelled");

    assert_matches!(result, Err(RunError::Cancelled));
}
