mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use lazy_runtime::pool::Worker;
use lazy_runtime::{MetricsRegistry, PipelineTask};

use support::start_stub_es;

fn task_config(files: &str, status_dir: &str, endpoint: &str) -> String {
    format!(
        r#"{{
            "Input": {{
                "Type": "file",
                "Files": "{files}",
                "ReadAll": "true",
                "Name": "e2e",
                "StatusDir": "{status_dir}"
            }},
            "Output": {{
                "Type": "elasticsearch",
                "ElasticSearchEndPoint": "{endpoint}",
                "IndexPerfix": "e2e",
                "IndexType": "logs",
                "BulkCount": 1,
                "FlushTimeout": 1
            }},
            "LogParser": {{"LogType": "raw"}},
            "FilterOrder": ["r"],
            "FilterSettings": {{
                "r": {{
                    "Type": "regexp",
                    "KeyToFilter": "rawmsg",
                    "LabelName": "ignore",
                    "default": "^DROP"
                }}
            }}
        }}"#
    )
}

async fn recv_body(
    bodies: &mut mpsc::UnboundedReceiver<String>,
    within: Duration,
) -> Option<String> {
    timeout(within, bodies.recv()).await.ok().flatten()
}

#[tokio::test]
async fn records_flow_source_to_sink_with_filtering() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");
    std::fs::write(&log_path, b"DROP me\nkeep me\n").unwrap();

    let (endpoint, mut bodies) = start_stub_es("7.10.2", 0).await;
    let config = task_config(
        &log_path.display().to_string(),
        &dir.path().display().to_string(),
        &endpoint,
    );

    let metrics = Arc::new(MetricsRegistry::new());
    let task = PipelineTask::start("e2e", config.as_bytes(), metrics)
        .await
        .unwrap();

    // Only the record that escaped the ignore filter reaches the backend.
    let body = recv_body(&mut bodies, Duration::from_secs(10)).await.unwrap();
    assert!(body.contains("keep me"), "{body}");
    assert!(!body.contains("DROP"), "{body}");
    assert!(recv_body(&mut bodies, Duration::from_secs(2)).await.is_none());

    task.stop().await;

    // Graceful stop checkpoints the fully-consumed offset.
    let meta = {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(&log_path).unwrap()
    };
    let status = std::fs::read_to_string(dir.path().join(".e2elazystatus")).unwrap();
    let expected = {
        use std::os::unix::fs::MetadataExt;
        format!("{}:{} 16", meta.ino(), meta.dev())
    };
    assert!(status.contains(&expected), "status: {status:?}");
}

#[tokio::test]
async fn appended_lines_keep_flowing() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("grow.log");
    std::fs::write(&log_path, b"first\n").unwrap();

    let (endpoint, mut bodies) = start_stub_es("7.10.2", 0).await;
    let config = task_config(
        &log_path.display().to_string(),
        &dir.path().display().to_string(),
        &endpoint,
    );
    let metrics = Arc::new(MetricsRegistry::new());
    let task = PipelineTask::start("e2e-grow", config.as_bytes(), metrics)
        .await
        .unwrap();

    let body = recv_body(&mut bodies, Duration::from_secs(10)).await.unwrap();
    assert!(body.contains("first"));

    {
        use std::io::Write as _;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        f.write_all(b"second\n").unwrap();
    }
    let body = recv_body(&mut bodies, Duration::from_secs(10)).await.unwrap();
    assert!(body.contains("second"));

    task.stop().await;
}

#[tokio::test]
async fn bad_task_config_fails_construction() {
    let metrics = Arc::new(MetricsRegistry::new());
    assert!(
        PipelineTask::start("bad", b"{not json", metrics.clone())
            .await
            .is_err()
    );
    assert!(
        PipelineTask::start("bad", br#"{"Input":{"Type":"file"},"Output":{}}"#, metrics)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn unknown_source_type_fails_construction() {
    let metrics = Arc::new(MetricsRegistry::new());
    let config = br#"{"Input":{"Type":"carrier-pigeon"},"Output":{"Type":"nsq","NSQAddress":"x","Topic":"t"}}"#;
    assert!(PipelineTask::start("bad", config, metrics).await.is_err());
}
