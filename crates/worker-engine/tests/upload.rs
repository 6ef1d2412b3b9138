//! Upload-stage behavior: ordered gathering, output shaping, key prefixes,
//! failure handling, and stripping of internal fields.

mod common;

use std::sync::Arc;

use tokio::sync::mpsc;

use predq_core::{Response, Status, UploadObject, WebhookEvent};
use predq_engine::{UploadJob, Uploader, run_upload_worker};

use common::{RecordingSink, RecordingStore, png_bytes};

fn upload_object(extension: &str) -> UploadObject {
    UploadObject {
        image_bytes: png_bytes(),
        target_extension: extension.to_string(),
        target_quality: 85,
    }
}

fn completed_response(objects: Vec<UploadObject>, multi: bool) -> Response {
    let mut response = Response::default();
    response.status = Some(Status::Succeeded);
    response.upload_outputs = objects;
    response.multi_output = multi;
    response
}

async fn run_stage(
    store: Arc<RecordingStore>,
    jobs: Vec<UploadJob>,
) -> Arc<RecordingStore> {
    let uploader = Arc::new(Uploader::new(store.clone(), "artifacts".to_string()));
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(run_upload_worker(rx, uploader));
    for job in jobs {
        tx.send(job).unwrap();
    }
    drop(tx);
    worker.await.unwrap();
    store
}

#[tokio::test]
async fn urls_are_gathered_in_engine_output_order() {
    // The store delays .png puts, so the first artifact finishes last.
    let store = Arc::new(RecordingStore::default());
    let sink = Arc::new(RecordingSink::default());
    let response = completed_response(
        vec![upload_object(".png"), upload_object(".jpeg"), upload_object(".webp")],
        true,
    );

    let store = run_stage(store, vec![UploadJob { response, sink: sink.clone() }]).await;

    let completed = sink.completed();
    let urls = completed["output"].as_array().expect("multi output must be a list");
    assert_eq!(urls.len(), 3);
    assert!(urls[0].as_str().unwrap().ends_with(".png"));
    assert!(urls[1].as_str().unwrap().ends_with(".jpeg"));
    assert!(urls[2].as_str().unwrap().ends_with(".webp"));
    for url in urls {
        assert!(url.as_str().unwrap().starts_with("s3://artifacts/"));
    }

    // Completion order differed from input order.
    let stored = store.keys();
    assert!(stored.last().unwrap().ends_with(".png"));
}

#[tokio::test]
async fn single_output_jobs_get_a_bare_url() {
    let store = Arc::new(RecordingStore::default());
    let sink = Arc::new(RecordingSink::default());
    let response = completed_response(vec![upload_object(".jpeg")], false);

    let store = run_stage(store, vec![UploadJob { response, sink: sink.clone() }]).await;

    let completed = sink.completed();
    let url = completed["output"].as_str().expect("single output must be a bare url");
    assert!(url.starts_with("s3://artifacts/"));
    assert!(url.ends_with(".jpeg"));
    assert_eq!(completed["status"], "succeeded");
    assert_eq!(store.content_types(), vec![Some("image/jpeg".to_string())]);
}

#[tokio::test]
async fn upload_prefix_lands_in_the_object_key() {
    let store = Arc::new(RecordingStore::default());
    let sink = Arc::new(RecordingSink::default());
    let mut response = completed_response(vec![upload_object(".jpeg")], false);
    response.upload_prefix = "user/42".to_string();

    let store = run_stage(store, vec![UploadJob { response, sink: sink.clone() }]).await;

    let keys = store.keys();
    assert!(keys[0].starts_with("user/42/"), "unexpected key {:?}", keys[0]);
    assert!(
        sink.completed()["output"].as_str().unwrap().starts_with("s3://artifacts/user/42/")
    );
}

#[tokio::test]
async fn store_failure_turns_the_job_failed() {
    let store = Arc::new(RecordingStore::failing());
    let sink = Arc::new(RecordingSink::default());
    let response = completed_response(vec![upload_object(".png")], false);

    run_stage(store, vec![UploadJob { response, sink: sink.clone() }]).await;

    let completed = sink.completed();
    assert_eq!(completed["status"], "failed");
    assert!(
        completed["error"].as_str().unwrap().contains("store unavailable"),
        "unexpected error {:?}",
        completed["error"]
    );
}

#[tokio::test]
async fn delivered_responses_never_carry_internal_fields() {
    let store = Arc::new(RecordingStore::default());
    let sink = Arc::new(RecordingSink::default());
    let response = completed_response(vec![upload_object(".png")], false);

    run_stage(store, vec![UploadJob { response, sink: sink.clone() }]).await;

    let completed = sink.completed();
    assert!(completed.get("upload_outputs").is_none());
    assert!(completed.get("upload_prefix").is_none());
}

#[tokio::test]
async fn jobs_flow_through_in_fifo_order() {
    let store = Arc::new(RecordingStore::default());
    let sink = Arc::new(RecordingSink::default());

    let mut first = completed_response(vec![upload_object(".png")], false);
    first.extra.insert("job".to_string(), serde_json::json!(1));
    let mut second = completed_response(vec![upload_object(".jpeg")], false);
    second.extra.insert("job".to_string(), serde_json::json!(2));

    run_stage(
        store,
        vec![
            UploadJob { response: first, sink: sink.clone() },
            UploadJob { response: second, sink: sink.clone() },
        ],
    )
    .await;

    let order: Vec<i64> = sink
        .events()
        .into_iter()
        .filter(|(kind, _)| *kind == WebhookEvent::Completed)
        .map(|(_, payload)| payload["job"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![1, 2]);
}
