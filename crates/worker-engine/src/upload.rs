//! The artifact upload stage.
//!
//! A single background worker consumes completed responses whose artifacts
//! still need to be stored. Artifacts are transcoded and uploaded in
//! parallel (one task per artifact) but gathered by input index, so the
//! final URL list always matches the engine's output order. Jobs flow
//! through in FIFO order.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use aws_sdk_s3::primitives::ByteStream;
use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use predq_core::{Response, Status, UploadObject, WebhookEvent, time};

use crate::sink::ResponseSink;

/// A completed response waiting on artifact upload, paired with the sink
/// that owns its terminal delivery.
pub struct UploadJob {
    /// The job's terminal response, still carrying `upload_outputs`.
    pub response: Response,
    /// The job's own response sink.
    pub sink: Arc<dyn ResponseSink>,
}

/// Destination for transcoded artifacts.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store one object under `key`.
    async fn put(&self, key: &str, content_type: Option<&str>, body: Vec<u8>)
    -> anyhow::Result<()>;
}

/// S3-backed object store.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Wrap a configured S3 client targeting `bucket`.
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body));
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }
        request
            .send()
            .await
            .with_context(|| format!("put s3://{}/{key}", self.bucket))?;
        Ok(())
    }
}

/// Transcodes and stores one job's artifacts.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl Uploader {
    /// Build an uploader; `bucket` only names the store in returned URLs.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self { store, bucket }
    }

    /// Upload all artifacts in parallel and return their URLs in input
    /// order. Fails with the first per-artifact error, after every task has
    /// finished.
    pub async fn upload_all(
        &self,
        objects: Vec<UploadObject>,
        prefix: &str,
    ) -> anyhow::Result<Vec<String>> {
        let mut tasks = Vec::with_capacity(objects.len());
        for object in objects {
            let store = self.store.clone();
            let bucket = self.bucket.clone();
            let prefix = prefix.to_string();
            tasks.push(tokio::spawn(async move {
                upload_one(store, &bucket, &prefix, object).await
            }));
        }

        // Gather by input index, not completion order.
        let mut urls = Vec::with_capacity(tasks.len());
        for task in tasks {
            let url = task
                .await
                .map_err(|err| anyhow::anyhow!("upload task join error: {err}"))??;
            urls.push(url);
        }
        Ok(urls)
    }
}

async fn upload_one(
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    prefix: &str,
    object: UploadObject,
) -> anyhow::Result<String> {
    let UploadObject { image_bytes, target_extension, target_quality } = object;

    let started = Instant::now();
    let extension = target_extension.clone();
    let body =
        tokio::task::spawn_blocking(move || transcode(&image_bytes, &extension, target_quality))
            .await
            .map_err(|err| anyhow::anyhow!("transcode task join error: {err}"))??;
    tracing::debug!(
        extension = %target_extension,
        quality = target_quality,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transcoded image"
    );

    let mut key = format!("{}{}", Uuid::new_v4(), target_extension);
    if !prefix.is_empty() {
        key = format!("{}{key}", time::ensure_trailing_slash(prefix));
    }

    let started = Instant::now();
    store.put(&key, content_type(&target_extension), body).await?;
    tracing::debug!(
        key = %key,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "uploaded image"
    );

    Ok(format!("s3://{bucket}/{key}"))
}

/// Consume the upload queue until it closes: upload each response's
/// artifacts, assign `output`, and deliver the terminal event through the
/// job's own sink.
pub async fn run_upload_worker(mut queue: mpsc::UnboundedReceiver<UploadJob>, uploader: Arc<Uploader>) {
    tracing::info!("upload worker started");
    while let Some(job) = queue.recv().await {
        let UploadJob { mut response, sink } = job;
        let objects = std::mem::take(&mut response.upload_outputs);
        let prefix = std::mem::take(&mut response.upload_prefix);

        match uploader.upload_all(objects, &prefix).await {
            Ok(urls) => {
                response.output = Some(shape_output(urls, response.multi_output));
            }
            Err(err) => {
                tracing::error!("error uploading files: {err:#}");
                response.status = Some(Status::Failed);
                response.error = Some(err.to_string());
            }
        }

        if let Err(err) = sink.send(WebhookEvent::Completed, &response).await {
            tracing::error!("failed to deliver completed response: {err:#}");
        }
    }
    tracing::info!("upload worker stopped");
}

/// A single-output prediction yields one URL; multi-output predictions (and
/// anything unexpected) keep the list form.
fn shape_output(mut urls: Vec<String>, multi: bool) -> Value {
    if !multi && urls.len() == 1 {
        return Value::String(urls.remove(0));
    }
    Value::Array(urls.into_iter().map(Value::String).collect())
}

/// Content type for a target extension; unknown extensions upload untyped.
fn content_type(extension: &str) -> Option<&'static str> {
    match extension {
        ".jpeg" | ".jpg" => Some("image/jpeg"),
        ".png" => Some("image/png"),
        ".webp" => Some("image/webp"),
        _ => None,
    }
}

/// Re-encode image bytes to the target format. The format comes from the
/// extension minus its leading dot; quality applies where the codec
/// supports it (webp output is lossless).
fn transcode(bytes: &[u8], target_extension: &str, target_quality: u8) -> anyhow::Result<Vec<u8>> {
    let format = ImageFormat::from_extension(target_extension.trim_start_matches('.'))
        .ok_or_else(|| anyhow::anyhow!("unsupported target extension {target_extension:?}"))?;

    let image = image::load_from_memory(bytes).context("decode image")?;
    let mut out = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let encoder = JpegEncoder::new_with_quality(&mut out, target_quality);
            image.to_rgb8().write_with_encoder(encoder).context("encode jpeg")?;
        }
        ImageFormat::WebP => {
            image
                .write_with_encoder(WebPEncoder::new_lossless(&mut out))
                .context("encode webp")?;
        }
        other => image.write_to(&mut out, other).context("encode image")?,
    }
    Ok(out.into_inner())
}
