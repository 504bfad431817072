use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use reqwest::Client;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ApiError, UploadError};
use crate::net;
use crate::queue::UploadTask;
use crate::token;

pub const MAX_UPLOAD_SIZE: u64 = 20 * 1024 * 1024;
pub const BOUNDARY: &str = "----ESP32FileUploadBoundary";

/// Who the file is uploaded for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub product_id: String,
    pub device_name: String,
}

/// Receives `(task_id, progress, uploaded_bytes)` milestones.
pub type ProgressFn<'a> = &'a (dyn Fn(u32, u8, u64) + Send + Sync);

/// Moves one task's file to the cloud. Implementations update
/// `task.progress` and `task.uploaded_bytes` as they go; the queue applies
/// the final status.
pub trait UploadExecutor: Send + Sync {
    fn execute(
        &self,
        task: &mut UploadTask,
        target: &UploadTarget,
        progress: ProgressFn<'_>,
    ) -> impl Future<Output = Result<(), UploadError>> + Send;
}

fn milestone(task: &mut UploadTask, percent: u8, bytes: u64, progress: ProgressFn<'_>) {
    task.progress = percent;
    task.uploaded_bytes = bytes;
    progress(task.task_id, percent, bytes);
}

/// `.csv` goes up as `.txt`; the file API only accepts a fixed set of extensions.
pub fn upload_file_name(name: &str) -> String {
    let path = Path::new(name);
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("csv"));
    if is_csv {
        path.with_extension("txt").to_string_lossy().into_owned()
    } else {
        name.to_string()
    }
}

/// Three-field multipart body: `product_id`, `device_name`, `file`.
pub fn multipart_body(target: &UploadTarget, file_name: &str, data: &[u8]) -> Result<Vec<u8>, UploadError> {
    let header = format!(
        "--{b}\r\n\
         Content-Disposition: form-data; name=\"product_id\"\r\n\r\n\
         {pid}\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"device_name\"\r\n\r\n\
         {name}\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{file}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n",
        b = BOUNDARY,
        pid = target.product_id,
        name = target.device_name,
        file = file_name,
    );
    let footer = format!("\r\n--{}--\r\n", BOUNDARY);

    let total = header.len() + data.len() + footer.len();
    let mut body = Vec::new();
    body.try_reserve_exact(total).map_err(|_| UploadError::AllocFailed)?;
    body.extend_from_slice(header.as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(footer.as_bytes());
    Ok(body)
}

/// Reads exactly `expected` bytes. A file that grew past the upload cap since
/// it was queued is rejected before any of it is read.
async fn read_whole_file(path: &Path, expected: u64) -> Result<Vec<u8>, UploadError> {
    let file = tokio::fs::File::open(path).await.map_err(UploadError::OpenFailed)?;
    let current = file.metadata().await.map_err(UploadError::OpenFailed)?.len();
    if current > MAX_UPLOAD_SIZE {
        warn!(path = %path.display(), size = current, "File grew past the upload cap");
        return Err(UploadError::TooLarge { size: current });
    }
    let capacity = usize::try_from(expected).map_err(|_| UploadError::AllocFailed)?;
    let mut data = Vec::new();
    data.try_reserve_exact(capacity).map_err(|_| UploadError::AllocFailed)?;
    file.take(expected + 1).read_to_end(&mut data).await.map_err(|e| {
        warn!(path = %path.display(), error = %e, "File read failed");
        UploadError::ReadFailed
    })?;
    if data.len() as u64 != expected {
        warn!(path = %path.display(), read = data.len(), expected, "File changed size since enqueue");
        return Err(UploadError::ReadFailed);
    }
    Ok(data)
}

/// Uploads through the OneNET file API with a user-level token.
pub struct OneNetUploader {
    client: Client,
    config: Arc<Config>,
}

impl OneNetUploader {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        OneNetUploader { client, config }
    }
}

impl UploadExecutor for OneNetUploader {
    async fn execute(
        &self,
        task: &mut UploadTask,
        target: &UploadTarget,
        progress: ProgressFn<'_>,
    ) -> Result<(), UploadError> {
        if task.file_size > MAX_UPLOAD_SIZE {
            warn!(task_id = task.task_id, size = task.file_size, "File too large");
            return Err(UploadError::TooLarge { size: task.file_size });
        }

        info!(task_id = task.task_id, file = %task.file_name, size = task.file_size, "Uploading file");
        let data = read_whole_file(&task.file_path, task.file_size).await?;
        milestone(task, 10, 0, progress);

        let file_name = upload_file_name(&task.file_name);
        let body = multipart_body(target, &file_name, &data)?;
        drop(data);
        milestone(task, 30, 0, progress);

        let auth = token::user_token(&self.config.user_id, &self.config.user_access_key)
            .map_err(UploadError::TokenFailed)?;
        let size = task.file_size;
        milestone(task, 50, size / 2, progress);

        match net::upload_file(&self.client, &self.config, &auth, body, BOUNDARY).await {
            Ok(_) => {
                milestone(task, 100, size, progress);
                Ok(())
            }
            Err(ApiError::Status(code)) => Err(UploadError::http(Some(code), format!("HTTP status: {}", code))),
            Err(ApiError::Rejected { msg, .. }) => Err(UploadError::http(Some(200), msg)),
            Err(ApiError::Decode(e)) => Err(UploadError::http(Some(200), format!("Invalid response: {}", e))),
            Err(ApiError::Token(e)) => Err(UploadError::TokenFailed(e)),
            Err(other) => Err(UploadError::http(None, other.to_string())),
        }
    }
}
