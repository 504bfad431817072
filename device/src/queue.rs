use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::error::QueueError;

pub const MAX_PENDING_UPLOADS: usize = 8;
pub const MAX_UPLOADED_FILES: usize = 32;
pub const UPLOAD_LOG_CAPACITY: usize = 16;
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    Csv,
    Log,
    Config,
    Other,
}

impl FileType {
    /// Classifies by extension, ignoring case. Images and unknown
    /// extensions are `Other`.
    pub fn from_path(path: &Path) -> Self {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => return FileType::Other,
        };
        match ext.as_str() {
            "csv" | "txt" => FileType::Csv,
            "log" => FileType::Log,
            "json" | "cfg" => FileType::Config,
            "jpg" | "jpeg" | "png" | "bmp" | "gif" | "webp" | "tiff" => FileType::Other,
            other => {
                warn!(extension = other, "Unsupported file format, uploading as other");
                FileType::Other
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Success,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// Slot can be handed to a new task.
    fn frees_slot(self) -> bool {
        matches!(self, UploadStatus::Success | UploadStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadTask {
    pub task_id: u32,
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: FileType,
    pub status: UploadStatus,
    pub progress: u8,
    pub uploaded_bytes: u64,
    /// Re-queues granted by `retry_failed`, capped at 3. A failed execution
    /// does not bump it; failures are counted in `attempts`, so a task gets
    /// three re-queues after its first failure rather than three executions.
    pub retry_count: u32,
    /// Executions that ended in failure.
    pub attempts: u32,
    pub data_points: u32,
    pub create_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
}

/// What enqueueing needs to know about a file, gathered before the queue lock.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub file_type: FileType,
    pub data_points: u32,
}

impl FileInfo {
    pub async fn inspect(path: &Path) -> Result<FileInfo, QueueError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => QueueError::NotFound(path.to_path_buf()),
            _ => QueueError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        if !meta.is_file() {
            return Err(QueueError::NotFound(path.to_path_buf()));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file_type = FileType::from_path(path);
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("csv"));
        let data_points = if is_csv {
            parse_csv_count(path).await.unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Could not count CSV rows");
                0
            })
        } else {
            0
        };

        Ok(FileInfo {
            path: path.to_path_buf(),
            name,
            size: meta.len(),
            file_type,
            data_points,
        })
    }
}

/// Counts non-empty lines after the header line.
pub async fn parse_csv_count(path: &Path) -> io::Result<u32> {
    let file = tokio::fs::File::open(path).await?;
    let mut segments = BufReader::new(file).split(b'\n');
    let mut count = 0u32;
    let mut header = true;
    while let Some(line) = segments.next_segment().await? {
        if header {
            header = false;
            continue;
        }
        let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
        if !line.is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// djb2 over the path bytes.
pub fn path_hash(path: &Path) -> u32 {
    path.to_string_lossy()
        .bytes()
        .fold(5381u32, |h, c| h.wrapping_mul(33).wrapping_add(u32::from(c)))
}

/// Hashes of uploaded file paths. Oldest entry drops out when full.
#[derive(Debug, Clone, Default)]
pub struct UploadedFiles {
    hashes: VecDeque<u32>,
}

impl UploadedFiles {
    pub fn from_hashes(hashes: impl IntoIterator<Item = u32>) -> Self {
        let hashes: VecDeque<u32> = hashes.into_iter().take(MAX_UPLOADED_FILES).collect();
        UploadedFiles { hashes }
    }

    pub fn from_blob(blob: &[u8]) -> Self {
        Self::from_hashes(
            blob.chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        )
    }

    pub fn to_blob(&self) -> Vec<u8> {
        self.hashes.iter().flat_map(|h| h.to_le_bytes()).collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.hashes.contains(&path_hash(path))
    }

    pub fn mark(&mut self, path: &Path) {
        if self.hashes.len() >= MAX_UPLOADED_FILES {
            self.hashes.pop_front();
        }
        self.hashes.push_back(path_hash(path));
    }

    pub fn hashes(&self) -> Vec<u32> {
        self.hashes.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadLogEntry {
    pub log_id: u32,
    pub file_name: String,
    pub data_points: u32,
    pub upload_time: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug)]
pub struct UploadLog {
    entries: VecDeque<UploadLogEntry>,
    next_log_id: u32,
}

impl Default for UploadLog {
    fn default() -> Self {
        UploadLog {
            entries: VecDeque::with_capacity(UPLOAD_LOG_CAPACITY),
            next_log_id: 1,
        }
    }
}

impl UploadLog {
    pub fn push(&mut self, file_name: &str, data_points: u32, success: bool, at: DateTime<Utc>) {
        if self.entries.len() >= UPLOAD_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(UploadLogEntry {
            log_id: self.next_log_id,
            file_name: file_name.to_string(),
            data_points,
            upload_time: at,
            success,
        });
        self.next_log_id = self.next_log_id.wrapping_add(1);
    }

    /// Oldest first.
    pub fn entries(&self, max: usize) -> Vec<UploadLogEntry> {
        self.entries.iter().take(max).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fixed set of task slots plus the de-dup ring and log ring.
///
/// Every method runs under the manager's single queue mutex.
#[derive(Debug)]
pub struct UploadQueue {
    slots: Vec<Option<UploadTask>>,
    next_task_id: u32,
    pending_count: u32,
    failed_count: u32,
    pub uploaded: UploadedFiles,
    pub log: UploadLog,
}

impl UploadQueue {
    pub fn new(uploaded: UploadedFiles) -> Self {
        UploadQueue {
            slots: vec![None; MAX_PENDING_UPLOADS],
            next_task_id: 1,
            pending_count: 0,
            failed_count: 0,
            uploaded,
            log: UploadLog::default(),
        }
    }

    pub fn pending_count(&self) -> u32 {
        self.pending_count
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    pub fn insert(&mut self, file: FileInfo, now: DateTime<Utc>) -> Result<u32, QueueError> {
        if self.uploaded.contains(&file.path) {
            warn!(path = %file.path.display(), "File already uploaded");
            return Err(QueueError::AlreadyUploaded);
        }

        let slot = self
            .slots
            .iter()
            .position(|s| s.as_ref().map_or(true, |t| t.status.frees_slot()))
            .ok_or(QueueError::QueueFull)?;

        let task_id = self.next_task_id;
        self.next_task_id += 1;

        info!(
            task_id,
            file = %file.name,
            size = file.size,
            "Upload task created"
        );
        self.slots[slot] = Some(UploadTask {
            task_id,
            file_path: file.path,
            file_name: file.name,
            file_size: file.size,
            file_type: file.file_type,
            status: UploadStatus::Pending,
            progress: 0,
            uploaded_bytes: 0,
            retry_count: 0,
            attempts: 0,
            data_points: file.data_points,
            create_time: now,
            complete_time: None,
            error_msg: None,
        });
        self.pending_count += 1;
        Ok(task_id)
    }

    /// Only Pending or Uploading tasks can be cancelled.
    pub fn cancel(&mut self, task_id: u32) -> Result<(), QueueError> {
        let task = self
            .tasks_mut()
            .find(|t| {
                t.task_id == task_id
                    && matches!(t.status, UploadStatus::Pending | UploadStatus::Uploading)
            })
            .ok_or(QueueError::TaskNotFound(task_id))?;
        task.status = UploadStatus::Cancelled;
        self.pending_count = self.pending_count.saturating_sub(1);
        info!(task_id, "Upload task cancelled");
        Ok(())
    }

    /// Moves Failed tasks with retries left back to Pending.
    pub fn retry_failed(&mut self) -> u32 {
        let mut retried = 0;
        for task in self.slots.iter_mut().flatten() {
            if task.status == UploadStatus::Failed && task.retry_count < MAX_RETRIES {
                task.status = UploadStatus::Pending;
                task.retry_count += 1;
                retried += 1;
            }
        }
        self.pending_count += retried;
        self.failed_count = self.failed_count.saturating_sub(retried);
        if retried > 0 {
            info!(retried, "Retrying failed uploads");
        }
        retried
    }

    /// Pending, Uploading and Failed tasks in slot order.
    pub fn pending(&self, max: usize) -> Vec<UploadTask> {
        self.tasks()
            .filter(|t| {
                matches!(
                    t.status,
                    UploadStatus::Pending | UploadStatus::Uploading | UploadStatus::Failed
                )
            })
            .take(max)
            .cloned()
            .collect()
    }

    pub fn task(&self, task_id: u32) -> Option<UploadTask> {
        self.tasks().find(|t| t.task_id == task_id).cloned()
    }

    /// Slot of a Pending task: the given id, or the first one for `None`.
    pub fn find_pending(&self, task_id: Option<u32>) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref().map_or(false, |t| {
                t.status == UploadStatus::Pending && task_id.map_or(true, |id| t.task_id == id)
            })
        })
    }

    /// Marks the task in `slot` as Uploading and hands it out.
    pub fn start(&mut self, slot: usize) -> Option<&mut UploadTask> {
        let task = self.slots.get_mut(slot)?.as_mut()?;
        if task.status != UploadStatus::Pending {
            return None;
        }
        task.status = UploadStatus::Uploading;
        task.error_msg = None;
        Some(task)
    }

    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut UploadTask> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Applies the executor's outcome to the task in `slot` and returns the
    /// final task state.
    pub fn finish(
        &mut self,
        slot: usize,
        outcome: Result<(), String>,
        now: DateTime<Utc>,
    ) -> Option<UploadTask> {
        let task = self.slots.get_mut(slot)?.as_mut()?;
        self.pending_count = self.pending_count.saturating_sub(1);
        match outcome {
            Ok(()) => {
                task.status = UploadStatus::Success;
                task.complete_time = Some(now);
                task.progress = 100;
                task.uploaded_bytes = task.file_size;
                task.error_msg = None;
                let done = task.clone();
                self.uploaded.mark(&done.file_path);
                self.log.push(&done.file_name, done.data_points, true, now);
                Some(done)
            }
            Err(msg) => {
                task.status = UploadStatus::Failed;
                task.attempts += 1;
                task.error_msg = Some(msg);
                let done = task.clone();
                self.failed_count += 1;
                self.log.push(&done.file_name, 0, false, now);
                Some(done)
            }
        }
    }

    fn tasks(&self) -> impl Iterator<Item = &UploadTask> {
        self.slots.iter().flatten()
    }

    fn tasks_mut(&mut self) -> impl Iterator<Item = &mut UploadTask> {
        self.slots.iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn info(path: &str) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            name: Path::new(path).file_name().unwrap().to_string_lossy().into_owned(),
            size: 100,
            file_type: FileType::from_path(Path::new(path)),
            data_points: 0,
        }
    }

    fn fail(queue: &mut UploadQueue, task_id: u32) {
        let slot = queue.find_pending(Some(task_id)).unwrap();
        queue.start(slot).unwrap();
        queue.finish(slot, Err("boom".into()), Utc::now());
    }

    #[test]
    fn classifies_by_extension() {
        assert_eq!(FileType::from_path(Path::new("a/b.CSV")), FileType::Csv);
        assert_eq!(FileType::from_path(Path::new("notes.txt")), FileType::Csv);
        assert_eq!(FileType::from_path(Path::new("boot.log")), FileType::Log);
        assert_eq!(FileType::from_path(Path::new("x.Json")), FileType::Config);
        assert_eq!(FileType::from_path(Path::new("shot.bmp")), FileType::Other);
        assert_eq!(FileType::from_path(Path::new("archive.zip")), FileType::Other);
        assert_eq!(FileType::from_path(Path::new("README")), FileType::Other);
    }

    #[test]
    fn djb2_matches_reference_values() {
        assert_eq!(path_hash(Path::new("")), 5381);
        assert_eq!(path_hash(Path::new("a")), 177_670);
        // wraps rather than overflowing
        let long = "x".repeat(64);
        path_hash(Path::new(&long));
    }

    #[test]
    fn task_ids_increase_across_slot_reuse() {
        let mut queue = UploadQueue::new(UploadedFiles::default());
        let mut last = 0;
        for i in 0..20 {
            let id = queue.insert(info(&format!("/sd/f{}.bmp", i)), Utc::now()).unwrap();
            assert!(id > last);
            last = id;
            queue.cancel(id).unwrap();
        }
        assert_eq!(last, 20);
    }

    #[test]
    fn full_queue_rejects_until_a_slot_frees() {
        let mut queue = UploadQueue::new(UploadedFiles::default());
        for i in 0..MAX_PENDING_UPLOADS {
            queue.insert(info(&format!("/sd/f{}.bmp", i)), Utc::now()).unwrap();
        }
        assert!(matches!(
            queue.insert(info("/sd/extra.bmp"), Utc::now()),
            Err(QueueError::QueueFull)
        ));

        fail(&mut queue, 1);
        assert!(matches!(
            queue.insert(info("/sd/extra.bmp"), Utc::now()),
            Err(QueueError::QueueFull)
        ));

        queue.cancel(2).unwrap();
        assert_eq!(queue.insert(info("/sd/extra.bmp"), Utc::now()).unwrap(), 9);
    }

    #[test]
    fn uploaded_paths_are_rejected_even_when_full() {
        let mut queue = UploadQueue::new(UploadedFiles::default());
        queue.uploaded.mark(Path::new("/sd/done.bmp"));
        for i in 0..MAX_PENDING_UPLOADS {
            queue.insert(info(&format!("/sd/f{}.bmp", i)), Utc::now()).unwrap();
        }
        assert!(matches!(
            queue.insert(info("/sd/done.bmp"), Utc::now()),
            Err(QueueError::AlreadyUploaded)
        ));
    }

    #[test]
    fn only_active_tasks_can_be_cancelled() {
        let mut queue = UploadQueue::new(UploadedFiles::default());
        let a = queue.insert(info("/sd/a.bmp"), Utc::now()).unwrap();
        let b = queue.insert(info("/sd/b.bmp"), Utc::now()).unwrap();
        let c = queue.insert(info("/sd/c.bmp"), Utc::now()).unwrap();

        let slot = queue.find_pending(Some(b)).unwrap();
        queue.start(slot).unwrap();
        queue.cancel(b).unwrap();

        fail(&mut queue, c);
        assert!(matches!(queue.cancel(c), Err(QueueError::TaskNotFound(_))));

        queue.cancel(a).unwrap();
        assert!(matches!(queue.cancel(a), Err(QueueError::TaskNotFound(_))));
        assert!(matches!(queue.cancel(999), Err(QueueError::TaskNotFound(999))));
    }

    #[test]
    fn retries_stop_after_three() {
        let mut queue = UploadQueue::new(UploadedFiles::default());
        let id = queue.insert(info("/sd/a.bmp"), Utc::now()).unwrap();

        fail(&mut queue, id);
        for _ in 0..MAX_RETRIES {
            assert_eq!(queue.retry_failed(), 1);
            fail(&mut queue, id);
        }
        assert_eq!(queue.retry_failed(), 0);
        assert_eq!(queue.retry_failed(), 0);

        let task = queue.task(id).unwrap();
        assert_eq!(task.status, UploadStatus::Failed);
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.attempts, 4);
        assert_eq!(queue.failed_count(), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn pending_lists_unfinished_tasks_in_slot_order() {
        let mut queue = UploadQueue::new(UploadedFiles::default());
        let a = queue.insert(info("/sd/a.bmp"), Utc::now()).unwrap();
        let b = queue.insert(info("/sd/b.bmp"), Utc::now()).unwrap();
        let c = queue.insert(info("/sd/c.bmp"), Utc::now()).unwrap();
        let d = queue.insert(info("/sd/d.bmp"), Utc::now()).unwrap();

        let slot = queue.find_pending(Some(a)).unwrap();
        queue.start(slot).unwrap();
        queue.finish(slot, Ok(()), Utc::now());
        fail(&mut queue, b);
        queue.cancel(d).unwrap();

        let ids: Vec<u32> = queue.pending(10).iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![b, c]);
        assert_eq!(queue.pending(1).len(), 1);
        assert!(queue.uploaded.contains(Path::new("/sd/a.bmp")));
    }

    #[test]
    fn dedup_ring_evicts_oldest_first() {
        let mut ring = UploadedFiles::default();
        for i in 0..MAX_UPLOADED_FILES {
            ring.mark(Path::new(&format!("/sd/{}.bmp", i)));
        }
        assert!(ring.contains(Path::new("/sd/0.bmp")));

        ring.mark(Path::new("/sd/new.bmp"));
        assert_eq!(ring.len(), MAX_UPLOADED_FILES);
        assert!(!ring.contains(Path::new("/sd/0.bmp")));
        assert!(ring.contains(Path::new("/sd/1.bmp")));
        assert!(ring.contains(Path::new("/sd/new.bmp")));

        let restored = UploadedFiles::from_blob(&ring.to_blob());
        assert_eq!(restored.hashes(), ring.hashes());
    }

    #[test]
    fn log_ring_keeps_newest_entries() {
        let mut log = UploadLog::default();
        for i in 0..(UPLOAD_LOG_CAPACITY + 4) {
            log.push(&format!("f{}", i), 1, true, Utc::now());
        }
        let entries = log.entries(100);
        assert_eq!(entries.len(), UPLOAD_LOG_CAPACITY);
        assert_eq!(entries[0].file_name, "f4");
        assert_eq!(entries[0].log_id, 5);
        log.clear();
        assert!(log.entries(100).is_empty());
    }

    #[tokio::test]
    async fn csv_count_skips_header_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "time,volts\r\n0,1.0\r\n1,1.5\r\n\r\n2,2.0").unwrap();
        drop(f);

        assert_eq!(parse_csv_count(&path).await.unwrap(), 3);
        let info = FileInfo::inspect(&path).await.unwrap();
        assert_eq!(info.data_points, 3);
        assert_eq!(info.file_type, FileType::Csv);
        assert_eq!(info.name, "wave.csv");
    }

    #[tokio::test]
    async fn inspect_reports_missing_files() {
        let err = FileInfo::inspect(Path::new("/definitely/not/here.bmp")).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }
}
