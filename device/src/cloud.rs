use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::activation::{self, AccessPoint, ActivationServer};
use crate::config::Config;
use crate::credentials::{
    generate_device_code, parse_mac, ActivationState, CredentialStore, DeviceCredentials, DeviceIdentity,
    Location, NAMESPACE,
};
use crate::error::{ActivationError, ApiError, CredentialError, QueueError, StoreError};
use crate::link::LinkState;
use crate::net;
use crate::queue::{FileInfo, UploadLogEntry, UploadQueue, UploadStatus, UploadTask, UploadedFiles, MAX_PENDING_UPLOADS};
use crate::stats::{
    self, clamp_interval_minutes, load_counters, millis_to_minutes, save_counters, seconds_to_minutes,
    AutoUploadSettings, SyncKind, SyncStatus, TodayStats,
};
use crate::storage::{KvStore, Namespace};
use crate::telemetry::{LocationSchedule, SampleBuffer};
use crate::uploader::{OneNetUploader, UploadExecutor, UploadTarget};

const KEY_FILE_HASHES: &str = "file_hash";
const KEY_FILE_HASH_COUNT: &str = "hash_cnt";

const AUTO_UPLOAD_MIN_INTERVAL_MINUTES: u32 = 1;
const AUTO_UPLOAD_MAX_INTERVAL_MINUTES: u32 = 60;
const EVENT_CAPACITY: usize = 64;
const UNKNOWN_MAC: &str = "00:00:00:00:00:00";

#[derive(Debug, Clone, PartialEq)]
pub enum CloudEvent {
    Activation(ActivationState),
    UploadProgress {
        task_id: u32,
        progress: u8,
        uploaded_bytes: u64,
    },
    UploadCompleted {
        task_id: u32,
        success: bool,
        error: Option<String>,
    },
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the device identity, the upload queue and every counter around them.
/// One instance per process; `process()` is its periodic tick.
pub struct CloudManager<E: UploadExecutor = OneNetUploader> {
    config: Arc<Config>,
    kv: Arc<KvStore>,
    store: CredentialStore,
    client: Client,
    executor: E,
    link: LinkState,
    identity: RwLock<DeviceIdentity>,
    queue: tokio::sync::Mutex<UploadQueue>,
    status: Mutex<SyncStatus>,
    today: Mutex<TodayStats>,
    settings: Mutex<AutoUploadSettings>,
    online: AtomicBool,
    events: broadcast::Sender<CloudEvent>,
    last_auto_upload: Mutex<Instant>,
    samples: Mutex<SampleBuffer>,
    location: LocationSchedule,
}

impl CloudManager<OneNetUploader> {
    /// Manager wired to the real OneNET file API.
    pub fn with_onenet(config: Arc<Config>, kv: Arc<KvStore>, link: LinkState) -> Self {
        let client = Client::new();
        let executor = OneNetUploader::new(client.clone(), config.clone());
        CloudManager::new(config, kv, client, executor, link)
    }
}

impl<E: UploadExecutor> CloudManager<E> {
    /// Restores identity, settings, counters and the uploaded-file ring.
    /// Anything unreadable falls back to its default and is logged.
    pub fn new(config: Arc<Config>, kv: Arc<KvStore>, client: Client, executor: E, link: LinkState) -> Self {
        let store = CredentialStore::new(kv.clone());

        let mut identity = match store.load() {
            Ok(Some(identity)) => identity,
            Ok(None) => DeviceIdentity::default(),
            Err(e) => {
                warn!(error = %e, "Could not load device identity, treating as not activated");
                DeviceIdentity::default()
            }
        };
        match store.load_location() {
            Ok(Some(location)) => {
                identity.longitude = location.longitude;
                identity.latitude = location.latitude;
                identity.location_name = location.name;
            }
            Ok(None) => {
                identity.longitude = config.default_longitude;
                identity.latitude = config.default_latitude;
            }
            Err(e) => {
                warn!(error = %e, "Could not load location, using defaults");
                identity.longitude = config.default_longitude;
                identity.latitude = config.default_latitude;
            }
        }

        let ns = kv.namespace(NAMESPACE);
        let settings = AutoUploadSettings::load(&ns).unwrap_or_else(|e| {
            warn!(error = %e, "Could not load auto-upload settings");
            AutoUploadSettings::default()
        });
        let (status, today) = load_counters(&ns).unwrap_or_else(|e| {
            warn!(error = %e, "Could not load upload counters");
            (SyncStatus::default(), TodayStats::default())
        });
        let uploaded = load_uploaded(&ns).unwrap_or_else(|e| {
            warn!(error = %e, "Could not load uploaded file hashes");
            UploadedFiles::default()
        });

        info!(
            activated = identity.is_activated(),
            device_name = %identity.device_name,
            uploaded_files = uploaded.len(),
            "Cloud manager initialized"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        CloudManager {
            config,
            store,
            client,
            executor,
            link,
            identity: RwLock::new(identity),
            queue: tokio::sync::Mutex::new(UploadQueue::new(uploaded)),
            status: Mutex::new(status),
            today: Mutex::new(today),
            settings: Mutex::new(settings),
            online: AtomicBool::new(false),
            events,
            last_auto_upload: Mutex::new(Instant::now()),
            samples: Mutex::new(SampleBuffer::default()),
            location: LocationSchedule::default(),
            kv,
        }
    }

    fn ns(&self) -> Namespace<'_> {
        self.kv.namespace(NAMESPACE)
    }

    fn read_identity(&self) -> RwLockReadGuard<'_, DeviceIdentity> {
        self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_identity(&self) -> RwLockWriteGuard<'_, DeviceIdentity> {
        self.identity.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: CloudEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ActivationState) {
        self.write_identity().state = state;
        self.publish(CloudEvent::Activation(state));
    }

    fn adopt(&self, identity: DeviceIdentity) {
        *self.write_identity() = identity;
        self.publish(CloudEvent::Activation(ActivationState::Activated));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CloudEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    pub fn location_schedule(&self) -> &LocationSchedule {
        &self.location
    }

    // ---- identity & activation ----

    pub fn is_activated(&self) -> bool {
        self.read_identity().is_activated()
    }

    pub fn state(&self) -> ActivationState {
        self.read_identity().state
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.read_identity().clone()
    }

    pub fn needs_activation(&self) -> bool {
        self.read_identity().needs_activation()
    }

    /// The device code, generated from the MAC on first use.
    pub fn device_code(&self) -> String {
        let mut identity = self.write_identity();
        if identity.device_code.is_empty() {
            let mac = self.config.mac_address.as_deref().and_then(parse_mac);
            identity.device_code = generate_device_code(mac);
        }
        identity.device_code.clone()
    }

    pub fn device_credentials(&self) -> Result<DeviceCredentials, CredentialError> {
        self.read_identity().credentials(&self.config.product_id)
    }

    /// Records an activation obtained elsewhere and persists it.
    pub fn set_activated(
        &self,
        device_id: &str,
        product_id: &str,
        device_name: &str,
        secret_key: &str,
    ) -> Result<(), StoreError> {
        let mut identity = self.identity();
        identity.activate(device_id, product_id, device_name, secret_key, Utc::now());
        self.store.save(&identity)?;
        info!(device_id, device_name, "Device activated");
        self.adopt(identity);
        Ok(())
    }

    /// Forgets the activation. Location, settings and counters stay.
    pub fn clear_activation(&self) -> Result<(), StoreError> {
        self.store.clear()?;
        {
            let mut identity = self.write_identity();
            *identity = DeviceIdentity {
                longitude: identity.longitude,
                latitude: identity.latitude,
                location_name: std::mem::take(&mut identity.location_name),
                ..DeviceIdentity::default()
            };
        }
        self.online.store(false, Ordering::SeqCst);
        self.publish(CloudEvent::Activation(ActivationState::NotActivated));
        Ok(())
    }

    /// Registers directly against the device-create API. Needs the link up.
    pub async fn register_direct(&self) -> Result<DeviceIdentity, ActivationError> {
        if !self.link.is_connected() {
            return Err(ActivationError::NotConnected);
        }
        self.set_state(ActivationState::Activating);
        let base = self.identity();
        match activation::register_device(&self.client, &self.config, &self.store, &base).await {
            Ok(identity) => {
                self.adopt(identity.clone());
                Ok(identity)
            }
            Err(e) => {
                error!(error = %e, "Device activation failed");
                self.set_state(ActivationState::Error);
                Err(e)
            }
        }
    }

    /// Starts activation. An activated device reports `Activated` at once;
    /// without a link the state stays `Activating` until the caller retries.
    pub async fn start_activation(&self) -> Result<ActivationState, ActivationError> {
        if self.is_activated() {
            warn!("Device already activated");
            self.publish(CloudEvent::Activation(ActivationState::Activated));
            return Ok(ActivationState::Activated);
        }
        self.set_state(ActivationState::Activating);
        self.device_code();

        if !self.link.is_connected() {
            warn!("WiFi not connected, waiting for connection");
            return Ok(ActivationState::Activating);
        }
        self.register_direct().await?;
        Ok(ActivationState::Activated)
    }

    /// Runs the SoftAP flow: serve the activation page until a registration
    /// succeeds, then tear the server down.
    pub async fn activate_via_softap<A: AccessPoint>(
        &self,
        server: &ActivationServer<A>,
    ) -> Result<DeviceIdentity, ActivationError> {
        if self.is_activated() {
            return Ok(self.identity());
        }
        self.set_state(ActivationState::Activating);
        self.device_code();

        if let Err(e) = server.start(self.identity()).await {
            self.set_state(ActivationState::Error);
            return Err(e);
        }
        let outcome = server.wait_for_completion().await;
        if let Err(e) = server.stop().await {
            warn!(error = %e, "Activation server stop failed");
        }

        match outcome {
            Ok(identity) => {
                self.adopt(identity.clone());
                Ok(identity)
            }
            Err(e) => {
                self.set_state(ActivationState::Error);
                Err(e)
            }
        }
    }

    /// Stores a location fix used by later registrations.
    pub fn set_location(&self, longitude: f64, latitude: f64, name: &str) -> Result<(), StoreError> {
        self.store.save_location(&Location {
            longitude,
            latitude,
            name: name.to_string(),
        })?;
        {
            let mut identity = self.write_identity();
            identity.longitude = longitude;
            identity.latitude = latitude;
            identity.location_name = name.to_string();
        }
        lock(&self.status).touch(SyncKind::Location, Utc::now());
        Ok(())
    }

    // ---- upload queue ----

    pub async fn enqueue(&self, path: impl AsRef<Path>) -> Result<u32, QueueError> {
        let info = FileInfo::inspect(path.as_ref()).await?;
        let mut queue = self.queue.lock().await;
        let task_id = queue.insert(info, Utc::now())?;
        self.sync_counts(&queue);
        Ok(task_id)
    }

    pub async fn cancel(&self, task_id: u32) -> Result<(), QueueError> {
        let mut queue = self.queue.lock().await;
        queue.cancel(task_id)?;
        self.sync_counts(&queue);
        Ok(())
    }

    pub async fn retry_failed(&self) -> u32 {
        let mut queue = self.queue.lock().await;
        let retried = queue.retry_failed();
        self.sync_counts(&queue);
        retried
    }

    pub async fn pending_uploads(&self, max: usize) -> Vec<UploadTask> {
        self.queue.lock().await.pending(max)
    }

    pub async fn upload_task(&self, task_id: u32) -> Option<UploadTask> {
        self.queue.lock().await.task(task_id)
    }

    /// Runs one Pending task now; `0` picks the first one.
    pub async fn execute_pending_upload(&self, task_id: u32) -> Result<UploadTask, QueueError> {
        let mut queue = self.queue.lock().await;
        let wanted = (task_id != 0).then_some(task_id);
        let slot = queue.find_pending(wanted).ok_or(QueueError::TaskNotFound(task_id))?;
        self.run_slot(&mut queue, slot)
            .await
            .ok_or(QueueError::TaskNotFound(task_id))
    }

    fn upload_target(&self) -> UploadTarget {
        let identity = self.read_identity();
        UploadTarget {
            product_id: if identity.product_id.is_empty() {
                self.config.product_id.clone()
            } else {
                identity.product_id.clone()
            },
            device_name: identity.device_name.clone(),
        }
    }

    /// Uploads the Pending task in `slot` and applies the outcome to the
    /// queue, counters and event stream. Caller holds the queue lock.
    async fn run_slot(&self, queue: &mut UploadQueue, slot: usize) -> Option<UploadTask> {
        let target = self.upload_target();
        let task = queue.start(slot)?;
        info!(task_id = task.task_id, file = %task.file_name, "Uploading file");

        let events = self.events.clone();
        let progress = move |task_id: u32, progress: u8, uploaded_bytes: u64| {
            let _ = events.send(CloudEvent::UploadProgress {
                task_id,
                progress,
                uploaded_bytes,
            });
        };
        let outcome = self
            .executor
            .execute(task, &target, &progress)
            .await
            .map_err(|e| e.to_string());

        let now = Utc::now();
        let done = queue.finish(slot, outcome, now)?;
        if done.status == UploadStatus::Success {
            lock(&self.today).record_upload(done.file_size, done.data_points, now);
            lock(&self.status).total_uploaded += 1;
            if let Err(e) = self.persist_uploaded(&queue.uploaded) {
                warn!(error = %e, "Could not persist uploaded file hashes");
            }
            if let Err(e) = self.persist_counters() {
                warn!(error = %e, "Could not persist upload counters");
            }
            info!(task_id = done.task_id, file = %done.file_name, "Upload completed");
        } else {
            lock(&self.today).record_failure();
            error!(task_id = done.task_id, file = %done.file_name, error = ?done.error_msg, "Upload failed");
        }
        self.sync_counts(queue);

        self.publish(CloudEvent::UploadCompleted {
            task_id: done.task_id,
            success: done.status == UploadStatus::Success,
            error: done.error_msg.clone(),
        });
        Some(done)
    }

    fn sync_counts(&self, queue: &UploadQueue) {
        let mut status = lock(&self.status);
        status.pending_count = queue.pending_count();
        status.failed_count = queue.failed_count();
    }

    /// The periodic tick: drain Pending tasks one at a time, then run the
    /// auto-upload schedule.
    pub async fn process(&self) {
        let connected = self.online.load(Ordering::SeqCst);
        lock(&self.status).is_connected = connected;
        if !connected && !self.is_activated() {
            return;
        }

        {
            let mut queue = self.queue.lock().await;
            for slot in 0..MAX_PENDING_UPLOADS {
                self.run_slot(&mut queue, slot).await;
            }
        }

        self.auto_upload_at(Instant::now()).await;
    }

    /// Returns true when the auto-upload interval elapsed and a round ran.
    async fn auto_upload_at(&self, now: Instant) -> bool {
        let settings = self.auto_settings();
        if !(settings.enabled && self.is_activated() && self.link.is_connected()) {
            return false;
        }
        let minutes = settings
            .interval_minutes
            .clamp(AUTO_UPLOAD_MIN_INTERVAL_MINUTES, AUTO_UPLOAD_MAX_INTERVAL_MINUTES);
        let interval = Duration::from_secs(u64::from(minutes) * 60);
        {
            let mut last = lock(&self.last_auto_upload);
            if now.saturating_duration_since(*last) < interval {
                return false;
            }
            *last = now;
        }
        info!(interval_min = minutes, "Auto upload triggered");

        if settings.upload_oscilloscope {
            match self.report_samples_batch().await {
                Ok(0) => info!("No oscilloscope data buffered, skipping upload"),
                Ok(points) => {
                    let at = Utc::now();
                    lock(&self.status).touch(SyncKind::Oscilloscope, at);
                    let mut today = lock(&self.today);
                    today.upload_count += 1;
                    today.data_points = today.data_points.saturating_add(points);
                }
                Err(e) => warn!(error = %e, "Oscilloscope batch upload failed"),
            }
        }

        if settings.upload_location && self.location.is_reporting() {
            let interval_ms = u64::from(minutes) * 60_000;
            self.location.set_interval_ms(interval_ms);
            info!(interval_min = minutes, "Location report interval synced");
        }
        true
    }

    // ---- device-level reporting ----

    fn ready_credentials(&self) -> Result<DeviceCredentials, ApiError> {
        if !self.link.is_connected() {
            return Err(ApiError::NotConnected);
        }
        Ok(self.device_credentials()?)
    }

    pub async fn set_device_online(&self, online: bool) -> Result<(), ApiError> {
        let creds = self.ready_credentials()?;
        let mac = self.config.mac_address.as_deref().unwrap_or(UNKNOWN_MAC);
        net::set_device_online(&self.client, &self.config, &creds, online, mac).await?;
        self.online.store(online, Ordering::SeqCst);
        let mut status = lock(&self.status);
        status.is_connected = online;
        status.touch(SyncKind::DeviceStatus, Utc::now());
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Posts a OneJSON property object, e.g. `{"voltage": {"value": 3.3}}`.
    pub async fn report_properties(&self, params: Value) -> Result<(), ApiError> {
        let creds = self.ready_credentials()?;
        net::post_properties(&self.client, &self.config, &creds, params).await?;
        lock(&self.status).touch(SyncKind::Sensor, Utc::now());
        Ok(())
    }

    /// Buffers one probe reading; a full buffer is reported right away.
    pub async fn record_sample(&self, volts: f32) {
        let full = lock(&self.samples).record(volts, Utc::now().timestamp_millis());
        if full && self.is_activated() && self.link.is_connected() {
            if let Err(e) = self.report_samples_batch().await {
                warn!(error = %e, "Sample batch report failed");
            }
        }
    }

    pub fn buffered_samples(&self) -> usize {
        lock(&self.samples).len()
    }

    /// Posts the newest buffered sample and clears the buffer. Returns how
    /// many samples the batch covered.
    pub async fn report_samples_batch(&self) -> Result<u32, ApiError> {
        let creds = self.ready_credentials()?;
        let (sample, count) = {
            let samples = lock(&self.samples);
            (samples.last(), samples.len())
        };
        let Some(sample) = sample else {
            return Ok(0);
        };
        net::post_pack(&self.client, &self.config, &creds, sample).await?;
        lock(&self.samples).clear();
        info!(count, "Oscilloscope batch reported");
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    // ---- settings ----

    pub fn auto_settings(&self) -> AutoUploadSettings {
        *lock(&self.settings)
    }

    pub fn set_auto_settings(&self, settings: AutoUploadSettings) -> Result<(), StoreError> {
        let settings = AutoUploadSettings {
            interval_minutes: clamp_interval_minutes(settings.interval_minutes),
            ..settings
        };
        settings.save(&self.ns())?;
        *lock(&self.settings) = settings;
        Ok(())
    }

    pub fn set_auto_upload_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.set_auto_settings(AutoUploadSettings {
            enabled,
            ..self.auto_settings()
        })
    }

    pub fn set_auto_interval(&self, minutes: u32) -> Result<(), StoreError> {
        self.set_auto_settings(AutoUploadSettings {
            interval_minutes: minutes,
            ..self.auto_settings()
        })
    }

    pub fn set_auto_interval_seconds(&self, seconds: u32) -> Result<(), StoreError> {
        self.set_auto_interval(seconds_to_minutes(seconds))
    }

    pub fn set_auto_interval_ms(&self, ms: u32) -> Result<(), StoreError> {
        self.set_auto_interval(millis_to_minutes(ms))
    }

    // ---- status & statistics ----

    pub fn sync_status(&self) -> SyncStatus {
        lock(&self.status).clone()
    }

    pub fn last_sync_time(&self, kind: SyncKind) -> Option<chrono::DateTime<Utc>> {
        lock(&self.status).last_sync(kind)
    }

    pub fn format_last_sync(&self, kind: SyncKind) -> String {
        stats::format_last_sync(self.last_sync_time(kind), Utc::now())
    }

    pub fn today_stats(&self) -> TodayStats {
        lock(&self.today).clone()
    }

    pub fn total_uploaded(&self) -> u32 {
        lock(&self.status).total_uploaded
    }

    pub async fn upload_logs(&self, max: usize) -> Vec<UploadLogEntry> {
        self.queue.lock().await.log.entries(max)
    }

    pub async fn clear_logs(&self) {
        self.queue.lock().await.log.clear();
    }

    // ---- uploaded-file ring ----

    pub async fn is_file_uploaded(&self, path: impl AsRef<Path>) -> bool {
        self.queue.lock().await.uploaded.contains(path.as_ref())
    }

    pub async fn mark_file_uploaded(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let mut queue = self.queue.lock().await;
        queue.uploaded.mark(path.as_ref());
        self.persist_uploaded(&queue.uploaded)
    }

    pub async fn uploaded_file_hashes(&self) -> Vec<u32> {
        self.queue.lock().await.uploaded.hashes()
    }

    fn persist_uploaded(&self, uploaded: &UploadedFiles) -> Result<(), StoreError> {
        let ns = self.ns();
        let count = u32::try_from(uploaded.len()).unwrap_or(u32::MAX);
        ns.set_u32(KEY_FILE_HASH_COUNT, count)?;
        ns.set_blob(KEY_FILE_HASHES, &uploaded.to_blob())
    }

    fn persist_counters(&self) -> Result<(), StoreError> {
        let status = self.sync_status();
        let today = self.today_stats();
        save_counters(&self.ns(), &status, &today)
    }

    /// Persists settings, counters and the uploaded-file ring.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let settings = self.auto_settings();
        settings.save(&self.ns())?;
        self.persist_counters()?;
        let queue = self.queue.lock().await;
        self.persist_uploaded(&queue.uploaded)?;
        info!("Cloud manager state saved");
        Ok(())
    }
}

fn load_uploaded(ns: &Namespace<'_>) -> Result<UploadedFiles, StoreError> {
    let count = ns.get_u32(KEY_FILE_HASH_COUNT)?.unwrap_or(0) as usize;
    if count == 0 {
        return Ok(UploadedFiles::default());
    }
    let blob = ns.get_blob(KEY_FILE_HASHES)?.unwrap_or_default();
    let len = blob.len().min(count * 4);
    Ok(UploadedFiles::from_blob(&blob[..len]))
}
