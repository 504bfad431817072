use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::storage::Namespace;

const KEY_AUTO_ENABLED: &str = "auto_enabled";
const KEY_AUTO_INTERVAL: &str = "auto_interval";
const KEY_AUTO_SENSOR: &str = "auto_sensor";
const KEY_AUTO_OSCILLOSCOPE: &str = "auto_osc";
const KEY_AUTO_LOCATION: &str = "auto_loc";
const KEY_TOTAL_UPLOAD: &str = "total_upload";
const KEY_UPLOAD_COUNT: &str = "upload_cnt";
const KEY_BYTES_UPLOADED: &str = "bytes_up";
const KEY_DATA_POINTS: &str = "data_pts";

pub const MIN_INTERVAL_MINUTES: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 1440;
pub const DEFAULT_INTERVAL_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    Sensor,
    DeviceStatus,
    Location,
    Oscilloscope,
}

impl SyncKind {
    fn index(self) -> usize {
        match self {
            SyncKind::Sensor => 0,
            SyncKind::DeviceStatus => 1,
            SyncKind::Location => 2,
            SyncKind::Oscilloscope => 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_connected: bool,
    pub total_uploaded: u32,
    pub today_uploaded: u32,
    pub last_sync_time: [Option<DateTime<Utc>>; 4],
    pub pending_count: u32,
    pub failed_count: u32,
}

impl SyncStatus {
    pub fn last_sync(&self, kind: SyncKind) -> Option<DateTime<Utc>> {
        self.last_sync_time[kind.index()]
    }

    pub fn touch(&mut self, kind: SyncKind, at: DateTime<Utc>) {
        self.last_sync_time[kind.index()] = Some(at);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TodayStats {
    pub upload_count: u32,
    pub data_points: u32,
    pub bytes_uploaded: u64,
    pub failed_count: u32,
    pub first_upload_time: Option<DateTime<Utc>>,
    pub last_upload_time: Option<DateTime<Utc>>,
}

impl TodayStats {
    pub fn record_upload(&mut self, bytes: u64, data_points: u32, at: DateTime<Utc>) {
        self.upload_count += 1;
        self.data_points = self.data_points.saturating_add(data_points);
        self.bytes_uploaded = self.bytes_uploaded.saturating_add(bytes);
        self.last_upload_time = Some(at);
        self.first_upload_time.get_or_insert(at);
    }

    pub fn record_failure(&mut self) {
        self.failed_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoUploadSettings {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub upload_sensor_data: bool,
    pub upload_oscilloscope: bool,
    pub upload_location: bool,
}

impl Default for AutoUploadSettings {
    fn default() -> Self {
        AutoUploadSettings {
            enabled: false,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            upload_sensor_data: true,
            upload_oscilloscope: true,
            upload_location: true,
        }
    }
}

pub fn clamp_interval_minutes(minutes: u32) -> u32 {
    minutes.clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES)
}

pub fn seconds_to_minutes(seconds: u32) -> u32 {
    seconds.div_ceil(60)
}

pub fn millis_to_minutes(ms: u32) -> u32 {
    ms.div_ceil(60_000)
}

impl AutoUploadSettings {
    pub fn load(ns: &Namespace<'_>) -> Result<Self, StoreError> {
        let defaults = AutoUploadSettings::default();
        let interval = match ns.get_u32(KEY_AUTO_INTERVAL)? {
            Some(0) | None => defaults.interval_minutes,
            Some(m) => clamp_interval_minutes(m),
        };
        Ok(AutoUploadSettings {
            enabled: ns.get_bool(KEY_AUTO_ENABLED)?.unwrap_or(defaults.enabled),
            interval_minutes: interval,
            upload_sensor_data: ns.get_bool(KEY_AUTO_SENSOR)?.unwrap_or(defaults.upload_sensor_data),
            upload_oscilloscope: ns
                .get_bool(KEY_AUTO_OSCILLOSCOPE)?
                .unwrap_or(defaults.upload_oscilloscope),
            upload_location: ns.get_bool(KEY_AUTO_LOCATION)?.unwrap_or(defaults.upload_location),
        })
    }

    pub fn save(&self, ns: &Namespace<'_>) -> Result<(), StoreError> {
        ns.set_bool(KEY_AUTO_ENABLED, self.enabled)?;
        ns.set_u32(KEY_AUTO_INTERVAL, self.interval_minutes)?;
        ns.set_bool(KEY_AUTO_SENSOR, self.upload_sensor_data)?;
        ns.set_bool(KEY_AUTO_OSCILLOSCOPE, self.upload_oscilloscope)?;
        ns.set_bool(KEY_AUTO_LOCATION, self.upload_location)?;
        Ok(())
    }
}

/// Restores persisted counters into fresh status and stats records.
pub fn load_counters(ns: &Namespace<'_>) -> Result<(SyncStatus, TodayStats), StoreError> {
    let status = SyncStatus {
        total_uploaded: ns.get_u32(KEY_TOTAL_UPLOAD)?.unwrap_or(0),
        ..SyncStatus::default()
    };
    let today = TodayStats {
        upload_count: ns.get_u32(KEY_UPLOAD_COUNT)?.unwrap_or(0),
        bytes_uploaded: ns.get_u64(KEY_BYTES_UPLOADED)?.unwrap_or(0),
        data_points: ns.get_u32(KEY_DATA_POINTS)?.unwrap_or(0),
        ..TodayStats::default()
    };
    Ok((status, today))
}

pub fn save_counters(ns: &Namespace<'_>, status: &SyncStatus, today: &TodayStats) -> Result<(), StoreError> {
    ns.set_u32(KEY_TOTAL_UPLOAD, status.total_uploaded)?;
    ns.set_u32(KEY_UPLOAD_COUNT, today.upload_count)?;
    ns.set_u64(KEY_BYTES_UPLOADED, today.bytes_uploaded)?;
    ns.set_u32(KEY_DATA_POINTS, today.data_points)?;
    Ok(())
}

/// `Never`, `Just now`, `{m}m ago`, `{h}h ago`, or local `MM-DD HH:MM`
/// after a day.
pub fn format_last_sync(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(last) = last else {
        return "Never".to_string();
    };
    let diff = (now - last).num_seconds();
    if diff < 60 {
        "Just now".to_string()
    } else if diff < 3600 {
        format!("{}m ago", diff / 60)
    } else if diff < 86_400 {
        format!("{}h ago", diff / 3600)
    } else {
        last.with_timezone(&Local).format("%m-%d %H:%M").to_string()
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStore;
    use chrono::Duration;

    #[test]
    fn last_sync_wording() {
        let now = Utc::now();
        assert_eq!(format_last_sync(None, now), "Never");
        assert_eq!(format_last_sync(Some(now - Duration::seconds(59)), now), "Just now");
        assert_eq!(format_last_sync(Some(now - Duration::minutes(5)), now), "5m ago");
        assert_eq!(format_last_sync(Some(now - Duration::minutes(150)), now), "2h ago");

        let old = format_last_sync(Some(now - Duration::days(3)), now);
        assert_eq!(old.len(), 11);
        assert_eq!(&old[2..3], "-");
        assert_eq!(&old[8..9], ":");
    }

    #[test]
    fn byte_units() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.50GB");
    }

    #[test]
    fn interval_conversions_round_up() {
        assert_eq!(seconds_to_minutes(1), 1);
        assert_eq!(seconds_to_minutes(60), 1);
        assert_eq!(seconds_to_minutes(61), 2);
        assert_eq!(millis_to_minutes(90_000), 2);
        assert_eq!(clamp_interval_minutes(0), 1);
        assert_eq!(clamp_interval_minutes(5000), 1440);
    }

    #[test]
    fn today_stats_track_first_and_last() {
        let mut stats = TodayStats::default();
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(10);
        stats.record_upload(100, 3, t1);
        stats.record_upload(50, 0, t2);
        assert_eq!(stats.upload_count, 2);
        assert_eq!(stats.bytes_uploaded, 150);
        assert_eq!(stats.first_upload_time, Some(t1));
        assert_eq!(stats.last_upload_time, Some(t2));
    }

    #[test]
    fn settings_and_counters_persist() {
        let kv = KvStore::open_in_memory().unwrap();
        let ns = kv.namespace("cloud_mgr");
        assert_eq!(AutoUploadSettings::load(&ns).unwrap(), AutoUploadSettings::default());

        let settings = AutoUploadSettings {
            enabled: true,
            interval_minutes: 15,
            upload_location: false,
            ..AutoUploadSettings::default()
        };
        settings.save(&ns).unwrap();
        assert_eq!(AutoUploadSettings::load(&ns).unwrap(), settings);

        let mut status = SyncStatus::default();
        status.total_uploaded = 7;
        let mut today = TodayStats::default();
        today.record_upload(4096, 12, Utc::now());
        save_counters(&ns, &status, &today).unwrap();

        let (status, restored) = load_counters(&ns).unwrap();
        assert_eq!(status.total_uploaded, 7);
        assert_eq!(restored.bytes_uploaded, 4096);
        assert_eq!(restored.data_points, 12);
        assert_eq!(restored.last_upload_time, None);
    }
}
