use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::TimedValue;

pub const SAMPLE_BUFFER_CAPACITY: usize = 1024;
pub const SAMPLE_LIMIT_VOLTS: f32 = 50.0;

/// Oscilloscope readings waiting for the next pack post.
#[derive(Debug)]
pub struct SampleBuffer {
    samples: VecDeque<TimedValue>,
}

impl Default for SampleBuffer {
    fn default() -> Self {
        SampleBuffer {
            samples: VecDeque::with_capacity(SAMPLE_BUFFER_CAPACITY),
        }
    }
}

impl SampleBuffer {
    /// Clamps to ±50 V and appends. Returns true once the buffer is full.
    /// A full buffer drops its oldest sample to make room.
    pub fn record(&mut self, volts: f32, time_ms: i64) -> bool {
        if self.samples.len() >= SAMPLE_BUFFER_CAPACITY {
            self.samples.pop_front();
        }
        let value = if volts.is_nan() {
            0.0
        } else {
            volts.clamp(-SAMPLE_LIMIT_VOLTS, SAMPLE_LIMIT_VOLTS)
        };
        self.samples.push_back(TimedValue { value, time: time_ms });
        self.is_full()
    }

    pub fn last(&self) -> Option<TimedValue> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= SAMPLE_BUFFER_CAPACITY
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Location reporting cadence, shared with whatever runs the location scan.
#[derive(Debug, Clone, Default)]
pub struct LocationSchedule {
    reporting: Arc<AtomicBool>,
    interval_ms: Arc<AtomicU64>,
}

impl LocationSchedule {
    pub fn set_reporting(&self, reporting: bool) {
        self.reporting.store(reporting, Ordering::SeqCst);
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting.load(Ordering::SeqCst)
    }

    pub fn set_interval_ms(&self, ms: u64) {
        self.interval_ms.store(ms, Ordering::SeqCst);
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_clamped() {
        let mut buf = SampleBuffer::default();
        buf.record(75.0, 1);
        assert_eq!(buf.last().unwrap().value, 50.0);
        buf.record(-80.0, 2);
        assert_eq!(buf.last().unwrap(), TimedValue { value: -50.0, time: 2 });
        buf.record(f32::NAN, 3);
        assert_eq!(buf.last().unwrap().value, 0.0);
    }

    #[test]
    fn reports_full_at_capacity() {
        let mut buf = SampleBuffer::default();
        for i in 0..(SAMPLE_BUFFER_CAPACITY - 1) {
            assert!(!buf.record(1.0, i as i64));
        }
        assert!(buf.record(2.0, 9999));
        assert!(buf.record(3.0, 10_000));
        assert_eq!(buf.len(), SAMPLE_BUFFER_CAPACITY);
        assert_eq!(buf.last().unwrap().value, 3.0);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn full_buffer_drops_oldest_first() {
        let mut buf = SampleBuffer::default();
        for i in 0..SAMPLE_BUFFER_CAPACITY + 2 {
            buf.record(i as f32 / 100.0, i as i64);
        }
        assert_eq!(buf.len(), SAMPLE_BUFFER_CAPACITY);
        assert_eq!(buf.samples.front().unwrap().time, 2);
        assert_eq!(buf.last().unwrap().time, SAMPLE_BUFFER_CAPACITY as i64 + 1);
    }

    #[test]
    fn schedule_clones_share_state() {
        let schedule = LocationSchedule::default();
        let scanner = schedule.clone();
        scanner.set_reporting(true);
        schedule.set_interval_ms(600_000);
        assert!(schedule.is_reporting());
        assert_eq!(scanner.interval_ms(), 600_000);
    }
}
