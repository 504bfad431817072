use std::sync::atomic::{AtomicU32, Ordering};

// Phase counter for the simulated probe signal.
static PHASE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A noisy 5 V sine sample, standing in for the oscilloscope probe when the
/// binary runs without hardware.
pub fn probe_sample() -> f32 {
    let phase = PHASE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let angle = (phase % 64) as f32 / 64.0 * std::f32::consts::TAU;
    let noise = (rand::random::<f32>() * 0.2) - 0.1; // ±0.1 V
    5.0 * angle.sin() + noise
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_near_amplitude() {
        for _ in 0..200 {
            let v = probe_sample();
            assert!(v.abs() <= 5.1, "{}", v);
        }
    }
}
