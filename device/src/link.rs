use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// WiFi station connectivity as reported by the network layer.
#[derive(Debug, Clone, Default)]
pub struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub fn new(connected: bool) -> Self {
        LinkState(Arc::new(AtomicBool::new(connected)))
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.0.swap(connected, Ordering::SeqCst);
        if was != connected {
            tracing::info!(connected, "WiFi link changed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
