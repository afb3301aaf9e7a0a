// Process-wide scanner driver handle
//
// The vendor library behind a scan controller is global to the process: it is
// loaded once, shared by every open session and released when the last user
// goes away. Holders keep an `Arc<ScannerDriver>`; the registry only keeps a
// weak reference so the count drops to zero naturally.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::stream::control::lock;

static DRIVER: Mutex<Weak<ScannerDriver>> = Mutex::new(Weak::new());

#[derive(Debug)]
pub struct ScannerDriver {
    name: String,
    loaded_at: Instant,
}

impl ScannerDriver {
    /// Returns the loaded driver, loading it first if nobody holds it.
    pub fn acquire(name: &str) -> Arc<ScannerDriver> {
        let mut slot = lock(&DRIVER);
        if let Some(driver) = slot.upgrade() {
            tracing::debug!("Reusing scanner driver '{}'", driver.name);
            return driver;
        }
        tracing::info!("Loading scanner driver '{}'", name);
        let driver = Arc::new(ScannerDriver {
            name: name.to_string(),
            loaded_at: Instant::now(),
        });
        *slot = Arc::downgrade(&driver);
        driver
    }

    pub fn is_loaded() -> bool {
        lock(&DRIVER).strong_count() > 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

impl Drop for ScannerDriver {
    fn drop(&mut self) {
        tracing::info!(
            "Releasing scanner driver '{}' after {:?}",
            self.name,
            self.loaded_at.elapsed()
        );
    }
}
