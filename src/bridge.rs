use crate::energy::EnergyStore;
use crate::link::InverterLink;
use crate::snapshot::Snapshot;
use anyhow::Result;
use log::info;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Settings reads are suppressed this long after an accepted command so a
/// stale polled value cannot overwrite the optimistic one.
pub const QUIET_WINDOW: Duration = Duration::from_secs(10);

/// Minimum spacing between accepted control commands.
pub const COMMAND_SPACING: Duration = Duration::from_millis(500);

/// Shared context handed to both worker threads: the live link, the
/// projected snapshot, the energy store, and the quiet-window stamp.
///
/// Lock order is link, then snapshot, then energy; the save-to-disk path
/// only ever takes the energy lock.
pub struct Bridge {
    pub link: Mutex<Option<InverterLink>>,
    pub snapshot: RwLock<Snapshot>,
    pub energy: Mutex<EnergyStore>,
    started: Instant,
    // Milliseconds since `started`, offset by one so zero means "never";
    // written under the link lock, read lock-free.
    last_cmd_ms: AtomicU64,
}

impl Bridge {
    pub fn new(energy: EnergyStore) -> Self {
        Self {
            link: Mutex::new(None),
            snapshot: RwLock::new(Snapshot::default()),
            energy: Mutex::new(energy),
            started: Instant::now(),
            last_cmd_ms: AtomicU64::new(0),
        }
    }

    /// Stamps the quiet window. Called once a command frame is on the wire.
    pub fn mark_command(&self) {
        let ms = self.started.elapsed().as_millis() as u64 + 1;
        self.last_cmd_ms.store(ms, Ordering::Relaxed);
    }

    fn since_last_command(&self) -> Option<Duration> {
        let ms = self.last_cmd_ms.load(Ordering::Relaxed);
        if ms == 0 {
            return None;
        }
        Some(
            self.started
                .elapsed()
                .saturating_sub(Duration::from_millis(ms - 1)),
        )
    }

    pub fn in_quiet_window(&self) -> bool {
        matches!(self.since_last_command(), Some(d) if d < QUIET_WINDOW)
    }

    pub fn command_rate_limited(&self) -> bool {
        matches!(self.since_last_command(), Some(d) if d < COMMAND_SPACING)
    }

    /// The control-port JSON document: the snapshot plus the always-present
    /// energy totals.
    pub fn snapshot_json(&self) -> Result<String> {
        let mut doc = serde_json::to_value(&*self.snapshot.read().unwrap())?;
        let totals = self.energy.lock().unwrap().totals();
        if let Value::Object(map) = &mut doc {
            map.insert("total_pv_kwh".into(), json!(round4(totals.total_pv_kwh)));
            map.insert(
                "total_grid_input_kwh".into(),
                json!(round4(totals.total_grid_input_kwh)),
            );
            map.insert("total_load_kwh".into(), json!(round4(totals.total_load_kwh)));
            map.insert(
                "total_battery_charge_kwh".into(),
                json!(round4(totals.total_battery_charge_kwh)),
            );
            map.insert(
                "total_battery_discharge_kwh".into(),
                json!(round4(totals.total_battery_discharge_kwh)),
            );
        }
        Ok(doc.to_string())
    }

    /// Offline teardown: close the socket and null out every polled field.
    /// The energy totals are not link state and stay put.
    pub fn drop_link(&self) {
        if let Some(link) = self.link.lock().unwrap().take() {
            info!("Closed inverter link to {}", link.peer());
        }
        *self.snapshot.write().unwrap() = Snapshot::default();
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
