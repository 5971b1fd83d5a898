use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::time::Instant;

/// Integration steps longer than this are clock jumps or stalled links and
/// would inject bogus energy.
const MAX_TICK_GAP_SECS: f64 = 5.0;

const WATT_SECONDS_PER_KWH: f64 = 3_600_000.0;

/// The five lifetime counters as persisted on disk. Monotonic: the
/// integrator only ever adds to them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyTotals {
    pub total_pv_kwh: f64,
    pub total_grid_input_kwh: f64,
    pub total_load_kwh: f64,
    pub total_battery_charge_kwh: f64,
    pub total_battery_discharge_kwh: f64,
}

pub struct EnergyStore {
    totals: EnergyTotals,
    path: PathBuf,
    last_tick: Option<Instant>,
}

impl EnergyStore {
    /// Loads the persisted totals, falling back to zeros for anything
    /// missing or unreadable, and prints the one operator-visible banner.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let totals = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<EnergyTotals>(&text) {
                Ok(totals) => totals,
                Err(e) => {
                    warn!(
                        "Energy state {} is corrupt ({}), starting from zero",
                        path.display(),
                        e
                    );
                    EnergyTotals::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No energy state at {}, starting from zero", path.display());
                EnergyTotals::default()
            }
            Err(e) => {
                warn!(
                    "Energy state {} unreadable ({}), starting from zero",
                    path.display(),
                    e
                );
                EnergyTotals::default()
            }
        };
        info!(
            "Energy totals: pv {:.4} kWh, grid-in {:.4} kWh, load {:.4} kWh, charge {:.4} kWh, discharge {:.4} kWh",
            totals.total_pv_kwh,
            totals.total_grid_input_kwh,
            totals.total_load_kwh,
            totals.total_battery_charge_kwh,
            totals.total_battery_discharge_kwh
        );
        Self {
            totals,
            path,
            last_tick: None,
        }
    }

    pub fn totals(&self) -> EnergyTotals {
        self.totals
    }

    /// Called once per successful sensor tick with the instantaneous power
    /// readings in watts; battery power is negative while charging.
    pub fn record_tick(&mut self, p_pv: f64, p_grid: f64, p_load: f64, p_batt: f64, now: Instant) {
        let dt_secs = match self.last_tick {
            Some(prev) => now.duration_since(prev).as_secs_f64(),
            None => {
                self.last_tick = Some(now);
                return;
            }
        };
        self.last_tick = Some(now);
        self.accumulate(dt_secs, p_pv, p_grid, p_load, p_batt);
    }

    fn accumulate(&mut self, dt_secs: f64, p_pv: f64, p_grid: f64, p_load: f64, p_batt: f64) {
        if dt_secs <= 0.0 || dt_secs >= MAX_TICK_GAP_SECS {
            return;
        }
        let kwh = |watts: f64| watts * dt_secs / WATT_SECONDS_PER_KWH;
        if p_pv > 0.0 {
            self.totals.total_pv_kwh += kwh(p_pv);
        }
        if p_grid > 0.0 {
            self.totals.total_grid_input_kwh += kwh(p_grid);
        }
        if p_load > 0.0 {
            self.totals.total_load_kwh += kwh(p_load);
        }
        if p_batt < 0.0 {
            self.totals.total_battery_charge_kwh += kwh(-p_batt);
        }
        if p_batt > 0.0 {
            self.totals.total_battery_discharge_kwh += kwh(p_batt);
        }
    }

    /// Atomic save: temp file in the same directory, fsync, rename over the
    /// live file. A half-written state file can never be observed.
    pub fn save(&self) -> Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        let text = serde_json::to_string_pretty(&self.totals)?;
        let mut file =
            fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} over {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store_at(dir: &tempfile::TempDir) -> EnergyStore {
        EnergyStore::load(dir.path().join("energy.json"))
    }

    #[test]
    fn one_second_at_3600_watts_is_one_watt_hour() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        let t0 = Instant::now();
        store.record_tick(3600.0, 0.0, 0.0, 0.0, t0);
        store.record_tick(3600.0, 0.0, 0.0, 0.0, t0 + Duration::from_secs(1));
        assert!((store.totals().total_pv_kwh - 0.001).abs() < 1e-12);
    }

    #[test]
    fn first_tick_only_sets_the_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        store.record_tick(5000.0, 5000.0, 5000.0, 5000.0, Instant::now());
        assert_eq!(store.totals(), EnergyTotals::default());
    }

    #[test]
    fn long_gaps_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        let t0 = Instant::now();
        store.record_tick(3600.0, 0.0, 0.0, 0.0, t0);
        store.record_tick(3600.0, 0.0, 0.0, 0.0, t0 + Duration::from_secs(600));
        assert_eq!(store.totals().total_pv_kwh, 0.0);
        // The stale baseline was replaced, so the next close tick counts.
        store.record_tick(3600.0, 0.0, 0.0, 0.0, t0 + Duration::from_secs(601));
        assert!(store.totals().total_pv_kwh > 0.0);
    }

    #[test]
    fn battery_sign_routes_charge_and_discharge() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        store.accumulate(1.0, 0.0, 0.0, 0.0, -1800.0);
        store.accumulate(1.0, 0.0, 0.0, 0.0, 900.0);
        let totals = store.totals();
        assert!((totals.total_battery_charge_kwh - 0.0005).abs() < 1e-12);
        assert!((totals.total_battery_discharge_kwh - 0.00025).abs() < 1e-12);
    }

    #[test]
    fn totals_never_decrease() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        let mut previous = store.totals();
        let powers = [
            (1200.0, -300.0, 450.0, -2000.0),
            (0.0, 0.0, 0.0, 0.0),
            (-50.0, 800.0, 600.0, 1500.0),
            (3000.0, 20.0, 0.0, -100.0),
        ];
        for (pv, grid, load, batt) in powers.iter() {
            store.accumulate(1.0, *pv, *grid, *load, *batt);
            let now = store.totals();
            assert!(now.total_pv_kwh >= previous.total_pv_kwh);
            assert!(now.total_grid_input_kwh >= previous.total_grid_input_kwh);
            assert!(now.total_load_kwh >= previous.total_load_kwh);
            assert!(now.total_battery_charge_kwh >= previous.total_battery_charge_kwh);
            assert!(now.total_battery_discharge_kwh >= previous.total_battery_discharge_kwh);
            previous = now;
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(&dir);
        store.accumulate(1.0, 3600.0, 1800.0, 900.0, -450.0);
        store.save().unwrap();
        let reloaded = store_at(&dir);
        let a = store.totals();
        let b = reloaded.totals();
        assert!((a.total_pv_kwh - b.total_pv_kwh).abs() < 1e-4);
        assert!((a.total_grid_input_kwh - b.total_grid_input_kwh).abs() < 1e-4);
        assert!((a.total_load_kwh - b.total_load_kwh).abs() < 1e-4);
        assert!((a.total_battery_charge_kwh - b.total_battery_charge_kwh).abs() < 1e-4);
    }

    #[test]
    fn corrupt_state_file_loads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy.json");
        fs::write(&path, "{ not json").unwrap();
        let store = EnergyStore::load(&path);
        assert_eq!(store.totals(), EnergyTotals::default());
    }

    #[test]
    fn missing_keys_default_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy.json");
        fs::write(&path, r#"{"total_pv_kwh": 12.5}"#).unwrap();
        let store = EnergyStore::load(&path);
        assert!((store.totals().total_pv_kwh - 12.5).abs() < 1e-9);
        assert_eq!(store.totals().total_load_kwh, 0.0);
    }
}
