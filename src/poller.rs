use crate::bridge::Bridge;
use crate::link::InverterLink;
use crate::snapshot::{
    SensorFrame, CHARGER_SETTINGS_WORDS, FAULT_BASE, FAULT_WORDS, MAIN_SETTINGS_WORDS,
    REG_BATTERY_TYPE, REG_CHARGER_PRIORITY, REG_OUTPUT_MODE, REG_RETURN_DEFAULT,
    REG_SOC_BACK_TO_GRID, SENSOR_BASE, SENSOR_WORDS, SOC_SETTINGS_WORDS,
};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const OFFLINE_THRESHOLD: u32 = 10;

const FAULT_EVERY_TICKS: u64 = 2;
const SETTINGS_EVERY_TICKS: u64 = 5;

/// Accept loop: one inverter at a time, poll it until the link dies, then
/// go back to waiting for the next dial-in. Extra connections queue in the
/// kernel backlog.
pub fn inverter_server(listener: TcpListener, bridge: Arc<Bridge>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Waiting for inverter on {}", addr);
    }
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Inverter accept failed: {}", e);
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        info!("Inverter connected from {}", peer);
        match InverterLink::establish(stream, peer) {
            Ok(link) => *bridge.link.lock().unwrap() = Some(link),
            Err(e) => {
                warn!("Handshake with {} failed: {}", peer, e);
                continue;
            }
        }
        poll_until_offline(&bridge);
        bridge.drop_link();
    }
}

/// The 1 Hz tick loop. Each tick holds the link lock across its whole read
/// sequence so a control write can never land between a request and its
/// response.
fn poll_until_offline(bridge: &Bridge) {
    let mut tick: u64 = 0;
    let mut failures: u32 = 0;
    loop {
        {
            let mut guard = bridge.link.lock().unwrap();
            let link = match guard.as_mut() {
                Some(link) => link,
                None => return,
            };
            match poll_sensors(bridge, link) {
                Ok(frame) => {
                    failures = 0;
                    if tick % FAULT_EVERY_TICKS == 0 {
                        poll_faults(bridge, link, &frame);
                    }
                    if tick % SETTINGS_EVERY_TICKS == 0 && !bridge.in_quiet_window() {
                        poll_settings(bridge, link);
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Sensor read failed ({}/{}): {:#}",
                        failures, OFFLINE_THRESHOLD, e
                    );
                    if failures >= OFFLINE_THRESHOLD {
                        info!("Offline threshold reached, dropping the link");
                        return;
                    }
                }
            }
        }
        tick += 1;
        thread::sleep(POLL_INTERVAL);
    }
}

/// The fixed 40-word sensor read. Success also feeds the energy
/// integrator, so the accumulators only advance on ticks with real data.
fn poll_sensors(bridge: &Bridge, link: &mut InverterLink) -> Result<SensorFrame> {
    let words = link.read_registers(SENSOR_BASE, SENSOR_WORDS)?;
    let frame = SensorFrame::decode(&words).ok_or_else(|| anyhow!("sensor block truncated"))?;
    bridge.snapshot.write().unwrap().apply_sensor(&frame);
    bridge.energy.lock().unwrap().record_tick(
        f64::from(frame.pv_input_watt),
        f64::from(frame.grid_power_watt),
        f64::from(frame.ac_load_real_watt),
        f64::from(frame.batt_power_watt),
        Instant::now(),
    );
    Ok(frame)
}

fn poll_faults(bridge: &Bridge, link: &mut InverterLink, sensors: &SensorFrame) {
    match link.read_registers(FAULT_BASE, FAULT_WORDS) {
        Ok(words) => bridge.snapshot.write().unwrap().apply_faults(&words, sensors),
        Err(e) => warn!("Fault block read failed: {:#}", e),
    }
}

/// The settings sweep: four small block reads plus two single registers.
/// A failed read leaves its partition alone; whatever was last observed or
/// optimistically set stays in the snapshot.
fn poll_settings(bridge: &Bridge, link: &mut InverterLink) {
    match link.read_registers(REG_OUTPUT_MODE, MAIN_SETTINGS_WORDS) {
        Ok(words) => bridge.snapshot.write().unwrap().apply_main_settings(&words),
        Err(e) => warn!("Main settings read failed: {:#}", e),
    }
    match link.read_registers(REG_CHARGER_PRIORITY, CHARGER_SETTINGS_WORDS) {
        Ok(words) => bridge
            .snapshot
            .write()
            .unwrap()
            .apply_charger_settings(&words),
        Err(e) => warn!("Charger settings read failed: {:#}", e),
    }
    match link.read_registers(REG_SOC_BACK_TO_GRID, SOC_SETTINGS_WORDS) {
        Ok(words) => bridge.snapshot.write().unwrap().apply_soc_settings(&words),
        Err(e) => warn!("SoC settings read failed: {:#}", e),
    }
    match link.read_registers(REG_BATTERY_TYPE, 1) {
        Ok(words) => bridge.snapshot.write().unwrap().apply_battery_type(words[0]),
        Err(e) => warn!("Battery type read failed: {:#}", e),
    }
    match link.read_registers(REG_RETURN_DEFAULT, 1) {
        Ok(words) => bridge
            .snapshot
            .write()
            .unwrap()
            .apply_return_default(words[0]),
        Err(e) => warn!("Return-to-default read failed: {:#}", e),
    }
}
