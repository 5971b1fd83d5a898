use crate::bridge::Bridge;
use crate::snapshot::{
    Snapshot, REG_AC_INPUT_RANGE, REG_BACKLIGHT, REG_BATTERY_TYPE, REG_BUZZER_MODE,
    REG_CHARGER_PRIORITY, REG_MAX_AC_AMPS, REG_MAX_TOTAL_AMPS, REG_OUTPUT_MODE,
    REG_RETURN_DEFAULT, REG_SOC_BACK_TO_BATT, REG_SOC_BACK_TO_GRID, REG_SOC_CUTOFF,
};
use anyhow::Result;
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const CLIENT_DEADLINE: Duration = Duration::from_secs(2);
const MAX_REQUEST_BYTES: usize = 64;

/// A parsed control-port request. The text grammar is folded into a sum
/// type here so dispatch is a plain match instead of prefix chasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Json,
    OutputMode(u16),
    AcInputRange(u16),
    BuzzerMode(u16),
    Backlight(u16),
    ReturnDefault(u16),
    BatteryType(u16),
    ChargerPriority(u16),
    MaxTotalAmps(u16),
    MaxAcAmps(u16),
    SocBackToGrid(u16),
    SocBackToBatt(u16),
    SocCutoff(u16),
}

impl Command {
    /// Case-insensitive parse of one request line. Anything that does not
    /// match the grammar is dropped by the caller without a reply.
    pub fn parse(request: &str) -> Option<Self> {
        let request = request.trim().to_ascii_uppercase();
        match request.as_str() {
            "JSON" => return Some(Command::Json),
            "CSO_SET" => return Some(Command::ChargerPriority(1)),
            "CHARGE_ON" | "SNU_SET" => return Some(Command::ChargerPriority(2)),
            "CHARGE_OFF" | "OSO_SET" => return Some(Command::ChargerPriority(3)),
            _ => {}
        }
        let arg = |prefix: &str| -> Option<u16> { request.strip_prefix(prefix)?.parse().ok() };
        if let Some(n) = arg("MODE_") {
            return Some(Command::OutputMode(n));
        }
        if let Some(n) = arg("SET_AC_RANGE_") {
            return Some(Command::AcInputRange(n));
        }
        if let Some(n) = arg("SET_BUZZER_") {
            return Some(Command::BuzzerMode(n));
        }
        if let Some(n) = arg("SET_BACKLIGHT_") {
            return Some(Command::Backlight(n));
        }
        if let Some(n) = arg("SET_RETURN_DEFAULT_") {
            return Some(Command::ReturnDefault(n));
        }
        if let Some(n) = arg("SET_BATTERY_TYPE_") {
            return Some(Command::BatteryType(n));
        }
        if let Some(n) = arg("SET_TOTAL_AMPS_") {
            return Some(Command::MaxTotalAmps(n));
        }
        if let Some(n) = arg("SET_AMPS_") {
            return Some(Command::MaxAcAmps(n));
        }
        if let Some(n) = arg("SET_SOC_GRID_") {
            return Some(Command::SocBackToGrid(n));
        }
        if let Some(n) = arg("SET_SOC_BATT_") {
            return Some(Command::SocBackToBatt(n));
        }
        if let Some(n) = arg("SET_SOC_CUTOFF_") {
            return Some(Command::SocCutoff(n));
        }
        None
    }

    /// The register write this command turns into, if any. Current limits
    /// go on the wire in tenths of an amp.
    pub fn register_write(&self) -> Option<(u16, u16)> {
        match *self {
            Command::Json => None,
            Command::OutputMode(n) => Some((REG_OUTPUT_MODE, n)),
            Command::AcInputRange(n) => Some((REG_AC_INPUT_RANGE, n)),
            Command::BuzzerMode(n) => Some((REG_BUZZER_MODE, n)),
            Command::Backlight(n) => Some((REG_BACKLIGHT, n)),
            Command::ReturnDefault(n) => Some((REG_RETURN_DEFAULT, n)),
            Command::BatteryType(n) => Some((REG_BATTERY_TYPE, n)),
            Command::ChargerPriority(n) => Some((REG_CHARGER_PRIORITY, n)),
            Command::MaxTotalAmps(n) => Some((REG_MAX_TOTAL_AMPS, n.saturating_mul(10))),
            Command::MaxAcAmps(n) => Some((REG_MAX_AC_AMPS, n.saturating_mul(10))),
            Command::SocBackToGrid(n) => Some((REG_SOC_BACK_TO_GRID, n)),
            Command::SocBackToBatt(n) => Some((REG_SOC_BACK_TO_BATT, n)),
            Command::SocCutoff(n) => Some((REG_SOC_CUTOFF, n)),
        }
    }

    /// The SoC thresholds must stay ordered (cutoff <= back-to-grid); a
    /// request that would cross them is refused.
    pub fn permitted(&self, snap: &Snapshot) -> bool {
        match *self {
            Command::SocBackToGrid(n) => snap.soc_cutoff.map_or(true, |cutoff| n >= cutoff),
            Command::SocCutoff(n) => snap.soc_back_to_grid.map_or(true, |grid| n <= grid),
            _ => true,
        }
    }

    /// The optimistic snapshot write, applied before the frame goes out so
    /// a round-tripping UI sees its own command immediately. The first
    /// settings sweep after the quiet window restores ground truth.
    pub fn apply_optimistic(&self, snap: &mut Snapshot) {
        match *self {
            Command::Json => {}
            Command::OutputMode(n) => snap.output_mode = Some(n),
            Command::AcInputRange(n) => snap.ac_input_range = Some(n),
            Command::BuzzerMode(n) => snap.buzzer_mode = Some(n),
            Command::Backlight(n) => snap.backlight_status = Some(n),
            Command::ReturnDefault(n) => snap.return_to_default = Some(n),
            Command::BatteryType(n) => snap.apply_battery_type(n),
            Command::ChargerPriority(n) => snap.charger_priority = Some(n),
            Command::MaxTotalAmps(n) => snap.max_total_amps = Some(f64::from(n)),
            Command::MaxAcAmps(n) => snap.max_ac_amps = Some(f64::from(n)),
            Command::SocBackToGrid(n) => snap.soc_back_to_grid = Some(n),
            Command::SocBackToBatt(n) => snap.soc_back_to_batt = Some(n),
            Command::SocCutoff(n) => snap.soc_cutoff = Some(n),
        }
    }
}

/// One-shot request server for local automation consumers. Connections are
/// short and bounded, so clients are handled inline on the accept thread.
pub fn control_server(listener: TcpListener, bridge: Arc<Bridge>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Control port listening on {}", addr);
    }
    loop {
        let (stream, _) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Control accept failed: {}", e);
                continue;
            }
        };
        if let Err(e) = handle_client(stream, &bridge) {
            debug!("Control client dropped: {:#}", e);
        }
    }
}

fn handle_client(mut stream: TcpStream, bridge: &Bridge) -> Result<()> {
    stream.set_read_timeout(Some(CLIENT_DEADLINE))?;
    stream.set_write_timeout(Some(CLIENT_DEADLINE))?;
    let mut buf = [0u8; MAX_REQUEST_BYTES];
    let n = stream.read(&mut buf)?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let cmd = match Command::parse(&request) {
        Some(cmd) => cmd,
        // Unknown requests are closed without a reply.
        None => return Ok(()),
    };
    if cmd == Command::Json {
        stream.write_all(bridge.snapshot_json()?.as_bytes())?;
        return Ok(());
    }
    if bridge.command_rate_limited() {
        stream.write_all(b"BUSY")?;
        return Ok(());
    }
    if !cmd.permitted(&bridge.snapshot.read().unwrap()) {
        info!("Refused {:?}: conflicts with the current SoC thresholds", cmd);
        return Ok(());
    }
    let (reg, value) = match cmd.register_write() {
        Some(write) => write,
        None => return Ok(()),
    };
    let mut guard = bridge.link.lock().unwrap();
    let link = match guard.as_mut() {
        Some(link) => link,
        None => {
            drop(guard);
            stream.write_all(b"OFFLINE")?;
            return Ok(());
        }
    };
    cmd.apply_optimistic(&mut bridge.snapshot.write().unwrap());
    link.write_register(reg, value)?;
    bridge.mark_command();
    drop(guard);
    info!("Command {:?} -> register {} = {}", cmd, reg, value);
    stream.write_all(b"OK")?;
    Ok(())
}
