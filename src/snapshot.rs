use crate::codes;
use crate::modbus::to_signed;
use serde::Serialize;

pub const SENSOR_BASE: u16 = 200;
pub const SENSOR_WORDS: u16 = 40;
pub const FAULT_BASE: u16 = 100;
pub const FAULT_WORDS: u16 = 6;

pub const REG_OUTPUT_MODE: u16 = 301;
pub const REG_AC_INPUT_RANGE: u16 = 302;
pub const REG_BUZZER_MODE: u16 = 303;
pub const REG_BACKLIGHT: u16 = 305;
pub const REG_RETURN_DEFAULT: u16 = 306;
pub const REG_BATTERY_TYPE: u16 = 322;
pub const REG_CHARGER_PRIORITY: u16 = 331;
pub const REG_MAX_TOTAL_AMPS: u16 = 332;
pub const REG_MAX_AC_AMPS: u16 = 333;
pub const REG_SOC_BACK_TO_GRID: u16 = 341;
pub const REG_SOC_BACK_TO_BATT: u16 = 342;
pub const REG_SOC_CUTOFF: u16 = 343;

pub const MAIN_SETTINGS_WORDS: u16 = 5;
pub const CHARGER_SETTINGS_WORDS: u16 = 3;
pub const SOC_SETTINGS_WORDS: u16 = 3;

const RATED_WATT: f64 = 6200.0;

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One decoded 40-word sensor block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorFrame {
    pub status_code: u16,
    pub grid_volt: f64,
    pub grid_freq: f64,
    pub grid_power_watt: i32,
    pub ac_out_volt: f64,
    pub ac_output_amp: f64,
    pub ac_load_real_watt: i32,
    pub ac_load_va: i32,
    pub batt_volt: f64,
    pub batt_power_watt: i32,
    pub batt_soc: u16,
    pub pv_input_volt: f64,
    pub pv_input_watt: i32,
    pub temp_inv: i32,
    pub temp_dc: i32,
    batt_discharge_raw: u16,
    batt_charge_raw: u16,
}

impl SensorFrame {
    pub fn decode(words: &[u16]) -> Option<Self> {
        if words.len() < SENSOR_WORDS as usize {
            return None;
        }
        let discharge = words[8];
        let charge = words[9];
        // The device reports discharge and charge in separate registers; a
        // non-zero charge register wins and flips the sign to negative.
        let batt_power = if charge > 0 {
            -i32::from(charge)
        } else {
            to_signed(discharge)
        };
        Some(Self {
            status_code: words[1],
            grid_volt: f64::from(words[2]) / 10.0,
            grid_freq: f64::from(words[3]) / 100.0,
            grid_power_watt: i32::from(words[4]),
            ac_out_volt: f64::from(words[5]) / 10.0,
            ac_output_amp: f64::from(words[11]) / 10.0,
            ac_load_real_watt: i32::from(words[13]),
            ac_load_va: i32::from(words[14]),
            batt_volt: f64::from(words[15]) / 10.0,
            batt_power_watt: batt_power,
            batt_soc: words[29],
            pv_input_volt: f64::from(words[19]) / 10.0,
            pv_input_watt: i32::from(words[23]),
            temp_inv: i32::from(words[26]),
            temp_dc: i32::from(words[27]),
            batt_discharge_raw: discharge,
            batt_charge_raw: charge,
        })
    }

    /// A battery that is moving current (either direction) or carrying the
    /// load is connected, whatever the warning bits claim.
    pub fn battery_active(&self) -> bool {
        self.batt_discharge_raw > 0
            || self.batt_charge_raw > 0
            || self.status_code == codes::STATUS_BATTERY_MODE
    }

    pub fn batt_current(&self) -> f64 {
        if self.batt_volt > 0.0 {
            round1(f64::from(self.batt_power_watt) / self.batt_volt)
        } else {
            0.0
        }
    }

    pub fn pv_current(&self) -> f64 {
        if self.pv_input_volt > 0.0 {
            round2(f64::from(self.pv_input_watt) / self.pv_input_volt)
        } else {
            0.0
        }
    }

    pub fn load_pct(&self) -> f64 {
        round1((f64::from(self.ac_load_va) / RATED_WATT * 100.0).min(300.0))
    }
}

/// Projected inverter state as served on the control port. Every field is
/// an `Option` so the sensor partition collapses to JSON null while no
/// inverter is connected; the energy totals live in their own store and are
/// merged in at serialization time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub device_status_code: Option<u16>,
    pub device_status_msg: Option<String>,
    pub grid_volt: Option<f64>,
    pub grid_freq: Option<f64>,
    pub grid_power_watt: Option<i32>,
    pub ac_out_volt: Option<f64>,
    pub ac_output_amp: Option<f64>,
    pub ac_load_real_watt: Option<i32>,
    pub ac_load_va: Option<i32>,
    pub ac_load_pct: Option<f64>,
    pub batt_volt: Option<f64>,
    pub batt_power_watt: Option<i32>,
    pub batt_current: Option<f64>,
    pub batt_soc: Option<u16>,
    pub pv_input_volt: Option<f64>,
    pub pv_input_watt: Option<i32>,
    pub pv_current: Option<f64>,
    pub temp_inv: Option<i32>,
    pub temp_dc: Option<i32>,

    pub fault_code: Option<u16>,
    pub fault_msg: Option<String>,
    pub warning_code: Option<u16>,
    pub warning_msg: Option<String>,
    pub active_warnings: Option<Vec<String>>,
    pub fault_bitmask: Option<u16>,
    pub warning_bitmask: Option<u16>,

    pub output_mode: Option<u16>,
    pub ac_input_range: Option<u16>,
    pub buzzer_mode: Option<u16>,
    pub backlight_status: Option<u16>,
    pub return_to_default: Option<u16>,
    pub battery_type_code: Option<u16>,
    pub battery_type: Option<String>,
    pub charger_priority: Option<u16>,
    pub max_total_amps: Option<f64>,
    pub max_ac_amps: Option<f64>,
    pub soc_back_to_grid: Option<u16>,
    pub soc_back_to_batt: Option<u16>,
    pub soc_cutoff: Option<u16>,
}

impl Snapshot {
    pub fn apply_sensor(&mut self, f: &SensorFrame) {
        self.device_status_code = Some(f.status_code);
        self.device_status_msg = Some(match codes::status_text(f.status_code) {
            Some(text) => text.to_string(),
            None => format!("Unknown ({})", f.status_code),
        });
        self.grid_volt = Some(f.grid_volt);
        self.grid_freq = Some(f.grid_freq);
        self.grid_power_watt = Some(f.grid_power_watt);
        self.ac_out_volt = Some(f.ac_out_volt);
        self.ac_output_amp = Some(f.ac_output_amp);
        self.ac_load_real_watt = Some(f.ac_load_real_watt);
        self.ac_load_va = Some(f.ac_load_va);
        self.ac_load_pct = Some(f.load_pct());
        self.batt_volt = Some(f.batt_volt);
        self.batt_power_watt = Some(f.batt_power_watt);
        self.batt_current = Some(f.batt_current());
        self.batt_soc = Some(f.batt_soc);
        self.pv_input_volt = Some(f.pv_input_volt);
        self.pv_input_watt = Some(f.pv_input_watt);
        self.pv_current = Some(f.pv_current());
        self.temp_inv = Some(f.temp_inv);
        self.temp_dc = Some(f.temp_dc);
    }

    /// Decodes the 6-word fault block. Needs the sensor frame from the same
    /// tick: the warning filter cross-checks bitmask claims against what the
    /// battery is measurably doing.
    pub fn apply_faults(&mut self, words: &[u16], sensors: &SensorFrame) {
        if words.len() < FAULT_WORDS as usize {
            return;
        }
        let numeric_fault = words[1];
        let primary = words[4];
        let secondary = words[5];
        self.fault_code = Some(numeric_fault);
        // All-ones masks are DTU line noise; leave the warning fields alone
        // until the next fault tick.
        if primary == 0xFFFF || secondary == 0xFFFF {
            return;
        }
        let warnings =
            decode_warnings(primary, secondary, sensors.status_code, sensors.battery_active());
        if warnings.is_empty() {
            self.warning_code = Some(0);
            self.warning_msg = Some("No Warning".to_string());
        } else {
            self.warning_code = Some(99);
            self.warning_msg = Some(warnings.join(", "));
        }
        // A zero fault register during Fault Mode still has a cause; the
        // warning list is the closest description available.
        self.fault_msg = Some(
            if numeric_fault == 0
                && sensors.status_code == codes::STATUS_FAULT_MODE
                && !warnings.is_empty()
            {
                format!("FAULT: {}", warnings.join(", "))
            } else {
                match codes::fault_text(numeric_fault) {
                    Some(text) => text.to_string(),
                    None => format!("Unknown Fault {}", numeric_fault),
                }
            },
        );
        self.fault_bitmask = Some(primary);
        self.warning_bitmask = Some(secondary);
        self.active_warnings = Some(warnings);
    }

    /// Registers 301..305: output mode, AC input range, buzzer, backlight.
    pub fn apply_main_settings(&mut self, words: &[u16]) {
        if words.len() < MAIN_SETTINGS_WORDS as usize {
            return;
        }
        self.output_mode = Some(words[0]);
        self.ac_input_range = Some(words[1]);
        self.buzzer_mode = Some(words[2]);
        self.backlight_status = Some(words[4]);
    }

    /// Registers 331..333: charger priority and the two current limits
    /// (stored in tenths of an amp).
    pub fn apply_charger_settings(&mut self, words: &[u16]) {
        if words.len() < CHARGER_SETTINGS_WORDS as usize {
            return;
        }
        self.charger_priority = Some(words[0]);
        self.max_total_amps = Some(f64::from(words[1]) / 10.0);
        self.max_ac_amps = Some(f64::from(words[2]) / 10.0);
    }

    /// Registers 341..343: the three SoC thresholds.
    pub fn apply_soc_settings(&mut self, words: &[u16]) {
        if words.len() < SOC_SETTINGS_WORDS as usize {
            return;
        }
        self.soc_back_to_grid = Some(words[0]);
        self.soc_back_to_batt = Some(words[1]);
        self.soc_cutoff = Some(words[2]);
    }

    pub fn apply_battery_type(&mut self, code: u16) {
        self.battery_type_code = Some(code);
        self.battery_type = Some(match codes::battery_type_text(code) {
            Some(text) => text.to_string(),
            None => format!("Unknown ({})", code),
        });
    }

    pub fn apply_return_default(&mut self, code: u16) {
        self.return_to_default = Some(code);
    }
}

/// Expands the two warning bitmasks into labels, suppressing bits the
/// measurements contradict: an actively charging or discharging battery is
/// not open, and a unit that is happily on grid or on battery has no system
/// fault. The recovery bit turns a coexisting battery-open claim into a
/// recovering/cutoff message instead.
pub fn decode_warnings(
    primary: u16,
    secondary: u16,
    status_code: u16,
    battery_active: bool,
) -> Vec<String> {
    let mut warnings = Vec::new();
    for (mask, label) in codes::PRIMARY_WARNING_BITS {
        if primary & mask == 0 {
            continue;
        }
        if *mask == codes::PRIMARY_BATTERY_OPEN_BIT && battery_active {
            continue;
        }
        warnings.push((*label).to_string());
    }
    if secondary & codes::SECONDARY_SYSTEM_FAULT_BIT != 0
        && status_code != codes::STATUS_LINE_MODE
        && status_code != codes::STATUS_BATTERY_MODE
    {
        warnings.push("System Fault (01)".to_string());
    }
    let recovering = secondary & codes::SECONDARY_BATTERY_RECOVERY_BIT != 0;
    if secondary & codes::SECONDARY_BATTERY_OPEN_BIT != 0 && !recovering && !battery_active {
        warnings.push("Battery Open (64)".to_string());
    }
    if recovering {
        if status_code == codes::STATUS_LINE_MODE {
            warnings.push("Battery Recovering (Waiting for Charge)".to_string());
        } else {
            warnings.push("Battery Cutoff/Under Voltage (4096)".to_string());
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_words() -> Vec<u16> {
        let mut words = vec![0u16; SENSOR_WORDS as usize];
        words[1] = 2; // Line Mode
        words[2] = 2350; // 235.0 V
        words[3] = 4998; // 49.98 Hz
        words[4] = 420;
        words[5] = 2301;
        words[8] = 0; // discharge
        words[9] = 0; // charge
        words[11] = 31; // 3.1 A
        words[13] = 700;
        words[14] = 744;
        words[15] = 532; // 53.2 V
        words[19] = 3424; // 342.4 V
        words[23] = 1250;
        words[26] = 41;
        words[27] = 39;
        words[29] = 87;
        words
    }

    #[test]
    fn sensor_block_scaling() {
        let frame = SensorFrame::decode(&sensor_words()).unwrap();
        assert_eq!(frame.status_code, 2);
        assert!((frame.grid_volt - 235.0).abs() < 1e-9);
        assert!((frame.grid_freq - 49.98).abs() < 1e-9);
        assert_eq!(frame.grid_power_watt, 420);
        assert!((frame.ac_output_amp - 3.1).abs() < 1e-9);
        assert!((frame.batt_volt - 53.2).abs() < 1e-9);
        assert_eq!(frame.batt_soc, 87);
        assert_eq!(frame.temp_inv, 41);
        assert_eq!(frame.temp_dc, 39);
        assert!((frame.pv_current() - 3.65).abs() < 1e-9); // 1250 / 342.4
        assert!((frame.load_pct() - 12.0).abs() < 1e-9); // 744 / 6200 * 100
    }

    #[test]
    fn sensor_block_too_short_is_rejected() {
        assert!(SensorFrame::decode(&sensor_words()[..39]).is_none());
    }

    #[test]
    fn battery_charge_register_wins() {
        let mut words = sensor_words();
        words[8] = 120;
        words[9] = 800;
        let frame = SensorFrame::decode(&words).unwrap();
        assert_eq!(frame.batt_power_watt, -800);
        assert!(frame.battery_active());
        // 53.2 V, charging: current mirrors the sign.
        assert!((frame.batt_current() - (-15.0)).abs() < 1e-9);
    }

    #[test]
    fn battery_discharge_is_signed() {
        let mut words = sensor_words();
        words[8] = 65136; // -400 in two's complement
        words[9] = 0;
        let frame = SensorFrame::decode(&words).unwrap();
        assert_eq!(frame.batt_power_watt, -400);
    }

    #[test]
    fn load_pct_clamps_at_300() {
        let mut words = sensor_words();
        words[14] = 30000;
        let frame = SensorFrame::decode(&words).unwrap();
        assert!((frame.load_pct() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn battery_open_suppressed_while_discharging() {
        let mut words = sensor_words();
        words[1] = 2;
        words[8] = 400;
        let frame = SensorFrame::decode(&words).unwrap();
        let warnings = decode_warnings(
            codes::PRIMARY_BATTERY_OPEN_BIT,
            codes::SECONDARY_BATTERY_OPEN_BIT,
            frame.status_code,
            frame.battery_active(),
        );
        assert!(warnings.iter().all(|w| !w.contains("Battery Open")));
    }

    #[test]
    fn battery_open_reported_when_idle() {
        let warnings = decode_warnings(codes::PRIMARY_BATTERY_OPEN_BIT, 0, 0, false);
        assert_eq!(warnings, vec!["Battery Open (bP)".to_string()]);
    }

    #[test]
    fn system_fault_suppressed_on_grid_and_battery() {
        for status in [codes::STATUS_LINE_MODE, codes::STATUS_BATTERY_MODE].iter() {
            assert!(decode_warnings(0, codes::SECONDARY_SYSTEM_FAULT_BIT, *status, true).is_empty());
        }
        assert_eq!(
            decode_warnings(0, codes::SECONDARY_SYSTEM_FAULT_BIT, 0, false),
            vec!["System Fault (01)".to_string()]
        );
    }

    #[test]
    fn recovery_bit_reinterprets_battery_open() {
        let mask = codes::SECONDARY_BATTERY_OPEN_BIT | codes::SECONDARY_BATTERY_RECOVERY_BIT;
        let on_grid = decode_warnings(0, mask, codes::STATUS_LINE_MODE, false);
        assert_eq!(
            on_grid,
            vec!["Battery Recovering (Waiting for Charge)".to_string()]
        );
        let off_grid = decode_warnings(0, mask, 0, false);
        assert_eq!(
            off_grid,
            vec!["Battery Cutoff/Under Voltage (4096)".to_string()]
        );
    }

    #[test]
    fn garbage_masks_leave_warning_fields_alone() {
        let mut snap = Snapshot::default();
        let frame = SensorFrame::decode(&sensor_words()).unwrap();
        snap.apply_faults(&[0, 0, 0, 0, 0x0001, 0x0000], &frame);
        let before = snap.warning_msg.clone();
        snap.apply_faults(&[0, 7, 0, 0, 0xFFFF, 0x0000], &frame);
        assert_eq!(snap.warning_msg, before);
        // The numeric fault register is still taken at face value.
        assert_eq!(snap.fault_code, Some(7));
    }

    #[test]
    fn fault_fallback_uses_warning_list() {
        let mut words = sensor_words();
        words[1] = codes::STATUS_FAULT_MODE;
        words[8] = 0;
        words[9] = 0;
        let frame = SensorFrame::decode(&words).unwrap();
        let mut snap = Snapshot::default();
        snap.apply_faults(&[0, 0, 0, 0, codes::PRIMARY_BATTERY_OPEN_BIT, 0], &frame);
        assert_eq!(snap.fault_msg, Some("FAULT: Battery Open (bP)".to_string()));
    }

    #[test]
    fn numeric_fault_is_translated() {
        let frame = SensorFrame::decode(&sensor_words()).unwrap();
        let mut snap = Snapshot::default();
        snap.apply_faults(&[0, 7, 0, 0, 0, 0], &frame);
        assert_eq!(snap.fault_msg, Some("Overload time out".to_string()));
        assert_eq!(snap.warning_msg, Some("No Warning".to_string()));
        assert_eq!(snap.warning_code, Some(0));
    }

    #[test]
    fn settings_blocks_decode_with_scaling() {
        let mut snap = Snapshot::default();
        snap.apply_main_settings(&[1, 0, 3, 9, 1]);
        snap.apply_charger_settings(&[2, 400, 300]);
        snap.apply_soc_settings(&[80, 95, 20]);
        snap.apply_battery_type(3);
        snap.apply_return_default(1);
        assert_eq!(snap.output_mode, Some(1));
        assert_eq!(snap.ac_input_range, Some(0));
        assert_eq!(snap.buzzer_mode, Some(3));
        assert_eq!(snap.backlight_status, Some(1));
        assert_eq!(snap.charger_priority, Some(2));
        assert_eq!(snap.max_total_amps, Some(40.0));
        assert_eq!(snap.max_ac_amps, Some(30.0));
        assert_eq!(snap.soc_back_to_grid, Some(80));
        assert_eq!(snap.soc_cutoff, Some(20));
        assert_eq!(snap.battery_type.as_deref(), Some("Lithium"));
        assert_eq!(snap.return_to_default, Some(1));
    }

    #[test]
    fn short_settings_block_changes_nothing() {
        let mut snap = Snapshot::default();
        snap.apply_charger_settings(&[2, 400, 300]);
        snap.apply_charger_settings(&[1]);
        assert_eq!(snap.charger_priority, Some(2));
    }

    #[test]
    fn sensor_fields_serialize_null_when_absent() {
        let doc = serde_json::to_value(&Snapshot::default()).unwrap();
        assert!(doc["grid_volt"].is_null());
        assert!(doc["device_status_msg"].is_null());
        assert!(doc["charger_priority"].is_null());
    }
}
