//! Static code-to-text tables used by the snapshot projector.

pub const STATUS_FAULT_MODE: u16 = 1;
pub const STATUS_LINE_MODE: u16 = 2;
pub const STATUS_BATTERY_MODE: u16 = 3;

pub fn status_text(code: u16) -> Option<&'static str> {
    Some(match code {
        0 => "Standby / Power Off",
        1 => "Fault Mode",
        2 => "Line Mode (On-Grid)",
        3 => "Battery Mode",
        4 => "Bypass / Warning Mode",
        5 => "Power Saving Mode",
        6 => "Online Mode",
        7 => "Bypass Mode",
        8 => "Digital Bypass",
        9 => "Eco Mode",
        _ => return None,
    })
}

/// Numeric fault register (word 1 of the fault block).
pub fn fault_text(code: u16) -> Option<&'static str> {
    Some(match code {
        0 => "No Fault",
        1 => "Over temperature of inverter module",
        2 => "Over temperature of DCDC module",
        3 => "Battery voltage is too high",
        4 => "Over temperature of PV module",
        5 => "Output short circuited",
        6 => "Output voltage is too high",
        7 => "Overload time out",
        8 => "Bus voltage is too high",
        9 => "Bus soft start failed",
        10 => "PV over current",
        11 => "PV over voltage",
        12 => "DCDC over current",
        13 => "Over current or surge",
        14 => "Bus voltage is too low",
        15 => "Inverter failed (Self-checking)",
        18 => "Op current offset is too high",
        19 => "Inverter current offset is too high",
        20 => "DC/DC current offset is too high",
        21 => "PV current offset is too high",
        22 => "Output voltage is too low",
        23 => "Inverter negative power",
        51 => "Over Current Inverter",
        52 => "Bus Voltage Too Low",
        53 => "Inverter Soft Start Failed",
        55 => "Over DC Voltage in AC Output",
        56 => "Battery Connection Open",
        57 => "Current Sensor Failed",
        58 => "Output Voltage Too Low",
        99 => "Unknown Fault",
        _ => return None,
    })
}

pub fn battery_type_text(code: u16) -> Option<&'static str> {
    Some(match code {
        0 => "AGM",
        1 => "Flooded",
        2 => "User-defined",
        3 => "Lithium",
        4 => "No Battery",
        _ => return None,
    })
}

/// Primary warning bitmask (word 4 of the fault block). The battery-open
/// bit is listed here in wire order but gated on battery activity by the
/// projector.
pub const PRIMARY_WARNING_BITS: &[(u16, &str)] = &[
    (1 << 0, "Fan Locked (01)"),
    (1 << 1, "Temperature High (02)"),
    (1 << 2, "Low Battery (04)"),
    (1 << 3, "BMS Fail (19)"),
    (1 << 4, "Output Derating (10)"),
    (1 << 5, "PV Energy Low (15)"),
    (1 << 6, "Battery Open (bP)"),
    (1 << 7, "Power Limit (09)"),
    (1 << 8, "Low Battery (04-Alt)"),
];

pub const PRIMARY_BATTERY_OPEN_BIT: u16 = 1 << 6;

/// Secondary warning bitmask (word 5 of the fault block).
pub const SECONDARY_SYSTEM_FAULT_BIT: u16 = 1 << 0;
pub const SECONDARY_BATTERY_OPEN_BIT: u16 = 1 << 6;
pub const SECONDARY_BATTERY_RECOVERY_BIT: u16 = 1 << 12;
