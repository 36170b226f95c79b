// Protocol constants for Chihiros dosing pumps and LED controllers

use std::time::Duration;
use uuid::Uuid;

/// Nordic UART service
pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Nordic UART RX characteristic (host writes here)
pub const UART_RX: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Nordic UART TX characteristic (device notifies here)
pub const UART_TX: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Byte value the firmware refuses in checksum, message-id and parameter positions
pub const SENTINEL: u8 = 0x5A;

/// Replacement for parameter bytes equal to the sentinel
pub const SENTINEL_REPLACEMENT: u8 = 0x59;

/// Protocol version byte, always 1 on observed firmware
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size: cmd, version, length, msg_hi, msg_lo, mode
pub const HEADER_SIZE: usize = 6;

/// Smallest complete frame (header + checksum, no parameters)
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1;

/// Number of msg-id rotations tried when the checksum lands on the sentinel
pub const CHECKSUM_REBUILD_ATTEMPTS: usize = 8;

/// Length-field bias for the A5 (doser) and 5A (LED) families
pub const LENGTH_BIAS_A5: u8 = 5;

/// Length-field bias for the 5B (LED-style totals) family
pub const LENGTH_BIAS_5B: u8 = 2;

/// Command id: LED controller family (0x5A)
pub const CMD_LED: u8 = 0x5A;

/// Command id: dosing pump family (0xA5)
pub const CMD_DOSER: u8 = 0xA5;

/// Command id: LED-style totals query/response (0x5B)
pub const CMD_LED_QUERY: u8 = 0x5B;

/// Mode: order confirmation / acknowledgement
pub const MODE_ACK: u8 = 0x04;

/// Mode: LED auto-setting control (reset, switch to auto)
pub const MODE_AUTO_CONTROL: u8 = 0x05;

/// Mode: set device time
pub const MODE_SET_TIME: u8 = 0x09;

/// Mode: timer / time reinforce
pub const MODE_TIMER: u8 = 0x15;

/// Mode: manual dose and weekly schedule entry (shared)
pub const MODE_DOSE: u8 = 0x1B;

/// Mode: channel activation / auto-mode flags
pub const MODE_ACTIVATE: u8 = 0x20;

/// Totals query mode used by most firmwares
pub const MODE_TOTALS: u8 = 0x22;

/// Totals query mode used by some older firmwares
pub const MODE_TOTALS_ALT: u8 = 0x1E;

/// Number of dosing channels on the pump
pub const CHANNEL_COUNT: u8 = 4;

/// Largest `hi` bucket accepted by the decode plausibility filters
pub const MAX_PLAUSIBLE_HI: u8 = 10;

/// Weekday mask literal meaning "every day"
pub const EVERYDAY_MASK: u8 = 0x7F;

/// Write attempts before a transient transport error is surfaced
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Pause between a failed attempt and the next one
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

/// Idle time after which the session is closed gracefully
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Spacing between consecutive totals probes
pub const PROBE_SPACING: Duration = Duration::from_millis(80);

/// Default wait for a totals response
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(6);

/// Message shown for every "device not found / unreachable" condition
pub const NOT_FOUND_MSG: &str =
    "Device Not Found, Unreachable or Failed to Connect, ensure Chihiro's App is not connected";
