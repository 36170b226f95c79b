//! Classification of decoded frames into typed events.
//!
//! The classifier is total: any `(cmd, mode, params)` triple yields an event,
//! with unrecognized shapes landing in [`DecodedEvent::Unknown`].

use crate::constants::{
    CMD_DOSER, CMD_LED, MAX_PLAUSIBLE_HI, MIN_FRAME_SIZE, MODE_ACK, MODE_ACTIVATE, MODE_DOSE, MODE_SET_TIME,
    MODE_TIMER,
};
use crate::dose::{self, MAX_DOSE_TENTHS, MIN_DOSE_TENTHS};
use crate::frame::FrameView;
use crate::weekday::WeekdaySet;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Device clock as carried by a 90/9 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTime {
    pub year: u16,
    pub month: u8,
    /// Third time byte; the sequencer sends the ISO weekday here, some
    /// captures show the day of month
    pub day_or_week_index: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Field flagged as implausible during a best-effort decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeWarning {
    DoseOutOfRange,
    MinuteOutOfRange,
}

/// Weekly schedule entry (165/27).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseEntry {
    pub channel: u8,
    #[serde(rename = "weekdays_mask")]
    pub weekdays: WeekdaySet,
    /// Absent in the legacy layout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_hour: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_minute: Option<u8>,
    pub amount_ml: f64,
    /// Unexplained bytes of the legacy layout
    #[serde(default)]
    pub raw_aux: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<DecodeWarning>,
}

/// Timer / time reinforce frame (165/21).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEvent {
    pub channel: u8,
    /// 1 means 24-hour on some firmwares, enable flag on others
    pub timer_type: u8,
    pub start_hour: u8,
    pub start_minute: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<DecodeWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodedEvent {
    TimeSet(DeviceTime),
    Activate {
        channel: u8,
        catch_up: u8,
        enabled: bool,
    },
    ManualDose {
        channel: u8,
        amount_ml: f64,
        raw: Vec<u8>,
    },
    DoseEntry(DoseEntry),
    Timer(TimerEvent),
    Control {
        cmd: u8,
        mode: u8,
        params: Vec<u8>,
    },
    Unknown {
        cmd: u8,
        mode: u8,
        params: Vec<u8>,
    },
}

impl DecodedEvent {
    /// Channel targeted by the event, for per-channel kinds.
    pub fn channel(&self) -> Option<u8> {
        match self {
            DecodedEvent::Activate { channel, .. } | DecodedEvent::ManualDose { channel, .. } => Some(*channel),
            DecodedEvent::DoseEntry(entry) => Some(entry.channel),
            DecodedEvent::Timer(timer) => Some(timer.channel),
            _ => None,
        }
    }

    pub fn warning(&self) -> Option<DecodeWarning> {
        match self {
            DecodedEvent::DoseEntry(entry) => entry.warning,
            DecodedEvent::Timer(timer) => timer.warning,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DecodedEvent::TimeSet(_) => "time_set",
            DecodedEvent::Activate { .. } => "activate",
            DecodedEvent::ManualDose { .. } => "manual_dose",
            DecodedEvent::DoseEntry(_) => "dose_entry",
            DecodedEvent::Timer(_) => "timer",
            DecodedEvent::Control { .. } => "control",
            DecodedEvent::Unknown { .. } => "unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, DecodedEvent::Unknown { .. })
    }
}

/// A shape test over mode-27 parameters; `None` passes to the next matcher.
type DoseMatcher = fn(&[u8]) -> Option<DecodedEvent>;

/// Tried in order; manual dose wins over weekly entry on shapes both accept.
const DOSE_MATCHERS: [DoseMatcher; 3] = [match_manual_dose, match_weekly_entry, match_legacy_entry];

/// Classify a frame's fields.
pub fn parse_frame(cmd: u8, mode: u8, params: &[u8]) -> DecodedEvent {
    let event = match (cmd, mode, params) {
        (CMD_LED, MODE_SET_TIME, &[yy, month, idx, hour, minute, second]) => DecodedEvent::TimeSet(DeviceTime {
            year: 2000 + u16::from(yy),
            month,
            day_or_week_index: idx,
            hour,
            minute,
            second,
        }),
        (CMD_DOSER, MODE_ACTIVATE, &[channel, catch_up, enabled]) => DecodedEvent::Activate {
            channel,
            catch_up,
            enabled: enabled != 0,
        },
        (CMD_DOSER, MODE_DOSE, p) if matches!(p.len(), 5 | 6) => DOSE_MATCHERS
            .iter()
            .find_map(|matcher| matcher(p))
            .unwrap_or_else(|| unknown(cmd, mode, p)),
        (CMD_DOSER, MODE_TIMER, &[channel, timer_type, start_hour, start_minute, _, _]) => {
            DecodedEvent::Timer(TimerEvent {
                channel,
                timer_type,
                start_hour,
                start_minute,
                warning: (start_minute > 59).then_some(DecodeWarning::MinuteOutOfRange),
            })
        }
        (CMD_LED | CMD_DOSER, MODE_ACK, p) => DecodedEvent::Control {
            cmd,
            mode,
            params: p.to_vec(),
        },
        _ => unknown(cmd, mode, params),
    };

    if let Some(warning) = event.warning() {
        warn!(cmd, mode, ?params, ?warning, "implausible field in decoded frame");
    }
    event
}

/// Classify a complete wire frame. Input too short to carry a header becomes
/// `Unknown` with whatever fields are present.
pub fn decode_frame(bytes: &[u8]) -> DecodedEvent {
    let view = FrameView::from_bytes(bytes);
    match (view.cmd_id, view.mode) {
        (Some(cmd), Some(mode)) if bytes.len() >= MIN_FRAME_SIZE => parse_frame(cmd, mode, &view.params),
        _ => unknown(view.cmd_id.unwrap_or(0), view.mode.unwrap_or(0), &[]),
    }
}

fn unknown(cmd: u8, mode: u8, params: &[u8]) -> DecodedEvent {
    DecodedEvent::Unknown {
        cmd,
        mode,
        params: params.to_vec(),
    }
}

/// `[ch, 0, 0, hi, lo]` or `[ch, 0, 0, x, hi, lo]`
fn match_manual_dose(p: &[u8]) -> Option<DecodedEvent> {
    let (channel, hi, lo) = match *p {
        [channel, 0, 0, hi, lo] | [channel, 0, 0, _, hi, lo] => (channel, hi, lo),
        _ => return None,
    };
    (hi <= MAX_PLAUSIBLE_HI).then(|| DecodedEvent::ManualDose {
        channel,
        amount_ml: dose::decode(hi, lo),
        raw: p.to_vec(),
    })
}

/// `[ch, mask, enable, HH, MM, dose×10]`
fn match_weekly_entry(p: &[u8]) -> Option<DecodedEvent> {
    let &[channel, mask, enable, hour, minute, dose10] = p else {
        return None;
    };
    if mask > 127 || enable > 1 || hour > 23 || minute > 59 {
        return None;
    }
    Some(DecodedEvent::DoseEntry(DoseEntry {
        channel,
        weekdays: WeekdaySet::from_mask(mask),
        enabled: Some(enable == 1),
        time_hour: Some(hour),
        time_minute: Some(minute),
        amount_ml: f64::from(dose10) / 10.0,
        raw_aux: Vec::new(),
        warning: None,
    }))
}

/// `[ch, mask, c1, c2, hi, lo]`, the 25.6/0.1 layout seen in older captures.
fn match_legacy_entry(p: &[u8]) -> Option<DecodedEvent> {
    let &[channel, mask, c1, c2, hi, lo] = p else {
        return None;
    };
    let amount_ml = dose::decode(hi, lo);
    let plausible = (f64::from(MIN_DOSE_TENTHS) / 10.0..=f64::from(MAX_DOSE_TENTHS) / 10.0).contains(&amount_ml);
    Some(DecodedEvent::DoseEntry(DoseEntry {
        channel,
        weekdays: WeekdaySet::from_mask(mask),
        enabled: None,
        time_hour: None,
        time_minute: None,
        amount_ml,
        raw_aux: vec![c1, c2],
        warning: (!plausible).then_some(DecodeWarning::DoseOutOfRange),
    }))
}
