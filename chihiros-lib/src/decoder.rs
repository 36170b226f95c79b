//! Capture decoding: from logged frames to a per-channel device state.
//!
//! The pipeline is `parse_capture_log` → `decode_records` →
//! `build_device_state` → `to_config_lines`. Every stage is total over its
//! input; noise in a capture yields `Unknown` events or skipped lines, never
//! an error.

use crate::constants::{CHANNEL_COUNT, MAX_PLAUSIBLE_HI};
use crate::dose;
use crate::event::{DecodedEvent, DeviceTime, parse_frame};
use crate::totals::{Totals, find_totals_window};
use crate::weekday::WeekdaySet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, trace};

static ENCODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)Encode Message.*?Command ID\s*:\s*(\d+).*?Mode\s*:\s*(\d+).*?Parameters\s*:\s*(\[[^\]]*\])")
        .expect("encode block pattern is valid")
});

static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-?\d+").expect("integer pattern is valid"));

/// One logged frame, header fields and parameters only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub cmd: u8,
    pub mode: u8,
    pub params: Vec<u8>,
}

impl FrameRecord {
    pub fn new(cmd: u8, mode: u8, params: impl Into<Vec<u8>>) -> Self {
        Self {
            cmd,
            mode,
            params: params.into(),
        }
    }
}

/// Values are masked to a byte, as the capture tools print them.
fn to_byte(value: i64) -> u8 {
    (value & 0xFF) as u8
}

fn int_list(text: &str) -> Vec<u8> {
    match serde_json::from_str::<Vec<i64>>(text) {
        Ok(values) => values.into_iter().map(to_byte).collect(),
        Err(_) => INTEGER
            .find_iter(text)
            .filter_map(|m| m.as_str().parse::<i64>().ok())
            .map(to_byte)
            .collect(),
    }
}

fn json_record(value: &Value) -> Option<FrameRecord> {
    let (cmd, mode, params) = match value {
        Value::Object(map) => (map.get("cmd")?, map.get("mode")?, map.get("params")?),
        Value::Array(items) if items.len() == 3 && items[2].is_array() => (&items[0], &items[1], &items[2]),
        _ => return None,
    };
    let params = params
        .as_array()?
        .iter()
        .map(|v| v.as_i64().map(to_byte))
        .collect::<Option<Vec<u8>>>()?;
    Some(FrameRecord::new(to_byte(cmd.as_i64()?), to_byte(mode.as_i64()?), params))
}

/// Extract frame records from a capture text.
///
/// Recognizes `Encode Message ... Command ID: N ... Mode: M ... Parameters: [..]`
/// blocks (case-insensitive, spanning lines) first, then JSON lines of the
/// form `{"cmd":N,"mode":M,"params":[..]}` or `[N, M, [..]]`.
pub fn parse_capture_log(text: &str) -> Vec<FrameRecord> {
    let mut records = Vec::new();

    for caps in ENCODE_BLOCK.captures_iter(text) {
        let (Ok(cmd), Ok(mode)) = (caps[1].parse::<i64>(), caps[2].parse::<i64>()) else {
            continue;
        };
        records.push(FrameRecord::new(to_byte(cmd), to_byte(mode), int_list(&caps[3])));
    }

    for line in text.lines().map(str::trim) {
        if !(line.starts_with('{') || line.starts_with('[')) {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => {
                if let Some(record) = json_record(&value) {
                    records.push(record);
                }
            }
            Err(e) => trace!(error = %e, "skipping malformed JSON line"),
        }
    }

    debug!(count = records.len(), "parsed capture records");
    records
}

/// Classify each record, preserving order.
pub fn decode_records<'a, I>(records: I) -> Vec<DecodedEvent>
where
    I: IntoIterator<Item = &'a FrameRecord>,
{
    records
        .into_iter()
        .map(|r| parse_frame(r.cmd, r.mode, &r.params))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub timer_type: Option<u8>,
    pub start_hour: Option<u8>,
    pub start_minute: Option<u8>,
}

/// Accumulated view of one dosing channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel: u8,
    pub enabled: Option<bool>,
    pub amount_ml: Option<f64>,
    pub weekdays: Option<WeekdaySet>,
    pub time_hour: Option<u8>,
    pub time_minute: Option<u8>,
    pub timer: TimerState,
}

impl ChannelState {
    fn new(channel: u8) -> Self {
        Self {
            channel,
            enabled: None,
            amount_ml: None,
            weekdays: None,
            time_hour: None,
            time_minute: None,
            timer: TimerState::default(),
        }
    }

    /// Merge one channel event; fields it carries overwrite earlier values.
    fn merge(&mut self, event: &DecodedEvent) {
        match event {
            DecodedEvent::Activate { enabled, .. } => self.enabled = Some(*enabled),
            DecodedEvent::DoseEntry(entry) => {
                self.amount_ml = Some(entry.amount_ml);
                self.weekdays = Some(entry.weekdays);
                self.time_hour = entry.time_hour.or(self.time_hour);
                self.time_minute = entry.time_minute.or(self.time_minute);
                self.enabled = entry.enabled.or(self.enabled);
            }
            DecodedEvent::ManualDose { amount_ml, .. } => self.amount_ml = Some(*amount_ml),
            DecodedEvent::Timer(timer) => {
                self.timer = TimerState {
                    timer_type: Some(timer.timer_type),
                    start_hour: Some(timer.start_hour),
                    start_minute: Some(timer.start_minute),
                };
            }
            _ => {}
        }
    }

    /// Weekly time if known, else the timer start.
    pub fn effective_time(&self) -> Option<(u8, u8)> {
        match (self.time_hour, self.time_minute) {
            (Some(h), Some(m)) => Some((h, m)),
            _ => self.timer.start_hour.zip(self.timer.start_minute),
        }
    }
}

/// Device snapshot reconstructed from a decode pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_time: Option<DeviceTime>,
    pub channels: BTreeMap<u8, ChannelState>,
    /// Control, unknown and out-of-range channel events, in input order
    pub other_events: Vec<DecodedEvent>,
}

impl DeviceState {
    pub fn channel(&self, channel: u8) -> Option<&ChannelState> {
        self.channels.get(&channel)
    }
}

/// Left-to-right fold of events into a [`DeviceState`].
pub fn build_device_state<'a, I>(events: I) -> DeviceState
where
    I: IntoIterator<Item = &'a DecodedEvent>,
{
    let mut state = DeviceState::default();
    for event in events {
        if let DecodedEvent::TimeSet(time) = event {
            state.device_time = Some(*time);
            continue;
        }
        match event.channel() {
            Some(channel) if channel < CHANNEL_COUNT => state
                .channels
                .entry(channel)
                .or_insert_with(|| ChannelState::new(channel))
                .merge(event),
            _ => state.other_events.push(event.clone()),
        }
    }
    state
}

/// Flat `key=value` projection of a state, channels in ascending order.
pub fn to_config_lines(state: &DeviceState) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(t) = &state.device_time {
        lines.push(format!(
            "device_time={:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            t.year, t.month, t.day_or_week_index, t.hour, t.minute, t.second
        ));
    }
    for (ch, st) in &state.channels {
        if let Some(enabled) = st.enabled {
            lines.push(format!("ch{ch}.enabled={}", u8::from(enabled)));
        }
        if let Some(ml) = st.amount_ml {
            lines.push(format!("ch{ch}.amount_ml={ml:.1}"));
        }
        if let Some(days) = st.weekdays {
            lines.push(format!("ch{ch}.weekday_mask={}", days.mask()));
            lines.push(format!("ch{ch}.weekdays={days}"));
        }
        if let Some((h, m)) = st.effective_time() {
            lines.push(format!("ch{ch}.time={h:02}:{m:02}"));
        }
        if let Some(timer_type) = st.timer.timer_type {
            lines.push(format!("ch{ch}.timer_type={timer_type}"));
        }
    }
    lines
}

/// Parse, decode and fold a capture text in one call.
pub fn decode_capture(text: &str) -> DeviceState {
    let records = parse_capture_log(text);
    let events = decode_records(&records);
    build_device_state(&events)
}

/// Best-effort reading of a bare parameter list logged without its header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "guess", rename_all = "snake_case")]
pub enum BurstGuess {
    Timer {
        channel: u8,
        hour: u8,
        minute: u8,
    },
    Weekly {
        channel: u8,
        weekdays: WeekdaySet,
        enabled: bool,
        hour: u8,
        minute: u8,
        dose_tenths: u8,
    },
    ManualDose {
        channel: u8,
        amount_ml: f64,
    },
    Totals {
        totals_ml: Totals,
    },
    Unknown {
        len: usize,
    },
}

type BurstMatcher = fn(&[u8]) -> Option<BurstGuess>;

/// Weekly before timer: every weekly shape also passes the looser timer test.
const BURST_MATCHERS: [BurstMatcher; 4] = [guess_weekly, guess_timer, guess_manual_dose, guess_totals];

/// Guess what a parameter burst encodes. Purely diagnostic.
pub fn guess_param_burst(params: &[u8]) -> BurstGuess {
    BURST_MATCHERS
        .iter()
        .find_map(|matcher| matcher(params))
        .unwrap_or(BurstGuess::Unknown { len: params.len() })
}

fn guess_timer(p: &[u8]) -> Option<BurstGuess> {
    match *p {
        [channel, _, hour, minute, _, _] if hour <= 23 && minute <= 59 => Some(BurstGuess::Timer { channel, hour, minute }),
        _ => None,
    }
}

fn guess_weekly(p: &[u8]) -> Option<BurstGuess> {
    match *p {
        [channel, mask, enable, hour, minute, dose_tenths] if mask <= 127 && enable <= 1 && hour <= 23 && minute <= 59 => {
            Some(BurstGuess::Weekly {
                channel,
                weekdays: WeekdaySet::from_mask(mask),
                enabled: enable == 1,
                hour,
                minute,
                dose_tenths,
            })
        }
        _ => None,
    }
}

fn guess_manual_dose(p: &[u8]) -> Option<BurstGuess> {
    match *p {
        [channel, 0, 0, hi, lo] | [channel, 0, 0, _, hi, lo] if hi <= MAX_PLAUSIBLE_HI => Some(BurstGuess::ManualDose {
            channel,
            amount_ml: dose::decode(hi, lo),
        }),
        _ => None,
    }
}

fn guess_totals(p: &[u8]) -> Option<BurstGuess> {
    find_totals_window(p).map(|totals_ml| BurstGuess::Totals { totals_ml })
}
