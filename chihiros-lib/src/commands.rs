//! Builders for every frame the host writes to a doser.
//!
//! Each builder draws the next message id from the caller's counter and
//! folds back the id actually used, so a sequence of builders yields a
//! strictly advancing id stream. Channels are 0-based on the wire (0..=3).

use crate::constants::{
    CHANNEL_COUNT, CMD_DOSER, CMD_LED, MODE_ACK, MODE_ACTIVATE, MODE_AUTO_CONTROL, MODE_DOSE, MODE_SET_TIME, MODE_TIMER,
};
use crate::dose::DoseQuantity;
use crate::error::{ChihirosError, Result};
use crate::frame::{Frame, build_frame, check_param_len};
use crate::message_id::MessageIdCounter;
use crate::weekday::WeekdaySet;
use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Largest dose expressible by the single-byte weekly variant, in tenths
pub const BYTE_VARIANT_MAX_TENTHS: u16 = u8::MAX as u16;

/// How a weekly schedule carries its daily amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleEncoding {
    /// Byte variant up to 25.5 mL, hi/lo above
    #[default]
    Auto,
    /// One 165/27 frame with dose×10 in a single byte
    ByteTenths,
    /// 165/21 time frame followed by 165/27 with a `(hi, lo)` amount
    HiLo,
}

impl ScheduleEncoding {
    /// Settle `Auto` for `dose`, rejecting a forced byte variant that cannot
    /// carry the amount.
    pub fn resolve(self, dose: DoseQuantity) -> Result<ScheduleEncoding> {
        let fits_byte = dose.tenths() <= BYTE_VARIANT_MAX_TENTHS;
        match self {
            ScheduleEncoding::Auto if fits_byte => Ok(ScheduleEncoding::ByteTenths),
            ScheduleEncoding::Auto => Ok(ScheduleEncoding::HiLo),
            ScheduleEncoding::ByteTenths if !fits_byte => Err(ChihirosError::InvalidParameter(format!(
                "{dose} exceeds the 25.5 mL limit of the byte schedule encoding"
            ))),
            other => Ok(other),
        }
    }
}

/// Validate a 0-based channel index.
pub fn check_channel(channel: u8) -> Result<u8> {
    if channel >= CHANNEL_COUNT {
        return Err(ChihirosError::InvalidParameter(format!(
            "channel {channel} out of range 0..={}",
            CHANNEL_COUNT - 1
        )));
    }
    Ok(channel)
}

fn emit(ids: &mut MessageIdCounter, cmd: u8, mode: u8, params: &[u8]) -> Frame {
    let (frame, used) = build_frame(cmd, mode, ids.advance(), params);
    ids.observe(used);
    frame
}

/// Immediate dose: 165/27 `[ch, 0, 0, hi, lo]`.
pub fn manual_dose(ids: &mut MessageIdCounter, channel: u8, dose: DoseQuantity) -> Result<Frame> {
    let channel = check_channel(channel)?;
    let (hi, lo) = dose.encode();
    Ok(emit(ids, CMD_DOSER, MODE_DOSE, &[channel, 0, 0, hi, lo]))
}

/// Weekly entry, byte variant: 165/27 `[ch, mask, en, HH, MM, dose×10]`.
pub fn weekly_entry_byte(
    ids: &mut MessageIdCounter,
    channel: u8,
    at: NaiveTime,
    days: WeekdaySet,
    dose: DoseQuantity,
    enabled: bool,
) -> Result<Frame> {
    let channel = check_channel(channel)?;
    let dose10 = u8::try_from(dose.tenths()).map_err(|_| {
        ChihirosError::InvalidParameter(format!("{dose} does not fit the single-byte dose field"))
    })?;
    Ok(emit(
        ids,
        CMD_DOSER,
        MODE_DOSE,
        &[channel, days.mask(), u8::from(enabled), at.hour() as u8, at.minute() as u8, dose10],
    ))
}

/// Weekly entry, hi/lo variant: the 165/21 time frame, then 165/27
/// `[ch, mask, en, 0, hi, lo]`.
pub fn weekly_entry_hi_lo(
    ids: &mut MessageIdCounter,
    channel: u8,
    at: NaiveTime,
    days: WeekdaySet,
    dose: DoseQuantity,
    enabled: bool,
) -> Result<[Frame; 2]> {
    let time = timer(ids, channel, at, enabled)?;
    let (hi, lo) = dose.encode();
    let amount = emit(ids, CMD_DOSER, MODE_DOSE, &[channel, days.mask(), u8::from(enabled), 0, hi, lo]);
    Ok([time, amount])
}

/// Weekly entry frames for an already-resolved or `Auto` encoding.
pub fn weekly_schedule(
    ids: &mut MessageIdCounter,
    encoding: ScheduleEncoding,
    channel: u8,
    at: NaiveTime,
    days: WeekdaySet,
    dose: DoseQuantity,
    enabled: bool,
) -> Result<Vec<Frame>> {
    match encoding.resolve(dose)? {
        ScheduleEncoding::HiLo => Ok(weekly_entry_hi_lo(ids, channel, at, days, dose, enabled)?.to_vec()),
        _ => Ok(vec![weekly_entry_byte(ids, channel, at, days, dose, enabled)?]),
    }
}

/// Time reinforce: 165/21 `[ch, en, HH, MM, 0, 0]`.
pub fn timer(ids: &mut MessageIdCounter, channel: u8, at: NaiveTime, enabled: bool) -> Result<Frame> {
    let channel = check_channel(channel)?;
    Ok(emit(
        ids,
        CMD_DOSER,
        MODE_TIMER,
        &[channel, u8::from(enabled), at.hour() as u8, at.minute() as u8, 0, 0],
    ))
}

/// Channel auto-mode flags: 165/32 `[ch, catch_up, active]`.
pub fn switch_to_auto_mode(ids: &mut MessageIdCounter, channel: u8, catch_up: bool, active: bool) -> Result<Frame> {
    let channel = check_channel(channel)?;
    Ok(emit(
        ids,
        CMD_DOSER,
        MODE_ACTIVATE,
        &[channel, u8::from(catch_up), u8::from(active)],
    ))
}

/// Button/ack wrapper, e.g. 90/4 `[1]`, 165/4 `[4]`, 165/4 `[5]`.
pub fn order_confirmation(ids: &mut MessageIdCounter, cmd: u8, mode: u8, value: u8) -> Frame {
    emit(ids, cmd, mode, &[value])
}

/// Doser acknowledgement 165/4 `[value]`.
pub fn doser_ack(ids: &mut MessageIdCounter, value: u8) -> Frame {
    order_confirmation(ids, CMD_DOSER, MODE_ACK, value)
}

/// 90/5 `[5, 255, 255]`; effect is firmware dependent.
pub fn reset_auto_settings(ids: &mut MessageIdCounter) -> Frame {
    emit(ids, CMD_LED, MODE_AUTO_CONTROL, &[5, 255, 255])
}

/// LED controller switch to auto: 90/5 `[18, 255, 255]`.
pub fn led_switch_to_auto(ids: &mut MessageIdCounter) -> Frame {
    emit(ids, CMD_LED, MODE_AUTO_CONTROL, &[18, 255, 255])
}

/// Device clock: 90/9 `[YY, MM, iso weekday, HH, MM, SS]`.
pub fn set_time(ids: &mut MessageIdCounter, now: NaiveDateTime) -> Frame {
    let params = [
        (now.year() - 2000).rem_euclid(256) as u8,
        now.month() as u8,
        now.weekday().number_from_monday() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ];
    emit(ids, CMD_LED, MODE_SET_TIME, &params)
}

/// Arbitrary frame from already range-checked bytes.
pub fn raw(ids: &mut MessageIdCounter, cmd: u8, mode: u8, params: &[u8]) -> Result<Frame> {
    check_param_len(cmd, params.len())?;
    Ok(emit(ids, cmd, mode, params))
}
