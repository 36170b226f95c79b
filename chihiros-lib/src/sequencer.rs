//! Multi-frame doser operations sent through a [`ConnectionEngine`].
//!
//! Every operation is planned in full (and validated) before the first
//! write. Frames are then sent one `send_command` call each, so a failure
//! partway leaves the device with whatever the earlier frames applied.

use crate::commands::{self, ScheduleEncoding};
use crate::constants::{MODE_TOTALS, PROBE_SPACING};
use crate::dose::DoseQuantity;
use crate::engine::ConnectionEngine;
use crate::error::Result;
use crate::frame::Frame;
use crate::totals::{Totals, build_totals_probes, build_totals_query, parse_totals_frame};
use crate::transport::Transport;
use crate::weekday::WeekdaySet;
use chrono::{Local, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// A weekly dosing schedule for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeeklySchedule {
    pub channel: u8,
    pub at: NaiveTime,
    pub days: WeekdaySet,
    pub daily_dose: DoseQuantity,
    pub enabled: bool,
    /// Overrides the sequencer's encoding policy when set
    pub encoding: Option<ScheduleEncoding>,
}

pub struct CommandSequencer<T: Transport> {
    engine: ConnectionEngine<T>,
    clock: Clock,
    encoding: ScheduleEncoding,
}

impl<T: Transport> CommandSequencer<T> {
    pub fn new(engine: ConnectionEngine<T>) -> Self {
        Self {
            engine,
            clock: Arc::new(|| Local::now().naive_local()),
            encoding: ScheduleEncoding::Auto,
        }
    }

    /// Replace the wall clock used for time-sync frames.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveDateTime + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_encoding(mut self, encoding: ScheduleEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn engine(&self) -> &ConnectionEngine<T> {
        &self.engine
    }

    async fn send_each(&self, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            self.engine.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Frames for an immediate one-shot dose.
    pub fn plan_manual_dose(&self, channel: u8, dose: DoseQuantity) -> Result<Vec<Frame>> {
        let frame = self.engine.with_message_ids(|ids| commands::manual_dose(ids, channel, dose))?;
        Ok(vec![frame])
    }

    pub async fn manual_dose(&self, channel: u8, dose: DoseQuantity) -> Result<()> {
        let frames = self.plan_manual_dose(channel, dose)?;
        info!(channel, %dose, "manual dose");
        self.send_each(&frames).await
    }

    /// Frames arming a weekly schedule: two time syncs, acks 4 and 5, the
    /// channel activation, then the schedule entry in the chosen encoding.
    pub fn plan_weekly_schedule(&self, schedule: &WeeklySchedule) -> Result<Vec<Frame>> {
        let channel = commands::check_channel(schedule.channel)?;
        let encoding = schedule.encoding.unwrap_or(self.encoding).resolve(schedule.daily_dose)?;
        let now = (self.clock)();
        self.engine.with_message_ids(|ids| -> Result<Vec<Frame>> {
            let mut frames = vec![
                commands::set_time(ids, now),
                commands::set_time(ids, now),
                commands::doser_ack(ids, 4),
                commands::doser_ack(ids, 5),
                commands::switch_to_auto_mode(ids, channel, false, true)?,
            ];
            frames.extend(commands::weekly_schedule(
                ids,
                encoding,
                channel,
                schedule.at,
                schedule.days,
                schedule.daily_dose,
                schedule.enabled,
            )?);
            Ok(frames)
        })
    }

    pub async fn add_weekly_schedule(&self, schedule: &WeeklySchedule) -> Result<()> {
        let frames = self.plan_weekly_schedule(schedule)?;
        info!(
            channel = schedule.channel,
            time = %schedule.at.format("%H:%M"),
            days = %schedule.days,
            dose = %schedule.daily_dose,
            frames = frames.len(),
            "adding weekly schedule"
        );
        self.send_each(&frames).await
    }

    /// Channel auto-mode switch followed by a time sync.
    pub fn plan_enable_auto_mode(&self, channel: u8) -> Result<Vec<Frame>> {
        let now = (self.clock)();
        self.engine.with_message_ids(|ids| -> Result<Vec<Frame>> {
            Ok(vec![
                commands::switch_to_auto_mode(ids, channel, false, true)?,
                commands::set_time(ids, now),
            ])
        })
    }

    pub async fn enable_auto_mode(&self, channel: u8) -> Result<()> {
        let frames = self.plan_enable_auto_mode(channel)?;
        info!(channel, "enabling auto mode");
        self.send_each(&frames).await
    }

    pub async fn set_time(&self) -> Result<()> {
        let now = (self.clock)();
        let frame = self.engine.with_message_ids(|ids| commands::set_time(ids, now));
        self.engine.send_frame(&frame).await
    }

    pub async fn reset_auto_settings(&self) -> Result<()> {
        let frame = self.engine.with_message_ids(commands::reset_auto_settings);
        self.engine.send_frame(&frame).await
    }

    /// `repeats` copies of an arbitrary frame, each with a fresh message id.
    pub fn plan_raw(&self, cmd: u8, mode: u8, params: &[u8], repeats: usize) -> Result<Vec<Frame>> {
        self.engine
            .with_message_ids(|ids| (0..repeats.max(1)).map(|_| commands::raw(ids, cmd, mode, params)).collect())
    }

    pub async fn send_raw(&self, cmd: u8, mode: u8, params: &[u8], repeats: usize) -> Result<()> {
        let frames = self.plan_raw(cmd, mode, params, repeats)?;
        self.send_each(&frames).await
    }

    /// Query cumulative totals and wait for the first plausible response.
    ///
    /// Sends a 0x5B query for each of `modes`, or the full probe set across
    /// both command families when `modes` is empty, spaced by 80 ms.
    /// `Ok(None)` means nothing decodable arrived within `timeout`.
    pub async fn probe_totals(&self, modes: &[u8], timeout: Duration) -> Result<Option<Totals>> {
        let probes = self.engine.with_message_ids(|ids| {
            if modes.is_empty() {
                build_totals_probes(ids)
            } else {
                modes.iter().map(|&mode| build_totals_query(mode, ids)).collect()
            }
        });

        self.engine.start_notify().await?;
        let wait = self
            .engine
            .wait_for_notification(|data| parse_totals_frame(data).is_some(), timeout);
        let send = async {
            for (i, probe) in probes.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(PROBE_SPACING).await;
                }
                debug!(cmd = probe.cmd_id(), mode = probe.mode(), "totals probe");
                self.engine.send_frame(probe).await?;
            }
            Ok::<(), crate::error::ChihirosError>(())
        };

        let (found, sent) = tokio::join!(wait, send);
        sent?;
        Ok(found?.and_then(|payload| parse_totals_frame(&payload)))
    }

    /// Totals with the firmware's most common query mode.
    pub async fn read_daily_totals(&self, timeout: Duration) -> Result<Option<Totals>> {
        self.probe_totals(&[MODE_TOTALS], timeout).await
    }
}
