mod common;

use chihiros_lib::commands::ScheduleEncoding;
use chihiros_lib::engine::ConnectionEngine;
use chihiros_lib::event::{DecodedEvent, decode_frame};
use chihiros_lib::{CommandSequencer, DoseQuantity, EngineConfig, MessageId, WeeklySchedule, WeekdaySet};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use common::*;
use rstest::rstest;
use std::time::Duration;

fn fixed_now() -> NaiveDateTime {
    // Thursday
    NaiveDate::from_ymd_opt(2025, 10, 2).unwrap().and_hms_opt(11, 28, 47).unwrap()
}

fn sequencer() -> (CommandSequencer<MockTransport>, MockTransport) {
    let mock = MockTransport::new();
    let sequencer = CommandSequencer::new(ConnectionEngine::new(mock.clone())).with_clock(fixed_now);
    (sequencer, mock)
}

fn schedule(channel: u8, ml: f64) -> WeeklySchedule {
    WeeklySchedule {
        channel,
        at: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
        days: WeekdaySet::EVERYDAY,
        daily_dose: DoseQuantity::from_ml(ml).unwrap(),
        enabled: true,
        encoding: None,
    }
}

/// (cmd, mode, params) of each written frame
fn written(mock: &MockTransport) -> Vec<(u8, u8, Vec<u8>)> {
    mock.writes()
        .iter()
        .map(|w| (w[0], w[5], w[6..w.len() - 1].to_vec()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn small_weekly_dose_uses_byte_variant() {
    let (sequencer, mock) = sequencer();

    sequencer.add_weekly_schedule(&schedule(2, 7.5)).await.unwrap();

    assert_eq!(
        written(&mock),
        vec![
            (90, 9, vec![25, 10, 4, 11, 28, 47]),
            (90, 9, vec![25, 10, 4, 11, 28, 47]),
            (165, 4, vec![4]),
            (165, 4, vec![5]),
            (165, 32, vec![2, 0, 1]),
            (165, 27, vec![2, 127, 1, 8, 30, 75]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn large_weekly_dose_uses_hi_lo_pair() {
    let (sequencer, mock) = sequencer();

    sequencer.add_weekly_schedule(&schedule(1, 39.6)).await.unwrap();

    let frames = written(&mock);
    assert_eq!(frames.len(), 7);
    assert_eq!(frames[5], (165, 21, vec![1, 1, 8, 30, 0, 0]));
    assert_eq!(frames[6], (165, 27, vec![1, 127, 1, 0, 1, 140]));
}

#[rstest]
#[case(ScheduleEncoding::HiLo, 5.0, 7)]
#[case(ScheduleEncoding::ByteTenths, 25.5, 6)]
#[case(ScheduleEncoding::Auto, 25.6, 7)]
#[tokio::test(start_paused = true)]
async fn encoding_policy_selects_frame_count(
    #[case] encoding: ScheduleEncoding,
    #[case] ml: f64,
    #[case] frames: usize,
) {
    let (sequencer, _mock) = sequencer();
    let sequencer = sequencer.with_encoding(encoding);
    assert_eq!(sequencer.plan_weekly_schedule(&schedule(0, ml)).unwrap().len(), frames);
}

#[tokio::test(start_paused = true)]
async fn forced_byte_encoding_rejects_large_dose_before_io() {
    let (sequencer, mock) = sequencer();
    let mut too_big = schedule(0, 30.0);
    too_big.encoding = Some(ScheduleEncoding::ByteTenths);

    let err = sequencer.add_weekly_schedule(&too_big).await.unwrap_err();

    assert!(matches!(err, ChihirosError::InvalidParameter(_)), "{err}");
    assert_eq!(mock.connects(), 0);
    assert_eq!(sequencer.engine().current_msg_id(), MessageId::default());
}

#[tokio::test(start_paused = true)]
async fn message_ids_advance_across_a_sequence() {
    let (sequencer, _mock) = sequencer();
    let frames = sequencer.plan_weekly_schedule(&schedule(3, 50.0)).unwrap();

    let ids: Vec<MessageId> = frames.iter().map(|f| f.msg_id()).collect();
    for pair in ids.windows(2) {
        assert!((pair[1].hi, pair[1].lo) > (pair[0].hi, pair[0].lo), "{ids:?}");
    }
    assert_eq!(sequencer.engine().current_msg_id(), *ids.last().unwrap());
}

#[tokio::test(start_paused = true)]
async fn failure_partway_leaves_earlier_frames_applied() {
    let mock = MockTransport::new();
    let config = EngineConfig {
        attempts: 1,
        ..Default::default()
    };
    let sequencer = CommandSequencer::new(ConnectionEngine::with_config(mock.clone(), config)).with_clock(fixed_now);
    mock.script_writes(vec![None, None, Some(TransportError::Transient("dropped".into()))]);

    let err = sequencer.add_weekly_schedule(&schedule(0, 5.0)).await.unwrap_err();

    assert!(matches!(err, ChihirosError::Transport(_)));
    assert_eq!(mock.writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn manual_dose_frame_decodes_back() {
    let (sequencer, mock) = sequencer();

    sequencer
        .manual_dose(3, DoseQuantity::from_ml(39.6).unwrap())
        .await
        .unwrap();

    let writes = mock.writes();
    assert_eq!(writes.len(), 1);
    match decode_frame(&writes[0]) {
        DecodedEvent::ManualDose { channel, amount_ml, .. } => {
            assert_eq!(channel, 3);
            assert!((amount_ml - 39.6).abs() < 1e-9);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn invalid_channel_is_rejected() {
    let (sequencer, mock) = sequencer();
    let dose = DoseQuantity::from_ml(1.0).unwrap();
    assert!(matches!(
        sequencer.manual_dose(4, dose).await,
        Err(ChihirosError::InvalidParameter(_))
    ));
    assert!(sequencer.enable_auto_mode(9).await.is_err());
    assert_eq!(mock.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn enable_auto_mode_switches_then_syncs_time() {
    let (sequencer, mock) = sequencer();

    sequencer.enable_auto_mode(1).await.unwrap();

    assert_eq!(
        written(&mock),
        vec![(165, 32, vec![1, 0, 1]), (90, 9, vec![25, 10, 4, 11, 28, 47])]
    );
}

#[tokio::test(start_paused = true)]
async fn reset_auto_settings_frame() {
    let (sequencer, mock) = sequencer();
    sequencer.reset_auto_settings().await.unwrap();
    assert_eq!(written(&mock), vec![(90, 5, vec![5, 255, 255])]);
}

#[tokio::test(start_paused = true)]
async fn raw_frames_repeat_with_fresh_ids() {
    let (sequencer, mock) = sequencer();

    sequencer.send_raw(165, 4, &[1], 3).await.unwrap();

    let writes = mock.writes();
    assert_eq!(writes.len(), 3);
    assert_eq!(writes[0][3..5], [0, 1]);
    assert_eq!(writes[1][3..5], [0, 2]);
    assert_eq!(writes[2][3..5], [0, 3]);
}

#[tokio::test(start_paused = true)]
async fn oversized_raw_params_are_rejected_before_io() {
    let (sequencer, mock) = sequencer();

    let err = sequencer.send_raw(165, 4, &[1; 252], 1).await.unwrap_err();

    assert!(matches!(err, ChihirosError::InvalidParameter(_)), "{err}");
    assert_eq!(mock.connects(), 0);
    assert_eq!(sequencer.engine().current_msg_id(), MessageId::default());

    sequencer.send_raw(165, 4, &[1; 250], 1).await.unwrap();
    assert_eq!(mock.writes()[0][2], 255);
}

#[tokio::test(start_paused = true)]
async fn probe_totals_returns_first_plausible_response() {
    let (sequencer, mock) = sequencer();
    mock.auto_reply(|frame| (frame[0] == 0x5B).then(|| totals_response(&[0, 5, 1, 0, 0, 0, 2, 10])));

    let totals = sequencer.probe_totals(&[], Duration::from_secs(6)).await.unwrap();

    assert_eq!(totals, Some([0.5, 25.6, 0.0, 52.2]));
    assert_eq!(mock.writes().len(), 4, "all probes are still sent");
}

#[tokio::test(start_paused = true)]
async fn probe_totals_ignores_unrelated_notifications() {
    let (sequencer, mock) = sequencer();
    mock.auto_reply(|frame| match frame[0] {
        0xA5 => Some(vec![0xA5, 0x01, 0x06, 0x00, 0x01, 0x04, 0x01, 0x03]),
        _ => None,
    });

    let started = tokio::time::Instant::now();
    let totals = sequencer.read_daily_totals(Duration::from_secs(6)).await.unwrap();

    assert_eq!(totals, None);
    assert!(started.elapsed() >= Duration::from_secs(6));
}
