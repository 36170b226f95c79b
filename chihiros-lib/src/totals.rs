//! Cumulative dosed-volume ("totals") queries and responses.
//!
//! Responses are LED-style 0x5B frames whose parameters carry four
//! `(hi, lo)` pairs, one per channel. Some firmwares pad the parameter list,
//! so the decoder also scans for an embedded plausible window.

use crate::constants::{CHANNEL_COUNT, CMD_DOSER, CMD_LED_QUERY, HEADER_SIZE, MAX_PLAUSIBLE_HI, MODE_TOTALS, MODE_TOTALS_ALT};
use crate::dose;
use crate::frame::{Frame, build_frame, encode_5b};
use crate::message_id::MessageIdCounter;

/// Bytes in one totals window: four `(hi, lo)` pairs
pub const TOTALS_WINDOW: usize = 2 * CHANNEL_COUNT as usize;

/// Shortest frame considered a totals response
pub const MIN_TOTALS_FRAME: usize = 15;

/// Per-channel totals in mL, channel 0 first.
pub type Totals = [f64; CHANNEL_COUNT as usize];

/// A parameter-less 0x5B query for `mode`.
pub fn build_totals_query(mode: u8, ids: &mut MessageIdCounter) -> Frame {
    let (frame, used) = encode_5b(mode, ids.advance(), &[]);
    ids.observe(used);
    frame
}

/// Query frames covering the known firmware variants, in preference order:
/// 5B/0x22, 5B/0x1E, A5/0x22, A5/0x1E.
pub fn build_totals_probes(ids: &mut MessageIdCounter) -> Vec<Frame> {
    let mut probes = Vec::with_capacity(4);
    for cmd in [CMD_LED_QUERY, CMD_DOSER] {
        for mode in [MODE_TOTALS, MODE_TOTALS_ALT] {
            let (frame, used) = build_frame(cmd, mode, ids.advance(), &[]);
            ids.observe(used);
            probes.push(frame);
        }
    }
    probes
}

/// Decode four channel totals from a 0x5B response, or `None` when the
/// payload carries no plausible window.
pub fn parse_totals_frame(payload: &[u8]) -> Option<Totals> {
    if payload.len() < MIN_TOTALS_FRAME || payload[0] != CMD_LED_QUERY {
        return None;
    }
    let params = &payload[HEADER_SIZE..payload.len() - 1];
    if params.len() == TOTALS_WINDOW && looks_like_totals(params) {
        return Some(decode_window(params));
    }
    find_totals_window(params)
}

/// First plausible 8-byte window in a bare parameter list.
pub fn find_totals_window(params: &[u8]) -> Option<Totals> {
    params
        .windows(TOTALS_WINDOW)
        .find(|window| looks_like_totals(window))
        .map(decode_window)
}

fn looks_like_totals(window: &[u8]) -> bool {
    window.len() == TOTALS_WINDOW && window.chunks_exact(2).all(|pair| pair[0] <= MAX_PLAUSIBLE_HI)
}

fn decode_window(window: &[u8]) -> Totals {
    let mut totals = [0.0; CHANNEL_COUNT as usize];
    for (slot, pair) in totals.iter_mut().zip(window.chunks_exact(2)) {
        *slot = dose::decode(pair[0], pair[1]);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::xor_checksum;

    fn response(params: &[u8]) -> Vec<u8> {
        let mut body = vec![0x5B, 0x01, params.len() as u8 + 2, 0x00, 0x01, MODE_TOTALS];
        body.extend_from_slice(params);
        body.push(xor_checksum(&body));
        body
    }

    #[test]
    fn strict_window() {
        let totals = parse_totals_frame(&response(&[0, 5, 1, 0, 0, 0, 2, 10])).unwrap();
        assert_eq!(totals, [0.5, 25.6, 0.0, 52.2]);
    }

    #[test]
    fn embedded_window_matches_strict() {
        let strict = parse_totals_frame(&response(&[1, 140, 0, 0, 0, 20, 3, 3])).unwrap();
        let padded = parse_totals_frame(&response(&[200, 201, 1, 140, 0, 0, 0, 20, 3, 3, 99])).unwrap();
        assert_eq!(strict, padded);
    }

    #[test]
    fn rejects_short_or_foreign_frames() {
        assert!(parse_totals_frame(&[0x5B; 10]).is_none());
        let mut frame = response(&[0, 0, 0, 0, 0, 0, 0, 0]);
        frame[0] = 0xA5;
        assert!(parse_totals_frame(&frame).is_none());
        assert!(parse_totals_frame(&response(&[50, 0, 50, 0, 50, 0, 50, 0])).is_none());
    }

    #[test]
    fn probes_cover_both_families() {
        let mut ids = MessageIdCounter::new();
        let probes = build_totals_probes(&mut ids);
        let shape: Vec<(u8, u8, u8)> = probes.iter().map(|f| (f.cmd_id(), f.mode(), f.as_bytes()[2])).collect();
        assert_eq!(shape, vec![(0x5B, 0x22, 2), (0x5B, 0x1E, 2), (0xA5, 0x22, 5), (0xA5, 0x1E, 5)]);
        assert_eq!(ids.current(), probes[3].msg_id());
    }
}
