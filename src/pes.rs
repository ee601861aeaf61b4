//! PES (Packetized Elementary Stream) header parsing, PTS/DTS extraction,
//! and the presentation-clock reconciliation described by ETS 300 472:
//! teletext subtitles are timed off the PES PTS, not the TS PCR, but we
//! track both so the clock can free-run across streams that drop PTS on
//! later packets.

use crate::error::{ErrorDetails, Result};
use crate::slice_reader::SliceReader;
use log::warn;
use modular_bitfield_msb::prelude::*;

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesHeader {
    pub start_code: B24,
    pub stream_id: B8,
    pub packet_length: B16,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original: bool,
    pub has_pts: bool,
    pub has_dts: bool,
    pub escr: bool,
    pub es_rate: bool,
    pub dsm_trick_mode: bool,
    pub has_additional_copy_info: bool,
    pub has_crc: bool,
    pub has_extension: bool,
    pub additional_header_length: B8,
}

/// A parsed PES packet carrying teletext data units in its payload.
#[derive(Debug)]
pub struct PesPacket {
    pub header: PesHeader,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub payload: Vec<u8>,
}

fn parse_timestamp(b: &[u8; 5]) -> u64 {
    let mut ts: u64 = ((b[0] & 0x0E) as u64) << 29;
    ts |= (b[1] as u64) << 22;
    ts |= ((b[2] & 0xFE) as u64) << 14;
    ts |= (b[3] as u64) << 7;
    ts |= ((b[4] & 0xFE) as u64) >> 1;
    ts
}

/// Parses a complete PES packet already reassembled from one or more TS
/// payloads (the caller strips the PUSI-started-new-packet boundary).
pub fn parse_pes_packet(data: &[u8]) -> Result<PesPacket> {
    let mut reader = SliceReader::new(data);
    let header = PesHeader::from_bytes(reader.read_array_ref::<6>()?);
    if header.start_code() != 1 {
        warn!("PES packet missing 0x000001 start code");
        return Err(reader.make_error(ErrorDetails::BadPesHeader));
    }

    let mut pts = None;
    let mut dts = None;
    if reader.remaining_len() >= 3 && header.stream_id() != 0xBF {
        let optional = PesOptionalHeader::from_bytes(reader.read_array_ref::<3>()?);
        let additional_length = optional.additional_header_length() as usize;
        let mut o_reader = reader.new_sub_reader(additional_length)?;

        if optional.has_pts() {
            if o_reader.remaining_len() < 5 {
                warn!("short read of PTS");
                return Err(o_reader.make_error(ErrorDetails::BadPesHeader));
            }
            pts = Some(parse_timestamp(&o_reader.read_array_ref::<5>()?));
        }
        if optional.has_dts() {
            if o_reader.remaining_len() < 5 {
                warn!("short read of DTS");
                return Err(o_reader.make_error(ErrorDetails::BadPesHeader));
            }
            dts = Some(parse_timestamp(&o_reader.read_array_ref::<5>()?));
        }
    }

    Ok(PesPacket {
        header,
        pts,
        dts,
        payload: reader.read_to_end()?.to_vec(),
    })
}

/// One teletext data unit: a data-unit id (0x02 non-subtitle, 0x03
/// subtitle), plus its 44-byte EBU payload (line offset byte and 42 bytes
/// of teletext packet, already bit-reversed per ETS 300 706 §7.2 convention
/// -- the caller still needs to bit-reverse it).
pub struct TeletextDataUnit<'a> {
    pub data_unit_id: u8,
    pub payload: &'a [u8],
}

const TELETEXT_DATA_UNIT_LENGTH: usize = 44;

/// Iterates the teletext data units embedded in a PES payload (ETS 300 472
/// §4.2): after a one-byte data identifier, each unit is
/// `[id][length=44][44 bytes]`, continuing until the payload is exhausted.
pub fn teletext_data_units(payload: &[u8]) -> impl Iterator<Item = TeletextDataUnit<'_>> {
    let body = if payload.is_empty() { payload } else { &payload[1..] };
    TeletextDataUnitIter { data: body }
}

struct TeletextDataUnitIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for TeletextDataUnitIter<'a> {
    type Item = TeletextDataUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.data.len() < 2 {
                return None;
            }
            let data_unit_id = self.data[0];
            let length = self.data[1] as usize;
            if self.data.len() < 2 + length {
                return None;
            }
            let payload = &self.data[2..2 + length];
            self.data = &self.data[2 + length..];
            if length != TELETEXT_DATA_UNIT_LENGTH {
                continue;
            }
            if data_unit_id != 0x02 && data_unit_id != 0x03 {
                continue;
            }
            return Some(TeletextDataUnit { data_unit_id, payload });
        }
    }
}

/// Which clock basis is driving presentation timestamps right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// No timestamp observed yet.
    None,
    /// Derived from a PES PTS on the teletext stream itself.
    Pts,
    /// Derived from the transport's PCR, used when the teletext stream
    /// carries no PTS of its own.
    Pcr,
}

/// Tracks the presentation clock and reconciles it against a requested
/// output time base (`-f` offset plus a UTC reference), reconciling PES PTS
/// against TS PCR when PTS is absent.
///
/// `delta` anchors the raw clock (`t`, ms) to the output timeline: on the
/// first valid timestamp `delta := offset_ms + utc_ref_ms - t`, and on a
/// clock regression (`t < t0`, e.g. a PTS wraparound every ~26.5 hours at
/// 90kHz) `delta` is re-anchored to the last emitted timestamp so the
/// output stays non-decreasing.
#[derive(Debug)]
pub struct ClockTracker {
    source: Option<ClockSource>,
    initialized: bool,
    t0: i64,
    delta: i64,
    base_delta: i64,
    last_timestamp: i64,
}

impl ClockTracker {
    /// Creates a tracker whose first emitted timestamp is anchored at
    /// `1000 * offset_secs + 1000 * utc_ref_secs` milliseconds.
    pub fn new(offset_secs: f64, utc_ref_secs: f64) -> Self {
        let base_delta = ((offset_secs + utc_ref_secs) * 1000.0).round() as i64;
        Self {
            source: None,
            initialized: false,
            t0: 0,
            delta: base_delta,
            base_delta,
            last_timestamp: 0,
        }
    }

    /// Observes a raw 33-bit PTS value (90kHz) and returns the anchored
    /// millisecond timestamp.
    pub fn observe_pts(&mut self, raw: u64) -> i64 {
        self.observe((raw / 90) as i64, ClockSource::Pts)
    }

    /// Observes a PCR already converted to milliseconds and returns the
    /// anchored millisecond timestamp. Ignored once a PTS has been seen.
    pub fn observe_pcr(&mut self, pcr_ms: i64) -> i64 {
        self.observe(pcr_ms, ClockSource::Pcr)
    }

    fn observe(&mut self, t: i64, source: ClockSource) -> i64 {
        if self.source == Some(ClockSource::Pts) && source == ClockSource::Pcr {
            return self.last_timestamp;
        }
        if !self.initialized {
            self.last_timestamp = t + self.delta;
            self.initialized = true;
        } else {
            if t < self.t0 {
                self.delta = self.last_timestamp - t;
            }
            self.last_timestamp = t + self.delta;
        }
        self.t0 = t;
        self.source = Some(source);
        self.last_timestamp
    }

    /// Applies a UTC reference discovered from broadcast service data
    /// (Y=30), used only as a fallback when the command line gave none.
    pub fn apply_utc_reference(&mut self, utc_ref_secs: f64) {
        let extra = (utc_ref_secs * 1000.0).round() as i64;
        if self.initialized {
            self.delta += extra;
            self.last_timestamp += extra;
        } else {
            self.base_delta += extra;
            self.delta = self.base_delta;
        }
    }

    pub fn source(&self) -> ClockSource {
        self.source.unwrap_or(ClockSource::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_pes(stream_id: u8, pts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut header = PesHeader::new();
        header.set_start_code(1);
        header.set_stream_id(stream_id);

        let mut optional_bytes = Vec::new();
        let mut pes_data = Vec::new();

        if let Some(pts) = pts {
            let mut optional = PesOptionalHeader::new();
            optional.set_marker_bits(0b10);
            optional.set_has_pts(true);
            optional.set_additional_header_length(5);
            optional_bytes.extend_from_slice(&optional.into_bytes());

            let mut pts_bytes = [0u8; 5];
            pts_bytes[0] = 0x21 | (((pts >> 29) & 0x0E) as u8);
            pts_bytes[1] = ((pts >> 22) & 0xFF) as u8;
            pts_bytes[2] = (((pts >> 14) & 0xFE) as u8) | 1;
            pts_bytes[3] = ((pts >> 7) & 0xFF) as u8;
            pts_bytes[4] = (((pts << 1) & 0xFE) as u8) | 1;
            optional_bytes.extend_from_slice(&pts_bytes);
        }

        header.set_packet_length((optional_bytes.len() + payload.len()) as u16);
        pes_data.extend_from_slice(&header.into_bytes());
        pes_data.extend_from_slice(&optional_bytes);
        pes_data.extend_from_slice(payload);
        pes_data
    }

    #[test]
    fn parses_pts_from_optional_header() {
        let raw_pts = 123456789u64 & 0x1_FFFF_FFFF;
        let data = build_pes(0xBD, Some(raw_pts), &[0xAA; 4]);
        let pes = parse_pes_packet(&data).unwrap();
        assert_eq!(pes.pts, Some(raw_pts));
        assert!(pes.dts.is_none());
    }

    #[test]
    fn rejects_missing_start_code() {
        let mut data = build_pes(0xBD, None, &[0xAA; 4]);
        data[2] = 0; // corrupt the 24-bit start code
        assert!(parse_pes_packet(&data).is_err());
    }

    #[test]
    fn iterates_teletext_data_units_skipping_non_subtitle_lengths() {
        let mut payload = vec![0x10]; // data identifier
        payload.push(0x02); // data unit id
        payload.push(TELETEXT_DATA_UNIT_LENGTH as u8);
        payload.extend_from_slice(&[0xAB; TELETEXT_DATA_UNIT_LENGTH]);
        payload.push(0x02);
        payload.push(3); // wrong length, must be skipped
        payload.extend_from_slice(&[0, 0, 0]);

        let units: Vec<_> = teletext_data_units(&payload).collect();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data_unit_id, 0x02);
        assert_eq!(units[0].payload.len(), TELETEXT_DATA_UNIT_LENGTH);
    }

    #[test]
    fn clock_tracker_reanchors_on_pts_regression() {
        let mut tracker = ClockTracker::new(0.0, 0.0);
        let first = tracker.observe_pts(900); // t = 10ms
        let second = tracker.observe_pts(1800); // t = 20ms
        assert!(second > first);
        // A PTS wraparound looks like a sudden regression; the tracker must
        // re-anchor so output time keeps moving forward, not backward.
        let wrapped = tracker.observe_pts(450); // t = 5ms, less than previous t0
        assert!(wrapped >= second, "wrapped {} must not go before {}", wrapped, second);
        let after_wrap = tracker.observe_pts(900); // t = 10ms again, now past the wrap point
        assert!(after_wrap > wrapped);
    }

    #[test]
    fn clock_tracker_prefers_pts_over_pcr_once_seen() {
        let mut tracker = ClockTracker::new(0.0, 0.0);
        let pts_ms = tracker.observe_pts(900);
        assert_eq!(tracker.source(), ClockSource::Pts);
        let after = tracker.observe_pcr(900_000);
        assert_eq!(pts_ms, after);
        assert_eq!(tracker.source(), ClockSource::Pts);
    }

    #[test]
    fn clock_tracker_anchors_first_timestamp_to_offset_and_utc_ref() {
        let mut tracker = ClockTracker::new(2.0, 100.0);
        let first = tracker.observe_pts(0);
        assert_eq!(first, 102_000);
    }

    #[test]
    fn clock_tracker_applies_broadcast_utc_reference_before_first_timestamp() {
        let mut tracker = ClockTracker::new(0.0, 0.0);
        tracker.apply_utc_reference(50.0);
        let first = tracker.observe_pts(0);
        assert_eq!(first, 50_000);
    }

    #[test]
    fn clock_tracker_applies_broadcast_utc_reference_after_first_timestamp() {
        let mut tracker = ClockTracker::new(0.0, 0.0);
        tracker.observe_pts(0);
        tracker.apply_utc_reference(5.0);
        assert_eq!(tracker.observe_pts(900), 5010); // t=10ms shifted by +5000ms
    }
}
