//! Decodes DVB teletext closed captions out of an MPEG-2 Transport Stream
//! (or BDAV M2TS) and produces an ordered sequence of caption frames.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! teletext-srt = "0.1.0"
//! ```

#![deny(missing_docs, unsafe_code)]

use log::{debug, warn};
use std::convert::TryInto;
use std::io::Read;

mod charset;
mod config;
mod error;
mod frame;
mod hamming;
mod page;
mod payload_unit;
mod pes;
mod psi;
mod slice_reader;
mod srt;
mod ts;

pub use config::{Cli, Config};
pub use error::{Error, ErrorDetails, Result};
pub use frame::CaptionFrame;
pub use slice_reader::SliceReader;
pub use srt::{render_search_engine, render_srt};

use page::PageAssembler;
use payload_unit::PayloadUnitTracker;
use pes::{parse_pes_packet, teletext_data_units, ClockTracker};
use psi::{parse_psi_section, PsiHeader, ProgramTables};
use ts::{ContinuityTracker, PacketSource};

/// Size in bytes of one MPEG-TS packet.
pub const TS_PACKET_SIZE: usize = 188;

/// Sentinel PID value meaning "adopt the first PID carrying a Private
/// Stream 1 (`stream_id == 0xBD`) PES header".
const AUTO_PRIVATE_STREAM_1: u16 = 0x2000;

/// Owns all pipeline state for one decoding run: transport demultiplexing,
/// PSI tables, PES/clock reconciliation, and teletext page assembly.
///
/// # Example
///
/// ```no_run
/// use teletext_srt::{Config, Decoder};
/// use std::fs::File;
///
/// let config = Config {
///     input: "input.ts".into(),
///     output: None,
///     page: None,
///     pid: None,
///     offset_secs: 0.0,
///     omit_bom: false,
///     emit_dummy: false,
///     colour: false,
///     search_engine: None,
///     m2ts: false,
///     verbose: false,
/// };
/// let file = File::open(&config.input).expect("open input");
/// let mut decoder = Decoder::new(&config);
/// let frames = decoder.decode(file, || false).expect("decode");
/// println!("{} frames", frames.len());
/// ```
pub struct Decoder {
    m2ts: bool,
    configured_pid: Option<u16>,
    auto_private_stream_1: bool,
    selected_pid: Option<u16>,
    explicit_utc_ref: bool,
    colour: bool,
    search_engine_mode: bool,

    continuity: ContinuityTracker,
    programs: ProgramTables,
    units: PayloadUnitTracker,
    clock: ClockTracker,
    page: PageAssembler,

    pending_pes: Vec<u8>,
    pes_started: bool,
}

impl Decoder {
    /// Creates a decoder from a validated [`Config`].
    pub fn new(config: &Config) -> Self {
        let auto_private_stream_1 = config.pid == Some(AUTO_PRIVATE_STREAM_1);
        // `-s` with no argument yields `Some("")`: search-engine mode is on
        // but no explicit UTC reference was given, so the fallback is 0
        // unless broadcast service data (Y=30) supplies one.
        let utc_ref_secs = config
            .search_engine
            .as_deref()
            .and_then(|s| if s.is_empty() { None } else { s.parse::<f64>().ok() })
            .unwrap_or(0.0);
        let explicit_utc_ref = config.search_engine.as_deref().is_some_and(|s| !s.is_empty());
        Self {
            m2ts: config.m2ts,
            configured_pid: if auto_private_stream_1 { None } else { config.pid },
            auto_private_stream_1,
            selected_pid: if auto_private_stream_1 { None } else { config.pid },
            explicit_utc_ref,
            colour: config.colour,
            search_engine_mode: config.search_engine.is_some(),
            continuity: ContinuityTracker::default(),
            programs: ProgramTables::default(),
            units: PayloadUnitTracker::default(),
            clock: ClockTracker::new(config.offset_secs, utc_ref_secs),
            page: PageAssembler::new(config.page),
            pending_pes: Vec::with_capacity(4096),
            pes_started: false,
        }
    }

    /// Runs the pipeline to completion over `input`, returning the ordered
    /// caption frames. `should_stop` is polled at the top of the read loop
    /// so embedders can request early termination; the CLI binary never
    /// sets it, matching a reference decoder that always runs to EOF.
    pub fn decode<R: Read>(&mut self, input: R, should_stop: impl Fn() -> bool) -> Result<Vec<frame::CaptionFrame>> {
        let mut source = if self.m2ts {
            PacketSource::new_m2ts(input)
        } else {
            PacketSource::new_ts(input)
        };

        let mut frames = Vec::new();
        let mut last_timestamp_ms: i64 = 0;

        loop {
            if should_stop() {
                break;
            }
            let (raw, _bdav) = match source.next_packet()? {
                Some(p) => p,
                None => break,
            };
            let packet = match ts::parse_packet(&raw) {
                Ok(p) => p,
                Err(e) => {
                    warn!("dropping packet: {}", e);
                    continue;
                }
            };

            if packet.header.tei() {
                continue;
            }
            let pid = packet.header.pid();
            if pid == 0x1FFF {
                continue;
            }

            if let Some(af) = &packet.adaptation_field {
                if let Some(pcr) = af.pcr {
                    last_timestamp_ms = self.clock.observe_pcr(pcr.to_millis());
                }
            }

            if !self.continuity.observe(pid, packet.header.continuity_counter(), packet.header.has_adaptation_field()) {
                debug!("continuity gap on PID {:#x}", pid);
                self.units.discard(pid);
                if pid == self.pes_pid() {
                    self.pending_pes.clear();
                    self.pes_started = false;
                }
            }

            let mut reader = match packet.payload {
                Some(r) => r,
                None => continue,
            };

            if pid == 0 {
                self.handle_psi_payload(pid, packet.header.pusi(), &mut reader)?;
                continue;
            }
            if self.programs.is_pmt_pid(pid) {
                self.handle_psi_payload(pid, packet.header.pusi(), &mut reader)?;
                continue;
            }

            if self.auto_private_stream_1 && self.selected_pid.is_none() && packet.header.pusi() {
                if is_private_stream_1(&mut reader) {
                    debug!("auto-selected PID {:#x} as first Private Stream 1", pid);
                    self.selected_pid = Some(pid);
                }
            }

            let target_pid = match self.selected_pid.or(self.configured_pid) {
                Some(p) => p,
                None => continue,
            };
            if pid != target_pid {
                continue;
            }

            if packet.header.pusi() {
                if self.pes_started && !self.pending_pes.is_empty() {
                    last_timestamp_ms = self.process_pending_pes(last_timestamp_ms, &mut frames)?;
                }
                self.pending_pes.clear();
                self.pes_started = true;
            }
            if !self.pes_started {
                continue;
            }
            let remaining = reader.read_to_end()?;
            self.pending_pes.extend_from_slice(remaining);
        }

        if self.pes_started && !self.pending_pes.is_empty() {
            last_timestamp_ms = self.process_pending_pes(last_timestamp_ms, &mut frames)?;
        }
        self.page.flush(last_timestamp_ms);
        if let Some(completed) = self.page.take_completed() {
            if let Some(f) = frame::format_frame(&completed, self.colour, self.search_engine_mode) {
                frames.push(f);
            }
        }

        Ok(frames)
    }

    fn pes_pid(&self) -> u16 {
        self.selected_pid.or(self.configured_pid).unwrap_or(0xFFFF)
    }

    fn process_pending_pes(&mut self, current_ms: i64, frames: &mut Vec<frame::CaptionFrame>) -> Result<i64> {
        let pes = match parse_pes_packet(&self.pending_pes) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed PES packet: {}", e);
                return Ok(current_ms);
            }
        };

        let now_ms = if let Some(pts) = pes.pts {
            self.clock.observe_pts(pts)
        } else {
            current_ms
        };

        for unit in teletext_data_units(&pes.payload) {
            self.page.decode_packet(unit.payload, now_ms);
            if !self.explicit_utc_ref {
                if let Some(utc_ref) = self.page.take_pending_utc_ref() {
                    debug!("seeding UTC reference from broadcast service data: {}", utc_ref);
                    self.clock.apply_utc_reference(utc_ref);
                }
            }
            if let Some(completed) = self.page.take_completed() {
                if let Some(f) = frame::format_frame(&completed, self.colour, self.search_engine_mode) {
                    frames.push(f);
                }
            }
        }

        Ok(now_ms)
    }

    fn handle_psi_payload(&mut self, pid: u16, pusi: bool, reader: &mut SliceReader) -> Result<()> {
        let finished = if pusi {
            let length = peek_psi_section_length(reader).unwrap_or_else(|| reader.remaining_len());
            self.units.start(pid, length, reader)?
        } else {
            self.units.continue_unit(pid, reader)?
        };
        let finished = match finished {
            Some(f) => f,
            None => return Ok(()),
        };

        let section = match parse_psi_section(&finished) {
            Ok(s) => s,
            Err(e) => {
                warn!("dropping malformed PSI section: {}", e);
                return Ok(());
            }
        };

        if pid == 0 && section.header.table_id() == 0x00 {
            self.programs.parse_pat(&section.data)?;
        } else if self.programs.is_pmt_pid(pid) {
            if let Some(teletext_pid) = self.programs.parse_pmt(&section.data)? {
                if self.configured_pid.is_none() && !self.auto_private_stream_1 && self.selected_pid.is_none() {
                    debug!("selected teletext PID {:#x} from PMT", teletext_pid);
                    self.selected_pid = Some(teletext_pid);
                }
            }
        }
        Ok(())
    }
}

/// Peeks the pointer field and 3-byte PSI header at the start of a PUSI
/// packet's payload to compute the total declared section length, without
/// consuming the reader, so multi-packet sections can be reassembled to
/// their actual declared size instead of just the first packet's share.
fn peek_psi_section_length(reader: &mut SliceReader) -> Option<usize> {
    let pointer_field = reader.peek(1).ok()?[0] as usize;
    let header_offset = 1 + pointer_field;
    let needed = header_offset + 3;
    let bytes = reader.peek(needed).ok()?;
    let header_bytes: [u8; 3] = bytes[header_offset..needed].try_into().ok()?;
    let header = PsiHeader::from_bytes(header_bytes);
    Some(needed + header.section_length() as usize)
}

fn is_private_stream_1(reader: &mut SliceReader) -> bool {
    match reader.peek(4) {
        Ok(bytes) => bytes[0] == 0 && bytes[1] == 0 && bytes[2] == 1 && bytes[3] == 0xBD,
        Err(_) => false,
    }
}
