//! Link-layer framing of 188-byte MPEG-TS packets (and the 4-byte-prefixed
//! 192-byte BDAV/M2TS variant): sync-byte recovery, header parsing,
//! adaptation-field/PCR extraction, and continuity-counter tracking.

use crate::error::{ErrorDetails, Result};
use crate::slice_reader::SliceReader;
use crate::{read_bitfield, TS_PACKET_SIZE};
use log::warn;
use modular_bitfield_msb::prelude::*;
use std::io::Read;

/// Sync byte required at the start of every MPEG-TS packet.
pub const SYNC_BYTE: u8 = 0x47;

/// TSC information carried in a packet's header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Reserved value; not used in practice.
    Reserved,
    /// Scrambled with the even key. Scrambled streams are out of scope;
    /// this is decoded but otherwise ignored.
    ScrambledEvenKey,
    /// Scrambled with the odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// BDAV-specific 4-byte header prepended to every 192-byte M2TS packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct BdavPacketHeader {
    /// Copy protection indicator.
    pub cpi: B2,
    /// 27MHz decoder time reference (not present in every packet's value;
    /// only meaningful when this packet also carries adaptation-field data).
    pub timestamp: B30,
}

/// Non-payload adaptation-field metadata.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct AdaptationFieldHeader {
    pub length: B8,
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Program Clock Reference: a 90kHz base plus 27MHz extension.
#[derive(Debug, Default, Copy, Clone)]
pub struct PcrTimestamp {
    /// 33-bit base of a 90kHz clock.
    pub base: u64,
    /// 9-bit extension of a 27MHz clock rolling over every 300 counts.
    pub extension: u16,
}

impl PcrTimestamp {
    /// Converts this PCR to milliseconds.
    pub fn to_millis(self) -> i64 {
        (self.base / 90) as i64 + (self.extension as i64) / 27000
    }
}

fn parse_pcr(b: &[u8; 6]) -> PcrTimestamp {
    let mut base: u64 = (b[0] as u64) << 25;
    base |= (b[1] as u64) << 17;
    base |= (b[2] as u64) << 9;
    base |= (b[3] as u64) << 1;
    base |= (b[4] as u64) >> 7;

    let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
    extension |= b[5] as u16;
    PcrTimestamp { base, extension }
}

/// Parsed adaptation field of one TS packet.
#[derive(Debug)]
pub struct AdaptationField {
    pub header: AdaptationFieldHeader,
    pub pcr: Option<PcrTimestamp>,
}

fn read_adaptation_field(reader: &mut SliceReader) -> Result<AdaptationField> {
    let mut out = AdaptationField {
        header: read_bitfield!(reader, AdaptationFieldHeader),
        pcr: None,
    };
    let len = out.header.length() as usize;
    if len == 0 {
        return Ok(out);
    }
    if len > 183 {
        warn!("bad adaptation field length {}", len);
        return Err(reader.make_error(ErrorDetails::BadAdaptationField));
    }
    let mut a_reader = reader.new_sub_reader(len - 1)?;
    if out.header.has_pcr() {
        if a_reader.remaining_len() < 6 {
            warn!("short read of PCR");
            return Err(reader.make_error(ErrorDetails::BadAdaptationField));
        }
        out.pcr = Some(parse_pcr(&a_reader.read_array_ref::<6>()?));
    }
    Ok(out)
}

/// A fully parsed TS packet header plus its optional adaptation field and
/// the raw payload slice (if any), still unparsed at this layer.
pub struct TsPacket<'a> {
    pub header: PacketHeader,
    pub adaptation_field: Option<AdaptationField>,
    pub payload: Option<SliceReader<'a>>,
}

/// Parses one already-extracted 188-byte TS packet buffer (the BDAV prefix,
/// if any, must already have been stripped by the caller).
pub fn parse_packet(packet: &[u8; TS_PACKET_SIZE]) -> Result<TsPacket<'_>> {
    let mut reader = SliceReader::new(packet);
    let header: PacketHeader = read_bitfield!(reader, PacketHeader);
    if header.sync_byte() != SYNC_BYTE {
        return Err(reader.make_error(ErrorDetails::LostSync));
    }

    let mut out = TsPacket {
        header,
        adaptation_field: None,
        payload: None,
    };

    if out.header.pid() == 0x1FFF || out.header.tei() {
        // Null packet or corrupted packet; nothing more to extract.
        return Ok(out);
    }

    if out.header.has_adaptation_field() {
        out.adaptation_field = Some(read_adaptation_field(&mut reader)?);
    }
    if out.header.has_payload() {
        out.payload = Some(reader);
    }
    Ok(out)
}

/// Pulls fixed-size TS (or M2TS) packets out of a byte stream, recovering
/// from sync-byte loss by rescanning the buffered packet window for the
/// next `0x47` and realigning to it, reading only as many extra bytes as
/// were discarded to restore a full window.
pub struct PacketSource<R> {
    reader: R,
    packet_size: usize,
    prefix_len: usize,
    buf: Vec<u8>,
}

impl<R: Read> PacketSource<R> {
    /// Creates a source reading plain 188-byte TS packets.
    pub fn new_ts(reader: R) -> Self {
        Self {
            reader,
            packet_size: TS_PACKET_SIZE,
            prefix_len: 0,
            buf: Vec::new(),
        }
    }

    /// Creates a source reading 192-byte M2TS packets (4-byte BDAV prefix
    /// followed by a 188-byte TS packet).
    pub fn new_m2ts(reader: R) -> Self {
        Self {
            reader,
            packet_size: TS_PACKET_SIZE + 4,
            prefix_len: 4,
            buf: Vec::new(),
        }
    }

    /// Tops `self.buf` up to a full `packet_size` window, reading only the
    /// bytes missing from what's already buffered. Returns `false` at a
    /// clean end of stream (buffer was already empty); a short read that
    /// leaves a partial trailing window is also treated as end of stream,
    /// discarding the dangling bytes.
    fn fill_window(&mut self) -> Result<bool> {
        let start = self.buf.len();
        if start == self.packet_size {
            return Ok(true);
        }
        self.buf.resize(self.packet_size, 0);
        match read_exact_or_eof(&mut self.reader, &mut self.buf[start..])? {
            true => Ok(true),
            false => {
                // Couldn't complete the window, whether from a clean EOF or
                // a short read stranding a partial trailing window; either
                // way there's no more data to form a full packet from.
                self.buf.clear();
                Ok(false)
            }
        }
    }

    /// Reads the next packet, returning `None` at a clean end of stream.
    ///
    /// Returns the raw 188-byte TS packet body (with the M2TS prefix, if
    /// any, already stripped) plus its BDAV header when present.
    ///
    /// On sync loss, rescans the buffered window for the next `0x47` and
    /// realigns to it by dropping only the bad leading bytes, instead of
    /// discarding the whole window: a corrupted run shorter than one packet
    /// no longer strands every packet after it out of phase.
    pub fn next_packet(&mut self) -> Result<Option<([u8; TS_PACKET_SIZE], Option<BdavPacketHeader>)>> {
        loop {
            if self.buf.len() < self.packet_size && !self.fill_window()? {
                return Ok(None);
            }

            let sync_index = self.buf[self.prefix_len..]
                .iter()
                .position(|&b| b == SYNC_BYTE);
            match sync_index {
                Some(0) => {
                    let bdav = if self.prefix_len > 0 {
                        let mut prefix = [0u8; 4];
                        prefix.copy_from_slice(&self.buf[..4]);
                        Some(BdavPacketHeader::from_bytes(prefix))
                    } else {
                        None
                    };
                    let mut packet = [0u8; TS_PACKET_SIZE];
                    packet.copy_from_slice(&self.buf[self.prefix_len..self.prefix_len + TS_PACKET_SIZE]);
                    self.buf.drain(0..self.packet_size);
                    return Ok(Some((packet, bdav)));
                }
                Some(i) => {
                    // Sync found mid-window: drop only the bad prefix and
                    // refill around it, realigning instead of resetting.
                    warn!("lost sync at offset {} in packet window, realigning", i);
                    self.buf.drain(0..self.prefix_len + i);
                    continue;
                }
                None => {
                    warn!("no sync byte found in packet window, discarding");
                    self.buf.clear();
                    continue;
                }
            }
        }
    }
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            // Short read mid-packet: treat as end of stream, discard the
            // partial trailing bytes.
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Tracks per-PID continuity counters, detecting discontinuities.
#[derive(Default)]
pub struct ContinuityTracker {
    last: std::collections::HashMap<u16, u8>,
}

impl ContinuityTracker {
    /// Observes a packet's continuity counter for `pid`. Returns `true` if
    /// this is a legal continuation (first packet for a PID is always
    /// legal), `false` on a detected gap.
    pub fn observe(&mut self, pid: u16, cc: u8, discontinuity_indicated: bool) -> bool {
        let ok = match self.last.get(&pid) {
            None => true,
            Some(&prev) => discontinuity_indicated || cc == (prev + 1) & 0x0F,
        };
        self.last.insert(pid, cc);
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(pid: u16, pusi: bool, cc: u8) -> [u8; TS_PACKET_SIZE] {
        let mut header = PacketHeader::new();
        header.set_sync_byte(SYNC_BYTE);
        header.set_pusi(pusi);
        header.set_pid(pid);
        header.set_has_payload(true);
        header.set_continuity_counter(cc);
        let mut packet = [0xFFu8; TS_PACKET_SIZE];
        packet[0..4].copy_from_slice(&header.into_bytes()[0..4]);
        packet
    }

    #[test]
    fn parse_packet_rejects_bad_sync() {
        let mut packet = make_packet(0x100, true, 0);
        packet[0] = 0x00;
        assert!(parse_packet(&packet).is_err());
    }

    #[test]
    fn parse_packet_extracts_header_fields() {
        let packet = make_packet(0x123, true, 7);
        let parsed = parse_packet(&packet).unwrap();
        assert_eq!(parsed.header.pid(), 0x123);
        assert!(parsed.header.pusi());
        assert_eq!(parsed.header.continuity_counter(), 7);
        assert!(parsed.payload.is_some());
    }

    #[test]
    fn null_packets_have_no_payload_reader() {
        let packet = make_packet(0x1FFF, false, 0);
        let parsed = parse_packet(&packet).unwrap();
        assert!(parsed.payload.is_none());
    }

    #[test]
    fn continuity_tracker_flags_gaps() {
        let mut t = ContinuityTracker::default();
        assert!(t.observe(0x100, 0, false));
        assert!(t.observe(0x100, 1, false));
        assert!(!t.observe(0x100, 3, false));
        assert!(t.observe(0x100, 3, true)); // discontinuity indicated: OK
    }

    #[test]
    fn packet_source_reads_ts_stream() {
        let packet = make_packet(0x100, true, 0);
        let source_bytes = packet.to_vec();
        let mut source = PacketSource::new_ts(std::io::Cursor::new(source_bytes));
        let (p, bdav) = source.next_packet().unwrap().unwrap();
        assert_eq!(p, packet);
        assert!(bdav.is_none());
        assert!(source.next_packet().unwrap().is_none());
    }

    #[test]
    fn packet_source_reads_m2ts_stream() {
        let packet = make_packet(0x100, true, 0);
        let mut m2ts = vec![0u8; 4];
        m2ts.extend_from_slice(&packet);
        let mut source = PacketSource::new_m2ts(std::io::Cursor::new(m2ts));
        let (p, bdav) = source.next_packet().unwrap().unwrap();
        assert_eq!(p, packet);
        assert!(bdav.is_some());
    }

    #[test]
    fn resyncs_after_sync_loss_not_aligned_to_packet_size() {
        let packet1 = make_packet(0x100, true, 0);
        let packet2 = make_packet(0x200, true, 1);
        let mut stream = packet1.to_vec();
        stream.extend_from_slice(&[0xAAu8; 7]); // corruption narrower than one packet
        stream.extend_from_slice(&packet2);

        let mut source = PacketSource::new_ts(std::io::Cursor::new(stream));
        let (p1, _) = source.next_packet().unwrap().unwrap();
        assert_eq!(p1, packet1);
        let (p2, _) = source.next_packet().unwrap().unwrap();
        assert_eq!(p2, packet2);
        assert!(source.next_packet().unwrap().is_none());
    }
}
