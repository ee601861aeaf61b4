//! Teletext packet decoding (address byte Hamming decode, magazine/row
//! dispatch) and page assembly into a 25x40 UCS-2 grid (ETS 300 706).

use crate::charset::{accent_translate, g0_table_for_subset, g0_translate, g2_translate};
use crate::hamming::{bit_reverse_unit, hamming_24_18, hamming_8_4, parity_check};
use log::{debug, warn};
use std::collections::HashSet;

pub const ROWS: usize = 25;
pub const COLS: usize = 40;

pub const START_BOX: u16 = 0x0B;
pub const END_BOX: u16 = 0x0A;

/// Which charset subset ID is currently in force, and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChartsetSlot {
    Undefined,
    Subset(u8),
}

impl ChartsetSlot {
    fn subset(self) -> Option<u8> {
        match self {
            ChartsetSlot::Undefined => None,
            ChartsetSlot::Subset(id) => Some(id),
        }
    }
}

/// Mutable page buffer: a 25x40 grid of UCS-2 code points plus timing.
pub struct PageBuffer {
    pub show_ms: i64,
    pub hide_ms: i64,
    pub grid: [[u16; COLS]; ROWS],
    pub tainted: bool,
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self {
            show_ms: 0,
            hide_ms: 0,
            grid: [[0u16; COLS]; ROWS],
            tainted: false,
        }
    }
}

/// Whether target-page reception is following serial or parallel
/// transmission mode (ETS 300 706 §9.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransmissionMode {
    Serial,
    Parallel,
}

/// Owns all teletext page-assembly state: current target page, primary
/// charset precedence slots, the in-progress/completed page buffer, the
/// CC-map, and the X/26 overlay cursor.
pub struct PageAssembler {
    target_page: Option<u16>,
    target_magazine: u8,
    receiving: bool,
    transmission_mode: TransmissionMode,

    current_charset: u8,
    g0_m29: ChartsetSlot,
    g0_x28: ChartsetSlot,
    g0_table: [u16; 96],

    page: PageBuffer,
    completed: Option<PageBuffer>,

    /// Bitmap indexed by the raw BCD low byte of a page number; bit `m-1` is
    /// set once a subtitle page has been observed on magazine `m`. Consulted
    /// for auto-select diagnostics, not for the auto-select decision itself
    /// (that adopts the first subtitle page seen, regardless of history).
    cc_map: [u8; 256],
    warned_subsets: HashSet<u8>,

    overlay_row: usize,
    overlay_col: usize,

    broadcast_service_data_seen: bool,
    pending_utc_ref: Option<f64>,
}

impl Default for PageAssembler {
    fn default() -> Self {
        Self {
            target_page: None,
            target_magazine: 0,
            receiving: false,
            transmission_mode: TransmissionMode::Serial,
            current_charset: 0,
            g0_m29: ChartsetSlot::Undefined,
            g0_x28: ChartsetSlot::Undefined,
            g0_table: g0_table_for_subset(0),
            page: PageBuffer::default(),
            completed: None,
            cc_map: [0u8; 256],
            warned_subsets: HashSet::new(),
            overlay_row: 0,
            overlay_col: 0,
            broadcast_service_data_seen: false,
            pending_utc_ref: None,
        }
    }
}

fn bcd_to_decimal(b: u8) -> u32 {
    ((b >> 4) & 0xF) as u32 * 10 + (b & 0xF) as u32
}

fn magazine_from_address(raw: u8) -> u8 {
    let m = raw & 0x7;
    if m == 0 {
        8
    } else {
        m
    }
}

impl PageAssembler {
    pub fn new(target_page: Option<u16>) -> Self {
        Self {
            target_page,
            ..Self::default()
        }
    }

    /// Takes ownership of the most recently completed page, if any.
    pub fn take_completed(&mut self) -> Option<PageBuffer> {
        self.completed.take()
    }

    /// Takes the UTC reference discovered from broadcast service data
    /// (Y=30), if any has arrived since the last call.
    pub fn take_pending_utc_ref(&mut self) -> Option<f64> {
        self.pending_utc_ref.take()
    }

    fn remap_g0(&mut self) {
        let effective = self.g0_x28.subset().or(self.g0_m29.subset()).unwrap_or(self.current_charset);
        self.g0_table = g0_table_for_subset(effective);
        if effective > 13 && !self.warned_subsets.contains(&effective) {
            warn!("unknown G0 charset subset id {}", effective);
            self.warned_subsets.insert(effective);
        }
    }

    fn emit_current_if_tainted(&mut self, now_ms: i64) {
        if self.page.tainted {
            self.page.hide_ms = now_ms - 40;
            if self.page.hide_ms < self.page.show_ms {
                self.page.hide_ms = self.page.show_ms;
            }
            let finished = std::mem::take(&mut self.page);
            self.completed = Some(finished);
        } else {
            self.page = PageBuffer::default();
        }
    }

    /// Flushes any tainted in-progress page at end of stream.
    pub fn flush(&mut self, now_ms: i64) {
        if self.page.tainted {
            self.page.hide_ms = now_ms;
            let finished = std::mem::take(&mut self.page);
            self.completed = Some(finished);
        }
    }

    fn handle_header(&mut self, m: u8, data: &[u8], now_ms: i64) {
        if data.len() < 40 {
            return;
        }
        let page_units = hamming_8_4(data[0]);
        let page_tens = hamming_8_4(data[1]);
        let (page_units, page_tens) = match (page_units, page_tens) {
            (Some(u), Some(t)) => (u, t),
            _ => return,
        };
        let low_byte = (page_tens << 4) | page_units;
        let page_id = ((m as u16) << 8) | low_byte as u16;

        let c4 = hamming_8_4(data[2]).unwrap_or(0);
        let c6 = hamming_8_4(data[3]).unwrap_or(0);
        let c8 = hamming_8_4(data[4]).unwrap_or(0);
        let c10 = hamming_8_4(data[5]).unwrap_or(0);

        let subtitle_flag = c4 & 0x8 != 0;
        let is_serial = c6 & 0x1 != 0;
        self.transmission_mode = if is_serial {
            TransmissionMode::Serial
        } else {
            TransmissionMode::Parallel
        };

        if subtitle_flag && m as usize >= 1 && m as usize <= 8 {
            self.cc_map[low_byte as usize] |= 1 << (m - 1);
        }

        if self.target_page.is_none() && subtitle_flag {
            debug!(
                "auto-selected teletext page {:#05x} on magazine {} (subtitle magazines seen for page {:#04x}: {:#010b})",
                page_id, m, low_byte, self.cc_map[low_byte as usize]
            );
            self.target_page = Some(page_id);
            self.target_magazine = m;
        }

        let target = match self.target_page {
            Some(p) => p,
            None => return,
        };

        let terminates = match self.transmission_mode {
            TransmissionMode::Serial => page_id != target,
            TransmissionMode::Parallel => m == self.target_magazine && page_id != target,
        };
        if terminates {
            if self.receiving {
                self.emit_current_if_tainted(now_ms);
            }
            self.receiving = false;
            return;
        }

        if page_id != target {
            return;
        }

        // New reception of the target page.
        if self.receiving {
            self.emit_current_if_tainted(now_ms);
        }
        self.receiving = true;
        self.target_magazine = m;
        self.page = PageBuffer {
            show_ms: now_ms,
            ..PageBuffer::default()
        };
        self.g0_x28 = ChartsetSlot::Undefined;

        // C12..C14 (national option subset, 3 bits) are split across the
        // header's hamming-decoded control nibbles per ETS 300 706 Table 7.
        let subset = ((c10 & 0x4) >> 2) | ((c8 & 0x8) >> 1);
        self.current_charset = subset;
        self.remap_g0();
    }

    fn handle_text_row(&mut self, y: usize, data: &[u8]) {
        if !self.receiving || y == 0 || y >= ROWS {
            return;
        }
        for (col, &raw) in data.iter().take(COLS).enumerate() {
            if self.page.grid[y][col] != 0 {
                continue;
            }
            let parity_checked = parity_check(raw);
            let code_point = if parity_checked < 0x20 {
                parity_checked as u16
            } else {
                g0_translate(&self.g0_table, parity_checked)
            };
            self.page.grid[y][col] = code_point;
        }
        self.page.tainted = true;
    }

    fn handle_overlay(&mut self, data: &[u8]) {
        if !self.receiving {
            return;
        }
        // 13 Hamming 24/18 triplets, each 3 bytes.
        for chunk in data.chunks_exact(3).take(13) {
            let word = (chunk[0] as u32) | ((chunk[1] as u32) << 8) | ((chunk[2] as u32) << 16);
            let payload = match hamming_24_18(word) {
                Some(p) => p,
                None => continue,
            };
            let address = (payload & 0x3F) as u8;
            let mode = ((payload >> 6) & 0x1F) as u8;
            let data_bits = ((payload >> 11) & 0x7F) as u8;
            let row_address_group = (40..=63).contains(&address);

            if mode == 0x04 && row_address_group {
                let mut row = address - 40;
                if row == 0 {
                    row = 24;
                }
                self.overlay_row = row as usize;
                self.overlay_col = 0;
            } else if (0x11..=0x1F).contains(&mode) && row_address_group {
                break;
            } else if mode == 0x0F && !row_address_group {
                self.overlay_col = address as usize;
                if data_bits > 31 {
                    self.write_overlay_cell(g2_translate(data_bits));
                }
            } else if (0x11..=0x1F).contains(&mode) && !row_address_group {
                self.overlay_col = address as usize;
                let cp = accent_translate(mode, data_bits)
                    .unwrap_or_else(|| g0_translate(&self.g0_table, parity_check(data_bits)));
                self.write_overlay_cell(cp);
            }
        }
    }

    fn write_overlay_cell(&mut self, cp: u16) {
        if self.overlay_row < ROWS && self.overlay_col < COLS {
            self.page.grid[self.overlay_row][self.overlay_col] = cp;
            self.page.tainted = true;
        }
    }

    fn handle_x28(&mut self, designation: u8, data: &[u8]) {
        if !self.receiving || (designation != 0 && designation != 4) || data.len() < 3 {
            return;
        }
        let word = (data[0] as u32) | ((data[1] as u32) << 8) | ((data[2] as u32) << 16);
        let payload = match hamming_24_18(word) {
            Some(p) => p,
            None => return,
        };
        if payload & 0xF != 0 {
            return;
        }
        let subset = ((payload >> 7) & 0x7F) as u8;
        self.g0_x28 = ChartsetSlot::Subset(subset);
        self.remap_g0();
    }

    fn handle_m29(&mut self, designation: u8, data: &[u8]) {
        if (designation != 0 && designation != 4) || data.len() < 3 {
            return;
        }
        let word = (data[0] as u32) | ((data[1] as u32) << 8) | ((data[2] as u32) << 16);
        let payload = match hamming_24_18(word) {
            Some(p) => p,
            None => return,
        };
        if payload & 0xFF != 0 {
            return;
        }
        let subset = ((payload >> 7) & 0x7F) as u8;
        self.g0_m29 = ChartsetSlot::Subset(subset);
        if matches!(self.g0_x28, ChartsetSlot::Undefined) {
            self.remap_g0();
        }
    }

    /// Decodes packet 8/30 once per stream: a 20-byte programme label
    /// (logged for diagnostics only) followed by a Modified Julian Day plus
    /// BCD UTC time used to seed a search-engine-mode UTC reference when
    /// none was given on the command line (ETS 300 706 §9.8.1).
    fn handle_broadcast_service_data(&mut self, data: &[u8]) {
        if self.broadcast_service_data_seen || data.len() < 25 {
            return;
        }
        self.broadcast_service_data_seen = true;

        let label: String = data[0..20]
            .iter()
            .filter_map(|&b| {
                let c = parity_check(b);
                if c >= 0x20 {
                    char::from_u32(g0_translate(&self.g0_table, c) as u32)
                } else {
                    None
                }
            })
            .collect();
        if !label.trim().is_empty() {
            debug!("broadcast service data label: {}", label.trim());
        }

        let mjd = ((data[20] as u32) << 8) | data[21] as u32;
        let hours = bcd_to_decimal(data[22]);
        let minutes = bcd_to_decimal(data[23]);
        let seconds = bcd_to_decimal(data[24]);
        if hours > 23 || minutes > 59 || seconds > 59 {
            return;
        }

        let days_since_epoch = mjd as i64 - 40587;
        let seconds_of_day = hours as i64 * 3600 + minutes as i64 * 60 + seconds as i64;
        let epoch_secs = (days_since_epoch * 86400 + seconds_of_day) as f64;
        self.pending_utc_ref = Some(epoch_secs);
    }

    /// Decodes one 44-byte teletext data unit payload: first byte is the
    /// line offset, remaining 42 bytes are the bit-reversed teletext packet
    /// (2 Hamming 8/4 address bytes + 40 data bytes).
    pub fn decode_packet(&mut self, unit_payload: &[u8], now_ms: i64) {
        if unit_payload.len() < 2 {
            return;
        }
        let mut packet = unit_payload[1..].to_vec();
        bit_reverse_unit(&mut packet);
        if packet.len() < 2 {
            return;
        }

        let addr_1 = match hamming_8_4(packet[0]) {
            Some(v) => v,
            None => {
                warn!("uncorrectable teletext address byte");
                return;
            }
        };
        let addr_2 = match hamming_8_4(packet[1]) {
            Some(v) => v,
            None => {
                warn!("uncorrectable teletext address byte");
                return;
            }
        };
        let m = magazine_from_address(addr_1);
        let y = (((addr_2 & 0xF) as usize) << 1) | ((addr_1 as usize >> 3) & 1);
        let data = &packet[2..];

        match y {
            0 => self.handle_header(m, data, now_ms),
            1..=23 => {
                if m == self.target_magazine {
                    self.handle_text_row(y, data);
                }
            }
            26 => {
                if m == self.target_magazine {
                    self.handle_overlay(data);
                }
            }
            28 => {
                if m == self.target_magazine && !data.is_empty() {
                    let designation = data[0] & 0xF;
                    self.handle_x28(designation, &data[1..]);
                }
            }
            29 => {
                if m == self.target_magazine && !data.is_empty() {
                    let designation = data[0] & 0xF;
                    self.handle_m29(designation, &data[1..]);
                }
            }
            30 if m == 8 => self.handle_broadcast_service_data(data),
            _ => {}
        }
    }

    pub fn target_page(&self) -> Option<u16> {
        self.target_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magazine_zero_maps_to_eight() {
        assert_eq!(magazine_from_address(0), 8);
        assert_eq!(magazine_from_address(3), 3);
    }

    #[test]
    fn assembler_starts_with_no_target_page() {
        let assembler = PageAssembler::default();
        assert!(assembler.target_page().is_none());
    }

    #[test]
    fn handle_header_marks_cc_map_bit_for_magazine() {
        let encode = |d: u8| -> u8 {
            let d1 = d & 1;
            let d2 = (d >> 1) & 1;
            let d3 = (d >> 2) & 1;
            let d4 = (d >> 3) & 1;
            let p1 = d1 ^ d2 ^ d3;
            let p2 = d1 ^ d3 ^ d4;
            let p3 = d1 ^ d2 ^ d4;
            let p4 = p1 ^ p2 ^ d1 ^ p3 ^ d2 ^ d3 ^ d4;
            (p1 << 7) | (d1 << 6) | (p2 << 5) | (d2 << 4) | (p3 << 3) | (d3 << 2) | (p4 << 1) | d4
        };
        let mut assembler = PageAssembler::default();
        let mut data = [0x20u8; 40];
        data[0] = encode(0x2); // units = 2
        data[1] = encode(0x3); // tens = 3
        data[2] = encode(0x8); // C4: subtitle flag set

        assembler.handle_header(5, &data, 0);

        let low_byte = 0x32;
        assert_eq!(assembler.cc_map[low_byte as usize], 1 << (5 - 1));
        assert_eq!(assembler.target_page(), Some((5u16 << 8) | low_byte));
    }

    #[test]
    fn broadcast_service_data_yields_utc_reference_once() {
        let mut assembler = PageAssembler::default();
        let mut data = [0x20u8; 25];
        // MJD for 1970-01-01 is 40587, so this should decode to 12:00:00 UTC
        // on the Unix epoch date, i.e. exactly 43200 seconds.
        data[20] = 0x9E; // MJD high byte: 40587 = 0x9E8B
        data[21] = 0x8B;
        data[22] = 0x12; // BCD 12 (hours)
        data[23] = 0x00;
        data[24] = 0x00;
        assembler.handle_broadcast_service_data(&data);
        assert_eq!(assembler.take_pending_utc_ref(), Some(43_200.0));
        // Only decoded once per stream.
        assembler.handle_broadcast_service_data(&data);
        assert_eq!(assembler.take_pending_utc_ref(), None);
    }
}
