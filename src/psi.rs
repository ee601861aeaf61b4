//! PAT/PMT (Program Specific Information) parsing, used only to learn the
//! teletext elementary stream's PID when the user didn't pin one down.

use crate::error::{ErrorDetails, Result};
use crate::read_bitfield;
use crate::slice_reader::SliceReader;
use crc::{Crc, CRC_32_MPEG_2};
use log::{debug, warn};
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;
use std::collections::HashSet;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);
const MAX_PMT_PIDS: usize = 128;

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PsiHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    #[skip]
    pub unused_bits: B2,
    pub section_length: B10,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PatEntry {
    pub program_num: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PmtHeader {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub program_info_length: B10,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct ElementaryStreamInfoHeader {
    pub stream_type: B8,
    pub reserved: B3,
    pub elementary_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub es_info_length: B10,
}

#[derive(Debug)]
pub struct Descriptor {
    pub tag: u8,
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    fn parse(reader: &mut SliceReader) -> Result<Self> {
        let tag = reader.read_u8()?;
        let len = reader.read_u8()? as usize;
        let mut data = SmallVec::new();
        data.extend_from_slice(reader.read(len)?);
        Ok(Self { tag, data })
    }
}

/// Descriptor tags, per ETS 300 468, that identify a teletext elementary
/// stream: VBI teletext (0x45), VBI data (0x46), teletext (0x56).
const TELETEXT_DESCRIPTOR_TAGS: [u8; 3] = [0x45, 0x46, 0x56];

/// Tracks PAT/PMT state across a stream: known PMT PIDs and any teletext
/// elementary PIDs discovered while walking PMTs.
#[derive(Default)]
pub struct ProgramTables {
    known_pmt_pids: HashSet<u16>,
    teletext_pids: Vec<u16>,
}

impl ProgramTables {
    pub fn is_pmt_pid(&self, pid: u16) -> bool {
        self.known_pmt_pids.contains(&pid)
    }

    /// Parses a complete PAT section (pointer field, header and CRC already
    /// stripped by [`parse_psi_section`]).
    pub fn parse_pat(&mut self, data: &[u8]) -> Result<()> {
        self.known_pmt_pids.clear();
        let mut reader = SliceReader::new(data);
        reader.skip(5)?; // table syntax bytes: not needed here
        while reader.remaining_len() >= 4 {
            let entry: PatEntry = read_bitfield!(reader, PatEntry);
            if entry.program_num() != 0 {
                if self.known_pmt_pids.len() < MAX_PMT_PIDS {
                    self.known_pmt_pids.insert(entry.program_map_pid());
                } else {
                    warn!("PMT PID table full, dropping PID {:#x}", entry.program_map_pid());
                }
            }
        }
        Ok(())
    }

    /// Parses a complete PMT section. Returns the first newly-discovered
    /// teletext PID, if any.
    pub fn parse_pmt(&mut self, data: &[u8]) -> Result<Option<u16>> {
        let mut reader = SliceReader::new(data);
        reader.skip(5)?; // table syntax bytes: not needed here
        let header: PmtHeader = read_bitfield!(reader, PmtHeader);
        let mut info_reader = reader.new_sub_reader(header.program_info_length() as usize)?;
        while info_reader.remaining_len() > 0 {
            Descriptor::parse(&mut info_reader)?;
        }

        let mut first_new = None;
        while reader.remaining_len() > 0 {
            let es_header: ElementaryStreamInfoHeader = read_bitfield!(reader, ElementaryStreamInfoHeader);
            let mut es_reader = reader.new_sub_reader(es_header.es_info_length() as usize)?;
            let mut is_teletext = false;
            while es_reader.remaining_len() > 0 {
                let descriptor = Descriptor::parse(&mut es_reader)?;
                if es_header.stream_type() == 0x06 && TELETEXT_DESCRIPTOR_TAGS.contains(&descriptor.tag) {
                    is_teletext = true;
                }
            }
            if is_teletext {
                let pid = es_header.elementary_pid();
                if !self.teletext_pids.contains(&pid) {
                    debug!("discovered teletext elementary PID {:#x}", pid);
                    self.teletext_pids.push(pid);
                    if first_new.is_none() {
                        first_new = Some(pid);
                    }
                }
            }
        }
        Ok(first_new)
    }
}

/// A validated PSI section: table id and the section body with the pointer
/// field, 3-byte header and trailing CRC32 already stripped.
pub struct PsiSection {
    pub header: PsiHeader,
    pub data: Vec<u8>,
}

/// Strips the PSI pointer field and validates the section header + CRC32.
pub fn parse_psi_section(raw: &[u8]) -> Result<PsiSection> {
    let mut reader = SliceReader::new(raw);
    if reader.remaining_len() < 1 {
        warn!("short read of PSI pointer field");
        return Err(reader.make_error(ErrorDetails::BadPsiHeader));
    }
    let pointer_field = reader.read_u8()?;
    reader.skip(pointer_field as usize)?;

    if reader.remaining_len() < 3 {
        warn!("short read of PSI header");
        return Err(reader.make_error(ErrorDetails::BadPsiHeader));
    }
    let header_bytes = reader.read_array_ref::<3>()?;
    let header = PsiHeader::from_bytes(header_bytes);
    let section_length = header.section_length() as usize;
    if section_length < 4 {
        warn!("PSI section too short to hold a CRC32");
        return Err(reader.make_error(ErrorDetails::BadPsiHeader));
    }

    let mut section_reader = reader.new_sub_reader(section_length)?;
    let body = section_reader.read(section_length - 4)?;
    let crc_bytes = section_reader.read_array_ref::<4>()?;
    let expected = u32::from_be_bytes(crc_bytes);

    let mut digest = CRC.digest();
    digest.update(&header_bytes);
    digest.update(body);
    if digest.finalize() != expected {
        warn!("PSI section failed CRC32 check");
        return Err(reader.make_error(ErrorDetails::PsiCrcMismatch));
    }

    Ok(PsiSection {
        header,
        data: body.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_pat_section(entries: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x00, 0x00, 0xC1, 0x00, 0x00]);
        for &(program_num, pmt_pid) in entries {
            let mut entry = PatEntry::new();
            entry.set_program_num(program_num);
            entry.set_program_map_pid(pmt_pid);
            body.extend_from_slice(&entry.into_bytes());
        }

        let mut header = PsiHeader::new();
        header.set_table_id(0);
        header.set_section_syntax_indicator(true);
        header.set_section_length((body.len() + 4) as u16);
        let header_bytes = header.into_bytes();

        let mut digest = CRC.digest();
        digest.update(&header_bytes);
        digest.update(&body);
        let crc = digest.finalize();

        let mut section = vec![0u8]; // pointer field
        section.extend_from_slice(&header_bytes);
        section.extend_from_slice(&body);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    #[test]
    fn parses_pat_and_learns_pmt_pids() {
        let section = build_pat_section(&[(1, 0x200), (2, 0x300)]);
        let parsed = parse_psi_section(&section).unwrap();
        let mut tables = ProgramTables::default();
        tables.parse_pat(&parsed.data).unwrap();
        assert!(tables.is_pmt_pid(0x200));
        assert!(tables.is_pmt_pid(0x300));
        assert!(!tables.is_pmt_pid(0x400));
    }

    #[test]
    fn rejects_bad_crc() {
        let mut section = build_pat_section(&[(1, 0x200)]);
        let last = section.len() - 1;
        section[last] ^= 0xFF;
        assert!(parse_psi_section(&section).is_err());
    }

    #[test]
    fn parses_pmt_and_finds_teletext_pid() {
        let mut header = PmtHeader::new();
        header.set_pcr_pid(0x100);
        header.set_program_info_length(0);
        let mut body = vec![0x00, 0x00, 0xC1, 0x00, 0x00];
        body.extend_from_slice(&header.into_bytes());

        let mut es_header = ElementaryStreamInfoHeader::new();
        es_header.set_stream_type(0x06);
        es_header.set_elementary_pid(0x150);
        es_header.set_es_info_length(2);
        body.extend_from_slice(&es_header.into_bytes());
        body.extend_from_slice(&[0x56, 0x00]); // teletext descriptor, zero-length

        let mut psi_header = PsiHeader::new();
        psi_header.set_table_id(0x02);
        psi_header.set_section_length((body.len() + 4) as u16);
        let header_bytes = psi_header.into_bytes();

        let mut digest = CRC.digest();
        digest.update(&header_bytes);
        digest.update(&body);
        let crc = digest.finalize();

        let mut section = vec![0u8];
        section.extend_from_slice(&header_bytes);
        section.extend_from_slice(&body);
        section.extend_from_slice(&crc.to_be_bytes());

        let parsed = parse_psi_section(&section).unwrap();
        let mut tables = ProgramTables::default();
        let found = tables.parse_pmt(&parsed.data).unwrap();
        assert_eq!(found, Some(0x150));
    }
}
