//! CLI option parsing (`clap` derive) and validation into a library-facing
//! [`Config`] that carries no `clap` dependency of its own.

use crate::error::{Error, ErrorDetails};
use clap::Parser;
use std::convert::TryFrom;
use std::path::PathBuf;

/// Decodes DVB teletext closed captions from an MPEG-TS/M2TS stream into
/// SubRip (SRT) subtitles.
#[derive(Parser, Debug)]
#[command(name = "teletext2srt", version, about)]
pub struct Cli {
    /// Input transport stream file.
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Output SRT file; omit or pass "-" for standard output.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Target teletext page (decimal 100..899); 0 selects the first
    /// subtitle page automatically.
    #[arg(short = 'p', long = "page", default_value_t = 0)]
    pub page: u16,

    /// Teletext elementary PID; 0 selects automatically via PAT/PMT,
    /// 0x2000 selects the first Private Stream 1.
    #[arg(short = 't', long = "pid", default_value_t = 0)]
    pub pid: u32,

    /// Subtitle time offset in seconds.
    #[arg(short = 'f', long = "offset", default_value_t = 0.0)]
    pub offset_secs: f64,

    /// Omit the UTF-8 byte order mark from the output.
    #[arg(short = 'n', long = "omit-bom")]
    pub omit_bom: bool,

    /// Emit one dummy frame if no captions were decoded.
    #[arg(short = '1', long = "dummy")]
    pub emit_dummy: bool,

    /// Colour mode: wrap coloured text in HTML font tags.
    #[arg(short = 'c', long = "colour")]
    pub colour: bool,

    /// Search-engine mode; takes an optional UTC reference string.
    #[arg(short = 's', long = "search-engine", num_args = 0..=1, default_missing_value = "")]
    pub search_engine: Option<String>,

    /// Input is 192-byte BDAV M2TS, not plain 188-byte TS.
    #[arg(short = 'm', long = "m2ts")]
    pub m2ts: bool,

    /// Verbose diagnostics.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Validated configuration consumed by the decoding core and the output
/// adapters. Has no dependency on `clap`, so tests can construct it
/// directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Input transport stream file.
    pub input: PathBuf,
    /// Output SRT file; `None` means standard output.
    pub output: Option<PathBuf>,
    /// Target teletext page, BCD-encoded; `None` selects automatically.
    pub page: Option<u16>,
    /// Teletext elementary PID; `None` selects automatically.
    pub pid: Option<u16>,
    /// Subtitle time offset in seconds.
    pub offset_secs: f64,
    /// Omit the UTF-8 byte order mark from the output.
    pub omit_bom: bool,
    /// Emit one dummy frame if no captions were decoded.
    pub emit_dummy: bool,
    /// Colour mode: wrap coloured text in HTML font tags.
    pub colour: bool,
    /// Search-engine mode; takes an optional UTC reference string.
    pub search_engine: Option<String>,
    /// Input is 192-byte BDAV M2TS, not plain 188-byte TS.
    pub m2ts: bool,
    /// Verbose diagnostics.
    pub verbose: bool,
}

fn encode_page(decimal: u16) -> Result<u16, Error> {
    if decimal == 0 {
        return Ok(0);
    }
    if !(100..=899).contains(&decimal) {
        return Err(Error::config(ErrorDetails::PageOutOfRange(decimal)));
    }
    let a = decimal / 100;
    let b = (decimal / 10) % 10;
    let c = decimal % 10;
    Ok((a << 8) | (b << 4) | c)
}

impl TryFrom<Cli> for Config {
    type Error = Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.input.as_os_str() == "-" {
            return Err(Error::config(ErrorDetails::StdinInputRejected));
        }
        if cli.pid > 0x1FFF {
            return Err(Error::config(ErrorDetails::PidOutOfRange(cli.pid)));
        }
        let page = encode_page(cli.page)?;

        Ok(Config {
            input: cli.input,
            output: cli.output,
            page: if page == 0 { None } else { Some(page) },
            pid: if cli.pid == 0 { None } else { Some(cli.pid as u16) },
            offset_secs: cli.offset_secs,
            omit_bom: cli.omit_bom,
            emit_dummy: cli.emit_dummy,
            colour: cli.colour,
            search_engine: cli.search_engine,
            m2ts: cli.m2ts,
            verbose: cli.verbose,
        })
    }
}
