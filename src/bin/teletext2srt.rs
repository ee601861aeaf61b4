//! Command-line front end: parses arguments, runs the decoder over an
//! input file, and writes the rendered subtitles to a file or stdout.

use clap::Parser;
use log::{warn, LevelFilter};
use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, Write};
use std::process::ExitCode;
use teletext_srt::{render_search_engine, render_srt, Cli, Config, Decoder};

fn run() -> teletext_srt::Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    let config = Config::try_from(cli)?;

    env_logger::Builder::new()
        .filter_level(if verbose { LevelFilter::Debug } else { LevelFilter::Warn })
        .init();

    let file = File::open(&config.input).map_err(teletext_srt::Error::from)?;
    let mut decoder = Decoder::new(&config);
    let frames = decoder.decode(file, || false)?;

    if frames.is_empty() && !config.emit_dummy {
        warn!("No frames produced.");
    }

    let rendered = if config.search_engine.is_some() {
        render_search_engine(&frames)
    } else {
        render_srt(&frames, config.omit_bom, config.emit_dummy)
    };

    match &config.output {
        Some(path) => {
            let mut out = File::create(path).map_err(teletext_srt::Error::from)?;
            out.write_all(rendered.as_bytes()).map_err(teletext_srt::Error::from)?;
        }
        None => {
            io::stdout().write_all(rendered.as_bytes()).map_err(teletext_srt::Error::from)?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("teletext2srt: {}", e);
            ExitCode::FAILURE
        }
    }
}
