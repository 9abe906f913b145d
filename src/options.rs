use std::{net::IpAddr, path::PathBuf, time::Duration};

use byte_unit::Byte;
use clap::{ArgAction, Parser};
use log::LevelFilter;

use crate::archive::{ArchiveConfig, Bundler, Locator, DEFAULT_CHUNK_SIZE, DEFAULT_SOURCE_DIR};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Options {
    /// Increase logs verbosity (Error (default), Warn, Info, Debug, Trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub log_level: u8,
    /// Delay between two archive chunks, in seconds.
    #[arg(short = 'd', long, default_value = "1")]
    pub delay: u64,
    /// Directory containing the directories to archive. Falls back to the one next to the executable if missing.
    #[arg(short = 's', long, aliases = ["photo-path", "photo_path"], default_value = DEFAULT_SOURCE_DIR)]
    pub source_dir: PathBuf,
    /// Maximum size of an archive chunk.
    #[arg(short = 'c', long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser(parse_chunk_size))]
    pub chunk_size: usize,
    /// Archiving program, invoked as `<bundler> -r -q - <directory>`.
    #[arg(short = 'b', long, default_value = "zip")]
    pub bundler: PathBuf,
    /// HTML page served on the root path.
    #[arg(short = 'i', long, default_value = "index.html")]
    pub index: PathBuf,
    /// HTTP listening address.
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    pub address: IpAddr,
    /// HTTP listening port.
    #[arg(short = 'p', long, default_value = "8080")]
    pub port: u16,
}

impl Options {
    pub fn log_level(&self) -> LevelFilter {
        use LevelFilter::*;
        match self.log_level {
            0 => Error,
            1 => Warn,
            2 => Info,
            3 => Debug,
            _ => Trace,
        }
    }

    pub fn archive_config(&self) -> ArchiveConfig {
        ArchiveConfig {
            locator: Locator::new(&self.source_dir),
            bundler: Bundler::new(&self.bundler),
            chunk_size: self.chunk_size,
            delay: Duration::from_secs(self.delay),
        }
    }
}

fn parse_chunk_size(s: &str) -> Result<usize, String> {
    let size = s.parse::<Byte>().map_err(|err| err.to_string())?.get_bytes();
    match usize::try_from(size) {
        Ok(0) => Err("chunk size must be positive".to_owned()),
        Ok(size) => Ok(size),
        Err(_) => Err("chunk size is too large".to_owned()),
    }
}
