use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;

use crate::lines::SplitMode;
use crate::pipeline::{DEFAULT_QUEUE_CAPACITY, PipelineConfig};
use crate::telemetry::logging::{LogConfig, LogLevel};

pub const DEFAULT_READ_CHUNK_BYTES: usize = 512 * 1024;

#[derive(Debug, Parser)]
#[command(
    name = "beach-pager",
    author,
    version,
    about = "Stream piped stdin into a live Neovim buffer"
)]
pub struct Cli {
    /// Address of a running Neovim (socket path, named pipe, or host:port).
    /// A private instance is spawned when unset.
    #[arg(long, env = "NVIM_LISTEN_ADDRESS")]
    pub listen: Option<String>,

    /// Editor binary used when spawning a private instance.
    #[arg(long, env = "BEACH_PAGER_NVIM", default_value = "nvim")]
    pub nvim: PathBuf,

    /// Batches buffered between the reader and the writer.
    #[arg(long, env = "BEACH_PAGER_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Bytes requested from stdin per read.
    #[arg(long, env = "BEACH_PAGER_READ_CHUNK_BYTES", default_value_t = DEFAULT_READ_CHUNK_BYTES)]
    pub read_chunk_bytes: usize,

    /// How lines that straddle read boundaries are handled.
    #[arg(long, env = "BEACH_PAGER_SPLIT_MODE", value_enum, default_value_t = SplitMode::Carry)]
    pub split_mode: SplitMode,

    /// Connection attempts against a freshly spawned editor.
    #[arg(long, env = "BEACH_PAGER_CONNECT_ATTEMPTS", default_value_t = 100)]
    pub connect_attempts: u32,

    /// Delay between connection attempts.
    #[arg(long, env = "BEACH_PAGER_CONNECT_INTERVAL_MS", default_value_t = 20)]
    pub connect_interval_ms: u64,

    #[arg(long, env = "BEACH_PAGER_LOG_LEVEL", value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "BEACH_PAGER_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub listen: Option<String>,
    pub nvim: PathBuf,
    pub pipeline: PipelineConfig,
    pub read_chunk_bytes: usize,
    pub split_mode: SplitMode,
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    pub log: LogConfig,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            nvim: PathBuf::from("nvim"),
            pipeline: PipelineConfig::default(),
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            split_mode: SplitMode::default(),
            connect_attempts: 100,
            connect_interval: Duration::from_millis(20),
            log: LogConfig::default(),
        }
    }
}

impl TryFrom<Cli> for PagerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.queue_capacity == 0 {
            bail!("queue capacity must be at least 1");
        }
        if cli.read_chunk_bytes == 0 {
            bail!("read chunk size must be at least 1 byte");
        }
        if cli.connect_attempts == 0 {
            bail!("connect attempts must be at least 1");
        }
        let listen = cli
            .listen
            .map(|addr| addr.trim().to_owned())
            .filter(|addr| !addr.is_empty());
        Ok(PagerConfig {
            listen,
            nvim: cli.nvim,
            pipeline: PipelineConfig {
                queue_capacity: cli.queue_capacity,
            },
            read_chunk_bytes: cli.read_chunk_bytes,
            split_mode: cli.split_mode,
            connect_attempts: cli.connect_attempts,
            connect_interval: Duration::from_millis(cli.connect_interval_ms),
            log: LogConfig {
                level: cli.log_level,
                file: cli.log_file,
            },
        })
    }
}
