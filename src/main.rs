//! Command-line interface.
//!
//! Three subcommands cover the day-to-day uses of the crate:
//!
//! ```bash
//! # inspect an unfamiliar file's attribute layout
//! das-readers headers /data/2023_02_01/das_20230201_120000.h5
//!
//! # pull a window into a new block file
//! das-readers read --root /data --start 2023-02-01T12:00:10 \
//!     --end 2023-02-01T12:00:50 --out window.h5
//!
//! # downsample a whole archive
//! das-readers downsample --config batch.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};

use das_readers::logging::LogFormat;
use das_readers::{
    list_attributes, locate, read_window, write_block, BatchOrchestrator, BatchSettings,
    ChannelSelector,
};

#[derive(Parser)]
#[command(name = "das-readers")]
#[command(about = "Windowed reading and decimation of DAS HDF5 archives", long_about = None)]
struct Cli {
    /// Log filter (overridden by RUST_LOG).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format: pretty, compact or json.
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump every attribute of every group in a file
    Headers {
        /// Path to a .h5 block file
        file: PathBuf,
    },

    /// Read a time window from an archive
    Read {
        /// Archive root directory
        #[arg(long)]
        root: PathBuf,

        /// Window start, e.g. 2023-02-01T12:00:10.5 (UTC)
        #[arg(long)]
        start: String,

        /// Window end (UTC)
        #[arg(long)]
        end: String,

        /// Lower fiber distance bound, meters
        #[arg(long)]
        distance_start: Option<f64>,

        /// Upper fiber distance bound, meters
        #[arg(long)]
        distance_stop: Option<f64>,

        /// Keep every n-th channel within the distance range
        #[arg(long, default_value_t = 1)]
        nth_channel: usize,

        /// Write the window to this file instead of just summarizing it
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Downsample a whole archive according to a settings file
    Downsample {
        /// Path to a batch settings TOML file
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Headers { file } => {
            init_logging(&cli.log_level, cli.log_format, None)?;
            for record in list_attributes(&file)? {
                println!("{}\t{}\t{}", record.group, record.name, record.value);
            }
            Ok(())
        }
        Commands::Read {
            root,
            start,
            end,
            distance_start,
            distance_stop,
            nth_channel,
            out,
        } => {
            init_logging(&cli.log_level, cli.log_format, None)?;
            run_read(root, &start, &end, distance_start, distance_stop, nth_channel, out)
        }
        Commands::Downsample { config } => {
            let settings = BatchSettings::from_file(&config)
                .with_context(|| format!("loading settings from {}", config.display()))?;
            init_logging(&cli.log_level, cli.log_format, settings.log_level.clone())?;
            let summary = BatchOrchestrator::new(settings).run()?;
            println!(
                "planned {}, processed {}, skipped {}, failed {}",
                summary.planned, summary.processed, summary.skipped, summary.failed
            );
            if summary.failed > 0 {
                anyhow::bail!("{} batch item(s) failed; see the log", summary.failed);
            }
            Ok(())
        }
    }
}

fn init_logging(
    flag: &Option<String>,
    format: LogFormat,
    from_settings: Option<String>,
) -> Result<()> {
    let level = flag
        .clone()
        .or(from_settings)
        .unwrap_or_else(|| "info".to_owned());
    das_readers::logging::init(&level, format).map_err(|e| anyhow::anyhow!(e))
}

fn run_read(
    root: PathBuf,
    start: &str,
    end: &str,
    distance_start: Option<f64>,
    distance_stop: Option<f64>,
    nth_channel: usize,
    out: Option<PathBuf>,
) -> Result<()> {
    let t_start = parse_cli_time(start)?;
    let t_end = parse_cli_time(end)?;

    let selector = match (distance_start, distance_stop) {
        (Some(d0), Some(d1)) => ChannelSelector::DistanceRange {
            start: d0,
            stop: d1,
            nth_channel,
        },
        (None, None) => ChannelSelector::All,
        _ => anyhow::bail!("--distance-start and --distance-stop must be given together"),
    };

    let candidates = locate(t_start, t_end, &root)?;
    let block = read_window(t_start, t_end, &candidates, &selector)?;
    println!(
        "{} samples x {} channels, {} .. {}",
        block.header.sample_count,
        block.header.channel_count,
        block.header.start_time,
        block.header.end_time
    );

    if let Some(out_path) = out {
        write_block(&out_path, &block.data, &block.header)?;
        println!("written to {}", out_path.display());
    }
    Ok(())
}

/// Accept `YYYY-MM-DDTHH:MM:SS[.f]`, with a space separator also tolerated.
fn parse_cli_time(text: &str) -> Result<DateTime<Utc>> {
    let normalized = text.replace(' ', "T");
    for layout in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, layout) {
            return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    anyhow::bail!("could not parse time '{text}' (expected YYYY-MM-DDTHH:MM:SS[.f], UTC)")
}
