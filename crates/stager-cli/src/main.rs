use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use stager_core::format::validate;
use stager_core::local::{LocalCatalog, LocalFilesystem, LocalMediaProvider};
use stager_core::{
    ArchiveCopy, CopyPlacement, FileId, FsId, HeaderFormat, LibraryId, MediaType, RequestStore,
    Section, ShutdownMode, StageDescriptor, Stager, StagerConfig, Vsn,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stager",
    version,
    about = "Staging engine operator tool",
    long_about = "Inspect archive headers and request tables, or restore one file from local media."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the archive header at the start of a file.
    Header {
        /// File holding the header followed by data.
        input: PathBuf,

        /// Byte offset of the header inside the file.
        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long, value_enum, default_value_t = FormatArg::Classic)]
        format: FormatArg,

        /// Expected file size; omit to check the magic only.
        #[arg(long)]
        size: Option<u64>,
    },
    /// List the requests recorded in a request table.
    Table {
        /// Work directory holding `stager_reqs`.
        work_dir: PathBuf,
    },
    /// Stage one file from a local media tree into a cache directory.
    Restore {
        /// Directory with `tape/`, `disk/` and `silo/` volume trees.
        #[arg(long)]
        media_root: PathBuf,

        /// Cache directory receiving the staged file.
        #[arg(long)]
        cache: PathBuf,

        #[arg(long)]
        vsn: String,

        #[arg(long, value_enum, default_value_t = MediaArg::Tape)]
        media: MediaArg,

        /// Archive position of the file on the volume.
        #[arg(long)]
        position: u64,

        /// Records between the position and the file's header.
        #[arg(long, default_value_t = 0)]
        record_offset: u64,

        /// File size in bytes (supports suffixes K/M/G).
        #[arg(long, value_parser = parse_size)]
        len: usize,

        #[arg(long, default_value_t = 1)]
        ino: u32,

        #[arg(long, default_value_t = 1)]
        fseq: u32,

        /// Tape block size (supports suffixes K/M/G).
        #[arg(long, default_value = "512", value_parser = parse_size)]
        block_size: usize,

        /// Optional TOML configuration.
        #[arg(long, env = "STAGER_CONFIG")]
        config: Option<PathBuf>,

        /// Seconds to wait for the response.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Classic,
    Extended,
}

impl From<FormatArg> for HeaderFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Classic => HeaderFormat::Classic,
            FormatArg::Extended => HeaderFormat::Extended,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MediaArg {
    Tape,
    Optical,
    Disk,
    Silo,
}

impl From<MediaArg> for MediaType {
    fn from(value: MediaArg) -> Self {
        match value {
            MediaArg::Tape => MediaType::Tape,
            MediaArg::Optical => MediaType::Optical,
            MediaArg::Disk => MediaType::Disk,
            MediaArg::Silo => MediaType::Silo,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Header {
            input,
            offset,
            format,
            size,
        } => header_command(&input, offset, format.into(), size)?,
        Commands::Table { work_dir } => table_command(&work_dir)?,
        Commands::Restore {
            media_root,
            cache,
            vsn,
            media,
            position,
            record_offset,
            len,
            ino,
            fseq,
            block_size,
            config,
            timeout,
        } => restore_command(RestoreArgs {
            media_root,
            cache,
            vsn: Vsn::new(vsn)?,
            media: media.into(),
            position,
            record_offset,
            len: len as u64,
            id: FileId::new(ino, 1),
            fseq: FsId(fseq),
            block_size,
            config,
            timeout: Duration::from_secs(timeout.max(1)),
        })?,
    }

    Ok(())
}

fn header_command(
    input: &Path,
    offset: u64,
    format: HeaderFormat,
    size: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = fs::read(input)?;
    let start = usize::try_from(offset)?.min(raw.len());
    let header_len = validate(&raw[start..], format, size.unwrap_or(0), size.is_some())?;
    let data = raw.len() - start - header_len;
    println!("{}", input.display());
    println!("  format: {format:?}");
    println!("  header: {} bytes", header_len);
    println!("  data:   {}", format_bytes(data as u64));
    match size {
        Some(size) => println!("  size:   {size} (verified)"),
        None => println!("  size:   not verified"),
    }
    Ok(())
}

fn table_command(work_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let path = work_dir.join("stager_reqs");
    let config = StagerConfig::default();
    let store = RequestStore::open(&path, config.max_active, config.max_retries)?;
    let ids = store.ids();
    println!("{}: {} of {} slots in use", path.display(), ids.len(), store.capacity());
    for index in ids {
        let Some(request) = store.get(index) else {
            continue;
        };
        let error = request
            .error
            .map_or_else(|| "-".to_string(), |errno| errno.to_string());
        println!(
            "  [{index:4}] {} fs {} copy {} {}:{} pos {} len {} written {} flags {:?} error {}",
            request.id,
            request.fseq.0,
            request.copy + 1,
            request.media(),
            request.vsn(),
            request.section().position,
            format_bytes(request.len),
            format_bytes(request.write_off),
            request.flags,
            error,
        );
    }
    Ok(())
}

struct RestoreArgs {
    media_root: PathBuf,
    cache: PathBuf,
    vsn: Vsn,
    media: MediaType,
    position: u64,
    record_offset: u64,
    len: u64,
    id: FileId,
    fseq: FsId,
    block_size: usize,
    config: Option<PathBuf>,
    timeout: Duration,
}

fn restore_command(args: RestoreArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => StagerConfig::load(path)?,
        None => StagerConfig::default(),
    };

    let library = LibraryId(1);
    let catalog = Arc::new(LocalCatalog::new());
    catalog.add_library(library, 1);
    catalog.add_volume(args.vsn.clone(), args.media, library);

    let fs = Arc::new(LocalFilesystem::new(&args.cache)?);
    let provider = LocalMediaProvider::under(&args.media_root, config.media)
        .with_tape_block_size(args.block_size.max(1));

    let section = Section::new(args.vsn.clone(), args.position, args.record_offset, args.len);
    let mut descriptor = StageDescriptor {
        id: args.id,
        fseq: args.fseq,
        len: args.len,
        ..StageDescriptor::default()
    };
    descriptor.copies[0] = Some(CopyPlacement::single(ArchiveCopy::new(args.media, section)));

    let started_at = Instant::now();
    let stager = Stager::start(config, fs.clone(), catalog, Arc::new(provider), None)?;
    tracing::info!(id = %args.id, vsn = %args.vsn, media = %args.media, position = args.position, "restore submitted");
    fs.submit(descriptor);
    let response = fs.wait_for_response(args.id, args.timeout);
    stager.shutdown(ShutdownMode::FailQueued)?;
    let elapsed = started_at.elapsed();

    let Some(response) = response else {
        return Err(format!("no response within {}", format_duration(args.timeout)).into());
    };
    response.result?;

    let path = fs.cache_path(args.id, args.fseq);
    let staged = fs::metadata(&path)?.len();
    let rate = if elapsed.as_secs_f64() > 0.0 {
        staged as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    println!("staged {} from {}:{} position {}", args.id, args.media, args.vsn, args.position);
    println!("  output:  {}", path.display());
    println!("  size:    {}", format_bytes(staged));
    println!("  elapsed: {}", format_duration(elapsed));
    println!("  rate:    {}/s", format_rate(rate));
    Ok(())
}

fn parse_size(value: &str) -> Result<usize, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("size cannot be empty".to_string());
    }

    let split_at = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (num_part, suffix_part) = trimmed.split_at(split_at);
    if num_part.is_empty() {
        return Err(format!("invalid size: {value}"));
    }

    let base: usize = num_part
        .parse()
        .map_err(|_| format!("invalid size number: {value}"))?;

    let multiplier = match suffix_part.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1usize,
        "k" | "kb" => 1024usize,
        "m" | "mb" => 1024usize * 1024usize,
        "g" | "gb" => 1024usize * 1024usize * 1024usize,
        other => {
            return Err(format!("invalid size suffix '{other}' in '{value}'"));
        }
    };

    base.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflow: {value}"))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn format_rate(bytes_per_second: f64) -> String {
    if !bytes_per_second.is_finite() || bytes_per_second <= 0.0 {
        return "0 B".to_string();
    }
    format_bytes(bytes_per_second as u64)
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let millis = duration.subsec_millis();
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;

    if minutes > 0 {
        format!("{minutes:02}:{seconds:02}")
    } else {
        format!("{seconds}.{millis:03}s")
    }
}
