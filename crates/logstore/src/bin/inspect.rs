//! Read-only inspection of a logstore device.
//!
//! ```text
//! logstore-inspect --path blocks.db header
//! logstore-inspect --path blocks.db --format json metablocks
//! logstore-inspect --path blocks.db replay --blocks
//! ```
//!
//! Nothing is ever written to the device.  The device is still locked while
//! it is inspected, so a running store cannot change it underneath.

use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use logstore::format::{StaticHeader, STATIC_HEADER_SIZE};
use logstore::metablock::{read_slots, slot_status, Metablock, MetablockSlot};
use logstore::recovery::Recovery;
use logstore::{CorruptStore, Error, StaticConfig};
use logstore_storage::{block::BlockLocation, posix::FileDevice, BlockDevice};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "logstore-inspect",
    about = "Inspect the on-disk state of a logstore device.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// The device to inspect.
    #[arg(long, env = "LOGSTORE_PATH", global = true, help_heading = "Global Options")]
    path: Option<PathBuf>,

    /// The format in which to print reports.
    #[arg(long, global = true, help_heading = "Global Options", default_value = "text")]
    format: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[value(rename_all = "snake_case")]
enum OutputFormat {
    /// Human-readable text.
    Text,
    /// One JSON document per report.
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Print the static header: block and extent size.
    Header,
    /// Print the status and contents of both metablock slots.
    Metablocks,
    /// Run recovery without modifying the device and summarize the result.
    Replay {
        /// Also list every live block.
        #[arg(long)]
        blocks: bool,
    },
}

#[derive(Serialize)]
struct HeaderReport {
    block_size: u64,
    extent_size: u64,
    blocks_per_extent: u64,
    lba_entries_per_extent: u64,
    device_size: u64,
}

#[derive(Serialize)]
struct ShardReport {
    shard: usize,
    last_lba_extent_offset: Option<u64>,
    last_lba_extent_entries_count: u64,
    lba_superblock_offset: Option<u64>,
    lba_superblock_entries_count: u64,
}

#[derive(Serialize)]
struct ActiveExtentReport {
    offset: u64,
    blocks: u64,
}

#[derive(Serialize)]
struct MetablockReport {
    sequence_id: u64,
    extents_in_use: u64,
    shards: Vec<ShardReport>,
    active_extents: Vec<ActiveExtentReport>,
}

#[derive(Serialize)]
struct SlotReport {
    slot: String,
    offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metablock: Option<MetablockReport>,
}

#[derive(Serialize)]
struct BlockReport {
    block_id: u32,
    offset: u64,
    recency: u32,
}

#[derive(Serialize)]
struct ReplayReport {
    slot: String,
    sequence_id: u64,
    live_blocks: usize,
    extents_in_use: Vec<u64>,
    sealed_lba_extents: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocks: Option<Vec<BlockReport>>,
}

fn non_null(offset: u64) -> Option<u64> {
    (offset != logstore::format::NULL_OFFSET).then_some(offset)
}

impl From<&Metablock> for MetablockReport {
    fn from(metablock: &Metablock) -> Self {
        Self {
            sequence_id: metablock.block_sequence_id,
            extents_in_use: metablock.extent_manager_part.debug_extents_in_use,
            shards: metablock
                .lba_index_part
                .shards
                .iter()
                .enumerate()
                .map(|(shard, part)| ShardReport {
                    shard,
                    last_lba_extent_offset: non_null(part.last_lba_extent_offset),
                    last_lba_extent_entries_count: part.last_lba_extent_entries_count,
                    lba_superblock_offset: non_null(part.lba_superblock_offset),
                    lba_superblock_entries_count: part.lba_superblock_entries_count,
                })
                .collect(),
            active_extents: metablock
                .data_block_manager_part
                .active()
                .map(|(offset, blocks)| ActiveExtentReport { offset, blocks })
                .collect(),
        }
    }
}

impl Display for MetablockReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  sequence id:    {}", self.sequence_id)?;
        writeln!(f, "  extents in use: {}", self.extents_in_use)?;
        for shard in &self.shards {
            write!(f, "  shard {:2}: ", shard.shard)?;
            match shard.last_lba_extent_offset {
                Some(offset) => write!(
                    f,
                    "last extent {offset} ({} entries)",
                    shard.last_lba_extent_entries_count
                )?,
                None => write!(f, "no extent")?,
            }
            if let Some(offset) = shard.lba_superblock_offset {
                write!(
                    f,
                    ", superblock {offset} ({} sealed)",
                    shard.lba_superblock_entries_count
                )?;
            }
            writeln!(f)?;
        }
        for extent in &self.active_extents {
            writeln!(
                f,
                "  active data extent {} ({} blocks)",
                extent.offset, extent.blocks
            )?;
        }
        Ok(())
    }
}

fn print<T: Serialize>(format: OutputFormat, report: &T, text: impl Display) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{text}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn read_header(device: &FileDevice) -> Result<StaticConfig> {
    let block = device
        .read_exact_at(BlockLocation::new(0, STATIC_HEADER_SIZE))
        .context("reading static header")?;
    Ok(StaticHeader::decode(&block).context("decoding static header")?)
}

fn header(device: &FileDevice, format: OutputFormat) -> Result<()> {
    let config = read_header(device)?;
    let report = HeaderReport {
        block_size: config.block_size,
        extent_size: config.extent_size,
        blocks_per_extent: config.blocks_per_extent(),
        lba_entries_per_extent: config.lba_entries_per_extent(),
        device_size: device.size()?,
    };
    let text = format!(
        "block size:             {}\n\
         extent size:            {}\n\
         blocks per extent:      {}\n\
         LBA entries per extent: {}\n\
         device size:            {}\n",
        report.block_size,
        report.extent_size,
        report.blocks_per_extent,
        report.lba_entries_per_extent,
        report.device_size
    );
    print(format, &report, text)
}

fn metablocks(device: &FileDevice, format: OutputFormat) -> Result<()> {
    let slots = read_slots(device).context("reading metablock slots")?;
    let mut reports = Vec::new();
    let mut text = String::new();
    for (slot, block) in [MetablockSlot::A, MetablockSlot::B].into_iter().zip(&slots) {
        let status = slot_status(block, slot);
        debug!("slot {slot:?}: {status}");
        text += &format!("slot {slot:?} at {}: {status}\n", slot.offset());
        let (metablock, error) = match Metablock::decode_slot(block, slot.offset()) {
            Ok(metablock) => {
                let report = MetablockReport::from(&metablock);
                text += &report.to_string();
                (Some(report), None)
            }
            Err(error) => (None, Some(error.to_string())),
        };
        reports.push(SlotReport {
            slot: format!("{slot:?}"),
            offset: slot.offset(),
            error,
            metablock,
        });
    }
    print(format, &reports, text)
}

fn replay(device: &FileDevice, format: OutputFormat, list_blocks: bool) -> Result<()> {
    let config = read_header(device)?;
    let recovered = match Recovery::new(device, config).run() {
        Ok(recovered) => recovered,
        Err(Error::CorruptStore(error)) => {
            eprintln!("{}: {error}", device.path().display());
            if let CorruptStore::NoValidMetablock { slot_a, slot_b } = &error {
                eprintln!("  slot A: {slot_a}");
                eprintln!("  slot B: {slot_b}");
            }
            anyhow::bail!("store is corrupt");
        }
        Err(error) => return Err(error).context("running recovery"),
    };

    let mut blocks: Vec<_> = recovered
        .index
        .iter()
        .map(|(block_id, info)| BlockReport {
            block_id,
            offset: info.offset,
            recency: info.recency.0,
        })
        .collect();
    blocks.sort_unstable_by_key(|block| block.block_id);

    let report = ReplayReport {
        slot: format!("{:?}", recovered.slot),
        sequence_id: recovered.metablock.block_sequence_id,
        live_blocks: recovered.index.len(),
        extents_in_use: recovered.extents_in_use.iter().copied().collect(),
        sealed_lba_extents: recovered.shards.iter().map(|shard| shard.sealed.len()).collect(),
        blocks: list_blocks.then_some(blocks),
    };

    let mut text = format!(
        "recovered metablock {} from slot {}\n\
         live blocks:    {}\n\
         extents in use: {}\n\
         sealed LBA extents per shard: {:?}\n",
        report.sequence_id,
        report.slot,
        report.live_blocks,
        report.extents_in_use.len(),
        report.sealed_lba_extents
    );
    for block in report.blocks.iter().flatten() {
        text += &format!(
            "  block {:10} at {:12} recency {}\n",
            block.block_id, block.offset, block.recency
        );
    }
    print(format, &report, text)
}

fn run(cli: Cli) -> Result<()> {
    let path = cli
        .path
        .context("no device given: pass --path or set LOGSTORE_PATH")?;
    let device = FileDevice::open(&path, false)
        .with_context(|| format!("opening {}", path.display()))?;
    match cli.command {
        Command::Header => header(&device, cli.format),
        Command::Metablocks => metablocks(&device, cli.format),
        Command::Replay { blocks } => replay(&device, cli.format, blocks),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}
