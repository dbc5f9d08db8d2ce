//! Command line client for the pmemctl acquisition driver.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::info;
use pmemctl_bin::{init_logging_with_progress, parse_u64};
use pmemctl_client::Pmem;
use pmemctl_core::lifecycle::LifecycleConfig;
use pmemctl_core::protocol::AccessMode;
use pmemctl_core::pte::Pte;
use pmemctl_core::PhysAddr;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Byte,
    Word,
    Dword,
    Qword,
    Buffer,
}

impl From<ModeArg> for AccessMode {
    fn from(mode: ModeArg) -> AccessMode {
        match mode {
            ModeArg::Byte => AccessMode::Byte,
            ModeArg::Word => AccessMode::Word,
            ModeArg::Dword => AccessMode::Dword,
            ModeArg::Qword => AccessMode::Qword,
            ModeArg::Buffer => AccessMode::Buffer,
        }
    }
}

/// Command line client for the pmemctl acquisition driver.
///
/// Loads and unloads the driver and reads physical memory through it, for
/// use in scripts and on the command line.
#[derive(Parser, Debug)]
#[command(author, version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Character device major number for insmod/rmmod
    #[arg(long, global = true)]
    major: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the driver and create its device node
    Insmod {
        /// Path to the driver object file
        kmod_path: PathBuf,
    },
    /// Remove the device node and unload the driver
    Rmmod,
    /// Read physical memory; buffer reads go to stdout, scalars are printed as hex
    Read {
        /// Physical address (decimal or 0x-hex)
        #[arg(value_parser = parse_u64)]
        address: u64,

        /// Access mode
        #[arg(value_enum, short, long, default_value = "buffer")]
        mode: ModeArg,

        /// Size of buffer reads
        #[arg(short, long, value_parser = parse_u64)]
        size: Option<u64>,
    },
    /// Print driver metadata as JSON
    Query,
    /// Dump a physical range to a file, with a metadata sidecar
    Dump {
        /// First physical address (decimal or 0x-hex)
        #[arg(value_parser = parse_u64)]
        address: u64,

        /// Number of bytes to dump
        #[arg(value_parser = parse_u64)]
        size: u64,

        /// Output file
        output: PathBuf,
    },
    /// Show the template PTE, or set it from flag names (p rw us pwt pcd a d pat g nx)
    Pte {
        /// Flags to assemble into the new template; empty shows the current one
        flags: Vec<String>,
    },
}

fn buffer_read_size(size: Option<u64>) -> anyhow::Result<u64> {
    // the clap default for --mode is buffer, so --size cannot be made
    // mandatory declaratively; check it here
    size.ok_or_else(|| anyhow::anyhow!("--size is required for buffer reads"))
}

fn lifecycle_config(major: Option<u32>) -> LifecycleConfig {
    let mut config = LifecycleConfig::default();
    if let Some(major) = major {
        config.major = major;
    }
    config
}

fn dump(
    pmem: &mut Pmem,
    progress: &MultiProgress,
    address: u64,
    size: u64,
    output: &PathBuf,
) -> anyhow::Result<()> {
    if address.checked_add(size).is_none() {
        anyhow::bail!("dump range wraps past the end of the address space");
    }
    let info = pmem.query().context("cannot query driver limits")?;
    let chunk = info.max_window.max(1);

    let file = File::create(output)
        .with_context(|| format!("cannot create {}", output.display()))?;
    let mut writer = BufWriter::new(file);

    let bar = progress.add(ProgressBar::new(size));
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )?
        .progress_chars("=> "),
    );
    bar.set_message("dumping");

    let mut offset = 0u64;
    while offset < size {
        let len = chunk.min(size - offset);
        let bytes = pmem.read(PhysAddr::new(address + offset), len)?;
        writer.write_all(&bytes)?;
        offset += len;
        bar.set_position(offset);
    }
    writer.flush()?;
    bar.finish_with_message("done");

    let meta = serde_json::json!({
        "date": chrono::Local::now().to_rfc3339(),
        "address": format!("{:#x}", address),
        "length": size,
        "output": output,
    });
    let meta_path = output.with_extension("meta.json");
    std::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)
        .with_context(|| format!("cannot write {}", meta_path.display()))?;
    info!("dumped {} bytes to {}", size, output.display());
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let progress = init_logging_with_progress()?;
    let mut pmem = Pmem::with_config(lifecycle_config(cli.major));

    match cli.command {
        Command::Insmod { kmod_path } => {
            pmem.load(&kmod_path)
                .with_context(|| format!("failed to load {}", kmod_path.display()))?;
            info!("driver loaded, device at {}", pmem.lifecycle().device_path().display());
        }
        Command::Rmmod => {
            pmem.lifecycle().adopt_running();
            pmem.unload().context("failed to unload the driver")?;
        }
        Command::Read { address, mode, size } => match AccessMode::from(mode) {
            AccessMode::Buffer => {
                let size = buffer_read_size(size)?;
                let bytes = pmem.read(PhysAddr::new(address), size)?;
                io::stdout().write_all(&bytes)?;
            }
            mode => {
                let value = pmem.read_scalar(PhysAddr::new(address), mode)?;
                println!("0x{:016x}", value);
            }
        },
        Command::Query => {
            let info = pmem.query().context("cannot query the driver")?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Dump { address, size, output } => {
            dump(&mut pmem, &progress, address, size, &output)?;
        }
        Command::Pte { flags } => {
            if flags.is_empty() {
                println!("{}", pmem.pte_template()?);
            } else {
                let pte = Pte::from_flags(flags.iter().map(String::as_str))?;
                pmem.set_pte_template(pte)?;
                println!("{}", pte);
            }
        }
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}
