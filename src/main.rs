//! # elfinst CLI
//!
//! Command-line driver for the static instrumentation tools.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use elfinst::{available_tools, build_tool, ElfImage, Instrumenter, RewriteConfig, RuntimeTable, SiteInventory};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "elfinst")]
#[command(version = "0.1.0")]
#[command(about = "Statically instrument ELF binaries", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available instrumentation tools
    List,

    /// Dump the program and section headers of an ELF file
    Sections {
        /// ELF file to inspect
        file: PathBuf,
    },

    /// Instrument an ELF file with one tool
    Run {
        /// Tool name (see `list`)
        tool: String,

        /// ELF file to instrument
        input: PathBuf,

        /// Site inventory (TOML or JSON)
        #[arg(short, long)]
        inventory: PathBuf,

        /// Tool argument file
        #[arg(short, long)]
        arg: Option<PathBuf>,

        /// Rewrite configuration (TOML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file (default: <input>.<tool extension>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the descriptor table of an instrumented file
    Points {
        /// Instrumented ELF file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    match cli.command {
        Commands::List => list_tools(),
        Commands::Sections { file } => show_sections(&file),
        Commands::Run {
            tool,
            input,
            inventory,
            arg,
            config,
            output,
        } => run_tool(&tool, &input, &inventory, arg.as_deref(), config.as_deref(), output),
        Commands::Points { file } => show_points(&file),
    }
}

fn list_tools() -> Result<()> {
    println!("{}", "Instrumentation tools".bold());
    for tool in available_tools() {
        println!(
            "  {:<20} .{:<10} args: {:<9} {}",
            tool.name.green(),
            tool.extension,
            tool.args.to_string(),
            tool.description
        );
    }
    Ok(())
}

fn show_sections(file: &Path) -> Result<()> {
    let image = ElfImage::from_path(file).with_context(|| format!("failed to load {}", file.display()))?;

    println!(
        "{} {} {:?}, entry 0x{:x}",
        file.display().to_string().bold(),
        image.width(),
        image.endian(),
        image.entry()
    );

    println!("\n{}", "Program headers:".cyan());
    for (i, ph) in image.program_headers().iter().enumerate() {
        println!("  [{:2}] {}", i, ph);
    }

    println!("\n{}", "Sections:".cyan());
    for section in image.sections() {
        println!("  [{:2}] {:<20} {}", section.index(), section.name(), section.header());
    }
    Ok(())
}

fn run_tool(
    name: &str,
    input: &Path,
    inventory: &Path,
    argument: Option<&Path>,
    config: Option<&Path>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = match config {
        Some(path) => RewriteConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => RewriteConfig::default(),
    };
    let inventory =
        SiteInventory::load(inventory).with_context(|| format!("failed to load {}", inventory.display()))?;
    let mut tool = build_tool(name, inventory, argument).context("failed to build tool")?;
    let info = tool.info();

    let image = ElfImage::from_path(input).with_context(|| format!("failed to load {}", input.display()))?;
    let output = output.unwrap_or_else(|| {
        let mut path = input.as_os_str().to_owned();
        path.push(".");
        path.push(info.extension);
        PathBuf::from(path)
    });

    let mut engine = Instrumenter::new(image, config).context("cannot instrument this image")?;
    engine.declare(tool.as_mut()).context("declare phase failed")?;
    engine.instrument(tool.as_mut()).context("instrument phase failed")?;
    engine
        .write(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    tool.write_side_files(&output)
        .with_context(|| format!("failed to describe {}", output.display()))?;

    info!("{} finished", info.name);
    println!(
        "{} {} -> {} ({} points, {} sites)",
        "[+]".green(),
        input.display(),
        output.display(),
        engine.points().len(),
        engine.site_ids().len()
    );
    Ok(())
}

fn show_points(file: &Path) -> Result<()> {
    let image = ElfImage::from_path(file).with_context(|| format!("failed to load {}", file.display()))?;
    let table = RuntimeTable::from_image(&image).context("no descriptor table")?;

    println!(
        "{} points over {} sites, table at 0x{:x}, original entry 0x{:x}",
        table.header.point_count, table.header.site_count, table.header.self_vaddr, table.header.original_entry
    );
    for point in &table.points {
        let id = table.site_ids.get(point.site() as usize).copied().unwrap_or_default();
        println!(
            "  0x{:08x} {:>2} bytes  site {:<4} id {:<#14x} {}",
            point.vaddr(),
            point.len(),
            point.site(),
            id,
            point.state()
        );
    }
    Ok(())
}
