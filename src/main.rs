//! singlefile - Pack an application into its host executable and unpack it again.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use singlefile::config::ExtractionConfig;
use singlefile::{remove_signature, BundleOptions, Bundler, Extractor, SignatureRemoval};

/// Single-file application bundler.
#[derive(Parser, Debug)]
#[command(name = "singlefile")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bundle a publish directory into its host executable
    Bundle {
        /// Directory holding the host executable and everything it needs
        publish_dir: PathBuf,

        /// File name of the host executable inside the publish directory
        #[arg(long)]
        host: String,

        /// Directory the bundle is written to
        #[arg(short, long)]
        output: PathBuf,

        /// Embed symbol files instead of copying them beside the bundle
        #[arg(long)]
        embed_symbols: bool,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "2")]
        verbosity: u8,
    },

    /// Extract the files embedded in a bundle
    Extract {
        /// Path to the bundle
        bundle: PathBuf,

        /// Extraction base directory.
        /// Defaults to $SINGLEFILE_EXTRACT_BASE_DIR, then <temp>/.singlefile.
        #[arg(short, long)]
        base_dir: Option<PathBuf>,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },

    /// Show the manifest of a bundle
    Info {
        /// Path to the bundle
        bundle: PathBuf,
    },

    /// Remove the code signature from a Mach-O executable
    Unsign {
        /// Path to the executable
        path: PathBuf,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Bundle {
            publish_dir,
            host,
            output,
            embed_symbols,
            verbosity,
        } => {
            setup_logging(verbosity);
            cmd_bundle(publish_dir, host, output, embed_symbols)
        }
        Commands::Extract {
            bundle,
            base_dir,
            verbosity,
        } => {
            setup_logging(verbosity);
            cmd_extract(bundle, base_dir)
        }
        Commands::Info { bundle } => cmd_info(bundle),
        Commands::Unsign { path, verbosity } => {
            setup_logging(verbosity);
            cmd_unsign(path)
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn cmd_bundle(
    publish_dir: PathBuf,
    host: String,
    output: PathBuf,
    embed_symbols: bool,
) -> Result<()> {
    let start = Instant::now();

    if !publish_dir.is_dir() {
        bail!("Publish directory does not exist: {}", publish_dir.display());
    }

    let bundler = Bundler::new(&host, &output).with_options(BundleOptions { embed_symbols });
    let generated = bundler
        .generate_from_dir(&publish_dir)
        .with_context(|| format!("Failed to bundle {}", publish_dir.display()))?;

    info!(
        "Wrote {} in {:.2}s",
        generated.path.display(),
        start.elapsed().as_secs_f64()
    );
    for symbols in &generated.symbol_files {
        info!("Symbols: {}", symbols.display());
    }

    Ok(())
}

fn cmd_extract(bundle: PathBuf, base_dir: Option<PathBuf>) -> Result<()> {
    let base_dir = base_dir.unwrap_or_else(|| ExtractionConfig::from_env().base_dir);

    let extraction = Extractor::new(&bundle, &base_dir)
        .extract()
        .with_context(|| format!("Failed to extract {}", bundle.display()))?;

    println!("{}", extraction.directory.display());
    Ok(())
}

fn cmd_info(bundle: PathBuf) -> Result<()> {
    let extractor = Extractor::new(&bundle, ExtractionConfig::from_env().base_dir);
    let manifest = extractor
        .read_manifest()
        .with_context(|| format!("Failed to read bundle: {}", bundle.display()))?;

    println!("Bundle Information");
    println!("==================");
    println!("Path:       {}", bundle.display());
    println!("Bundle ID:  {}", manifest.bundle_id);
    println!("Version:    {}", manifest.version);
    println!("Files:      {}", manifest.entries.len());
    println!("Payload:    {}", format_size(manifest.payload_size()));

    println!("\nFiles:");
    for entry in &manifest.entries {
        println!(
            "  {:#012x} {:>8} {:<18} {}",
            entry.offset,
            format_size(entry.size as u64),
            entry.kind.to_string(),
            entry.name
        );
    }

    Ok(())
}

fn cmd_unsign(path: PathBuf) -> Result<()> {
    let outcome = remove_signature(&path)
        .with_context(|| format!("Failed to remove signature: {}", path.display()))?;

    match outcome {
        SignatureRemoval::Removed { blob_size } => {
            println!("Removed {} byte signature from {}", blob_size, path.display())
        }
        SignatureRemoval::Unsigned => println!("{} is not signed", path.display()),
        SignatureRemoval::NotMachO => bail!("Not a 64-bit Mach-O file: {}", path.display()),
    }

    Ok(())
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
