use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use parcpk::compression::sllz::{self, SllzOptions, SllzVersion};
use parcpk::cpk::Cpk;
use parcpk::par::{NodeKind, ParArchive, ParReadOptions, ParWriteOptions};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// CPK archive operations
    Cpk {
        #[command(subcommand)]
        command: CpkCommands,
    },
    /// PARC archive operations
    Par {
        #[command(subcommand)]
        command: ParCommands,
    },
    /// Raw SLLZ streams
    Sllz {
        #[command(subcommand)]
        command: SllzCommands,
    },
}

#[derive(Subcommand)]
enum CpkCommands {
    /// List all files in the CPK archive
    List {
        /// Input CPK file
        input: PathBuf,
    },
    /// Extract a specific file or all files
    Extract {
        /// Input CPK file
        input: PathBuf,
        /// File to extract (or "all" for all files)
        target: String,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Replace a file in the CPK archive
    Replace {
        /// Input CPK file
        input: PathBuf,
        /// File to replace
        target: String,
        /// Replacement file
        replacement: PathBuf,
        /// Output CPK file (optional, defaults to modifying input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ParCommands {
    /// List the folder tree of a PAR archive
    List {
        /// Input PAR file
        input: PathBuf,
        /// Expand nested .par files
        #[arg(short, long)]
        recursive: bool,
    },
    /// Extract every file of a PAR archive
    Extract {
        /// Input PAR file
        input: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Expand nested .par files into directories
        #[arg(short, long)]
        recursive: bool,
    },
    /// Build a PAR archive from a directory
    Create {
        /// Input directory
        input: PathBuf,
        /// Output PAR file
        output: PathBuf,
        /// SLLZ version for file payloads (0 disables compression)
        #[arg(short, long, default_value_t = 1)]
        compression: u8,
        /// Name the root folder "."
        #[arg(long)]
        include_dots: bool,
        /// Write zero timestamps
        #[arg(long)]
        reset_dates: bool,
        /// Compression threads (0 uses every core)
        #[arg(short = 'j', long, default_value_t = 0)]
        threads: usize,
    },
}

#[derive(Subcommand)]
enum SllzCommands {
    /// Compress a file into an SLLZ stream
    Compress {
        input: PathBuf,
        output: PathBuf,
        /// Compression version (1 or 2)
        #[arg(long, default_value_t = 1)]
        version: u8,
        /// Write a big-endian header
        #[arg(long)]
        big_endian: bool,
    },
    /// Decompress an SLLZ stream
    Decompress { input: PathBuf, output: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Cpk { command } => run_cpk(command),
        Commands::Par { command } => run_par(command),
        Commands::Sllz { command } => run_sllz(command),
    }
}

fn run_cpk(command: CpkCommands) -> Result<()> {
    match command {
        CpkCommands::List { input } => {
            let cpk = Cpk::open(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;

            for (_, entry) in cpk.files() {
                println!("{}", entry.full_path());
            }
        }

        CpkCommands::Extract {
            input,
            target,
            output,
        } => {
            let cpk = Cpk::open(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;

            if target.to_lowercase() == "all" {
                info!("Extracting all files...");
                cpk.extract_all(&input, &output)?;
            } else {
                info!("Extracting: {}", target);
                cpk.extract_file(&input, &target, &output)?;
            }
        }

        CpkCommands::Replace {
            input,
            target,
            replacement,
            output,
        } => {
            let mut cpk = Cpk::open(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;

            let index = cpk
                .find_file(&target)
                .with_context(|| format!("{} is not in {}", target, input.display()))?;
            let name = cpk.file_table[index].full_path();
            let data = fs::read(&replacement)
                .with_context(|| format!("Failed to read {}", replacement.display()))?;

            let output_path = output.unwrap_or_else(|| input.clone());
            info!(
                "Replacing {} with {} in {}",
                name,
                replacement.display(),
                output_path.display()
            );

            let replacements = HashMap::from([(name, data)]);
            cpk.repack_file(&input, &output_path, &replacements)?;
        }
    }

    Ok(())
}

fn run_par(command: ParCommands) -> Result<()> {
    match command {
        ParCommands::List { input, recursive } => {
            let archive = ParArchive::open(&input, &ParReadOptions { recursive })
                .with_context(|| format!("Failed to read {}", input.display()))?;

            for (path, id) in archive.files() {
                match &archive.node(id).kind {
                    NodeKind::File(file) if file.is_compressed => println!(
                        "{} ({} -> {} bytes)",
                        path,
                        file.data.len(),
                        file.decompressed_size
                    ),
                    NodeKind::File(file) => println!("{} ({} bytes)", path, file.data.len()),
                    _ => println!("{}", path),
                }
            }
        }

        ParCommands::Extract {
            input,
            output,
            recursive,
        } => {
            let archive = ParArchive::open(&input, &ParReadOptions { recursive })
                .with_context(|| format!("Failed to read {}", input.display()))?;
            archive.extract_to(&output)?;
        }

        ParCommands::Create {
            input,
            output,
            compression,
            include_dots,
            reset_dates,
            threads,
        } => {
            let mut archive = ParArchive::from_directory(&input)
                .with_context(|| format!("Failed to scan {}", input.display()))?;
            archive.sort_children();

            let options = ParWriteOptions {
                compressor_version: compression,
                include_dots,
                reset_file_dates: reset_dates,
                threads,
            };
            info!("Writing {}", output.display());
            archive.save(&output, &options)?;
        }
    }

    Ok(())
}

fn run_sllz(command: SllzCommands) -> Result<()> {
    match command {
        SllzCommands::Compress {
            input,
            output,
            version,
            big_endian,
        } => {
            let data = fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let options = SllzOptions {
                version: SllzVersion::try_from(version)?,
                endianness: u8::from(big_endian),
            };
            let compressed = sllz::compress(&data, options)?;
            info!("{} -> {} bytes", data.len(), compressed.len());
            fs::write(&output, compressed)?;
        }

        SllzCommands::Decompress { input, output } => {
            let data = fs::read(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let decompressed = sllz::decompress(&data)?;
            info!("{} -> {} bytes", data.len(), decompressed.len());
            fs::write(&output, decompressed)?;
        }
    }

    Ok(())
}
