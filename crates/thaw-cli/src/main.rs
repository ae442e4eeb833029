//! thaw archive inspection tool
//!
//! Looks inside bundles produced for the `thaw-boot` bootloader: the table
//! of contents, payload integrity, module blobs, and extraction to a chosen
//! directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "thaw")]
#[command(about = "Inspect thaw bundle archives", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the entries of an archive
    List {
        /// Bundle executable or standalone archive
        archive: PathBuf,
        /// Only show entries of this kind (e.g. data-file, native-binary)
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Check every payload against its recorded length and checksum
    Verify {
        /// Bundle executable or standalone archive
        archive: PathBuf,
    },

    /// Extract native binaries and data files to a directory
    Extract {
        /// Bundle executable or standalone archive
        archive: PathBuf,
        /// Entries to extract (default: all extractable entries)
        names: Vec<String>,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// List the modules of the archive's module blobs
    Modules {
        /// Bundle executable or standalone archive
        archive: PathBuf,
        /// Show one module, or the direct submodules of a package
        name: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    thaw_cli::logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::List { archive, kind } => commands::list::execute(&archive, kind.as_deref()),
        Commands::Verify { archive } => commands::verify::execute(&archive),
        Commands::Extract {
            archive,
            names,
            out_dir,
        } => commands::extract::execute(&archive, &names, &out_dir),
        Commands::Modules { archive, name } => {
            commands::modules::execute(&archive, name.as_deref())
        }
    }
}
