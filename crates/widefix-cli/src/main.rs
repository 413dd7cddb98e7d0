use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "widefix")]
#[command(version, about = "Widescreen and FOV fixes for legacy games")]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a profile's fixes to an executable on disk
    Patch {
        /// Executable to patch
        #[arg(short, long)]
        file: PathBuf,

        /// TOML file with [[profile]] entries
        #[arg(short, long, env = "WIDEFIX_PROFILES")]
        profile: PathBuf,

        /// Profile to apply (default: matched by executable name)
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long, env = "WIDEFIX_WIDTH")]
        width: Option<u32>,

        #[arg(long, env = "WIDEFIX_HEIGHT")]
        height: Option<u32>,

        #[arg(long, env = "WIDEFIX_FOV_FACTOR")]
        fov_factor: Option<f32>,

        /// TOML file with a [fix] table (default: the profile file)
        #[arg(short, long, env = "WIDEFIX_CONFIG")]
        config: Option<PathBuf>,

        /// Keep a copy of the original as <file>.bak
        #[arg(long)]
        backup: bool,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Search a file for a byte signature
    Scan {
        #[arg(short, long)]
        file: PathBuf,

        /// Hex bytes with ?? wildcards, e.g. "D9 05 ?? ?? ?? ?? D8 C9"
        #[arg(short, long)]
        pattern: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List profiles, their fixes and sites
    Profiles {
        #[arg(short, long, env = "WIDEFIX_PROFILES")]
        profile: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("widefix=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Patch {
            file,
            profile,
            name,
            width,
            height,
            fov_factor,
            config,
            backup,
            dry_run,
        } => commands::patch::run(commands::patch::PatchArgs {
            file,
            profiles: profile,
            name,
            overrides: widefix_core::ConfigOverrides {
                width,
                height,
                fov_factor,
            },
            config,
            backup,
            dry_run,
            json: cli.json,
        }),
        Command::Scan {
            file,
            pattern,
            limit,
        } => commands::scan::run(&file, &pattern, limit, cli.json),
        Command::Profiles { profile } => commands::profiles::run(&profile, cli.json),
    }
}
