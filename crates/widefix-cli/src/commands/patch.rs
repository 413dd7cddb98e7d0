//! Patch command implementation.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;
use widefix_core::fix::{FileOptions, FixState, patch_file};
use widefix_core::{ConfigOverrides, FixConfig, FixReport, ProfileSet, system_display};

pub struct PatchArgs {
    pub file: PathBuf,
    pub profiles: PathBuf,
    pub name: Option<String>,
    pub overrides: ConfigOverrides,
    pub config: Option<PathBuf>,
    pub backup: bool,
    pub dry_run: bool,
    pub json: bool,
}

/// Run the patch command
pub fn run(args: PatchArgs) -> Result<()> {
    let profiles = ProfileSet::load_from_path(&args.profiles)
        .with_context(|| format!("Failed to load profiles from {}", args.profiles.display()))?;

    let profile = match &args.name {
        Some(name) => profiles.get(name)?,
        None => {
            let exe = args
                .file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            profiles
                .select(&exe)
                .ok_or_else(|| anyhow!("No profile for '{}', pick one with --name", exe))?
        }
    };

    info!("Using profile '{}' for {}", profile.name, args.file.display());

    // The [fix] table may share a file with the profiles.
    let config_path = args.config.as_ref().unwrap_or(&args.profiles);
    let mut config = FixConfig::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.apply_overrides(&args.overrides);
    let settings = config.resolve(system_display().as_ref());

    let report = patch_file(
        &args.file,
        profile,
        settings,
        FileOptions {
            backup: args.backup,
            dry_run: args.dry_run,
        },
    )
    .with_context(|| format!("Failed to patch {}", args.file.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, args.dry_run);
    }

    if report.failed() > 0 {
        bail!(
            "{} of {} fixes failed",
            report.failed(),
            report.outcomes.len()
        );
    }
    Ok(())
}

fn print_report(report: &FixReport, dry_run: bool) {
    println!("Profile: {}", report.profile);
    if dry_run {
        println!("(dry run, nothing written)");
    }
    println!();

    for outcome in &report.outcomes {
        println!("[{}] {}", outcome.state, outcome.fix);
        match outcome.state {
            FixState::Applied => {
                for patch in &outcome.patches {
                    println!(
                        "    0x{:08X}: {} -> {}",
                        patch.address,
                        hex(&patch.original),
                        hex(&patch.replacement)
                    );
                }
            }
            FixState::Failed => {
                if let Some(error) = &outcome.error {
                    println!("    {}", error);
                }
            }
            FixState::Skipped => {}
        }
    }

    println!();
    println!(
        "{} applied, {} failed, {} skipped",
        report.applied(),
        report.failed(),
        report.count(FixState::Skipped)
    );
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
