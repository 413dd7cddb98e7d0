//! Profiles command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use widefix_core::{ProfileSet, SiteAction, SiteLocator};

/// Run the profiles command
pub fn run(path: &Path, json: bool) -> Result<()> {
    let set = ProfileSet::load_from_path(path)
        .with_context(|| format!("Failed to load profiles from {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&set)?);
        return Ok(());
    }

    if set.is_empty() {
        println!("No profiles in {}", path.display());
        return Ok(());
    }

    for profile in &set.profiles {
        println!("{} ({})", profile.name, profile.executable);
        if profile.module_name() != profile.executable {
            println!("  module: {}", profile.module_name());
        }
        for fix in &profile.fixes {
            let state = if fix.enabled { "" } else { " [disabled]" };
            println!("  {}{}", fix.name, state);
            for site in &fix.sites {
                println!(
                    "    {:<20} {:<32} {}",
                    site.name,
                    describe_locator(&site.locate),
                    describe_action(&site.action)
                );
            }
        }
        println!();
    }

    Ok(())
}

fn describe_locator(locate: &SiteLocator) -> String {
    match locate {
        SiteLocator::Signature {
            pattern, offset, ..
        } if *offset != 0 => format!("{} {:+}", pattern, offset),
        SiteLocator::Signature { pattern, .. } => pattern.to_string(),
        SiteLocator::FileOffset { file_offset } => format!("file 0x{:X}", file_offset),
    }
}

fn describe_action(action: &SiteAction) -> String {
    match action {
        SiteAction::AspectRatio => "aspect ratio (f32)".to_string(),
        SiteAction::HorizontalFov { original, unit, .. } => {
            format!("horizontal fov {} {} (f32)", original, unit)
        }
        SiteAction::Resolution { axis } => format!("{} (u32)", axis),
        SiteAction::FovMultiplier { .. } => "fov multiplier (f32)".to_string(),
        SiteAction::Nop { len } => format!("nop x{}", len),
        SiteAction::Bytes { bytes } => format!("{} literal bytes", bytes.len()),
        SiteAction::Hook { flavor, effect, .. } => format!("hook ({}): {:?}", flavor, effect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use widefix_core::ByteSignature;

    #[test]
    fn test_describe_locator() {
        let pattern = ByteSignature::parse("D9 05 ??").unwrap();
        let locate = SiteLocator::Signature {
            pattern,
            offset: 2,
            occurrence: Default::default(),
        };
        assert_eq!(describe_locator(&locate), "D9 05 ?? +2");
        assert_eq!(
            describe_locator(&SiteLocator::FileOffset { file_offset: 0x100 }),
            "file 0x100"
        );
    }
}
