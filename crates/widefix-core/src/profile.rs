//! Game profiles: which bytes to find and what to write there.
//!
//! ```toml
//! [[profile]]
//! name = "Example"
//! executable = "game.exe"
//!
//! [[profile.fix]]
//! name = "aspect"
//!
//! [[profile.fix.site]]
//! name = "aspect_ratio"
//! locate = { pattern = "D9 05 ?? ?? ?? ?? D8 C9", offset = 2 }
//! action = { kind = "aspect_ratio" }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hook::{HookFlavor, JMP_REL32_LEN, Register};
use crate::scanner::Occurrence;
use crate::signature::ByteSignature;
use crate::transform::{AngleUnit, BASE_ASPECT_RATIO};

fn default_true() -> bool {
    true
}

fn default_base_aspect() -> f32 {
    BASE_ASPECT_RATIO
}

/// Every profile known to one installation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSet {
    #[serde(default, rename = "profile")]
    pub profiles: Vec<GameProfile>,
}

/// One supported game build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameProfile {
    pub name: String,
    /// Executable file name the profile applies to, compared case-insensitively.
    pub executable: String,
    /// Module to scan; defaults to the executable itself.
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default, rename = "fix")]
    pub fixes: Vec<FixDef>,
}

/// Sites that are applied together or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixDef {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "site")]
    pub sites: Vec<SiteDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteDef {
    pub name: String,
    pub locate: SiteLocator,
    pub action: SiteAction,
}

/// Where a site is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, deny_unknown_fields)]
pub enum SiteLocator {
    /// Signature match, adjusted by `offset` bytes to reach the field.
    Signature {
        pattern: ByteSignature,
        #[serde(default)]
        offset: i64,
        #[serde(default)]
        occurrence: Occurrence,
    },
    /// Fixed offset into an executable file on disk.
    FileOffset { file_offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Axis {
    Width,
    Height,
}

/// What to write at a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SiteAction {
    /// `f32` aspect ratio of the configured resolution.
    AspectRatio,
    /// `f32` horizontal FOV rescaled from `original` at `base_aspect`.
    HorizontalFov {
        original: f32,
        #[serde(default)]
        unit: AngleUnit,
        #[serde(default = "default_base_aspect")]
        base_aspect: f32,
    },
    /// `u32` width or height.
    Resolution { axis: Axis },
    /// `f32` ratio of the configured aspect to `base_aspect`.
    FovMultiplier {
        #[serde(default = "default_base_aspect")]
        base_aspect: f32,
    },
    /// `len` single-byte NOPs.
    Nop { len: usize },
    /// Literal bytes.
    Bytes { bytes: Vec<u8> },
    /// Inline hook; `nop_first` NOPs the leading bytes before the hook is built.
    Hook {
        #[serde(default)]
        flavor: HookFlavor,
        #[serde(default)]
        nop_first: Option<usize>,
        effect: HookEffect,
    },
}

/// What a hook callback does to the interrupted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEffect {
    /// Push the aspect ratio onto the x87 stack.
    PushAspectRatio,
    /// Treat `st(0)` as a horizontal FOV authored for `base_aspect` and
    /// rescale it in place.
    ReplaceFpuTopWithHfov {
        #[serde(default)]
        unit: AngleUnit,
        #[serde(default = "default_base_aspect")]
        base_aspect: f32,
    },
    /// Load the aspect ratio into the low lane of `xmm{index}`.
    SetXmmAspectRatio { index: usize },
    /// Rescale the horizontal FOV held in the low lane of `xmm{index}`.
    ScaleXmmFov {
        index: usize,
        #[serde(default)]
        unit: AngleUnit,
        #[serde(default = "default_base_aspect")]
        base_aspect: f32,
    },
    /// Put the aspect ratio's `f32` bits into a general register.
    SetRegisterAspectRatio { register: Register },
}

impl SiteAction {
    /// Bytes written at the site.
    pub fn write_len(&self) -> usize {
        match self {
            SiteAction::AspectRatio
            | SiteAction::HorizontalFov { .. }
            | SiteAction::Resolution { .. }
            | SiteAction::FovMultiplier { .. } => 4,
            SiteAction::Nop { len } => *len,
            SiteAction::Bytes { bytes } => bytes.len(),
            SiteAction::Hook { nop_first, .. } => nop_first.unwrap_or(0).max(JMP_REL32_LEN),
        }
    }

    pub fn is_hook(&self) -> bool {
        matches!(self, SiteAction::Hook { .. })
    }
}

impl GameProfile {
    pub fn module_name(&self) -> &str {
        self.module.as_deref().unwrap_or(&self.executable)
    }

    /// Whether `executable` (a bare file name or a full path) is this game.
    pub fn matches_executable(&self, executable: &str) -> bool {
        // Windows paths are accepted on every host.
        let file_name = executable.rsplit(['/', '\\']).next().unwrap_or(executable);
        file_name.eq_ignore_ascii_case(&self.executable)
    }

    pub fn has_hooks(&self) -> bool {
        self.fixes
            .iter()
            .flat_map(|f| &f.sites)
            .any(|s| s.action.is_hook())
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Error::InvalidConfig(format!("profile '{}': {}", self.name, msg));

        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("profile without a name".to_string()));
        }
        if self.executable.trim().is_empty() {
            return Err(invalid("executable is empty".to_string()));
        }

        let mut fix_names = HashSet::new();
        for fix in &self.fixes {
            if !fix_names.insert(fix.name.as_str()) {
                return Err(invalid(format!("duplicate fix '{}'", fix.name)));
            }
            if fix.sites.is_empty() {
                return Err(invalid(format!("fix '{}' has no sites", fix.name)));
            }
            for site in &fix.sites {
                site.validate()
                    .map_err(|msg| invalid(format!("site '{}.{}': {}", fix.name, site.name, msg)))?;
            }
        }
        Ok(())
    }
}

impl SiteDef {
    fn validate(&self) -> std::result::Result<(), String> {
        let positive = |v: f32| v.is_finite() && v > 0.0;
        match &self.action {
            SiteAction::Nop { len: 0 } => Err("nop length must be positive".to_string()),
            SiteAction::Bytes { bytes } if bytes.is_empty() => Err("no bytes to write".to_string()),
            SiteAction::HorizontalFov {
                original,
                base_aspect,
                ..
            } if !positive(*original) || !positive(*base_aspect) => {
                Err("fov and base aspect must be positive".to_string())
            }
            SiteAction::FovMultiplier { base_aspect } if !positive(*base_aspect) => {
                Err("base aspect must be positive".to_string())
            }
            SiteAction::Hook { effect, .. } => match effect {
                HookEffect::ReplaceFpuTopWithHfov { base_aspect, .. }
                | HookEffect::ScaleXmmFov { base_aspect, .. }
                    if !positive(*base_aspect) =>
                {
                    Err("base aspect must be positive".to_string())
                }
                HookEffect::SetXmmAspectRatio { index } | HookEffect::ScaleXmmFov { index, .. }
                    if *index >= 16 =>
                {
                    Err(format!("xmm{} does not exist", index))
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

impl ProfileSet {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let set: ProfileSet = toml::from_str(content)?;
        set.validate()?;
        Ok(set)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let set = Self::from_toml_str(&content)?;
        debug!(
            "Loaded {} profiles from {}",
            set.profiles.len(),
            path.display()
        );
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !names.insert(profile.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate profile '{}'",
                    profile.name
                )));
            }
        }
        Ok(())
    }

    /// First profile whose executable matches `executable`.
    pub fn select(&self, executable: &str) -> Option<&GameProfile> {
        self.profiles
            .iter()
            .find(|p| p.matches_executable(executable))
    }

    pub fn get(&self, name: &str) -> Result<&GameProfile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::ProfileNotFound(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[profile]]
        name = "Example"
        executable = "Game.exe"

        [[profile.fix]]
        name = "aspect"

        [[profile.fix.site]]
        name = "aspect_ratio"
        locate = { pattern = "D9 05 ?? ?? ?? ?? D8 C9", offset = 2 }
        action = { kind = "aspect_ratio" }

        [[profile.fix.site]]
        name = "width"
        locate = { file_offset = 0x100 }
        action = { kind = "resolution", axis = "width" }

        [[profile.fix]]
        name = "fov"
        enabled = false

        [[profile.fix.site]]
        name = "hfov"
        locate = { pattern = "D9 05 ?? ?? ?? ??", occurrence = "last" }
        action = { kind = "hook", flavor = "replace", effect = { type = "push_aspect_ratio" } }

        [[profile.fix.site]]
        name = "clip"
        locate = { pattern = "C7 45 ?? 00 00 B4 42", occurrence = { nth = 1 }, offset = 3 }
        action = { kind = "horizontal_fov", original = 90.0 }
    "#;

    #[test]
    fn test_parse_sample() {
        let set = ProfileSet::from_toml_str(SAMPLE).unwrap();
        let profile = set.get("Example").unwrap();
        assert_eq!(profile.module_name(), "Game.exe");
        assert_eq!(profile.fixes.len(), 2);

        let aspect = &profile.fixes[0];
        assert!(aspect.enabled);
        assert_eq!(
            aspect.sites[0].locate,
            SiteLocator::Signature {
                pattern: ByteSignature::parse("D9 05 ?? ?? ?? ?? D8 C9").unwrap(),
                offset: 2,
                occurrence: Occurrence::First,
            }
        );
        assert_eq!(
            aspect.sites[1].locate,
            SiteLocator::FileOffset { file_offset: 0x100 }
        );
        assert_eq!(
            aspect.sites[1].action,
            SiteAction::Resolution { axis: Axis::Width }
        );

        let fov = &profile.fixes[1];
        assert!(!fov.enabled);
        assert!(profile.has_hooks());
        assert_eq!(
            fov.sites[0].action,
            SiteAction::Hook {
                flavor: HookFlavor::Replace,
                nop_first: None,
                effect: HookEffect::PushAspectRatio,
            }
        );
        match &fov.sites[1] {
            SiteDef {
                locate: SiteLocator::Signature { occurrence, offset, .. },
                action: SiteAction::HorizontalFov { original, unit, base_aspect },
                ..
            } => {
                assert_eq!(*occurrence, Occurrence::Nth(1));
                assert_eq!(*offset, 3);
                assert_eq!(*original, 90.0);
                assert_eq!(*unit, AngleUnit::Degrees);
                assert_eq!(*base_aspect, BASE_ASPECT_RATIO);
            }
            other => panic!("unexpected site: {other:?}"),
        }
    }

    #[test]
    fn test_select_is_case_insensitive() {
        let set = ProfileSet::from_toml_str(SAMPLE).unwrap();
        assert!(set.select("game.EXE").is_some());
        assert!(set.select(r"C:\Games\Example\GAME.exe").is_some());
        assert!(set.select("other.exe").is_none());
        assert!(matches!(set.get("Missing"), Err(Error::ProfileNotFound(_))));
    }

    #[test]
    fn test_write_lengths() {
        assert_eq!(SiteAction::AspectRatio.write_len(), 4);
        assert_eq!(SiteAction::Nop { len: 6 }.write_len(), 6);
        let hook = SiteAction::Hook {
            flavor: HookFlavor::Resume,
            nop_first: Some(7),
            effect: HookEffect::PushAspectRatio,
        };
        assert_eq!(hook.write_len(), 7);
    }

    #[test]
    fn test_rejects_empty_fix() {
        let err = ProfileSet::from_toml_str(
            r#"
            [[profile]]
            name = "Broken"
            executable = "game.exe"

            [[profile.fix]]
            name = "nothing"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("no sites")));
    }

    #[test]
    fn test_rejects_zero_length_nop() {
        let err = ProfileSet::from_toml_str(
            r#"
            [[profile]]
            name = "Broken"
            executable = "game.exe"

            [[profile.fix]]
            name = "nops"

            [[profile.fix.site]]
            name = "store"
            locate = { file_offset = 16 }
            action = { kind = "nop", len = 0 }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("nops.store")));
    }

    #[test]
    fn test_rejects_ambiguous_or_misspelled_locators() {
        let site = |locate: &str| {
            format!(
                r#"
                [[profile]]
                name = "Broken"
                executable = "game.exe"

                [[profile.fix]]
                name = "aspect"

                [[profile.fix.site]]
                name = "ar"
                locate = {}
                action = {{ kind = "aspect_ratio" }}
                "#,
                locate
            )
        };

        assert!(ProfileSet::from_toml_str(&site(r#"{ pattern = "D9 05", offset = 2 }"#)).is_ok());
        for locate in [
            r#"{ pattern = "D9 05", file_offset = 4 }"#,
            r#"{ pattern = "D9 05", offest = 2 }"#,
            r#"{ file_offset = 4, occurrence = "first" }"#,
        ] {
            assert!(
                matches!(ProfileSet::from_toml_str(&site(locate)), Err(Error::Toml(_))),
                "{} should not parse",
                locate
            );
        }
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let err = ProfileSet::from_toml_str(
            r#"
            [[profile]]
            name = "Broken"
            executable = "game.exe"

            [[profile.fix]]
            name = "aspect"

            [[profile.fix.site]]
            name = "ar"
            locate = { pattern = "D9 GG" }
            action = { kind = "aspect_ratio" }
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_duplicate_profiles() {
        let toml = format!("{SAMPLE}\n{}", SAMPLE.replace("executable = \"Game.exe\"", "executable = \"other.exe\""));
        let err = ProfileSet::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("duplicate profile")));
    }
}
