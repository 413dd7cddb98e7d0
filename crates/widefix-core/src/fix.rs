//! Applying a game profile.
//!
//! Each [`FixDef`] is a unit: every site is located and every write is
//! bounds-checked before the first byte changes. A fix that fails is logged
//! and reported; the remaining fixes still run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use strum::Display;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hook::{
    self, CpuContext, ExecutableMemory, HookCallback, HookHandle, HookRegistry, HookRequest,
    PreparedHook, stub,
};
use crate::memory::{BufferMemory, CodeMemory, PatchPlan, PatchSite, Patcher};
use crate::profile::{Axis, FixDef, GameProfile, HookEffect, SiteAction, SiteDef, SiteLocator};
use crate::scanner::BatchScan;
use crate::signature::ByteSignature;
use crate::transform::{AngleUnit, apply_fov_factor, fov_multiplier, rescale_hfov_in};

/// Where the profile is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Target {
    /// An executable image on disk. File offsets are valid, hooks are not.
    File,
    /// A module mapped into the running game.
    Process,
}

/// Hook installer handed to [`FixRunner::run`] for in-process targets.
pub struct HookTarget<'a> {
    pub registry: &'a mut HookRegistry,
    pub exec: &'a mut dyn ExecutableMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum FixState {
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixOutcome {
    pub fix: String,
    pub state: FixState,
    pub patches: Vec<PatchSite>,
    pub hooks: Vec<HookHandle>,
    pub error: Option<String>,
}

/// Result of applying one profile.
#[derive(Debug, Clone, Serialize)]
pub struct FixReport {
    pub profile: String,
    pub outcomes: Vec<FixOutcome>,
}

impl FixReport {
    pub fn count(&self, state: FixState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn applied(&self) -> usize {
        self.count(FixState::Applied)
    }

    pub fn failed(&self) -> usize {
        self.count(FixState::Failed)
    }

    pub fn outcome(&self, fix: &str) -> Option<&FixOutcome> {
        self.outcomes.iter().find(|o| o.fix == fix)
    }
}

/// A site whose address and bytes are known.
struct ResolvedSite<'p> {
    def: &'p SiteDef,
    address: usize,
}

/// Applies profiles with one settings snapshot.
pub struct FixRunner {
    settings: Settings,
    target: Target,
}

impl FixRunner {
    pub fn new(settings: Settings, target: Target) -> Self {
        Self { settings, target }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Apply every enabled fix of `profile`. Never fails as a whole.
    pub fn run<M>(
        &self,
        profile: &GameProfile,
        memory: &mut M,
        mut hooks: Option<HookTarget<'_>>,
    ) -> FixReport
    where
        M: CodeMemory + ?Sized,
    {
        info!(
            "Applying profile '{}' ({} fixes) to {}",
            profile.name,
            profile.fixes.len(),
            memory.region()
        );

        let outcomes = profile
            .fixes
            .iter()
            .map(|fix| {
                if !self.settings.enabled || !fix.enabled {
                    info!("Fix '{}' is disabled, skipping", fix.name);
                    return FixOutcome {
                        fix: fix.name.clone(),
                        state: FixState::Skipped,
                        patches: Vec::new(),
                        hooks: Vec::new(),
                        error: None,
                    };
                }

                match self.apply_fix(fix, memory, hooks.as_mut()) {
                    Ok((patches, handles)) => {
                        info!(
                            "Fix '{}' applied ({} writes, {} hooks)",
                            fix.name,
                            patches.len(),
                            handles.len()
                        );
                        FixOutcome {
                            fix: fix.name.clone(),
                            state: FixState::Applied,
                            patches,
                            hooks: handles,
                            error: None,
                        }
                    }
                    Err(e) => {
                        error!("Fix '{}' failed: {}", fix.name, e);
                        FixOutcome {
                            fix: fix.name.clone(),
                            state: FixState::Failed,
                            patches: Vec::new(),
                            hooks: Vec::new(),
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .collect();

        FixReport {
            profile: profile.name.clone(),
            outcomes,
        }
    }

    fn apply_fix<M>(
        &self,
        fix: &FixDef,
        memory: &mut M,
        mut hooks: Option<&mut HookTarget<'_>>,
    ) -> Result<(Vec<PatchSite>, Vec<HookHandle>)>
    where
        M: CodeMemory + ?Sized,
    {
        let sites = self.resolve_sites(fix, &*memory)?;

        // Every write, hook jumps included, must fit before anything is built.
        {
            let patcher = Patcher::new(&mut *memory);
            for site in &sites {
                patcher.check_bounds(site.address, site.def.action.write_len())?;
            }
        }

        let mut plan = PatchPlan::new();
        let mut prepared: Vec<(usize, PreparedHook)> = Vec::new();

        for site in &sites {
            let label = format!("{}.{}", fix.name, site.def.name);
            match &site.def.action {
                SiteAction::Nop { len } => plan.push_nops(label, site.address, *len),
                SiteAction::Bytes { bytes } => plan.push(label, site.address, bytes.clone()),
                SiteAction::Hook {
                    flavor,
                    nop_first,
                    effect,
                } => {
                    let target = hooks.as_deref_mut().ok_or_else(|| {
                        Error::InvalidConfig(format!("site '{}' needs a running game", label))
                    })?;

                    let mut code = hook::read_site(&*memory, site.address)?;
                    if let Some(count) = (*nop_first).filter(|&n| n > 0) {
                        let bitness = target.registry.convention().arch().bitness();
                        if !stub::ends_on_boundary(&code, site.address as u64, bitness, count) {
                            return Err(Error::InvalidConfig(format!(
                                "site '{}': nop_first = {} ends inside an instruction",
                                label, count
                            )));
                        }
                        plan.push_nops(format!("{}.nop", label), site.address, count);
                    }
                    // The stub replays the displaced code as it will be after
                    // the writes planned before it.
                    plan.overlay(site.address, &mut code);

                    let request = HookRequest {
                        name: label.clone(),
                        address: site.address,
                        flavor: *flavor,
                        callback: hook_callback(effect, &self.settings),
                    };
                    let ready = target
                        .registry
                        .prepare_from(&code, &mut *target.exec, request)?;
                    plan.push_layered(label, site.address, ready.site_bytes().to_vec());
                    prepared.push((plan.len() - 1, ready));
                }
                value => {
                    let bytes = value_bytes(value, &self.settings).ok_or_else(|| {
                        Error::InvalidConfig(format!("site '{}' has no value to write", label))
                    })?;
                    plan.push(label, site.address, bytes);
                }
            }
        }

        let patches = plan.apply(&mut Patcher::new(&mut *memory))?;

        let mut handles = Vec::with_capacity(prepared.len());
        if let Some(target) = hooks {
            for (index, ready) in prepared {
                handles.push(target.registry.activate(ready, patches[index].clone()));
            }
        }
        Ok((patches, handles))
    }

    /// Locate every site of `fix`; fails unless all of them are found.
    fn resolve_sites<'p, M>(&self, fix: &'p FixDef, memory: &M) -> Result<Vec<ResolvedSite<'p>>>
    where
        M: CodeMemory + ?Sized,
    {
        let region = memory.region();

        for site in &fix.sites {
            if site.action.is_hook() && self.target == Target::File {
                return Err(Error::InvalidConfig(format!(
                    "site '{}.{}' is a hook and cannot be applied to a file",
                    fix.name, site.name
                )));
            }
            if matches!(site.locate, SiteLocator::FileOffset { .. }) && self.target == Target::Process {
                return Err(Error::InvalidConfig(format!(
                    "site '{}.{}' uses a file offset, which only applies to files on disk",
                    fix.name, site.name
                )));
            }
        }

        let signatures: Vec<(&str, &ByteSignature, _)> = fix
            .sites
            .iter()
            .filter_map(|site| match &site.locate {
                SiteLocator::Signature {
                    pattern,
                    occurrence,
                    ..
                } => Some((site.name.as_str(), pattern, *occurrence)),
                SiteLocator::FileOffset { .. } => None,
            })
            .collect();
        let patterns: Vec<&ByteSignature> = signatures.iter().map(|(_, sig, _)| *sig).collect();
        let found = BatchScan::run(memory.bytes(), region, signatures).require_all(&patterns)?;
        let mut found = found.into_iter();

        fix.sites
            .iter()
            .map(|site| {
                let address = match &site.locate {
                    SiteLocator::Signature { offset, .. } => {
                        let matched = found.next().ok_or_else(|| Error::SignatureNotFound {
                            site: site.name.clone(),
                            pattern: String::new(),
                        })?;
                        isize::try_from(*offset)
                            .ok()
                            .and_then(|o| matched.checked_add_signed(o))
                            .ok_or(Error::PatchOutOfBounds {
                                address: matched,
                                len: site.action.write_len(),
                                region,
                            })?
                    }
                    SiteLocator::FileOffset { file_offset } => region.address_of(*file_offset),
                };
                Ok(ResolvedSite { def: site, address })
            })
            .collect()
    }
}

/// Horizontal FOV `original` (in `unit`) rescaled from `base_aspect` to the
/// configured aspect ratio, then widened by the FOV factor.
pub fn widened_hfov(unit: AngleUnit, original: f32, base_aspect: f32, settings: &Settings) -> f32 {
    let rescaled = rescale_hfov_in(unit, original, base_aspect, settings.aspect_ratio());
    if settings.fov_factor == 1.0 {
        return rescaled;
    }
    unit.from_radians(apply_fov_factor(unit.to_radians(rescaled), settings.fov_factor))
}

/// Bytes a value site writes, or `None` for actions that aren't values.
pub fn value_bytes(action: &SiteAction, settings: &Settings) -> Option<Vec<u8>> {
    let bytes = match action {
        SiteAction::AspectRatio => settings.aspect_ratio().to_le_bytes().to_vec(),
        SiteAction::HorizontalFov {
            original,
            unit,
            base_aspect,
        } => widened_hfov(*unit, *original, *base_aspect, settings)
            .to_le_bytes()
            .to_vec(),
        SiteAction::Resolution { axis } => {
            let value = match axis {
                Axis::Width => settings.resolution.width(),
                Axis::Height => settings.resolution.height(),
            };
            value.to_le_bytes().to_vec()
        }
        SiteAction::FovMultiplier { base_aspect } => {
            fov_multiplier(*base_aspect, settings.aspect_ratio())
                .to_le_bytes()
                .to_vec()
        }
        SiteAction::Nop { .. } | SiteAction::Bytes { .. } | SiteAction::Hook { .. } => {
            return None;
        }
    };
    Some(bytes)
}

/// Callback performing `effect`. Everything it needs is computed up front.
pub fn hook_callback(effect: &HookEffect, settings: &Settings) -> HookCallback {
    let aspect = settings.aspect_ratio();
    let snapshot = *settings;

    match *effect {
        HookEffect::PushAspectRatio => Box::new(move |ctx: &mut dyn CpuContext| {
            ctx.fpu_push(aspect as f64);
        }),
        HookEffect::ReplaceFpuTopWithHfov { unit, base_aspect } => {
            Box::new(move |ctx: &mut dyn CpuContext| {
                if let Some(current) = ctx.fpu_top() {
                    let widened = widened_hfov(unit, current as f32, base_aspect, &snapshot);
                    ctx.set_fpu_top(widened as f64);
                }
            })
        }
        HookEffect::SetXmmAspectRatio { index } => Box::new(move |ctx: &mut dyn CpuContext| {
            ctx.set_xmm_f32(index, aspect);
        }),
        HookEffect::ScaleXmmFov {
            index,
            unit,
            base_aspect,
        } => Box::new(move |ctx: &mut dyn CpuContext| {
            if let Some(current) = ctx.xmm_f32(index) {
                ctx.set_xmm_f32(index, widened_hfov(unit, current, base_aspect, &snapshot));
            }
        }),
        HookEffect::SetRegisterAspectRatio { register } => {
            Box::new(move |ctx: &mut dyn CpuContext| {
                ctx.set_reg(register, aspect.to_bits() as u64);
            })
        }
    }
}

/// Options for [`patch_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOptions {
    /// Copy the untouched file to `<name>.bak` before writing.
    pub backup: bool,
    /// Compute and report the writes without saving anything.
    pub dry_run: bool,
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Apply the value sites of `profile` to an executable on disk.
pub fn patch_file(
    path: &Path,
    profile: &GameProfile,
    settings: Settings,
    options: FileOptions,
) -> Result<FixReport> {
    let original = fs::read(path)?;
    let mut image = BufferMemory::new(0, original.clone());

    let report = FixRunner::new(settings, Target::File).run(profile, &mut image, None);
    let patched = image.into_inner();

    if options.dry_run {
        info!("Dry run, {} left unchanged", path.display());
        return Ok(report);
    }
    if patched == original {
        info!("No changes to write to {}", path.display());
        return Ok(report);
    }

    if options.backup {
        let backup = backup_path(path);
        if backup.exists() {
            warn!("Backup {} already exists, keeping it", backup.display());
        } else {
            fs::write(&backup, &original)?;
            info!("Saved backup to {}", backup.display());
        }
    }

    fs::write(path, &patched)?;
    info!(
        "Wrote {} ({} of {} fixes applied)",
        path.display(),
        report.applied(),
        report.outcomes.len()
    );
    Ok(report)
}
