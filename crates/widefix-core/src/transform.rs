//! Aspect-ratio and field-of-view math.
//!
//! Everything here is pure `f32` arithmetic in the operand order the fixes
//! have always used, so results stay bit-identical across releases.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Aspect ratio most legacy titles were authored for.
pub const BASE_ASPECT_RATIO: f32 = 4.0 / 3.0;

/// Output size in pixels; both dimensions are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    /// 1920x1080, used when nothing better is known.
    pub const FALLBACK: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidConfig(format!(
                "Resolution must be positive, got {}x{}",
                width, height
            )));
        }
        Ok(Self { width, height })
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub fn aspect_ratio(&self) -> f32 {
        aspect_ratio(self.width, self.height)
    }
}

/// Unit a game stores its FOV in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AngleUnit {
    #[default]
    Degrees,
    Radians,
}

impl AngleUnit {
    pub fn to_radians(self, value: f32) -> f32 {
        match self {
            AngleUnit::Degrees => value.to_radians(),
            AngleUnit::Radians => value,
        }
    }

    pub fn from_radians(self, value: f32) -> f32 {
        match self {
            AngleUnit::Degrees => value.to_degrees(),
            AngleUnit::Radians => value,
        }
    }
}

/// `width / height`. Callers validate both are non-zero (see [`Resolution`]).
pub fn aspect_ratio(width: u32, height: u32) -> f32 {
    width as f32 / height as f32
}

/// Horizontal FOV (radians) for `new_aspect`, keeping the vertical FOV that
/// `old_hfov` had at `old_aspect`.
///
/// `2·atan(tan(old/2) · (new_aspect / old_aspect))`; equal aspect ratios
/// return `old_hfov` unchanged.
pub fn rescale_hfov(old_hfov: f32, old_aspect: f32, new_aspect: f32) -> f32 {
    if old_aspect == new_aspect {
        return old_hfov;
    }
    2.0 * ((old_hfov / 2.0).tan() * (new_aspect / old_aspect)).atan()
}

pub fn rescale_hfov_degrees(old_hfov: f32, old_aspect: f32, new_aspect: f32) -> f32 {
    if old_aspect == new_aspect {
        return old_hfov;
    }
    rescale_hfov(old_hfov.to_radians(), old_aspect, new_aspect).to_degrees()
}

pub fn rescale_hfov_in(unit: AngleUnit, old_hfov: f32, old_aspect: f32, new_aspect: f32) -> f32 {
    match unit {
        AngleUnit::Degrees => rescale_hfov_degrees(old_hfov, old_aspect, new_aspect),
        AngleUnit::Radians => rescale_hfov(old_hfov, old_aspect, new_aspect),
    }
}

/// Vertical FOV (radians) matching `hfov` at `aspect`.
pub fn vfov_from_hfov(hfov: f32, aspect: f32) -> f32 {
    2.0 * ((hfov / 2.0).tan() / aspect).atan()
}

/// Horizontal FOV (radians) matching `vfov` at `aspect`.
pub fn hfov_from_vfov(vfov: f32, aspect: f32) -> f32 {
    2.0 * ((vfov / 2.0).tan() * aspect).atan()
}

/// Widen or narrow an FOV (radians) by scaling its half-angle tangent.
///
/// A factor of exactly 1.0 returns the input unchanged.
pub fn apply_fov_factor(hfov: f32, factor: f32) -> f32 {
    if factor == 1.0 {
        return hfov;
    }
    2.0 * ((hfov / 2.0).tan() * factor).atan()
}

/// Multiplier for games that store FOV as a scale of their authored value.
pub fn fov_multiplier(old_aspect: f32, new_aspect: f32) -> f32 {
    new_aspect / old_aspect
}
