use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::profile::Profile;

pub const SPECS_VERSION: u32 = 1;

fn specs_version() -> u32 {
    SPECS_VERSION
}

/// One audio stream of a probed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub codec: String,
    #[serde(default = "und")]
    pub language: String,
    #[serde(default)]
    pub channels: u32,
    #[serde(default)]
    pub sample_rate: String,
}

fn und() -> String {
    "und".to_string()
}

/// Snapshot of what a media file currently is, as reported by the
/// prober (or by a catalog service). Persisted as a versioned JSON
/// column and decoded only at the persistence boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSpecs {
    #[serde(default = "specs_version")]
    pub version: u32,
    /// Normalised codec name, or `"unknown"` when probing failed.
    pub codec: String,
    /// `WxH`, or `"unknown"`.
    pub resolution: String,
    #[serde(default)]
    pub framerate: f64,
    #[serde(default)]
    pub audio_tracks: Vec<AudioTrack>,
    #[serde(default)]
    pub duration_s: f64,
    #[serde(default)]
    pub bit_rate: u64,
    /// Kind-specific tags attached by external sync (catalog ids,
    /// titles). Empty for locally probed files.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, serde_json::Value>,
}

impl MediaSpecs {
    /// The record produced when every probe strategy failed. Never
    /// `None`: an unknown codec is itself a signal (it means "encode").
    pub fn unknown() -> Self {
        Self {
            version: SPECS_VERSION,
            codec: "unknown".to_string(),
            resolution: "unknown".to_string(),
            framerate: 0.0,
            audio_tracks: Vec::new(),
            duration_s: 0.0,
            bit_rate: 0,
            tags: BTreeMap::new(),
        }
    }

    pub fn codec_is_unknown(&self) -> bool {
        self.codec == "unknown"
    }

    /// Vertical resolution parsed from `WxH`, when known.
    pub fn height(&self) -> Option<u32> {
        let (_, h) = self.resolution.split_once('x')?;
        h.parse().ok()
    }

    pub fn width(&self) -> Option<u32> {
        let (w, _) = self.resolution.split_once('x')?;
        w.parse().ok()
    }
}

/// What the profile asks a file to become. Derived once at queue time
/// so later profile edits do not reshape already-queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpecs {
    #[serde(default = "specs_version")]
    pub version: u32,
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<f64>,
    pub audio_codec: String,
}

impl TargetSpecs {
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            version: SPECS_VERSION,
            codec: profile.codec.as_str().to_string(),
            resolution: profile.resolution.clone(),
            framerate: profile.framerate,
            audio_codec: profile.audio_codec.clone(),
        }
    }
}

/// Per-root policy deciding when a queued file also gets an upscale
/// pre-stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscalePolicy {
    pub enabled: bool,
    /// Files with a known height strictly below this trigger the
    /// pre-stage.
    pub trigger_below_height: u32,
    pub target_height: u32,
    pub upscaler: String,
    pub model: String,
    pub factor: u32,
}

impl UpscalePolicy {
    /// Build the concrete plan for one file, if the policy applies.
    pub fn plan_for(&self, specs: &MediaSpecs) -> Option<UpscalePlan> {
        if !self.enabled {
            return None;
        }
        let source_height = specs.height()?;
        if source_height >= self.trigger_below_height {
            return None;
        }
        Some(UpscalePlan {
            version: SPECS_VERSION,
            upscaler: self.upscaler.clone(),
            model: self.model.clone(),
            factor: self.factor,
            source_height,
            target_height: self.target_height,
        })
    }
}

/// Frozen instructions for the upscale pre-stage of one queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscalePlan {
    #[serde(default = "specs_version")]
    pub version: u32,
    pub upscaler: String,
    pub model: String,
    pub factor: u32,
    pub source_height: u32,
    pub target_height: u32,
}
