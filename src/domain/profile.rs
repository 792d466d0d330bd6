use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Target video codec families the planner understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Av1,
    H265,
    H264,
    Vp9,
}

impl VideoCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::Av1 => "av1",
            VideoCodec::H265 => "h265",
            VideoCodec::H264 => "h264",
            VideoCodec::Vp9 => "vp9",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "av1" => Ok(VideoCodec::Av1),
            "h265" => Ok(VideoCodec::H265),
            "h264" => Ok(VideoCodec::H264),
            "vp9" => Ok(VideoCodec::Vp9),
            other => Err(StorageError::InvalidValue {
                column: "codec",
                value: other.to_string(),
            }),
        }
    }
}

/// Output container. Carries both the file extension and the format
/// flag passed to the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mkv,
    Mp4,
    Webm,
}

impl Container {
    pub fn as_str(self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
        }
    }

    /// Extension including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Container::Mkv => ".mkv",
            Container::Mp4 => ".mp4",
            Container::Webm => ".webm",
        }
    }

    pub fn format_flag(self) -> &'static str {
        match self {
            Container::Mkv => "av_mkv",
            Container::Mp4 => "av_mp4",
            Container::Webm => "av_webm",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "mkv" => Ok(Container::Mkv),
            "mp4" => Ok(Container::Mp4),
            "webm" => Ok(Container::Webm),
            other => Err(StorageError::InvalidValue {
                column: "container",
                value: other.to_string(),
            }),
        }
    }
}

/// How audio tracks of the source are carried into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioStrategy {
    PreserveAll,
    KeepPrimary,
    StereoMixdown,
    HdPlusAac,
    HighQuality,
}

impl AudioStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioStrategy::PreserveAll => "preserve_all",
            AudioStrategy::KeepPrimary => "keep_primary",
            AudioStrategy::StereoMixdown => "stereo_mixdown",
            AudioStrategy::HdPlusAac => "hd_plus_aac",
            AudioStrategy::HighQuality => "high_quality",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "preserve_all" => Ok(AudioStrategy::PreserveAll),
            "keep_primary" => Ok(AudioStrategy::KeepPrimary),
            "stereo_mixdown" => Ok(AudioStrategy::StereoMixdown),
            "hd_plus_aac" => Ok(AudioStrategy::HdPlusAac),
            "high_quality" => Ok(AudioStrategy::HighQuality),
            other => Err(StorageError::InvalidValue {
                column: "audio_strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// How subtitle tracks of the source are carried into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleStrategy {
    PreserveAll,
    KeepEnglish,
    BurnIn,
    ForeignScan,
    None,
}

impl SubtitleStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SubtitleStrategy::PreserveAll => "preserve_all",
            SubtitleStrategy::KeepEnglish => "keep_english",
            SubtitleStrategy::BurnIn => "burn_in",
            SubtitleStrategy::ForeignScan => "foreign_scan",
            SubtitleStrategy::None => "none",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "preserve_all" => Ok(SubtitleStrategy::PreserveAll),
            "keep_english" => Ok(SubtitleStrategy::KeepEnglish),
            "burn_in" => Ok(SubtitleStrategy::BurnIn),
            "foreign_scan" => Ok(SubtitleStrategy::ForeignScan),
            "none" => Ok(SubtitleStrategy::None),
            other => Err(StorageError::InvalidValue {
                column: "subtitle_strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// A named encoding recipe.
///
/// At most one profile may have `is_default = true`; the persistence
/// layer enforces this atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub codec: VideoCodec,
    /// Encoder identifier, e.g. `svt_av1`, `x265`, `nvenc_h265`.
    pub encoder: String,
    /// Codec-specific CRF/CQ, 0–51.
    pub quality: u8,
    pub container: Container,
    /// Optional pinned output resolution, `WxH`.
    pub resolution: Option<String>,
    /// Optional pinned output framerate; source rate is preserved when
    /// unset.
    pub framerate: Option<f64>,
    pub audio_strategy: AudioStrategy,
    /// Audio codec used by `keep_primary` (`aac`, `opus`, `ac3`,
    /// `flac`, `passthrough`).
    pub audio_codec: String,
    pub subtitle_strategy: SubtitleStrategy,
    pub enable_filters: bool,
    pub chapter_markers: bool,
    pub hw_accel_enabled: bool,
    pub preset: Option<String>,
    pub two_pass: bool,
    /// Free-form extra transcoder arguments, appended last so they can
    /// override anything the planner produced.
    pub custom_args: Option<String>,
    pub is_default: bool,
}

/// Field set for creating or updating a profile. `id` and
/// `is_default` are managed by dedicated mutators.
#[derive(Debug, Clone)]
pub struct ProfileDraft {
    pub name: String,
    pub codec: VideoCodec,
    pub encoder: String,
    pub quality: u8,
    pub container: Container,
    pub resolution: Option<String>,
    pub framerate: Option<f64>,
    pub audio_strategy: AudioStrategy,
    pub audio_codec: String,
    pub subtitle_strategy: SubtitleStrategy,
    pub enable_filters: bool,
    pub chapter_markers: bool,
    pub hw_accel_enabled: bool,
    pub preset: Option<String>,
    pub two_pass: bool,
    pub custom_args: Option<String>,
}

impl ProfileDraft {
    /// A plain software AV1 recipe; handy as a starting point.
    pub fn av1_default(name: &str) -> Self {
        Self {
            name: name.to_string(),
            codec: VideoCodec::Av1,
            encoder: "svt_av1".to_string(),
            quality: 28,
            container: Container::Mkv,
            resolution: None,
            framerate: None,
            audio_strategy: AudioStrategy::PreserveAll,
            audio_codec: "aac".to_string(),
            subtitle_strategy: SubtitleStrategy::PreserveAll,
            enable_filters: false,
            chapter_markers: true,
            hw_accel_enabled: false,
            preset: None,
            two_pass: false,
            custom_args: None,
        }
    }
}
