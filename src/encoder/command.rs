//! Transcoder command planning: encoder selection (with hardware
//! fallback), container/output mapping, and the audio/subtitle/filter
//! strategy tables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::domain::{AudioStrategy, Container, Profile, SubtitleStrategy, VideoCodec};
use crate::error::EncodeError;
use crate::process_ext::run_with_timeout;
use crate::scanner::OPTIMIZED_SUFFIX;

/// Hardware encoder families detected on this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareSupport {
    pub nvidia: bool,
    pub intel: bool,
    pub amd: bool,
    pub apple: bool,
}

impl HardwareSupport {
    pub fn none() -> Self {
        Self::default()
    }

    /// Probe the transcoder's help text for hardware encoder names.
    /// Detection failure simply means software encoding.
    pub fn detect(transcoder: &Path) -> Self {
        let mut cmd = std::process::Command::new(transcoder);
        cmd.arg("--help");
        let output = match run_with_timeout(cmd, Duration::from_secs(10)) {
            Ok(run) => {
                let mut text = String::from_utf8_lossy(&run.stdout).to_ascii_lowercase();
                text.push_str(&String::from_utf8_lossy(&run.stderr).to_ascii_lowercase());
                text
            }
            Err(_) => String::new(),
        };
        let support = Self {
            nvidia: output.contains("nvenc"),
            amd: output.contains("vce"),
            intel: output.contains("qsv"),
            apple: output.contains("videotoolbox") || output.contains("vt_h"),
        };
        info!(?support, "hardware encoder detection");
        support
    }
}

/// First-available hardware variant for a codec, in NVIDIA → Intel →
/// AMD → Apple order. `None` keeps the profile's software encoder.
pub fn hw_encoder_for(codec: VideoCodec, hw: &HardwareSupport) -> Option<&'static str> {
    if hw.nvidia {
        match codec {
            VideoCodec::H264 => return Some("nvenc_h264"),
            VideoCodec::H265 => return Some("nvenc_h265"),
            VideoCodec::Av1 => return Some("nvenc_av1"),
            VideoCodec::Vp9 => {}
        }
    }
    if hw.intel {
        match codec {
            VideoCodec::H264 => return Some("qsv_h264"),
            VideoCodec::H265 => return Some("qsv_h265"),
            VideoCodec::Av1 => return Some("qsv_av1"),
            VideoCodec::Vp9 => {}
        }
    }
    if hw.amd {
        match codec {
            VideoCodec::H264 => return Some("vce_h264"),
            VideoCodec::H265 => return Some("vce_h265"),
            VideoCodec::Av1 | VideoCodec::Vp9 => {}
        }
    }
    if hw.apple {
        match codec {
            VideoCodec::H264 => return Some("vt_h264"),
            VideoCodec::H265 => return Some("vt_h265"),
            VideoCodec::Av1 | VideoCodec::Vp9 => {}
        }
    }
    None
}

/// A fully planned transcoder invocation.
#[derive(Debug, Clone)]
pub struct CommandPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Sibling temp file the transcoder writes (`<stem>_optimized.<ext>`).
    pub temp_output: PathBuf,
    /// Where the output lands after the atomic replace
    /// (`<stem>.<ext>` of the original).
    pub final_output: PathBuf,
    pub container: Container,
}

/// Build the transcoder invocation for one job.
pub fn plan_transcode(
    transcoder: &Path,
    input: &Path,
    original: &Path,
    profile: &Profile,
    hw: &HardwareSupport,
) -> Result<CommandPlan, EncodeError> {
    let parent = original
        .parent()
        .ok_or_else(|| EncodeError::PlanningFailed(format!("{} has no parent", original.display())))?;
    let stem = original
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            EncodeError::PlanningFailed(format!("{} has no usable stem", original.display()))
        })?;

    let container = profile.container;
    let ext = container.extension();
    let temp_output = parent.join(format!("{stem}{OPTIMIZED_SUFFIX}{ext}"));
    let final_output = parent.join(format!("{stem}{ext}"));

    let mut args: Vec<String> = vec![
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-o".into(),
        temp_output.to_string_lossy().into_owned(),
        "--format".into(),
        container.format_flag().into(),
    ];

    // Encoder: hardware variant when enabled and available, otherwise
    // the profile's software encoder, silently.
    let mut encoder = profile.encoder.clone();
    if profile.hw_accel_enabled {
        if let Some(hw_encoder) = hw_encoder_for(profile.codec, hw) {
            encoder = hw_encoder.to_string();
        }
    }
    debug!(encoder, "selected encoder");
    args.push("--encoder".into());
    args.push(encoder);

    args.push("--quality".into());
    args.push(profile.quality.to_string());

    if let Some(preset) = &profile.preset {
        args.push("--encoder-preset".into());
        args.push(preset.clone());
    }

    if let Some(resolution) = &profile.resolution {
        let (width, height) = resolution.split_once('x').ok_or_else(|| {
            EncodeError::PlanningFailed(format!("malformed profile resolution {resolution:?}"))
        })?;
        if width.parse::<u32>().is_err() || height.parse::<u32>().is_err() {
            return Err(EncodeError::PlanningFailed(format!(
                "malformed profile resolution {resolution:?}"
            )));
        }
        args.push("--width".into());
        args.push(width.to_string());
        args.push("--height".into());
        args.push(height.to_string());
    }

    match profile.framerate {
        Some(rate) => {
            args.push("--rate".into());
            args.push(format_rate(rate));
        }
        None => args.push("--vfr".into()),
    }

    args.extend(audio_args(profile));
    args.extend(subtitle_args(profile));

    if profile.enable_filters {
        args.extend(filter_args());
    }
    if profile.chapter_markers {
        args.push("--markers".into());
    }
    if profile.two_pass {
        args.push("--two-pass".into());
    }

    // Custom args go last so they can override anything above.
    if let Some(custom) = &profile.custom_args {
        args.extend(custom.split_whitespace().map(str::to_string));
    }

    Ok(CommandPlan {
        program: transcoder.to_path_buf(),
        args,
        temp_output,
        final_output,
        container,
    })
}

fn format_rate(rate: f64) -> String {
    if (rate - rate.round()).abs() < f64::EPSILON {
        format!("{}", rate.round() as i64)
    } else {
        format!("{rate}")
    }
}

fn map_audio_codec(codec: &str) -> &'static str {
    match codec {
        "aac" => "av_aac",
        "opus" => "opus",
        "ac3" => "ac3",
        "flac" => "flac24",
        "passthrough" => "copy",
        _ => "av_aac",
    }
}

fn audio_args(profile: &Profile) -> Vec<String> {
    let s = |v: &str| v.to_string();
    match profile.audio_strategy {
        AudioStrategy::PreserveAll => vec![
            s("--audio"),
            s("1,2,3,4,5,6,7,8,9,10"),
            s("--aencoder"),
            s("copy"),
            s("--audio-fallback"),
            s("av_aac"),
        ],
        AudioStrategy::KeepPrimary => vec![
            s("--audio"),
            s("1"),
            s("--aencoder"),
            s(map_audio_codec(&profile.audio_codec)),
        ],
        AudioStrategy::StereoMixdown => vec![
            s("--audio"),
            s("1"),
            s("--aencoder"),
            s("av_aac"),
            s("--ab"),
            s("192"),
            s("--mixdown"),
            s("stereo"),
        ],
        AudioStrategy::HdPlusAac => vec![
            s("--audio"),
            s("1,1"),
            s("--aencoder"),
            s("copy,av_aac"),
            s("--audio-fallback"),
            s("av_aac"),
            s("--ab"),
            s("0,192"),
            s("--mixdown"),
            s(",stereo"),
        ],
        AudioStrategy::HighQuality => vec![
            s("--audio"),
            s("1"),
            s("--aencoder"),
            s("av_aac"),
            s("--ab"),
            s("256"),
            s("--mixdown"),
            s("stereo"),
        ],
    }
}

fn subtitle_args(profile: &Profile) -> Vec<String> {
    let s = |v: &str| v.to_string();
    match profile.subtitle_strategy {
        SubtitleStrategy::PreserveAll => {
            let mut args = vec![s("--subtitle"), s("1,2,3,4,5,6,7,8,9,10")];
            if profile.container == Container::Mp4 {
                // MP4 carries at most limited subtitle tracks; never
                // flag one as default.
                args.push(s("--subtitle-default=none"));
            }
            args
        }
        SubtitleStrategy::KeepEnglish => {
            vec![s("--subtitle-lang-list"), s("eng"), s("--all-subtitles")]
        }
        SubtitleStrategy::BurnIn => vec![s("--subtitle"), s("1"), s("--subtitle-burned")],
        SubtitleStrategy::ForeignScan => {
            vec![s("--subtitle"), s("scan"), s("--subtitle-forced")]
        }
        SubtitleStrategy::None => Vec::new(),
    }
}

fn filter_args() -> Vec<String> {
    vec![
        "--comb-detect".to_string(),
        "--decomb".to_string(),
        "--nlmeans=light".to_string(),
        "--crop-mode=auto".to_string(),
    ]
}
