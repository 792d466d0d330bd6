//! Media probing via an ffprobe-compatible CLI.
//!
//! The prober never fails outright: when every strategy comes up
//! empty the caller receives a record with `codec = "unknown"`, which
//! the needs-encoding predicate treats as "encode it".

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::{AudioTrack, MediaSpecs};
use crate::process_ext::run_with_timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const SCAN_FALLBACK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct MediaProber {
    binary: PathBuf,
    available: bool,
    /// Optional transcoder binary used as a `--scan --json` fallback
    /// when the primary prober fails or reports an unknown codec.
    scan_fallback: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    codec_name: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    tags: Option<ProbeTags>,
}

#[derive(Debug, Deserialize)]
struct ProbeTags {
    language: Option<String>,
    lang: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

impl MediaProber {
    pub fn new(binary: PathBuf) -> Self {
        let available = Self::check_tool(&binary);
        if !available {
            warn!(binary = %binary.display(), "media prober unavailable; files will queue as codec=unknown");
        }
        Self {
            binary,
            available,
            scan_fallback: None,
        }
    }

    /// Use the transcoder's own `--scan --json` mode as a second probe
    /// strategy when the primary prober comes up empty.
    pub fn with_scan_fallback(mut self, transcoder: PathBuf) -> Self {
        self.scan_fallback = Some(transcoder);
        self
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    fn check_tool(binary: &Path) -> bool {
        let mut cmd = Command::new(binary);
        cmd.arg("-version");
        match run_with_timeout(cmd, Duration::from_secs(5)) {
            Ok(run) => run.status.success(),
            Err(_) => false,
        }
    }

    /// Probe a file. Infallible by contract: when every strategy
    /// fails the caller gets `MediaSpecs::unknown()`.
    pub fn probe(&self, path: &Path) -> MediaSpecs {
        if self.available {
            match self.probe_json(path) {
                Ok(specs) if !specs.codec_is_unknown() => return specs,
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "probe failed");
                }
            }
        }
        if let Some(transcoder) = &self.scan_fallback {
            match scan_probe(transcoder, path) {
                Ok(Some(specs)) => return specs,
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "scan-probe fallback failed");
                }
            }
        }
        MediaSpecs::unknown()
    }

    fn probe_json(&self, path: &Path) -> anyhow::Result<MediaSpecs> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(path.as_os_str());

        let run = run_with_timeout(cmd, PROBE_TIMEOUT)?;
        if run.timed_out {
            anyhow::bail!("prober timed out after {}s", PROBE_TIMEOUT.as_secs());
        }
        if !run.status.success() {
            anyhow::bail!("prober exited with {}", run.status);
        }

        let parsed: ProbeOutput = serde_json::from_slice(&run.stdout)?;
        debug!(path = %path.display(), streams = parsed.streams.len(), "probed");
        Ok(specs_from_probe(parsed))
    }
}

fn specs_from_probe(data: ProbeOutput) -> MediaSpecs {
    let mut specs = MediaSpecs::unknown();

    specs.duration_s = data
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);
    specs.bit_rate = data
        .format
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse().ok())
        .unwrap_or(0);

    for stream in data.streams {
        match stream.codec_type.as_str() {
            "video" => {
                specs.codec = normalise_codec(&stream.codec_name);
                if let (Some(w), Some(h)) = (stream.width, stream.height) {
                    if w > 0 && h > 0 {
                        specs.resolution = format!("{w}x{h}");
                    }
                }
                // r_frame_rate is the container's nominal rate and
                // wins over the averaged one.
                for rate in [&stream.r_frame_rate, &stream.avg_frame_rate] {
                    if let Some(fps) = rate.as_deref().and_then(parse_framerate) {
                        specs.framerate = fps;
                        break;
                    }
                }
            }
            "audio" => {
                let language = stream
                    .tags
                    .as_ref()
                    .and_then(|t| t.language.clone().or_else(|| t.lang.clone()))
                    .unwrap_or_else(|| "und".to_string());
                specs.audio_tracks.push(AudioTrack {
                    codec: if stream.codec_name.is_empty() {
                        "unknown".to_string()
                    } else {
                        stream.codec_name.clone()
                    },
                    language,
                    channels: stream.channels.unwrap_or(0),
                    sample_rate: stream.sample_rate.clone().unwrap_or_default(),
                });
            }
            _ => {}
        }
    }
    specs
}

#[derive(Debug, Deserialize)]
struct ScanTitleSet {
    #[serde(rename = "TitleList", default)]
    title_list: Vec<ScanTitle>,
}

#[derive(Debug, Deserialize)]
struct ScanTitle {
    #[serde(rename = "VideoCodec", default)]
    video_codec: String,
    #[serde(rename = "Geometry")]
    geometry: Option<ScanGeometry>,
    #[serde(rename = "FrameRate")]
    frame_rate: Option<ScanFrameRate>,
    #[serde(rename = "AudioList", default)]
    audio_list: Vec<ScanAudio>,
}

#[derive(Debug, Deserialize)]
struct ScanGeometry {
    #[serde(rename = "Width", default)]
    width: u32,
    #[serde(rename = "Height", default)]
    height: u32,
}

#[derive(Debug, Deserialize)]
struct ScanFrameRate {
    #[serde(rename = "Num", default)]
    num: i64,
    #[serde(rename = "Den", default)]
    den: i64,
}

#[derive(Debug, Deserialize)]
struct ScanAudio {
    #[serde(rename = "CodecName", default)]
    codec_name: String,
    #[serde(rename = "Language", default)]
    language: String,
}

/// Second strategy: the transcoder's `--scan --json` mode. The JSON
/// title set is embedded in diagnostic output, so it has to be carved
/// out by brace matching.
fn scan_probe(transcoder: &Path, path: &Path) -> anyhow::Result<Option<MediaSpecs>> {
    let mut cmd = Command::new(transcoder);
    cmd.arg("--scan").arg("--json").arg("-i").arg(path.as_os_str());
    let run = run_with_timeout(cmd, SCAN_FALLBACK_TIMEOUT)?;
    if run.timed_out {
        anyhow::bail!("scan probe timed out");
    }

    let mut text = String::from_utf8_lossy(&run.stderr).into_owned();
    text.push_str(&String::from_utf8_lossy(&run.stdout));
    let Some(json) = extract_json_object(&text, "\"JSON Title Set\"") else {
        return Ok(None);
    };
    let wrapper: serde_json::Value = serde_json::from_str(json)?;
    let title_set = wrapper.get("JSON Title Set").cloned().unwrap_or(wrapper);
    let parsed: ScanTitleSet = serde_json::from_value(title_set)?;
    let Some(title) = parsed.title_list.into_iter().next() else {
        return Ok(None);
    };

    let mut specs = MediaSpecs::unknown();
    if !title.video_codec.is_empty() {
        specs.codec = normalise_codec(&title.video_codec);
    }
    if let Some(geometry) = title.geometry {
        if geometry.width > 0 && geometry.height > 0 {
            specs.resolution = format!("{}x{}", geometry.width, geometry.height);
        }
    }
    if let Some(rate) = title.frame_rate {
        if rate.den > 0 && rate.num > 0 {
            specs.framerate = ((rate.num as f64 / rate.den as f64) * 1000.0).round() / 1000.0;
        }
    }
    for audio in title.audio_list {
        specs.audio_tracks.push(AudioTrack {
            codec: if audio.codec_name.is_empty() {
                "unknown".to_string()
            } else {
                audio.codec_name.to_ascii_lowercase()
            },
            language: if audio.language.is_empty() {
                "und".to_string()
            } else {
                audio.language
            },
            channels: 0,
            sample_rate: String::new(),
        });
    }
    Ok(Some(specs))
}

/// Find the JSON object whose opening brace precedes `marker`,
/// respecting string literals and escapes.
fn extract_json_object<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let marker_at = text.find(marker)?;
    let start = text[..marker_at].rfind('{')?;
    let bytes = text.as_bytes();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Collapse the zoo of probe-reported codec names into the closed set
/// the planner reasons about. Anything unrecognised is kept lowercased.
pub fn normalise_codec(raw: &str) -> String {
    let raw = raw.to_ascii_lowercase();
    if raw.contains("av1") || raw.contains("av01") {
        "av1".to_string()
    } else if raw.contains("hevc")
        || raw.contains("h265")
        || raw.contains("h.265")
        || raw.contains("x265")
    {
        "h265".to_string()
    } else if raw.contains("avc")
        || raw.contains("h264")
        || raw.contains("h.264")
        || raw.contains("x264")
    {
        "h264".to_string()
    } else if raw.contains("vp9") || raw.contains("vp09") {
        "vp9".to_string()
    } else if raw.contains("vp8") {
        "vp8".to_string()
    } else if raw.contains("mpeg4") || raw.contains("xvid") || raw.contains("divx") {
        "mpeg4".to_string()
    } else if raw.contains("mpeg2") || raw.contains("mpeg-2") {
        "mpeg2".to_string()
    } else if raw.contains("wmv") {
        "wmv".to_string()
    } else if raw.is_empty() {
        "unknown".to_string()
    } else {
        raw
    }
}

/// Parse a probe framerate, either rational (`24000/1001`) or plain
/// (`23.976`), to three decimals. Zero denominators and zero rates are
/// rejected.
pub fn parse_framerate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0/0" || raw == "0" {
        return None;
    }
    let fps = if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den <= 0.0 {
            return None;
        }
        num / den
    } else {
        raw.parse().ok()?
    };
    if fps <= 0.0 || !fps.is_finite() {
        return None;
    }
    Some((fps * 1000.0).round() / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_normalisation_table() {
        for (raw, expected) in [
            ("AV1", "av1"),
            ("av01", "av1"),
            ("hevc", "h265"),
            ("H.265", "h265"),
            ("x265", "h265"),
            ("avc", "h264"),
            ("h264", "h264"),
            ("x264", "h264"),
            ("vp9", "vp9"),
            ("vp09", "vp9"),
            ("vp8", "vp8"),
            ("mpeg4", "mpeg4"),
            ("XVID", "mpeg4"),
            ("divx", "mpeg4"),
            ("mpeg2", "mpeg2"),
            ("MPEG-2", "mpeg2"),
            ("wmv3", "wmv"),
            ("theora", "theora"),
            ("", "unknown"),
        ] {
            assert_eq!(normalise_codec(raw), expected, "raw = {raw:?}");
        }
    }

    #[test]
    fn framerate_parsing() {
        assert_eq!(parse_framerate("24000/1001"), Some(23.976));
        assert_eq!(parse_framerate("30/1"), Some(30.0));
        assert_eq!(parse_framerate("25"), Some(25.0));
        assert_eq!(parse_framerate("0/0"), None);
        assert_eq!(parse_framerate("24/0"), None);
        assert_eq!(parse_framerate(""), None);
        assert_eq!(parse_framerate("garbage"), None);
    }

    #[test]
    fn probe_json_parses_streams_and_format() {
        let json = r#"{
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "hevc",
                    "width": 1920,
                    "height": 1080,
                    "r_frame_rate": "24000/1001",
                    "avg_frame_rate": "24000/1001"
                },
                {
                    "codec_type": "audio",
                    "codec_name": "aac",
                    "channels": 6,
                    "sample_rate": "48000",
                    "tags": {"language": "eng"}
                }
            ],
            "format": {"duration": "5400.5", "bit_rate": "8000000"}
        }"#;
        let parsed: ProbeOutput = serde_json::from_str(json).unwrap();
        let specs = specs_from_probe(parsed);
        assert_eq!(specs.codec, "h265");
        assert_eq!(specs.resolution, "1920x1080");
        assert_eq!(specs.framerate, 23.976);
        assert_eq!(specs.duration_s, 5400.5);
        assert_eq!(specs.bit_rate, 8_000_000);
        assert_eq!(specs.audio_tracks.len(), 1);
        assert_eq!(specs.audio_tracks[0].language, "eng");
        assert_eq!(specs.audio_tracks[0].channels, 6);
    }

    #[test]
    fn empty_probe_output_degrades_to_unknown() {
        let parsed: ProbeOutput = serde_json::from_str("{}").unwrap();
        let specs = specs_from_probe(parsed);
        assert!(specs.codec_is_unknown());
        assert_eq!(specs.resolution, "unknown");
    }

    #[test]
    fn missing_binary_yields_unknown_specs() {
        let prober = MediaProber::new(PathBuf::from("/definitely/not/a/prober"));
        assert!(!prober.is_available());
        let specs = prober.probe(Path::new("/tmp/whatever.mkv"));
        assert!(specs.codec_is_unknown());
    }

    #[test]
    fn json_object_extraction_handles_noise_and_strings() {
        let text = "scanning...\nsome log\n{ \"JSON Title Set\": { \
                    \"TitleList\": [{\"VideoCodec\": \"h264 {not a brace}\", \
                    \"Geometry\": {\"Width\": 1280, \"Height\": 720}}] } }\ntrailer";
        let json = extract_json_object(text, "\"JSON Title Set\"").unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(
            value["JSON Title Set"]["TitleList"][0]["Geometry"]["Width"],
            serde_json::json!(1280)
        );

        assert!(extract_json_object("no marker here", "\"JSON Title Set\"").is_none());
        assert!(extract_json_object("\"JSON Title Set\" but no brace", "\"JSON Title Set\"").is_none());
    }

    #[test]
    fn scan_title_set_maps_into_specs() {
        let wrapper = serde_json::json!({
            "TitleList": [{
                "VideoCodec": "hevc",
                "Geometry": {"Width": 1920, "Height": 1080},
                "FrameRate": {"Num": 24000, "Den": 1001},
                "AudioList": [{"CodecName": "AC3", "Language": "eng"}]
            }]
        });
        let parsed: ScanTitleSet = serde_json::from_value(wrapper).unwrap();
        let title = &parsed.title_list[0];
        assert_eq!(normalise_codec(&title.video_codec), "h265");
        let rate = title.frame_rate.as_ref().unwrap();
        assert_eq!(
            ((rate.num as f64 / rate.den as f64) * 1000.0).round() / 1000.0,
            23.976
        );
        assert_eq!(parsed.title_list[0].audio_list[0].language, "eng");
    }
}
