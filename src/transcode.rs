//! Post-close processing of segment files with `ffmpeg`.
//!
//! - `transcode` re-encodes a closed segment to H.264 MP4 in place of the raw file.
//! - `make_clip` renders the short, sped-up derivative attached to notifications.
//!
//! Both run on the worker pool. A failure leaves the original file untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, RecorderResult};
use crate::ingest::process::{run_to_completion, CommandSpec, ProcessLauncher};
use crate::writer::RecordingSegment;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxResolution {
    #[serde(rename = "480p")]
    P480,
    #[default]
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "original")]
    Original,
}

impl MaxResolution {
    pub fn max_height(self) -> Option<u32> {
        match self {
            MaxResolution::P480 => Some(480),
            MaxResolution::P720 => Some(720),
            MaxResolution::P1080 => Some(1080),
            MaxResolution::Original => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeSettings {
    pub enabled: bool,
    pub ffmpeg_path: String,
    pub preset: String,
    pub crf: u8,
    pub max_resolution: MaxResolution,
    pub target_fps: Option<u32>,
    /// 0 lets the encoder decide.
    pub threads: u32,
    pub timeout_secs: u64,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ffmpeg_path: "ffmpeg".to_string(),
            preset: "veryfast".to_string(),
            crf: 23,
            max_resolution: MaxResolution::P720,
            target_fps: Some(15),
            threads: 2,
            timeout_secs: 600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipSettings {
    pub width: u32,
    pub height: u32,
    pub speedup: f64,
    pub fps: u32,
    pub crf: u8,
    pub preset: String,
    /// Clips above this size are dropped and a text-only alert goes out.
    pub max_bytes: u64,
    pub timeout_secs: u64,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            speedup: 5.0,
            fps: 5,
            crf: 30,
            preset: "ultrafast".to_string(),
            max_bytes: 50 * 1024 * 1024,
            timeout_secs: 300,
        }
    }
}

pub struct TranscodePipeline {
    settings: TranscodeSettings,
    clip: ClipSettings,
    launcher: Arc<dyn ProcessLauncher>,
}

impl TranscodePipeline {
    pub fn new(
        settings: TranscodeSettings,
        clip: ClipSettings,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            settings,
            clip,
            launcher,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Re-encode `segment` to MP4. On success the segment record points at
    /// the new file and the raw file is gone. `input_fps` is passed to the
    /// demuxer for raw image streams, which carry no timing.
    pub fn transcode(
        &self,
        segment: &mut RecordingSegment,
        input_fps: Option<f64>,
    ) -> RecorderResult<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        let final_path = segment.path.with_extension("mp4");
        let partial = partial_path(&final_path);
        let spec = self.transcode_command(&segment.path, &partial, input_fps);
        let timeout = Duration::from_secs(self.settings.timeout_secs);
        if let Err(reason) = run_to_completion(self.launcher.as_ref(), &spec, timeout) {
            let _ = fs::remove_file(&partial);
            return Err(RecorderError::Transcode {
                path: segment.path.clone(),
                reason,
            });
        }
        let size = match fs::metadata(&partial) {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => {
                let _ = fs::remove_file(&partial);
                return Err(RecorderError::Transcode {
                    path: segment.path.clone(),
                    reason: "encoder produced no output".to_string(),
                });
            }
        };
        fs::rename(&partial, &final_path).map_err(|e| RecorderError::Transcode {
            path: segment.path.clone(),
            reason: format!("rename {}: {}", partial.display(), e),
        })?;
        if final_path != segment.path {
            if let Err(e) = fs::remove_file(&segment.path) {
                log::warn!("transcode: could not remove {}: {}", segment.path.display(), e);
            }
        }
        log::info!(
            "{}: transcoded {} ({} -> {} bytes)",
            segment.camera_id,
            segment.name,
            segment.size_bytes,
            size
        );
        segment.name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        segment.path = final_path;
        segment.size_bytes = size;
        Ok(())
    }

    fn transcode_command(&self, input: &Path, output: &Path, input_fps: Option<f64>) -> CommandSpec {
        let s = &self.settings;
        let mut spec = CommandSpec::new(&s.ffmpeg_path).args(["-hide_banner", "-loglevel", "error", "-y"]);
        if let Some(fps) = input_fps {
            spec = spec.arg("-framerate").arg(format!("{}", fps));
        }
        spec = spec
            .arg("-i")
            .arg(input.to_string_lossy())
            .args(["-c:v", "libx264", "-preset"])
            .arg(&s.preset)
            .arg("-crf")
            .arg(s.crf.to_string())
            .args(["-pix_fmt", "yuv420p"]);
        if let Some(height) = s.max_resolution.max_height() {
            spec = spec.arg("-vf").arg(format!("scale=-2:'min({},ih)'", height));
        }
        if let Some(fps) = s.target_fps {
            spec = spec.arg("-r").arg(fps.to_string());
        }
        if s.threads > 0 {
            spec = spec.arg("-threads").arg(s.threads.to_string());
        }
        spec.args(["-an", "-movflags", "+faststart", "-f", "mp4"])
            .arg(output.to_string_lossy())
    }

    /// Render the notification clip next to the segment under `clips/`.
    /// Returns `None` when the result exceeds the size limit.
    pub fn make_clip(
        &self,
        segment: &RecordingSegment,
        input_fps: Option<f64>,
    ) -> RecorderResult<Option<PathBuf>> {
        let dir = segment
            .path
            .parent()
            .map(|p| p.join("clips"))
            .unwrap_or_else(|| PathBuf::from("clips"));
        fs::create_dir_all(&dir).map_err(|source| RecorderError::Write {
            path: dir.clone(),
            source,
        })?;
        let stem = segment
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| segment.id.clone());
        let output = dir.join(format!("{}_clip.mp4", stem));
        let spec = self.clip_command(&segment.path, &output, input_fps);
        let timeout = Duration::from_secs(self.clip.timeout_secs);
        if let Err(reason) = run_to_completion(self.launcher.as_ref(), &spec, timeout) {
            let _ = fs::remove_file(&output);
            return Err(RecorderError::Transcode {
                path: segment.path.clone(),
                reason,
            });
        }
        let size = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
        if size == 0 || size > self.clip.max_bytes {
            log::warn!(
                "{}: clip {} is {} bytes (limit {}), sending text alert only",
                segment.camera_id,
                output.display(),
                size,
                self.clip.max_bytes
            );
            let _ = fs::remove_file(&output);
            return Ok(None);
        }
        Ok(Some(output))
    }

    fn clip_command(&self, input: &Path, output: &Path, input_fps: Option<f64>) -> CommandSpec {
        let c = &self.clip;
        let mut spec =
            CommandSpec::new(&self.settings.ffmpeg_path).args(["-hide_banner", "-loglevel", "error", "-y"]);
        if let Some(fps) = input_fps {
            spec = spec.arg("-framerate").arg(format!("{}", fps));
        }
        let speed = if c.speedup > 0.0 { 1.0 / c.speedup } else { 1.0 };
        spec.arg("-i")
            .arg(input.to_string_lossy())
            .arg("-vf")
            .arg(format!("scale={}:{},setpts={}*PTS", c.width, c.height, speed))
            .arg("-r")
            .arg(c.fps.to_string())
            .args(["-c:v", "libx264", "-preset"])
            .arg(&c.preset)
            .arg("-crf")
            .arg(c.crf.to_string())
            .args(["-pix_fmt", "yuv420p", "-an", "-f", "mp4"])
            .arg(output.to_string_lossy())
    }
}

fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::process::fake::{FakeLauncher, Script};
    use crate::writer::SegmentKind;
    use chrono::Utc;
    use tempfile::TempDir;

    fn raw_segment(dir: &Path) -> RecordingSegment {
        let path = dir.join("motion_20240501_120000.ts");
        fs::write(&path, vec![0x47u8; 188 * 4]).unwrap();
        RecordingSegment {
            id: "seg".into(),
            camera_id: "porch".into(),
            camera_name: "Porch".into(),
            name: "motion_20240501_120000.ts".into(),
            kind: SegmentKind::Motion,
            path,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            size_bytes: 752,
            duration_secs: 10.0,
            abandoned: false,
        }
    }

    fn pipeline(enabled: bool, launcher: &FakeLauncher) -> TranscodePipeline {
        TranscodePipeline::new(
            TranscodeSettings {
                enabled,
                ..TranscodeSettings::default()
            },
            ClipSettings::default(),
            Arc::new(launcher.clone()),
        )
    }

    #[test]
    fn disabled_pipeline_leaves_segment_alone() {
        let tmp = TempDir::new().unwrap();
        let launcher = FakeLauncher::new(Script::default());
        let mut segment = raw_segment(tmp.path());
        let before = segment.clone();
        pipeline(false, &launcher).transcode(&mut segment, None).unwrap();
        assert_eq!(segment, before);
        assert!(launcher.spawned().is_empty());
    }

    #[test]
    fn successful_transcode_replaces_raw_file() {
        let tmp = TempDir::new().unwrap();
        let launcher = FakeLauncher::new(Script {
            output_file: Some(vec![1u8; 100]),
            ..Script::default()
        });
        let mut segment = raw_segment(tmp.path());
        let raw = segment.path.clone();
        pipeline(true, &launcher).transcode(&mut segment, None).unwrap();

        assert_eq!(segment.path, tmp.path().join("motion_20240501_120000.mp4"));
        assert_eq!(segment.name, "motion_20240501_120000.mp4");
        assert_eq!(segment.size_bytes, 100);
        assert!(!raw.exists());
        assert!(segment.path.exists());

        let spec = &launcher.spawned()[0];
        assert!(spec.args.windows(2).any(|w| w == ["-crf", "23"]));
        assert!(spec.args.windows(2).any(|w| w == ["-preset", "veryfast"]));
        assert!(spec.args.contains(&"scale=-2:'min(720,ih)'".to_string()));
    }

    #[test]
    fn failed_transcode_keeps_original() {
        let tmp = TempDir::new().unwrap();
        let launcher = FakeLauncher::new(Script {
            exit_code: 1,
            ..Script::default()
        });
        let mut segment = raw_segment(tmp.path());
        let before = segment.clone();
        let err = pipeline(true, &launcher).transcode(&mut segment, None).unwrap_err();
        assert!(matches!(err, RecorderError::Transcode { .. }));
        assert_eq!(segment, before);
        assert!(before.path.exists());
        assert!(!tmp.path().join("motion_20240501_120000.mp4.part").exists());
    }

    #[test]
    fn clip_uses_condensed_settings() {
        let tmp = TempDir::new().unwrap();
        let launcher = FakeLauncher::new(Script {
            output_file: Some(vec![7u8; 64]),
            ..Script::default()
        });
        let segment = raw_segment(tmp.path());
        let clip = pipeline(false, &launcher)
            .make_clip(&segment, Some(1.0))
            .unwrap()
            .unwrap();
        assert_eq!(clip, tmp.path().join("clips/motion_20240501_120000_clip.mp4"));
        let spec = &launcher.spawned()[0];
        assert!(spec.args.contains(&"scale=640:480,setpts=0.2*PTS".to_string()));
        assert!(spec.args.windows(2).any(|w| w == ["-r", "5"]));
        assert!(spec.args.windows(2).any(|w| w == ["-framerate", "1"]));
    }

    #[test]
    fn oversized_clip_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let launcher = FakeLauncher::new(Script {
            output_file: Some(vec![7u8; 64]),
            ..Script::default()
        });
        let mut p = pipeline(false, &launcher);
        p.clip.max_bytes = 10;
        let segment = raw_segment(tmp.path());
        assert_eq!(p.make_clip(&segment, None).unwrap(), None);
        assert!(!tmp.path().join("clips/motion_20240501_120000_clip.mp4").exists());
    }

    #[test]
    fn resolution_names_deserialize() {
        let s: TranscodeSettings =
            toml::from_str("enabled = true\nmax_resolution = \"1080p\"\ncrf = 28").unwrap();
        assert_eq!(s.max_resolution, MaxResolution::P1080);
        assert_eq!(s.crf, 28);
        assert_eq!(s.preset, "veryfast");
    }
}
