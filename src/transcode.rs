//! Re-encode downloaded videos to H.264 so every browser can play them.
//!
//! Camera uploads are often HEVC. The transcoder tries NVENC first when GPU
//! acceleration is enabled, then libx264. If both fail the raw download is
//! served as-is.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    Nvenc,
    X264,
}

impl Encoder {
    fn codec_args(self) -> &'static [&'static str] {
        match self {
            Encoder::Nvenc => &["-c:v", "h264_nvenc", "-preset", "p1", "-b:v", "5M"],
            Encoder::X264 => &["-c:v", "libx264", "-preset", "ultrafast", "-crf", "23"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: PathBuf,
    hwaccel: bool,
}

impl Transcoder {
    pub fn from_config(cfg: &MediaConfig) -> Option<Self> {
        cfg.transcode.then(|| Self { ffmpeg: PathBuf::from(&cfg.ffmpeg_path), hwaccel: cfg.hwaccel })
    }

    /// Encoders to try, in order.
    pub fn encoders(&self) -> Vec<Encoder> {
        if self.hwaccel {
            vec![Encoder::Nvenc, Encoder::X264]
        } else {
            vec![Encoder::X264]
        }
    }

    pub fn command(&self, encoder: Encoder, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error").arg("-y");
        if encoder == Encoder::Nvenc {
            cmd.arg("-hwaccel").arg("cuda");
        }
        cmd.arg("-i").arg(input);
        cmd.args(encoder.codec_args());
        cmd.arg("-c:a")
            .arg("copy")
            .arg("-movflags")
            .arg("+faststart")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// Transcode `video` in place. Returns the encoder used, or None if the raw file was kept.
    pub async fn transcode_in_place(&self, video: &Path) -> Option<Encoder> {
        let tmp = video.with_extension("h264.mp4");

        for encoder in self.encoders() {
            debug!("Transcoding {} with {:?}", video.display(), encoder);
            let output = match self.command(encoder, video, &tmp).output().await {
                Ok(o) => o,
                Err(e) => {
                    warn!("ffmpeg not available ({}): {}, keeping original video", self.ffmpeg.display(), e);
                    return None;
                }
            };

            if output.status.success() {
                if let Err(e) = tokio::fs::rename(&tmp, video).await {
                    warn!("Could not replace {} with transcoded file: {}", video.display(), e);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return None;
                }
                info!("Transcoded {} to H.264 ({:?})", video.display(), encoder);
                return Some(encoder);
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "{:?} transcode failed ({}): {}",
                encoder,
                output.status,
                stderr.lines().last().unwrap_or("")
            );
        }

        let _ = tokio::fs::remove_file(&tmp).await;
        warn!("All encoders failed, serving original {}", video.display());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn gpu_first_when_enabled() {
        let t = Transcoder { ffmpeg: "ffmpeg".into(), hwaccel: true };
        assert_eq!(t.encoders(), vec![Encoder::Nvenc, Encoder::X264]);
        let t = Transcoder { ffmpeg: "ffmpeg".into(), hwaccel: false };
        assert_eq!(t.encoders(), vec![Encoder::X264]);
    }

    #[test]
    fn command_lines() {
        let t = Transcoder { ffmpeg: "ffmpeg".into(), hwaccel: true };
        let gpu = args(&t.command(Encoder::Nvenc, Path::new("in.mp4"), Path::new("out.mp4")));
        assert!(gpu.windows(2).any(|w| w == ["-hwaccel", "cuda"]));
        assert!(gpu.windows(2).any(|w| w == ["-c:v", "h264_nvenc"]));
        assert!(gpu.windows(2).any(|w| w == ["-movflags", "+faststart"]));

        let cpu = args(&t.command(Encoder::X264, Path::new("in.mp4"), Path::new("out.mp4")));
        assert!(!cpu.contains(&"-hwaccel".to_string()));
        assert!(cpu.windows(2).any(|w| w == ["-crf", "23"]));
        assert_eq!(cpu.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn disabled_by_config() {
        let cfg = MediaConfig { transcode: false, ..MediaConfig::default() };
        assert!(Transcoder::from_config(&cfg).is_none());
    }

    #[tokio::test]
    async fn missing_ffmpeg_keeps_original() {
        let tmp = tempfile::TempDir::new().unwrap();
        let video = tmp.path().join("video.mp4");
        std::fs::write(&video, b"raw").unwrap();
        let t = Transcoder { ffmpeg: tmp.path().join("no-such-ffmpeg"), hwaccel: false };
        assert_eq!(t.transcode_in_place(&video).await, None);
        assert_eq!(std::fs::read(&video).unwrap(), b"raw");
    }
}
