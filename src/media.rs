//! Row media: frames assembled into an animated GIF plus the Stage 2 video.
//!
//! Bundles live in `<root>/<media key>/` next to a `bundle.json` manifest.
//! A manifest on disk means the bundle is settled and is returned as-is.
//! Bundles degraded by a failed download get no manifest and are rebuilt.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::FilterType;
use image::{Delay, Frame, RgbaImage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cleanup::{CacheJanitor, CacheLimits};
use crate::config::MediaConfig;
use crate::error::{DashboardError, Result};
use crate::inference::InferenceRow;
use crate::storage::{ObjectFetcher, ObjectUri};
use crate::transcode::Transcoder;

pub const GIF_FILE: &str = "frames.gif";
pub const VIDEO_FILE: &str = "video.mp4";
const MANIFEST_FILE: &str = "bundle.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaBundle {
    pub key: String,
    pub dir: PathBuf,
    pub gif_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
    /// Frames that made it into the GIF
    pub frame_count: usize,
    pub notices: Vec<String>,
    /// A download failed for a reason other than a missing object.
    #[serde(skip)]
    pub retryable: bool,
}

impl MediaBundle {
    /// Path of the GIF relative to the media root, for URLs.
    pub fn gif_relative(&self) -> Option<String> {
        self.gif_path.as_ref().map(|_| format!("{}/{}", self.key, GIF_FILE))
    }

    pub fn video_relative(&self) -> Option<String> {
        self.video_path.as_ref().map(|_| format!("{}/{}", self.key, VIDEO_FILE))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GifSettings {
    pub fps: u32,
    pub max_width: u32,
}

impl GifSettings {
    pub fn frame_delay_ms(&self) -> u32 {
        1000 / self.fps.max(1)
    }
}

pub struct MediaService {
    fetcher: Arc<dyn ObjectFetcher>,
    root: PathBuf,
    janitor: Arc<CacheJanitor>,
    gif: GifSettings,
    transcoder: Option<Transcoder>,
    fetch_lock: Mutex<()>,
    pinned: StdMutex<Option<String>>,
    // Removed on drop when the root is process-scoped
    _scratch: Option<TempDir>,
}

impl MediaService {
    pub fn new(fetcher: Arc<dyn ObjectFetcher>, cfg: &MediaConfig) -> Result<Self> {
        let (root, scratch) = match cfg.root.as_deref().filter(|r| !r.trim().is_empty()) {
            Some(root) => {
                let root = PathBuf::from(root);
                std::fs::create_dir_all(&root)?;
                (root, None)
            }
            None => {
                let dir = tempfile::Builder::new().prefix("cv-trace-media-").tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        info!("Media cache at {}", root.display());

        let limits = CacheLimits { max_entries: cfg.max_bundles, max_bytes: cfg.max_bytes };
        Ok(Self {
            fetcher,
            janitor: Arc::new(CacheJanitor::new(&root, limits)),
            root,
            gif: GifSettings { fps: cfg.gif_fps.max(1), max_width: cfg.gif_max_width.max(16) },
            transcoder: Transcoder::from_config(cfg),
            fetch_lock: Mutex::new(()),
            pinned: StdMutex::new(None),
            _scratch: scratch,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key of the bundle backing the current selection.
    pub fn pinned(&self) -> Option<String> {
        self.pinned.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pin(&self, key: &str) {
        *self.pinned.lock().unwrap_or_else(|e| e.into_inner()) = Some(key.to_string());
    }

    /// Fetch or reuse the media bundle for `row`.
    pub async fn fetch_media(&self, row: &InferenceRow) -> Result<MediaBundle> {
        let _guard = self.fetch_lock.lock().await;
        let key = row.media_key();
        let dir = self.root.join(&key);

        let bundle = match load_manifest(&dir).await {
            Some(bundle) => {
                debug!("Reusing media bundle {}", key);
                bundle
            }
            None => self.build_bundle(row, &key, &dir).await?,
        };

        self.janitor.touch(&key);
        self.pin(&key);
        self.sweep(&key).await;
        Ok(bundle)
    }

    /// Remove every cached bundle.
    pub async fn purge(&self) -> Result<usize> {
        let janitor = Arc::clone(&self.janitor);
        tokio::task::spawn_blocking(move || janitor.purge())
            .await
            .map_err(|e| DashboardError::Media(format!("purge task failed: {}", e)))?
    }

    async fn sweep(&self, pinned: &str) {
        let janitor = Arc::clone(&self.janitor);
        let pinned = pinned.to_string();
        match tokio::task::spawn_blocking(move || janitor.sweep(Some(&pinned))).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Media cache sweep failed: {}", e),
            Err(e) => warn!("Media cache sweep task failed: {}", e),
        }
    }

    async fn build_bundle(&self, row: &InferenceRow, key: &str, dir: &Path) -> Result<MediaBundle> {
        let frame_uris = frame_sequence(&row.stage1.frame_uris);
        let video_uri = row.video_uri();
        if frame_uris.is_empty() && video_uri.is_none() {
            return Err(DashboardError::MediaNotFound(format!("row {} references no media", key)));
        }

        tokio::fs::create_dir_all(dir).await?;
        let mut notices = Vec::new();
        let mut first_error: Option<DashboardError> = None;
        let mut missing = 0usize;
        let mut failed = 0usize;

        let mut frames: Vec<Bytes> = Vec::with_capacity(frame_uris.len());
        for (i, raw) in frame_uris.iter().enumerate() {
            match self.download(raw).await {
                Ok(bytes) => {
                    let name = format!("frame_{:03}.{}", i, extension_of(raw, "jpg"));
                    tokio::fs::write(dir.join(name), &bytes).await?;
                    frames.push(bytes);
                }
                Err(DashboardError::MediaNotFound(uri)) => {
                    debug!("Frame missing: {}", uri);
                    missing += 1;
                }
                Err(e) => {
                    warn!("Failed to download frame {}: {}", raw, e);
                    failed += 1;
                    first_error = first_error.or(Some(e));
                }
            }
        }
        let downloaded = frames.len();
        info!("Downloaded {}/{} frames for {}", downloaded, frame_uris.len(), key);
        if missing > 0 {
            notices.push(format!("{} of {} frames unavailable", missing, frame_uris.len()));
        }
        if failed > 0 {
            notices.push(format!("{} of {} frames failed to download", failed, frame_uris.len()));
        }

        let (gif_path, frame_count) = if frames.is_empty() {
            if !frame_uris.is_empty() {
                notices.push("frames unavailable".to_string());
            }
            (None, 0)
        } else {
            let gif_path = dir.join(GIF_FILE);
            let settings = self.gif;
            let target = gif_path.clone();
            let encoded = tokio::task::spawn_blocking(move || assemble_gif(&frames, settings, &target))
                .await
                .map_err(|e| DashboardError::Media(format!("GIF task failed: {}", e)))?;
            match encoded {
                Ok(0) => {
                    notices.push("frames could not be decoded".to_string());
                    (None, 0)
                }
                Ok(n) => (Some(gif_path), n),
                Err(e) => {
                    warn!("GIF assembly failed for {}: {}", key, e);
                    notices.push("animation unavailable".to_string());
                    (None, 0)
                }
            }
        };

        let video_path = match video_uri {
            None => None,
            Some(raw) => match self.download(raw).await {
                Ok(bytes) => {
                    let path = dir.join(VIDEO_FILE);
                    tokio::fs::write(&path, &bytes).await?;
                    info!("Downloaded video for {} ({} bytes)", key, bytes.len());
                    if let Some(t) = &self.transcoder {
                        t.transcode_in_place(&path).await;
                    }
                    Some(path)
                }
                Err(DashboardError::MediaNotFound(uri)) => {
                    debug!("Video missing: {}", uri);
                    notices.push("video unavailable".to_string());
                    None
                }
                Err(e) => {
                    warn!("Failed to download video {}: {}", raw, e);
                    notices.push("video failed to download".to_string());
                    first_error = first_error.or(Some(e));
                    None
                }
            },
        };

        if downloaded == 0 && video_path.is_none() {
            let _ = tokio::fs::remove_dir_all(dir).await;
            return Err(match first_error {
                Some(e) => e,
                None => DashboardError::MediaNotFound(format!("no media objects found for {}", key)),
            });
        }

        let bundle = MediaBundle {
            key: key.to_string(),
            dir: dir.to_path_buf(),
            gif_path,
            video_path,
            frame_count,
            notices,
            retryable: first_error.is_some(),
        };
        // Only absent objects may be recorded; anything else is retried next time
        match first_error {
            None => save_manifest(dir, &bundle).await?,
            Some(e) => info!("Media bundle {} is partial ({}), not cached", key, e),
        }
        Ok(bundle)
    }

    async fn download(&self, raw: &str) -> Result<Bytes> {
        let uri = ObjectUri::parse(raw)?;
        self.fetcher.fetch(&uri).await
    }
}

/// Frame URIs ordered by the sequence number embedded in the file name:
/// the last run of digits in the file stem. Stable, so ties keep their order.
pub fn frame_sequence(uris: &[String]) -> Vec<String> {
    static DIGITS: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    let digits = DIGITS.get_or_init(|| Regex::new(r"\d+").ok());

    let seq = |uri: &str| -> Option<u64> {
        let name = uri.rsplit('/').next().unwrap_or(uri);
        let stem = name.rsplit_once('.').map_or(name, |(s, _)| s);
        digits.as_ref()?.find_iter(stem).last()?.as_str().parse().ok()
    };

    let mut ordered: Vec<String> = uris.iter().filter(|u| !u.trim().is_empty()).cloned().collect();
    ordered.sort_by_key(|u| seq(u));
    ordered
}

fn extension_of<'a>(uri: &'a str, fallback: &'a str) -> &'a str {
    let name = uri.rsplit('/').next().unwrap_or(uri);
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 => ext,
        _ => fallback,
    }
}

/// Decode, normalize and encode frames. Returns how many frames were encoded.
fn assemble_gif(frames: &[Bytes], settings: GifSettings, target: &Path) -> Result<usize> {
    let mut decoded: Vec<RgbaImage> = Vec::with_capacity(frames.len());
    for (i, bytes) in frames.iter().enumerate() {
        match image::load_from_memory(bytes) {
            Ok(img) => decoded.push(img.to_rgba8()),
            Err(e) => warn!("Skipping undecodable frame {}: {}", i, e),
        }
    }
    let Some(first) = decoded.first() else {
        return Ok(0);
    };

    let (w0, h0) = first.dimensions();
    let (width, height) = if w0 > settings.max_width {
        let h = (u64::from(h0) * u64::from(settings.max_width) / u64::from(w0)).max(1) as u32;
        (settings.max_width, h)
    } else {
        (w0, h0)
    };

    let mut buf: Vec<u8> = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        encoder.set_repeat(Repeat::Infinite)?;
        for img in &decoded {
            let img = if img.dimensions() == (width, height) {
                img.clone()
            } else {
                image::imageops::resize(img, width, height, FilterType::Triangle)
            };
            let delay = Delay::from_numer_denom_ms(settings.frame_delay_ms(), 1);
            encoder.encode_frame(Frame::from_parts(img, 0, 0, delay))?;
        }
    }
    std::fs::write(target, &buf)?;
    debug!("Encoded {} frames ({}x{}) to {}", decoded.len(), width, height, target.display());
    Ok(decoded.len())
}

async fn load_manifest(dir: &Path) -> Option<MediaBundle> {
    let raw = tokio::fs::read(dir.join(MANIFEST_FILE)).await.ok()?;
    let bundle: MediaBundle = serde_json::from_slice(&raw).ok()?;
    let intact = bundle.gif_path.as_ref().map_or(true, |p| p.exists())
        && bundle.video_path.as_ref().map_or(true, |p| p.exists());
    intact.then_some(bundle)
}

async fn save_manifest(dir: &Path, bundle: &MediaBundle) -> Result<()> {
    let raw = serde_json::to_vec_pretty(bundle)
        .map_err(|e| DashboardError::Media(format!("cannot serialize bundle manifest: {}", e)))?;
    tokio::fs::write(dir.join(MANIFEST_FILE), raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    fn png(width: u32, height: u32, shade: u8) -> Bytes {
        let img = RgbaImage::from_pixel(width, height, Rgba([shade, shade, shade, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        Bytes::from(out.into_inner())
    }

    #[test]
    fn frames_ordered_by_embedded_sequence() {
        let uris: Vec<String> = [
            "gs://b/f/042_0000015_2024-01-15T08:30:12_10.jpg",
            "gs://b/f/042_0000015_2024-01-15T08:30:12_2.jpg",
            "gs://b/f/042_0000015_2024-01-15T08:30:12_1.jpg",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let ordered = frame_sequence(&uris);
        assert!(ordered[0].ends_with("_1.jpg"));
        assert!(ordered[1].ends_with("_2.jpg"));
        assert!(ordered[2].ends_with("_10.jpg"));
    }

    #[test]
    fn unnumbered_frames_keep_relative_order() {
        let uris = vec!["gs://b/x.jpg".to_string(), "gs://b/a.jpg".to_string(), "".to_string()];
        assert_eq!(frame_sequence(&uris), vec!["gs://b/x.jpg", "gs://b/a.jpg"]);
    }

    #[test]
    fn gif_is_resized_to_max_width() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join(GIF_FILE);
        let frames = vec![png(200, 100, 10), png(100, 100, 200), Bytes::from_static(b"not an image")];
        let n = assemble_gif(&frames, GifSettings { fps: 3, max_width: 100 }, &target).unwrap();
        assert_eq!(n, 2);

        let gif = image::open(&target).unwrap();
        assert_eq!((gif.width(), gif.height()), (100, 50));
    }

    #[test]
    fn frame_delay_from_fps() {
        assert_eq!(GifSettings { fps: 3, max_width: 640 }.frame_delay_ms(), 333);
        assert_eq!(GifSettings { fps: 0, max_width: 640 }.frame_delay_ms(), 1000);
    }

    #[test]
    fn extension_fallback() {
        assert_eq!(extension_of("gs://b/a/frame.png", "jpg"), "png");
        assert_eq!(extension_of("gs://b/a/frame", "jpg"), "jpg");
    }
}
