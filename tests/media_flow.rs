mod common;

use std::sync::Arc;

use common::{media_config, rows, FakeBucket, FRAME_2, VIDEO};
use cv_trace_dashboard::error::DashboardError;
use cv_trace_dashboard::media::{MediaService, GIF_FILE, VIDEO_FILE};

#[tokio::test]
async fn bundle_has_gif_and_video() {
    let tmp = tempfile::TempDir::new().unwrap();
    let bucket = FakeBucket::with_event_media();
    let media = MediaService::new(bucket.clone(), &media_config(tmp.path(), 20)).unwrap();

    let row = &rows()[0];
    let bundle = media.fetch_media(row).await.unwrap();

    assert_eq!(bundle.key, row.media_key());
    assert_eq!(bundle.frame_count, 2);
    assert!(bundle.notices.is_empty(), "unexpected notices: {:?}", bundle.notices);
    assert!(bundle.dir.join(GIF_FILE).exists());
    assert!(bundle.dir.join(VIDEO_FILE).exists());
    assert_eq!(bundle.gif_relative(), Some(format!("{}/{}", row.media_key(), GIF_FILE)));
    assert_eq!(bucket.fetches(), 3);
    assert_eq!(media.pinned(), Some(row.media_key()));

    let gif = image::open(bundle.dir.join(GIF_FILE)).unwrap();
    assert_eq!((gif.width(), gif.height()), (64, 48));
}

#[tokio::test]
async fn second_fetch_reuses_the_bundle() {
    let tmp = tempfile::TempDir::new().unwrap();
    let bucket = FakeBucket::with_event_media();
    let media = MediaService::new(bucket.clone(), &media_config(tmp.path(), 20)).unwrap();
    let row = &rows()[0];

    let first = media.fetch_media(row).await.unwrap();
    let downloads = bucket.fetches();
    let second = media.fetch_media(row).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(bucket.fetches(), downloads);
}

#[tokio::test]
async fn missing_video_degrades_to_gif_only() {
    let tmp = tempfile::TempDir::new().unwrap();
    let media = MediaService::new(FakeBucket::with_event_media(), &media_config(tmp.path(), 20)).unwrap();

    let bundle = media.fetch_media(&rows()[1]).await.unwrap();
    assert!(bundle.gif_path.is_some());
    assert!(bundle.video_path.is_none());
    assert_eq!(bundle.notices, vec!["video unavailable".to_string()]);
}

#[tokio::test]
async fn failed_video_download_is_retried() {
    let tmp = tempfile::TempDir::new().unwrap();
    let bucket = FakeBucket::with_event_media();
    bucket.fail_once(VIDEO);
    let media = MediaService::new(bucket.clone(), &media_config(tmp.path(), 20)).unwrap();
    let row = &rows()[0];

    let first = media.fetch_media(row).await.unwrap();
    assert!(first.video_path.is_none());
    assert!(first.retryable);
    assert_eq!(first.notices, vec!["video failed to download".to_string()]);
    assert!(!first.dir.join("bundle.json").exists());

    let second = media.fetch_media(row).await.unwrap();
    assert!(second.video_path.is_some());
    assert!(second.notices.is_empty(), "unexpected notices: {:?}", second.notices);
    assert!(!second.retryable);
    assert!(second.dir.join("bundle.json").exists());
}

#[tokio::test]
async fn failed_frame_download_is_reported_and_retried() {
    let tmp = tempfile::TempDir::new().unwrap();
    let bucket = FakeBucket::with_event_media();
    bucket.fail_once(FRAME_2);
    let media = MediaService::new(bucket.clone(), &media_config(tmp.path(), 20)).unwrap();
    let row = &rows()[0];

    let first = media.fetch_media(row).await.unwrap();
    assert_eq!(first.frame_count, 1);
    assert_eq!(first.notices, vec!["1 of 2 frames failed to download".to_string()]);

    let second = media.fetch_media(row).await.unwrap();
    assert_eq!(second.frame_count, 2);
    assert!(second.notices.is_empty());
}

#[tokio::test]
async fn row_without_stage2_has_no_video_notice() {
    let tmp = tempfile::TempDir::new().unwrap();
    let media = MediaService::new(FakeBucket::with_event_media(), &media_config(tmp.path(), 20)).unwrap();

    let bundle = media.fetch_media(&rows()[2]).await.unwrap();
    assert!(bundle.gif_path.is_some());
    assert!(bundle.video_path.is_none());
    assert!(bundle.notices.is_empty());
}

#[tokio::test]
async fn nothing_found_is_media_not_found() {
    let tmp = tempfile::TempDir::new().unwrap();
    let media = MediaService::new(FakeBucket::new(), &media_config(tmp.path(), 20)).unwrap();
    let row = &rows()[1];

    let err = media.fetch_media(row).await.unwrap_err();
    assert!(matches!(err, DashboardError::MediaNotFound(_)), "got {:?}", err);
    assert!(!tmp.path().join(row.media_key()).exists());
}

#[tokio::test]
async fn eviction_keeps_the_pinned_bundle() {
    let tmp = tempfile::TempDir::new().unwrap();
    let media = MediaService::new(FakeBucket::with_event_media(), &media_config(tmp.path(), 1)).unwrap();
    let all = rows();

    media.fetch_media(&all[0]).await.unwrap();
    media.fetch_media(&all[2]).await.unwrap();

    assert!(!tmp.path().join(all[0].media_key()).exists());
    assert!(tmp.path().join(all[2].media_key()).exists());
    assert_eq!(media.pinned(), Some(all[2].media_key()));
}

#[tokio::test]
async fn pinned_bundle_survives_byte_limit() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut cfg = media_config(tmp.path(), 20);
    cfg.max_bytes = 1;
    let media = MediaService::new(FakeBucket::with_event_media(), &cfg).unwrap();

    let bundle = media.fetch_media(&rows()[0]).await.unwrap();
    assert!(bundle.dir.join(GIF_FILE).exists());
}

#[tokio::test]
async fn purge_empties_the_cache() {
    let tmp = tempfile::TempDir::new().unwrap();
    let media = Arc::new(MediaService::new(FakeBucket::with_event_media(), &media_config(tmp.path(), 20)).unwrap());
    let all = rows();
    media.fetch_media(&all[0]).await.unwrap();
    media.fetch_media(&all[2]).await.unwrap();

    assert_eq!(media.purge().await.unwrap(), 2);
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}
