use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};
use tower::ServiceExt;
use tubepipe::{
    classify::BOT_DETECTION_MESSAGE,
    config::{RateLimitSettings, RuntimeConfig, ToolSettings},
    rate_limit::REJECTION_MESSAGE,
    server,
};

const BODY_LIMIT: usize = 1 << 20;

/// Fake yt-dlp whose behaviour is picked by the `v=` id of the URL. Every
/// invocation is appended to `calls.log` next to the script.
const STUB: &str = r#"#!/bin/sh
dir=$(dirname "$0")
url="$1"
case " $* " in
  *" --dump-json "*)
    echo "probe $url" >> "$dir/calls.log"
    case "$url" in
      *v=botprobe*)
        echo "ERROR: [youtube] botprobe: Sign in to confirm you’re not a bot. Use --cookies" >&2
        exit 1 ;;
      *v=gone*)
        echo "ERROR: [youtube] gone: Video unavailable" >&2
        exit 1 ;;
    esac
    echo '{"id":"abc","title":"Köy Türküsü #1 (Live)!!"}'
    exit 0 ;;
esac
echo "stream $url" >> "$dir/calls.log"
case "$url" in
  *v=midfail*)
    printf '0123456789'
    echo "ERROR: fragment 3 not found" >&2
    exit 1 ;;
  *v=early*)
    echo "ERROR: Requested format is not available" >&2
    exit 1 ;;
  *v=slow*)
    sleep 1
    printf 'slow-body' ;;
  *)
    shift
    printf '%s\n' "$@" ;;
esac
"#;

fn install_stub(dir: &Path) -> PathBuf {
    let script_path = dir.join("yt-dlp");
    fs::write(&script_path, STUB).unwrap();
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
    }
    script_path
}

fn test_config(dir: &Path, rate_limit: Option<u32>) -> RuntimeConfig {
    RuntimeConfig {
        public_dir: dir.to_path_buf(),
        tool: ToolSettings {
            program: install_stub(dir),
            probe_timeout: Duration::from_secs(10),
            chunk_size: 4096,
            kill_grace: Duration::from_millis(500),
            ..ToolSettings::default()
        },
        rate_limit: RateLimitSettings {
            enabled: rate_limit.is_some(),
            max_requests: rate_limit.unwrap_or(1),
            window: Duration::from_secs(900),
        },
        ..RuntimeConfig::default()
    }
}

fn app() -> (TempDir, Router) {
    let dir = tempdir().unwrap();
    let router = server::router(&test_config(dir.path(), None));
    (dir, router)
}

fn download_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/download")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, body: Value) -> Response {
    app.clone().oneshot(download_request(body)).await.unwrap()
}

async fn json_error(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    value["error"].as_str().unwrap().to_owned()
}

fn calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("calls.log"))
        .map(|log| log.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn mp3_download_streams_with_headers() {
    let (dir, app) = app();
    let response = send(
        &app,
        json!({"url": "https://www.youtube.com/watch?v=ok", "format": "mp3", "quality": "320kbps"}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"Ky-Trks-1-Live.mp3\""
    );

    let body = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    let args: Vec<&str> = std::str::from_utf8(&body).unwrap().lines().collect();
    assert_eq!(
        args,
        [
            "-o",
            "-",
            "--no-warnings",
            "--no-progress",
            "-x",
            "--audio-format",
            "mp3",
            "--audio-quality",
            "0"
        ]
    );

    let log = calls(dir.path());
    assert_eq!(log.len(), 2);
    assert!(log[0].starts_with("probe "));
    assert!(log[1].starts_with("stream "));
}

#[tokio::test]
async fn mp4_download_uses_height_bounded_selector() {
    let (_dir, app) = app();
    let response = send(
        &app,
        json!({"url": "https://youtu.be/ok", "format": "mp4", "quality": "1080p"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");

    let body = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains(
        "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]/best"
    ));
}

#[tokio::test]
async fn empty_url_is_rejected_without_spawning() {
    let (dir, app) = app();
    let response = send(&app, json!({"url": "", "format": "mp3", "quality": "320kbps"})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!json_error(response).await.is_empty());
    assert!(calls(dir.path()).is_empty());
}

#[tokio::test]
async fn unsupported_container_is_rejected() {
    let (dir, app) = app();
    let response = send(
        &app,
        json!({"url": "https://youtu.be/ok", "format": "avi", "quality": "720p"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_error(response).await.contains("Unsupported format"));
    assert!(calls(dir.path()).is_empty());
}

#[tokio::test]
async fn bot_challenge_during_probe_is_500_with_retry_message() {
    let (dir, app) = app();
    let response = send(
        &app,
        json!({"url": "https://www.youtube.com/watch?v=botprobe", "format": "mp4", "quality": "720p"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_error(response).await, BOT_DETECTION_MESSAGE);
    // The stream phase never starts after a failed probe.
    assert_eq!(calls(dir.path()).len(), 1);
}

#[tokio::test]
async fn unavailable_video_is_probe_failure() {
    let (_dir, app) = app();
    let response = send(
        &app,
        json!({"url": "https://www.youtube.com/watch?v=gone", "format": "mp3", "quality": ""}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let message = json_error(response).await;
    assert!(message.contains("code: 1"));
    assert!(message.contains("Video unavailable"));
}

#[tokio::test]
async fn failure_before_first_byte_is_json() {
    let (_dir, app) = app();
    let response = send(
        &app,
        json!({"url": "https://www.youtube.com/watch?v=early", "format": "mp4", "quality": "4k"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        json_error(response)
            .await
            .contains("Requested format is not available")
    );
}

#[tokio::test]
async fn failure_mid_stream_aborts_body() {
    let (_dir, app) = app();
    let response = send(
        &app,
        json!({"url": "https://www.youtube.com/watch?v=midfail", "format": "mp4", "quality": "720p"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut received = Vec::new();
    let mut aborted = false;
    let mut stream = response.into_body().into_data_stream();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => received.extend_from_slice(&chunk),
            Err(_) => {
                aborted = true;
                break;
            }
        }
    }
    assert_eq!(received, b"0123456789");
    assert!(aborted, "body completed normally despite yt-dlp failing");
}

#[tokio::test]
async fn concurrent_requests_are_independent() {
    let (_dir, app) = app();
    let started = Instant::now();

    let slow = async {
        let response = send(
            &app,
            json!({"url": "https://www.youtube.com/watch?v=slow", "format": "mp3", "quality": "64kbps"}),
        )
        .await;
        let body = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
        (body, started.elapsed())
    };
    let fast = async {
        let response = send(
            &app,
            json!({"url": "https://www.youtube.com/watch?v=fast", "format": "mp3", "quality": "64kbps"}),
        )
        .await;
        let body = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
        (body, started.elapsed())
    };

    let ((slow_body, slow_elapsed), (fast_body, fast_elapsed)) = tokio::join!(slow, fast);
    assert_eq!(&slow_body[..], b"slow-body");
    assert!(String::from_utf8_lossy(&fast_body).contains("--audio-quality\n7"));
    assert!(fast_elapsed < slow_elapsed);
}

#[tokio::test]
async fn rate_limit_rejects_excess_requests() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("index.html"), "<h1>tubepipe</h1>").unwrap();
    let app = server::router(&test_config(dir.path(), Some(2)));

    let get = || Request::builder().uri("/").body(Body::empty()).unwrap();
    for _ in 0..2 {
        let response = app.clone().oneshot(get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(get()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&body[..], REJECTION_MESSAGE.as_bytes());
}

#[tokio::test]
async fn static_assets_are_served() {
    let (dir, app) = app();
    fs::write(dir.path().join("index.html"), "<h1>tubepipe</h1>").unwrap();
    fs::write(dir.path().join("script.js"), "console.log(1);").unwrap();

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/script.js").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&body[..], b"console.log(1);");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/../Cargo.toml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
