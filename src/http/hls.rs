//! HLS delivery handlers
//!
//! A single wildcard route serves the artifact tree so path safety lives
//! in one place: the request path is classified component-by-component
//! against the three shapes that exist (`<key>/master.m3u8`,
//! `<key>/<N>/playlist.m3u8`, `<key>/<N>/segment_<SSS>.ts`). Anything
//! with traversal components is a 400; anything else off-shape is a 404.
//! Playlists are cached for seconds, segments for minutes, and segment
//! requests honor single byte ranges.

use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use super::AppState;
use crate::registry::StreamKey;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
const PLAYLIST_CACHE_CONTROL: &str = "max-age=5, no-cache";
const SEGMENT_CACHE_CONTROL: &str = "public, max-age=120";

/// How long to wait before the second read of a playlist the transcoder
/// may be mid-rotate on
const PLAYLIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// `OPTIONS` on any HLS path: 204, headers come from the CORS middleware
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// `GET`/`HEAD` on any HLS path
pub async fn serve(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request = match classify(&path) {
        Ok(request) => request,
        Err(status) => return status.into_response(),
    };

    match request {
        HlsRequest::MasterPlaylist { key } => {
            let file = state.store.master_playlist_path(&key);
            serve_playlist(&state, &key, file).await
        }
        HlsRequest::RungPlaylist { key, rung } => {
            let file = state.store.rung_playlist_path(&key, rung);
            serve_playlist(&state, &key, file).await
        }
        HlsRequest::Segment { key, rung, name } => {
            let file = state.store.rung_dir(&key, rung).join(name);
            serve_segment(file, &headers).await
        }
    }
}

enum HlsRequest {
    MasterPlaylist { key: StreamKey },
    RungPlaylist { key: StreamKey, rung: usize },
    Segment {
        key: StreamKey,
        rung: usize,
        name: String,
    },
}

/// Map a request path onto the artifact layout.
///
/// `Err(400)` for anything that tries to walk out of the root,
/// `Err(404)` for shapes that cannot exist in the layout.
fn classify(path: &str) -> Result<HlsRequest, StatusCode> {
    let components: Vec<&str> = path.split('/').collect();

    // Traversal guard first: dot-segments or empty components mean the
    // normalized path is not a plain descendant of the root
    if components
        .iter()
        .any(|c| c.is_empty() || *c == "." || *c == ".." || c.contains('\\'))
    {
        return Err(StatusCode::BAD_REQUEST);
    }

    match components.as_slice() {
        [key, "master.m3u8"] => {
            let key = StreamKey::parse(key).map_err(|_| StatusCode::NOT_FOUND)?;
            Ok(HlsRequest::MasterPlaylist { key })
        }
        [key, rung, "playlist.m3u8"] => {
            let key = StreamKey::parse(key).map_err(|_| StatusCode::NOT_FOUND)?;
            let rung = parse_rung(rung)?;
            Ok(HlsRequest::RungPlaylist { key, rung })
        }
        [key, rung, segment] if is_segment_name(segment) => {
            let key = StreamKey::parse(key).map_err(|_| StatusCode::NOT_FOUND)?;
            let rung = parse_rung(rung)?;
            Ok(HlsRequest::Segment {
                key,
                rung,
                name: (*segment).to_string(),
            })
        }
        _ => Err(StatusCode::NOT_FOUND),
    }
}

fn parse_rung(raw: &str) -> Result<usize, StatusCode> {
    if raw.is_empty() || raw.len() > 3 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StatusCode::NOT_FOUND);
    }
    raw.parse().map_err(|_| StatusCode::NOT_FOUND)
}

/// `segment_<digits>.ts`, nothing else
fn is_segment_name(name: &str) -> bool {
    let Some(stem) = name.strip_prefix("segment_") else {
        return false;
    };
    let Some(index) = stem.strip_suffix(".ts") else {
        return false;
    };
    !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
}

/// Serve a playlist with the short-cache policy.
///
/// The transcoder rewrites playlists in place on every segment rotation;
/// a read can catch a just-truncated or just-renamed file, so a missing
/// or empty read gets one retry while the stream directory still exists.
async fn serve_playlist(state: &AppState, key: &StreamKey, file: PathBuf) -> Response {
    let mut contents = tokio::fs::read(&file).await.ok().filter(|c| !c.is_empty());

    if contents.is_none() {
        if !state.store.stream_dir(key).is_dir() {
            return StatusCode::NOT_FOUND.into_response();
        }
        tokio::time::sleep(PLAYLIST_RETRY_DELAY).await;
        contents = tokio::fs::read(&file).await.ok().filter(|c| !c.is_empty());
    }

    match contents {
        Some(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
            .header(header::CACHE_CONTROL, PLAYLIST_CACHE_CONTROL)
            .header(header::CONTENT_LENGTH, body.len().to_string())
            .body(Body::from(body))
            .expect("playlist response"),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve a segment with the long-cache policy and byte-range support
async fn serve_segment(file: PathBuf, headers: &HeaderMap) -> Response {
    let Ok(mut segment) = tokio::fs::File::open(&file).await else {
        // Rotated away or never produced
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(metadata) = segment.metadata().await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let file_size = metadata.len();

    if let Some(range) = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range_header(value, file_size))
    {
        if segment
            .seek(std::io::SeekFrom::Start(range.start))
            .await
            .is_err()
        {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        let content_length = range.end - range.start + 1;
        let stream = ReaderStream::new(segment.take(content_length));

        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
            .header(header::CACHE_CONTROL, SEGMENT_CACHE_CONTROL)
            .header(header::CONTENT_LENGTH, content_length.to_string())
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, file_size),
            )
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from_stream(stream))
            .expect("segment range response");
    }

    let stream = ReaderStream::new(segment);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, SEGMENT_CACHE_CONTROL)
        .header(header::CONTENT_LENGTH, file_size.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::from_stream(stream))
        .expect("segment response")
}

#[derive(Debug, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

/// Parse a single-range `Range` header; `None` falls back to a full 200
fn parse_range_header(range_str: &str, file_size: u64) -> Option<ByteRange> {
    let range_part = range_str.strip_prefix("bytes=")?;
    let (start_str, end_str) = range_part.split_once('-')?;

    let start = if start_str.is_empty() {
        // Suffix form: bytes=-N, the last N bytes
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some(ByteRange {
            start: file_size.saturating_sub(suffix_len),
            end: file_size.checked_sub(1)?,
        });
    } else {
        start_str.parse().ok()?
    };

    let end = if end_str.is_empty() {
        file_size.checked_sub(1)?
    } else {
        std::cmp::min(end_str.parse().ok()?, file_size.checked_sub(1)?)
    };

    if start <= end && start < file_size {
        Some(ByteRange { start, end })
    } else {
        None
    }
}
