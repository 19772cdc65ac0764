use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::{
    compression::{
        CompressionLayer,
        predicate::{DefaultPredicate, NotForContentType, Predicate},
    },
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    cache::{Cache, get_json, set_json},
    config::Config,
    error::{AppError, AppResult},
    format::{SelectionRequest, download_format_string, quality_label},
    selector::{available_heights, select, select_audio},
    stats,
    yt_dlp::{Extractor, FormatRecord, MediaInfo, PlaylistInfo},
};

#[derive(Clone)]
pub struct AppState {
    extractor: Arc<dyn Extractor>,
    cache: Arc<dyn Cache>,
    cache_ttl: Duration,
    cpu_limit: Option<f32>,
    playlist_limit: usize,
    http: reqwest::Client,
    started: Instant,
}

impl AppState {
    pub fn new(config: &Config, extractor: Arc<dyn Extractor>, cache: Arc<dyn Cache>) -> Self {
        Self {
            extractor,
            cache,
            cache_ttl: config.cache_ttl(),
            cpu_limit: config.cpu_limit(),
            playlist_limit: config.playlist_limit.max(1),
            http: reqwest::Client::new(),
            started: Instant::now(),
        }
    }

    async fn media_info(&self, url: &str) -> AppResult<MediaInfo> {
        let key = format!("media:{url}");
        if let Some(info) = get_json::<MediaInfo>(self.cache.as_ref(), &key) {
            return Ok(info);
        }
        let info = self.extractor.media_info(url).await?;
        set_json(self.cache.as_ref(), &key, &info, self.cache_ttl);
        Ok(info)
    }

    async fn playlist(&self, url: &str, limit: usize) -> AppResult<PlaylistInfo> {
        let key = format!("playlist:{limit}:{url}");
        if let Some(playlist) = get_json::<PlaylistInfo>(self.cache.as_ref(), &key) {
            return Ok(playlist);
        }
        let playlist = self.extractor.playlist(url, Some(limit)).await?;
        set_json(self.cache.as_ref(), &key, &playlist, self.cache_ttl);
        Ok(playlist)
    }
}

const ENDPOINTS: [&str; 9] = [
    "/",
    "/ping",
    "/stats",
    "/status",
    "/audio",
    "/video",
    "/video/qualities",
    "/playlist",
    "/download",
];

pub fn router(state: AppState) -> Router {
    // media bodies are already compressed and must keep their byte ranges
    let compress = DefaultPredicate::new()
        .and(NotForContentType::new("video/"))
        .and(NotForContentType::new("audio/"))
        .and(NotForContentType::new("application/octet-stream"));

    Router::new()
        .route("/", get(root_handler))
        .route("/ping", get(ping_handler))
        .route("/stats", get(stats_handler))
        .route("/status", get(stats_handler))
        .route("/audio", get(audio_handler))
        .route("/video", get(video_handler))
        .route("/video/qualities", get(qualities_handler))
        .route("/playlist", get(playlist_handler))
        .route("/download", get(download_handler))
        .layer(CompressionLayer::new().compress_when(compress))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ResponseMode {
    #[default]
    Json,
    Redirect,
    Proxy,
}

#[derive(Deserialize)]
struct AudioQuery {
    url: String,
    #[serde(default)]
    mode: ResponseMode,
}

#[derive(Deserialize)]
struct VideoQuery {
    url: String,
    quality: Option<String>,
    #[serde(default)]
    mode: ResponseMode,
}

#[derive(Deserialize)]
struct UrlQuery {
    url: String,
}

#[derive(Deserialize)]
struct PlaylistQuery {
    url: String,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct DownloadQuery {
    url: String,
    quality: Option<String>,
    #[serde(default)]
    audio: bool,
}

#[derive(Serialize)]
struct StreamResponse<'a> {
    status: &'static str,
    id: &'a str,
    title: &'a str,
    duration: Option<f64>,
    thumbnail: Option<&'a str>,
    format_id: &'a str,
    height: Option<u32>,
    ext: Option<&'a str>,
    protocol: Option<&'a str>,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_url: Option<&'a str>,
}

fn source_url(url: &str) -> AppResult<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AppError::BadRequest("missing url".into()));
    }
    Ok(url)
}

async fn root_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "uptime": stats::format_uptime(state.started.elapsed()),
        "endpoints": ENDPOINTS,
    }))
}

async fn ping_handler() -> Json<Value> {
    Json(json!({ "ping": "pong" }))
}

async fn stats_handler(State(state): State<AppState>) -> Json<stats::Stats> {
    Json(stats::snapshot(state.started.elapsed()).await)
}

async fn audio_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AudioQuery>,
) -> AppResult<Response> {
    let url = source_url(&query.url)?;
    let info = state.media_info(url).await?;
    let record = select_audio(&info.formats).ok_or(AppError::NotFound("no audio format"))?;
    info!("audio {url} -> format {}", record.format_id);

    respond(&state, &info, record, None, query.mode, &headers).await
}

async fn video_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<VideoQuery>,
) -> AppResult<Response> {
    let url = source_url(&query.url)?;
    let request = SelectionRequest::parse(query.quality.as_deref().unwrap_or_default())?;

    if let Some(limit) = state.cpu_limit {
        let cpu = stats::cpu_percent().await;
        if cpu > limit {
            warn!("refusing /video for {url}: cpu at {cpu:.0}%");
            return Err(AppError::Busy(cpu));
        }
    }

    let info = state.media_info(url).await?;
    let record =
        select(&info.formats, request, false).ok_or(AppError::NotFound("no playable format"))?;
    info!(
        "video {url} ({:?}) -> format {} at {:?}p",
        request, record.format_id, record.height
    );

    // video-only picks get the matching audio stream alongside
    let audio = if record.has_audio() {
        None
    } else {
        select_audio(&info.formats)
    };

    respond(&state, &info, record, audio, query.mode, &headers).await
}

async fn respond(
    state: &AppState,
    info: &MediaInfo,
    record: &FormatRecord,
    audio: Option<&FormatRecord>,
    mode: ResponseMode,
    headers: &HeaderMap,
) -> AppResult<Response> {
    let locator = record
        .stream_locator()
        .ok_or(AppError::NotFound("no playable format"))?;

    match mode {
        ResponseMode::Json => Ok(Json(StreamResponse {
            status: "success",
            id: &info.id,
            title: &info.title,
            duration: info.duration,
            thumbnail: info.thumbnail.as_deref(),
            format_id: &record.format_id,
            height: record.height,
            ext: record.ext.as_deref(),
            protocol: record.protocol.as_deref(),
            url: locator,
            audio_url: audio.and_then(FormatRecord::stream_locator),
        })
        .into_response()),
        ResponseMode::Redirect => Ok(Redirect::temporary(locator).into_response()),
        ResponseMode::Proxy => proxy(&state.http, locator, headers.get(header::RANGE)).await,
    }
}

/// Streams the upstream media through this server, honouring byte ranges.
async fn proxy(
    client: &reqwest::Client,
    url: &str,
    range: Option<&HeaderValue>,
) -> AppResult<Response> {
    let mut request = client.get(url);
    if let Some(range) = range {
        request = request.header(header::RANGE, range.clone());
    }
    let upstream = request.send().await?.error_for_status()?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
    ] {
        if let Some(value) = upstream.headers().get(&name) {
            response_headers.insert(name, value.clone());
        }
    }

    let body = Body::from_stream(upstream.bytes_stream());
    Ok((status, response_headers, body).into_response())
}

async fn qualities_handler(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> AppResult<Json<Value>> {
    let url = source_url(&query.url)?;
    let info = state.media_info(url).await?;
    let qualities: Vec<String> = available_heights(&info.formats)
        .into_iter()
        .map(quality_label)
        .collect();

    Ok(Json(json!({
        "status": "success",
        "title": info.title,
        "duration": info.duration,
        "qualities": qualities,
    })))
}

async fn playlist_handler(
    State(state): State<AppState>,
    Query(query): Query<PlaylistQuery>,
) -> AppResult<Json<Value>> {
    let url = source_url(&query.url)?;
    let limit = match query.limit {
        Some(0) => return Err(AppError::BadRequest("limit must be at least 1".into())),
        Some(limit) => limit.min(state.playlist_limit),
        None => state.playlist_limit,
    };

    let playlist = state.playlist(url, limit).await?;
    let entries: Vec<_> = playlist.entries.iter().take(limit).collect();

    Ok(Json(json!({
        "status": "success",
        "id": playlist.id,
        "title": playlist.title,
        "uploader": playlist.uploader,
        "count": entries.len(),
        "entries": entries,
    })))
}

async fn download_handler(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> AppResult<Response> {
    let url = source_url(&query.url)?;
    let request = SelectionRequest::parse(query.quality.as_deref().unwrap_or_default())?;

    let info = state.media_info(url).await?;
    let record = if query.audio {
        select_audio(&info.formats).ok_or(AppError::NotFound("no audio format"))?
    } else {
        select(&info.formats, request, false).ok_or(AppError::NotFound("no playable format"))?
    };
    let format = download_format_string(record, query.audio);

    let dir = tempfile::tempdir()?;
    let path = state.extractor.download(url, &format, dir.path()).await?;
    let file = File::open(&path).await?;
    let len = file.metadata().await?.len();

    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("bin");
    let filename = download_filename(&info.title, ext);
    let content_type = mime_guess::from_path(&path).first_or_octet_stream();
    info!("serving {} ({len} bytes) as {filename}", path.display());

    // the temp dir lives as long as the body, and is removed once it is dropped
    let body = ReaderStream::new(file).map(move |chunk| {
        let _keep = &dir;
        chunk
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&filename)),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

fn download_filename(title: &str, ext: &str) -> String {
    let name = sanitize_filename::sanitize(title);
    let name: String = name.trim().trim_matches('.').chars().take(120).collect();
    let name = name.trim_end();
    if name.is_empty() {
        format!("download.{ext}")
    } else {
        format!("{name}.{ext}")
    }
}

/// `filename` carries an ASCII fallback; `filename*` the full UTF-8 name (RFC 5987).
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
