use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use futures::future::BoxFuture;
use glob::glob;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;

const NONE_CODEC: &str = "none";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to launch yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("yt-dlp exited with status {code:?}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("yt-dlp timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("yt-dlp produced no output")]
    EmptyOutput,
    #[error("failed to decode yt-dlp output: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("yt-dlp finished but no downloaded file was found")]
    MissingFile,
}

/// The seam between the HTTP layer and the extraction tool.
pub trait Extractor: Send + Sync {
    fn media_info<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MediaInfo, ExtractError>>;

    fn playlist<'a>(
        &'a self,
        url: &'a str,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Result<PlaylistInfo, ExtractError>>;

    /// Downloads `url` in `format` into `dir` and returns the produced file.
    fn download<'a>(
        &'a self,
        url: &'a str,
        format: &'a str,
        dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, ExtractError>>;
}

#[derive(Clone, Debug)]
pub struct YtDlp {
    binary: PathBuf,
    cookies: Option<PathBuf>,
    user_agent: Option<String>,
    force_ipv4: bool,
    extra_args: Vec<String>,
    metadata_timeout: Duration,
    download_timeout: Duration,
}

impl YtDlp {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.yt_dlp.clone(),
            cookies: config.cookies.clone(),
            user_agent: config.user_agent.clone().filter(|ua| !ua.trim().is_empty()),
            force_ipv4: config.force_ipv4,
            extra_args: config.extra_args.clone(),
            metadata_timeout: Duration::from_secs(config.metadata_timeout),
            download_timeout: Duration::from_secs(config.download_timeout),
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--no-warnings".to_string()];
        if self.force_ipv4 {
            args.push("--force-ipv4".into());
        }
        if let Some(user_agent) = &self.user_agent {
            args.push("--user-agent".into());
            args.push(user_agent.clone());
        }
        if let Some(cookies) = &self.cookies {
            // a missing cookie file is not fatal, yt-dlp just runs anonymously
            if cookies.exists() {
                args.push("--cookies".into());
                args.push(cookies.display().to_string());
            } else {
                debug!("cookie file {} not found, skipping", cookies.display());
            }
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn media_info_args(&self, url: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            ["--dump-single-json", "--skip-download", "--no-playlist", "--", url]
                .map(String::from),
        );
        args
    }

    fn playlist_args(&self, url: &str, limit: Option<usize>) -> Vec<String> {
        let mut args = self.base_args();
        args.push("--flat-playlist".into());
        args.push("--dump-single-json".into());
        if let Some(limit) = limit {
            args.push("--playlist-end".into());
            args.push(limit.to_string());
        }
        args.push("--".into());
        args.push(url.into());
        args
    }

    fn download_args(&self, url: &str, format: &str, dir: &Path) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-f".into());
        args.push(format.into());
        args.push("--no-playlist".into());
        args.push("--no-part".into());
        args.push("-o".into());
        args.push(dir.join("media.%(ext)s").display().to_string());
        args.push("--".into());
        args.push(url.into());
        args
    }

    /// Runs yt-dlp to completion, returning trimmed stdout on success.
    async fn run(&self, args: Vec<String>, limit: Duration) -> Result<String, ExtractError> {
        debug!("running {} {}", self.binary.display(), args.join(" "));
        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(limit, command.output()).await {
            Ok(output) => output.map_err(ExtractError::Spawn)?,
            Err(_) => {
                warn!("yt-dlp timed out after {}s", limit.as_secs());
                return Err(ExtractError::Timeout(limit));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("yt-dlp failed ({}): {stderr}", output.status);
            return Err(ExtractError::NonZeroExit {
                code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_json<T: for<'de> Deserialize<'de>>(
        &self,
        args: Vec<String>,
    ) -> Result<T, ExtractError> {
        let json = self.run(args, self.metadata_timeout).await?;
        if json.is_empty() {
            return Err(ExtractError::EmptyOutput);
        }
        Ok(serde_json::from_str::<T>(&json)?)
    }
}

impl Extractor for YtDlp {
    fn media_info<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MediaInfo, ExtractError>> {
        Box::pin(async move {
            let dump: JsonDump = self.run_json(self.media_info_args(url)).await?;
            let info = MediaInfo::from(dump);
            info!("{url}: '{}' with {} formats", info.title, info.formats.len());
            Ok(info)
        })
    }

    fn playlist<'a>(
        &'a self,
        url: &'a str,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Result<PlaylistInfo, ExtractError>> {
        Box::pin(async move {
            let playlist: PlaylistInfo = self.run_json(self.playlist_args(url, limit)).await?;
            info!("{url}: playlist with {} entries", playlist.entries.len());
            Ok(playlist)
        })
    }

    fn download<'a>(
        &'a self,
        url: &'a str,
        format: &'a str,
        dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, ExtractError>> {
        Box::pin(async move {
            info!("starting download {url} ({format})");
            self.run(self.download_args(url, format, dir), self.download_timeout)
                .await?;
            info!("download success {url}");
            find_downloaded(dir)
        })
    }
}

/// Finds the file yt-dlp wrote for the `media.%(ext)s` output template.
fn find_downloaded(dir: &Path) -> Result<PathBuf, ExtractError> {
    let pattern = format!("{}/media.*", dir.display());
    let paths = glob(&pattern).map_err(|e| {
        error!("bad glob pattern {pattern}: {e}");
        ExtractError::MissingFile
    })?;

    let mut found = None;
    for path in paths {
        match path {
            // leftovers from merging carry an extra format suffix, e.g. media.f137.mp4
            Ok(p) if is_fragment(&p) => debug!("skipping fragment {}", p.display()),
            Ok(p) => found = Some(p),
            Err(e) => error!("glob error: {e}"),
        }
    }
    found.ok_or(ExtractError::MissingFile)
}

fn is_fragment(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.ends_with(".part") || name.ends_with(".ytdl") || name.split('.').count() > 2
}

/// One entry of yt-dlp's `formats` list.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FormatRecord {
    #[serde(default)]
    pub format_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_note: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
}

impl FormatRecord {
    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some(NONE_CODEC)
    }

    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some(NONE_CODEC)
    }

    pub fn is_audio_only(&self) -> bool {
        !self.has_video() && self.has_audio()
    }

    /// Segmented or adaptive transports: HLS, DASH, HDS, Smooth Streaming.
    pub fn is_manifest(&self) -> bool {
        match self.protocol.as_deref() {
            Some(p) => p.starts_with("m3u8") || p.contains("dash") || p == "f4m" || p == "ism",
            None => false,
        }
    }

    /// The URL a client should fetch: the direct `url`, or the manifest for
    /// manifest transports that only report one.
    pub fn stream_locator(&self) -> Option<&str> {
        fn non_empty(s: &Option<String>) -> Option<&str> {
            s.as_deref().filter(|s| !s.trim().is_empty())
        }
        match non_empty(&self.url) {
            Some(url) => Some(url),
            None if self.is_manifest() => non_empty(&self.manifest_url),
            None => None,
        }
    }
}

/// Decoded single-video document.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub webpage_url: Option<String>,
    pub is_live: bool,
    pub formats: Vec<FormatRecord>,
}

#[derive(Deserialize)]
struct JsonDump {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    webpage_url: Option<String>,
    is_live: Option<bool>,
    #[serde(default)]
    formats: Vec<FormatRecord>,
    // only used when the extractor reports a single stream without a formats list
    #[serde(flatten)]
    single: FormatRecord,
}

impl From<JsonDump> for MediaInfo {
    fn from(value: JsonDump) -> Self {
        let formats = if value.formats.is_empty() && value.single.stream_locator().is_some() {
            vec![value.single]
        } else {
            value.formats
        };
        Self {
            id: value.id,
            title: value.title,
            duration: value.duration,
            thumbnail: value.thumbnail,
            uploader: value.uploader.or(value.channel),
            webpage_url: value.webpage_url,
            is_live: value.is_live.unwrap_or_default(),
            formats,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PlaylistInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub entries: Vec<PlaylistEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PlaylistEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub uploader: Option<String>,
}

// yt-dlp --dump-single-json --skip-download "https://www.youtube.com/watch?v=GNXNwT65ymg" | jq > out.json

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const DUMP: &str = r#"{
        "id": "abc123",
        "title": "Some video",
        "duration": 212.5,
        "channel": "Some channel",
        "webpage_url": "https://www.youtube.com/watch?v=abc123",
        "formats": [
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2",
             "protocol": "https", "url": "https://cdn/140", "abr": 129.5, "tbr": 129.5},
            {"format_id": "137", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "none",
             "height": 1080, "width": 1920, "fps": 30, "protocol": "https", "url": "https://cdn/137"},
            {"format_id": "96", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "mp4a.40.2",
             "height": 1080, "protocol": "m3u8_native", "url": "https://cdn/96.m3u8",
             "manifest_url": "https://cdn/master.m3u8"}
        ]
    }"#;

    fn yt_dlp(args: &[&str]) -> YtDlp {
        let config = Config::try_parse_from(std::iter::once("yt-stream-api").chain(args.iter().copied()))
            .unwrap();
        YtDlp::from_config(&config)
    }

    #[test]
    fn decodes_format_list() {
        let dump: JsonDump = serde_json::from_str(DUMP).unwrap();
        let info = MediaInfo::from(dump);
        assert_eq!(info.id, "abc123");
        assert_eq!(info.uploader.as_deref(), Some("Some channel"));
        assert_eq!(info.formats.len(), 3);
        assert!(info.formats[0].is_audio_only());
        assert!(!info.formats[1].has_audio());
        assert!(info.formats[2].is_manifest());
        assert_eq!(info.formats[1].fps, Some(30.0));
    }

    #[test]
    fn single_stream_becomes_one_format() {
        let dump: JsonDump = serde_json::from_str(
            r#"{"id": "x", "title": "clip", "format_id": "hd", "url": "https://cdn/clip.mp4",
                "ext": "mp4", "height": 720, "protocol": "https"}"#,
        )
        .unwrap();
        let info = MediaInfo::from(dump);
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].format_id, "hd");
        assert_eq!(info.formats[0].height, Some(720));
    }

    #[test]
    fn no_locator_means_no_formats() {
        let dump: JsonDump = serde_json::from_str(r#"{"id": "x", "title": "gone"}"#).unwrap();
        assert!(MediaInfo::from(dump).formats.is_empty());
    }

    #[test]
    fn stream_locator_prefers_url() {
        let manifest_only = FormatRecord {
            protocol: Some("http_dash_segments".into()),
            manifest_url: Some("https://cdn/manifest.mpd".into()),
            ..Default::default()
        };
        assert_eq!(
            manifest_only.stream_locator(),
            Some("https://cdn/manifest.mpd")
        );

        let direct_without_url = FormatRecord {
            protocol: Some("https".into()),
            manifest_url: Some("https://cdn/manifest.mpd".into()),
            ..Default::default()
        };
        assert_eq!(direct_without_url.stream_locator(), None);

        let blank = FormatRecord {
            url: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(blank.stream_locator(), None);
    }

    #[test]
    fn decodes_flat_playlist() {
        let playlist: PlaylistInfo = serde_json::from_str(
            r#"{"id": "PL1", "title": "mix", "_type": "playlist", "entries": [
                {"id": "a", "title": "first", "url": "https://www.youtube.com/watch?v=a", "duration": 60},
                {"id": "b", "title": null, "url": "https://www.youtube.com/watch?v=b"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(playlist.entries.len(), 2);
        assert_eq!(playlist.entries[0].duration, Some(60.0));
        assert_eq!(playlist.entries[1].title, None);
    }

    #[test]
    fn builds_command_lines() {
        let cmd = yt_dlp(&["--extra-arg=--remote-components", "--extra-arg=ejs:github"]);
        let args = cmd.media_info_args("https://youtu.be/abc");
        assert_eq!(
            args,
            [
                "--no-warnings",
                "--force-ipv4",
                "--user-agent",
                "Mozilla/5.0",
                "--remote-components",
                "ejs:github",
                "--dump-single-json",
                "--skip-download",
                "--no-playlist",
                "--",
                "https://youtu.be/abc",
            ]
        );

        let args = cmd.playlist_args("https://youtube.com/playlist?list=PL1", Some(5));
        assert!(args.windows(2).any(|w| w == ["--playlist-end", "5"]));
        assert!(args.contains(&"--flat-playlist".to_string()));

        let dir = Path::new("/tmp/dl");
        let args = cmd.download_args("https://youtu.be/abc", "137+bestaudio/137", dir);
        assert!(args.windows(2).any(|w| w == ["-f", "137+bestaudio/137"]));
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1].ends_with("media.%(ext)s")));
    }

    #[test]
    fn cookies_only_when_file_exists() {
        let missing = yt_dlp(&["--cookies", "/definitely/not/here.txt", "--force-ipv4=false"]);
        let args = missing.base_args();
        assert!(!args.contains(&"--cookies".to_string()));
        assert!(!args.contains(&"--force-ipv4".to_string()));

        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().display().to_string();
        let present = yt_dlp(&["--cookies", path.as_str()]);
        assert!(present.base_args().windows(2).any(|w| w == ["--cookies", path.as_str()]));
    }

    #[test]
    fn finds_merged_file_and_skips_fragments() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(find_downloaded(dir.path()), Err(ExtractError::MissingFile)));

        std::fs::write(dir.path().join("media.f137.mp4"), b"v").unwrap();
        std::fs::write(dir.path().join("media.mp4.part"), b"p").unwrap();
        assert!(matches!(find_downloaded(dir.path()), Err(ExtractError::MissingFile)));

        std::fs::write(dir.path().join("media.mp4"), b"merged").unwrap();
        assert_eq!(find_downloaded(dir.path()).unwrap(), dir.path().join("media.mp4"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let cmd = yt_dlp(&["--yt-dlp", "/nonexistent/yt-dlp-binary"]);
        let err = cmd.media_info("https://youtu.be/abc").await.unwrap_err();
        assert!(matches!(err, ExtractError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_and_timeout() {
        let failing = yt_dlp(&["--yt-dlp", "false"]);
        let err = failing.media_info("https://youtu.be/abc").await.unwrap_err();
        assert!(matches!(err, ExtractError::NonZeroExit { code: Some(1), .. }));

        let empty = yt_dlp(&["--yt-dlp", "true"]);
        let err = empty.media_info("https://youtu.be/abc").await.unwrap_err();
        assert!(matches!(err, ExtractError::EmptyOutput));

        let mut slow = yt_dlp(&["--yt-dlp", "sleep"]);
        slow.metadata_timeout = Duration::from_millis(100);
        let err = slow.run(vec!["5".into()], slow.metadata_timeout).await.unwrap_err();
        assert!(matches!(err, ExtractError::Timeout(_)));
    }
}
