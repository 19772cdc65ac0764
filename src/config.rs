use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{ArgAction, Parser};

/// HTTP front-end for yt-dlp stream extraction.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    #[arg(long, env = "STREAM_API_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "STREAM_API_PORT", default_value_t = 8080)]
    pub port: u16,

    /// yt-dlp executable
    #[arg(long = "yt-dlp", env = "YT_DLP_PATH", default_value = "yt-dlp")]
    pub yt_dlp: PathBuf,

    /// Netscape cookie file, passed to yt-dlp only if it exists
    #[arg(long, env = "YT_DLP_COOKIES", default_value = "cookies.txt")]
    pub cookies: Option<PathBuf>,

    #[arg(long, env = "YT_DLP_USER_AGENT", default_value = "Mozilla/5.0")]
    pub user_agent: Option<String>,

    #[arg(long, env = "YT_DLP_FORCE_IPV4", default_value_t = true, action = ArgAction::Set)]
    pub force_ipv4: bool,

    /// Extra arguments appended to every yt-dlp invocation, space separated
    #[arg(
        long = "extra-arg",
        env = "YT_DLP_EXTRA_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub extra_args: Vec<String>,

    /// Seconds before a metadata or playlist lookup is killed
    #[arg(long, env = "METADATA_TIMEOUT_SECS", default_value_t = 60)]
    pub metadata_timeout: u64,

    /// Seconds before a download is killed
    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS", default_value_t = 600)]
    pub download_timeout: u64,

    /// How long extracted metadata is reused, 0 disables caching
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 300)]
    pub cache_ttl: u64,

    /// Refuse /video while host CPU usage is above this percentage
    #[arg(long, env = "CPU_LIMIT_PERCENT", default_value = "80")]
    pub cpu_limit: Option<f32>,

    /// Default and maximum number of playlist entries returned
    #[arg(long, env = "PLAYLIST_LIMIT", default_value_t = 50)]
    pub playlist_limit: usize,
}

impl Config {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host.trim(), self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {addr}: {e}"))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    /// A non-positive limit turns the CPU guard off.
    pub fn cpu_limit(&self) -> Option<f32> {
        self.cpu_limit.filter(|limit| *limit > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("yt-stream-api").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.yt_dlp, PathBuf::from("yt-dlp"));
        assert_eq!(config.cookies, Some(PathBuf::from("cookies.txt")));
        assert!(config.force_ipv4);
        assert!(config.extra_args.is_empty());
        assert_eq!(config.metadata_timeout, 60);
        assert_eq!(config.download_timeout, 600);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.cpu_limit(), Some(80.0));
        assert_eq!(config.listen_addr().unwrap().to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn overrides() {
        let config = parse(&[
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--force-ipv4",
            "false",
            "--extra-arg",
            "--remote-components ejs:github",
            "--cache-ttl",
            "0",
            "--cpu-limit",
            "0",
        ]);
        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:9000");
        assert!(!config.force_ipv4);
        assert_eq!(config.extra_args, ["--remote-components", "ejs:github"]);
        assert!(config.cache_ttl().is_zero());
        assert_eq!(config.cpu_limit(), None);
    }

    #[test]
    fn rejects_bad_host() {
        let config = parse(&["--host", "not a host"]);
        assert!(config.listen_addr().is_err());
    }
}
