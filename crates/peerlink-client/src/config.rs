//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name this peer registers under
    pub username: String,

    /// Directory where received files are stored
    pub download_dir: String,

    /// Listening socket configuration
    pub listen: ListenConfig,

    /// Rendezvous directory configuration
    pub directory: DirectoryConfig,

    /// Handshake and read-loop configuration
    pub connection: ConnectionConfig,

    /// File transfer configuration
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind the listener on
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Address advertised to the directory, if different from `host`
    pub advertise_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the rendezvous directory
    pub url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connect and handshake-read timeout in seconds
    pub handshake_timeout_secs: u64,
    /// How long an inbound request waits for the user's answer
    pub decision_timeout_secs: u64,
    /// Read-loop liveness tick in milliseconds
    pub read_tick_ms: u64,
    /// Consecutive undecodable frames tolerated before dropping the peer
    pub max_malformed_frames: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes, at most `peerlink_core::MAX_CHUNK_SIZE`
    pub chunk_size: usize,
    /// Delay between chunks in milliseconds
    pub pacing_ms: u64,
    /// How long a sender waits for file_accept/file_reject
    pub confirm_timeout_secs: u64,
    /// Abort a transfer after this long without progress
    pub stall_timeout_secs: u64,
    /// Emit a progress event every N chunks
    pub progress_every: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            download_dir: "~/.peerlink/received".to_string(),
            listen: ListenConfig::default(),
            directory: DirectoryConfig::default(),
            connection: ConnectionConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            advertise_host: None,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            decision_timeout_secs: 30,
            read_tick_ms: 1000,
            max_malformed_frames: 3,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: peerlink_core::CHUNK_SIZE,
            pacing_ms: 10,
            confirm_timeout_secs: 30,
            stall_timeout_secs: 60,
            progress_every: 10,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no transfer could work with
    pub fn validate(&self) -> anyhow::Result<()> {
        let chunk_size = self.transfer.chunk_size;
        if chunk_size == 0 || chunk_size > peerlink_core::MAX_CHUNK_SIZE {
            anyhow::bail!(
                "transfer.chunk_size must be between 1 and {} bytes, got {}",
                peerlink_core::MAX_CHUNK_SIZE,
                chunk_size
            );
        }
        Ok(())
    }

    /// Expand ~ in download_dir path
    pub fn download_dir(&self) -> std::path::PathBuf {
        expand_path(&self.download_dir)
    }

    /// Host registered with the directory
    pub fn advertised_host(&self) -> &str {
        self.listen
            .advertise_host
            .as_deref()
            .unwrap_or(&self.listen.host)
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    pub fn read_tick(&self) -> Duration {
        Duration::from_millis(self.read_tick_ms.max(1))
    }
}

impl TransferConfig {
    /// Configured chunk size kept within what one frame can carry
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, peerlink_core::MAX_CHUNK_SIZE)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            username = "alice"

            [transfer]
            chunk_size = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.username, "alice");
        assert_eq!(config.transfer.chunk_size, 4096);
        assert_eq!(config.transfer.confirm_timeout(), Duration::from_secs(30));
        assert_eq!(config.connection.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.connection.max_malformed_frames, 3);
        assert_eq!(config.listen.port, 5000);
    }

    #[test]
    fn test_default_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.transfer.chunk_size, peerlink_core::CHUNK_SIZE);
        assert_eq!(parsed.directory.url, "http://localhost:8000");
    }

    #[test]
    fn test_advertised_host_falls_back_to_listen_host() {
        let mut config = Config::default();
        assert_eq!(config.advertised_host(), "127.0.0.1");
        config.listen.advertise_host = Some("192.168.1.20".to_string());
        assert_eq!(config.advertised_host(), "192.168.1.20");
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/tmp/x"), std::path::PathBuf::from("/tmp/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/recv"), home.join("recv"));
        }
    }

    #[test]
    fn test_chunk_size_must_fit_in_a_frame() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "[transfer]\nchunk_size = 16777216\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("chunk_size"));

        std::fs::write(&path, "[transfer]\nchunk_size = 0\n").unwrap();
        assert!(Config::load(&path).is_err());

        std::fs::write(&path, "[transfer]\nchunk_size = 65536\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().transfer.chunk_size, 65536);
    }

    #[test]
    fn test_effective_chunk_size_is_clamped() {
        let mut transfer = TransferConfig {
            chunk_size: 64 * 1024 * 1024,
            ..TransferConfig::default()
        };
        assert_eq!(transfer.effective_chunk_size(), peerlink_core::MAX_CHUNK_SIZE);
        transfer.chunk_size = 0;
        assert_eq!(transfer.effective_chunk_size(), 1);
        transfer.chunk_size = 4096;
        assert_eq!(transfer.effective_chunk_size(), 4096);
    }
}
