use serde::{Deserialize, Serialize};
use anyhow::Result;
use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs, path::{Path, PathBuf}};

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_domains")]
    pub domains: BTreeMap<String, String>,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Full,
    Headers,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParseErrorPolicy {
    #[default]
    Abort,
    Skip,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveOrder {
    #[default]
    Server,
    Sequence,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    pub capture: CaptureMode,
    pub on_parse_error: ParseErrorPolicy,
    pub order: ArchiveOrder,
    /// Messages buffered between the fetch task and the archive writer.
    pub channel_capacity: usize,
    /// Messages requested per FETCH command.
    pub fetch_batch: u32,
    /// 0 disables the socket read timeout.
    pub fetch_timeout_secs: u64,
    /// 0 waits forever for the next message.
    pub drain_timeout_secs: u64,
    pub connect_retries: u32,
    pub retry_backoff_ms: u64,
    /// How long a stopped run waits for an in-flight fetch before abandoning it.
    pub close_grace_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            capture: CaptureMode::Full,
            on_parse_error: ParseErrorPolicy::Abort,
            order: ArchiveOrder::Server,
            channel_capacity: 64,
            fetch_batch: 500,
            fetch_timeout_secs: 120,
            drain_timeout_secs: 0,
            connect_retries: 0,
            retry_backoff_ms: 1000,
            close_grace_ms: 5000,
        }
    }
}

impl BackupConfig {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        secs(self.fetch_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        secs(self.drain_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

fn secs(v: u64) -> Option<Duration> {
    (v > 0).then(|| Duration::from_secs(v))
}

fn default_domains() -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("gmail.com".to_string(), "imap.gmail.com:993".to_string());
    m.insert("nyu.edu".to_string(), "imap.gmail.com:993".to_string());
    m
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domains: default_domains(),
            backup: BackupConfig::default(),
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("no config dir"))?;
        Ok(dir.join("mailbak").join("config.toml"))
    }

    pub fn load_or_create(path: &Path) -> Result<(Self, bool)> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, DEFAULT_CONFIG)?;
            let cfg: Self = toml::from_str(DEFAULT_CONFIG)?;
            return Ok((cfg, true));
        }

        let data = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&data)?;
        cfg.validate()?;
        Ok((cfg, false))
    }

    fn validate(&self) -> Result<()> {
        if self.backup.channel_capacity == 0 {
            anyhow::bail!("backup.channel_capacity must be at least 1");
        }
        if self.backup.fetch_batch == 0 {
            anyhow::bail!("backup.fetch_batch must be at least 1");
        }
        Ok(())
    }
}

const DEFAULT_CONFIG: &str = r#"
# email domain -> IMAP server (host:port). Port 143 uses STARTTLS.
[domains]
"gmail.com" = "imap.gmail.com:993"
"nyu.edu" = "imap.gmail.com:993"

[backup]
capture = "full"          # full | headers
on_parse_error = "abort"  # abort | skip
order = "server"          # server | sequence
channel_capacity = 64
fetch_batch = 500
fetch_timeout_secs = 120
drain_timeout_secs = 0
connect_retries = 0
retry_backoff_ms = 1000
close_grace_ms = 5000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_file_matches_default_struct() {
        let parsed: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        let def = Config::default();
        assert_eq!(parsed.domains, def.domains);
        assert_eq!(parsed.backup, def.backup);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: Config = toml::from_str("[backup]\non_parse_error = \"skip\"\n").unwrap();
        assert_eq!(cfg.backup.on_parse_error, ParseErrorPolicy::Skip);
        assert_eq!(cfg.backup.channel_capacity, 64);
        assert_eq!(cfg.domains.get("gmail.com").unwrap(), "imap.gmail.com:993");
    }

    #[test]
    fn load_or_create_writes_and_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let (_, created) = Config::load_or_create(&path).unwrap();
        assert!(created);
        assert!(path.exists());

        let mut cfg = Config::default();
        cfg.backup.capture = CaptureMode::Headers;
        fs::write(&path, toml::to_string_pretty(&cfg).unwrap()).unwrap();

        let (reloaded, created) = Config::load_or_create(&path).unwrap();
        assert!(!created);
        assert_eq!(reloaded.backup.capture, CaptureMode::Headers);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[backup]\nchannel_capacity = 0\n").unwrap();
        assert!(Config::load_or_create(&path).is_err());
    }

    #[test]
    fn zero_timeouts_disable_them() {
        let mut b = BackupConfig::default();
        b.fetch_timeout_secs = 0;
        assert_eq!(b.fetch_timeout(), None);
        assert_eq!(b.drain_timeout(), None);
        b.drain_timeout_secs = 5;
        assert_eq!(b.drain_timeout(), Some(Duration::from_secs(5)));
    }
}
