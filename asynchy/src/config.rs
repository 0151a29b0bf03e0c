use crate::error::{AsynchyError, AsynchyResult, TransferError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

// Host and user names end up inside an ssh destination `user@host:path`.
fn host_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*$").expect("valid regex"))
}

/// Logins may contain '@', as e-mail style facility accounts do.
fn user_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@+-]*$").expect("valid regex"))
}

/// Replace a leading `~` with the home directory. Other paths are returned as given.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn invalid(field: &str, reason: &str) -> TransferError {
    TransferError::ConfigInvalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// On-disk configuration, stored as TOML at `~/.asynchy.toml` by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub keypath: PathBuf,
    pub db: PathBuf,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub retry: u32,
    #[serde(default = "default_rsync_program")]
    pub rsync_program: String,
}

fn default_port() -> u16 {
    22
}

fn default_threads() -> usize {
    num_cpus::get()
}

fn default_rsync_program() -> String {
    "rsync".to_string()
}

impl Config {
    pub fn new(host: impl Into<String>, user: impl Into<String>, keypath: impl Into<PathBuf>, db: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            keypath: keypath.into(),
            db: db.into(),
            threads: default_threads(),
            partial: false,
            compress: false,
            retry: 0,
            rsync_program: default_rsync_program(),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".asynchy.toml")
    }

    pub async fn load(path: &Path) -> AsynchyResult<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AsynchyError::ConfigNotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path, overwrite: bool) -> AsynchyResult<()> {
        self.validate()?;
        if !overwrite && tokio::fs::try_exists(path).await? {
            return Err(AsynchyError::ConfigExists {
                path: path.to_path_buf(),
            });
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, toml::to_string_pretty(self)?).await?;
        info!("Wrote configuration to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.db.as_os_str().is_empty() {
            return Err(invalid("db", "a catalog database path is required"));
        }
        self.transfer_config().validate()
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            remote: Some(RemoteTarget {
                host: self.host.clone(),
                port: self.port,
                user: self.user.clone(),
                keypath: self.keypath.clone(),
            }),
            threads: self.threads,
            partial: self.partial,
            compress: self.compress,
            retry: self.retry,
            program: self.rsync_program.clone(),
            terminate_grace: TransferConfig::DEFAULT_TERMINATE_GRACE,
        }
    }
}

/// The ssh side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub keypath: PathBuf,
}

/// Settings shared by every job run through one transfer pool.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// `None` copies between local paths.
    pub remote: Option<RemoteTarget>,
    pub threads: usize,
    pub partial: bool,
    pub compress: bool,
    /// Extra ssh connection attempts on top of the first one.
    pub retry: u32,
    pub program: String,
    /// Time a terminated rsync gets to exit before it is killed.
    pub terminate_grace: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            remote: None,
            threads: default_threads(),
            partial: false,
            compress: false,
            retry: 0,
            program: default_rsync_program(),
            terminate_grace: Self::DEFAULT_TERMINATE_GRACE,
        }
    }
}

impl TransferConfig {
    pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

    pub fn local(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.threads == 0 {
            return Err(invalid("threads", "must be at least 1"));
        }
        if self.program.trim().is_empty() {
            return Err(invalid("rsync_program", "must not be empty"));
        }

        if let Some(remote) = &self.remote {
            if remote.host.is_empty() {
                return Err(invalid("host", "a remote host is required"));
            }
            if !host_name_pattern().is_match(&remote.host) {
                return Err(invalid("host", "contains characters not allowed in a host name"));
            }
            if remote.user.is_empty() {
                return Err(invalid("user", "a remote user is required"));
            }
            if !user_name_pattern().is_match(&remote.user) {
                return Err(invalid("user", "contains characters not allowed in a user name"));
            }
            if remote.port == 0 {
                return Err(invalid("port", "must be between 1 and 65535"));
            }
            if remote.keypath.as_os_str().is_empty() {
                return Err(invalid("keypath", "a private key path is required"));
            }
        }

        Ok(())
    }

    /// Identity of the logical transfer target. Two configurations with the
    /// same key share one pool.
    pub fn target_key(&self) -> String {
        match &self.remote {
            Some(remote) => format!("{}@{}:{}/{}", remote.user, remote.host, remote.port, self.program),
            None => format!("local/{}", self.program),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Config {
        Config::new("sftp.synchrotron.org.au", "help@massive.org.au", "/home/me/.ssh/id_rsa", "/tmp/files.db")
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("asynchy.toml");
        let mut config = sample();
        config.port = 35;
        config.retry = 2;

        config.save(&path, false).await.unwrap();
        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_save_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("asynchy.toml");
        sample().save(&path, false).await.unwrap();

        let err = sample().save(&path, false).await.unwrap_err();
        assert!(matches!(err, AsynchyError::ConfigExists { .. }));
        sample().save(&path, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("doesnotexist.toml")).await.unwrap_err();
        assert!(matches!(err, AsynchyError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_rejects_missing_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("invalid.toml");
        tokio::fs::write(&path, "host = \"sftp.test.com\"\nport = 22\n").await.unwrap();

        let err = Config::load(&path).await.unwrap_err();
        assert!(matches!(err, AsynchyError::ConfigParse(_)));
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = toml::from_str(
            "host = \"sftp.test.com\"\nuser = \"xxxxx\"\nkeypath = \"/path/to/key\"\ndb = \"./files.db\"\n",
        )
        .unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.rsync_program, "rsync");
        assert!(config.threads >= 1);
        assert!(!config.partial);
    }

    #[test]
    fn test_validate_rejects_bad_remote() {
        let mut config = sample();
        config.host = String::new();
        assert!(matches!(
            config.validate(),
            Err(TransferError::ConfigInvalid { ref field, .. }) if field == "host"
        ));

        let mut config = sample();
        config.user = "me; rm -rf /".to_string();
        assert!(matches!(
            config.validate(),
            Err(TransferError::ConfigInvalid { ref field, .. }) if field == "user"
        ));

        let mut config = sample();
        config.threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home(Path::new("~/.ssh/id_rsa")), home.join(".ssh/id_rsa"));
        assert_eq!(expand_home(Path::new("~")), home);
        assert_eq!(expand_home(Path::new("/srv/files.db")), PathBuf::from("/srv/files.db"));
        assert_eq!(expand_home(Path::new("files.db")), PathBuf::from("files.db"));
        assert_eq!(expand_home(Path::new("~other/key")), PathBuf::from("~other/key"));
    }

    #[test]
    fn test_host_rejects_login_characters() {
        let mut config = sample();
        config.host = "user@evil.host".to_string();
        assert!(matches!(
            config.validate(),
            Err(TransferError::ConfigInvalid { ref field, .. }) if field == "host"
        ));

        config.host = "-oProxyCommand=x".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.user = "help@massive.org.au".to_string();
        config.host = "sftp.synchrotron.org.au".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_target_key_distinguishes_remotes() {
        let a = sample().transfer_config();
        let mut other = sample();
        other.port = 2222;
        assert_ne!(a.target_key(), other.transfer_config().target_key());

        let mut same = sample();
        same.threads = 1;
        assert_eq!(a.target_key(), same.transfer_config().target_key());
        assert_eq!(TransferConfig::local(2).target_key(), "local/rsync");
    }
}
