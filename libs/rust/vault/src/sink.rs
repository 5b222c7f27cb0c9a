//! Config sink: where renewed credentials are applied.
//!
//! [`AtomicFileSink`] writes the credential set to a file by replacing it
//! atomically, so a reader sees either the old or the new file and never a
//! partial one.

use crate::error::{CommitError, ConfigError};
use crate::secrets::CredentialSet;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Positive commit acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The credential set was applied
    Applied,
    /// The sink already held exactly this credential set
    Unchanged,
}

/// Applies credential sets for their consumers.
///
/// Implementations must be idempotent: committing the same set twice leaves
/// the same end state. [`CommitError::Rejected`] means nothing was applied
/// and the previously committed set is still in effect;
/// [`CommitError::Unreachable`] means the outcome is unknown.
#[async_trait]
pub trait ConfigSink: Send + Sync {
    /// Apply `credentials`.
    async fn commit(&self, credentials: &CredentialSet) -> Result<Ack, CommitError>;
}

/// On-disk rendering of a credential set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkFormat {
    /// A flat JSON object
    #[default]
    Json,
    /// `KEY='value'` lines, keys upper-cased
    Env,
}

impl FromStr for SinkFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "env" | "dotenv" => Ok(Self::Env),
            other => Err(ConfigError::ParseError {
                name: "RENEWER_SINK_FORMAT".to_string(),
                reason: format!("unknown sink format: {other}"),
            }),
        }
    }
}

/// File sink with atomic replace and an optional reload command.
///
/// A failed reload puts the previous file back, so [`CommitError::Rejected`]
/// always leaves the consumer's old credentials in place.
pub struct AtomicFileSink {
    path: PathBuf,
    format: SinkFormat,
    reload: Option<Vec<String>>,
    /// Serialises commits. Held by the spawned commit task, so an abandoned
    /// commit still finishes before the next one starts.
    lock: Arc<Mutex<()>>,
}

impl AtomicFileSink {
    /// Create a sink writing `format` to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, format: SinkFormat) -> Self {
        Self {
            path: path.into(),
            format,
            reload: None,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run `argv` after every applied write.
    #[must_use]
    pub fn with_reload_command(mut self, argv: Vec<String>) -> Self {
        self.reload = Some(argv).filter(|a| !a.is_empty());
        self
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSink for AtomicFileSink {
    async fn commit(&self, credentials: &CredentialSet) -> Result<Ack, CommitError> {
        let rendered = render(credentials, self.format)?;
        let guard = Arc::clone(&self.lock).lock_owned().await;

        let job = FileCommit {
            path: self.path.clone(),
            reload: self.reload.clone(),
            contents: rendered.into_bytes(),
            fields: credentials.len(),
        };

        // Detached so that dropping this future cannot stop between the
        // rename and the reload or restore.
        tokio::spawn(async move {
            let _guard = guard;
            job.run().await
        })
        .await
        .map_err(|e| CommitError::Unreachable(format!("commit task failed: {e}")))?
    }
}

struct FileCommit {
    path: PathBuf,
    reload: Option<Vec<String>>,
    contents: Vec<u8>,
    fields: usize,
}

impl FileCommit {
    async fn run(self) -> Result<Ack, CommitError> {
        let previous = match tokio::fs::read(&self.path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(CommitError::Unreachable(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };

        if previous.as_deref() == Some(self.contents.as_slice()) {
            debug!(path = %self.path.display(), "Credential file already up to date");
            return Ok(Ack::Unchanged);
        }

        write_file(&self.path, Some(self.contents.clone()))
            .await
            .map_err(|e| CommitError::Unreachable(format!("write {}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), fields = self.fields, "Credential file replaced");

        let Err(reason) = run_reload(self.reload.as_deref()).await else {
            return Ok(Ack::Applied);
        };
        warn!(error = %reason, "Reload after credential update failed, restoring previous file");

        match write_file(&self.path, previous).await {
            Ok(()) => Err(CommitError::Rejected(reason)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Restoring previous credential file failed");
                Err(CommitError::Unreachable(format!(
                    "{reason}; restore of {} failed: {e}",
                    self.path.display()
                )))
            }
        }
    }
}

/// Replace `path` with `contents`, or remove it for `None`.
async fn write_file(path: &Path, contents: Option<Vec<u8>>) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || match contents {
        Some(bytes) => write_atomically(&path, &bytes),
        None => match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    })
    .await
    .map_err(io::Error::other)?
}

async fn run_reload(argv: Option<&[String]>) -> Result<(), String> {
    let Some((program, args)) = argv.and_then(<[String]>::split_first) else {
        return Ok(());
    };

    let status = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| format!("reload command {program}: {e}"))?;

    if status.success() {
        debug!(program, "Reload command succeeded");
        Ok(())
    } else {
        Err(format!("reload command {program} exited with {status}"))
    }
}

/// Render a credential set in `format`.
///
/// # Errors
///
/// [`CommitError::Rejected`] for an empty set, or for a key or value the
/// format cannot represent.
pub fn render(credentials: &CredentialSet, format: SinkFormat) -> Result<String, CommitError> {
    if credentials.is_empty() {
        return Err(CommitError::Rejected("empty credential set".to_string()));
    }

    match format {
        SinkFormat::Json => {
            let map: BTreeMap<&str, &str> = credentials.expose_iter().collect();
            let mut out = serde_json::to_string_pretty(&map)
                .map_err(|e| CommitError::Rejected(e.to_string()))?;
            out.push('\n');
            Ok(out)
        }
        SinkFormat::Env => {
            let mut out = String::new();
            for (key, value) in credentials.expose_iter() {
                let key = env_key(key)?;
                if value.contains(['\n', '\r', '\0']) {
                    return Err(CommitError::Rejected(format!(
                        "value of {key} contains a line break or NUL"
                    )));
                }
                out.push_str(&key);
                out.push_str("='");
                out.push_str(&value.replace('\'', r"'\''"));
                out.push_str("'\n");
            }
            Ok(out)
        }
    }
}

fn env_key(key: &str) -> Result<String, CommitError> {
    let valid = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(key.to_ascii_uppercase())
    } else {
        Err(CommitError::Rejected(format!("invalid variable name: {key:?}")))
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "sink path has no file name")
    })?;
    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));

    let result = (|| -> io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
