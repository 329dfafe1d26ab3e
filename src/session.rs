//! File-backed conversation memory.
//!
//! Each session is a single `<session_id>.json` document holding the ordered
//! list of turns. The on-disk shape is `[{"type": "human"|"ai", "content": ...}]`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AlimError, Result};
use crate::models::{HistoryMessage, SessionInfo};

const PREVIEW_CHARS: usize = 50;

static SESSION_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(rename = "type")]
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn human(content: impl Into<String>) -> Self {
        Self { role: Role::Human, content: content.into() }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self { role: Role::Ai, content: content.into() }
    }
}

/// Raw record as found on disk; unknown `type` values are tolerated and dropped.
#[derive(Debug, Deserialize)]
struct StoredTurn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
}

pub fn validate_session_id(session_id: &str) -> Result<()> {
    if SESSION_ID_PATTERN.is_match(session_id) {
        Ok(())
    } else {
        Err(AlimError::InvalidSessionId(session_id.to_string()))
    }
}

pub struct SessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }

    /// Turns for `session_id`, oldest first. A missing file is an empty history.
    pub async fn load(&self, session_id: &str) -> Result<Vec<Turn>> {
        let path = self.session_path(session_id)?;
        blocking(move || {
            if !path.exists() {
                return Ok(Vec::new());
            }
            read_turns(&path)
        })
        .await
    }

    /// Append turns to the session, creating it if needed.
    pub async fn append(&self, session_id: &str, turns: &[Turn]) -> Result<()> {
        let path = self.session_path(session_id)?;
        let turns = turns.to_vec();
        let _guard = self.write_lock.lock().await;

        let total = blocking(move || {
            let mut history = if path.exists() { read_turns(&path)? } else { Vec::new() };
            history.extend(turns);
            write_turns(&path, &history)?;
            Ok(history.len())
        })
        .await?;

        tracing::debug!(session_id, turns = total, "Session saved");
        Ok(())
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<HistoryMessage>> {
        Ok(self
            .load(session_id)
            .await?
            .into_iter()
            .map(|turn| HistoryMessage {
                message: turn.content,
                sender: turn.role.as_str().to_string(),
            })
            .collect())
    }

    /// Every stored session, most recently modified first.
    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        let dir = self.dir.clone();
        blocking(move || list_sessions(&dir)).await
    }
}

/// Run file work off the async worker threads.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AlimError::Io(std::io::Error::other(e)))?
}

fn list_sessions(dir: &Path) -> Result<Vec<SessionInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut sessions: Vec<(Option<SystemTime>, SessionInfo)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        // files the API could never address are not sessions
        let Some(session_id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| SESSION_ID_PATTERN.is_match(s))
        else {
            continue;
        };

        let modified = entry.metadata().and_then(|m| m.modified()).ok();
        let last_message_preview = match read_turns(&path) {
            Ok(turns) => turns.last().map(|turn| preview(&turn.content)),
            Err(e) => {
                tracing::warn!("Session file {} is unreadable: {}", path.display(), e);
                None
            }
        };

        sessions.push((
            modified,
            SessionInfo {
                session_id: session_id.to_string(),
                last_message_preview,
                timestamp: modified.map(format_timestamp),
            },
        ));
    }

    sessions.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(sessions.into_iter().map(|(_, info)| info).collect())
}

fn read_turns(path: &Path) -> Result<Vec<Turn>> {
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let stored: Vec<StoredTurn> = serde_json::from_str(&data)?;
    Ok(stored
        .into_iter()
        .filter_map(|t| match t.kind.as_str() {
            "human" => Some(Turn::human(t.content)),
            "ai" => Some(Turn::ai(t.content)),
            _ => None,
        })
        .collect())
}

fn write_turns(path: &Path, turns: &[Turn]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        let data = serde_json::to_string_pretty(turns)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_CHARS {
        let head: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

fn format_timestamp(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%Y-%m-%d %H:%M").to_string()
}
