//! # Opportunistic Persistence
//!
//! Three optional pretty-printed JSON files in the data directory:
//! `messages.json`, `polls.json`, `votes.json`. The core never requires
//! them; each is read once at startup if present and written best-effort
//! afterwards.
//!
//! The data directory also holds `session.key`: the 32-byte channel
//! bootstrap secret, hex-encoded and created with mode 0600 on first boot
//! when the operator does not supply one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::message::Message;
use crate::voting::{PollVote, VotingPoll};

/// Directory name under the user's home when no data dir is configured.
const DEFAULT_DATA_DIR: &str = ".meshweave";

const MESSAGES_FILE: &str = "messages.json";
const POLLS_FILE: &str = "polls.json";
const VOTES_FILE: &str = "votes.json";
const SESSION_KEY_FILE: &str = "session.key";

/// File-backed store rooted at the data directory.
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Open (and create if needed) the data directory. `None` resolves to
    /// `~/.meshweave`.
    pub fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .context("HOME is not set and no data dir was configured")?;
                home.join(DEFAULT_DATA_DIR)
            }
        };
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ------------------------------------------------------------------
    // Message log
    // ------------------------------------------------------------------

    pub fn load_messages(&self) -> Result<Vec<Message>> {
        self.load_json(MESSAGES_FILE)
    }

    pub fn save_messages(&self, messages: &[Message]) -> Result<()> {
        self.save_json(MESSAGES_FILE, &messages)
    }

    pub fn append_message(&self, message: &Message) -> Result<()> {
        let mut messages = self.load_messages()?;
        messages.push(message.clone());
        self.save_messages(&messages)
    }

    // ------------------------------------------------------------------
    // Polls
    // ------------------------------------------------------------------

    pub fn load_polls(&self) -> Result<HashMap<String, VotingPoll>> {
        self.load_json(POLLS_FILE)
    }

    pub fn save_polls(&self, polls: &HashMap<String, VotingPoll>) -> Result<()> {
        self.save_json(POLLS_FILE, polls)
    }

    pub fn load_votes(&self) -> Result<HashMap<String, Vec<PollVote>>> {
        self.load_json(VOTES_FILE)
    }

    pub fn save_votes(&self, votes: &HashMap<String, Vec<PollVote>>) -> Result<()> {
        self.save_json(VOTES_FILE, votes)
    }

    // ------------------------------------------------------------------
    // Bootstrap key
    // ------------------------------------------------------------------

    /// Read the channel bootstrap secret, generating and persisting a fresh
    /// one (mode 0600) on first boot.
    pub fn load_or_create_bootstrap_key(&self) -> Result<[u8; 32]> {
        let path = self.data_dir.join(SESSION_KEY_FILE);
        if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let bytes = hex::decode(text.trim())
                .with_context(|| format!("{} is not valid hex", path.display()))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("{} must hold 32 bytes", path.display()))?;
            debug!(path = %path.display(), "loaded bootstrap key");
            return Ok(key);
        }

        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        fs::write(&path, hex::encode(key))
            .with_context(|| format!("failed to write {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to chmod {}", path.display()))?;
        }
        info!(path = %path.display(), "generated bootstrap key at first boot");
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn load_json<T>(&self, file: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let path = self.data_dir.join(file);
        if !path.exists() {
            return Ok(T::default());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn save_json<T: serde::Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.data_dir.join(file);
        let text = serde_json::to_string_pretty(value).context("failed to encode JSON")?;
        fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))
    }
}
