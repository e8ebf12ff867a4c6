//! # Voting Polls
//!
//! Application-layer polls riding on the mesh: create a poll, cast votes,
//! list and analyze results. The registry enforces one vote per
//! (poll, user) pair and rejects votes on inactive polls or unknown
//! options.
//!
//! Poll state is plain data (serde round-trips through the persistence
//! files); the registry adds the bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::identity::{now_ms, PeerId};

/// A voting poll.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VotingPoll {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Options in creation order.
    pub options: Vec<String>,
    /// Option -> tally.
    pub votes: HashMap<String, u64>,
    pub creator_id: PeerId,
    pub created_at_ms: u64,
    pub is_active: bool,
}

impl VotingPoll {
    /// Build a poll from a comma-separated option list. Empty fragments are
    /// dropped; at least one option must remain.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        options_csv: &str,
        creator_id: PeerId,
    ) -> Result<Self, PollError> {
        let options: Vec<String> = options_csv
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        if options.is_empty() {
            return Err(PollError::NoOptions);
        }

        let votes = options.iter().map(|o| (o.clone(), 0)).collect();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            options,
            votes,
            creator_id,
            created_at_ms: now_ms(),
            is_active: true,
        })
    }

    pub fn total_votes(&self) -> u64 {
        self.votes.values().sum()
    }

    /// The option with the most votes, ties broken by option order.
    pub fn leader(&self) -> Option<(&str, u64)> {
        let mut best: Option<(&str, u64)> = None;
        for option in &self.options {
            let count = self.votes.get(option).copied().unwrap_or(0);
            if best.map_or(true, |(_, n)| count > n) {
                best = Some((option, count));
            }
        }
        best
    }

    /// Vote share per option, in percent. All zeros for an empty poll.
    pub fn percentages(&self) -> HashMap<String, f64> {
        let total = self.total_votes();
        self.options
            .iter()
            .map(|option| {
                let count = self.votes.get(option).copied().unwrap_or(0);
                let share = if total == 0 {
                    0.0
                } else {
                    count as f64 / total as f64 * 100.0
                };
                (option.clone(), share)
            })
            .collect()
    }

    fn add_vote(&mut self, option: &str) -> Result<(), PollError> {
        match self.votes.get_mut(option) {
            Some(count) => {
                *count += 1;
                Ok(())
            }
            None => Err(PollError::UnknownOption(option.to_string())),
        }
    }

    /// Close the poll and return the winning option.
    pub fn finalize_by_majority(&mut self) -> Option<String> {
        self.is_active = false;
        self.leader().map(|(option, _)| option.to_string())
    }
}

/// One cast vote, kept for the one-vote-per-user rule and persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollVote {
    pub id: String,
    pub poll_id: String,
    pub user_id: PeerId,
    pub option: String,
    pub timestamp_ms: u64,
}

/// Analysis of one poll for the `poll analyze` surface.
#[derive(Clone, Debug, Serialize)]
pub struct PollAnalysis {
    pub poll_id: String,
    pub title: String,
    pub is_active: bool,
    pub total_votes: u64,
    pub leader: Option<String>,
    pub leader_votes: u64,
    pub percentages: HashMap<String, f64>,
}

/// Errors from poll operations. Usage-taxonomy: surfaced to the caller as
/// user-visible strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    NotFound(String),
    Inactive(String),
    UnknownOption(String),
    AlreadyVoted,
    NoOptions,
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::NotFound(id) => write!(f, "poll {id} not found"),
            PollError::Inactive(id) => write!(f, "poll {id} is no longer active"),
            PollError::UnknownOption(option) => write!(f, "unknown option: {option}"),
            PollError::AlreadyVoted => write!(f, "user already voted in this poll"),
            PollError::NoOptions => write!(f, "poll needs at least one option"),
        }
    }
}

impl std::error::Error for PollError {}

struct RegistryState {
    polls: HashMap<String, VotingPoll>,
    /// Poll id -> cast votes, in arrival order.
    votes: HashMap<String, Vec<PollVote>>,
}

/// In-memory poll registry.
pub struct PollRegistry {
    state: Mutex<RegistryState>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                polls: HashMap::new(),
                votes: HashMap::new(),
            }),
        }
    }

    /// Restore a registry from persisted state.
    pub fn from_parts(
        polls: HashMap<String, VotingPoll>,
        votes: HashMap<String, Vec<PollVote>>,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState { polls, votes }),
        }
    }

    pub fn create(
        &self,
        title: &str,
        description: &str,
        options_csv: &str,
        creator_id: PeerId,
    ) -> Result<VotingPoll, PollError> {
        let poll = VotingPoll::new(title, description, options_csv, creator_id)?;
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.polls.insert(poll.id.clone(), poll.clone());
        info!(poll = %poll.id, title = %poll.title, "created poll");
        Ok(poll)
    }

    pub fn vote(&self, poll_id: &str, user_id: PeerId, option: &str) -> Result<(), PollError> {
        let mut state = self.state.lock().expect("registry lock poisoned");

        let cast = state.votes.entry(poll_id.to_string()).or_default();
        if cast.iter().any(|v| v.user_id == user_id) {
            return Err(PollError::AlreadyVoted);
        }

        let poll = state
            .polls
            .get_mut(poll_id)
            .ok_or_else(|| PollError::NotFound(poll_id.to_string()))?;
        if !poll.is_active {
            return Err(PollError::Inactive(poll_id.to_string()));
        }
        poll.add_vote(option)?;

        let vote = PollVote {
            id: Uuid::new_v4().to_string(),
            poll_id: poll_id.to_string(),
            user_id,
            option: option.to_string(),
            timestamp_ms: now_ms(),
        };
        state
            .votes
            .get_mut(poll_id)
            .expect("entry created above")
            .push(vote);
        Ok(())
    }

    pub fn get(&self, poll_id: &str) -> Option<VotingPoll> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .polls
            .get(poll_id)
            .cloned()
    }

    /// All polls, newest first.
    pub fn list(&self) -> Vec<VotingPoll> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut polls: Vec<VotingPoll> = state.polls.values().cloned().collect();
        polls.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        polls
    }

    pub fn analyze(&self, poll_id: &str) -> Result<PollAnalysis, PollError> {
        let state = self.state.lock().expect("registry lock poisoned");
        let poll = state
            .polls
            .get(poll_id)
            .ok_or_else(|| PollError::NotFound(poll_id.to_string()))?;
        let leader = poll.leader();
        Ok(PollAnalysis {
            poll_id: poll.id.clone(),
            title: poll.title.clone(),
            is_active: poll.is_active,
            total_votes: poll.total_votes(),
            leader: leader.map(|(o, _)| o.to_string()),
            leader_votes: leader.map(|(_, n)| n).unwrap_or(0),
            percentages: poll.percentages(),
        })
    }

    pub fn finalize(&self, poll_id: &str) -> Result<Option<String>, PollError> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let poll = state
            .polls
            .get_mut(poll_id)
            .ok_or_else(|| PollError::NotFound(poll_id.to_string()))?;
        Ok(poll.finalize_by_majority())
    }

    /// Export for persistence: (polls, votes).
    pub fn export(&self) -> (HashMap<String, VotingPoll>, HashMap<String, Vec<PollVote>>) {
        let state = self.state.lock().expect("registry lock poisoned");
        (state.polls.clone(), state.votes.clone())
    }
}

impl Default for PollRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_poll() -> (PollRegistry, String) {
        let registry = PollRegistry::new();
        let poll = registry
            .create("Where to meet?", "weekly sync", "cafe,park,office", PeerId::new("creator"))
            .expect("create should succeed");
        (registry, poll.id)
    }

    #[test]
    fn create_parses_options() {
        let (registry, id) = registry_with_poll();
        let poll = registry.get(&id).expect("poll exists");
        assert_eq!(poll.options, vec!["cafe", "park", "office"]);
        assert!(poll.is_active);
        assert_eq!(poll.total_votes(), 0);
    }

    #[test]
    fn empty_options_rejected() {
        let registry = PollRegistry::new();
        assert_eq!(
            registry
                .create("t", "d", " , ,", PeerId::new("c"))
                .expect_err("no options"),
            PollError::NoOptions
        );
    }

    #[test]
    fn voting_and_analysis() {
        let (registry, id) = registry_with_poll();
        registry.vote(&id, PeerId::new("u1"), "cafe").expect("vote");
        registry.vote(&id, PeerId::new("u2"), "cafe").expect("vote");
        registry.vote(&id, PeerId::new("u3"), "park").expect("vote");

        let analysis = registry.analyze(&id).expect("analyze");
        assert_eq!(analysis.total_votes, 3);
        assert_eq!(analysis.leader.as_deref(), Some("cafe"));
        assert_eq!(analysis.leader_votes, 2);
        let cafe_share = analysis.percentages.get("cafe").copied().unwrap_or(0.0);
        assert!((cafe_share - 66.666).abs() < 0.1);
    }

    #[test]
    fn one_vote_per_user() {
        let (registry, id) = registry_with_poll();
        registry.vote(&id, PeerId::new("u1"), "cafe").expect("first vote");
        assert_eq!(
            registry.vote(&id, PeerId::new("u1"), "park").expect_err("second vote"),
            PollError::AlreadyVoted
        );
    }

    #[test]
    fn unknown_option_and_poll_rejected() {
        let (registry, id) = registry_with_poll();
        assert!(matches!(
            registry.vote(&id, PeerId::new("u1"), "moon"),
            Err(PollError::UnknownOption(_))
        ));
        assert!(matches!(
            registry.vote("missing", PeerId::new("u1"), "cafe"),
            Err(PollError::NotFound(_))
        ));
    }

    #[test]
    fn finalized_poll_rejects_votes() {
        let (registry, id) = registry_with_poll();
        registry.vote(&id, PeerId::new("u1"), "park").expect("vote");
        let winner = registry.finalize(&id).expect("finalize");
        assert_eq!(winner.as_deref(), Some("park"));
        assert!(matches!(
            registry.vote(&id, PeerId::new("u2"), "cafe"),
            Err(PollError::Inactive(_))
        ));
    }

    #[test]
    fn leader_ties_break_by_option_order() {
        let (registry, id) = registry_with_poll();
        registry.vote(&id, PeerId::new("u1"), "park").expect("vote");
        registry.vote(&id, PeerId::new("u2"), "cafe").expect("vote");
        let analysis = registry.analyze(&id).expect("analyze");
        assert_eq!(analysis.leader.as_deref(), Some("cafe"));
    }

    #[test]
    fn export_roundtrips_through_from_parts() {
        let (registry, id) = registry_with_poll();
        registry.vote(&id, PeerId::new("u1"), "cafe").expect("vote");
        let (polls, votes) = registry.export();

        let restored = PollRegistry::from_parts(polls, votes);
        assert_eq!(restored.get(&id).expect("poll exists").total_votes(), 1);
        assert_eq!(
            restored.vote(&id, PeerId::new("u1"), "park").expect_err("dup"),
            PollError::AlreadyVoted
        );
    }
}
