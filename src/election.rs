//! Master election between controller replicas.
//!
//! Every replica writes a vote to the coordination store and reads all
//! votes back each tick. The lowest-indexed replica present is first in
//! line. It becomes master once a majority votes for it and either every
//! replica agrees or the cooldown since the previous master disappeared has
//! passed.
//!
//! Only the lowest half of the replica indices can ever become master.

use std::collections::BTreeMap;
use tracing::{debug, info};

/// Replica index to the index it votes for.
pub type Votes = BTreeMap<u32, u32>;

#[derive(Debug, Clone)]
pub struct MasterElectionHandler {
    index: u32,
    total_count: u32,
    cooldown: u64,
    current_votes: Option<Votes>,
    next_votes: Option<Votes>,
    master_candidate: Option<u32>,
    followers: u32,
    master_gone_since: Option<u64>,
}

impl MasterElectionHandler {
    /// A fresh replica behaves as if the master vanished at `now`, so it
    /// does not claim mastership over a silent majority right away.
    pub fn new(index: u32, total_count: u32, cooldown: u64, now: u64) -> Self {
        Self {
            index,
            total_count: total_count.max(1),
            cooldown,
            current_votes: None,
            next_votes: None,
            master_candidate: None,
            followers: 0,
            master_gone_since: Some(now),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn controller_count(&self) -> u32 {
        self.total_count
    }

    pub fn set_controller_count(&mut self, count: u32) {
        self.total_count = count.max(1);
        if let Some(votes) = self.current_votes.take() {
            // Re-evaluate the last known votes against the new count.
            self.next_votes = Some(votes);
        }
    }

    pub fn set_cooldown(&mut self, cooldown: u64) {
        self.cooldown = cooldown;
    }

    /// Whether a replica index can ever become master.
    pub fn is_eligible(&self, index: u32) -> bool {
        index <= (self.total_count - 1) / 2
    }

    /// Queue vote data read from the store. It is processed by the next
    /// [`MasterElectionHandler::watch_master_election`].
    pub fn handle_vote_data(&mut self, votes: Votes) {
        if self.current_votes.as_ref() != Some(&votes) {
            self.next_votes = Some(votes);
        }
    }

    /// Process pending vote data. Returns the vote this replica should have
    /// in the store when it differs from what the store holds.
    pub fn watch_master_election(&mut self, now: u64) -> Option<u32> {
        let votes = self.next_votes.take()?;

        if let Some(master) = self.master(now) {
            if !votes.contains_key(&master) {
                info!(master, "master disappeared from coordination store");
                self.master_gone_since = Some(now);
            }
        }

        let desired_vote = match votes.first_key_value() {
            None => {
                self.master_candidate = None;
                self.followers = 0;
                self.index
            }
            Some((&first, &first_vote)) => {
                if first == first_vote && self.is_eligible(first) {
                    self.master_candidate = Some(first);
                    self.followers = votes.values().filter(|&&v| v == first).count() as u32;
                } else {
                    self.master_candidate = None;
                    self.followers = 0;
                }
                if first == self.index || !self.is_eligible(first) {
                    self.index
                } else {
                    first
                }
            }
        };

        debug!(
            index = self.index,
            candidate = ?self.master_candidate,
            followers = self.followers,
            total = self.total_count,
            "processed master votes"
        );

        let stored_vote = votes.get(&self.index).copied();
        self.current_votes = Some(votes);
        (stored_vote != Some(desired_vote)).then_some(desired_vote)
    }

    /// The current master, if any replica qualifies.
    pub fn master(&self, now: u64) -> Option<u32> {
        let candidate = self.master_candidate?;
        if 2 * self.followers <= self.total_count {
            return None;
        }
        if self.followers == self.total_count {
            return Some(candidate);
        }
        match self.master_gone_since {
            Some(gone) if gone + self.cooldown > now => None,
            _ => Some(candidate),
        }
    }

    pub fn is_master(&self, now: u64) -> bool {
        self.master(now) == Some(self.index)
    }

    /// Whether this replica is among the first `n` in election order.
    /// Without vote data, plain index order is assumed.
    pub fn is_among_nth_first(&self, n: u32) -> bool {
        match &self.current_votes {
            None => self.index < n,
            Some(votes) => votes
                .keys()
                .position(|&i| i == self.index)
                .is_some_and(|pos| (pos as u32) < n),
        }
    }

    /// Forget everything known about the election.
    pub fn lost_database_connection(&mut self, now: u64) {
        self.current_votes = None;
        self.next_votes = None;
        self.master_candidate = None;
        self.followers = 0;
        self.master_gone_since = Some(now);
    }

    /// One-line summary for logs and events.
    pub fn describe(&self, now: u64) -> String {
        match (self.master(now), self.master_candidate) {
            (Some(master), _) if master == self.index => format!(
                "This controller ({}) is master, {} of {} controllers agree",
                self.index, self.followers, self.total_count
            ),
            (Some(master), _) => format!("Controller {} is master", master),
            (None, Some(candidate)) => format!(
                "Controller {} is candidate with {} of {} votes",
                candidate, self.followers, self.total_count
            ),
            (None, None) => "No master candidate".to_string(),
        }
    }
}
