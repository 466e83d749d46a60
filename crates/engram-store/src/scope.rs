//! Scope model: the (group, agents, users, session) partition key for all
//! memory operations.
//!
//! Two scopes with the same group and session identify the same partition
//! regardless of the participant sets, so the canonical key is derived from
//! those two fields alone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Identity tuple that partitions every episode and profile fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Tenant / organization identifier.
    pub group_id: String,
    /// Agents participating in the session.
    pub agent_ids: BTreeSet<String>,
    /// Users participating in the session.
    pub user_ids: BTreeSet<String>,
    /// Continuous-conversation identifier.
    pub session_id: String,
}

impl Scope {
    /// Single-user, single-agent scope.
    pub fn new(
        group_id: impl Into<String>,
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            agent_ids: BTreeSet::from([agent_id.into()]),
            user_ids: BTreeSet::from([user_id.into()]),
            session_id: session_id.into(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_ids.insert(user_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_ids.insert(agent_id.into());
        self
    }

    /// Validate the tuple for episodic operations.
    pub fn validate(&self) -> StoreResult<()> {
        if self.group_id.is_empty() {
            return Err(StoreError::InvalidScope("group_id is empty".to_string()));
        }
        if self.session_id.is_empty() {
            return Err(StoreError::InvalidScope("session_id is empty".to_string()));
        }
        Ok(())
    }

    /// Validate the tuple for profile-bearing operations, which additionally
    /// require at least one user.
    pub fn validate_for_profile(&self) -> StoreResult<()> {
        self.validate()?;
        if self.user_ids.is_empty() {
            return Err(StoreError::InvalidScope(
                "profile operations require at least one user_id".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonical partition/lock key. Length-prefixed so that no two distinct
    /// (group_id, session_id) pairs can collide.
    pub fn canonical_key(&self) -> String {
        format!(
            "{}#{}/{}#{}",
            self.group_id.len(),
            self.group_id,
            self.session_id.len(),
            self.session_id
        )
    }
}
