//! Pure merge-policy engine for profile facts.
//!
//! Backends call `resolve` inside their compare-and-swap loop so that every
//! implementation applies identical semantics. Duplicate values (content-hash
//! equality) are a no-op under every policy, which makes upserts idempotent
//! for repeated extraction runs over the same episode set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{FactProposal, FactVersion, ProfileFact};

/// How a proposed fact value is reconciled with an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Replace when the new confidence is at least the existing one;
    /// otherwise drop the proposal as a minority opinion.
    Overwrite,
    /// New value becomes current; the old value is pushed into a bounded
    /// history list.
    AppendHistory { depth: usize },
    /// Higher confidence wins. Exactly equal confidences with differing
    /// values are ambiguous and must be surfaced to the caller.
    Reject,
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::AppendHistory { depth: 5 }
    }
}

/// Outcome of resolving a proposal against the current fact.
#[derive(Debug, Clone)]
pub enum MergeDecision {
    /// No current fact for the key: create one.
    Create(ProfileFact),
    /// Replace the current fact with this one.
    Replace(ProfileFact),
    /// Proposal lost to a higher-confidence current value.
    DropMinority,
    /// Proposal is a duplicate of the current value.
    Unchanged,
    /// Equal confidences, differing values, policy is Reject.
    Ambiguous,
}

/// Resolve a proposal against the current fact under the given policy.
pub fn resolve(
    existing: Option<&ProfileFact>,
    proposal: &FactProposal,
    policy: MergePolicy,
    now: DateTime<Utc>,
) -> MergeDecision {
    let value_hash = proposal.value_hash();

    let current = match existing {
        None => return MergeDecision::Create(new_fact(proposal, value_hash, now)),
        Some(current) => current,
    };

    // Idempotence: identical value is a no-op regardless of policy. The
    // higher confidence is kept if the duplicate arrives more confidently.
    if current.value_hash == value_hash {
        if proposal.confidence > current.confidence {
            let mut updated = current.clone();
            updated.confidence = proposal.confidence;
            updated.updated_at = now;
            merge_provenance(&mut updated.source_episode_ids, &proposal.source_episode_ids);
            return MergeDecision::Replace(updated);
        }
        return MergeDecision::Unchanged;
    }

    match policy {
        MergePolicy::Overwrite => {
            if proposal.confidence >= current.confidence {
                MergeDecision::Replace(replace_value(current, proposal, value_hash, now, None))
            } else {
                MergeDecision::DropMinority
            }
        }
        MergePolicy::AppendHistory { depth } => MergeDecision::Replace(replace_value(
            current,
            proposal,
            value_hash,
            now,
            Some(depth),
        )),
        MergePolicy::Reject => {
            if proposal.confidence == current.confidence {
                MergeDecision::Ambiguous
            } else if proposal.confidence > current.confidence {
                MergeDecision::Replace(replace_value(current, proposal, value_hash, now, None))
            } else {
                MergeDecision::DropMinority
            }
        }
    }
}

fn new_fact(proposal: &FactProposal, value_hash: String, now: DateTime<Utc>) -> ProfileFact {
    ProfileFact {
        fact_id: Uuid::new_v4(),
        group_id: proposal.group_id.clone(),
        user_id: proposal.user_id.clone(),
        tag: proposal.tag.clone(),
        feature: proposal.feature.clone(),
        value: proposal.value.clone(),
        value_hash,
        confidence: proposal.confidence,
        source_episode_ids: proposal.source_episode_ids.clone(),
        embedding: proposal.embedding.clone(),
        history: Vec::new(),
        version: 1,
        created_at: now,
        updated_at: now,
    }
}

fn replace_value(
    current: &ProfileFact,
    proposal: &FactProposal,
    value_hash: String,
    now: DateTime<Utc>,
    history_depth: Option<usize>,
) -> ProfileFact {
    let mut updated = current.clone();

    if let Some(depth) = history_depth {
        updated.history.insert(
            0,
            FactVersion {
                value: current.value.clone(),
                confidence: current.confidence,
                source_episode_ids: current.source_episode_ids.clone(),
                recorded_at: current.updated_at,
            },
        );
        updated.history.truncate(depth);
    }

    updated.value = proposal.value.clone();
    updated.value_hash = value_hash;
    updated.confidence = proposal.confidence;
    updated.source_episode_ids = proposal.source_episode_ids.clone();
    merge_provenance(&mut updated.source_episode_ids, &current.source_episode_ids);
    if proposal.embedding.is_some() {
        updated.embedding = proposal.embedding.clone();
    }
    updated.updated_at = now;
    updated
}

/// Union provenance sets, preserving first-seen order.
fn merge_provenance(target: &mut Vec<Uuid>, extra: &[Uuid]) {
    for id in extra {
        if !target.contains(id) {
            target.push(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(value: serde_json::Value, confidence: f64) -> FactProposal {
        FactProposal {
            group_id: "g1".into(),
            user_id: "u1".into(),
            tag: "preference".into(),
            feature: "contact_channel".into(),
            value,
            confidence,
            source_episode_ids: vec![Uuid::new_v4()],
            embedding: None,
        }
    }

    fn existing(value: serde_json::Value, confidence: f64) -> ProfileFact {
        let p = proposal(value, confidence);
        match resolve(None, &p, MergePolicy::Overwrite, Utc::now()) {
            MergeDecision::Create(fact) => fact,
            other => panic!("expected Create, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_fact_is_created() {
        let p = proposal(serde_json::json!("email"), 0.8);
        assert!(matches!(
            resolve(None, &p, MergePolicy::Reject, Utc::now()),
            MergeDecision::Create(_)
        ));
    }

    #[test]
    fn test_duplicate_value_is_unchanged_under_every_policy() {
        let fact = existing(serde_json::json!("email"), 0.8);
        let p = proposal(serde_json::json!("email"), 0.8);
        for policy in [
            MergePolicy::Overwrite,
            MergePolicy::AppendHistory { depth: 5 },
            MergePolicy::Reject,
        ] {
            assert!(matches!(
                resolve(Some(&fact), &p, policy, Utc::now()),
                MergeDecision::Unchanged
            ));
        }
    }

    #[test]
    fn test_duplicate_value_with_higher_confidence_raises_confidence() {
        let fact = existing(serde_json::json!("email"), 0.5);
        let p = proposal(serde_json::json!("email"), 0.9);
        match resolve(Some(&fact), &p, MergePolicy::Overwrite, Utc::now()) {
            MergeDecision::Replace(updated) => {
                assert_eq!(updated.confidence, 0.9);
                assert_eq!(updated.value, serde_json::json!("email"));
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    #[test]
    fn test_overwrite_drops_minority_opinion() {
        let fact = existing(serde_json::json!("email"), 0.9);
        let p = proposal(serde_json::json!("phone"), 0.4);
        assert!(matches!(
            resolve(Some(&fact), &p, MergePolicy::Overwrite, Utc::now()),
            MergeDecision::DropMinority
        ));
    }

    #[test]
    fn test_overwrite_replaces_on_equal_confidence() {
        let fact = existing(serde_json::json!("email"), 0.7);
        let p = proposal(serde_json::json!("phone"), 0.7);
        match resolve(Some(&fact), &p, MergePolicy::Overwrite, Utc::now()) {
            MergeDecision::Replace(updated) => {
                assert_eq!(updated.value, serde_json::json!("phone"));
                assert!(updated.history.is_empty());
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    #[test]
    fn test_append_history_keeps_bounded_history() {
        let mut fact = existing(serde_json::json!("v0"), 0.5);
        for i in 1..=8 {
            let p = proposal(serde_json::json!(format!("v{i}")), 0.5);
            match resolve(
                Some(&fact),
                &p,
                MergePolicy::AppendHistory { depth: 5 },
                Utc::now(),
            ) {
                MergeDecision::Replace(updated) => fact = updated,
                other => panic!("expected Replace, got {other:?}"),
            }
        }
        assert_eq!(fact.value, serde_json::json!("v8"));
        assert_eq!(fact.history.len(), 5);
        // Newest superseded value first.
        assert_eq!(fact.history[0].value, serde_json::json!("v7"));
    }

    #[test]
    fn test_reject_flags_equal_confidence_conflict() {
        let fact = existing(serde_json::json!("email"), 0.7);
        let p = proposal(serde_json::json!("phone"), 0.7);
        assert!(matches!(
            resolve(Some(&fact), &p, MergePolicy::Reject, Utc::now()),
            MergeDecision::Ambiguous
        ));
    }

    #[test]
    fn test_reject_lets_higher_confidence_win() {
        let fact = existing(serde_json::json!("email"), 0.6);
        let p = proposal(serde_json::json!("phone"), 0.8);
        assert!(matches!(
            resolve(Some(&fact), &p, MergePolicy::Reject, Utc::now()),
            MergeDecision::Replace(_)
        ));
    }

    #[test]
    fn test_provenance_is_unioned_on_replace() {
        let fact = existing(serde_json::json!("email"), 0.5);
        let p = proposal(serde_json::json!("phone"), 0.9);
        match resolve(Some(&fact), &p, MergePolicy::Overwrite, Utc::now()) {
            MergeDecision::Replace(updated) => {
                assert_eq!(updated.source_episode_ids.len(), 2);
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }
}
