//! Append-only audit trail.
//!
//! Every decision, every market outcome, and every cycle failure lands here,
//! in order. The log is owned by the orchestrator; external readers get
//! clones of committed entries, newest first. Within one cycle the physical
//! append order carries no meaning — across cycles, timestamps are monotonic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::grid::GridSnapshot;
use crate::market::MarketTransaction;
use crate::policy::Decision;
use crate::revenue::RevenueEstimate;

/// How a market protocol run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketOutcomeKind {
    Confirmed,
    NoOffer,
    Failed,
    Abandoned,
}

impl std::fmt::Display for MarketOutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketOutcomeKind::Confirmed => write!(f, "confirmed"),
            MarketOutcomeKind::NoOffer => write!(f, "no-offer"),
            MarketOutcomeKind::Failed => write!(f, "failed"),
            MarketOutcomeKind::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// One record in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    /// A per-job scheduling decision.
    Decision(Decision),
    /// Outcome of one market protocol run, tagged with the cycle's snapshot
    /// for traceability.
    Market {
        timestamp: DateTime<Utc>,
        outcome: MarketOutcomeKind,
        estimate: RevenueEstimate,
        transaction: Option<MarketTransaction>,
        reason: Option<String>,
        snapshot: GridSnapshot,
    },
    /// A cycle-level failure (grid fetch, invariant violation).
    CycleError {
        timestamp: DateTime<Utc>,
        error: String,
    },
}

impl AuditEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEntry::Decision(decision) => decision.timestamp,
            AuditEntry::Market { timestamp, .. } => *timestamp,
            AuditEntry::CycleError { timestamp, .. } => *timestamp,
        }
    }
}

/// The append-only log. No entry is ever mutated or removed.
#[derive(Debug, Default)]
pub struct DecisionAuditLog {
    entries: Vec<AuditEntry>,
}

impl DecisionAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
    }

    /// The `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        self.entries.iter().rev().take(n).cloned().collect()
    }

    /// The `n` most recent scheduling decisions, newest first.
    pub fn recent_decisions(&self, n: usize) -> Vec<Decision> {
        self.entries
            .iter()
            .rev()
            .filter_map(|entry| match entry {
                AuditEntry::Decision(decision) => Some(decision.clone()),
                _ => None,
            })
            .take(n)
            .collect()
    }

    /// The most recent market outcome, if any protocol run has happened.
    pub fn last_market_outcome(&self) -> Option<&AuditEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| matches!(entry, AuditEntry::Market { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DecisionAction;

    fn decision_entry(job_id: &str) -> AuditEntry {
        AuditEntry::Decision(Decision::for_test(job_id, DecisionAction::ExecuteNow, None))
    }

    #[test]
    fn append_preserves_order() {
        let mut log = DecisionAuditLog::new();
        log.append(decision_entry("job_a"));
        log.append(AuditEntry::CycleError {
            timestamp: Utc::now(),
            error: "grid unavailable".into(),
        });
        log.append(decision_entry("job_b"));

        assert_eq!(log.len(), 3);
        let timestamps: Vec<_> = log.recent(3).iter().map(|e| e.timestamp()).collect();
        // recent() is newest first.
        assert!(timestamps[0] >= timestamps[2]);
    }

    #[test]
    fn recent_limits_and_reverses() {
        let mut log = DecisionAuditLog::new();
        for i in 0..5 {
            log.append(decision_entry(&format!("job_{i}")));
        }
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        match &recent[0] {
            AuditEntry::Decision(d) => assert_eq!(d.job_id, "job_4"),
            _ => panic!("expected decision"),
        }
    }

    #[test]
    fn recent_decisions_skips_other_kinds() {
        let mut log = DecisionAuditLog::new();
        log.append(decision_entry("job_a"));
        log.append(AuditEntry::CycleError {
            timestamp: Utc::now(),
            error: "boom".into(),
        });
        log.append(decision_entry("job_b"));

        let decisions = log.recent_decisions(10);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].job_id, "job_b");
        assert_eq!(decisions[1].job_id, "job_a");
    }

    #[test]
    fn entry_serialization_tags_kind() {
        let entry = AuditEntry::CycleError {
            timestamp: Utc::now(),
            error: "grid unavailable".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""kind":"cycle_error"#));
    }
}
