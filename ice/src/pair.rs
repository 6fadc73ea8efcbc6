use std::time::Instant;

use crate::agent::Role;
use crate::transaction::Transaction;

/// connectivity check state of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// an in-flight connectivity check on a pair.
///
/// the encoded request is kept so retransmissions put identical bytes
/// on the wire under the same transaction id.
#[derive(Debug, Clone)]
pub struct Check {
    pub transaction: Transaction,
    pub message: Vec<u8>,
    /// the check carries USE-CANDIDATE.
    pub nominating: bool,
    /// the agent's role when the check went out; a 487 only swaps the
    /// role if it has not changed since.
    pub role: Role,
}

impl Check {
    pub fn new(message: Vec<u8>, transaction: Transaction, nominating: bool, role: Role) -> Self {
        Self {
            transaction,
            message,
            nominating,
            role,
        }
    }
}

/// an ordered (local, remote) candidate pair.
///
/// candidates are referenced by index into the agent's candidate
/// vectors, so appending a freshly discovered peer-reflexive candidate
/// cannot invalidate existing pairs.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: usize,
    pub remote: usize,
    pub priority: u64,
    pub state: CheckState,
    /// nomination confirmed on this pair.
    pub nominated: bool,
    /// a USE-CANDIDATE arrived (or is owed) before the pair succeeded.
    pub nominate_on_success: bool,
    /// a triggered check arrived while one was in flight; run one more
    /// on completion.
    pub recheck: bool,
    pub check: Option<Check>,
}

impl CandidatePair {
    pub fn new(local: usize, remote: usize, priority: u64) -> Self {
        Self {
            local,
            remote,
            priority,
            state: CheckState::Frozen,
            nominated: false,
            nominate_on_success: false,
            recheck: false,
            check: None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.check.as_ref().map(|check| check.transaction.deadline)
    }
}

/// RFC 8445 6.1.2.3 pair priority.
///
/// `g` is the controlling side's candidate priority, `d` the
/// controlled side's.
pub fn pair_priority(g: u32, d: u32) -> u64 {
    let (min, max) = (g.min(d) as u64, g.max(d) as u64);
    (min << 32) + 2 * max + u64::from(g > d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_symmetry() {
        // equal candidate priorities differ only in the role bit, and
        // the controlling side wins it.
        let p = 2130706431u32;
        assert_eq!(pair_priority(p, p), (p as u64) * (1u64 << 32) + 2 * (p as u64));

        let controlling = pair_priority(100, 50);
        let controlled = pair_priority(50, 100);
        assert_eq!(controlling, controlled + 1);
    }

    #[test]
    fn ordering_prefers_higher_candidates() {
        assert!(pair_priority(200, 200) > pair_priority(200, 100));
        assert!(pair_priority(200, 100) > pair_priority(100, 100));
    }
}
