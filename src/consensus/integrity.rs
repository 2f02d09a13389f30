//! Cross-node integrity checks.
//!
//! Test support: verifies that committed log positions never disagree across
//! the nodes of a cluster. A disagreement means the protocol implementation
//! itself is broken -- by the log matching property, two logs that commit
//! different terms at the same index have diverged irrecoverably.

use super::log::Index;
use super::node::{Node, Term};
use crate::error::{Error, Result};

/// Checks that the given per-node committed `(index, term)` sequences agree:
/// for every pair of nodes, the common committed prefix must be identical.
/// Nodes may lag (shorter sequences are fine); they may never conflict.
pub fn check_commit_agreement(committed: &[Vec<(Index, Term)>]) -> Result<()> {
    for (a, first) in committed.iter().enumerate() {
        for (b, second) in committed.iter().enumerate().skip(a + 1) {
            for position in 0..first.len().min(second.len()) {
                if first[position] != second[position] {
                    let ((ia, ta), (ib, tb)) = (first[position], second[position]);
                    return Err(Error::Internal(format!(
                        "commit disagreement between nodes {a} and {b}: \
                         {ia}@{ta} vs {ib}@{tb}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Checks commit agreement across live nodes.
pub fn check_nodes(nodes: &[&Node]) -> Result<()> {
    let committed: Vec<_> = nodes.iter().map(|node| node.committed_entries()).collect();
    check_commit_agreement(&committed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_allows_lagging_prefixes() {
        let committed = vec![
            vec![(1, 1), (2, 1), (3, 2)],
            vec![(1, 1), (2, 1)],
            vec![],
        ];
        check_commit_agreement(&committed).unwrap();
    }

    #[test]
    fn conflicting_terms_are_detected() {
        let committed = vec![vec![(1, 1), (2, 1)], vec![(1, 1), (2, 2)]];
        let err = check_commit_agreement(&committed).unwrap_err();
        assert!(matches!(err, Error::Internal(_)), "unexpected error {err:?}");
    }
}
