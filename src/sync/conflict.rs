// Conflict resolution policy.
//
// A pure mapping from a detected conflict plus a strategy to a resolution.
// Determinism is load-bearing: identical inputs must always produce the
// same output, so the `timestamp` strategy compares the modification
// timestamps carried on the conflict itself rather than consulting any
// clock.

use crate::model::{ConflictRecord, ResolutionStrategy};
use serde_json::Value;

/// Outcome of resolving (or declining to resolve) a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The winning value, when the strategy produced one.
    pub resolved_value: Option<Value>,
    pub resolved: bool,
    pub strategy_applied: ResolutionStrategy,
}

/// Resolve a field conflict under the given strategy.
///
/// `manual_review` never picks a value; the record is surfaced for an
/// explicit operator decision and the engine must not re-derive one.
pub fn resolve(conflict: &ConflictRecord, strategy: ResolutionStrategy) -> Resolution {
    match strategy {
        ResolutionStrategy::CentralWins => Resolution {
            resolved_value: Some(conflict.remote_value.clone()),
            resolved: true,
            strategy_applied: strategy,
        },
        ResolutionStrategy::ClientWins => Resolution {
            resolved_value: Some(conflict.local_value.clone()),
            resolved: true,
            strategy_applied: strategy,
        },
        ResolutionStrategy::Timestamp => {
            // Later modification wins; ties fall back to the central value.
            let value = if conflict.local_modified_at > conflict.remote_modified_at {
                conflict.local_value.clone()
            } else {
                conflict.remote_value.clone()
            };
            Resolution {
                resolved_value: Some(value),
                resolved: true,
                strategy_applied: strategy,
            }
        }
        ResolutionStrategy::ManualReview => Resolution {
            resolved_value: None,
            resolved: false,
            strategy_applied: strategy,
        },
    }
}
