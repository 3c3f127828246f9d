use crate::db::models::RangeState;
use anyhow::{bail, Result};

/// Check if a state transition is valid
pub fn is_valid_transition(from: &RangeState, to: &RangeState) -> bool {
    use RangeState::*;

    match (from, to) {
        // Nothing ever goes back to the initial state
        (_, NeverDeployed) => false,

        // Starting an operation; a forced deploy may restart a running one
        (_, Deploying) => true,
        (_, Destroying) => true,

        // Operation outcomes
        (Deploying, Success | Error) => true,
        (Destroying, Destroyed | Error) => true,

        // Operator abort of the running playbook
        (Deploying | Destroying, Aborted) => true,

        // All other transitions are invalid
        _ => false,
    }
}

/// Validate a state transition and return an error if invalid
pub fn validate_transition(from: &RangeState, to: &RangeState) -> Result<()> {
    if !is_valid_transition(from, to) {
        bail!("Invalid range state transition from '{}' to '{}'", from, to);
    }
    Ok(())
}
