//! Stable exit codes for agentpack CLI commands.

use crate::error::{
    IntegrityError, InvalidResponseError, ProtocolError, StepTimeoutError,
    WorkflowStagnationError, WorkflowStepLimitError,
};

/// Command succeeded; for `run`, the workflow completed.
pub const OK: i32 = 0;
/// Invalid workspace, config, input, or any other failure.
pub const INVALID: i32 = 1;
/// An artifact failed integrity verification.
pub const INTEGRITY: i32 = 2;
/// `agentpack run` ended in an aborted workflow.
pub const ABORTED: i32 = 3;

/// Exit code for a failed command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<IntegrityError>().is_some() {
        return INTEGRITY;
    }
    let aborted = err.downcast_ref::<ProtocolError>().is_some()
        || err.downcast_ref::<InvalidResponseError>().is_some()
        || err.downcast_ref::<WorkflowStagnationError>().is_some()
        || err.downcast_ref::<WorkflowStepLimitError>().is_some()
        || err.downcast_ref::<StepTimeoutError>().is_some();
    if aborted { ABORTED } else { INVALID }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn integrity_failures_map_to_their_own_code() {
        let err: anyhow::Error = IntegrityError::NoExpectedHash {
            path: PathBuf::from("dist/code.manifest.json"),
        }
        .into();
        assert_eq!(for_error(&err.context("verify dist")), INTEGRITY);
    }

    #[test]
    fn aborts_and_other_errors() {
        let err: anyhow::Error = WorkflowStepLimitError {
            max_steps: 20,
            history: Vec::new(),
        }
        .into();
        assert_eq!(for_error(&err), ABORTED);
        assert_eq!(for_error(&anyhow::anyhow!("bad config")), INVALID);
    }
}
