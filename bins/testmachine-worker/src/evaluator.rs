/// Result Evaluator - Strategy-Agnostic Classification
///
/// **Core Responsibility:**
/// Turn an `ExecutionOutcome` into the `TestResult` sent to the dispatcher.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about child processes
/// - Knows nothing about the connection
/// - Pure function: outcome → result
///
/// **Classification Rules:**
/// - Completed with exit code 0 → SUCCESS / 0
/// - Completed with any other exit code → FAILURE / that code, output verbatim
///   (assertion failures, runtime errors, collection errors are not told apart)
/// - TimedOut → FAILURE / 999
/// - InfrastructureFailed → ERROR / 500, reason as logs

use crate::engine::ExecutionOutcome;
use testmachine_common::types::TestResult;

pub fn evaluate(outcome: ExecutionOutcome) -> TestResult {
    match outcome {
        ExecutionOutcome::Completed { exit_code, logs } => TestResult::from_exit_code(exit_code, logs),
        ExecutionOutcome::TimedOut { logs } => TestResult::timeout(logs),
        ExecutionOutcome::InfrastructureFailed { reason } => TestResult::internal_error(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testmachine_common::types::TestStatus;

    fn completed(exit_code: i64, logs: &str) -> ExecutionOutcome {
        ExecutionOutcome::Completed {
            exit_code,
            logs: logs.to_string(),
        }
    }

    #[test]
    fn test_passing_suite() {
        let result = evaluate(completed(0, "1 passed"));
        assert_eq!(result.status(), TestStatus::Success);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.logs(), "1 passed");
    }

    #[test]
    fn test_failing_suite_keeps_runner_exit_code() {
        let result = evaluate(completed(1, "E   assert 150 == 50"));
        assert_eq!(result.status(), TestStatus::Failure);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.logs(), "E   assert 150 == 50");

        // Collection errors use whatever code the runner picked
        let result = evaluate(completed(2, "SyntaxError: expected ':'"));
        assert_eq!(result.status(), TestStatus::Failure);
        assert_eq!(result.exit_code(), 2);
    }

    #[test]
    fn test_signal_terminated_runner_is_a_failure() {
        let result = evaluate(completed(-9, ""));
        assert_eq!(result.status(), TestStatus::Failure);
        assert_eq!(result.exit_code(), -9);
    }

    #[test]
    fn test_guest_exit_code_matching_a_sentinel_is_still_a_failure() {
        let result = evaluate(completed(500, "sys.exit(500)"));
        assert_eq!(result.status(), TestStatus::Failure);
        assert_eq!(result.exit_code(), 500);
    }

    #[test]
    fn test_timeout() {
        let result = evaluate(ExecutionOutcome::TimedOut {
            logs: "Timeout".to_string(),
        });
        assert_eq!(result.status(), TestStatus::Failure);
        assert_eq!(result.exit_code(), 999);
    }

    #[test]
    fn test_infrastructure_failure() {
        let result = evaluate(ExecutionOutcome::infrastructure("No such file or directory (os error 2)"));
        assert_eq!(result.status(), TestStatus::Error);
        assert_eq!(result.exit_code(), 500);
        assert!(result.logs().contains("os error 2"));
    }

    #[test]
    fn test_status_never_disagrees_with_exit_code() {
        let outcomes = vec![
            completed(0, ""),
            completed(1, ""),
            completed(4, ""),
            completed(-15, ""),
            ExecutionOutcome::TimedOut { logs: String::new() },
            ExecutionOutcome::infrastructure("boom"),
        ];
        for outcome in outcomes {
            let result = evaluate(outcome);
            assert_eq!(result.status() == TestStatus::Success, result.exit_code() == 0);
        }
    }
}
