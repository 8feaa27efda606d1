// Fixed conventions shared by the worker and anything that speaks its protocol

/// Role announced in the handshake sent right after connecting
pub const WORKER_ROLE: &str = "TestMachine";

/// Module name the test suite imports the unit under test from
pub const CLASS_MODULE: &str = "class_to_test";

/// Filename of the unit under test inside a workspace
pub const CLASS_FILENAME: &str = "class_to_test.py";

/// Filename of the test suite inside a workspace
pub const TEST_FILENAME: &str = "test_class.py";

/// Exit code reported when the execution was forcibly stopped on timeout
pub const TIMEOUT_EXIT_CODE: i64 = 999;

/// Exit code reported for infrastructure failures (never produced by guest code)
pub const INTERNAL_ERROR_EXIT_CODE: i64 = 500;

pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
