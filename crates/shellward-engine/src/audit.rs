//! Execution audit trail.
//!
//! Every enforcement decision is logged through [`AuditLog`]: allowed
//! and denied attempts go to the `shellward::audit` tracing target, and
//! denials are additionally appended to the configured block log file.
//! Audit failures are reported as warnings and never propagate to the
//! caller.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use shellward_policy::Verdict;

/// Sink for enforcement decisions and execution errors.
pub struct AuditLog {
    block_log: Option<Mutex<File>>,
}

impl AuditLog {
    /// Opens the audit log, appending to `block_log_path` when one is
    /// configured. A path that cannot be opened is reported and then
    /// ignored so execution can proceed.
    pub fn new(block_log_path: Option<&Path>) -> Self {
        let block_log = block_log_path.and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to open block log, denials will not be persisted"
                    );
                    None
                }
            }
        });
        Self { block_log }
    }

    /// Records one command attempt and its verdict.
    pub fn log_attempt(&self, run_id: Uuid, command: &str, args: &[String], verdict: &Verdict) {
        match verdict {
            Verdict::Allow => {
                tracing::info!(
                    target: "shellward::audit",
                    run_id = %run_id,
                    command,
                    args = ?args,
                    outcome = "allowed",
                    "command allowed"
                );
            }
            Verdict::Deny(reason) => {
                tracing::warn!(
                    target: "shellward::audit",
                    run_id = %run_id,
                    command,
                    args = ?args,
                    outcome = "denied",
                    reason = %reason,
                    "command denied"
                );
                self.append_block_line(run_id, command, args, reason);
            }
        }
    }

    /// Records an execution failure that was not a policy denial.
    pub fn log_error(&self, run_id: Uuid, context: &str, error: &dyn Display) {
        tracing::warn!(
            target: "shellward::audit",
            run_id = %run_id,
            context,
            error = %error,
            "execution error"
        );
    }

    fn append_block_line(&self, run_id: Uuid, command: &str, args: &[String], reason: &str) {
        let Some(block_log) = &self.block_log else {
            return;
        };
        let line = format!(
            "{} BLOCKED run={} command={} args={:?} reason={}\n",
            Utc::now().to_rfc3339(),
            run_id,
            command,
            args,
            reason
        );
        let mut file = block_log.lock();
        if let Err(err) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            tracing::warn!(error = %err, "failed to append to block log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_attempt_appends_block_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.log");
        let audit = AuditLog::new(Some(&path));
        let run_id = Uuid::new_v4();

        audit.log_attempt(
            run_id,
            "rm",
            &["-rf".to_string(), "/".to_string()],
            &Verdict::Deny("Remove command is not allowed".to_string()),
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("BLOCKED"));
        assert!(contents.contains(&format!("run={run_id}")));
        assert!(contents.contains("command=rm"));
        assert!(contents.contains("Remove command is not allowed"));
    }

    #[test]
    fn test_allowed_attempt_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.log");
        let audit = AuditLog::new(Some(&path));

        audit.log_attempt(Uuid::new_v4(), "ls", &[], &Verdict::Allow);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn test_unwritable_block_log_path_is_tolerated() {
        let audit = AuditLog::new(Some(Path::new("/nonexistent-dir/blocked.log")));
        // Must not panic and must still log the attempt.
        audit.log_attempt(
            Uuid::new_v4(),
            "rm",
            &[],
            &Verdict::Deny("denied".to_string()),
        );
    }

    #[test]
    fn test_no_block_log_configured() {
        let audit = AuditLog::new(None);
        audit.log_attempt(
            Uuid::new_v4(),
            "rm",
            &[],
            &Verdict::Deny("denied".to_string()),
        );
    }
}
