//! Audit sink for state-changing control operations (spec §4.H).
//!
//! Kept outside this crate's scope by design: [`AuditOperation`] is a thin
//! trait callers implement against whatever audit trail they already run
//! (a log sink, a message queue, a database table). [`NoopAudit`] is the
//! default when no trail is wired up.

use crate::key::InstanceKey;

pub trait AuditOperation: Send + Sync {
    /// Record that `action` was taken against `key`, with a free-form
    /// human-readable `details` string (e.g. "read_only=true").
    fn audit(&self, action: &str, key: &InstanceKey, details: &str);
}

/// Discards every audit entry. The default for deployments that don't
/// need one.
pub struct NoopAudit;

impl AuditOperation for NoopAudit {
    fn audit(&self, _action: &str, _key: &InstanceKey, _details: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingAudit {
        pub entries: Mutex<Vec<String>>,
    }

    impl AuditOperation for RecordingAudit {
        fn audit(&self, action: &str, key: &InstanceKey, details: &str) {
            self.entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(format!("{action} {key} {details}"));
        }
    }

    #[test]
    fn noop_audit_accepts_any_call() {
        let audit = NoopAudit;
        audit.audit("set_read_only", &InstanceKey::new("db1", 3306), "true");
    }

    #[test]
    fn recording_audit_captures_entries() {
        let audit = RecordingAudit::default();
        audit.audit("kill_query", &InstanceKey::new("db1", 3306), "pid=42");
        assert_eq!(
            audit.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len(),
            1
        );
    }
}
