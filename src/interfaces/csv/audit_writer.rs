use crate::domain::audit::{DlqReplayAudit, ReplayMode};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

#[derive(Serialize)]
struct AuditRow<'a> {
    id: Uuid,
    event_id: &'a str,
    invoice_id: String,
    status: &'a str,
    reason: &'a str,
    mode: ReplayMode,
    operator: &'a str,
    success: bool,
    error: &'a str,
    created_at: DateTime<Utc>,
}

impl<'a> From<&'a DlqReplayAudit> for AuditRow<'a> {
    fn from(audit: &'a DlqReplayAudit) -> Self {
        Self {
            id: audit.id,
            event_id: &audit.event_id,
            invoice_id: audit.invoice_id.map(|id| id.to_string()).unwrap_or_default(),
            status: &audit.status,
            reason: &audit.reason,
            mode: audit.mode,
            operator: &audit.operator,
            success: audit.success,
            error: audit.error.as_deref().unwrap_or_default(),
            created_at: audit.created_at,
        }
    }
}

/// Writes replay audit rows as CSV, one row per operator action.
pub struct AuditWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> AuditWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes `audits` with a header row and flushes.
    pub fn write_audits<'a>(&mut self, audits: impl IntoIterator<Item = &'a DlqReplayAudit>) -> Result<()> {
        for audit in audits {
            self.writer.serialize(AuditRow::from(audit))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_audits() {
        let invoice_id = Uuid::new_v4();
        let audits = vec![
            DlqReplayAudit::new("e1", Some(invoice_id), "approved", "invoice not found", ReplayMode::Execute, "ops"),
            DlqReplayAudit::new("", None, "", "invalid_payload", ReplayMode::Execute, "ops").failed("bad json"),
        ];

        let mut buffer = Vec::new();
        AuditWriter::new(&mut buffer).write_audits(&audits).unwrap();
        let output = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(
            lines[0],
            "id,event_id,invoice_id,status,reason,mode,operator,success,error,created_at"
        );
        assert!(lines[1].contains(&format!("e1,{invoice_id},approved,invoice not found,execute,ops,true,,")));
        assert!(lines[2].contains(",,,,invalid_payload,execute,ops,false,bad json,"));
    }

    #[test]
    fn test_empty_report_has_no_rows() {
        let mut buffer = Vec::new();
        AuditWriter::new(&mut buffer).write_audits(&[]).unwrap();
        assert!(buffer.is_empty());
    }
}
