use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{ContractError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Generated,
    PartnerSigned,
    OfficerSigned,
    PartnerSigningFailed,
    OfficerSigningFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub contract_id: Uuid,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

/// Append-only trail, one JSON line per lifecycle transition, independent of
/// the document bytes. Used for dispute resolution; nothing here is ever
/// rewritten or deleted.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        AuditLog { path }
    }

    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| ContractError::StorageFailed(format!("audit event serialize: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Best-effort append: a broken audit log must not mask the primary error
    /// on a failure path, and must not turn an already committed transition
    /// into a reported failure on a success path.
    pub fn append_best_effort(&self, event: &AuditEvent) {
        if let Err(e) = self.append(event) {
            error!(contract_id = %event.contract_id, error = %e, "audit append failed");
        }
    }

    pub fn events_for(&self, contract_id: Uuid) -> Result<Vec<AuditEvent>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in raw.lines() {
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) if event.contract_id == contract_id => events.push(event),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping unparseable audit line"),
            }
        }
        Ok(events)
    }
}

pub fn event(contract_id: Uuid, event_type: AuditEventType, metadata: Value) -> AuditEvent {
    AuditEvent {
        contract_id,
        event_type,
        timestamp: Utc::now(),
        metadata,
    }
}
