//! Append-only audit log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AuditEntityType {
    Invoice,
    Payment,
    Refund,
}

impl AuditEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Payment => "payment",
            Self::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    ConfirmPayment,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::ConfirmPayment => "confirm_payment",
        }
    }
}

/// One financial mutation. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub org_id: Uuid,
    pub entity_type: AuditEntityType,
    pub entity_id: Uuid,
    pub action: AuditAction,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        org_id: Uuid,
        entity_type: AuditEntityType,
        entity_id: Uuid,
        action: AuditAction,
        actor_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            org_id,
            entity_type,
            entity_id,
            action,
            actor_id: actor_id.into(),
            created_at: Utc::now(),
            payload,
        }
    }
}
