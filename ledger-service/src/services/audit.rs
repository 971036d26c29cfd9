//! Read-only access to the audit log.
//!
//! Entries are appended by the payment, refund and invoice services inside
//! their own units of work. Nothing here writes.

use crate::error::Result;
use crate::models::{AuditEntityType, AuditEntry};
use crate::services::store::LedgerStore;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

pub struct AuditLog<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> AuditLog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Entries for one entity, oldest first.
    #[instrument(skip(self))]
    pub async fn entries_for(
        &self,
        org_id: Uuid,
        entity_type: AuditEntityType,
        entity_id: Uuid,
    ) -> Result<Vec<AuditEntry>> {
        self.store
            .list_audit_entries(org_id, Some((entity_type, entity_id)))
            .await
    }

    /// Every entry for an organization, oldest first.
    #[instrument(skip(self))]
    pub async fn list(&self, org_id: Uuid) -> Result<Vec<AuditEntry>> {
        self.store.list_audit_entries(org_id, None).await
    }
}
