use std::sync::Arc;

use tracing::{debug, instrument};

use strata_core::settings::ValidationSettings;
use strata_core::{
    Change, ChangeEvent, ContextError, ContextStore, DeleteRequest, PutRequest, Result,
};

use crate::cache::CacheLayer;
use crate::notify::NotificationPublisher;

/// Everything a committed write must go through: payload rules before the
/// store, then cache invalidation and event fan-out after it.
pub struct WritePath {
    store: Arc<dyn ContextStore>,
    cache: Arc<CacheLayer>,
    publisher: Arc<NotificationPublisher>,
    validation: ValidationSettings,
}

impl WritePath {
    pub fn new(
        store: Arc<dyn ContextStore>,
        cache: Arc<CacheLayer>,
        publisher: Arc<NotificationPublisher>,
        validation: ValidationSettings,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            validation,
        }
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<NotificationPublisher> {
        &self.publisher
    }

    /// Payload rules for the target level.
    pub fn validate(&self, req: &PutRequest) -> Result<()> {
        for field in self.validation.required_fields(req.key.level) {
            let present = req
                .payload
                .get(field)
                .is_some_and(|v| !v.is_null() && v.as_str().map_or(true, |s| !s.trim().is_empty()));
            if !present {
                return Err(ContextError::validation(Some(&req.key), format!("{field} is required")));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, req), fields(key = %req.key, change_type = %req.change_type))]
    pub fn put(&self, req: &PutRequest) -> Result<Vec<Change>> {
        self.validate(req)?;
        let changes = self.store.put(req)?;
        self.commit(&changes);
        Ok(changes)
    }

    #[instrument(skip(self, req), fields(key = %req.key, cascade = req.cascade))]
    pub fn delete(&self, req: &DeleteRequest) -> Result<Vec<Change>> {
        let changes = self.store.delete(req)?;
        self.commit(&changes);
        Ok(changes)
    }

    /// Post-commit effects, in order: version index and invalidation, then events.
    pub fn commit(&self, changes: &[Change]) {
        self.cache.apply_changes(changes);
        for change in changes {
            let delivered = self.publisher.publish(&ChangeEvent::from_change(change));
            debug!(key = %change.context.key, change_type = %change.change_type, delivered, "change published");
        }
    }

    pub fn publish(&self, event: &ChangeEvent) -> usize {
        self.publisher.publish(event)
    }
}
