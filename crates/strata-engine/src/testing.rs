//! Store fixtures for tests that need to observe or disturb storage traffic.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use strata_core::{
    Change, Context, ContextError, ContextKey, ContextStore, DeleteRequest, Level, PutRequest, Result,
    StagedWrite, TransactionError,
};

/// Wraps a store and counts calls, so tests can tell cache hits from store reads.
pub struct CountingStore<S = strata_store::SqliteContextStore> {
    inner: S,
    gets: AtomicUsize,
    writes: AtomicUsize,
    write_delay: Option<Duration>,
    fail_writes: AtomicBool,
}

impl<S: ContextStore> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            write_delay: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Sleep before every write, to exercise deadlines.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Make every subsequent write fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.gets.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }

    fn before_write(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ContextError::Storage("injected write failure".into()));
        }
        Ok(())
    }
}

impl<S: ContextStore> ContextStore for CountingStore<S> {
    fn get(&self, key: &ContextKey) -> Result<Context> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn put(&self, req: &PutRequest) -> Result<Vec<Change>> {
        self.before_write()?;
        self.inner.put(req)
    }

    fn delete(&self, req: &DeleteRequest) -> Result<Vec<Change>> {
        self.before_write()?;
        self.inner.delete(req)
    }

    fn children(&self, key: &ContextKey) -> Result<Vec<Context>> {
        self.inner.children(key)
    }

    fn descendants(&self, key: &ContextKey) -> Result<Vec<Context>> {
        self.inner.descendants(key)
    }

    fn list(&self, level: Level, limit: usize) -> Result<Vec<Context>> {
        self.inner.list(level, limit)
    }

    fn apply_transaction(
        &self,
        writes: &[StagedWrite],
        deadline: Option<Instant>,
    ) -> Result<Vec<Vec<Change>>, TransactionError> {
        self.before_write()
            .map_err(|error| TransactionError { index: None, error })?;
        self.inner.apply_transaction(writes, deadline)
    }
}
