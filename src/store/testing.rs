//! Store wrapper for engine tests: hides a path from listings and can
//! drop the session right before the next watch is armed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CoordinationStore, CreateOutcome, Entry, EntryKind, LeaseId, MemoryConnection, PendingWatch,
    StoreBackend, WatchScope,
};
use crate::error::Result;

pub struct ScriptedStore {
    inner: Arc<MemoryConnection>,
    hidden: Option<String>,
    /// Listings left that hide `hidden`; `u32::MAX` hides it for good
    hide_listings: AtomicU32,
    expire_before_watch: AtomicBool,
}

impl ScriptedStore {
    pub fn new(inner: Arc<MemoryConnection>) -> Self {
        Self {
            inner,
            hidden: None,
            hide_listings: AtomicU32::new(0),
            expire_before_watch: AtomicBool::new(false),
        }
    }

    /// Leave `path` out of the next `listings` listings
    pub fn hide(mut self, path: &str, listings: u32) -> Self {
        self.hidden = Some(path.to_string());
        self.hide_listings = AtomicU32::new(listings);
        self
    }

    /// Expire the session just before the next watch is armed
    pub fn expire_before_next_watch(self) -> Self {
        self.expire_before_watch.store(true, Ordering::SeqCst);
        self
    }

    fn hides_this_listing(&self) -> bool {
        self.hide_listings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(n),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl CoordinationStore for ScriptedStore {
    fn backend(&self) -> StoreBackend {
        self.inner.backend()
    }

    fn session_epoch(&self) -> u64 {
        self.inner.session_epoch()
    }

    async fn create(&self, path: &str, value: &str, kind: EntryKind) -> Result<CreateOutcome> {
        self.inner.create(path, value, kind).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.inner.delete(path).await
    }

    async fn get(&self, path: &str) -> Result<Option<Entry>> {
        self.inner.get(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let mut entries = self.inner.list(prefix).await?;
        if let Some(hidden) = &self.hidden {
            if self.hides_this_listing() {
                entries.retain(|e| &e.path != hidden);
            }
        }
        Ok(entries)
    }

    async fn watch(&self, path: &str, scope: WatchScope) -> Result<PendingWatch> {
        if self.expire_before_watch.swap(false, Ordering::SeqCst) {
            self.inner.expire_session().await;
        }
        self.inner.watch(path, scope).await
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.inner.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.inner.revoke_lease(lease).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
