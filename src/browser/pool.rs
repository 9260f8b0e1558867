use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BrowserContext, BrowserDriver, BrowserProfile, Page};
use crate::error::{CrawlError, CrawlResult};

/// Bounded pool of browser sessions. The session bound is the system's
/// primary backpressure mechanism: `acquire` blocks once the bound is
/// reached, limited only by the caller's deadline.
pub struct BrowserPool {
    driver: Arc<dyn BrowserDriver>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleEntry>>,
    max_sessions: usize,
}

struct IdleEntry {
    id: Uuid,
    reuse_key: String,
    context: Box<dyn BrowserContext>,
    disconnected: watch::Receiver<bool>,
}

/// A leased browser session: one context plus its pool permit. Exclusively
/// owned by the leasing worker until released back to the pool.
pub struct BrowserSession {
    pub id: Uuid,
    profile: BrowserProfile,
    context: Box<dyn BrowserContext>,
    disconnected: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
}

impl BrowserSession {
    pub async fn new_page(&self) -> CrawlResult<Box<dyn Page>> {
        if self.is_disconnected() {
            return Err(CrawlError::SessionDisconnected);
        }
        self.context.new_page().await
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.borrow()
    }

    /// Signal the owning worker can select on alongside its task loop.
    pub fn disconnect_signal(&self) -> watch::Receiver<bool> {
        self.disconnected.clone()
    }

    pub fn profile(&self) -> &BrowserProfile {
        &self.profile
    }
}

impl BrowserPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, max_sessions: usize) -> Self {
        info!(
            "Browser pool created (driver: {}, bound: {})",
            driver.name(),
            max_sessions
        );
        Self {
            driver,
            semaphore: Arc::new(Semaphore::new(max_sessions)),
            idle: Mutex::new(Vec::new()),
            max_sessions,
        }
    }

    /// Lease a session matching the profile, launching a fresh context when
    /// no reusable idle session exists. Blocks while the pool is at its
    /// bound; errors only when `timeout` elapses first or the launch fails.
    pub async fn acquire(
        &self,
        profile: &BrowserProfile,
        timeout: Duration,
    ) -> CrawlResult<BrowserSession> {
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| CrawlError::PoolExhausted)?
            .map_err(|_| CrawlError::internal("browser pool semaphore closed"))?;

        // Prefer a live idle session with the same identity.
        if let Some(entry) = self.take_idle(&profile.reuse_key()).await {
            debug!("Reusing idle browser session {}", entry.id);
            return Ok(BrowserSession {
                id: entry.id,
                profile: profile.clone(),
                context: entry.context,
                disconnected: entry.disconnected,
                _permit: permit,
            });
        }

        // The bound covers every live context, idle ones included; idle
        // sessions of other profiles give way to the new launch.
        self.evict_idle_for_capacity().await;

        let context = self.driver.new_context(profile).await?;
        let disconnected = context.disconnected();
        let id = Uuid::new_v4();
        debug!("Launched browser session {}", id);

        Ok(BrowserSession {
            id,
            profile: profile.clone(),
            context,
            disconnected,
            _permit: permit,
        })
    }

    /// Return a session to the pool, or tear it down if its profile is
    /// single-use or its process has died. Dead sessions are never
    /// re-leased.
    pub async fn release(&self, mut session: BrowserSession) {
        if session.is_disconnected() {
            warn!("Discarding disconnected session {}", session.id);
            let _ = session.context.close().await;
            return;
        }
        if session.profile.single_use {
            debug!("Tearing down single-use session {}", session.id);
            let _ = session.context.close().await;
            return;
        }

        let mut idle = self.idle.lock().await;
        idle.push(IdleEntry {
            id: session.id,
            reuse_key: session.profile.reuse_key(),
            context: session.context,
            disconnected: session.disconnected,
        });
        // The permit drops with `session`, freeing a slot.
    }

    /// Close idle sessions that would push `idle + leased` past the
    /// bound once a new context launches. The caller already holds its
    /// permit, so the leased count includes the pending launch.
    async fn evict_idle_for_capacity(&self) {
        let leased = self.max_sessions - self.semaphore.available_permits();
        let mut idle = self.idle.lock().await;
        while !idle.is_empty() && idle.len() + leased > self.max_sessions {
            let mut entry = idle.remove(0);
            debug!("Closing idle session {} to stay within the session bound", entry.id);
            let _ = entry.context.close().await;
        }
    }

    async fn take_idle(&self, reuse_key: &str) -> Option<IdleEntry> {
        let mut idle = self.idle.lock().await;
        // Evict sessions whose process disconnected while idle.
        let mut dead = Vec::new();
        idle.retain_mut(|entry| {
            if *entry.disconnected.borrow() {
                dead.push(entry.id);
                false
            } else {
                true
            }
        });
        for id in dead {
            warn!("Evicted disconnected idle session {}", id);
        }
        let pos = idle.iter().position(|entry| entry.reuse_key == reuse_key)?;
        Some(idle.swap_remove(pos))
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tear down all idle sessions on shutdown.
    pub async fn close(&self) {
        let mut idle = self.idle.lock().await;
        for mut entry in idle.drain(..) {
            let _ = entry.context.close().await;
        }
        info!("Browser pool closed");
    }
}
