//! Background trigger service.
//!
//! Asks the host platform to run the sync routine outside the normal
//! application lifecycle. The platform is an optional capability behind
//! [`BackgroundPlatform`]; without it every call degrades to `false`.
//!
//! Registration records are kept in memory for display only. The platform
//! decides whether and when a trigger actually fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chapel_types::{BackgroundSyncRegistration, RegistrationStatus, SyncTag};

use crate::error::{Error, Result};
use crate::sync::SyncEngine;

/// Registrations older than this are pruned.
pub const REGISTRATION_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Host facility for deferred sync execution.
#[async_trait]
pub trait BackgroundPlatform: Send + Sync {
    /// Whether the host can run background triggers at all.
    fn is_supported(&self) -> bool;

    /// Ask the host to fire `tag` at some later time.
    async fn register(&self, tag: SyncTag) -> Result<()>;
}

/// Platform without background execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPlatform;

#[async_trait]
impl BackgroundPlatform for NoopPlatform {
    fn is_supported(&self) -> bool {
        false
    }

    async fn register(&self, _tag: SyncTag) -> Result<()> {
        Err(Error::invalid_config("background sync is not supported"))
    }
}

/// Background execution inside a long-running process.
///
/// A registered tag is delivered to the paired receiver after `delay`;
/// [`BackgroundRunner`] turns deliveries into sync cycles.
#[derive(Debug, Clone)]
pub struct InProcessPlatform {
    tx: mpsc::UnboundedSender<SyncTag>,
    delay: Duration,
}

impl InProcessPlatform {
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<SyncTag>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, delay }, rx)
    }
}

#[async_trait]
impl BackgroundPlatform for InProcessPlatform {
    fn is_supported(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn register(&self, tag: SyncTag) -> Result<()> {
        if self.tx.is_closed() {
            return Err(Error::Cancelled);
        }
        let tx = self.tx.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(tag).is_err() {
                debug!("Background runner gone, dropping {}", tag);
            }
        });
        Ok(())
    }
}

/// Requests and tracks background sync triggers.
pub struct BackgroundSyncService {
    platform: Arc<dyn BackgroundPlatform>,
    registrations: RwLock<HashMap<SyncTag, BackgroundSyncRegistration>>,
    last_registered: RwLock<HashMap<SyncTag, Instant>>,
}

impl BackgroundSyncService {
    pub fn new(platform: Arc<dyn BackgroundPlatform>) -> Self {
        Self {
            platform,
            registrations: RwLock::new(HashMap::new()),
            last_registered: RwLock::new(HashMap::new()),
        }
    }

    /// Service with no platform support.
    pub fn unsupported() -> Self {
        Self::new(Arc::new(NoopPlatform))
    }

    pub fn is_supported(&self) -> bool {
        self.platform.is_supported()
    }

    pub async fn register_general_sync(&self) -> bool {
        self.register(SyncTag::General, false).await
    }

    pub async fn register_type_sync(&self, tag: SyncTag) -> bool {
        self.register(tag, false).await
    }

    /// Register every tag immediately, ignoring cooldowns.
    ///
    /// Returns whether at least one registration was accepted.
    pub async fn force_sync(&self) -> bool {
        if !self.is_supported() {
            debug!("Background sync unsupported, force_sync is a no-op");
            return false;
        }
        let mut any = false;
        for tag in SyncTag::ALL {
            any |= self.register(tag, true).await;
        }
        any
    }

    async fn register(&self, tag: SyncTag, force: bool) -> bool {
        if !self.is_supported() {
            return false;
        }

        if !force
            && let Some(last) = self.last_registered.read().await.get(&tag)
            && last.elapsed() < tag.min_interval()
        {
            debug!("Background sync {} registered recently, skipping", tag);
            return false;
        }

        match self.platform.register(tag).await {
            Ok(()) => {
                self.last_registered
                    .write()
                    .await
                    .insert(tag, Instant::now());
                self.registrations.write().await.insert(
                    tag,
                    BackgroundSyncRegistration::pending(tag, OffsetDateTime::now_utc()),
                );
                info!("Registered background sync {}", tag);
                true
            }
            Err(e) => {
                warn!("Background sync registration for {} failed: {}", tag, e);
                false
            }
        }
    }

    /// Registrations for display, oldest first.
    pub async fn registrations(&self) -> Vec<BackgroundSyncRegistration> {
        let mut list: Vec<_> = self.registrations.read().await.values().cloned().collect();
        list.sort_by_key(|r| r.registered_at);
        list
    }

    pub async fn mark_completed(&self, tag: SyncTag) {
        if let Some(reg) = self.registrations.write().await.get_mut(&tag) {
            reg.status = RegistrationStatus::Completed;
            reg.last_update = Some(OffsetDateTime::now_utc());
            reg.last_error = None;
        }
    }

    pub async fn mark_failed(&self, tag: SyncTag, error: &str) {
        if let Some(reg) = self.registrations.write().await.get_mut(&tag) {
            reg.status = RegistrationStatus::Failed;
            reg.last_update = Some(OffsetDateTime::now_utc());
            reg.retry_count += 1;
            reg.last_error = Some(error.to_string());
        }
    }

    /// Drop registrations older than [`REGISTRATION_RETENTION`].
    pub async fn cleanup_old_registrations(&self) -> usize {
        let Ok(retention) = time::Duration::try_from(REGISTRATION_RETENTION) else {
            return 0;
        };
        let cutoff = OffsetDateTime::now_utc() - retention;
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|_, r| r.registered_at >= cutoff);
        before - registrations.len()
    }
}

/// Runs sync cycles for tags delivered by [`InProcessPlatform`].
pub struct BackgroundRunner;

impl BackgroundRunner {
    pub fn spawn(
        mut rx: mpsc::UnboundedReceiver<SyncTag>,
        engine: SyncEngine,
        service: Arc<BackgroundSyncService>,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Background runner cancelled, shutting down");
                        break;
                    }
                    tag = rx.recv() => {
                        let Some(tag) = tag else { break };
                        debug!("Background trigger {} fired", tag);
                        let outcome = engine.sync_now().await;
                        match (outcome.error, outcome.skipped) {
                            (Some(e), _) => service.mark_failed(tag, &e).await,
                            (None, Some(reason)) => {
                                service.mark_failed(tag, &reason.to_string()).await
                            }
                            (None, None) => service.mark_completed(tag).await,
                        }
                        service.cleanup_old_registrations().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingPlatform {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl BackgroundPlatform for CountingPlatform {
        fn is_supported(&self) -> bool {
            true
        }

        async fn register(&self, _tag: SyncTag) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::transport("background", "denied"))
            } else {
                Ok(())
            }
        }
    }

    fn counting(fail: bool) -> (Arc<CountingPlatform>, BackgroundSyncService) {
        let platform = Arc::new(CountingPlatform {
            calls: AtomicU32::new(0),
            fail,
        });
        (platform.clone(), BackgroundSyncService::new(platform))
    }

    #[tokio::test]
    async fn test_unsupported_degrades_to_false() {
        let service = BackgroundSyncService::unsupported();
        assert!(!service.is_supported());
        assert!(!service.register_general_sync().await);
        assert!(!service.register_type_sync(SyncTag::Tasks).await);
        assert!(!service.force_sync().await);
        assert!(service.registrations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldowns() {
        let (platform, service) = counting(false);
        assert!(service.register_general_sync().await);
        assert!(!service.register_general_sync().await);
        assert!(service.register_type_sync(SyncTag::Users).await);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(service.register_type_sync(SyncTag::Users).await);
        assert!(!service.register_general_sync().await);

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(service.register_general_sync().await);
        assert_eq!(platform.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_force_ignores_cooldown() {
        let (platform, service) = counting(false);
        assert!(service.register_general_sync().await);
        assert!(service.force_sync().await);
        assert_eq!(platform.calls.load(Ordering::SeqCst), 5);
        assert_eq!(service.registrations().await.len(), 4);
    }

    #[tokio::test]
    async fn test_platform_failure_returns_false() {
        let (_, service) = counting(true);
        assert!(!service.register_general_sync().await);
        assert!(!service.force_sync().await);
        assert!(service.registrations().await.is_empty());
    }

    #[tokio::test]
    async fn test_status_updates() {
        let (_, service) = counting(false);
        service.register_type_sync(SyncTag::Calendar).await;

        service.mark_failed(SyncTag::Calendar, "offline").await;
        let reg = &service.registrations().await[0];
        assert_eq!(reg.status, RegistrationStatus::Failed);
        assert_eq!(reg.retry_count, 1);

        service.mark_completed(SyncTag::Calendar).await;
        let reg = &service.registrations().await[0];
        assert_eq!(reg.status, RegistrationStatus::Completed);
        assert!(reg.last_error.is_none());
        assert_eq!(service.cleanup_old_registrations().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_process_platform_delivers_after_delay() {
        let (platform, mut rx) = InProcessPlatform::new(Duration::from_secs(2));
        assert!(platform.is_supported());
        platform.register(SyncTag::Tasks).await.unwrap();

        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rx.recv().await, Some(SyncTag::Tasks));

        drop(rx);
        assert!(!platform.is_supported());
    }
}
