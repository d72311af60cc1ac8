use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::bail;
use tokio::sync::mpsc;

use super::{AssistantClient, SessionConfig, SessionId, StreamChunk};

/// Pool of reusable assistant sessions.
///
/// Sessions are created on demand, handed out as [`SessionLease`]s, and
/// returned to the pool when the lease drops. [`SessionManager::shutdown`]
/// closes everything; leases dropped afterwards close their session.
pub struct SessionManager {
    client: Arc<dyn AssistantClient>,
    idle: Mutex<Vec<(SessionConfig, SessionId)>>,
    shut_down: AtomicBool,
}

impl SessionManager {
    pub fn new(client: Arc<dyn AssistantClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            idle: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn client(&self) -> &Arc<dyn AssistantClient> {
        &self.client
    }

    /// Borrow an idle session with this config, or open a new one.
    pub async fn acquire(self: &Arc<Self>, config: &SessionConfig) -> anyhow::Result<SessionLease> {
        if self.shut_down.load(Ordering::SeqCst) {
            bail!("Session manager has been shut down");
        }
        let pooled = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.iter()
                .position(|(c, _)| c == config)
                .map(|i| idle.swap_remove(i).1)
        };
        let id = match pooled {
            Some(id) => {
                tracing::debug!(session = %id, role = %config.role, "Reusing assistant session");
                id
            }
            None => {
                let id = self.client.create_session(config).await?;
                tracing::debug!(session = %id, role = %config.role, "Opened assistant session");
                id
            }
        };
        Ok(SessionLease {
            manager: Arc::clone(self),
            config: config.clone(),
            id: Some(id),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Close every pooled session and refuse new leases.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<_> = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        for (_, id) in drained {
            if let Err(e) = self.client.close(&id).await {
                tracing::warn!(session = %id, error = %e, "Failed to close assistant session");
            }
        }
    }

    fn release(&self, config: SessionConfig, id: SessionId) {
        if !self.shut_down.load(Ordering::SeqCst) {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((config, id));
            return;
        }
        let client = Arc::clone(&self.client);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client.close(&id).await {
                    tracing::warn!(session = %id, error = %e, "Failed to close assistant session");
                }
            });
        }
    }
}

/// A session on loan from a [`SessionManager`].
pub struct SessionLease {
    manager: Arc<SessionManager>,
    config: SessionConfig,
    id: Option<SessionId>,
}

impl SessionLease {
    pub fn id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    fn session(&self) -> anyhow::Result<&SessionId> {
        match &self.id {
            Some(id) => Ok(id),
            None => bail!("Session lease already discarded"),
        }
    }

    pub async fn send(&self, prompt: &str) -> anyhow::Result<String> {
        self.manager.client.send(self.session()?, prompt).await
    }

    pub async fn send_streaming(
        &self,
        prompt: &str,
        chunks: mpsc::UnboundedSender<StreamChunk>,
    ) -> anyhow::Result<String> {
        self.manager
            .client
            .send_streaming(self.session()?, prompt, chunks)
            .await
    }

    /// Close the session instead of returning it to the pool.
    pub async fn discard(mut self) {
        if let Some(id) = self.id.take()
            && let Err(e) = self.manager.client.close(&id).await
        {
            tracing::warn!(session = %id, error = %e, "Failed to close assistant session");
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.manager.release(self.config.clone(), id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl AssistantClient for Counting {
        async fn create_session(&self, _config: &SessionConfig) -> anyhow::Result<SessionId> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(SessionId::new(format!("s-{}", n)))
        }
        async fn send(&self, session: &SessionId, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("{}:{}", session, prompt))
        }
        async fn close(&self, _session: &SessionId) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(role: &str) -> SessionConfig {
        SessionConfig::new(role, "/repo")
    }

    #[tokio::test]
    async fn test_lease_returns_to_pool_and_is_reused() {
        let client = Arc::new(Counting::default());
        let manager = SessionManager::new(client.clone());

        let first = manager.acquire(&config("generate")).await.unwrap();
        assert_eq!(first.send("x").await.unwrap(), "s-0:x");
        drop(first);
        assert_eq!(manager.idle_count(), 1);

        let second = manager.acquire(&config("generate")).await.unwrap();
        assert_eq!(second.id(), Some(&SessionId::new("s-0")));
        assert_eq!(client.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_config_opens_new_session() {
        let client = Arc::new(Counting::default());
        let manager = SessionManager::new(client.clone());
        drop(manager.acquire(&config("generate")).await.unwrap());
        let review = manager.acquire(&config("review")).await.unwrap();
        assert_eq!(review.id(), Some(&SessionId::new("s-1")));
        assert_eq!(manager.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_leases_get_distinct_sessions() {
        let client = Arc::new(Counting::default());
        let manager = SessionManager::new(client.clone());
        let a = manager.acquire(&config("generate")).await.unwrap();
        let b = manager.acquire(&config("generate")).await.unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_rejects_acquire() {
        let client = Arc::new(Counting::default());
        let manager = SessionManager::new(client.clone());
        drop(manager.acquire(&config("generate")).await.unwrap());
        drop(manager.acquire(&config("review")).await.unwrap());

        manager.shutdown().await;
        assert_eq!(client.closed.load(Ordering::SeqCst), 2);
        assert_eq!(manager.idle_count(), 0);
        assert!(manager.acquire(&config("generate")).await.is_err());
    }

    #[tokio::test]
    async fn test_discard_closes_instead_of_pooling() {
        let client = Arc::new(Counting::default());
        let manager = SessionManager::new(client.clone());
        let lease = manager.acquire(&config("generate")).await.unwrap();
        lease.discard().await;
        assert_eq!(manager.idle_count(), 0);
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
    }
}
