//! Bounded connection pool.
//!
//! Every backend hands out connections through a [`ConnectionPool`]. The pool
//! is a counting semaphore: a [`Connection`] owns one permit, so the number of
//! live connections never exceeds the pool size, and a caller that asks for
//! one more suspends until a connection is dropped or the acquire timeout
//! elapses.
//!
//! A dropped connection also leaves its id behind in the pool, so a backend
//! can discard per-connection state of callers that never called `close`.

use crate::error::{StorageError, StorageResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Identifier of a pooled connection, unique per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the connection returns its slot to the pool.
pub struct Connection {
    id: ConnectionId,
    released: Arc<Mutex<Vec<ConnectionId>>>,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    /// Returns the connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.released.lock().push(self.id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// A fixed-size pool of backend connections.
#[derive(Debug)]
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Option<Duration>,
    next_id: AtomicU64,
    released: Arc<Mutex<Vec<ConnectionId>>>,
}

impl ConnectionPool {
    /// Creates a pool with `size` slots.
    ///
    /// With `acquire_timeout` set to `None` callers wait indefinitely.
    pub fn new(size: usize, acquire_timeout: Option<Duration>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            acquire_timeout,
            next_id: AtomicU64::new(1),
            released: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Checks out a connection, suspending while the pool is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PoolExhausted`] if no slot frees up within
    /// the acquire timeout, and [`StorageError::Unavailable`] if the pool
    /// was closed.
    pub async fn acquire(&self) -> StorageResult<Connection> {
        let semaphore = Arc::clone(&self.semaphore);
        let permit = match self.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, semaphore.acquire_owned())
                .await
                .map_err(|_| StorageError::PoolExhausted { timeout })?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|e| StorageError::Unavailable(format!("connection pool closed: {e}")))?;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Connection {
            id,
            released: Arc::clone(&self.released),
            _permit: permit,
        })
    }

    /// Returns the pool size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of connections currently checked out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }

    /// Drains the ids of connections dropped since the last call.
    pub fn take_released(&self) -> Vec<ConnectionId> {
        std::mem::take(&mut *self.released.lock())
    }

    /// Closes the pool; pending and future acquires fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let pool = ConnectionPool::new(2, None);
        let c1 = pool.acquire().await.unwrap();
        let c2 = pool.acquire().await.unwrap();
        assert_ne!(c1.id(), c2.id());
        assert_eq!(pool.in_use(), 2);

        drop(c1);
        assert_eq!(pool.in_use(), 1);
        drop(c2);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = ConnectionPool::new(1, Some(Duration::from_millis(20)));
        let _held = pool.acquire().await.unwrap();

        let result = pool.acquire().await;
        assert!(matches!(result, Err(StorageError::PoolExhausted { .. })));
    }

    #[tokio::test]
    async fn waiter_resumes_after_release() {
        let pool = Arc::new(ConnectionPool::new(1, None));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        let id = waiter.await.unwrap().unwrap();
        assert_eq!(id, ConnectionId(2));
    }

    #[tokio::test]
    async fn dropped_connections_are_reported_once() {
        let pool = ConnectionPool::new(2, None);
        let c1 = pool.acquire().await.unwrap();
        let c2 = pool.acquire().await.unwrap();
        let (id1, id2) = (c1.id(), c2.id());

        drop(c2);
        drop(c1);
        assert_eq!(pool.take_released(), vec![id2, id1]);
        assert!(pool.take_released().is_empty());
    }

    #[tokio::test]
    async fn closed_pool_is_unavailable() {
        let pool = ConnectionPool::new(1, None);
        pool.close();
        assert!(matches!(
            pool.acquire().await,
            Err(StorageError::Unavailable(_))
        ));
    }
}
