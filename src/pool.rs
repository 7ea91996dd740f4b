//! Pooled database handles.
//!
//! Opening a database connection is expensive, so handles are cached in
//! per-descriptor factories and lent out for the duration of one unit of
//! work. Recovery is attached to the borrow itself: [`PooledHandle`] is an
//! owned guard that rolls the handle back and returns it to the free list
//! when dropped, so a request that returns early, fails, or simply forgets
//! to call [`PooledHandle::release`] cannot leak a connection.
//!
//! Invariant maintained after every operation:
//! `allocated == handles currently borrowed + free list length`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to open database connection to '{conninfo}': {message}")]
    Connect { conninfo: String, message: String },

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("no database backend configured")]
    NoBackend,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// A live connection to the database backend.
pub trait DbHandle: Send {
    /// Abandon any open transaction, returning the handle to a clean state.
    fn rollback(&mut self) -> Result<(), DbError>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<(), DbError>;
}

/// Opens new handles for a connection descriptor.
pub trait DbConnector: Send + Sync {
    fn open(&self, conninfo: &str) -> Result<Box<dyn DbHandle>, DbError>;
}

/// Connector used when no database backend is configured. Every open fails
/// with [`DbError::NoBackend`], so applications that never touch the pool
/// run fine without one.
#[derive(Default)]
pub struct NullConnector;

impl DbConnector for NullConnector {
    fn open(&self, _conninfo: &str) -> Result<Box<dyn DbHandle>, DbError> {
        Err(DbError::NoBackend)
    }
}

// ============================================================================
// Borrow Bookkeeping
// ============================================================================

/// Set of handles currently borrowed on behalf of one session, keyed by a
/// unique borrow tag. Shared with each outstanding guard so recovery can
/// deregister itself without reaching back into the session lock.
pub type BorrowedHandles = Arc<Mutex<HashMap<u64, String>>>;

/// Tags are process-wide so a guard can never collide with another borrow.
static NEXT_BORROW_TAG: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Factory
// ============================================================================

/// A keyed cache of handles for one connection descriptor.
pub struct DbFactory {
    conninfo: String,
    inner: Mutex<FactoryInner>,
}

struct FactoryInner {
    /// Total handles ever opened and still owned by this factory.
    allocated: usize,
    /// Handles not currently lent out.
    free: Vec<Box<dyn DbHandle>>,
}

impl DbFactory {
    fn new(conninfo: &str) -> Self {
        Self {
            conninfo: conninfo.to_string(),
            inner: Mutex::new(FactoryInner {
                allocated: 0,
                free: Vec::new(),
            }),
        }
    }

    pub fn conninfo(&self) -> &str {
        &self.conninfo
    }

    /// Number of handles ever opened (borrowed + free).
    pub fn allocated(&self) -> usize {
        self.inner.lock().expect("mutex poisoned").allocated
    }

    /// Number of handles currently in the free list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().expect("mutex poisoned").free.len()
    }
}

/// Pool occupancy for one factory, as reported by the admin surface.
#[derive(Debug, Serialize)]
pub struct PoolOccupancy {
    pub conninfo: String,
    pub allocated: usize,
    pub free: usize,
}

// ============================================================================
// Pool
// ============================================================================

/// Process-wide table of database-handle factories.
///
/// Cheap to clone; all clones share the same factory table.
#[derive(Clone)]
pub struct DbPool {
    connector: Arc<dyn DbConnector>,
    factories: Arc<DashMap<String, Arc<DbFactory>>>,
}

impl DbPool {
    pub fn new(connector: Arc<dyn DbConnector>) -> Self {
        Self {
            connector,
            factories: Arc::new(DashMap::new()),
        }
    }

    /// Get or create the factory for a connection descriptor.
    ///
    /// Idempotent: the first call registers the factory, later calls return
    /// the same one.
    pub fn factory(&self, conninfo: &str) -> Arc<DbFactory> {
        self.factories
            .entry(conninfo.to_string())
            .or_insert_with(|| Arc::new(DbFactory::new(conninfo)))
            .clone()
    }

    /// Borrow a handle from a factory on behalf of one session.
    ///
    /// Reuses a free handle when available, otherwise opens a new one. A
    /// failed open leaves the factory counts untouched. The returned guard
    /// recovers the handle exactly once: on explicit release, on drop at the
    /// end of the borrowing scope, or on unwind.
    pub fn borrow(
        &self,
        factory: &Arc<DbFactory>,
        borrowed: &BorrowedHandles,
    ) -> Result<PooledHandle, DbError> {
        let reused = factory
            .inner
            .lock()
            .expect("mutex poisoned")
            .free
            .pop();

        let handle = match reused {
            Some(h) => h,
            None => {
                let h = self.connector.open(&factory.conninfo)?;
                factory.inner.lock().expect("mutex poisoned").allocated += 1;
                h
            }
        };

        let tag = NEXT_BORROW_TAG.fetch_add(1, Ordering::Relaxed);
        borrowed
            .lock()
            .expect("mutex poisoned")
            .insert(tag, factory.conninfo.clone());

        debug!(conninfo = %factory.conninfo, tag, "borrowed database handle");

        Ok(PooledHandle {
            handle: Some(handle),
            factory: Arc::clone(factory),
            borrowed: Arc::clone(borrowed),
            tag,
        })
    }

    /// Occupancy counts for every registered factory.
    pub fn occupancy(&self) -> Vec<PoolOccupancy> {
        self.factories
            .iter()
            .map(|entry| PoolOccupancy {
                conninfo: entry.key().clone(),
                allocated: entry.value().allocated(),
                free: entry.value().free_count(),
            })
            .collect()
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }
}

// ============================================================================
// Guard
// ============================================================================

/// An owned, borrowed database handle.
///
/// Dereferences to [`DbHandle`]. Dropping the guard rolls the handle back
/// and pushes it onto the factory's free list.
pub struct PooledHandle {
    handle: Option<Box<dyn DbHandle>>,
    factory: Arc<DbFactory>,
    borrowed: BorrowedHandles,
    tag: u64,
}

impl PooledHandle {
    /// Return the handle to the pool now instead of at end of scope.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl std::ops::Deref for PooledHandle {
    type Target = dyn DbHandle;

    fn deref(&self) -> &Self::Target {
        self.handle.as_deref().expect("handle present until drop")
    }
}

impl std::ops::DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_deref_mut().expect("handle present until drop")
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        self.borrowed
            .lock()
            .expect("mutex poisoned")
            .remove(&self.tag);

        match handle.rollback() {
            Ok(()) => {
                self.factory
                    .inner
                    .lock()
                    .expect("mutex poisoned")
                    .free
                    .push(handle);
            }
            Err(e) => {
                // A handle that cannot reach a clean state must not re-enter
                // the free list. Discard it and shrink the allocated count so
                // the conservation invariant still holds.
                warn!(
                    conninfo = %self.factory.conninfo,
                    error = %e,
                    "discarding database handle that failed rollback"
                );
                self.factory
                    .inner
                    .lock()
                    .expect("mutex poisoned")
                    .allocated -= 1;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeHandle {
        rollbacks: Arc<AtomicUsize>,
        fail_rollback: bool,
        in_tx: bool,
    }

    impl DbHandle for FakeHandle {
        fn rollback(&mut self) -> Result<(), DbError> {
            if self.fail_rollback {
                return Err(DbError::Rollback("connection gone".to_string()));
            }
            self.in_tx = false;
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn commit(&mut self) -> Result<(), DbError> {
            self.in_tx = false;
            Ok(())
        }
    }

    struct FakeConnector {
        opens: Arc<AtomicUsize>,
        rollbacks: Arc<AtomicUsize>,
        fail_open: bool,
        fail_rollback: bool,
    }

    impl DbConnector for FakeConnector {
        fn open(&self, conninfo: &str) -> Result<Box<dyn DbHandle>, DbError> {
            if self.fail_open {
                return Err(DbError::Connect {
                    conninfo: conninfo.to_string(),
                    message: "refused".to_string(),
                });
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                rollbacks: Arc::clone(&self.rollbacks),
                fail_rollback: self.fail_rollback,
                in_tx: true,
            }))
        }
    }

    fn test_pool(fail_open: bool, fail_rollback: bool) -> (DbPool, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let pool = DbPool::new(Arc::new(FakeConnector {
            opens: Arc::clone(&opens),
            rollbacks: Arc::clone(&rollbacks),
            fail_open,
            fail_rollback,
        }));
        (pool, opens, rollbacks)
    }

    fn borrowed_set() -> BorrowedHandles {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[test]
    fn factory_is_idempotent() {
        let (pool, _, _) = test_pool(false, false);

        let a = pool.factory("dbname=test");
        let b = pool.factory("dbname=test");
        assert!(Arc::ptr_eq(&a, &b));

        let c = pool.factory("dbname=other");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.factory_count(), 2);
    }

    #[test]
    fn borrow_opens_then_reuses() {
        let (pool, opens, rollbacks) = test_pool(false, false);
        let factory = pool.factory("dbname=test");
        let borrowed = borrowed_set();

        let h = pool.borrow(&factory, &borrowed).unwrap();
        assert_eq!(factory.allocated(), 1);
        assert_eq!(factory.free_count(), 0);
        assert_eq!(borrowed.lock().unwrap().len(), 1);
        drop(h);

        assert_eq!(factory.free_count(), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert!(borrowed.lock().unwrap().is_empty());

        // Second borrow reuses the recovered handle.
        let h = pool.borrow(&factory, &borrowed).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(factory.allocated(), 1);
        drop(h);
    }

    #[test]
    fn conservation_holds_across_double_borrow_scope_exit() {
        let (pool, _, rollbacks) = test_pool(false, false);
        let factory = pool.factory("dbname=test");
        let borrowed = borrowed_set();

        {
            let _a = pool.borrow(&factory, &borrowed).unwrap();
            let _b = pool.borrow(&factory, &borrowed).unwrap();
            assert_eq!(factory.allocated(), 2);
            assert_eq!(factory.free_count(), 0);
            assert_eq!(borrowed.lock().unwrap().len(), 2);
            // Neither handle released explicitly; the scope ends here.
        }

        assert_eq!(factory.allocated(), 2);
        assert_eq!(factory.free_count(), 2);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 2);
        assert!(borrowed.lock().unwrap().is_empty());
    }

    #[test]
    fn explicit_release_recovers_once() {
        let (pool, _, rollbacks) = test_pool(false, false);
        let factory = pool.factory("dbname=test");
        let borrowed = borrowed_set();

        let h = pool.borrow(&factory, &borrowed).unwrap();
        h.release();

        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(factory.allocated(), 1);
        assert_eq!(factory.free_count(), 1);
    }

    #[test]
    fn failed_open_does_not_count_as_allocated() {
        let (pool, _, _) = test_pool(true, false);
        let factory = pool.factory("dbname=test");
        let borrowed = borrowed_set();

        let result = pool.borrow(&factory, &borrowed);
        assert!(matches!(result, Err(DbError::Connect { .. })));
        assert_eq!(factory.allocated(), 0);
        assert_eq!(factory.free_count(), 0);
        assert!(borrowed.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_rollback_discards_handle() {
        let (pool, _, _) = test_pool(false, true);
        let factory = pool.factory("dbname=test");
        let borrowed = borrowed_set();

        let h = pool.borrow(&factory, &borrowed).unwrap();
        assert_eq!(factory.allocated(), 1);
        drop(h);

        // The handle never re-enters the free list, and the allocated count
        // shrinks with it.
        assert_eq!(factory.allocated(), 0);
        assert_eq!(factory.free_count(), 0);
        assert!(borrowed.lock().unwrap().is_empty());
    }

    #[test]
    fn commit_through_guard() {
        let (pool, _, _) = test_pool(false, false);
        let factory = pool.factory("dbname=test");
        let borrowed = borrowed_set();

        let mut h = pool.borrow(&factory, &borrowed).unwrap();
        h.commit().unwrap();
        drop(h);

        assert_eq!(factory.free_count(), 1);
    }

    #[test]
    fn occupancy_reports_all_factories() {
        let (pool, _, _) = test_pool(false, false);
        let f1 = pool.factory("dbname=one");
        let _f2 = pool.factory("dbname=two");
        let borrowed = borrowed_set();

        let _h = pool.borrow(&f1, &borrowed).unwrap();

        let mut occupancy = pool.occupancy();
        occupancy.sort_by(|a, b| a.conninfo.cmp(&b.conninfo));
        assert_eq!(occupancy.len(), 2);
        assert_eq!(occupancy[0].conninfo, "dbname=one");
        assert_eq!(occupancy[0].allocated, 1);
        assert_eq!(occupancy[0].free, 0);
        assert_eq!(occupancy[1].allocated, 0);
    }
}
