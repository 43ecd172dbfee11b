/// Per-run sandbox identities
///
/// A root harness drops every payload to an unprivileged uid/gid. Runs that
/// share that uid also share its RLIMIT_NPROC count, so each run leases an
/// id of its own from a configured block and gives it back when the run
/// context is dropped.
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// Contiguous block of ids reserved for sandboxes. No host account may use them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub first: u32,
    pub count: u32,
}

impl IdRange {
    pub fn contains(&self, id: u32) -> bool {
        id >= self.first && id - self.first < self.count
    }
}

impl Default for IdRange {
    fn default() -> Self {
        Self {
            first: 60_000,
            count: 1_000,
        }
    }
}

#[derive(Debug)]
pub struct IdentityPool {
    range: IdRange,
    leased: Mutex<BTreeSet<u32>>,
}

impl IdentityPool {
    pub fn new(range: IdRange) -> Arc<Self> {
        Arc::new(Self {
            range,
            leased: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn range(&self) -> IdRange {
        self.range
    }

    /// Lowest free id, or None when every id is taken
    pub fn lease(self: &Arc<Self>) -> Option<IdentityLease> {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        let id = (0..self.range.count)
            .map(|offset| self.range.first.saturating_add(offset))
            .find(|id| !leased.contains(id))?;
        leased.insert(id);
        Some(IdentityLease {
            id,
            pool: self.clone(),
        })
    }

    pub fn in_use(&self) -> usize {
        self.leased.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, id: u32) {
        self.leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// One leased id, used as both uid and gid. Returned to the pool on drop.
#[derive(Debug)]
pub struct IdentityLease {
    id: u32,
    pool: Arc<IdentityPool>,
}

impl IdentityLease {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_leases_never_share_an_id() {
        let pool = IdentityPool::new(IdRange { first: 70_000, count: 3 });
        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        let c = pool.lease().unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (70_000, 70_001, 70_002));
        assert!(pool.lease().is_none());
        assert_eq!(pool.in_use(), 3);

        drop(b);
        assert_eq!(pool.lease().unwrap().id(), 70_001);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn leases_from_many_threads_are_distinct() {
        let pool = IdentityPool::new(IdRange::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..10).map(|_| pool.lease().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let leases: Vec<IdentityLease> =
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let ids: BTreeSet<u32> = leases.iter().map(IdentityLease::id).collect();
        assert_eq!(ids.len(), 80);
        assert!(ids.iter().all(|id| pool.range().contains(*id)));
        drop(leases);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn range_bounds() {
        let range = IdRange { first: 10, count: 2 };
        assert!(!range.contains(9));
        assert!(range.contains(10));
        assert!(range.contains(11));
        assert!(!range.contains(12));
    }
}
