//! Per-account ordered locking
//!
//! Every operation that touches several accounts locks them in one canonical
//! (lexicographic) order, so two operations on overlapping account sets can
//! never wait on each other in a cycle.
//!
//! Account locks are created lazily. The lock table is a `DashMap`, whose shard
//! guard is held only for the get-or-create step, never while an account lock
//! is held, so first-time creation for one account does not block work on
//! unrelated accounts.
//!
//! Locks are async (`tokio::sync::Mutex`) because holders keep them across a
//! consensus round.

use crate::types::AccountId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily populated table of per-account mutexes
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl LockManager {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, account: &AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn canonical<'a, I>(accounts: I) -> Vec<AccountId>
    where
        I: IntoIterator<Item = &'a AccountId>,
    {
        let mut keys: Vec<AccountId> = accounts.into_iter().cloned().collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Lock every account in `accounts`, in canonical order.
    ///
    /// Duplicates are collapsed. Not reentrant: a caller already holding one of
    /// the accounts will wait forever.
    pub async fn acquire<'a, I>(&self, accounts: I) -> AccountLocks
    where
        I: IntoIterator<Item = &'a AccountId>,
    {
        let keys = Self::canonical(accounts);
        let mut held = Vec::with_capacity(keys.len());

        for key in keys {
            let guard = self.lock_for(&key).lock_owned().await;
            tracing::trace!(account = %key, "Account lock acquired");
            held.push((key, guard));
        }

        AccountLocks { held }
    }

    /// Lock every account only if none of them is currently held
    pub fn try_acquire<'a, I>(&self, accounts: I) -> Option<AccountLocks>
    where
        I: IntoIterator<Item = &'a AccountId>,
    {
        let keys = Self::canonical(accounts);
        let mut held = Vec::with_capacity(keys.len());

        for key in keys {
            let guard = self.lock_for(&key).try_lock_owned().ok()?;
            held.push((key, guard));
        }

        Some(AccountLocks { held })
    }

    /// Whether `account` is currently locked by someone
    pub fn is_locked(&self, account: &AccountId) -> bool {
        match self.locks.get(account) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }
}

/// Account locks held by one operation
#[derive(Debug)]
pub struct AccountLocks {
    held: Vec<(AccountId, OwnedMutexGuard<()>)>,
}

impl AccountLocks {
    /// Locked accounts, in canonical order
    pub fn accounts(&self) -> impl Iterator<Item = &AccountId> {
        self.held.iter().map(|(account, _)| account)
    }

    /// Release every lock, in canonical order
    pub fn release(self) {
        for (account, guard) in self.held {
            drop(guard);
            tracing::trace!(account = %account, "Account lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_sorts_and_dedups() {
        let manager = LockManager::new();
        let b = AccountId::new("Bob");
        let a = AccountId::new("Alice");

        let locks = manager.acquire([&b, &a, &b]).await;
        let order: Vec<&str> = locks.accounts().map(|a| a.as_str()).collect();
        assert_eq!(order, vec!["Alice", "Bob"]);
        assert!(manager.is_locked(&a));

        locks.release();
        assert!(!manager.is_locked(&a));
        assert!(!manager.is_locked(&b));
    }

    #[tokio::test]
    async fn test_try_acquire_fails_when_held() {
        let manager = LockManager::new();
        let a = AccountId::new("Alice");
        let b = AccountId::new("Bob");

        let held = manager.acquire([&a]).await;
        assert!(manager.try_acquire([&a, &b]).is_none());
        // The partial guard on Bob was dropped with the failed attempt
        assert!(!manager.is_locked(&b));

        held.release();
        assert!(manager.try_acquire([&a, &b]).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_orders_do_not_deadlock() {
        let manager = Arc::new(LockManager::new());
        let a = AccountId::new("Alice");
        let b = AccountId::new("Bob");
        let inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..64 {
            let manager = manager.clone();
            let inside = inside.clone();
            let (x, y) = if i % 2 == 0 {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };
            tasks.push(tokio::spawn(async move {
                let locks = manager.acquire([&x, &y]).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
                locks.release();
            }));
        }

        let all = futures_join(tasks);
        tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("lock ordering deadlocked");
    }

    async fn futures_join(tasks: Vec<tokio::task::JoinHandle<()>>) {
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unrelated_accounts_do_not_block() {
        let manager = LockManager::new();
        let a = AccountId::new("Alice");
        let c = AccountId::new("Carol");

        let _held = manager.acquire([&a]).await;
        let other = tokio::time::timeout(Duration::from_millis(200), manager.acquire([&c])).await;
        assert!(other.is_ok());
    }
}
