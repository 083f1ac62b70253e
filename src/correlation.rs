//! In-flight command tracking.
//!
//! The [`CorrelationTable`] is the only state shared between the two
//! forwarding loops. Every operation is a short critical section on a
//! `std::sync::Mutex`; nothing awaits while holding it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{BridgeError, Result};

/// Identity used to match an IUT reply to the command that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Command opcode.
    pub opcode: u16,
    /// Connection handle, for commands addressed to one connection.
    pub handle: Option<u16>,
}

impl CorrelationKey {
    pub fn new(opcode: u16) -> Self {
        Self {
            opcode,
            handle: None,
        }
    }

    pub fn with_handle(opcode: u16, handle: u16) -> Self {
        Self {
            opcode,
            handle: Some(handle),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle {
            Some(handle) => write!(f, "0x{:04X}/handle 0x{:03X}", self.opcode, handle),
            None => write!(f, "0x{:04X}", self.opcode),
        }
    }
}

/// A command forwarded to the IUT and not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub opcode: u16,
    pub key: CorrelationKey,
    pub issued: Instant,
}

impl PendingCommand {
    /// A pending command issued now.
    pub fn new(key: CorrelationKey) -> Self {
        Self {
            opcode: key.opcode,
            key,
            issued: Instant::now(),
        }
    }

    /// Time since the command was forwarded.
    pub fn age(&self) -> Duration {
        self.issued.elapsed()
    }
}

/// Table of pending commands, at most one per key.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<CorrelationKey, PendingCommand>>,
    removed: Notify,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationKey, PendingCommand>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a command as in flight.
    ///
    /// Fails with `DuplicateKey` if a command with the same key is still
    /// pending; the existing entry is left untouched.
    pub fn register(&self, key: CorrelationKey, pending: PendingCommand) -> Result<()> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return Err(BridgeError::DuplicateKey(key));
        }
        entries.insert(key, pending);
        Ok(())
    }

    /// Remove and return the command pending under `key`.
    pub fn resolve(&self, key: &CorrelationKey) -> Result<PendingCommand> {
        let removed = self.lock().remove(key);
        match removed {
            Some(pending) => {
                self.removed.notify_waiters();
                Ok(pending)
            }
            None => Err(BridgeError::UnknownKey(*key)),
        }
    }

    /// Remove and return every command pending for longer than `max_age`.
    pub fn expire_older_than(&self, max_age: Duration) -> Vec<PendingCommand> {
        let now = Instant::now();
        let expired: Vec<PendingCommand> = {
            let mut entries = self.lock();
            let stale: Vec<CorrelationKey> = entries
                .values()
                .filter(|p| now.saturating_duration_since(p.issued) > max_age)
                .map(|p| p.key)
                .collect();
            stale.iter().filter_map(|k| entries.remove(k)).collect()
        };
        if !expired.is_empty() {
            self.removed.notify_waiters();
        }
        expired
    }

    /// Remove every pending command.
    pub fn clear(&self) -> Vec<PendingCommand> {
        let drained: Vec<PendingCommand> = self.lock().drain().map(|(_, p)| p).collect();
        self.removed.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Wait until no command is pending.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.removed.notified();
            tokio::pin!(notified);
            // Register interest before checking so a removal in between is not missed.
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pending(key: CorrelationKey) -> PendingCommand {
        PendingCommand::new(key)
    }

    #[test]
    fn test_register_and_resolve() {
        let table = CorrelationTable::new();
        let key = CorrelationKey::new(0x0C03);

        table.register(key, pending(key)).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains(&key));

        let resolved = table.resolve(&key).unwrap();
        assert_eq!(resolved.opcode, 0x0C03);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_key_rejected_then_reusable() {
        let table = CorrelationTable::new();
        let key = CorrelationKey::new(0x201E);
        let first = pending(key);

        table.register(key, first.clone()).unwrap();
        let err = table.register(key, pending(key)).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateKey(k) if k == key));

        // The original entry survives the rejected registration.
        assert_eq!(table.resolve(&key).unwrap(), first);

        table.register(key, pending(key)).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_handles_disambiguate_same_opcode() {
        let table = CorrelationTable::new();
        let a = CorrelationKey::with_handle(0x1405, 0x0040);
        let b = CorrelationKey::with_handle(0x1405, 0x0041);

        table.register(a, pending(a)).unwrap();
        table.register(b, pending(b)).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve(&b).unwrap().key, b);
        assert!(table.contains(&a));
    }

    #[test]
    fn test_resolve_unknown_key() {
        let table = CorrelationTable::new();
        let key = CorrelationKey::new(0x201F);
        assert!(matches!(table.resolve(&key), Err(BridgeError::UnknownKey(_))));
    }

    #[test]
    fn test_expire_older_than() {
        let table = CorrelationTable::new();
        let old = CorrelationKey::new(0x0C03);
        let fresh = CorrelationKey::new(0x201F);

        let mut stale = pending(old);
        stale.issued = Instant::now() - Duration::from_secs(5);
        table.register(old, stale).unwrap();
        table.register(fresh, pending(fresh)).unwrap();

        let expired = table.expire_older_than(Duration::from_secs(1));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, old);
        assert!(table.contains(&fresh));
        assert!(!table.contains(&old));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(CorrelationKey::new(0x0C03).to_string(), "0x0C03");
        assert_eq!(
            CorrelationKey::with_handle(0x1405, 0x40).to_string(),
            "0x1405/handle 0x040"
        );
    }

    #[tokio::test]
    async fn test_wait_empty_wakes_on_resolve() {
        let table = Arc::new(CorrelationTable::new());
        let key = CorrelationKey::new(0x0C03);
        table.register(key, pending(key)).unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait_empty().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        table.resolve(&key).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_empty_returns_immediately_when_empty() {
        let table = CorrelationTable::new();
        tokio::time::timeout(Duration::from_millis(100), table.wait_empty())
            .await
            .unwrap();
    }
}
