//! Offense ledger: one record per source address.
//!
//! The map is sharded (`DashMap`) and every record sits behind its own
//! `RwLock`, so different addresses update concurrently while updates to
//! one address are serialized. Callers clone the record's `Arc` out of the
//! map before locking it; a shard lock is never held while waiting on a
//! record lock.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use warden_schema::{BlockState, OffenseRecord};

/// Errors from ledger mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("no record for {0}")]
    UnknownAddress(IpAddr),

    #[error("{0} is permanently blocked")]
    PermanentlyBlocked(IpAddr),

    #[error("duplicate record for {0}")]
    Duplicate(IpAddr),

    #[error("record for {ip} would be inconsistent: {reason}")]
    Inconsistent { ip: IpAddr, reason: String },
}

type Handle = Arc<RwLock<OffenseRecord>>;

/// In-memory offense ledger.
#[derive(Debug, Default)]
pub struct Ledger {
    records: DashMap<IpAddr, Handle>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted records.
    pub fn load(records: Vec<OffenseRecord>) -> Result<Self, LedgerError> {
        let ledger = Self::new();
        for record in records {
            let ip = record.ip;
            record
                .check_invariants()
                .map_err(|reason| LedgerError::Inconsistent { ip, reason })?;
            if ledger
                .records
                .insert(ip, Arc::new(RwLock::new(record)))
                .is_some()
            {
                return Err(LedgerError::Duplicate(ip));
            }
        }
        Ok(ledger)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.records.contains_key(&ip)
    }

    fn handle(&self, ip: IpAddr, now: u64) -> Handle {
        self.records
            .entry(ip)
            .or_insert_with(|| Arc::new(RwLock::new(OffenseRecord::new(ip, now))))
            .value()
            .clone()
    }

    fn existing(&self, ip: IpAddr) -> Option<Handle> {
        self.records.get(&ip).map(|entry| entry.value().clone())
    }

    /// Copy of the record for `ip`, if tracked.
    pub fn get(&self, ip: IpAddr) -> Option<OffenseRecord> {
        self.existing(ip).map(|handle| handle.read().clone())
    }

    /// Copy of the record for `ip`, creating a clean one opened at `now`.
    pub fn get_or_create(&self, ip: IpAddr, now: u64) -> OffenseRecord {
        self.handle(ip, now).read().clone()
    }

    /// Count one attempt at `ts`, creating the record if needed.
    ///
    /// Blocked records are left alone: attempts against an active block
    /// are not counted.
    pub fn update(&self, ip: IpAddr, ts: u64) -> OffenseRecord {
        self.with_record(ip, ts, |record| {
            if !record.state.is_blocked() {
                record.record_attempt(ts);
            }
            record.clone()
        })
    }

    /// Run `f` with exclusive access to the record for `ip`, creating it
    /// at `now` if absent.
    pub fn with_record<R>(
        &self,
        ip: IpAddr,
        now: u64,
        f: impl FnOnce(&mut OffenseRecord) -> R,
    ) -> R {
        let handle = self.handle(ip, now);
        let mut record = handle.write();
        f(&mut *record)
    }

    /// Run `f` with exclusive access to an existing record.
    pub fn modify<R>(&self, ip: IpAddr, f: impl FnOnce(&mut OffenseRecord) -> R) -> Option<R> {
        let handle = self.existing(ip)?;
        let mut record = handle.write();
        Some(f(&mut *record))
    }

    /// Force a record into `state`.
    ///
    /// Permanent blocks are terminal and refuse any change. The result
    /// must satisfy the record invariants or nothing is changed.
    pub fn set_state(
        &self,
        ip: IpAddr,
        state: BlockState,
        expires_at: Option<u64>,
    ) -> Result<OffenseRecord, LedgerError> {
        let handle = self.existing(ip).ok_or(LedgerError::UnknownAddress(ip))?;
        let mut record = handle.write();

        if record.state == BlockState::PermanentlyBlocked {
            return Err(LedgerError::PermanentlyBlocked(ip));
        }

        let mut next = record.clone();
        next.state = state;
        next.block_expires_at = expires_at;
        next.check_invariants()
            .map_err(|reason| LedgerError::Inconsistent { ip, reason })?;

        *record = next;
        Ok(record.clone())
    }

    /// Drop the record for `ip`. Permanently blocked records stay.
    pub fn remove(&self, ip: IpAddr) -> Result<Option<OffenseRecord>, LedgerError> {
        let removed = self
            .records
            .remove_if(&ip, |_, handle| handle.read().state != BlockState::PermanentlyBlocked);

        match removed {
            Some((_, handle)) => {
                let record = handle.read().clone();
                Ok(Some(record))
            }
            None if self.records.contains_key(&ip) => Err(LedgerError::PermanentlyBlocked(ip)),
            None => Ok(None),
        }
    }

    /// Every tracked address, sorted.
    pub fn ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.records.iter().map(|entry| *entry.key()).collect();
        ips.sort();
        ips
    }

    /// Consistent copy of every record, sorted by address.
    pub fn snapshot(&self) -> Vec<OffenseRecord> {
        let handles: Vec<Handle> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut records: Vec<OffenseRecord> = handles.iter().map(|h| h.read().clone()).collect();
        records.sort_by_key(|r| r.ip);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    // ===========================================
    // Basic operations
    // ===========================================

    #[test]
    fn test_get_or_create_is_idempotent() {
        let ledger = Ledger::new();
        let first = ledger.get_or_create(ip("203.0.113.7"), 1000);
        let second = ledger.get_or_create(ip("203.0.113.7"), 2000);

        assert_eq!(ledger.len(), 1);
        assert_eq!(first, second);
        assert_eq!(second.first_seen, 1000);
    }

    #[test]
    fn test_get_missing() {
        let ledger = Ledger::new();
        assert!(ledger.get(ip("203.0.113.7")).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_update_counts_attempts() {
        let ledger = Ledger::new();
        ledger.update(ip("203.0.113.7"), 1000);
        let record = ledger.update(ip("203.0.113.7"), 1004);

        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.first_seen, 1000);
        assert_eq!(record.last_seen, 1004);
    }

    #[test]
    fn test_update_ignores_blocked_record() {
        let ledger = Ledger::new();
        let addr = ip("203.0.113.7");
        ledger.update(addr, 1000);
        ledger
            .set_state(addr, BlockState::TemporarilyBlocked, Some(5000))
            .unwrap();

        let record = ledger.update(addr, 1001);
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn test_modify_missing_is_none() {
        let ledger = Ledger::new();
        assert!(ledger.modify(ip("10.0.0.1"), |r| r.attempt_count).is_none());
        assert!(ledger.is_empty());
    }

    // ===========================================
    // set_state / remove
    // ===========================================

    #[test]
    fn test_set_state_checks_invariants() {
        let ledger = Ledger::new();
        let addr = ip("203.0.113.7");
        ledger.get_or_create(addr, 1000);

        let err = ledger
            .set_state(addr, BlockState::TemporarilyBlocked, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Inconsistent { .. }));
        assert_eq!(ledger.get(addr).unwrap().state, BlockState::Clean);
    }

    #[test]
    fn test_set_state_unknown_address() {
        let ledger = Ledger::new();
        assert_eq!(
            ledger.set_state(ip("10.0.0.1"), BlockState::Watched, None),
            Err(LedgerError::UnknownAddress(ip("10.0.0.1")))
        );
    }

    #[test]
    fn test_permanent_is_terminal() {
        let ledger = Ledger::new();
        let addr = ip("203.0.113.7");
        ledger.get_or_create(addr, 1000);
        ledger
            .set_state(addr, BlockState::PermanentlyBlocked, None)
            .unwrap();

        assert_eq!(
            ledger.set_state(addr, BlockState::Watched, None),
            Err(LedgerError::PermanentlyBlocked(addr))
        );
        assert_eq!(ledger.remove(addr), Err(LedgerError::PermanentlyBlocked(addr)));
        assert_eq!(
            ledger.get(addr).unwrap().state,
            BlockState::PermanentlyBlocked
        );
    }

    #[test]
    fn test_remove() {
        let ledger = Ledger::new();
        let addr = ip("203.0.113.7");
        ledger.get_or_create(addr, 1000);

        let removed = ledger.remove(addr).unwrap();
        assert_eq!(removed.map(|r| r.ip), Some(addr));
        assert!(!ledger.contains(addr));
        assert_eq!(ledger.remove(addr), Ok(None));
    }

    // ===========================================
    // snapshot / load
    // ===========================================

    #[test]
    fn test_snapshot_load_roundtrip() {
        let ledger = Ledger::new();
        for (i, addr) in ["198.51.100.9", "10.0.0.1", "2001:db8::1"].iter().enumerate() {
            ledger.update(ip(addr), 1000 + i as u64);
        }
        ledger
            .set_state(ip("10.0.0.1"), BlockState::TemporarilyBlocked, Some(9000))
            .unwrap();

        let snapshot = ledger.snapshot();
        assert_eq!(ledger.ips(), snapshot.iter().map(|r| r.ip).collect::<Vec<_>>());

        let restored = Ledger::load(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn test_load_rejects_duplicates() {
        let record = OffenseRecord::new(ip("10.0.0.1"), 1000);
        let err = Ledger::load(vec![record.clone(), record]).unwrap_err();
        assert_eq!(err, LedgerError::Duplicate(ip("10.0.0.1")));
    }

    #[test]
    fn test_load_rejects_inconsistent() {
        let mut record = OffenseRecord::new(ip("10.0.0.1"), 1000);
        record.state = BlockState::PermanentlyBlocked;
        record.block_expires_at = Some(10);
        assert!(matches!(
            Ledger::load(vec![record]),
            Err(LedgerError::Inconsistent { .. })
        ));
    }

    // ===========================================
    // Concurrency
    // ===========================================

    #[test]
    fn test_concurrent_updates_same_address() {
        let ledger = Arc::new(Ledger::new());
        let addr = ip("203.0.113.7");

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for ts in 0..250 {
                        ledger.update(addr, 1000 + ts);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let record = ledger.get(addr).unwrap();
        assert_eq!(record.attempt_count, 2000);
        assert_eq!(record.last_seen, 1249);
    }

    #[test]
    fn test_concurrent_updates_distinct_addresses() {
        let ledger = Arc::new(Ledger::new());

        let threads: Vec<_> = (0..16u8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let addr = IpAddr::from([10, 0, 0, i]);
                    for _ in 0..10 {
                        ledger.update(addr, 1000);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(ledger.len(), 16);
        assert!(ledger.snapshot().iter().all(|r| r.attempt_count == 10));
    }
}
