//! Field-map record store
//!
//! Ballots live in an external key/field store. [`RecordStore`] is the narrow
//! interface the vote station needs; [`MemoryStore`] is the in-process
//! implementation with lazy TTL expiry.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::StoreError;

/// Fields of one record, ordered by field name
pub type FieldMap = BTreeMap<String, String>;

/// Synchronous key/field store
pub trait RecordStore: Send + Sync {
    /// All fields of `key`; empty when the key does not exist
    fn get_all(&self, key: &str) -> Result<FieldMap, StoreError>;

    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    fn set_fields(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        for (field, value) in fields {
            self.set_field(key, field, value)?;
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Schedule removal of `key` after `ttl`; false if the key is absent
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct Record {
    fields: FieldMap,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining time to live of `key`
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let records = self.records.lock();
        let record = records.get(key).filter(|r| r.is_live(now))?;
        record.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn purge(records: &mut HashMap<String, Record>, key: &str, now: Instant) {
        if records.get(key).map(|r| !r.is_live(now)).unwrap_or(false) {
            records.remove(key);
        }
    }

    /// Drop every expired record; run on writes
    fn purge_expired(records: &mut HashMap<String, Record>, now: Instant) {
        records.retain(|_, r| r.is_live(now));
    }
}

impl RecordStore for MemoryStore {
    fn get_all(&self, key: &str) -> Result<FieldMap, StoreError> {
        self.check_online()?;
        let mut records = self.records.lock();
        Self::purge(&mut records, key, Instant::now());
        Ok(records.get(key).map(|r| r.fields.clone()).unwrap_or_default())
    }

    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut records = self.records.lock();
        Self::purge_expired(&mut records, Instant::now());
        records
            .entry(key.to_string())
            .or_default()
            .fields
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut records = self.records.lock();
        Self::purge(&mut records, key, Instant::now());
        Ok(records.contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut records = self.records.lock();
        Self::purge_expired(&mut records, Instant::now());
        Ok(records.remove(key).is_some())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_online()?;
        let now = Instant::now();
        let mut records = self.records.lock();
        Self::purge_expired(&mut records, now);
        match records.get_mut(key) {
            Some(record) => {
                record.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
