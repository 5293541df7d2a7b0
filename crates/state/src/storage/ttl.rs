//! Time-to-live expiry for state entries.
//!
//! Values are stored behind an 8-byte big-endian header holding the
//! last-access timestamp. An entry is expired once `timestamp + ttl <= now`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tandem_core::Timestamp;

use super::{StateCoordinate, StateStorage};
use crate::error::{Result, StateError};

const TIMESTAMP_LEN: usize = 8;

/// When the last-access timestamp of an entry is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlUpdateType {
    /// TTL is disabled; entries never expire.
    Disabled,
    OnCreateAndWrite,
    OnReadAndWrite,
}

/// Whether expired entries that were not cleaned up yet may still be returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlStateVisibility {
    ReturnExpiredIfNotCleanedUp,
    NeverReturnExpired,
}

/// TTL policy of a single named state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTtlConfig {
    pub ttl: Duration,
    pub update_type: TtlUpdateType,
    pub visibility: TtlStateVisibility,
}

impl StateTtlConfig {
    /// Expire entries `ttl` after they were last written.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            update_type: TtlUpdateType::OnCreateAndWrite,
            visibility: TtlStateVisibility::NeverReturnExpired,
        }
    }

    pub fn disabled() -> Self {
        Self {
            ttl: Duration::MAX,
            update_type: TtlUpdateType::Disabled,
            visibility: TtlStateVisibility::ReturnExpiredIfNotCleanedUp,
        }
    }

    pub fn with_update_type(mut self, update_type: TtlUpdateType) -> Self {
        self.update_type = update_type;
        self
    }

    pub fn with_visibility(mut self, visibility: TtlStateVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.update_type != TtlUpdateType::Disabled
    }

    fn ttl_millis(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for StateTtlConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Clock consulted by TTL checks.
pub trait TtlTimeProvider: Send + Sync {
    fn current_timestamp(&self) -> Timestamp;
}

/// Wall-clock time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TtlTimeProvider for SystemTimeProvider {
    fn current_timestamp(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

pub(crate) struct TtlStorage {
    inner: Arc<dyn StateStorage>,
    config: StateTtlConfig,
    time: Arc<dyn TtlTimeProvider>,
}

impl TtlStorage {
    pub(crate) fn new(
        inner: Arc<dyn StateStorage>,
        config: StateTtlConfig,
        time: Arc<dyn TtlTimeProvider>,
    ) -> Self {
        Self {
            inner,
            config,
            time,
        }
    }

    fn wrap(&self, value: &[u8], timestamp: Timestamp) -> Bytes {
        let mut buf = BytesMut::with_capacity(TIMESTAMP_LEN + value.len());
        buf.put_u64(timestamp);
        buf.put_slice(value);
        buf.freeze()
    }

    fn unwrap(&self, stored: Bytes) -> Result<(Timestamp, Bytes)> {
        if stored.len() < TIMESTAMP_LEN {
            return Err(StateError::Serialization(format!(
                "TTL entry of {} bytes is missing its timestamp header",
                stored.len()
            )));
        }
        let mut header = [0u8; TIMESTAMP_LEN];
        header.copy_from_slice(&stored[..TIMESTAMP_LEN]);
        Ok((u64::from_be_bytes(header), stored.slice(TIMESTAMP_LEN..)))
    }

    fn is_expired(&self, timestamp: Timestamp, now: Timestamp) -> bool {
        timestamp.saturating_add(self.config.ttl_millis()) <= now
    }

    fn return_expired(&self) -> bool {
        self.config.visibility == TtlStateVisibility::ReturnExpiredIfNotCleanedUp
    }

    fn update_on_read(&self) -> bool {
        self.config.update_type == TtlUpdateType::OnReadAndWrite
    }
}

impl StateStorage for TtlStorage {
    fn get(&self, at: &StateCoordinate<'_>) -> Result<Option<Bytes>> {
        let Some(stored) = self.inner.get(at)? else {
            return Ok(None);
        };
        let (timestamp, value) = self.unwrap(stored)?;
        let now = self.time.current_timestamp();

        if self.is_expired(timestamp, now) {
            if self.return_expired() {
                return Ok(Some(value));
            }
            self.inner.remove(at)?;
            return Ok(None);
        }
        if self.update_on_read() {
            self.inner.put(at, self.wrap(&value, now))?;
        }
        Ok(Some(value))
    }

    fn put(&self, at: &StateCoordinate<'_>, value: Bytes) -> Result<()> {
        let now = self.time.current_timestamp();
        self.inner.put(at, self.wrap(&value, now))
    }

    fn remove(&self, at: &StateCoordinate<'_>) -> Result<Option<Bytes>> {
        let Some(stored) = self.inner.remove(at)? else {
            return Ok(None);
        };
        let (timestamp, value) = self.unwrap(stored)?;
        if self.is_expired(timestamp, self.time.current_timestamp()) && !self.return_expired() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn entries(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let now = self.time.current_timestamp();
        let mut live = Vec::new();
        for (user_key, stored) in self.inner.entries(key_group, key, namespace)? {
            let (timestamp, value) = self.unwrap(stored)?;
            let at = StateCoordinate {
                key_group,
                key,
                namespace,
                user_key: Some(&user_key),
            };
            if self.is_expired(timestamp, now) {
                if self.return_expired() {
                    live.push((user_key, value));
                } else {
                    self.inner.remove(&at)?;
                }
                continue;
            }
            if self.update_on_read() {
                self.inner.put(&at, self.wrap(&value, now))?;
            }
            live.push((user_key, value));
        }
        Ok(live)
    }

    fn clear(&self, key_group: u32, key: &[u8], namespace: &[u8]) -> Result<()> {
        self.inner.clear(key_group, key, namespace)
    }
}

/// Manually advanced clock for tests.
#[cfg(test)]
pub(crate) struct ManualTimeProvider {
    now: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl ManualTimeProvider {
    pub(crate) fn new(start: Timestamp) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(start),
        }
    }

    pub(crate) fn advance(&self, millis: u64) {
        self.now
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl TtlTimeProvider for ManualTimeProvider {
    fn current_timestamp(&self) -> Timestamp {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}
