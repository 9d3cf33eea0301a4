use sockmux_core::Packet;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("counter limit must be >= 1")]
    ZeroCounterLimit,
    #[error("conflict command set for command {command} can not be empty")]
    EmptyConflictSet { command: i32 },
    #[error("can not update entry, expected command {expected} but packet command is {actual}")]
    CommandMismatch { expected: i32, actual: i32 },
}

/// What an expired entry is still good for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirePolicy {
    /// Expired data is never served.
    NotUsable,
    /// Expired data is served one more time while the request refreshes it
    /// over the network.
    UseAndRefresh,
}

/// Expiration strategy plus its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Never expires.
    Persistence,
    /// Expires a fixed duration after the last update.
    RelativeMillis { ttl: Duration, deadline: Instant },
    /// Expires after a fixed number of cache hits.
    Counter { limit: u32, used: u32 },
    /// Expires when any conflicting command is sent.
    UseUntilSendConflict { conflicts: Vec<i32>, expired: bool },
    /// Expires when any conflicting command is received.
    UseUntilReceiveConflict { conflicts: Vec<i32>, expired: bool },
}

/// A cached response produced by a lookup, plus whether it was served past
/// its expiry (in which case the request still goes to the network).
#[derive(Debug, Clone)]
pub struct CacheServing {
    pub packet: Packet,
    pub stale: bool,
}

/// Cache record for one command.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    command: i32,
    policy: ExpirePolicy,
    strategy: CacheStrategy,
    packet: Option<Packet>,
}

impl CacheEntry {
    pub fn persistence(command: i32) -> Self {
        Self {
            command,
            policy: ExpirePolicy::NotUsable,
            strategy: CacheStrategy::Persistence,
            packet: None,
        }
    }

    pub fn relative_millis(command: i32, policy: ExpirePolicy, ttl: Duration) -> Self {
        Self {
            command,
            policy,
            strategy: CacheStrategy::RelativeMillis {
                ttl,
                deadline: Instant::now() + ttl,
            },
            packet: None,
        }
    }

    pub fn counter(command: i32, policy: ExpirePolicy, limit: u32) -> Result<Self, CacheError> {
        if limit == 0 {
            return Err(CacheError::ZeroCounterLimit);
        }
        Ok(Self {
            command,
            policy,
            strategy: CacheStrategy::Counter { limit, used: 0 },
            packet: None,
        })
    }

    pub fn use_until_send(
        command: i32,
        policy: ExpirePolicy,
        conflicts: Vec<i32>,
    ) -> Result<Self, CacheError> {
        if conflicts.is_empty() {
            return Err(CacheError::EmptyConflictSet { command });
        }
        Ok(Self {
            command,
            policy,
            strategy: CacheStrategy::UseUntilSendConflict {
                conflicts,
                expired: false,
            },
            packet: None,
        })
    }

    pub fn use_until_receive(
        command: i32,
        policy: ExpirePolicy,
        conflicts: Vec<i32>,
    ) -> Result<Self, CacheError> {
        if conflicts.is_empty() {
            return Err(CacheError::EmptyConflictSet { command });
        }
        Ok(Self {
            command,
            policy,
            strategy: CacheStrategy::UseUntilReceiveConflict {
                conflicts,
                expired: false,
            },
            packet: None,
        })
    }

    pub fn command(&self) -> i32 {
        self.command
    }

    pub fn policy(&self) -> ExpirePolicy {
        self.policy
    }

    pub fn strategy(&self) -> &CacheStrategy {
        &self.strategy
    }

    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    /// Pure function of the current strategy state.
    pub fn is_expired(&self) -> bool {
        match &self.strategy {
            CacheStrategy::Persistence => false,
            CacheStrategy::RelativeMillis { deadline, .. } => Instant::now() > *deadline,
            CacheStrategy::Counter { limit, used } => used >= limit,
            CacheStrategy::UseUntilSendConflict { expired, .. }
            | CacheStrategy::UseUntilReceiveConflict { expired, .. } => *expired,
        }
    }

    /// Stores a response and resets the strategy state: new TTL window,
    /// counter back to zero, conflict flag cleared.
    pub fn update_entry(&mut self, packet: Packet) -> Result<(), CacheError> {
        if packet.command() != self.command {
            return Err(CacheError::CommandMismatch {
                expected: self.command,
                actual: packet.command(),
            });
        }
        match &mut self.strategy {
            CacheStrategy::Persistence => {}
            CacheStrategy::RelativeMillis { ttl, deadline } => {
                *deadline = Instant::now() + *ttl;
            }
            CacheStrategy::Counter { used, .. } => {
                *used = 0;
            }
            CacheStrategy::UseUntilSendConflict { expired, .. }
            | CacheStrategy::UseUntilReceiveConflict { expired, .. } => {
                *expired = false;
            }
        }
        self.packet = Some(packet);
        Ok(())
    }

    pub fn on_send_observed(&mut self, command: i32) {
        if let CacheStrategy::UseUntilSendConflict { conflicts, expired } = &mut self.strategy {
            if conflicts.contains(&command) {
                *expired = true;
            }
        }
    }

    pub fn on_receive_observed(&mut self, command: i32) {
        if let CacheStrategy::UseUntilReceiveConflict { conflicts, expired } = &mut self.strategy {
            if conflicts.contains(&command) {
                *expired = true;
            }
        }
    }

    /// Counts a served cache hit. Only the hit path consumes counter budget;
    /// updates never do.
    fn note_cache_hit(&mut self) {
        if let CacheStrategy::Counter { used, .. } = &mut self.strategy {
            *used += 1;
        }
    }

    fn serve(&mut self) -> Option<CacheServing> {
        let packet = self.packet.clone()?;
        if !self.is_expired() {
            self.note_cache_hit();
            return Some(CacheServing {
                packet,
                stale: false,
            });
        }
        if self.policy == ExpirePolicy::UseAndRefresh {
            return Some(CacheServing {
                packet,
                stale: true,
            });
        }
        None
    }
}

/// Keyed store of cache entries, at most one per command (last registration
/// wins).
pub struct CacheManager {
    entries: Mutex<HashMap<i32, CacheEntry>>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, entry: CacheEntry) {
        let mut entries = self.entries.lock().expect("cache lock");
        let command = entry.command();
        if entries.insert(command, entry).is_some() {
            debug!(event = "cache_entry_replaced", command);
        } else {
            debug!(event = "cache_entry_registered", command);
        }
    }

    pub fn unregister(&self, command: i32) -> Option<CacheEntry> {
        self.entries.lock().expect("cache lock").remove(&command)
    }

    pub fn contains(&self, command: i32) -> bool {
        self.entries
            .lock()
            .expect("cache lock")
            .contains_key(&command)
    }

    /// Looks up a servable cached response for `command`, consuming counter
    /// budget on a fresh hit.
    pub fn lookup_serving(&self, command: i32) -> Option<CacheServing> {
        let mut entries = self.entries.lock().expect("cache lock");
        entries.get_mut(&command)?.serve()
    }

    /// Stores a response into the matching entry, if one is registered.
    pub fn update(&self, command: i32, packet: Packet) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get_mut(&command) {
            Some(entry) => {
                entry.update_entry(packet)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Broadcast to every send-conflict entry; a cache for command A can be
    /// invalidated by traffic on command B.
    pub fn on_send_observed(&self, command: i32) {
        let mut entries = self.entries.lock().expect("cache lock");
        for entry in entries.values_mut() {
            entry.on_send_observed(command);
        }
    }

    /// Broadcast to every receive-conflict entry.
    pub fn on_receive_observed(&self, command: i32) {
        let mut entries = self.entries.lock().expect("cache lock");
        for entry in entries.values_mut() {
            entry.on_receive_observed(command);
        }
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}
