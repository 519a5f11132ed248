//! Per-connection mutable state.
//!
//! Everything here lives and dies with one connection; nothing is keyed by
//! connection id in a shared table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::violation::ProtocolViolation;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    AwaitingInit = 0,
    Initialized = 1,
    Closing = 2,
    Closed = 3,
}

impl Phase {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::AwaitingInit,
            1 => Self::Initialized,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

struct Registration {
    serial: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Registry {
    live: HashMap<String, Registration>,
    /// Set once every operation was cancelled for close; later
    /// registrations are cancelled on arrival.
    sealed: bool,
}

/// Session state shared by the protocol handler, the lifecycle supervisor
/// and the operation tasks of one connection.
pub struct SessionState {
    phase: AtomicU8,
    /// Write-once: the payload of the first `connection_init`.
    init_payload: OnceLock<Option<Value>>,
    /// Code of a server-initiated close, reported to the closed hook.
    close_code: OnceLock<u16>,
    registry: Mutex<Registry>,
    next_serial: AtomicU64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::AwaitingInit as u8),
            init_payload: OnceLock::new(),
            close_code: OnceLock::new(),
            registry: Mutex::new(Registry::default()),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Stores the init payload. Fails if a `connection_init` was already
    /// received on this connection; the first payload is kept.
    pub fn set_init_payload(&self, payload: Option<Value>) -> Result<(), ProtocolViolation> {
        self.init_payload
            .set(payload)
            .map_err(|_| ProtocolViolation::TooManyInitRequests)
    }

    pub fn init_received(&self) -> bool {
        self.init_payload.get().is_some()
    }

    pub fn init_payload(&self) -> Option<Value> {
        self.init_payload.get().cloned().flatten()
    }

    /// Moves `AwaitingInit` to `Initialized`. Returns `false` if the
    /// connection is already past that point (e.g. closing).
    pub fn acknowledge(&self) -> bool {
        self.phase
            .compare_exchange(
                Phase::AwaitingInit as u8,
                Phase::Initialized as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.phase() == Phase::Initialized
    }

    /// Enters `Closing`. Only the first caller gets `true`.
    pub fn begin_closing(&self) -> bool {
        self.phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                (p < Phase::Closing as u8).then_some(Phase::Closing as u8)
            })
            .is_ok()
    }

    /// Enters `Closed`. Only the first caller gets `true`.
    pub fn mark_closed(&self) -> bool {
        self.phase.swap(Phase::Closed as u8, Ordering::AcqRel) != Phase::Closed as u8
    }

    pub fn record_close_code(&self, code: u16) {
        let _ = self.close_code.set(code);
    }

    pub fn close_code(&self) -> Option<u16> {
        self.close_code.get().copied()
    }

    /// Registers a live operation under `id`.
    ///
    /// The returned serial identifies this registration so that a finishing
    /// operation never removes a newer one that reuses its id.
    pub fn register(&self, id: &str, token: CancellationToken) -> Result<u64, ProtocolViolation> {
        let mut registry = self.registry();
        if registry.live.contains_key(id) {
            return Err(ProtocolViolation::SubscriberAlreadyExists(id.to_owned()));
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        if registry.sealed {
            token.cancel();
            return Ok(serial);
        }
        registry
            .live
            .insert(id.to_owned(), Registration { serial, token });
        Ok(serial)
    }

    /// Removes the registration if it is still the one identified by
    /// `serial`. Returns `false` if it was cancelled or replaced meanwhile.
    pub fn finish(&self, id: &str, serial: u64) -> bool {
        let mut registry = self.registry();
        match registry.live.get(id) {
            Some(reg) if reg.serial == serial => {
                registry.live.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Cancels and removes the operation `id`. Returns `false` if absent.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.registry().live.remove(id);
        match removed {
            Some(reg) => {
                reg.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every live operation and refuses later registrations.
    /// Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Registration> = {
            let mut registry = self.registry();
            registry.sealed = true;
            registry.live.drain().map(|(_, reg)| reg).collect()
        };
        for reg in &drained {
            reg.token.cancel();
        }
        drained.len()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.registry().live.contains_key(id)
    }

    pub fn live_count(&self) -> usize {
        self.registry().live.len()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_payload_is_write_once() {
        let state = SessionState::new();
        assert!(!state.init_received());
        state.set_init_payload(Some(json!({"n": 1}))).unwrap();
        assert_eq!(
            state.set_init_payload(Some(json!({"n": 2}))),
            Err(ProtocolViolation::TooManyInitRequests)
        );
        assert_eq!(state.init_payload(), Some(json!({"n": 1})));
    }

    #[test]
    fn init_without_payload_still_counts() {
        let state = SessionState::new();
        state.set_init_payload(None).unwrap();
        assert!(state.init_received());
        assert!(state.init_payload().is_none());
        assert!(state.set_init_payload(None).is_err());
    }

    #[test]
    fn phase_transitions() {
        let state = SessionState::new();
        assert_eq!(state.phase(), Phase::AwaitingInit);
        assert!(state.acknowledge());
        assert!(!state.acknowledge());
        assert!(state.is_acknowledged());
        assert!(state.begin_closing());
        assert!(!state.begin_closing());
        assert!(!state.is_acknowledged());
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert_eq!(state.phase(), Phase::Closed);
    }

    #[test]
    fn cannot_acknowledge_while_closing() {
        let state = SessionState::new();
        assert!(state.begin_closing());
        assert!(!state.acknowledge());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let state = SessionState::new();
        let first = CancellationToken::new();
        state.register("1", first.clone()).unwrap();
        let err = state.register("1", CancellationToken::new()).unwrap_err();
        assert_eq!(err, ProtocolViolation::SubscriberAlreadyExists("1".into()));
        assert!(!first.is_cancelled());
        assert_eq!(state.live_count(), 1);
    }

    #[test]
    fn cancel_removes_and_cancels() {
        let state = SessionState::new();
        let token = CancellationToken::new();
        state.register("1", token.clone()).unwrap();
        assert!(state.cancel("1"));
        assert!(token.is_cancelled());
        assert!(!state.is_live("1"));
        assert!(!state.cancel("1"));
        state.register("1", CancellationToken::new()).unwrap();
    }

    #[test]
    fn finish_ignores_stale_serial() {
        let state = SessionState::new();
        let old = state.register("1", CancellationToken::new()).unwrap();
        assert!(state.cancel("1"));
        let new = state.register("1", CancellationToken::new()).unwrap();
        assert_ne!(old, new);
        assert!(!state.finish("1", old));
        assert!(state.is_live("1"));
        assert!(state.finish("1", new));
        assert!(!state.is_live("1"));
    }

    #[test]
    fn cancel_all_seals_registry() {
        let state = SessionState::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        state.register("a", a.clone()).unwrap();
        state.register("b", b.clone()).unwrap();
        assert_eq!(state.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());

        let late = CancellationToken::new();
        state.register("c", late.clone()).unwrap();
        assert!(late.is_cancelled());
        assert_eq!(state.live_count(), 0);
    }
}
