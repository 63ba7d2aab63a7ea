//! Connection state machine.
//!
//! The state word is an atomic integer with CAS-guarded transitions plus a
//! const table of allowed pairs, rather than an inheritance hierarchy: the
//! five states differ only in which workers are live for a given
//! `Connection`.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
            Self::Closed => 4,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }

    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Allowed transitions per the connection state machine table.
    const fn allows(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Disconnected, Self::Connecting)
                | (Self::Disconnected, Self::Closed)
                | (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Disconnected)
                | (Self::Connecting, Self::Closed)
                | (Self::Connected, Self::Reconnecting)
                | (Self::Connected, Self::Disconnected)
                | (Self::Connected, Self::Closed)
                | (Self::Reconnecting, Self::Connecting)
                | (Self::Reconnecting, Self::Disconnected)
                | (Self::Reconnecting, Self::Closed)
        )
    }
}

/// Atomic, CAS-guarded state machine with a `watch` channel for observers.
///
/// `Closed` is absorbing: once reached every further transition attempt is a
/// no-op returning `false`. A losing CAS racer simply re-reads the winner's
/// state on its next loop iteration and (almost always) finds its own
/// transition no longer allowed from there, which is what makes
/// `Connected -> Reconnecting` safe to call concurrently without an
/// additional dedup flag.
pub struct StateMachine {
    word: AtomicU8,
    tx: watch::Sender<ConnectionState>,
}

impl StateMachine {
    #[must_use]
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            word: AtomicU8::new(initial.as_u8()),
            tx,
        }
    }

    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.word.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Attempt a transition. Returns `true` iff it was applied.
    pub fn try_transition(&self, to: ConnectionState) -> bool {
        loop {
            let current = ConnectionState::from_u8(self.word.load(Ordering::Acquire));
            if !current.allows(to) {
                return false;
            }
            if self
                .word
                .compare_exchange(
                    current.as_u8(),
                    to.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let _ = self.tx.send(to);
                return true;
            }
        }
    }
}
