// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Waitable slots matching firmware responses to the commands that expect them.
//!
//! Each scope (a core or a session) owns one [`CompletionRegistry`] holding a slot per response
//! kind it can wait for. The protocol for a command expecting an acknowledgment is:
//!
//! 1. [`CompletionRegistry::arm`] the slot of the expected kind,
//! 2. send the command,
//! 3. [`CompletionRegistry::wait`] on the slot with a timeout.
//!
//! The response dispatcher calls [`CompletionRegistry::signal`]. Because the slot is armed before
//! the command leaves, a response that arrives before the caller starts waiting is kept and
//! observed by the wait. A signal for a slot that is not armed has no command to match and is
//! rejected.

use std::collections::BTreeMap;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use thiserror::Error;

use crate::firmware::Response;
use crate::firmware::ResponseKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("timed out waiting for {0:?}")]
    Timeout(ResponseKind),
    #[error("wait for {0:?} was cancelled")]
    Cancelled(ResponseKind),
    #[error("no completion slot for {0:?} in this scope")]
    UnknownKind(ResponseKind),
    #[error("unexpected {0:?}: no command is outstanding")]
    Unexpected(ResponseKind),
    #[error("waiting for {0:?} without an outstanding command")]
    NotArmed(ResponseKind),
    #[error("{0:?} is listed more than once")]
    DuplicateKind(ResponseKind),
    #[error("{0:?} does not belong to a {1:?} scope")]
    WrongScope(ResponseKind, ScopeKind),
}

pub type CompletionResult<T> = Result<T, CompletionError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Device,
    Session,
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Idle,
    /// A command is outstanding and its response has not arrived yet.
    Armed,
    Signaled(Response),
    Cancelled,
}

#[derive(Debug, Default)]
struct CompletionSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl CompletionSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct CompletionRegistry {
    scope: ScopeKind,
    slots: BTreeMap<ResponseKind, CompletionSlot>,
}

impl CompletionRegistry {
    /// Creates a registry with one slot for each of `kinds`, which must all belong to `scope` and
    /// be distinct.
    pub fn new(scope: ScopeKind, kinds: &[ResponseKind]) -> CompletionResult<Self> {
        let mut slots = BTreeMap::new();

        for kind in kinds {
            let is_device = kind.is_device();
            if is_device != (scope == ScopeKind::Device) {
                return Err(CompletionError::WrongScope(*kind, scope));
            }

            if slots.insert(*kind, CompletionSlot::default()).is_some() {
                return Err(CompletionError::DuplicateKind(*kind));
            }
        }

        Ok(Self { scope, slots })
    }

    pub fn for_device() -> CompletionResult<Self> {
        Self::new(ScopeKind::Device, &ResponseKind::DEVICE_COMPLETIONS)
    }

    pub fn for_session() -> CompletionResult<Self> {
        Self::new(ScopeKind::Session, &ResponseKind::SESSION_COMPLETIONS)
    }

    pub fn scope(&self) -> ScopeKind {
        self.scope
    }

    pub fn contains(&self, kind: ResponseKind) -> bool {
        self.slots.contains_key(&kind)
    }

    fn slot(&self, kind: ResponseKind) -> CompletionResult<&CompletionSlot> {
        self.slots
            .get(&kind)
            .ok_or(CompletionError::UnknownKind(kind))
    }

    /// Prepares the slot of `kind` to receive the response to a command about to be sent.
    ///
    /// Any stale response still held by the slot is discarded.
    pub fn arm(&self, kind: ResponseKind) -> CompletionResult<()> {
        let slot = self.slot(kind)?;
        let mut state = slot.lock();
        if let SlotState::Signaled(stale) = &*state {
            log::warn!("Discarding stale {kind:?} response status={:?}", stale.status);
        }
        *state = SlotState::Armed;
        Ok(())
    }

    /// Returns an armed slot to idle, for a command that could not be sent.
    pub fn disarm(&self, kind: ResponseKind) -> CompletionResult<()> {
        let slot = self.slot(kind)?;
        *slot.lock() = SlotState::Idle;
        Ok(())
    }

    /// Delivers the response of `kind`, waking its waiter if there is one.
    pub fn signal(&self, kind: ResponseKind, response: Response) -> CompletionResult<()> {
        let slot = self.slot(kind)?;
        let mut state = slot.lock();
        match *state {
            SlotState::Armed => {
                *state = SlotState::Signaled(response);
                slot.cond.notify_one();
                Ok(())
            }
            _ => Err(CompletionError::Unexpected(kind)),
        }
    }

    /// Blocks until the response of `kind` is signaled or `timeout` elapses.
    ///
    /// The slot is idle again when this returns, whatever the outcome.
    pub fn wait(&self, kind: ResponseKind, timeout: Duration) -> CompletionResult<Response> {
        let slot = self.slot(kind)?;
        let state = slot.lock();
        if matches!(*state, SlotState::Idle) {
            return Err(CompletionError::NotArmed(kind));
        }

        let (mut state, _) = slot
            .cond
            .wait_timeout_while(state, timeout, |state| matches!(state, SlotState::Armed))
            .unwrap_or_else(PoisonError::into_inner);

        match std::mem::take(&mut *state) {
            SlotState::Signaled(response) => Ok(response),
            SlotState::Cancelled => Err(CompletionError::Cancelled(kind)),
            SlotState::Armed => {
                log::debug!("Timed out after {timeout:?} waiting for {kind:?}");
                Err(CompletionError::Timeout(kind))
            }
            SlotState::Idle => Err(CompletionError::NotArmed(kind)),
        }
    }

    /// Fails every outstanding wait of this scope. Returns the number of slots cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for (kind, slot) in &self.slots {
            let mut state = slot.lock();
            if matches!(*state, SlotState::Armed) {
                log::debug!("Cancelling outstanding {kind:?}");
                *state = SlotState::Cancelled;
                slot.cond.notify_all();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Whether a command expecting `kind` is outstanding.
    pub fn is_armed(&self, kind: ResponseKind) -> bool {
        self.slots
            .get(&kind)
            .map(|slot| matches!(*slot.lock(), SlotState::Armed))
            .unwrap_or(false)
    }
}
