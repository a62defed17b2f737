// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Notifications for the layer forwarding session events to clients.

use std::sync::Mutex;
use std::sync::PoisonError;

use crate::buffer::BufferId;
use crate::dcvs::WorkMode;
use crate::device::FaultKind;
use crate::firmware::CoreId;
use crate::firmware::FlushMode;
use crate::firmware::SessionId;
use crate::session::SessionState;
use crate::Resolution;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    StateChanged {
        session: SessionId,
        from: SessionState,
        to: SessionState,
    },
    /// A core, or a single session if `session` is set, stopped working.
    Fault {
        core: CoreId,
        session: Option<SessionId>,
        kind: FaultKind,
    },
    ResolutionChanged {
        session: SessionId,
        resolution: Resolution,
        /// Whether the currently registered buffers can hold frames of the new resolution.
        sufficient: bool,
    },
    FlushDone {
        session: SessionId,
        mode: FlushMode,
    },
    /// The firmware does not use `buffer` as a reference anymore and it is back with the client.
    ReleaseBufferReference {
        session: SessionId,
        buffer: BufferId,
    },
    ClockScaled {
        session: SessionId,
        freq: u64,
        work_mode: WorkMode,
    },
    SubsystemRestart {
        core: CoreId,
        kind: FaultKind,
    },
}

/// Receiver of [`Event`]s. `publish` may be called from the response dispatcher and must not block
/// on session operations.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Sink discarding every event.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: Event) {}
}

/// Sink keeping every event it receives, in order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns the events received so far.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// State changes published for `session`, as `(from, to)` pairs.
    pub fn transitions(&self, session: SessionId) -> Vec<(SessionState, SessionState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::StateChanged {
                    session: s,
                    from,
                    to,
                } if s == session => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for EventLog {
    fn publish(&self, event: Event) {
        log::trace!("Event {event:?}");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
