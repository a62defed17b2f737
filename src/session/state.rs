// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session lifecycle states and the table of transitions between them.

use crate::firmware::ResponseKind;

/// State of a session. The lifecycle states are declared in the order the session goes through
/// them, each command having a pending state entered when it is sent and a done state entered when
/// it is acknowledged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    CoreUninitDone,
    CoreInit,
    CoreInitDone,
    Open,
    OpenDone,
    LoadResources,
    LoadResourcesDone,
    Start,
    StartDone,
    Stop,
    StopDone,
    ReleaseResources,
    ReleaseResourcesDone,
    Close,
    CloseDone,
    CoreUninit,
    /// Absorbing error state.
    Invalid,
}

impl SessionState {
    /// Whether buffers can be exchanged with the firmware: resources are loaded and not released
    /// yet.
    pub fn is_operating(&self) -> bool {
        matches!(
            self,
            SessionState::LoadResourcesDone
                | SessionState::Start
                | SessionState::StartDone
                | SessionState::Stop
                | SessionState::StopDone
        )
    }

    /// Whether a command of this session is in flight.
    pub fn is_pending(&self) -> bool {
        LIFECYCLE.iter().any(|step| step.pending == *self)
    }

    /// State that `self` is equivalent to when tearing the session down. A session that never
    /// started has nothing to stop, one that never loaded resources has nothing to release, and
    /// one that never opened has nothing to close.
    pub fn teardown_equivalent(&self) -> SessionState {
        match self {
            SessionState::CoreUninitDone | SessionState::CoreInitDone => SessionState::CloseDone,
            SessionState::OpenDone => SessionState::ReleaseResourcesDone,
            SessionState::LoadResourcesDone => SessionState::StopDone,
            state => *state,
        }
    }
}

/// A lifecycle command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    CoreInit,
    Open,
    LoadResources,
    Start,
    Stop,
    ReleaseResources,
    Close,
    CoreUninit,
}

/// Row of the transition table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub transition: Transition,
    /// Required predecessor.
    pub from: SessionState,
    /// State while the command is outstanding.
    pub pending: SessionState,
    pub done: SessionState,
    /// Acknowledgment awaited before entering `done`. Steps without one complete locally.
    pub completion: Option<ResponseKind>,
}

const fn step(
    transition: Transition,
    from: SessionState,
    pending: SessionState,
    done: SessionState,
    completion: Option<ResponseKind>,
) -> Step {
    Step {
        transition,
        from,
        pending,
        done,
        completion,
    }
}

pub const LIFECYCLE: [Step; 8] = [
    step(
        Transition::CoreInit,
        SessionState::CoreUninitDone,
        SessionState::CoreInit,
        SessionState::CoreInitDone,
        None,
    ),
    step(
        Transition::Open,
        SessionState::CoreInitDone,
        SessionState::Open,
        SessionState::OpenDone,
        Some(ResponseKind::SessionInitDone),
    ),
    step(
        Transition::LoadResources,
        SessionState::OpenDone,
        SessionState::LoadResources,
        SessionState::LoadResourcesDone,
        Some(ResponseKind::SessionLoadResourceDone),
    ),
    step(
        Transition::Start,
        SessionState::LoadResourcesDone,
        SessionState::Start,
        SessionState::StartDone,
        Some(ResponseKind::SessionStartDone),
    ),
    step(
        Transition::Stop,
        SessionState::StartDone,
        SessionState::Stop,
        SessionState::StopDone,
        Some(ResponseKind::SessionStopDone),
    ),
    step(
        Transition::ReleaseResources,
        SessionState::StopDone,
        SessionState::ReleaseResources,
        SessionState::ReleaseResourcesDone,
        Some(ResponseKind::SessionReleaseResourceDone),
    ),
    step(
        Transition::Close,
        SessionState::ReleaseResourcesDone,
        SessionState::Close,
        SessionState::CloseDone,
        Some(ResponseKind::SessionEndDone),
    ),
    step(
        Transition::CoreUninit,
        SessionState::CloseDone,
        SessionState::CoreUninit,
        SessionState::CoreUninit,
        None,
    ),
];

impl Transition {
    pub fn step(&self) -> Step {
        // The table has one row per transition, in declaration order.
        LIFECYCLE[*self as usize]
    }
}

/// Next step to take from `current` on the way to `target`, or `None` if `current` is at or past
/// `target`.
pub fn next_step(current: SessionState, target: SessionState) -> Option<Step> {
    if current == SessionState::Invalid || current >= target {
        return None;
    }

    let equivalent = current.teardown_equivalent();
    if equivalent == target {
        return None;
    }
    let effective = if target > equivalent { equivalent } else { current };

    LIFECYCLE.iter().copied().find(|step| step.from == effective)
}
