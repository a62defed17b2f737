// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accelerator cores.
//!
//! A [`Core`] must go through `Uninit -> Initializing -> Ready` before sessions can be created on
//! it. Once faulted it stays faulted: every session it owns becomes invalid on its next
//! interaction, and recovery is left to a subsystem restart performed outside of this crate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use thiserror::Error;

use crate::buffer::BufferAllocator;
use crate::completion::CompletionError;
use crate::completion::CompletionRegistry;
use crate::event::Event;
use crate::event::EventSink;
use crate::firmware::Command;
use crate::firmware::CoreId;
use crate::firmware::FirmwareChannel;
use crate::firmware::FirmwareStatus;
use crate::firmware::Response;
use crate::firmware::ResponseKind;
use crate::firmware::Scope;
use crate::firmware::SendError;
use crate::firmware::SessionId;
use crate::platform::PlatformLimits;
use crate::session::Session;
use crate::DEFAULT_TIMEOUT;

/// Reason for a core or session fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// A command was not acknowledged in time.
    Timeout,
    /// The firmware reported a system error.
    SysError(u32),
    WatchdogTimeout,
    /// The firmware reported an error on a single session.
    SessionError(u32),
    /// The accelerator crashed, as reported by the hosting application.
    Crash,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CoreState {
    #[default]
    Uninit,
    Initializing,
    Ready,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    /// Bound on every wait for a firmware acknowledgment, device and session scope alike.
    pub timeout: Duration,
    /// Whether a session timeout also faults the core.
    pub fault_core_on_timeout: bool,
    /// Whether to request a subsystem restart when the core faults.
    pub ssr_on_fault: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            fault_core_on_timeout: false,
            ssr_on_fault: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("timed out waiting for core initialization")]
    InitTimeout,
    #[error("core initialization failed: {0:?}")]
    InitFailed(FirmwareStatus),
    #[error("timed out waiting for ping acknowledgment")]
    PingTimeout,
    #[error("ping acknowledged with {0:?}")]
    PingFailed(FirmwareStatus),
    #[error("core is {0:?}, not ready")]
    NotReady(CoreState),
    #[error("core is faulted")]
    Faulted,
    #[error("failed to send command: {0}")]
    Send(#[from] SendError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Clock requests of the sessions of a core.
#[derive(Debug, Default)]
struct CoreClock {
    /// Requested `(min_freq, curr_freq)` of each session.
    requests: BTreeMap<SessionId, (u64, u64)>,
    min_freq: u64,
    curr_freq: u64,
}

impl CoreClock {
    fn aggregate(&mut self) {
        self.min_freq = self.requests.values().map(|r| r.0).max().unwrap_or(0);
        self.curr_freq = self.requests.values().map(|r| r.1).max().unwrap_or(0);
    }
}

pub struct Core {
    id: CoreId,
    state: Mutex<CoreState>,
    /// Serializes device commands, so that at most one of each kind is outstanding.
    cmd_lock: Mutex<()>,
    completions: CompletionRegistry,
    sessions: Mutex<Vec<Arc<Session>>>,
    /// Set once, by the first fault.
    fault: Mutex<Option<FaultKind>>,
    clock: Mutex<CoreClock>,
    channel: Arc<dyn FirmwareChannel>,
    allocator: Arc<dyn BufferAllocator>,
    events: Arc<dyn EventSink>,
    platform: PlatformLimits,
    config: CoreConfig,
}

impl Core {
    pub fn new(
        id: CoreId,
        channel: Arc<dyn FirmwareChannel>,
        allocator: Arc<dyn BufferAllocator>,
        events: Arc<dyn EventSink>,
        platform: PlatformLimits,
        config: CoreConfig,
    ) -> CoreResult<Self> {
        Ok(Self {
            id,
            state: Default::default(),
            cmd_lock: Default::default(),
            completions: CompletionRegistry::for_device()?,
            sessions: Default::default(),
            fault: Default::default(),
            clock: Default::default(),
            channel,
            allocator,
            events,
            platform,
            config,
        })
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn state(&self) -> CoreState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, new_state: CoreState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        log::debug!("{}: {:?} -> {new_state:?}", self.id, *state);
        *state = new_state;
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CoreState::Ready
    }

    pub fn is_faulted(&self) -> bool {
        self.fault().is_some()
    }

    /// Kind of the fault that stopped the core, if any.
    pub fn fault(&self) -> Option<FaultKind> {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn platform(&self) -> &PlatformLimits {
        &self.platform
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn channel(&self) -> &dyn FirmwareChannel {
        self.channel.as_ref()
    }

    pub(crate) fn allocator(&self) -> Arc<dyn BufferAllocator> {
        Arc::clone(&self.allocator)
    }

    pub(crate) fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    fn lock_cmd(&self) -> MutexGuard<'_, ()> {
        self.cmd_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `command` and waits for its acknowledgment.
    fn command(&self, command: Command) -> CoreResult<Response> {
        let Some(kind) = command.expected_response() else {
            self.channel.send(Scope::Device(self.id), command)?;
            return Ok(Response::ok());
        };

        self.completions.arm(kind)?;
        if let Err(e) = self.channel.send(Scope::Device(self.id), command) {
            self.completions.disarm(kind)?;
            return Err(e.into());
        }

        Ok(self.completions.wait(kind, self.config.timeout)?)
    }

    /// Initializes the firmware of the core. Does nothing if the core is already ready.
    pub fn init(&self) -> CoreResult<()> {
        let _cmd = self.lock_cmd();

        match self.state() {
            CoreState::Ready => return Ok(()),
            CoreState::Initializing => return Err(CoreError::NotReady(CoreState::Initializing)),
            CoreState::Uninit => (),
        }
        if self.is_faulted() {
            return Err(CoreError::Faulted);
        }

        self.set_state(CoreState::Initializing);
        let res = match self.command(Command::SysInit) {
            Ok(response) if response.is_ok() => Ok(()),
            Ok(response) => Err(CoreError::InitFailed(response.status)),
            Err(CoreError::Completion(CompletionError::Timeout(_))) => Err(CoreError::InitTimeout),
            Err(e) => Err(e),
        };

        match &res {
            Ok(()) => self.set_state(CoreState::Ready),
            Err(e) => {
                log::error!("{}: initialization failed: {e}", self.id);
                self.set_state(CoreState::Uninit);
            }
        }
        res
    }

    /// Checks that the firmware is responsive. A missed acknowledgment faults the core.
    pub fn ping(&self) -> CoreResult<()> {
        let _cmd = self.lock_cmd();

        self.check_usable()?;
        match self.command(Command::SysPing) {
            Ok(response) if response.is_ok() => Ok(()),
            Ok(response) => Err(CoreError::PingFailed(response.status)),
            Err(CoreError::Completion(CompletionError::Timeout(_))) => {
                self.handle_fault(FaultKind::Timeout);
                Err(CoreError::PingTimeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Fails unless sessions may be created on or issue commands to this core.
    pub fn check_usable(&self) -> CoreResult<()> {
        if self.is_faulted() {
            return Err(CoreError::Faulted);
        }
        match self.state() {
            CoreState::Ready => Ok(()),
            state => Err(CoreError::NotReady(state)),
        }
    }

    /// Marks the core as faulted and wakes every thread waiting on it or on one of its sessions.
    pub fn handle_fault(&self, kind: FaultKind) {
        {
            let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(first) = *fault {
                log::warn!("{}: already faulted with {first:?}, ignoring {kind:?}", self.id);
                return;
            }
            *fault = Some(kind);
        }
        log::error!("{}: fault {kind:?}", self.id);

        let mut cancelled = self.completions.cancel_all();
        for session in self.sessions() {
            cancelled += session.cancel_waits();
        }
        log::debug!("{}: cancelled {cancelled} outstanding waits", self.id);

        self.events.publish(Event::Fault {
            core: self.id,
            session: None,
            kind,
        });

        if self.config.ssr_on_fault {
            log::info!("{}: requesting subsystem restart", self.id);
            match self
                .channel
                .send(Scope::Device(self.id), Command::TriggerSubsystemRestart(kind))
            {
                Ok(()) => self.events.publish(Event::SubsystemRestart {
                    core: self.id,
                    kind,
                }),
                Err(e) => log::error!("{}: failed to trigger subsystem restart: {e}", self.id),
            }
        }
    }

    /// Routes a device-scope response.
    pub(crate) fn on_response(&self, kind: ResponseKind, response: Response) {
        match kind {
            ResponseKind::SysError => {
                let code = match response.status {
                    FirmwareStatus::Error(code) => code,
                    FirmwareStatus::Ok => 0,
                };
                self.handle_fault(FaultKind::SysError(code));
            }
            ResponseKind::SysWatchdogTimeout => self.handle_fault(FaultKind::WatchdogTimeout),
            kind => {
                if let Err(e) = self.completions.signal(kind, response) {
                    log::warn!("{}: dropping response: {e}", self.id);
                }
            }
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, Vec<Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock_sessions().clone()
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn find_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock_sessions().iter().find(|s| s.id() == id).cloned()
    }

    pub(crate) fn add_session(&self, session: Arc<Session>) {
        self.lock_sessions().push(session);
    }

    pub(crate) fn remove_session(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.lock_sessions();
        let pos = sessions.iter().position(|s| s.id() == id)?;
        Some(sessions.remove(pos))
    }

    /// Aggregate macroblock throughput of the sessions with loaded resources, except `exclude`.
    pub fn load(&self, exclude: Option<SessionId>) -> u64 {
        self.lock_sessions()
            .iter()
            .filter(|s| Some(s.id()) != exclude)
            .map(|s| s.load())
            .sum()
    }

    fn lock_clock(&self) -> MutexGuard<'_, CoreClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the clock requested by `session`. The core runs at the highest request.
    pub(crate) fn record_clock(&self, session: SessionId, min_freq: u64, curr_freq: u64) {
        let mut clock = self.lock_clock();
        clock.requests.insert(session, (min_freq, curr_freq));
        clock.aggregate();
    }

    pub(crate) fn drop_clock(&self, session: SessionId) {
        let mut clock = self.lock_clock();
        if clock.requests.remove(&session).is_some() {
            clock.aggregate();
        }
    }

    pub fn min_freq(&self) -> u64 {
        self.lock_clock().min_freq
    }

    pub fn curr_freq(&self) -> u64 {
        self.lock_clock().curr_freq
    }
}
