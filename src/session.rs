// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sessions and their lifecycle.
//!
//! A [`Session`] drives one client pipeline through the lifecycle of [`SessionState`]. Every
//! lifecycle command is sent with the session's primary lock held, and the caller then blocks until
//! the firmware acknowledges it or the core's timeout elapses. A timeout or an error response
//! leaves the session [`SessionState::Invalid`], from which only a local teardown is possible.
//!
//! Buffer operations and clock data are protected by a separate resource lock, so that buffers
//! keep flowing while a lifecycle command is outstanding. Flushes are serialized by their own
//! lock before taking the primary one.

pub mod state;

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use thiserror::Error;

use crate::buffer::BufCount;
use crate::buffer::BufferError;
use crate::buffer::BufferFlags;
use crate::buffer::BufferId;
use crate::buffer::BufferKind;
use crate::buffer::BufferTracker;
use crate::buffer::Owner;
use crate::buffer::ReturnStatus;
use crate::buffer::TrackedBuffer;
use crate::completion::CompletionError;
use crate::completion::CompletionRegistry;
use crate::dcvs::ClockData;
use crate::dcvs::DcvsConfig;
use crate::dcvs::DcvsController;
use crate::dcvs::ScalingProposal;
use crate::device::Core;
use crate::device::CoreError;
use crate::device::FaultKind;
use crate::event::Event;
use crate::firmware::Command;
use crate::firmware::CoreId;
use crate::firmware::FirmwareStatus;
use crate::firmware::FlushMode;
use crate::firmware::Response;
use crate::firmware::ResponseData;
use crate::firmware::ResponseKind;
use crate::firmware::Scope;
use crate::firmware::SendError;
use crate::firmware::SessionId;
use crate::platform::num_mbs_per_sec;
use crate::Fourcc;
use crate::Port;
use crate::Rect;
use crate::Resolution;
use crate::SessionFlags;
use crate::SessionType;
use crate::DEFAULT_FPS;
use crate::DEFAULT_HEIGHT;
use crate::DEFAULT_WIDTH;

pub use state::SessionState;
pub use state::Transition;

use state::Step;

/// Internal buffer kinds allocated when resources are loaded.
const INTERNAL_KINDS: [BufferKind; 3] = [
    BufferKind::Scratch,
    BufferKind::Persistent,
    BufferKind::Recon,
];

const PERSISTENT_BUFFER_SIZE: usize = 1 << 20;
const EOS_BUFFER_SIZE: usize = 4096;
/// Number of reconstruction buffers of an encoder.
const NUM_RECON_BUFFERS: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub session_type: SessionType,
    pub codec: Fourcc,
    pub flags: SessionFlags,
    pub dcvs: DcvsConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_type: Default::default(),
            codec: Fourcc::from(b"H264"),
            flags: SessionFlags::empty(),
            dcvs: Default::default(),
        }
    }
}

/// Properties of the frames going through a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameProperties {
    pub resolution: Resolution,
    pub crop: Rect,
    pub fps: u32,
    /// Target bitrate of an encoder, in bits per second.
    pub bitrate: u32,
}

impl Default for FrameProperties {
    fn default() -> Self {
        Self {
            resolution: Resolution {
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
            },
            crop: Rect {
                left: 0,
                top: 0,
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
            },
            fps: DEFAULT_FPS,
            bitrate: 0,
        }
    }
}

/// Resolution change reported by the firmware and not acknowledged by the client yet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reconfig {
    pub resolution: Resolution,
    pub sufficient: bool,
}

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("{codec} {session_type:?} is not supported")]
    UnsupportedCodec {
        session_type: SessionType,
        codec: Fourcc,
    },
    #[error("resolution {0} is out of the supported range")]
    Resolution(Resolution),
    #[error("crop {0:?} does not fit in the frame")]
    Crop(Rect),
    #[error("{count} buffers on the {port:?} port, expected between {min} and {max}")]
    BufferCount {
        port: Port,
        count: u32,
        min: u32,
        max: u32,
    },
    #[error("load of {requested} macroblocks/s exceeds the core maximum of {max}")]
    Load { requested: u64, max: u64 },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("buffers cannot be exchanged in state {0:?}")]
    NotOperating(SessionState),
    #[error("session is invalid")]
    Invalid,
    #[error("timed out waiting for {0:?}")]
    Timeout(ResponseKind),
    #[error("firmware answered {kind:?} with {status:?}")]
    Firmware {
        kind: ResponseKind,
        status: FirmwareStatus,
    },
    #[error("core is faulted")]
    DeviceFault,
    #[error("input port is being flushed")]
    Flushing,
    #[error("capacity violation: {0}")]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("failed to send command: {0}")]
    Send(#[from] SendError),
    #[error("core has been removed")]
    CoreGone,
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// State protected by the resource lock.
struct Resources {
    tracker: BufferTracker,
    clock: ClockData,
    props: FrameProperties,
    /// Mode of the outstanding flush, if any.
    flushing: Option<FlushMode>,
    reconfig: Option<Reconfig>,
}

/// Clock change to forward to the firmware, with the floor it was computed for.
type Scaling = (u64, ScalingProposal);

pub struct Session {
    id: SessionId,
    core_id: CoreId,
    core: Weak<Core>,
    config: SessionConfig,
    /// Primary lock, serializing lifecycle transitions.
    sync_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    state: Mutex<SessionState>,
    resources: Mutex<Resources>,
    completions: CompletionRegistry,
    dcvs: DcvsController,
    /// Macroblocks per second while resources are loaded, zero otherwise.
    load: AtomicU64,
}

impl Session {
    pub(crate) fn new(id: SessionId, core: &Arc<Core>, config: SessionConfig) -> SessionResult<Self> {
        let platform = core.platform();
        if platform
            .codec_data(config.session_type, config.codec)
            .is_none()
        {
            return Err(CapacityError::UnsupportedCodec {
                session_type: config.session_type,
                codec: config.codec,
            }
            .into());
        }

        let max_per_port =
            Port::ALL.map(|port| platform.buffer_limits(config.session_type, config.codec, port).max);
        let tracker = BufferTracker::new(
            core.allocator(),
            config.flags.contains(SessionFlags::SECURE),
            max_per_port,
        );

        log::debug!(
            "{id}: new {:?} session codec={} flags={:?}",
            config.session_type,
            config.codec,
            config.flags
        );

        Ok(Self {
            id,
            core_id: core.id(),
            core: Arc::downgrade(core),
            sync_lock: Default::default(),
            flush_lock: Default::default(),
            state: Mutex::new(SessionState::CoreUninitDone),
            resources: Mutex::new(Resources {
                tracker,
                clock: ClockData::new(&config.dcvs, config.flags),
                props: Default::default(),
                flushing: None,
                reconfig: None,
            }),
            completions: CompletionRegistry::for_session()?,
            dcvs: DcvsController::new(&config.dcvs),
            load: AtomicU64::new(0),
            config,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Macroblocks per second processed by this session while its resources are loaded.
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::SeqCst)
    }

    pub fn properties(&self) -> FrameProperties {
        self.lock_resources().props
    }

    pub fn clock(&self) -> ClockData {
        self.lock_resources().clock.clone()
    }

    pub fn buf_count(&self) -> BufCount {
        self.lock_resources().tracker.buf_count()
    }

    pub fn buffer(&self, id: BufferId) -> Option<TrackedBuffer> {
        self.lock_resources().tracker.get(id).ok().cloned()
    }

    /// Number of buffers held by `owner`.
    pub fn count(&self, owner: Owner) -> usize {
        self.lock_resources().tracker.count(owner)
    }

    /// Number of frame buffers still in use by the firmware, either held or referenced.
    pub fn outstanding_buffers(&self) -> usize {
        self.lock_resources()
            .tracker
            .iter()
            .filter(|buffer| !buffer.kind.is_internal())
            .filter(|buffer| buffer.owner == Owner::Firmware || buffer.refcount > 0)
            .count()
    }

    pub fn check_conservation(&self) -> bool {
        self.lock_resources().tracker.check_conservation()
    }

    pub fn reconfig(&self) -> Option<Reconfig> {
        self.lock_resources().reconfig
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sync(&self) -> MutexGuard<'_, ()> {
        self.sync_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn core(&self) -> SessionResult<Arc<Core>> {
        self.core.upgrade().ok_or(SessionError::CoreGone)
    }

    fn scope(&self) -> Scope {
        Scope::Session(self.core_id, self.id)
    }

    fn set_state(&self, core: &Core, to: SessionState) {
        let from = std::mem::replace(&mut *self.lock_state(), to);
        if from == to {
            return;
        }

        log::debug!("{}: {from:?} -> {to:?}", self.id);
        core.events().publish(Event::StateChanged {
            session: self.id,
            from,
            to,
        });
    }

    /// Moves the session to `Invalid` because of `kind`. Returns `false` if it already was.
    fn invalidate(&self, core: &Core, kind: FaultKind) -> bool {
        let from = {
            let mut state = self.lock_state();
            if *state == SessionState::Invalid {
                return false;
            }
            std::mem::replace(&mut *state, SessionState::Invalid)
        };

        log::error!("{}: {from:?} -> Invalid ({kind:?})", self.id);
        core.events().publish(Event::StateChanged {
            session: self.id,
            from,
            to: SessionState::Invalid,
        });
        core.events().publish(Event::Fault {
            core: self.core_id,
            session: Some(self.id),
            kind,
        });
        true
    }

    /// Returns the current state if the session may talk to the firmware.
    fn check_live(&self, core: &Core) -> SessionResult<SessionState> {
        let state = self.state();
        if state == SessionState::Invalid {
            return Err(SessionError::Invalid);
        }
        if let Some(kind) = core.fault() {
            self.invalidate(core, kind);
            return Err(SessionError::DeviceFault);
        }
        Ok(state)
    }

    fn check_operating(&self, core: &Core) -> SessionResult<()> {
        let state = self.check_live(core)?;
        if !state.is_operating() {
            return Err(SessionError::NotOperating(state));
        }
        Ok(())
    }

    /// Fails every outstanding wait of this session. Returns the number of waits cancelled.
    pub(crate) fn cancel_waits(&self) -> usize {
        self.completions.cancel_all()
    }

    fn command_for(&self, transition: Transition) -> Option<Command> {
        match transition {
            Transition::CoreInit | Transition::CoreUninit => None,
            Transition::Open => Some(Command::SessionInit {
                session_type: self.config.session_type,
                codec: self.config.codec,
                secure: self.config.flags.contains(SessionFlags::SECURE),
            }),
            Transition::LoadResources => Some(Command::LoadResources),
            Transition::Start => Some(Command::Start),
            Transition::Stop => Some(Command::Stop),
            Transition::ReleaseResources => Some(Command::ReleaseResources),
            Transition::Close => Some(Command::SessionEnd),
        }
    }

    /// Sends `command` with the slot of `kind` armed.
    ///
    /// The fault flag is checked once the slot is armed: a fault raised earlier is seen here, and
    /// a later one cancels the armed slot.
    fn send_armed(&self, core: &Core, command: Command, kind: ResponseKind) -> SessionResult<()> {
        self.completions.arm(kind)?;
        if let Some(fault) = core.fault() {
            self.completions.disarm(kind)?;
            self.invalidate(core, fault);
            return Err(SessionError::DeviceFault);
        }
        if let Err(e) = core.channel().send(self.scope(), command) {
            self.completions.disarm(kind)?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Waits for the acknowledgment of `kind`. Anything but a successful response invalidates the
    /// session.
    fn await_completion(&self, core: &Core, kind: ResponseKind) -> SessionResult<Response> {
        match self.completions.wait(kind, core.config().timeout) {
            Ok(response) if response.is_ok() => Ok(response),
            Ok(response) => {
                let code = match response.status {
                    FirmwareStatus::Error(code) => code,
                    FirmwareStatus::Ok => 0,
                };
                self.invalidate(core, FaultKind::SessionError(code));
                Err(SessionError::Firmware {
                    kind,
                    status: response.status,
                })
            }
            Err(CompletionError::Timeout(_)) => {
                log::error!("{}: timed out waiting for {kind:?}", self.id);
                self.invalidate(core, FaultKind::Timeout);
                if core.config().fault_core_on_timeout {
                    core.handle_fault(FaultKind::Timeout);
                }
                Err(SessionError::Timeout(kind))
            }
            Err(CompletionError::Cancelled(_)) => match core.fault() {
                Some(fault) => {
                    self.invalidate(core, fault);
                    Err(SessionError::DeviceFault)
                }
                // Cancelled by an asynchronous session error, which invalidated the session.
                None => Err(SessionError::Invalid),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Performs one lifecycle step. The primary lock must be held.
    ///
    /// With `teardown` set, states that are equivalent to the predecessor of the step for teardown
    /// purposes are accepted as well.
    fn run_step(&self, core: &Core, step: Step, teardown: bool) -> SessionResult<()> {
        let current = self.check_live(core)?;
        if current != step.from && !(teardown && current.teardown_equivalent() == step.from) {
            return Err(SessionError::IllegalTransition {
                from: current,
                to: step.pending,
            });
        }

        match step.transition {
            Transition::CoreInit => core.init()?,
            Transition::LoadResources => self.prepare_resources(core)?,
            _ => (),
        }

        match (self.command_for(step.transition), step.completion) {
            (Some(command), Some(kind)) => {
                if let Err(e) = self.send_armed(core, command, kind) {
                    if step.transition == Transition::LoadResources {
                        self.discard_internal(&mut self.lock_resources());
                    }
                    return Err(e);
                }
                self.set_state(core, step.pending);
                self.await_completion(core, kind)?;
            }
            (Some(command), None) => {
                core.channel().send(self.scope(), command)?;
                self.set_state(core, step.pending);
            }
            (None, _) => self.set_state(core, step.pending),
        }
        self.set_state(core, step.done);

        match step.transition {
            Transition::LoadResources => self.commit_resources(core),
            Transition::Stop => {
                self.reclaim_leftovers(&mut self.lock_resources(), FlushMode::All);
                Ok(())
            }
            Transition::ReleaseResources => self.free_resources(core),
            Transition::Close => {
                self.release_idle_frames();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Walks the lifecycle up to `target`. The primary lock must be held.
    fn drive(&self, core: &Core, target: SessionState) -> SessionResult<()> {
        loop {
            let current = self.check_live(core)?;
            if current.is_pending() {
                return Err(SessionError::IllegalTransition {
                    from: current,
                    to: target,
                });
            }

            let Some(step) = state::next_step(current, target) else {
                return Ok(());
            };
            self.run_step(core, step, true)?;
        }
    }

    /// Takes the session to `target`, performing every intermediate step. Nothing is done if the
    /// session already is at or past `target`.
    pub fn try_state(&self, target: SessionState) -> SessionResult<()> {
        let _sync = self.lock_sync();
        let core = self.core()?;
        self.drive(&core, target)
    }

    fn explicit_step(&self, transition: Transition) -> SessionResult<()> {
        let _sync = self.lock_sync();
        let core = self.core()?;
        self.run_step(&core, transition.step(), false)
    }

    /// Makes sure the core is initialized. The core must be ready for the session to exist, so
    /// this only confirms it.
    pub fn init_core(&self) -> SessionResult<()> {
        self.explicit_step(Transition::CoreInit)
    }

    /// Opens the session on the firmware, initializing the core first if needed.
    pub fn open(&self) -> SessionResult<()> {
        let _sync = self.lock_sync();
        let core = self.core()?;
        if self.state() == SessionState::CoreUninitDone {
            self.run_step(&core, Transition::CoreInit.step(), false)?;
        }
        self.run_step(&core, Transition::Open.step(), false)
    }

    /// Validates the session against the platform limits, allocates its internal buffers and
    /// asks the firmware to load its resources.
    pub fn load_resources(&self) -> SessionResult<()> {
        self.explicit_step(Transition::LoadResources)
    }

    pub fn start(&self) -> SessionResult<()> {
        self.explicit_step(Transition::Start)
    }

    pub fn stop(&self) -> SessionResult<()> {
        self.explicit_step(Transition::Stop)
    }

    pub fn release_resources(&self) -> SessionResult<()> {
        self.explicit_step(Transition::ReleaseResources)
    }

    /// Closes the session, stopping it and releasing its resources first if needed.
    ///
    /// An invalid session cannot talk to the firmware anymore: it is torn down locally, all its
    /// buffers going back to the client, and stays invalid.
    pub fn close(&self) -> SessionResult<()> {
        let _sync = self.lock_sync();
        let core = self.core()?;

        if self.state() == SessionState::Invalid {
            self.local_teardown(&core);
            return Ok(());
        }

        let res = self.drive(&core, SessionState::CloseDone);
        if self.state() == SessionState::Invalid {
            self.local_teardown(&core);
        }
        res
    }

    /// Final step before the session is dropped by the registry. Sessions that were not closed are
    /// torn down locally.
    pub(crate) fn detach(&self, core: &Core) {
        let _sync = self.lock_sync();

        match self.state() {
            SessionState::CoreUninit => (),
            SessionState::Invalid => self.local_teardown(core),
            state if state.teardown_equivalent() == SessionState::CloseDone => {
                if let Err(e) = self.run_step(core, Transition::CoreUninit.step(), true) {
                    log::warn!("{}: failed to uninitialize: {e}", self.id);
                    self.local_teardown(core);
                }
            }
            state => {
                log::warn!("{}: detaching from {state:?} without closing", self.id);
                self.local_teardown(core);
                self.set_state(core, SessionState::Invalid);
            }
        }
    }

    /// Hands every buffer back to its final owner without contacting the firmware.
    fn local_teardown(&self, core: &Core) {
        let mut res = self.lock_resources();
        let forced = res.tracker.force_return_all();
        if forced > 0 {
            log::warn!("{}: forced {forced} buffers back during teardown", self.id);
        }

        for kind in INTERNAL_KINDS.into_iter().chain([BufferKind::Eos]) {
            if let Err(e) = res.tracker.free_internal(kind) {
                log::warn!("{}: failed to free {kind:?} buffers: {e}", self.id);
            }
        }
        res.flushing = None;
        drop(res);

        self.load.store(0, Ordering::SeqCst);
        core.drop_clock(self.id);
    }

    fn cycles_per_mb(&self, core: &Core) -> SessionResult<u64> {
        let data = core
            .platform()
            .codec_data(self.config.session_type, self.config.codec)
            .ok_or(CapacityError::UnsupportedCodec {
                session_type: self.config.session_type,
                codec: self.config.codec,
            })?;

        Ok(data.cycles_per_mb(self.config.flags.contains(SessionFlags::LOW_POWER)))
    }

    /// Checks the platform limits and allocates the internal buffers, before the firmware is asked
    /// to load resources.
    fn prepare_resources(&self, core: &Core) -> SessionResult<()> {
        let platform = core.platform();
        let mut res = self.lock_resources();
        let props = res.props;

        if !platform.supports_resolution(props.resolution) {
            return Err(CapacityError::Resolution(props.resolution).into());
        }
        self.cycles_per_mb(core)?;

        let load = num_mbs_per_sec(props.resolution.width, props.resolution.height, props.fps);
        let requested = core.load(Some(self.id)).saturating_add(load);
        if requested > platform.max_load {
            return Err(CapacityError::Load {
                requested,
                max: platform.max_load,
            }
            .into());
        }

        let area = props.resolution.get_area();
        let mut internal = vec![
            (BufferKind::Scratch, 1, area),
            (BufferKind::Persistent, 1, PERSISTENT_BUFFER_SIZE),
        ];
        if self.config.session_type == SessionType::Encoder {
            internal.push((BufferKind::Recon, NUM_RECON_BUFFERS, area * 3 / 2));
        }

        for (kind, count, size) in internal {
            for index in 0..count {
                if let Err(e) = res.tracker.register(kind, index, size) {
                    self.discard_internal(&mut res);
                    return Err(e.into());
                }
            }
        }

        log::debug!(
            "{}: {} at {} fps, {load} macroblocks/s, core total {requested}",
            self.id,
            props.resolution,
            props.fps
        );
        Ok(())
    }

    /// Frees the internal buffers allocated for a load that did not go through.
    fn discard_internal(&self, res: &mut Resources) {
        for kind in INTERNAL_KINDS {
            if let Err(e) = res.tracker.free_internal(kind) {
                log::warn!("{}: failed to free {kind:?} buffers: {e}", self.id);
            }
        }
    }

    /// Hands the internal buffers to the firmware and sets the initial clock, once resources are
    /// loaded.
    fn commit_resources(&self, core: &Core) -> SessionResult<()> {
        let cycles = self.cycles_per_mb(core)?;

        let (set_buffers, scaling) = {
            let mut res = self.lock_resources();
            let mut set_buffers = Vec::new();
            for kind in INTERNAL_KINDS {
                let buffers = res.tracker.submit_internal(kind)?;
                if !buffers.is_empty() {
                    set_buffers.push(Command::SetBuffers { kind, buffers });
                }
            }

            let props = res.props;
            let load = num_mbs_per_sec(props.resolution.width, props.resolution.height, props.fps);
            self.load.store(load, Ordering::SeqCst);
            let proposal = res.clock.init_frequencies(core.platform(), load, cycles);
            (set_buffers, (res.clock.min_freq, proposal))
        };

        for command in set_buffers {
            core.channel().send(self.scope(), command)?;
        }
        self.scale_clocks(core, scaling);
        Ok(())
    }

    /// Takes back the internal buffers and drops any reference the firmware still holds, once
    /// resources are released.
    fn free_resources(&self, core: &Core) -> SessionResult<()> {
        let released = {
            let mut res = self.lock_resources();
            for kind in INTERNAL_KINDS {
                res.tracker.reclaim_internal(kind)?;
                res.tracker.free_internal(kind)?;
            }

            let referenced = res
                .tracker
                .iter()
                .filter(|buffer| buffer.flags.contains(BufferFlags::RBR_PENDING))
                .map(|buffer| buffer.id)
                .collect::<Vec<_>>();
            for id in &referenced {
                res.tracker.release_reference(*id)?;
            }
            referenced
        };

        self.load.store(0, Ordering::SeqCst);
        core.drop_clock(self.id);
        for buffer in released {
            core.events().publish(Event::ReleaseBufferReference {
                session: self.id,
                buffer,
            });
        }
        Ok(())
    }

    /// Returns the buffers of the ports covered by `mode` that the firmware should have returned
    /// already.
    fn reclaim_leftovers(&self, res: &mut Resources, mode: FlushMode) {
        let leftovers = res
            .tracker
            .iter()
            .filter(|buffer| buffer.owner == Owner::Firmware)
            .filter(|buffer| match buffer.kind {
                BufferKind::Frame(port) => mode.covers(port),
                BufferKind::Eos => mode.covers(Port::Output),
                _ => false,
            })
            .map(|buffer| (buffer.id, buffer.kind))
            .collect::<Vec<_>>();

        for (id, kind) in leftovers {
            log::warn!("{}: firmware did not return {id:?} kind={kind:?}", self.id);
            if let Err(e) = res.tracker.return_from_firmware(id, ReturnStatus::Completed) {
                log::warn!("{}: failed to reclaim {id:?}: {e}", self.id);
                continue;
            }
            if kind == BufferKind::Eos {
                let _ = res.tracker.deregister(id);
            }
        }
    }

    /// Hands the frame buffers the driver still holds to the client.
    fn release_idle_frames(&self) {
        let mut res = self.lock_resources();
        let idle = res
            .tracker
            .iter()
            .filter(|buffer| !buffer.kind.is_internal() && buffer.owner == Owner::Driver)
            .map(|buffer| buffer.id)
            .collect::<Vec<_>>();

        for id in idle {
            if let Err(e) = res.tracker.release_to_client(id) {
                log::warn!("{}: cannot release {id:?} to the client: {e}", self.id);
            }
        }
    }

    /// Flushes the queues covered by `mode`. Buffers submitted to those queues while the flush is
    /// outstanding are held back and submitted once it completes.
    pub fn flush(&self, mode: FlushMode) -> SessionResult<()> {
        let _flush = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _sync = self.lock_sync();
        let core = self.core()?;

        let current = self.check_live(&core)?;
        if current != SessionState::StartDone {
            return Err(SessionError::IllegalTransition {
                from: current,
                to: SessionState::StartDone,
            });
        }

        self.lock_resources().flushing = Some(mode);
        let res = self
            .send_armed(&core, Command::Flush(mode), ResponseKind::SessionFlushDone)
            .and_then(|()| self.await_completion(&core, ResponseKind::SessionFlushDone));

        let deferred = {
            let mut resources = self.lock_resources();
            resources.flushing = None;
            if res.is_ok() {
                self.reclaim_leftovers(&mut resources, mode);
            }
            Port::ALL
                .into_iter()
                .filter(|port| mode.covers(*port))
                .flat_map(|port| resources.tracker.take_deferred(port))
                .collect::<Vec<_>>()
        };
        res?;

        log::debug!("{}: flush {mode:?} done, resubmitting {} buffers", self.id, deferred.len());
        core.events().publish(Event::FlushDone {
            session: self.id,
            mode,
        });
        for id in deferred {
            self.submit(&core, id)?;
        }
        Ok(())
    }

    /// Registers `count` buffers of `size` bytes on `port`.
    pub fn request_buffers(&self, port: Port, count: u32, size: usize) -> SessionResult<Vec<BufferId>> {
        let core = self.core()?;
        self.check_operating(&core)?;

        let limits =
            core.platform()
                .buffer_limits(self.config.session_type, self.config.codec, port);
        let mut res = self.lock_resources();
        let existing = res.tracker.list(BufferKind::Frame(port)).count() as u32;
        let total = existing.saturating_add(count);
        if count == 0 || !limits.contains(total) {
            return Err(CapacityError::BufferCount {
                port,
                count: total,
                min: limits.min,
                max: limits.max,
            }
            .into());
        }

        let first = res
            .tracker
            .list(BufferKind::Frame(port))
            .map(|buffer| buffer.index + 1)
            .max()
            .unwrap_or(0);
        let mut ids = Vec::with_capacity(count as usize);
        for index in first..first + count {
            match res.tracker.register(BufferKind::Frame(port), index, size) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        let _ = res.tracker.deregister(id);
                    }
                    return Err(e.into());
                }
            }
        }

        log::debug!("{}: registered {count} buffers on {port:?}", self.id);
        Ok(ids)
    }

    /// Stops tracking a frame buffer and frees it.
    pub fn deregister_buffer(&self, id: BufferId) -> SessionResult<()> {
        let mut res = self.lock_resources();
        if res.tracker.get(id)?.kind.is_internal() {
            return Err(BufferError::UnknownBuffer(id).into());
        }
        Ok(res.tracker.deregister(id)?)
    }

    /// Queues a driver-owned frame buffer to the firmware.
    pub fn submit_buffer(&self, id: BufferId) -> SessionResult<()> {
        let core = self.core()?;
        self.check_operating(&core)?;
        self.submit(&core, id)
    }

    fn submit(&self, core: &Core, id: BufferId) -> SessionResult<()> {
        let command = {
            let mut res = self.lock_resources();
            let buffer = res.tracker.get(id)?;
            let (index, owner, refcount) = (buffer.index, buffer.owner, buffer.refcount);
            let BufferKind::Frame(port) = buffer.kind else {
                return Err(BufferError::UnknownBuffer(id).into());
            };

            if res.flushing.is_some_and(|mode| mode.covers(port)) {
                if owner != Owner::Driver {
                    return Err(BufferError::Ownership {
                        buffer: id,
                        expected: Owner::Driver,
                        actual: owner,
                    }
                    .into());
                }
                if refcount > 0 {
                    return Err(BufferError::InUse(id, refcount).into());
                }
                log::debug!("{}: deferring {id:?} until the flush completes", self.id);
                res.tracker.set_flag(id, BufferFlags::DEFERRED, true)?;
                return Ok(());
            }

            res.tracker.submit_to_firmware(id)?;
            match port {
                Port::Output => Command::EmptyThisBuffer {
                    buffer: id,
                    index,
                    eos: false,
                },
                Port::Capture => Command::FillThisBuffer { buffer: id, index },
            }
        };

        if let Err(e) = core.channel().send(self.scope(), command) {
            self.lock_resources().tracker.cancel_submit(id)?;
            return Err(e.into());
        }

        // Only submissions the firmware received count toward the load.
        let scaling = self.observe_load(core, &mut self.lock_resources());
        if let Some(scaling) = scaling {
            self.scale_clocks(core, scaling);
        }
        Ok(())
    }

    /// Queues an empty buffer carrying the end-of-stream marker on the input port.
    pub fn queue_eos(&self) -> SessionResult<BufferId> {
        let core = self.core()?;
        self.check_operating(&core)?;

        let id = {
            let mut res = self.lock_resources();
            if res.flushing.is_some_and(|mode| mode.covers(Port::Output)) {
                return Err(SessionError::Flushing);
            }
            let id = res.tracker.register(BufferKind::Eos, 0, EOS_BUFFER_SIZE)?;
            res.tracker.submit_to_firmware(id)?;
            id
        };

        let command = Command::EmptyThisBuffer {
            buffer: id,
            index: 0,
            eos: true,
        };
        if let Err(e) = core.channel().send(self.scope(), command) {
            let mut res = self.lock_resources();
            res.tracker.cancel_submit(id)?;
            res.tracker.deregister(id)?;
            return Err(e.into());
        }
        Ok(id)
    }

    pub fn release_to_client(&self, id: BufferId) -> SessionResult<()> {
        Ok(self.lock_resources().tracker.release_to_client(id)?)
    }

    pub fn reclaim_from_client(&self, id: BufferId) -> SessionResult<()> {
        Ok(self.lock_resources().tracker.reclaim_from_client(id)?)
    }

    /// Updates the frame properties. Not allowed while resources are loaded, unless the firmware
    /// asked for a resolution change.
    pub fn set_properties(&self, props: FrameProperties) -> SessionResult<()> {
        let core = self.core()?;
        let state = self.check_live(&core)?;

        if !core.platform().supports_resolution(props.resolution) {
            return Err(CapacityError::Resolution(props.resolution).into());
        }
        if !props.crop.fits_in(props.resolution) {
            return Err(CapacityError::Crop(props.crop).into());
        }

        let mut res = self.lock_resources();
        if state.is_operating() && res.reconfig.is_none() {
            return Err(SessionError::IllegalTransition {
                from: state,
                to: state,
            });
        }
        res.props = props;
        res.reconfig = None;
        Ok(())
    }

    pub fn set_turbo(&self, turbo: bool) -> SessionResult<()> {
        self.update_clock(|clock, core| clock.set_turbo(turbo, core.platform()))
    }

    /// Sets the operating rate in frames per second. [`crate::dcvs::OPERATING_RATE_MAX`] pins the
    /// clock to its maximum.
    pub fn set_operating_rate(&self, rate: u32) -> SessionResult<()> {
        self.update_clock(|clock, core| clock.set_operating_rate(rate, core.platform()))
    }

    fn update_clock<F>(&self, update: F) -> SessionResult<()>
    where
        F: FnOnce(&mut ClockData, &Core) -> Option<ScalingProposal>,
    {
        let core = self.core()?;
        self.check_live(&core)?;

        let scaling = {
            let mut res = self.lock_resources();
            let proposal = update(&mut res.clock, &core);
            proposal.map(|proposal| (res.clock.min_freq, proposal))
        };

        // The clock is only requested from the firmware once resources are loaded.
        if let Some(scaling) = scaling.filter(|_| self.load() > 0) {
            self.scale_clocks(&core, scaling);
        }
        Ok(())
    }

    /// Feeds one buffer event to the clock controller.
    fn observe_load(&self, core: &Core, res: &mut Resources) -> Option<Scaling> {
        let outstanding = res.tracker.outstanding();
        self.dcvs
            .on_buffer_event(&mut res.clock, outstanding, core.platform())
            .map(|proposal| (res.clock.min_freq, proposal))
    }

    fn scale_clocks(&self, core: &Core, (min_freq, proposal): Scaling) {
        let command = Command::ScaleClocks {
            freq: proposal.freq,
            work_mode: proposal.work_mode,
        };
        if let Err(e) = core.channel().send(self.scope(), command) {
            log::warn!("{}: failed to scale clocks: {e}", self.id);
            return;
        }

        log::debug!("{}: clock {} Hz {:?}", self.id, proposal.freq, proposal.work_mode);
        core.record_clock(self.id, min_freq, proposal.freq);
        core.events().publish(Event::ClockScaled {
            session: self.id,
            freq: proposal.freq,
            work_mode: proposal.work_mode,
        });
    }

    /// Routes a session-scope response.
    pub(crate) fn on_response(&self, core: &Core, kind: ResponseKind, response: Response) {
        match kind {
            ResponseKind::SessionEtbDone | ResponseKind::SessionFtbDone => {
                self.on_buffer_done(core, response)
            }
            ResponseKind::SessionReleaseBufferReference => self.on_release_reference(core, response),
            ResponseKind::SessionEventChange => self.on_event_change(core, response),
            ResponseKind::SessionError => self.on_session_error(core, response),
            kind => {
                if let Err(e) = self.completions.signal(kind, response) {
                    log::warn!("{}: dropping response: {e}", self.id);
                }
            }
        }
    }

    fn on_buffer_done(&self, core: &Core, response: Response) {
        let ResponseData::BufferDone { buffer, status } = response.data else {
            log::warn!("{}: buffer done without a buffer: {response:?}", self.id);
            return;
        };
        if !response.is_ok() {
            log::warn!("{}: {buffer:?} returned with {:?}", self.id, response.status);
        }

        let scaling = {
            let mut res = self.lock_resources();
            let kind = match res.tracker.return_from_firmware(buffer, status) {
                Ok(owner) => {
                    log::trace!("{}: {buffer:?} returned to {owner:?}", self.id);
                    res.tracker.get(buffer).map(|b| b.kind).ok()
                }
                Err(e) => {
                    log::warn!("{}: dropping buffer done: {e}", self.id);
                    return;
                }
            };
            if kind == Some(BufferKind::Eos) {
                if let Err(e) = res.tracker.deregister(buffer) {
                    log::warn!("{}: failed to free end-of-stream buffer: {e}", self.id);
                }
            }
            self.observe_load(core, &mut res)
        };

        if let Some(scaling) = scaling {
            self.scale_clocks(core, scaling);
        }
    }

    fn on_release_reference(&self, core: &Core, response: Response) {
        let ResponseData::BufferReference { buffer } = response.data else {
            log::warn!("{}: reference release without a buffer: {response:?}", self.id);
            return;
        };

        if let Err(e) = self.lock_resources().tracker.release_reference(buffer) {
            log::warn!("{}: dropping reference release: {e}", self.id);
            return;
        }
        core.events().publish(Event::ReleaseBufferReference {
            session: self.id,
            buffer,
        });
    }

    fn on_event_change(&self, core: &Core, response: Response) {
        let ResponseData::EventChange {
            resolution,
            sufficient,
        } = response.data
        else {
            log::warn!("{}: event change without data: {response:?}", self.id);
            return;
        };

        log::debug!("{}: resolution change to {resolution} sufficient={sufficient}", self.id);
        self.lock_resources().reconfig = Some(Reconfig {
            resolution,
            sufficient,
        });
        core.events().publish(Event::ResolutionChanged {
            session: self.id,
            resolution,
            sufficient,
        });
    }

    fn on_session_error(&self, core: &Core, response: Response) {
        let code = match response.status {
            FirmwareStatus::Error(code) => code,
            FirmwareStatus::Ok => 0,
        };
        if self.invalidate(core, FaultKind::SessionError(code)) {
            self.completions.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use std::sync::OnceLock;

    use super::*;
    use crate::buffer::AllocFlags;
    use crate::buffer::BufferAllocator;
    use crate::buffer::BufferHandle;
    use crate::buffer::TrackingAllocator;
    use crate::device::CoreConfig;
    use crate::event::EventLog;
    use crate::firmware::dummy::RecordingChannel;
    use crate::platform::PlatformLimits;

    const SHORT: Duration = Duration::from_millis(50);

    struct Fixture {
        channel: Arc<RecordingChannel>,
        events: Arc<EventLog>,
        core: Arc<Core>,
        session: Arc<Session>,
    }

    fn fixture(core_config: CoreConfig, config: SessionConfig) -> Fixture {
        fixture_with(core_config, config, Arc::new(TrackingAllocator::default()))
    }

    fn fixture_with(
        core_config: CoreConfig,
        config: SessionConfig,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Fixture {
        let channel = Arc::new(RecordingChannel::default());
        let events = Arc::new(EventLog::default());
        let core = Arc::new(
            Core::new(
                CoreId(0),
                channel.clone(),
                allocator,
                events.clone(),
                PlatformLimits::default(),
                core_config,
            )
            .unwrap(),
        );

        thread::scope(|s| {
            s.spawn(|| {
                // Responses sent before the command goes out are dropped.
                while !core.is_ready() {
                    core.on_response(ResponseKind::SysInitDone, Response::ok());
                    thread::yield_now();
                }
            });
            core.init().unwrap();
        });

        let session = Arc::new(Session::new(SessionId(1), &core, config).unwrap());
        core.add_session(session.clone());
        channel.clear();
        Fixture {
            channel,
            events,
            core,
            session,
        }
    }

    impl Fixture {
        /// Runs `op` while answering every lifecycle command with `response`.
        fn with_responses<T: Send>(
            &self,
            response: Response,
            op: impl FnOnce(&Session) -> T + Send,
        ) -> T {
            let done = std::sync::atomic::AtomicBool::new(false);
            thread::scope(|s| {
                s.spawn(|| {
                    while !done.load(Ordering::SeqCst) {
                        for kind in ResponseKind::SESSION_COMPLETIONS {
                            if self.session.completions.is_armed(kind) {
                                self.session.on_response(&self.core, kind, response.clone());
                            }
                        }
                        thread::yield_now();
                    }
                });
                let result = op(&self.session);
                done.store(true, Ordering::SeqCst);
                result
            })
        }

        fn ok<T: Send>(&self, op: impl FnOnce(&Session) -> T + Send) -> T {
            self.with_responses(Response::ok(), op)
        }

        fn started(&self) {
            self.ok(|s| {
                s.open().unwrap();
                s.load_resources().unwrap();
                s.start().unwrap();
            });
            self.channel.clear();
        }

        fn return_buffer(&self, id: BufferId, status: ReturnStatus) {
            self.session.on_response(
                &self.core,
                ResponseKind::SessionFtbDone,
                Response::buffer_done(id, status),
            );
        }
    }

    #[test]
    fn open_walks_core_init_and_open() {
        let f = fixture(Default::default(), Default::default());
        f.ok(|s| s.open()).unwrap();

        assert_eq!(f.session.state(), SessionState::OpenDone);
        assert_eq!(
            f.channel.commands(),
            vec![Command::SessionInit {
                session_type: SessionType::Decoder,
                codec: Fourcc::from(b"H264"),
                secure: false,
            }]
        );
        assert_eq!(
            f.events.transitions(SessionId(1)),
            vec![
                (SessionState::CoreUninitDone, SessionState::CoreInit),
                (SessionState::CoreInit, SessionState::CoreInitDone),
                (SessionState::CoreInitDone, SessionState::Open),
                (SessionState::Open, SessionState::OpenDone),
            ]
        );
    }

    #[test]
    fn out_of_order_command_is_rejected_without_sending() {
        let f = fixture(Default::default(), Default::default());
        f.ok(|s| s.open()).unwrap();
        f.channel.clear();

        assert!(matches!(
            f.session.start(),
            Err(SessionError::IllegalTransition {
                from: SessionState::OpenDone,
                to: SessionState::Start,
            })
        ));
        assert!(f.channel.commands().is_empty());
        assert_eq!(f.session.state(), SessionState::OpenDone);
    }

    #[test]
    fn load_resources_allocates_internal_buffers_and_clock() {
        let f = fixture(
            Default::default(),
            SessionConfig {
                session_type: SessionType::Encoder,
                ..Default::default()
            },
        );
        f.ok(|s| {
            s.open().unwrap();
            s.load_resources().unwrap();
        });

        let commands = f.channel.commands();
        assert!(commands.contains(&Command::LoadResources));
        let set_kinds = commands
            .iter()
            .filter_map(|c| match c {
                Command::SetBuffers { kind, buffers } => Some((*kind, buffers.len())),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            set_kinds,
            vec![
                (BufferKind::Scratch, 1),
                (BufferKind::Persistent, 1),
                (BufferKind::Recon, 2)
            ]
        );
        assert_eq!(f.session.count(Owner::Firmware), 4);

        let clock = f.session.clock();
        assert!(clock.curr_freq > 0);
        assert_eq!(f.core.curr_freq(), clock.curr_freq);
        assert!(matches!(commands.last(), Some(Command::ScaleClocks { .. })));
        assert!(f.session.load() > 0);
    }

    #[test]
    fn load_resources_rejects_excess_load() {
        let f = fixture(Default::default(), Default::default());
        f.ok(|s| s.open()).unwrap();
        f.session
            .set_properties(FrameProperties {
                resolution: Resolution::from((4096, 2304)),
                crop: Rect {
                    left: 0,
                    top: 0,
                    width: 4096,
                    height: 2304,
                },
                fps: 240,
                bitrate: 0,
            })
            .unwrap();
        f.channel.clear();

        assert!(matches!(
            f.session.load_resources(),
            Err(SessionError::Capacity(CapacityError::Load { .. }))
        ));
        assert_eq!(f.session.state(), SessionState::OpenDone);
        assert!(f.channel.commands().is_empty());
        assert_eq!(f.session.count(Owner::Driver), 0);
    }

    #[test]
    fn timeout_invalidates_session_only() {
        let f = fixture(
            CoreConfig {
                timeout: SHORT,
                ..Default::default()
            },
            Default::default(),
        );
        f.ok(|s| s.open()).unwrap();

        assert!(matches!(
            f.session.load_resources(),
            Err(SessionError::Timeout(ResponseKind::SessionLoadResourceDone))
        ));
        assert_eq!(f.session.state(), SessionState::Invalid);
        assert!(!f.core.is_faulted());

        f.channel.clear();
        assert!(matches!(f.session.start(), Err(SessionError::Invalid)));
        assert!(f.channel.commands().is_empty());

        // Teardown is still possible, locally.
        f.session.close().unwrap();
        assert!(f.channel.commands().is_empty());
        assert_eq!(f.session.state(), SessionState::Invalid);
        assert_eq!(f.session.count(Owner::Driver), 0);
    }

    #[test]
    fn timeout_can_fault_core() {
        let f = fixture(
            CoreConfig {
                timeout: SHORT,
                fault_core_on_timeout: true,
                ssr_on_fault: false,
            },
            Default::default(),
        );
        f.ok(|s| s.open()).unwrap();

        assert!(f.session.load_resources().is_err());
        assert_eq!(f.core.fault(), Some(FaultKind::Timeout));
    }

    #[test]
    fn error_response_invalidates_session() {
        let f = fixture(Default::default(), Default::default());

        let res = f.with_responses(Response::error(3), |s| s.open());
        assert!(matches!(
            res,
            Err(SessionError::Firmware {
                kind: ResponseKind::SessionInitDone,
                status: FirmwareStatus::Error(3),
            })
        ));
        assert_eq!(f.session.state(), SessionState::Invalid);
        assert!(f.events.events().contains(&Event::Fault {
            core: CoreId(0),
            session: Some(SessionId(1)),
            kind: FaultKind::SessionError(3),
        }));
    }

    #[test]
    fn core_fault_short_circuits_next_command() {
        let f = fixture(Default::default(), Default::default());
        f.ok(|s| s.open()).unwrap();
        f.core.handle_fault(FaultKind::Crash);
        f.channel.clear();

        assert!(matches!(f.session.load_resources(), Err(SessionError::DeviceFault)));
        assert_eq!(f.session.state(), SessionState::Invalid);
        assert!(f.channel.commands().is_empty());
    }

    #[test]
    fn core_fault_wakes_waiter() {
        let f = fixture(Default::default(), Default::default());
        f.ok(|s| s.open()).unwrap();

        let res = thread::scope(|s| {
            let waiter = s.spawn(|| f.session.load_resources());
            while !f.session.completions.is_armed(ResponseKind::SessionLoadResourceDone) {
                thread::yield_now();
            }
            f.core.handle_fault(FaultKind::WatchdogTimeout);
            waiter.join().unwrap()
        });

        assert!(matches!(res, Err(SessionError::DeviceFault)));
        assert_eq!(f.session.state(), SessionState::Invalid);
    }

    /// Allocator faulting the core while internal buffers are being allocated.
    #[derive(Default)]
    struct FaultingAllocator {
        core: OnceLock<Weak<Core>>,
        inner: TrackingAllocator,
    }

    impl BufferAllocator for FaultingAllocator {
        fn alloc(&self, size: usize, flags: AllocFlags) -> anyhow::Result<BufferHandle> {
            if let Some(core) = self.core.get().and_then(Weak::upgrade) {
                core.handle_fault(FaultKind::Crash);
            }
            self.inner.alloc(size, flags)
        }

        fn free(&self, handle: BufferHandle) {
            self.inner.free(handle)
        }
    }

    #[test]
    fn fault_during_load_preparation_skips_command() {
        let allocator = Arc::new(FaultingAllocator::default());
        let f = fixture_with(
            CoreConfig {
                ssr_on_fault: false,
                ..Default::default()
            },
            Default::default(),
            allocator.clone(),
        );
        f.ok(|s| s.open()).unwrap();
        f.channel.clear();
        allocator.core.set(Arc::downgrade(&f.core)).unwrap();

        let start = std::time::Instant::now();
        assert!(matches!(f.session.load_resources(), Err(SessionError::DeviceFault)));
        assert!(start.elapsed() < f.core.config().timeout);
        assert_eq!(f.session.state(), SessionState::Invalid);
        assert!(f.channel.commands().is_empty());
        assert!(!f
            .session
            .completions
            .is_armed(ResponseKind::SessionLoadResourceDone));

        f.session.close().unwrap();
        assert_eq!(f.session.count(Owner::Driver), 0);
        assert_eq!(allocator.inner.live_count(), 0);
    }

    #[test]
    fn failed_load_send_frees_internal_buffers() {
        let allocator = Arc::new(TrackingAllocator::default());
        let f = fixture_with(Default::default(), Default::default(), allocator.clone());
        f.ok(|s| s.open()).unwrap();
        f.channel.fail_once(Command::LoadResources);
        f.channel.clear();

        assert!(matches!(
            f.session.load_resources(),
            Err(SessionError::Send(SendError::Closed))
        ));
        assert_eq!(f.session.state(), SessionState::OpenDone);
        assert_eq!(f.session.count(Owner::Driver), 0);
        assert_eq!(allocator.live_count(), 0);

        f.ok(|s| s.load_resources()).unwrap();
        let set_buffers = f
            .channel
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::SetBuffers { kind, buffers } => Some((kind, buffers.len())),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            set_buffers,
            vec![(BufferKind::Scratch, 1), (BufferKind::Persistent, 1)]
        );
        assert_eq!(f.session.count(Owner::Firmware), 2);
        assert_eq!(allocator.live_count(), 2);
    }

    #[test]
    fn close_from_start_done_stops_and_releases() {
        let f = fixture(Default::default(), Default::default());
        f.started();

        f.ok(|s| s.close()).unwrap();

        assert_eq!(f.session.state(), SessionState::CloseDone);
        let lifecycle = f
            .channel
            .commands()
            .into_iter()
            .filter(|c| !matches!(c, Command::ScaleClocks { .. }))
            .collect::<Vec<_>>();
        assert_eq!(
            lifecycle,
            vec![Command::Stop, Command::ReleaseResources, Command::SessionEnd]
        );
        assert_eq!(f.session.load(), 0);
        assert_eq!(f.core.curr_freq(), 0);
    }

    #[test]
    fn close_after_open_skips_stop_and_release() {
        let f = fixture(Default::default(), Default::default());
        f.ok(|s| s.open()).unwrap();
        f.channel.clear();

        f.ok(|s| s.close()).unwrap();
        assert_eq!(f.session.state(), SessionState::CloseDone);
        assert_eq!(f.channel.commands(), vec![Command::SessionEnd]);
    }

    #[test]
    fn buffers_flow_through_ports() {
        let f = fixture(Default::default(), Default::default());
        f.started();

        let ids = f.session.request_buffers(Port::Capture, 2, 4096).unwrap();
        for id in &ids {
            f.session.submit_buffer(*id).unwrap();
        }
        assert_eq!(
            f.channel.commands(),
            vec![
                Command::FillThisBuffer {
                    buffer: ids[0],
                    index: 0
                },
                Command::FillThisBuffer {
                    buffer: ids[1],
                    index: 1
                },
            ]
        );

        f.return_buffer(ids[0], ReturnStatus::Completed);
        f.return_buffer(ids[1], ReturnStatus::Recycled);
        assert_eq!(f.session.buffer(ids[0]).unwrap().owner, Owner::Client);
        assert_eq!(f.session.buffer(ids[1]).unwrap().owner, Owner::Driver);
        assert_eq!(f.session.outstanding_buffers(), 1);

        f.session.on_response(
            &f.core,
            ResponseKind::SessionReleaseBufferReference,
            Response {
                status: FirmwareStatus::Ok,
                data: ResponseData::BufferReference { buffer: ids[1] },
            },
        );
        assert_eq!(f.session.buffer(ids[1]).unwrap().owner, Owner::Client);
        assert!(f.events.events().contains(&Event::ReleaseBufferReference {
            session: SessionId(1),
            buffer: ids[1],
        }));

        f.session.reclaim_from_client(ids[0]).unwrap();
        f.session.submit_buffer(ids[0]).unwrap();
        assert_eq!(f.session.buf_count().ftb, 3);
        assert_eq!(f.session.buf_count().fbd, 2);
        assert!(f.session.check_conservation());
    }

    #[test]
    fn buffer_operations_need_operating_state() {
        let f = fixture(Default::default(), Default::default());
        f.ok(|s| s.open()).unwrap();

        assert!(matches!(
            f.session.request_buffers(Port::Output, 1, 16),
            Err(SessionError::NotOperating(SessionState::OpenDone))
        ));
        assert!(matches!(
            f.session.queue_eos(),
            Err(SessionError::NotOperating(SessionState::OpenDone))
        ));
    }

    #[test]
    fn buffer_count_limits() {
        let f = fixture(
            Default::default(),
            SessionConfig {
                codec: Fourcc::from(b"VP90"),
                ..Default::default()
            },
        );
        f.started();

        assert!(matches!(
            f.session.request_buffers(Port::Output, 4, 16),
            Err(SessionError::Capacity(CapacityError::BufferCount { min: 6, .. }))
        ));
        assert!(matches!(
            f.session.request_buffers(Port::Capture, 33, 16),
            Err(SessionError::Capacity(CapacityError::BufferCount { max: 32, .. }))
        ));
        assert_eq!(f.session.request_buffers(Port::Output, 6, 16).unwrap().len(), 6);
    }

    #[test]
    fn ownership_violation_leaves_state_alone() {
        let f = fixture(Default::default(), Default::default());
        f.started();

        let id = f.session.request_buffers(Port::Output, 1, 16).unwrap()[0];
        f.session.submit_buffer(id).unwrap();
        assert!(matches!(
            f.session.submit_buffer(id),
            Err(SessionError::Buffer(BufferError::Ownership { .. }))
        ));
        assert!(matches!(
            f.session.reclaim_from_client(id),
            Err(SessionError::Buffer(BufferError::Ownership { .. }))
        ));
        assert_eq!(f.session.state(), SessionState::StartDone);
    }

    #[test]
    fn failed_submit_is_not_counted() {
        let f = fixture(Default::default(), Default::default());
        f.started();
        let id = f.session.request_buffers(Port::Capture, 1, 16).unwrap()[0];
        let before = f.session.clock().buffer_counter;
        f.channel.close();

        assert!(matches!(
            f.session.submit_buffer(id),
            Err(SessionError::Send(SendError::Closed))
        ));
        let buffer = f.session.buffer(id).unwrap();
        assert_eq!(buffer.owner, Owner::Driver);
        assert_eq!(buffer.refcount, 0);
        assert_eq!(f.session.buf_count(), BufCount::default());
        assert_eq!(f.session.clock().buffer_counter, before);
    }

    #[test]
    fn flush_defers_submissions_and_returns_leftovers() {
        let f = fixture(Default::default(), Default::default());
        f.started();
        let ids = f.session.request_buffers(Port::Output, 2, 16).unwrap();
        f.session.submit_buffer(ids[0]).unwrap();
        f.channel.clear();

        thread::scope(|s| {
            let flusher = s.spawn(|| f.session.flush(FlushMode::Input));
            while !f.session.completions.is_armed(ResponseKind::SessionFlushDone) {
                thread::yield_now();
            }

            f.session.submit_buffer(ids[1]).unwrap();
            assert!(f
                .session
                .buffer(ids[1])
                .unwrap()
                .flags
                .contains(BufferFlags::DEFERRED));

            f.session
                .on_response(&f.core, ResponseKind::SessionFlushDone, Response::ok());
            flusher.join().unwrap().unwrap();
        });

        // The firmware never returned the first buffer.
        assert_eq!(f.session.buffer(ids[0]).unwrap().owner, Owner::Client);
        let deferred = f.session.buffer(ids[1]).unwrap();
        assert_eq!(deferred.owner, Owner::Firmware);
        assert!(!deferred.flags.contains(BufferFlags::DEFERRED));
        assert_eq!(
            f.channel.commands(),
            vec![
                Command::Flush(FlushMode::Input),
                Command::EmptyThisBuffer {
                    buffer: ids[1],
                    index: 1,
                    eos: false
                }
            ]
        );
        assert!(f.events.events().contains(&Event::FlushDone {
            session: SessionId(1),
            mode: FlushMode::Input
        }));
    }

    #[test]
    fn stop_waits_for_outstanding_flush() {
        let f = fixture(Default::default(), Default::default());
        f.started();

        thread::scope(|s| {
            let flusher = s.spawn(|| f.session.flush(FlushMode::All));
            while !f.session.completions.is_armed(ResponseKind::SessionFlushDone) {
                thread::yield_now();
            }

            let stopper = s.spawn(|| f.session.stop());
            thread::sleep(SHORT);
            assert_eq!(f.channel.commands(), vec![Command::Flush(FlushMode::All)]);
            assert_eq!(f.session.state(), SessionState::StartDone);

            f.session
                .on_response(&f.core, ResponseKind::SessionFlushDone, Response::ok());
            flusher.join().unwrap().unwrap();

            while !f.session.completions.is_armed(ResponseKind::SessionStopDone) {
                thread::yield_now();
            }
            f.session
                .on_response(&f.core, ResponseKind::SessionStopDone, Response::ok());
            stopper.join().unwrap().unwrap();
        });

        assert_eq!(
            f.channel.commands(),
            vec![Command::Flush(FlushMode::All), Command::Stop]
        );
        assert_eq!(f.session.state(), SessionState::StopDone);
    }

    #[test]
    fn flush_needs_started_session() {
        let f = fixture(Default::default(), Default::default());
        f.ok(|s| s.open()).unwrap();

        assert!(matches!(
            f.session.flush(FlushMode::All),
            Err(SessionError::IllegalTransition {
                from: SessionState::OpenDone,
                ..
            })
        ));
    }

    #[test]
    fn eos_buffer_is_freed_on_return() {
        let f = fixture(Default::default(), Default::default());
        f.started();

        let id = f.session.queue_eos().unwrap();
        assert_eq!(
            f.channel.commands(),
            vec![Command::EmptyThisBuffer {
                buffer: id,
                index: 0,
                eos: true
            }]
        );
        f.session.on_response(
            &f.core,
            ResponseKind::SessionEtbDone,
            Response::buffer_done(id, ReturnStatus::Completed),
        );
        assert!(f.session.buffer(id).is_none());
        assert_eq!(f.session.buf_count().ebd, 1);
    }

    #[test]
    fn resolution_change_is_published() {
        let f = fixture(Default::default(), Default::default());
        f.started();

        let resolution = Resolution::from((1280, 720));
        f.session.on_response(
            &f.core,
            ResponseKind::SessionEventChange,
            Response {
                status: FirmwareStatus::Ok,
                data: ResponseData::EventChange {
                    resolution,
                    sufficient: true,
                },
            },
        );
        assert_eq!(
            f.session.reconfig(),
            Some(Reconfig {
                resolution,
                sufficient: true
            })
        );
        assert!(f.events.events().contains(&Event::ResolutionChanged {
            session: SessionId(1),
            resolution,
            sufficient: true,
        }));

        f.session
            .set_properties(FrameProperties {
                resolution,
                crop: Rect {
                    left: 0,
                    top: 0,
                    width: 1280,
                    height: 720,
                },
                ..Default::default()
            })
            .unwrap();
        assert_eq!(f.session.reconfig(), None);
    }

    #[test]
    fn async_session_error_invalidates() {
        let f = fixture(Default::default(), Default::default());
        f.started();

        f.session
            .on_response(&f.core, ResponseKind::SessionError, Response::error(9));
        assert_eq!(f.session.state(), SessionState::Invalid);
        assert!(!f.core.is_faulted());
        assert!(matches!(f.session.stop(), Err(SessionError::Invalid)));
    }

    #[test]
    fn turbo_pins_clock() {
        let f = fixture(Default::default(), Default::default());
        f.started();

        f.session.set_turbo(true).unwrap();
        assert_eq!(f.session.clock().curr_freq, f.core.platform().max_freq());
        assert!(f.channel.commands().contains(&Command::ScaleClocks {
            freq: f.core.platform().max_freq(),
            work_mode: crate::dcvs::WorkMode::Mode2,
        }));
    }
}
