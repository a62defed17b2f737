// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide collection of cores and sessions.
//!
//! The [`Registry`] lock only protects membership. It is never held while a core initializes, a
//! session waits for the firmware or a response is being routed: lookups clone the `Arc` they need
//! and release the lock before using it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use thiserror::Error;

use crate::buffer::Owner;
use crate::device::Core;
use crate::device::CoreError;
use crate::firmware::CoreId;
use crate::firmware::Response;
use crate::firmware::ResponseKind;
use crate::firmware::ResponseSink;
use crate::firmware::Scope;
use crate::firmware::SessionId;
use crate::session::Session;
use crate::session::SessionConfig;
use crate::session::SessionError;
use crate::MAX_SUPPORTED_INSTANCES;

/// How a session was removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Teardown {
    /// Every buffer had been returned by the firmware.
    Orderly,
    /// Some buffers were still held or referenced by the firmware and had to be taken back.
    Forced,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown {0}")]
    UnknownCore(CoreId),
    #[error("unknown {0}")]
    UnknownSession(SessionId),
    #[error("{0} is already registered")]
    DuplicateCore(CoreId),
    #[error("too many sessions ({0})")]
    TooManySessions(usize),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Default)]
struct Inner {
    cores: Vec<Arc<Core>>,
    next_session_id: u32,
}

impl Inner {
    fn core(&self, id: CoreId) -> RegistryResult<Arc<Core>> {
        self.cores
            .iter()
            .find(|core| core.id() == id)
            .cloned()
            .ok_or(RegistryError::UnknownCore(id))
    }

    fn session_count(&self) -> usize {
        self.cores.iter().map(|core| core.session_count()).sum()
    }

    fn find_session(&self, id: SessionId) -> Option<(Arc<Core>, Arc<Session>)> {
        self.cores
            .iter()
            .find_map(|core| core.find_session(id).map(|session| (core.clone(), session)))
    }
}

pub struct Registry {
    inner: Mutex<Inner>,
    max_sessions: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(MAX_SUPPORTED_INSTANCES)
    }
}

impl Registry {
    /// Creates a registry accepting at most `max_sessions` sessions over all its cores.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Default::default(),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_core(&self, core: Core) -> RegistryResult<Arc<Core>> {
        let mut inner = self.lock();
        if inner.cores.iter().any(|c| c.id() == core.id()) {
            return Err(RegistryError::DuplicateCore(core.id()));
        }

        log::debug!("Registering {}", core.id());
        let core = Arc::new(core);
        inner.cores.push(Arc::clone(&core));
        Ok(core)
    }

    /// Initializes the firmware of core `id`.
    pub fn init_core(&self, id: CoreId) -> RegistryResult<()> {
        let core = self.lock().core(id)?;
        Ok(core.init()?)
    }

    /// Removes core `id` along with its sessions, which are torn down locally.
    pub fn unregister_core(&self, id: CoreId) -> RegistryResult<()> {
        let core = {
            let mut inner = self.lock();
            let pos = inner
                .cores
                .iter()
                .position(|core| core.id() == id)
                .ok_or(RegistryError::UnknownCore(id))?;
            inner.cores.remove(pos)
        };

        for session in core.sessions() {
            session.detach(&core);
            core.remove_session(session.id());
        }
        log::debug!("Unregistered {id}");
        Ok(())
    }

    pub fn find_core(&self, id: CoreId) -> Option<Arc<Core>> {
        self.lock().core(id).ok()
    }

    pub fn cores(&self) -> Vec<Arc<Core>> {
        self.lock().cores.clone()
    }

    /// Creates a session on core `core_id`, which must be initialized and healthy.
    pub fn create_session(
        &self,
        core_id: CoreId,
        config: SessionConfig,
    ) -> RegistryResult<Arc<Session>> {
        let mut inner = self.lock();
        let core = inner.core(core_id)?;
        core.check_usable()?;

        let count = inner.session_count();
        if count >= self.max_sessions || core.session_count() >= core.platform().max_sessions {
            log::error!("Cannot create a session on {core_id}: {count} sessions already open");
            return Err(RegistryError::TooManySessions(count));
        }

        let id = SessionId(inner.next_session_id);
        let session = Arc::new(Session::new(id, &core, config)?);
        inner.next_session_id = inner.next_session_id.wrapping_add(1);
        core.add_session(Arc::clone(&session));

        log::info!("Created {id} on {core_id}, {} sessions open", count + 1);
        Ok(session)
    }

    /// Removes session `id`. Buffers the firmware still holds or references are forcibly returned.
    pub fn unregister_session(&self, id: SessionId) -> RegistryResult<Teardown> {
        let (core, session) = self
            .lock()
            .find_session(id)
            .ok_or(RegistryError::UnknownSession(id))?;

        let teardown = if session.outstanding_buffers() > 0 || session.count(Owner::Firmware) > 0 {
            log::warn!(
                "{id}: removed with {} buffers still in use by the firmware",
                session.outstanding_buffers()
            );
            Teardown::Forced
        } else {
            Teardown::Orderly
        };

        session.detach(&core);
        core.remove_session(id);
        log::info!("Removed {id} ({teardown:?})");
        Ok(teardown)
    }

    pub fn find_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock().find_session(id).map(|(_, session)| session)
    }

    pub fn session_count(&self) -> usize {
        self.lock().session_count()
    }
}

impl ResponseSink for Registry {
    fn on_response(&self, scope: Scope, kind: ResponseKind, response: Response) {
        log::trace!("Response {kind:?} for {scope:?}: {response:?}");

        match scope {
            Scope::Device(core_id) => {
                let Ok(core) = self.lock().core(core_id) else {
                    log::warn!("Dropping {kind:?} for unknown {core_id}");
                    return;
                };
                if !kind.is_device() {
                    log::warn!("{core_id}: dropping session response {kind:?}");
                    return;
                }
                core.on_response(kind, response);
            }
            Scope::Session(core_id, session_id) => {
                let target = {
                    let inner = self.lock();
                    inner
                        .core(core_id)
                        .ok()
                        .and_then(|core| core.find_session(session_id).map(|s| (core, s)))
                };
                let Some((core, session)) = target else {
                    log::warn!("Dropping {kind:?} for unknown {session_id} on {core_id}");
                    return;
                };
                if kind.is_device() {
                    log::warn!("{session_id}: dropping device response {kind:?}");
                    return;
                }
                session.on_response(&core, kind, response);
            }
        }
    }
}
