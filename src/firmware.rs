// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Messages exchanged with the accelerator firmware.
//!
//! The firmware protocol is asynchronous: commands are sent through a [`FirmwareChannel`] and
//! never return a result synchronously. Each command that expects an acknowledgment gets it later
//! as a response of a given [`ResponseKind`], which the transport delivers to a [`ResponseSink`].
//! The byte layout of these messages is owned by the transport and not modelled here.

#[cfg(test)]
pub(crate) mod dummy;
pub mod loopback;

use std::fmt;

use enumn::N;
use thiserror::Error;

use crate::buffer::BufferId;
use crate::buffer::BufferKind;
use crate::buffer::ReturnStatus;
use crate::dcvs::WorkMode;
use crate::device::FaultKind;
use crate::Fourcc;
use crate::Port;
use crate::Resolution;
use crate::SessionType;

/// Identifier of an accelerator core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub u32);

/// Identifier of a session, unique within the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u32);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session{}", self.0)
    }
}

/// Target of a command or origin of a response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Device(CoreId),
    Session(CoreId, SessionId),
}

impl Scope {
    pub fn core(&self) -> CoreId {
        match self {
            Scope::Device(core) | Scope::Session(core, _) => *core,
        }
    }
}

/// Which queues a flush applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushMode {
    Input,
    Output,
    All,
}

impl FlushMode {
    pub fn covers(&self, port: Port) -> bool {
        matches!(
            (self, port),
            (FlushMode::All, _) | (FlushMode::Input, Port::Output) | (FlushMode::Output, Port::Capture)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SysInit,
    SysPing,
    TriggerSubsystemRestart(FaultKind),
    SessionInit {
        session_type: SessionType,
        codec: Fourcc,
        secure: bool,
    },
    LoadResources,
    Start,
    Stop,
    Flush(FlushMode),
    ReleaseResources,
    SessionEnd,
    /// Hands driver-allocated internal buffers to the firmware.
    SetBuffers {
        kind: BufferKind,
        buffers: Vec<BufferId>,
    },
    EmptyThisBuffer {
        buffer: BufferId,
        index: u32,
        eos: bool,
    },
    FillThisBuffer {
        buffer: BufferId,
        index: u32,
    },
    ScaleClocks {
        freq: u64,
        work_mode: WorkMode,
    },
}

impl Command {
    /// The response the firmware sends to acknowledge this command, if any.
    pub fn expected_response(&self) -> Option<ResponseKind> {
        match self {
            Command::SysInit => Some(ResponseKind::SysInitDone),
            Command::SysPing => Some(ResponseKind::SysPingAck),
            Command::SessionInit { .. } => Some(ResponseKind::SessionInitDone),
            Command::LoadResources => Some(ResponseKind::SessionLoadResourceDone),
            Command::Start => Some(ResponseKind::SessionStartDone),
            Command::Stop => Some(ResponseKind::SessionStopDone),
            Command::Flush(_) => Some(ResponseKind::SessionFlushDone),
            Command::ReleaseResources => Some(ResponseKind::SessionReleaseResourceDone),
            Command::SessionEnd => Some(ResponseKind::SessionEndDone),
            Command::EmptyThisBuffer { .. } => Some(ResponseKind::SessionEtbDone),
            Command::FillThisBuffer { .. } => Some(ResponseKind::SessionFtbDone),
            Command::TriggerSubsystemRestart(_)
            | Command::SetBuffers { .. }
            | Command::ScaleClocks { .. } => None,
        }
    }
}

/// Kind of a firmware response. The discriminants are the raw message identifiers used by the
/// transport.
#[repr(u32)]
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResponseKind {
    SysInitDone = 0x1,
    SysPingAck = 0x2,
    SysWatchdogTimeout = 0x3,
    SysError = 0x4,
    SessionEventChange = 0x100,
    SessionInitDone = 0x101,
    SessionLoadResourceDone = 0x102,
    SessionStartDone = 0x103,
    SessionStopDone = 0x104,
    SessionFlushDone = 0x105,
    SessionReleaseResourceDone = 0x106,
    SessionEndDone = 0x107,
    SessionEtbDone = 0x108,
    SessionFtbDone = 0x109,
    SessionReleaseBufferReference = 0x10a,
    SessionError = 0x10b,
}

impl ResponseKind {
    /// Device-scope kinds that a command waits for.
    pub const DEVICE_COMPLETIONS: [ResponseKind; 2] =
        [ResponseKind::SysInitDone, ResponseKind::SysPingAck];

    /// Session-scope kinds that a command waits for.
    pub const SESSION_COMPLETIONS: [ResponseKind; 7] = [
        ResponseKind::SessionInitDone,
        ResponseKind::SessionLoadResourceDone,
        ResponseKind::SessionStartDone,
        ResponseKind::SessionStopDone,
        ResponseKind::SessionFlushDone,
        ResponseKind::SessionReleaseResourceDone,
        ResponseKind::SessionEndDone,
    ];

    pub fn is_device(&self) -> bool {
        (*self as u32) < ResponseKind::SessionEventChange as u32
    }
}

/// Status carried by a response.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FirmwareStatus {
    #[default]
    Ok,
    Error(u32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ResponseData {
    #[default]
    None,
    BufferDone {
        buffer: BufferId,
        status: ReturnStatus,
    },
    BufferReference {
        buffer: BufferId,
    },
    EventChange {
        resolution: Resolution,
        sufficient: bool,
    },
}

/// Payload delivered with a response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub status: FirmwareStatus,
    pub data: ResponseData,
}

impl Response {
    pub fn ok() -> Self {
        Default::default()
    }

    pub fn error(code: u32) -> Self {
        Self {
            status: FirmwareStatus::Error(code),
            data: ResponseData::None,
        }
    }

    pub fn buffer_done(buffer: BufferId, status: ReturnStatus) -> Self {
        Self {
            status: FirmwareStatus::Ok,
            data: ResponseData::BufferDone { buffer, status },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == FirmwareStatus::Ok
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("firmware channel is closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outbound path to the firmware.
///
/// Sending is asynchronous: `Ok` only means that the command has been handed to the transport.
/// Callers make sure that at most one command of a given kind is outstanding per scope.
pub trait FirmwareChannel: Send + Sync {
    fn send(&self, scope: Scope, command: Command) -> Result<(), SendError>;
}

/// Inbound path from the firmware. Implemented by [`crate::registry::Registry`].
pub trait ResponseSink: Send + Sync {
    fn on_response(&self, scope: Scope, kind: ResponseKind, response: Response);

    /// Decodes a raw message identifier before routing the response. Unknown identifiers are
    /// logged and dropped.
    fn on_raw_response(&self, scope: Scope, raw_kind: u32, response: Response) {
        match ResponseKind::n(raw_kind) {
            Some(kind) => self.on_response(scope, kind, response),
            None => log::warn!("Dropping response with unknown kind=0x{raw_kind:x} for {scope:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_kinds_decode() {
        assert_eq!(ResponseKind::n(0x1), Some(ResponseKind::SysInitDone));
        assert_eq!(ResponseKind::n(0x104), Some(ResponseKind::SessionStopDone));
        assert_eq!(ResponseKind::n(0x5), None);
        assert_eq!(ResponseKind::n(0xffff), None);
    }

    #[test]
    fn completion_kinds_are_scoped() {
        assert!(ResponseKind::DEVICE_COMPLETIONS.iter().all(ResponseKind::is_device));
        assert!(!ResponseKind::SESSION_COMPLETIONS.iter().any(ResponseKind::is_device));
    }

    #[test]
    fn every_awaited_command_has_a_scoped_completion() {
        let session_commands = [
            Command::LoadResources,
            Command::Start,
            Command::Stop,
            Command::Flush(FlushMode::All),
            Command::ReleaseResources,
            Command::SessionEnd,
        ];
        for command in session_commands {
            let kind = command.expected_response().unwrap();
            assert!(ResponseKind::SESSION_COMPLETIONS.contains(&kind), "{command:?}");
        }

        for command in [Command::SysInit, Command::SysPing] {
            let kind = command.expected_response().unwrap();
            assert!(ResponseKind::DEVICE_COMPLETIONS.contains(&kind), "{command:?}");
        }
    }

    #[test]
    fn flush_mode_ports() {
        assert!(FlushMode::Input.covers(Port::Output));
        assert!(!FlushMode::Input.covers(Port::Capture));
        assert!(FlushMode::Output.covers(Port::Capture));
        assert!(FlushMode::All.covers(Port::Output) && FlushMode::All.covers(Port::Capture));
    }
}
