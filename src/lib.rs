// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side control of hardware video encode/decode sessions.
//!
//! This crate drives sessions on a media accelerator through its asynchronous command/response
//! firmware protocol. It is made of a few layers:
//!
//! * The [`registry::Registry`] is the process-wide collection of accelerator cores and their
//!   sessions, and the entry point for firmware responses.
//! * A [`device::Core`] is one accelerator instance, which must be initialized before sessions can
//!   be opened on it.
//! * A [`session::Session`] is one client's codec pipeline. It walks a strict lifecycle, tracks
//!   who owns each of its buffers, and scales the accelerator clock according to its load.
//!
//! The actual transport to the firmware, memory allocation and client notification are provided
//! by the hosting application through the [`firmware::FirmwareChannel`],
//! [`buffer::BufferAllocator`] and [`event::EventSink`] traits.

pub mod buffer;
pub mod completion;
pub mod dcvs;
pub mod device;
pub mod event;
pub mod firmware;
pub mod platform;
pub mod registry;
pub mod session;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default bound on how long a command waits for its completion.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1088;
pub const MIN_SUPPORTED_WIDTH: u32 = 32;
pub const MIN_SUPPORTED_HEIGHT: u32 = 32;
pub const DEFAULT_FPS: u32 = 15;
pub const MIN_NUM_OUTPUT_BUFFERS: u32 = 1;
pub const MIN_NUM_OUTPUT_BUFFERS_VP9: u32 = 6;
pub const MIN_NUM_CAPTURE_BUFFERS: u32 = 1;
/// Same as the V4L2 `VIDEO_MAX_FRAME` limit.
pub const MAX_NUM_OUTPUT_BUFFERS: u32 = 32;
pub const MAX_NUM_CAPTURE_BUFFERS: u32 = 32;
pub const MAX_SUPPORTED_INSTANCES: usize = 24;
/// Number of buffer events between two clock scaling decisions.
pub const DCVS_FTB_WINDOW: u32 = 16;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Crop rectangle within a frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Returns `true` if the rectangle lies entirely within a frame of size `res`.
    pub fn fits_in(&self, res: Resolution) -> bool {
        self.left.saturating_add(self.width) <= res.width
            && self.top.saturating_add(self.height) <= res.height
    }
}

/// A FOURCC code identifying a codec or pixel format.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(u32);

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        [
            n.0 as u8,
            (n.0 >> 8) as u8,
            (n.0 >> 16) as u8,
            (n.0 >> 24) as u8,
        ]
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c: [u8; 4] = (*self).into();
        f.write_fmt(format_args!(
            "{}{}{}{}",
            c[0] as char, c[1] as char, c[2] as char, c[3] as char
        ))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl FromStr for Fourcc {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| "a fourcc must be exactly 4 characters long")?;
        Ok(Fourcc::from(&bytes))
    }
}

/// Whether a session encodes or decodes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionType {
    Encoder,
    #[default]
    Decoder,
}

impl FromStr for SessionType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enc" | "encoder" => Ok(SessionType::Encoder),
            "dec" | "decoder" => Ok(SessionType::Decoder),
            _ => Err("unrecognized session type. Valid values: encoder, decoder"),
        }
    }
}

/// One of the two buffer queues of a session.
///
/// Naming follows V4L2: `Output` is the queue the client writes to (bitstream for a decoder, raw
/// frames for an encoder) and `Capture` the queue it reads from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Port {
    Output,
    Capture,
}

impl Port {
    pub const ALL: [Port; 2] = [Port::Output, Port::Capture];

    pub(crate) fn index(self) -> usize {
        match self {
            Port::Output => 0,
            Port::Capture => 1,
        }
    }
}

bitflags::bitflags! {
    /// Operating modes of a session.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SessionFlags: u32 {
        const SECURE = 1 << 0;
        const TURBO = 1 << 1;
        const THUMBNAIL = 1 << 2;
        const LOW_POWER = 1 << 3;
        const REALTIME = 1 << 4;
    }
}
