// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Platform limits of an accelerator, as discovered by the hosting application.
//!
//! Nothing in this module talks to the hardware: the limits are handed to each
//! [`crate::device::Core`] at creation time and read when sessions are opened and their
//! resources loaded.

use crate::Fourcc;
use crate::Port;
use crate::Resolution;
use crate::SessionType;
use crate::MAX_NUM_CAPTURE_BUFFERS;
use crate::MAX_NUM_OUTPUT_BUFFERS;
use crate::MAX_SUPPORTED_INSTANCES;
use crate::MIN_NUM_CAPTURE_BUFFERS;
use crate::MIN_NUM_OUTPUT_BUFFERS;
use crate::MIN_NUM_OUTPUT_BUFFERS_VP9;
use crate::MIN_SUPPORTED_HEIGHT;
use crate::MIN_SUPPORTED_WIDTH;

/// Number of 16x16 macroblocks needed to cover a `width`x`height` frame.
pub fn num_mbs_per_frame(width: u32, height: u32) -> u64 {
    (width.div_ceil(16) as u64) * (height.div_ceil(16) as u64)
}

/// Macroblock throughput of a `width`x`height` stream at `fps` frames per second.
pub fn num_mbs_per_sec(width: u32, height: u32, fps: u32) -> u64 {
    num_mbs_per_frame(width, height) * fps as u64
}

/// Per-codec processing cost, in cycles per macroblock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecData {
    pub fourcc: Fourcc,
    pub session_type: SessionType,
    pub vpp_cycles: u64,
    pub vsp_cycles: u64,
    pub low_power_cycles: u64,
}

impl CodecData {
    /// Cycles needed per macroblock: those of the slower of the pixel and stream processors, or
    /// those of the low-power pipeline.
    pub fn cycles_per_mb(&self, low_power: bool) -> u64 {
        if low_power {
            self.low_power_cycles
        } else {
            self.vpp_cycles.max(self.vsp_cycles)
        }
    }
}

/// Inclusive range of buffers a port may hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferCountLimits {
    pub min: u32,
    pub max: u32,
}

impl BufferCountLimits {
    pub fn contains(&self, count: u32) -> bool {
        (self.min..=self.max).contains(&count)
    }
}

#[derive(Clone, Debug)]
pub struct PlatformLimits {
    pub max_sessions: usize,
    pub min_resolution: Resolution,
    pub max_resolution: Resolution,
    /// Maximum aggregate macroblocks per second across all sessions of a core.
    pub max_load: u64,
    pub output_buffers: BufferCountLimits,
    pub capture_buffers: BufferCountLimits,
    /// Floor applied to the bitstream port of VP9 decoders.
    pub vp9_output_buffers_min: u32,
    /// Supported clock rates in Hz, sorted in ascending order.
    pub freq_table: Vec<u64>,
    pub codec_data: Vec<CodecData>,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        let codec = |fourcc: &[u8; 4], session_type, vpp_cycles| CodecData {
            fourcc: Fourcc::from(fourcc),
            session_type,
            vpp_cycles,
            vsp_cycles: 25,
            low_power_cycles: vpp_cycles * 3 / 4,
        };

        Self {
            max_sessions: MAX_SUPPORTED_INSTANCES,
            min_resolution: Resolution {
                width: MIN_SUPPORTED_WIDTH,
                height: MIN_SUPPORTED_HEIGHT,
            },
            max_resolution: Resolution {
                width: 4096,
                height: 2304,
            },
            // 4096x2176 at 60 fps.
            max_load: num_mbs_per_sec(4096, 2176, 60),
            output_buffers: BufferCountLimits {
                min: MIN_NUM_OUTPUT_BUFFERS,
                max: MAX_NUM_OUTPUT_BUFFERS,
            },
            capture_buffers: BufferCountLimits {
                min: MIN_NUM_CAPTURE_BUFFERS,
                max: MAX_NUM_CAPTURE_BUFFERS,
            },
            vp9_output_buffers_min: MIN_NUM_OUTPUT_BUFFERS_VP9,
            freq_table: vec![
                100_000_000,
                200_000_000,
                330_000_000,
                404_000_000,
                444_000_000,
                533_000_000,
            ],
            codec_data: vec![
                codec(b"H264", SessionType::Encoder, 675),
                codec(b"HEVC", SessionType::Encoder, 675),
                codec(b"VP80", SessionType::Encoder, 675),
                codec(b"H264", SessionType::Decoder, 200),
                codec(b"HEVC", SessionType::Decoder, 200),
                codec(b"VP80", SessionType::Decoder, 200),
                codec(b"VP90", SessionType::Decoder, 200),
            ],
        }
    }
}

impl PlatformLimits {
    /// Buffer count limits of `port` for a session of `session_type` using `codec`.
    pub fn buffer_limits(
        &self,
        session_type: SessionType,
        codec: Fourcc,
        port: Port,
    ) -> BufferCountLimits {
        match port {
            Port::Output => {
                let mut limits = self.output_buffers;
                if session_type == SessionType::Decoder && codec == Fourcc::from(b"VP90") {
                    limits.min = limits.min.max(self.vp9_output_buffers_min);
                }
                limits
            }
            Port::Capture => self.capture_buffers,
        }
    }

    /// Returns `true` if `res` is within the supported range.
    pub fn supports_resolution(&self, res: Resolution) -> bool {
        res.can_contain(self.min_resolution) && self.max_resolution.can_contain(res)
    }

    pub fn codec_data(&self, session_type: SessionType, codec: Fourcc) -> Option<&CodecData> {
        self.codec_data
            .iter()
            .find(|data| data.session_type == session_type && data.fourcc == codec)
    }

    pub fn max_freq(&self) -> u64 {
        self.freq_table.last().copied().unwrap_or(0)
    }

    /// Lowest supported clock rate that is at least `freq`, or the highest one if none is.
    pub fn freq_at_least(&self, freq: u64) -> u64 {
        self.freq_table
            .iter()
            .copied()
            .find(|f| *f >= freq)
            .unwrap_or_else(|| self.max_freq())
    }

    /// Next supported clock rate above `freq`, if any.
    pub fn freq_above(&self, freq: u64) -> Option<u64> {
        self.freq_table.iter().copied().find(|f| *f > freq)
    }

    /// Next supported clock rate below `freq`, if any.
    pub fn freq_below(&self, freq: u64) -> Option<u64> {
        self.freq_table.iter().rev().copied().find(|f| *f < freq)
    }
}
