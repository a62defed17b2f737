// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dynamic clock and voltage scaling.
//!
//! The controller does not run on its own thread. The session reports every buffer submission and
//! return to [`DcvsController::on_buffer_event`], and every `window` events the controller
//! estimates the load from the number of buffers the firmware is still holding. High load moves
//! the clock one step up the platform frequency table, low load moves it one step down once it has
//! been observed twice in a row.

use crate::platform::PlatformLimits;
use crate::SessionFlags;
use crate::DCVS_FTB_WINDOW;

/// Operating rate meaning "as fast as possible", in frames per second.
pub const OPERATING_RATE_MAX: u32 = (i32::MAX as u32) >> 16;

/// Number of consecutive low-load decisions needed before lowering the clock.
const LOW_LOAD_HYSTERESIS: u32 = 2;

/// Firmware pipelining mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WorkMode {
    /// Single stage pipeline, lowest latency.
    Mode1,
    /// Two stage pipeline, highest throughput.
    #[default]
    Mode2,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LoadClass {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcvsConfig {
    /// Number of buffer events between two decisions.
    pub window: u32,
    /// Load, in percent of the window, below which the session is considered idle.
    pub low_threshold: u32,
    /// Load, in percent of the window, above which the session is considered busy.
    pub high_threshold: u32,
    pub enabled: bool,
}

impl Default for DcvsConfig {
    fn default() -> Self {
        Self {
            window: DCVS_FTB_WINDOW,
            low_threshold: 25,
            high_threshold: 75,
            enabled: true,
        }
    }
}

/// Clock state of a session. Only mutated under the session's resource lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClockData {
    /// Buffer events since the session loaded its resources.
    pub buffer_counter: u32,
    /// Last load estimate, in percent of the window.
    pub load: u32,
    pub load_class: LoadClass,
    pub load_low: u32,
    pub load_high: u32,
    pub min_freq: u64,
    pub curr_freq: u64,
    pub operating_rate: u32,
    pub work_mode: WorkMode,
    pub low_latency_mode: bool,
    pub turbo_mode: bool,
    pub dcvs_mode: bool,
    consecutive_low: u32,
}

/// Clock change requested by the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScalingProposal {
    pub freq: u64,
    pub work_mode: WorkMode,
}

impl ClockData {
    pub fn new(config: &DcvsConfig, flags: SessionFlags) -> Self {
        let low_latency_mode = flags.contains(SessionFlags::REALTIME);
        Self {
            load_low: config.low_threshold,
            load_high: config.high_threshold,
            work_mode: if low_latency_mode {
                WorkMode::Mode1
            } else {
                WorkMode::Mode2
            },
            low_latency_mode,
            turbo_mode: flags.contains(SessionFlags::TURBO),
            dcvs_mode: config.enabled && !flags.contains(SessionFlags::THUMBNAIL),
            ..Default::default()
        }
    }

    /// Turbo and maximum operating rate pin the clock to the highest frequency.
    pub fn is_pinned(&self) -> bool {
        self.turbo_mode || self.operating_rate == OPERATING_RATE_MAX
    }

    /// Computes the initial clock from the macroblock throughput of the session and the number of
    /// cycles the codec needs per macroblock.
    pub fn init_frequencies(
        &mut self,
        limits: &PlatformLimits,
        mbs_per_sec: u64,
        cycles_per_mb: u64,
    ) -> ScalingProposal {
        let required = mbs_per_sec.saturating_mul(cycles_per_mb);
        self.min_freq = limits.freq_at_least(required);
        self.curr_freq = if self.is_pinned() {
            limits.max_freq()
        } else {
            self.min_freq
        };
        self.buffer_counter = 0;
        self.consecutive_low = 0;

        log::debug!(
            "Clock init required={required} min_freq={} curr_freq={}",
            self.min_freq,
            self.curr_freq
        );

        self.proposal()
    }

    pub fn set_turbo(&mut self, turbo: bool, limits: &PlatformLimits) -> Option<ScalingProposal> {
        self.turbo_mode = turbo;
        self.apply_pin(limits)
    }

    pub fn set_operating_rate(
        &mut self,
        rate: u32,
        limits: &PlatformLimits,
    ) -> Option<ScalingProposal> {
        self.operating_rate = rate;
        self.apply_pin(limits)
    }

    fn apply_pin(&mut self, limits: &PlatformLimits) -> Option<ScalingProposal> {
        let target = if self.is_pinned() {
            limits.max_freq()
        } else {
            self.curr_freq.max(self.min_freq)
        };

        if target == self.curr_freq {
            return None;
        }
        self.curr_freq = target;
        Some(self.proposal())
    }

    fn proposal(&self) -> ScalingProposal {
        ScalingProposal {
            freq: self.curr_freq,
            work_mode: self.work_mode,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DcvsController {
    window: u32,
}

impl DcvsController {
    pub fn new(config: &DcvsConfig) -> Self {
        Self {
            window: config.window.max(1),
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Records one buffer submission or return. `outstanding` is the number of buffers held by the
    /// firmware after the event. Returns a clock change to request, if the decision made at the end
    /// of a window calls for one.
    pub fn on_buffer_event(
        &self,
        clk: &mut ClockData,
        outstanding: usize,
        limits: &PlatformLimits,
    ) -> Option<ScalingProposal> {
        clk.buffer_counter = clk.buffer_counter.wrapping_add(1);
        if clk.buffer_counter % self.window != 0 {
            return None;
        }

        let class = self.classify(clk, outstanding);
        self.decide(clk, class, limits)
    }

    /// Estimates the load from the share of the window the firmware is holding on to.
    pub fn classify(&self, clk: &mut ClockData, outstanding: usize) -> LoadClass {
        let load = (outstanding as u64 * 100 / self.window as u64).min(u32::MAX as u64) as u32;

        clk.load = load;
        clk.load_class = if load > clk.load_high {
            LoadClass::High
        } else if load < clk.load_low {
            LoadClass::Low
        } else {
            LoadClass::Normal
        };
        clk.load_class
    }

    /// Applies the decision for `class` to `clk`.
    pub fn decide(
        &self,
        clk: &mut ClockData,
        class: LoadClass,
        limits: &PlatformLimits,
    ) -> Option<ScalingProposal> {
        if clk.is_pinned() || !clk.dcvs_mode {
            clk.consecutive_low = 0;
            return None;
        }

        let next = match class {
            LoadClass::High => {
                clk.consecutive_low = 0;
                limits.freq_above(clk.curr_freq)
            }
            LoadClass::Normal => {
                clk.consecutive_low = 0;
                None
            }
            LoadClass::Low => {
                clk.consecutive_low += 1;
                if clk.consecutive_low < LOW_LOAD_HYSTERESIS {
                    None
                } else {
                    clk.consecutive_low = 0;
                    limits
                        .freq_below(clk.curr_freq)
                        .filter(|freq| *freq >= clk.min_freq)
                }
            }
        }?;

        log::debug!(
            "DCVS load={}% class={class:?} freq {} -> {next}",
            clk.load,
            clk.curr_freq
        );
        clk.curr_freq = next;
        Some(clk.proposal())
    }
}
