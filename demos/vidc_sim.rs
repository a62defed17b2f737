// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs sessions against the loopback firmware and reports how their buffers and clocks behaved.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;

use cros_vidc::buffer::Owner;
use cros_vidc::buffer::ReturnStatus;
use cros_vidc::buffer::TrackingAllocator;
use cros_vidc::device::Core;
use cros_vidc::device::CoreConfig;
use cros_vidc::event::Event;
use cros_vidc::event::EventSink;
use cros_vidc::firmware::loopback::LoopbackFirmware;
use cros_vidc::firmware::CoreId;
use cros_vidc::firmware::FlushMode;
use cros_vidc::firmware::ResponseSink;
use cros_vidc::registry::Registry;
use cros_vidc::session::FrameProperties;
use cros_vidc::session::Session;
use cros_vidc::session::SessionConfig;
use cros_vidc::session::SessionState;
use cros_vidc::Fourcc;
use cros_vidc::Port;
use cros_vidc::Rect;
use cros_vidc::Resolution;
use cros_vidc::SessionFlags;
use cros_vidc::SessionType;

/// Simulated accelerator sessions
#[derive(Debug, FromArgs)]
struct Args {
    /// session type: encoder or decoder
    #[argh(option, default = "SessionType::Decoder")]
    session_type: SessionType,

    /// codec fourcc, e.g. H264 or VP90
    #[argh(option, default = "Fourcc::from(b\"H264\")")]
    codec: Fourcc,

    /// frame width
    #[argh(option, default = "1920")]
    width: u32,

    /// frame height
    #[argh(option, default = "1088")]
    height: u32,

    /// frames per second
    #[argh(option, default = "30")]
    framerate: u32,

    /// number of frames to push through each session
    #[argh(option, default = "64")]
    count: usize,

    /// number of concurrent sessions
    #[argh(option, default = "1")]
    sessions: usize,

    /// number of buffers on each port
    #[argh(option, default = "8")]
    buffers: u32,

    /// command timeout in milliseconds
    #[argh(option, default = "3000")]
    timeout_ms: u64,

    /// let the firmware hold buffers until they are released in batches
    #[argh(switch)]
    hold: bool,

    /// run the sessions in turbo mode
    #[argh(switch)]
    turbo: bool,

    /// flush the input port halfway through
    #[argh(switch)]
    flush: bool,
}

/// Logs every event at a level matching its severity.
struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: Event) {
        match event {
            Event::Fault { .. } | Event::SubsystemRestart { .. } => log::error!("{event:?}"),
            Event::StateChanged { .. } => log::debug!("{event:?}"),
            _ => log::info!("{event:?}"),
        }
    }
}

fn run_session(session: &Session, firmware: &LoopbackFirmware, args: &Args) -> anyhow::Result<()> {
    let resolution = Resolution::from((args.width, args.height));
    session.set_properties(FrameProperties {
        resolution,
        crop: Rect {
            left: 0,
            top: 0,
            width: args.width,
            height: args.height,
        },
        fps: args.framerate,
        bitrate: 0,
    })?;
    session.try_state(SessionState::StartDone)?;

    let frame_size = resolution.get_area() * 3 / 2;
    let inputs = session.request_buffers(Port::Output, args.buffers, frame_size)?;
    let outputs = session.request_buffers(Port::Capture, args.buffers, frame_size)?;

    for frame in 0..args.count {
        let slot = frame % args.buffers as usize;
        for id in [inputs[slot], outputs[slot]] {
            // Buffers come back to the client when the firmware is done with them.
            if session.buffer(id).map(|b| b.owner) == Some(Owner::Client) {
                session.reclaim_from_client(id)?;
            }
            if session.buffer(id).map(|b| b.owner) == Some(Owner::Driver) {
                session.submit_buffer(id)?;
            }
        }

        if args.hold && slot + 1 == args.buffers as usize {
            firmware.release_held(ReturnStatus::Completed)?;
            firmware.barrier(Duration::from_millis(args.timeout_ms))?;
        }
        if args.flush && frame == args.count / 2 {
            session.flush(FlushMode::Input)?;
        }
    }

    session.queue_eos()?;
    firmware.release_held(ReturnStatus::Completed)?;
    firmware.barrier(Duration::from_millis(args.timeout_ms))?;

    let clock = session.clock();
    let count = session.buf_count();
    println!(
        "{}: etb={} ebd={} ftb={} fbd={} load={}% clock={} Hz",
        session.id(),
        count.etb,
        count.ebd,
        count.ftb,
        count.fbd,
        clock.load,
        clock.curr_freq
    );

    session.close()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let firmware = Arc::new(LoopbackFirmware::new(!args.hold)?);
    let registry = Arc::new(Registry::default());
    let sink: Arc<dyn ResponseSink> = registry.clone();
    firmware.attach(Arc::downgrade(&sink));

    let core = Core::new(
        CoreId(0),
        firmware.clone(),
        Arc::new(TrackingAllocator::default()),
        Arc::new(LogSink),
        Default::default(),
        CoreConfig {
            timeout: Duration::from_millis(args.timeout_ms),
            ..Default::default()
        },
    )?;
    registry.register_core(core)?;
    registry
        .init_core(CoreId(0))
        .context("failed to initialize the core")?;

    let mut flags = SessionFlags::empty();
    if args.turbo {
        flags.insert(SessionFlags::TURBO);
    }
    let config = SessionConfig {
        session_type: args.session_type,
        codec: args.codec,
        flags,
        ..Default::default()
    };

    let sessions = (0..args.sessions)
        .map(|_| registry.create_session(CoreId(0), config.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let (firmware_ref, args_ref) = (firmware.as_ref(), &args);
    let results = thread::scope(|s| {
        let workers = sessions
            .iter()
            .map(|session| s.spawn(move || run_session(session, firmware_ref, args_ref)))
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .map(|worker| match worker.join() {
                Ok(res) => res,
                Err(_) => Err(anyhow::anyhow!("session thread panicked")),
            })
            .collect::<Vec<_>>()
    });

    let mut failed = 0;
    for (session, res) in sessions.iter().zip(results) {
        if let Err(e) = res {
            log::error!("{} failed in state {:?}: {e:#}", session.id(), session.state());
            failed += 1;
        }
        registry.unregister_session(session.id())?;
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} sessions failed", sessions.len());
    }
    Ok(())
}
