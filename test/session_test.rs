// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use cros_vidc::buffer::Owner;
    use cros_vidc::buffer::ReturnStatus;
    use cros_vidc::buffer::TrackingAllocator;
    use cros_vidc::dcvs::WorkMode;
    use cros_vidc::device::Core;
    use cros_vidc::device::CoreConfig;
    use cros_vidc::device::CoreError;
    use cros_vidc::device::FaultKind;
    use cros_vidc::event::Event;
    use cros_vidc::event::EventLog;
    use cros_vidc::firmware::loopback::LoopbackFirmware;
    use cros_vidc::firmware::Command;
    use cros_vidc::firmware::CoreId;
    use cros_vidc::firmware::Response;
    use cros_vidc::firmware::ResponseKind;
    use cros_vidc::firmware::ResponseSink;
    use cros_vidc::firmware::Scope;
    use cros_vidc::registry::Registry;
    use cros_vidc::registry::RegistryError;
    use cros_vidc::registry::Teardown;
    use cros_vidc::session::Session;
    use cros_vidc::session::SessionError;
    use cros_vidc::session::SessionState;
    use cros_vidc::Port;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const CORE: CoreId = CoreId(0);

    struct Setup {
        firmware: Arc<LoopbackFirmware>,
        events: Arc<EventLog>,
        registry: Arc<Registry>,
        core: Arc<Core>,
    }

    fn setup(config: CoreConfig) -> Setup {
        let _ = env_logger::builder().is_test(true).try_init();

        let firmware = Arc::new(LoopbackFirmware::new(false).unwrap());
        let events = Arc::new(EventLog::default());
        let registry = Arc::new(Registry::default());
        let sink: Arc<dyn ResponseSink> = registry.clone();
        firmware.attach(Arc::downgrade(&sink));

        let core = Core::new(
            CORE,
            firmware.clone(),
            Arc::new(TrackingAllocator::default()),
            events.clone(),
            Default::default(),
            config,
        )
        .unwrap();
        let core = registry.register_core(core).unwrap();
        registry.init_core(CORE).unwrap();

        Setup {
            firmware,
            events,
            registry,
            core,
        }
    }

    impl Setup {
        fn session(&self) -> Arc<Session> {
            self.registry
                .create_session(CORE, Default::default())
                .unwrap()
        }

        fn sync(&self) {
            self.firmware.barrier(TIMEOUT).unwrap();
        }

        /// Waits until the firmware has received `command`.
        fn wait_for(&self, command: &Command) -> bool {
            for _ in 0..100 {
                self.sync();
                if self.commands().contains(command) {
                    return true;
                }
                thread::sleep(Duration::from_millis(10));
            }
            false
        }

        fn commands(&self) -> Vec<Command> {
            self.firmware
                .history()
                .into_iter()
                .map(|(_, command)| command)
                .collect()
        }
    }

    #[test]
    fn full_lifecycle_with_clock_scaling() {
        let s = setup(Default::default());
        let session = s.session();

        session.try_state(SessionState::StartDone).unwrap();
        assert_eq!(session.state(), SessionState::StartDone);
        let initial = session.clock().curr_freq;
        assert_eq!(initial, s.core.platform().freq_table[0]);

        let ids = session.request_buffers(Port::Capture, 20, 1 << 16).unwrap();
        for id in &ids {
            session.submit_buffer(*id).unwrap();
        }
        s.sync();
        assert_eq!(s.firmware.held_count(), 20);

        // The firmware held on to a full window of buffers: the clock goes one step up.
        let raised = s.core.platform().freq_above(initial).unwrap();
        assert_eq!(session.clock().curr_freq, raised);
        assert_eq!(s.core.curr_freq(), raised);
        assert!(s.events.events().contains(&Event::ClockScaled {
            session: session.id(),
            freq: raised,
            work_mode: WorkMode::Mode2,
        }));
        assert!(s.commands().contains(&Command::ScaleClocks {
            freq: raised,
            work_mode: WorkMode::Mode2
        }));

        s.firmware.release_held(ReturnStatus::Completed).unwrap();
        s.sync();
        assert_eq!(session.count(Owner::Client), 20);
        assert_eq!(session.buf_count().fbd, 20);

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::CloseDone);
        assert_eq!(session.count(Owner::Driver), 0);
        assert_eq!(session.count(Owner::Firmware), 0);
        assert!(session.check_conservation());
        assert_eq!(s.core.load(None), 0);

        assert_eq!(
            s.registry.unregister_session(session.id()).unwrap(),
            Teardown::Orderly
        );
        assert_eq!(session.state(), SessionState::CoreUninit);
        assert_eq!(s.registry.session_count(), 0);
    }

    #[test]
    fn load_timeout_invalidates_session_only() {
        let s = setup(CoreConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let session = s.session();
        s.firmware.silence(ResponseKind::SessionLoadResourceDone);

        session.open().unwrap();
        assert!(matches!(
            session.load_resources(),
            Err(SessionError::Timeout(ResponseKind::SessionLoadResourceDone))
        ));
        assert_eq!(session.state(), SessionState::Invalid);
        assert!(!s.core.is_faulted());

        s.sync();
        let sent = s.firmware.history().len();
        assert!(matches!(session.start(), Err(SessionError::Invalid)));
        session.close().unwrap();
        s.sync();
        assert_eq!(s.firmware.history().len(), sent);

        // Other sessions on the core are not affected.
        s.firmware.unsilence(ResponseKind::SessionLoadResourceDone);
        let other = s.session();
        other.try_state(SessionState::StartDone).unwrap();
    }

    #[test]
    fn watchdog_faults_core_and_sessions() {
        let s = setup(Default::default());
        let session = s.session();
        session.open().unwrap();
        s.firmware.silence(ResponseKind::SessionLoadResourceDone);

        let loader = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.load_resources())
        };
        while session.state() != SessionState::LoadResources {
            thread::yield_now();
        }
        s.firmware
            .inject(
                Scope::Device(CORE),
                ResponseKind::SysWatchdogTimeout,
                Response::ok(),
            )
            .unwrap();

        assert!(matches!(loader.join().unwrap(), Err(SessionError::DeviceFault)));
        assert_eq!(session.state(), SessionState::Invalid);
        assert_eq!(s.core.fault(), Some(FaultKind::WatchdogTimeout));
        assert!(s.wait_for(&Command::TriggerSubsystemRestart(FaultKind::WatchdogTimeout)));

        assert!(matches!(
            s.registry.create_session(CORE, Default::default()),
            Err(RegistryError::Core(CoreError::Faulted))
        ));
        assert!(matches!(
            session.try_state(SessionState::StartDone),
            Err(SessionError::Invalid)
        ));
    }

    #[test]
    fn close_from_start_done_walks_teardown() {
        let s = setup(Default::default());
        let session = s.session();
        session.try_state(SessionState::StartDone).unwrap();
        let ids = session.request_buffers(Port::Output, 4, 4096).unwrap();
        session.submit_buffer(ids[0]).unwrap();
        session.submit_buffer(ids[1]).unwrap();
        s.sync();
        s.events.take();

        session.close().unwrap();
        assert_eq!(
            s.events.transitions(session.id()),
            vec![
                (SessionState::StartDone, SessionState::Stop),
                (SessionState::Stop, SessionState::StopDone),
                (SessionState::StopDone, SessionState::ReleaseResources),
                (
                    SessionState::ReleaseResources,
                    SessionState::ReleaseResourcesDone
                ),
                (SessionState::ReleaseResourcesDone, SessionState::Close),
                (SessionState::Close, SessionState::CloseDone),
            ]
        );

        // Held buffers came back with the stop, idle ones at close.
        assert_eq!(session.count(Owner::Client), 4);
        assert_eq!(s.firmware.held_count(), 0);
    }

    #[test]
    fn unregistering_open_session_forces_teardown() {
        let s = setup(Default::default());
        let session = s.session();
        session.try_state(SessionState::StartDone).unwrap();
        let id = session.request_buffers(Port::Output, 1, 4096).unwrap()[0];
        session.submit_buffer(id).unwrap();
        s.sync();

        assert_eq!(
            s.registry.unregister_session(session.id()).unwrap(),
            Teardown::Forced
        );
        assert_eq!(session.state(), SessionState::Invalid);
        assert_eq!(session.count(Owner::Firmware), 0);
        assert_eq!(session.buffer(id).unwrap().owner, Owner::Client);
        assert!(s.registry.find_session(session.id()).is_none());
    }
}
