#![no_main]

use std::sync::Arc;
use std::time::Duration;

use cros_vidc::buffer::BufferId;
use cros_vidc::buffer::ReturnStatus;
use cros_vidc::buffer::TrackingAllocator;
use cros_vidc::device::Core;
use cros_vidc::device::CoreConfig;
use cros_vidc::event::NullEventSink;
use cros_vidc::firmware::loopback::LoopbackFirmware;
use cros_vidc::firmware::CoreId;
use cros_vidc::firmware::FirmwareStatus;
use cros_vidc::firmware::Response;
use cros_vidc::firmware::ResponseData;
use cros_vidc::firmware::ResponseSink;
use cros_vidc::firmware::Scope;
use cros_vidc::registry::Registry;
use cros_vidc::session::SessionState;
use cros_vidc::Port;
use cros_vidc::Resolution;
use libfuzzer_sys::fuzz_target;

// Each 6-byte record either acts as the client or forges a firmware response.
fuzz_target!(|data: &[u8]| {
    let firmware = Arc::new(LoopbackFirmware::new(false).unwrap());
    let registry = Arc::new(Registry::default());
    let sink: Arc<dyn ResponseSink> = registry.clone();
    firmware.attach(Arc::downgrade(&sink));

    let core = Core::new(
        CoreId(0),
        firmware.clone(),
        Arc::new(TrackingAllocator::default()),
        Arc::new(NullEventSink),
        Default::default(),
        CoreConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .unwrap();
    registry.register_core(core).unwrap();
    registry.init_core(CoreId(0)).unwrap();

    let session = registry.create_session(CoreId(0), Default::default()).unwrap();
    if session.try_state(SessionState::StartDone).is_err() {
        return;
    }
    let mut ids = session.request_buffers(Port::Output, 4, 4096).unwrap();
    ids.extend(session.request_buffers(Port::Capture, 4, 4096).unwrap());
    let scope = Scope::Session(CoreId(0), session.id());

    for record in data.chunks_exact(6) {
        let id = ids[record[1] as usize % ids.len()];
        match record[0] % 5 {
            0 => {
                let _ = session.submit_buffer(id);
            }
            1 => {
                let _ = session.reclaim_from_client(id);
            }
            2 => {
                let status = if record[1] & 0x80 != 0 {
                    ReturnStatus::Recycled
                } else {
                    ReturnStatus::Completed
                };
                let _ = firmware.release_held(status);
            }
            _ => {
                let raw_kind = if record[2] & 0x80 != 0 {
                    0x100 | (record[2] as u32 & 0x0f)
                } else {
                    record[2] as u32 & 0x07
                };
                let status = match record[3] {
                    0 => FirmwareStatus::Ok,
                    code => FirmwareStatus::Error(code as u32),
                };
                let response_data = match record[4] % 4 {
                    0 => ResponseData::None,
                    1 => ResponseData::BufferDone {
                        buffer: BufferId(record[5] as u32),
                        status: ReturnStatus::Completed,
                    },
                    2 => ResponseData::BufferReference {
                        buffer: BufferId(record[5] as u32),
                    },
                    _ => ResponseData::EventChange {
                        resolution: Resolution::from((record[5] as u32 * 16, 1088)),
                        sufficient: record[5] & 1 != 0,
                    },
                };
                let target = if raw_kind < 0x100 {
                    Scope::Device(CoreId(0))
                } else {
                    scope
                };
                registry.on_raw_response(
                    target,
                    raw_kind,
                    Response {
                        status,
                        data: response_data,
                    },
                );
            }
        }
        assert!(session.check_conservation());
    }

    let _ = firmware.barrier(Duration::from_secs(1));
    let _ = session.close();
    assert!(session.check_conservation());
    let _ = registry.unregister_session(session.id());
});
