//! Session integration tests against the simulated ODrive
//!
//! Run with: `cargo test -p backend --test session_tests`

use backend::{BackendError, ProtocolSettings, Session, SessionState};
use common::test_utils::{DEFAULT_SERIAL_NUMBER, SimulatedOdrive};
use common::usb_types::{ODRIVE_PRODUCT_ID, ODRIVE_VENDOR_ID};
use common::{DeviceCandidate, DeviceKey};
use protocol::{EndpointValue, ResponseFrame, SCHEMA_ENDPOINT_ID, SEQUENCE_MODULUS, ValueType};

const VBUS_ONLY_SCHEMA: &str = r#"[{"name":"vbus_voltage","type":"float","access":"r","id":5}]"#;

fn candidate() -> DeviceCandidate {
    DeviceCandidate {
        key: DeviceKey::new(1, 4),
        vendor_id: ODRIVE_VENDOR_ID,
        product_id: ODRIVE_PRODUCT_ID,
        description: "ODrive".to_string(),
    }
}

fn load(device: &SimulatedOdrive, config: ProtocolSettings) -> Session {
    let session = Session::with_transport(candidate(), device.transport(), config);
    session.load().unwrap();
    session
}

#[test]
fn test_vbus_voltage_end_to_end() {
    let device = SimulatedOdrive::with_schema(VBUS_ONLY_SCHEMA);
    device.set_value("vbus_voltage", EndpointValue::new(24.25f32));

    // Whole text in the first chunk, empty chunk terminates
    let config = ProtocolSettings {
        schema_chunk_size: 512,
        ..ProtocolSettings::default()
    };
    let session = load(&device, config);

    let schema_reads: Vec<_> = device
        .requests()
        .into_iter()
        .filter(|f| f.endpoint_id == SCHEMA_ENDPOINT_ID)
        .collect();
    assert_eq!(schema_reads.len(), 2);
    assert_eq!(schema_reads[0].payload, 0u32.to_le_bytes().to_vec());
    assert_eq!(
        schema_reads[1].payload,
        (VBUS_ONLY_SCHEMA.len() as u32).to_le_bytes().to_vec()
    );

    let info = session.endpoint_info("vbus_voltage").unwrap();
    assert_eq!(info.id, 5);
    assert_eq!(info.value_type, Some(ValueType::Float));
    assert!(info.read_only);
    assert_eq!(session.schema().unwrap().len(), 1);

    device.clear_requests();
    assert_eq!(session.read::<f32>("vbus_voltage").unwrap(), 24.25);

    let requests = device.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].read);
    assert_eq!(requests[0].endpoint_id, 5);
    assert_eq!(requests[0].expected_len, 4);
}

#[test]
fn test_small_chunks_reassemble_schema() {
    let device = SimulatedOdrive::new();
    let config = ProtocolSettings {
        schema_chunk_size: 7,
        ..ProtocolSettings::default()
    };
    let session = load(&device, config);
    assert_eq!(session.serial_number(), Some(DEFAULT_SERIAL_NUMBER));
    assert_eq!(session.schema().unwrap().crc(), device.schema_crc());
}

#[test]
fn test_out_of_order_schema_chunks() {
    let device = SimulatedOdrive::new();
    device.inject_stale_responses(3);
    let session = load(&device, ProtocolSettings::default());
    assert!(session.is_ready());
    assert_eq!(session.schema().unwrap().crc(), device.schema_crc());
}

#[test]
fn test_zero_length_read_during_read() {
    let device = SimulatedOdrive::new();
    device.set_value("vbus_voltage", EndpointValue::new(12.0f32));
    let session = load(&device, ProtocolSettings::default());

    device.inject_zero_length_reads(1);
    let result = session.read::<f32>("vbus_voltage");
    assert!(matches!(result, Err(BackendError::TransportDisconnected)));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!device.is_open());
}

#[test]
fn test_read_only_write_sends_nothing() {
    let device = SimulatedOdrive::new();
    let session = load(&device, ProtocolSettings::default());
    device.clear_requests();

    let result = session.write("hw_version_major", 8u8);
    assert!(matches!(result, Err(BackendError::ReadOnly(_))));
    assert!(device.value_requests().is_empty());
    assert!(session.is_ready());
}

#[test]
fn test_sequence_wraps_and_rejects_aliased_response() {
    let device = SimulatedOdrive::new();
    device.set_value("axis0.current_state", EndpointValue::new(1u8));
    let session = load(&device, ProtocolSettings::default());
    device.clear_requests();

    let reads = usize::from(SEQUENCE_MODULUS) + 1;
    for _ in 0..reads {
        assert_eq!(session.read::<u8>("axis0.current_state").unwrap(), 1);
    }

    let requests = device.requests();
    assert_eq!(requests.len(), reads);
    assert_eq!(requests[0].sequence, requests[reads - 1].sequence);
    assert!(requests.iter().all(|f| f.sequence < SEQUENCE_MODULUS));

    // Same low 12 bits as the next request, different low 14 bits
    let next = (requests[reads - 1].sequence + 1) % SEQUENCE_MODULUS;
    device.queue_raw_response(
        ResponseFrame {
            sequence: next + SEQUENCE_MODULUS,
            body: vec![9],
        }
        .encode(),
    );
    assert_eq!(session.read::<u8>("axis0.current_state").unwrap(), 1);
}

#[test]
fn test_mismatched_length_is_discarded() {
    let device = SimulatedOdrive::new();
    device.set_value("axis0.error", EndpointValue::new(0x11i32));
    let session = load(&device, ProtocolSettings::default());

    let next = device.requests().last().map_or(0, |f| f.sequence + 1) % SEQUENCE_MODULUS;
    device.queue_raw_response(
        ResponseFrame {
            sequence: next | 0x8000,
            body: vec![0xff, 0xff],
        }
        .encode(),
    );
    assert_eq!(session.read::<i32>("axis0.error").unwrap(), 0x11);
}

#[test]
fn test_move_incremental_writes_inputs_then_triggers() {
    let device = SimulatedOdrive::new();
    let session = load(&device, ProtocolSettings::default());
    device.clear_requests();

    let outputs = session
        .call(
            "axis0.controller.move_incremental",
            &[EndpointValue::new(0.5f32), EndpointValue::new(true)],
        )
        .unwrap();
    assert!(outputs.is_empty());
    assert_eq!(device.call_count("axis0.controller.move_incremental"), 1);

    let ids: Vec<u16> = device.requests().iter().map(|f| f.endpoint_id).collect();
    assert_eq!(ids, vec![12, 13, 11]);
    assert_eq!(
        device.value("axis0.controller.move_incremental.displacement"),
        Some(EndpointValue::new(0.5f32))
    );
}

#[test]
fn test_concurrent_readers_do_not_interleave() {
    let device = SimulatedOdrive::new();
    device.set_value("vbus_voltage", EndpointValue::new(48.0f32));
    device.set_value("axis0.error", EndpointValue::new(7i32));
    let session = load(&device, ProtocolSettings::default());

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    assert_eq!(session.read::<f32>("vbus_voltage").unwrap(), 48.0);
                    assert_eq!(session.read::<i32>("axis0.error").unwrap(), 7);
                }
            });
        }
    });
    assert!(session.is_ready());
}
