//! Integration tests for the full monitoring flow.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

use sppmon::bluetooth::{MockRadio, ServiceRecord};
use sppmon::data::FieldValue;
use sppmon::state::ConnectionState;
use sppmon::{Config, ControllerEvent, DataFormat, SessionController};

const SENSOR: &str = "00:11:22:33:44:55";

async fn next_event(rx: &mut Receiver<ControllerEvent>) -> ControllerEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_record(rx: &mut Receiver<ControllerEvent>) -> sppmon::data::DecodedRecord {
    loop {
        if let ControllerEvent::DataReceived(record) = next_event(rx).await {
            return record;
        }
    }
}

#[tokio::test]
async fn test_scan_diagnose_connect_stream_export() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &config_path,
        r#"{
            "data_format": "custom",
            "frame_messages": true,
            "auto_reconnect": false,
            "data_buffer_size": 2,
            "theme": "dark"
        }"#,
    )
    .unwrap();
    let config = Config::load_from(&config_path);
    assert_eq!(config.data_format, DataFormat::Custom);

    let radio = Arc::new(MockRadio::with_sample_data());
    let controller = SessionController::new(radio.clone(), &config);
    let mut rx = controller.take_event_receiver().unwrap();

    // Pick the first device that offers a serial port
    let devices = controller.scan().await.unwrap();
    let mut target = None;
    for device in &devices {
        let result = controller.diagnose(&device.address).await;
        if let Some(port) = result.suggested_port {
            target = Some((device.address.clone(), port));
            break;
        }
    }
    let (address, port) = target.expect("no compatible device");
    assert_eq!(address, SENSOR);

    controller.connect(&address, port).await.unwrap();
    let mut remote = radio.next_remote().await.unwrap();

    // One message split over two chunks, then two in one chunk
    remote.write_all(b"T:24.8;H:6").await.unwrap();
    remote.write_all(b"2.1\n").await.unwrap();
    let record = next_record(&mut rx).await;
    assert_eq!(record.sequence_number, 1);
    assert_eq!(record.fields.get("temperatura"), Some(&FieldValue::Number(24.8)));
    assert_eq!(record.fields.get("humedad"), Some(&FieldValue::Number(62.1)));

    remote.write_all(b"T:25.0\nP:1013.2\n").await.unwrap();
    assert_eq!(next_record(&mut rx).await.sequence_number, 2);
    let record = next_record(&mut rx).await;
    assert_eq!(record.sequence_number, 3);
    assert_eq!(record.fields.get("presion"), Some(&FieldValue::Number(1013.2)));

    // Capacity is 2, so the first record has been evicted
    let history = controller.history();
    assert_eq!(
        history.iter().map(|r| r.sequence_number).collect::<Vec<_>>(),
        vec![2, 3]
    );

    controller.disconnect().await;
    assert_eq!(controller.state(), ConnectionState::Disconnected);

    let csv_path = dir.path().join("data.csv");
    assert_eq!(controller.export_csv(&csv_path).unwrap(), 2);
    let contents = std::fs::read_to_string(&csv_path).unwrap();
    assert!(contents.starts_with("timestamp,message_number,presion,temperatura\n"));
}

#[tokio::test]
async fn test_remote_close_ends_session() {
    let config = Config {
        auto_reconnect: false,
        ..Config::default()
    };
    let radio = Arc::new(MockRadio::with_sample_data());
    let controller = SessionController::new(radio.clone(), &config);
    let mut rx = controller.take_event_receiver().unwrap();

    controller.connect(SENSOR, 1).await.unwrap();
    let mut remote = radio.next_remote().await.unwrap();
    remote.write_all(b"temperatura:25.5,humedad:60.2").await.unwrap();
    assert_eq!(next_record(&mut rx).await.sequence_number, 1);

    drop(remote);
    loop {
        if let ControllerEvent::ConnectionChanged { connected, .. } = next_event(&mut rx).await {
            assert!(!connected);
            break;
        }
    }
    assert!(!controller.is_connected());

    // No further records after the session ended
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(controller.history().len(), 1);
}

#[tokio::test]
async fn test_incompatible_device_is_reported() {
    let speaker = "AA:BB:CC:DD:EE:FF";
    let radio = Arc::new(
        MockRadio::new()
            .with_device(speaker, "Speaker")
            .with_services(speaker, vec![ServiceRecord::other("Audio Sink", "L2CAP", speaker)]),
    );
    let controller = SessionController::new(radio, &Config::default());

    let result = controller.diagnose(speaker).await;
    assert!(!result.compatible);
    assert_eq!(result.suggested_port, None);
    assert_eq!(result.services.len(), 1);
}

#[tokio::test]
async fn test_json_decode_errors_do_not_stop_stream() {
    let config = Config {
        data_format: DataFormat::Json,
        auto_reconnect: false,
        ..Config::default()
    };
    let radio = Arc::new(MockRadio::with_sample_data());
    let controller = SessionController::new(radio.clone(), &config);
    let mut rx = controller.take_event_receiver().unwrap();

    controller.connect(SENSOR, 1).await.unwrap();
    let mut remote = radio.next_remote().await.unwrap();

    remote.write_all(b"{not valid").await.unwrap();
    let record = next_record(&mut rx).await;
    assert!(record.decode_error.is_some());
    assert_eq!(record.raw_bytes, b"{not valid".to_vec());

    remote.write_all(br#"{"temp": 26.1, "hum": 58.3}"#).await.unwrap();
    let record = next_record(&mut rx).await;
    assert_eq!(record.decode_error, None);
    assert_eq!(record.fields.get("temp"), Some(&FieldValue::Number(26.1)));

    controller.disconnect().await;
}
