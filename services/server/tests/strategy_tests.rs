//! # Strategy Integration Tests
//!
//! The external bridge runs the real `echo-worker` binary; the distributed
//! pool fans out to a second server on another loopback port.

mod common;

use bytes::Bytes;
use codec::CodecSpec;
use common::{text, Client, TestServer, ECHO, SCAN_HEADER};
use streamgate_config::{ModuleCommand, PipelineConfig, StageConfig};
use types::{Acquisition, AcquisitionHeader, Message, RawMessage};

fn echo_module_server() -> TestServer {
    TestServer::start_with(
        |config| {
            config.external.handshake_timeout_secs = 30;
            config.external.modules.insert(
                "echo".to_string(),
                ModuleCommand {
                    command: env!("CARGO_BIN_EXE_echo-worker").to_string(),
                    args: vec!["{port}".to_string()],
                    ..Default::default()
                },
            );
        },
        |builder| builder,
    )
}

fn acquisition(scan: u32) -> Message {
    let mut acquisition = Acquisition::zeroed(AcquisitionHeader {
        scan_counter: scan,
        number_of_samples: 4,
        active_channels: 2,
        ..Default::default()
    });
    for (i, sample) in acquisition.data.iter_mut().enumerate() {
        *sample = i as f32 + scan as f32;
    }
    Message::Acquisition(acquisition)
}

fn external_pipeline() -> String {
    let pipeline = PipelineConfig {
        name: "external-echo".into(),
        stages: vec![StageConfig::new("echo-module", "external")
            .with("module_type", "echo")
            .with("module", "echo")
            .with("codecs", vec!["raw:2000"])],
    };
    pipeline.to_toml().unwrap()
}

#[test_log::test]
fn test_external_module_echoes_in_order() {
    let server = echo_module_server();
    let mut client = Client::with_codecs(server.addr, &[CodecSpec::Raw(2000)]);

    let raw = Message::Raw(RawMessage {
        id: 2000,
        payload: Bytes::from_static(b"\x01\x02\x03"),
    });
    let inputs = vec![acquisition(1), text("between"), raw, acquisition(2)];

    client.send(&Message::Config(external_pipeline()));
    client.send(&Message::Header(Bytes::from_static(SCAN_HEADER)));
    for message in &inputs {
        client.send(message);
    }
    client.send(&Message::Close);

    let mut expected = inputs;
    expected.push(Message::Close);
    assert_eq!(client.recv_until_done(), expected);
}

#[test_log::test]
fn test_external_module_in_void_stage() {
    let server = echo_module_server();
    let mut client = Client::with_codecs(server.addr, &[CodecSpec::Raw(2000)]);

    client.send(&Message::Config(external_pipeline()));
    client.send(&Message::Close);
    client.send(&text("no header"));
    client.send(&Message::Close);

    assert_eq!(
        client.recv_until_done(),
        vec![text("no header"), Message::Close]
    );
}

#[test_log::test]
fn test_unknown_module_type_fails_stage() {
    let server = TestServer::start();
    let mut client = server.client();

    client.send(&Message::Config(external_pipeline()));
    client.send(&Message::Header(Bytes::from_static(SCAN_HEADER)));

    let error = client.expect_error();
    assert!(error.starts_with("External module error"), "{error}");
    assert!(error.contains("no launcher configured for module type 'echo'"), "{error}");
}

#[test_log::test]
fn test_module_exiting_early_fails_stage() {
    let server = TestServer::start_with(
        |config| {
            config.external.modules.insert(
                "echo".to_string(),
                ModuleCommand {
                    command: "sh".to_string(),
                    args: vec!["-c".to_string(), "exit 1".to_string()],
                    ..Default::default()
                },
            );
        },
        |builder| builder,
    );
    let mut client = server.client();

    client.send(&Message::Config(external_pipeline()));
    client.send(&Message::Header(Bytes::from_static(SCAN_HEADER)));

    let error = client.expect_error();
    assert!(error.contains("exited before connecting"), "{error}");
}

fn distributed_pipeline(worker: &str, max_workers: i64) -> String {
    let worker_pipeline = PipelineConfig {
        name: "worker".into(),
        stages: vec![StageConfig::new("echo", ECHO)],
    };
    let pipeline = PipelineConfig {
        name: "fan-out".into(),
        stages: vec![StageConfig::new("pool", "distributed")
            .with("workers", vec![worker])
            .with("max_workers", max_workers)
            .with("pipeline", toml::Value::try_from(&worker_pipeline).unwrap())],
    };
    pipeline.to_toml().unwrap()
}

#[test_log::test]
fn test_distributed_pool_preserves_order() {
    let workers = TestServer::start();
    let front = TestServer::start();
    let mut client = front.client();

    client.send(&Message::Config(distributed_pipeline(
        &workers.addr.to_string(),
        3,
    )));
    client.send(&Message::Header(Bytes::from_static(SCAN_HEADER)));
    let inputs: Vec<Message> = (0..25).map(|i| text(&format!("item-{i}"))).collect();
    for message in &inputs {
        client.send(message);
    }
    client.send(&Message::Close);

    let mut expected = inputs;
    expected.push(Message::Close);
    assert_eq!(client.recv_until_done(), expected);
}

#[test_log::test]
fn test_distributed_without_header_drives_workers_to_void() {
    let workers = TestServer::start();
    let front = TestServer::start();
    let mut client = front.client();

    client.send(&Message::Config(distributed_pipeline(
        &workers.addr.to_string(),
        1,
    )));
    client.send(&Message::Close);
    client.send(&text("void item"));
    client.send(&Message::Close);

    assert_eq!(
        client.recv_until_done(),
        vec![text("void item"), Message::Close]
    );
}

#[test_log::test]
fn test_unreachable_worker_is_worker_error() {
    // Bind then drop to get a port nobody listens on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let front = TestServer::start();
    let mut client = front.client();

    client.send(&Message::Config(distributed_pipeline(
        &format!("127.0.0.1:{port}"),
        1,
    )));
    client.send(&Message::Header(Bytes::from_static(SCAN_HEADER)));
    client.send(&text("lost"));

    let frames = client.recv_until_done();
    match frames.last() {
        Some(Message::Error(error)) => {
            assert!(error.starts_with("Worker error"), "{error}");
        }
        other => panic!("unexpected {other:?}"),
    }
}
