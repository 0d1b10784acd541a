//! Shared harness for server integration tests: a server on a loopback
//! port, a framed client and two in-process strategies.

#![allow(dead_code)]

use channel::{ChannelReceiver, ChannelSender};
use codec::{CodecRegistry, CodecSpec, FrameCodec};
use std::fs;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use stream_server::{ErrorSupervisor, Processable, Server, ServerBuilder, StageResult};
use streamgate_config::ServerConfig;
use tempfile::TempDir;
use types::Message;

pub const ECHO: &str = "echo";
pub const PROBE: &str = "probe";
pub const QUIT: &str = "quit";

/// 32-byte scan header body
pub const SCAN_HEADER: &[u8; 32] = b"<scan protocol=\"t1\" slices=\"4\"/>";

/// Passes every message through unchanged
pub struct Echo {
    name: String,
}

impl Processable for Echo {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self: Box<Self>,
        input: ChannelReceiver<Message>,
        output: ChannelSender<Message>,
        _supervisor: &ErrorSupervisor,
    ) -> StageResult<()> {
        while let Some(message) = input.pop() {
            if output.push(message).is_err() {
                break;
            }
        }
        output.close();
        Ok(())
    }
}

/// Emits `header=<bool>` first, then echoes
pub struct Probe {
    name: String,
    has_header: bool,
}

impl Processable for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self: Box<Self>,
        input: ChannelReceiver<Message>,
        output: ChannelSender<Message>,
        supervisor: &ErrorSupervisor,
    ) -> StageResult<()> {
        let _ = output.push(Message::Text(format!("header={}", self.has_header)));
        Box::new(Echo { name: self.name }).process(input, output, supervisor)
    }
}

/// Finishes at once without reading its input
pub struct Quit {
    name: String,
}

impl Processable for Quit {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self: Box<Self>,
        _input: ChannelReceiver<Message>,
        output: ChannelSender<Message>,
        _supervisor: &ErrorSupervisor,
    ) -> StageResult<()> {
        output.close();
        Ok(())
    }
}

pub fn with_test_strategies(builder: ServerBuilder) -> ServerBuilder {
    builder
        .strategy(ECHO, |env| {
            Ok(Box::new(Echo {
                name: env.stage.name.clone(),
            }) as Box<dyn Processable>)
        })
        .strategy(PROBE, |env| {
            Ok(Box::new(Probe {
                name: env.stage.name.clone(),
                has_header: env.context.has_header(),
            }) as Box<dyn Processable>)
        })
        .strategy(QUIT, |env| {
            Ok(Box::new(Quit {
                name: env.stage.name.clone(),
            }) as Box<dyn Processable>)
        })
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub home: TempDir,
}

impl TestServer {
    /// Start a server with the test strategies on an ephemeral port
    pub fn start() -> Self {
        Self::start_with(|_| {}, |builder| builder)
    }

    pub fn start_with(
        configure: impl FnOnce(&mut ServerConfig),
        build: impl FnOnce(ServerBuilder) -> ServerBuilder,
    ) -> Self {
        let home = tempfile::tempdir().unwrap();
        fs::create_dir_all(home.path().join("pipelines")).unwrap();

        let mut config = ServerConfig::default();
        config.listen = "127.0.0.1:0".parse().unwrap();
        config.paths.home = home.path().to_path_buf();
        config.paths.working_dir = home.path().to_path_buf();
        configure(&mut config);

        let builder = build(with_test_strategies(Server::builder(config)));
        let addr = builder.bind().unwrap().spawn().unwrap();
        Self { addr, home }
    }

    pub fn write_pipeline(&self, name: &str, text: &str) {
        fs::write(self.home.path().join("pipelines").join(name), text).unwrap();
    }

    pub fn client(&self) -> Client {
        Client::connect(self.addr, FrameCodec::default())
    }
}

pub struct Client {
    codec: FrameCodec,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr, codec: FrameCodec) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(20)))
            .unwrap();
        Self {
            codec,
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    /// Client that also knows the given declared codecs
    pub fn with_codecs(addr: SocketAddr, specs: &[CodecSpec]) -> Self {
        let codec = FrameCodec::default().with_registry(Arc::new(CodecRegistry::from_specs(specs)));
        Self::connect(addr, codec)
    }

    pub fn send(&mut self, message: &Message) {
        self.codec.write_frame(&mut self.writer, message).unwrap();
        self.writer.flush().unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    /// Half-close: no more frames from this client, replies still readable
    pub fn finish(&mut self) {
        self.writer.shutdown(Shutdown::Write).unwrap();
    }

    /// Next frame; `None` once the server closed the socket
    pub fn recv(&mut self) -> Option<Message> {
        self.codec.read_frame(&mut self.reader).unwrap()
    }

    /// Frames up to and including CLOSE or ERROR
    pub fn recv_until_done(&mut self) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv() {
            let done = matches!(frame, Message::Close | Message::Error(_));
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    }

    pub fn expect_error(&mut self) -> String {
        match self.recv() {
            Some(Message::Error(text)) => text,
            other => panic!("expected ERROR frame, got {other:?}"),
        }
    }
}

pub fn text(value: &str) -> Message {
    Message::Text(value.to_string())
}

pub fn inline_pipeline(strategy: &str) -> Message {
    Message::Config(format!(
        "name = \"inline\"\n\n[[stages]]\nname = \"only\"\nstrategy = \"{strategy}\"\n"
    ))
}
