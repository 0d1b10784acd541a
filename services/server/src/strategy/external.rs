//! # External-Process Bridge
//!
//! ## Purpose
//!
//! Hands every message of a stage to an out-of-process module and streams
//! its results back into the pipeline.
//!
//! ## Handshake
//!
//! ```text
//! bridge                                  module process
//!   │ bind 127.0.0.1:0                         │
//!   │ launcher.launch(type, module, port) ───▶ │ (spawned)
//!   │ ◀──────────────── TCP connect ────────── │
//!   │ CONFIG <stage toml> ───────────────────▶ │
//!   │ HEADER <scan header> (if any) ─────────▶ │
//! ```
//!
//! While waiting for the connection the bridge polls the listener and the
//! child process, so a module that dies before connecting fails the stage
//! right away instead of waiting out the handshake timeout.
//!
//! ## Runtime
//!
//! ```text
//! input ──▶ outbound thread ──frames──▶ module ──frames──▶ inbound thread ──▶ output
//!           (CLOSE when input ends)                 (stops at CLOSE)
//! ```
//!
//! Both threads hold an `Arc<ExternalLink>`; the link shuts its socket down
//! and reaps the child when the last holder lets go.

use super::launcher::ModuleLauncher;
use super::{Processable, StageEnv};
use crate::error::{StageError, StageResult};
use crate::stage::SocketShutdown;
use crate::supervisor::ErrorSupervisor;
use channel::{ChannelReceiver, ChannelSender};
use codec::{CodecRegistry, FrameCodec};
use parking_lot::Mutex;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::process::Child;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use streamgate_config::{ExternalSettings, StageConfig};
use tracing::{debug, info, warn};
use types::{Message, ScanContext};

pub const STRATEGY_NAME: &str = "external";

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Stage strategy delegating to one external module
pub struct ExternalBridge {
    stage: StageConfig,
    settings: ExternalSettings,
    context: Arc<ScanContext>,
    launcher: Arc<dyn ModuleLauncher>,
    codec: FrameCodec,
    handshake_timeout: Option<Duration>,
}

impl ExternalBridge {
    pub fn new(
        stage: StageConfig,
        context: Arc<ScanContext>,
        launcher: Arc<dyn ModuleLauncher>,
        codec: FrameCodec,
        default_timeout: Option<Duration>,
    ) -> StageResult<Self> {
        let settings = ExternalSettings::from_stage(&stage)?;
        let handshake_timeout = match settings.handshake_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => default_timeout,
        };
        let codec = codec.with_registry(Arc::new(CodecRegistry::from_specs(&settings.codecs)));

        Ok(Self {
            stage,
            settings,
            context,
            launcher,
            codec,
            handshake_timeout,
        })
    }

    /// Build from an `external` stage description
    pub fn from_env(env: &StageEnv<'_>) -> StageResult<Self> {
        Self::new(
            env.stage.clone(),
            env.context.clone(),
            env.services.launcher.clone(),
            env.services.codec.clone(),
            env.services.config.external.handshake_timeout(),
        )
    }

    /// Launch the module and wait for it to connect back
    fn handshake(&self) -> StageResult<ExternalLink> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| StageError::external(format!("cannot open link endpoint: {e}")))?;
        let port = listener.local_addr()?.port();

        let mut child = self.launcher.launch(
            &self.settings.module_type,
            &self.settings.module,
            port,
            &self.context,
        )?;

        let stream = match self.accept(&listener, child.as_mut()) {
            Ok(stream) => stream,
            Err(err) => {
                if let Some(mut child) = child {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                return Err(err);
            }
        };
        drop(listener);

        let link = ExternalLink {
            module: self.settings.module.clone(),
            stream,
            child: Mutex::new(child),
        };
        self.introduce(&link)?;
        info!(
            stage = %self.stage.name,
            module = %self.settings.module,
            port,
            "External module connected"
        );
        Ok(link)
    }

    fn accept(&self, listener: &TcpListener, mut child: Option<&mut Child>) -> StageResult<TcpStream> {
        let deadline = self.handshake_timeout.map(|timeout| Instant::now() + timeout);
        listener.set_nonblocking(true)?;

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, module = %self.settings.module, "Link accepted");
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(StageError::external(format!("accept failed: {e}"))),
            }

            if let Some(child) = child.as_deref_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(StageError::external(format!(
                        "module '{}' exited before connecting ({status})",
                        self.settings.module
                    )));
                }
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(StageError::external(format!(
                    "module '{}' did not connect within {:?}",
                    self.settings.module,
                    self.handshake_timeout.unwrap_or_default()
                )));
            }
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    }

    /// Send the stage configuration and, when present, the scan header
    fn introduce(&self, link: &ExternalLink) -> StageResult<()> {
        let mut writer = BufWriter::new(&link.stream);
        self.codec
            .write_frame(&mut writer, &Message::Config(self.stage.to_toml()?))?;
        if let Some(header) = &self.context.header {
            self.codec
                .write_frame(&mut writer, &Message::Header(header.to_bytes()))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Socket and process of one connected module
struct ExternalLink {
    module: String,
    stream: TcpStream,
    child: Mutex<Option<Child>>,
}

impl ExternalLink {
    fn forward(&self, codec: &FrameCodec, input: &ChannelReceiver<Message>) -> StageResult<u64> {
        let mut writer = BufWriter::new(&self.stream);
        let mut forwarded = 0u64;
        while let Some(message) = input.pop() {
            codec.write_frame(&mut writer, &message).map_err(|e| self.lost(e))?;
            if input.is_empty() {
                writer.flush().map_err(|e| self.lost(e))?;
            }
            forwarded += 1;
        }
        codec.write_frame(&mut writer, &Message::Close).map_err(|e| self.lost(e))?;
        writer.flush().map_err(|e| self.lost(e))?;
        Ok(forwarded)
    }

    fn drain(&self, codec: &FrameCodec, output: &ChannelSender<Message>) -> StageResult<u64> {
        let mut reader = BufReader::new(&self.stream);
        let mut received = 0u64;
        loop {
            match codec.read_frame(&mut reader).map_err(|e| self.lost(e))? {
                Some(Message::Close) => return Ok(received),
                Some(Message::Error(text)) => {
                    return Err(StageError::external(format!(
                        "module '{}' reported: {text}",
                        self.module
                    )))
                }
                Some(message) => {
                    if output.push(message).is_err() {
                        debug!(module = %self.module, "Downstream closed");
                        return Ok(received);
                    }
                    received += 1;
                }
                None => {
                    return Err(StageError::external(format!(
                        "module '{}' closed the link without CLOSE",
                        self.module
                    )))
                }
            }
        }
    }

    fn lost(&self, err: impl std::fmt::Display) -> StageError {
        StageError::external(format!("link to module '{}' lost: {err}", self.module))
    }
}

impl Drop for ExternalLink {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);

        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        let deadline = Instant::now() + EXIT_GRACE_PERIOD;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(module = %self.module, %status, "Module exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(ACCEPT_POLL_INTERVAL),
                _ => break,
            }
        }
        warn!(module = %self.module, "Module still running after link teardown, killing");
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Processable for ExternalBridge {
    fn name(&self) -> &str {
        &self.stage.name
    }

    fn process(
        self: Box<Self>,
        input: ChannelReceiver<Message>,
        output: ChannelSender<Message>,
        supervisor: &ErrorSupervisor,
    ) -> StageResult<()> {
        let link = match self.handshake() {
            Ok(link) => Arc::new(link),
            Err(err) => {
                input.close();
                output.close();
                return Err(err);
            }
        };
        // Any failure in the connection unblocks a thread parked on the link
        supervisor.abort_on_error(SocketShutdown::both(&link.stream)?);
        let codec = &self.codec;
        let name = &self.stage.name;

        thread::scope(|scope| -> StageResult<()> {
            let outbound_link = link.clone();
            let outbound_input = input.clone();
            supervisor.spawn_scoped(scope, &format!("{name}-outbound"), (), move || {
                let forwarded = outbound_link.forward(codec, &outbound_input)?;
                debug!(stage = %name, forwarded, "Input forwarded to module");
                Ok(())
            })?;

            let inbound_link = link.clone();
            let inbound_output = output.clone();
            // Closing `input` as well releases the outbound thread if the module dies first
            supervisor.spawn_scoped(scope, &format!("{name}-inbound"), (output, input), move || {
                let received = inbound_link.drain(codec, &inbound_output)?;
                debug!(stage = %name, received, "Module results drained");
                Ok(())
            })?;
            Ok(())
        })?;

        drop(link);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::CommandLauncher;
    use channel::channel;
    use std::collections::BTreeMap;
    use streamgate_config::ModuleCommand;

    /// Runs the module as a thread of this process
    struct InProcessLauncher {
        behaviour: fn(u16),
    }

    impl ModuleLauncher for InProcessLauncher {
        fn launch(&self, _: &str, _: &str, port: u16, _: &ScanContext) -> StageResult<Option<Child>> {
            let behaviour = self.behaviour;
            thread::spawn(move || behaviour(port));
            Ok(None)
        }
    }

    fn doubling_module(port: u16) {
        let codec = FrameCodec::default();
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;

        assert!(matches!(codec.read_frame(&mut reader).unwrap(), Some(Message::Config(_))));
        while let Some(message) = codec.read_frame(&mut reader).unwrap() {
            match message {
                Message::Text(text) => codec
                    .write_frame(&mut writer, &Message::Text(text.repeat(2)))
                    .unwrap(),
                Message::Close => {
                    codec.write_frame(&mut writer, &Message::Close).unwrap();
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    fn failing_module(port: u16) {
        let codec = FrameCodec::default();
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;

        // CONFIG, then the first input
        codec.read_frame(&mut reader).unwrap();
        codec.read_frame(&mut reader).unwrap();
        codec
            .write_frame(&mut writer, &Message::Error("license expired".into()))
            .unwrap();
        while let Ok(Some(_)) = codec.read_frame(&mut reader) {}
    }

    fn bridge(launcher: Arc<dyn ModuleLauncher>, stage: StageConfig) -> Box<ExternalBridge> {
        Box::new(
            ExternalBridge::new(
                stage,
                Arc::new(ScanContext::default()),
                launcher,
                FrameCodec::default(),
                Some(Duration::from_secs(5)),
            )
            .unwrap(),
        )
    }

    fn stage() -> StageConfig {
        StageConfig::new("ext", STRATEGY_NAME)
            .with("module_type", "test")
            .with("module", "doubler")
    }

    fn run(bridge: Box<ExternalBridge>, inputs: &[&str]) -> (Vec<Message>, StageResult<()>) {
        let (in_tx, in_rx) = channel();
        let (out_tx, out_rx) = channel();
        for text in inputs {
            in_tx.push(Message::Text(text.to_string())).unwrap();
        }
        in_tx.close();

        let supervisor = ErrorSupervisor::new();
        let outcome = bridge
            .process(in_rx, out_tx, &supervisor)
            .and_then(|()| supervisor.result());
        (out_rx.collect(), outcome)
    }

    #[test]
    fn test_round_trip_through_module() {
        let launcher = Arc::new(InProcessLauncher {
            behaviour: doubling_module,
        });
        let (output, outcome) = run(bridge(launcher, stage()), &["ab", "c"]);
        outcome.unwrap();
        assert_eq!(
            output,
            vec![Message::Text("abab".into()), Message::Text("cc".into())]
        );
    }

    #[test]
    fn test_module_error_frame() {
        let launcher = Arc::new(InProcessLauncher {
            behaviour: failing_module,
        });
        let (output, outcome) = run(bridge(launcher, stage()), &["x"]);
        assert!(output.is_empty());
        assert!(matches!(outcome, Err(StageError::ExternalModule(m)) if m.contains("license expired")));
    }

    #[test]
    fn test_handshake_timeout() {
        let launcher = Arc::new(InProcessLauncher { behaviour: |_| {} });
        let stage = stage().with("handshake_timeout_secs", 1);
        let (_, outcome) = run(bridge(launcher, stage), &[]);
        assert!(matches!(outcome, Err(StageError::ExternalModule(m)) if m.contains("did not connect")));
    }

    #[test]
    fn test_module_exit_before_handshake() {
        let mut modules = BTreeMap::new();
        modules.insert(
            "test".to_string(),
            ModuleCommand {
                command: "sh".into(),
                args: vec!["-c".into(), "exit 3".into()],
                ..Default::default()
            },
        );
        let launcher = Arc::new(CommandLauncher::new(modules));
        let started = Instant::now();
        let (_, outcome) = run(bridge(launcher, stage()), &["x"]);

        assert!(matches!(outcome, Err(StageError::ExternalModule(m)) if m.contains("exited before connecting")));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_zero_timeout_means_unbounded() {
        let stage = stage().with("handshake_timeout_secs", 0);
        let launcher = Arc::new(InProcessLauncher {
            behaviour: doubling_module,
        });
        assert_eq!(bridge(launcher, stage).handshake_timeout, None);
    }
}
