//! Reference external module: echoes every data frame back
//!
//! Usage:
//!   echo-worker <port>
//!   STREAMGATE_PORT=<port> echo-worker

use anyhow::{bail, Context, Result};
use clap::Parser;
use codec::{CodecRegistry, FrameCodec};
use std::io::{BufReader, BufWriter, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use stream_server::strategy::declared_codecs;
use streamgate_config::defaults::external::PORT_ENV;
use streamgate_config::StageConfig;
use tracing::{debug, info};
use types::Message;

#[derive(Parser, Debug)]
#[command(name = "echo-worker")]
#[command(about = "Streamgate echo module")]
struct Args {
    /// Port of the bridge to connect back to
    port: Option<u16>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let port = match args.port {
        Some(port) => port,
        None => std::env::var(PORT_ENV)
            .with_context(|| format!("no port argument and {PORT_ENV} is unset"))?
            .parse()
            .with_context(|| format!("{PORT_ENV} is not a port number"))?,
    };

    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .with_context(|| format!("Failed to connect to bridge on port {port}"))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let stage_text = match FrameCodec::default().read_frame(&mut reader)? {
        Some(Message::Config(text)) => text,
        other => bail!("expected CONFIG from the bridge, got {other:?}"),
    };
    let stage: StageConfig = toml::from_str(&stage_text).context("Invalid stage configuration")?;
    let codec = FrameCodec::default().with_registry(Arc::new(CodecRegistry::from_specs(
        &declared_codecs(&stage)?,
    )));
    info!(stage = %stage.name, port, "Echo module connected");

    let mut echoed = 0u64;
    while let Some(message) = codec.read_frame(&mut reader)? {
        match message {
            Message::Header(raw) => debug!(bytes = raw.len(), "Scan header received"),
            Message::Close => {
                codec.write_frame(&mut writer, &Message::Close)?;
                writer.flush()?;
                info!(echoed, "Input finished");
                return Ok(());
            }
            message if message.is_data() => {
                codec.write_frame(&mut writer, &message)?;
                writer.flush()?;
                echoed += 1;
            }
            other => debug!(message = %other.describe(), "Ignoring control frame"),
        }
    }

    bail!("bridge closed the link without CLOSE")
}
