//! # Remote Workers
//!
//! ## Purpose
//!
//! A worker turns one message into one result message. The distributed pool
//! never knows where a worker lives; it asks a [`WorkerSource`] for a fresh
//! connection whenever its idle list is empty and it is still below its
//! worker limit.
//!
//! ## Remote Negotiation
//!
//! [`RemoteWorkerSource`] treats another streamgate server as a worker. It
//! connects as an ordinary client and walks the remote connection into its
//! data stage before handing the link to the pool:
//!
//! ```text
//! pool ──▶ connect()
//!            │ CONFIG <pipeline toml>   or   FILENAME <pipeline file>
//!            │ HEADER <scan header>     or   CLOSE (remote runs without metadata)
//!            ▼
//!       RemoteWorker ── frame ──▶ remote STREAM/VOID stage
//!                    ◀── frame ──
//! ```
//!
//! Dropping a [`RemoteWorker`] sends CLOSE and shuts the socket down.

use crate::error::{StageError, StageResult};
use codec::FrameCodec;
use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use streamgate_config::WorkerPipeline;
use tracing::{debug, info, trace};
use types::{Message, ScanHeader};

const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Processes one message at a time
pub trait Worker: Send {
    fn process(&mut self, message: Message) -> StageResult<Message>;
}

/// Creates new workers on demand
pub trait WorkerSource: Send + Sync {
    fn connect(&self) -> StageResult<Box<dyn Worker>>;
}

/// Round-robin connector over a list of remote streamgate servers
pub struct RemoteWorkerSource {
    addresses: Vec<String>,
    pipeline: WorkerPipeline,
    header: Option<ScanHeader>,
    codec: FrameCodec,
    connect_timeout: Option<Duration>,
    next: AtomicUsize,
}

impl RemoteWorkerSource {
    pub fn new(
        addresses: Vec<String>,
        pipeline: WorkerPipeline,
        header: Option<ScanHeader>,
        codec: FrameCodec,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            addresses,
            pipeline,
            header,
            codec,
            connect_timeout,
            next: AtomicUsize::new(0),
        }
    }

    fn next_address(&self) -> StageResult<&str> {
        if self.addresses.is_empty() {
            return Err(StageError::worker("no worker addresses configured"));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        Ok(&self.addresses[index])
    }

    fn open(&self, address: &str) -> StageResult<TcpStream> {
        let resolved: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(|e| StageError::worker(format!("cannot resolve worker '{address}': {e}")))?
            .collect();

        let mut last_error = None;
        for addr in resolved {
            let attempt = match self.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }

        Err(StageError::worker(match last_error {
            Some(e) => format!("cannot connect to worker '{address}': {e}"),
            None => format!("worker address '{address}' resolved to nothing"),
        }))
    }

    /// Frames that move a fresh remote connection into its data stage
    fn negotiation(&self) -> StageResult<Vec<Message>> {
        let config = match &self.pipeline {
            WorkerPipeline::Inline(pipeline) => Message::Config(pipeline.to_toml()?),
            WorkerPipeline::File(name) => Message::Filename(name.clone()),
        };
        let header = match &self.header {
            Some(header) => Message::Header(header.to_bytes()),
            None => Message::Close,
        };
        Ok(vec![config, header])
    }
}

impl WorkerSource for RemoteWorkerSource {
    fn connect(&self) -> StageResult<Box<dyn Worker>> {
        let address = self.next_address()?;
        let stream = self.open(address)?;
        stream.set_nodelay(true)?;

        let mut worker = RemoteWorker::new(address.to_string(), stream, self.codec.clone())?;
        for message in self.negotiation()? {
            worker.send(&message)?;
        }
        info!(worker = %address, "Remote worker connected");
        Ok(Box::new(worker))
    }
}

/// One negotiated connection to a remote streamgate server
pub struct RemoteWorker {
    address: String,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    codec: FrameCodec,
}

impl RemoteWorker {
    fn new(address: String, stream: TcpStream, codec: FrameCodec) -> StageResult<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            address,
            reader,
            writer: BufWriter::new(stream),
            codec,
        })
    }

    fn send(&mut self, message: &Message) -> StageResult<()> {
        let written = self
            .codec
            .write_frame(&mut self.writer, message)
            .map_err(|e| e.to_string())
            .and_then(|()| self.writer.flush().map_err(|e| e.to_string()));
        written.map_err(|e| StageError::worker(format!("write to worker '{}' failed: {e}", self.address)))
    }

    fn receive(&mut self) -> StageResult<Message> {
        loop {
            let frame = self
                .codec
                .read_frame(&mut self.reader)
                .map_err(|e| StageError::worker(format!("read from worker '{}' failed: {e}", self.address)))?;

            match frame {
                Some(Message::Error(text)) => {
                    return Err(StageError::worker(format!("worker '{}' failed: {text}", self.address)))
                }
                Some(Message::Close) | None => {
                    return Err(StageError::worker(format!(
                        "worker '{}' closed the connection",
                        self.address
                    )))
                }
                // Answers to queries nobody on this link asked
                Some(Message::Response(response)) => {
                    trace!(worker = %self.address, id = response.correlation_id, "Ignoring response");
                }
                Some(message) => return Ok(message),
            }
        }
    }
}

impl Worker for RemoteWorker {
    fn process(&mut self, message: Message) -> StageResult<Message> {
        self.send(&message)?;
        self.receive()
    }
}

impl Drop for RemoteWorker {
    fn drop(&mut self) {
        if self.send(&Message::Close).is_err() {
            debug!(worker = %self.address, "Worker link already gone");
        } else {
            // Wait briefly for the remote's closing CLOSE so it can finish cleanly
            let _ = self.reader.get_ref().set_read_timeout(Some(CLOSE_WAIT));
            while let Ok(Some(frame)) = self.codec.read_frame(&mut self.reader) {
                if frame == Message::Close {
                    break;
                }
            }
        }
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use streamgate_config::PipelineConfig;

    fn source(addresses: Vec<String>, header: Option<ScanHeader>) -> RemoteWorkerSource {
        RemoteWorkerSource::new(
            addresses,
            WorkerPipeline::File("worker.toml".into()),
            header,
            FrameCodec::default(),
            Some(Duration::from_secs(2)),
        )
    }

    #[test]
    fn test_negotiation_frames() {
        let without_header = source(vec![], None).negotiation().unwrap();
        assert_eq!(
            without_header,
            vec![Message::Filename("worker.toml".into()), Message::Close]
        );

        let pipeline = PipelineConfig::parse("[[stages]]\nname = \"e\"\nstrategy = \"echo\"\n").unwrap();
        let inline = RemoteWorkerSource::new(
            vec![],
            WorkerPipeline::Inline(pipeline),
            Some(ScanHeader::parse(b"<scan/>").unwrap()),
            FrameCodec::default(),
            None,
        );
        let frames = inline.negotiation().unwrap();
        assert!(matches!(&frames[0], Message::Config(text) if text.contains("strategy = \"echo\"")));
        assert_eq!(frames[1], Message::Header(bytes::Bytes::from_static(b"<scan/>")));
    }

    #[test]
    fn test_no_addresses() {
        let err = source(vec![], None).connect().err().unwrap();
        assert!(matches!(err, StageError::Worker(_)));
    }

    #[test]
    fn test_round_robin() {
        let source = source(vec!["a:1".into(), "b:2".into()], None);
        let picked: Vec<_> = (0..4).map(|_| source.next_address().unwrap().to_string()).collect();
        assert_eq!(picked, vec!["a:1", "b:2", "a:1", "b:2"]);
    }

    #[test]
    fn test_remote_worker_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        // Minimal peer: swallow negotiation, answer each TEXT with upper-case TEXT
        let peer = thread::spawn(move || {
            let codec = FrameCodec::default();
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            assert_eq!(
                codec.read_frame(&mut reader).unwrap(),
                Some(Message::Filename("worker.toml".into()))
            );
            assert_eq!(codec.read_frame(&mut reader).unwrap(), Some(Message::Close));
            while let Some(message) = codec.read_frame(&mut reader).unwrap() {
                match message {
                    Message::Text(text) => codec
                        .write_frame(&mut writer, &Message::Text(text.to_uppercase()))
                        .unwrap(),
                    Message::Close => break,
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        });

        let mut worker = source(vec![address], None).connect().unwrap();
        assert_eq!(
            worker.process(Message::Text("abc".into())).unwrap(),
            Message::Text("ABC".into())
        );
        drop(worker);
        peer.join().unwrap();
    }

    #[test]
    fn test_remote_error_frame_fails_job() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let peer = thread::spawn(move || {
            let codec = FrameCodec::default();
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            for _ in 0..3 {
                codec.read_frame(&mut reader).unwrap();
            }
            codec
                .write_frame(&mut writer, &Message::Error("bad input".into()))
                .unwrap();
        });

        let mut worker = source(vec![address], None).connect().unwrap();
        let err = worker.process(Message::Text("x".into())).unwrap_err();
        assert!(err.to_string().contains("bad input"));
        peer.join().unwrap();
    }
}
