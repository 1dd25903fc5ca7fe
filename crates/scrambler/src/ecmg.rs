//! ECMG client: the scrambler side of the SimulCrypt ECMG <=> SCS session.
//!
//! [`EcmGenerator`] is the seam the crypto-period machinery talks to; the
//! production implementation is [`EcmgClient`], a blocking TCP session with
//! a reader thread that dispatches asynchronous ECM responses. The reader
//! thread invokes submission callbacks, so callbacks run concurrently with
//! the packet processing thread and must publish their results accordingly.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::Result;
use crate::error::ScramblerError;
use crate::simulcrypt::{
    ChannelStatus, FrameHeader, HEADER_SIZE, Message, StreamStatus, encode_message,
};

/// An ECM generation request: one crypto-period with its two control words.
#[derive(Debug, Clone)]
pub struct EcmRequest {
    pub cp_number: u16,
    pub cw_current: [u8; 8],
    pub cw_next: [u8; 8],
    pub access_criteria: Vec<u8>,
    pub cp_duration_100ms: u16,
}

/// A generated ECM.
#[derive(Debug, Clone)]
pub struct EcmResponse {
    pub cp_number: u16,
    pub ecm_datagram: Bytes,
}

/// Completion callback for an asynchronous submission. Invoked from the
/// client's I/O thread.
pub type EcmCallback = Box<dyn FnOnce(Result<EcmResponse>) + Send>;

/// The ECM generation interface consumed by the crypto-period machinery.
pub trait EcmGenerator: Send {
    /// Submit a request; the callback fires when the ECM arrives.
    fn submit(&mut self, request: EcmRequest, done: EcmCallback) -> Result<()>;

    /// Generate synchronously, blocking until the ECM is available.
    fn generate(&mut self, request: EcmRequest) -> Result<EcmResponse>;

    /// Tear the session down. Idempotent.
    fn disconnect(&mut self) {}
}

/// An established ECMG session handed to the plugin: the generator plus the
/// channel parameters negotiated at setup.
pub struct EcmgSession {
    pub generator: Box<dyn EcmGenerator>,
    pub channel: ChannelStatus,
    pub stream: StreamStatus,
}

/// Connection parameters of an ECMG session.
#[derive(Debug, Clone)]
pub struct EcmgConfig {
    pub addr: SocketAddr,
    pub super_cas_id: u32,
    pub channel_id: u16,
    pub stream_id: u16,
    pub ecm_id: u16,
    pub cp_duration_100ms: u16,
    /// Protocol version byte (2 or 3)
    pub version: u8,
}

struct Shared {
    writer: Mutex<TcpStream>,
    pending: Mutex<HashMap<u16, EcmCallback>>,
    closed: AtomicBool,
    version: u8,
    channel_id: u16,
    stream_id: u16,
}

impl Shared {
    fn send(&self, msg: &Message) -> Result<()> {
        let frame = encode_message(msg, self.version);
        self.writer.lock().write_all(&frame)?;
        Ok(())
    }

    /// Fail every pending submission; used on teardown and protocol errors.
    fn fail_pending(&self, reason: &str) {
        let callbacks: Vec<EcmCallback> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, callback)| callback).collect()
        };
        for callback in callbacks {
            callback(Err(ScramblerError::Protocol(reason.to_string())));
        }
    }
}

/// Blocking SimulCrypt client for one ECM stream.
pub struct EcmgClient {
    config: EcmgConfig,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    connected: bool,
}

impl EcmgClient {
    /// Connect to the ECMG and negotiate the channel and stream. Returns
    /// the client together with the negotiated parameters.
    pub fn connect(config: EcmgConfig) -> Result<(Self, ChannelStatus, StreamStatus)> {
        let mut stream = TcpStream::connect(config.addr)?;
        stream.set_nodelay(true)?;

        let setup = Message::ChannelSetup {
            channel_id: config.channel_id,
            super_cas_id: config.super_cas_id,
        };
        stream.write_all(&encode_message(&setup, config.version))?;
        let channel = match read_message(&mut stream)? {
            Message::ChannelStatus(status) => status,
            Message::ChannelError { error_status, .. } => {
                return Err(ScramblerError::EcmgStatus {
                    status: error_status,
                });
            }
            other => return Err(ScramblerError::UnexpectedMessage(other.message_type())),
        };

        let setup = Message::StreamSetup {
            channel_id: config.channel_id,
            stream_id: config.stream_id,
            ecm_id: config.ecm_id,
            nominal_cp_duration_100ms: config.cp_duration_100ms,
        };
        stream.write_all(&encode_message(&setup, config.version))?;
        let stream_status = match read_message(&mut stream)? {
            Message::StreamStatus(status) => status,
            Message::StreamError { error_status, .. }
            | Message::ChannelError { error_status, .. } => {
                return Err(ScramblerError::EcmgStatus {
                    status: error_status,
                });
            }
            other => return Err(ScramblerError::UnexpectedMessage(other.message_type())),
        };

        debug!(
            delay_start = channel.delay_start,
            section_tspkt = channel.section_tspkt_flag,
            "ECMG channel established"
        );

        let shared = Arc::new(Shared {
            writer: Mutex::new(stream.try_clone()?),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            version: config.version,
            channel_id: config.channel_id,
            stream_id: config.stream_id,
        });
        let reader = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("ecmg-reader".into())
                .spawn(move || reader_loop(stream, shared))?
        };

        let client = EcmgClient {
            config,
            shared,
            reader: Some(reader),
            connected: true,
        };
        Ok((client, channel, stream_status))
    }

    /// Connect and wrap the negotiated session for the plugin.
    pub fn open_session(config: EcmgConfig) -> Result<EcmgSession> {
        let (client, channel, stream) = EcmgClient::connect(config)?;
        Ok(EcmgSession {
            generator: Box::new(client),
            channel,
            stream,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected && !self.shared.closed.load(Ordering::Acquire)
    }
}

impl EcmGenerator for EcmgClient {
    fn submit(&mut self, request: EcmRequest, done: EcmCallback) -> Result<()> {
        if !self.is_connected() {
            return Err(ScramblerError::Disconnected);
        }
        let msg = Message::CwProvision {
            channel_id: self.config.channel_id,
            stream_id: self.config.stream_id,
            cp_number: request.cp_number,
            cw_combinations: vec![
                (request.cp_number, request.cw_current),
                (request.cp_number.wrapping_add(1), request.cw_next),
            ],
            cp_duration_100ms: Some(request.cp_duration_100ms),
            access_criteria: if request.access_criteria.is_empty() {
                None
            } else {
                Some(Bytes::from(request.access_criteria.clone()))
            },
        };
        self.shared.pending.lock().insert(request.cp_number, done);
        if let Err(e) = self.shared.send(&msg) {
            self.shared.pending.lock().remove(&request.cp_number);
            return Err(e);
        }
        Ok(())
    }

    fn generate(&mut self, request: EcmRequest) -> Result<EcmResponse> {
        let (tx, rx) = mpsc::channel();
        self.submit(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.recv().map_err(|_| ScramblerError::Disconnected)?
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        let _ = self.shared.send(&Message::StreamCloseRequest {
            channel_id: self.config.channel_id,
            stream_id: self.config.stream_id,
        });
        let _ = self.shared.send(&Message::ChannelClose {
            channel_id: self.config.channel_id,
        });
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.shared.writer.lock().shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.shared.fail_pending("disconnected");
    }
}

impl Drop for EcmgClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Read one complete frame from the stream.
fn read_message(stream: &mut TcpStream) -> Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let header = FrameHeader::parse(&header);
    let mut body = vec![0u8; header.length];
    stream.read_exact(&mut body)?;
    crate::simulcrypt::decode_body(header.message_type, body.into())
}

/// Reader thread: dispatches ECM responses, answers keepalive tests and
/// surfaces protocol errors to pending submissions.
fn reader_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    loop {
        let msg = match read_message(&mut stream) {
            Ok(msg) => msg,
            Err(e) => {
                if !shared.closed.swap(true, Ordering::AcqRel) {
                    warn!("ECMG connection lost: {e}");
                    shared.fail_pending("connection lost");
                }
                return;
            }
        };
        match msg {
            Message::EcmResponse {
                cp_number,
                ecm_datagram,
                ..
            } => {
                let callback = shared.pending.lock().remove(&cp_number);
                match callback {
                    Some(callback) => callback(Ok(EcmResponse {
                        cp_number,
                        ecm_datagram,
                    })),
                    None => warn!(cp_number, "unsolicited ECM response"),
                }
            }
            Message::ChannelTest { .. } => {
                // Keepalive: report the channel as alive.
                let _ = shared.send(&Message::ChannelStatus(ChannelStatus {
                    channel_id: shared.channel_id,
                    ..Default::default()
                }));
            }
            Message::StreamTest { .. } => {
                let _ = shared.send(&Message::StreamStatus(StreamStatus {
                    channel_id: shared.channel_id,
                    stream_id: shared.stream_id,
                    ..Default::default()
                }));
            }
            Message::ChannelError { error_status, .. }
            | Message::StreamError { error_status, .. } => {
                error!(error_status, "ECMG reported an error");
                shared.closed.store(true, Ordering::Release);
                shared.fail_pending("ECMG error");
                return;
            }
            Message::ChannelStatus(_) | Message::StreamStatus(_) => {
                // Response to one of our own tests; nothing to do.
            }
            other => {
                debug!(message_type = other.message_type(), "ignoring ECMG message");
            }
        }
    }
}
