// Copyright 2020 Joyent, Inc.

//! The message transport used by the Ticket protocol: a router-style
//! listening socket that demultiplexes many client connections into a
//! single receive loop, and a dealer-style client socket.
//!
//! Every message on the wire is a multipart frame set
//! `[identity(MORE) | payload]`. The router surfaces `(identity, payload)`
//! pairs to its single consumer and routes replies back by identity; the
//! dealer adds and strips the identity frames so client code only ever
//! sees payloads.

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use slog::{debug, error, o, warn, Drain, Logger};

use crate::protocol::{self, Frame, FrameKind, FrameParseError};

/// How often blocked transport threads wake to observe shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Assembles multipart messages from a stream of bytes, retaining
/// whatever partial frame data has arrived so far.
pub struct MessageReader {
    buf: Vec<u8>,
    frames: Vec<Frame>,
}

impl Default for MessageReader {
    fn default() -> Self {
        MessageReader::new()
    }
}

impl MessageReader {
    pub fn new() -> MessageReader {
        MessageReader {
            buf: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Append newly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to assemble the next complete multipart message. Returns
    /// `Ok(None)` when more bytes are needed and an error on a frame that
    /// cannot ever parse (bad version, kind, or CRC).
    pub fn try_next(&mut self) -> Result<Option<Vec<Frame>>, Error> {
        loop {
            match Frame::parse(&self.buf) {
                Ok(frame) => {
                    let rest_offset = frame.wire_size();
                    let truncate_bytes = self.buf.len() - rest_offset;
                    self.buf.rotate_left(rest_offset);
                    self.buf.truncate(truncate_bytes);

                    let more = frame.more;
                    self.frames.push(frame);
                    if !more {
                        return Ok(Some(mem::take(&mut self.frames)));
                    }
                }
                Err(FrameParseError::NotEnoughBytes(_)) => return Ok(None),
                Err(FrameParseError::IOError(e)) => return Err(e),
            }
        }
    }
}

/// An event surfaced by the router socket to its single consumer.
#[derive(Debug, PartialEq)]
pub enum RouterEvent {
    /// A complete message arrived from the given routing identity.
    Message {
        identity: Vec<u8>,
        payload: Vec<u8>,
    },
    /// The transport lost the connection behind the given identity.
    Gone { identity: Vec<u8> },
}

/// A router-style listening socket. Connection reader threads forward
/// complete messages into one channel; replies are routed back to the
/// originating connection by identity.
pub struct RouterSocket {
    events: Receiver<RouterEvent>,
    writers: Arc<Mutex<HashMap<Vec<u8>, TcpStream>>>,
    running: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    readers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    local_addr: SocketAddr,
}

impl RouterSocket {
    /// Bind the listening socket and start accepting connections.
    pub fn bind(
        addr: &SocketAddr,
        log: Option<&Logger>,
    ) -> Result<RouterSocket, Error> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (events_tx, events_rx) = channel::unbounded();
        let writers = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let readers = Arc::new(Mutex::new(Vec::new()));

        let accept_writers = Arc::clone(&writers);
        let accept_running = Arc::clone(&running);
        let accept_readers = Arc::clone(&readers);
        let accept_handle = thread::Builder::new()
            .name(String::from("router-accept"))
            .spawn(move || {
                accept_loop(
                    &listener,
                    &events_tx,
                    &accept_writers,
                    &accept_running,
                    &accept_readers,
                    &log,
                );
            })?;

        Ok(RouterSocket {
            events: events_rx,
            writers,
            running,
            accept_handle: Some(accept_handle),
            readers,
            local_addr,
        })
    }

    /// The address the socket is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait up to `timeout` for the next transport event. The bounded
    /// timeout lets the caller poll its stop flag between receives.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<RouterEvent, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    /// Send `[identity(MORE) | payload]` back to the connection behind
    /// `identity`.
    pub fn send(&self, identity: &[u8], payload: &[u8]) -> Result<(), Error> {
        let mut write_buf = BytesMut::new();
        protocol::encode_message(identity, payload, &mut write_buf)
            .map_err(|e| Error::new(ErrorKind::Other, e))?;

        let writers = self.writers.lock().unwrap();
        match writers.get(identity) {
            Some(stream) => {
                let mut writer: &TcpStream = stream;
                writer.write_all(&write_buf)
            }
            None => Err(Error::new(
                ErrorKind::NotFound,
                "unknown routing identity",
            )),
        }
    }

    /// Stop the accept and reader threads and drop every connection.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let handles: Vec<JoinHandle<()>> =
            self.readers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.writers.lock().unwrap().clear();
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(
    listener: &TcpListener,
    events: &Sender<RouterEvent>,
    writers: &Arc<Mutex<HashMap<Vec<u8>, TcpStream>>>,
    running: &Arc<AtomicBool>,
    readers: &Arc<Mutex<Vec<JoinHandle<()>>>>,
    log: &Logger,
) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(log, "accepted connection"; "peer" => %peer);
                // Accepted sockets inherit the listener's non-blocking
                // mode on some platforms.
                let configured = stream
                    .set_nonblocking(false)
                    .and_then(|_| stream.set_read_timeout(Some(POLL_INTERVAL)));
                if let Err(e) = configured {
                    error!(log, "failed to configure connection"; "err" => %e);
                    continue;
                }

                let conn_events = events.clone();
                let conn_writers = Arc::clone(writers);
                let conn_running = Arc::clone(running);
                let conn_log = log.new(o!("peer" => peer.to_string()));
                let handle = thread::spawn(move || {
                    connection_loop(
                        stream,
                        &conn_events,
                        &conn_writers,
                        &conn_running,
                        &conn_log,
                    );
                });
                readers.lock().unwrap().push(handle);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => {
                error!(log, "failed to accept connection"; "err" => %e);
                break;
            }
        }
    }
}

fn connection_loop(
    mut stream: TcpStream,
    events: &Sender<RouterEvent>,
    writers: &Arc<Mutex<HashMap<Vec<u8>, TcpStream>>>,
    running: &Arc<AtomicBool>,
    log: &Logger,
) {
    let mut reader = MessageReader::new();
    let mut identity: Option<Vec<u8>> = None;
    let mut read_buf = [0; 128];

    'conn: while running.load(Ordering::Relaxed) {
        loop {
            match reader.try_next() {
                Ok(Some(frames)) => {
                    let (msg_identity, payload) = match split_message(frames) {
                        Ok(parts) => parts,
                        Err(e) => {
                            warn!(log, "malformed message"; "err" => %e);
                            break 'conn;
                        }
                    };

                    if identity.is_none() {
                        match stream.try_clone() {
                            Ok(writer) => {
                                writers
                                    .lock()
                                    .unwrap()
                                    .insert(msg_identity.clone(), writer);
                                identity = Some(msg_identity.clone());
                            }
                            Err(e) => {
                                error!(log, "failed to clone stream"; "err" => %e);
                                break 'conn;
                            }
                        }
                    }

                    let event = RouterEvent::Message {
                        identity: msg_identity,
                        payload,
                    };
                    if events.send(event).is_err() {
                        // Receiver gone; the transport is shutting down.
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(log, "failed to parse frame"; "err" => %e);
                    break 'conn;
                }
            }
        }

        match stream.read(&mut read_buf) {
            Ok(0) => break,
            Ok(byte_count) => reader.extend(&read_buf[0..byte_count]),
            Err(ref e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::TimedOut
                    || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(log, "receive failed"; "err" => %e);
                break;
            }
        }
    }

    if let Some(id) = identity {
        writers.lock().unwrap().remove(&id);
        let _ = events.send(RouterEvent::Gone { identity: id });
    }
}

/// Split an assembled multipart message into its routing identity and
/// payload.
fn split_message(frames: Vec<Frame>) -> Result<(Vec<u8>, Vec<u8>), Error> {
    if frames.len() < 2 {
        let msg = format!("expected 2 frames, got {}", frames.len());
        return Err(Error::new(ErrorKind::Other, msg));
    }
    if frames[0].kind != FrameKind::Identity {
        let msg = "first frame is not an identity frame";
        return Err(Error::new(ErrorKind::Other, msg));
    }

    let mut frames = frames;
    let payload = frames.pop().unwrap();
    if payload.kind != FrameKind::Payload {
        let msg = "last frame is not a payload frame";
        return Err(Error::new(ErrorKind::Other, msg));
    }

    let identity = frames.swap_remove(0);
    Ok((identity.data, payload.data))
}

/// A dealer-style client socket with an optional receive deadline. The
/// routing identity travels in the frames this socket writes, so the
/// server can address replies, but callers only exchange payloads.
pub struct DealerSocket {
    stream: TcpStream,
    identity: Vec<u8>,
    reader: MessageReader,
}

impl DealerSocket {
    /// Connect to a router socket. `receive_timeout` of `None` blocks
    /// receives indefinitely.
    pub fn connect(
        addr: &SocketAddr,
        identity: Vec<u8>,
        receive_timeout: Option<Duration>,
    ) -> Result<DealerSocket, Error> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(receive_timeout)?;
        Ok(DealerSocket {
            stream,
            identity,
            reader: MessageReader::new(),
        })
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Send one payload to the server.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut write_buf = BytesMut::new();
        protocol::encode_message(&self.identity, payload, &mut write_buf)
            .map_err(|e| Error::new(ErrorKind::Other, e))?;
        self.stream.write_all(&write_buf)
    }

    /// Receive the next payload from the server. A receive deadline
    /// expiring surfaces as a `WouldBlock`/`TimedOut` error; any frames
    /// buffered so far are retained for the next call.
    pub fn recv(&mut self) -> Result<Vec<u8>, Error> {
        let mut read_buf = [0; 128];
        loop {
            if let Some(mut frames) = self.reader.try_next()? {
                let frame = frames.pop().ok_or_else(|| {
                    Error::new(ErrorKind::Other, "empty message")
                })?;
                if frame.kind != FrameKind::Payload {
                    let msg = "last frame is not a payload frame";
                    return Err(Error::new(ErrorKind::Other, msg));
                }
                return Ok(frame.data);
            }

            match self.stream.read(&mut read_buf) {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "Received EOF (0 bytes) from server",
                    ));
                }
                Ok(byte_count) => {
                    self.reader.extend(&read_buf[0..byte_count]);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn message_reader_handles_split_reads() {
        let mut write_buf = BytesMut::new();
        protocol::encode_message(b"client-1", b"{\"x\":1}", &mut write_buf)
            .unwrap();

        let mut reader = MessageReader::new();
        for byte in write_buf.iter() {
            assert!(reader.try_next().unwrap().is_none());
            reader.extend(&[*byte]);
        }

        let frames = reader.try_next().unwrap().expect("expected a message");
        let (identity, payload) = split_message(frames).unwrap();
        assert_eq!(identity, b"client-1".to_vec());
        assert_eq!(payload, b"{\"x\":1}".to_vec());
    }

    #[test]
    fn router_and_dealer_roundtrip() {
        let mut router = RouterSocket::bind(&loopback(), None).unwrap();
        let addr = router.local_addr();

        let mut dealer =
            DealerSocket::connect(&addr, b"dealer-1".to_vec(), None).unwrap();
        dealer.send(b"ping").unwrap();

        let event = router.recv_timeout(Duration::from_secs(5)).unwrap();
        match event {
            RouterEvent::Message { identity, payload } => {
                assert_eq!(identity, b"dealer-1".to_vec());
                assert_eq!(payload, b"ping".to_vec());
                router.send(&identity, b"pong").unwrap();
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(dealer.recv().unwrap(), b"pong".to_vec());
        router.close();
    }

    #[test]
    fn dropped_dealer_reports_identity_gone() {
        let mut router = RouterSocket::bind(&loopback(), None).unwrap();
        let addr = router.local_addr();

        let mut dealer =
            DealerSocket::connect(&addr, b"dealer-2".to_vec(), None).unwrap();
        dealer.send(b"hello").unwrap();

        match router.recv_timeout(Duration::from_secs(5)).unwrap() {
            RouterEvent::Message { identity, .. } => {
                assert_eq!(identity, b"dealer-2".to_vec())
            }
            other => panic!("unexpected event: {:?}", other),
        }

        drop(dealer);

        match router.recv_timeout(Duration::from_secs(5)).unwrap() {
            RouterEvent::Gone { identity } => {
                assert_eq!(identity, b"dealer-2".to_vec())
            }
            other => panic!("unexpected event: {:?}", other),
        }
        router.close();
    }

    #[test]
    fn dealer_receive_times_out() {
        let mut router = RouterSocket::bind(&loopback(), None).unwrap();
        let addr = router.local_addr();

        let mut dealer = DealerSocket::connect(
            &addr,
            b"dealer-3".to_vec(),
            Some(Duration::from_millis(100)),
        )
        .unwrap();

        let err = dealer.recv().unwrap_err();
        assert!(
            err.kind() == ErrorKind::WouldBlock
                || err.kind() == ErrorKind::TimedOut
        );
        router.close();
    }

    #[test]
    fn send_to_unknown_identity_fails() {
        let mut router = RouterSocket::bind(&loopback(), None).unwrap();
        let err = router.send(b"nobody", b"payload").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        router.close();
    }
}
