// Copyright 2020 Joyent, Inc.

//! This module provides the interface for creating Ticket servers: the
//! client registry and the single-threaded router loop that owns the
//! listening socket.

use std::collections::HashMap;
use std::io::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::caps;
use crate::protocol::{
    self, EnvelopeReq, EnvelopeResp, FirstHandshake, Status, SubmitResponse,
};
use crate::runner::AlgoRunner;
use crate::transport::{RouterEvent, RouterSocket};

/// How long one receive may block before the loop re-checks the stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maps each connected routing identity to its advertised capability
/// bitmask. Entries are inserted by the handshake path and never mutated
/// afterwards.
pub struct ClientRegistry {
    clients: HashMap<Vec<u8>, u8>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        ClientRegistry::new()
    }
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry {
            clients: HashMap::new(),
        }
    }

    pub fn register(&mut self, identity: &[u8], exec_caps: u8) {
        self.clients.insert(identity.to_vec(), exec_caps);
    }

    pub fn lookup(&self, identity: &[u8]) -> Option<u8> {
        self.clients.get(identity).copied()
    }

    pub fn remove(&mut self, identity: &[u8]) {
        self.clients.remove(identity);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// A Ticket server: a router socket, the client registry, and the
/// algorithm runner. One instance owns the process's server lifecycle.
pub struct Server {
    socket: RouterSocket,
    registry: ClientRegistry,
    runner: AlgoRunner,
    log: Logger,
}

impl Server {
    /// Bind the server socket and start a worker pool of `threads`
    /// executors.
    pub fn bind(
        addr: &SocketAddr,
        threads: usize,
        log: Option<&Logger>,
    ) -> Result<Server, Error> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let socket = RouterSocket::bind(addr, Some(&log))?;
        let runner = AlgoRunner::new(threads, Some(&log))?;
        info!(log, "listening for ticket requests"; "address" => %socket.local_addr());

        Ok(Server {
            socket,
            registry: ClientRegistry::new(),
            runner,
            log,
        })
    }

    /// The address the server socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Run the router loop until the stop flag is set or the transport
    /// terminates. The loop is the sole owner of the socket; the runner
    /// is only ever called from this thread.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), Error> {
        while !stop.load(Ordering::Relaxed) {
            match self.socket.recv_timeout(STOP_POLL_INTERVAL) {
                Ok(RouterEvent::Message { identity, payload }) => {
                    let reply = dispatch(
                        &mut self.registry,
                        &self.runner,
                        &identity,
                        &payload,
                        &self.log,
                    );
                    if let Some(reply) = reply {
                        if let Err(e) = self.socket.send(&identity, &reply) {
                            warn!(self.log, "failed to send response"; "err" => %e);
                        }
                    }
                }
                Ok(RouterEvent::Gone { identity }) => {
                    debug!(self.log, "client gone";
                        "client" => String::from_utf8_lossy(&identity).into_owned());
                    self.registry.remove(&identity);
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    info!(self.log, "transport terminated, exiting");
                    break;
                }
            }
        }

        info!(self.log, "server loop exited");
        Ok(())
    }

    /// Stop the worker pool, drop all jobs and registrations, and close
    /// the transport.
    pub fn shutdown(&mut self) {
        self.runner.shutdown();
        self.registry = ClientRegistry::new();
        self.socket.close();
    }
}

/// Process one inbound payload for `identity` and produce the serialized
/// reply, if any. A valid handshake registers the client and is not
/// replied to; everything else is answered, with `ERROR_INVALID_INPUT`
/// when the payload cannot be understood or the capability check fails.
fn dispatch(
    registry: &mut ClientRegistry,
    runner: &AlgoRunner,
    identity: &[u8],
    payload: &[u8],
    log: &Logger,
) -> Option<Vec<u8>> {
    let client = String::from_utf8_lossy(identity).into_owned();

    let exec_caps = match registry.lookup(identity) {
        None => {
            // First frame from this identity: it must be a handshake.
            match protocol::from_payload::<FirstHandshake>(payload) {
                Ok(hs) => {
                    let exec_caps = (hs.exec_functions & 0xff) as u8;
                    if caps::verify_exec_caps(exec_caps) {
                        info!(log, "registered client";
                            "client" => client,
                            "name" => hs.client_name,
                            "caps" => exec_caps);
                        registry.register(identity, exec_caps);
                        return None;
                    }
                    warn!(log, "handshake with invalid capabilities";
                        "client" => client, "caps" => exec_caps);
                }
                Err(e) => {
                    warn!(log, "unregistered client sent junk";
                        "client" => client, "err" => %e);
                }
            }
            let resp = EnvelopeResp::Submit(SubmitResponse::error(
                Status::ErrorInvalidInput,
            ));
            return encode_reply(&resp, log);
        }
        Some(exec_caps) => exec_caps,
    };

    let resp = match protocol::from_payload::<EnvelopeReq>(payload) {
        Ok(EnvelopeReq::Submit(req)) => {
            if exec_caps & caps::required_cap(&req.op) == 0 {
                debug!(log, "capability denied"; "client" => client);
                EnvelopeResp::Submit(SubmitResponse::error(
                    Status::ErrorInvalidInput,
                ))
            } else {
                EnvelopeResp::Submit(runner.submit(&req))
            }
        }
        Ok(EnvelopeReq::Get(req)) => EnvelopeResp::Get(runner.get(&req)),
        Err(e) => {
            warn!(log, "failed to parse request envelope";
                "client" => client, "err" => %e);
            EnvelopeResp::Submit(SubmitResponse::error(
                Status::ErrorInvalidInput,
            ))
        }
    };

    encode_reply(&resp, log)
}

/// Serialize a response envelope. A serialization failure aborts only the
/// current exchange; the client may retry.
fn encode_reply(resp: &EnvelopeResp, log: &Logger) -> Option<Vec<u8>> {
    match protocol::to_payload(resp) {
        Ok(buf) => Some(buf),
        Err(e) => {
            error!(log, "failed to serialize response"; "err" => %e);
            None
        }
    }
}
