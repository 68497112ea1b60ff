// Copyright 2020 Joyent, Inc.

//! This module provides the interface for creating Ticket clients.
//!
//! A client owns a dealer socket with a random routing identity, sends a
//! `FirstHandshake` advertising its capability bitmask once on connect,
//! and then issues submissions and retrievals. Tickets returned for
//! non-blocking submissions are tracked locally until a retrieval
//! observes a terminal status.

use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::time::Duration;

use rand::distributions::{Alphanumeric, DistString};
use slog::{debug, o, Drain, Logger};

use crate::protocol::{
    self, EnvelopeReq, EnvelopeResp, FirstHandshake, GetRequest, GetResponse,
    GetWaitMode, OpArgs, SubmitMode, SubmitRequest, SubmitResponse, Ticket,
};
use crate::transport::DealerSocket;

/// The minimum routing identity length.
pub const IDENTITY_LEN: usize = 8;

/// Generate a random alphanumeric routing identity.
pub fn random_identity(len: usize) -> Vec<u8> {
    Alphanumeric
        .sample_string(&mut rand::thread_rng(), len)
        .into_bytes()
}

/// A connected client session.
pub struct ClientSession {
    socket: DealerSocket,
    pending: HashMap<u64, Ticket>,
    log: Logger,
}

impl ClientSession {
    /// Connect to a server and perform the capability handshake. A
    /// `receive_timeout_ms` of zero disables the receive deadline.
    pub fn connect(
        addr: &SocketAddr,
        client_name: &str,
        exec_caps: u8,
        receive_timeout_ms: u32,
        log: Option<&Logger>,
    ) -> Result<ClientSession, Error> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let receive_timeout = if receive_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(u64::from(receive_timeout_ms)))
        };

        let identity = random_identity(IDENTITY_LEN);
        let mut socket = DealerSocket::connect(addr, identity, receive_timeout)?;

        let handshake = FirstHandshake {
            client_name: String::from(client_name),
            exec_functions: u32::from(exec_caps),
        };
        socket.send(&protocol::to_payload(&handshake)?)?;
        debug!(log, "sent handshake";
            "name" => client_name.to_string(), "caps" => exec_caps);

        Ok(ClientSession {
            socket,
            pending: HashMap::new(),
            log,
        })
    }

    /// The session's routing identity.
    pub fn identity(&self) -> &[u8] {
        self.socket.identity()
    }

    /// Submit an operation and block until the server has executed it.
    pub fn submit_blocking(
        &mut self,
        op: OpArgs,
    ) -> Result<SubmitResponse, Error> {
        self.submit(SubmitMode::Blocking, op)
    }

    /// Submit an operation for asynchronous execution. The returned
    /// response carries the ticket, which is also recorded in the local
    /// pending map.
    pub fn submit_nonblocking(
        &mut self,
        op: OpArgs,
    ) -> Result<SubmitResponse, Error> {
        self.submit(SubmitMode::Nonblocking, op)
    }

    fn submit(
        &mut self,
        mode: SubmitMode,
        op: OpArgs,
    ) -> Result<SubmitResponse, Error> {
        let env = EnvelopeReq::Submit(SubmitRequest { mode, op });
        match self.roundtrip(&env)? {
            EnvelopeResp::Submit(resp) => {
                if mode == SubmitMode::Nonblocking {
                    if let Some(ticket) = resp.ticket {
                        debug!(self.log, "recorded pending ticket";
                            "ticket" => ticket.req_id);
                        self.pending.insert(ticket.req_id, ticket);
                    }
                }
                Ok(resp)
            }
            EnvelopeResp::Get(_) => Err(protocol_error("missing submit")),
        }
    }

    /// Retrieve the result for a ticket. Any terminal status removes the
    /// ticket from the local pending map; a transport timeout leaves it
    /// usable for a later retrieval.
    pub fn get_result(
        &mut self,
        ticket: Ticket,
        wait_mode: GetWaitMode,
        timeout_ms: u32,
    ) -> Result<GetResponse, Error> {
        let timeout_ms = match wait_mode {
            GetWaitMode::WaitUpTo => Some(timeout_ms),
            GetWaitMode::NoWait => None,
        };
        let env = EnvelopeReq::Get(GetRequest {
            ticket,
            wait_mode,
            timeout_ms,
        });
        match self.roundtrip(&env)? {
            EnvelopeResp::Get(resp) => {
                if resp.status.is_terminal() {
                    self.pending.remove(&ticket.req_id);
                }
                Ok(resp)
            }
            EnvelopeResp::Submit(_) => Err(protocol_error("missing get")),
        }
    }

    /// The tickets submitted on this session that have not yet been
    /// resolved by a terminal retrieval, in ascending ticket order.
    pub fn pending_tickets(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self.pending.values().copied().collect();
        tickets.sort_by_key(|t| t.req_id);
        tickets
    }

    fn roundtrip(&mut self, env: &EnvelopeReq) -> Result<EnvelopeResp, Error> {
        self.socket.send(&protocol::to_payload(env)?)?;
        let payload = self.socket.recv()?;
        protocol::from_payload(&payload)
    }
}

fn protocol_error(detail: &str) -> Error {
    Error::new(
        ErrorKind::Other,
        format!("Protocol error: {} in response envelope", detail),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use crate::caps::{CAP_ADD, CAP_CONCAT};
    use crate::protocol::{MathArgs, MathOp, ResultValue, Status};
    use crate::server::Server;

    fn identity_charset_is_alphanumeric() -> bool {
        random_identity(64)
            .iter()
            .all(|b| b.is_ascii_alphanumeric())
    }

    #[test]
    fn random_identities() {
        assert_eq!(random_identity(IDENTITY_LEN).len(), IDENTITY_LEN);
        assert!(identity_charset_is_alphanumeric());
        assert_ne!(random_identity(16), random_identity(16));
    }

    #[test]
    fn pending_map_follows_ticket_lifecycle() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = Server::bind(&addr, 2, None).unwrap();
        let server_addr = server.local_addr();

        let stop = Arc::new(AtomicBool::new(false));
        let server_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let result = server.run(&server_stop);
            server.shutdown();
            result
        });

        let mut session = ClientSession::connect(
            &server_addr,
            "pending-test",
            CAP_ADD | CAP_CONCAT,
            5000,
            None,
        )
        .unwrap();

        let resp = session
            .submit_nonblocking(OpArgs::Math(MathArgs {
                op: MathOp::Add,
                a: 40,
                b: 2,
            }))
            .unwrap();
        assert_eq!(resp.status, Status::NotFinished);
        let ticket = resp.ticket.unwrap();
        assert_eq!(session.pending_tickets(), vec![ticket]);

        let get = session
            .get_result(ticket, GetWaitMode::WaitUpTo, 5000)
            .unwrap();
        assert_eq!(get.status, Status::Success);
        assert_eq!(get.result, Some(ResultValue::IntResult(42)));
        assert!(session.pending_tickets().is_empty());

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }
}
