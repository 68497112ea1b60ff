// Copyright 2020 Joyent, Inc.

//! Ticket: a small RPC protocol for submitting compute jobs and
//! retrieving their results.
//!
//! A Ticket server listens for TCP connections on a well-known port and
//! executes small compute requests (32-bit integer arithmetic and short
//! string operations) on behalf of many concurrent clients. A request is
//! either *blocking*, executed immediately with the result on the
//! response, or *non-blocking*, in which case the server answers with a
//! 64-bit **ticket** and executes the job on a fixed-size worker pool.
//! The client later redeems the ticket, either polling (`NO_WAIT`) or
//! waiting with a deadline (`WAIT_UP_TO`). A result is delivered exactly
//! once: the first retrieval that observes a terminal status consumes the
//! job, and any further retrieval of the same ticket is an error.
//!
//! Protocol overview
//!
//! Communication consists of discrete *messages*, each a multipart set of
//! frames `[identity | payload]`. The identity frame carries the opaque
//! routing identity of the client connection; the payload frame carries a
//! JSON-encoded envelope. Ticket frames have the following structure:
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * KIND      1-byte integer.  KIND_IDENTITY (0x1) for routing identity
//!           frames and KIND_PAYLOAD (0x2) for envelope frames.
//!
//! * FLAGS     1-byte integer.  Bit 0 (`MORE`) indicates that more frames
//!           follow in the same message.
//!
//! * CRC0...CRC3        4-byte big-endian unsigned integer representing the
//!                     CRC16 value of the frame data
//!
//! * DLEN0...DLEN3      4-byte big-endian unsigned integer representing the
//!                    number of bytes of frame data that follow
//!
//! * DATA0...DATAN      Frame data: raw identity bytes for KIND_IDENTITY,
//!                    a JSON-encoded envelope for KIND_PAYLOAD.
//!
//! ### Capabilities
//!
//! The first payload a client sends after connect must be a
//! `FirstHandshake` naming the client and advertising, in the low byte of
//! `exec_functions`, which of the six operations it will request:
//!
//! | Bit | Flag         | Operation        |
//! | --- | ------------ | ---------------- |
//! | 0   | `ADD`        | `MATH_ADD`       |
//! | 1   | `SUB`        | `MATH_SUB`       |
//! | 2   | `MULT`       | `MATH_MUL`       |
//! | 3   | `DIV`        | `MATH_DIV`       |
//! | 4   | `CONCAT`     | `STR_CONCAT`     |
//! | 5   | `FIND_START` | `STR_FIND_START` |
//!
//! A valid handshake is not replied to. Every subsequent submission is
//! authorised against the registered bitmask; a submission whose required
//! flag is missing is answered `ERROR_INVALID_INPUT` and never executed.
//!
//! ### Messaging scenarios
//!
//! **Client submits a blocking request.** The server runs the kernel on
//! the router thread and replies with a `SubmitResponse` carrying
//! `SUCCESS` and the result value, or an error status. No ticket is
//! minted.
//!
//! **Client submits a non-blocking request.** The server enqueues a job
//! for the worker pool and immediately replies `NOT_FINISHED` with the
//! minted ticket.
//!
//! **Client retrieves a ticket.** A `GetRequest` names the ticket and a
//! wait mode. While the job is pending, `NO_WAIT` (and an expired
//! `WAIT_UP_TO`) answers `NOT_FINISHED` and the job is retained. The
//! first retrieval after completion carries the terminal status and
//! result and removes the job; retrieving the same ticket again is
//! answered `ERROR_INVALID_INPUT`.
//!
//! ### Status
//!
//! | Status value             | Description |
//! | ------------------------ | ----------- |
//! | `SUCCESS`                | The operation completed and the result is attached. |
//! | `NOT_FINISHED`           | The job is still pending; not an error. |
//! | `ERROR_INVALID_INPUT`    | Malformed envelope, unknown operation, capability denied, or unknown ticket. |
//! | `ERROR_DIV_BY_ZERO`      | `MATH_DIV` with a zero divisor. |
//! | `ERROR_SUBSTR_NOT_FOUND` | `STR_FIND_START` with an absent needle. |
//! | `ERROR_STRING_TOO_LONG`  | `STR_CONCAT` result longer than 32 octets. |
//! | `ERROR_INTERNAL`         | Unexpected server-side failure. |

#![allow(missing_docs)]

pub mod caps;
pub mod client;
pub mod compute;
pub mod jobs;
pub mod protocol;
pub mod runner;
pub mod server;
pub mod transport;
