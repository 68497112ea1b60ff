// Copyright 2020 Joyent, Inc.

//! The algorithm runner: the façade the router uses to execute
//! submissions and retrieve ticketed results. Blocking submissions run
//! inline on the calling thread; non-blocking submissions are enqueued
//! for the worker pool and answered with a ticket.

use std::io::Error;
use std::sync::Arc;

use slog::{o, Drain, Logger};

use crate::compute;
use crate::jobs::{JobStore, WorkQueue, WorkerPool};
use crate::protocol::{
    GetRequest, GetResponse, GetWaitMode, Status, SubmitMode, SubmitRequest,
    SubmitResponse, Ticket,
};

/// Façade over the job store, work queue, and worker pool.
pub struct AlgoRunner {
    store: Arc<JobStore>,
    queue: Arc<WorkQueue>,
    pool: Option<WorkerPool>,
}

impl AlgoRunner {
    /// Create the runner and start a pool of `threads` workers.
    pub fn new(
        threads: usize,
        log: Option<&Logger>,
    ) -> Result<AlgoRunner, Error> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let store = Arc::new(JobStore::new());
        let queue = Arc::new(WorkQueue::new());
        let pool = WorkerPool::spawn(threads, &queue, &log)?;

        Ok(AlgoRunner {
            store,
            queue,
            pool: Some(pool),
        })
    }

    /// Execute a submission. A `BLOCKING` request runs its kernel on the
    /// calling thread and mints no ticket; a `NONBLOCKING` request is
    /// enqueued and answered `NOT_FINISHED` with the minted ticket.
    pub fn submit(&self, request: &SubmitRequest) -> SubmitResponse {
        match request.mode {
            SubmitMode::Blocking => match compute::execute(&request.op) {
                Ok(value) => SubmitResponse {
                    status: Status::Success,
                    ticket: None,
                    result: Some(value),
                },
                Err(e) => SubmitResponse::error(e.status()),
            },
            SubmitMode::Nonblocking => {
                let job = self.store.insert(request.op.clone());
                let ticket = Ticket { req_id: job.id };
                self.queue.push(job);
                SubmitResponse {
                    status: Status::NotFinished,
                    ticket: Some(ticket),
                    result: None,
                }
            }
        }
    }

    /// Retrieve the result for a ticket. `WAIT_UP_TO` with a zero or
    /// absent timeout is equivalent to `NO_WAIT`.
    pub fn get(&self, request: &GetRequest) -> GetResponse {
        let ticket = request.ticket.req_id;
        match request.wait_mode {
            GetWaitMode::NoWait => self.store.get_nowait(ticket),
            GetWaitMode::WaitUpTo => self
                .store
                .get_wait(ticket, request.timeout_ms.unwrap_or(0)),
        }
    }

    /// The number of jobs currently registered in the store.
    pub fn outstanding(&self) -> usize {
        self.store.len()
    }

    /// Stop the worker pool, wait for it to quiesce, and empty the job
    /// store. Jobs already popped by a worker are completed before the
    /// pool exits.
    pub fn shutdown(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            self.queue.stop();
            pool.join();
        }
        self.store.clear();
    }
}

impl Drop for AlgoRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::protocol::{MathArgs, MathOp, OpArgs, ResultValue, StrArgs, StrOp};

    fn runner() -> AlgoRunner {
        AlgoRunner::new(2, None).unwrap()
    }

    fn submit_req(mode: SubmitMode, op: OpArgs) -> SubmitRequest {
        SubmitRequest { mode, op }
    }

    fn add_op(a: i32, b: i32) -> OpArgs {
        OpArgs::Math(MathArgs {
            op: MathOp::Add,
            a,
            b,
        })
    }

    #[test]
    fn blocking_submit_runs_inline() {
        let r = runner();
        let resp = r.submit(&submit_req(SubmitMode::Blocking, add_op(40, 2)));
        assert_eq!(resp.status, Status::Success);
        assert_eq!(resp.result, Some(ResultValue::IntResult(42)));
        assert!(resp.ticket.is_none());
        assert_eq!(r.outstanding(), 0);
    }

    #[test]
    fn blocking_submit_surfaces_kernel_errors() {
        let r = runner();
        let resp = r.submit(&submit_req(
            SubmitMode::Blocking,
            OpArgs::Math(MathArgs {
                op: MathOp::Div,
                a: 10,
                b: 0,
            }),
        ));
        assert_eq!(resp.status, Status::ErrorDivByZero);
        assert!(resp.ticket.is_none());
        assert!(resp.result.is_none());
    }

    #[test]
    fn nonblocking_submit_returns_a_ticket() {
        let r = runner();
        let resp =
            r.submit(&submit_req(SubmitMode::Nonblocking, add_op(40, 2)));
        assert_eq!(resp.status, Status::NotFinished);
        assert!(resp.result.is_none());
        let ticket = resp.ticket.expect("expected a ticket");

        let get = r.get(&GetRequest {
            ticket,
            wait_mode: GetWaitMode::WaitUpTo,
            timeout_ms: Some(5000),
        });
        assert_eq!(get.status, Status::Success);
        assert_eq!(get.result, Some(ResultValue::IntResult(42)));
    }

    #[test]
    fn nonblocking_matches_blocking_result() {
        let r = runner();
        let op = OpArgs::Str(StrArgs {
            op: StrOp::Concat,
            s1: String::from("hello"),
            s2: String::from("world"),
        });

        let blocking =
            r.submit(&submit_req(SubmitMode::Blocking, op.clone()));

        let resp = r.submit(&submit_req(SubmitMode::Nonblocking, op));
        let get = r.get(&GetRequest {
            ticket: resp.ticket.unwrap(),
            wait_mode: GetWaitMode::WaitUpTo,
            timeout_ms: Some(5000),
        });

        assert_eq!(get.status, blocking.status);
        assert_eq!(get.result, blocking.result);
    }

    #[test]
    fn get_unknown_ticket_is_invalid_input() {
        let r = runner();
        let get = r.get(&GetRequest {
            ticket: Ticket { req_id: 7 },
            wait_mode: GetWaitMode::NoWait,
            timeout_ms: None,
        });
        assert_eq!(get.status, Status::ErrorInvalidInput);
    }

    #[test]
    fn consumed_ticket_is_unknown() {
        let r = runner();
        let resp =
            r.submit(&submit_req(SubmitMode::Nonblocking, add_op(1, 2)));
        let ticket = resp.ticket.unwrap();

        let first = r.get(&GetRequest {
            ticket,
            wait_mode: GetWaitMode::WaitUpTo,
            timeout_ms: Some(5000),
        });
        assert_eq!(first.status, Status::Success);

        let second = r.get(&GetRequest {
            ticket,
            wait_mode: GetWaitMode::NoWait,
            timeout_ms: None,
        });
        assert_eq!(second.status, Status::ErrorInvalidInput);
    }

    #[test]
    fn wait_up_to_without_timeout_is_no_wait() {
        let r = runner();
        let resp =
            r.submit(&submit_req(SubmitMode::Nonblocking, add_op(1, 2)));
        let ticket = resp.ticket.unwrap();

        // Either the pool already finished the job or the get returns
        // NOT_FINISHED without blocking; both are legal here.
        let get = r.get(&GetRequest {
            ticket,
            wait_mode: GetWaitMode::WaitUpTo,
            timeout_ms: None,
        });
        assert!(
            get.status == Status::Success
                || get.status == Status::NotFinished
        );
    }

    #[test]
    fn shutdown_empties_the_store() {
        let mut r = runner();
        for i in 0..10 {
            r.submit(&submit_req(SubmitMode::Nonblocking, add_op(i, i)));
        }
        r.shutdown();
        assert_eq!(r.outstanding(), 0);
    }
}
