// Copyright 2020 Joyent, Inc.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Error, ErrorKind, Write};
use std::net::ToSocketAddrs;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use slog::{o, Drain, Logger};

use ticket_rpc::caps;
use ticket_rpc::client::ClientSession;
use ticket_rpc::protocol::{
    GetResponse, GetWaitMode, MathArgs, MathOp, OpArgs, ResultValue, Status,
    StrArgs, StrOp, SubmitResponse, Ticket,
};

static APP: &'static str = "ticketcall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
static DEFAULT_CAPS: &'static str = "add,sub,mult,div,concat,find";
const DEFAULT_PORT: u32 = 24737;
const DEFAULT_TIMEOUT_MS: u32 = 3000;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Interactive command-line client for a Ticket RPC server")
        .version(crate_version!())
        .arg(
            Arg::with_name("address")
                .help("DNS name or IP address for remote server")
                .long("address")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 24737)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Receive timeout in milliseconds (Default: 3000)")
                .long("timeout-ms")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("caps")
                .help("Comma-separated operations this client may request")
                .long("caps")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("logging")
                .help("Directory to save the logging file")
                .long("logging")
                .short("l")
                .takes_value(true),
        )
        .get_matches()
}

fn make_logger(logging_dir: Option<&str>) -> Result<Logger, Error> {
    match logging_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(dir).join("log.txt"))?;
            let plain = slog_term::PlainSyncDecorator::new(file);
            Ok(Logger::root(
                Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
                o!("build-id" => crate_version!()),
            ))
        }
        None => {
            let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
            Ok(Logger::root(
                Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
                o!("build-id" => crate_version!()),
            ))
        }
    }
}

fn parse_caps(list: &str) -> Result<u8, String> {
    let mut exec_caps = 0u8;
    for name in list.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        match caps::cap_by_name(name) {
            Some(flag) => exec_caps |= flag,
            None => return Err(format!("Unknown capability: {}", name)),
        }
    }
    if !caps::verify_exec_caps(exec_caps) {
        return Err(String::from("Capability list must name at least one operation"));
    }
    Ok(exec_caps)
}

fn is_block_token(s: &str) -> bool {
    let s = s.to_ascii_lowercase();
    s == "block" || s == "blocking" || s == "sync"
}

fn is_nonblock_token(s: &str) -> bool {
    let s = s.to_ascii_lowercase();
    s == "non-block" || s == "nonblock" || s == "non_block" || s == "async"
}

fn math_op(name: &str) -> Option<MathOp> {
    match name.to_ascii_lowercase().as_str() {
        "add" => Some(MathOp::Add),
        "sub" => Some(MathOp::Sub),
        "mult" => Some(MathOp::Mul),
        "div" => Some(MathOp::Div),
        _ => None,
    }
}

fn status_name(status: Status) -> String {
    match serde_json::to_value(&status) {
        Ok(serde_json::Value::String(name)) => name,
        _ => String::from("UNKNOWN"),
    }
}

fn print_result(result: &ResultValue) {
    match result {
        ResultValue::IntResult(value) => println!("Result: Int={}", value),
        ResultValue::Position(pos) => println!("Result: Pos={}", pos),
        ResultValue::StrResult(s) => println!("Result: Str={}", s),
    }
}

fn print_submit(resp: &SubmitResponse) {
    if resp.status != Status::Success && resp.status != Status::NotFinished {
        println!("Status: {}", status_name(resp.status));
    }
    if let Some(ticket) = resp.ticket {
        println!("ticket={}", ticket.req_id);
    }
    if let Some(ref result) = resp.result {
        print_result(result);
    }
}

fn print_get(resp: &GetResponse) {
    match resp.result {
        Some(ref result) => print_result(result),
        None => println!("Status: {}", status_name(resp.status)),
    }
}

fn print_help() {
    println!(
        "Commands:\n\
         \x20 block/non-block add a b        \n\
         \x20 block/non-block sub a b        \n\
         \x20 block/non-block mult a b       \n\
         \x20 block/non-block div a b        \n\
         \x20 block/non-block concat s1 s2   \n\
         \x20 block/non-block find hay needle\n\
         \x20 get ticket [timeout_ms]        \n\
         \x20 pending                        \n\
         \x20 quit | exit"
    );
}

fn is_timeout(e: &Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
}

fn handle_submit(
    session: &mut ClientSession,
    nonblocking: bool,
    op: OpArgs,
) {
    let result = if nonblocking {
        session.submit_nonblocking(op)
    } else {
        session.submit_blocking(op)
    };
    match result {
        Ok(resp) => print_submit(&resp),
        Err(ref e) if is_timeout(e) => println!("Timeout or receive error"),
        Err(e) => println!("Error sending request: {}", e),
    }
}

fn handle_get(session: &mut ClientSession, tokens: &[&str]) {
    let req_id = match tokens.get(1).and_then(|t| t.parse::<u64>().ok()) {
        Some(req_id) => req_id,
        None => {
            println!("Usage: get ticket [timeout_ms]");
            return;
        }
    };
    let (wait_mode, timeout_ms) = match tokens.get(2) {
        Some(t) => match t.parse::<u32>() {
            Ok(timeout_ms) => (GetWaitMode::WaitUpTo, timeout_ms),
            Err(_) => {
                println!("Usage: get ticket [timeout_ms]");
                return;
            }
        },
        None => (GetWaitMode::NoWait, 0),
    };

    match session.get_result(Ticket { req_id }, wait_mode, timeout_ms) {
        Ok(resp) => print_get(&resp),
        Err(ref e) if is_timeout(e) => println!("Timeout or receive error"),
        Err(e) => println!("Error sending request: {}", e),
    }
}

fn command_loop(session: &mut ClientSession, stop: &AtomicBool) {
    println!("Client started. Type 'help' for commands.");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    while !stop.load(Ordering::Relaxed) {
        print!(">> ");
        let _ = io::stdout().flush();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let command = tokens[0].to_ascii_lowercase();
        match command.as_str() {
            "quit" | "exit" => break,
            "help" => {
                print_help();
                continue;
            }
            "pending" => {
                for ticket in session.pending_tickets() {
                    println!("ticket={}", ticket.req_id);
                }
                continue;
            }
            "get" => {
                handle_get(session, &tokens);
                continue;
            }
            _ => (),
        }

        let nonblocking = is_nonblock_token(tokens[0]);
        if !nonblocking && !is_block_token(tokens[0]) {
            println!("First token must be 'block' or 'non-block'");
            continue;
        }
        if tokens.len() < 2 {
            println!("Bad Command. Type 'help'");
            continue;
        }

        let op_name = tokens[1].to_ascii_lowercase();
        if let Some(op) = math_op(&op_name) {
            let args: Option<(i32, i32)> = match (tokens.get(2), tokens.get(3))
            {
                (Some(a), Some(b)) => {
                    a.parse().ok().and_then(|a| b.parse().ok().map(|b| (a, b)))
                }
                _ => None,
            };
            match args {
                Some((a, b)) => handle_submit(
                    session,
                    nonblocking,
                    OpArgs::Math(MathArgs { op, a, b }),
                ),
                None => {
                    println!("Usage: {} {} a b", tokens[0], op_name)
                }
            }
        } else if op_name == "concat" || op_name == "find" {
            match (tokens.get(2), tokens.get(3)) {
                (Some(s1), Some(s2)) => {
                    let op = if op_name == "concat" {
                        StrOp::Concat
                    } else {
                        StrOp::FindStart
                    };
                    handle_submit(
                        session,
                        nonblocking,
                        OpArgs::Str(StrArgs {
                            op,
                            s1: String::from(*s1),
                            s2: String::from(*s2),
                        }),
                    );
                }
                _ => println!("Usage: {} {} s1 s2", tokens[0], op_name),
            }
        } else {
            println!("Unknown op. Type 'help'");
        }
    }
    println!("Exiting...");
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let host =
        String::from(matches.value_of("address").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let timeout_ms =
        value_t!(matches, "timeout", u32).unwrap_or(DEFAULT_TIMEOUT_MS);
    let exec_caps =
        parse_caps(matches.value_of("caps").unwrap_or(DEFAULT_CAPS))
            .unwrap_or_else(|e| {
                eprintln!("{}", e);
                process::exit(1)
            });

    let root_log = make_logger(matches.value_of("logging"))
        .unwrap_or_else(|e| {
            eprintln!("Failed to set up logging: {}", e);
            process::exit(1)
        });

    let stop = Arc::new(AtomicBool::new(false));
    for signal in &[SIGINT, SIGTERM] {
        flag::register(*signal, Arc::clone(&stop)).unwrap_or_else(|e| {
            eprintln!("Failed to register signal handler: {}", e);
            process::exit(1)
        });
    }

    let addr = (host.as_str(), port as u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .unwrap_or_else(|| {
            eprintln!("Failed to resolve {}:{}", host, port);
            process::exit(1)
        });

    let mut session =
        ClientSession::connect(&addr, APP, exec_caps, timeout_ms, Some(&root_log))
            .unwrap_or_else(|e| {
                eprintln!("Failed to connect to server: {}", e);
                process::exit(1)
            });

    command_loop(&mut session, &stop);
}
