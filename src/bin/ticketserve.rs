// Copyright 2020 Joyent, Inc.

use std::fs::{self, OpenOptions};
use std::io::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use slog::{error, info, o, Drain, Logger};

use ticket_rpc::server::Server;

static APP: &'static str = "ticketserve";
const DEFAULT_PORT: u32 = 24737;
const DEFAULT_THREADS: usize = 4;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Ticket RPC server")
        .version(crate_version!())
        .arg(
            Arg::with_name("port")
                .help("TCP port to listen on (Default: 24737)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("threads")
                .help("Number of worker threads (Default: 4)")
                .long("threads")
                .short("t")
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

fn main() {
    let matches = parse_opts(APP.to_string());
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let threads =
        value_t!(matches, "threads", usize).unwrap_or(DEFAULT_THREADS);

    let root_log = make_logger(matches.value_of("logging"))
        .unwrap_or_else(|e| {
            eprintln!("Failed to set up logging: {}", e);
            process::exit(1)
        });
    info!(root_log, "START");

    let stop = Arc::new(AtomicBool::new(false));
    for signal in &[SIGINT, SIGTERM] {
        flag::register(*signal, Arc::clone(&stop)).unwrap_or_else(|e| {
            eprintln!("Failed to register signal handler: {}", e);
            process::exit(1)
        });
    }

    let addr = format!("0.0.0.0:{}", port)
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse listen address: {}", e);
            process::exit(1)
        });

    let mut server = Server::bind(&addr, threads, Some(&root_log))
        .unwrap_or_else(|e| {
            error!(root_log, "failed to initialize server"; "err" => %e);
            process::exit(1)
        });

    if let Err(e) = server.run(&stop) {
        error!(root_log, "server failed"; "err" => %e);
        server.shutdown();
        process::exit(1);
    }

    server.shutdown();
    info!(root_log, "END LOGGING");
}
