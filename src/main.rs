use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::{
    env::args,
    net::SocketAddr,
    sync::{Arc, atomic::AtomicBool},
};
use tachyon_recv::library::receiver::{self, Receiver};
use tracing::{Level, error, warn};
use tracing_subscriber::fmt;

fn bootstrap_logs(level: Level) {
    fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .compact()
        .with_ansi(true)
        .init();
}

/// Value following `--name`, parsed. A flag given with a value that does
/// not parse is reported and the default is kept.
fn flag<T: std::str::FromStr>(args: &[String], name: &str) -> Option<T> {
    let i = args.iter().position(|arg| arg == name)?;
    let Some(value) = args.get(i + 1) else {
        warn!("{name} given without a value, using the default");
        return None;
    };
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("{name} {value:?} is not valid, using the default");
            None
        }
    }
}

fn main() {
    let args: Vec<String> = args().collect();
    let verbose = args.iter().any(|arg| arg == "--verbose");
    bootstrap_logs(if verbose { Level::TRACE } else { Level::INFO });

    let addr: SocketAddr = flag(&args, "--bind").unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9000)));
    let mut receiver = Receiver::new(addr);
    receiver
        .set_sqpoll_enabled(args.iter().any(|arg| arg == "--sqpoll"))
        .set_realtime(args.iter().any(|arg| arg == "--realtime"));
    if let Some(workers) = flag::<u8>(&args, "--workers") {
        receiver.set_workers(workers);
    }
    if let Some(depth) = flag::<u32>(&args, "--depth") {
        receiver.set_queue_depth(depth);
    }
    if let Some(buffer) = flag::<usize>(&args, "--buffer") {
        receiver.set_buffer_size(buffer);
    }
    if let Some(idle) = flag::<u32>(&args, "--idle-ms") {
        receiver.set_sqpoll_idle(idle);
    }
    if let Some(cq_depth) = flag::<u32>(&args, "--cq-depth") {
        receiver.set_cq_depth(cq_depth);
    }

    if let Err(e) = receiver::run(receiver.build(), Arc::new(AtomicBool::new(false))) {
        error!("receiver error: {e}");
        std::process::exit(1);
    }
}
