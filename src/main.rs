use std::net::{Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sockmux::config::{DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE, LISTEN_BACKLOG};
use sockmux::{BackpressurePolicy, EngineConfig, Socket, SocketHandler, SocketMgr, metrics};

#[derive(Parser)]
#[command(about = "TCP echo server on the sockmux connection engine")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9900)]
    port: u16,

    /// Worker threads pulling from the readiness queue
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// Per-connection inbound buffer (bytes)
    #[arg(long, default_value_t = DEFAULT_READ_BUFFER_SIZE)]
    read_buffer: usize,

    /// Per-connection outbound buffer (bytes)
    #[arg(long, default_value_t = DEFAULT_WRITE_BUFFER_SIZE)]
    write_buffer: usize,

    /// Worker wait timeout; bounds how long shutdown takes
    #[arg(long, default_value_t = 1000)]
    wait_timeout_ms: u64,

    /// What to do with a peer whose output does not fit
    #[arg(long, value_enum, default_value_t = BackpressurePolicy::Drop)]
    backpressure: BackpressurePolicy,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Exit after this many seconds instead of running forever
    #[arg(long)]
    run_for: Option<u64>,
}

/// Copies everything it reads back to the peer. Input that does not fit in
/// the write buffer waits in the read buffer until the output drains.
struct Echo;

impl Echo {
    fn pump(&self, socket: &Socket) {
        let mut input = socket.read_buffer();
        let mut burst = socket.burst_begin();
        while !input.is_empty() && burst.available() > 0 {
            let chunk = input.filled();
            let n = chunk.len().min(burst.available());
            if burst.send(&chunk[..n]).is_err() {
                break;
            }
            input.consume(n);
        }
        if burst.writable() {
            burst.push();
        }
    }
}

impl SocketHandler for Echo {
    fn on_connect(&self, socket: &Socket) {
        info!(peer = ?socket.peer(), fd = socket.raw_fd(), "client connected");
    }

    fn on_read(&self, socket: &Socket) {
        self.pump(socket);
    }

    fn on_drained(&self, socket: &Socket) {
        self.pump(socket);
    }

    fn on_disconnect(&self, socket: &Socket) {
        info!(peer = ?socket.peer(), fd = socket.raw_fd(), "client disconnected");
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sockmux={level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .compact(),
        )
        .init();
}

fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);
    metrics::spawn_reporter();

    let config = EngineConfig {
        read_buffer_size: args.read_buffer,
        write_buffer_size: args.write_buffer,
        wait_timeout: Duration::from_millis(args.wait_timeout_ms),
        listen_backlog: LISTEN_BACKLOG,
        backpressure: args.backpressure,
        ..EngineConfig::default()
    };

    // Nothing works without the readiness queue.
    let mgr = match SocketMgr::new(config) {
        Ok(mgr) => mgr,
        Err(err) => {
            error!(%err, "cannot start socket manager");
            std::process::exit(1);
        }
    };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let listener = match mgr.listen(addr, |_: &SocketAddr| {
        Some(Box::new(Echo) as Box<dyn SocketHandler>)
    }) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, %err, "cannot listen");
            std::process::exit(1);
        }
    };

    for _ in 0..args.workers.max(1) {
        if let Err(err) = mgr.spawn_worker_threads() {
            error!(%err, "cannot start worker");
            std::process::exit(1);
        }
    }

    info!(
        addr = %listener.local_addr(),
        workers = mgr.worker_count(),
        poller = mgr.poller_name(),
        "sockmux: ready"
    );

    match args.run_for {
        Some(secs) => thread::sleep(Duration::from_secs(secs)),
        None => loop {
            thread::park();
        },
    }

    mgr.shutdown();
    info!("sockmux: stopped");
}
