use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Test client for the sockmux echo server")]
struct Args {
    /// Server port
    #[arg(short, long, default_value_t = 9900)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send a few messages and verify the echoes (default)
    Smoke,
    /// Send 1000 pipelined messages and verify the echoed stream
    Pipeline,
    /// Benchmark echo throughput with concurrent pipelined connections
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Messages per connection
        #[arg(short, long, default_value_t = 100_000)]
        messages: usize,
        /// Message size in bytes
        #[arg(short, long, default_value_t = 64)]
        size: usize,
    },
}

fn pattern(seq: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seq.wrapping_mul(31) + i) as u8).collect()
}

fn expect_echo(stream: &mut TcpStream, sent: &[u8]) {
    let mut echoed = vec![0u8; sent.len()];
    stream
        .read_exact(&mut echoed)
        .expect("connection closed before the echo arrived");
    assert_eq!(echoed, sent, "echo does not match what was sent");
}

fn main() {
    let args = Args::parse();
    let addr = format!("127.0.0.1:{}", args.port);

    match args.command.unwrap_or(Command::Smoke) {
        Command::Smoke => smoke_test(&addr),
        Command::Pipeline => pipeline_test(&addr),
        Command::Bench {
            connections,
            messages,
            size,
        } => bench_test(&addr, connections, messages, size),
    }
}

fn smoke_test(addr: &str) {
    eprintln!("smoke test: connecting to {}", addr);
    let mut stream = TcpStream::connect(addr).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for (seq, len) in [1usize, 16, 1500, 60_000].into_iter().enumerate() {
        let msg = pattern(seq, len);
        stream.write_all(&msg).expect("failed to write");
        expect_echo(&mut stream, &msg);
        eprintln!("  {:>6} bytes: OK", len);
    }
    eprintln!("smoke test: passed");
}

fn pipeline_test(addr: &str) {
    const COUNT: usize = 1000;
    eprintln!("pipeline test: {} messages to {}", COUNT, addr);
    let stream = TcpStream::connect(addr).expect("failed to connect");
    stream.set_nodelay(true).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut writer = stream.try_clone().expect("clone failed");
    let mut reader = stream;
    let messages: Vec<Vec<u8>> = (0..COUNT).map(|seq| pattern(seq, 1 + seq % 97)).collect();
    let expected: Vec<u8> = messages.concat();

    let write_handle = std::thread::spawn(move || {
        for msg in &messages {
            writer.write_all(msg).expect("write failed");
        }
    });

    let start = Instant::now();
    expect_echo(&mut reader, &expected);
    write_handle.join().expect("writer panicked");
    eprintln!(
        "pipeline test: {} bytes echoed in order in {:.1}ms",
        expected.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
}

fn bench_test(addr: &str, num_connections: usize, messages_per_conn: usize, size: usize) {
    eprintln!(
        "bench: {} connections x {} messages x {} bytes → {}",
        num_connections, messages_per_conn, size, addr
    );
    let msg = pattern(0, size.max(1));

    let start = Instant::now();

    let handles: Vec<_> = (0..num_connections)
        .map(|_| {
            let addr = addr.to_string();
            let msg = msg.clone();
            std::thread::spawn(move || {
                let stream = TcpStream::connect(&addr).expect("failed to connect");
                stream.set_nodelay(true).unwrap();

                let mut writer = stream.try_clone().expect("clone failed");
                let mut reader = stream;

                let write_handle = std::thread::spawn(move || {
                    for _ in 0..messages_per_conn {
                        writer.write_all(&msg).expect("write failed");
                    }
                });

                let mut buf = vec![0u8; 64 * 1024];
                let mut remaining = messages_per_conn * size.max(1);
                while remaining > 0 {
                    let to_read = remaining.min(buf.len());
                    let n = reader.read(&mut buf[..to_read]).expect("read failed");
                    if n == 0 {
                        panic!("connection closed with {} bytes remaining", remaining);
                    }
                    remaining -= n;
                }

                write_handle.join().expect("writer panicked");
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    let elapsed = start.elapsed();
    let total = num_connections * messages_per_conn;
    let bytes = total * size.max(1);
    eprintln!(
        "bench: {} messages in {:.2}s = {:.0} msg/s, {:.1} MB/s",
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64(),
        bytes as f64 / elapsed.as_secs_f64() / 1_000_000.0
    );
}
