//! Demo publisher: streams market-data frames into a shared-memory queue
//! and reports publish-latency quantiles.
//!
//! Run alongside one `consumer` per consumer id:
//!
//! ```text
//! cargo run --release --example producer -- --consumers 2
//! cargo run --release --example consumer -- --consumers 2 --consumer-id 0
//! cargo run --release --example consumer -- --consumers 2 --consumer-id 1
//! ```

use clap::Parser;
use shmq::{monotonic_ns, MessageQueue, MessageType, Percentiles, QueueOptions};

/// Packed market-data payload: symbol[16], price f64, volume u32,
/// exchange timestamp u64: 36 bytes in total, host-endian. The consumer demo
/// decodes the same offsets.
const MARKET_DATA_BYTES: usize = 36;

fn market_data(symbol: &str, price: f64, volume: u32, exchange_ts: u64) -> [u8; MARKET_DATA_BYTES] {
    let mut buf = [0u8; MARKET_DATA_BYTES];
    let sym = symbol.as_bytes();
    buf[..sym.len().min(16)].copy_from_slice(&sym[..sym.len().min(16)]);
    buf[16..24].copy_from_slice(&price.to_ne_bytes());
    buf[24..28].copy_from_slice(&volume.to_ne_bytes());
    buf[28..36].copy_from_slice(&exchange_ts.to_ne_bytes());
    buf
}

#[derive(Parser, Debug)]
#[command(version, about = "Publishes market-data frames to a shared-memory queue", long_about = None)]
struct Args {
    /// Queue segment name, which must begin with '/'.
    #[arg(short = 'q', long = "queue", default_value = "/market_data_queue")]
    queue: String,

    /// Number of slots in the ring.
    #[arg(long, default_value_t = 1024)]
    capacity: u32,

    /// Maximum payload bytes per message.
    #[arg(long = "max-payload", default_value_t = 64)]
    max_payload: u32,

    /// Number of independent consumers the queue carries.
    #[arg(short = 'c', long = "consumers", default_value_t = 1)]
    consumers: u32,

    /// Number of messages to publish.
    #[arg(short = 'n', long, default_value_t = 100_000)]
    count: u64,

    /// Minimum period between messages in nanoseconds; 0 disables throttling.
    #[arg(short = 'p', long = "period", default_value_t = 0)]
    period: u64,

    /// Unlink any existing segment with this name and start fresh.
    #[arg(long = "force-recreate")]
    force_recreate: bool,

    /// Pin the publisher thread to this CPU core.
    #[arg(long)]
    core: Option<usize>,
}

fn main() -> shmq::Result<()> {
    let args = Args::parse();

    if let Some(core) = args.core {
        pin_to_core(core);
    }

    let mut options = QueueOptions::new(args.capacity, args.max_payload, args.consumers);
    options.force_recreate = args.force_recreate;
    let queue = MessageQueue::new(&args.queue, options)?;

    println!(
        "publishing {} frames to {} (capacity {}, slot {} bytes, {} consumers)",
        args.count,
        args.queue,
        queue.capacity(),
        queue.slot_size(),
        queue.num_consumers()
    );

    let mut publish = Percentiles::with_capacity(args.count as usize);
    let mut deadline = monotonic_ns();

    for i in 0..args.count {
        let payload = market_data(
            "TEST",
            100.0 + (i % 100) as f64 / 100.0,
            100 + (i % 900) as u32,
            monotonic_ns(),
        );

        let t0 = monotonic_ns();
        while !queue.produce(MessageType::MarketData, &payload)? {
            // Full: the slowest consumer pins the oldest slot. Spin until it
            // catches up; dropping is the consumer's prerogative, not ours.
            std::hint::spin_loop();
        }
        publish.record(monotonic_ns() - t0);

        if args.period > 0 {
            deadline += args.period;
            while monotonic_ns() < deadline {
                std::hint::spin_loop();
            }
        }
    }

    println!("{}", publish.summary("publish_ns"));
    Ok(())
}

fn pin_to_core(core: usize) {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    match cores.into_iter().find(|c| c.id == core) {
        Some(id) => {
            core_affinity::set_for_current(id);
        }
        None => eprintln!("core {} not available, running unpinned", core),
    }
}
