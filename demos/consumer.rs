//! Demo subscriber: polls one consumer id, verifies sequence continuity and
//! reports delivery-latency quantiles (`now - frame.timestamp_ns`).

use clap::Parser;
use shmq::{monotonic_ns, Frame, MessageQueue, MessageType, Percentiles, QueueOptions};

#[derive(Parser, Debug)]
#[command(version, about = "Consumes market-data frames from a shared-memory queue", long_about = None)]
struct Args {
    /// Queue segment name, which must begin with '/'.
    #[arg(short = 'q', long = "queue", default_value = "/market_data_queue")]
    queue: String,

    /// Number of slots in the ring; must match the producer.
    #[arg(long, default_value_t = 1024)]
    capacity: u32,

    /// Maximum payload bytes per message; must match the producer.
    #[arg(long = "max-payload", default_value_t = 64)]
    max_payload: u32,

    /// Number of independent consumers the queue carries; must match.
    #[arg(short = 'c', long = "consumers", default_value_t = 1)]
    consumers: u32,

    /// Which consumer tail this process drives.
    #[arg(short = 'i', long = "consumer-id", default_value_t = 0)]
    consumer_id: u32,

    /// Number of messages to consume before reporting.
    #[arg(short = 'n', long, default_value_t = 100_000)]
    count: u64,

    /// Pin the consumer thread to this CPU core.
    #[arg(long)]
    core: Option<usize>,
}

fn main() -> shmq::Result<()> {
    let args = Args::parse();

    if let Some(core) = args.core {
        pin_to_core(core);
    }

    let queue = MessageQueue::new(
        &args.queue,
        QueueOptions::new(args.capacity, args.max_payload, args.consumers),
    )?;

    println!(
        "consumer {} polling {} for {} frames",
        args.consumer_id, args.queue, args.count
    );

    let mut delivery = Percentiles::with_capacity(args.count as usize);
    let mut buf = vec![0u8; queue.slot_size() as usize];
    let mut prev_sequence: Option<u64> = None;
    let mut received = 0u64;

    while received < args.count {
        if !queue.consume(args.consumer_id, &mut buf)? {
            std::hint::spin_loop();
            continue;
        }
        let now = monotonic_ns();
        let frame = Frame::decode(&buf)?;
        delivery.record(now.saturating_sub(frame.timestamp_ns()));

        if let Some(prev) = prev_sequence {
            if frame.sequence() != prev + 1 {
                // The queue never drops; a jump here means the producer
                // restarted and its session counter began again at 0.
                println!(
                    "sequence discontinuity: {} after {} (producer restart?)",
                    frame.sequence(),
                    prev
                );
            }
        }
        prev_sequence = Some(frame.sequence());

        if received == 0 && frame.message_type() == MessageType::MarketData {
            print_market_data(&frame);
        }
        received += 1;
    }

    println!("{}", delivery.summary("delivery_ns"));
    Ok(())
}

/// Decodes the producer demo's packed market-data payload.
fn print_market_data(frame: &Frame) {
    let p = frame.payload();
    if p.len() < 36 {
        return;
    }
    let symbol = String::from_utf8_lossy(&p[..16]);
    let price = f64::from_ne_bytes(p[16..24].try_into().unwrap());
    let volume = u32::from_ne_bytes(p[24..28].try_into().unwrap());
    println!(
        "first frame: seq {} symbol {} price {:.2} volume {}",
        frame.sequence(),
        symbol.trim_end_matches('\0'),
        price,
        volume
    );
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
