//! Prints the header of a live queue segment without disturbing it.

use clap::Parser;
use shmq::{probe_header, FRAME_HEADER_BYTES};

#[derive(Parser, Debug)]
#[command(version, about = "Inspects a shared-memory queue segment header", long_about = None)]
struct Args {
    /// Queue segment name, which must begin with '/'.
    #[arg(default_value = "/market_data_queue")]
    queue: String,
}

fn main() {
    let args = Args::parse();

    match probe_header(&args.queue) {
        Some(info) => {
            println!("segment        {}", args.queue);
            println!("byte size      {}", info.byte_size);
            if info.capacity == 0 {
                println!("state          uninitialized (no attacher has written the header yet)");
                return;
            }
            println!("capacity       {} slots", info.capacity);
            println!("slot size      {} bytes", info.slot_size);
            println!(
                "max payload    {} bytes",
                (info.slot_size as usize).saturating_sub(FRAME_HEADER_BYTES)
            );
            println!("consumers      {}", info.num_consumers);
        }
        None => {
            eprintln!("no segment named {} (or it is too small to carry a header)", args.queue);
            std::process::exit(1);
        }
    }
}
