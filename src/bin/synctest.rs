//! Measure the clock offset to a room server: send a few sync bursts and
//! print every sample plus the selected offset.

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use rallysync::clock_sync::ClockSynchronizer;
use rallysync::net;
use rallysync::protocol::{parse_server_message, ClientMessage, ServerMessage};
use rallysync::session::SessionEvent;
use rallysync::traits::{SystemWallClock, Transport, WallClock};

#[derive(Parser, Debug)]
#[command(author, version, about = "Clock offset probe for a rally room server")]
struct Args {
    #[arg(short, long, default_value = "ws://localhost:8787")]
    server: String,

    #[arg(short, long, default_value = "SYNCTEST")]
    room: String,

    /// Number of bursts
    #[arg(short, long, default_value_t = 3)]
    bursts: usize,

    /// Requests per burst
    #[arg(long, default_value_t = 6)]
    count: usize,

    /// Milliseconds between requests inside a burst
    #[arg(long, default_value_t = 250)]
    spacing_ms: u64,

    /// Print one JSON object instead of a table
    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("warn"));
    let args = Args::parse();

    let url = net::room_url(&args.server, &args.room)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = net::connect(&url, tx).await?;
    let clock = SystemWallClock;
    let mut sync = ClockSynchronizer::new();

    if !args.json {
        println!("=== Room Clock Sync Test ===\n");
        println!("{:>4} {:>12} {:>10}", "#", "Offset (ms)", "RTT (ms)");
        println!("{}", "-".repeat(30));
    }

    let mut seen = 0;
    for _ in 0..args.bursts {
        for _ in 0..args.count {
            let t0 = clock.now_ms();
            conn.transport.send(ClientMessage::TimeSyncRequest { t0 }.encode(&args.room)?)?;
            sleep(Duration::from_millis(args.spacing_ms)).await;
        }

        // Drain whatever replies have arrived, waiting briefly for stragglers.
        while let Ok(Some(event)) = timeout(Duration::from_millis(500), rx.recv()).await {
            let text = match event {
                SessionEvent::Message(text) => text,
                SessionEvent::Disconnected => bail!("Server closed the connection"),
                _ => continue,
            };
            if let Some(ServerMessage::TimeSyncResponse(reply)) = parse_server_message(&text) {
                let (t0, t1, t2) = reply.timestamps();
                if let Some(sample) = sync.record_exchange(t0, t1, t2, clock.now_ms()) {
                    seen += 1;
                    if !args.json {
                        println!("{:>4} {:>12.1} {:>10.1}", seen, sample.offset_ms, sample.rtt_ms);
                    }
                }
            }
        }
    }
    conn.reader.abort();

    let status = sync.status(clock.now_ms());
    if args.json {
        let samples: Vec<_> = sync
            .samples()
            .map(|s| json!({"offsetMs": s.offset_ms, "rttMs": s.rtt_ms, "at": s.at_ts}))
            .collect();
        println!(
            "{}",
            json!({
                "received": seen,
                "offsetMs": status.offset_ms,
                "rttMs": status.rtt_ms,
                "live": status.live,
                "window": samples,
            })
        );
    } else {
        println!("\nReceived {} replies", seen);
        println!("{}", status.summary());
    }

    if seen == 0 {
        bail!("No time sync replies received");
    }
    Ok(())
}
