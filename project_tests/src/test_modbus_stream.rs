use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use futures_util::StreamExt;
use lib_telemetry::core::PollSample;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[command(author, version, about = "Connects to a running gateway and reports its sample stream", long_about = None)]
struct Args {
    /// Gateway WebSocket endpoint
    #[arg(short, long, default_value = "ws://127.0.0.1:8000/ws")]
    url: String,

    /// Report interval in seconds
    #[arg(short, long, default_value_t = 10)]
    report_interval_seconds: u64,

    /// Stop after this many samples (0 runs until the stream ends)
    #[arg(short, long, default_value_t = 0)]
    max_samples: u64,
}

#[derive(Default)]
struct Window {
    samples: u64,
    malformed: u64,
    last_value_count: Option<usize>,
    last_timestamp: Option<f64>,
    max_gap_ms: f64,
    max_age_ms: f64,
}

impl Window {
    fn record(&mut self, sample: &PollSample) {
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        self.max_age_ms = self.max_age_ms.max((now - sample.timestamp) * 1000.0);
        if let Some(previous) = self.last_timestamp {
            self.max_gap_ms = self.max_gap_ms.max((sample.timestamp - previous) * 1000.0);
        }
        self.last_timestamp = Some(sample.timestamp);
        self.last_value_count = Some(sample.values.len());
        self.samples += 1;
    }

    fn report(&mut self, elapsed: Duration) {
        let rate = self.samples as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        println!("\n----- {:.0}s Summary -----", elapsed.as_secs_f64());
        println!("Rate: {:.1} samples/s ({} samples)", rate, self.samples);
        match self.last_value_count {
            Some(count) => println!("Values per sample: {}", count),
            None => println!("Values per sample: No data"),
        }
        println!("Max gap between samples: {:.1} ms", self.max_gap_ms);
        println!("Max sample age on arrival: {:.1} ms", self.max_age_ms);
        println!("Malformed frames: {}", self.malformed);
        println!("-------------------------\n");

        // Keep the last timestamp so the next window's gap stays continuous
        *self = Window {
            last_timestamp: self.last_timestamp,
            ..Window::default()
        };
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (_write, mut read) = ws_stream.split();
    println!("Connected. Press Ctrl+C to stop.");

    let mut window = Window::default();
    let mut total: u64 = 0;
    let mut window_started = Instant::now();
    let mut ticker = interval(Duration::from_secs(args.report_interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                window.report(window_started.elapsed());
                window_started = Instant::now();
            }
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        println!("Stream error: {}", e);
                        break;
                    }
                    None => {
                        println!("Stream closed by server.");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<PollSample>(text.as_str()) {
                        Ok(sample) => {
                            window.record(&sample);
                            total += 1;
                        }
                        Err(_) => window.malformed += 1,
                    },
                    Message::Close(frame) => {
                        println!("Server closed the stream: {:?}", frame);
                        break;
                    }
                    _ => {}
                }
                if args.max_samples > 0 && total >= args.max_samples {
                    break;
                }
            }
        }
    }

    window.report(window_started.elapsed());
    println!("Total samples received: {}", total);
    Ok(())
}
