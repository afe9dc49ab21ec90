//! Ping - check that a daemon is reachable and print its version.
//!
//! This example demonstrates:
//! - Building a client with the fluent API
//! - Sending `PING` and `VERSION`
//! - Cancelling a call with a deadline
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=clamd_client=debug cargo run --example ping -- tcp localhost:3310
//! cargo run --example ping -- unix /var/run/clamav/clamd.ctl
//! ```

use std::time::Duration;

use clamd_client::{Clamd, Interrupt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let network = args.next().unwrap_or_else(|| "tcp".to_string());
    let address = args.next().unwrap_or_else(|| "localhost:3310".to_string());

    let builder = Clamd::builder().max_retries(3);
    let builder = match network.as_str() {
        "unix" => builder.unix(address),
        _ => builder.tcp(address),
    };
    let clamd = builder.build()?;

    // Give up on the whole call (retries included) after ten seconds.
    let clamd = clamd.with_interrupt(Interrupt::new().with_timeout(Duration::from_secs(10)));

    let pong = clamd.ping().await?;
    println!("{} (attempts: {})", pong.raw.trim_end(), pong.attempts);

    let version = clamd.version().await?;
    println!("{}", version.raw.trim_end());

    Ok(())
}
