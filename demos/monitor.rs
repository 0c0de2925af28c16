//! Monitor - example of eavesdropping on bus traffic.
//!
//! This example demonstrates:
//! - Installing an eavesdrop sink with `conn.eavesdrop()`
//! - Adding match rules so the bus forwards traffic to us
//! - Dumping every message as a line of JSON
//!
//! # Running
//!
//! ```sh
//! cargo run --example monitor
//! ```

use busline::Connection;

const RULES: &[&str] = &[
    "type='signal',eavesdrop=true",
    "type='method_call',eavesdrop=true",
    "type='method_return',eavesdrop=true",
    "type='error',eavesdrop=true",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::session().await?;

    // Install the sink before the rules so nothing is missed.
    let mut messages = conn.eavesdrop(64);
    for rule in RULES {
        if let Err(e) = conn.add_match(rule).await {
            eprintln!("could not add {:?}: {}", rule, e);
        }
    }

    loop {
        tokio::select! {
            msg = messages.recv() => match msg {
                Some(msg) => println!("{}", serde_json::to_string(&msg)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    conn.close();
    Ok(())
}
