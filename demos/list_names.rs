//! List Names - simple method call example.
//!
//! This example demonstrates:
//! - Connecting to the session bus
//! - Calling a method on the bus object and reading the reply body
//!
//! # Running
//!
//! ```sh
//! cargo run --example list_names
//! ```

use busline::{bus_call, Connection, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let conn = Connection::session().await?;
    println!("connected as {}", conn.unique_name().unwrap_or_default());

    let reply = conn.call(bus_call("ListNames", Vec::new())).await?;
    let names = reply.first().and_then(Value::as_array).unwrap_or_default();

    let mut names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
    names.sort_unstable();
    for name in names {
        println!("{}", name);
    }

    conn.close();
    Ok(())
}
