//! Echo Service - example of exporting an object.
//!
//! This example demonstrates:
//! - Exporting methods with the builder before connecting
//! - Requesting a well-known name
//! - Emitting a signal once the name is owned
//!
//! # Calling it
//!
//! ```sh
//! cargo run --example echo_service &
//! dbus-send --session --print-reply --dest=org.busline.Echo \
//!     /org/busline/Echo org.busline.Echo.Echo string:hello
//! ```

use busline::handler::MethodCall;
use busline::{name_flags, Connection, MethodError, ObjectPath, RequestNameReply};

const NAME: &str = "org.busline.Echo";
const INTERFACE: &str = "org.busline.Echo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = ObjectPath::new("/org/busline/Echo")?;

    let conn = Connection::builder()
        .export(path.clone(), INTERFACE, "Echo", |call: MethodCall| async move {
            Ok(call.into_body())
        })
        .export(path.clone(), INTERFACE, "Fail", |_call: MethodCall| async move {
            Err(MethodError::new(
                "org.busline.Echo.Error.Requested",
                "failure on request",
            ))
        })
        .session()
        .await?;

    match conn.request_name(NAME, name_flags::DO_NOT_QUEUE).await? {
        RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {}
        other => {
            eprintln!("could not own {}: {:?}", NAME, other);
            conn.close();
            return Ok(());
        }
    }
    println!("serving {} as {}", NAME, conn.unique_name().unwrap_or_default());

    conn.emit(path, INTERFACE, "Started", Vec::new()).await?;

    tokio::select! {
        _ = conn.wait_for_shutdown() => {}
        _ = tokio::signal::ctrl_c() => conn.close(),
    }
    Ok(())
}
