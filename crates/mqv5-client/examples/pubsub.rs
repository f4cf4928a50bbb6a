//! Publish/subscribe example.
//!
//! Run with: cargo run -p mqv5-client --example pubsub
//!
//! Demonstrates:
//! - Split architecture (AsyncClient + EventLoop)
//! - Broker failover via a comma-separated broker list
//! - QoS 1 publishing with acknowledgement reason codes

use std::time::Duration;

use mqv5_client::{AsyncClient, ClientConfig, Event, QoS};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::new("localhost:1883,backup.localdomain:1883")
        .client_id("pubsub-example")
        .session_expiry_interval(300)
        .keep_alive(10);

    // Client is Clone and shareable across tasks; the EventLoop owns the
    // connection and must be polled.
    let (client, mut eventloop) = AsyncClient::new(config, 10);

    let worker = client.clone();
    tokio::spawn(async move {
        // give the event loop a moment to connect
        tokio::time::sleep(Duration::from_millis(200)).await;

        match worker.subscribe(&[("example/#", QoS::AtLeastOnce)]).await {
            Ok(codes) => println!("Subscribed: {codes:?}"),
            Err(e) => eprintln!("Subscribe failed: {e}"),
        }

        for i in 0..5 {
            let payload = format!("message {i}");
            match worker
                .publish("example/demo", payload, QoS::AtLeastOnce, false)
                .await
            {
                Ok(code) => println!("Published {i}: {code}"),
                Err(e) => eprintln!("Publish {i} failed: {e}"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let _ = worker.disconnect().await;
    });

    loop {
        match eventloop.poll().await {
            Ok(Event::Connected { session_present }) => {
                println!("Connected (session present: {session_present})");
            }
            Ok(Event::Message(msg)) => {
                println!("{}: {}", msg.topic, String::from_utf8_lossy(&msg.payload));
            }
            Ok(Event::Disconnected { reason }) => {
                println!("Disconnected: {reason:?}");
            }
            Ok(Event::Reconnecting { attempt }) => {
                println!("Reconnecting (attempt {attempt})");
            }
            Err(e) => {
                eprintln!("Event loop stopped: {e}");
                break;
            }
        }
    }

    Ok(())
}
