//! Circuit breaker walkthrough
//!
//! This demo:
//! 1. Runs a local server that fails every request with a 500
//! 2. Uses hooks to report when the client goes out of service and back
//! 3. Shows requests being rejected while out of service
//! 4. Prints the metrics collected along the way

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;
use timed_http_client::{Error, HookRegistry, TimedClient, VarSet};

fn spawn_failing_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local port");
    let addr = listener.local_addr().expect("local address");

    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nFAIL",
            );
        }
    });

    format!("http://{}/", addr)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Timed HTTP Client Circuit Breaker ===\n");

    let hooks = HookRegistry::new();
    hooks.set_on_out_of_service(|| println!("📢 Client OUT OF SERVICE after too many errors"));
    hooks.set_on_restored(|| println!("📢 Client BACK IN SERVICE"));
    hooks.set_on_rejected(|| println!("   request rejected without being sent"));

    let vars = VarSet::new();
    let client = TimedClient::builder()
        .name("demo")
        .max_errors(3)
        .healing_time(Duration::from_millis(500))
        .metric_sink(vars.clone())
        .hooks(hooks)
        .build();

    let url = spawn_failing_server();

    for round in 1..=2 {
        println!("Round {}", round);
        for i in 1..=5 {
            match client.get(&url) {
                Ok(response) => println!("  #{} status {}", i, response.status()),
                Err(Error::OutOfService) => println!("  #{} out of service", i),
                Err(err) => println!("  #{} error: {}", i, err),
            }
        }

        println!("  state: {:?}\n", client.state());
        thread::sleep(Duration::from_millis(600));
    }

    println!("Metrics:");
    vars.for_each(|name, value| println!("  {:<22} {:>12.0}", name, value));
}
