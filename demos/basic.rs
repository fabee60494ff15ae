use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;
use timed_http_client::{Error, TimedClient, VarSet};

// Serves "OK" after a short delay on a local port.
fn spawn_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local port");
    let addr = listener.local_addr().expect("local address");

    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            thread::sleep(Duration::from_millis(15));
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
            );
        }
    });

    format!("http://{}/", addr)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let url = spawn_server();
    let vars = VarSet::new();

    let client = TimedClient::builder()
        .name("example")
        .max_errors(10)
        .healing_time(Duration::from_secs(20))
        .metric_sink(vars.clone())
        .build();
    client.publish_metrics();

    for i in 1..=5 {
        match client.get(&url) {
            Ok(response) => println!("Request {}: {}", i, response.status()),
            Err(Error::OutOfService) => {
                println!("Client is out of service");
                break;
            }
            Err(err) => println!("Request {} failed: {}", i, err),
        }
    }

    println!("\nPublished metrics (ns):");
    vars.for_each(|name, value| println!("  {:<24} {:>12.0}", name, value));
}
