use criterion::{black_box, criterion_group, criterion_main, Criterion};
use http::{Request, Response};
use std::time::Duration;
use timed_http_client::{
    AvgRateCounter, Body, ClientTrace, Scheduler, Task, TimedClient, Transport, TransportError,
};

// Answers immediately, firing the events a pooled connection would.
struct InstantTransport {
    status: u16,
}

impl Transport for InstantTransport {
    fn send(&self, request: Request<Body>) -> Result<Response<Body>, TransportError> {
        if let Some(trace) = ClientTrace::from_request(&request) {
            trace.get_conn();
            trace.got_conn();
            trace.wrote_request();
            trace.got_first_response_byte();
        }

        Ok(Response::builder()
            .status(self.status)
            .body(Vec::new())
            .expect("valid response"))
    }
}

// Never restores service, so the breaker stays open once tripped.
struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn schedule(&self, _delay: Duration, _task: Task) {}
}

fn request() -> Request<Body> {
    Request::get("http://bench/").body(Vec::new()).expect("valid request")
}

fn bench_execute_in_service(c: &mut Criterion) {
    let client = TimedClient::builder()
        .transport(InstantTransport { status: 200 })
        .max_errors(5)
        .build();

    c.bench_function("execute_in_service", |b| {
        b.iter(|| black_box(client.execute(request())));
    });
}

fn bench_execute_out_of_service(c: &mut Criterion) {
    let client = TimedClient::builder()
        .transport(InstantTransport { status: 500 })
        .max_errors(1)
        .scheduler(NoopScheduler)
        .build();
    let _ = client.execute(request());

    c.bench_function("execute_out_of_service", |b| {
        b.iter(|| black_box(client.execute(request())));
    });
}

fn bench_counter_concurrent(c: &mut Criterion) {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let counter = Arc::new(AvgRateCounter::new(Duration::from_secs(60)));

    const THREAD_COUNT: usize = 4;
    const ITERATIONS_PER_THREAD: usize = 1000;

    c.bench_function("avg_rate_counter_concurrent", |b| {
        b.iter(|| {
            let barrier = Arc::new(Barrier::new(THREAD_COUNT + 1));
            let mut handles = Vec::with_capacity(THREAD_COUNT);

            for _ in 0..THREAD_COUNT {
                let counter = Arc::clone(&counter);
                let barrier = Arc::clone(&barrier);

                handles.push(thread::spawn(move || {
                    barrier.wait();
                    for i in 0..ITERATIONS_PER_THREAD {
                        counter.incr(black_box(i as i64));
                    }
                }));
            }

            // Start all threads simultaneously
            barrier.wait();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(counter.average())
        });
    });
}

criterion_group!(
    benches,
    bench_execute_in_service,
    bench_execute_out_of_service,
    bench_counter_concurrent
);
criterion_main!(benches);
