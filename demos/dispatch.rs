//! Dispatch example driving the pipeline with a scripted backend.
//!
//! This example shows how to:
//! - Build a ScanDispatcher around a backend
//! - Submit scan requests and observe duplicate suppression
//! - Watch a transient failure get retried
//! - Shut down and read the report
//!
//! Run with: RUST_LOG=scanrelay=debug cargo run --example dispatch

use scanrelay::backends::{MockBackend, MockOutcome};
use scanrelay::prelude::*;

use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scanrelay=info")),
        )
        .init();

    println!("=== Scanrelay Dispatch Example ===\n");

    // First scan hits a refused connection, everything after succeeds.
    let backend = MockBackend::new()
        .with_name("example-scanner")
        .with_script(vec![MockOutcome::fail("connection refused")])
        .with_response(
            "registry.local/legacy:0.9",
            MockOutcome::Findings(VulnerabilityCounts {
                critical: 2,
                high: 5,
                medium: 11,
                low: 3,
            }),
        )
        .with_latency(Duration::from_millis(50));

    let config = DispatchConfig::new()
        .with_queue_capacity(16)
        .with_worker_count(2)
        .with_retry(
            RetryConfig::new()
                .with_max_retries(2)
                .with_initial_backoff(Duration::from_millis(100)),
        );

    let dispatcher = ScanDispatcher::builder()
        .with_backend(backend)
        .with_config(config)
        .build()?;
    dispatcher.start();

    let images = [
        "registry.local/app:1.0",
        "registry.local/api:2.3",
        "registry.local/legacy:0.9",
        // Pushed twice in a row; the second is suppressed.
        "registry.local/app:1.0",
    ];
    for image in images {
        match dispatcher.enqueue_scan_request(ScanRequest::new(image, "local")) {
            Ok(EnqueueOutcome::Enqueued { request_id }) => {
                println!("queued     {} ({})", image, request_id);
            }
            Ok(EnqueueOutcome::Duplicate { request_id }) => {
                println!("duplicate  {} ({})", image, request_id);
            }
            Err(e) => println!("rejected   {}: {}", image, e),
        }
    }

    tokio::time::sleep(Duration::from_millis(600)).await;

    let stats = dispatcher.stats();
    println!("\n=== Stats ===");
    println!("Processed: {}", stats.pool.processed);
    println!("Queue depth: {}", stats.pool.queue_depth);
    println!("Pending retries: {}", stats.pending_retries);
    println!("Counters: {:?}", stats.metrics);

    let report = dispatcher.shutdown(Duration::from_secs(5)).await;
    println!("\n=== Shutdown ===");
    println!("Timed out: {}", report.timed_out);
    println!("Dropped: {}", report.dropped);
    println!("Cancelled retries: {}", report.cancelled_retries);
    println!("Elapsed: {:?}", report.elapsed);

    // Intake is closed now.
    if let Err(e) = dispatcher.enqueue_scan_request(ScanRequest::new("registry.local/late:1.0", "local")) {
        println!("After shutdown: {}", e);
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
