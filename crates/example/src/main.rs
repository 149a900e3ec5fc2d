//! Example lifescope demo CLI.
//!
//! Runs a batch of requests, each with its own request scope fanned out to
//! worker threads and tokio tasks.
//!
//! # Usage
//!
//! ```bash
//! lifescope-demo [requests] [workers] [pretty|compact|json]
//! ```
//!
//! # Example
//!
//! ```bash
//! RUST_LOG=lifescope_store=debug,example=debug lifescope-demo 4 3 compact
//! ```

use std::sync::Arc;

use example::telemetry::{TracingConfig, TracingFormat};
use example::{Services, handle_request, handle_request_async};
use lifescope_store::prelude::*;

const DEFAULT_REQUESTS: u64 = 4;
const DEFAULT_WORKERS: usize = 3;

fn arg<T: core::str::FromStr>(args: &[String], index: usize, default: T) -> T {
    args.get(index)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let requests = arg(&args, 1, DEFAULT_REQUESTS);
    let workers = arg(&args, 2, DEFAULT_WORKERS);
    let format = match args.get(3).map(|value| value.parse::<TracingFormat>()) {
        Some(Ok(format)) => format,
        Some(Err(e)) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        None => TracingFormat::default(),
    };

    TracingConfig::from_env().with_format(format).init();

    let registry = Arc::new(
        StoreRegistry::with_config(RegistryConfig::new().with_leak_policy(LeakPolicy::Warn)),
    );
    let services = Arc::new(Services::new(Arc::clone(&registry)));

    // Thread fan-out, one unrelated root per request
    for request in 0..requests {
        match handle_request(&services, &CallContext::new(), request, workers) {
            Ok(summary) => tracing::info!(?summary, "threaded request done"),
            Err(e) => tracing::error!(request, error = %e, "threaded request failed"),
        }
    }

    // Task fan-out, all requests in flight at once
    let handles: Vec<_> = (0..requests)
        .map(|request| {
            tokio::spawn(handle_request_async(
                Arc::clone(&services),
                CallContext::new(),
                requests + request,
                workers,
            ))
        })
        .collect();

    for handle in handles {
        match handle.await {
            Ok(Ok(summary)) => tracing::info!(?summary, "async request done"),
            Ok(Err(e)) => tracing::error!(error = %e, "async request failed"),
            Err(e) => tracing::error!(error = %e, "async request panicked"),
        }
    }

    tracing::info!(
        sessions_closed = services.closed_sessions(),
        leaked_scopes = registry.leaked_scopes(),
        "demo finished"
    );
}
