// Copyright (C) 2025 Fetchgate Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// CLI Demo Binary (A7): loads a YAML feature-flag file, builds a manager,
// and fires a couple of fetches at a URL given on the command line so an
// embedder can see the cache/inflight/streaming behavior end to end.

use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fetchgate::{configure, ManagerOptions, RequestInit, YamlFileFlagStore};

#[derive(Parser, Debug)]
#[command(
    name = "fetchgate-demo",
    version,
    about = "Demonstrates the fetch manager against a live URL"
)]
struct Args {
    /// Path to the YAML feature-flag file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// URL to fetch a couple of times.
    #[arg(default_value = "https://httpbin.org/get")]
    url: String,
}

fn init_logging() {
    let filter = EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let args = Args::parse();
    init_logging();

    let flag_store = Arc::new(YamlFileFlagStore::new(&args.config));
    let manager = configure(ManagerOptions::new(flag_store)).await;
    info!(config = %args.config, "manager configured");

    for attempt in 1..=2 {
        match fetch_once(&manager, &args.url, attempt).await {
            Ok(()) => {}
            Err(e) => {
                error!(attempt, error = %e, "demo fetch failed");
                exit(1);
            }
        }
    }
}

async fn fetch_once(
    manager: &Arc<fetchgate::FetchManager>,
    url: &str,
    attempt: u32,
) -> Result<(), fetchgate::FetchError> {
    let response = fetchgate::with_manager::fetch(manager, url, RequestInit::default()).await?;
    let status = manager.admin_status().await;
    info!(
        attempt,
        status_code = response.status_code,
        is_streaming = response.is_streaming_body(),
        l1_entries = status.l1_entries,
        inflight_requests = status.inflight_requests,
        "fetch complete"
    );
    Ok(())
}
