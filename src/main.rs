//! Staleguard - fetch JSON over HTTP through a persistent response cache
//!
//! Prints each response envelope as JSON on stdout. Logs go to stderr and are
//! controlled with `RUST_LOG`.

use clap::Parser;
use futures::future::join_all;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use staleguard::cli::{build_requests, call_options, duration_from_secs, Cli, Command, ModeFlags};
use staleguard::{CacheInterceptor, HttpPipeline, Response};

/// Installs a stderr log subscriber, defaulting to warnings only
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let interceptor: CacheInterceptor<HttpPipeline> =
        cli.cache_config().build_interceptor(HttpPipeline::new())?;

    match cli.command {
        Command::Get {
            urls,
            params,
            body,
            refresh,
            no_cache,
            offline,
            fresh_only,
            ttl_secs,
        } => {
            let requests = build_requests(&urls, &params, body.as_deref())?;
            let flags = ModeFlags {
                refresh,
                no_cache,
                offline,
                fresh_only,
            };
            let options = call_options(flags, ttl_secs)?;

            let results = join_all(requests.iter().map(|request| {
                interceptor.call::<serde_json::Value>(request, options)
            }))
            .await;

            let mut failed = false;
            for (request, result) in requests.iter().zip(results) {
                match result {
                    Ok(response) => print_response(&response)?,
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: {}", request.url, e);
                    }
                }
            }

            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::ClearOlder { max_age_secs } => {
            let removed = interceptor.clear_older_entries(duration_from_secs(max_age_secs))?;
            println!("Removed {} entries", removed);
            Ok(ExitCode::SUCCESS)
        }
        Command::Invalidate => {
            let expired = interceptor.invalidate_type::<serde_json::Value>()?;
            println!("Invalidated {} entries", expired);
            Ok(ExitCode::SUCCESS)
        }
        Command::ClearAll => {
            let removed = interceptor.clear_all()?;
            println!("Removed {} entries", removed);
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats => {
            println!("{} entries", interceptor.entry_count()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_response(response: &Response<serde_json::Value>) -> serde_json::Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
