//! Command-line interface parsing for the staleguard binary
//!
//! This module handles parsing of CLI arguments using clap and maps them onto
//! a `CacheConfig` and per-call `CallOptions`.

use chrono::Duration;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

use crate::cache::CallOptions;
use crate::config::CacheConfig;
use crate::network::Request;

/// Error types for CLI argument parsing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    /// A `--param` value was not of the form `key=value`
    #[error("Invalid parameter: '{0}'. Expected key=value")]
    InvalidParam(String),

    /// More than one of `--refresh`, `--no-cache` and `--offline` was given
    #[error("--refresh, --no-cache and --offline cannot be used together")]
    ConflictingModes,
}

/// Staleguard - fetch JSON over HTTP through a persistent response cache
#[derive(Parser, Debug)]
#[command(name = "staleguard")]
#[command(about = "Cached HTTP fetches with stale fallback")]
#[command(version)]
pub struct Cli {
    /// Root directory for cache stores (defaults to the XDG cache directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Name of the store inside the cache directory
    #[arg(long, global = true, default_value = crate::config::DEFAULT_DATABASE)]
    pub database: String,

    /// Default time-to-live for cached responses, in seconds
    #[arg(long, global = true, default_value_t = 300, value_name = "SECS")]
    pub default_ttl_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch one or more URLs through the cache and print the responses
    ///
    /// Examples:
    ///   staleguard get https://api.example.com/joke
    ///   staleguard get https://api.example.com/joke --param lang=en --refresh
    Get {
        /// URLs to fetch; several URLs are fetched concurrently
        #[arg(required = true)]
        urls: Vec<String>,

        /// Query parameter as key=value, may be repeated
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// JSON body; sends a POST instead of a GET
        #[arg(long)]
        body: Option<String>,

        /// Bypass fresh cached entries
        #[arg(long)]
        refresh: bool,

        /// Neither read nor write the cache
        #[arg(long)]
        no_cache: bool,

        /// Serve cached responses of any age without calling the network
        #[arg(long)]
        offline: bool,

        /// Never return an expired response, even when the network fails
        #[arg(long)]
        fresh_only: bool,

        /// TTL override for this call, in seconds
        #[arg(long, value_name = "SECS")]
        ttl_secs: Option<u64>,
    },
    /// Delete entries older than the given age
    ClearOlder {
        /// Maximum age to keep, in seconds
        #[arg(long, value_name = "SECS")]
        max_age_secs: u64,
    },
    /// Expire every cached entry so the next fetch refreshes it
    Invalidate,
    /// Delete every cached entry
    ClearAll,
    /// Print the number of cached entries
    Stats,
}

/// Parses a `key=value` parameter argument
///
/// # Returns
/// * `Ok((key, value))` - The value may be empty, the key may not
/// * `Err(CliError::InvalidParam)` - If there is no `=` or the key is empty
pub fn parse_param_arg(s: &str) -> Result<(String, String), CliError> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(CliError::InvalidParam(s.to_string())),
    }
}

/// Converts a seconds argument to a duration, saturating at the largest supported value
pub fn duration_from_secs(secs: u64) -> Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    Duration::seconds(secs)
}

impl Cli {
    /// Builds the cache configuration from global flags
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: duration_from_secs(self.default_ttl_secs),
            database_identifier: self.database.clone(),
            cache_dir: self.cache_dir.clone(),
            ..Default::default()
        }
    }
}

/// Builds the requests and call options for a `get` invocation
pub fn build_requests(
    urls: &[String],
    params: &[String],
    body: Option<&str>,
) -> Result<Vec<Request>, CliError> {
    let params = params
        .iter()
        .map(|p| parse_param_arg(p))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(urls
        .iter()
        .map(|url| {
            let request = match body {
                Some(body) => Request::post(url.as_str(), body),
                None => Request::get(url.as_str()),
            };
            params
                .iter()
                .fold(request, |request, (k, v)| request.param(k.as_str(), v.as_str()))
        })
        .collect())
}

/// Flags of a `get` invocation that select how the cache is used
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeFlags {
    pub refresh: bool,
    pub no_cache: bool,
    pub offline: bool,
    pub fresh_only: bool,
}

/// Maps `get` flags onto call options
pub fn call_options(flags: ModeFlags, ttl_secs: Option<u64>) -> Result<CallOptions, CliError> {
    let options = match (flags.refresh, flags.no_cache, flags.offline) {
        (false, false, false) => CallOptions::default(),
        (true, false, false) => CallOptions::refresh(),
        (false, true, false) => CallOptions::do_not_cache(),
        (false, false, true) => CallOptions::offline(),
        _ => return Err(CliError::ConflictingModes),
    };
    let options = if flags.fresh_only {
        options.fresh_only()
    } else {
        options
    };

    Ok(match ttl_secs {
        Some(secs) => options.with_ttl(duration_from_secs(secs)),
        None => options,
    })
}
