use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use chrono::Duration;
use clap::Parser;
use jobline::server::DEFAULT_MAX_LOG_SIZE;
use jobline::service::{ServiceConfig, DEFAULT_LEASE_SECONDS};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 11301)]
    pub(crate) port: u16,
    /// Loads jobs from this file at startup, and saves them on shutdown.
    #[arg(short = 'f', long)]
    pub(crate) state_file: Option<PathBuf>,
    /// Lease length, in seconds, granted by `claim` and by `lease <id> 0`.
    #[arg(long, default_value_t = DEFAULT_LEASE_SECONDS)]
    pub(crate) lease_seconds: u32,
    /// How often, in seconds, to requeue running jobs whose lease expired.
    /// 0 disables the reaper.
    #[arg(short, long, default_value_t = 30)]
    pub(crate) reap_interval: u64,
    /// Sets the maximum allowed size of a `log` body.
    #[arg(short = 'z', long, default_value_t = DEFAULT_MAX_LOG_SIZE)]
    pub(crate) max_log_size: u32,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

impl Args {
    pub(crate) fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            lease_duration: Duration::seconds(self.lease_seconds.into()),
        }
    }
}
