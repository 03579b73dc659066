use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `allocd` binary.
///
/// These settings control stream buffering and polling, re-authorization of
/// long-lived streams, and the per-allocation coordination queues. All values
/// are parsed from CLI arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "allocd",
    version,
    about = "gRPC control plane for allocation rendezvous and task log streaming"
)]
pub struct CliArgs {
    /// Capacity of the handoff queues between a stream's fetcher, forwarder
    /// and the gRPC response.
    ///
    /// A slow client stalls the fetcher once this many batches are queued;
    /// nothing is dropped.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 5)]
    pub stream_buffer_size: usize,

    /// Maximum number of log records requested from the backend per fetch.
    ///
    /// Environment variable: `LOGS_BATCH_SIZE`
    #[arg(long, env = "LOGS_BATCH_SIZE", default_value_t = 1000)]
    pub logs_batch_size: i64,

    /// How long a following log stream waits after a fetch returned nothing.
    ///
    /// Environment variable: `LOGS_MISS_WAIT_MS`
    #[arg(long, env = "LOGS_MISS_WAIT_MS", default_value_t = 1000)]
    pub logs_miss_wait_ms: u64,

    /// Interval between snapshots of a following log fields stream.
    ///
    /// Environment variable: `FIELDS_POLL_INTERVAL_MS`
    #[arg(long, env = "FIELDS_POLL_INTERVAL_MS", default_value_t = 5000)]
    pub fields_poll_interval_ms: u64,

    /// Minimum time between authorization re-checks of one stream.
    ///
    /// A revoked capability may keep an in-flight stream alive for up to this
    /// long.
    ///
    /// Environment variable: `AUTH_RECHECK_PERIOD_SECS`
    #[arg(long, env = "AUTH_RECHECK_PERIOD_SECS", default_value_t = 300)]
    pub auth_recheck_period_secs: u64,

    /// How long after a task ends its late log records are still awaited.
    ///
    /// Environment variable: `MAX_TERMINATION_DELAY_MS`
    #[arg(long, env = "MAX_TERMINATION_DELAY_MS", default_value_t = 0)]
    pub max_termination_delay_ms: u64,

    /// Capacity of each allocation's coordination queue.
    ///
    /// Environment variable: `ALLOCATION_QUEUE_SIZE`
    #[arg(long, env = "ALLOCATION_QUEUE_SIZE", default_value_t = 16)]
    pub allocation_queue_size: usize,

    /// Restrict interactive tasks to admins and the user who launched them.
    ///
    /// Environment variable: `STRICT_INTERACTIVE_TASKS`
    #[arg(long, env = "STRICT_INTERACTIVE_TASKS", default_value_t = false)]
    pub strict_interactive_tasks: bool,

    /// How long shutdown waits for each allocation to acknowledge.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/allocd.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub stream_buffer_size: usize,
    pub logs_batch_size: i64,
    pub logs_miss_wait: Duration,
    pub fields_poll_interval: Duration,
    pub auth_recheck_period: Duration,
    pub max_termination_delay: Duration,
    pub allocation_queue_size: usize,
    pub strict_interactive_tasks: bool,
    pub shutdown_timeout: Duration,
    pub server_addr: String,
    pub uds: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_buffer_size: 5,
            logs_batch_size: 1000,
            logs_miss_wait: Duration::from_secs(1),
            fields_poll_interval: Duration::from_secs(5),
            auth_recheck_period: Duration::from_secs(300),
            max_termination_delay: Duration::ZERO,
            allocation_queue_size: 16,
            strict_interactive_tasks: false,
            shutdown_timeout: Duration::from_secs(3),
            server_addr: String::from("0.0.0.0:50051"),
            uds: false,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.logs_batch_size <= 0 {
            bail!("LOGS_BATCH_SIZE must be greater than 0");
        }

        if args.allocation_queue_size == 0 {
            bail!("ALLOCATION_QUEUE_SIZE must be greater than 0");
        }

        if args.fields_poll_interval_ms == 0 {
            bail!("FIELDS_POLL_INTERVAL_MS must be greater than 0");
        }

        Ok(Self {
            stream_buffer_size: args.stream_buffer_size,
            logs_batch_size: args.logs_batch_size,
            logs_miss_wait: Duration::from_millis(args.logs_miss_wait_ms),
            fields_poll_interval: Duration::from_millis(args.fields_poll_interval_ms),
            auth_recheck_period: Duration::from_secs(args.auth_recheck_period_secs),
            max_termination_delay: Duration::from_millis(args.max_termination_delay_ms),
            allocation_queue_size: args.allocation_queue_size,
            strict_interactive_tasks: args.strict_interactive_tasks,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_into_config() {
        let args = CliArgs::parse_from(["allocd"]);
        let config = ServerConfig::try_from(args).unwrap();
        assert_eq!(config.stream_buffer_size, 5);
        assert_eq!(config.logs_batch_size, 1000);
        assert_eq!(config.logs_miss_wait, Duration::from_secs(1));
        assert_eq!(config.fields_poll_interval, Duration::from_secs(5));
        assert_eq!(config.auth_recheck_period, Duration::from_secs(300));
    }

    #[test]
    fn rejects_empty_buffers() {
        let args = CliArgs::parse_from(["allocd", "--stream-buffer-size", "0"]);
        assert!(ServerConfig::try_from(args).is_err());

        let args = CliArgs::parse_from(["allocd", "--logs-batch-size", "0"]);
        assert!(ServerConfig::try_from(args).is_err());
    }
}
