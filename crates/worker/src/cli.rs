use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "predq", version, about = "Prediction queue worker")]
pub struct Cli {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379/0`).
    #[arg(long, env = "PREDQ_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Deprecated: use --redis-url.
    #[arg(long, hide = true)]
    pub redis_host: Option<String>,

    /// Deprecated: use --redis-url.
    #[arg(long, hide = true)]
    pub redis_port: Option<u16>,

    /// Stream to consume jobs from; the consumer group has the same name.
    #[arg(long, env = "PREDQ_INPUT_QUEUE")]
    pub input_queue: String,

    #[arg(long, env = "PREDQ_S3_ACCESS_KEY")]
    pub s3_access_key: String,

    #[arg(long, env = "PREDQ_S3_SECRET_KEY")]
    pub s3_secret_key: String,

    /// Custom S3 endpoint, for non-AWS object stores.
    #[arg(long)]
    pub s3_endpoint_url: Option<String>,

    /// Bucket receiving uploaded artifacts.
    #[arg(long)]
    pub s3_bucket: String,

    #[arg(long)]
    pub s3_region: String,

    /// This worker's consumer name; must be unique within the group.
    #[arg(long, env = "PREDQ_CONSUMER_ID")]
    pub consumer_id: String,

    /// Prediction deadline in seconds; breach cancels the engine and fails
    /// the job as timed out.
    #[arg(long)]
    pub predict_timeout: Option<u64>,

    /// POST the setup report (status, timestamps, logs) to this URL.
    #[arg(long)]
    pub report_setup_run_url: Option<String>,

    /// Maximum number of consecutive failures before the worker should exit.
    #[arg(long)]
    pub max_failure_count: Option<u32>,

    /// Engine command line (program and arguments, whitespace-separated).
    #[arg(long, env = "PREDQ_ENGINE_COMMAND", value_name = "CMD")]
    pub engine_command: String,

    #[arg(hide = true)]
    pub positional_args: Vec<String>,
}

impl Cli {
    /// Positional arguments were accepted by an earlier version of the
    /// worker; reject them loudly rather than ignoring them.
    pub fn reject_positional_args(&self) {
        if !self.positional_args.is_empty() {
            eprintln!("positional arguments are not supported; switch to flag arguments");
            std::process::exit(1);
        }
    }

    /// Resolve the Redis URL, composing it from the deprecated host/port
    /// flags when needed.
    pub fn resolve_redis_url(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.redis_url {
            return Ok(url.clone());
        }
        match (&self.redis_host, self.redis_port) {
            (Some(host), Some(port)) => {
                eprintln!("--redis-host and --redis-port are deprecated; switch to --redis-url");
                Ok(format!("redis://{host}:{port}/0"))
            }
            _ => anyhow::bail!("--redis-url is required"),
        }
    }

    /// The engine subprocess argv.
    pub fn engine_argv(&self) -> Vec<String> {
        self.engine_command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "predq",
            "--input-queue",
            "input_queue",
            "--s3-access-key",
            "ak",
            "--s3-secret-key",
            "sk",
            "--s3-bucket",
            "bucket",
            "--s3-region",
            "us-east-1",
            "--consumer-id",
            "worker-1",
            "--engine-command",
            "python3 -m engine.server",
        ]
    }

    #[test]
    fn legacy_redis_flags_compose_a_url() {
        let mut args = base_args();
        args.extend(["--redis-host", "redis.internal", "--redis-port", "6380"]);
        let cli = Cli::parse_from(args);
        assert_eq!(cli.resolve_redis_url().unwrap(), "redis://redis.internal:6380/0");
    }

    #[test]
    fn redis_url_wins_over_legacy_flags() {
        let mut args = base_args();
        args.extend([
            "--redis-url",
            "redis://other:1234/2",
            "--redis-host",
            "ignored",
            "--redis-port",
            "1",
        ]);
        let cli = Cli::parse_from(args);
        assert_eq!(cli.resolve_redis_url().unwrap(), "redis://other:1234/2");
    }

    #[test]
    fn missing_redis_configuration_is_an_error() {
        let cli = Cli::parse_from(base_args());
        assert!(cli.resolve_redis_url().is_err());
    }

    #[test]
    fn engine_command_splits_into_argv() {
        let cli = Cli::parse_from(base_args());
        assert_eq!(cli.engine_argv(), vec!["python3", "-m", "engine.server"]);
    }
}
