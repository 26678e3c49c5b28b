//! Server configuration and CLI argument parsing
//!
//! Every option can be given on the command line or through an environment
//! variable with the `PERMITGATE_` prefix.
//!
//! # Configuration Priority
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Default values (lowest priority)
//!
//! # Example Usage
//!
//! ```bash
//! # Raise the global budget and serve monitoring on port 9100
//! permitgate --global-concurrency 150 --monitor --monitor-port 9100
//!
//! # Give llm calls their own range and add an embedding class
//! permitgate --type-limit llm=60:30:120,embedding=10:5:20
//!
//! # Using environment variables
//! export PERMITGATE_IDENTITY_CONCURRENCY=8
//! export PERMITGATE_TUNING_INTERVAL_SECS=15
//! permitgate
//! ```

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use permitgate::{
    AdmissionGate, PoolBounds, RateLimitConfig, RateLimiter, TuningPolicy,
};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for the server
#[derive(Debug, Clone)]
pub struct Config {
    pub pools: PoolConfig,
    pub tuning: TuningConfig,
    pub reaper: ReaperConfig,
    pub rate_limit: RateLimitSettings,
    pub guard: GuardConfig,
    /// Monitoring endpoints, if enabled
    pub monitor: Option<MonitorConfig>,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

/// Sizes and tuning ranges of every permit pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub global: PoolBounds,
    pub types: Vec<TypeLimit>,
    pub aliases: Vec<TypeAlias>,
    pub identity: PoolBounds,
}

#[derive(Debug, Clone)]
pub struct TuningConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub policy: TuningPolicy,
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Identities idle for longer than this are dropped
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub limits: RateLimitConfig,
    /// How often idle keys are evicted
    pub sweep_interval: Duration,
}

/// Bounds on how long a guarded upstream call may hold its permit
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub upstream_timeout: Duration,
    /// Maximum lifetime of a permit held by a streamed response
    pub stream_max_hold: Duration,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

/// A request type with its own pool, written `name=initial:floor:ceiling`
///
/// `name=n` is shorthand for a fixed pool of `n` permits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLimit {
    pub name: String,
    pub bounds: PoolBounds,
}

impl FromStr for TypeLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, values) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid type limit: {s}. Expected name=initial:floor:ceiling"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("Invalid type limit: {s}. Request type name is empty"));
        }

        let numbers = values
            .split(':')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid type limit: {s}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let bounds = match numbers.as_slice() {
            [fixed] => PoolBounds::fixed(*fixed),
            [initial, floor, ceiling] => PoolBounds::new(*initial, *floor, *ceiling),
            _ => {
                return Err(anyhow!(
                    "Invalid type limit: {s}. Expected name=initial:floor:ceiling or name=n"
                ));
            }
        };

        Ok(TypeLimit {
            name: name.to_ascii_lowercase(),
            bounds,
        })
    }
}

impl fmt::Display for TypeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}:{}:{}",
            self.name, self.bounds.initial, self.bounds.floor, self.bounds.ceiling
        )
    }
}

/// Route one request type to another's pool, written `from=to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeAlias {
    pub from: String,
    pub to: String,
}

impl FromStr for TypeAlias {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => Ok(TypeAlias {
                from: from.trim().to_ascii_lowercase(),
                to: to.trim().to_ascii_lowercase(),
            }),
            _ => Err(anyhow!("Invalid type alias: {s}. Expected alias=type")),
        }
    }
}

/// Command-line arguments for the server
///
/// All arguments can also be set via environment variables with the
/// PERMITGATE_ prefix. CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(
    name = "permitgate",
    about = "Admission control for shared inference backends",
    long_about = "Runs the permitgate admission gate with its background tuner, idle reaper and rate-limit sweeper, and optionally serves monitoring endpoints.\n\nEnvironment variables with PERMITGATE_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    // Global pool
    #[arg(
        long,
        value_name = "N",
        help = "Initial global concurrency",
        default_value_t = 100,
        env = "PERMITGATE_GLOBAL_CONCURRENCY"
    )]
    pub global_concurrency: usize,
    #[arg(
        long,
        value_name = "N",
        help = "Smallest global concurrency the tuner may set",
        default_value_t = 50,
        env = "PERMITGATE_GLOBAL_FLOOR"
    )]
    pub global_floor: usize,
    #[arg(
        long,
        value_name = "N",
        help = "Largest global concurrency the tuner may set",
        default_value_t = 200,
        env = "PERMITGATE_GLOBAL_CEILING"
    )]
    pub global_ceiling: usize,

    // Per-type pools
    #[arg(
        long,
        value_name = "NAME=INITIAL:FLOOR:CEILING",
        help = "Per-request-type pools (comma separated)",
        value_delimiter = ',',
        default_values = ["llm=50:25:100", "streaming=30:15:60", "asr=20:10:40", "tts=20:10:40"],
        env = "PERMITGATE_TYPE_LIMITS"
    )]
    pub type_limit: Vec<TypeLimit>,
    #[arg(
        long,
        value_name = "ALIAS=TYPE",
        help = "Request type aliases (comma separated)",
        value_delimiter = ',',
        default_values = ["chat=llm", "stream=streaming"],
        env = "PERMITGATE_TYPE_ALIASES"
    )]
    pub type_alias: Vec<TypeAlias>,

    // Per-identity pools
    #[arg(
        long,
        value_name = "N",
        help = "Initial concurrency per identity",
        default_value_t = 5,
        env = "PERMITGATE_IDENTITY_CONCURRENCY"
    )]
    pub identity_concurrency: usize,
    #[arg(
        long,
        value_name = "N",
        help = "Smallest per-identity concurrency the tuner may set",
        default_value_t = 3,
        env = "PERMITGATE_IDENTITY_FLOOR"
    )]
    pub identity_floor: usize,
    #[arg(
        long,
        value_name = "N",
        help = "Largest per-identity concurrency the tuner may set",
        default_value_t = 10,
        env = "PERMITGATE_IDENTITY_CEILING"
    )]
    pub identity_ceiling: usize,

    // Dynamic tuning
    #[arg(
        long,
        help = "Disable load-driven tuning",
        env = "PERMITGATE_DISABLE_TUNING"
    )]
    pub disable_tuning: bool,
    #[arg(
        long,
        value_name = "SECS",
        help = "Tuning interval (seconds)",
        default_value_t = 30,
        env = "PERMITGATE_TUNING_INTERVAL_SECS"
    )]
    pub tuning_interval_secs: u64,
    #[arg(
        long,
        value_name = "FACTOR",
        help = "Capacity multiplier when shrinking",
        default_value_t = 0.8,
        env = "PERMITGATE_SHRINK_FACTOR"
    )]
    pub shrink_factor: f64,
    #[arg(
        long,
        value_name = "FACTOR",
        help = "Capacity multiplier when growing",
        default_value_t = 1.1,
        env = "PERMITGATE_GROW_FACTOR"
    )]
    pub grow_factor: f64,
    #[arg(
        long,
        value_name = "PERCENT",
        help = "Memory usage above which pools shrink",
        default_value_t = 85.0,
        env = "PERMITGATE_MEMORY_HIGH_WATERMARK"
    )]
    pub memory_high_watermark: f64,
    #[arg(
        long,
        value_name = "PERCENT",
        help = "Memory usage below which pools may grow",
        default_value_t = 60.0,
        env = "PERMITGATE_MEMORY_LOW_WATERMARK"
    )]
    pub memory_low_watermark: f64,
    #[arg(
        long,
        value_name = "RATE",
        help = "Rejection rate (0-1) above which pools shrink",
        default_value_t = 0.10,
        env = "PERMITGATE_REJECTION_HIGH_WATERMARK"
    )]
    pub rejection_high_watermark: f64,
    #[arg(
        long,
        value_name = "RATE",
        help = "Rejection rate (0-1) below which pools may grow",
        default_value_t = 0.02,
        env = "PERMITGATE_REJECTION_LOW_WATERMARK"
    )]
    pub rejection_low_watermark: f64,

    // Idle identity reaper
    #[arg(
        long,
        value_name = "SECS",
        help = "Drop identities idle for longer than this (seconds)",
        default_value_t = 1800,
        env = "PERMITGATE_IDENTITY_IDLE_TIMEOUT_SECS"
    )]
    pub identity_idle_timeout_secs: u64,
    #[arg(
        long,
        value_name = "SECS",
        help = "Idle identity sweep interval (seconds)",
        default_value_t = 1800,
        env = "PERMITGATE_REAPER_INTERVAL_SECS"
    )]
    pub reaper_interval_secs: u64,

    // Rate limiting
    #[arg(
        long,
        value_name = "SECS",
        help = "Rate limit window (seconds)",
        default_value_t = 60,
        env = "PERMITGATE_RATE_LIMIT_WINDOW_SECS"
    )]
    pub rate_limit_window_secs: u64,
    #[arg(
        long,
        value_name = "N",
        help = "Calls allowed per key per window",
        default_value_t = 30,
        env = "PERMITGATE_RATE_LIMIT_MAX_PER_WINDOW"
    )]
    pub rate_limit_max_per_window: u32,
    #[arg(
        long,
        value_name = "MILLIS",
        help = "Minimum gap between calls of one key (milliseconds)",
        default_value_t = 2000,
        env = "PERMITGATE_RATE_LIMIT_MIN_SPACING_MS"
    )]
    pub rate_limit_min_spacing_ms: u64,
    #[arg(
        long,
        value_name = "SECS",
        help = "Evict rate limit keys idle for longer than this (seconds)",
        default_value_t = 3600,
        env = "PERMITGATE_RATE_LIMIT_IDLE_SECS"
    )]
    pub rate_limit_idle_secs: u64,
    #[arg(
        long,
        value_name = "SECS",
        help = "Rate limit eviction interval (seconds)",
        default_value_t = 3600,
        env = "PERMITGATE_RATE_LIMIT_SWEEP_SECS"
    )]
    pub rate_limit_sweep_secs: u64,

    // Guards
    #[arg(
        long,
        value_name = "SECS",
        help = "Timeout for a guarded upstream call (seconds)",
        default_value_t = 60,
        env = "PERMITGATE_UPSTREAM_TIMEOUT_SECS"
    )]
    pub upstream_timeout_secs: u64,
    #[arg(
        long,
        value_name = "SECS",
        help = "Maximum time a streamed response may hold its permit (seconds)",
        default_value_t = 300,
        env = "PERMITGATE_STREAM_MAX_HOLD_SECS"
    )]
    pub stream_max_hold_secs: u64,

    // Monitoring
    #[arg(long, help = "Serve monitoring endpoints", env = "PERMITGATE_MONITOR")]
    pub monitor: bool,
    #[arg(
        long,
        value_name = "HOST",
        help = "Monitoring host",
        default_value = "127.0.0.1",
        env = "PERMITGATE_MONITOR_HOST"
    )]
    pub monitor_host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "Monitoring port",
        default_value_t = 9090,
        env = "PERMITGATE_MONITOR_PORT"
    )]
    pub monitor_port: u16,

    // General options
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "PERMITGATE_LOG_LEVEL"
    )]
    pub log_level: String,

    // Utility options
    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range or inconsistent.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        Self::from_args(args)
    }

    /// Build and validate configuration from already parsed arguments
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range or inconsistent.
    pub fn from_args(args: Args) -> Result<Self> {
        let config = Config {
            pools: PoolConfig {
                global: PoolBounds::new(
                    args.global_concurrency,
                    args.global_floor,
                    args.global_ceiling,
                ),
                types: args.type_limit,
                aliases: args.type_alias,
                identity: PoolBounds::new(
                    args.identity_concurrency,
                    args.identity_floor,
                    args.identity_ceiling,
                ),
            },
            tuning: TuningConfig {
                enabled: !args.disable_tuning,
                interval: Duration::from_secs(args.tuning_interval_secs),
                policy: TuningPolicy {
                    shrink_factor: args.shrink_factor,
                    grow_factor: args.grow_factor,
                    memory_high: args.memory_high_watermark,
                    memory_low: args.memory_low_watermark,
                    rejection_high: args.rejection_high_watermark,
                    rejection_low: args.rejection_low_watermark,
                },
            },
            reaper: ReaperConfig {
                interval: Duration::from_secs(args.reaper_interval_secs),
                idle_timeout: Duration::from_secs(args.identity_idle_timeout_secs),
            },
            rate_limit: RateLimitSettings {
                limits: RateLimitConfig {
                    max_per_window: args.rate_limit_max_per_window,
                    window: Duration::from_secs(args.rate_limit_window_secs),
                    min_spacing: Duration::from_millis(args.rate_limit_min_spacing_ms),
                    idle_eviction: Duration::from_secs(args.rate_limit_idle_secs),
                },
                sweep_interval: Duration::from_secs(args.rate_limit_sweep_secs),
            },
            guard: GuardConfig {
                upstream_timeout: Duration::from_secs(args.upstream_timeout_secs),
                stream_max_hold: Duration::from_secs(args.stream_max_hold_secs),
            },
            monitor: args.monitor.then(|| MonitorConfig {
                host: args.monitor_host,
                port: args.monitor_port,
            }),
            log_level: args.log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.pools.global.validate("global")?;
        self.pools.identity.validate("identity")?;
        for limit in &self.pools.types {
            limit.bounds.validate(&limit.name)?;
        }
        for alias in &self.pools.aliases {
            if !self.pools.types.iter().any(|t| t.name.eq_ignore_ascii_case(&alias.to)) {
                return Err(anyhow!(
                    "Type alias {} points at {}, which has no --type-limit",
                    alias.from,
                    alias.to
                ));
            }
        }

        self.tuning.policy.validate()?;
        self.rate_limit.limits.validate()?;

        let intervals = [
            ("tuning interval", self.tuning.interval),
            ("reaper interval", self.reaper.interval),
            ("rate limit sweep interval", self.rate_limit.sweep_interval),
            ("upstream timeout", self.guard.upstream_timeout),
            ("stream max hold", self.guard.stream_max_hold),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(anyhow!("{name} must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Build the admission gate described by the pool settings
    ///
    /// # Errors
    ///
    /// Returns an error if the pool settings are inconsistent.
    pub fn build_gate(&self) -> Result<AdmissionGate> {
        let mut builder = AdmissionGate::builder()
            .clear_type_pools()
            .global(self.pools.global)
            .identity(self.pools.identity);
        for limit in &self.pools.types {
            builder = builder.type_pool(&limit.name, limit.bounds);
        }
        for alias in &self.pools.aliases {
            builder = builder.alias(&alias.from, &alias.to);
        }
        Ok(builder.build()?)
    }

    pub fn build_rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.rate_limit.limits)
    }

    /// Print all available environment variables and their descriptions
    fn print_env_vars() {
        println!("permitgate Environment Variables");
        println!("================================");
        println!();
        println!("All environment variables use the PERMITGATE_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("Pools:");
        println!("  PERMITGATE_GLOBAL_CONCURRENCY=<n>           Initial global concurrency [default: 100]");
        println!("  PERMITGATE_GLOBAL_FLOOR=<n>                 Global tuning floor [default: 50]");
        println!("  PERMITGATE_GLOBAL_CEILING=<n>               Global tuning ceiling [default: 200]");
        println!(
            "  PERMITGATE_TYPE_LIMITS=<list>               Per-type pools [default: llm=50:25:100,streaming=30:15:60,asr=20:10:40,tts=20:10:40]"
        );
        println!(
            "  PERMITGATE_TYPE_ALIASES=<list>              Type aliases [default: chat=llm,stream=streaming]"
        );
        println!("  PERMITGATE_IDENTITY_CONCURRENCY=<n>         Initial per-identity concurrency [default: 5]");
        println!("  PERMITGATE_IDENTITY_FLOOR=<n>               Per-identity tuning floor [default: 3]");
        println!("  PERMITGATE_IDENTITY_CEILING=<n>             Per-identity tuning ceiling [default: 10]");
        println!();

        println!("Dynamic Tuning:");
        println!("  PERMITGATE_DISABLE_TUNING=true|false        Disable load-driven tuning");
        println!("  PERMITGATE_TUNING_INTERVAL_SECS=<secs>      Tuning interval [default: 30]");
        println!("  PERMITGATE_SHRINK_FACTOR=<f>                Shrink multiplier [default: 0.8]");
        println!("  PERMITGATE_GROW_FACTOR=<f>                  Grow multiplier [default: 1.1]");
        println!("  PERMITGATE_MEMORY_HIGH_WATERMARK=<pct>      Shrink above this memory usage [default: 85]");
        println!("  PERMITGATE_MEMORY_LOW_WATERMARK=<pct>       Grow below this memory usage [default: 60]");
        println!("  PERMITGATE_REJECTION_HIGH_WATERMARK=<rate>  Shrink above this rejection rate [default: 0.10]");
        println!("  PERMITGATE_REJECTION_LOW_WATERMARK=<rate>   Grow below this rejection rate [default: 0.02]");
        println!();

        println!("Idle Identities:");
        println!("  PERMITGATE_IDENTITY_IDLE_TIMEOUT_SECS=<secs> Idle timeout [default: 1800]");
        println!("  PERMITGATE_REAPER_INTERVAL_SECS=<secs>      Sweep interval [default: 1800]");
        println!();

        println!("Rate Limiting:");
        println!("  PERMITGATE_RATE_LIMIT_WINDOW_SECS=<secs>    Window length [default: 60]");
        println!("  PERMITGATE_RATE_LIMIT_MAX_PER_WINDOW=<n>    Calls per window [default: 30]");
        println!("  PERMITGATE_RATE_LIMIT_MIN_SPACING_MS=<ms>   Minimum gap between calls [default: 2000]");
        println!("  PERMITGATE_RATE_LIMIT_IDLE_SECS=<secs>      Evict keys idle this long [default: 3600]");
        println!("  PERMITGATE_RATE_LIMIT_SWEEP_SECS=<secs>     Eviction interval [default: 3600]");
        println!();

        println!("Guards:");
        println!("  PERMITGATE_UPSTREAM_TIMEOUT_SECS=<secs>     Upstream call timeout [default: 60]");
        println!("  PERMITGATE_STREAM_MAX_HOLD_SECS=<secs>      Maximum stream permit lifetime [default: 300]");
        println!();

        println!("Monitoring:");
        println!("  PERMITGATE_MONITOR=true|false               Serve /health, /stats and /metrics");
        println!("  PERMITGATE_MONITOR_HOST=<host>              Monitoring host [default: 127.0.0.1]");
        println!("  PERMITGATE_MONITOR_PORT=<port>              Monitoring port [default: 9090]");
        println!();

        println!("General Configuration:");
        println!(
            "  PERMITGATE_LOG_LEVEL=<level>                Log level: error, warn, info, debug, trace [default: info]"
        );
        println!();

        println!("Examples:");
        println!("  # Serve monitoring on port 9100");
        println!("  export PERMITGATE_MONITOR=true");
        println!("  export PERMITGATE_MONITOR_PORT=9100");
        println!();
        println!("  # Run (CLI args override env vars)");
        println!("  permitgate --monitor-port 9200  # Will use port 9200, not 9100");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Config> {
        let mut argv = vec!["permitgate"];
        argv.extend_from_slice(extra);
        Config::from_args(Args::try_parse_from(argv)?)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.pools.global, PoolBounds::new(100, 50, 200));
        assert_eq!(config.pools.identity, PoolBounds::new(5, 3, 10));
        assert_eq!(config.pools.types.len(), 4);
        assert_eq!(
            config.pools.types[0],
            TypeLimit {
                name: "llm".into(),
                bounds: PoolBounds::new(50, 25, 100)
            }
        );
        assert_eq!(config.pools.aliases.len(), 2);
        assert!(config.tuning.enabled);
        assert_eq!(config.tuning.interval, Duration::from_secs(30));
        assert_eq!(config.tuning.policy, TuningPolicy::default());
        assert_eq!(config.reaper.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.rate_limit.limits, RateLimitConfig::default());
        assert_eq!(config.rate_limit.sweep_interval, Duration::from_secs(3600));
        assert_eq!(config.guard.upstream_timeout, Duration::from_secs(60));
        assert_eq!(config.guard.stream_max_hold, Duration::from_secs(300));
        assert!(config.monitor.is_none());
    }

    #[test]
    fn test_type_limit_from_str() {
        let limit = TypeLimit::from_str("LLM=60:30:120").unwrap();
        assert_eq!(limit.name, "llm");
        assert_eq!(limit.bounds, PoolBounds::new(60, 30, 120));
        assert_eq!(limit.to_string(), "llm=60:30:120");

        let fixed = TypeLimit::from_str("embedding=8").unwrap();
        assert_eq!(fixed.bounds, PoolBounds::fixed(8));

        assert!(TypeLimit::from_str("llm").is_err());
        assert!(TypeLimit::from_str("=5").is_err());
        assert!(TypeLimit::from_str("llm=1:2").is_err());
        assert!(TypeLimit::from_str("llm=a:b:c").is_err());
    }

    #[test]
    fn test_type_alias_from_str() {
        let alias = TypeAlias::from_str("Chat=LLM").unwrap();
        assert_eq!(alias.from, "chat");
        assert_eq!(alias.to, "llm");
        assert!(TypeAlias::from_str("chat").is_err());
        assert!(TypeAlias::from_str("chat=").is_err());
    }

    #[test]
    fn test_type_limit_list() {
        let config = parse(&[
            "--type-limit",
            "llm=10:5:20,embedding=4",
            "--type-alias",
            "completion=llm",
        ])
        .unwrap();
        assert_eq!(config.pools.types.len(), 2);
        assert_eq!(config.pools.aliases[0].from, "completion");

        let gate = config.build_gate().unwrap();
        assert_eq!(gate.type_pool("completion").unwrap().capacity(), 10);
        assert_eq!(gate.type_pool("embedding").unwrap().capacity(), 4);
        assert!(gate.type_pool("tts").is_none());
    }

    #[test]
    fn test_alias_to_unknown_type_is_rejected() {
        let err = parse(&["--type-limit", "llm=10", "--type-alias", "stream=streaming"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_bounds_are_rejected() {
        assert!(parse(&["--global-concurrency", "300"]).is_err());
        assert!(parse(&["--identity-floor", "6"]).is_err());
        assert!(parse(&["--type-limit", "llm=10:20:30"]).is_err());
    }

    #[test]
    fn test_invalid_tuning_is_rejected() {
        assert!(parse(&["--shrink-factor", "1.5"]).is_err());
        assert!(parse(&["--grow-factor", "0.5"]).is_err());
        assert!(
            parse(&[
                "--memory-low-watermark",
                "90",
                "--memory-high-watermark",
                "80"
            ])
            .is_err()
        );
        assert!(parse(&["--tuning-interval-secs", "0"]).is_err());
    }

    #[test]
    fn test_invalid_rate_limit_is_rejected() {
        assert!(parse(&["--rate-limit-max-per-window", "0"]).is_err());
        assert!(parse(&["--rate-limit-window-secs", "0"]).is_err());
        assert!(parse(&["--stream-max-hold-secs", "0"]).is_err());
    }

    #[test]
    fn test_monitor_config() {
        let config = parse(&["--monitor", "--monitor-port", "9100"]).unwrap();
        let monitor = config.monitor.unwrap();
        assert_eq!(monitor.host, "127.0.0.1");
        assert_eq!(monitor.port, 9100);
    }

    #[test]
    fn test_build_rate_limiter() {
        let config = parse(&["--rate-limit-max-per-window", "5"]).unwrap();
        let limiter = config.build_rate_limiter();
        assert_eq!(limiter.config().max_per_window, 5);
        assert_eq!(limiter.remaining("user:1"), 5);
    }
}
