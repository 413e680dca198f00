use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
        }
    }
}

impl LoggingInitOptions {
    /// Defaults plus `RUST_LOG` from the process environment.
    pub fn from_env() -> Self {
        Self {
            rust_log_env: std::env::var("RUST_LOG").ok(),
            ..Self::default()
        }
    }

    fn is_explicit(&self) -> bool {
        self.cli_log_filter.is_some() || self.verbose > 0
    }
}

/// Pick the filter directive string.
///
/// Priority: explicit filter, verbosity, `RUST_LOG`, default. The noise
/// filter is prepended only when the user did not ask for a filter directly.
pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    if !options.is_explicit() && !options.noise_filter.trim().is_empty() {
        format!("{},{user_filter}", options.noise_filter)
    } else {
        user_filter
    }
}

/// Install a stderr `fmt` subscriber. Returns `false` when a global
/// subscriber was already set.
pub fn init_logging(options: &LoggingInitOptions) -> bool {
    let filter = parse_env_filter_with_fallback(&select_log_filter(options));
    let subscriber = tracing_subscriber::registry().with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter),
    );

    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
        return false;
    }
    true
}

fn parse_env_filter_with_fallback(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!("Invalid log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'.");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
