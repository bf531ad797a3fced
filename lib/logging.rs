use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::build_info;

/// Dependencies that log every request at `info`; kept at `warn` unless `RUST_LOG` says otherwise.
const QUIET_DEPENDENCIES: [&str; 4] = ["hyper", "reqwest", "tokio_postgres", "diesel_async"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    /// Anything other than `text` selects JSON.
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "text" => Self::Text,
            _ => Self::Json,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

/// Identity fields attached to the bootstrap event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingContext {
    pub service: String,
    pub mode: String,
    pub environment: String,
    pub run_id: String,
    pub format: LogFormat,
}

impl LoggingContext {
    fn from_lookup<F>(service: &str, mode: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let started_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();

        Self {
            service: service.to_string(),
            mode: mode.to_string(),
            environment: lookup("APP_ENV")
                .or_else(|| lookup("ENVIRONMENT"))
                .unwrap_or_else(|| "dev".to_string()),
            run_id: format!("{service}-{mode}-{started_ms:x}"),
            format: LogFormat::parse(lookup("LOG_FORMAT").as_deref()),
        }
    }
}

/// Installs the global subscriber and logs one `logging_initialized` event.
///
/// `RUST_LOG` wins over `default_level`. Calling this twice keeps the first subscriber.
pub fn init_logging(service: &str, mode: &str, default_level: &str) -> LoggingContext {
    let context = LoggingContext::from_lookup(service, mode, |name| std::env::var(name).ok());

    let _ = LogTracer::init();
    let filter = env_filter(std::env::var("RUST_LOG").ok().as_deref(), default_level);
    let registry = tracing_subscriber::registry().with(filter);
    let _ = match context.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    tracing::info!(
        event = "logging_initialized",
        service = %context.service,
        mode = %context.mode,
        environment = %context.environment,
        run_id = %context.run_id,
        version = build_info::VERSION,
        commit = build_info::short_commit_hash(),
        log_format = context.format.as_str(),
        "logging ready"
    );

    context
}

fn env_filter(rust_log: Option<&str>, default_level: &str) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|value| !value.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }

    let mut directives = default_level.to_string();
    for dependency in QUIET_DEPENDENCIES {
        let _ = write!(directives, ",{dependency}=warn");
    }
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Renders `err` and every `source()` below it, one per line, followed by a backtrace.
///
/// Used once at the process boundary; inside the service errors are logged as fields.
pub fn format_error_report(err: &(dyn StdError + 'static)) -> String {
    let mut report = format!("error: {err}");
    let chain = std::iter::successors(err.source(), |source| (*source).source());
    for (depth, source) in chain.enumerate() {
        let _ = write!(report, "\n  {}: {source}", depth + 1);
    }
    let _ = write!(report, "\nbacktrace:\n{}", Backtrace::force_capture());
    report
}
