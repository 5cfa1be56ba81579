use anyhow::{anyhow, Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub(crate) const LOG_ENV: &str = "CHAINER_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

/// `--log-level` wins over `CHAINER_LOG`; blank values fall through.
pub(crate) fn resolve_log_filter(explicit: Option<&str>, env_value: Option<&str>) -> String {
    [explicit, env_value]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

/// Logs go to stderr so stdout stays usable for `plan --json`. The elevated
/// worker initialises logging the same way.
pub(crate) fn init_tracing(explicit: Option<&str>) -> Result<()> {
    let env_value = std::env::var(LOG_ENV).ok();
    let directive = resolve_log_filter(explicit, env_value.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log filter '{directive}'"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|err| anyhow!("failed initialising logging: {err}"))
}
