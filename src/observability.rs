use crate::config::ObservabilityCfg;
use tracing_subscriber::EnvFilter;

/// Engine crate at debug, dependencies at info, unless RUST_LOG says
/// otherwise.
const DEFAULT_FILTER: &str = "info,tradefleet=debug";

pub fn init_tracing(cfg: &ObservabilityCfg) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if cfg.log_json {
        // JSON lines for log shippers; span context stays out of the
        // per-event payload.
        builder.json().with_current_span(false).init();
    } else {
        builder.init();
    }
    Ok(())
}
