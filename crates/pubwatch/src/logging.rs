//! Tracing setup shared by the `pubwatch` and `pubwatch-supervisor` binaries.

use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "pubwatch=info,notify=info,supervisor=info,warn";
const VERBOSE_DIRECTIVES: &str = "pubwatch=debug,notify=debug,supervisor=debug,info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `RUST_LOG` wins over `--verbose`.
pub fn init(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_DIRECTIVES
        } else {
            DEFAULT_DIRECTIVES
        })
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .init(),
    }
}
