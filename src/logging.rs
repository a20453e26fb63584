//! Tracing subscriber setup for the command line

use std::io::{self, IsTerminal};

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Error, Result};

/// Default filter for a `-v` count; `RUST_LOG` overrides it
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "mmwave_amca=info,warn",
        1 => "mmwave_amca=debug,info",
        2 => "mmwave_amca=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber: JSON lines or human-readable text
pub fn init_logging(verbosity: u8, json_output: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let installed = if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).try_init()
    } else if io::stdout().is_terminal() {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    installed.map_err(|e| Error::internal(format!("failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_widens_filter() {
        assert_eq!(default_filter(0), "mmwave_amca=info,warn");
        assert_eq!(default_filter(2), "mmwave_amca=trace,debug");
        assert_eq!(default_filter(9), "trace");
    }
}
