//! Tracing initialisation and sandbox-scoped spans.
//!
//! Filter policy: `RUST_LOG` wins when set. Otherwise `REEF_LOG` supplies
//! the directive (e.g. `REEF_LOG=reef=debug`), and the fallback keeps this
//! crate at `info` while quieting everything else.
//!
//! Every log line about a sandbox must carry its identity triple; instead
//! of repeating the fields at each call site, lifecycle operations run
//! inside a [`sandbox_span`]. Background tasks that outlive the operation
//! (the health loop, the overlay servicing loop) attach the fields
//! themselves.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::sandbox::SandboxMetadata;

const FALLBACK_DIRECTIVE: &str = "reef=info,warn";

/// Flushes buffered file output when dropped. Hold it for the lifetime of
/// the host process.
pub struct LogGuard {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter() -> EnvFilter {
    if let Ok(from_rust_log) = EnvFilter::try_from_default_env() {
        return from_rust_log;
    }
    std::env::var("REEF_LOG")
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(FALLBACK_DIRECTIVE))
}

/// Initialise the global subscriber.
///
/// Stderr always gets the filtered stream. Passing a directory adds a
/// daily-rolling `reef.log` there (ANSI stripped) for the host's log
/// collector to pick up.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file = log_dir.map(|dir| {
        let _ = std::fs::create_dir_all(dir);
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "reef.log"))
    });

    match file {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            LogGuard { _file: Some(guard) }
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .init();
            LogGuard { _file: None }
        }
    }
}

/// The span a sandbox's lifecycle operations run inside: construction,
/// snapshotting, teardown. Carries the identity triple so the events
/// emitted underneath stay attributable without per-call fields.
pub fn sandbox_span(meta: &SandboxMetadata) -> tracing::Span {
    tracing::info_span!(
        "sandbox",
        sandbox_id = %meta.sandbox_id,
        template_id = %meta.template_id,
        team_id = %meta.team_id,
    )
}
