//! Tandem worker process.
//!
//! Serves the built-in modules to a parent over length-prefixed frames on
//! stdin/stdout. Logs go to stderr.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!("worker {} starting", std::process::id());
    tandem_core::serve_stdio(
        Arc::new(tandem_worker::builtin_modules()),
        Arc::new(tandem_worker::builtin_errors()),
    )
    .await?;
    tracing::debug!("worker {} exiting", std::process::id());
    Ok(())
}
