pub mod config;
pub mod environ;
pub mod error;
pub mod idmap;
pub mod namespace;
pub mod pidfile;
pub mod rendezvous;

/// Install the crate's standard `tracing` subscriber. Shared by all four
/// binaries so their log format and `RUST_LOG` handling stay identical.
pub fn init_logging(default_directive: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_directive.parse()?),
        )
        .init();
    Ok(())
}
