/// Development helper: initialize tracing subscriber when `RUST_LOG` is set.
///
/// Tests, benches and demos can call `zgate::dev_tracing::init_tracing()` to
/// see the `[MONITOR]`/`[SOCKET]` logs. This is a no-op when `RUST_LOG` is not
/// set or when a global subscriber is already installed.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    // Another subscriber may already be installed by the host.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}
