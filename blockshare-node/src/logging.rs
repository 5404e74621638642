use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// Filter priority:
/// 1) RUST_LOG
/// 2) BLOCKSHARE_LOG (already folded into `default_level` by config loading)
/// 3) `default_level` from the config (info unless set)
///
/// Example: RUST_LOG=info,blockshare_node=debug
pub fn init_tracing(default_level: &str) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| EnvFilter::try_new(s).ok())
        .or_else(|| EnvFilter::try_new(default_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .try_init();
}
