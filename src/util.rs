static INIT_ONCE: std::sync::Once = std::sync::Once::new();
pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

/// Trimmed, lowercased source name without a leading `r/` or `/r/`.
pub fn normalize_source(name: &str) -> String {
    let s = name.trim().to_lowercase();
    let s = s.strip_prefix('/').unwrap_or(&s);
    s.strip_prefix("r/").unwrap_or(s).trim_end_matches('/').to_string()
}
