//! Tracing subscriber setup.

use std::collections::BTreeMap;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crates whose level `--verbose` raises.
const COMPONENTS: &[&str] = &["ledgerrpc-core", "ledgerrpc-http", "ledgerrpc-ws", "ledgerrpc"];

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level for every crate.
    pub level: String,
    /// Per-crate overrides, crate name to level.
    pub components: BTreeMap<String, String>,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            components: COMPONENTS.iter().map(|c| (c.to_string(), "info".to_string())).collect(),
            json: false,
        }
    }
}

impl LogConfig {
    pub fn verbose(mut self) -> Self {
        for level in self.components.values_mut() {
            *level = "debug".into();
        }
        self
    }

    /// `"warn,ledgerrpc_core=info,..."`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber; `RUST_LOG` wins over `config`. Logs go to
/// stderr so command output on stdout stays pipeable.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}
