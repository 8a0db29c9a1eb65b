use tracing_subscriber::{fmt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG` plus `default_directive`
/// (e.g. `"bridge_stepper=info"`). Safe to call more than once.
pub fn init(default_directive: &str) {
    let mut filter = EnvFilter::from_default_env();
    for d in default_directive.split(',').filter(|d| !d.trim().is_empty()) {
        if let Ok(d) = d.trim().parse() {
            filter = filter.add_directive(d);
        }
    }
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
