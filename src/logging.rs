//! Log output for loops and their forked children
//!
//! Lines look like `[reactor 4242 12:30:01] => forked child 4243`. The pid
//! is read when the line is written, so every process of a tree tags its own
//! output even though they all share the logger installed before forking.

use crate::config::LoopConfig;
use std::io::Write;

/// Last path segment of a log target (`procloop::reactor::io` -> `io`)
fn context(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

/// Install the global logger. Later calls are no-ops.
pub fn init(config: &LoopConfig) {
    let _ = env_logger::Builder::new()
        .parse_filters(&config.log_filter)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] => {}",
                context(record.target()),
                std::process::id(),
                chrono::Local::now().format("%H:%M:%S"),
                record.args()
            )
        })
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_last_segment() {
        assert_eq!(context("procloop::reactor::io"), "io");
        assert_eq!(context("procloopd"), "procloopd");
    }

    #[test]
    fn test_init_twice() {
        let config = LoopConfig::default();
        init(&config);
        init(&config);
        log::debug!("logger installed");
    }
}
