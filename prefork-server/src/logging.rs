use std::fmt;
use std::time::Instant;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

use crate::config::LogConfig;

/// Elapsed time since start-up, optionally followed by the id of the process
/// that emitted the event. The id is looked up per event: the subscriber is
/// installed before fork and inherited by every worker.
struct Elapsed {
    start: Instant,
    timestamps: bool,
    pid: bool,
}

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        if self.timestamps {
            let d = self.start.elapsed();
            let total_secs = d.as_secs();
            let mins = total_secs / 60;
            let secs = total_secs % 60;
            let millis = d.subsec_millis();
            write!(w, "[{mins:02}:{secs:02}:{millis:03}]")?;
        }
        if self.pid {
            write!(w, "[{}]", std::process::id())?;
        }
        Ok(())
    }
}

/// Install the global `fmt` subscriber. Must run before the pool forks.
pub fn init(config: &LogConfig) {
    if config.disabled {
        return;
    }
    tracing_subscriber::fmt()
        .with_timer(Elapsed {
            start: Instant::now(),
            timestamps: config.timestamps,
            pid: config.pid,
        })
        .with_max_level(tracing::Level::from(config.level))
        .with_ansi(config.colors)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(timer: &Elapsed) -> String {
        let mut out = String::new();
        timer.format_time(&mut Writer::new(&mut out)).unwrap();
        out
    }

    #[test]
    fn prints_elapsed_and_pid() {
        let timer = Elapsed {
            start: Instant::now(),
            timestamps: true,
            pid: true,
        };
        let out = render(&timer);
        assert!(out.starts_with("[00:00:"), "{out}");
        assert!(out.ends_with(&format!("[{}]", std::process::id())), "{out}");
    }

    #[test]
    fn prints_nothing_when_both_disabled() {
        let timer = Elapsed {
            start: Instant::now(),
            timestamps: false,
            pid: false,
        };
        assert_eq!(render(&timer), "");
    }

    #[test]
    fn pid_only() {
        let timer = Elapsed {
            start: Instant::now(),
            timestamps: false,
            pid: true,
        };
        assert_eq!(render(&timer), format!("[{}]", std::process::id()));
    }
}
