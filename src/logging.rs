use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "glowcache.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the level is `info`, or `debug` when
/// `verbose`. With a `log_dir` the output goes to a daily rolling file and the
/// returned guard must be held until exit so buffered lines are flushed.
pub fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(default_level(verbose)));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      None
    }
  }
}

fn default_level(verbose: bool) -> &'static str {
  if verbose {
    "debug"
  } else {
    "info"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_level() {
    assert_eq!(default_level(false), "info");
    assert_eq!(default_level(true), "debug");
  }
}
