use std::str::FromStr;

/// How a connection's reader is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// A watcher waits for the socket to become readable, then a pooled
    /// worker reads exactly one frame.
    EventDriven,
    /// A dedicated reader loop per connection.
    Blocking,
}

impl PumpMode {
    /// Event-driven where the OS offers epoll or kqueue, blocking elsewhere.
    pub fn detect() -> Self {
        if cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        )) {
            PumpMode::EventDriven
        } else {
            PumpMode::Blocking
        }
    }
}

impl FromStr for PumpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "event" | "event-driven" | "epoll" => Ok(PumpMode::EventDriven),
            "blocking" => Ok(PumpMode::Blocking),
            "auto" | "" => Ok(PumpMode::detect()),
            other => Err(format!("unknown pump mode: {}", other)),
        }
    }
}

/// Size of the process-wide reader pool.
pub fn default_reader_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}
