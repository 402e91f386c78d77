use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Error;

/// Which I/O backend a reactor drives.
///
/// The portable (epoll) backend lives out of tree; `Auto` resolves to
/// io_uring or fails with `Error::Unsupported` at reactor construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Pick the best backend available on this kernel.
    Auto,
    /// Require io_uring; fail if the kernel lacks it.
    Uring,
}

/// Configuration for a reactor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reactor name. `None` picks `reactor-N` from a process-wide counter.
    pub name: Option<String>,
    /// I/O backend selection.
    pub backend: Backend,
    /// Number of submission ring entries. Must be a power of two.
    pub sq_entries: u32,
    /// Capacity of the reactor-local task queue.
    pub local_task_queue_capacity: usize,
    /// Capacity of the task queue fed from other threads.
    pub external_task_queue_capacity: usize,
    /// Capacity of the deadline task queue.
    pub deadline_task_queue_capacity: usize,
    /// Maximum tasks processed per event-loop iteration before I/O is
    /// checked again. Prevents task starvation of the I/O path.
    pub batch_size: usize,
    /// Number of tasks processed between clock refreshes.
    pub clock_refresh_period: u32,
    /// Time budget for a single task before it counts against the quota.
    pub task_quota: Duration,
    /// Duration above which a task is reported as hogging the loop.
    pub hog_threshold: Duration,
    /// Interval between I/O polls while the loop is busy with tasks.
    pub io_interval: Duration,
    /// Busy-spin when idle instead of blocking in the kernel.
    pub spin: bool,
    /// Pin the reactor thread to this CPU core.
    pub pin_to_core: Option<usize>,
    /// Size of the per-socket receive buffer in bytes.
    pub recv_buffer_size: usize,
    /// Default capacity of a socket's outbound write queue.
    pub write_queue_capacity: usize,
    /// Maximum sockets on this reactor; also sizes the scheduler queue.
    pub max_sockets: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            backend: Backend::Auto,
            sq_entries: 256,
            local_task_queue_capacity: 65536,
            external_task_queue_capacity: 65536,
            deadline_task_queue_capacity: 4096,
            batch_size: 64,
            clock_refresh_period: 16,
            task_quota: Duration::from_micros(500),
            hog_threshold: Duration::from_micros(500),
            io_interval: Duration::from_micros(10),
            spin: false,
            pin_to_core: None,
            recv_buffer_size: 65536,
            write_queue_capacity: 2 << 16,
            max_sockets: 16384,
        }
    }
}

impl Config {
    /// Validate all tunables. Called by `Reactor::new`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "sq_entries must be a power of two, got {}",
                self.sq_entries
            )));
        }
        check_positive(self.local_task_queue_capacity, "local_task_queue_capacity")?;
        check_positive(
            self.external_task_queue_capacity,
            "external_task_queue_capacity",
        )?;
        check_positive(
            self.deadline_task_queue_capacity,
            "deadline_task_queue_capacity",
        )?;
        check_positive(self.batch_size, "batch_size")?;
        check_positive(self.recv_buffer_size, "recv_buffer_size")?;
        check_positive(self.write_queue_capacity, "write_queue_capacity")?;
        check_positive(self.max_sockets, "max_sockets")?;
        if self.task_quota.is_zero() {
            return Err(Error::InvalidConfig("task_quota must be positive".into()));
        }
        if self.hog_threshold.is_zero() {
            return Err(Error::InvalidConfig(
                "hog_threshold must be positive".into(),
            ));
        }
        if self.io_interval.is_zero() {
            return Err(Error::InvalidConfig("io_interval must be positive".into()));
        }
        Ok(())
    }

    /// Resolve the configured name, falling back to the generated default.
    pub(crate) fn reactor_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => next_reactor_name(),
        }
    }
}

fn check_positive(value: usize, name: &str) -> Result<(), Error> {
    if value == 0 {
        return Err(Error::InvalidConfig(format!("{name} must be positive")));
    }
    Ok(())
}

static REACTOR_ID: AtomicU64 = AtomicU64::new(0);

/// Default reactor names come from a process-wide counter.
fn next_reactor_name() -> String {
    format!("reactor-{}", REACTOR_ID.fetch_add(1, Ordering::Relaxed) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_sq_entries_must_be_power_of_two() {
        let mut config = Config::default();
        config.sq_entries = 100;
        assert!(config.validate().is_err());
        config.sq_entries = 0;
        assert!(config.validate().is_err());
        config.sq_entries = 128;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacities_rejected() {
        let mut config = Config::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.external_task_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.write_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let mut config = Config::default();
        config.task_quota = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_names_are_unique() {
        let a = Config::default().reactor_name();
        let b = Config::default().reactor_name();
        assert_ne!(a, b);
        assert!(a.starts_with("reactor-"));
    }

    #[test]
    fn test_explicit_name_wins() {
        let mut config = Config::default();
        config.name = Some("net-0".to_string());
        assert_eq!(config.reactor_name(), "net-0");
    }
}
