//! Readiness probing.
//!
//! A freshly created VM takes a while to boot and start sshd. The prober
//! runs a trivial remote command at a fixed interval until it succeeds or
//! the attempt budget runs out.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::config::ReadinessConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::remote::{RemoteShell, RemoteTarget};

/// Command used to check that the VM accepts authenticated commands.
pub const PROBE_COMMAND: &str = "true";

/// Waits between probe attempts.
///
/// Production code uses [`TokioSleeper`]; tests substitute a recorder.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Non-blocking tokio timer. Dropping the future cancels the wait.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded, fixed-interval readiness probe.
pub struct ReadinessProber<'a> {
    shell: &'a dyn RemoteShell,
    sleeper: &'a dyn Sleeper,
    max_attempts: u32,
    interval: Duration,
}

impl<'a> ReadinessProber<'a> {
    pub fn new(shell: &'a dyn RemoteShell, sleeper: &'a dyn Sleeper, config: &ReadinessConfig) -> Self {
        Self {
            shell,
            sleeper,
            max_attempts: config.max_attempts.max(1),
            interval: config.interval(),
        }
    }

    /// Probe `target` until it answers.
    ///
    /// Returns the number of attempts used. Sleeps only between attempts,
    /// never after the last one.
    #[instrument(skip(self, target), fields(address = %target.address, max_attempts = self.max_attempts))]
    pub async fn wait_ready(&self, target: &RemoteTarget) -> ProvisionResult<u32> {
        for attempt in 1..=self.max_attempts {
            match self.shell.exec(target, PROBE_COMMAND).await {
                Ok(output) if output.success() => {
                    info!(attempt, "VM accepts remote commands");
                    return Ok(attempt);
                }
                Ok(output) => {
                    warn!(attempt, exit_code = ?output.exit_code, stderr = %output.stderr.trim(), "Readiness probe failed");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Readiness probe failed");
                }
            }

            if attempt < self.max_attempts {
                self.sleeper.sleep(self.interval).await;
            }
        }

        Err(ProvisionError::Timeout {
            address: target.address.clone(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CommandOutput;
    use crate::types::Secret;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyShell {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyShell {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteShell for FlakyShell {
        async fn exec(&self, target: &RemoteTarget, _command: &str) -> ProvisionResult<CommandOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                if call % 2 == 0 {
                    Err(ProvisionError::RemoteShell {
                        address: target.address.clone(),
                        reason: "connection refused".into(),
                    })
                } else {
                    Ok(CommandOutput {
                        exit_code: Some(255),
                        stdout: String::new(),
                        stderr: "ssh: connect to host: Connection refused".into(),
                    })
                }
            } else {
                Ok(CommandOutput {
                    exit_code: Some(0),
                    ..Default::default()
                })
            }
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    fn target() -> RemoteTarget {
        RemoteTarget::new("192.0.2.10", "root", Secret::new("pw"))
    }

    fn config(max_attempts: u32) -> ReadinessConfig {
        ReadinessConfig {
            max_attempts,
            interval_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_ready_immediately() {
        let shell = FlakyShell::new(0);
        let sleeper = RecordingSleeper::default();
        let prober = ReadinessProber::new(&shell, &sleeper, &config(10));

        assert_eq!(prober.wait_ready(&target()).await.unwrap(), 1);
        assert!(sleeper.sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ready_after_failures() {
        for failures in 1..10 {
            let shell = FlakyShell::new(failures);
            let sleeper = RecordingSleeper::default();
            let prober = ReadinessProber::new(&shell, &sleeper, &config(10));

            let attempts = prober.wait_ready(&target()).await.unwrap();
            assert_eq!(attempts, failures + 1);
            assert_eq!(shell.calls.load(Ordering::SeqCst), failures + 1);

            let sleeps = sleeper.sleeps.lock().unwrap();
            assert_eq!(sleeps.len() as u32, failures);
            assert!(sleeps.iter().all(|d| *d == Duration::from_secs(30)));
        }
    }

    #[tokio::test]
    async fn test_timeout_exhausts_attempts() {
        let shell = FlakyShell::new(u32::MAX);
        let sleeper = RecordingSleeper::default();
        let prober = ReadinessProber::new(&shell, &sleeper, &config(10));

        let err = prober.wait_ready(&target()).await.unwrap_err();
        match err {
            ProvisionError::Timeout { address, attempts } => {
                assert_eq!(address, "192.0.2.10");
                assert_eq!(attempts, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(shell.calls.load(Ordering::SeqCst), 10);
        assert_eq!(sleeper.sleeps.lock().unwrap().len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_sleeper_uses_virtual_time() {
        let shell = FlakyShell::new(2);
        let sleeper = TokioSleeper;
        let prober = ReadinessProber::new(&shell, &sleeper, &config(5));

        let started = tokio::time::Instant::now();
        assert_eq!(prober.wait_ready(&target()).await.unwrap(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }
}
