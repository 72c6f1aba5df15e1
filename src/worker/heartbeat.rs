use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use crate::protocol::ControllerMessage;
use crate::transport::WorkerChannel;

/// Controller-side probe that periodically sends heartbeats to one worker.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
        }
    }

    /// Send heartbeats until the worker is killed or its channel closes.
    pub async fn run(&self, channel: WorkerChannel) {
        let mut interval = tokio::time::interval(self.interval);
        let stop = channel.kill_token();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if channel.send(ControllerMessage::heartbeat()).is_err() {
                        break;
                    }
                }
                _ = stop.cancelled() => break,
            }
        }
        tracing::trace!(worker = channel.worker(), "Heartbeat stopped");
    }

    pub fn spawn(self, channel: WorkerChannel) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(channel).await })
    }
}

/// Worker-side countdown, restarted by every heartbeat.
///
/// Completes once `timeout` passes without a [`Liveness::reset`].
pub struct Liveness {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl Liveness {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    pub fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Future for Liveness {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}
