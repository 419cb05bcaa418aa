use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Bounded-lifetime control input handed to the forward primitive. It
/// carries no data: its only job is to make the primitive give control
/// back once the window closes, even when the tunnel is otherwise fine.
#[derive(Debug)]
pub(crate) struct IdleWindow {
    deadline: Instant,
}

impl IdleWindow {
    pub fn start(duration: Duration) -> Self {
        IdleWindow {
            deadline: Instant::now() + duration,
        }
    }
    /// resolves once the window has closed
    pub async fn expired(&self) {
        sleep_until(self.deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_duration() {
        let started = Instant::now();
        let window = IdleWindow::start(Duration::from_secs(180));
        window.expired().await;
        assert!(started.elapsed() >= Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_expire_early() {
        let window = IdleWindow::start(Duration::from_secs(180));
        let early = tokio::time::timeout(Duration::from_secs(179), window.expired()).await;
        assert!(early.is_err());
    }
}
