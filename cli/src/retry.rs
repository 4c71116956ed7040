//! Re-sending simulator requests the server did not accept
//!
//! A simulated device keeps its batch and posts it again after a pause that
//! doubles on every rejection, the way a field device waits out a server
//! restart. The pause never exceeds [`MAX_PAUSE`].

use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const MAX_PAUSE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Sends per request, including the first; zero is treated as one
    pub attempts: u32,
    /// Pause after the first rejection
    pub first_pause: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, first_pause: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            first_pause,
        }
    }

    /// Pause taken after the `rejection`-th failed send (1-based).
    pub fn pause(&self, rejection: u32) -> Duration {
        let factor = 2u32.saturating_pow(rejection.saturating_sub(1));
        self.first_pause.saturating_mul(factor).min(MAX_PAUSE)
    }

    /// Send `request` until it is accepted or the attempts run out; the last
    /// error is returned.
    pub async fn send<F, Fut, T, E>(&self, request: &str, mut send: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut rejection = 0;
        loop {
            match send().await {
                Ok(accepted) => return Ok(accepted),
                Err(e) if rejection + 1 >= self.attempts => return Err(e),
                Err(e) => {
                    rejection += 1;
                    let pause = self.pause(rejection);
                    warn!(
                        request,
                        attempt = rejection,
                        of = self.attempts,
                        "request not accepted, resending in {:?}: {}",
                        pause,
                        e
                    );
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}
