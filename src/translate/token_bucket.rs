//! TokenBucket (§4.6): admits bursts up to `capacity`, steady-state rate
//! `rpm_limit` requests/minute.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

struct State {
    tokens: f64,
    last_update: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64, // tokens per second
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(rpm_limit: u32, capacity: f64) -> Self {
        Self {
            capacity,
            refill_rate: rpm_limit as f64 / 60.0,
            state: Mutex::new(State {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn with_default_capacity(rpm_limit: u32) -> Self {
        Self::new(rpm_limit, 10.0)
    }

    /// Block until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let sleep_for = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_update).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
                state.last_update = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64((deficit / self.refill_rate).max(0.01)))
                }
            };

            match sleep_for {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}
