use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Per-IP sliding window over the last minute of accepted connections.
pub struct RateLimiter {
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    max_per_minute: usize,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_per_minute,
        }
    }

    pub fn allow(&mut self, addr: IpAddr) -> bool {
        self.allow_at(addr, Instant::now())
    }

    fn allow_at(&mut self, addr: IpAddr, now: Instant) -> bool {
        // Drop idle peers first so the map does not grow without bound.
        self.connections
            .retain(|_, entries| entries.back().is_some_and(|&t| now - t <= WINDOW));

        let entries = self.connections.entry(addr).or_default();
        while let Some(&time) = entries.front() {
            if now.duration_since(time) > WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.max_per_minute {
            false
        } else {
            entries.push_back(now);
            true
        }
    }
}
