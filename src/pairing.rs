//! One-time pairing codes binding a viewer to a waiting controller.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;

/// Resample bound for code collisions. At 10^6 possible codes a collision
/// streak this long means the directory is effectively full.
const MAX_CODE_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Invalid or expired pairing code")]
    InvalidCode,
    #[error("Controller device not available")]
    ControllerUnavailable,
    #[error("Not paired with a device")]
    NotPaired,
    #[error("Pairing code space exhausted")]
    CodeSpaceExhausted,
}

#[derive(Debug, Clone)]
struct PairCodeEntry {
    controller_id: String,
    expires_at: Instant,
}

/// Maps live 6-digit codes to the controller that generated them.
///
/// All operations take `now` explicitly so expiry behavior is testable with
/// an injected clock.
#[derive(Debug)]
pub struct PairingDirectory {
    codes: DashMap<String, PairCodeEntry>,
    ttl: Duration,
}

impl PairingDirectory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            codes: DashMap::new(),
            ttl,
        }
    }

    /// Lifetime of a freshly created code, in whole seconds.
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Draw a uniform random 6-digit code not currently live and store it
    /// against `controller_id`.
    pub fn create(&self, controller_id: &str, now: Instant) -> Result<String, PairingError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
            match self.codes.entry(code.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(PairCodeEntry {
                        controller_id: controller_id.to_string(),
                        expires_at: now + self.ttl,
                    });
                    return Ok(code);
                }
            }
        }
        Err(PairingError::CodeSpaceExhausted)
    }

    /// Redeem a code. A hit deletes it immediately (one-time use); an expired
    /// entry is deleted and treated as a miss.
    pub fn consume(&self, code: &str, now: Instant) -> Option<String> {
        let (_, entry) = self.codes.remove(code)?;
        if now >= entry.expires_at {
            return None;
        }
        Some(entry.controller_id)
    }

    /// Free a code without redeeming it (owner disconnect or supersede).
    pub fn remove(&self, code: &str) {
        self.codes.remove(code);
    }

    /// Delete every code past its expiry. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.codes.len();
        self.codes.retain(|_, entry| now < entry.expires_at);
        before - self.codes.len()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}
