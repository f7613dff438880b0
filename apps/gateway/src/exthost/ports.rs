//! Debug-port allocation for extension-host inspectors.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

/// Total bind probes before the allocator gives up.
const MAX_ATTEMPTS: usize = 6000;

/// Consecutive ports probed per random base.
const WINDOW: u16 = 10;

/// How long an allocated port stays reserved against concurrent allocations.
const RESERVATION_TTL: Duration = Duration::from_secs(10);

fn reservations() -> &'static Mutex<HashMap<u16, Instant>> {
    static RESERVED: OnceLock<Mutex<HashMap<u16, Instant>>> = OnceLock::new();
    RESERVED.get_or_init(|| Mutex::new(HashMap::new()))
}

fn try_reserve(port: u16) -> bool {
    let mut reserved = reservations().lock();
    let now = Instant::now();
    reserved.retain(|_, at| now.duration_since(*at) < RESERVATION_TTL);
    if reserved.contains_key(&port) {
        return false;
    }
    reserved.insert(port, now);
    true
}

/// Allocate a free TCP port: pick a random base, probe a window of
/// consecutive ports by binding, retry with fresh bases up to the attempt
/// budget. Returns `None` when the budget is exhausted.
pub async fn find_free_port() -> Option<u16> {
    let mut attempts = 0usize;
    while attempts < MAX_ATTEMPTS {
        let base: u16 = rand::thread_rng().gen_range(1025..=u16::MAX - WINDOW);
        for offset in 0..WINDOW {
            attempts += 1;
            let port = base + offset;
            if !try_reserve(port) {
                continue;
            }
            if tokio::net::TcpListener::bind(("0.0.0.0", port)).await.is_ok() {
                // The probe listener is dropped; the reservation covers the
                // window until the worker binds it.
                return Some(port);
            }
            if attempts >= MAX_ATTEMPTS {
                break;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_a_bindable_port() {
        let port = find_free_port().await.expect("a free port exists");
        assert!(port >= 1025);
        // The reservation prevents immediate reuse, so bind directly.
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn concurrent_allocations_do_not_collide() {
        let (a, b) = tokio::join!(find_free_port(), find_free_port());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);
    }
}
