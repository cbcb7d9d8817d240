use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Sliding-window throttle over a single connection's inbound events.
/// Timestamps older than the window are evicted before the limit check.
pub(crate) fn allow_gateway_ingress(
    ingress: &mut VecDeque<Instant>,
    limit: u32,
    window: Duration,
) -> bool {
    let now = Instant::now();
    while ingress
        .front()
        .is_some_and(|oldest| now.duration_since(*oldest) > window)
    {
        let _ = ingress.pop_front();
    }

    if ingress.len() >= limit as usize {
        return false;
    }

    ingress.push_back(now);
    true
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        time::{Duration, Instant},
    };

    use super::allow_gateway_ingress;

    #[test]
    fn admits_events_under_the_limit() {
        let mut ingress = VecDeque::new();
        assert!(allow_gateway_ingress(
            &mut ingress,
            2,
            Duration::from_secs(10),
        ));
        assert!(allow_gateway_ingress(
            &mut ingress,
            2,
            Duration::from_secs(10),
        ));
        assert_eq!(ingress.len(), 2);
    }

    #[test]
    fn rejects_when_the_window_is_full() {
        let mut ingress = VecDeque::new();
        let now = Instant::now();
        ingress.push_back(now - Duration::from_millis(100));
        ingress.push_back(now - Duration::from_millis(20));

        assert!(!allow_gateway_ingress(
            &mut ingress,
            2,
            Duration::from_secs(10),
        ));
        assert_eq!(ingress.len(), 2);
    }

    #[test]
    fn expired_entries_free_up_the_window() {
        let mut ingress = VecDeque::new();
        ingress.push_back(Instant::now() - Duration::from_secs(30));

        assert!(allow_gateway_ingress(
            &mut ingress,
            1,
            Duration::from_secs(10),
        ));
        assert_eq!(ingress.len(), 1);
    }
}
