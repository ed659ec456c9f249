//! Reconnection state machine.
//!
//! Pure transitions over `Idle -> Connecting -> Connected -> Idle`; the
//! runner feeds it events and performs the returned [`Action`]. At most one
//! retry is scheduled at any time.

use std::time::Duration;

/// Close codes after which no retry is scheduled: normal closure and
/// supersession by a newer connection for the same identity.
pub const CLEAN_CLOSE_CODES: [u16; 2] = [1000, 4000];

pub fn is_clean_close(code: Option<u16>) -> bool {
    code.is_some_and(|c| CLEAN_CLOSE_CODES.contains(&c))
}

/// `base * 2^(attempt-1)`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
}

/// What the runner must do after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Nothing,
    Connect,
    ScheduleRetry { attempt: u32, delay: Duration },
    /// Close the current socket with the normal code.
    CloseSocket,
    /// Retries exhausted.
    GiveUp,
}

#[derive(Debug)]
pub struct Reconnector {
    state: ConnState,
    attempt: u32,
    retry_scheduled: bool,
    online: bool,
    rejected: bool,
    base_delay: Duration,
    max_attempts: u32,
}

impl Reconnector {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            state: ConnState::Idle,
            attempt: 0,
            retry_scheduled: false,
            online: true,
            rejected: false,
            base_delay,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retry_scheduled(&self) -> bool {
        self.retry_scheduled
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    /// Initial connect request.
    pub fn start(&mut self, has_token: bool) -> Action {
        self.try_connect(has_token)
    }

    pub fn on_open(&mut self) {
        self.state = ConnState::Connected;
        self.attempt = 0;
        self.retry_scheduled = false;
    }

    /// The socket closed, or a connect attempt failed (`code` is `None`).
    pub fn on_close(&mut self, code: Option<u16>, has_token: bool) -> Action {
        self.state = ConnState::Idle;
        if is_clean_close(code) || !has_token {
            self.attempt = 0;
            self.retry_scheduled = false;
            return Action::Nothing;
        }
        if !self.online || self.retry_scheduled {
            return Action::Nothing;
        }
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            self.attempt = 0;
            return Action::GiveUp;
        }
        self.retry_scheduled = true;
        Action::ScheduleRetry {
            attempt: self.attempt,
            delay: backoff_delay(self.base_delay, self.attempt),
        }
    }

    /// The coordinator refused the token; no retry until it changes.
    pub fn on_rejected(&mut self) {
        self.rejected = true;
        self.state = ConnState::Idle;
        self.attempt = 0;
        self.retry_scheduled = false;
    }

    /// A scheduled retry delay elapsed.
    pub fn on_retry_elapsed(&mut self, has_token: bool) -> Action {
        if !self.retry_scheduled {
            return Action::Nothing;
        }
        self.retry_scheduled = false;
        self.try_connect(has_token)
    }

    pub fn on_offline(&mut self) -> Action {
        self.online = false;
        self.attempt = 0;
        self.retry_scheduled = false;
        let was_active = self.state != ConnState::Idle;
        self.state = ConnState::Idle;
        if was_active {
            Action::CloseSocket
        } else {
            Action::Nothing
        }
    }

    pub fn on_online(&mut self, has_token: bool) -> Action {
        self.online = true;
        if self.retry_scheduled {
            return Action::Nothing;
        }
        self.try_connect(has_token)
    }

    /// The token was set, replaced or removed.
    pub fn on_token_changed(&mut self, has_token: bool) -> Action {
        self.rejected = false;
        if has_token {
            return self.try_connect(has_token);
        }
        self.attempt = 0;
        self.retry_scheduled = false;
        if self.state != ConnState::Idle {
            self.state = ConnState::Idle;
            Action::CloseSocket
        } else {
            Action::Nothing
        }
    }

    fn try_connect(&mut self, has_token: bool) -> Action {
        if self.state != ConnState::Idle || !self.online || !has_token || self.rejected {
            return Action::Nothing;
        }
        self.state = ConnState::Connecting;
        Action::Connect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);

    fn connected(max: u32) -> Reconnector {
        let mut r = Reconnector::new(BASE, max);
        assert_eq!(r.start(true), Action::Connect);
        r.on_open();
        r
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(BASE, 1), BASE);
        assert_eq!(backoff_delay(BASE, 2), BASE * 2);
        assert_eq!(backoff_delay(BASE, 3), BASE * 4);
        assert_eq!(backoff_delay(BASE, 4), BASE * 8);
        assert_eq!(backoff_delay(BASE, 100), Duration::MAX);
    }

    #[test]
    fn start_requires_token() {
        let mut r = Reconnector::new(BASE, 3);
        assert_eq!(r.start(false), Action::Nothing);
        assert_eq!(r.state(), ConnState::Idle);
        assert_eq!(r.start(true), Action::Connect);
        assert_eq!(r.state(), ConnState::Connecting);
        assert_eq!(r.start(true), Action::Nothing);
    }

    #[test]
    fn unclean_close_backs_off_then_gives_up() {
        let mut r = connected(3);
        let mut delays = Vec::new();
        for _ in 0..3 {
            match r.on_close(Some(1006), true) {
                Action::ScheduleRetry { delay, .. } => delays.push(delay),
                other => panic!("expected retry, got {other:?}"),
            }
            assert_eq!(r.on_retry_elapsed(true), Action::Connect);
        }
        assert_eq!(delays, vec![BASE, BASE * 2, BASE * 4]);
        assert_eq!(r.on_close(None, true), Action::GiveUp);
        assert!(!r.retry_scheduled());
        assert_eq!(r.attempt(), 0);
    }

    #[test]
    fn open_resets_attempts() {
        let mut r = connected(5);
        let _ = r.on_close(Some(1006), true);
        let _ = r.on_retry_elapsed(true);
        let _ = r.on_close(None, true);
        assert_eq!(r.attempt(), 2);
        let _ = r.on_retry_elapsed(true);
        r.on_open();
        assert_eq!(r.attempt(), 0);
        assert_eq!(
            r.on_close(Some(1001), true),
            Action::ScheduleRetry { attempt: 1, delay: BASE }
        );
    }

    #[test]
    fn clean_close_does_not_retry() {
        let mut r = connected(3);
        assert_eq!(r.on_close(Some(1000), true), Action::Nothing);
        assert_eq!(r.state(), ConnState::Idle);

        let mut r = connected(3);
        assert_eq!(r.on_close(Some(4000), true), Action::Nothing);
        assert_eq!(r.attempt(), 0);
    }

    #[test]
    fn missing_token_cancels_retries() {
        let mut r = connected(3);
        assert_eq!(r.on_close(Some(1006), false), Action::Nothing);
        assert!(!r.retry_scheduled());
        assert_eq!(r.attempt(), 0);
    }

    #[test]
    fn only_one_retry_scheduled() {
        let mut r = connected(3);
        assert!(matches!(r.on_close(Some(1006), true), Action::ScheduleRetry { .. }));
        assert_eq!(r.on_close(Some(1006), true), Action::Nothing);
        assert_eq!(r.attempt(), 1);
        assert_eq!(r.on_online(true), Action::Nothing);
    }

    #[test]
    fn offline_closes_and_clears_retry() {
        let mut r = connected(3);
        assert_eq!(r.on_offline(), Action::CloseSocket);
        assert_eq!(r.state(), ConnState::Idle);
        // The socket closing normally afterwards schedules nothing.
        assert_eq!(r.on_close(Some(1000), true), Action::Nothing);

        let mut r = connected(3);
        let _ = r.on_close(Some(1006), true);
        assert_eq!(r.on_offline(), Action::Nothing);
        assert!(!r.retry_scheduled());
        assert_eq!(r.attempt(), 0);
        assert_eq!(r.on_retry_elapsed(true), Action::Nothing);
    }

    #[test]
    fn failures_while_offline_do_not_schedule() {
        let mut r = Reconnector::new(BASE, 3);
        let _ = r.start(true);
        let _ = r.on_offline();
        assert_eq!(r.on_close(None, true), Action::Nothing);
        assert!(!r.retry_scheduled());
    }

    #[test]
    fn online_resumes_only_when_idle() {
        let mut r = connected(3);
        let _ = r.on_offline();
        assert_eq!(r.on_online(true), Action::Connect);
        assert_eq!(r.on_online(true), Action::Nothing);
        r.on_open();
        assert_eq!(r.on_online(true), Action::Nothing);
    }

    #[test]
    fn online_without_token_stays_idle() {
        let mut r = Reconnector::new(BASE, 3);
        let _ = r.on_offline();
        assert_eq!(r.on_online(false), Action::Nothing);
    }

    #[test]
    fn rejected_token_stops_until_changed() {
        let mut r = Reconnector::new(BASE, 3);
        let _ = r.start(true);
        r.on_rejected();
        assert_eq!(r.state(), ConnState::Idle);
        assert!(!r.retry_scheduled());
        let _ = r.on_offline();
        assert_eq!(r.on_online(true), Action::Nothing);
        assert_eq!(r.on_token_changed(true), Action::Connect);
    }

    #[test]
    fn token_removal_closes_socket() {
        let mut r = connected(3);
        assert_eq!(r.on_token_changed(false), Action::CloseSocket);
        assert_eq!(r.state(), ConnState::Idle);
        assert_eq!(r.on_token_changed(false), Action::Nothing);
    }

    #[test]
    fn zero_max_attempts_gives_up_immediately() {
        let mut r = connected(0);
        assert_eq!(r.on_close(Some(1006), true), Action::GiveUp);
    }
}
