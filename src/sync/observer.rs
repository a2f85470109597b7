//! Browser-side half of the synchronizer.
//!
//! `SignalObserver` is a pure state machine: feed it what the identity SDK
//! reports and what the socket does, and it answers with at most one thing
//! to send. It never holds a token. A `SendSession` instruction means "mint
//! a token now and send `session:set`".

/// What the identity SDK currently reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Loading,
    SignedIn { user_id: String, session_id: String },
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Mint a fresh session token and send `session:set`.
    SendSession,
    /// Send `session:clear`.
    ClearSession,
}

#[derive(Debug)]
pub struct SignalObserver {
    signal: Signal,
    connected: bool,
    /// Last settled signal sent on the current connection.
    delivered: Option<Signal>,
}

impl Default for SignalObserver {
    fn default() -> Self {
        Self { signal: Signal::Loading, connected: false, delivered: None }
    }
}

impl SignalObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Record a new SDK signal.
    pub fn observe(&mut self, signal: Signal) -> Option<SyncAction> {
        self.signal = signal;
        self.pending()
    }

    /// The channel (re)opened. The server side is a fresh session, so
    /// whatever is settled now must be sent again.
    pub fn connected(&mut self) -> Option<SyncAction> {
        self.connected = true;
        self.delivered = None;
        self.pending()
    }

    pub fn disconnected(&mut self) {
        self.connected = false;
        self.delivered = None;
    }

    fn pending(&mut self) -> Option<SyncAction> {
        if !self.connected || self.delivered.as_ref() == Some(&self.signal) {
            return None;
        }
        let action = match self.signal {
            Signal::Loading => return None,
            Signal::SignedIn { .. } => SyncAction::SendSession,
            Signal::SignedOut => SyncAction::ClearSession,
        };
        self.delivered = Some(self.signal.clone());
        Some(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_in(user: &str, sid: &str) -> Signal {
        Signal::SignedIn { user_id: user.into(), session_id: sid.into() }
    }

    #[test]
    fn loading_is_never_forwarded() {
        let mut obs = SignalObserver::new();
        assert_eq!(obs.connected(), None);
        assert_eq!(obs.observe(Signal::Loading), None);
    }

    #[test]
    fn each_settled_change_is_sent_once() {
        let mut obs = SignalObserver::new();
        obs.connected();

        assert_eq!(obs.observe(signed_in("u1", "s1")), Some(SyncAction::SendSession));
        assert_eq!(obs.observe(signed_in("u1", "s1")), None);
        assert_eq!(obs.observe(Signal::SignedOut), Some(SyncAction::ClearSession));
        assert_eq!(obs.observe(Signal::SignedOut), None);
    }

    #[test]
    fn session_rotation_counts_as_a_change() {
        let mut obs = SignalObserver::new();
        obs.connected();
        obs.observe(signed_in("u1", "s1"));
        assert_eq!(obs.observe(signed_in("u1", "s2")), Some(SyncAction::SendSession));
    }

    #[test]
    fn nothing_is_sent_while_disconnected() {
        let mut obs = SignalObserver::new();
        assert_eq!(obs.observe(signed_in("u1", "s1")), None);
        // Settled before the socket opened: sent on connect.
        assert_eq!(obs.connected(), Some(SyncAction::SendSession));
    }

    #[test]
    fn reconnect_resends_unchanged_signal() {
        let mut obs = SignalObserver::new();
        obs.connected();
        assert_eq!(obs.observe(signed_in("u1", "s1")), Some(SyncAction::SendSession));

        obs.disconnected();
        assert_eq!(obs.connected(), Some(SyncAction::SendSession));
        assert_eq!(obs.observe(signed_in("u1", "s1")), None);
    }

    #[test]
    fn change_while_disconnected_is_sent_on_reconnect() {
        let mut obs = SignalObserver::new();
        obs.connected();
        obs.observe(signed_in("u1", "s1"));
        obs.disconnected();

        assert_eq!(obs.observe(Signal::SignedOut), None);
        assert_eq!(obs.connected(), Some(SyncAction::ClearSession));
    }

    #[test]
    fn falling_back_to_loading_holds_last_delivery() {
        let mut obs = SignalObserver::new();
        obs.connected();
        obs.observe(signed_in("u1", "s1"));
        assert_eq!(obs.observe(Signal::Loading), None);
        // Settling back on the delivered value sends nothing.
        assert_eq!(obs.observe(signed_in("u1", "s1")), None);
    }
}
