//! Connection state machine (C3): the handshake and termination transitions.

/// One endpoint's view of the connection lifecycle.
///
/// `Accepting` / `SynRcvd` only ever occur on the accepter side;
/// `SynSent` / `FinSent` only on the connector side (spec.md §4.3).
/// `Closing` is the responder's termination state, reachable by either
/// role depending on who initiates shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    SynSent,
    Accepting,
    SynRcvd,
    Established,
    FinSent,
    Closing,
}

impl ConnState {
    pub fn is_established(self) -> bool {
        matches!(self, ConnState::Established)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed)
    }
}
