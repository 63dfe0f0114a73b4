//! Offer/answer negotiation for one peer.
//!
//! Each step runs as its own task and posts its result back to the session
//! queue as `SessionEvent::Negotiated`; the session decides what to send and
//! whether the peer is still current.

use std::sync::Arc;

use log::{debug, warn};

use super::transport::{LinkState, MediaBackend, PeerTransport};
use crate::error::VoiceError;
use crate::session::PeerEvents;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

/// Protocol-level negotiation state of a peer connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Closed,
}

/// Completed negotiation step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NegotiationStep {
    /// Offer generated and committed as local description (initiator)
    OfferCreated(SessionDescription),
    /// Remote offer applied, answer generated and committed (responder)
    AnswerCreated(SessionDescription),
    /// Remote answer applied (initiator)
    AnswerApplied,
}

impl NegotiationState {
    /// State after a completed step has been acted on.
    pub fn after(self, step: &NegotiationStep) -> Self {
        match (self, step) {
            (NegotiationState::Closed, _) => NegotiationState::Closed,
            (NegotiationState::Connected, _) => NegotiationState::Connected,
            (_, NegotiationStep::OfferCreated(_)) => NegotiationState::OfferSent,
            (_, NegotiationStep::AnswerCreated(_)) | (_, NegotiationStep::AnswerApplied) => {
                NegotiationState::AnswerExchanged
            }
        }
    }

    /// State after the connection object reports a link change.
    pub fn on_link(self, link: LinkState) -> Self {
        match (self, link) {
            (NegotiationState::Closed, _) => NegotiationState::Closed,
            (_, LinkState::Connected) => NegotiationState::Connected,
            (state, _) => state,
        }
    }
}

/// Remote candidates held back until a remote description is in place.
///
/// Candidates may trickle in before the offer or answer they belong to has
/// been applied; connection objects reject those, so they wait here.
#[derive(Debug)]
pub struct PendingCandidates<C> {
    remote_set: bool,
    queue: Vec<C>,
}

impl<C> Default for PendingCandidates<C> {
    fn default() -> Self {
        Self {
            remote_set: false,
            queue: Vec::new(),
        }
    }
}

impl<C> PendingCandidates<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `candidate` if no remote description is set yet; otherwise hand
    /// it back for immediate use.
    pub fn admit(&mut self, candidate: C) -> Option<C> {
        if self.remote_set {
            Some(candidate)
        } else {
            self.queue.push(candidate);
            None
        }
    }

    /// Mark the remote description applied and take everything queued, in
    /// arrival order.
    pub fn release(&mut self) -> Vec<C> {
        self.remote_set = true;
        std::mem::take(&mut self.queue)
    }

    pub fn is_remote_set(&self) -> bool {
        self.remote_set
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Generate an offer and commit it as the local description.
pub async fn create_offer<T: PeerTransport + ?Sized>(conn: &T) -> Result<SessionDescription, VoiceError> {
    let offer = conn.create_offer().await?;
    conn.set_local_description(offer.clone()).await?;
    Ok(offer)
}

/// Apply a remote offer, then generate and commit an answer.
pub async fn create_answer<T: PeerTransport + ?Sized>(
    conn: &T,
    remote: SessionDescription,
) -> Result<SessionDescription, VoiceError> {
    conn.set_remote_description(remote).await?;
    let answer = conn.create_answer().await?;
    conn.set_local_description(answer.clone()).await?;
    Ok(answer)
}

/// Apply a remote answer.
pub async fn apply_answer<T: PeerTransport + ?Sized>(conn: &T, remote: SessionDescription) -> Result<(), VoiceError> {
    conn.set_remote_description(remote).await
}

/// Initiator path, in the background.
pub fn spawn_offer<B: MediaBackend>(conn: Arc<B::Connection>, events: PeerEvents<B>) {
    tokio::spawn(async move {
        let outcome = create_offer(conn.as_ref()).await;
        events.negotiated(outcome.map(NegotiationStep::OfferCreated));
    });
}

/// Responder path, in the background.
pub fn spawn_answer<B: MediaBackend>(conn: Arc<B::Connection>, remote: SessionDescription, events: PeerEvents<B>) {
    tokio::spawn(async move {
        let outcome = create_answer(conn.as_ref(), remote).await;
        events.negotiated(outcome.map(NegotiationStep::AnswerCreated));
    });
}

/// Answer completion, in the background.
pub fn spawn_apply_answer<B: MediaBackend>(
    conn: Arc<B::Connection>,
    remote: SessionDescription,
    events: PeerEvents<B>,
) {
    tokio::spawn(async move {
        let outcome = apply_answer(conn.as_ref(), remote).await;
        events.negotiated(outcome.map(|_| NegotiationStep::AnswerApplied));
    });
}

/// Hand a remote candidate to the connection; failures are only logged.
pub fn spawn_add_candidate<T: PeerTransport>(conn: Arc<T>, peer: PeerId, candidate: IceCandidate) {
    tokio::spawn(async move {
        match conn.add_ice_candidate(candidate).await {
            Ok(()) => debug!("[Negotiation] Added remote candidate for {}", peer),
            Err(e) => warn!("[Negotiation] Failed to add candidate for {}: {}", peer, e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeTransport};

    #[test]
    fn test_state_progression_initiator() {
        let state = NegotiationState::New;
        let state = state.after(&NegotiationStep::OfferCreated(SessionDescription::offer("o")));
        assert_eq!(state, NegotiationState::OfferSent);
        let state = state.after(&NegotiationStep::AnswerApplied);
        assert_eq!(state, NegotiationState::AnswerExchanged);
        assert_eq!(state.on_link(LinkState::Connecting), NegotiationState::AnswerExchanged);
        assert_eq!(state.on_link(LinkState::Connected), NegotiationState::Connected);
    }

    #[test]
    fn test_closed_is_terminal() {
        let state = NegotiationState::Closed;
        assert_eq!(state.after(&NegotiationStep::AnswerApplied), NegotiationState::Closed);
        assert_eq!(state.on_link(LinkState::Connected), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_offer_commits_local_description() {
        let conn = FakeTransport::new();
        let offer = create_offer(&conn).await.unwrap();
        assert_eq!(offer.sdp_type, crate::signaling::SdpType::Offer);
        assert_eq!(
            conn.calls(),
            vec![Call::CreateOffer, Call::SetLocal(offer.clone())]
        );
    }

    #[tokio::test]
    async fn test_answer_applies_remote_first() {
        let conn = FakeTransport::new();
        let remote = SessionDescription::offer("remote");
        let answer = create_answer(&conn, remote.clone()).await.unwrap();
        assert_eq!(
            conn.calls(),
            vec![Call::SetRemote(remote), Call::CreateAnswer, Call::SetLocal(answer)]
        );
    }

    #[tokio::test]
    async fn test_failure_stops_the_chain() {
        let conn = FakeTransport::failing_remote();
        let result = create_answer(&conn, SessionDescription::offer("remote")).await;
        assert!(matches!(result, Err(VoiceError::Negotiation(_))));
        assert_eq!(conn.calls().len(), 1);
    }

    #[test]
    fn test_candidates_wait_for_remote_description() {
        let mut pending = PendingCandidates::new();
        assert_eq!(pending.admit("c1"), None);
        assert_eq!(pending.admit("c2"), None);
        assert_eq!(pending.len(), 2);
        assert!(!pending.is_remote_set());

        assert_eq!(pending.release(), vec!["c1", "c2"]);
        assert!(pending.is_empty());
        assert_eq!(pending.admit("c3"), Some("c3"));
        assert!(pending.release().is_empty());
    }

    #[tokio::test]
    async fn test_early_candidate_rejected_by_connection() {
        let conn = FakeTransport::new();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 8189 typ host".to_string(),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        };
        assert!(conn.add_ice_candidate(candidate.clone()).await.is_err());

        create_answer(&conn, SessionDescription::offer("remote")).await.unwrap();
        assert!(conn.add_ice_candidate(candidate).await.is_ok());
    }
}
