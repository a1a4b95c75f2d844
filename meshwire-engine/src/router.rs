//! Signal router: the single reader of the signal stream.
//!
//! Ordering rules:
//!
//! - Offers, answers, `GoIdle` and mode advisories dispatch under the
//!   control mutex, so per-peer signaling serializes against
//!   reconciliation.
//! - Candidates commute, so they are handed to the session mailbox without
//!   taking the mutex, so a slow ICE agent never head-of-line blocks the
//!   stream.
//! - Any message other than `GoIdle` wakes a lazy session before its
//!   dispatch returns.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use meshwire_proto::signal::{SignalBody, SignalMessage};

use crate::collab::SignalReceiver;
use crate::engine::EngineShared;
use crate::error::ShutdownReason;

pub(crate) async fn run(mut rx: Box<dyn SignalReceiver>, shared: Arc<EngineShared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            msg = rx.next() => match msg {
                Ok(msg) => {
                    shared.stream_health.signal.store(true, Ordering::Relaxed);
                    dispatch(&shared, msg).await;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("signal stream failed: {e}");
                    shared.stream_health.signal.store(false, Ordering::Relaxed);
                    shared.publish_reason(ShutdownReason::ResetBySignal);
                    shared.cancel.cancel();
                    return;
                }
                Err(e) => {
                    shared.stream_health.signal.store(false, Ordering::Relaxed);
                    tracing::warn!("signal stream transient error: {e}");
                }
            }
        }
    }
}

async fn dispatch(shared: &Arc<EngineShared>, msg: SignalMessage) {
    if msg.to != shared.local_key {
        tracing::warn!(
            to = %msg.to.short(),
            from = %msg.from.short(),
            kind = msg.body.kind(),
            "dropping wrongly addressed signal message"
        );
        return;
    }
    let Some(session) = shared.store.get(&msg.from) else {
        tracing::debug!(
            from = %msg.from.short(),
            kind = msg.body.kind(),
            "dropping signal message for unknown peer"
        );
        return;
    };

    if let SignalBody::Candidate { candidate } = msg.body {
        // Lookup done; hand off asynchronously. The routes snapshot travels
        // with the candidate so filtering sees the state at arrival.
        shared.conn.activate(&msg.from).await;
        session.remote_candidate(candidate, shared.client_routes.snapshot());
        return;
    }

    let _guard = shared.control.lock().await;
    if !matches!(msg.body, SignalBody::GoIdle) {
        shared.conn.activate(&msg.from).await;
    }
    match msg.body {
        SignalBody::Offer(payload) => session.remote_offer(payload).await,
        SignalBody::Answer(payload) => session.remote_answer(payload).await,
        SignalBody::GoIdle => session.deactivate().await,
        SignalBody::Mode { .. } => {
            tracing::debug!(from = %msg.from.short(), "ignoring mode advisory");
        }
        SignalBody::Candidate { .. } => unreachable!("candidates handled above"),
    }
}
