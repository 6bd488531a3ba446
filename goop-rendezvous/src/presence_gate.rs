//! Registration gate (spec.md §1 "a credit/registration provider is
//! modelled only as an HTTP-shaped `PresenceGate` dependency"). Real
//! deployments replace `NoopGate` with a client hitting an external
//! registration/credits microservice; that proxy is explicitly out of
//! scope here.

use async_trait::async_trait;

/// Decides whether a not-yet-verified peer may publish presence at all.
#[async_trait]
pub trait PresenceGate: Send + Sync {
    async fn allow_publish(&self, peer_id: &str) -> bool;
}

/// Default gate: every peer may publish. Verification (the `verified`
/// flag) is a separate, additive concern handled by `/register`+`/verify`.
pub struct NoopGate;

#[async_trait]
impl PresenceGate for NoopGate {
    async fn allow_publish(&self, _peer_id: &str) -> bool {
        true
    }
}
