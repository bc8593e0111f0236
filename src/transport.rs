use async_trait::async_trait;

use crate::error::RpcError;
use crate::message::{Request, Response};

/// Unary request/response channel keyed by peer address (`ip:port`).
///
/// Implementations are expected to honor a per-call timeout; a timeout
/// surfaces as [`RpcError::Timeout`] and is not distinguished from other
/// transport failures by the core.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_and_recv(&self, peer: &str, request: Request) -> Result<Response, RpcError>;
}
