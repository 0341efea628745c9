//! Runtime configuration

use strand_proto::MAX_PACKET_SIZE;

/// Tunables shared by client and server call endpoints.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Maximum accepted wire frame size in bytes.
    pub max_packet_size: usize,
    /// Capacity of the per-call receive queue. This is the backpressure
    /// watermark: the read pump stalls once this many payloads are queued
    /// ahead of a slow consumer.
    pub recv_buffer: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            recv_buffer: 5,
        }
    }
}

impl RpcConfig {
    /// Set the maximum accepted wire frame size.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Set the per-call receive queue capacity.
    pub fn with_recv_buffer(mut self, recv_buffer: usize) -> Self {
        self.recv_buffer = recv_buffer.max(1);
        self
    }
}
