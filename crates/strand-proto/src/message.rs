//! Raw-message payload container

use bytes::{Buf, BufMut, Bytes};
use prost::encoding::{skip_field, DecodeContext, WireType};
use prost::DecodeError;

/// Opaque payload container that round-trips bytes unchanged.
///
/// `RawMessage` implements [`prost::Message`] with pass-through semantics:
/// encoding emits the held bytes verbatim and decoding captures the whole
/// buffer. It slots into the generic message send/receive path wherever the
/// payload is already serialized, e.g. when proxying a call without knowing
/// its schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    data: Bytes,
}

impl RawMessage {
    /// Construct a raw message holding `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// The held bytes, without copying.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume the container and return the held bytes.
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Replace the held bytes.
    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
    }
}

impl prost::Message for RawMessage {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        buf.put_slice(&self.data);
    }

    fn encoded_len(&self) -> usize {
        self.data.len()
    }

    // `merge` is overridden below to capture the whole buffer; field-wise
    // merging only happens if a caller drives the field loop directly.
    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        skip_field(wire_type, tag, buf, ctx)
    }

    fn merge(&mut self, mut buf: impl Buf) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        self.data = buf.copy_to_bytes(buf.remaining());
        Ok(())
    }

    fn clear(&mut self) {
        self.data = Bytes::new();
    }
}
