//! Wire packet schema for calls and the nested stream tunnel
//!
//! Hand-written `prost` message definitions so the encoding is bit-exact
//! protobuf without a build-time code generation step. Field numbers are part
//! of the wire contract and must not change.

use bytes::Bytes;

use crate::ProtocolError;

/// The framing unit exchanged on a call's byte stream.
///
/// Exactly one body variant is meaningful per packet. Packets whose body
/// field number is unknown to this build decode with `body == None` and are
/// treated as no-ops for forward compatibility.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    /// Tagged union of packet bodies.
    #[prost(oneof = "packet::Body", tags = "1, 2, 3, 4")]
    pub body: Option<packet::Body>,
}

/// Body variants for [`Packet`].
pub mod packet {
    /// The packet body union.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Opens the call: service/method IDs and an optional first request.
        #[prost(message, tag = "1")]
        CallStart(super::CallStart),
        /// Carries a payload, completion, or error for an open call.
        #[prost(message, tag = "2")]
        CallData(super::CallData),
        /// Aborts the call; meaningful when true.
        #[prost(bool, tag = "3")]
        CallCancel(bool),
        /// Reserved response to `CallStart`; currently unused.
        #[prost(message, tag = "4")]
        CallStartResp(super::CallStartResp),
    }
}

/// Opens an RPC call on a fresh byte stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallStart {
    /// Fully-qualified service identifier; may be empty when the caller
    /// relies on method-only dispatch.
    #[prost(string, tag = "1")]
    pub rpc_service: String,
    /// Bare method name.
    #[prost(string, tag = "2")]
    pub rpc_method: String,
    /// Optional first request body, for call shapes that carry one.
    #[prost(bytes = "bytes", tag = "3")]
    pub data: Bytes,
    /// Set when `data` is a present, zero-length payload rather than absent.
    #[prost(bool, tag = "4")]
    pub data_is_zero: bool,
}

/// Payload, half-close, or error for an open call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallData {
    /// Message payload bytes.
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
    /// True when the sender will emit no further payloads.
    #[prost(bool, tag = "2")]
    pub complete: bool,
    /// Terminal error string; non-empty implies completion.
    #[prost(string, tag = "3")]
    pub error: String,
    /// Set when `data` is a present, zero-length payload rather than absent.
    #[prost(bool, tag = "4")]
    pub data_is_zero: bool,
}

/// Reserved acknowledgement of `CallStart`. Carries no fields today.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallStartResp {}

impl Packet {
    /// Construct a call-start packet. `data` distinguishes an absent first
    /// request (`None`) from a present empty one (`Some` of length zero).
    pub fn call_start(
        service: impl Into<String>,
        method: impl Into<String>,
        data: Option<Bytes>,
    ) -> Self {
        let data_is_zero = matches!(&data, Some(d) if d.is_empty());
        Packet {
            body: Some(packet::Body::CallStart(CallStart {
                rpc_service: service.into(),
                rpc_method: method.into(),
                data: data.unwrap_or_default(),
                data_is_zero,
            })),
        }
    }

    /// Construct a call-data packet. `None` data carries no payload;
    /// `Some` of length zero is a legitimate empty payload.
    pub fn call_data(data: Option<Bytes>, complete: bool, error: Option<String>) -> Self {
        let data_is_zero = matches!(&data, Some(d) if d.is_empty());
        Packet {
            body: Some(packet::Body::CallData(CallData {
                data: data.unwrap_or_default(),
                complete,
                error: error.unwrap_or_default(),
                data_is_zero,
            })),
        }
    }

    /// Construct a call-cancel packet.
    pub fn call_cancel() -> Self {
        Packet {
            body: Some(packet::Body::CallCancel(true)),
        }
    }

    /// Check the packet against the wire contract.
    ///
    /// A missing body is tolerated (unknown variant from a newer peer); the
    /// caller treats it as a no-op.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match &self.body {
            Some(packet::Body::CallStart(start)) => {
                if start.rpc_service.is_empty() && start.rpc_method.is_empty() {
                    return Err(ProtocolError::InvalidPacket(
                        "call start with empty service and method".into(),
                    ));
                }
                if start.data_is_zero && !start.data.is_empty() {
                    return Err(ProtocolError::InvalidPacket(
                        "call start marked zero-length but carries data".into(),
                    ));
                }
                Ok(())
            }
            Some(packet::Body::CallData(data)) => {
                if data.data_is_zero && !data.data.is_empty() {
                    return Err(ProtocolError::InvalidPacket(
                        "call data marked zero-length but carries data".into(),
                    ));
                }
                Ok(())
            }
            Some(packet::Body::CallCancel(_)) | Some(packet::Body::CallStartResp(_)) | None => {
                Ok(())
            }
        }
    }
}

/// The framing unit exchanged inside a nested stream tunnel, carried as
/// opaque `CallData` payloads of the outer call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStreamPacket {
    /// Tagged union of tunnel packet bodies.
    #[prost(oneof = "rpc_stream_packet::Body", tags = "1, 2, 3")]
    pub body: Option<rpc_stream_packet::Body>,
}

/// Body variants for [`RpcStreamPacket`].
pub mod rpc_stream_packet {
    /// The tunnel packet body union.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Opens the tunnel and names the target component.
        #[prost(message, tag = "1")]
        Init(super::RpcStreamInit),
        /// Acknowledges the init; an empty error means success.
        #[prost(message, tag = "2")]
        Ack(super::RpcAck),
        /// One chunk of the nested byte stream.
        #[prost(bytes = "bytes", tag = "3")]
        Data(::bytes::Bytes),
    }
}

/// Opens a nested RPC session for one component.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStreamInit {
    /// Identifier of the component whose RPC surface is requested.
    #[prost(string, tag = "1")]
    pub component_id: String,
}

/// Acknowledgement of a tunnel init.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcAck {
    /// Error reported by the acceptor; empty means success.
    #[prost(string, tag = "1")]
    pub error: String,
}

impl RpcStreamPacket {
    /// Construct a tunnel init packet.
    pub fn init(component_id: impl Into<String>) -> Self {
        RpcStreamPacket {
            body: Some(rpc_stream_packet::Body::Init(RpcStreamInit {
                component_id: component_id.into(),
            })),
        }
    }

    /// Construct a tunnel ack packet; `None` signals success.
    pub fn ack(error: Option<String>) -> Self {
        RpcStreamPacket {
            body: Some(rpc_stream_packet::Body::Ack(RpcAck {
                error: error.unwrap_or_default(),
            })),
        }
    }

    /// Construct a tunnel data packet.
    pub fn data(data: Bytes) -> Self {
        RpcStreamPacket {
            body: Some(rpc_stream_packet::Body::Data(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_call_start_construction() {
        let pkt = Packet::call_start("pkg.Service", "Method", Some(Bytes::from("req")));
        match pkt.body {
            Some(packet::Body::CallStart(start)) => {
                assert_eq!(start.rpc_service, "pkg.Service");
                assert_eq!(start.rpc_method, "Method");
                assert_eq!(start.data, Bytes::from("req"));
                assert!(!start.data_is_zero);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_call_start_empty_first_request_sets_zero_flag() {
        let pkt = Packet::call_start("pkg.Service", "Method", Some(Bytes::new()));
        match pkt.body {
            Some(packet::Body::CallStart(start)) => {
                assert!(start.data.is_empty());
                assert!(start.data_is_zero);
            }
            other => panic!("unexpected body: {:?}", other),
        }

        let pkt = Packet::call_start("pkg.Service", "Method", None);
        match pkt.body {
            Some(packet::Body::CallStart(start)) => {
                assert!(start.data.is_empty());
                assert!(!start.data_is_zero);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_call_data_zero_flag() {
        let pkt = Packet::call_data(Some(Bytes::new()), false, None);
        match pkt.body {
            Some(packet::Body::CallData(data)) => {
                assert!(data.data_is_zero);
                assert!(!data.complete);
                assert!(data.error.is_empty());
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_call_start() {
        let pkt = Packet::call_start("", "", None);
        assert!(matches!(
            pkt.validate(),
            Err(ProtocolError::InvalidPacket(_))
        ));

        // service-only and method-only starts are both legal
        assert!(Packet::call_start("pkg.Service", "", None).validate().is_ok());
        assert!(Packet::call_start("", "Method", None).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_zero_flag() {
        let pkt = Packet {
            body: Some(packet::Body::CallData(CallData {
                data: Bytes::from("payload"),
                complete: false,
                error: String::new(),
                data_is_zero: true,
            })),
        };
        assert!(matches!(
            pkt.validate(),
            Err(ProtocolError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_validate_tolerates_missing_body() {
        // a peer speaking a newer schema decodes to an empty body; that is a
        // no-op, not an error
        let pkt = Packet::default();
        assert!(pkt.validate().is_ok());
    }

    #[test]
    fn test_call_cancel_wire_encoding() {
        // field 3, varint wire type, value 1
        let encoded = Packet::call_cancel().encode_to_vec();
        assert_eq!(encoded, vec![0x18, 0x01]);
    }

    #[test]
    fn test_call_start_wire_encoding() {
        let pkt = Packet::call_start("a", "b", None);
        let encoded = pkt.encode_to_vec();
        // field 1 (CallStart message), length 6:
        //   field 1 string "a", field 2 string "b"
        assert_eq!(
            encoded,
            vec![0x0a, 0x06, 0x0a, 0x01, b'a', 0x12, 0x01, b'b']
        );
    }

    #[test]
    fn test_packet_roundtrip() {
        let pkt = Packet::call_data(Some(Bytes::from("hello")), true, Some("boom".into()));
        let decoded = Packet::decode(pkt.encode_to_vec().as_slice()).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn test_unknown_body_variant_decodes_as_none() {
        // field 9 (unknown), varint wire type, value 1
        let decoded = Packet::decode(&[0x48, 0x01][..]).unwrap();
        assert!(decoded.body.is_none());
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_rpc_stream_packet_constructors() {
        let init = RpcStreamPacket::init("echo");
        match init.body {
            Some(rpc_stream_packet::Body::Init(i)) => assert_eq!(i.component_id, "echo"),
            other => panic!("unexpected body: {:?}", other),
        }

        let ack = RpcStreamPacket::ack(None);
        match ack.body {
            Some(rpc_stream_packet::Body::Ack(a)) => assert!(a.error.is_empty()),
            other => panic!("unexpected body: {:?}", other),
        }

        let data = RpcStreamPacket::data(Bytes::from("chunk"));
        let decoded = RpcStreamPacket::decode(data.encode_to_vec().as_slice()).unwrap();
        assert_eq!(data, decoded);
    }
}
