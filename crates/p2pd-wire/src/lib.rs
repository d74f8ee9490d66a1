//! p2pd control protocol: the wire contract between the daemon and its local clients.
//!
//! Every message is a protobuf body prefixed by its unsigned-varint encoded
//! length. Clients send [`Request`]s; the daemon answers with [`Response`]s,
//! and streaming DHT queries additionally produce raw [`DhtResponse`]
//! elements on the same connection.
//!
//! ## Layout
//!
//! - **message**: protobuf schema (field numbers are wire-normative)
//! - **codec**: resumable length-delimited framing for `tokio_util::codec`
//! - **request**: validated request model built from the raw schema

pub mod codec;
pub mod message;
pub mod request;

pub use codec::{encode_frame, ControlCodec, FramingError, DEFAULT_MAX_FRAME_LEN};
pub use message::{
    ConnectRequest, DhtRequest, DhtResponse, DisconnectRequest, ErrorResponse, IdentifyResponse,
    PeerInfo, Request, Response, StreamHandlerRequest, StreamInfo, StreamOpenRequest,
};
pub use request::{ControlRequest, DhtKind, DhtQuery, ValidationError};
