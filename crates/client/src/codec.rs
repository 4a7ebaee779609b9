//! JSON value codec for dynamic unary dispatch.
//!
//! The engine dispatches calls by method name with opaque
//! [`serde_json::Value`] payloads, so the wire codec encodes and decodes
//! JSON instead of schema-generated messages. Schema validation belongs to
//! the server and to typed wrappers layered on top of the engine.

use bytes::{Buf, BufMut};
use serde_json::Value;
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// Codec mapping `serde_json::Value` to gRPC message frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Encode = Value;
    type Decode = Value;
    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder
    }
}

/// Serializes a JSON value into an outgoing message frame.
#[derive(Debug)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    type Item = Value;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        serde_json::to_writer(dst.writer(), &item)
            .map_err(|e| Status::internal(format!("failed to encode request: {e}")))
    }
}

/// Deserializes an incoming message frame into a JSON value.
#[derive(Debug)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    type Item = Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if !src.has_remaining() {
            return Ok(None);
        }
        let item = serde_json::from_reader(src.reader())
            .map_err(|e| Status::internal(format!("failed to decode response: {e}")))?;
        Ok(Some(item))
    }
}
