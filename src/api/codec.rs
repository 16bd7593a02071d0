use std::io;
use std::marker::PhantomData;

use bytes::BytesMut;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::api::protocol::{Message, ProgramRequest};

/// Combines LengthDelimitedCodec (TCP framing) with serde_json (the wire
/// format is UTF-8 JSON). `E` is what this side encodes, `D` what it
/// decodes, so both symmetric links and request/reply surfaces share one
/// codec type.
pub struct JsonCodec<E, D> {
    codec: LengthDelimitedCodec,
    _marker: PhantomData<(E, D)>,
}

/// Gateway↔broker link: the SOL/PROP/ACK/RES enum flows both ways.
pub type WireCodec = JsonCodec<Message, Message>;
/// Program-facing side of the gateway listener: requests in, a final
/// RES (tagged like every other protocol message) out.
pub type ReplyCodec = JsonCodec<Message, ProgramRequest>;
/// Program client side.
pub type RequestCodec = JsonCodec<ProgramRequest, Message>;

impl<E, D> JsonCodec<E, D> {
    pub fn new() -> Self {
        Self { codec: LengthDelimitedCodec::new(), _marker: PhantomData }
    }
}

impl<E, D> Default for JsonCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Serialize, D> Encoder<E> for JsonCodec<E, D> {
    type Error = io::Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(&item).map_err(io::Error::other)?;

        let bytes = bytes::Bytes::from(bytes);
        self.codec.encode(bytes, dst)
    }
}

impl<E, D: DeserializeOwned> Decoder for JsonCodec<E, D> {
    type Item = D;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes).map_err(io::Error::other)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}
