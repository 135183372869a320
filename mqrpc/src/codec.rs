use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    BindStreams, Error, ErrorKind, InvocationId, ObservationSource, Result, StreamBinding,
    StreamRegistry, StreamVisitor,
};

/// Body encoding, announced per message in the `codec` property.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    #[default]
    #[serde(rename = "msgpack")]
    MessagePack,
    #[serde(rename = "json")]
    Json,
}

impl Codec {
    #[must_use]
    pub fn from_flag(use_msgpack: bool) -> Self {
        if use_msgpack {
            Codec::MessagePack
        } else {
            Codec::Json
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Codec::MessagePack => "msgpack",
            Codec::Json => "json",
        }
    }

    /// Parses the name carried in the `codec` property.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DeserializeFailed`] for a name other than
    /// `msgpack` or `json`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "msgpack" => Ok(Codec::MessagePack),
            "json" => Ok(Codec::Json),
            _ => Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("unknown codec: {name}"),
            )),
        }
    }

    /// # Errors
    ///
    /// Fails with `SerializeFailed` whatever the underlying format.
    pub fn serialize<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        let bytes = match self {
            Codec::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?,
            Codec::Json => serde_json::to_vec(value)
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?,
        };
        Ok(bytes.into())
    }

    /// # Errors
    ///
    /// Fails with `DeserializeFailed` whatever the underlying format.
    pub fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        let result = if bytes.is_empty() {
            // an empty body stands for a unit value.
            serde_json::from_value(serde_json::Value::Null).map_err(|e| e.to_string())
        } else {
            match self {
                Codec::MessagePack => rmp_serde::from_slice(bytes).map_err(|e| e.to_string()),
                Codec::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            }
        };
        result.map_err(|msg| Error::new(ErrorKind::DeserializeFailed, msg))
    }

    /// Decodes a reply and binds every stream placeholder it embeds to the
    /// demultiplexer of `ctx.reply_address`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DeserializeFailed`] when the body does not decode
    /// as `T` or a placeholder cannot be bound to a demultiplexer.
    pub fn deserialize_with<T: DeserializeOwned + BindStreams>(
        self,
        bytes: &[u8],
        ctx: &DeserializeContext,
    ) -> Result<T> {
        let mut value: T = self.deserialize(bytes)?;
        value.visit_streams(&mut ReplyBinder(ctx))?;
        Ok(value)
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to turn stream handles in a reply into live streams.
/// Built per call and passed explicitly to the decoder.
#[derive(Clone)]
pub struct DeserializeContext {
    pub reply_address: String,
    pub method: &'static str,
    pub call_site: Option<Arc<str>>,
    pub registry: Arc<StreamRegistry>,
    pub invocation_id: InvocationId,
}

impl std::fmt::Debug for DeserializeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeserializeContext")
            .field("reply_address", &self.reply_address)
            .field("method", &self.method)
            .field("invocation_id", &self.invocation_id)
            .finish_non_exhaustive()
    }
}

struct ReplyBinder<'a>(&'a DeserializeContext);

impl StreamVisitor for ReplyBinder<'_> {
    fn bind(&mut self, handle: u32) -> Result<StreamBinding> {
        let ctx = self.0;
        let demux = ctx.registry.get(&ctx.reply_address).ok_or_else(|| {
            Error::new(
                ErrorKind::DeserializeFailed,
                format!(
                    "reply of {} carries stream {handle} but {} has no live demultiplexer",
                    ctx.method, ctx.reply_address
                ),
            )
        })?;
        Ok(demux.get_for_handle(handle))
    }

    fn export(&mut self, _source: Box<dyn ObservationSource>) -> Result<u32> {
        Err(Error::new(
            ErrorKind::InvalidArgument,
            "streams cannot be exported while decoding a reply",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Greeting {
        name: String,
        times: u32,
    }

    #[test]
    fn test_codec_formats() {
        let value = Greeting {
            name: "Frodo".into(),
            times: 2,
        };
        let json = Codec::Json.serialize(&value).unwrap();
        assert_eq!(&json[..], br#"{"name":"Frodo","times":2}"#);

        let msgpack = Codec::MessagePack.serialize(&value).unwrap();
        let decoded: Greeting = Codec::MessagePack.deserialize(&msgpack).unwrap();
        assert_eq!(decoded, value);

        let err = Codec::Json.deserialize::<Greeting>(&msgpack).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeserializeFailed);

        let none: Option<u32> = Codec::MessagePack.deserialize(&[]).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(Codec::from_flag(true), Codec::MessagePack);
        assert_eq!(Codec::from_name("json").unwrap(), Codec::Json);
        assert_eq!(Codec::from_name(Codec::MessagePack.name()).unwrap(), Codec::MessagePack);
        assert!(Codec::from_name("xml").is_err());
    }
}
