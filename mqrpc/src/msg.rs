//! Wire protocol between client and server.
//!
//! Every message is a [`TransportMessage`]: routing data lives in properties,
//! the serialized payload in the body. The `tag` property tells the four kinds
//! apart. New fields may be added; none may be removed or renamed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    Actor, Codec, Error, ErrorKind, InvocationId, Payload, Result, SessionId, Trace,
    transport::TransportMessage,
};

/// Queue every server consumes requests from.
pub const RPC_SERVER_QUEUE_NAME: &str = "rpc.server";
/// Prefix of client reply queues: `rpc.client.<user>.<random>`.
pub const RPC_CLIENT_QUEUE_NAME_PREFIX: &str = "rpc.client";

pub(crate) mod property {
    pub const TAG: &str = "tag";
    pub const CODEC: &str = "codec";
    pub const REPLY_TO: &str = "reply-to";
    pub const METHOD_NAME: &str = "method-name";
    pub const RPC_ID: &str = "rpc-id";
    pub const RPC_ID_TIMESTAMP: &str = "rpc-id-timestamp";
    pub const RPC_SESSION_ID: &str = "rpc-session-id";
    pub const RPC_SESSION_ID_TIMESTAMP: &str = "rpc-session-id-timestamp";
    pub const RPC_EXTERNAL_ID: &str = "rpc-external-id";
    pub const RPC_EXTERNAL_ID_TIMESTAMP: &str = "rpc-external-id-timestamp";
    pub const RPC_EXTERNAL_SESSION_ID: &str = "rpc-external-session-id";
    pub const RPC_EXTERNAL_SESSION_ID_TIMESTAMP: &str = "rpc-external-session-id-timestamp";
    pub const IMPERSONATED_ACTOR_ID: &str = "rpc-impersonated-actor-id";
    pub const IMPERSONATED_ACTOR_STORE_ID: &str = "rpc-impersonated-actor-store-id";
    pub const IMPERSONATED_ACTOR_OWNING_LEGAL_IDENTITY: &str =
        "rpc-impersonated-actor-owning-legal-identity";
    pub const OBSERVABLE_ID: &str = "observable-id";
    pub const OBSERVABLE_ID_TIMESTAMP: &str = "observable-id-timestamp";
    pub const DEDUPLICATION_IDENTITY: &str = "deduplication-identity";
    pub const DEDUPLICATION_SEQUENCE_NUMBER: &str = "deduplication-sequence-number";
}

use property as p;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Request = 0,
    StreamsClosed = 1,
    Reply = 2,
    Observation = 3,
}

impl Tag {
    fn read(msg: &TransportMessage) -> Result<Self> {
        match msg.get_int(p::TAG) {
            Some(0) => Ok(Tag::Request),
            Some(1) => Ok(Tag::StreamsClosed),
            Some(2) => Ok(Tag::Reply),
            Some(3) => Ok(Tag::Observation),
            Some(tag) => Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("unknown message tag: {tag}"),
            )),
            None => Err(missing(p::TAG)),
        }
    }
}

fn missing(key: &str) -> Error {
    Error::new(
        ErrorKind::DeserializeFailed,
        format!("missing message property: {key}"),
    )
}

fn put_id(msg: &mut TransportMessage, key: &str, ts_key: &str, value: u64, ts: u64) -> Result<()> {
    msg.put_long(key, i64::try_from(value)?);
    msg.put_long(ts_key, i64::try_from(ts)?);
    Ok(())
}

fn get_id(msg: &TransportMessage, key: &str, ts_key: &str) -> Result<(u64, u64)> {
    optional_id(msg, key, ts_key)?.ok_or_else(|| missing(key))
}

fn optional_id(msg: &TransportMessage, key: &str, ts_key: &str) -> Result<Option<(u64, u64)>> {
    match (msg.get_long(key), msg.get_long(ts_key)) {
        (Some(value), Some(ts)) => Ok(Some((u64::try_from(value)?, u64::try_from(ts)?))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(missing(ts_key)),
        (None, Some(_)) => Err(missing(key)),
    }
}

fn get_string(msg: &TransportMessage, key: &str) -> Result<String> {
    msg.get_string(key)
        .map(str::to_string)
        .ok_or_else(|| missing(key))
}

fn get_codec(msg: &TransportMessage) -> Result<Codec> {
    msg.get_string(p::CODEC)
        .map_or(Ok(Codec::default()), Codec::from_name)
}

/// Stamps the sender identity and its next sequence number, so a receiver can
/// drop redelivered copies.
///
/// # Errors
///
/// `InvalidArgument` if `sequence` does not fit a long property.
pub fn stamp_sequence(msg: &mut TransportMessage, identity: &str, sequence: u64) -> Result<()> {
    msg.put_string(p::DEDUPLICATION_IDENTITY, identity);
    msg.put_long(p::DEDUPLICATION_SEQUENCE_NUMBER, i64::try_from(sequence)?);
    Ok(())
}

/// Sender identity and sequence number, if the sender stamped them.
#[must_use]
pub fn sequence_of(msg: &TransportMessage) -> Option<(&str, u64)> {
    let identity = msg.get_string(p::DEDUPLICATION_IDENTITY)?;
    let sequence = msg.get_long(p::DEDUPLICATION_SEQUENCE_NUMBER)?;
    Some((identity, u64::try_from(sequence).ok()?))
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: InvocationId,
    pub session_id: SessionId,
    pub method: String,
    /// Queue the reply (and any observations) must be sent to.
    pub reply_to: String,
    /// Serialized argument tuple.
    pub arguments: Payload,
    pub external_trace: Option<Trace>,
    pub impersonated_actor: Option<Actor>,
    pub codec: Codec,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientToServer {
    Request(RpcRequest),
    /// The client dropped every stream rooted at these invocations.
    StreamsClosed {
        ids: Vec<InvocationId>,
        codec: Codec,
    },
}

impl ClientToServer {
    /// # Errors
    ///
    /// `InvalidArgument` if an id does not fit a long property, or the codec's
    /// error if the closed-stream list cannot be serialized.
    pub fn into_message(self) -> Result<TransportMessage> {
        let mut msg = TransportMessage::default();
        match self {
            ClientToServer::Request(request) => {
                msg.put_int(p::TAG, Tag::Request as i32);
                msg.put_string(p::CODEC, request.codec.name());
                msg.put_string(p::REPLY_TO, request.reply_to);
                msg.put_string(p::METHOD_NAME, request.method);
                put_id(
                    &mut msg,
                    p::RPC_ID,
                    p::RPC_ID_TIMESTAMP,
                    request.id.value,
                    request.id.timestamp,
                )?;
                put_id(
                    &mut msg,
                    p::RPC_SESSION_ID,
                    p::RPC_SESSION_ID_TIMESTAMP,
                    request.session_id.value,
                    request.session_id.timestamp,
                )?;
                if let Some(trace) = request.external_trace {
                    put_id(
                        &mut msg,
                        p::RPC_EXTERNAL_ID,
                        p::RPC_EXTERNAL_ID_TIMESTAMP,
                        trace.invocation_id.value,
                        trace.invocation_id.timestamp,
                    )?;
                    put_id(
                        &mut msg,
                        p::RPC_EXTERNAL_SESSION_ID,
                        p::RPC_EXTERNAL_SESSION_ID_TIMESTAMP,
                        trace.session_id.value,
                        trace.session_id.timestamp,
                    )?;
                }
                if let Some(actor) = request.impersonated_actor {
                    msg.put_string(p::IMPERSONATED_ACTOR_ID, actor.id);
                    msg.put_string(p::IMPERSONATED_ACTOR_STORE_ID, actor.store_id);
                    msg.put_string(
                        p::IMPERSONATED_ACTOR_OWNING_LEGAL_IDENTITY,
                        actor.owning_legal_identity,
                    );
                }
                msg.body = request.arguments;
            }
            ClientToServer::StreamsClosed { ids, codec } => {
                msg.put_int(p::TAG, Tag::StreamsClosed as i32);
                msg.put_string(p::CODEC, codec.name());
                msg.body = codec.serialize(&ids)?.into();
            }
        }
        Ok(msg)
    }

    /// # Errors
    ///
    /// `DeserializeFailed` on an unknown tag or a missing mandatory property.
    pub fn from_message(msg: TransportMessage) -> Result<Self> {
        match Tag::read(&msg)? {
            Tag::Request => {
                let (value, ts) = get_id(&msg, p::RPC_ID, p::RPC_ID_TIMESTAMP)?;
                let id = InvocationId::new(value, ts);
                let (value, ts) = get_id(&msg, p::RPC_SESSION_ID, p::RPC_SESSION_ID_TIMESTAMP)?;
                let session_id = SessionId::new(value, ts);

                let external_id = optional_id(&msg, p::RPC_EXTERNAL_ID, p::RPC_EXTERNAL_ID_TIMESTAMP)?;
                let external_session_id = optional_id(
                    &msg,
                    p::RPC_EXTERNAL_SESSION_ID,
                    p::RPC_EXTERNAL_SESSION_ID_TIMESTAMP,
                )?;
                let external_trace = match (external_id, external_session_id) {
                    (Some((id, id_ts)), Some((session, session_ts))) => Some(Trace {
                        invocation_id: InvocationId::new(id, id_ts),
                        session_id: SessionId::new(session, session_ts),
                    }),
                    (None, None) => None,
                    (Some(_), None) => return Err(missing(p::RPC_EXTERNAL_SESSION_ID)),
                    (None, Some(_)) => return Err(missing(p::RPC_EXTERNAL_ID)),
                };

                let impersonated_actor = match msg.get_string(p::IMPERSONATED_ACTOR_ID) {
                    Some(actor_id) => Some(Actor {
                        id: actor_id.to_string(),
                        store_id: get_string(&msg, p::IMPERSONATED_ACTOR_STORE_ID)?,
                        owning_legal_identity: get_string(
                            &msg,
                            p::IMPERSONATED_ACTOR_OWNING_LEGAL_IDENTITY,
                        )?,
                    }),
                    None => None,
                };

                Ok(ClientToServer::Request(RpcRequest {
                    id,
                    session_id,
                    method: get_string(&msg, p::METHOD_NAME)?,
                    reply_to: get_string(&msg, p::REPLY_TO)?,
                    codec: get_codec(&msg)?,
                    external_trace,
                    impersonated_actor,
                    arguments: msg.body,
                }))
            }
            Tag::StreamsClosed => {
                let codec = get_codec(&msg)?;
                let ids = codec.deserialize(msg.body.as_slice())?;
                Ok(ClientToServer::StreamsClosed { ids, codec })
            }
            tag => Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("{tag:?} is not a client-to-server message"),
            )),
        }
    }
}

/// Reply to a request; the body is a serialized `Result<T, Error>`.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub id: InvocationId,
    pub codec: Codec,
    pub body: Payload,
}

/// One stream event; `id` is the root invocation whose reply queue carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcObservation {
    pub id: InvocationId,
    pub codec: Codec,
    pub body: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerToClient {
    Reply(RpcReply),
    Observation(RpcObservation),
}

impl ServerToClient {
    /// # Errors
    ///
    /// `InvalidArgument` if the invocation id does not fit a long property.
    pub fn into_message(self) -> Result<TransportMessage> {
        let mut msg = TransportMessage::default();
        match self {
            ServerToClient::Reply(reply) => {
                msg.put_int(p::TAG, Tag::Reply as i32);
                msg.put_string(p::CODEC, reply.codec.name());
                put_id(
                    &mut msg,
                    p::RPC_ID,
                    p::RPC_ID_TIMESTAMP,
                    reply.id.value,
                    reply.id.timestamp,
                )?;
                msg.body = reply.body;
            }
            ServerToClient::Observation(observation) => {
                msg.put_int(p::TAG, Tag::Observation as i32);
                msg.put_string(p::CODEC, observation.codec.name());
                put_id(
                    &mut msg,
                    p::OBSERVABLE_ID,
                    p::OBSERVABLE_ID_TIMESTAMP,
                    observation.id.value,
                    observation.id.timestamp,
                )?;
                msg.body = observation.body;
            }
        }
        Ok(msg)
    }

    /// # Errors
    ///
    /// `DeserializeFailed` on an unknown tag, a client-to-server tag or a
    /// missing mandatory property.
    pub fn from_message(msg: TransportMessage) -> Result<Self> {
        match Tag::read(&msg)? {
            Tag::Reply => {
                let (value, ts) = get_id(&msg, p::RPC_ID, p::RPC_ID_TIMESTAMP)?;
                Ok(ServerToClient::Reply(RpcReply {
                    id: InvocationId::new(value, ts),
                    codec: get_codec(&msg)?,
                    body: msg.body,
                }))
            }
            Tag::Observation => {
                let (value, ts) = get_id(&msg, p::OBSERVABLE_ID, p::OBSERVABLE_ID_TIMESTAMP)?;
                Ok(ServerToClient::Observation(RpcObservation {
                    id: InvocationId::new(value, ts),
                    codec: get_codec(&msg)?,
                    body: msg.body,
                }))
            }
            tag => Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("{tag:?} is not a server-to-client message"),
            )),
        }
    }
}

/// Envelope of every value pushed on a stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A serialized item, in the codec of the carrying message.
    Next(Bytes),
    Error(Error),
    Complete,
}

impl StreamEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Next(_))
    }
}

/// Body of an observation: the handle names the stream inside its reply queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ObservationBody {
    pub handle: u32,
    pub event: StreamEvent,
}
