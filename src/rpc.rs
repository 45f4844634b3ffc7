use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelHandler};
use crate::error::Error;
use crate::packet::{Packet, ParseOutcome, PayloadType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Request = 0,
    Response = 1,
}

impl From<MessageType> for u8 {
    fn from(v: MessageType) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Response),
            other => Err(format!("invalid message type {}", other)),
        }
    }
}

/// Dispatch failures reported back to the caller inside an error response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ErrorCode {
    WrongProto = 1,
    NoService = 2,
    NoMethod = 3,
    InvalidRequest = 4,
    InvalidResponse = 5,
}

impl From<ErrorCode> for u8 {
    fn from(v: ErrorCode) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            1 => Ok(ErrorCode::WrongProto),
            2 => Ok(ErrorCode::NoService),
            3 => Ok(ErrorCode::NoMethod),
            4 => Ok(ErrorCode::InvalidRequest),
            5 => Ok(ErrorCode::InvalidResponse),
            other => Err(format!("invalid error code {}", other)),
        }
    }
}

/// The RPC envelope carried inside every frame body. One struct serves both
/// encodings: `serde_json` for [`PayloadType::Json`], `bincode` for
/// [`PayloadType::Binary`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Correlation id; a response echoes the id of its request.
    pub id: u64,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub request: Vec<u8>,
    #[serde(default)]
    pub response: Vec<u8>,
    #[serde(default)]
    pub error: Option<ErrorCode>,
}

impl RpcMessage {
    pub fn request(id: u64, service: &str, method: &str, request: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Request,
            id,
            service: service.to_owned(),
            method: method.to_owned(),
            request,
            response: Vec::new(),
            error: None,
        }
    }

    pub fn response(id: u64, response: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Response,
            id,
            service: String::new(),
            method: String::new(),
            request: Vec::new(),
            response,
            error: None,
        }
    }

    pub fn error_response(id: u64, code: ErrorCode) -> Self {
        Self {
            kind: MessageType::Response,
            id,
            service: String::new(),
            method: String::new(),
            request: Vec::new(),
            response: Vec::new(),
            error: Some(code),
        }
    }

    pub fn encode(&self, payload: PayloadType) -> crate::Result<Vec<u8>> {
        match payload {
            PayloadType::Json => {
                serde_json::to_vec(self).map_err(|e| Error::Encode(e.to_string()))
            }
            PayloadType::Binary => {
                bincode::serialize(self).map_err(|e| Error::Encode(e.to_string()))
            }
        }
    }

    pub fn decode(payload: PayloadType, body: &[u8]) -> Option<Self> {
        match payload {
            PayloadType::Json => serde_json::from_slice(body).ok(),
            PayloadType::Binary => bincode::deserialize(body).ok(),
        }
    }
}

/// A callable service. Invocation is synchronous on the worker loop thread;
/// implementations must return `NoMethod` for methods they don't export.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    fn call(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ErrorCode>;
}

/// Name to service map. Populated before the loops start, then shared
/// read-only across workers behind an `Arc`.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Box<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects duplicate names.
    pub fn register(&mut self, service: Box<dyn Service>) -> bool {
        let name = service.name().to_owned();
        if self.services.contains_key(&name) {
            warn!(service = %name, "duplicate service registration rejected");
            return false;
        }
        debug!(service = %name, "service registered");
        self.services.insert(name, service);
        true
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn dispatch(
        &self,
        service: &str,
        method: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, ErrorCode> {
        let svc = self.services.get(service).ok_or(ErrorCode::NoService)?;
        svc.call(method, request)
    }
}

/// Per-connection RPC dispatcher. Parses frames off the channel's input
/// buffer, decodes envelopes and routes requests into the registry; dispatch
/// failures are answered with an error response reusing the request's id
/// and payload encoding.
pub struct RpcChannel {
    services: Arc<ServiceRegistry>,
    max_body: u32,
}

impl RpcChannel {
    pub fn new(services: Arc<ServiceRegistry>, max_body: u32) -> Self {
        Self { services, max_body }
    }

    fn handle_packet(&mut self, chan: &mut Channel, pkt: Packet) -> bool {
        let payload = match pkt.payload_type() {
            Some(p) => p,
            None => {
                // decode failed before the request/response branch; answered
                // in JSON since the requested encoding is unknown.
                warn!(bits = pkt.payload, "unknown payload encoding");
                return self.send_error(chan, PayloadType::Json, 0, ErrorCode::InvalidRequest);
            }
        };
        let msg = match RpcMessage::decode(payload, &pkt.body) {
            Some(m) => m,
            None => {
                warn!(len = pkt.body.len(), "undecodable envelope");
                return self.send_error(chan, payload, 0, ErrorCode::InvalidRequest);
            }
        };
        match msg.kind {
            MessageType::Request => self.handle_request(chan, payload, msg),
            MessageType::Response => {
                self.on_response(msg);
                true
            }
        }
    }

    fn handle_request(&mut self, chan: &mut Channel, payload: PayloadType, msg: RpcMessage) -> bool {
        trace!(
            id = msg.id,
            service = %msg.service,
            method = %msg.method,
            "rpc request"
        );
        match self.services.dispatch(&msg.service, &msg.method, &msg.request) {
            Ok(bytes) => self.send_reply(chan, payload, RpcMessage::response(msg.id, bytes)),
            Err(code) => {
                debug!(id = msg.id, service = %msg.service, ?code, "rpc dispatch error");
                self.send_error(chan, payload, msg.id, code)
            }
        }
    }

    /// Inbound response envelopes belong to client stubs; the server role
    /// logs and drops them.
    fn on_response(&mut self, msg: RpcMessage) {
        debug!(id = msg.id, "dropping unexpected response envelope");
    }

    fn send_error(
        &mut self,
        chan: &mut Channel,
        payload: PayloadType,
        id: u64,
        code: ErrorCode,
    ) -> bool {
        self.send_reply(chan, payload, RpcMessage::error_response(id, code))
    }

    fn send_reply(&mut self, chan: &mut Channel, payload: PayloadType, msg: RpcMessage) -> bool {
        match msg.encode(payload) {
            Ok(body) => chan.send_message(&Packet::encode(payload, &body)),
            Err(e) => {
                // drop the reply, keep the connection.
                error!(id = msg.id, "envelope encode failed: {}", e);
                true
            }
        }
    }
}

impl ChannelHandler for RpcChannel {
    fn on_message(&mut self, chan: &mut Channel, input: &mut Buffer) -> bool {
        loop {
            match Packet::try_parse(input, self.max_body) {
                ParseOutcome::Packet(pkt) => {
                    if !self.handle_packet(chan, pkt) {
                        return false;
                    }
                }
                ParseOutcome::Incomplete => return true,
                ParseOutcome::Malformed(len) => {
                    warn!(
                        id = chan.id(),
                        declared = len,
                        max = self.max_body,
                        "malformed frame, closing connection"
                    );
                    return false;
                }
            }
        }
    }

    fn on_closed(&mut self, chan: &mut Channel) {
        trace!(id = chan.id(), "rpc channel closed");
    }
}
