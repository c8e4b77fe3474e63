//! Wire envelope and codec.
//!
//! On the wire an envelope is a flat JSON object with optional fields:
//!
//! ```text
//! request:  {"req":1,"id":"..","env":"client","name":"add","args":[2,3]}
//! trigger:  {"req":1,"trigger":true,"id":"..","env":"server","name":"tick"}
//! response: {"ret":1,"id":"..","env":"server","res":5}
//! failure:  {"ret":1,"id":"..","env":"server","err":"PROCEDURE_NOT_FOUND"}
//! ```
//!
//! Inside the crate it is the tagged union [`Envelope`]; the shape is checked
//! once in [`Envelope::from_json`] so dispatch never probes optional fields.

use crate::environment::Environment;
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Shape violations found while decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope is marked as both request and response")]
    AmbiguousKind,
    #[error("envelope is neither a request nor a response")]
    MissingKind,
    #[error("envelope is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown environment tag `{0}`")]
    UnknownEnvironment(String),
}

/// A call or trigger travelling towards the context that serves `name`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    /// Context that authored this hop.
    pub env: Environment,
    /// Original author when the request was relayed through the client.
    pub fenv: Option<Environment>,
    /// Browser identity when one endpoint of this hop is a browser surface.
    pub browser_id: Option<String>,
    pub name: String,
    pub args: Value,
    pub trigger: bool,
}

impl Request {
    pub fn call(id: impl Into<String>, env: Environment, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            env,
            fenv: None,
            browser_id: None,
            name: name.into(),
            args,
            trigger: false,
        }
    }

    pub fn trigger(id: impl Into<String>, env: Environment, name: impl Into<String>, args: Value) -> Self {
        Self {
            trigger: true,
            ..Self::call(id, env, name, args)
        }
    }

    pub fn with_fenv(mut self, fenv: Option<Environment>) -> Self {
        self.fenv = fenv;
        self
    }

    pub fn with_browser(mut self, browser_id: impl Into<String>) -> Self {
        self.browser_id = Some(browser_id.into());
        self
    }

    /// The environment the request really started in.
    pub fn origin(&self) -> Environment {
        self.fenv.unwrap_or(self.env)
    }
}

/// The single answer to a non-trigger [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub env: Environment,
    pub browser_id: Option<String>,
    /// `Ok(res)` or `Err(err)`.
    pub outcome: std::result::Result<Value, Value>,
}

impl Response {
    pub fn new(id: impl Into<String>, env: Environment, outcome: std::result::Result<Value, Value>) -> Self {
        Self {
            id: id.into(),
            env,
            browser_id: None,
            outcome,
        }
    }
}

/// A decoded wire message: exactly one of request or response.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

/// Flat wire representation, every field optional.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    req: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ret: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fenv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    b: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    res: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trigger: Option<bool>,
}

fn flag_set(flag: &Option<Value>) -> bool {
    match flag {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(_) => true,
    }
}

fn parse_env(tag: Option<String>) -> std::result::Result<Environment, EnvelopeError> {
    let tag = tag.ok_or(EnvelopeError::MissingField("env"))?;
    tag.parse::<Environment>().map_err(|_| EnvelopeError::UnknownEnvironment(tag))
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> std::result::Result<Self, Self::Error> {
        let is_req = flag_set(&wire.req);
        let is_ret = flag_set(&wire.ret);
        if is_req && is_ret {
            return Err(EnvelopeError::AmbiguousKind);
        }
        if !is_req && !is_ret {
            return Err(EnvelopeError::MissingKind);
        }

        let id = wire.id.ok_or(EnvelopeError::MissingField("id"))?;
        let env = parse_env(wire.env)?;

        if is_req {
            let fenv = match wire.fenv {
                Some(tag) => Some(parse_env(Some(tag))?),
                None => None,
            };
            let name = wire.name.ok_or(EnvelopeError::MissingField("name"))?;
            Ok(Envelope::Request(Request {
                id,
                env,
                fenv,
                browser_id: wire.b,
                name,
                args: wire.args.unwrap_or(Value::Null),
                trigger: wire.trigger.unwrap_or(false),
            }))
        } else {
            // A non-null `err` wins; `res` may legitimately be absent (null result).
            let outcome = match wire.err {
                Some(err) if !err.is_null() => Err(err),
                _ => Ok(wire.res.unwrap_or(Value::Null)),
            };
            Ok(Envelope::Response(Response {
                id,
                env,
                browser_id: wire.b,
                outcome,
            }))
        }
    }
}

impl From<&Envelope> for WireEnvelope {
    fn from(envelope: &Envelope) -> Self {
        match envelope {
            Envelope::Request(req) => WireEnvelope {
                req: Some(Value::from(1)),
                id: Some(req.id.clone()),
                env: Some(req.env.as_str().to_string()),
                fenv: req.fenv.map(|e| e.as_str().to_string()),
                b: req.browser_id.clone(),
                name: Some(req.name.clone()),
                args: (!req.args.is_null()).then(|| req.args.clone()),
                trigger: req.trigger.then_some(true),
                ..Default::default()
            },
            Envelope::Response(resp) => {
                let (res, err) = match &resp.outcome {
                    Ok(res) => (Some(res.clone()), None),
                    Err(err) => (None, Some(err.clone())),
                };
                WireEnvelope {
                    ret: Some(Value::from(1)),
                    id: Some(resp.id.clone()),
                    env: Some(resp.env.as_str().to_string()),
                    b: resp.browser_id.clone(),
                    res,
                    err,
                    ..Default::default()
                }
            }
        }
    }
}

impl Envelope {
    pub fn id(&self) -> &str {
        match self {
            Envelope::Request(req) => &req.id,
            Envelope::Response(resp) => &resp.id,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&WireEnvelope::from(self))?)
    }

    /// Deserialize and validate from JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_str(json)?;
        Ok(Envelope::try_from(wire)?)
    }
}

impl From<Request> for Envelope {
    fn from(req: Request) -> Self {
        Envelope::Request(req)
    }
}

impl From<Response> for Envelope {
    fn from(resp: Response) -> Self {
        Envelope::Response(resp)
    }
}

/// Converts envelopes to and from the transport-safe string form.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope) -> Result<String>;
    fn decode(&self, raw: &str) -> Result<Envelope>;
}

/// The default JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<String> {
        envelope.to_json()
    }

    fn decode(&self, raw: &str) -> Result<Envelope> {
        Envelope::from_json(raw)
    }
}

/// Decode with a codec, mapping any failure to a loggable message.
pub(crate) fn decode_or_log(codec: &dyn Codec, raw: &str) -> Option<Envelope> {
    match codec.decode(raw) {
        Ok(envelope) => Some(envelope),
        Err(RpcError::Envelope(e)) => {
            tracing::warn!("Dropping malformed envelope: {}", e);
            None
        }
        Err(e) => {
            tracing::warn!("Dropping undecodable payload: {}", e);
            None
        }
    }
}
