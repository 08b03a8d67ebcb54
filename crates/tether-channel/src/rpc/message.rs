//! RPC messages (CALL and RETURN) and method descriptions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::{MarshalChain, MarshalError, Portable, Value, WireValue};

use super::error::RemoteError;

/// Wire identity of a method: interface, name and parameter type names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSig {
    pub interface: String,
    pub name: String,
    pub params: Vec<String>,
}

impl MethodSig {
    pub fn new(interface: &str, name: &str, params: &[&str]) -> Self {
        Self {
            interface: interface.to_string(),
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl fmt::Display for MethodSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.interface, self.name, self.params.join(","))
    }
}

/// A method as seen by callers: its signature plus the error kinds it
/// declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub sig: MethodSig,
    pub throws: Vec<String>,
}

impl Method {
    pub fn declares(&self, kind: &str) -> bool {
        self.throws.iter().any(|t| t == kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub call_id: u64,
    pub instance_id: String,
    pub method: MethodSig,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallReturn {
    pub call_id: u64,
    pub outcome: Result<Value, RemoteError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Call(CallRequest),
    Return(CallReturn),
    /// A RETURN whose result could not be decoded on this side. Only ever
    /// produced by decoding; it cannot be sent.
    Unreadable { call_id: u64, reason: String },
}

// ── Wire form ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Call {
        call_id: u64,
        instance_id: String,
        method: MethodSig,
        args: Vec<WireValue>,
    },
    Return {
        call_id: u64,
        outcome: WireOutcome,
    },
}

/// The result stays raw JSON until the call id has been read, so a result
/// this side cannot decode still resolves its call.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireOutcome {
    Ok(serde_json::Value),
    Err(RemoteError),
}

impl Portable for RpcMessage {
    type Wire = WireMessage;

    fn to_wire(self, chain: &MarshalChain) -> Result<WireMessage, MarshalError> {
        Ok(match self {
            RpcMessage::Call(call) => WireMessage::Call {
                call_id: call.call_id,
                instance_id: call.instance_id,
                method: call.method,
                args: call
                    .args
                    .into_iter()
                    .map(|a| chain.to_wire(a))
                    .collect::<Result<_, _>>()?,
            },
            RpcMessage::Return(ret) => WireMessage::Return {
                call_id: ret.call_id,
                outcome: match ret.outcome {
                    Ok(value) => WireOutcome::Ok(
                        serde_json::to_value(chain.to_wire(value)?)
                            .map_err(|e| MarshalError::Encode(e.to_string()))?,
                    ),
                    Err(e) => WireOutcome::Err(e),
                },
            },
            RpcMessage::Unreadable { call_id, .. } => {
                return Err(MarshalError::Encode(format!(
                    "return {call_id} was never decoded"
                )))
            }
        })
    }

    fn from_wire(wire: WireMessage, chain: &MarshalChain) -> Result<RpcMessage, MarshalError> {
        Ok(match wire {
            WireMessage::Call {
                call_id,
                instance_id,
                method,
                args,
            } => RpcMessage::Call(CallRequest {
                call_id,
                instance_id,
                method,
                args: args
                    .into_iter()
                    .map(|a| chain.from_wire(a))
                    .collect::<Result<_, _>>()?,
            }),
            WireMessage::Return {
                call_id,
                outcome: WireOutcome::Err(e),
            } => RpcMessage::Return(CallReturn {
                call_id,
                outcome: Err(e),
            }),
            WireMessage::Return {
                call_id,
                outcome: WireOutcome::Ok(raw),
            } => match decode_result(raw, chain) {
                Ok(value) => RpcMessage::Return(CallReturn {
                    call_id,
                    outcome: Ok(value),
                }),
                Err(e) => RpcMessage::Unreadable {
                    call_id,
                    reason: e.to_string(),
                },
            },
        })
    }
}

fn decode_result(raw: serde_json::Value, chain: &MarshalChain) -> Result<Value, MarshalError> {
    let wire: WireValue =
        serde_json::from_value(raw).map_err(|e| MarshalError::Decode(e.to_string()))?;
    chain.from_wire(wire)
}
