//! Marshaling chain — per-node substitution while converting object graphs
//! to and from their wire form.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::value::{Value, WireValue};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error("value of type {0} cannot cross the wire")]
    NotPortable(String),

    #[error("unresolved reference to {0}")]
    Unresolved(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("{0}")]
    Stage(String),
}

/// One stage of a marshaling chain.
///
/// `write_replace` sees every node on the way out, parents before children;
/// `read_resolve` sees every node on the way in, children before parents.
pub trait Marshaler: Send + Sync {
    fn write_replace(&self, value: Value) -> Result<Value, MarshalError> {
        Ok(value)
    }

    fn read_resolve(&self, value: Value) -> Result<Value, MarshalError> {
        Ok(value)
    }
}

/// Ordered list of stages. Outbound applies them first to last, inbound
/// last to first.
#[derive(Clone, Default)]
pub struct MarshalChain {
    stages: Vec<Arc<dyn Marshaler>>,
}

impl MarshalChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: Arc<dyn Marshaler>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: Arc<dyn Marshaler>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn to_wire(&self, value: Value) -> Result<WireValue, MarshalError> {
        let value = self
            .stages
            .iter()
            .try_fold(value, |v, stage| stage.write_replace(v))?;

        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(b),
            Value::Int(i) => WireValue::Int(i),
            Value::Float(x) => WireValue::Float(x),
            Value::Str(s) => WireValue::Str(s),
            Value::Bytes(b) => WireValue::Bytes(b),
            Value::List(items) => WireValue::List(
                items
                    .into_iter()
                    .map(|v| self.to_wire(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(m) => WireValue::Map(
                m.into_iter()
                    .map(|(k, v)| Ok((k, self.to_wire(v)?)))
                    .collect::<Result<BTreeMap<_, _>, MarshalError>>()?,
            ),
            Value::Remote(h) => WireValue::Ref(h),
            Value::Live(o) => return Err(MarshalError::NotPortable(o.type_name().to_string())),
        })
    }

    pub fn from_wire(&self, wire: WireValue) -> Result<Value, MarshalError> {
        let value = match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(x) => Value::Float(x),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|w| self.from_wire(w))
                    .collect::<Result<_, _>>()?,
            ),
            WireValue::Map(m) => Value::Map(
                m.into_iter()
                    .map(|(k, w)| Ok((k, self.from_wire(w)?)))
                    .collect::<Result<BTreeMap<_, _>, MarshalError>>()?,
            ),
            WireValue::Ref(h) => Value::Remote(h),
        };
        self.stages
            .iter()
            .rev()
            .try_fold(value, |v, stage| stage.read_resolve(v))
    }
}
