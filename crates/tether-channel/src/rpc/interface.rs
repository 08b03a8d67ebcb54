//! Interfaces and service objects.
//!
//! An [`Interface`] is a named list of methods shared by both sides. A
//! [`ServiceObject`] implements one or more interfaces with a handler per
//! method; its handler table is fixed when it is built and is the lookup
//! used to dispatch inbound calls.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::object::{LiveObject, Value};

use super::error::{RemoteError, RpcError, BAD_ARGUMENTS, NO_SUCH_METHOD};
use super::message::{Method, MethodSig};

/// Parameter type accepted by any value.
pub const ANY: &str = "any";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    name: String,
    methods: Vec<Method>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a method that declares no error kinds.
    pub fn method(self, name: &str, params: &[&str]) -> Self {
        self.method_throws(name, params, &[])
    }

    pub fn method_throws(mut self, name: &str, params: &[&str], throws: &[&str]) -> Self {
        self.methods.push(Method {
            sig: MethodSig::new(&self.name, name, params),
            throws: throws.iter().map(|t| t.to_string()).collect(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// The first method with this name.
    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.sig.name == name)
    }

    /// The overload with exactly these parameter types.
    pub fn lookup(&self, name: &str, params: &[&str]) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.sig.name == name && m.sig.params.iter().map(String::as_str).eq(params.iter().copied()))
    }
}

// ── Arguments ─────────────────────────────────────────────────────────────────

/// Call arguments handed to a handler, with typed accessors that fail with
/// a `BadArguments` remote error.
#[derive(Debug, Clone)]
pub struct Args {
    method: MethodSig,
    values: Vec<Value>,
}

impl Args {
    pub fn new(method: MethodSig, values: Vec<Value>) -> Self {
        Self { method, values }
    }

    pub fn method(&self) -> &MethodSig {
        &self.method
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, index: usize) -> Result<&Value, RemoteError> {
        self.values
            .get(index)
            .ok_or_else(|| self.bad(index, "missing"))
    }

    pub fn i64(&self, index: usize) -> Result<i64, RemoteError> {
        self.get(index)?
            .as_i64()
            .ok_or_else(|| self.bad(index, "expected int"))
    }

    pub fn f64(&self, index: usize) -> Result<f64, RemoteError> {
        self.get(index)?
            .as_f64()
            .ok_or_else(|| self.bad(index, "expected float"))
    }

    pub fn bool(&self, index: usize) -> Result<bool, RemoteError> {
        self.get(index)?
            .as_bool()
            .ok_or_else(|| self.bad(index, "expected bool"))
    }

    pub fn str(&self, index: usize) -> Result<&str, RemoteError> {
        self.get(index)?
            .as_str()
            .ok_or_else(|| self.bad(index, "expected str"))
    }

    pub fn list(&self, index: usize) -> Result<&[Value], RemoteError> {
        self.get(index)?
            .as_list()
            .ok_or_else(|| self.bad(index, "expected list"))
    }

    /// A live object argument of concrete type `T`.
    pub fn live<T: LiveObject>(&self, index: usize) -> Result<Arc<T>, RemoteError> {
        self.get(index)?
            .live::<T>()
            .ok_or_else(|| self.bad(index, "expected object reference"))
    }

    fn bad(&self, index: usize, what: &str) -> RemoteError {
        RemoteError::new(BAD_ARGUMENTS, format!("{}: argument {index}: {what}", self.method))
    }
}

/// Whether `value` may be passed for a parameter named `param`.
///
/// Primitive parameter names must match the value's type. Any other name is
/// an interface name and accepts object references or null.
pub fn accepts(param: &str, value: &Value) -> bool {
    match param {
        ANY => true,
        "null" | "bool" | "int" | "str" | "bytes" | "list" | "map" => value.type_name() == param,
        "float" => matches!(value, Value::Float(_) | Value::Int(_)),
        _ => matches!(value, Value::Live(_) | Value::Remote(_) | Value::Null),
    }
}

// ── Service objects ───────────────────────────────────────────────────────────

pub type Handler = Arc<dyn Fn(Args) -> Result<Value, RemoteError> + Send + Sync>;

/// A local object callable by the peer.
pub struct ServiceObject {
    label: String,
    interfaces: Vec<String>,
    handlers: HashMap<MethodSig, Handler>,
}

impl ServiceObject {
    pub fn builder(label: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            label: label.into(),
            interfaces: Vec::new(),
            handlers: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }

    /// Run the handler registered for `method`.
    pub fn dispatch(&self, method: &MethodSig, args: Vec<Value>) -> Result<Value, RemoteError> {
        let handler = self.handlers.get(method).ok_or_else(|| {
            RemoteError::new(NO_SUCH_METHOD, format!("{} does not implement {method}", self.label))
        })?;
        if args.len() != method.params.len() {
            return Err(RemoteError::new(
                BAD_ARGUMENTS,
                format!("{method}: expected {} arguments, got {}", method.params.len(), args.len()),
            ));
        }
        if let Some((i, (param, arg))) = method
            .params
            .iter()
            .zip(&args)
            .enumerate()
            .find(|(_, (param, arg))| !accepts(param, arg))
        {
            return Err(RemoteError::new(
                BAD_ARGUMENTS,
                format!("{method}: argument {i} is {}, expected {param}", arg.type_name()),
            ));
        }
        handler(Args::new(method.clone(), args))
    }
}

impl LiveObject for ServiceObject {
    fn type_name(&self) -> &str {
        &self.label
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for ServiceObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceObject")
            .field("label", &self.label)
            .field("interfaces", &self.interfaces)
            .field("methods", &self.handlers.len())
            .finish()
    }
}

pub struct ServiceBuilder {
    label: String,
    interfaces: Vec<Interface>,
    handlers: HashMap<MethodSig, Handler>,
    errors: Vec<String>,
}

impl ServiceBuilder {
    /// Bind `handler` to the method `name` of `interface`.
    pub fn handle<F>(mut self, interface: &Interface, name: &str, handler: F) -> Self
    where
        F: Fn(Args) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        let Some(method) = interface.get(name) else {
            self.errors
                .push(format!("{} has no method {name}", interface.name()));
            return self;
        };
        if !self.interfaces.iter().any(|i| i.name() == interface.name()) {
            self.interfaces.push(interface.clone());
        }
        self.handlers.insert(method.sig.clone(), Arc::new(handler));
        self
    }

    /// Finish the object. Every method of every interface it handles must
    /// have a handler.
    pub fn build(self) -> Result<Arc<ServiceObject>, RpcError> {
        let mut errors = self.errors;
        for interface in &self.interfaces {
            for method in interface.methods() {
                if !self.handlers.contains_key(&method.sig) {
                    errors.push(format!("{}: no handler for {}", self.label, method.sig));
                }
            }
        }
        if !errors.is_empty() {
            return Err(RpcError::Definition(errors.join("; ")));
        }
        Ok(Arc::new(ServiceObject {
            label: self.label,
            interfaces: self.interfaces.iter().map(|i| i.name().to_string()).collect(),
            handlers: self.handlers,
        }))
    }
}
