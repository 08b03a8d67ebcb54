//! Invocation facade — what the rest of the platform sees of a channel.
//!
//! The agent side registers an executor singleton backed by a
//! [`TaskRegistry`] of named actions and computations. The controller side
//! wraps its channel in a [`RemoteNode`] and drives the executor with
//! `exec`/`calc` (blocking) or `submit_action`/`submit` (futures).

use std::sync::Arc;

use dashmap::DashMap;

use crate::object::{RemoteHandle, Value};
use crate::rpc::{
    CallFuture, Interface, Method, RemoteError, RemoteProxy, RpcChannel, RpcError, ServiceObject,
    Singletons,
};

/// Singleton name of the executor on every agent.
pub const EXECUTOR_SINGLETON: &str = "tether.executor";
pub const EXECUTOR_INTERFACE: &str = "tether.Executor";
/// Declared error kind for unknown tasks.
pub const TASK_ERROR: &str = "TaskError";

pub fn executor_interface() -> Interface {
    Interface::new(EXECUTOR_INTERFACE)
        .method_throws("run", &["str", "list"], &[TASK_ERROR])
        .method_throws("call", &["str", "list"], &[TASK_ERROR])
}

type Action = Arc<dyn Fn(&[Value]) -> Result<(), RemoteError> + Send + Sync>;
type Computation = Arc<dyn Fn(&[Value]) -> Result<Value, RemoteError> + Send + Sync>;

// ── Agent side ────────────────────────────────────────────────────────────────

/// Named actions (no result) and computations (one result).
#[derive(Clone, Default)]
pub struct TaskRegistry {
    actions: Arc<DashMap<String, Action>>,
    computations: Arc<DashMap<String, Computation>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<(), RemoteError> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn computation<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.computations.insert(name.into(), Arc::new(f));
        self
    }

    pub fn run(&self, name: &str, args: &[Value]) -> Result<(), RemoteError> {
        let action = self
            .actions
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| unknown("action", name))?;
        action(args)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, RemoteError> {
        let computation = self
            .computations
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| unknown("computation", name))?;
        computation(args)
    }

    /// Task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions
            .iter()
            .map(|e| e.key().clone())
            .chain(self.computations.iter().map(|e| e.key().clone()))
            .collect();
        names.sort();
        names
    }

    /// The executor service object for this registry.
    pub fn into_service(self) -> Result<Arc<ServiceObject>, RpcError> {
        let iface = executor_interface();
        let runner = self.clone();
        ServiceObject::builder("executor")
            .handle(&iface, "run", move |args| {
                tracing::debug!(task = args.str(0).unwrap_or("?"), "run");
                runner.run(args.str(0)?, args.list(1)?).map(|()| Value::Null)
            })
            .handle(&iface, "call", move |args| {
                tracing::debug!(task = args.str(0).unwrap_or("?"), "call");
                self.call(args.str(0)?, args.list(1)?)
            })
            .build()
    }

    /// Register the executor as a singleton so the peer can reach it.
    pub fn install(self, singletons: &Singletons) -> Result<(), RpcError> {
        singletons.register(EXECUTOR_SINGLETON, self.into_service()?);
        Ok(())
    }
}

fn unknown(what: &str, name: &str) -> RemoteError {
    RemoteError::new(TASK_ERROR, format!("no {what} named {name:?}"))
}

// ── Controller side ───────────────────────────────────────────────────────────

/// A remote node reached through an RPC channel.
pub struct RemoteNode {
    channel: RpcChannel,
    executor: Arc<RemoteProxy>,
    run: Method,
    call: Method,
}

impl RemoteNode {
    pub fn new(channel: RpcChannel) -> Self {
        let iface = executor_interface();
        let executor = channel.singleton_proxy(EXECUTOR_SINGLETON, &[EXECUTOR_INTERFACE]);
        Self {
            run: iface.methods()[0].clone(),
            call: iface.methods()[1].clone(),
            channel,
            executor,
        }
    }

    /// Run an action and wait for it to finish.
    #[track_caller]
    pub fn exec(&self, action: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.executor
            .call(&self.run, vec![action.into(), Value::List(args)])
            .map(drop)
    }

    /// Run a computation and wait for its result.
    #[track_caller]
    pub fn calc(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.executor
            .call(&self.call, vec![name.into(), Value::List(args)])
    }

    /// Start an action; the future resolves to `Null` when it finishes.
    #[track_caller]
    pub fn submit_action(&self, action: &str, args: Vec<Value>) -> CallFuture {
        self.executor
            .invoke(&self.run, vec![action.into(), Value::List(args)])
    }

    /// Start a computation.
    #[track_caller]
    pub fn submit(&self, name: &str, args: Vec<Value>) -> CallFuture {
        self.executor
            .invoke(&self.call, vec![name.into(), Value::List(args)])
    }

    /// Make a local object callable by the node.
    pub fn export(
        &self,
        interfaces: &[&str],
        object: &Arc<ServiceObject>,
    ) -> Result<RemoteHandle, RpcError> {
        self.channel.export_object(interfaces, object)
    }

    /// Close the channel. Pending calls fail with a closed error.
    pub fn shutdown(&self) {
        self.channel.close();
    }

    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    pub fn executor(&self) -> &Arc<RemoteProxy> {
        &self.executor
    }
}
