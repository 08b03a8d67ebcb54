//! RPC channel — remote invocation over an object pipe.
//!
//! Each side exports objects and invokes methods on the peer's exports.
//! Calls are correlated by a 64-bit call id; the pending-call table maps
//! each outstanding id to the completion that resolves it.
//!
//! Inbound calls run on the embedder's [`WorkerPool`], never on the task
//! delivering transport bytes. A failing implementation produces a RETURN
//! carrying a [`RemoteError`]; at the caller it becomes
//! [`RpcError::Remote`] when the method declares that error kind and
//! [`RpcError::Undeclared`] otherwise.

pub mod error;
pub mod interface;
pub mod message;
pub mod pool;
pub mod proxy;
pub mod registry;

use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use tether_core::config::{RpcConfig, TetherConfig};

use crate::duplex::ByteDuplex;
use crate::object::{MarshalChain, Marshaler, ObjectPipe, ObjectReceiver, RemoteHandle, Value};
use crate::pipe::{BlobPipe, PipeError};
use crate::supervision::{Component, Supervisor};

pub use error::{FrameOrigin, RemoteError, RpcError, TraceFrame};
pub use interface::{Args, Interface, ServiceObject};
pub use message::{CallRequest, CallReturn, Method, MethodSig, RpcMessage};
pub use pool::{BlockingPool, Job, WorkerPool};
pub use proxy::{CallFuture, RemoteProxy};
pub use registry::{ExportRegistry, Singletons};

use error::{NO_SUCH_INSTANCE, PANIC, UNPORTABLE_RESULT};
use proxy::RpcMarshaler;

type Completer = Box<dyn FnOnce(Result<Value, RpcError>) + Send + Sync>;

/// Sender-side record of an in-flight call.
struct PendingCall {
    method: Method,
    call_site: &'static Location<'static>,
    complete: Completer,
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct RpcChannelBuilder {
    name: String,
    config: TetherConfig,
    pool: Option<Arc<dyn WorkerPool>>,
    singletons: Singletons,
    marshalers: Vec<Arc<dyn Marshaler>>,
    supervisor: Option<Arc<Supervisor>>,
}

impl RpcChannelBuilder {
    /// Replaces the default configuration. The default keeps
    /// `pipe.reconnect` on, so losing the stream leaves calls pending until
    /// a replacement is attached or the channel is closed.
    pub fn config(mut self, config: TetherConfig) -> Self {
        self.config = config;
        self
    }

    /// Pool for inbound calls. Defaults to the current runtime's blocking pool.
    pub fn pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn singletons(mut self, singletons: Singletons) -> Self {
        self.singletons = singletons;
        self
    }

    /// Extra marshaling stage. Runs before the channel's own stage on the
    /// way out and after it on the way in.
    pub fn marshaler(mut self, stage: Arc<dyn Marshaler>) -> Self {
        self.marshalers.push(stage);
        self
    }

    pub fn supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Assemble blob pipe, object pipe and channel on the current runtime.
    pub fn build(self) -> Result<RpcChannel, RpcError> {
        let runtime = Handle::try_current().map_err(|_| RpcError::NoRuntime)?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => Arc::new(BlockingPool::new(runtime.clone())),
        };
        let supervisor = self
            .supervisor
            .unwrap_or_else(|| Supervisor::new(self.name.clone()));
        let blob = BlobPipe::new(self.name.clone(), self.config.pipe.clone(), supervisor.clone())?;

        let marshalers = self.marshalers;
        let inner = Arc::new_cyclic(|weak| {
            let mut chain = MarshalChain::new();
            for stage in marshalers {
                chain.push(stage);
            }
            chain.push(Arc::new(RpcMarshaler {
                channel: weak.clone(),
            }));

            ChannelInner {
                name: self.name,
                config: self.config.rpc,
                objects: ObjectPipe::new(blob, chain),
                pool,
                exports: ExportRegistry::new(),
                imports: DashMap::new(),
                singletons: self.singletons,
                pending: DashMap::new(),
                next_call_id: AtomicU64::new(1),
                terminated: AtomicBool::new(false),
                supervisor,
                runtime,
            }
        });

        inner.objects.bind(Arc::new(Dispatcher {
            channel: Arc::downgrade(&inner),
        }))?;
        let component: Arc<dyn Component> = inner.clone();
        inner.supervisor.register(Arc::downgrade(&component));

        tracing::debug!(channel = %inner.name, "rpc channel ready");
        Ok(RpcChannel { inner })
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// One end of an RPC connection. Clones share the same channel.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    name: String,
    config: RpcConfig,
    objects: ObjectPipe<RpcMessage>,
    pool: Arc<dyn WorkerPool>,
    pub(crate) exports: ExportRegistry,
    imports: DashMap<String, Arc<RemoteProxy>>,
    pub(crate) singletons: Singletons,
    pending: DashMap<u64, PendingCall>,
    next_call_id: AtomicU64,
    terminated: AtomicBool,
    supervisor: Arc<Supervisor>,
    runtime: Handle,
}

impl RpcChannel {
    pub fn builder(name: impl Into<String>) -> RpcChannelBuilder {
        RpcChannelBuilder {
            name: name.into(),
            config: TetherConfig::default(),
            pool: None,
            singletons: Singletons::new(),
            marshalers: Vec::new(),
            supervisor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Make `object` callable by the peer under the given interfaces.
    /// Exporting the same object again returns the same handle.
    pub fn export_object(
        &self,
        interfaces: &[&str],
        object: &Arc<ServiceObject>,
    ) -> Result<RemoteHandle, RpcError> {
        if self.is_terminated() {
            return Err(RpcError::Closed);
        }
        if let Some(missing) = interfaces.iter().find(|i| !object.implements(i)) {
            return Err(RpcError::Definition(format!(
                "{} does not implement {missing}",
                object.label()
            )));
        }
        let interfaces = interfaces.iter().map(|i| i.to_string()).collect();
        Ok(self.inner.exports.export(interfaces, object))
    }

    /// Start a call on the peer's instance `instance_id`.
    #[track_caller]
    pub fn invoke(&self, instance_id: &str, method: &Method, args: Vec<Value>) -> CallFuture {
        let call_site = Location::caller();
        let (tx, rx) = oneshot::channel();
        self.inner.start_call(
            instance_id,
            method,
            args,
            call_site,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        CallFuture::pending(rx)
    }

    /// Call and park the current thread until the result arrives or the
    /// channel terminates. Must not run on a runtime worker thread.
    #[track_caller]
    pub fn invoke_blocking(
        &self,
        instance_id: &str,
        method: &Method,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let call_site = Location::caller();
        ChannelInner::call_blocking(&self.inner, instance_id, method, args, call_site)
    }

    /// Proxy for a handle received from, or agreed with, the peer.
    pub fn proxy(&self, handle: RemoteHandle) -> Arc<RemoteProxy> {
        self.inner.import(handle)
    }

    /// Proxy for the peer's singleton `name`.
    pub fn singleton_proxy(&self, name: &str, interfaces: &[&str]) -> Arc<RemoteProxy> {
        let interfaces = interfaces.iter().map(|i| i.to_string()).collect();
        self.inner.import(RemoteHandle::singleton(name, interfaces))
    }

    pub fn singletons(&self) -> &Singletons {
        &self.inner.singletons
    }

    /// Install or replace the underlying byte stream.
    pub fn attach_stream(&self, stream: Arc<dyn ByteDuplex>) -> Result<(), RpcError> {
        self.inner
            .objects
            .blob_pipe()
            .attach_stream(stream)
            .map_err(RpcError::from)
    }

    /// Fail every pending call, clear the registries and close the pipes.
    pub fn close(&self) {
        self.inner.close("closed locally");
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Resolves once the channel's composition has been torn down.
    pub async fn terminated(&self) {
        self.inner.supervisor.terminated().await;
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.inner.supervisor
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn exported(&self) -> usize {
        self.inner.exports.len()
    }

    pub fn blob_pipe(&self) -> &BlobPipe {
        self.inner.objects.blob_pipe()
    }
}

impl ChannelInner {
    /// Record a pending call and send the CALL. `complete` runs exactly once.
    pub(crate) fn start_call(
        self: &Arc<Self>,
        instance_id: &str,
        method: &Method,
        args: Vec<Value>,
        call_site: &'static Location<'static>,
        complete: Completer,
    ) {
        if self.terminated.load(Ordering::SeqCst) {
            complete(Err(RpcError::Closed));
            return;
        }

        let call_id = loop {
            let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            if !self.pending.contains_key(&id) {
                break id;
            }
        };
        self.pending.insert(
            call_id,
            PendingCall {
                method: method.clone(),
                call_site,
                complete,
            },
        );
        // close() may have drained the table between the check and the insert.
        if self.terminated.load(Ordering::SeqCst) {
            self.finish_call(call_id, Err(RpcError::Closed));
            return;
        }

        tracing::trace!(channel = %self.name, call_id, method = %method.sig, instance = instance_id, "call");
        let delivery = self.objects.send_object(RpcMessage::Call(CallRequest {
            call_id,
            instance_id: instance_id.to_string(),
            method: method.sig.clone(),
            args,
        }));

        let channel = Arc::downgrade(self);
        self.runtime.spawn(async move {
            if let Err(e) = delivery.await {
                if let Some(channel) = channel.upgrade() {
                    channel.finish_call(call_id, Err(RpcError::from(e)));
                }
            }
        });
    }

    pub(crate) fn call_blocking(
        self: &Arc<Self>,
        instance_id: &str,
        method: &Method,
        args: Vec<Value>,
        call_site: &'static Location<'static>,
    ) -> Result<Value, RpcError> {
        let (tx, rx) = sync_channel(1);
        self.start_call(
            instance_id,
            method,
            args,
            call_site,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        let interval = self.config.liveness_interval();
        loop {
            match rx.recv_timeout(interval) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if self.terminated.load(Ordering::SeqCst) {
                        return Err(RpcError::Closed);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(RpcError::Closed),
            }
        }
    }

    fn finish_call(&self, call_id: u64, result: Result<Value, RpcError>) {
        if let Some((_, call)) = self.pending.remove(&call_id) {
            (call.complete)(result);
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    fn on_call(self: &Arc<Self>, request: CallRequest) {
        let channel = self.clone();
        self.pool.execute(Box::new(move || {
            let call_id = request.call_id;
            let outcome = channel.run_call(request);
            channel.send_return(call_id, outcome);
        }));
    }

    fn run_call(&self, request: CallRequest) -> Result<Value, RemoteError> {
        let CallRequest {
            instance_id,
            method,
            args,
            ..
        } = request;

        let target = self.lookup_instance(&instance_id).ok_or_else(|| {
            RemoteError::new(NO_SUCH_INSTANCE, format!("no instance {instance_id}"))
                .at("tether::rpc::dispatch", FrameOrigin::Internal)
        })?;

        let outcome = catch_unwind(AssertUnwindSafe(|| target.dispatch(&method, args)))
            .unwrap_or_else(|panic| Err(RemoteError::new(PANIC, panic_message(panic.as_ref()))));

        outcome.map_err(|e| {
            e.at(format!("{}: {method}", target.label()), FrameOrigin::Remote)
                .at("tether::rpc::dispatch", FrameOrigin::Internal)
        })
    }

    fn send_return(self: &Arc<Self>, call_id: u64, outcome: Result<Value, RemoteError>) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let failed = outcome.is_err();
        let delivery = self.objects.send_object(RpcMessage::Return(CallReturn { call_id, outcome }));

        let channel = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let reason = match delivery.await {
                Ok(()) => return,
                // The result could not be encoded here or decoded there.
                Err(PipeError::Marshal(reason)) | Err(PipeError::Rejected { reason, .. })
                    if !failed =>
                {
                    reason
                }
                Err(e) => {
                    tracing::debug!(call_id, error = %e, "return not delivered");
                    return;
                }
            };
            if let Some(channel) = channel.upgrade() {
                tracing::debug!(channel = %channel.name, call_id, %reason, "result not portable");
                channel.send_return(call_id, Err(RemoteError::new(UNPORTABLE_RESULT, reason)));
            }
        });
    }

    fn on_return(&self, ret: CallReturn) {
        let Some((_, call)) = self.pending.remove(&ret.call_id) else {
            tracing::debug!(channel = %self.name, call_id = ret.call_id, "return for unknown call");
            return;
        };
        let result = ret.outcome.map_err(|e| {
            let e = e.spliced(call.call_site, &call.method.sig);
            if call.method.declares(&e.kind) {
                RpcError::Remote(e)
            } else {
                RpcError::Undeclared {
                    method: call.method.sig.to_string(),
                    source: e,
                }
            }
        });
        (call.complete)(result);
    }

    // ── Registries ────────────────────────────────────────────────────────────

    fn lookup_instance(&self, instance_id: &str) -> Option<Arc<ServiceObject>> {
        match instance_id.strip_prefix('@') {
            Some(name) => self.singletons.get(name),
            None => self.exports.lookup(instance_id),
        }
    }

    fn import(self: &Arc<Self>, handle: RemoteHandle) -> Arc<RemoteProxy> {
        self.imports
            .entry(handle.instance_id.clone())
            .or_insert_with(|| Arc::new(RemoteProxy::new(handle, Arc::downgrade(self))))
            .value()
            .clone()
    }

    /// Inbound handle to value: our own object if it names one, else a proxy.
    pub(crate) fn resolve(self: &Arc<Self>, handle: RemoteHandle) -> Value {
        if let Some(local) = self.lookup_instance(&handle.instance_id) {
            return Value::Live(local);
        }
        Value::Live(self.import(handle))
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    fn close(&self, reason: &str) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        tracing::info!(channel = %self.name, pending = ids.len(), reason, "rpc channel closing");
        for id in ids {
            self.finish_call(id, Err(RpcError::Closed));
        }
        self.exports.clear();
        self.imports.clear();
        self.objects.close();
        self.supervisor.terminate(&self.name, reason);
    }
}

impl Component for ChannelInner {
    fn name(&self) -> String {
        format!("{}/rpc", self.name)
    }

    fn shutdown(&self) {
        self.close("supervisor shutdown");
    }
}

/// Routes inbound messages into the channel.
struct Dispatcher {
    channel: std::sync::Weak<ChannelInner>,
}

impl ObjectReceiver<RpcMessage> for Dispatcher {
    fn receive(&self, message: RpcMessage) -> Result<(), String> {
        let channel = self.channel.upgrade().ok_or("rpc channel dropped")?;
        match message {
            RpcMessage::Call(request) => channel.on_call(request),
            RpcMessage::Return(ret) => channel.on_return(ret),
            RpcMessage::Unreadable { call_id, reason } => {
                tracing::warn!(channel = %channel.name, call_id, %reason, "undecodable return");
                channel.finish_call(call_id, Err(RpcError::Transport(PipeError::Marshal(reason))));
            }
        }
        Ok(())
    }

    fn closed(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.close("object pipe closed");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "handler panicked".to_string()
}
