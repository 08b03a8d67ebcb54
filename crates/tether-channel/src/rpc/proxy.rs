//! Client side of remote calls: call futures, proxies and the marshaling
//! stage that turns local objects into handles and handles into proxies.

use std::any::Any;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::object::{downcast_live, LiveObject, MarshalError, Marshaler, RemoteHandle, Value};

use super::error::RpcError;
use super::interface::ServiceObject;
use super::message::Method;
use super::ChannelInner;

/// Resolves with the outcome of one remote call.
#[must_use = "a CallFuture does nothing unless awaited"]
pub struct CallFuture {
    rx: Option<oneshot::Receiver<Result<Value, RpcError>>>,
    early: Option<RpcError>,
}

impl CallFuture {
    pub(crate) fn pending(rx: oneshot::Receiver<Result<Value, RpcError>>) -> Self {
        Self {
            rx: Some(rx),
            early: None,
        }
    }

    pub(crate) fn failed(error: RpcError) -> Self {
        Self {
            rx: None,
            early: Some(error),
        }
    }
}

impl Future for CallFuture {
    type Output = Result<Value, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = self.early.take() {
            return Poll::Ready(Err(err));
        }
        match self.rx.as_mut() {
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(RpcError::Closed))),
            None => Poll::Ready(Err(RpcError::Closed)),
        }
    }
}

// ── Proxy ─────────────────────────────────────────────────────────────────────

/// Local stand-in for an object exported by the peer.
pub struct RemoteProxy {
    handle: RemoteHandle,
    channel: Weak<ChannelInner>,
}

impl RemoteProxy {
    pub(crate) fn new(handle: RemoteHandle, channel: Weak<ChannelInner>) -> Self {
        Self { handle, channel }
    }

    pub fn handle(&self) -> &RemoteHandle {
        &self.handle
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.handle.implements(interface)
    }

    /// Start a call and return its future.
    #[track_caller]
    pub fn invoke(&self, method: &Method, args: Vec<Value>) -> CallFuture {
        let call_site = Location::caller();
        if let Err(e) = self.check(method) {
            return CallFuture::failed(e);
        }
        let Some(channel) = self.channel.upgrade() else {
            return CallFuture::failed(RpcError::Closed);
        };
        let (tx, rx) = oneshot::channel();
        channel.start_call(
            &self.handle.instance_id,
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
    pub fn call(&self, method: &Method, args: Vec<Value>) -> Result<Value, RpcError> {
        let call_site = Location::caller();
        self.check(method)?;
        let channel = self.channel.upgrade().ok_or(RpcError::Closed)?;
        ChannelInner::call_blocking(&channel, &self.handle.instance_id, method, args, call_site)
    }

    fn check(&self, method: &Method) -> Result<(), RpcError> {
        if self.handle.implements(&method.sig.interface) {
            Ok(())
        } else {
            Err(RpcError::Definition(format!(
                "{} does not implement {}",
                self.handle.instance_id, method.sig.interface
            )))
        }
    }
}

impl LiveObject for RemoteProxy {
    fn type_name(&self) -> &str {
        "RemoteProxy"
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy").field("handle", &self.handle).finish()
    }
}

// ── Marshaling stage ──────────────────────────────────────────────────────────

/// Last stage of a channel's marshaling chain.
///
/// Outbound: a local service object becomes a handle (its singleton name
/// if registered as one, an export otherwise) and a proxy becomes the
/// handle it wraps. Inbound: a handle becomes the local object it names, or
/// a proxy.
pub(crate) struct RpcMarshaler {
    pub channel: Weak<ChannelInner>,
}

impl RpcMarshaler {
    fn channel(&self) -> Result<Arc<ChannelInner>, MarshalError> {
        self.channel
            .upgrade()
            .ok_or_else(|| MarshalError::Stage("rpc channel dropped".into()))
    }
}

impl Marshaler for RpcMarshaler {
    fn write_replace(&self, value: Value) -> Result<Value, MarshalError> {
        let Value::Live(object) = &value else {
            return Ok(value);
        };
        if let Some(service) = downcast_live::<ServiceObject>(object) {
            let channel = self.channel()?;
            let interfaces = service.interfaces().to_vec();
            let handle = match channel.singletons.name_of(&service) {
                Some(name) => RemoteHandle::singleton(&name, interfaces),
                None => channel.exports.export(interfaces, &service),
            };
            return Ok(Value::Remote(handle));
        }
        if let Some(proxy) = downcast_live::<RemoteProxy>(object) {
            return Ok(Value::Remote(proxy.handle.clone()));
        }
        Ok(value)
    }

    fn read_resolve(&self, value: Value) -> Result<Value, MarshalError> {
        match value {
            Value::Remote(handle) => Ok(self.channel()?.resolve(handle)),
            other => Ok(other),
        }
    }
}
