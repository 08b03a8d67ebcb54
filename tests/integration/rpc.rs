use crate::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tether_channel::object::{Marshaler, MarshalError, Value};
use tether_channel::rpc::{
    Interface, Method, RemoteError, RemoteProxy, RpcError, ServiceObject,
};

fn calc_iface() -> Interface {
    Interface::new("demo.Calc")
        .method("add", &["int", "int"])
        .method("slow_echo", &["int"])
        .method("make_counter", &[])
}

fn counter_iface() -> Interface {
    Interface::new("demo.Counter")
        .method("incr", &[])
        .method("same", &["demo.Counter"])
}

fn callback_iface() -> Interface {
    Interface::new("demo.Callback").method("notify", &["str"])
}

fn visitor_iface() -> Interface {
    Interface::new("demo.Visitor").method("visit", &["demo.Callback", "str"])
}

fn hold_iface() -> Interface {
    Interface::new("demo.Hold").method("wait", &[])
}

/// `wait` blocks until `release` is set.
fn hold(release: Arc<AtomicBool>) -> Arc<ServiceObject> {
    ServiceObject::builder("hold")
        .handle(&hold_iface(), "wait", move |_| {
            while !release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(Value::Null)
        })
        .build()
        .unwrap()
}

fn method(iface: &Interface, name: &str) -> Method {
    iface.get(name).unwrap().clone()
}

fn counter() -> Arc<ServiceObject> {
    let iface = counter_iface();
    let count = Arc::new(AtomicUsize::new(0));
    let me: Arc<Mutex<Option<std::sync::Weak<ServiceObject>>>> = Arc::default();
    let me_check = me.clone();
    let object = ServiceObject::builder("counter")
        .handle(&iface, "incr", move |_| {
            Ok(Value::Int(count.fetch_add(1, Ordering::SeqCst) as i64 + 1))
        })
        .handle(&iface, "same", move |args| {
            let other = args.live::<ServiceObject>(0)?;
            let mine = me_check.lock().unwrap().as_ref().and_then(|w| w.upgrade());
            Ok(Value::Bool(mine.is_some_and(|m| Arc::ptr_eq(&m, &other))))
        })
        .build()
        .unwrap();
    *me.lock().unwrap() = Some(Arc::downgrade(&object));
    object
}

/// `add`, `slow_echo` (returns in reverse order of `turn`) and
/// `make_counter` (returns a fresh object reference).
fn calc(turn: Arc<AtomicUsize>, n: usize) -> Arc<ServiceObject> {
    let iface = calc_iface();
    ServiceObject::builder("calc")
        .handle(&iface, "add", |args| Ok(Value::Int(args.i64(0)? + args.i64(1)?)))
        .handle(&iface, "slow_echo", move |args| {
            let i = args.i64(0)? as usize;
            while turn.load(Ordering::SeqCst) != n - 1 - i {
                std::thread::sleep(Duration::from_millis(1));
            }
            turn.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(i as i64 * 10))
        })
        .handle(&iface, "make_counter", |_| Ok(Value::from(counter())))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_twice_uses_independent_calls() {
    let singletons = Singletons::new();
    singletons.register("calc", calc(Arc::default(), 0));
    let (a, _b) = channel_pair(singletons);
    let proxy = a.singleton_proxy("calc", &["demo.Calc"]);
    let add = method(&calc_iface(), "add");

    let first = proxy.invoke(&add, vec![2.into(), 3.into()]);
    let second = proxy.invoke(&add, vec![2.into(), 3.into()]);
    assert_eq!(within(first).await, Ok(Value::Int(5)));
    assert_eq!(within(second).await, Ok(Value::Int(5)));
    assert_eq!(a.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls_resolved_in_reverse_order() {
    const N: usize = 8;
    let singletons = Singletons::new();
    singletons.register("calc", calc(Arc::default(), N));
    let (a, _b) = channel_pair(singletons);
    let proxy = a.singleton_proxy("calc", &["demo.Calc"]);
    let slow = method(&calc_iface(), "slow_echo");

    let calls: Vec<_> = (0..N)
        .map(|i| proxy.invoke(&slow, vec![Value::Int(i as i64)]))
        .collect();
    let results = within(futures::future::join_all(calls)).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result, Ok(Value::Int(i as i64 * 10)));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_returned_object_becomes_proxy() {
    let singletons = Singletons::new();
    singletons.register("calc", calc(Arc::default(), 0));
    let (a, b) = channel_pair(singletons);
    let proxy = a.singleton_proxy("calc", &["demo.Calc"]);

    let made = within(proxy.invoke(&method(&calc_iface(), "make_counter"), vec![]))
        .await
        .unwrap();
    let remote = made.live::<RemoteProxy>().expect("a proxy");
    assert!(remote.implements("demo.Counter"));
    assert_eq!(b.exported(), 1);

    let incr = method(&counter_iface(), "incr");
    assert_eq!(within(remote.invoke(&incr, vec![])).await, Ok(Value::Int(1)));
    assert_eq!(within(remote.invoke(&incr, vec![])).await, Ok(Value::Int(2)));

    // Handing the proxy back resolves to the original object on its owner.
    let same = method(&counter_iface(), "same");
    let answer = within(remote.invoke(&same, vec![Value::from(remote.clone())]))
        .await
        .unwrap();
    assert_eq!(answer, Value::Bool(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_object_argument_allows_callback() {
    let notes: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = notes.clone();
    let callback = ServiceObject::builder("callback")
        .handle(&callback_iface(), "notify", move |args| {
            sink.lock().unwrap().push(args.str(0)?.to_string());
            Ok(Value::Null)
        })
        .build()
        .unwrap();

    let notify = method(&callback_iface(), "notify");
    let visitor = ServiceObject::builder("visitor")
        .handle(&visitor_iface(), "visit", move |args| {
            let cb = args.live::<RemoteProxy>(0)?;
            let text = args.str(1)?.to_string();
            // Handlers run on the blocking pool, so a nested blocking call is fine.
            cb.call(&notify, vec![Value::from(format!("visited {text}"))])
                .map_err(|e| RemoteError::new("CallbackFailed", e.to_string()))
        })
        .build()
        .unwrap();

    let (a, b) = channel_pair(Singletons::new());
    let handle = b.export_object(&["demo.Visitor"], &visitor).unwrap();
    let remote = a.proxy(handle);
    let result = within(remote.invoke(
        &method(&visitor_iface(), "visit"),
        vec![Value::from(callback), "home".into()],
    ))
    .await;

    assert_eq!(result, Ok(Value::Null));
    assert_eq!(*notes.lock().unwrap(), vec!["visited home".to_string()]);
    assert_eq!(a.exported(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_argument_type_is_reported() {
    let singletons = Singletons::new();
    singletons.register("calc", calc(Arc::default(), 0));
    let (a, _b) = channel_pair(singletons);
    let proxy = a.singleton_proxy("calc", &["demo.Calc"]);

    let err = within(proxy.invoke(&method(&calc_iface(), "add"), vec!["two".into(), 3.into()]))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Undeclared { .. }));
    assert!(err.remote().unwrap().message.contains("argument 0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_resolves_every_pending_call() {
    const K: usize = 5;
    let release = Arc::new(AtomicBool::new(false));
    let singletons = Singletons::new();
    singletons.register("hold", hold(release.clone()));
    let (a, _b) = channel_pair(singletons);
    let proxy = a.singleton_proxy("hold", &["demo.Hold"]);
    let wait = method(&hold_iface(), "wait");

    let calls: Vec<_> = (0..K).map(|_| proxy.invoke(&wait, vec![])).collect();
    wait_until(|| a.pending_calls() == K).await;

    a.close();
    let results = within(futures::future::join_all(calls)).await;
    assert!(results.iter().all(|r| r == &Err(RpcError::Closed)));
    within(a.terminated()).await;
    release.store(true, Ordering::SeqCst);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_call_wakes_on_close() {
    let release = Arc::new(AtomicBool::new(false));
    let singletons = Singletons::new();
    singletons.register("hold", hold(release.clone()));
    let (a, _b) = channel_pair(singletons);
    let proxy = a.singleton_proxy("hold", &["demo.Hold"]);
    let wait = method(&hold_iface(), "wait");

    let blocked = tokio::task::spawn_blocking(move || proxy.call(&wait, vec![]));
    wait_until(|| a.pending_calls() == 1).await;
    a.close();
    assert_eq!(within(blocked).await.unwrap(), Err(RpcError::Closed));
    release.store(true, Ordering::SeqCst);
}

/// Rejects string arguments on the way out, before the channel's own stage.
struct NoStrings;

impl Marshaler for NoStrings {
    fn write_replace(&self, value: Value) -> Result<Value, MarshalError> {
        match value {
            Value::Str(_) => Err(MarshalError::NotPortable("str".into())),
            other => Ok(other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_custom_marshaler_failure_fails_the_call() {
    let a = RpcChannel::builder("controller")
        .marshaler(Arc::new(NoStrings))
        .build()
        .unwrap();
    let handle = tether_channel::object::RemoteHandle::new("x", vec!["demo.Callback".into()]);
    let err = within(a.proxy(handle).invoke(&method(&callback_iface(), "notify"), vec!["hi".into()]))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)), "{err:?}");
    assert_eq!(a.pending_calls(), 0);
}

fn measure_iface() -> Interface {
    Interface::new("demo.Measure")
        .method("ratio", &["float", "float"])
        .method("label", &["str"])
}

/// `ratio` divides without guarding; `label` echoes its argument.
fn measure() -> Arc<ServiceObject> {
    let iface = measure_iface();
    ServiceObject::builder("measure")
        .handle(&iface, "ratio", |args| {
            Ok(Value::Float(args.f64(0)? / args.f64(1)?))
        })
        .handle(&iface, "label", |args| Ok(Value::from(args.str(0)?.to_string())))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_finite_floats_cross_the_channel() {
    let singletons = Singletons::new();
    singletons.register("measure", measure());
    let (a, _b) = channel_pair(singletons);
    let proxy = a.singleton_proxy("measure", &["demo.Measure"]);
    let ratio = method(&measure_iface(), "ratio");

    let nan = within(proxy.invoke(&ratio, vec![Value::Float(0.0), Value::Float(0.0)]))
        .await
        .unwrap();
    assert!(nan.as_f64().is_some_and(f64::is_nan), "{nan:?}");

    let inf = within(proxy.invoke(&ratio, vec![Value::Float(f64::NEG_INFINITY), Value::Float(2.0)]))
        .await
        .unwrap();
    assert_eq!(inf, Value::Float(f64::NEG_INFINITY));
    assert_eq!(a.pending_calls(), 0);
}

/// Refuses string values on the way in, after the channel's own stage.
struct NoStringsInbound;

impl Marshaler for NoStringsInbound {
    fn read_resolve(&self, value: Value) -> Result<Value, MarshalError> {
        match value {
            Value::Str(_) => Err(MarshalError::NotPortable("str".into())),
            other => Ok(other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undecodable_result_fails_the_call() {
    let a = RpcChannel::builder("controller")
        .marshaler(Arc::new(NoStringsInbound))
        .build()
        .unwrap();
    let singletons = Singletons::new();
    singletons.register("measure", measure());
    let b = RpcChannel::builder("agent")
        .singletons(singletons)
        .build()
        .unwrap();
    let (x, y) = MemoryDuplex::pair();
    a.attach_stream(x).unwrap();
    b.attach_stream(y).unwrap();

    let proxy = a.singleton_proxy("measure", &["demo.Measure"]);
    let label = method(&measure_iface(), "label");
    let err = within(proxy.invoke(&label, vec!["kg".into()]))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)), "{err:?}");
    assert_eq!(a.pending_calls(), 0);

    let blocking = proxy.clone();
    let parked = within(tokio::task::spawn_blocking(move || {
        blocking.call(&label, vec!["kg".into()])
    }))
    .await
    .unwrap();
    assert!(matches!(parked, Err(RpcError::Transport(_))), "{parked:?}");

    // The channel stays usable for results it can read.
    let ratio = method(&measure_iface(), "ratio");
    let half = within(proxy.invoke(&ratio, vec![Value::Float(1.0), Value::Float(2.0)]))
        .await
        .unwrap();
    assert_eq!(half, Value::Float(0.5));
    assert!(!a.is_terminated());
}
