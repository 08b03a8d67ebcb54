use crate::*;

use tether_channel::facade::{RemoteNode, TaskRegistry, TASK_ERROR};
use tether_channel::object::Value;
use tether_channel::rpc::{Interface, RemoteError, RpcError, ServiceObject};

/// Controller-side node and the agent channel serving it.
fn node(log: Arc<Mutex<Vec<String>>>) -> (RemoteNode, RpcChannel) {
    let tasks = TaskRegistry::new()
        .action("log", move |args| {
            let line = args.first().and_then(Value::as_str).unwrap_or_default();
            log.lock().unwrap().push(line.to_string());
            Ok(())
        })
        .computation("square", |args| {
            let x = args.first().and_then(Value::as_i64).unwrap_or_default();
            Ok(Value::Int(x * x))
        })
        .computation("explode", |_| Err(RemoteError::new("Boom", "task blew up")));

    let singletons = Singletons::new();
    tasks.install(&singletons).unwrap();
    let (controller, agent) = channel_pair(singletons);
    (RemoteNode::new(controller), agent)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exec_and_calc_block_until_done() {
    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let (node, _agent) = node(log.clone());
    let node = Arc::new(node);

    let n = node.clone();
    let (exec, calc) = within(tokio::task::spawn_blocking(move || {
        (n.exec("log", vec!["hello".into()]), n.calc("square", vec![7.into()]))
    }))
    .await
    .unwrap();

    exec.unwrap();
    assert_eq!(calc, Ok(Value::Int(49)));
    assert_eq!(*log.lock().unwrap(), vec!["hello".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_submit_returns_futures() {
    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let (node, _agent) = node(log.clone());

    let squares: Vec<_> = (1..=4).map(|i| node.submit("square", vec![i.into()])).collect();
    let action = node.submit_action("log", vec!["async".into()]);

    let results = within(futures::future::join_all(squares)).await;
    let results: Vec<Value> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(results, vec![Value::Int(1), Value::Int(4), Value::Int(9), Value::Int(16)]);
    assert_eq!(within(action).await, Ok(Value::Null));
    assert_eq!(*log.lock().unwrap(), vec!["async".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_task_is_declared_error() {
    let (node, _agent) = node(Arc::default());
    let err = within(node.submit("cube", vec![2.into()])).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.kind, TASK_ERROR);
            assert!(remote.message.contains("cube"));
        }
        other => panic!("expected declared TaskError, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_task_failure_is_undeclared() {
    let (node, _agent) = node(Arc::default());
    let err = within(node.submit("explode", vec![])).await.unwrap_err();
    assert!(matches!(err, RpcError::Undeclared { .. }), "{err:?}");
    assert_eq!(err.remote().unwrap().kind, "Boom");
    assert_eq!(err.remote().unwrap().message, "task blew up");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_calls_back_into_exported_object() {
    let (node, agent) = node(Arc::default());
    let greeter_iface = Interface::new("demo.Greeter").method("greet", &["str"]);
    let greeter = ServiceObject::builder("greeter")
        .handle(&greeter_iface, "greet", |args| {
            Ok(Value::from(format!("hello, {}", args.str(0)?)))
        })
        .build()
        .unwrap();

    let handle = node.export(&["demo.Greeter"], &greeter).unwrap();
    assert_eq!(node.export(&["demo.Greeter"], &greeter).unwrap(), handle);

    let proxy = agent.proxy(handle);
    let greeting = within(proxy.invoke(greeter_iface.get("greet").unwrap(), vec!["agent".into()]))
        .await
        .unwrap();
    assert_eq!(greeting, Value::from("hello, agent"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_fails_later_calls() {
    let (node, _agent) = node(Arc::default());
    within(node.submit("square", vec![3.into()])).await.unwrap();

    node.shutdown();
    assert!(node.channel().is_terminated());
    assert_eq!(
        within(node.submit("square", vec![3.into()])).await,
        Err(RpcError::Closed)
    );
    within(node.channel().terminated()).await;
}
