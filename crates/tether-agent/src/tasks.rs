//! Built-in tasks every agent serves.

use std::time::Duration;

use tether_channel::facade::{TaskRegistry, TASK_ERROR};
use tether_channel::rpc::RemoteError;
use tether_channel::Value;

pub fn builtin() -> TaskRegistry {
    TaskRegistry::new()
        .computation("ping", |_| Ok(Value::from("pong")))
        .computation("echo", |args| Ok(Value::List(args.to_vec())))
        .computation("pid", |_| Ok(Value::from(std::process::id())))
        .computation("env", |args| {
            let key = string_arg(args, 0)?;
            Ok(std::env::var(key).ok().into())
        })
        .action("sleep", |args| {
            let millis = args
                .first()
                .and_then(Value::as_i64)
                .filter(|ms| *ms >= 0)
                .ok_or_else(|| RemoteError::new(TASK_ERROR, "sleep takes a non-negative millisecond count"))?;
            std::thread::sleep(Duration::from_millis(millis as u64));
            Ok(())
        })
}

fn string_arg(args: &[Value], index: usize) -> Result<&str, RemoteError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::new(TASK_ERROR, format!("argument {index} must be a string")))
}
