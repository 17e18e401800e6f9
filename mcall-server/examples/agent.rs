//! A small management-agent style server exposing a few methods over a
//! Unix socket, plus a client that calls them.
//!
//! Run with: `cargo run --example agent [socket-path]`

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use mcall::{RemoteObjectCreator, Value};
use mcall_server::{
    async_trait, MethodCallServerFactory, MethodCallTarget, MethodResult, PendingValue,
};

struct Agent {
    started: Instant,
}

#[async_trait]
impl MethodCallTarget for Agent {
    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        _kwargs: BTreeMap<String, Value>,
    ) -> anyhow::Result<MethodResult> {
        match method {
            "ping" => Ok(Value::from("pong").into()),
            "uptime" => Ok(Value::Int(self.started.elapsed().as_secs() as i64).into()),
            "add" => {
                let lhs = args.first().and_then(Value::as_i64);
                let rhs = args.get(1).and_then(Value::as_i64);
                match (lhs, rhs) {
                    (Some(lhs), Some(rhs)) => Ok(Value::Int(lhs + rhs).into()),
                    _ => anyhow::bail!("expected two integer arguments"),
                }
            }
            "slow_echo" => {
                let payload = args.into_iter().next().unwrap_or(Value::Null);
                let (pending, resolver) = PendingValue::new();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    resolver.resolve(payload);
                });
                Ok(MethodResult::Pending(pending))
            }
            other => anyhow::bail!("no implementation for '{other}'"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/mcall-agent.sock".to_owned());

    let factory = MethodCallServerFactory::new(
        Agent {
            started: Instant::now(),
        },
        &["ping", "uptime", "add", "slow_echo"],
    );
    let server = factory.listen(&path).await?;

    let mut creator = RemoteObjectCreator::new(&path).retry_on_reconnect(true);
    let agent = creator.connect().await?;

    let pong = agent.call("ping", Vec::new(), BTreeMap::new()).await?;
    println!("ping -> {pong:?}");

    let sum = agent
        .call("add", vec![Value::Int(19), Value::Int(23)], BTreeMap::new())
        .await?;
    println!("add(19, 23) -> {sum:?}");

    let echoed = agent
        .call("slow_echo", vec![Value::from("later")], BTreeMap::new())
        .await?;
    println!("slow_echo -> {echoed:?}");

    creator.disconnect();
    server.stop();

    Ok(())
}
