//! Integration tests for calls and events across brokers of one process.
//!
//! These tests exercise:
//! - Discovery of remote services and request/response correlation
//! - Rejection of pending calls when the target node leaves
//! - Timeouts and pinned calls
//! - Concurrent calls each receiving their own result
//! - Protected actions and handlers abandoned past their timeout
//! - Balanced emit and broadcast across consumer groups

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use common::{node, run_local, settle};
use meshrun::packet::ActionDescriptor;
use meshrun::{CallOptions, Context, InMemoryHub, MeshError, Reply, ServiceSchema};
use serde_json::{json, Value};

fn math() -> ServiceSchema {
    ServiceSchema::new("math").action("add", |ctx: Context| async move {
        let a = ctx.param("a").and_then(Value::as_i64).unwrap_or(0);
        let b = ctx.param("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(Reply::from(json!(a + b)))
    })
}

fn slow() -> ServiceSchema {
    ServiceSchema::new("slow").action("op", |_ctx: Context| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Reply::default())
    })
}

/// Adds after a delay that depends on the operands, so replies come back out
/// of order.
fn jittery_math() -> ServiceSchema {
    ServiceSchema::new("math").action("add", |ctx: Context| async move {
        let a = ctx.param("a").and_then(Value::as_i64).unwrap_or(0);
        let b = ctx.param("b").and_then(Value::as_i64).unwrap_or(0);
        let delay = ((a * 7) % 11 + 1) as u64 * 10;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(Reply::from(json!(a + b)))
    })
}

fn patient() -> ServiceSchema {
    let wait = ActionDescriptor {
        timeout: Some(2_000),
        ..ActionDescriptor::new("wait")
    };
    ServiceSchema::new("patient").action_with(wait, |_ctx: Context| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Reply::default())
    })
}

fn vault() -> ServiceSchema {
    let rotate = ActionDescriptor {
        protected: true,
        ..ActionDescriptor::new("rotate")
    };
    ServiceSchema::new("vault")
        .action("read", |_ctx: Context| async move { Ok(Reply::from(json!("public"))) })
        .action_with(rotate, |_ctx: Context| async move { Ok(Reply::from(json!("rotated"))) })
}

fn whoami(node_id: &'static str) -> ServiceSchema {
    ServiceSchema::new("echo").action("node", move |_ctx: Context| async move {
        Ok(Reply::from(json!(node_id)))
    })
}

fn counting(service: &str, event: &str, counter: Rc<Cell<u32>>) -> ServiceSchema {
    ServiceSchema::new(service).event(event, move |_ctx: Context| {
        counter.set(counter.get() + 1);
        async move { Ok(()) }
    })
}

#[tokio::test(start_paused = true)]
async fn test_remote_call_round_trip() {
    run_local(async {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", vec![math()]).await;
        let b = node(&hub, "b", vec![]).await;
        settle().await;

        let response = b
            .call("math.add", json!({ "a": 2, "b": 3 }), CallOptions::new())
            .await
            .expect("call");
        assert_eq!(response.data, json!(5));
        assert!(b.transit().pending().is_empty());
        assert!(hub.delivered() > 0);

        a.stop().await.expect("stop a");
        b.stop().await.expect("stop b");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_pending_calls_rejected_when_node_disconnects() {
    run_local(async {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", vec![slow()]).await;
        let b = node(&hub, "b", vec![]).await;
        settle().await;

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let b = b.clone();
                tokio::task::spawn_local(async move {
                    b.call("slow.op", Value::Null, CallOptions::new()).await
                })
            })
            .collect();
        settle().await;
        assert_eq!(b.transit().pending().len(), 3);

        a.stop().await.expect("stop a");
        settle().await;

        for call in calls {
            let result = call.await.expect("join");
            assert!(matches!(result, Err(MeshError::NodeUnavailable { ref node_id }) if node_id == "a"));
        }
        assert!(b.transit().pending().is_empty());
        assert!(b.registry().get_endpoint("slow.op", &Context::default(), None).is_err());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_call_times_out() {
    run_local(async {
        let hub = InMemoryHub::new();
        let _a = node(&hub, "a", vec![slow()]).await;
        let b = node(&hub, "b", vec![]).await;
        settle().await;

        let err = b
            .call(
                "slow.op",
                Value::Null,
                CallOptions::new().with_timeout(Duration::from_secs(2)),
            )
            .await
            .expect_err("timeout");
        match err {
            MeshError::RequestTimeout { node_id, elapsed, .. } => {
                assert_eq!(node_id, "a");
                assert!(elapsed >= Duration::from_secs(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(b.transit().pending().is_empty());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_action_timeout_applies_unless_the_call_overrides_it() {
    run_local(async {
        let hub = InMemoryHub::new();
        let _a = node(&hub, "a", vec![patient()]).await;
        let b = node(&hub, "b", vec![]).await;
        settle().await;

        let err = b
            .call("patient.wait", Value::Null, CallOptions::new())
            .await
            .expect_err("action timeout");
        match err {
            MeshError::RequestTimeout { elapsed, .. } => {
                assert!(elapsed >= Duration::from_secs(2));
                assert!(elapsed < Duration::from_secs(60));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = b
            .call(
                "patient.wait",
                Value::Null,
                CallOptions::new().with_timeout(Duration::from_millis(500)),
            )
            .await
            .expect_err("call timeout");
        match err {
            MeshError::RequestTimeout { elapsed, .. } => {
                assert!(elapsed >= Duration::from_millis(500));
                assert!(elapsed < Duration::from_secs(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_handler_is_abandoned_after_timeout() {
    run_local(async {
        let hub = InMemoryHub::new();
        let started = Rc::new(Cell::new(0));
        let finished = Rc::new(Cell::new(false));
        let (seen, done) = (started.clone(), finished.clone());
        let lazy = ServiceSchema::new("lazy").action("op", move |_ctx: Context| {
            seen.set(seen.get() + 1);
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                done.set(true);
                Ok(Reply::default())
            }
        });
        let _a = node(&hub, "a", vec![lazy]).await;
        let b = node(&hub, "b", vec![]).await;
        settle().await;

        let err = b
            .call(
                "lazy.op",
                Value::Null,
                CallOptions::new().with_timeout(Duration::from_secs(1)),
            )
            .await
            .expect_err("timeout");
        assert!(matches!(err, MeshError::RequestTimeout { .. }));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(started.get(), 1);
        assert!(!finished.get(), "handler kept running after the caller gave up");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_protected_action_is_only_callable_locally() {
    run_local(async {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", vec![vault()]).await;
        let b = node(&hub, "b", vec![]).await;
        settle().await;

        let local = a
            .call("vault.rotate", Value::Null, CallOptions::new())
            .await
            .expect("local call");
        assert_eq!(local.data, json!("rotated"));

        let err = b
            .call("vault.rotate", Value::Null, CallOptions::new())
            .await
            .expect_err("not advertised");
        assert!(matches!(err, MeshError::ServiceNotFound { .. }));

        // A request sent to a's node anyway is refused there.
        let endpoint = b
            .registry()
            .get_endpoint("vault.read", &Context::default(), None)
            .expect("public action");
        let err = b
            .transit()
            .request(&endpoint, Context::for_action("vault.rotate", Value::Null), None)
            .await
            .expect_err("refused");
        match err {
            MeshError::ServiceNotFound { action, node_id } => {
                assert_eq!(action, "vault.rotate");
                assert_eq!(node_id.as_deref(), Some("a"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_each_get_their_own_result() {
    run_local(async {
        let hub = InMemoryHub::new();
        let _a = node(&hub, "a", vec![jittery_math()]).await;
        let _c = node(&hub, "c", vec![jittery_math()]).await;
        let b = node(&hub, "b", vec![]).await;
        settle().await;

        let calls: Vec<_> = (1..=12i64)
            .map(|i| {
                let b = b.clone();
                tokio::task::spawn_local(async move {
                    let params = json!({ "a": i, "b": 100 * i });
                    let response = b.call("math.add", params, CallOptions::new()).await;
                    (i, response)
                })
            })
            .collect();
        settle().await;
        assert_eq!(b.transit().pending().len(), 12);

        for call in calls {
            let (i, response) = call.await.expect("join");
            assert_eq!(response.expect("call").data, json!(101 * i));
        }
        assert!(b.transit().pending().is_empty());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_and_pinned_calls() {
    run_local(async {
        let hub = InMemoryHub::new();
        let _a = node(&hub, "a", vec![whoami("a")]).await;
        let _b = node(&hub, "b", vec![whoami("b")]).await;
        let c = node(&hub, "c", vec![]).await;
        settle().await;

        let mut served = Vec::new();
        for _ in 0..4 {
            let response = c
                .call("echo.node", Value::Null, CallOptions::new())
                .await
                .expect("call");
            served.push(response.data);
        }
        assert_eq!(served.iter().filter(|v| **v == json!("a")).count(), 2);
        assert_eq!(served.iter().filter(|v| **v == json!("b")).count(), 2);
        assert_ne!(served[0], served[1]);

        for _ in 0..3 {
            let response = c
                .call("echo.node", Value::Null, CallOptions::new().with_node("b"))
                .await
                .expect("pinned call");
            assert_eq!(response.data, json!("b"));
        }
        let err = c
            .call("echo.node", Value::Null, CallOptions::new().with_node("zz"))
            .await
            .expect_err("unknown node");
        assert!(matches!(err, MeshError::ServiceNotFound { .. }));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_emit_balances_per_group_and_broadcast_reaches_all() {
    run_local(async {
        let hub = InMemoryHub::new();
        let users_a = Rc::new(Cell::new(0));
        let users_b = Rc::new(Cell::new(0));
        let mail = Rc::new(Cell::new(0));
        let _a = node(
            &hub,
            "a",
            vec![
                counting("users", "user.created", users_a.clone()),
                counting("mail", "user.*", mail.clone()),
            ],
        )
        .await;
        let _b = node(&hub, "b", vec![counting("users", "user.created", users_b.clone())]).await;
        let c = node(&hub, "c", vec![]).await;
        settle().await;

        c.emit("user.created", json!({ "id": 1 }), None).await.expect("emit");
        settle().await;
        assert_eq!(users_a.get() + users_b.get(), 1);
        assert_eq!(mail.get(), 1);

        c.emit("user.created", json!({ "id": 2 }), None).await.expect("emit");
        settle().await;
        assert_eq!(users_a.get(), 1);
        assert_eq!(users_b.get(), 1);
        assert_eq!(mail.get(), 2);

        c.emit("user.created", json!({ "id": 3 }), Some(vec!["mail".to_string()]))
            .await
            .expect("emit to group");
        settle().await;
        assert_eq!(users_a.get() + users_b.get(), 2);
        assert_eq!(mail.get(), 3);

        c.broadcast("user.created", json!({ "id": 4 }), None)
            .await
            .expect("broadcast");
        settle().await;
        assert_eq!(users_a.get(), 2);
        assert_eq!(users_b.get(), 2);
        assert_eq!(mail.get(), 4);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_local_only_runs_local_handlers() {
    run_local(async {
        let hub = InMemoryHub::new();
        let local = Rc::new(Cell::new(0));
        let remote = Rc::new(Cell::new(0));
        let a = node(&hub, "a", vec![counting("audit", "order.placed", local.clone())]).await;
        let _b = node(&hub, "b", vec![counting("audit", "order.placed", remote.clone())]).await;
        settle().await;

        assert_eq!(a.broadcast_local("order.placed", Value::Null, None), 1);
        settle().await;
        assert_eq!(local.get(), 1);
        assert_eq!(remote.get(), 0);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_ping_through_broker() {
    run_local(async {
        let hub = InMemoryHub::new();
        let a = node(&hub, "a", vec![]).await;
        let _b = node(&hub, "b", vec![]).await;
        settle().await;

        let pong = a.ping("b", Duration::from_secs(1)).await.expect("pong");
        assert_eq!(pong.node_id, "b");
    })
    .await;
}
