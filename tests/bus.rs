use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time;

use ubus::broker::Broker;
use ubus::ipc::{Client, Config, MethodHandler, MethodMap};
use ubus::ErrorKind;

async fn start_bus() -> (Broker, TempDir, String) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ubus.sock").to_str().unwrap().to_owned();
    let mut broker = Broker::new();
    broker
        .spawn_unix_server(&path, 8192, Duration::from_secs(5))
        .await
        .unwrap();
    (broker, dir, path)
}

async fn client(path: &str) -> Client {
    Client::connect(&Config::new(path)).await.unwrap()
}

fn methods_returning(value: Value) -> MethodMap {
    let mut methods: MethodMap = HashMap::new();
    methods.insert(
        "get_v".to_owned(),
        Arc::new(move |_params: Value| Some(value.clone())),
    );
    methods
}

struct SlowHandler;

#[async_trait::async_trait]
impl MethodHandler for SlowHandler {
    async fn handle(&self, _params: Value) -> Option<Value> {
        time::sleep(Duration::from_secs(30)).await;
        Some(json!({}))
    }
}

struct ProxyHandler {
    client: Client,
}

#[async_trait::async_trait]
impl MethodHandler for ProxyHandler {
    async fn handle(&self, _params: Value) -> Option<Value> {
        self.client.call("inner", "get", json!({})).await.ok()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn call_between_two_clients() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let b = client(&path).await;
    a.add("tobj", methods_returning(json!({"vv": "A"})))
        .await
        .unwrap();
    b.add("t1obj", methods_returning(json!({"vv": "B"})))
        .await
        .unwrap();
    assert_eq!(
        b.call("tobj", "get_v", json!({})).await.unwrap(),
        json!({"vv": "A"})
    );
    assert_eq!(
        a.call("t1obj", "get_v", json!({})).await.unwrap(),
        json!({"vv": "B"})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn event_fanout_delivers_exactly_once() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let b = client(&path).await;
    let publisher = client(&path).await;
    let seen_a: Arc<Mutex<Vec<Value>>> = <_>::default();
    let seen_b: Arc<Mutex<Vec<Value>>> = <_>::default();
    let seen_self: Arc<Mutex<Vec<Value>>> = <_>::default();
    for (c, seen) in [(&a, &seen_a), (&b, &seen_b), (&publisher, &seen_self)] {
        let seen = seen.clone();
        c.listen(
            "test1",
            Arc::new(move |data: Value| seen.lock().unwrap().push(data)),
        )
        .await
        .unwrap();
    }
    publisher.send("test1", json!({"x": 1})).await.unwrap();
    for _ in 0..100 {
        if !seen_a.lock().unwrap().is_empty()
            && !seen_b.lock().unwrap().is_empty()
            && !seen_self.lock().unwrap().is_empty()
        {
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    // settle, then check nobody got a duplicate
    time::sleep(Duration::from_millis(200)).await;
    for seen in [&seen_a, &seen_b, &seen_self] {
        assert_eq!(*seen.lock().unwrap(), vec![json!({"x": 1})]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn multiple_callbacks_per_event() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let b = client(&path).await;
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let hits = hits.clone();
        a.listen(
            "tick",
            Arc::new(move |_data: Value| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    }
    b.send("tick", json!({})).await.unwrap();
    for _ in 0..100 {
        if hits.load(Ordering::SeqCst) == 2 {
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_registration_refused() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let b = client(&path).await;
    a.add("dup", methods_returning(json!({}))).await.unwrap();
    let err = b
        .add("dup", methods_returning(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_registration_has_one_winner() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let b = client(&path).await;
    let (ra, rb) = tokio::join!(
        a.add("race", methods_returning(json!({}))),
        b.add("race", methods_returning(json!({})))
    );
    assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_object_and_method_fail_fast() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let b = client(&path).await;
    a.add("o", methods_returning(json!({}))).await.unwrap();
    let start = Instant::now();
    let err = b.call("o", "other", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRegistered);
    let err = b.call("nope", "get_v", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRegistered);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn call_to_a_stuck_owner_times_out() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let mut methods: MethodMap = HashMap::new();
    methods.insert("slow".to_owned(), Arc::new(SlowHandler));
    a.add("o", methods).await.unwrap();
    let b = Client::connect(&Config::new(&path).timeout(Duration::from_secs(1)))
        .await
        .unwrap();
    let start = Instant::now();
    let err = b.call("o", "slow", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn owner_disconnect_mid_call_leaves_no_state() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let mut methods: MethodMap = HashMap::new();
    methods.insert("m".to_owned(), Arc::new(SlowHandler));
    a.add("o", methods).await.unwrap();
    let b = Client::connect(&Config::new(&path).timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    let b2 = b.clone();
    let pending = tokio::spawn(async move { b2.call("o", "m", json!({})).await });
    time::sleep(Duration::from_millis(300)).await;
    a.disconnect();
    assert!(pending.await.unwrap().is_err());
    // the broker must have evicted everything the owner held
    let c = client(&path).await;
    let mut registered = false;
    for _ in 0..100 {
        let mut methods: MethodMap = HashMap::new();
        methods.insert("m".to_owned(), Arc::new(SlowHandler));
        if c.add("o", methods).await.is_ok() {
            registered = true;
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    assert!(registered);
}

#[tokio::test(flavor = "multi_thread")]
async fn handlers_may_call_back_into_the_bus() {
    let (_broker, _dir, path) = start_bus().await;
    let inner = client(&path).await;
    let mut methods: MethodMap = HashMap::new();
    methods.insert(
        "get".to_owned(),
        Arc::new(|_params: Value| Some(json!({"x": 1}))) as Arc<dyn MethodHandler>,
    );
    inner.add("inner", methods).await.unwrap();
    let outer = client(&path).await;
    let mut methods: MethodMap = HashMap::new();
    methods.insert(
        "get".to_owned(),
        Arc::new(ProxyHandler {
            client: outer.clone(),
        }) as Arc<dyn MethodHandler>,
    );
    outer.add("outer", methods).await.unwrap();
    let c = client(&path).await;
    assert_eq!(
        c.call("outer", "get", json!({})).await.unwrap(),
        json!({"x": 1})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_callback_fires_exactly_once() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    let fired = Arc::new(AtomicUsize::new(0));
    let cb_fired = fired.clone();
    a.on_disconnect(move || {
        cb_fired.fetch_add(1, Ordering::SeqCst);
    });
    a.disconnect();
    a.disconnect();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!a.is_connected());
    let err = a.call("o", "m", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_arguments_never_touch_the_wire() {
    let (_broker, _dir, path) = start_bus().await;
    let a = client(&path).await;
    assert_eq!(
        a.call("", "m", json!({})).await.unwrap_err().kind(),
        ErrorKind::Data
    );
    assert_eq!(
        a.call("o", "m", json!([1, 2])).await.unwrap_err().kind(),
        ErrorKind::Data
    );
    assert_eq!(
        a.send("e", json!("nope")).await.unwrap_err().kind(),
        ErrorKind::Data
    );
    assert_eq!(
        a.add("", methods_returning(json!({})))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::Data
    );
}
