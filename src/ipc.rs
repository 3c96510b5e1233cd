//! Client runtime: one long-lived broker connection, a reader task that
//! dispatches replies, forwarded invocations and events, and a writer task
//! that serializes all outbound frames.
//!
//! Method and event handlers always run on spawned tasks, never inline on
//! the reader, so a handler is free to call back into the bus through a
//! cloned [`Client`] without deadlocking.

use async_trait::async_trait;
use log::{error, trace, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::time;
use uuid::Uuid;

use crate::codec::{self, MsgType};
use crate::{Error, DEFAULT_BUF_SIZE, DEFAULT_QUEUE_SIZE, DEFAULT_SOCK_PATH, DEFAULT_TIMEOUT};

/// A callable within a locally registered object. Takes the decoded call
/// payload, returns a payload or nothing (sent back as JSON null).
///
/// Implemented for any `Fn(Value) -> Option<Value>` closure; implement the
/// trait directly when the method needs to await.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Option<Value>;
}

#[async_trait]
impl<F> MethodHandler for F
where
    F: Fn(Value) -> Option<Value> + Send + Sync,
{
    async fn handle(&self, params: Value) -> Option<Value> {
        self(params)
    }
}

/// A subscriber callback. Implemented for any `Fn(Value)` closure.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, data: Value);
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(Value) + Send + Sync,
{
    async fn handle(&self, data: Value) {
        self(data)
    }
}

pub type MethodMap = HashMap<String, Arc<dyn MethodHandler>>;

type DisconnectHandler = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
pub struct Config {
    path: String,
    timeout: Duration,
    queue_size: usize,
    buf_size: usize,
}

impl Config {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            queue_size: DEFAULT_QUEUE_SIZE,
            buf_size: DEFAULT_BUF_SIZE,
        }
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }
    pub fn buf_size(mut self, buf_size: usize) -> Self {
        self.buf_size = buf_size;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_SOCK_PATH)
    }
}

struct ClientInner {
    tx: async_channel::Sender<Vec<u8>>,
    requests: Mutex<HashMap<String, oneshot::Sender<Option<Value>>>>,
    objects: RwLock<HashMap<String, MethodMap>>,
    events: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    disconnect_cb: Mutex<Option<DisconnectHandler>>,
    connected: AtomicBool,
    stop: triggered::Trigger,
    timeout: Duration,
}

/// Handle to one bus connection. Cloning is cheap and all clones share the
/// connection, so a handler may keep one to issue calls of its own.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects to the broker and starts the reader and writer tasks. On
    /// error nothing is left running.
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let stream = UnixStream::connect(&config.path).await?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(config.buf_size, reader);
        let mut writer = BufWriter::with_capacity(config.buf_size, writer);
        let (tx, rx) = async_channel::bounded::<Vec<u8>>(config.queue_size);
        let (stop, stopped) = triggered::trigger();
        let inner = Arc::new(ClientInner {
            tx,
            requests: <_>::default(),
            objects: <_>::default(),
            events: <_>::default(),
            disconnect_cb: <_>::default(),
            connected: AtomicBool::new(true),
            stop,
            timeout: config.timeout,
        });
        let w_inner = inner.clone();
        let w_stopped = stopped.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = w_stopped.clone() => break,
                    frame = rx.recv() => match frame {
                        Ok(buf) => {
                            if writer.write_all(&buf).await.is_err()
                                || writer.flush().await.is_err()
                            {
                                w_inner.shutdown();
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        });
        let r_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.clone() => break,
                    frame = codec::read_raw_frame(&mut reader) => match frame {
                        Ok(Some(raw)) => r_inner.dispatch(raw),
                        Ok(None) => {
                            warn!("broker disconnected");
                            r_inner.shutdown();
                            break;
                        }
                        Err(e) => {
                            error!("broker connection error: {}", e);
                            r_inner.shutdown();
                            break;
                        }
                    }
                }
            }
        });
        Ok(Self { inner })
    }

    /// Registers `object` on the bus and installs its method handlers.
    /// Fails with [`crate::ErrorKind::Busy`] when the name is taken.
    ///
    /// # Panics
    ///
    /// Will panic if the object map mutex is poisoned
    pub async fn add(&self, object: &str, methods: MethodMap) -> Result<(), Error> {
        if object.is_empty() || methods.is_empty() || methods.keys().any(|f| f.is_empty()) {
            return Err(Error::data("object and method names must not be empty"));
        }
        if self.inner.objects.read().unwrap().contains_key(object) {
            return Err(Error::busy("object is already registered"));
        }
        let id = Uuid::new_v4().to_string();
        let req = codec::Register {
            id: id.clone(),
            object: object.to_owned(),
            funcs: methods.keys().cloned().collect(),
        };
        match self.request(MsgType::Register, id, &req).await? {
            Some(_) => {
                self.inner
                    .objects
                    .write()
                    .unwrap()
                    .insert(object.to_owned(), methods);
                Ok(())
            }
            None => Err(Error::busy("object is already registered")),
        }
    }

    /// Calls `object.func` on whichever peer owns the object. Fails with
    /// [`crate::ErrorKind::NotRegistered`] when there is no such object or
    /// method, or with [`crate::ErrorKind::Timeout`] when the owner does
    /// not reply in time.
    pub async fn call(&self, object: &str, func: &str, params: Value) -> Result<Value, Error> {
        if object.is_empty() || func.is_empty() {
            return Err(Error::data("object and method names must not be empty"));
        }
        if !params.is_object() {
            return Err(Error::data("call params must be a JSON object"));
        }
        let id = Uuid::new_v4().to_string();
        let req = codec::Call {
            id: id.clone(),
            object: object.to_owned(),
            func: func.to_owned(),
            data: params,
        };
        match self.request(MsgType::Call, id, &req).await? {
            Some(data) => Ok(data),
            None => Err(Error::not_registered("no such object or method")),
        }
    }

    /// Subscribes to `event` and installs `handler`. An event may carry any
    /// number of handlers; delivery order between them is unspecified.
    pub async fn listen(&self, event: &str, handler: Arc<dyn EventHandler>) -> Result<(), Error> {
        if event.is_empty() {
            return Err(Error::data("event name must not be empty"));
        }
        let id = Uuid::new_v4().to_string();
        let req = codec::Subscribe {
            id: id.clone(),
            event: event.to_owned(),
        };
        match self.request(MsgType::Subscribe, id, &req).await? {
            Some(_) => {
                self.inner
                    .events
                    .write()
                    .unwrap()
                    .entry(event.to_owned())
                    .or_default()
                    .push(handler);
                Ok(())
            }
            None => Err(Error::not_registered("subscription refused")),
        }
    }

    /// Publishes `event`. Fire-and-forget: no acknowledgement is awaited.
    pub async fn send(&self, event: &str, data: Value) -> Result<(), Error> {
        if event.is_empty() {
            return Err(Error::data("event name must not be empty"));
        }
        if !data.is_object() {
            return Err(Error::data("event data must be a JSON object"));
        }
        if !self.is_connected() {
            return Err(Error::not_connected());
        }
        let buf = codec::encode(
            MsgType::Publish,
            &codec::Publish {
                event: event.to_owned(),
                data,
            },
        )?;
        self.inner.tx.send(buf).await.map_err(Into::into)
    }

    /// Installs a callback fired exactly once, on the first detected loss
    /// of the broker connection (or on [`Client::disconnect`]).
    ///
    /// # Panics
    ///
    /// Will panic if the callback mutex is poisoned
    pub fn on_disconnect(&self, cb: impl FnOnce() + Send + 'static) {
        self.inner
            .disconnect_cb
            .lock()
            .unwrap()
            .replace(Box::new(cb));
    }

    /// Closes the connection and stops the runtime. Idempotent.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Installs the rendezvous slot before the frame leaves, so a reply
    /// racing ahead of the waiter still finds it. The slot is removed
    /// whether the wait completes or times out.
    async fn request<T: Serialize>(
        &self,
        kind: MsgType,
        id: String,
        body: &T,
    ) -> Result<Option<Value>, Error> {
        if !self.is_connected() {
            return Err(Error::not_connected());
        }
        let buf = codec::encode(kind, body)?;
        let (tx, rx) = oneshot::channel();
        self.inner.requests.lock().unwrap().insert(id.clone(), tx);
        if let Err(e) = self.inner.tx.send(buf).await {
            self.inner.requests.lock().unwrap().remove(&id);
            return Err(e.into());
        }
        match time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // slot dropped: the connection went down while we waited
            Ok(Err(_)) => Err(Error::not_connected()),
            Err(_) => {
                self.inner.requests.lock().unwrap().remove(&id);
                warn!("{:?} request {} timed out", kind, id);
                Err(Error::timeout())
            }
        }
    }
}

impl ClientInner {
    /// First detected loss wins: pending waiters are released, the
    /// disconnect callback fires once, both tasks stop.
    fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.stop.trigger();
            self.tx.close();
            self.requests.lock().unwrap().clear();
            let cb = self.disconnect_cb.lock().unwrap().take();
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    fn wake(&self, id: &str, payload: Option<Value>) {
        let tx = self.requests.lock().unwrap().remove(id);
        match tx {
            Some(tx) => {
                let _r = tx.send(payload);
            }
            // late reply after timeout, or a reply we never asked for
            None => trace!("reply {} dropped: no waiter", id),
        }
    }

    fn dispatch(self: &Arc<Self>, raw: codec::RawFrame) {
        let frame = match raw.decode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("undecodable frame from broker: {}", e);
                return;
            }
        };
        let kind = frame.kind;
        match kind {
            MsgType::Invoke => match frame.parse::<codec::Invocation>() {
                Ok(inv) => self.handle_invocation(inv),
                Err(e) => warn!("broken invocation body: {}", e),
            },
            MsgType::CallResult => match frame.parse::<codec::CallResult>() {
                Ok(res) => {
                    let payload = if res.ret != 0 {
                        Some(res.data.unwrap_or(Value::Null))
                    } else {
                        None
                    };
                    self.wake(&res.id, payload);
                }
                Err(e) => warn!("broken call result body: {}", e),
            },
            MsgType::RegisterAck | MsgType::SubscribeAck => match frame.parse::<codec::Ack>() {
                Ok(ack) => {
                    let payload = if ack.ret != 0 {
                        Some(Value::from(ack.ret))
                    } else {
                        None
                    };
                    self.wake(&ack.id, payload);
                }
                Err(e) => warn!("broken ack body: {}", e),
            },
            MsgType::Event => match frame.parse::<codec::Event>() {
                Ok(ev) => {
                    let handlers = self
                        .events
                        .read()
                        .unwrap()
                        .get(&ev.event)
                        .cloned()
                        .unwrap_or_default();
                    // one task per handler: a panicking callback cannot
                    // starve the other subscribers
                    for handler in handlers {
                        let data = ev.data.clone();
                        tokio::spawn(async move {
                            handler.handle(data).await;
                        });
                    }
                }
                Err(e) => warn!("broken event body: {}", e),
            },
            _ => warn!("unexpected frame from broker: {:?}", kind),
        }
    }

    fn handle_invocation(self: &Arc<Self>, inv: codec::Invocation) {
        let handler = self
            .objects
            .read()
            .unwrap()
            .get(&inv.object)
            .and_then(|methods| methods.get(&inv.func))
            .cloned();
        let inner = self.clone();
        tokio::spawn(async move {
            let data = match handler {
                Some(handler) => {
                    let params = inv.data;
                    // the extra spawn isolates handler panics: the reply
                    // below still goes out, carrying null
                    tokio::spawn(async move { handler.handle(params).await })
                        .await
                        .ok()
                        .flatten()
                }
                None => {
                    warn!("invocation of unknown method {}.{}", inv.object, inv.func);
                    None
                }
            };
            let reply = codec::Reply {
                id: inv.id,
                cs: inv.cs,
                data: data.unwrap_or(Value::Null),
            };
            match codec::encode(MsgType::Reply, &reply) {
                Ok(buf) => {
                    let _r = inner.tx.send(buf).await;
                }
                Err(e) => error!("reply encode error: {}", e),
            }
        });
    }
}
