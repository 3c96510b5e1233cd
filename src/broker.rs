//! The bus daemon core: accepts client connections, owns the global
//! object-name table, forwards method invocations across connections,
//! routes replies back by the caller's connection handle and fans events
//! out to subscribers.

use log::{error, info, trace, warn};
use serde::Serialize;
use std::collections::{hash_map, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use submap::SubMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio::time;

use crate::codec::{self, Frame, MsgType};
use crate::{Error, ErrorKind, DEFAULT_BACKLOG, DEFAULT_QUEUE_SIZE};

macro_rules! pretty_error {
    ($name: expr, $err:expr) => {
        if $err.kind() != ErrorKind::Eof {
            error!("client {} error: {}", $name, $err);
        }
    };
}

type Outbound = Arc<Vec<u8>>;
type BrokerClient = Arc<PeerClient>;

/// One accepted connection. The handle is a broker-wide monotonic counter,
/// stable for the connection's lifetime and never reused, so an in-flight
/// forwarded invocation can always name its caller safely.
#[derive(Debug)]
struct PeerClient {
    id: u64,
    tx: async_channel::Sender<Outbound>,
}

impl PeerClient {
    fn new(id: u64, queue_size: usize) -> (Self, async_channel::Receiver<Outbound>) {
        let (tx, rx) = async_channel::bounded(queue_size);
        (Self { id, tx }, rx)
    }
}

impl fmt::Display for PeerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

impl PartialEq for PeerClient {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerClient {}

impl Hash for PeerClient {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug)]
struct ObjectEntry {
    owner: BrokerClient,
    funcs: HashSet<String>,
}

struct BrokerDb {
    clients: RwLock<HashMap<u64, BrokerClient>>,
    objects: RwLock<HashMap<String, ObjectEntry>>,
    subscriptions: RwLock<SubMap<BrokerClient>>,
    next_id: AtomicU64,
}

impl Default for BrokerDb {
    fn default() -> Self {
        Self {
            clients: <_>::default(),
            objects: <_>::default(),
            subscriptions: RwLock::new(SubMap::new().separator('/').match_any("+").wildcard("#")),
            next_id: AtomicU64::new(1),
        }
    }
}

impl BrokerDb {
    fn register_peer(
        &self,
        queue_size: usize,
    ) -> (BrokerClient, async_channel::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (c, rx) = PeerClient::new(id, queue_size);
        let client = Arc::new(c);
        self.subscriptions.write().unwrap().register_client(&client);
        self.clients.write().unwrap().insert(id, client.clone());
        (client, rx)
    }
    fn unregister_peer(&self, client: &BrokerClient) {
        self.subscriptions.write().unwrap().unregister_client(client);
        self.objects
            .write()
            .unwrap()
            .retain(|_, entry| entry.owner.id != client.id);
        self.clients.write().unwrap().remove(&client.id);
    }
    /// At most one connection owns a name; the write lock makes concurrent
    /// registrations for the same name resolve to exactly one winner.
    fn add_object(&self, client: &BrokerClient, name: &str, funcs: HashSet<String>) -> bool {
        match self.objects.write().unwrap().entry(name.to_owned()) {
            hash_map::Entry::Vacant(x) => {
                x.insert(ObjectEntry {
                    owner: client.clone(),
                    funcs,
                });
                true
            }
            hash_map::Entry::Occupied(_) => false,
        }
    }
    /// Owner lookup with method-set enforcement: a call to a method the
    /// object never advertised is refused without forwarding.
    fn find_callee(&self, object: &str, func: &str) -> Option<BrokerClient> {
        let objects = self.objects.read().unwrap();
        let entry = objects.get(object)?;
        if !entry.funcs.contains(func) {
            trace!("object {} has no method {}", object, func);
            return None;
        }
        Some(entry.owner.clone())
    }
}

pub struct Broker {
    db: Arc<BrokerDb>,
    services: Vec<JoinHandle<()>>,
    queue_size: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_unix_listener(path: &str) -> Result<UnixListener, Error> {
    use nix::sys::socket::{bind, listen, socket, AddressFamily, SockAddr, SockFlag, SockType};
    use std::os::unix::io::FromRawFd;
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    bind(fd, &SockAddr::new_unix(path)?)?;
    listen(fd, DEFAULT_BACKLOG)?;
    let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener).map_err(Into::into)
}

impl Broker {
    pub fn new() -> Self {
        Self {
            db: <_>::default(),
            services: <_>::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
    pub fn set_queue_size(&mut self, queue_size: usize) {
        self.queue_size = queue_size;
    }
    /// Binds the bus socket (unlinking a stale one first) and spawns the
    /// accept loop. `timeout` bounds writes to a single slow client.
    pub async fn spawn_unix_server(
        &mut self,
        path: &str,
        buf_size: usize,
        timeout: Duration,
    ) -> Result<(), Error> {
        let _r = tokio::fs::remove_file(path).await;
        let listener = bind_unix_listener(path)?;
        let socket_path = path.to_owned();
        let db = self.db.clone();
        let queue_size = self.queue_size;
        let service = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        trace!("ubus client connected to {}", socket_path);
                        let cdb = db.clone();
                        let name = socket_path.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_peer(cdb, stream, buf_size, timeout, queue_size).await
                            {
                                pretty_error!(name, e);
                            }
                        });
                    }
                    Err(e) => error!("{}", e),
                }
            }
        });
        self.services.push(service);
        Ok(())
    }
    async fn handle_peer(
        db: Arc<BrokerDb>,
        stream: UnixStream,
        buf_size: usize,
        timeout: Duration,
        queue_size: usize,
    ) -> Result<(), Error> {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(buf_size, reader);
        let mut writer = BufWriter::with_capacity(buf_size, writer);
        let (client, rx) = db.register_peer(queue_size);
        info!("ubus client connected: {}", client);
        let w_client = client.clone();
        let writer_fut = tokio::spawn(async move {
            while let Ok(frame) = rx.recv().await {
                macro_rules! write_and_flush {
                    ($op: expr) => {
                        match time::timeout(timeout, $op).await {
                            Ok(result) => {
                                if let Err(e) = result {
                                    let err: Error = Into::<Error>::into(e);
                                    pretty_error!(w_client, err);
                                    break;
                                }
                            }
                            Err(_) => {
                                error!("client {} error: write timeout", w_client);
                                break;
                            }
                        }
                    };
                }
                write_and_flush!(writer.write_all(&frame));
                write_and_flush!(writer.flush());
            }
        });
        let result = Self::handle_reader(&db, client.clone(), &mut reader).await;
        writer_fut.abort();
        db.unregister_peer(&client);
        info!("ubus client disconnected: {}", client);
        result
    }
    /// Frames from one connection are handled in order, so frame order is
    /// preserved for every sender-receiver pair; connections are handled in
    /// parallel with each other.
    async fn handle_reader<R>(
        db: &BrokerDb,
        client: BrokerClient,
        reader: &mut R,
    ) -> Result<(), Error>
    where
        R: AsyncReadExt + Unpin,
    {
        while let Some(raw) = codec::read_raw_frame(reader).await? {
            let frame = match raw.decode() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("client {} sent an undecodable frame: {}", client, e);
                    continue;
                }
            };
            if let Err(e) = Self::handle_frame(db, &client, frame).await {
                warn!("client {} frame dropped: {}", client, e);
            }
        }
        Ok(())
    }
    async fn handle_frame(db: &BrokerDb, client: &BrokerClient, frame: Frame) -> Result<(), Error> {
        match frame.kind {
            MsgType::Register => {
                let req: codec::Register = frame.parse()?;
                let ret = db.add_object(client, &req.object, req.funcs.into_iter().collect());
                if ret {
                    info!("client {} registered object {}", client, req.object);
                } else {
                    trace!("client {} refused object {}: name taken", client, req.object);
                }
                respond(
                    client,
                    MsgType::RegisterAck,
                    &codec::Ack {
                        id: req.id,
                        ret: ret.into(),
                    },
                )
                .await
            }
            MsgType::Call => {
                let req: codec::Call = frame.parse()?;
                match db.find_callee(&req.object, &req.func) {
                    Some(owner) => {
                        trace!(
                            "forwarding {}.{} from {} to {}",
                            req.object,
                            req.func,
                            client,
                            owner
                        );
                        let inv = codec::Invocation {
                            id: req.id,
                            cs: client.id,
                            object: req.object,
                            func: req.func,
                            data: req.data,
                        };
                        let buf = Arc::new(codec::encode(MsgType::Invoke, &inv)?);
                        if owner.tx.send(buf).await.is_err() {
                            // the owner vanished between lookup and forward
                            respond(
                                client,
                                MsgType::CallResult,
                                &codec::CallResult {
                                    id: inv.id,
                                    ret: 0,
                                    data: None,
                                },
                            )
                            .await?;
                        }
                        Ok(())
                    }
                    None => {
                        respond(
                            client,
                            MsgType::CallResult,
                            &codec::CallResult {
                                id: req.id,
                                ret: 0,
                                data: None,
                            },
                        )
                        .await
                    }
                }
            }
            MsgType::Reply => {
                let rep: codec::Reply = frame.parse()?;
                let caller = { db.clients.read().unwrap().get(&rep.cs).cloned() };
                if let Some(caller) = caller {
                    respond(
                        &caller,
                        MsgType::CallResult,
                        &codec::CallResult {
                            id: rep.id,
                            ret: 1,
                            data: Some(rep.data),
                        },
                    )
                    .await?;
                } else {
                    trace!("reply {} dropped: caller #{} is gone", rep.id, rep.cs);
                }
                Ok(())
            }
            MsgType::Subscribe => {
                let req: codec::Subscribe = frame.parse()?;
                {
                    db.subscriptions
                        .write()
                        .unwrap()
                        .subscribe(&req.event, client);
                }
                trace!("client {} subscribed to {}", client, req.event);
                respond(
                    client,
                    MsgType::SubscribeAck,
                    &codec::Ack { id: req.id, ret: 1 },
                )
                .await
            }
            MsgType::Publish => {
                let req: codec::Publish = frame.parse()?;
                let subs = { db.subscriptions.read().unwrap().get_subscribers(&req.event) };
                if !subs.is_empty() {
                    let buf = Arc::new(codec::encode(
                        MsgType::Event,
                        &codec::Event {
                            event: req.event,
                            data: req.data,
                        },
                    )?);
                    for sub in subs {
                        let _r = sub.tx.send(buf.clone()).await;
                    }
                }
                Ok(())
            }
            _ => {
                warn!("client {} sent unexpected frame {:?}", client, frame.kind);
                Ok(())
            }
        }
    }
}

async fn respond<T: Serialize>(
    client: &BrokerClient,
    kind: MsgType,
    body: &T,
) -> Result<(), Error> {
    let buf = Arc::new(codec::encode(kind, body)?);
    client.tx.send(buf).await.map_err(Into::into)
}

impl Drop for Broker {
    fn drop(&mut self) {
        for service in &self.services {
            service.abort();
        }
    }
}
