use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{self, Message};
use crate::{RpcError, RpcResult};

const READ_BUFFER_BYTES: usize = 64 * 1024;

type Reply = oneshot::Sender<RpcResult<Value>>;

#[derive(Default)]
struct Pending {
    calls: HashMap<u64, Reply>,
    closed: bool,
}

impl Pending {
    fn fail_all(&mut self) {
        self.closed = true;
        for (_, reply) in self.calls.drain() {
            let _ = reply.send(Err(RpcError::Closed));
        }
    }
}

/// MessagePack-RPC client over a duplex byte stream.
///
/// Calls may be issued concurrently from any task; responses are routed back
/// to their caller by message id. Dropping the client stops both I/O tasks.
pub struct Client {
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<Mutex<Pending>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Dials `address`: `host:port` connects over TCP, anything else is
    /// treated as a local socket path (named pipe on Windows).
    pub async fn connect(address: &str) -> RpcResult<Self> {
        if is_tcp_address(address) {
            let stream = tokio::net::TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            debug!(target = "rpc::client", address, "connected over tcp");
            return Ok(Self::from_stream(stream));
        }
        Self::connect_local(address).await
    }

    #[cfg(unix)]
    async fn connect_local(path: &str) -> RpcResult<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        debug!(target = "rpc::client", path, "connected over unix socket");
        Ok(Self::from_stream(stream))
    }

    #[cfg(windows)]
    async fn connect_local(path: &str) -> RpcResult<Self> {
        let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
        debug!(target = "rpc::client", path, "connected over named pipe");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending = Arc::new(Mutex::new(Pending::default()));

        let read_task = tokio::spawn(read_loop(reader, Arc::clone(&pending), outbound_tx.clone()));
        let write_task = tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&pending)));

        Self {
            next_id: AtomicU64::new(1),
            outbound: outbound_tx,
            pending,
            tasks: vec![read_task, write_task],
        }
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = codec::encode(Message::Request {
            id,
            method: method.to_string(),
            params,
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(RpcError::Closed);
            }
            pending.calls.insert(id, reply_tx);
        }

        trace!(target = "rpc::client", id, method, "sending request");
        if self.outbound.send(bytes).is_err() {
            self.pending.lock().calls.remove(&id);
            return Err(RpcError::Closed);
        }

        reply_rx.await.map_err(|_| RpcError::Closed)?
    }

    pub fn notify(&self, method: &str, params: Vec<Value>) -> RpcResult<()> {
        let bytes = codec::encode(Message::Notification {
            method: method.to_string(),
            params,
        })?;
        self.outbound.send(bytes).map_err(|_| RpcError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.pending.lock().fail_all();
    }
}

async fn read_loop<R>(
    mut reader: R,
    pending: Arc<Mutex<Pending>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_BYTES);
    'read: loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(target = "rpc::client", "peer closed connection");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target = "rpc::client", error = %err, "rpc read failed");
                break;
            }
        }

        loop {
            match codec::decode_next(&mut buf) {
                Ok(Some(message)) => dispatch(message, &pending, &outbound),
                Ok(None) => break,
                Err(err) => {
                    warn!(target = "rpc::client", error = %err, "dropping connection on undecodable frame");
                    break 'read;
                }
            }
        }
    }
    pending.lock().fail_all();
}

fn dispatch(
    message: Message,
    pending: &Mutex<Pending>,
    outbound: &mpsc::UnboundedSender<Vec<u8>>,
) {
    match message {
        Message::Response { id, error, result } => {
            let Some(reply) = pending.lock().calls.remove(&id) else {
                warn!(target = "rpc::client", id, "response for unknown request");
                return;
            };
            let outcome = if error.is_nil() {
                Ok(result)
            } else {
                Err(RpcError::Remote {
                    message: remote_error_message(&error),
                })
            };
            let _ = reply.send(outcome);
        }
        Message::Notification { method, params } => {
            trace!(target = "rpc::client", %method, params = params.len(), "ignoring notification");
        }
        Message::Request { id, method, .. } => {
            debug!(target = "rpc::client", id, %method, "rejecting inbound request");
            let reply = codec::encode(Message::Response {
                id,
                error: Value::from(format!("method not supported: {method}")),
                result: Value::Nil,
            });
            match reply {
                Ok(bytes) => {
                    let _ = outbound.send(bytes);
                }
                Err(err) => warn!(target = "rpc::client", error = %err, "failed to encode rejection"),
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<Mutex<Pending>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            warn!(target = "rpc::client", error = %err, "rpc write failed");
            break;
        }
        if let Err(err) = writer.flush().await {
            warn!(target = "rpc::client", error = %err, "rpc flush failed");
            break;
        }
    }
    pending.lock().fail_all();
}

/// Neovim reports errors as `[kind, message]`; other peers send a bare string.
fn remote_error_message(error: &Value) -> String {
    match error {
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.as_str().map(str::to_string))
            .unwrap_or_else(|| error.to_string()),
        Value::String(s) => s.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn is_tcp_address(address: &str) -> bool {
    if address.parse::<std::net::SocketAddr>().is_ok() {
        return true;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty()
                && !host.contains(['/', '\\'])
                && port.parse::<u16>().is_ok()
        }
        None => false,
    }
}
