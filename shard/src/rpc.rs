//! TCP RPC
//!
//! Frames are a big-endian `u32` length followed by a bincode body. Every
//! inbound connection is served by its own task, one request at a time.
//! Clients keep a pool of idle connections, so a call blocked on an account
//! lock never delays an unrelated call to the same node.

use crate::{coordinator::TransferCoordinator, router::ShardRouter, Error, Result};
use async_trait::async_trait;
use consensus::{
    AcceptReply, AcceptRequest, LearnRequest, NodeId, PeerTransport, PrepareReply, PrepareRequest,
};
use ledger_core::{AccountId, Amount, Operation, ShardId};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Inbound calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Set a balance
    Put {
        /// Account
        account: AccountId,
        /// New balance
        amount: Amount,
    },
    /// Read a balance
    Get {
        /// Account
        account: AccountId,
    },
    /// Move money; `from` must be owned by the receiving shard
    Transfer {
        /// Debited account
        from: AccountId,
        /// Credited account
        to: AccountId,
        /// Positive amount
        amount: Amount,
    },
    /// Two-phase prepare
    Prepare {
        /// Transfer id
        txn_id: Uuid,
        /// Reserved account
        account: AccountId,
        /// Signed amount
        delta: Amount,
    },
    /// Two-phase commit
    Commit {
        /// Transfer id
        txn_id: Uuid,
        /// Reserved account
        account: AccountId,
        /// Signed amount, as prepared
        delta: Amount,
    },
    /// Two-phase abort
    Abort {
        /// Transfer id
        txn_id: Uuid,
        /// Reserved account
        account: AccountId,
    },
    /// Consensus phase 1a
    PaxosPrepare(PrepareRequest),
    /// Consensus phase 2a
    PaxosAccept(AcceptRequest<Operation>),
    /// Consensus decision broadcast
    PaxosLearn(LearnRequest<Operation>),
    /// Prometheus text exposition
    Metrics,
}

/// Replies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Success flag of Put/Transfer/Prepare/Commit/Abort
    Ok(bool),
    /// Balance
    Balance(Amount),
    /// Consensus phase 1b
    PaxosPrepare(PrepareReply<Operation>),
    /// Consensus phase 2b
    PaxosAccept(AcceptReply),
    /// Decision recorded
    Learned,
    /// Metrics text
    Metrics(String),
    /// The call failed
    Error(String),
}

/// Write one frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Rpc(format!("frame of {} bytes too large", body.len())));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, `None` on a clean end of stream
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(Error::Rpc(format!("frame of {} bytes too large", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

/// RPC server of one replica
#[derive(Debug)]
pub struct RpcServer {
    coordinator: Arc<TransferCoordinator>,
}

impl RpcServer {
    /// Serve `coordinator` and its shard
    pub fn new(coordinator: Arc<TransferCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Accept connections forever
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "RPC server listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Connection accept error");
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    debug!(peer = %peer, error = %e, "Connection closed with error");
                }
            });
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
            let response = self.handle(request).await;
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }

    /// Dispatch one request
    pub async fn handle(&self, request: Request) -> Response {
        let shard = self.coordinator.shard();
        let consensus = shard.consensus();

        let result = match request {
            Request::Put { account, amount } => shard.put(account, amount).await.map(Response::Ok),
            Request::Get { account } => shard.get(&account).await.map(Response::Balance),
            Request::Transfer { from, to, amount } => self
                .coordinator
                .transfer(from, to, amount)
                .await
                .map(Response::Ok),
            Request::Prepare { txn_id, account, delta } => {
                shard.prepare(txn_id, account, delta).await.map(Response::Ok)
            }
            Request::Commit { txn_id, account, delta } => {
                shard.commit(txn_id, account, delta).await.map(Response::Ok)
            }
            Request::Abort { txn_id, account } => shard.abort(txn_id, account).map(Response::Ok),
            Request::PaxosPrepare(request) => consensus
                .handle_prepare(request)
                .map(Response::PaxosPrepare)
                .map_err(Error::from),
            Request::PaxosAccept(request) => consensus
                .handle_accept(request)
                .map(Response::PaxosAccept)
                .map_err(Error::from),
            Request::PaxosLearn(request) => consensus
                .handle_learn(request)
                .map(|_| Response::Learned)
                .map_err(Error::from),
            Request::Metrics => Ok(Response::Metrics(shard.metrics().render())),
        };

        result.unwrap_or_else(|e| Response::Error(e.to_string()))
    }
}

/// Client of one remote node
#[derive(Debug)]
pub struct RpcClient {
    addr: String,
    idle: Mutex<Vec<TcpStream>>,
}

impl RpcClient {
    /// Client for `addr`; connections are opened on demand
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Remote address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send `request` and wait for the reply.
    ///
    /// A pooled connection the remote has closed since its last use is
    /// replaced by a fresh one, once.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let idle = self.idle.lock().pop();
        let response = match idle {
            Some(stream) => match self.exchange(stream, request).await {
                Err(Error::Io(e)) => {
                    debug!(addr = %self.addr, error = %e, "Pooled connection failed, reconnecting");
                    self.exchange(self.connect().await?, request).await?
                }
                result => result?,
            },
            None => self.exchange(self.connect().await?, request).await?,
        };

        match response {
            Response::Error(message) => Err(Error::Rpc(message)),
            response => Ok(response),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// One request/reply on `stream`, which goes back to the pool afterwards
    async fn exchange(&self, mut stream: TcpStream, request: &Request) -> Result<Response> {
        write_frame(&mut stream, request).await?;
        let response = read_frame::<_, Response>(&mut stream).await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.addr),
            )
        })?;
        self.idle.lock().push(stream);
        Ok(response)
    }

    async fn call_flag(&self, request: &Request) -> Result<bool> {
        match self.call(request).await? {
            Response::Ok(flag) => Ok(flag),
            other => Err(unexpected(&other)),
        }
    }

    /// `Put`
    pub async fn put(&self, account: AccountId, amount: Amount) -> Result<bool> {
        self.call_flag(&Request::Put { account, amount }).await
    }

    /// `Get`
    pub async fn get(&self, account: AccountId) -> Result<Amount> {
        match self.call(&Request::Get { account }).await? {
            Response::Balance(balance) => Ok(balance),
            other => Err(unexpected(&other)),
        }
    }

    /// `Transfer`
    pub async fn transfer(&self, from: AccountId, to: AccountId, amount: Amount) -> Result<bool> {
        self.call_flag(&Request::Transfer { from, to, amount }).await
    }

    /// Metrics text of the remote node
    pub async fn metrics(&self) -> Result<String> {
        match self.call(&Request::Metrics).await? {
            Response::Metrics(text) => Ok(text),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::Rpc(format!("unexpected response {:?}", response))
}

/// Consensus transport over TCP, indexed by node id
#[derive(Debug)]
pub struct TcpPeerTransport {
    peers: Vec<RpcClient>,
}

impl TcpPeerTransport {
    /// Transport to `addrs[i]` for node `i`
    pub fn new(addrs: &[String]) -> Self {
        Self {
            peers: addrs.iter().map(|addr| RpcClient::new(addr.clone())).collect(),
        }
    }

    async fn call(&self, to: NodeId, request: Request) -> consensus::Result<Response> {
        let peer = self
            .peers
            .get(to as usize)
            .ok_or_else(|| consensus::Error::Transport(format!("unknown node {}", to)))?;
        peer.call(&request)
            .await
            .map_err(|e| consensus::Error::Transport(format!("{}: {}", peer.addr(), e)))
    }
}

#[async_trait]
impl PeerTransport<Operation> for TcpPeerTransport {
    async fn prepare(&self, to: NodeId, request: PrepareRequest) -> consensus::Result<PrepareReply<Operation>> {
        match self.call(to, Request::PaxosPrepare(request)).await? {
            Response::PaxosPrepare(reply) => Ok(reply),
            other => Err(consensus::Error::Transport(unexpected(&other).to_string())),
        }
    }

    async fn accept(&self, to: NodeId, request: AcceptRequest<Operation>) -> consensus::Result<AcceptReply> {
        match self.call(to, Request::PaxosAccept(request)).await? {
            Response::PaxosAccept(reply) => Ok(reply),
            other => Err(consensus::Error::Transport(unexpected(&other).to_string())),
        }
    }

    async fn learn(&self, to: NodeId, request: LearnRequest<Operation>) -> consensus::Result<()> {
        match self.call(to, Request::PaxosLearn(request)).await? {
            Response::Learned => Ok(()),
            other => Err(consensus::Error::Transport(unexpected(&other).to_string())),
        }
    }
}

/// Two-phase router over TCP, one contact node per shard
#[derive(Debug)]
pub struct TcpShardRouter {
    shards: HashMap<ShardId, RpcClient>,
}

impl TcpShardRouter {
    /// Router over `(shard, address)` pairs
    pub fn new<I>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = (ShardId, String)>,
    {
        Self {
            shards: endpoints
                .into_iter()
                .map(|(shard, addr)| (shard, RpcClient::new(addr)))
                .collect(),
        }
    }

    fn client(&self, shard: ShardId) -> Result<&RpcClient> {
        self.shards
            .get(&shard)
            .ok_or_else(|| Error::Rpc(format!("no route to shard {}", shard)))
    }
}

#[async_trait]
impl ShardRouter for TcpShardRouter {
    async fn prepare(&self, shard: ShardId, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool> {
        self.client(shard)?
            .call_flag(&Request::Prepare { txn_id, account, delta })
            .await
    }

    async fn commit(&self, shard: ShardId, txn_id: Uuid, account: AccountId, delta: Amount) -> Result<bool> {
        self.client(shard)?
            .call_flag(&Request::Commit { txn_id, account, delta })
            .await
    }

    async fn abort(&self, shard: ShardId, txn_id: Uuid, account: AccountId) -> Result<bool> {
        self.client(shard)?
            .call_flag(&Request::Abort { txn_id, account })
            .await
    }
}
