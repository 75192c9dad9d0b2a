//! One-shot RPC client over a shared libp2p host.

use crate::error::{Lp2pError, Lp2pResult};
use crate::wire::{StorageProposalV120Params, StorageProposalV120Response, STORAGE_PROPOSAL_V120};
use async_trait::async_trait;
use futures::prelude::*;
use libp2p::request_response::{self, OutboundFailure, OutboundRequestId, ProtocolSupport};
use libp2p::swarm::SwarmEvent;
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol};
use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Length-prefixed dag-cbor codec for the storage proposal exchange.
#[derive(Debug, Clone, Default)]
pub struct ProposalCodec;

/// Upper bound on a single RPC frame. Proposals are a few KiB; anything
/// bigger is a confused or hostile peer.
const MAX_FRAME_SIZE: u32 = 1 << 20;

#[async_trait]
impl request_response::Codec for ProposalCodec {
    type Protocol = StreamProtocol;
    type Request = StorageProposalV120Params;
    type Response = StorageProposalV120Response;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_frame(io).await?;
        serde_ipld_dagcbor::from_slice(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_frame(io).await?;
        serde_ipld_dagcbor::from_slice(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        request: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let data = serde_ipld_dagcbor::to_vec(&request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(io, &data).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        response: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let data = serde_ipld_dagcbor::to_vec(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(io, &data).await
    }
}

async fn read_frame<T: AsyncRead + Unpin + Send>(io: &mut T) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<T: AsyncWrite + Unpin + Send>(io: &mut T, data: &[u8]) -> io::Result<()> {
    io.write_all(&(data.len() as u32).to_be_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await
}

/// A provider's attested dialing coordinates.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub multiaddrs: Vec<Multiaddr>,
}

impl AddrInfo {
    /// Assemble from the string forms stored in provider info. Fails with
    /// [`Lp2pError::Undialable`] when the attestation is unusable.
    pub fn from_attested(peer_id: &str, multiaddrs: &[String]) -> Lp2pResult<Self> {
        let peer_id: PeerId = peer_id
            .parse()
            .map_err(|e| Lp2pError::Undialable(format!("bad peer id '{peer_id}': {e}")))?;
        let parsed: Vec<Multiaddr> = multiaddrs
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        if parsed.is_empty() {
            return Err(Lp2pError::Undialable(
                "no parseable multiaddrs attested".into(),
            ));
        }
        Ok(Self {
            peer_id,
            multiaddrs: parsed,
        })
    }
}

enum Command {
    Propose {
        target: AddrInfo,
        params: StorageProposalV120Params,
        reply: oneshot::Sender<Lp2pResult<StorageProposalV120Response>>,
    },
    ClosePeer {
        peer: PeerId,
    },
}

/// A libp2p host shared by all delivery workers of one run.
///
/// The swarm runs on its own task; workers interact through commands. One
/// outstanding request per provider is the expected usage pattern (the
/// delivery stage is serial within a provider), but nothing here enforces it.
pub struct DealClient {
    cmd_tx: mpsc::Sender<Command>,
    local_peer_id: PeerId,
    per_call_timeout: Duration,
}

impl DealClient {
    /// Build the host and start its event loop.
    pub fn new(per_call_timeout: Duration) -> Lp2pResult<Self> {
        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| Lp2pError::Setup(e.to_string()))?
            .with_behaviour(|_| {
                request_response::Behaviour::with_codec(
                    ProposalCodec,
                    [(
                        StreamProtocol::new(STORAGE_PROPOSAL_V120),
                        ProtocolSupport::Outbound,
                    )],
                    request_response::Config::default().with_request_timeout(per_call_timeout),
                )
            })
            .map_err(|e| Lp2pError::Setup(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let local_peer_id = *swarm.local_peer_id();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(64);

        tokio::spawn(async move {
            let mut pending: HashMap<
                OutboundRequestId,
                oneshot::Sender<Lp2pResult<StorageProposalV120Response>>,
            > = HashMap::new();

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        None => break,
                        Some(Command::Propose { target, params, reply }) => {
                            for addr in &target.multiaddrs {
                                swarm.add_peer_address(target.peer_id, addr.clone());
                            }
                            let id = swarm
                                .behaviour_mut()
                                .send_request(&target.peer_id, params);
                            pending.insert(id, reply);
                        }
                        Some(Command::ClosePeer { peer }) => {
                            let _ = swarm.disconnect_peer_id(peer);
                        }
                    },
                    event = swarm.select_next_some() => match event {
                        SwarmEvent::Behaviour(request_response::Event::Message {
                            message: request_response::Message::Response { request_id, response },
                            ..
                        }) => {
                            if let Some(reply) = pending.remove(&request_id) {
                                let _ = reply.send(Ok(response));
                            }
                        }
                        SwarmEvent::Behaviour(request_response::Event::OutboundFailure {
                            request_id,
                            error,
                            ..
                        }) => {
                            if let Some(reply) = pending.remove(&request_id) {
                                let _ = reply.send(Err(map_outbound_failure(error)));
                            }
                        }
                        _ => {}
                    },
                }
            }
        });

        Ok(Self {
            cmd_tx,
            local_peer_id,
            per_call_timeout,
        })
    }

    /// Our host's peer id, recorded into proposal timing samples.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Execute one storage-proposal RPC against `target`. Returns the
    /// provider's answer and the wall time the exchange took.
    pub async fn propose(
        &self,
        target: &AddrInfo,
        params: StorageProposalV120Params,
    ) -> (Lp2pResult<StorageProposalV120Response>, Duration) {
        let started = Instant::now();
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .send(Command::Propose {
                target: target.clone(),
                params,
                reply: reply_tx,
            })
            .await;
        if sent.is_err() {
            return (Err(Lp2pError::ClientClosed), started.elapsed());
        }

        // The behaviour enforces the per-request deadline; the outer timeout
        // only catches a wedged event loop.
        let grace = self.per_call_timeout + Duration::from_secs(5);
        let outcome = match tokio::time::timeout(grace, reply_rx).await {
            Err(_) => Err(Lp2pError::DeadlineExceeded),
            Ok(Err(_)) => Err(Lp2pError::ClientClosed),
            Ok(Ok(res)) => res,
        };
        (outcome, started.elapsed())
    }

    /// Drop the transport connection to a provider.
    pub async fn close_peer(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::ClosePeer { peer }).await;
    }
}

fn map_outbound_failure(error: OutboundFailure) -> Lp2pError {
    match error {
        OutboundFailure::Timeout => Lp2pError::DeadlineExceeded,
        OutboundFailure::DialFailure => {
            Lp2pError::Undialable("all attested addresses failed to dial".into())
        }
        other => Lp2pError::Rpc(other.to_string()),
    }
}
