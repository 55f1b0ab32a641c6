//! libp2p transport for the sync protocol.
//!
//! The swarm gossips protocol messages on one topic per message kind,
//! finds local peers over mDNS and drops peers that stop answering pings.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::gossipsub::{self, Behaviour as Gossipsub, IdentTopic, MessageAuthenticity};
use libp2p::identify::{self, Behaviour as Identify};
use libp2p::identity::Keypair;
use libp2p::mdns::{self, tokio::Behaviour as Mdns};
use libp2p::ping::{self, Behaviour as Ping};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{Multiaddr, PeerId, Swarm};
use ln_sync::protocol::{encode_message, TOPIC_BLOCK, TOPIC_STATUS, TOPIC_TX};
use ln_sync::{Outbound, ProtocolManager, SyncError};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::NodeError;

#[derive(Debug, Clone)]
pub struct P2pConfig {
    pub listen_port: u16,
    /// Total peer slots, light clients included.
    pub max_peers: usize,
    pub bootnodes: Vec<Multiaddr>,
    /// Discover peers on the local network.
    pub mdns: bool,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_port: 30303,
            max_peers: 25,
            bootnodes: Vec::new(),
            mdns: true,
        }
    }
}

#[derive(NetworkBehaviour)]
pub struct LedgerBehaviour {
    pub gossipsub: Gossipsub,
    pub mdns: Toggle<Mdns>,
    pub ping: Ping,
    pub identify: Identify,
}

fn build_behaviour(
    keypair: &Keypair,
    enable_mdns: bool,
) -> Result<LedgerBehaviour, Box<dyn std::error::Error + Send + Sync>> {
    let peer_id = keypair.public().to_peer_id();

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(10))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(4 * 1024 * 1024)
        .build()
        .map_err(|e| format!("gossipsub config: {e}"))?;
    let mut gossipsub = Gossipsub::new(MessageAuthenticity::Signed(keypair.clone()), gossipsub_config)
        .map_err(|e| format!("gossipsub init: {e}"))?;
    for topic in [TOPIC_STATUS, TOPIC_TX, TOPIC_BLOCK] {
        gossipsub.subscribe(&IdentTopic::new(topic))?;
    }

    let mdns = if enable_mdns {
        Some(Mdns::new(mdns::Config::default(), peer_id)?)
    } else {
        None
    };

    Ok(LedgerBehaviour {
        gossipsub,
        mdns: mdns.into(),
        ping: Ping::new(ping::Config::new()),
        identify: Identify::new(identify::Config::new("/ln/1.0.0".into(), keypair.public())),
    })
}

/// The node's network endpoint.  Handed to
/// [`crate::NodeService::start`] for its peer budget, then run with
/// [`P2pServer::spawn`].
pub struct P2pServer {
    keypair: Keypair,
    config: P2pConfig,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl P2pServer {
    pub fn new(config: P2pConfig) -> Self {
        Self::with_keypair(Keypair::generate_ed25519(), config)
    }

    pub fn with_keypair(keypair: Keypair, config: P2pConfig) -> Self {
        Self {
            keypair,
            config,
            token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub fn max_peers(&self) -> usize {
        self.config.max_peers
    }

    /// Listen, dial the bootnodes and relay traffic for `protocol` until
    /// stopped.
    pub fn spawn(&self, protocol: Arc<ProtocolManager>) -> Result<(), NodeError> {
        let keypair = self.keypair.clone();
        let mdns = self.config.mdns;
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair.clone())
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_behaviour(|_| build_behaviour(&keypair, mdns))
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", self.config.listen_port)
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| NodeError::Transport(e.to_string()))?;
        swarm
            .listen_on(listen)
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        for addr in &self.config.bootnodes {
            if let Err(err) = swarm.dial(addr.clone()) {
                warn!(%addr, %err, "Failed to dial bootnode");
            }
        }

        info!(peer_id = %self.peer_id(), max_peers = self.config.max_peers, "Started P2P networking");
        let driver = Driver {
            swarm,
            outbound: protocol.subscribe_outbound(),
            protocol,
            max_peers: self.config.max_peers,
        };
        *self.task.lock() = Some(tokio::spawn(driver.run(self.token.clone())));
        Ok(())
    }

    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("P2P networking stopped");
        }
    }
}

struct Driver {
    swarm: Swarm<LedgerBehaviour>,
    protocol: Arc<ProtocolManager>,
    outbound: broadcast::Receiver<Outbound>,
    max_peers: usize,
}

impl Driver {
    async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                msg = self.outbound.recv() => match msg {
                    Ok(msg) => self.publish(msg.topic, msg.payload),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped outbound protocol messages"),
                    Err(RecvError::Closed) => return,
                },
                event = self.swarm.select_next_some() => self.handle_event(event).await,
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) {
        if let Err(err) = self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(IdentTopic::new(topic), payload)
        {
            debug!(topic, %err, "Gossip publish failed");
        }
    }

    fn announce_status(&mut self) {
        match encode_message(&self.protocol.status()) {
            Ok(payload) => self.publish(TOPIC_STATUS, payload),
            Err(err) => warn!(%err, "Failed to encode status"),
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<LedgerBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => info!(%address, "Listening"),

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                if self.swarm.connected_peers().count() > self.max_peers {
                    debug!(%peer_id, "Too many peers, dropping connection");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                debug!(%peer_id, "Peer connected");
                self.announce_status();
            }

            SwarmEvent::ConnectionClosed { peer_id, num_established: 0, .. } => {
                self.protocol.unregister_peer(&peer_id);
            }

            SwarmEvent::Behaviour(LedgerBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let peer = message.source.unwrap_or(propagation_source);
                match self.protocol.handle_message(peer, &message.data).await {
                    Ok(()) => {}
                    Err(err @ (SyncError::NetworkMismatch { .. } | SyncError::GenesisMismatch)) => {
                        debug!(%peer, %err, "Incompatible peer, disconnecting");
                        let _ = self.swarm.disconnect_peer_id(peer);
                    }
                    Err(err) => debug!(%peer, %err, "Protocol message rejected"),
                }
            }

            SwarmEvent::Behaviour(LedgerBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    if self.swarm.is_connected(&peer_id) || self.swarm.connected_peers().count() >= self.max_peers {
                        continue;
                    }
                    if let Err(err) = self.swarm.dial(addr.clone()) {
                        debug!(%peer_id, %addr, %err, "Dial failed");
                    }
                }
            }

            SwarmEvent::Behaviour(LedgerBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            }

            SwarmEvent::Behaviour(LedgerBehaviourEvent::Ping(ping::Event { peer, result: Err(_), .. })) => {
                debug!(%peer, "Ping failed, disconnecting");
                let _ = self.swarm.disconnect_peer_id(peer);
            }

            _ => {}
        }
    }
}
