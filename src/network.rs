use crate::types::ConsensusMessage;
use futures::StreamExt;
use libp2p::{
    Multiaddr, gossipsub, mdns, noise, swarm::NetworkBehaviour, swarm::SwarmEvent, tcp, yamux,
};
use std::collections::hash_map::DefaultHasher;
use std::error::Error;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::mpsc;

/// Gossip topic carrying votes, timeouts and SyncInfo bundles.
pub const CONSENSUS_TOPIC: &str = "bft-consensus";

/// Gossipsub for consensus messages plus mDNS for local discovery.
#[derive(NetworkBehaviour)]
pub struct BftBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
}

/// Events emitted by the network task to the node.
#[derive(Debug)]
pub enum NetworkEvent {
    MessageReceived(ConsensusMessage),
    PeerConnected(String),
}

#[derive(Debug)]
enum NetworkCommand {
    Broadcast(Vec<u8>),
    Dial(Multiaddr),
}

pub fn encode_message(message: &ConsensusMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

pub fn decode_message(data: &[u8]) -> Result<ConsensusMessage, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Handle to the swarm, which runs in a background task and talks over channels.
pub struct Network {
    command_sender: mpsc::Sender<NetworkCommand>,
    event_receiver: mpsc::Receiver<NetworkEvent>,
}

impl Network {
    pub async fn new(port: u16) -> Result<Self, Box<dyn Error>> {
        let (command_sender, mut command_receiver) = mpsc::channel(100);
        let (event_sender, event_receiver) = mpsc::channel(100);

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| {
                // Identical payloads are the same message.
                let message_id_fn = |message: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    message.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(std::io::Error::other)?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?;

                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?;

                Ok(BftBehaviour { gossipsub, mdns })
            })?
            .build();

        let addr = format!("/ip4/127.0.0.1/tcp/{}", port).parse()?;
        swarm.listen_on(addr)?;

        let topic = gossipsub::IdentTopic::new(CONSENSUS_TOPIC);
        swarm.behaviour_mut().gossipsub.subscribe(&topic)?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = swarm.select_next_some() => match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            log::info!("Swarm listening on {address:?}");
                        },
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            log::info!("Connection established with peer: {peer_id}");
                            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                            let _ = event_sender.send(NetworkEvent::PeerConnected(peer_id.to_string())).await;
                        },
                        SwarmEvent::OutgoingConnectionError { error, .. } => {
                            log::warn!("Outgoing connection error: {error:?}");
                        },
                        SwarmEvent::Behaviour(BftBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                            for (peer_id, _multiaddr) in list {
                                log::info!("mDNS discovered a new peer: {peer_id}");
                                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                                let _ = event_sender.send(NetworkEvent::PeerConnected(peer_id.to_string())).await;
                            }
                        },
                        SwarmEvent::Behaviour(BftBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                            for (peer_id, _multiaddr) in list {
                                log::debug!("mDNS peer expired: {peer_id}");
                                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                            }
                        },
                        SwarmEvent::Behaviour(BftBehaviourEvent::Gossipsub(gossipsub::Event::Message { propagation_source, message, .. })) => {
                            match decode_message(&message.data) {
                                Ok(msg) => {
                                    let _ = event_sender.send(NetworkEvent::MessageReceived(msg)).await;
                                }
                                Err(e) => log::warn!("Undecodable message from {propagation_source}: {e}"),
                            }
                        },
                        _ => {}
                    },
                    command = command_receiver.recv() => match command {
                        Some(NetworkCommand::Broadcast(data)) => {
                            let topic = gossipsub::IdentTopic::new(CONSENSUS_TOPIC);
                            if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, data) {
                                match e {
                                    gossipsub::PublishError::Duplicate => {},
                                    _ => log::warn!("Publish error: {e:?}"),
                                }
                            }
                        },
                        Some(NetworkCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr) {
                                log::warn!("Dial error: {e:?}");
                            }
                        },
                        None => break,
                    }
                }
            }
        });

        Ok(Network {
            command_sender,
            event_receiver,
        })
    }

    pub async fn dial(&self, addr: &str) {
        if let Ok(multiaddr) = addr.parse() {
            let _ = self
                .command_sender
                .send(NetworkCommand::Dial(multiaddr))
                .await;
        }
    }

    pub async fn broadcast(&self, message: &ConsensusMessage) {
        match encode_message(message) {
            Ok(data) => {
                let _ = self
                    .command_sender
                    .send(NetworkCommand::Broadcast(data))
                    .await;
            }
            Err(e) => log::error!("Failed to encode consensus message: {}", e),
        }
    }

    pub async fn next_event(&mut self) -> Option<NetworkEvent> {
        self.event_receiver.recv().await
    }
}
