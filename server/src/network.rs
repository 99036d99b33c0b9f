//! Server network layer handling UDP communications and world loop coordination

use crate::client_manager::ClientManager;
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::identity::IdentityProvider;
use crate::registry::ConnectionId;
use crate::store::{EntityStore, ItemCatalog};
use crate::trade::ExecutionTicket;
use crate::world::{Outbound, World};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, TradeId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Largest datagram the receiver accepts
const MAX_DATAGRAM: usize = 65_536;

/// Wire form of one packet.
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    Ok(serialize(packet)?)
}

pub fn decode(data: &[u8]) -> Result<Packet> {
    Ok(deserialize(data)?)
}

/// Messages sent from network and worker tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    /// The entity store finished settling a trade
    TradeExecuted {
        trade_id: TradeId,
        result: Result<()>,
    },
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addrs: Vec<SocketAddr>,
    },
}

/// Main server coordinating networking and the world simulation
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: ClientManager,
    world: World,
    store: Arc<dyn EntityStore>,
    tick_duration: Duration,
    housekeeping_interval: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    /// Binds the socket and loads the item catalog
    ///
    /// The configuration is validated first so a missing secret never gets
    /// as far as opening a port.
    pub async fn new(
        config: ServerConfig,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn EntityStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let catalog = ItemCatalog::new(store.catalog().await?);
        info!("Item catalog loaded with {} items", catalog.len());

        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: ClientManager::new(config.max_clients),
            tick_duration: config.tick_duration(),
            housekeeping_interval: config.housekeeping_interval,
            world: World::new(config, clock, identity, catalog),
            store,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sender that stops [`Server::run`] when given `ServerMessage::Shutdown`.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        match decode(&buffer[0..len]) {
                            Ok(packet) => {
                                if let Err(e) = server_tx
                                    .send(ServerMessage::PacketReceived { packet, addr })
                                {
                                    error!("Failed to send packet to main loop: {}", e);
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropped datagram from {}: {}", addr, e),
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addrs } => {
                        let data = match encode(&packet) {
                            Ok(data) => data,
                            Err(e) => {
                                error!("Failed to serialize {:?}: {}", packet, e);
                                continue;
                            }
                        };
                        for addr in addrs {
                            if let Err(e) = socket.send_to(&data, addr).await {
                                error!("Failed to send packet to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Hands a trade to the entity store on its own task
    fn spawn_trade_execution(&self, ticket: ExecutionTicket) {
        let store = Arc::clone(&self.store);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let trade_id = ticket.trade_id;
            let result = store.execute_trade(ticket.request()).await;
            if let Err(e) = &result {
                info!("Trade {} failed to execute: {}", trade_id, e);
            }
            if let Err(e) = server_tx.send(ServerMessage::TradeExecuted { trade_id, result }) {
                error!("Failed to report trade {} result: {}", trade_id, e);
            }
        });
    }

    fn send_to(&self, connection_ids: &[ConnectionId], packet: Packet) {
        let addrs: Vec<SocketAddr> = connection_ids
            .iter()
            .filter_map(|id| self.clients.addr_of(*id))
            .collect();
        if addrs.is_empty() {
            return;
        }
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addrs }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_to_addr(&self, addr: SocketAddr, packet: Packet) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket {
            packet,
            addrs: vec![addr],
        }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Resolves each packet's delivery target and queues it
    fn dispatch(&self, outbound: Vec<Outbound>) {
        for Outbound { delivery, packet } in outbound {
            let recipients = self.world.recipients(&delivery);
            self.send_to(&recipients, packet);
        }
    }

    fn start_pending_executions(&mut self) {
        for ticket in self.world.take_executions() {
            info!(
                "Executing trade {} between {} and {}",
                ticket.trade_id, ticket.initiator_id, ticket.receiver_id
            );
            self.spawn_trade_execution(ticket);
        }
    }

    /// Routes an incoming packet to the world
    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let identifying = matches!(packet, Packet::Identify { .. });
        let disconnecting = matches!(packet, Packet::Disconnect);

        let connection_id = match self.clients.find_client_by_addr(addr) {
            Some(connection_id) => connection_id,
            None if identifying => match self.clients.add_client(addr) {
                Some(connection_id) => connection_id,
                None => {
                    info!("Refusing {}: server full", addr);
                    self.send_to_addr(
                        addr,
                        Packet::Disconnected {
                            reason: "Server full".to_string(),
                        },
                    );
                    return;
                }
            },
            None => {
                debug!("Ignoring packet from unidentified address {}", addr);
                return;
            }
        };

        let outbound = self.world.handle_packet(connection_id, packet);
        self.dispatch(outbound);

        // A connection only survives identify if it ends up with a session
        let rejected = identifying && self.world.session(connection_id).is_none();
        if rejected || disconnecting {
            self.clients.remove_client(connection_id);
        }

        self.start_pending_executions();
    }

    fn evict_idle(&mut self) {
        let (evicted, outbound) = self.world.evict_idle();
        self.dispatch(outbound);
        for connection_id in evicted {
            self.send_to(
                &[connection_id],
                Packet::Disconnected {
                    reason: "Idle timeout".to_string(),
                },
            );
            self.clients.remove_client(connection_id);
        }
    }

    fn shutdown(&mut self) {
        let connections = self.clients.connection_ids();
        self.send_to(
            &connections,
            Packet::Disconnected {
                reason: "Server shutting down".to_string(),
            },
        );
        for connection_id in connections {
            let outbound = self.world.disconnect(connection_id);
            self.dispatch(outbound);
            self.clients.remove_client(connection_id);
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<()> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut housekeeping = interval(self.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Server started successfully");

        loop {
            tokio::select! {
                // Handle network events and worker results
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::TradeExecuted { trade_id, result }) => {
                            let outbound = self.world.finish_trade(trade_id, result);
                            self.dispatch(outbound);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            self.shutdown();
                            break;
                        }
                    }
                },

                // Advance movement
                _ = tick_interval.tick() => {
                    let outbound = self.world.tick();
                    self.dispatch(outbound);

                    let tick = self.world.tick_count();
                    if tick % 60 == 0 && self.world.session_count() > 0 {
                        debug!(
                            "Tick {}: {} sessions in {} areas, {} connections, {} open trades",
                            tick,
                            self.world.session_count(),
                            self.world.area_count(),
                            self.clients.len(),
                            self.world.trade_count()
                        );
                    }
                },

                // Evict idle sessions
                _ = housekeeping.tick() => {
                    self.evict_idle();
                },
            }
        }

        Ok(())
    }
}
