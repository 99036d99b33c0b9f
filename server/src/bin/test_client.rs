//! Headless client that identifies, wanders around and chats.
//!
//! Useful for poking a running server without the game client:
//!
//! ```text
//! PLAZA_AUTH_SECRET=dev cargo run --bin test_client -- --player-id 7 --username sam
//! ```

use bincode::{deserialize, serialize};
use clap::Parser;
use rand::Rng;
use server::config::AUTH_SECRET_ENV;
use server::identity::{Claims, TokenVerifier};
use shared::{Packet, Vector2, HOME_SPAWN};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,
    /// Pre-issued identity token; signed locally from the secret if absent
    #[clap(long)]
    token: Option<String>,
    #[clap(long, env = AUTH_SECRET_ENV, hide_env_values = true)]
    secret: Option<String>,
    #[clap(long, default_value = "1")]
    player_id: u64,
    #[clap(long, default_value = "tester")]
    username: String,
    /// Number of random walks to request
    #[clap(long, default_value = "10")]
    walks: u32,
}

impl Args {
    fn token(&self) -> Result<String, Box<dyn std::error::Error>> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        let secret = self
            .secret
            .clone()
            .ok_or("either --token or an auth secret is required")?;
        let verifier = TokenVerifier::new(secret)?;
        Ok(verifier.sign(&Claims {
            player_id: self.player_id,
            username: self.username.clone(),
            role: "user".to_string(),
        }))
    }
}

async fn send(
    socket: &UdpSocket,
    server: SocketAddr,
    packet: &Packet,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = serialize(packet)?;
    socket.send_to(&data, server).await?;
    Ok(())
}

/// Prints everything that arrives within `window`.
async fn drain(socket: &UdpSocket, buf: &mut [u8], window: Duration) {
    while let Ok(Ok((len, _))) = timeout(window, socket.recv_from(buf)).await {
        match deserialize::<Packet>(&buf[..len]) {
            Ok(Packet::PlayersMoved { tick, moves }) => {
                for m in moves {
                    println!(
                        "  tick {}: player {} at ({:.1}, {:.1}) {:?} {:?}",
                        tick, m.player_id, m.position.x, m.position.y, m.direction, m.motion
                    );
                }
            }
            Ok(other) => println!("Received: {:?}", other),
            Err(e) => println!("Failed to deserialize packet: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let token = args.token()?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    println!("Identifying with {}", args.server);
    send(
        &socket,
        args.server,
        &Packet::Identify {
            token,
            area: None,
            collision: vec![],
        },
    )
    .await?;

    let mut buf = vec![0u8; 65_536];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await??;
    match deserialize::<Packet>(&buf[..len])? {
        Packet::IdentifyOk { player } => {
            println!(
                "Identified as {} ({}) in '{}'",
                player.username, player.player_id, player.area
            );
        }
        other => {
            println!("Identify failed: {:?}", other);
            return Ok(());
        }
    }

    let mut rng = rand::thread_rng();
    for i in 0..args.walks {
        let target = Vector2::new(
            HOME_SPAWN.x + rng.gen_range(-150.0..150.0),
            HOME_SPAWN.y + rng.gen_range(-150.0..150.0),
        );
        println!("Walk {} to ({:.1}, {:.1})", i + 1, target.x, target.y);
        send(&socket, args.server, &Packet::MoveTo { x: target.x, y: target.y }).await?;

        if rng.gen_bool(0.3) {
            let message = format!("hello from {} ({})", args.username, i);
            send(&socket, args.server, &Packet::Chat { message }).await?;
        }

        drain(&socket, &mut buf, Duration::from_millis(250)).await;
    }

    send(&socket, args.server, &Packet::Disconnect).await?;
    println!("Disconnected");
    Ok(())
}
