mod messages;

use clap::Parser;
use futures::{Sink, SinkExt, StreamExt};
use messages::{random_frame, reply_to, ClientFrame, Frame};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Push-channel simulator: serves random fleet notifications over WebSocket.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    /// Address to accept WebSocket clients on
    #[arg(long, env = "SIM_ADDR", default_value = "127.0.0.1:8001")]
    addr: SocketAddr,

    /// Notifications per second
    #[arg(long, env = "RATE", default_value_t = 2)]
    rate: u64,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Share of frames with a type clients do not know
    #[arg(long, env = "UNKNOWN_RATIO", default_value_t = 0.05, value_parser = parse_ratio)]
    unknown_ratio: f64,
}

fn parse_ratio(s: &str) -> Result<f64, String> {
    let ratio: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if !(0.0..=1.0).contains(&ratio) {
        return Err(format!("{} is not between 0 and 1", s));
    }
    Ok(ratio)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting push simulator");
    info!(
        "Listening on {}, Rate: {} msg/s, Devices: {}",
        args.addr, args.rate, args.devices
    );

    let listener = match TcpListener::bind(args.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", args.addr, e);
            std::process::exit(1);
        }
    };

    let (tx, _) = broadcast::channel::<String>(1024);

    let publisher = tx.clone();
    tokio::spawn(async move {
        publish(publisher, args.rate, args.devices, args.unknown_ratio).await;
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let rx = tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, peer, rx).await;
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }
}

async fn publish(tx: broadcast::Sender<String>, rate: u64, num_devices: usize, unknown_ratio: f64) {
    let period = Duration::from_secs_f64(1.0 / rate.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    let mut counter = 0u64;

    loop {
        ticker.tick().await;
        let frame = {
            let mut rng = rand::thread_rng();
            random_frame(&mut rng, num_devices, unknown_ratio)
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize frame: {}", e);
                continue;
            }
        };

        // No receivers just means no clients yet
        if tx.send(text).is_ok() {
            counter += 1;
            if counter % 100 == 0 {
                info!("Published {} notifications", counter);
            }
        }
    }
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<String>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    info!("Client connected: {}", peer);
    let (mut sink, mut stream) = ws.split();

    if send_frame(&mut sink, &Frame::new("connected", serde_json::json!({}))).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => {
                            debug!("{} sent {}", peer, frame.kind);
                            if let Some(reply) = reply_to(&frame) {
                                if send_frame(&mut sink, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!("Unparseable frame from {}: {}", peer, e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection error from {}: {}", peer, e);
                    break;
                }
            },
            outgoing = rx.recv() => match outgoing {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Client {} lagged, skipped {} notifications", peer, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Client disconnected: {}", peer);
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|e| error!("Failed to serialize frame: {}", e))?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_ratio_must_be_a_share() {
        for bad in ["nan", "inf", "-0.1", "1.5", "lots"] {
            assert!(
                Args::try_parse_from(["simulator", "--unknown-ratio", bad]).is_err(),
                "accepted {}",
                bad
            );
        }

        let args = Args::try_parse_from(["simulator", "--unknown-ratio", "0.5"]).unwrap();
        assert_eq!(args.unknown_ratio, 0.5);
        let args = Args::try_parse_from(["simulator", "--unknown-ratio", "1"]).unwrap();
        assert_eq!(args.unknown_ratio, 1.0);
    }
}
