use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::config::HB_INTERVAL;
use crate::error::Result;

/// Fixed topic line published on every tick.
pub const HB_TOPIC: &str = "HB";

/// Window-based liveness of one heartbeat peer. Observers mark ticks as
/// they arrive; the peer counts as alive while the last tick is younger
/// than the window. Counts are irrelevant, only recency.
#[derive(Clone, Debug)]
pub struct PeerLiveness {
    last_seen: Arc<Mutex<Option<Instant>>>,
    window: Duration,
}

impl PeerLiveness {
    pub fn new(window: Duration) -> Self {
        Self { last_seen: Arc::new(Mutex::new(None)), window }
    }

    pub fn mark_seen(&self) {
        self.mark_seen_at(Instant::now());
    }

    pub fn mark_seen_at(&self, at: Instant) {
        *self.last_seen.lock().expect("PeerLiveness lock poisoned") = Some(at);
    }

    pub fn is_alive(&self) -> bool {
        self.alive_at(Instant::now())
    }

    pub fn alive_at(&self, now: Instant) -> bool {
        self.last_seen
            .lock()
            .expect("PeerLiveness lock poisoned")
            .map_or(false, |seen| now.saturating_duration_since(seen) < self.window)
    }
}

/// Fan-out publisher of `HB` ticks. Every subscriber connection gets its
/// own writer task; a failed write drops the subscriber. Delivery is
/// best-effort, the publisher never waits for anyone.
pub struct HeartbeatPublisher {
    listener: TcpListener,
}

impl HeartbeatPublisher {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("Heartbeat publisher listening on {:?}", self.listener.local_addr().ok());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Heartbeat accept failed: {}", e);
                            continue;
                        }
                    };
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let mut framed = Framed::new(stream, LinesCodec::new());
                        let mut ticker = tokio::time::interval(HB_INTERVAL);
                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = ticker.tick() => {
                                    if framed.send(HB_TOPIC).await.is_err() {
                                        log::debug!("Heartbeat subscriber {} dropped", peer);
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
            }
        }
    }
}

/// Subscribes to one publisher endpoint and keeps `liveness` fresh.
/// Reconnects forever; while the peer is unreachable the liveness window
/// simply expires on its own.
pub async fn run_observer(endpoint: String, liveness: PeerLiveness, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            connected = TcpStream::connect(&endpoint) => {
                if let Ok(stream) = connected {
                    log::debug!("Subscribed to heartbeats at {}", endpoint);
                    let mut framed = Framed::new(stream, LinesCodec::new());
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            line = framed.next() => match line {
                                Some(Ok(line)) if line.starts_with(HB_TOPIC) => liveness.mark_seen(),
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    log::debug!("Heartbeat stream from {} broke: {}", endpoint, e);
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(HB_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_is_dead_until_first_tick() {
        let liveness = PeerLiveness::new(Duration::from_secs(3));
        assert!(!liveness.is_alive());
    }

    #[test]
    fn liveness_window_math() {
        let window = Duration::from_secs(3);
        let liveness = PeerLiveness::new(window);
        let t0 = Instant::now();
        liveness.mark_seen_at(t0);

        assert!(liveness.alive_at(t0));
        assert!(liveness.alive_at(t0 + window - Duration::from_millis(1)));
        assert!(!liveness.alive_at(t0 + window));
        assert!(!liveness.alive_at(t0 + window + Duration::from_secs(10)));
    }

    #[test]
    fn newer_tick_extends_the_window() {
        let window = Duration::from_secs(3);
        let liveness = PeerLiveness::new(window);
        let t0 = Instant::now();
        liveness.mark_seen_at(t0);
        liveness.mark_seen_at(t0 + Duration::from_secs(2));

        assert!(liveness.alive_at(t0 + Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn observer_tracks_a_live_publisher() {
        let publisher = HeartbeatPublisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = publisher.local_addr().unwrap().to_string();

        let shutdown = CancellationToken::new();
        let publisher_stop = shutdown.child_token();
        tokio::spawn(publisher.run(publisher_stop.clone()));

        let liveness = PeerLiveness::new(crate::config::liveness_window());
        tokio::spawn(run_observer(endpoint, liveness.clone(), shutdown.child_token()));

        tokio::time::sleep(HB_INTERVAL / 2).await;
        assert!(liveness.is_alive(), "first tick arrives immediately on connect");

        // Silence the publisher and wait out the window.
        publisher_stop.cancel();
        tokio::time::sleep(crate::config::liveness_window() + HB_INTERVAL).await;
        assert!(!liveness.is_alive());

        shutdown.cancel();
    }
}
