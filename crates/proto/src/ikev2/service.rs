//! The event loop driving an engine over UDP
//!
//! One task owns the socket and the engine: datagrams in, outbox out,
//! timers on a fixed tick. Handlers run inline on this task and suspend
//! for anything slow, so nothing here ever blocks on crypto.

use super::config::EngineConfig;
use super::error::{Error, Result};
use super::exchange::{Engine, FiredTimer};
use super::state::ExchangeHandlers;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Interval between timer sweeps
const TIMER_TICK: Duration = Duration::from_millis(100);

/// UDP front end for one [`Engine`]
///
/// # Example
///
/// ```rust,ignore
/// use keryx_proto::ikev2::{service::IkeService, EngineConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let handlers = MyHandlers::new();
///     let config = EngineConfig::default();
///     let mut service = IkeService::bind(config, handlers, "0.0.0.0:500".parse()?).await?;
///     service.serve().await?;
///     Ok(())
/// }
/// ```
pub struct IkeService<H: ExchangeHandlers> {
    engine: Engine<H>,
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: Vec<u8>,
}

impl<H: ExchangeHandlers> IkeService<H> {
    /// Bind the service to an address
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or the
    /// address cannot be bound.
    pub async fn bind(config: EngineConfig, handlers: H, addr: SocketAddr) -> Result<Self> {
        config.validate()?;

        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let local_addr = socket.local_addr().map_err(|e| Error::Io(e.to_string()))?;

        info!(addr = %local_addr, "IKE service listening");

        Ok(IkeService {
            engine: Engine::new(config, handlers),
            socket,
            local_addr,
            recv_buffer: vec![0u8; 65536],
        })
    }

    /// Bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The engine, for SA inspection and initiation
    pub fn engine(&self) -> &Engine<H> {
        &self.engine
    }

    /// Mutable engine access
    pub fn engine_mut(&mut self) -> &mut Engine<H> {
        &mut self.engine
    }

    /// Send every queued datagram
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure; queued messages past the
    /// failing one stay lost, the peers will retransmit.
    pub async fn flush_outbox(&mut self) -> Result<()> {
        for (peer, datagram) in self.engine.take_outbox() {
            self.socket
                .send_to(&datagram, peer)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// One receive-process-flush step; used by tests and embedders with
    /// their own loop
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure.
    pub async fn step(&mut self) -> Result<()> {
        let (len, sender) = self
            .socket
            .recv_from(&mut self.recv_buffer)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let datagram = self.recv_buffer[..len].to_vec();
        self.engine.process_packet(&datagram, sender);
        self.flush_outbox().await
    }

    /// Drive the engine until the task is cancelled
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure.
    pub async fn serve(&mut self) -> Result<()> {
        let mut tick = tokio::time::interval(TIMER_TICK);
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut self.recv_buffer) => {
                    let (len, sender) = received.map_err(|e| Error::Io(e.to_string()))?;
                    let datagram = self.recv_buffer[..len].to_vec();
                    self.engine.process_packet(&datagram, sender);
                }
                _ = tick.tick() => {
                    let fired = self.engine.poll_timers(Instant::now());
                    self.note_fired(&fired);
                }
            }
            self.flush_outbox().await?;
        }
    }

    fn note_fired(&self, fired: &[FiredTimer]) {
        for timer in fired {
            debug!(sa = %timer.serial, kind = ?timer.kind, "timer fired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::exchange::SaActions;
    use crate::ikev2::payload::MessageDigest;
    use crate::ikev2::state::{HandlerId, TransitionResult};

    struct DropAll;

    impl ExchangeHandlers for DropAll {
        fn handle(
            &mut self,
            _id: HandlerId,
            _actions: &mut SaActions<'_>,
            _md: Option<&MessageDigest>,
        ) -> TransitionResult {
            TransitionResult::Ignore
        }
    }

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let service = IkeService::bind(
            EngineConfig::default(),
            DropAll,
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .expect("bind failed");
        assert_ne!(service.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_step_feeds_engine() {
        let mut service = IkeService::bind(
            EngineConfig::default(),
            DropAll,
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        let target = service.local_addr();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Garbage datagram: counted, dropped, nothing sent back.
        sender.send_to(&[0u8; 10], target).await.unwrap();

        service.step().await.unwrap();
        assert_eq!(service.engine().metrics().snapshot().early_drops, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.window_size = 2;
        let result =
            IkeService::bind(config, DropAll, "127.0.0.1:0".parse().unwrap()).await;
        assert!(result.is_err());
    }
}
