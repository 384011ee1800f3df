//! Broker client: connection establishment, the session driver task,
//! and the command handle the rest of the application talks through.
//!
//! [`FqClient::connect`] performs the first handshake inline so startup
//! failures surface to the caller, then hands the session to a spawned
//! driver that pumps both channels, forwards commands, and reconnects
//! with backoff when the broker goes away. Consumers observe the
//! session only through the [`FqEvent`] stream; after a reconnect the
//! driver emits a fresh `AuthResult(true)` so they can re-issue their
//! bindings.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::lookup_host;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::backoff::Backoff;
use crate::error::FqError;
use crate::event::FqEvent;
use crate::wire::{self, CmdFrame};

const CMD_CHANNEL_CAPACITY: usize = 16;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const FRAME_CHANNEL_CAPACITY: usize = 32;
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Connection credentials for one broker.
#[derive(Debug, Clone)]
pub struct Creds {
    pub host: String,
    pub port: u16,
    pub source: String,
    pub password: String,
}

#[derive(Debug)]
enum Command {
    SetHeartbeatInterval(u16),
    BindRequest {
        exchange: String,
        program: String,
        peer_mode: bool,
    },
    StatusRequest,
}

/// Cloneable handle for issuing commands on an established session.
///
/// Commands are queued to the driver task; a send only fails once the
/// driver has shut down, reported as [`FqError::Closed`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    /// Asks the broker for heartbeats every `interval_ms` and starts
    /// sending our own at the same cadence.
    pub async fn set_heartbeat_interval(&self, interval_ms: u16) -> Result<(), FqError> {
        self.send(Command::SetHeartbeatInterval(interval_ms)).await
    }

    pub async fn send_bind_request(
        &self,
        exchange: &str,
        program: &str,
        peer_mode: bool,
    ) -> Result<(), FqError> {
        self.send(Command::BindRequest {
            exchange: exchange.to_owned(),
            program: program.to_owned(),
            peer_mode,
        })
        .await
    }

    pub async fn send_status_request(&self) -> Result<(), FqError> {
        self.send(Command::StatusRequest).await
    }

    async fn send(&self, command: Command) -> Result<(), FqError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| FqError::Closed)
    }
}

/// Entry point for opening a broker session.
pub struct FqClient;

impl FqClient {
    /// Resolves the broker, performs the initial handshake, and spawns
    /// the session driver.
    ///
    /// Resolution failures, connect failures, and a session key already
    /// in use are returned as errors. A credential rejection is NOT an
    /// error here: the driver reports it as `FqEvent::AuthResult(false)`
    /// and holds the session in a terminal state until cancelled.
    pub async fn connect(
        creds: Creds,
        cancel: CancellationToken,
    ) -> Result<(ClientHandle, mpsc::Receiver<FqEvent>), FqError> {
        let addr = resolve(&creds.host, creds.port).await?;
        let first = Handshake::establish(addr, &creds).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let driver = Driver {
            label: format!("{}:{}", creds.host, creds.port),
            creds,
            addr,
            cancel,
            cmd_rx,
            event_tx,
            backoff: Backoff::default(),
            heartbeat: None,
        };
        tokio::spawn(driver.run(first));
        Ok((ClientHandle { cmd_tx }, event_rx))
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, FqError> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|source| FqError::Resolution {
            host: host.to_owned(),
            source,
        })?;
    addrs.next().ok_or_else(|| FqError::Resolution {
        host: host.to_owned(),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "hostname resolved to no addresses",
        ),
    })
}

/// An authenticated pair of broker connections.
struct Session {
    cmd: TcpStream,
    data: TcpStream,
}

/// Outcome of one handshake attempt that reached the broker.
enum Handshake {
    Accepted(Session),
    Rejected(String),
}

impl Handshake {
    async fn establish(addr: SocketAddr, creds: &Creds) -> Result<Self, FqError> {
        let mut cmd = TcpStream::connect(addr).await?;
        cmd.write_all(&wire::mode_preamble(wire::CMD_MODE)).await?;
        cmd.write_all(&wire::auth_plain(&creds.source, &creds.password)?)
            .await?;

        match wire::read_cmd_frame(&mut cmd).await? {
            CmdFrame::AuthResp(key) => {
                let data = attach_data_channel(addr, &key).await?;
                Ok(Handshake::Accepted(Session { cmd, data }))
            }
            CmdFrame::Error(reason) if reason.to_ascii_lowercase().contains("in use") => {
                Err(FqError::SessionInUse(reason))
            }
            CmdFrame::Error(reason) => Ok(Handshake::Rejected(reason)),
            other => Err(FqError::Protocol(format!(
                "unexpected frame during handshake: {other:?}"
            ))),
        }
    }
}

async fn attach_data_channel(addr: SocketAddr, key: &Bytes) -> Result<TcpStream, FqError> {
    let mut data = TcpStream::connect(addr).await?;
    data.write_all(&wire::mode_preamble(wire::DATA_MODE)).await?;
    data.write_all(&wire::data_attach(key)?).await?;
    Ok(data)
}

enum Pump {
    Shutdown,
    Lost(FqError),
}

struct Driver {
    label: String,
    creds: Creds,
    addr: SocketAddr,
    cancel: CancellationToken,
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<FqEvent>,
    backoff: Backoff,
    heartbeat: Option<Interval>,
}

impl Driver {
    async fn run(mut self, first: Handshake) {
        let mut next = Some(first);
        loop {
            let handshake = match next.take() {
                Some(handshake) => handshake,
                None => match self.reconnect().await {
                    Some(handshake) => handshake,
                    None => return,
                },
            };

            match handshake {
                Handshake::Rejected(reason) => {
                    warn!(broker = %self.label, %reason, "broker rejected credentials");
                    let _ = self.event_tx.send(FqEvent::AuthResult(false)).await;
                    self.cancel.cancelled().await;
                    return;
                }
                Handshake::Accepted(session) => {
                    if self.event_tx.send(FqEvent::AuthResult(true)).await.is_err() {
                        return;
                    }
                    self.backoff.reset();
                    match self.pump(session).await {
                        Pump::Shutdown => return,
                        Pump::Lost(error) => {
                            warn!(broker = %self.label, %error, "session lost");
                        }
                    }
                }
            }
        }
    }

    /// Waits out the backoff delay, then retries the handshake until it
    /// reaches the broker or the token is cancelled.
    async fn reconnect(&mut self) -> Option<Handshake> {
        loop {
            let delay = self.backoff.next_delay();
            debug!(
                broker = %self.label,
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.attempt(),
                "reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match Handshake::establish(self.addr, &self.creds).await {
                Ok(handshake) => return Some(handshake),
                Err(error) => {
                    warn!(broker = %self.label, %error, "reconnect attempt failed");
                }
            }
        }
    }

    async fn pump(&mut self, session: Session) -> Pump {
        let Session { cmd, data } = session;
        let (cmd_rd, mut cmd_wr) = cmd.into_split();

        // Frame reads are not cancellation safe, so each channel gets a
        // dedicated reader task and the select loop drains queues.
        let (frame_tx, mut frames) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let frame_reader = tokio::spawn(read_cmd_frames(cmd_rd, frame_tx));
        let (message_tx, mut messages) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let message_reader = tokio::spawn(read_data_messages(data, message_tx));

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Pump::Shutdown,
                command = self.cmd_rx.recv() => match command {
                    Some(command) => {
                        if let Err(error) = self.write_command(&mut cmd_wr, command).await {
                            break Pump::Lost(error);
                        }
                    }
                    None => break Pump::Shutdown,
                },
                frame = frames.recv() => match frame {
                    Some(Ok(frame)) => {
                        if !self.dispatch_frame(frame).await {
                            break Pump::Shutdown;
                        }
                    }
                    Some(Err(error)) => break Pump::Lost(error),
                    None => break Pump::Lost(FqError::Closed),
                },
                message = messages.recv() => match message {
                    Some(Ok(payload)) => {
                        if self.event_tx.send(FqEvent::Message(payload)).await.is_err() {
                            break Pump::Shutdown;
                        }
                    }
                    Some(Err(error)) => break Pump::Lost(error),
                    None => break Pump::Lost(FqError::Closed),
                },
                _ = heartbeat_tick(&mut self.heartbeat) => {
                    if let Err(error) = cmd_wr.write_all(&wire::heartbeat()).await {
                        break Pump::Lost(error.into());
                    }
                }
            }
        };

        frame_reader.abort();
        message_reader.abort();
        outcome
    }

    async fn write_command(
        &mut self,
        wr: &mut (impl AsyncWriteExt + Unpin),
        command: Command,
    ) -> Result<(), FqError> {
        let frame = match command {
            Command::SetHeartbeatInterval(interval_ms) => {
                let period = Duration::from_millis(interval_ms as u64);
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(ticker);
                wire::heartbeat_request(interval_ms)
            }
            Command::BindRequest {
                exchange,
                program,
                peer_mode,
            } => wire::bind_request(&exchange, &program, peer_mode)?,
            Command::StatusRequest => wire::status_request(),
        };
        wr.write_all(&frame).await?;
        Ok(())
    }

    /// Turns a broker frame into an event. Returns false when the event
    /// receiver is gone and the driver should shut down.
    async fn dispatch_frame(&mut self, frame: CmdFrame) -> bool {
        match frame {
            CmdFrame::Status(counters) => self
                .event_tx
                .send(FqEvent::StatusReport {
                    at: SystemTime::now(),
                    counters,
                })
                .await
                .is_ok(),
            CmdFrame::Heartbeat => {
                trace!(broker = %self.label, "heartbeat");
                true
            }
            CmdFrame::Bind(route) => {
                debug!(broker = %self.label, route, "bind acknowledged");
                true
            }
            CmdFrame::AuthResp(_) | CmdFrame::Error(_) => {
                warn!(broker = %self.label, ?frame, "unexpected frame mid-session");
                true
            }
        }
    }
}

// The ticker keeps its own deadlines, so heartbeats stay on schedule no
// matter how often the surrounding select loop wakes for other work.
async fn heartbeat_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn read_cmd_frames(
    mut rd: OwnedReadHalf,
    tx: mpsc::Sender<Result<CmdFrame, FqError>>,
) {
    loop {
        let frame = wire::read_cmd_frame(&mut rd).await;
        let failed = frame.is_err();
        if tx.send(frame).await.is_err() || failed {
            return;
        }
    }
}

async fn read_data_messages(mut stream: TcpStream, tx: mpsc::Sender<Result<Bytes, FqError>>) {
    loop {
        let message = wire::read_data_message(&mut stream)
            .await
            .map(|(_route, payload)| payload);
        let failed = message.is_err();
        if tx.send(message).await.is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ClientCmd;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn creds_for(addr: SocketAddr) -> Creds {
        Creds {
            host: addr.ip().to_string(),
            port: addr.port(),
            source: "relay".into(),
            password: "secret".into(),
        }
    }

    async fn expect_preamble(stream: &mut TcpStream, mode: u32) {
        let got = stream.read_u32().await.unwrap();
        assert_eq!(got, mode);
    }

    /// Runs the broker side of the handshake: accepts both channels,
    /// checks the auth command, and hands back the live streams.
    async fn accept_session(listener: &TcpListener, key: &[u8]) -> (TcpStream, TcpStream) {
        let (mut cmd, _) = listener.accept().await.unwrap();
        expect_preamble(&mut cmd, wire::CMD_MODE).await;
        match wire::read_client_command(&mut cmd).await.unwrap() {
            ClientCmd::Auth { source, password } => {
                assert_eq!(source, "relay");
                assert_eq!(password, "secret");
            }
            other => panic!("expected auth, got {other:?}"),
        }
        cmd.write_all(&wire::auth_response(key)).await.unwrap();

        let (mut data, _) = listener.accept().await.unwrap();
        expect_preamble(&mut data, wire::DATA_MODE).await;
        let klen = data.read_u16().await.unwrap() as usize;
        let mut attached = vec![0u8; klen];
        data.read_exact(&mut attached).await.unwrap();
        assert_eq!(attached, key);

        (cmd, data)
    }

    #[tokio::test]
    async fn session_delivers_status_and_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let broker = tokio::spawn(async move {
            let (mut cmd, mut data) = accept_session(&listener, b"key-1").await;

            match wire::read_client_command(&mut cmd).await.unwrap() {
                ClientCmd::HeartbeatRequest(interval) => assert_eq!(interval, 500),
                other => panic!("expected heartbeat request, got {other:?}"),
            }
            match wire::read_client_command(&mut cmd).await.unwrap() {
                ClientCmd::Bind {
                    exchange,
                    program,
                    peer_mode,
                } => {
                    assert_eq!(exchange, "logging");
                    assert_eq!(program, "prefix:\"scribe.\"");
                    assert!(!peer_mode);
                }
                other => panic!("expected bind, got {other:?}"),
            }
            cmd.write_all(&wire::bind_ack(7)).await.unwrap();

            cmd.write_all(&wire::status_report(&[("no_route", 2)]))
                .await
                .unwrap();
            data.write_all(&wire::data_message("scribe.span", b"hello"))
                .await
                .unwrap();

            // keep the connections open until the client is done
            let _ = cmd.read_u8().await;
        });

        let (handle, mut events) = FqClient::connect(creds_for(addr), cancel.clone())
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            FqEvent::AuthResult(true)
        ));

        handle.set_heartbeat_interval(500).await.unwrap();
        handle
            .send_bind_request("logging", "prefix:\"scribe.\"", false)
            .await
            .unwrap();

        let mut saw_status = false;
        let mut saw_message = false;
        for _ in 0..2 {
            match events.recv().await.unwrap() {
                FqEvent::StatusReport { counters, .. } => {
                    assert_eq!(counters["no_route"], 2);
                    saw_status = true;
                }
                FqEvent::Message(payload) => {
                    assert_eq!(&payload[..], b"hello");
                    saw_message = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_status && saw_message);

        cancel.cancel();
        broker.abort();
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_auth_failure_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let broker = tokio::spawn(async move {
            let (mut cmd, _) = listener.accept().await.unwrap();
            expect_preamble(&mut cmd, wire::CMD_MODE).await;
            let _ = wire::read_client_command(&mut cmd).await.unwrap();
            cmd.write_all(&wire::error_frame("unknown source")).await.unwrap();
            let _ = cmd.read_u8().await;
        });

        let (_handle, mut events) = FqClient::connect(creds_for(addr), cancel.clone())
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            FqEvent::AuthResult(false)
        ));

        cancel.cancel();
        broker.abort();
    }

    #[tokio::test]
    async fn session_key_in_use_fails_the_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let (mut cmd, _) = listener.accept().await.unwrap();
            expect_preamble(&mut cmd, wire::CMD_MODE).await;
            let _ = wire::read_client_command(&mut cmd).await.unwrap();
            cmd.write_all(&wire::error_frame("source already in use"))
                .await
                .unwrap();
            let _ = cmd.read_u8().await;
        });

        let err = FqClient::connect(creds_for(addr), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FqError::SessionInUse(_)));
        broker.abort();
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_resolution_error() {
        let creds = Creds {
            host: "broker.does-not-exist.invalid".into(),
            port: 8765,
            source: "relay".into(),
            password: "secret".into(),
        };
        let err = FqClient::connect(creds, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FqError::Resolution { .. }));
    }

    #[tokio::test]
    async fn heartbeats_keep_flowing_under_steady_traffic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let (hb_tx, mut heartbeats_seen) = mpsc::channel(64);

        let broker = tokio::spawn(async move {
            let (mut cmd, mut data) = accept_session(&listener, b"key-1").await;
            match wire::read_client_command(&mut cmd).await.unwrap() {
                ClientCmd::HeartbeatRequest(interval) => assert_eq!(interval, 100),
                other => panic!("expected heartbeat request, got {other:?}"),
            }

            // flood the data channel faster than the heartbeat cadence
            let writer = tokio::spawn(async move {
                loop {
                    if data
                        .write_all(&wire::data_message("scribe.span", b"m"))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            });

            loop {
                match wire::read_client_command(&mut cmd).await {
                    Ok(ClientCmd::Heartbeat) => {
                        if hb_tx.send(()).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            writer.abort();
        });

        let (handle, mut events) = FqClient::connect(creds_for(addr), cancel.clone())
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            FqEvent::AuthResult(true)
        ));
        handle.set_heartbeat_interval(100).await.unwrap();

        let deadline = tokio::time::sleep(Duration::from_millis(600));
        tokio::pin!(deadline);
        let mut heartbeats = 0u32;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                beat = heartbeats_seen.recv() => {
                    if beat.is_some() {
                        heartbeats += 1;
                    }
                }
                _ = events.recv() => {}
            }
        }

        assert!(
            heartbeats >= 3,
            "only {heartbeats} heartbeats while the data channel was busy"
        );
        cancel.cancel();
        broker.abort();
    }

    #[tokio::test]
    async fn driver_reconnects_after_the_broker_drops_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let broker = tokio::spawn(async move {
            let (cmd, data) = accept_session(&listener, b"key-1").await;
            drop(cmd);
            drop(data);

            let (mut cmd, _data) = accept_session(&listener, b"key-2").await;
            let _ = cmd.read_u8().await;
        });

        let (_handle, mut events) = FqClient::connect(creds_for(addr), cancel.clone())
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            FqEvent::AuthResult(true)
        ));
        // second auth event arrives after the backoff delay
        assert!(matches!(
            events.recv().await.unwrap(),
            FqEvent::AuthResult(true)
        ));

        cancel.cancel();
        broker.abort();
    }
}
