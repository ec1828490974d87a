//! WebSocket push transport with built-in reconnection.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{DisconnectReason, Outbound, PushTransport, TransportLink, TransportSignal};
use crate::api::events::Frame;
use crate::error::{Result, SyncError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Zero means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { delay: Duration::from_millis(1000), max_attempts: 0 }
    }
}

impl ReconnectPolicy {
    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts > self.max_attempts
    }
}

/// Ping after `interval` of silence; give up if nothing arrives within
/// `pong_timeout` of the ping. A zero interval disables pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self { interval: Duration::from_secs(25), pong_timeout: Duration::from_secs(10) }
    }
}

impl KeepAlive {
    pub fn disabled() -> Self {
        Self { interval: Duration::ZERO, pong_timeout: Duration::ZERO }
    }

    fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

pub struct WsTransport {
    url: Url,
    policy: ReconnectPolicy,
    keepalive: KeepAlive,
}

impl WsTransport {
    pub fn new(url: Url, policy: ReconnectPolicy) -> Self {
        Self { url, policy, keepalive: KeepAlive::default() }
    }

    pub fn with_keepalive(mut self, keepalive: KeepAlive) -> Self {
        self.keepalive = keepalive;
        self
    }
}

impl PushTransport for WsTransport {
    fn open(&self, credential: &str, signals: mpsc::UnboundedSender<TransportSignal>) -> TransportLink {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(self.url.clone(), credential.to_string(), self.policy, self.keepalive, signals, rx));
        TransportLink { outbound: tx }
    }
}

async fn establish(url: &Url, credential: &str) -> Result<Socket> {
    log::debug!("opening push socket to {}", url);
    let mut request = url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
        .map_err(|e| SyncError::Transport(format!("invalid credential header: {e}")))?;
    request.headers_mut().insert("Authorization", bearer);
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

async fn run_socket(
    url: Url,
    credential: String,
    policy: ReconnectPolicy,
    keepalive: KeepAlive,
    signals: mpsc::UnboundedSender<TransportSignal>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut attempts: u32 = 0;
    loop {
        match establish(&url, &credential).await {
            Ok(socket) => {
                attempts = 0;
                if signals.send(TransportSignal::Connected).is_err() {
                    return;
                }
                let reason = pump(socket, &signals, &mut outbound, keepalive).await;
                let reconnect = reason.will_reconnect();
                if signals.send(TransportSignal::Disconnected(reason)).is_err() || !reconnect {
                    return;
                }
            }
            Err(e) => {
                if signals.send(TransportSignal::Error(e.to_string())).is_err() {
                    return;
                }
            }
        }

        attempts += 1;
        if policy.exhausted(attempts) {
            log::warn!("giving up on push socket after {} attempts", attempts - 1);
            let _ = signals.send(TransportSignal::Disconnected(DisconnectReason::TransportClosed));
            return;
        }
        if signals.send(TransportSignal::Reconnecting { attempt: attempts }).is_err() {
            return;
        }

        // Frames emitted while disconnected are dropped; acks time out upstream.
        let sleep = tokio::time::sleep(policy.delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                msg = outbound.recv() => match msg {
                    Some(Outbound::Frame(frame)) => log::debug!("dropping `{}` while offline", frame.event),
                    Some(Outbound::Close) | None => return,
                },
            }
        }
    }
}

async fn pump(
    socket: Socket,
    signals: &mpsc::UnboundedSender<TransportSignal>,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    keepalive: KeepAlive,
) -> DisconnectReason {
    let (mut write, mut read) = socket.split();
    let mut idle_deadline = Instant::now() + keepalive.interval;
    // Armed by a ping, cleared by any inbound frame.
    let mut pong_deadline: Option<Instant> = None;
    loop {
        let idle = sleep_until(idle_deadline);
        let pong = sleep_until(pong_deadline.unwrap_or(idle_deadline));
        tokio::select! {
            _ = idle, if keepalive.enabled() && pong_deadline.is_none() => {
                log::debug!("push socket idle for {:?}, pinging", keepalive.interval);
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    return DisconnectReason::TransportError(e.to_string());
                }
                if keepalive.pong_timeout.is_zero() {
                    idle_deadline = Instant::now() + keepalive.interval;
                } else {
                    pong_deadline = Some(Instant::now() + keepalive.pong_timeout);
                }
            }
            _ = pong, if pong_deadline.is_some() => {
                log::warn!("no reply to keepalive ping within {:?}", keepalive.pong_timeout);
                return DisconnectReason::PingTimeout;
            }
            incoming = read.next() => {
                idle_deadline = Instant::now() + keepalive.interval;
                pong_deadline = None;
                match incoming {
                    Some(Ok(Message::Text(text))) => match Frame::parse(&text) {
                        Ok(frame) => {
                            if signals.send(TransportSignal::Frame(frame)).is_err() {
                                let _ = write.send(Message::Close(None)).await;
                                return DisconnectReason::ClientClosed;
                            }
                        }
                        Err(e) => log::warn!("unparseable push frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) => return DisconnectReason::ServerClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return DisconnectReason::TransportError(e.to_string()),
                    None => return DisconnectReason::TransportClosed,
                }
            }
            msg = outbound.recv() => match msg {
                Some(Outbound::Frame(frame)) => {
                    let text = match frame.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("failed to encode `{}`: {e}", frame.event);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        return DisconnectReason::TransportError(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return DisconnectReason::ClientClosed;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_policy_never_exhausts() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(10_000));
    }

    #[test]
    fn capped_policy_allows_exactly_max_attempts() {
        let policy = ReconnectPolicy { delay: Duration::from_millis(10), max_attempts: 3 };
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn reconnect_follows_reason() {
        assert!(DisconnectReason::TransportError("reset".into()).will_reconnect());
        assert!(DisconnectReason::TransportClosed.will_reconnect());
        assert!(!DisconnectReason::ServerClosed.will_reconnect());
        assert!(!DisconnectReason::ClientClosed.will_reconnect());
        assert!(DisconnectReason::PingTimeout.will_reconnect());
        assert!(!DisconnectReason::PingTimeout.is_terminal());
    }

    #[test]
    fn keepalive_can_be_switched_off() {
        assert!(KeepAlive::default().enabled());
        assert!(!KeepAlive::disabled().enabled());
    }

    #[tokio::test]
    async fn unreachable_server_reports_error_then_retries() {
        let url = Url::parse("ws://127.0.0.1:1/socket").unwrap();
        let policy = ReconnectPolicy { delay: Duration::from_millis(50), max_attempts: 1 };
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let _link = WsTransport::new(url, policy).open("token", signal_tx);

        assert!(matches!(signal_rx.recv().await, Some(TransportSignal::Error(_))));
        assert_eq!(signal_rx.recv().await, Some(TransportSignal::Reconnecting { attempt: 1 }));
        assert!(matches!(signal_rx.recv().await, Some(TransportSignal::Error(_))));
        assert_eq!(signal_rx.recv().await, Some(TransportSignal::Disconnected(DisconnectReason::TransportClosed)));
    }
}
