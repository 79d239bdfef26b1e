use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use bytes::Buf;
use tokio::select;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::session::events::SessionEvent;
use crate::session::shared::SessionShared;
use crate::wire::endpoint::{PeerEndpoint, PAIRING_DATAGRAM_LEN};
use crate::wire::message_id::MessageId;
use crate::wire::MAX_DATAGRAM_SIZE;

/// Outcome of the establishment phases.
pub(crate) enum Established {
    /// a partner is known (directly or through the relay) - enter steady state
    Ready,
    /// the attempt ended regularly without a partner (noHost, cancellation, failure) -
    ///  the engine has nothing more to do
    Finished,
}

enum Phase<T> {
    Done(T),
    TimedOut,
    SendFailed,
    Cancelled,
}

/// The host path: server handshake, advertise via `startHost`, then poll with `checkHost`
///  until the server reveals a joiner, and attempt the punch towards it.
pub(crate) async fn establish_host(shared: &SessionShared) -> Established {
    match connect_to_server(shared).await {
        Some(()) => {}
        None => return Established::Finished,
    }

    let confirmed = request_from_server(shared, MessageId::StartHost, |data| {
        (first_word(data) == Some(MessageId::StartHost as u32)).then_some(())
    })
    .await;
    match confirmed {
        Phase::Done(()) => {}
        Phase::TimedOut => {
            warn!("server did not confirm hosting within the timeout");
            shared.emit(SessionEvent::TimedOut).await;
            return Established::Finished;
        }
        Phase::SendFailed => {
            shared.emit(SessionEvent::ConnectionFailed).await;
            return Established::Finished;
        }
        Phase::Cancelled => return Established::Finished,
    }
    shared.emit(SessionEvent::HostWaiting).await;

    let joiner = match await_joiner(shared).await {
        Some(addr) => addr,
        None => return Established::Finished,
    };

    hole_punch(shared, joiner).await;
    shared.emit(SessionEvent::FoundClient).await;
    Established::Ready
}

/// The joiner path: server handshake, `requestHost`, then either `noHost` ends the attempt
///  or the pairing reply reveals the host to punch towards.
pub(crate) async fn establish_joiner(shared: &SessionShared) -> Established {
    match connect_to_server(shared).await {
        Some(()) => {}
        None => return Established::Finished,
    }

    let reply = request_from_server(shared, MessageId::RequestHost, |data| {
        match first_word(data) {
            Some(w) if w == MessageId::NoHost as u32 => Some(JoinReply::NoHost),
            Some(w) if w == MessageId::FoundHost as u32 && data.len() == PAIRING_DATAGRAM_LEN => {
                let mut parse = &data[4..];
                PeerEndpoint::try_deser_pairing(&mut parse).ok().map(JoinReply::Found)
            }
            _ => None,
        }
    })
    .await;

    let host = match reply {
        Phase::Done(JoinReply::NoHost) => {
            info!("no host waiting on the server");
            shared.emit(SessionEvent::NoHost).await;
            return Established::Finished;
        }
        Phase::Done(JoinReply::Found(endpoint)) => {
            shared.emit(SessionEvent::FoundHost).await;
            endpoint.to_socket_addr()
        }
        Phase::TimedOut => {
            warn!("server did not answer the host request within the timeout");
            shared.emit(SessionEvent::TimedOut).await;
            return Established::Finished;
        }
        Phase::SendFailed => {
            shared.emit(SessionEvent::ConnectionFailed).await;
            return Established::Finished;
        }
        Phase::Cancelled => return Established::Finished,
    };

    hole_punch(shared, host).await;
    Established::Ready
}

enum JoinReply {
    NoHost,
    Found(PeerEndpoint),
}

/// Stage one: `connect` until anything at all echoes back from the server. Emits
///  `ConnectionFailed` on timeout or send failure.
async fn connect_to_server(shared: &SessionShared) -> Option<()> {
    match request_from_server(shared, MessageId::Connect, |_| Some(())).await {
        Phase::Done(()) => {
            info!("connected to rendezvous server {}", shared.server_addr);
            shared.emit(SessionEvent::ConnectedToServer).await;
            Some(())
        }
        Phase::TimedOut => {
            warn!("rendezvous server {} did not answer", shared.server_addr);
            shared.emit(SessionEvent::ConnectionFailed).await;
            None
        }
        Phase::SendFailed => {
            shared.emit(SessionEvent::ConnectionFailed).await;
            None
        }
        Phase::Cancelled => None,
    }
}

/// Send `request` to the server, re-sending on every retry interval, until `accept` likes a
///  reply datagram or the overall handshake timeout passes.
async fn request_from_server<T>(
    shared: &SessionShared,
    request: MessageId,
    mut accept: impl FnMut(&[u8]) -> Option<T>,
) -> Phase<T> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let deadline = Instant::now() + shared.config.handshake_timeout;
    let mut next_retry = Instant::now() + shared.config.handshake_retry_interval;

    if let Err(e) = shared.send_message(request, shared.server_addr).await {
        error!("failed to send {:?} to server: {}", request, e);
        return Phase::SendFailed;
    }

    loop {
        select! {
            received = shared.socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, _)) => {
                        if let Some(result) = accept(&buf[..len]) {
                            return Phase::Done(result);
                        }
                    }
                    Err(e) => {
                        error!("socket error: {}", e);
                    }
                }
            }
            _ = sleep_until(next_retry) => {
                if Instant::now() >= deadline {
                    return Phase::TimedOut;
                }
                if let Err(e) = shared.send_message(request, shared.server_addr).await {
                    error!("failed to re-send {:?} to server: {}", request, e);
                    return Phase::SendFailed;
                }
                next_retry += shared.config.handshake_retry_interval;
            }
            _ = shared.shutdown_notify.notified() => {
                debug!("establishment cancelled");
                return Phase::Cancelled;
            }
        }
    }
}

/// A confirmed host waits indefinitely for a joiner, nudging the server with `checkHost` so
///  a lost pairing notification gets re-sent. `None` on cancellation.
async fn await_joiner(shared: &SessionShared) -> Option<SocketAddr> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut next_check = Instant::now() + shared.config.handshake_retry_interval;

    loop {
        select! {
            received = shared.socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, _)) if len == PAIRING_DATAGRAM_LEN => {
                        if first_word(&buf[..len]) == Some(MessageId::RequestHost as u32) {
                            let mut parse = &buf[4..len];
                            if let Ok(endpoint) = PeerEndpoint::try_deser_pairing(&mut parse) {
                                info!("server paired us with joiner {:?}", endpoint);
                                return Some(endpoint.to_socket_addr());
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("socket error: {}", e);
                    }
                }
            }
            _ = sleep_until(next_check) => {
                if let Err(e) = shared.send_message(MessageId::CheckHost, shared.server_addr).await {
                    error!("failed to send checkHost: {}", e);
                }
                next_check += shared.config.handshake_retry_interval;
            }
            _ = shared.shutdown_notify.notified() => {
                debug!("host waiting cancelled");
                return None;
            }
        }
    }
}

/// Both sides fire `connect` datagrams at the endpoint the server revealed, hoping their
///  NATs open a transient mapping. A received `connect` is answered with `ping`; a received
///  `ping` proves the path works in both directions. On timeout the session silently stays
///  on the relay path - the application sees no difference.
async fn hole_punch(shared: &SessionShared, peer: SocketAddr) {
    *shared.partner_addr.write().await = Some(peer);

    info!("attempting hole punch towards {}", peer);
    for _ in 0..2 {
        if shared.send_message(MessageId::Connect, peer).await.is_err() {
            return;
        }
    }

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut deadline = Instant::now() + shared.config.hole_punch_deadline;
    let mut next_send = Instant::now() + shared.config.hole_punch_send_interval;

    loop {
        select! {
            received = shared.socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                };
                match first_word(&buf[..len]) {
                    Some(w) if w == MessageId::Connect as u32 => {
                        // the peer's datagrams may leave its NAT on a different port than
                        //  the server observed - adopt what actually arrives
                        *shared.partner_addr.write().await = Some(from);
                        if let Err(e) = shared.send_message(MessageId::Ping, from).await {
                            error!("failed to answer hole-punch connect: {}", e);
                        }
                        deadline += shared.config.hole_punch_deadline;
                    }
                    Some(w) if w == MessageId::Ping as u32 => {
                        shared.p2p.store(true, Ordering::Release);
                        let _ = shared.send_message(MessageId::HolePunched, shared.server_addr).await;
                        info!("peer-to-peer connection established with {}", from);
                        return;
                    }
                    _ => {}
                }
            }
            _ = sleep_until(next_send) => {
                let peer = (*shared.partner_addr.read().await).unwrap_or(peer);
                if shared.send_message(MessageId::Connect, peer).await.is_err() {
                    break;
                }
                next_send += shared.config.hole_punch_send_interval;
            }
            _ = sleep_until(deadline) => {
                break;
            }
            _ = shared.shutdown_notify.notified() => {
                return;
            }
        }
    }

    info!("hole punch timed out - staying on the server relay");
}

fn first_word(data: &[u8]) -> Option<u32> {
    let mut parse = data;
    parse.try_get_u32().ok()
}
