//! Request dispatcher: one control connection, start to finish.
//!
//! A connection moves through `Dispatching → Tunneling → Closed`. While
//! dispatching, requests are decoded, validated, routed to the host and
//! answered in order. A successful STREAM_OPEN hands the connection to a
//! [`Tunnel`]; everything else keeps the loop going until the client closes
//! the connection or a framing error ends it.

use crate::dht::{handle_dht, DhtReply, DhtResponseStream};
use crate::endpoint::Endpoint;
use crate::error::{DaemonError, DaemonResult};
use crate::proxy::Tunnel;
use crate::registry::{HandlerRegistry, InboundRouter};
use futures::{SinkExt, StreamExt};
use p2pd_host::{HostError, PeerHost, PeerStream, StreamInfo};
use p2pd_wire::{ControlCodec, ControlRequest, FramingError, PeerInfo, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// A control connection with its framing layer.
pub type FramedControl = Framed<PeerStream, ControlCodec<Request>>;

/// Where a connection is in its lifecycle.
pub enum ConnectionState {
    Dispatching(FramedControl),
    Tunneling(Tunnel),
    Closed,
}

/// Result of routing one request.
enum Routed {
    Reply(Response),
    Dht(DhtReply),
    /// The stream is open; the connection becomes a tunnel.
    Tunnel(PeerStream, StreamInfo),
}

/// Per-connection request handling, shared by all connections.
#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn PeerHost>,
    registry: HandlerRegistry,
    router: Arc<InboundRouter>,
    default_timeout: Duration,
    max_frame_len: usize,
}

impl Dispatcher {
    pub fn new(
        host: Arc<dyn PeerHost>,
        registry: HandlerRegistry,
        default_timeout: Duration,
        max_frame_len: usize,
    ) -> Self {
        let router = Arc::new(InboundRouter::new(registry.clone()));
        Self {
            host,
            registry,
            router,
            default_timeout,
            max_frame_len,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Serve one control connection until it closes.
    pub async fn serve(&self, io: PeerStream) {
        let framed = Framed::new(io, ControlCodec::new(self.max_frame_len));
        let mut state = ConnectionState::Dispatching(framed);
        loop {
            state = match state {
                ConnectionState::Dispatching(framed) => self.dispatch(framed).await,
                ConnectionState::Tunneling(tunnel) => {
                    tunnel.run().await;
                    ConnectionState::Closed
                }
                ConnectionState::Closed => break,
            };
        }
    }

    /// Answer requests until the connection closes or turns into a tunnel.
    async fn dispatch(&self, mut framed: FramedControl) -> ConnectionState {
        // A request read ahead while a DHT stream was being written.
        let mut read_ahead: Option<Request> = None;
        loop {
            let next = match read_ahead.take() {
                Some(request) => Some(Ok(request)),
                None => framed.next().await,
            };
            let request = match next {
                None => {
                    debug!("Client closed connection");
                    return ConnectionState::Closed;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Dropping connection on framing error");
                    let _ = framed.send(Response::error(e.to_string())).await;
                    return ConnectionState::Closed;
                }
                Some(Ok(request)) => request,
            };

            let routed = match ControlRequest::try_from(request) {
                Ok(request) => {
                    debug!(request = request.name(), "Request");
                    self.route(request).await
                }
                Err(e) => {
                    debug!(error = %e, "Rejected request");
                    Routed::Reply(Response::error(e.to_string()))
                }
            };

            let written = match routed {
                Routed::Reply(response) | Routed::Dht(DhtReply::Unary(response)) => {
                    framed.send(response).await
                }
                Routed::Dht(DhtReply::Stream(elements)) => {
                    match write_dht_stream(&mut framed, elements).await {
                        Ok(StreamEnd::Finished(next)) => {
                            read_ahead = next;
                            Ok(())
                        }
                        Ok(StreamEnd::ClientGone) => return ConnectionState::Closed,
                        Err(e) => Err(e),
                    }
                }
                Routed::Tunnel(stream, info) => {
                    let header = p2pd_wire::StreamInfo::new(&info.peer, &info.addr, info.protocol.clone());
                    if let Err(e) = framed.send(Response::stream_info(header)).await {
                        debug!(error = %e, "Client gone before tunnel start");
                        return ConnectionState::Closed;
                    }
                    debug!(peer = %info.peer, protocol = %info.protocol, "Connection becomes tunnel");
                    return ConnectionState::Tunneling(Tunnel::from_framed(framed, stream, info));
                }
            };
            if let Err(e) = written {
                debug!(error = %e, "Write to client failed");
                return ConnectionState::Closed;
            }
        }
    }

    async fn route(&self, request: ControlRequest) -> Routed {
        match request {
            ControlRequest::Identify => {
                let (peer, addrs) = self.host.local_identity();
                Routed::Reply(Response::identify(&peer, &addrs))
            }
            ControlRequest::Connect {
                peer,
                addrs,
                timeout,
            } => {
                let result = self
                    .bounded("dial", timeout, self.host.dial(peer, addrs))
                    .await;
                Routed::Reply(reply(result, |()| Response::ok()))
            }
            ControlRequest::Disconnect { peer } => {
                let result = self.host.disconnect(peer).await;
                Routed::Reply(reply(result, |()| Response::ok()))
            }
            ControlRequest::StreamOpen {
                peer,
                protocols,
                timeout,
            } => {
                let result = self
                    .bounded("stream open", timeout, self.host.open_stream(peer, &protocols))
                    .await;
                match result {
                    Ok((stream, info)) => Routed::Tunnel(stream, info),
                    Err(e) => Routed::Reply(Response::error(e.to_string())),
                }
            }
            ControlRequest::StreamHandler { addr, protocols } => {
                let result = self.register_handler(&addr, &protocols).await;
                Routed::Reply(reply(result, |()| Response::ok()))
            }
            ControlRequest::Dht(query) => {
                Routed::Dht(handle_dht(self.host.as_ref(), query, self.default_timeout).await)
            }
            ControlRequest::ListPeers => {
                let peers = self
                    .host
                    .connected_peers()
                    .await
                    .iter()
                    .map(|p| PeerInfo::new(&p.peer, &p.addrs))
                    .collect();
                Routed::Reply(Response::peers(peers))
            }
        }
    }

    async fn bounded<T>(
        &self,
        what: &'static str,
        timeout: Option<Duration>,
        op: impl std::future::Future<Output = Result<T, HostError>>,
    ) -> DaemonResult<T> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HostError::Timeout(what).into()),
        }
    }

    async fn register_handler(
        &self,
        addr: &libp2p::Multiaddr,
        protocols: &[String],
    ) -> DaemonResult<()> {
        let endpoint = Endpoint::from_multiaddr(addr)?;
        for protocol in protocols {
            if let Some(previous) = self.registry.register(protocol, endpoint.clone()) {
                debug!(protocol = %protocol, previous = %previous, "Replacing stream handler");
            }
            self.host
                .register_inbound_handler(protocol, self.router.clone())
                .await?;
        }
        info!(endpoint = %endpoint, protocols = ?protocols, "Registered stream handler");
        Ok(())
    }
}

fn reply<T, E>(result: Result<T, E>, ok: impl FnOnce(T) -> Response) -> Response
where
    E: Into<DaemonError>,
{
    match result {
        Ok(value) => ok(value),
        Err(e) => Response::error(e.into().to_string()),
    }
}

/// How a DHT response stream ended.
#[derive(Debug)]
enum StreamEnd {
    /// END was written. Carries a request the client sent meanwhile.
    Finished(Option<Request>),
    /// The client closed the connection or broke framing mid-stream.
    ClientGone,
}

/// Write BEGIN wrapped in an OK Response, then every further element raw.
///
/// The client side is read while results are pending so a close drops the
/// stream, which cancels the query. At most one pipelined request is read
/// ahead and handed back.
async fn write_dht_stream(
    framed: &mut FramedControl,
    mut elements: DhtResponseStream,
) -> Result<StreamEnd, FramingError> {
    if let Some(begin) = elements.next().await {
        framed.send(Response::dht(begin)).await?;
    }
    let mut read_ahead = None;
    loop {
        tokio::select! {
            element = elements.next() => match element {
                Some(element) => framed.send(element).await?,
                None => return Ok(StreamEnd::Finished(read_ahead)),
            },
            incoming = framed.next(), if read_ahead.is_none() => match incoming {
                Some(Ok(request)) => read_ahead = Some(request),
                Some(Err(e)) => {
                    warn!(error = %e, "Framing error during DHT stream, cancelling query");
                    return Ok(StreamEnd::ClientGone);
                }
                None => {
                    debug!("Client closed connection during DHT stream, cancelling query");
                    return Ok(StreamEnd::ClientGone);
                }
            },
        }
    }
}
