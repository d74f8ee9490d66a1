//! DHT request handling.
//!
//! Single-result kinds answer with one Response. Multi-result kinds produce
//! a [`DhtResponseStream`]: an OK Response carrying BEGIN, then one raw
//! DhtResponse per result, then END. A failure before BEGIN is reported as a
//! single ERROR Response and nothing else.

use futures::{Stream, StreamExt};
use p2pd_host::{DhtRouting, DhtStream, DhtValue, HostError, PeerHost};
use p2pd_wire::{DhtKind, DhtQuery, DhtResponse, PeerInfo, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::debug;

/// How a DHT query is answered.
pub enum DhtReply {
    /// Exactly one Response.
    Unary(Response),
    /// BEGIN, VALUE*, END on the same connection.
    Stream(DhtResponseStream),
}

impl std::fmt::Debug for DhtReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(resp) => f.debug_tuple("Unary").field(resp).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// BEGIN not yet emitted.
    Pending,
    Streaming,
    /// END emitted.
    Closed,
}

/// Lazy, finite sequence of DHT response elements.
///
/// The first element is BEGIN and the last is END. Results stop early when
/// `limit` values have been emitted or the deadline passes; either way the
/// underlying query is dropped, which cancels it.
pub struct DhtResponseStream {
    state: StreamState,
    results: Option<DhtStream>,
    deadline: Pin<Box<Sleep>>,
    limit: Option<usize>,
    emitted: usize,
}

impl DhtResponseStream {
    pub fn new(results: DhtStream, timeout: Duration, limit: Option<usize>) -> Self {
        Self {
            state: StreamState::Pending,
            results: Some(results),
            // `sleep` saturates deadlines past the end of the clock.
            deadline: Box::pin(tokio::time::sleep(timeout)),
            limit,
            emitted: 0,
        }
    }

    fn close(&mut self) -> DhtResponse {
        self.results = None;
        self.state = StreamState::Closed;
        DhtResponse::end()
    }
}

impl Stream for DhtResponseStream {
    type Item = DhtResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<DhtResponse>> {
        let this = &mut *self;
        match this.state {
            StreamState::Pending => {
                this.state = StreamState::Streaming;
                Poll::Ready(Some(DhtResponse::begin()))
            }
            StreamState::Closed => Poll::Ready(None),
            StreamState::Streaming => {
                if this.limit.is_some_and(|limit| this.emitted >= limit) {
                    return Poll::Ready(Some(this.close()));
                }
                if this.deadline.as_mut().poll(cx).is_ready() {
                    debug!(emitted = this.emitted, "DHT query deadline reached, truncating");
                    return Poll::Ready(Some(this.close()));
                }
                let Some(results) = this.results.as_mut() else {
                    return Poll::Ready(Some(this.close()));
                };
                match results.poll_next_unpin(cx) {
                    Poll::Ready(Some(value)) => {
                        this.emitted += 1;
                        Poll::Ready(Some(value_element(value)))
                    }
                    Poll::Ready(None) => Poll::Ready(Some(this.close())),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

fn value_element(value: DhtValue) -> DhtResponse {
    match value {
        DhtValue::Peer(info) => DhtResponse::peer(PeerInfo::new(&info.peer, &info.addrs)),
        DhtValue::PeerId(peer) => DhtResponse::with_value(peer.to_bytes()),
        DhtValue::Value(bytes) => DhtResponse::with_value(bytes),
    }
}

fn host_error(err: HostError) -> Response {
    Response::error(err.to_string())
}

/// Run `op` under the query deadline.
async fn bounded<T>(
    timeout: Duration,
    op: impl Future<Output = Result<T, HostError>>,
) -> Result<T, HostError> {
    tokio::time::timeout(timeout, op)
        .await
        .unwrap_or(Err(HostError::Timeout("DHT query")))
}

/// Answer a validated DHT query.
pub async fn handle_dht(host: &dyn PeerHost, query: DhtQuery, default_timeout: Duration) -> DhtReply {
    let Some(dht) = host.dht() else {
        return DhtReply::Unary(host_error(HostError::DhtDisabled));
    };
    let timeout = query.timeout.unwrap_or(default_timeout);
    debug!(kind = query.kind.name(), ?timeout, "DHT query");

    match query.kind {
        DhtKind::FindPeer { peer } => unary(bounded(timeout, dht.find_peer(peer)).await, |info| {
            Response::dht(DhtResponse::peer(PeerInfo::new(&info.peer, &info.addrs)))
        }),
        DhtKind::GetPublicKey { peer } => {
            unary(bounded(timeout, dht.get_public_key(peer)).await, |key| {
                Response::dht(DhtResponse::with_value(key.encode_protobuf()))
            })
        }
        DhtKind::GetValue { key } => unary(bounded(timeout, dht.get_value(key)).await, |value| {
            Response::dht(DhtResponse::with_value(value))
        }),
        DhtKind::PutValue { key, value } => {
            unary(bounded(timeout, dht.put_value(key, value)).await, |()| Response::ok())
        }
        DhtKind::Provide { cid } => {
            unary(bounded(timeout, dht.provide(cid)).await, |()| Response::ok())
        }
        DhtKind::FindPeersConnectedToPeer { peer } => {
            streaming(&dht, timeout, None, |dht| async move {
                dht.find_peers_connected_to_peer(peer).await
            })
            .await
        }
        DhtKind::FindProviders { cid, count } => {
            streaming(&dht, timeout, Some(count), |dht| async move {
                dht.find_providers(cid, count).await
            })
            .await
        }
        DhtKind::GetClosestPeers { key } => {
            streaming(&dht, timeout, None, |dht| async move {
                dht.get_closest_peers(key).await
            })
            .await
        }
        DhtKind::SearchValue { key } => {
            streaming(&dht, timeout, None, |dht| async move { dht.search_value(key).await }).await
        }
    }
}

fn unary<T>(result: Result<T, HostError>, ok: impl FnOnce(T) -> Response) -> DhtReply {
    DhtReply::Unary(match result {
        Ok(value) => ok(value),
        Err(e) => host_error(e),
    })
}

/// Start a streaming query. The whole timeout covers both starting the
/// query and draining its results.
async fn streaming<F, Fut>(
    dht: &Arc<dyn DhtRouting>,
    timeout: Duration,
    limit: Option<usize>,
    start: F,
) -> DhtReply
where
    F: FnOnce(Arc<dyn DhtRouting>) -> Fut,
    Fut: Future<Output = Result<DhtStream, HostError>>,
{
    let started = Instant::now();
    match bounded(timeout, start(dht.clone())).await {
        Ok(results) => {
            let remaining = timeout.saturating_sub(started.elapsed());
            DhtReply::Stream(DhtResponseStream::new(results, remaining, limit))
        }
        Err(e) => DhtReply::Unary(host_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;
    use p2pd_wire::message::dht_response;

    fn values(n: usize) -> DhtStream {
        futures::stream::iter((0..n).map(|i| DhtValue::Value(vec![i as u8]))).boxed()
    }

    fn kinds(elements: &[DhtResponse]) -> Vec<dht_response::Type> {
        elements.iter().map(|e| e.r#type()).collect()
    }

    #[tokio::test]
    async fn test_begin_values_end() {
        let stream = DhtResponseStream::new(values(3), Duration::from_secs(5), None);
        let elements: Vec<_> = stream.collect().await;
        assert_eq!(
            kinds(&elements),
            vec![
                dht_response::Type::Begin,
                dht_response::Type::Value,
                dht_response::Type::Value,
                dht_response::Type::Value,
                dht_response::Type::End,
            ]
        );
        assert_eq!(elements[2].value.as_deref(), Some(&[1u8][..]));
    }

    #[tokio::test]
    async fn test_empty_results_still_framed() {
        let stream = DhtResponseStream::new(values(0), Duration::from_secs(5), None);
        let elements: Vec<_> = stream.collect().await;
        assert_eq!(
            kinds(&elements),
            vec![dht_response::Type::Begin, dht_response::Type::End]
        );
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let stream = DhtResponseStream::new(values(10), Duration::from_secs(5), Some(4));
        let elements: Vec<_> = stream.collect().await;
        assert_eq!(elements.len(), 1 + 4 + 1);
        assert_eq!(elements.last().unwrap().r#type(), dht_response::Type::End);
    }

    #[tokio::test]
    async fn test_deadline_truncates() {
        let slow = futures::stream::iter(vec![DhtValue::Value(b"a".to_vec())])
            .chain(futures::stream::pending())
            .boxed();
        let stream = DhtResponseStream::new(slow, Duration::from_millis(100), None);
        let elements: Vec<_> = stream.collect().await;
        assert_eq!(
            kinds(&elements),
            vec![
                dht_response::Type::Begin,
                dht_response::Type::Value,
                dht_response::Type::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let timeout = Duration::from_secs(i64::MAX as u64);
        let stream = DhtResponseStream::new(values(2), timeout, None);
        let elements: Vec<_> = stream.collect().await;
        assert_eq!(elements.len(), 1 + 2 + 1);
    }

    #[test]
    fn test_value_elements() {
        let peer = PeerId::random();
        let element = value_element(DhtValue::PeerId(peer));
        assert_eq!(element.value, Some(peer.to_bytes()));

        let info = p2pd_host::PeerInfo::new(peer, vec!["/ip4/10.0.0.9/tcp/1".parse().unwrap()]);
        let element = value_element(DhtValue::Peer(info));
        let wire = element.peer.unwrap();
        assert_eq!(PeerId::from_bytes(&wire.id).unwrap(), peer);
        assert_eq!(wire.addrs.len(), 1);
    }
}
