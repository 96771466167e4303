//! Realtime channels. Authentication happens before the upgrade; the first
//! frame on every socket is the box's current snapshot.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use escalada_store::{BoxId, now_millis};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};

use crate::auth::Claims;
use crate::broadcast::{Channel, ClientMessage, ServerMessage};
use crate::http::HttpState;
use crate::http::api::{ApiError, TokenQuery};
use crate::service::LiveService;

pub(crate) async fn box_socket(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(box_id): Path<BoxId>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let channel = Channel::Box(box_id);
    let claims = admit(&state, &headers, query.token.as_deref(), channel).await?;
    let service = Arc::clone(&state.service);
    Ok(upgrade.on_upgrade(move |socket| {
        let (sink, stream) = socket.split();
        drive(sink, stream, service, channel, claims)
    }))
}

/// Spectator channel. No token needed, but a supplied one must be valid.
pub(crate) async fn public_socket(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(box_id): Path<BoxId>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let channel = Channel::Public(box_id);
    admit(&state, &headers, query.token.as_deref(), channel).await?;
    let service = Arc::clone(&state.service);
    Ok(upgrade.on_upgrade(move |socket| {
        let (sink, stream) = socket.split();
        drive(sink, stream, service, channel, None)
    }))
}

/// Checks run before the upgrade. A refused socket is never registered.
pub(crate) async fn admit(
    state: &HttpState,
    headers: &HeaderMap,
    token: Option<&str>,
    channel: Channel,
) -> Result<Option<Claims>, ApiError> {
    match channel {
        Channel::Box(box_id) => {
            let claims = state.authenticate(headers, token)?;
            claims.authorize_view(box_id)?;
            tracing::debug!(box_id, user = %claims.username, "operator socket admitted");
            Ok(Some(claims))
        }
        Channel::Public(box_id) => {
            if headers.contains_key(axum::http::header::AUTHORIZATION) || token.is_some() {
                state.authenticate(headers, token)?;
            }
            if state.service.snapshot_for(channel).await.is_none() {
                return Err(ApiError::NotPublic(box_id));
            }
            Ok(None)
        }
    }
}

/// Socket loop: forwards broadcasts, sends heartbeats, answers client
/// messages and closes on shutdown. The connection is deregistered when this
/// returns.
pub(crate) async fn drive<Tx, Rx, E>(
    mut sink: Tx,
    mut stream: Rx,
    service: Arc<LiveService>,
    channel: Channel,
    claims: Option<Claims>,
) where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
{
    let Some(mut subscription) = service.connect(channel).await else {
        tracing::debug!(box_id = channel.box_id(), "box went private before connect");
        let _ = sink.send(Message::Close(None)).await;
        return;
    };
    let heartbeat = service.config().heartbeat.clone();
    let mut ticker = tokio::time::interval(heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_pong = Instant::now();
    let mut shutdown = service.shutdown_sender().subscribe();

    loop {
        tokio::select! {
            outgoing = subscription.recv() => {
                let Some(text) = outgoing else {
                    tracing::debug!(connection = subscription.id(), "dropped by broadcaster");
                    break;
                };
                if sink.send(Message::Text(text.to_string().into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if last_pong.elapsed() > heartbeat.timeout {
                    tracing::info!(connection = subscription.id(), "heartbeat timed out");
                    break;
                }
                if !send(&mut sink, &ServerMessage::Ping { timestamp: now_millis() }).await {
                    break;
                }
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(message) = serde_json::from_str::<ClientMessage>(text.as_str()) else {
                    continue;
                };
                let reply = match message {
                    ClientMessage::Pong { .. } => {
                        last_pong = Instant::now();
                        None
                    }
                    ClientMessage::Ping { timestamp } => {
                        last_pong = Instant::now();
                        Some(ServerMessage::Pong { timestamp })
                    }
                    ClientMessage::RequestState { box_id } => {
                        request_state(&service, channel, claims.as_ref(), box_id).await
                    }
                };
                if let Some(reply) = reply {
                    if !send(&mut sink, &reply).await {
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Snapshot for a `REQUEST_STATE`. Defaults to the socket's own box; other
/// boxes are served only when the caller may see them on this channel kind.
async fn request_state(
    service: &LiveService,
    channel: Channel,
    claims: Option<&Claims>,
    requested: Option<BoxId>,
) -> Option<ServerMessage> {
    let box_id = requested.unwrap_or(channel.box_id());
    let target = match channel {
        Channel::Box(_) => {
            if !claims.is_some_and(|c| c.can_view(box_id)) {
                tracing::debug!(box_id, "state request denied");
                return None;
            }
            Channel::Box(box_id)
        }
        Channel::Public(_) => Channel::Public(box_id),
    };
    service.snapshot_for(target).await
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    match message.encode() {
        Ok(text) => sink.send(Message::Text(text.into())).await.is_ok(),
        Err(err) => {
            tracing::warn!("encode server message: {err}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Role, StaticTokens};
    use crate::command::Command;
    use crate::config::LiveConfig;
    use crate::error::AuthError;
    use crate::rules::MergeRules;
    use escalada_store::{MemStore, Provenance};
    use serde_json::{Value, json};
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    type TestSink = Pin<Box<dyn Sink<Message, Error = ()> + Send>>;

    async fn service(interval: u64, timeout: u64) -> Arc<LiveService> {
        let mut config = LiveConfig::default();
        config.reset_boxes_on_start = false;
        config.backup.interval = None;
        config.heartbeat.interval = Duration::from_secs(interval);
        config.heartbeat.timeout = Duration::from_secs(timeout);
        Arc::new(
            LiveService::with_store(config, Arc::new(MemStore::new()), Arc::new(MergeRules))
                .await
                .expect("service"),
        )
    }

    /// In-process socket: the test writes client frames into the returned
    /// sender and reads server frames from the returned receiver.
    struct Client {
        to_server: mpsc::UnboundedSender<Message>,
        from_server: mpsc::UnboundedReceiver<Message>,
        task: JoinHandle<()>,
    }

    impl Client {
        fn open(service: &Arc<LiveService>, channel: Channel, claims: Option<Claims>) -> Self {
            let (to_server, mut inbound) = mpsc::unbounded_channel::<Message>();
            let (outbound, from_server) = mpsc::unbounded_channel::<Message>();
            let stream = futures_util::stream::poll_fn(move |cx| {
                inbound.poll_recv(cx).map(|m| m.map(Ok::<_, Infallible>))
            });
            let sink: TestSink = Box::pin(futures_util::sink::unfold(
                outbound,
                |outbound: mpsc::UnboundedSender<Message>, msg: Message| async move {
                    outbound.send(msg).map_err(|_| ())?;
                    Ok::<_, ()>(outbound)
                },
            ));
            let task = tokio::spawn(drive(sink, stream, Arc::clone(service), channel, claims));
            Self {
                to_server,
                from_server,
                task,
            }
        }

        async fn next_json(&mut self) -> Value {
            match self.from_server.recv().await.expect("server frame") {
                Message::Text(text) => serde_json::from_str(text.as_str()).expect("json frame"),
                other => panic!("expected a text frame, got {other:?}"),
            }
        }

        fn say(&self, value: Value) {
            self.to_server
                .send(Message::Text(value.to_string().into()))
                .expect("socket open");
        }
    }

    fn http_state(service: &Arc<LiveService>) -> HttpState {
        let tokens = StaticTokens::new()
            .with_token("t-judge", Claims::new("ana", Role::Judge).with_boxes([1]))
            .with_token("t-fan", Claims::new("fan", Role::Spectator));
        HttpState::new(Arc::clone(service), Arc::new(tokens))
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out_and_is_deregistered() {
        let service = service(1, 3).await;
        let mut client = Client::open(&service, Channel::Box(1), None);
        assert_eq!(client.next_json().await["type"], json!("STATE_SNAPSHOT"));
        assert_eq!(service.broadcaster().connection_count(Channel::Box(1)), 1);

        tokio::time::timeout(Duration::from_secs(30), &mut client.task)
            .await
            .expect("loop ends")
            .expect("loop task");
        let mut pings = 0;
        while let Ok(Message::Text(text)) = client.from_server.try_recv() {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(frame["type"], json!("PING"));
            pings += 1;
        }
        assert_eq!(pings, 3);
        assert_eq!(service.broadcaster().connection_count(Channel::Box(1)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn answering_pings_keeps_the_socket_until_shutdown() {
        let service = service(1, 3).await;
        let mut client = Client::open(&service, Channel::Box(1), None);
        client.next_json().await;

        let mut pings = 0;
        loop {
            match client.from_server.recv().await.expect("frame") {
                Message::Text(text) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    assert_eq!(frame["type"], json!("PING"));
                    pings += 1;
                    if pings == 6 {
                        service.shutdown();
                    } else {
                        client.say(json!({ "type": "PONG", "timestamp": frame["timestamp"] }));
                    }
                }
                Message::Close(_) => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        (&mut client.task).await.unwrap();
        assert_eq!(pings, 6);
        assert_eq!(service.broadcaster().total_connections(), 0);
    }

    #[tokio::test]
    async fn client_ping_is_answered_with_its_timestamp() {
        let service = service(30, 60).await;
        let mut client = Client::open(&service, Channel::Box(1), None);
        client.next_json().await;
        client.say(json!({ "type": "PING", "timestamp": 42 }));
        let reply = client.next_json().await;
        assert_eq!(reply, json!({ "type": "PONG", "timestamp": 42 }));
    }

    #[tokio::test]
    async fn request_state_respects_the_callers_boxes() {
        let service = service(30, 60).await;
        for box_id in [1, 2] {
            let cmd = Command::new(box_id, 0, "PROGRESS_UPDATE", json!({ "holds": box_id }))
                .with_session("s1");
            service.submit(cmd, Provenance::default()).await.unwrap();
        }

        let judge = Claims::new("ana", Role::Judge).with_boxes([1]);
        let mut client = Client::open(&service, Channel::Box(1), Some(judge));
        client.next_json().await;

        client.say(json!({ "type": "REQUEST_STATE", "boxId": 2 }));
        client.say(json!({ "type": "REQUEST_STATE" }));
        let reply = client.next_json().await;
        assert_eq!(reply["boxId"], json!(1));
        assert_eq!(reply["boxVersion"], json!(1));
        assert!(client.from_server.try_recv().is_err());

        let admin = Claims::new("root", Role::Admin);
        let mut client = Client::open(&service, Channel::Box(1), Some(admin));
        client.next_json().await;
        client.say(json!({ "type": "REQUEST_STATE", "boxId": 2 }));
        assert_eq!(client.next_json().await["boxId"], json!(2));
    }

    #[tokio::test]
    async fn closing_the_client_deregisters_the_connection() {
        let service = service(30, 60).await;
        let mut client = Client::open(&service, Channel::Box(4), None);
        client.next_json().await;
        assert_eq!(service.broadcaster().connection_count(Channel::Box(4)), 1);

        client.to_server.send(Message::Close(None)).unwrap();
        (&mut client.task).await.unwrap();
        assert_eq!(service.broadcaster().connection_count(Channel::Box(4)), 0);
    }

    #[tokio::test]
    async fn refused_sockets_are_never_registered() {
        let service = service(30, 60).await;
        let state = http_state(&service);
        let headers = HeaderMap::new();

        let missing = admit(&state, &headers, None, Channel::Box(1)).await;
        assert!(matches!(missing, Err(ApiError::Auth(AuthError::MissingToken))));
        let wrong_box = admit(&state, &headers, Some("t-judge"), Channel::Box(2)).await;
        assert!(matches!(wrong_box, Err(ApiError::Auth(_))));
        let spectator = admit(&state, &headers, Some("t-fan"), Channel::Box(1)).await;
        assert!(matches!(spectator, Err(ApiError::Auth(_))));
        let bad_token = admit(&state, &headers, Some("nope"), Channel::Public(1)).await;
        assert!(matches!(bad_token, Err(ApiError::Auth(AuthError::InvalidToken))));
        let private = admit(&state, &headers, None, Channel::Public(1)).await;
        assert!(matches!(private, Err(ApiError::NotPublic(1))));
        assert_eq!(service.broadcaster().total_connections(), 0);

        let claims = admit(&state, &headers, Some("t-judge"), Channel::Box(1))
            .await
            .unwrap();
        assert_eq!(claims.map(|c| c.username), Some("ana".to_string()));
    }
}
