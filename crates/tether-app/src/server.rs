//! TCP transport: JSON-lines control plus attach and notification streams.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::commands;
use crate::ipc::{ControlRequest, ControlResponse};
use crate::render_pump::{pump_notifications, pump_subscription};
use crate::state::AppState;

/// Longest accepted request line.
const MAX_REQUEST_LINE: usize = 1024 * 1024;

/// Accept connections until shutdown is triggered.
pub async fn run_accept_loop(listener: TcpListener, state: Arc<AppState>) {
    let mut shutdown_rx = state.subscribe_shutdown();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("new connection from {peer_addr}");
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            handle_client(reader, writer, state).await;
                            debug!("connection from {peer_addr} closed");
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }
}

/// Serve one connection.
///
/// Requests are answered in order. An accepted `attach` or `notifications`
/// request turns the rest of the connection into that stream; it ends when
/// the stream does or the client closes its side.
pub async fn handle_client<R, W>(reader: R, writer: W, state: Arc<AppState>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_LINE));
    let mut replies = FramedWrite::new(writer, LinesCodec::new());
    let mut shutdown_rx = state.subscribe_shutdown();

    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = shutdown_rx.recv() => return,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!("dropping connection: {e}");
                return;
            }
            None => return,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                let reply = ControlResponse::error(format!("invalid request: {e}"));
                if send(&mut replies, &reply).await.is_err() {
                    return;
                }
                continue;
            }
        };

        match request {
            ControlRequest::Attach { id, mode } => {
                let session = match state.registry.get(&id) {
                    Ok(session) => session,
                    Err(e) => {
                        let reply = ControlResponse::error(format!("failed to attach: {e}"));
                        if send(&mut replies, &reply).await.is_err() {
                            return;
                        }
                        continue;
                    }
                };
                let subscription = session.attach(mode);
                if send(&mut replies, &ControlResponse::Attached { id: id.clone(), mode })
                    .await
                    .is_err()
                {
                    return;
                }
                let pump = pump_subscription(
                    subscription,
                    replies.into_inner(),
                    state.subscribe_shutdown(),
                );
                tokio::select! {
                    result = pump => match result {
                        Ok(sent) => debug!("subscriber to {id} finished after {sent} messages"),
                        Err(e) => debug!("subscriber to {id} dropped: {e}"),
                    },
                    _ = drain(&mut lines) => debug!("subscriber to {id} disconnected"),
                }
                return;
            }
            ControlRequest::Notifications => {
                let listener = state.notifications.subscribe();
                if send(&mut replies, &ControlResponse::Subscribed).await.is_err() {
                    return;
                }
                let pump = pump_notifications(
                    listener,
                    replies.into_inner(),
                    state.subscribe_shutdown(),
                );
                tokio::select! {
                    result = pump => {
                        if let Err(e) = result {
                            debug!("notification listener dropped: {e}");
                        }
                    }
                    _ = drain(&mut lines) => debug!("notification listener disconnected"),
                }
                return;
            }
            request => {
                let reply = commands::dispatch(&state, request).await;
                if send(&mut replies, &reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn send<W>(
    replies: &mut FramedWrite<W, LinesCodec>,
    reply: &ControlResponse,
) -> Result<(), ()>
where
    W: AsyncWrite + Unpin,
{
    let json = match serde_json::to_string(reply) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to encode reply: {e}");
            return Err(());
        }
    };
    replies.send(json).await.map_err(|e| {
        debug!("failed to write reply: {e}");
    })
}

/// Wait for the client to close its side, discarding anything it sends.
async fn drain<R>(lines: &mut FramedRead<R, LinesCodec>)
where
    R: AsyncRead + Unpin,
{
    while let Some(Ok(_)) = lines.next().await {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
    use tokio::net::TcpStream;

    use crate::config::Config;
    use crate::ipc::TextEvent;

    fn state() -> Arc<AppState> {
        let (state, _events) =
            AppState::new(Config::default(), tether_db::open_in_memory().unwrap()).unwrap();
        Arc::new(state)
    }

    struct Client {
        writer: tokio::io::WriteHalf<DuplexStream>,
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
    }

    impl Client {
        fn connect(state: &Arc<AppState>) -> Self {
            let (client, server) = tokio::io::duplex(256 * 1024);
            let (server_read, server_write) = tokio::io::split(server);
            tokio::spawn(handle_client(server_read, server_write, Arc::clone(state)));
            let (read, writer) = tokio::io::split(client);
            Self {
                writer,
                lines: BufReader::new(read).lines(),
            }
        }

        async fn send(&mut self, json: &str) {
            self.writer.write_all(json.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn line(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("no reply")
                .unwrap()
                .expect("connection closed")
        }

        async fn request(&mut self, json: &str) -> ControlResponse {
            self.send(json).await;
            serde_json::from_str(&self.line().await).unwrap()
        }
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_and_connection_survives() {
        let state = state();
        let mut client = Client::connect(&state);
        let reply = client.request("{not json").await;
        assert!(matches!(reply, ControlResponse::Error { ref message } if message.starts_with("invalid request")));

        let reply = client.request(r#"{"type":"list"}"#).await;
        assert_eq!(reply, ControlResponse::Sessions { sessions: vec![] });
    }

    #[tokio::test]
    async fn test_attach_unknown_session() {
        let state = state();
        let mut client = Client::connect(&state);
        let reply = client.request(r#"{"type":"attach","id":"missing","mode":"text"}"#).await;
        assert!(matches!(reply, ControlResponse::Error { ref message } if message.starts_with("failed to attach")));
    }

    #[tokio::test]
    async fn test_text_attach_streams_until_exit() {
        let state = state();
        let mut control = Client::connect(&state);
        let reply = control
            .request(r#"{"type":"create","id":"s1","command":"/bin/sh","args":["-c","read x; echo got $x; exit 5"]}"#)
            .await;
        assert_eq!(reply, ControlResponse::Created { id: "s1".into() });

        let mut viewer = Client::connect(&state);
        let reply = viewer.request(r#"{"type":"attach","id":"s1","mode":"text"}"#).await;
        assert!(matches!(reply, ControlResponse::Attached { .. }));
        let first: TextEvent = serde_json::from_str(&viewer.line().await).unwrap();
        assert!(matches!(first, TextEvent::Snapshot { .. }));

        let reply = control
            .request(r#"{"type":"input","id":"s1","text":"ping\n"}"#)
            .await;
        assert_eq!(reply, ControlResponse::Ok);

        let mut saw_output = false;
        loop {
            let event: TextEvent = serde_json::from_str(&viewer.line().await).unwrap();
            match event {
                TextEvent::Screen { lines, .. } => {
                    saw_output |= lines.iter().any(|l| l == "got ping");
                }
                TextEvent::Exit { code, .. } => {
                    assert_eq!(code, 5);
                    break;
                }
                TextEvent::Snapshot { .. } => {}
            }
        }
        assert!(saw_output || state.registry.get("s1").unwrap().frame().contains_text("got ping"));
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), viewer.lines.next_line())
                .await
                .unwrap()
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_accept_loop_stops_on_shutdown() {
        let state = state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(run_accept_loop(listener, Arc::clone(&state)));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"{\"type\":\"get_preferences\"}\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        let reply: ControlResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, ControlResponse::Preferences { .. }));

        state.trigger_shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "accept loop did not shut down");
    }
}
