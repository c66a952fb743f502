//! Event relay and file server
//!
//! One listener serves both sides of mirroring: WebSocket clients receive the
//! watcher's events as JSON [`RelayMessage`]s, and plain HTTP `GET`s fetch
//! file content from under the watched root.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info};

use fanout_core::path::{resolve_url_path, safe_real_path};
use fanout_core::{ErrorCode, EventKind, RelayMessage, WatchEvent};

use crate::watcher::{WatchBackend, Watcher};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Largest request head accepted
const MAX_HEAD_LEN: usize = 8192;

/// How long a client may take to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Live events a subscriber may lag behind before it is disconnected
const PEER_BACKLOG: usize = 4096;

/// Relay server state
pub struct RelayServer<B: WatchBackend> {
    watcher: Watcher<B>,
    root: PathBuf,
    /// Connected event subscribers by connection id
    peers: Arc<DashMap<String, SocketAddr>>,
}

impl<B: WatchBackend> RelayServer<B> {
    pub fn new(watcher: Watcher<B>) -> Self {
        let root = watcher.root();
        Self {
            watcher,
            root,
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Bind and serve forever
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), io::Error> {
        info!(
            "relay listening on {} for {:?}",
            listener.local_addr()?,
            self.root
        );

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let watcher = self.watcher.clone();
            let root = self.root.clone();
            let peers = self.peers.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, watcher, root, peers).await {
                    debug!("connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Connected event subscribers (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection<B: WatchBackend>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    watcher: Watcher<B>,
    root: PathBuf,
    peers: Arc<DashMap<String, SocketAddr>>,
) -> Result<(), BoxError> {
    let head = match tokio::time::timeout(HEAD_TIMEOUT, peek_head(&stream)).await {
        Ok(head) => head?,
        Err(_) => {
            debug!("{} sent no request head in time", peer_addr);
            return Ok(());
        }
    };
    let Some(head) = head else {
        return Ok(());
    };

    if is_websocket_upgrade(&head) {
        return relay_events(stream, peer_addr, watcher, peers).await;
    }

    // The head was only peeked; consume it before answering
    let mut consumed = vec![0u8; head.len()];
    stream.read_exact(&mut consumed).await?;

    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/");

    debug!("{} {} {}", peer_addr, method, path);

    if method != "GET" && method != "HEAD" {
        return respond(&mut stream, "405 Method Not Allowed", "application/json", r#"{"error":"method not allowed"}"#).await;
    }

    if path == "/health" {
        let body = serde_json::json!({
            "status": "healthy",
            "subscribers": peers.len(),
            "known_files": watcher.known_files().len(),
            "watched_dirs": watcher.watched_dirs().len(),
        })
        .to_string();
        return respond(&mut stream, "200 OK", "application/json", &body).await;
    }

    match open_shared_file(&root, path).await {
        Some((mut file, len)) => {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                len
            );
            stream.write_all(header.as_bytes()).await?;
            if method == "GET" {
                let sent = tokio::io::copy(&mut (&mut file).take(len), &mut stream).await?;
                debug!("sent {} bytes of {} to {}", sent, path, peer_addr);
            }
            stream.flush().await?;
            Ok(())
        }
        None => respond(&mut stream, "404 Not Found", "application/json", r#"{"error":"not found"}"#).await,
    }
}

/// Forward watcher events to one WebSocket client until either side closes
async fn relay_events<B: WatchBackend>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    watcher: Watcher<B>,
    peers: Arc<DashMap<String, SocketAddr>>,
) -> Result<(), BoxError> {
    let ws_stream = accept_async(stream).await?;

    let peer_id = generate_peer_id()?;
    peers.insert(peer_id.clone(), peer_addr);
    info!("subscriber {} connected from {}", peer_id, peer_addr);

    let (subscription, events) = watcher.subscribe_bounded(&EventKind::ALL, PEER_BACKLOG);
    let result = forward_events(ws_stream, events, &peer_id).await;

    watcher.unsubscribe(subscription);
    peers.remove(&peer_id);
    info!("subscriber {} disconnected", peer_id);
    result
}

async fn forward_events(
    ws_stream: WebSocketStream<TcpStream>,
    mut events: mpsc::Receiver<WatchEvent>,
    peer_id: &str,
) -> Result<(), BoxError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("event stream for {} ended", peer_id);
                    break;
                };
                let json = RelayMessage::from(&event).to_json()?;
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            msg = ws_receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => match RelayMessage::from_json(&text) {
                        Ok(RelayMessage::Ping { timestamp }) => {
                            Message::Text(RelayMessage::Pong { timestamp }.to_json()?)
                        }
                        Ok(_) => Message::Text(
                            RelayMessage::error(ErrorCode::Unsupported, "relay only publishes events").to_json()?,
                        ),
                        Err(e) => Message::Text(
                            RelayMessage::error(ErrorCode::InvalidMessage, format!("Invalid JSON: {}", e)).to_json()?,
                        ),
                    },
                    Some(Ok(Message::Ping(data))) => Message::Pong(data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {:?}", peer_id, e);
                        break;
                    }
                };
                if ws_sender.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Peek until the end of the request head without consuming it.
/// Returns `None` if the client closed first.
async fn peek_head(stream: &TcpStream) -> Result<Option<String>, io::Error> {
    let mut buf = vec![0u8; MAX_HEAD_LEN];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(end) = find_head_end(&buf[..n]) {
            return Ok(Some(String::from_utf8_lossy(&buf[..end]).into_owned()));
        }
        if n == buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
        // Partial head; peek returns immediately while data is pending
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Length of the head including its blank line
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn is_websocket_upgrade(head: &str) -> bool {
    head.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    })
}

/// Open a regular file under `root` named by a URL path. Anything unsafe,
/// missing or not a regular file is `None`.
async fn open_shared_file(root: &Path, url_path: &str) -> Option<(tokio::fs::File, u64)> {
    let path = match resolve_url_path(root, url_path) {
        Ok(path) => path,
        Err(e) => {
            debug!("rejecting {}: {}", url_path, e);
            return None;
        }
    };
    let meta = tokio::fs::metadata(&path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    if let Err(e) = safe_real_path(root, &path) {
        debug!("rejecting {}: {}", url_path, e);
        return None;
    }
    let file = tokio::fs::File::open(&path).await.ok()?;
    Some((file, meta.len()))
}

async fn respond(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<(), BoxError> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn generate_peer_id() -> Result<String, io::Error> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).map_err(|e| io::Error::other(e.to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::{RawEvent, RawKind};
    use tempfile::TempDir;
    use tokio_tungstenite::connect_async;

    /// Backend that accepts every watch; events are fed by hand
    struct ManualBackend {
        next: u32,
    }

    impl WatchBackend for ManualBackend {
        type Handle = u32;

        fn add_watch(&mut self, _dir: &Path) -> io::Result<u32> {
            self.next += 1;
            Ok(self.next)
        }

        fn remove_watch(&mut self, _handle: &u32) -> io::Result<()> {
            Ok(())
        }
    }

    /// Root handle is the first one handed out
    const ROOT_HANDLE: u32 = 1;

    async fn start(root: &Path) -> (SocketAddr, Watcher<ManualBackend>, Arc<RelayServer<ManualBackend>>) {
        let watcher = Watcher::with_backend(root, ManualBackend { next: 0 }).unwrap();
        let server = Arc::new(RelayServer::new(watcher.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = server.clone();
        tokio::spawn(async move { serving.serve_listener(listener).await });
        (addr, watcher, server)
    }

    async fn http(addr: SocketAddr, request: &str) -> (String, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();

        let end = find_head_end(&response).unwrap();
        let head = String::from_utf8_lossy(&response[..end]).into_owned();
        (head, response[end..].to_vec())
    }

    async fn get(addr: SocketAddr, path: &str) -> (String, Vec<u8>) {
        http(addr, &format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path)).await
    }

    async fn next_message<S>(ws: &mut S) -> RelayMessage
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            Message::Text(text) => RelayMessage::from_json(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_upgrade_detection() {
        let ws = "GET /events HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let http = "GET /events HTTP/1.1\r\nHost: x\r\n\r\n";
        let sneaky = "GET /upgrade:websocket HTTP/1.1\r\nHost: x\r\n\r\n";

        assert!(is_websocket_upgrade(ws));
        assert!(!is_websocket_upgrade(http));
        assert!(!is_websocket_upgrade(sneaky));
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[tokio::test]
    async fn test_serves_file_content() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub dir")).unwrap();
        std::fs::write(dir.path().join("sub dir/a.txt"), b"hello relay").unwrap();
        let (addr, _watcher, _server) = start(dir.path()).await;

        let (head, body) = get(addr, "/sub%20dir/a.txt").await;
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(head.contains("Content-Length: 11"));
        assert_eq!(body, b"hello relay");

        let (head, body) = http(addr, "HEAD /sub%20dir/a.txt HTTP/1.1\r\n\r\n").await;
        assert!(head.contains("Content-Length: 11"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_and_missing_paths() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"secret").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link")).unwrap();
        let (addr, _watcher, _server) = start(dir.path()).await;

        for path in ["/missing.txt", "/sub", "/", "/..%2F..%2Fetc%2Fpasswd", "/link"] {
            let (head, _) = get(addr, path).await;
            assert!(head.starts_with("HTTP/1.1 404"), "{} gave {}", path, head);
        }

        let (head, _) = http(addr, "POST /a.txt HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;
        assert!(head.starts_with("HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn test_health_reports_state() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let (addr, _watcher, _server) = start(dir.path()).await;

        let (head, body) = get(addr, "/health").await;
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["known_files"], 1);
        assert_eq!(status["watched_dirs"], 1);
        assert_eq!(status["subscribers"], 0);
    }

    #[tokio::test]
    async fn test_websocket_replay_then_live() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), [0u8; 10]).unwrap();
        let (addr, watcher, server) = start(dir.path()).await;

        let (mut ws, _) = connect_async(format!("ws://{}/events", addr)).await.unwrap();

        match next_message(&mut ws).await {
            RelayMessage::Update { path, stat } => {
                assert_eq!(path, "a.txt");
                assert_eq!(stat.size, 10);
            }
            other => panic!("expected replay, got {:?}", other),
        }
        assert_eq!(server.peer_count(), 1);

        ws.send(Message::Text(RelayMessage::Ping { timestamp: 7 }.to_json().unwrap()))
            .await
            .unwrap();
        assert!(matches!(next_message(&mut ws).await, RelayMessage::Pong { timestamp: 7 }));

        std::fs::create_dir(dir.path().join("new")).unwrap();
        std::fs::write(dir.path().join("new/b.bin"), [0u8; 3]).unwrap();
        watcher.process(RawEvent::new(ROOT_HANDLE, RawKind::Create, "new", true));

        match next_message(&mut ws).await {
            RelayMessage::Update { path, stat } => {
                assert_eq!(path, "new/b.bin");
                assert_eq!(stat.size, 3);
                assert!(stat.is_file());
            }
            other => panic!("expected update, got {:?}", other),
        }

        ws.close(None).await.unwrap();
        for _ in 0..100 {
            if server.peer_count() == 0 && watcher.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.peer_count(), 0);
        assert_eq!(watcher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_websocket_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let (addr, _watcher, _server) = start(dir.path()).await;

        let (mut ws, _) = connect_async(format!("ws://{}/events", addr)).await.unwrap();
        ws.send(Message::Text("not json".into())).await.unwrap();

        assert!(matches!(
            next_message(&mut ws).await,
            RelayMessage::Error { code: ErrorCode::InvalidMessage, .. }
        ));
    }
}
