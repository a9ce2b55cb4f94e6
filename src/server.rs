//! Server admission, chaos, and peer-redirection (spec §4.2).
//!
//! The accept/dispatch/spawn-per-unit-of-work shape is grounded on
//! `tracker.rs::{setup_peer_workers, download_file}` -- there the
//! teacher spawns one task per peer that pulls jobs from a shared
//! channel; here one task is spawned per accepted connection instead,
//! gated by a `Semaphore` sized `Cs` so at most `Cs` normal handlers
//! run concurrently (testable property 5).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use rand::seq::SliceRandom;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;

use crate::catalog::{self, ServerFile};
use crate::peer_table::{PeerTable, TrustedPeer};
use crate::proto::{self, ParsedRequest};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cs: usize,
    pub p: f64,
    pub t: Duration,
    pub files_dir: PathBuf,
    pub b: u64,
}

/// Tracks live normal-handler connections so the chaos task can pick
/// one uniformly at random and close it out-of-band. Since tokio gives
/// no portable way to reach into another task's owned `TcpStream`,
/// "closing" a connection here means aborting its handler task -- the
/// peer observes the same reset/EOF either way.
#[derive(Default)]
struct ActiveConnections {
    inner: StdMutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl ActiveConnections {
    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, id: u64, handle: AbortHandle) {
        self.inner.lock().unwrap().insert(id, handle);
    }

    fn remove(&self, id: u64) {
        self.inner.lock().unwrap().remove(&id);
    }

    /// Picks a live connection at random and aborts it, retrying
    /// against another candidate if the chosen one already finished on
    /// its own -- the race the spec requires tolerating.
    fn close_random(&self) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let mut candidates: Vec<u64> = guard.keys().copied().collect();
        candidates.shuffle(&mut rand::thread_rng());
        for id in candidates {
            let finished = guard.get(&id).map(|h| h.is_finished()).unwrap_or(true);
            if finished {
                guard.remove(&id);
                continue;
            }
            if let Some(handle) = guard.remove(&id) {
                handle.abort();
                return true;
            }
        }
        false
    }
}

struct ConnGuard<'a> {
    active: &'a ActiveConnections,
    id: u64,
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(self.id);
    }
}

pub struct Server {
    config: ServerConfig,
    catalog: Vec<ServerFile>,
    peers: PeerTable,
    active: ActiveConnections,
    semaphore: Arc<Semaphore>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let catalog = catalog::list_files(&config.files_dir).await?;
        info!("catalogued {} files under {}", catalog.len(), config.files_dir.display());

        Ok(Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.cs)),
            active: ActiveConnections::default(),
            peers: PeerTable::new(),
            catalog,
            config,
        }))
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("binding to port {}", self.config.port))?;
        info!("listening on port {}", self.config.port);
        self.serve(listener).await
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        spawn_chaos_task(Arc::clone(&self));

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("accepted connection from {addr}");

            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => {
                    let this = Arc::clone(&self);
                    let id = this.active.alloc_id();
                    let (reader, writer) = stream.into_split();
                    let task = tokio::spawn(async move {
                        this.dispatch_normal(BufReader::new(reader), writer, addr, None, permit, id)
                            .await;
                    });
                    self.active.insert(id, task.abort_handle());
                }
                Err(_) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.dispatch_overflow(stream, addr).await;
                    });
                }
            }
        }
    }

    /// The overflow path: consume exactly one line, try to redirect a
    /// `DOWNLOAD` to a trusted peer, and only on exhaustion (or a first
    /// command other than `DOWNLOAD`) enqueue a normal handler with that
    /// line as its already-consumed first command.
    async fn dispatch_overflow(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);
        let mut writer = writer_half;

        let first_line = match proto::read_line(&mut reader).await {
            Ok(Some(line)) => line,
            _ => return,
        };

        if let Ok(ParsedRequest::Download { file_id, block_index }) = proto::parse_request(&first_line) {
            let candidates = self.peers.randomized_snapshot(&file_id).await;
            debug!("overflow: {} candidate peers for {file_id}", candidates.len());
            for peer in candidates {
                if let Some(token_line) = self.probe_peer(&peer, &file_id).await {
                    debug!("overflow: redirecting {addr} to {}:{} for {file_id}:{block_index}", peer.host, peer.port);
                    let _ = proto::write_line(&mut writer, &token_line).await;
                    return;
                }
            }
            debug!("overflow: no peer yielded a token for {file_id}, falling back to a normal handler");
        }

        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let id = self.active.alloc_id();
        let this = Arc::clone(&self);
        let task = tokio::spawn(async move {
            this.dispatch_normal(reader, writer, addr, Some(first_line), permit, id)
                .await;
        });
        self.active.insert(id, task.abort_handle());
    }

    /// Opens a short-lived connection to `peer`, sends `TOKEN_REQUEST`,
    /// and returns the reply line iff it begins with `TOKEN `. These
    /// probes do not count against `Cs` (spec §5).
    async fn probe_peer(&self, peer: &TrustedPeer, file_id: &str) -> Option<String> {
        let mut stream = TcpStream::connect((peer.host.as_str(), peer.port)).await.ok()?;
        stream
            .write_all(format!("TOKEN_REQUEST {file_id}\n").as_bytes())
            .await
            .ok()?;
        let mut reader = BufReader::new(&mut stream);
        let line = proto::read_line(&mut reader).await.ok()??;
        if line.starts_with("TOKEN ") {
            Some(line)
        } else {
            None
        }
    }

    /// The command loop for one normal handler: reads commands until
    /// EOF or `CLOSE_CONNECTION`, replying per spec §4.1 and §7. Holds
    /// no shared lock across I/O (§4.2).
    async fn dispatch_normal(
        self: Arc<Self>,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        addr: SocketAddr,
        first_line: Option<String>,
        _permit: OwnedSemaphorePermit,
        id: u64,
    ) {
        let _guard = ConnGuard { active: &self.active, id };
        let mut pending = first_line;

        loop {
            let line = match pending.take() {
                Some(line) => line,
                None => match proto::read_line(&mut reader).await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(_) => break,
                },
            };
            if line.is_empty() {
                continue;
            }

            match proto::parse_request(&line) {
                Ok(ParsedRequest::ListFiles) => {
                    if self.reply_list_files(&mut writer).await.is_err() {
                        break;
                    }
                }
                Ok(ParsedRequest::Download { file_id, block_index }) => {
                    if self.reply_download(&mut writer, &file_id, block_index).await.is_err() {
                        break;
                    }
                }
                Ok(ParsedRequest::Md5 { file_id, md5_hex, client_port }) => {
                    if self.reply_md5(&mut writer, addr, &file_id, &md5_hex, client_port).await.is_err() {
                        break;
                    }
                }
                Ok(ParsedRequest::CloseConnection) => break,
                Ok(ParsedRequest::TokenRequest { .. }) | Ok(ParsedRequest::DownloadToken { .. }) => {
                    if proto::write_line(&mut writer, "UNKNOWN_COMMAND").await.is_err() {
                        break;
                    }
                }
                Err(e) => match e.as_wire_line() {
                    Some(wire) => {
                        if proto::write_line(&mut writer, &wire).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn reply_list_files(&self, writer: &mut OwnedWriteHalf) -> std::io::Result<()> {
        for file in &self.catalog {
            proto::write_line(writer, &format!("Name: {}, ID: {}", file.name, file.id)).await?;
        }
        proto::write_line(writer, "END_OF_LIST").await
    }

    async fn reply_download(
        &self,
        writer: &mut OwnedWriteHalf,
        file_id: &str,
        block_index: u64,
    ) -> std::io::Result<()> {
        let Some(file) = self.catalog.iter().find(|f| f.id == file_id) else {
            return proto::write_line(writer, &format!("ERROR: unknown file id {file_id}")).await;
        };
        match catalog::get_block(&file.path, block_index, self.config.b).await {
            Ok(bytes) => proto::write_block(writer, &bytes).await,
            Err(_) => proto::write_line(writer, "ERROR: failed to read block").await,
        }
    }

    async fn reply_md5(
        &self,
        writer: &mut OwnedWriteHalf,
        addr: SocketAddr,
        file_id: &str,
        md5_hex: &str,
        client_port: u16,
    ) -> std::io::Result<()> {
        let Some(file) = self.catalog.iter().find(|f| f.id == file_id) else {
            return proto::write_line(writer, &format!("ERROR: unknown file id {file_id}")).await;
        };
        if file.md5 == md5_hex {
            let peer = TrustedPeer { host: addr.ip().to_string(), port: client_port };
            info!("client {addr} verified {file_id}, registering as trusted peer on port {client_port}");
            self.peers.register(file_id, peer).await;
            proto::write_line(writer, "CORRECT").await
        } else {
            proto::write_line(writer, "WRONG").await
        }
    }
}

fn spawn_chaos_task(server: Arc<Server>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(server.config.t);
        ticker.tick().await; // tokio::time::interval fires its first tick immediately
        loop {
            ticker.tick().await;
            if rand::random::<f64>() < server.config.p && server.active.close_random() {
                debug!("chaos: closed a random connection");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn start_test_server(cs: usize, files_dir: &std::path::Path) -> (Arc<Server>, u16) {
        start_test_server_with(cs, 0.0, Duration::from_secs(3600), files_dir).await
    }

    async fn start_test_server_with(
        cs: usize,
        p: f64,
        t: Duration,
        files_dir: &std::path::Path,
    ) -> (Arc<Server>, u16) {
        let config = ServerConfig {
            port: 0,
            cs,
            p,
            t,
            files_dir: files_dir.to_path_buf(),
            b: 100,
        };
        let server = Server::new(config).await.unwrap();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(Arc::clone(&server).serve(listener));
        (server, port)
    }

    #[tokio::test]
    async fn list_and_download_small_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.bin"), vec![9u8; 250]).await.unwrap();
        let (_server, port) = start_test_server(5, dir.path()).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"LIST_FILES\n").await.unwrap();
        let mut reader = BufReader::new(&mut stream);
        let mut lines = Vec::new();
        loop {
            let line = proto::read_line(&mut reader).await.unwrap().unwrap();
            if line == "END_OF_LIST" {
                break;
            }
            lines.push(line);
        }
        assert_eq!(lines.len(), 1);
        let (_, id) = proto::parse_catalog_line(&lines[0]).unwrap();

        drop(reader);
        stream
            .write_all(format!("DOWNLOAD {id} 0\n").as_bytes())
            .await
            .unwrap();
        let mut reader = BufReader::new(&mut stream);
        let line = proto::read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line, "SENDING");
        let body = proto::read_block_body(&mut reader).await.unwrap();
        assert_eq!(body.len(), 100);
    }

    #[tokio::test]
    async fn unknown_file_id_yields_error_and_keeps_connection_open() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, port) = start_test_server(5, dir.path()).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"DOWNLOAD badid 0\n").await.unwrap();
        let mut reader = BufReader::new(&mut stream);
        let line = proto::read_line(&mut reader).await.unwrap().unwrap();
        assert!(line.starts_with("ERROR:"));

        stream.write_all(b"LIST_FILES\n").await.unwrap();
        let line = proto::read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line, "END_OF_LIST");
    }

    #[tokio::test]
    async fn out_of_range_block_index_yields_zero_length_frame() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.bin"), vec![1u8; 10]).await.unwrap();
        let (server, port) = start_test_server(5, dir.path()).await;
        let id = server.catalog[0].id.clone();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(format!("DOWNLOAD {id} 99\n").as_bytes())
            .await
            .unwrap();
        let mut reader = BufReader::new(&mut stream);
        let line = proto::read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line, "SENDING");
        let body = proto::read_block_body(&mut reader).await.unwrap();
        assert_eq!(body.len(), 0);
    }

    #[tokio::test]
    async fn md5_round_trip_registers_trusted_peer() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.bin"), vec![3u8; 10]).await.unwrap();
        let (server, port) = start_test_server(5, dir.path()).await;
        let file = server.catalog[0].clone();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(format!("MD5 {} {} 9999\n", file.id, file.md5).as_bytes())
            .await
            .unwrap();
        let mut reader = BufReader::new(&mut stream);
        let line = proto::read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line, "CORRECT");

        let snapshot = server.peers.randomized_snapshot(&file.id).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].port, 9999);
    }

    #[tokio::test]
    async fn wrong_md5_is_rejected_and_does_not_register_a_peer() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.bin"), vec![3u8; 10]).await.unwrap();
        let (server, port) = start_test_server(5, dir.path()).await;
        let file = server.catalog[0].clone();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(format!("MD5 {} deadbeef 9999\n", file.id).as_bytes())
            .await
            .unwrap();
        let mut reader = BufReader::new(&mut stream);
        let line = proto::read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line, "WRONG");
        assert_eq!(server.peers.randomized_snapshot(&file.id).await.len(), 0);
    }

    #[tokio::test]
    async fn saturated_pool_redirects_to_trusted_peer() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.bin"), vec![3u8; 10]).await.unwrap();
        let (server, port) = start_test_server(1, dir.path()).await;
        let file_id = server.catalog[0].id.clone();

        // Start a peer that will answer TOKEN_REQUEST.
        let peer_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let peer_port = peer_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = peer_listener.accept().await.unwrap();
            let mut reader = BufReader::new(&mut stream);
            let line = proto::read_line(&mut reader).await.unwrap().unwrap();
            assert!(line.starts_with("TOKEN_REQUEST"));
            proto::write_line(&mut stream, "TOKEN cafef00d 127.0.0.1 9123")
                .await
                .unwrap();
        });
        server
            .peers
            .register(&file_id, TrustedPeer { host: "127.0.0.1".into(), port: peer_port })
            .await;

        // Saturate the one handler slot with a long-lived connection.
        let _hold = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(format!("DOWNLOAD {file_id} 0\n").as_bytes())
            .await
            .unwrap();
        let mut reader = BufReader::new(&mut stream);
        let line = proto::read_line(&mut reader).await.unwrap().unwrap();
        let (token_id, host, port) = proto::parse_token_reply(&line).unwrap();
        assert_eq!(token_id, "cafef00d");
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 9123);
    }

    #[tokio::test]
    async fn chaos_task_eventually_closes_a_live_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, port) =
            start_test_server_with(5, 1.0, Duration::from_millis(20), dir.path()).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("chaos task should have closed the connection within 2s");
        assert_eq!(read.unwrap(), 0, "expected EOF once chaos aborts the handler");
    }
}
