//! The in-process trusted-peer server (role T, spec §4.4).
//!
//! Reuses `server.rs`'s handler-per-connection shape but against a much
//! smaller surface: a client that just verified a download answers
//! `TOKEN_REQUEST`/`DOWNLOAD_TOKEN` for that one file out of its own
//! saved copy, via `catalog::get_block` on the path `catalog::save_file`
//! wrote.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info};
use rand::Rng;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};

use crate::catalog;
use crate::proto::{self, ParsedRequest};
use crate::token::TokenTable;

pub struct TrustedPeerServer {
    port: u16,
    file_id: String,
    saved_path: PathBuf,
    block_size: u64,
    deny_probability: f64,
    tokens: Arc<TokenTable>,
}

impl TrustedPeerServer {
    pub fn new(
        port: u16,
        file_id: String,
        saved_path: PathBuf,
        block_size: u64,
        deny_probability: f64,
    ) -> Self {
        Self {
            port,
            file_id,
            saved_path,
            block_size,
            deny_probability,
            tokens: Arc::new(TokenTable::new()),
        }
    }

    /// Binds the listen socket, starts the token sweeper, and serves
    /// connections forever. Callers typically `tokio::spawn` this.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("binding trusted-peer server to port {}", self.port))?;
        info!("trusted-peer server listening on port {}", self.port);
        Arc::clone(&self.tokens).spawn_sweeper();
        self.serve(listener).await
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("trusted-peer server accepted connection from {addr}");
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle(stream).await;
            });
        }
    }

    async fn handle(&self, stream: TcpStream) {
        let (reader_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        loop {
            let line = match proto::read_line(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => break,
            };
            if line.is_empty() {
                continue;
            }

            match proto::parse_request(&line) {
                Ok(ParsedRequest::TokenRequest { file_id }) => {
                    if self.reply_token_request(&mut writer, &file_id).await.is_err() {
                        break;
                    }
                    // One TOKEN_REQUEST per connection, matching spec.md
                    // §4.1's "single command or simple request/reply".
                    break;
                }
                Ok(ParsedRequest::DownloadToken { token_id, file_id, block_index }) => {
                    if self
                        .reply_download_token(&mut writer, &token_id, &file_id, block_index)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(ParsedRequest::CloseConnection) => break,
                Ok(_) => {
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

    async fn reply_token_request<W>(&self, writer: &mut W, file_id: &str) -> std::io::Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        if rand::thread_rng().gen::<f64>() < self.deny_probability {
            debug!("trusted-peer server denying token request for {file_id}");
            return proto::write_line(writer, "CLIENT DENIED THE TOKEN REQUEST").await;
        }

        let token_id = self.tokens.mint(file_id).await;
        debug!("trusted-peer server minted token {token_id} for {file_id}");
        proto::write_line(writer, &format!("TOKEN {token_id} 127.0.0.1 {}", self.port)).await
    }

    async fn reply_download_token<W>(
        &self,
        writer: &mut W,
        token_id: &str,
        file_id: &str,
        block_index: u64,
    ) -> std::io::Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        if file_id != self.file_id || !self.tokens.validate(token_id, file_id).await {
            return proto::write_line(writer, "INVALID_TOKEN").await;
        }

        match catalog::get_block(&self.saved_path, block_index, self.block_size).await {
            Ok(bytes) => proto::write_block(writer, &bytes).await,
            Err(_) => proto::write_line(writer, "ERROR: failed to read block").await,
        }
    }
}
