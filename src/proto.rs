//! The mixed text/binary wire protocol (spec §4.1).
//!
//! A single `BufReader` is used for both line reads and the fixed-length
//! binary reads that follow a `SENDING` line, exactly once per stream --
//! this is the "byte-level reader that does not buffer past the newline"
//! invariant: buffering *inside* one shared reader is fine, the bug the
//! spec warns about is splitting line- and binary-reads across readers
//! that don't share state. Grounded on `tracker.rs::PeerMessageReader`
//! (fixed-size header read, then an exact-length payload read on the
//! same stream).

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use crate::error::ProtocolError;

/// One parsed command line, independent of which role (S or T) receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRequest {
    ListFiles,
    Download { file_id: String, block_index: u64 },
    Md5 { file_id: String, md5_hex: String, client_port: u16 },
    TokenRequest { file_id: String },
    DownloadToken { token_id: String, file_id: String, block_index: u64 },
    CloseConnection,
}

/// Splits on whitespace, uppercases the verb, and dispatches to the
/// per-verb arity parser. Unknown verbs and bad numeric fields are
/// distinct `ProtocolError` variants so the caller can pick the right
/// wire reply without the connection being torn down.
pub fn parse_request(line: &str) -> Result<ParsedRequest, ProtocolError> {
    let mut fields = line.split_whitespace();
    let verb = fields
        .next()
        .ok_or_else(|| ProtocolError::Malformed("empty command".to_string()))?
        .to_uppercase();

    match verb.as_str() {
        "LIST_FILES" => Ok(ParsedRequest::ListFiles),
        "CLOSE_CONNECTION" => Ok(ParsedRequest::CloseConnection),
        "DOWNLOAD" => {
            let file_id = next_field(&mut fields, "DOWNLOAD")?;
            let block_index = parse_u64(next_field(&mut fields, "DOWNLOAD")?.as_str())?;
            Ok(ParsedRequest::Download { file_id, block_index })
        }
        "MD5" => {
            let file_id = next_field(&mut fields, "MD5")?;
            let md5_hex = next_field(&mut fields, "MD5")?;
            let client_port = parse_u16(next_field(&mut fields, "MD5")?.as_str())?;
            Ok(ParsedRequest::Md5 { file_id, md5_hex, client_port })
        }
        "TOKEN_REQUEST" => {
            let file_id = next_field(&mut fields, "TOKEN_REQUEST")?;
            Ok(ParsedRequest::TokenRequest { file_id })
        }
        "DOWNLOAD_TOKEN" => {
            let token_id = next_field(&mut fields, "DOWNLOAD_TOKEN")?;
            let file_id = next_field(&mut fields, "DOWNLOAD_TOKEN")?;
            let block_index = parse_u64(next_field(&mut fields, "DOWNLOAD_TOKEN")?.as_str())?;
            Ok(ParsedRequest::DownloadToken { token_id, file_id, block_index })
        }
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

fn next_field(
    fields: &mut std::str::SplitWhitespace<'_>,
    verb: &str,
) -> Result<String, ProtocolError> {
    fields
        .next()
        .map(|s| s.to_string())
        .ok_or_else(|| ProtocolError::Malformed(format!("{verb}: missing argument")))
}

fn parse_u64(s: &str) -> Result<u64, ProtocolError> {
    s.parse()
        .map_err(|_| ProtocolError::Malformed(format!("not a number: {s}")))
}

fn parse_u16(s: &str) -> Result<u16, ProtocolError> {
    s.parse()
        .map_err(|_| ProtocolError::Malformed(format!("not a port: {s}")))
}

/// Reads one newline-terminated line, tolerating a trailing `\r`.
/// `Ok(None)` means clean EOF before any bytes were read.
pub async fn read_line<R: AsyncBufRead>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: Unpin,
{
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(Some(buf))
}

use tokio::io::AsyncBufRead;

pub async fn write_line<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Writes a `SENDING` line followed by the 4-byte big-endian length
/// prefix and the block bytes themselves (possibly zero bytes).
pub async fn write_block<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    block: &[u8],
) -> std::io::Result<()> {
    writer.write_all(b"SENDING\n").await?;
    let len = block.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(block).await?;
    writer.flush().await
}

/// Reads exactly one `SENDING` frame's body, given that the `SENDING`
/// line itself has already been consumed by the caller.
pub async fn read_block_body<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Parses a `TOKEN <id> <host> <port>` reply line.
pub fn parse_token_reply(line: &str) -> Result<(String, String, u16)> {
    let mut fields = line.split_whitespace();
    let verb = fields.next().unwrap_or_default();
    if verb != "TOKEN" {
        bail!("not a TOKEN reply: {line}");
    }
    let token_id = fields.next().ok_or_else(|| anyhow::anyhow!("missing token id in {line}"))?;
    let host = fields.next().ok_or_else(|| anyhow::anyhow!("missing host in {line}"))?;
    let port: u16 = fields
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing port in {line}"))?
        .parse()?;
    Ok((token_id.to_string(), host.to_string(), port))
}

/// Parses a `Name: <name>, ID: <id>` catalog line (§6).
pub fn parse_catalog_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("Name: ")?;
    let (name, id_part) = rest.split_once(", ID: ")?;
    Some((name.to_string(), id_part.to_string()))
}
