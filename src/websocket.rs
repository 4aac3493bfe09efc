// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Server-side WebSocket support for RFB-over-WS ingress.
//!
//! [`accept`] performs the RFC 6455 upgrade on a fresh TCP connection and
//! returns the request path (which carries the session id) together with a
//! [`WsStream`] adapter. The adapter exposes the WebSocket as a plain duplex
//! byte channel: binary frames from the client are unmasked and concatenated
//! into the read stream, text frames are dropped, ping and close frames are
//! answered at the framing layer, and every write goes out as one unmasked
//! binary frame. The RFB legs stay transport-agnostic.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, BufMut, BytesMut};
use log::debug;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{ProxyError, Result};
use crate::protocol::MAX_BLOB_LEN;

/// Fixed GUID appended to the client key for `Sec-WebSocket-Accept`.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound for the HTTP upgrade request.
const MAX_HANDSHAKE_LEN: usize = 16 * 1024;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xa;

/// Performs the server side of the WebSocket upgrade.
///
/// Returns the adapter plus the request path, whose part after the leading
/// slash names the session in multi-session mode.
///
/// # Errors
///
/// Returns [`ProxyError::Protocol`] for requests that are not a well-formed
/// WebSocket upgrade (a 400 response is sent first) and [`ProxyError::Io`]
/// on transport failure.
pub async fn accept<S>(mut stream: S) -> Result<(WsStream<S>, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(ProxyError::Protocol(
                "oversized WebSocket upgrade request".to_string(),
            ));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ProxyError::ConnectionClosed);
        }
    };

    let header = buf.split_to(header_end + 4);
    let text = String::from_utf8_lossy(&header);
    let lines: Vec<&str> = text.split("\r\n").collect();

    match parse_upgrade(&lines) {
        Ok((path, key)) => {
            let accept_key = accept_key(key);
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
            );
            stream.write_all(response.as_bytes()).await?;
            debug!("websocket upgrade complete for path {path}");
            // Frames pipelined behind the request stay buffered.
            Ok((WsStream::new(stream, buf), path))
        }
        Err(e) => {
            let response = "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
            stream.write_all(response.as_bytes()).await.ok();
            Err(e)
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Validates the upgrade request and extracts the path and client key.
fn parse_upgrade<'a>(lines: &[&'a str]) -> Result<(String, &'a str)> {
    let mut request = lines
        .first()
        .ok_or_else(|| ProxyError::Protocol("empty upgrade request".to_string()))?
        .split_whitespace();
    let method = request.next().unwrap_or_default();
    let path = request.next().unwrap_or_default();
    let http_version = request.next().unwrap_or_default();
    if method != "GET" || http_version != "HTTP/1.1" {
        return Err(ProxyError::Protocol(format!(
            "not a websocket upgrade: {method} {http_version}"
        )));
    }

    let upgrade = header_value(lines, "Upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(ProxyError::Protocol("missing Upgrade: websocket".to_string()));
    }
    if header_value(lines, "Sec-WebSocket-Version") != Some("13") {
        return Err(ProxyError::Protocol(
            "unsupported websocket version".to_string(),
        ));
    }
    let key = header_value(lines, "Sec-WebSocket-Key")
        .ok_or_else(|| ProxyError::Protocol("missing Sec-WebSocket-Key".to_string()))?;
    Ok((path.to_string(), key))
}

fn header_value<'a>(lines: &[&'a str], name: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// `Sec-WebSocket-Accept` digest for a client key.
fn accept_key(key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(digest.finalize())
}

/// A WebSocket presented as a plain byte-duplex channel.
pub struct WsStream<S> {
    inner: S,
    /// Raw frame bytes not yet parsed.
    incoming: BytesMut,
    /// Unmasked payload bytes ready for the reader.
    decoded: BytesMut,
    /// Encoded frames not yet written to the transport.
    outgoing: BytesMut,
    /// Whether the fragmented message in progress carries binary data.
    fragment_binary: bool,
    peer_closed: bool,
}

impl<S> WsStream<S> {
    fn new(inner: S, leftover: BytesMut) -> Self {
        Self {
            inner,
            incoming: leftover,
            decoded: BytesMut::new(),
            outgoing: BytesMut::new(),
            fragment_binary: false,
            peer_closed: false,
        }
    }

    /// Parses one complete frame out of `incoming`, routing its payload.
    /// Returns `Ok(false)` when more raw bytes are needed.
    fn take_frame(&mut self) -> io::Result<bool> {
        if self.incoming.len() < 2 {
            return Ok(false);
        }
        let opcode = self.incoming[0] & 0x0f;
        let length_hint = self.incoming[1] & 0x7f;
        let masked = self.incoming[1] & 0x80 != 0;

        let (header_len, payload_len) = match length_hint {
            126 => {
                if self.incoming.len() < 4 {
                    return Ok(false);
                }
                (4, u64::from(u16::from_be_bytes([self.incoming[2], self.incoming[3]])))
            }
            127 => {
                if self.incoming.len() < 10 {
                    return Ok(false);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.incoming[2..10]);
                (10, u64::from_be_bytes(bytes))
            }
            hint => (2, u64::from(hint)),
        };

        if payload_len > MAX_BLOB_LEN as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "websocket frame exceeds size limit",
            ));
        }
        if !masked {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "client frame is not masked",
            ));
        }

        let payload_len = payload_len as usize;
        let total = header_len + 4 + payload_len;
        if self.incoming.len() < total {
            return Ok(false);
        }

        self.incoming.advance(header_len);
        let mut mask = [0u8; 4];
        mask.copy_from_slice(&self.incoming[..4]);
        self.incoming.advance(4);
        let mut payload = self.incoming.split_to(payload_len);
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i & 3];
        }

        match opcode {
            OPCODE_BINARY => {
                self.fragment_binary = true;
                self.decoded.unsplit(payload);
            }
            OPCODE_CONTINUATION => {
                if self.fragment_binary {
                    self.decoded.unsplit(payload);
                }
            }
            // RFB never travels in text frames; drop them.
            OPCODE_TEXT => {
                self.fragment_binary = false;
            }
            OPCODE_PING => {
                encode_frame(&mut self.outgoing, OPCODE_PONG, &payload);
            }
            OPCODE_PONG => {}
            OPCODE_CLOSE => {
                encode_frame(&mut self.outgoing, OPCODE_CLOSE, &payload);
                self.peer_closed = true;
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported websocket opcode {other}"),
                ));
            }
        }
        Ok(true)
    }
}

impl<S: AsyncWrite + Unpin> WsStream<S> {
    /// Writes as much of `outgoing` as the transport accepts right now.
    fn try_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outgoing.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.outgoing) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.outgoing.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

fn encode_frame(out: &mut BytesMut, opcode: u8, payload: &[u8]) {
    out.put_u8(0x80 | opcode); // FIN set, server frames are unfragmented
    if payload.len() < 126 {
        out.put_u8(payload.len() as u8);
    } else if payload.len() <= usize::from(u16::MAX) {
        out.put_u8(126);
        out.put_u16(payload.len() as u16);
    } else {
        out.put_u8(127);
        out.put_u64(payload.len() as u64);
    }
    out.put_slice(payload);
}

impl<S: AsyncRead + Unpin> AsyncRead for WsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.decoded.is_empty() {
                let n = this.decoded.len().min(buf.remaining());
                buf.put_slice(&this.decoded.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.peer_closed {
                return Poll::Ready(Ok(())); // EOF
            }
            if this.take_frame()? {
                continue;
            }
            let mut chunk = [0u8; 4096];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    if read_buf.filled().is_empty() {
                        this.peer_closed = true;
                    } else {
                        this.incoming.extend_from_slice(read_buf.filled());
                    }
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        encode_frame(&mut this.outgoing, OPCODE_BINARY, buf);
        // Opportunistic drain; poll_flush completes whatever is left.
        if let Poll::Ready(Err(e)) = this.try_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.try_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.try_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut frame = vec![0x80 | opcode];
        assert!(payload.len() < 126);
        frame.push(0x80 | payload.len() as u8);
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
        frame
    }

    async fn upgraded_pair() -> (WsStream<DuplexStream>, DuplexStream, String) {
        let (proxy_side, mut client) = tokio::io::duplex(8192);
        let accept_task = tokio::spawn(accept(proxy_side));

        let request = "GET /session42 HTTP/1.1\r\n\
                       Host: proxy\r\n\
                       Upgrade: websocket\r\n\
                       Connection: Upgrade\r\n\
                       Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = vec![0u8; 1024];
        let n = client.read(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response[..n]).into_owned();
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        let (ws, path) = accept_task.await.unwrap().unwrap();
        (ws, client, path)
    }

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn test_upgrade_and_binary_read() {
        let (mut ws, mut client, path) = upgraded_pair().await;
        assert_eq!(path, "/session42");

        client
            .write_all(&masked_frame(OPCODE_BINARY, b"RFB bytes"))
            .await
            .unwrap();
        let mut plain = [0u8; 9];
        ws.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, b"RFB bytes");
    }

    #[tokio::test]
    async fn test_text_frames_are_ignored() {
        let (mut ws, mut client, _path) = upgraded_pair().await;

        client
            .write_all(&masked_frame(OPCODE_TEXT, b"chatter"))
            .await
            .unwrap();
        client
            .write_all(&masked_frame(OPCODE_BINARY, b"\x05\x01\x02"))
            .await
            .unwrap();

        let mut plain = [0u8; 3];
        ws.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, b"\x05\x01\x02");
    }

    #[tokio::test]
    async fn test_writes_become_binary_frames() {
        let (mut ws, mut client, _path) = upgraded_pair().await;

        ws.write_all(b"RFB 003.008\n").await.unwrap();
        ws.flush().await.unwrap();

        let mut frame = [0u8; 14];
        client.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], 0x80 | OPCODE_BINARY);
        assert_eq!(frame[1], 12); // unmasked, 12-byte payload
        assert_eq!(&frame[2..], b"RFB 003.008\n");
    }

    #[tokio::test]
    async fn test_close_frame_reads_as_eof() {
        let (mut ws, mut client, _path) = upgraded_pair().await;

        client
            .write_all(&masked_frame(OPCODE_CLOSE, &[0x03, 0xe8]))
            .await
            .unwrap();
        let mut sink = Vec::new();
        let n = ws.read_to_end(&mut sink).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_rejected() {
        let (mut ws, mut client, _path) = upgraded_pair().await;

        client.write_all(&[0x82, 0x01, 0xff]).await.unwrap();
        let mut byte = [0u8; 1];
        let err = ws.read_exact(&mut byte).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_non_upgrade_request_rejected() {
        let (proxy_side, mut client) = tokio::io::duplex(8192);
        let accept_task = tokio::spawn(accept(proxy_side));

        client
            .write_all(b"POST /x HTTP/1.1\r\nHost: proxy\r\n\r\n")
            .await
            .unwrap();
        let mut response = vec![0u8; 256];
        let n = client.read(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response[..n]).starts_with("HTTP/1.1 400"));
        assert!(accept_task.await.unwrap().is_err());
    }
}
