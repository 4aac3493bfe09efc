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

//! The outbound proxy leg, acting as an RFB client toward the upstream
//! server.
//!
//! The handshake mirrors the inbound leg with the roles reversed: the
//! upstream announces its version and security menu, the leg authenticates
//! with the session's credential, sends `ClientInit`, and records the
//! `ServerInit` geometry on itself. The run loop then parses server
//! messages, framing `FramebufferUpdate` rectangles with the leg's
//! registered encoding capabilities under its current pixel format.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;

use crate::auth::VncAuth;
use crate::connection::{BoxReader, ConnState};
use crate::encoding::Encoding;
use crate::error::{ProxyError, Result};
use crate::protocol::{
    truncated, ClientInit, PixelFormat, ProtoVersion, ServerInit, ServerMessage,
    MAX_BLOB_LEN, SECURITY_RESULT_OK, SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH,
};
use crate::sink::{Segment, SegmentSink, SinkSet};

/// Credentials and capabilities for the upstream connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Password for the upstream server's VNC authentication. When the
    /// upstream offers both None and VNC authentication, a configured
    /// password selects VNC.
    pub password: Option<String>,
    /// Shared flag sent in `ClientInit`.
    pub shared: bool,
    /// Encoding capabilities registered on the outbound leg, used to frame
    /// incoming rectangle payloads.
    pub encodings: Vec<Encoding>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            password: None,
            shared: true,
            encodings: Encoding::proxy_defaults(),
        }
    }
}

/// The outbound leg of one proxied session.
pub struct ClientConn {
    reader: BoxReader,
    state: Arc<ConnState>,
    sinks: SinkSet,
    quit: watch::Receiver<bool>,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn").finish_non_exhaustive()
    }
}

impl ClientConn {
    /// Runs the client side of the RFB handshake over an established
    /// transport to the upstream server.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AuthenticationFailed`] when no mutually
    /// supported security type exists or the upstream rejects the
    /// credential, [`ProxyError::Protocol`] on handshake violations, and
    /// [`ProxyError::Io`] on transport failure.
    pub async fn connect<S>(
        stream: S,
        config: &ClientConfig,
        quit: watch::Receiver<bool>,
    ) -> Result<ClientConn>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: BoxReader = Box::new(read_half);
        let state = ConnState::new(
            Box::new(write_half),
            PixelFormat::rgba32(),
            config.encodings.clone(),
            0,
            0,
        );

        // The upstream announces first; answer with the same version, the
        // proxy speaks all three.
        let version = ProtoVersion::read_from(&mut reader).await?;
        let mut buf = BytesMut::new();
        version.write_to(&mut buf);
        state.write_frame(&buf).await?;
        state.set_version(version).await;
        debug!("upstream speaks {}", version.as_str().trim_end());

        let chosen = match version {
            // 3.3: the server dictates the security type as a u32.
            ProtoVersion::Rfb33 => {
                let dictated = reader.read_u32().await?;
                match dictated {
                    0 => {
                        let reason = read_reason(&mut reader).await?;
                        return Err(ProxyError::Protocol(format!(
                            "upstream refused the connection: {reason}"
                        )));
                    }
                    t if t == u32::from(SECURITY_TYPE_NONE) => SECURITY_TYPE_NONE,
                    t if t == u32::from(SECURITY_TYPE_VNC_AUTH) => SECURITY_TYPE_VNC_AUTH,
                    other => {
                        return Err(ProxyError::Protocol(format!(
                            "upstream dictated unsupported security type {other}"
                        )))
                    }
                }
            }
            ProtoVersion::Rfb37 | ProtoVersion::Rfb38 => {
                let count = reader.read_u8().await?;
                if count == 0 {
                    let reason = read_reason(&mut reader).await?;
                    return Err(ProxyError::Protocol(format!(
                        "upstream refused the connection: {reason}"
                    )));
                }
                let mut offered = vec![0u8; usize::from(count)];
                reader
                    .read_exact(&mut offered)
                    .await
                    .map_err(|e| truncated(e, "security type list"))?;

                let chosen = if offered.contains(&SECURITY_TYPE_VNC_AUTH)
                    && config.password.is_some()
                {
                    SECURITY_TYPE_VNC_AUTH
                } else if offered.contains(&SECURITY_TYPE_NONE) {
                    SECURITY_TYPE_NONE
                } else {
                    return Err(ProxyError::AuthenticationFailed(format!(
                        "no mutually supported security type in {offered:?}"
                    )));
                };
                state.write_frame(&[chosen]).await?;
                chosen
            }
        };

        if chosen == SECURITY_TYPE_VNC_AUTH {
            let password = config.password.as_deref().ok_or_else(|| {
                ProxyError::AuthenticationFailed("upstream requires a password".to_string())
            })?;
            let mut challenge = [0u8; 16];
            reader
                .read_exact(&mut challenge)
                .await
                .map_err(|e| truncated(e, "authentication challenge"))?;
            let response = VncAuth::new(password).encrypt_challenge(&challenge);
            state.write_frame(&response).await?;
        }

        // No security result follows type None on 3.3 and 3.7.
        let expect_result =
            chosen != SECURITY_TYPE_NONE || version == ProtoVersion::Rfb38;
        if expect_result {
            let result = reader.read_u32().await?;
            if result != SECURITY_RESULT_OK {
                let reason = if version == ProtoVersion::Rfb38 {
                    read_reason(&mut reader).await.unwrap_or_default()
                } else {
                    String::new()
                };
                return Err(ProxyError::AuthenticationFailed(format!(
                    "upstream rejected authentication: {reason}"
                )));
            }
        }

        let mut buf = BytesMut::new();
        ClientInit {
            shared: config.shared,
        }
        .write_to(&mut buf);
        state.write_frame(&buf).await?;

        let server_init = ServerInit::read_from(&mut reader).await?;
        state.set_size(server_init.framebuffer_width, server_init.framebuffer_height);
        state.set_pixel_format(server_init.pixel_format.clone()).await;
        state.set_desktop_name(server_init.name.clone()).await;
        info!(
            "upstream handshake complete: {}x{} \"{}\"",
            server_init.framebuffer_width, server_init.framebuffer_height, server_init.name
        );

        Ok(ClientConn {
            reader,
            state,
            sinks: SinkSet::new(),
            quit,
        })
    }

    /// Shared handle to the leg's state, for sinks and diagnostics.
    pub fn state(&self) -> Arc<ConnState> {
        self.state.clone()
    }

    /// Registers a sink. Only valid before [`ClientConn::run`].
    pub fn add_sink(&mut self, sink: SegmentSink) {
        self.sinks.add(sink);
    }

    /// Drives the leg until quit, EOF, or error, publishing every parsed
    /// server message and a final `ConnectionClosed` to the sinks.
    ///
    /// A clean close (EOF or quit at a message boundary) returns `Ok(())`.
    pub async fn run(mut self) -> Result<()> {
        let result = self.read_loop().await;
        if let Err(e) = self.sinks.consume(&Segment::ConnectionClosed).await {
            debug!("connection-closed delivery failed: {e}");
        }
        match result {
            Err(ProxyError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    async fn read_loop(&mut self) -> Result<()> {
        loop {
            let message_type = tokio::select! {
                _ = self.quit.changed() => return Err(ProxyError::ConnectionClosed),
                read = self.reader.read_u8() => match read {
                    Ok(byte) => byte,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return Err(ProxyError::ConnectionClosed)
                    }
                    Err(e) => return Err(e.into()),
                },
            };

            // Rectangle framing depends on the pixel format most recently
            // forwarded to the upstream, so snapshot it per message.
            let pixel_format = self.state.pixel_format().await;
            let message = match ServerMessage::read_from(
                &mut self.reader,
                message_type,
                &pixel_format,
                self.state.supported(),
            )
            .await
            {
                Ok(message) => message,
                Err(e) => {
                    error!("client leg failed to parse message type {message_type}: {e}");
                    return Err(e);
                }
            };

            self.state.apply_server_message(&message).await;
            debug!("client leg <- message type {message_type}");
            self.sinks.consume(&Segment::ServerMessage(message)).await?;
        }
    }
}

/// Reads the u32-length-prefixed failure reason the RFB handshake attaches
/// to refusals and 3.8 authentication failures.
async fn read_reason(reader: &mut BoxReader) -> Result<String> {
    let length = reader
        .read_u32()
        .await
        .map_err(|e| truncated(e, "failure reason"))? as usize;
    if length > MAX_BLOB_LEN {
        return Err(ProxyError::Protocol(format!(
            "failure reason length {length} exceeds limit"
        )));
    }
    let mut reason = vec![0u8; length];
    reader
        .read_exact(&mut reason)
        .await
        .map_err(|e| truncated(e, "failure reason"))?;
    Ok(String::from_utf8_lossy(&reason).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Rectangle, ENCODING_RAW};
    use crate::sink::probe::Probe;
    use bytes::BufMut;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    async fn upstream_offer_none(upstream: &mut DuplexStream) {
        upstream.write_all(b"RFB 003.008\n").await.unwrap();
        let mut version = [0u8; 12];
        upstream.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, b"RFB 003.008\n");

        upstream.write_all(&[1, SECURITY_TYPE_NONE]).await.unwrap();
        let mut choice = [0u8; 1];
        upstream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice[0], SECURITY_TYPE_NONE);
        upstream
            .write_all(&SECURITY_RESULT_OK.to_be_bytes())
            .await
            .unwrap();
    }

    async fn upstream_send_init(upstream: &mut DuplexStream) {
        let mut shared = [0u8; 1];
        upstream.read_exact(&mut shared).await.unwrap();
        assert_eq!(shared[0], 1);

        let mut buf = BytesMut::new();
        ServerInit {
            framebuffer_width: 1024,
            framebuffer_height: 768,
            pixel_format: PixelFormat::rgba32(),
            name: "workDesk".to_string(),
        }
        .write_to(&mut buf);
        upstream.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_records_server_init() {
        let (proxy_side, mut upstream) = tokio::io::duplex(4096);
        let (_quit_tx, quit_rx) = watch::channel(false);

        let connect = tokio::spawn(async move {
            ClientConn::connect(proxy_side, &ClientConfig::default(), quit_rx).await
        });

        upstream_offer_none(&mut upstream).await;
        upstream_send_init(&mut upstream).await;

        let conn = connect.await.unwrap().unwrap();
        let state = conn.state();
        assert_eq!(state.width(), 1024);
        assert_eq!(state.height(), 768);
        assert_eq!(state.desktop_name().await, "workDesk");
        assert_eq!(state.pixel_format().await, PixelFormat::rgba32());
    }

    #[tokio::test]
    async fn test_connect_answers_vnc_challenge() {
        let (proxy_side, mut upstream) = tokio::io::duplex(4096);
        let (_quit_tx, quit_rx) = watch::channel(false);
        let config = ClientConfig {
            password: Some("secret".to_string()),
            ..ClientConfig::default()
        };

        let connect =
            tokio::spawn(async move { ClientConn::connect(proxy_side, &config, quit_rx).await });

        upstream.write_all(b"RFB 003.008\n").await.unwrap();
        let mut version = [0u8; 12];
        upstream.read_exact(&mut version).await.unwrap();

        // Password configured, so the leg must pick VNC authentication.
        upstream
            .write_all(&[2, SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH])
            .await
            .unwrap();
        let mut choice = [0u8; 1];
        upstream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice[0], SECURITY_TYPE_VNC_AUTH);

        let challenge = [0x07u8; 16];
        upstream.write_all(&challenge).await.unwrap();
        let mut response = [0u8; 16];
        upstream.read_exact(&mut response).await.unwrap();
        assert_eq!(
            response,
            VncAuth::new("secret").encrypt_challenge(&challenge)
        );
        upstream
            .write_all(&SECURITY_RESULT_OK.to_be_bytes())
            .await
            .unwrap();

        upstream_send_init(&mut upstream).await;
        connect.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_fails_on_rejected_auth() {
        let (proxy_side, mut upstream) = tokio::io::duplex(4096);
        let (_quit_tx, quit_rx) = watch::channel(false);
        let config = ClientConfig {
            password: Some("wrong".to_string()),
            ..ClientConfig::default()
        };

        let connect =
            tokio::spawn(async move { ClientConn::connect(proxy_side, &config, quit_rx).await });

        upstream.write_all(b"RFB 003.008\n").await.unwrap();
        let mut version = [0u8; 12];
        upstream.read_exact(&mut version).await.unwrap();
        upstream
            .write_all(&[1, SECURITY_TYPE_VNC_AUTH])
            .await
            .unwrap();
        let mut choice = [0u8; 1];
        upstream.read_exact(&mut choice).await.unwrap();
        upstream.write_all(&[0x55u8; 16]).await.unwrap();
        let mut response = [0u8; 16];
        upstream.read_exact(&mut response).await.unwrap();

        let mut failure = BytesMut::new();
        failure.put_u32(1);
        let reason = b"bad password";
        failure.put_u32(reason.len() as u32);
        failure.put_slice(reason);
        upstream.write_all(&failure).await.unwrap();

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::AuthenticationFailed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_run_loop_parses_framebuffer_update() {
        let (proxy_side, mut upstream) = tokio::io::duplex(4096);
        let (_quit_tx, quit_rx) = watch::channel(false);

        let connect = tokio::spawn(async move {
            ClientConn::connect(proxy_side, &ClientConfig::default(), quit_rx).await
        });
        upstream_offer_none(&mut upstream).await;
        upstream_send_init(&mut upstream).await;

        let mut conn = connect.await.unwrap().unwrap();
        let (log, mut entries) = mpsc::unbounded_channel();
        conn.add_sink(SegmentSink::Probe(Probe {
            id: 1,
            fail: false,
            log,
        }));
        let run = tokio::spawn(conn.run());

        let mut buf = BytesMut::new();
        ServerMessage::FramebufferUpdate(vec![Rectangle {
            x: 0,
            y: 0,
            width: 2,
            height: 2,
            encoding: ENCODING_RAW,
            payload: vec![0xab; 2 * 2 * 4],
        }])
        .write_to(&mut buf);
        ServerMessage::Bell.write_to(&mut buf);
        upstream.write_all(&buf).await.unwrap();

        drop(upstream);
        run.await.unwrap().unwrap();

        let mut deliveries = 0;
        while entries.recv().await.is_some() {
            deliveries += 1;
        }
        assert_eq!(deliveries, 3, "update, bell, and connection-closed");
    }
}
