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

//! The inbound proxy leg, acting as an RFB server.
//!
//! # Protocol Flow
//!
//! 1. **Handshake**: version exchange, security negotiation, `ClientInit`,
//!    `ServerInit` built from the configured display parameters.
//! 2. **Message Loop**: read one type byte, parse the message, apply per-leg
//!    state changes, publish the segment to the leg's sinks.
//!
//! The loop exits on the quit signal, on EOF at a message boundary, or on a
//! protocol/transport error, and always publishes `ConnectionClosed` last.

use std::io;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;

use crate::auth::VncAuth;
use crate::connection::{BoxReader, ConnState};
use crate::encoding::Encoding;
use crate::error::{ProxyError, Result};
use crate::protocol::{
    truncated, ClientInit, ClientMessage, PixelFormat, ProtoVersion, ServerInit,
    SECURITY_RESULT_FAILED, SECURITY_RESULT_OK, SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH,
};
use crate::sink::{Segment, SegmentSink, SinkSet};

/// Display parameters and security policy offered to inbound clients.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Password required from inbound clients; `None` offers security type
    /// None instead of VNC authentication.
    pub password: Option<String>,
    /// Encoding capabilities registered on the inbound leg.
    pub encodings: Vec<Encoding>,
    /// Pixel format announced in `ServerInit`.
    pub pixel_format: PixelFormat,
    /// Desktop name announced in `ServerInit`.
    pub desktop_name: String,
    /// Framebuffer width announced in `ServerInit`.
    pub width: u16,
    /// Framebuffer height announced in `ServerInit`.
    pub height: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            password: None,
            encodings: vec![Encoding::Raw, Encoding::Tight, Encoding::CopyRect],
            pixel_format: PixelFormat::rgba32(),
            desktop_name: "workDesk".to_string(),
            width: 1024,
            height: 768,
        }
    }
}

/// The inbound leg of one proxied session.
pub struct ServerConn {
    reader: BoxReader,
    state: Arc<ConnState>,
    sinks: SinkSet,
    quit: watch::Receiver<bool>,
    shared: bool,
}

impl std::fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConn").finish_non_exhaustive()
    }
}

impl ServerConn {
    /// Runs the server side of the RFB handshake on a fresh inbound
    /// transport and returns the leg ready to run.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AuthenticationFailed`] when the client fails
    /// VNC authentication, [`ProxyError::Protocol`] on handshake violations,
    /// and [`ProxyError::Io`] on transport failure. The connection is left
    /// to the caller to drop.
    pub async fn handshake<S>(
        stream: S,
        config: &ServerConfig,
        session_id: String,
        quit: watch::Receiver<bool>,
    ) -> Result<ServerConn>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: BoxReader = Box::new(read_half);
        let state = ConnState::new(
            Box::new(write_half),
            config.pixel_format.clone(),
            config.encodings.clone(),
            config.width,
            config.height,
        );
        state.set_session_id(session_id).await;
        state.set_desktop_name(config.desktop_name.clone()).await;

        // Version exchange: offer 3.8, accept whichever published version
        // the client answers with.
        let mut buf = BytesMut::new();
        ProtoVersion::Rfb38.write_to(&mut buf);
        state.write_frame(&buf).await?;
        let version = ProtoVersion::read_from(&mut reader).await?;
        state.set_version(version).await;
        debug!("inbound client speaks {}", version.as_str().trim_end());

        let security_type = if config.password.is_some() {
            SECURITY_TYPE_VNC_AUTH
        } else {
            SECURITY_TYPE_NONE
        };

        match version {
            // 3.3: the server dictates the type as a u32, no client choice.
            ProtoVersion::Rfb33 => {
                let mut buf = BytesMut::new();
                buf.put_u32(u32::from(security_type));
                state.write_frame(&buf).await?;
            }
            ProtoVersion::Rfb37 | ProtoVersion::Rfb38 => {
                state.write_frame(&[1, security_type]).await?;
                let choice = reader.read_u8().await?;
                if choice != security_type {
                    if version == ProtoVersion::Rfb38 {
                        let mut buf = BytesMut::new();
                        buf.put_u32(SECURITY_RESULT_FAILED);
                        let reason = b"security type not offered";
                        buf.put_u32(reason.len() as u32);
                        buf.put_slice(reason);
                        state.write_frame(&buf).await.ok();
                    }
                    return Err(ProxyError::Protocol(format!(
                        "client chose security type {choice}, offered {security_type}"
                    )));
                }
            }
        }

        if let Some(password) = &config.password {
            Self::authenticate(&mut reader, &state, password, version).await?;
        } else if version == ProtoVersion::Rfb38 {
            // Security type None still gets an explicit result on 3.8.
            let mut buf = BytesMut::new();
            buf.put_u32(SECURITY_RESULT_OK);
            state.write_frame(&buf).await?;
        }

        let client_init = ClientInit::read_from(&mut reader).await?;
        debug!("inbound ClientInit shared={}", client_init.shared);

        let server_init = ServerInit {
            framebuffer_width: config.width,
            framebuffer_height: config.height,
            pixel_format: config.pixel_format.clone(),
            name: config.desktop_name.clone(),
        };
        let mut buf = BytesMut::new();
        server_init.write_to(&mut buf);
        state.write_frame(&buf).await?;

        info!(
            "server leg handshake complete ({}x{} \"{}\")",
            config.width, config.height, config.desktop_name
        );

        Ok(ServerConn {
            reader,
            state,
            sinks: SinkSet::new(),
            quit,
            shared: client_init.shared,
        })
    }

    /// The shared flag the inbound client sent in `ClientInit`, forwarded
    /// as sent when the upstream leg introduces itself.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Challenge-response check of the inbound client's password.
    async fn authenticate(
        reader: &mut BoxReader,
        state: &ConnState,
        password: &str,
        version: ProtoVersion,
    ) -> Result<()> {
        let challenge = VncAuth::generate_challenge();
        state.write_frame(&challenge).await?;

        let mut response = [0u8; 16];
        reader
            .read_exact(&mut response)
            .await
            .map_err(|e| truncated(e, "authentication response"))?;

        if VncAuth::new(password).verify_response(&challenge, &response) {
            let mut buf = BytesMut::new();
            buf.put_u32(SECURITY_RESULT_OK);
            state.write_frame(&buf).await?;
            Ok(())
        } else {
            let mut buf = BytesMut::new();
            buf.put_u32(SECURITY_RESULT_FAILED);
            if version == ProtoVersion::Rfb38 {
                let reason = b"authentication failed";
                buf.put_u32(reason.len() as u32);
                buf.put_slice(reason);
            }
            state.write_frame(&buf).await?;
            Err(ProxyError::AuthenticationFailed(
                "inbound client sent a bad challenge response".to_string(),
            ))
        }
    }

    /// Shared handle to the leg's state, for sinks and diagnostics.
    pub fn state(&self) -> Arc<ConnState> {
        self.state.clone()
    }

    /// Registers a sink. Only valid before [`ServerConn::run`].
    pub fn add_sink(&mut self, sink: SegmentSink) {
        self.sinks.add(sink);
    }

    /// Drives the leg until quit, EOF, or error, publishing every parsed
    /// message and a final `ConnectionClosed` to the sinks.
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

            let message = match ClientMessage::read_from(&mut self.reader, message_type).await {
                Ok(message) => message,
                Err(e) => {
                    error!("server leg failed to parse message type {message_type}: {e}");
                    return Err(e);
                }
            };

            if let ClientMessage::SetPixelFormat(format) = &message {
                if !format.is_valid() {
                    return Err(ProxyError::Protocol(format!(
                        "client requested unsupported pixel format ({}bpp, depth {})",
                        format.bits_per_pixel, format.depth
                    )));
                }
            }

            self.state.apply_client_message(&message).await;
            debug!("server leg <- message type {message_type}");
            self.sinks.consume(&Segment::ClientMessage(message)).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::probe::Probe;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    fn quit_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    async fn client_version_exchange(client: &mut DuplexStream) {
        let mut version = [0u8; 12];
        client.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, b"RFB 003.008\n");
        client.write_all(b"RFB 003.008\n").await.unwrap();
    }

    async fn client_finish_init(client: &mut DuplexStream) -> ServerInit {
        client.write_all(&[1]).await.unwrap(); // ClientInit shared=1
        ServerInit::read_from(client).await.unwrap()
    }

    #[tokio::test]
    async fn test_handshake_no_auth() {
        let (proxy_side, mut client) = tokio::io::duplex(4096);
        let (_quit_tx, quit_rx) = quit_pair();
        let config = ServerConfig::default();

        let handshake = tokio::spawn(async move {
            ServerConn::handshake(proxy_side, &config, "s1".to_string(), quit_rx).await
        });

        client_version_exchange(&mut client).await;
        let mut offer = [0u8; 2];
        client.read_exact(&mut offer).await.unwrap();
        assert_eq!(offer, [1, SECURITY_TYPE_NONE]);
        client.write_all(&[SECURITY_TYPE_NONE]).await.unwrap();
        let mut result = [0u8; 4];
        client.read_exact(&mut result).await.unwrap();
        assert_eq!(u32::from_be_bytes(result), SECURITY_RESULT_OK);

        let init = client_finish_init(&mut client).await;
        assert_eq!(init.framebuffer_width, 1024);
        assert_eq!(init.framebuffer_height, 768);
        assert_eq!(init.name, "workDesk");

        let conn = handshake.await.unwrap().unwrap();
        assert_eq!(conn.state().version().await, ProtoVersion::Rfb38);
    }

    #[tokio::test]
    async fn test_handshake_vnc_auth_success() {
        let (proxy_side, mut client) = tokio::io::duplex(4096);
        let (_quit_tx, quit_rx) = quit_pair();
        let config = ServerConfig {
            password: Some("secret".to_string()),
            ..ServerConfig::default()
        };

        let handshake = tokio::spawn(async move {
            ServerConn::handshake(proxy_side, &config, "s1".to_string(), quit_rx).await
        });

        client_version_exchange(&mut client).await;
        let mut offer = [0u8; 2];
        client.read_exact(&mut offer).await.unwrap();
        assert_eq!(offer, [1, SECURITY_TYPE_VNC_AUTH]);
        client.write_all(&[SECURITY_TYPE_VNC_AUTH]).await.unwrap();

        let mut challenge = [0u8; 16];
        client.read_exact(&mut challenge).await.unwrap();
        let response = VncAuth::new("secret").encrypt_challenge(&challenge);
        client.write_all(&response).await.unwrap();

        let mut result = [0u8; 4];
        client.read_exact(&mut result).await.unwrap();
        assert_eq!(u32::from_be_bytes(result), SECURITY_RESULT_OK);

        client_finish_init(&mut client).await;
        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_vnc_auth_failure() {
        let (proxy_side, mut client) = tokio::io::duplex(4096);
        let (_quit_tx, quit_rx) = quit_pair();
        let config = ServerConfig {
            password: Some("secret".to_string()),
            ..ServerConfig::default()
        };

        let handshake = tokio::spawn(async move {
            ServerConn::handshake(proxy_side, &config, "s1".to_string(), quit_rx).await
        });

        client_version_exchange(&mut client).await;
        let mut offer = [0u8; 2];
        client.read_exact(&mut offer).await.unwrap();
        client.write_all(&[SECURITY_TYPE_VNC_AUTH]).await.unwrap();

        let mut challenge = [0u8; 16];
        client.read_exact(&mut challenge).await.unwrap();
        let response = VncAuth::new("wrong").encrypt_challenge(&challenge);
        client.write_all(&response).await.unwrap();

        let mut result = [0u8; 4];
        client.read_exact(&mut result).await.unwrap();
        assert_eq!(u32::from_be_bytes(result), SECURITY_RESULT_FAILED);
        let mut reason_len = [0u8; 4];
        client.read_exact(&mut reason_len).await.unwrap();
        let mut reason = vec![0u8; u32::from_be_bytes(reason_len) as usize];
        client.read_exact(&mut reason).await.unwrap();

        let err = handshake.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_run_loop_publishes_messages_and_close() {
        let (proxy_side, mut client) = tokio::io::duplex(4096);
        let (_quit_tx, quit_rx) = quit_pair();
        let config = ServerConfig::default();

        let handshake = tokio::spawn(async move {
            ServerConn::handshake(proxy_side, &config, "s1".to_string(), quit_rx).await
        });

        client_version_exchange(&mut client).await;
        let mut offer = [0u8; 2];
        client.read_exact(&mut offer).await.unwrap();
        client.write_all(&[SECURITY_TYPE_NONE]).await.unwrap();
        let mut result = [0u8; 4];
        client.read_exact(&mut result).await.unwrap();
        client_finish_init(&mut client).await;

        let mut conn = handshake.await.unwrap().unwrap();
        let (log, mut entries) = mpsc::unbounded_channel();
        conn.add_sink(SegmentSink::Probe(Probe {
            id: 7,
            fail: false,
            log,
        }));
        let state = conn.state();
        let run = tokio::spawn(conn.run());

        // SetEncodings filters against the leg's registered capabilities.
        let mut buf = BytesMut::new();
        ClientMessage::SetEncodings(vec![7, 99, 0]).write_to(&mut buf);
        client.write_all(&buf).await.unwrap();

        let mut buf = BytesMut::new();
        ClientMessage::KeyEvent { down: true, key: 0x41 }.write_to(&mut buf);
        client.write_all(&buf).await.unwrap();

        drop(client); // EOF at a message boundary is a clean close
        run.await.unwrap().unwrap();

        assert_eq!(state.encodings().await, vec![Encoding::Tight, Encoding::Raw]);

        // Two messages plus ConnectionClosed reached the sink, in order.
        let mut deliveries = 0;
        while entries.recv().await.is_some() {
            deliveries += 1;
        }
        assert_eq!(deliveries, 3);
    }
}
