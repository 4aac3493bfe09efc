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

//! The proxy orchestrator.
//!
//! [`VncProxy`] owns the ingress listeners and, per inbound connection,
//! builds one session: it completes the server-leg handshake, resolves the
//! session, opens the recorder when the session asks for one, dials the
//! upstream target, runs the client-leg handshake, cross-wires the two
//! fan-outs, and drives both run loops. When either leg returns, the other
//! is signalled to quit, the sockets and recorder are closed, and the
//! session status records how it ended.
//!
//! Per-connection failures are logged and contained; only a listener-level
//! transport error terminates an ingress loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinError;

use crate::client::{ClientConfig, ClientConn};
use crate::error::{ProxyError, Result};
use crate::protocol::PixelFormat;
use crate::recorder::{LegTag, Recorder};
use crate::server::{ServerConfig, ServerConn};
use crate::session::{Session, SessionKind, SessionRegistry, SessionStatus};
use crate::sink::SegmentSink;
use crate::websocket;

use tokio::io::{AsyncRead, AsyncWrite};

/// Session id assigned to raw TCP ingress, which has no path to carry one.
const TCP_SESSION_ID: &str = "dummySession";

/// Listening endpoints, inbound policy, and display parameters.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// TCP listen address for raw RFB ingress, e.g. `0.0.0.0:5900`.
    /// `None` disables the TCP listener.
    pub tcp_listen: Option<String>,
    /// Listen address for RFB-over-WebSocket ingress. `None` disables it.
    pub ws_listen: Option<String>,
    /// Password required from inbound clients. `None` disables inbound
    /// authentication.
    pub password: Option<String>,
    /// Directory for session recordings. Recording sessions without a
    /// directory fall back to plain pass-through.
    pub recording_dir: Option<PathBuf>,
    /// Framebuffer width announced to inbound clients.
    pub width: u16,
    /// Framebuffer height announced to inbound clients.
    pub height: u16,
    /// Desktop name announced to inbound clients.
    pub desktop_name: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tcp_listen: None,
            ws_listen: None,
            password: None,
            recording_dir: None,
            width: 1024,
            height: 768,
            desktop_name: "workDesk".to_string(),
        }
    }
}

/// An intercepting RFB proxy instance.
///
/// Instances are self-contained; nothing is process-wide, so several can
/// coexist in one process.
pub struct VncProxy {
    config: ProxyConfig,
    registry: SessionRegistry,
}

impl VncProxy {
    /// Creates a proxy over a session registry.
    pub fn new(config: ProxyConfig, registry: SessionRegistry) -> Arc<Self> {
        Arc::new(Self { config, registry })
    }

    /// Runs every configured listener until one of them fails.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] when no listening endpoint is
    /// configured, and listener-level bind or accept errors otherwise.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match (
            self.config.tcp_listen.clone(),
            self.config.ws_listen.clone(),
        ) {
            (Some(tcp), Some(ws)) => {
                info!("running two listeners: tcp {tcp}, ws {ws}");
                tokio::try_join!(self.listen_tcp(&tcp), self.listen_ws(&ws))?;
                Ok(())
            }
            (Some(tcp), None) => self.listen_tcp(&tcp).await,
            (None, Some(ws)) => self.listen_ws(&ws).await,
            (None, None) => Err(ProxyError::Config(
                "no listening endpoint configured".to_string(),
            )),
        }
    }

    /// Binds and serves raw RFB ingress on `addr`.
    pub async fn listen_tcp(self: &Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("tcp listener on {addr}");
        self.serve_tcp(listener).await
    }

    /// Serves raw RFB ingress from an already bound listener.
    pub async fn serve_tcp(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let proxy = Arc::clone(self);
            tokio::spawn(async move {
                info!("tcp connection from {peer}");
                if let Err(e) = proxy
                    .handle_connection(stream, TCP_SESSION_ID.to_string())
                    .await
                {
                    error!("connection from {peer} failed: {e}");
                }
            });
        }
    }

    /// Binds and serves RFB-over-WebSocket ingress on `addr`.
    pub async fn listen_ws(self: &Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("websocket listener on {addr}");
        self.serve_ws(listener).await
    }

    /// Serves WebSocket ingress from an already bound listener. The upgrade
    /// path, minus its leading slash, names the session.
    pub async fn serve_ws(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let proxy = Arc::clone(self);
            tokio::spawn(async move {
                info!("websocket connection from {peer}");
                match websocket::accept(stream).await {
                    Ok((ws_stream, path)) => {
                        let session_id = path.trim_start_matches('/').to_string();
                        if let Err(e) = proxy.handle_connection(ws_stream, session_id).await {
                            error!("websocket connection from {peer} failed: {e}");
                        }
                    }
                    Err(e) => error!("websocket upgrade from {peer} failed: {e}"),
                }
            });
        }
    }

    /// Builds and drives one complete session over an inbound transport.
    async fn handle_connection<S>(self: &Arc<Self>, stream: S, session_id: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (quit_tx, quit_rx) = watch::channel(false);

        let server_config = ServerConfig {
            password: self.config.password.clone(),
            pixel_format: PixelFormat::rgba32(),
            desktop_name: self.config.desktop_name.clone(),
            width: self.config.width,
            height: self.config.height,
            ..ServerConfig::default()
        };
        let mut server_conn =
            ServerConn::handshake(stream, &server_config, session_id.clone(), quit_rx.clone())
                .await?;

        let session = match self.registry.lookup(&session_id) {
            Ok(session) => session,
            Err(e) => {
                server_conn.state().shutdown().await;
                return Err(e);
            }
        };
        session.set_status(SessionStatus::Init);

        let recorder = match self.open_recorder(&session).await {
            Ok(recorder) => recorder,
            Err(e) => {
                session.set_status(SessionStatus::Error);
                server_conn.state().shutdown().await;
                return Err(e);
            }
        };
        if let Some(recorder) = &recorder {
            server_conn.add_sink(SegmentSink::Recorder(
                recorder.clone(),
                LegTag::ClientToServer,
            ));
        }

        let shared = server_conn.shared();
        let mut client_conn = match self.connect_upstream(&session, shared, quit_rx).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("session {}: cannot reach upstream {}: {e}", session.id, session.target);
                session.set_status(SessionStatus::Error);
                if let Some(recorder) = &recorder {
                    recorder.close().await.ok();
                }
                server_conn.state().shutdown().await;
                return Err(e);
            }
        };
        client_conn.state().set_session_id(session_id).await;
        if let Some(recorder) = &recorder {
            client_conn.add_sink(SegmentSink::Recorder(
                recorder.clone(),
                LegTag::ServerToClient,
            ));
        }

        // Cross-wire the fan-outs: client messages flow to the upstream leg,
        // server messages flow back to the inbound leg.
        server_conn.add_sink(SegmentSink::ClientUpdater(client_conn.state()));
        client_conn.add_sink(SegmentSink::ServerUpdater(server_conn.state()));

        session.set_status(SessionStatus::Active);
        info!("session {} active, upstream {}", session.id, session.target);

        let server_state = server_conn.state();
        let client_state = client_conn.state();
        let mut server_task = tokio::spawn(server_conn.run());
        let mut client_task = tokio::spawn(client_conn.run());

        // Whichever leg returns first, the other is told to quit and both
        // transports are shut down to unblock its read.
        let (first, server_finished) = tokio::select! {
            result = &mut server_task => (result, true),
            result = &mut client_task => (result, false),
        };
        quit_tx.send(true).ok();
        server_state.shutdown().await;
        client_state.shutdown().await;
        let second = if server_finished {
            client_task.await
        } else {
            server_task.await
        };

        if let Some(recorder) = &recorder {
            if let Err(e) = recorder.close().await {
                error!("session {}: {e}", session.id);
            }
        }

        let outcome = flatten(first).and(flatten(second));
        match &outcome {
            Ok(()) => {
                session.set_status(SessionStatus::Closed);
                info!("session {} closed", session.id);
            }
            Err(e) => {
                session.set_status(SessionStatus::Error);
                error!("session {} failed: {e}", session.id);
            }
        }
        outcome
    }

    /// Opens the recording file for a `RecordingProxy` session.
    async fn open_recorder(&self, session: &Session) -> Result<Option<Arc<Recorder>>> {
        if session.kind != SessionKind::RecordingProxy {
            return Ok(None);
        }
        let Some(dir) = &self.config.recording_dir else {
            error!(
                "session {} asks for recording but no recording directory is configured",
                session.id
            );
            return Ok(None);
        };
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = dir.join(format!("recording{stamp}.rbs"));
        Ok(Some(Arc::new(Recorder::create(path).await?)))
    }

    /// Dials the session's target and runs the client-leg handshake.
    ///
    /// Targets beginning with `/` are Unix domain socket paths, everything
    /// else is `host:port`.
    async fn connect_upstream(
        &self,
        session: &Session,
        shared: bool,
        quit: watch::Receiver<bool>,
    ) -> Result<ClientConn> {
        let client_config = ClientConfig {
            password: session.target_password.clone(),
            shared,
            ..ClientConfig::default()
        };

        if session.target.starts_with('/') {
            #[cfg(unix)]
            {
                let stream = tokio::net::UnixStream::connect(&session.target).await?;
                return ClientConn::connect(stream, &client_config, quit).await;
            }
            #[cfg(not(unix))]
            {
                return Err(ProxyError::Config(
                    "unix domain socket targets are only supported on unix".to_string(),
                ));
            }
        }

        let stream = TcpStream::connect(&session.target).await?;
        stream.set_nodelay(true).ok();
        ClientConn::connect(stream, &client_config, quit).await
    }
}

fn flatten(result: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(ProxyError::Protocol(format!("leg task failed: {e}"))),
    }
}
