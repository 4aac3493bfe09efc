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

//! Command-line entry point: a single-session intercepting VNC proxy.

use std::path::PathBuf;

use clap::Parser;
use log::error;

use rustvncproxy::{
    ProxyConfig, Session, SessionKind, SessionRegistry, VncProxy, DEFAULT_PORT,
};

#[derive(Parser, Debug)]
#[command(
    name = "rustvncproxy",
    about = "Intercepting VNC (RFB) proxy with optional session recording"
)]
struct Args {
    /// TCP listen address for raw RFB clients. Defaults to 0.0.0.0:5900
    /// when no WebSocket listener is configured either.
    #[arg(long)]
    tcp_listen: Option<String>,

    /// WebSocket listen address for RFB-over-WS clients (e.g. noVNC).
    #[arg(long)]
    ws_listen: Option<String>,

    /// Upstream VNC server: host:port, or an absolute /path to a Unix
    /// domain socket.
    #[arg(short, long)]
    target: String,

    /// Password of the upstream VNC server, if it requires one.
    #[arg(long)]
    target_password: Option<String>,

    /// Password required from inbound clients. No authentication if omitted.
    #[arg(long)]
    password: Option<String>,

    /// Record each session into this directory.
    #[arg(long)]
    recording_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let kind = if args.recording_dir.is_some() {
        SessionKind::RecordingProxy
    } else {
        SessionKind::ProxyPass
    };
    let session = Session::new("dummySession", kind, args.target, args.target_password);

    let tcp_listen = match (&args.tcp_listen, &args.ws_listen) {
        (None, None) => Some(format!("0.0.0.0:{DEFAULT_PORT}")),
        _ => args.tcp_listen.clone(),
    };
    let config = ProxyConfig {
        tcp_listen,
        ws_listen: args.ws_listen,
        password: args.password,
        recording_dir: args.recording_dir,
        ..ProxyConfig::default()
    };

    let proxy = VncProxy::new(config, SessionRegistry::single(session));
    if let Err(e) = proxy.start().await {
        error!("proxy terminated: {e}");
        std::process::exit(1);
    }
}
