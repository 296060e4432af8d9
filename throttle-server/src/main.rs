use std::{
    io,
    net::SocketAddr,
    num::NonZeroU64,
    path::{Component, PathBuf},
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::RandomState;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use clap::Parser;
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    signal,
};
use tokio_throttle::{
    CancelScope, LimitHandle, ThrottleCanceled, ThrottledConnection, ThrottledListener,
    io::ResetLinger,
    utils::meter::{ByteMeter, MeterCounters},
};
use tracing::{Instrument, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Config {
    /// Address to listen on, e.g. 0.0.0.0:7777
    #[arg(short = 'l', long)]
    listen: SocketAddr,

    /// Optional address for the admin API, e.g. 127.0.0.1:8888
    #[arg(short = 'a', long)]
    api: Option<SocketAddr>,

    /// Directory files are served from
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Bandwidth shared by all connections in bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0)]
    global_rate_bytes: u64,

    /// Default bandwidth of each connection in bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0)]
    connection_rate_bytes: u64,

    /// Burst allowed by every limit, in bytes
    #[arg(long, value_name = "bytes", default_value_t = 32 * 1024)]
    burst_bytes: u64,

    /// Deadline for throttled writes, counted from accept (0 = none)
    #[arg(long, value_name = "ms", default_value_t = 0)]
    write_timeout_ms: u64,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.burst_bytes == 0 {
            anyhow::bail!("--burst-bytes must be positive");
        }

        if !self.root.is_dir() {
            anyhow::bail!("--root {} is not a directory", self.root.display());
        }

        Ok(())
    }

    fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }
}

type ConnId = String;
type Listener = ThrottledListener<TcpListener>;
type Conn = ByteMeter<ThrottledConnection<TcpStream>>;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Get(String),
    SetConnectionLimit(u64),
    SetGlobalLimit(u64),
    Limits,
    Exit,
}

#[derive(Debug, PartialEq, Eq, ThisError)]
enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("missing argument for {0}")]
    MissingArgument(&'static str),
    #[error("invalid limit value: {0}")]
    BadLimit(String),
    #[error("invalid file name: {0}")]
    BadPath(String),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (cmd, arg) = match line.split_once(char::is_whitespace) {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (line, ""),
        };

        match cmd {
            "exit" => Ok(Command::Exit),
            "limits" => Ok(Command::Limits),
            "get" if arg.is_empty() => Err(CommandError::MissingArgument("get")),
            "get" => Ok(Command::Get(arg.to_owned())),
            "setl" => parse_limit(arg).map(Command::SetConnectionLimit),
            "setg" => parse_limit(arg).map(Command::SetGlobalLimit),
            other => Err(CommandError::Unknown(other.to_owned())),
        }
    }
}

fn parse_limit(arg: &str) -> Result<u64, CommandError> {
    arg.parse().map_err(|_| CommandError::BadLimit(arg.to_owned()))
}

/// Map a requested name to a file under `root`, refusing anything that could escape it.
fn resolve(root: &std::path::Path, name: &str) -> Result<PathBuf, CommandError> {
    let rel = std::path::Path::new(name);
    let plain = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_)));

    if !plain || rel.as_os_str().is_empty() {
        return Err(CommandError::BadPath(name.to_owned()));
    }

    Ok(root.join(rel))
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionInfo {
    id: ConnId,
    peer: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionStatus {
    conn_info: ConnectionInfo,
    rate_bytes: u64,
    bytes_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
struct LimitsStatus {
    global_rate_bytes: u64,
    connection_rate_bytes: u64,
    burst_bytes: u64,
}

#[derive(Debug)]
struct ConnectionState {
    conn_info: ConnectionInfo,

    limiter: LimitHandle,
    scope: CancelScope,
    counters: Arc<MeterCounters>,
}

#[derive(Clone)]
struct ApiState {
    connections: Arc<DashMap<ConnId, ConnectionState, RandomState>>,
    listener: Arc<Listener>,
}

impl ApiState {
    fn new(listener: Arc<Listener>) -> Self {
        Self {
            connections: Arc::new(DashMap::with_hasher(RandomState::new())),
            listener,
        }
    }

    fn all(&self) -> Vec<ConnectionStatus> {
        self.connections
            .iter()
            .map(|c| ConnectionStatus {
                conn_info: c.conn_info.clone(),
                rate_bytes: c.limiter.limit().rate(),
                bytes_sent: c.counters.written(),
            })
            .collect()
    }

    fn limits(&self) -> LimitsStatus {
        LimitsStatus {
            global_rate_bytes: self.listener.global_limit().rate(),
            connection_rate_bytes: self.listener.default_connection_limit().rate(),
            burst_bytes: self.listener.burst().get(),
        }
    }

    fn set_connection_limit(&self, id: &str, rate: u64) -> Result<(), ApiError> {
        if rate == 0 {
            return Err(ApiError::BadLimit);
        }
        let conn = self.connections.get(id).ok_or(ApiError::NotFound)?;
        conn.limiter.set(rate);
        Ok(())
    }

    fn set_all_connection_limits(&self, rate: u64) -> Result<usize, ApiError> {
        if rate == 0 {
            return Err(ApiError::BadLimit);
        }
        let mut updated = 0;
        for conn in self.connections.iter() {
            conn.limiter.set(rate);
            updated += 1;
        }
        Ok(updated)
    }

    fn cancel_connection(&self, id: &str) -> Result<(), ApiError> {
        let conn = self.connections.get(id).ok_or(ApiError::NotFound)?;
        conn.scope.cancel();
        Ok(())
    }
}

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("connection not found")]
    NotFound,
    #[error("invalid limit; must be a positive number of bytes per second")]
    BadLimit,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadLimit => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn list_connections(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ConnectionStatus>>, ApiError> {
    Ok(Json(state.all()))
}

async fn get_limits(State(state): State<ApiState>) -> Json<LimitsStatus> {
    Json(state.limits())
}

async fn set_limits(
    State(state): State<ApiState>,
    Json(req): Json<LimitsReq>,
) -> Result<StatusCode, ApiError> {
    state
        .listener
        .set_limits(req.global_rate_bytes, req.connection_rate_bytes);
    Ok(StatusCode::ACCEPTED)
}

async fn set_connection_limit(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<LimitReq>,
) -> Result<StatusCode, ApiError> {
    state.set_connection_limit(&id, req.rate_bytes)?;
    Ok(StatusCode::ACCEPTED)
}

async fn set_all_connection_limits(
    State(state): State<ApiState>,
    Json(req): Json<LimitReq>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.set_all_connection_limits(req.rate_bytes)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "updated": updated })),
    ))
}

async fn cancel_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.cancel_connection(&id)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsReq {
    #[serde(default)]
    pub global_rate_bytes: u64,
    #[serde(default)]
    pub connection_rate_bytes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitReq {
    pub rate_bytes: u64,
}

fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/limits", get(get_limits).patch(set_limits))
        .route("/connections", get(list_connections))
        .route("/connections/{id}/limit", patch(set_connection_limit))
        .route("/connections/{id}/cancel", post(cancel_connection))
        .route("/connections/_all/limit", patch(set_all_connection_limits))
        .with_state(state)
}

const COPY_BUF_SIZE: usize = 8 * 1024;

/// Failure while serving a file, split by the side that failed.
#[derive(Debug, ThisError)]
enum SendError {
    /// Opening or reading the file; the client is told and the connection stays usable.
    #[error("{0}")]
    File(#[source] io::Error),
    /// Writing to the client; the connection is done for.
    #[error("{0}")]
    Connection(#[source] io::Error),
}

async fn send_file<S>(
    stream: &mut S,
    root: &std::path::Path,
    name: &str,
) -> Result<u64, SendError>
where
    S: AsyncWrite + Unpin,
{
    let path = resolve(root, name)
        .map_err(|e| SendError::File(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let mut file = File::open(path).await.map_err(SendError::File)?;

    let start = Instant::now();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(SendError::File)?;
        if n == 0 {
            break;
        }
        stream
            .write_all(&buf[..n])
            .await
            .map_err(SendError::Connection)?;
        sent += n as u64;
    }
    stream.flush().await.map_err(SendError::Connection)?;
    info!(
        file = name,
        sent,
        "Sent {} bytes in {:.3}s",
        sent,
        start.elapsed().as_secs_f64()
    );

    Ok(sent)
}

/// Run the command loop until the client exits or the connection fails.
async fn serve<S>(
    stream: &mut S,
    config: &Config,
    listener: &Listener,
    limiter: &LimitHandle,
) -> io::Result<()>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let cmd = match line.parse::<Command>() {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "invalid command");
                stream.write_all(format!("{e}\n").as_bytes()).await?;
                continue;
            }
        };
        info!(?cmd, "received command");

        match cmd {
            Command::Exit => {
                info!("client requested exit");
                return Ok(());
            }
            Command::Limits => {
                let reply = format!(
                    "connection: {}, global: {}, default: {}\n",
                    limiter.limit(),
                    listener.global_limit(),
                    listener.default_connection_limit()
                );
                stream.write_all(reply.as_bytes()).await?;
            }
            Command::SetConnectionLimit(0) => {
                // back to the listener default, which may be unlimited
                limiter.replace(listener.default_connection_limit());
                info!(limit = %limiter.limit(), "connection limit restored");
            }
            Command::SetConnectionLimit(rate) => {
                limiter.set(rate);
                info!(limit = %limiter.limit(), "connection limit changed");
            }
            Command::SetGlobalLimit(rate) => {
                listener.set_global_limit(rate);
                info!(limit = %listener.global_limit(), "global limit changed");
            }
            Command::Get(name) => match send_file(stream, &config.root, &name).await {
                Ok(_) => {}
                Err(SendError::File(e)) => {
                    error!(error = %e, "failed to serve data");
                    stream
                        .write_all(format!("failed to serve data: {e}\n").as_bytes())
                        .await?;
                }
                Err(SendError::Connection(e)) => return Err(e),
            },
        }
    }
}

async fn handle_connection(
    mut conn: ThrottledConnection<TcpStream>,
    addr: SocketAddr,
    config: Arc<Config>,
    state: ApiState,
) {
    // best effort
    _ = conn.get_ref().set_nodelay(true);

    if let Some(timeout) = config.write_timeout() {
        let scope = conn.cancel_scope().clone().with_timeout(timeout);
        conn.set_cancel_scope(scope);
    }

    let id = nanoid!();
    let limiter = conn.limit_handle();
    let scope = conn.cancel_scope().clone();
    let conn: Conn = ByteMeter::new(conn);
    let counters = conn.counters();

    state.connections.insert(
        id.clone(),
        ConnectionState {
            conn_info: ConnectionInfo {
                id: id.clone(),
                peer: addr,
            },
            limiter: limiter.clone(),
            scope,
            counters: counters.clone(),
        },
    );

    let span = tracing::info_span!("conn", %id, client = %addr);
    async move {
        info!(limit = %limiter.limit(), "client connected");
        let mut stream = BufReader::new(conn);
        let res = serve(&mut stream, &config, &state.listener, &limiter).await;

        // clean up
        state.connections.remove(&id);

        match res {
            Ok(()) => {
                let conn = stream.into_inner().into_inner();
                if let Err(err) = conn.close().await {
                    error!(error = %err, "failed to close connection");
                }
            }
            Err(err) => {
                error!(error = %err, "connection error");
                if ThrottleCanceled::from_io_error(&err).is_some() {
                    // best effort
                    _ = stream.set_reset_linger();
                }
            }
        }

        info!(sent = counters.written(), "client disconnected");
    }
    .instrument(span)
    .await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cfg = Config::parse();
    cfg.validate()?;
    let config = Arc::new(cfg);

    let burst = NonZeroU64::new(config.burst_bytes)
        .ok_or_else(|| anyhow::anyhow!("--burst-bytes must be positive"))?;
    let listener = ThrottledListener::with_burst(TcpListener::bind(config.listen).await?, burst);
    listener.set_limits(config.global_rate_bytes, config.connection_rate_bytes);
    let listener = Arc::new(listener);

    let state = ApiState::new(listener.clone());

    if let Some(api_addr) = config.api {
        let api = TcpListener::bind(api_addr).await?;
        let app = api_router(state.clone());
        tokio::spawn(async move {
            if let Err(err) = axum::serve(api, app).await {
                error!(error = %err, "api server error");
            }
        });
    }

    info!(
        listen = %config.listen,
        api = ?config.api,
        global = %listener.global_limit(),
        per_connection = %listener.default_connection_limit(),
        "Listening"
    );

    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((conn, addr)) => {
                    tokio::spawn(handle_connection(
                        conn,
                        addr,
                        config.clone(),
                        state.clone(),
                    ));
                }
                Err(e) => {
                    error!(%e, "accept failed");
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                listener.cancel_scope().cancel();
                break;
            }
        }
    }

    Ok(())
}
