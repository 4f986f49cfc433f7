//! Connection setup: configuration, dialing, and the I/O pump tasks.
//!
//! [`connect`] owns the whole startup dance — TCP (and optionally TLS)
//! dial, pump spawning, handler installation, login — and hands back a
//! [`SafeConn`]. [`connect_with_stream`] runs the same protocol over any
//! pre-established stream, which is also how the tests drive a connection
//! over an in-memory duplex pipe.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::rustls::{self, pki_types::ServerName};
use tokio_rustls::TlsConnector;

use crate::conn::{Conn, Invoke, IoHandles, NickInUseFn};
use crate::handlers;
use crate::message::{Line, User};
use crate::registry::CallbackRegistry;
use crate::safe::{SafeConn, SafeConnState};

/// Called once the connection is established, before logging in. This is
/// the place to register handlers; the wire is not up yet, so anything
/// sent from this callback is dropped.
pub type InitFn = Box<dyn FnOnce(&mut Conn) + Send>;

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Configuration for one server connection. Consumed by [`connect`].
pub struct Config {
    /// Server hostname. Required.
    pub host: String,
    /// Server port; 0 selects 6697 with `ssl`, 6667 otherwise.
    pub port: u16,
    /// Sent as `PASS` before login when nonempty.
    pub password: String,

    /// Connect with TLS.
    pub ssl: bool,
    /// TLS parameters; `None` verifies against the webpki roots.
    pub ssl_config: Option<rustls::ClientConfig>,

    pub nick: String,
    pub user: String,
    pub realname: String,

    /// Limit on dialing (TCP connect plus TLS handshake). `None` waits
    /// indefinitely.
    pub timeout: Option<Duration>,

    /// Disable outbound flood protection.
    pub allow_flood: bool,
    /// Keepalive PING cadence. `None` disables the ticker; a zero
    /// duration selects the 3-minute default.
    pub ping_interval: Option<Duration>,

    /// Handler-registration callback. Required.
    pub init: Option<InitFn>,
    /// Replacement-nick policy for 431/432/433/436/437; the default
    /// appends underscores.
    pub nick_in_use: Option<NickInUseFn>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: String::new(),
            port: 0,
            password: String::new(),
            ssl: false,
            ssl_config: None,
            nick: String::new(),
            user: String::new(),
            realname: String::new(),
            timeout: None,
            allow_flood: false,
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            init: None,
            nick_in_use: None,
        }
    }
}

/// Why a connection could not be established. Once [`connect`] returns
/// `Ok`, later failures surface as the `irc:disconnected` event instead.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("config needs an init callback")]
    MissingInit,
    #[error("invalid tls server name {0:?}")]
    InvalidServerName(String),
    #[error("connect timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum ServerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Connect to the configured server, perform login, and start the owner
/// loop. Returns once the connection is established; login replies and
/// everything after arrive through handlers.
pub async fn connect(config: Config) -> Result<SafeConn, ConnectError> {
    if config.init.is_none() {
        return Err(ConnectError::MissingInit);
    }

    let addr = server_addr(&config);
    let stream = match config.timeout {
        Some(limit) => tokio::time::timeout(limit, dial(&config, &addr))
            .await
            .map_err(|_| ConnectError::Timeout)??,
        None => dial(&config, &addr).await?,
    };
    match stream {
        ServerStream::Plain(tcp) => connect_with_stream(tcp, config),
        ServerStream::Tls(tls) => connect_with_stream(*tls, config),
    }
}

/// Run the IRC protocol over an already-established stream.
pub fn connect_with_stream<S>(stream: S, mut config: Config) -> Result<SafeConn, ConnectError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some(init) = config.init.take() else {
        return Err(ConnectError::MissingInit);
    };
    let addr = server_addr(&config);

    let substate = Arc::new(SafeConnState::new(addr));
    let mut conn = Conn {
        me: User {
            nick: config.nick.clone(),
            user: config.user.clone(),
            host: String::new(),
            raw: String::new(),
        },
        state_registry: CallbackRegistry::new(),
        substate: Arc::clone(&substate),
        nick_in_use: config.nick_in_use.take(),
        writer: None,
        io: None,
        last_nick: String::new(),
    };

    // Register the user's handlers first. The pumps do not exist yet, so
    // nothing can reach the wire ahead of the login sequence.
    init(&mut conn);

    let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
    let (reader_tx, reader_rx) = mpsc::unbounded_channel::<String>();
    let (write_err_tx, write_err_rx) = mpsc::channel::<io::Error>(1);
    let (read_err_tx, read_err_rx) = mpsc::channel::<io::Error>(1);
    let (invoker_tx, invoker_rx) = mpsc::unbounded_channel::<Invoke>();

    let (read_half, write_half) = tokio::io::split(stream);
    conn.io = Some(IoHandles {
        reader: tokio::spawn(reader_pump(read_half, reader_tx, read_err_tx)),
        writer: tokio::spawn(writer_pump(
            write_half,
            writer_rx,
            write_err_tx,
            config.allow_flood,
        )),
    });
    conn.writer = Some(writer_tx.clone());

    {
        let mut channels = substate.channels.write();
        channels.writer = Some(writer_tx);
        channels.invoker = Some(invoker_tx);
    }

    if let Some(interval) = config.ping_interval {
        let interval = if interval.is_zero() {
            DEFAULT_PING_INTERVAL
        } else {
            interval
        };
        tokio::spawn(pinger(conn.safe_conn(), interval));
    }

    let registry = conn.substate.registry.clone();
    let event = Line::event(crate::INIT, conn.me.clone());
    registry.dispatch(crate::INIT, &mut conn, &event);

    handlers::install(&conn);
    conn.log_in(&config.realname, &config.password);

    let safe = conn.safe_conn();
    tokio::spawn(conn.run_loop(reader_rx, write_err_rx, read_err_rx, invoker_rx));
    Ok(safe)
}

fn server_addr(config: &Config) -> String {
    let port = if config.port != 0 {
        config.port
    } else if config.ssl {
        6697
    } else {
        6667
    };
    format!("{}:{}", config.host, port)
}

async fn dial(config: &Config, addr: &str) -> Result<ServerStream, ConnectError> {
    let tcp = TcpStream::connect(addr).await?;
    if !config.ssl {
        return Ok(ServerStream::Plain(tcp));
    }

    let tls_config = match &config.ssl_config {
        Some(tls_config) => tls_config.clone(),
        None => default_tls_config(),
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let name = ServerName::try_from(config.host.clone())
        .map_err(|_| ConnectError::InvalidServerName(config.host.clone()))?;
    let tls = connector.connect(name, tcp).await?;
    Ok(ServerStream::Tls(Box::new(tls)))
}

fn default_tls_config() -> rustls::ClientConfig {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Read the socket line by line into the reader queue. Socket I/O is
/// never blocked by handler dispatch: lines pile up in the unbounded
/// queue while the owner loop works. EOF or a read error is reported and
/// the queue closed, which is what tells the owner loop the wire is gone.
async fn reader_pump<R>(
    read_half: R,
    lines: mpsc::UnboundedSender<String>,
    read_err: mpsc::Sender<io::Error>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) => {
                let _ = read_err.send(io::ErrorKind::UnexpectedEof.into()).await;
                break;
            }
            Ok(_) => {
                let line = buf.strip_suffix('\n').unwrap_or(&buf);
                let line = line.strip_suffix('\r').unwrap_or(line);
                tracing::debug!("--> {line}");
                if lines.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!("read error: {err}");
                let _ = read_err.send(err).await;
                break;
            }
        }
    }
    // Dropping `lines` closes the reader queue and wakes the owner loop.
}

/// Drain the writer queue onto the socket, pacing with the Hybrid-IRCd
/// algorithm unless flood protection is off: each line advances a cursor
/// by 2s plus 1/120s per byte, and once the cursor runs more than 10s
/// ahead of now, the excess is slept off before sending.
async fn writer_pump<W>(
    mut write_half: W,
    mut lines: mpsc::UnboundedReceiver<String>,
    write_err: mpsc::Sender<io::Error>,
    allow_flood: bool,
) where
    W: AsyncWrite + Unpin,
{
    const MAX_AHEAD: Duration = Duration::from_secs(10);
    let mut flood_time = Instant::now();

    while let Some(line) = lines.recv().await {
        if !allow_flood {
            let now = Instant::now();
            if flood_time < now {
                flood_time = now;
            }
            flood_time += Duration::from_secs(2)
                + Duration::from_micros(line.len() as u64 * 1_000_000 / 120);
            let ahead = flood_time - now;
            if ahead > MAX_AHEAD {
                tokio::time::sleep(ahead - MAX_AHEAD).await;
            }
        }
        tracing::debug!("<-- {line}");
        if let Err(err) = write_half.write_all(format!("{line}\r\n").as_bytes()).await {
            tracing::warn!("write error: {err}");
            let _ = write_err.send(err).await;
            break;
        }
    }

    // Keep accepting queued lines until shutdown clears the senders, so
    // the window between a write failure and the owner loop noticing
    // still looks like a live connection to senders.
    while lines.recv().await.is_some() {}
    let _ = write_half.shutdown().await;
}

/// Periodic keepalive. Stops itself once a send reports the connection
/// closed.
async fn pinger(conn: SafeConn, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick completes immediately
    loop {
        ticker.tick().await;
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if !conn.raw(&format!("PING {unix}")) {
            break;
        }
    }
}
