//! Control surface: a line-oriented Unix socket plus process signals.
//!
//! Each request is one line (`nap`, `pause 30`, `identify 1`, ...). The reply
//! is one line: `ok`, `error: <message>`, or a JSON status object.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::controller::ControllerHandle;
use crate::domain::InvalidPauseDuration;
use crate::domain::MonitorId;
use crate::domain::PauseDuration;

const SOCKET_NAME: &str = "monitornap.sock";

/// One control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ToggleAwake,
    Awake(bool),
    Nap,
    Resume,
    Pause(PauseDuration),
    Identify(MonitorId),
    Status,
}

/// Errors parsing a request line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty request")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Missing argument for '{0}'")]
    MissingArgument(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Pause(#[from] InvalidPauseDuration),
}

impl FromStr for Request {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or(ProtocolError::Empty)?;
        let argument = words.next();

        let request = match command {
            "toggle-awake" => Self::ToggleAwake,
            "awake" => match argument.ok_or(ProtocolError::MissingArgument("awake"))? {
                "on" => Self::Awake(true),
                "off" => Self::Awake(false),
                other => return Err(ProtocolError::InvalidArgument(other.to_string())),
            },
            "nap" => Self::Nap,
            "resume" => Self::Resume,
            "pause" => {
                let minutes = argument.ok_or(ProtocolError::MissingArgument("pause"))?;
                Self::Pause(PauseDuration::try_from(u64::from(parse_number(minutes)?))?)
            }
            "identify" => {
                let index = argument.ok_or(ProtocolError::MissingArgument("identify"))?;
                Self::Identify(MonitorId::new(parse_number(index)?))
            }
            "status" => Self::Status,
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        if let Some(extra) = words.next() {
            return Err(ProtocolError::InvalidArgument(extra.to_string()));
        }
        Ok(request)
    }
}

fn parse_number(word: &str) -> Result<u32, ProtocolError> {
    word.parse()
        .map_err(|_| ProtocolError::InvalidArgument(word.to_string()))
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToggleAwake => f.write_str("toggle-awake"),
            Self::Awake(true) => f.write_str("awake on"),
            Self::Awake(false) => f.write_str("awake off"),
            Self::Nap => f.write_str("nap"),
            Self::Resume => f.write_str("resume"),
            Self::Pause(duration) => write!(f, "pause {}", duration.minutes()),
            Self::Identify(id) => write!(f, "identify {}", id.index()),
            Self::Status => f.write_str("status"),
        }
    }
}

/// Default socket location under the user runtime directory.
pub fn default_socket_path() -> Option<PathBuf> {
    dirs::runtime_dir().map(|dir| dir.join(SOCKET_NAME))
}

/// Listening control socket. The socket file is removed on drop.
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the socket, replacing a stale file left by a dead instance.
    pub async fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                anyhow::bail!("Another instance is listening on {}", path.display());
            }
            debug!("Removing stale control socket {}", path.display());
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;

        info!("Control socket listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self, handle: ControllerHandle, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &handle).await {
                                debug!("Control connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept control connection: {}", e),
                },
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        // Best effort; the file may already be gone.
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(stream: UnixStream, handle: &ControllerHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = match line.parse::<Request>() {
            Ok(request) => {
                debug!("Control request: {}", request);
                dispatch(request, handle).await
            }
            Err(e) => format!("error: {e}"),
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

/// Forward a request to the controller and render the reply line.
async fn dispatch(request: Request, handle: &ControllerHandle) -> String {
    let result = match request {
        Request::ToggleAwake => handle.toggle_awake_mode(),
        Request::Awake(enabled) => handle.set_awake_mode(enabled),
        Request::Nap => handle.nap_now(),
        Request::Resume => handle.resume_now(),
        Request::Pause(duration) => handle.pause_for(duration),
        Request::Identify(id) => handle.identify(id),
        Request::Status => {
            return match handle.status().await {
                Ok(status) => serde_json::to_string(&status)
                    .unwrap_or_else(|e| format!("error: {e}")),
                Err(e) => format!("error: {e}"),
            };
        }
    };

    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    }
}

/// Send one request to a running daemon and return its reply line.
pub async fn send_request(path: &Path, request: Request) -> Result<String> {
    let stream = UnixStream::connect(path).await.with_context(|| {
        format!(
            "Failed to connect to {} (is the daemon running?)",
            path.display()
        )
    })?;
    let (reader, mut writer) = stream.into_split();

    writer.write_all(format!("{request}\n").as_bytes()).await?;
    writer.shutdown().await?;

    let reply = BufReader::new(reader)
        .lines()
        .next_line()
        .await?
        .context("Daemon closed the connection without replying")?;

    if let Some(message) = reply.strip_prefix("error: ") {
        anyhow::bail!("{message}");
    }
    Ok(reply)
}

/// SIGUSR1 toggles awake mode, SIGHUP reloads the configuration file.
/// SIGINT and SIGTERM request shutdown.
pub async fn watch_signals(
    handle: ControllerHandle,
    shutdown: CancellationToken,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let mut hup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),

            _ = usr1.recv() => {
                info!("SIGUSR1 received, toggling awake mode");
                if handle.toggle_awake_mode().is_err() {
                    return Ok(());
                }
            }

            _ = hup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match Config::load_or_default(config_path.as_deref()) {
                    Ok(config) => {
                        if handle.update_config(config).is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => warn!("Keeping previous configuration: {:#}", e),
                }
            }

            _ = term.recv() => {
                info!("SIGTERM received, shutting down");
                shutdown.cancel();
            }

            _ = int.recv() => {
                info!("SIGINT received, shutting down");
                shutdown.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Command;
    use crate::controller::Status;

    #[test]
    fn test_parse_requests() {
        assert_eq!("toggle-awake".parse::<Request>(), Ok(Request::ToggleAwake));
        assert_eq!("awake on".parse::<Request>(), Ok(Request::Awake(true)));
        assert_eq!("  awake   off ".parse::<Request>(), Ok(Request::Awake(false)));
        assert_eq!("nap".parse::<Request>(), Ok(Request::Nap));
        assert_eq!("resume".parse::<Request>(), Ok(Request::Resume));
        assert_eq!(
            "pause 30".parse::<Request>(),
            Ok(Request::Pause(PauseDuration::Thirty))
        );
        assert_eq!(
            "identify 2".parse::<Request>(),
            Ok(Request::Identify(MonitorId::new(2)))
        );
        assert_eq!("status".parse::<Request>(), Ok(Request::Status));
    }

    #[test]
    fn test_parse_rejects_bad_requests() {
        assert_eq!("".parse::<Request>(), Err(ProtocolError::Empty));
        assert_eq!(
            "dim".parse::<Request>(),
            Err(ProtocolError::UnknownCommand("dim".to_string()))
        );
        assert_eq!(
            "pause".parse::<Request>(),
            Err(ProtocolError::MissingArgument("pause"))
        );
        assert_eq!(
            "pause 45".parse::<Request>(),
            Err(ProtocolError::Pause(InvalidPauseDuration(45)))
        );
        assert_eq!(
            "awake maybe".parse::<Request>(),
            Err(ProtocolError::InvalidArgument("maybe".to_string()))
        );
        assert_eq!(
            "nap now".parse::<Request>(),
            Err(ProtocolError::InvalidArgument("now".to_string()))
        );
    }

    #[test]
    fn test_display_parses_back() {
        for request in [
            Request::ToggleAwake,
            Request::Awake(false),
            Request::Pause(PauseDuration::Sixty),
            Request::Identify(MonitorId::new(1)),
        ] {
            assert_eq!(request.to_string().parse::<Request>(), Ok(request));
        }
    }

    #[tokio::test]
    async fn test_server_forwards_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let (handle, mut commands) = ControllerHandle::detached();
        let shutdown = CancellationToken::new();

        let server = ControlServer::bind(&path).await.unwrap();
        let task = tokio::spawn(server.serve(handle, shutdown.clone()));

        let reply = send_request(&path, Request::Pause(PauseDuration::Fifteen))
            .await
            .unwrap();
        assert_eq!(reply, "ok");
        assert!(matches!(
            commands.recv().await,
            Some(Command::PauseFor(PauseDuration::Fifteen))
        ));

        shutdown.cancel();
        task.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_server_answers_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let (handle, mut commands) = ControllerHandle::detached();
        let shutdown = CancellationToken::new();

        let server = ControlServer::bind(&path).await.unwrap();
        tokio::spawn(server.serve(handle, shutdown.clone()));
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                if let Command::Status(reply) = command {
                    let _ = reply.send(Status {
                        awake_mode: true,
                        pause_remaining_seconds: None,
                        monitors: Vec::new(),
                    });
                }
            }
        });

        let reply = send_request(&path, Request::Status).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(json["awake_mode"], true);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_server_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let (handle, _commands) = ControllerHandle::detached();
        let shutdown = CancellationToken::new();

        let server = ControlServer::bind(&path).await.unwrap();
        tokio::spawn(server.serve(handle, shutdown.clone()));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"pause 45\n").await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert!(reply.starts_with("error: "));
        assert!(reply.contains("45"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        std::fs::write(&path, b"").unwrap();

        let server = ControlServer::bind(&path).await.unwrap();
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let _first = ControlServer::bind(&path).await.unwrap();

        assert!(ControlServer::bind(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_client_reports_closed_controller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let (handle, commands) = ControllerHandle::detached();
        drop(commands);
        let shutdown = CancellationToken::new();

        let server = ControlServer::bind(&path).await.unwrap();
        tokio::spawn(server.serve(handle, shutdown.clone()));

        let err = send_request(&path, Request::Nap).await.unwrap_err();
        assert!(err.to_string().contains("not running"));

        shutdown.cancel();
    }
}
