//! Hyprland request-socket backend.
//!
//! Issues one-shot JSON requests (`j/cursorpos`, `j/activewindow`,
//! `j/monitors`) over Hyprland's command socket.

use std::env;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::trace;

use super::DisplayOutput;
use super::DisplaySource;
use crate::domain::Point;
use crate::domain::Rect;
use crate::sampler::ActivityProbe;
use crate::sampler::ForegroundWindow;
use crate::sampler::SampleError;

/// Hyprland activity and layout source.
#[derive(Debug, Clone)]
pub struct HyprlandSource {
    socket_path: PathBuf,
}

impl HyprlandSource {
    /// Locate the request socket from the session environment.
    pub fn from_env() -> Result<Self, SampleError> {
        Ok(Self {
            socket_path: get_socket_path()?,
        })
    }

    /// Get diagnostic information about the Hyprland environment.
    pub fn get_diagnostics() -> Vec<String> {
        let mut diags = Vec::new();

        match env::var("XDG_RUNTIME_DIR") {
            Ok(v) => diags.push(format!("XDG_RUNTIME_DIR={v}")),
            Err(_) => diags.push("XDG_RUNTIME_DIR: NOT SET".to_string()),
        }

        match env::var("HYPRLAND_INSTANCE_SIGNATURE") {
            Ok(v) => diags.push(format!("HYPRLAND_INSTANCE_SIGNATURE={v}")),
            Err(_) => diags.push("HYPRLAND_INSTANCE_SIGNATURE: NOT SET".to_string()),
        }

        if let Ok(path) = get_socket_path() {
            diags.push(format!("Request socket: {} (exists)", path.display()));
        } else {
            diags.push("Request socket: NOT FOUND".to_string());
        }

        diags
    }

    /// Send one request and read the full reply.
    async fn request(&self, command: &str) -> Result<String, SampleError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| SampleError::Unavailable(e.to_string()))?;

        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| SampleError::Unavailable(e.to_string()))?;

        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .await
            .map_err(|e| SampleError::Unavailable(e.to_string()))?;

        trace!("{} -> {} bytes", command, reply.len());
        Ok(reply)
    }

    async fn request_json<T: DeserializeOwned>(&self, command: &str) -> Result<T, SampleError> {
        let reply = self.request(command).await?;
        serde_json::from_str(&reply).map_err(|e| SampleError::Malformed(format!("{command}: {e}")))
    }
}

#[async_trait]
impl ActivityProbe for HyprlandSource {
    async fn cursor_position(&self) -> Result<Point, SampleError> {
        let reply: CursorReply = self.request_json("j/cursorpos").await?;
        Ok(Point::new(reply.x, reply.y))
    }

    async fn foreground_window(&self) -> Result<Option<ForegroundWindow>, SampleError> {
        let reply: ActiveWindowReply = self.request_json("j/activewindow").await?;
        Ok(reply.into_window())
    }
}

#[async_trait]
impl DisplaySource for HyprlandSource {
    async fn displays(&self) -> Result<Vec<DisplayOutput>, SampleError> {
        let replies: Vec<MonitorReply> = self.request_json("j/monitors").await?;
        Ok(into_outputs(replies))
    }
}

/// Get the path to Hyprland's request socket.
fn get_socket_path() -> Result<PathBuf, SampleError> {
    let xdg_runtime_dir = env::var("XDG_RUNTIME_DIR")
        .map_err(|_| SampleError::Unavailable("XDG_RUNTIME_DIR not set".to_string()))?;

    let hyprland_sig = env::var("HYPRLAND_INSTANCE_SIGNATURE").map_err(|_| {
        SampleError::Unavailable("HYPRLAND_INSTANCE_SIGNATURE not set".to_string())
    })?;

    let socket_path = PathBuf::from(&xdg_runtime_dir)
        .join("hypr")
        .join(&hyprland_sig)
        .join(".socket.sock");

    if !socket_path.exists() {
        return Err(SampleError::Unavailable(format!(
            "socket not found: {}",
            socket_path.display()
        )));
    }

    Ok(socket_path)
}

/// `j/cursorpos` reply.
#[derive(Debug, Deserialize)]
struct CursorReply {
    x: i32,
    y: i32,
}

/// Older Hyprland reports a bool, newer releases a mode number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FullscreenField {
    Flag(bool),
    Mode(i64),
}

impl Default for FullscreenField {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl FullscreenField {
    fn is_fullscreen(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Mode(mode) => *mode != 0,
        }
    }
}

/// `j/activewindow` reply. `{}` when nothing is focused.
#[derive(Debug, Deserialize)]
struct ActiveWindowReply {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    at: Option<[i32; 2]>,
    #[serde(default)]
    size: Option<[i32; 2]>,
    #[serde(default)]
    fullscreen: FullscreenField,
}

impl ActiveWindowReply {
    fn into_window(self) -> Option<ForegroundWindow> {
        if self.address.as_deref().is_none_or(str::is_empty) {
            return None;
        }

        let rect = match (self.at, self.size) {
            (Some([x, y]), Some([w, h])) => Some(Rect::new(
                x,
                y,
                u32::try_from(w).unwrap_or(0),
                u32::try_from(h).unwrap_or(0),
            )),
            _ => None,
        };

        Some(ForegroundWindow {
            fullscreen: self.fullscreen.is_fullscreen(),
            rect,
        })
    }
}

/// One entry of the `j/monitors` reply.
#[derive(Debug, Deserialize)]
struct MonitorReply {
    id: i64,
    name: String,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default)]
    transform: u8,
    #[serde(default)]
    disabled: bool,
}

fn default_scale() -> f64 {
    1.0
}

impl MonitorReply {
    /// Size in layout coordinates, accounting for scale and rotation.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn logical_size(&self) -> (u32, u32) {
        let scale = if self.scale > 0.0 { self.scale } else { 1.0 };
        let w = (f64::from(self.width) / scale).round() as u32;
        let h = (f64::from(self.height) / scale).round() as u32;
        if self.transform % 2 == 1 { (h, w) } else { (w, h) }
    }
}

/// Enabled outputs, indexed in compositor id order.
fn into_outputs(mut replies: Vec<MonitorReply>) -> Vec<DisplayOutput> {
    replies.retain(|m| !m.disabled);
    replies.sort_by_key(|m| m.id);

    replies
        .into_iter()
        .zip(0u32..)
        .map(|(m, index)| {
            let (width, height) = m.logical_size();
            DisplayOutput {
                index,
                name: m.name,
                rect: Rect::new(m.x, m.y, width, height),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_cursorpos() {
        let reply: CursorReply = serde_json::from_str(r#"{"x": 2100, "y": -15}"#).unwrap();
        assert_eq!((reply.x, reply.y), (2100, -15));
    }

    #[test]
    fn test_parse_activewindow_mode_number() {
        let json = r#"{
            "address": "0x55a1b2c3d4e5",
            "mapped": true,
            "at": [0, 0],
            "size": [2560, 1440],
            "monitor": 0,
            "class": "mpv",
            "title": "movie.mkv",
            "fullscreen": 2
        }"#;
        let reply: ActiveWindowReply = serde_json::from_str(json).unwrap();
        let window = reply.into_window().unwrap();
        assert!(window.fullscreen);
        assert_eq!(window.rect, Some(Rect::new(0, 0, 2560, 1440)));
    }

    #[test]
    fn test_parse_activewindow_bool_flag() {
        let json = r#"{"address": "0xabc", "at": [10, 40], "size": [800, 600], "fullscreen": false}"#;
        let reply: ActiveWindowReply = serde_json::from_str(json).unwrap();
        let window = reply.into_window().unwrap();
        assert!(!window.fullscreen);
        assert_eq!(window.rect, Some(Rect::new(10, 40, 800, 600)));
    }

    #[test]
    fn test_parse_activewindow_empty() {
        let reply: ActiveWindowReply = serde_json::from_str("{}").unwrap();
        assert!(reply.into_window().is_none());
    }

    #[test]
    fn test_parse_monitors() {
        let json = r#"[
            {"id": 1, "name": "HDMI-A-1", "x": 2048, "y": 0, "width": 1920, "height": 1080,
             "scale": 1.0, "transform": 1, "disabled": false},
            {"id": 0, "name": "DP-1", "x": 0, "y": 0, "width": 2560, "height": 1440,
             "scale": 1.25, "transform": 0},
            {"id": 2, "name": "eDP-1", "x": 0, "y": 0, "width": 1920, "height": 1200,
             "disabled": true}
        ]"#;
        let replies: Vec<MonitorReply> = serde_json::from_str(json).unwrap();
        let outputs = into_outputs(replies);

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].index, 0);
        assert_eq!(outputs[0].name, "DP-1");
        assert_eq!(outputs[0].rect, Rect::new(0, 0, 2048, 1152));
        assert_eq!(outputs[1].index, 1);
        assert_eq!(outputs[1].name, "HDMI-A-1");
        assert_eq!(outputs[1].rect, Rect::new(2048, 0, 1080, 1920));
    }

    #[test]
    fn test_malformed_reply() {
        assert!(serde_json::from_str::<CursorReply>("unknown request").is_err());
    }

    #[test]
    #[serial]
    fn test_socket_path_requires_env() {
        // SAFETY: serialized with other environment-mutating tests.
        unsafe {
            env::remove_var("HYPRLAND_INSTANCE_SIGNATURE");
        }
        assert!(matches!(
            get_socket_path(),
            Err(SampleError::Unavailable(_))
        ));
    }

    #[test]
    #[serial]
    fn test_socket_path_found() {
        let dir = tempfile::tempdir().unwrap();
        let sock_dir = dir.path().join("hypr").join("abc123");
        std::fs::create_dir_all(&sock_dir).unwrap();
        std::fs::write(sock_dir.join(".socket.sock"), b"").unwrap();

        // SAFETY: serialized with other environment-mutating tests.
        unsafe {
            env::set_var("XDG_RUNTIME_DIR", dir.path());
            env::set_var("HYPRLAND_INSTANCE_SIGNATURE", "abc123");
        }
        let path = get_socket_path().unwrap();
        assert_eq!(path, sock_dir.join(".socket.sock"));

        unsafe {
            env::remove_var("HYPRLAND_INSTANCE_SIGNATURE");
        }
    }

    #[tokio::test]
    async fn test_request_round_trip_over_socket() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".socket.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"j/cursorpos");
            stream.write_all(br#"{"x": 5, "y": 6}"#).await.unwrap();
        });

        let source = HyprlandSource { socket_path: path };
        let point = source.cursor_position().await.unwrap();
        assert_eq!(point, Point::new(5, 6));
        server.await.unwrap();
    }
}
