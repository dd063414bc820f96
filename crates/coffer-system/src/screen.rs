//! Front-panel screen renderer.
//!
//! The display daemon listens on a unix socket and accepts a JSON array of
//! line descriptors over a minimal HTTP POST. Rendering is advisory, so
//! every failure is logged and dropped.

use coffer_provider::{ScreenLine, StatusScreen};
use log::warn;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SOCKET: &str = "/var/run/coffer-screen.sock";
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Renders status lines on the appliance display over its unix socket.
#[derive(Debug, Clone)]
pub struct FramebufferScreen {
    socket_path: PathBuf,
}

impl Default for FramebufferScreen {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET)
    }
}

impl FramebufferScreen {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    fn post(&self, body: &[u8]) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        write!(
            stream,
            "POST /text HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )?;
        stream.write_all(body)?;
        stream.flush()
    }
}

impl StatusScreen for FramebufferScreen {
    fn render(&self, lines: &[ScreenLine]) {
        let body = match serde_json::to_vec(lines) {
            Ok(body) => body,
            Err(err) => {
                warn!("screen payload unserialisable: {err}");
                return;
            }
        };
        if let Err(err) = self.post(&body) {
            warn!(
                "screen render failed via {}: {err}",
                self.socket_path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;
    use tempfile::tempdir;

    #[test]
    fn render_posts_serialised_lines_to_the_socket() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("screen.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let screen = FramebufferScreen::new(&socket);
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).unwrap();
            received
        });

        screen.render(&[ScreenLine::new("Coffer", "3C89C7", 26, 20).bold()]);

        let received = handle.join().unwrap();
        assert!(received.starts_with("POST /text HTTP/1.1\r\n"));
        assert!(received.contains(r#""content":"Coffer""#));
        assert!(received.contains(r#""bold":true"#));
    }

    #[test]
    fn render_survives_a_missing_display_daemon() {
        let screen = FramebufferScreen::new("/nonexistent/screen.sock");
        screen.render(&[ScreenLine::new("locked", "CCCCCC", 18, 60)]);
    }
}
