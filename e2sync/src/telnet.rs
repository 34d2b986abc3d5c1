//! Telnet control channel.
//!
//! Quiesces the receiver UI before bouquet uploads (`init 4`) and revives
//! it afterwards (`init 3`). The receiver's telnetd is a plain busybox
//! login shell, so the exchange is prompt scraping with fixed settle
//! delays rather than a negotiated protocol. The channel is an explicit
//! state machine: commands are only valid from specific states, and the
//! stop/resume pair must bracket the transfer phase.
//!
//! Cancellation is honored between steps; a settle delay already in
//! progress runs to completion.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SyncError;
use crate::profile::Profile;

const LOGIN_PROMPT: &[u8] = b"login: ";
const PASSWORD_PROMPT: &[u8] = b"Password: ";
const STOP_COMMAND: &str = "init 4";
const RESUME_COMMAND: &str = "init 3";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Settle delay applied after each step; also bounds prompt reads.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl ControlConfig {
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            host: profile.host.clone(),
            port: profile.telnet_port,
            user: profile.user.clone(),
            password: profile.password.clone(),
            timeout: profile.telnet_timeout(),
            connect_timeout: profile.connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connected,
    Authenticating,
    Ready,
    StopSent,
    ResumeSent,
    Closed,
}

pub struct ControlChannel {
    config: ControlConfig,
    stream: Option<TcpStream>,
    state: ControlState,
    cancel: CancellationToken,
}

impl ControlChannel {
    pub fn new(config: ControlConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            stream: None,
            state: ControlState::Disconnected,
            cancel,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    fn expect_state(&self, wanted: ControlState, action: &str) -> Result<(), SyncError> {
        if self.state != wanted {
            return Err(SyncError::InvalidState(format!(
                "{} requires {:?}, channel is {:?}",
                action, wanted, self.state
            )));
        }
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    pub async fn connect(&mut self) -> Result<(), SyncError> {
        self.expect_state(ControlState::Disconnected, "connect")?;
        self.check_cancel()?;
        let stream = time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        .map_err(|_| SyncError::Timeout)?
        .map_err(|e| SyncError::Connection(e.to_string()))?;
        self.stream = Some(stream);
        self.state = ControlState::Connected;
        time::sleep(self.config.timeout).await;
        Ok(())
    }

    /// Scrapes the login and password prompts. An unanswered prompt is
    /// tolerated; the shell ignores early input and the settle delay
    /// covers slow banners.
    pub async fn login(&mut self) -> Result<(), SyncError> {
        self.expect_state(ControlState::Connected, "login")?;
        self.state = ControlState::Authenticating;
        if !self.config.user.is_empty() {
            self.check_cancel()?;
            self.read_until(LOGIN_PROMPT).await?;
            self.send_line(&self.config.user.clone()).await?;
            time::sleep(self.config.timeout).await;
        }
        if !self.config.password.is_empty() {
            self.check_cancel()?;
            self.read_until(PASSWORD_PROMPT).await?;
            self.send_line(&self.config.password.clone()).await?;
            time::sleep(self.config.timeout).await;
        }
        self.state = ControlState::Ready;
        Ok(())
    }

    /// `init 4`: stop the receiver UI so it cannot overwrite uploaded
    /// configuration. Valid exactly once, before any transfer.
    pub async fn send_stop(&mut self) -> Result<(), SyncError> {
        self.expect_state(ControlState::Ready, "stop")?;
        self.check_cancel()?;
        self.send_line(STOP_COMMAND).await?;
        time::sleep(self.config.timeout).await;
        self.state = ControlState::StopSent;
        Ok(())
    }

    /// `init 3`: restart the receiver UI. Only valid after a stop.
    pub async fn send_resume(&mut self) -> Result<(), SyncError> {
        self.expect_state(ControlState::StopSent, "resume")?;
        self.check_cancel()?;
        self.send_line(RESUME_COMMAND).await?;
        time::sleep(self.config.timeout).await;
        self.state = ControlState::ResumeSent;
        Ok(())
    }

    /// Closes the channel from any state. Idempotent; always safe in
    /// cleanup paths.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.state = ControlState::Closed;
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SyncError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::InvalidState("channel not connected".to_string()))?;
        debug!("telnet -> {}", line);
        stream.write_all(format!("{}\n", line).as_bytes()).await?;
        Ok(())
    }

    /// Reads until `pattern` appears or the settle timeout elapses,
    /// returning whatever arrived. A missing prompt is not an error.
    async fn read_until(&mut self, pattern: &[u8]) -> Result<Vec<u8>, SyncError> {
        let wait = self.config.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::InvalidState("channel not connected".to_string()))?;
        let deadline = Instant::now() + wait;
        let mut seen = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if contains(&seen, pattern) {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match time::timeout(remaining, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => seen.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(seen)
    }

    /// Drains whatever output is currently buffered.
    async fn drain(&mut self) -> Result<Vec<u8>, SyncError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::InvalidState("channel not connected".to_string()))?;
        let mut seen = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match time::timeout(Duration::from_millis(200), stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => seen.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(seen)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// One-shot connectivity test: connect, log in, and inspect the shell
/// output. A lingering password prompt means the credentials were
/// rejected.
pub async fn probe(config: &ControlConfig, cancel: CancellationToken) -> Result<String, SyncError> {
    let mut channel = ControlChannel::new(config.clone(), cancel);
    channel.connect().await?;
    let result = async {
        channel.login().await?;
        let seen = channel.drain().await?;
        let text = String::from_utf8_lossy(&seen).trim().to_string();
        if text.to_lowercase().contains("password") {
            return Err(SyncError::Auth(text));
        }
        Ok(text)
    }
    .await;
    channel.close().await;
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    use super::*;

    fn test_config(port: u16) -> ControlConfig {
        ControlConfig {
            host: "127.0.0.1".to_string(),
            port,
            user: "root".to_string(),
            password: "secret".to_string(),
            timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Accepts one session, presents shell prompts and records the lines
    /// it receives.
    async fn fake_telnetd(listener: TcpListener, log: Arc<Mutex<Vec<String>>>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        writer.write_all(b"receiver login: ").await.unwrap();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                log.lock().await.push("<closed>".to_string());
                break;
            }
            let received = line.trim_end().to_string();
            log.lock().await.push(received.clone());
            if received == "root" {
                writer.write_all(b"Password: ").await.unwrap();
            } else if received == "secret" {
                writer.write_all(b"root@receiver:~# ").await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn stop_and_resume_follow_the_state_machine() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(fake_telnetd(listener, log.clone()));

        let mut channel = ControlChannel::new(test_config(port), CancellationToken::new());
        assert_eq!(channel.state(), ControlState::Disconnected);
        channel.connect().await.unwrap();
        channel.login().await.unwrap();
        assert_eq!(channel.state(), ControlState::Ready);
        channel.send_stop().await.unwrap();
        assert_eq!(channel.state(), ControlState::StopSent);
        channel.send_resume().await.unwrap();
        assert_eq!(channel.state(), ControlState::ResumeSent);
        channel.close().await;
        assert_eq!(channel.state(), ControlState::Closed);
        server.await.unwrap();

        let log = log.lock().await;
        let commands: Vec<&str> = log.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            commands,
            vec!["root", "secret", "init 4", "init 3", "<closed>"]
        );
    }

    #[tokio::test]
    async fn resume_without_stop_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(fake_telnetd(listener, log.clone()));

        let mut channel = ControlChannel::new(test_config(port), CancellationToken::new());
        channel.connect().await.unwrap();
        channel.login().await.unwrap();
        let err = channel.send_resume().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
        // The channel is still usable for the correct sequence.
        channel.send_stop().await.unwrap();
        channel.send_resume().await.unwrap();
        channel.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn double_stop_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(fake_telnetd(listener, log.clone()));

        let mut channel = ControlChannel::new(test_config(port), CancellationToken::new());
        channel.connect().await.unwrap();
        channel.login().await.unwrap();
        channel.send_stop().await.unwrap();
        let err = channel.send_stop().await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
        channel.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_honored_between_steps() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = tokio::spawn(fake_telnetd(listener, log.clone()));

        let cancel = CancellationToken::new();
        let mut channel = ControlChannel::new(test_config(port), cancel.clone());
        channel.connect().await.unwrap();
        channel.login().await.unwrap();
        cancel.cancel();
        let err = channel.send_stop().await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        channel.close().await;
        server.await.unwrap();

        let log = log.lock().await;
        assert!(!log.iter().any(|c| c == "init 4"));
    }

    #[tokio::test]
    async fn probe_flags_rejected_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // A shell that keeps re-presenting the password prompt.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            writer.write_all(b"receiver login: ").await.unwrap();
            let mut line = String::new();
            while reader.read_line(&mut line).await.unwrap() > 0 {
                writer.write_all(b"Password: ").await.unwrap();
                line.clear();
            }
        });

        let err = probe(&test_config(port), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        server.await.unwrap();
    }
}
