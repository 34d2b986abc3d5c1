//! Sync orchestrator.
//!
//! Runs one download or upload sequence against a receiver, streaming
//! progress as tagged events over a channel. Uploads bracket the transfer
//! phase with a stop/resume of the receiver UI, over telnet or the HTTP
//! API depending on the profile, and the control channel is always closed
//! on the way out, including on error.
//!
//! A sync session is exclusive per orchestrator: starting a second
//! operation while one is active fails with [`SyncError::Busy`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::error;

use e2sync_formats::files;

use crate::error::SyncError;
use crate::ftp::{self, Callback, FtpClient};
use crate::http::{encode_query_value, ApiResponse, DeviceApi, PowerState, Request};
use crate::profile::{ControlSurface, Profile};
use crate::telnet::{ControlChannel, ControlConfig};

/// Which data subset an operation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    All,
    Bouquets,
    Satellites,
    Picons,
    Epg,
}

/// Progress reporting is a tagged stream, not bare strings: consumers can
/// tell a status line from a terminal outcome without parsing text.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Progress(String),
    Error(String),
    Done(SyncKind),
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Delete stale `userbouquet.*` files from the receiver before
    /// storing the new set.
    pub remove_unused: bool,
    /// Restrict picon operations to exactly these file names.
    pub files_filter: Option<HashSet<String>>,
}

pub struct Syncer {
    profile: Profile,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Clears the active flag when the running task finishes, however it
/// finishes.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Syncer {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            active: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Requests cancellation of the running operation. Honored between
    /// steps; the step in flight runs to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn try_activate(&self) -> Result<ActiveGuard, SyncError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Busy);
        }
        Ok(ActiveGuard(self.active.clone()))
    }

    /// Starts a download of the given data subset. Events arrive on the
    /// returned channel; the stream ends with `Done` or `Error`.
    pub fn download(
        &self,
        kind: SyncKind,
        options: SyncOptions,
    ) -> Result<UnboundedReceiver<SyncEvent>, SyncError> {
        let guard = self.try_activate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let profile = self.profile.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let _guard = guard;
            finish(
                &tx,
                kind,
                download_task(&profile, kind, &options, &tx, &cancel).await,
            );
        });
        Ok(rx)
    }

    /// Starts an upload of the given data subset.
    pub fn upload(
        &self,
        kind: SyncKind,
        options: SyncOptions,
    ) -> Result<UnboundedReceiver<SyncEvent>, SyncError> {
        let guard = self.try_activate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let profile = self.profile.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let _guard = guard;
            finish(
                &tx,
                kind,
                upload_task(&profile, kind, &options, &tx, &cancel).await,
            );
        });
        Ok(rx)
    }

    /// Deletes picons from the receiver.
    pub fn remove_picons(
        &self,
        options: SyncOptions,
    ) -> Result<UnboundedReceiver<SyncEvent>, SyncError> {
        let guard = self.try_activate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let profile = self.profile.clone();
        tokio::spawn(async move {
            let _guard = guard;
            finish(
                &tx,
                SyncKind::Picons,
                remove_picons_task(&profile, &options, &tx).await,
            );
        });
        Ok(rx)
    }
}

fn finish(tx: &UnboundedSender<SyncEvent>, kind: SyncKind, result: Result<(), SyncError>) {
    match result {
        Ok(()) => {
            let _ = tx.send(SyncEvent::Done(kind));
        }
        Err(e) => {
            let message = format!("Error: {}", e);
            error!("{}", message);
            let _ = tx.send(SyncEvent::Error(message));
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

fn progress(tx: &UnboundedSender<SyncEvent>, message: &str) {
    let _ = tx.send(SyncEvent::Progress(message.to_string()));
}

async fn connect_ftp(
    profile: &Profile,
    tx: &UnboundedSender<SyncEvent>,
) -> Result<FtpClient, SyncError> {
    let mut client = FtpClient::connect(&profile.host, profile.ftp_port, profile.connect_timeout())
        .await?;
    client.login(&profile.user, &profile.password).await?;
    progress(tx, "FTP OK.");
    Ok(client)
}

async fn download_task(
    profile: &Profile,
    kind: SyncKind,
    options: &SyncOptions,
    tx: &UnboundedSender<SyncEvent>,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    if kind == SyncKind::Epg {
        return Err(SyncError::NotImplemented("EPG download"));
    }
    let reporter = |message: &str| progress(tx, message);
    let callback: Callback<'_> = Some(&reporter);

    check_cancel(cancel)?;
    let mut client = connect_ftp(profile, tx).await?;

    let result = async {
        match kind {
            SyncKind::All | SyncKind::Bouquets => {
                let save_path = profile.data_dir();
                tokio::fs::create_dir_all(&save_path).await?;
                check_cancel(cancel)?;
                client.cwd(&profile.services_path).await?;
                let suffixes: Vec<&str> = if kind == SyncKind::All {
                    files::BOUQUET_SUFFIXES
                        .iter()
                        .chain(files::DATA_FILES)
                        .copied()
                        .collect()
                } else {
                    files::BOUQUET_SUFFIXES.to_vec()
                };
                client.download_files(&save_path, &suffixes, callback).await?;
                if kind == SyncKind::All {
                    check_cancel(cancel)?;
                    client
                        .download_xml(
                            &save_path,
                            &profile.satellites_xml_path,
                            files::DESCRIPTOR_FILES,
                            callback,
                        )
                        .await?;
                }
            }
            SyncKind::Satellites => {
                let save_path = profile.data_dir();
                tokio::fs::create_dir_all(&save_path).await?;
                check_cancel(cancel)?;
                client
                    .download_xml(
                        &save_path,
                        &profile.satellites_xml_path,
                        files::DESCRIPTOR_FILES,
                        callback,
                    )
                    .await?;
            }
            SyncKind::Picons => {
                let picon_dir = profile.picon_dir();
                tokio::fs::create_dir_all(&picon_dir).await?;
                check_cancel(cancel)?;
                client
                    .download_picons(
                        &profile.box_picon_path,
                        &picon_dir,
                        callback,
                        options.files_filter.as_ref(),
                    )
                    .await?;
            }
            SyncKind::Epg => unreachable!(),
        }
        Ok::<(), SyncError>(())
    }
    .await;
    client.quit().await;
    result?;
    progress(tx, "Done.");
    Ok(())
}

async fn upload_task(
    profile: &Profile,
    kind: SyncKind,
    options: &SyncOptions,
    tx: &UnboundedSender<SyncEvent>,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    if kind == SyncKind::Epg {
        return Err(SyncError::NotImplemented("EPG upload"));
    }

    let api = match profile.control {
        ControlSurface::Http => Some(DeviceApi::new(profile)?),
        ControlSurface::Telnet => None,
    };
    let mut control: Option<ControlChannel> = None;

    let result = upload_steps(
        profile,
        kind,
        options,
        tx,
        cancel,
        api.as_ref(),
        &mut control,
    )
    .await;

    // Cleanup runs regardless of the transfer outcome.
    if let Some(channel) = control.as_mut() {
        channel.close().await;
    }
    result?;
    progress(tx, "Done.");
    Ok(())
}

async fn upload_steps(
    profile: &Profile,
    kind: SyncKind,
    options: &SyncOptions,
    tx: &UnboundedSender<SyncEvent>,
    cancel: &CancellationToken,
    api: Option<&DeviceApi>,
    control: &mut Option<ControlChannel>,
) -> Result<(), SyncError> {
    let reporter = |message: &str| progress(tx, message);
    let callback: Callback<'_> = Some(&reporter);
    let data_path = profile.data_dir();

    check_cancel(cancel)?;
    match api {
        Some(api) => {
            let message = match kind {
                SyncKind::All => "All user data will be reloaded!",
                SyncKind::Bouquets => "User bouquets will be updated!",
                SyncKind::Satellites => "Satellites.xml file will be updated!",
                SyncKind::Picons => "Picons will be updated!",
                SyncKind::Epg => unreachable!(),
            };
            progress(tx, "Sending info message...");
            let params = format!("text={}&type=2&timeout=5", encode_query_value(message));
            api_send(api, Request::Message, Some(&params)).await?;

            if kind == SyncKind::All {
                time::sleep(Duration::from_secs(5)).await;
                check_cancel(cancel)?;
                progress(tx, "Toggle Standby.");
                api_send(api, Request::Power, Some(PowerState::ToggleStandby.code())).await?;
                time::sleep(Duration::from_secs(2)).await;
            }
        }
        None => {
            if kind != SyncKind::Picons {
                progress(tx, "Telnet initialization ...");
                let mut channel = ControlChannel::new(
                    ControlConfig::from_profile(profile),
                    cancel.clone(),
                );
                channel.connect().await?;
                channel.login().await?;
                progress(tx, "Telnet OK.");
                progress(tx, "Stopping GUI...");
                channel.send_stop().await?;
                *control = Some(channel);
            }
        }
    }

    check_cancel(cancel)?;
    let mut client = connect_ftp(profile, tx).await?;
    let transfer = async {
        match kind {
            SyncKind::Satellites => {
                client
                    .upload_xml(
                        &data_path,
                        &profile.satellites_xml_path,
                        files::DESCRIPTOR_FILES,
                        callback,
                    )
                    .await?;
            }
            SyncKind::Bouquets => {
                client.cwd(&profile.services_path).await?;
                client
                    .upload_bouquets(&data_path, options.remove_unused, callback)
                    .await?;
            }
            SyncKind::All => {
                client
                    .upload_xml(
                        &data_path,
                        &profile.satellites_xml_path,
                        files::DESCRIPTOR_FILES,
                        callback,
                    )
                    .await?;
                check_cancel(cancel)?;
                client.cwd(&profile.services_path).await?;
                client
                    .upload_bouquets(&data_path, options.remove_unused, callback)
                    .await?;
                client
                    .upload_files(&data_path, files::DATA_FILES, callback)
                    .await?;
            }
            SyncKind::Picons => {
                client
                    .upload_picons(
                        &profile.picon_dir(),
                        &profile.box_picon_path,
                        callback,
                        options.files_filter.as_ref(),
                    )
                    .await?;
            }
            SyncKind::Epg => unreachable!(),
        }
        Ok::<(), SyncError>(())
    }
    .await;
    client.quit().await;
    transfer?;

    check_cancel(cancel)?;
    match api {
        Some(api) => match kind {
            SyncKind::Bouquets => {
                progress(tx, "Reloading Userbouquets.");
                api_send(api, Request::ServiceListReload, Some("2")).await?;
            }
            SyncKind::All => {
                progress(tx, "Reloading lamedb and Userbouquets.");
                api_send(api, Request::ServiceListReload, Some("0")).await?;
                progress(tx, "Wakeup from Standby.");
                api_send(api, Request::Power, Some(PowerState::Wakeup.code())).await?;
            }
            _ => {}
        },
        None => {
            if let Some(channel) = control.as_mut() {
                progress(tx, "Starting GUI...");
                channel.send_resume().await?;
            }
        }
    }
    Ok(())
}

/// Control-path API commands must succeed; an error response here means
/// the receiver cannot be quiesced or revived, which fails the sync.
async fn api_send(
    api: &DeviceApi,
    request: Request,
    params: Option<&str>,
) -> Result<(), SyncError> {
    match api.send(request, params).await {
        ApiResponse::Error { reason } => Err(SyncError::Connection(reason)),
        _ => Ok(()),
    }
}

async fn remove_picons_task(
    profile: &Profile,
    options: &SyncOptions,
    tx: &UnboundedSender<SyncEvent>,
) -> Result<(), SyncError> {
    let reporter = |message: &str| progress(tx, message);
    let callback: Callback<'_> = Some(&reporter);
    let mut client = connect_ftp(profile, tx).await?;
    let result = client
        .delete_picons(
            Some(&profile.box_picon_path),
            callback,
            options.files_filter.as_ref(),
        )
        .await;
    client.quit().await;
    result
}

/// One-shot FTP connectivity test.
pub async fn test_ftp(profile: &Profile) -> Result<String, SyncError> {
    ftp::probe(
        &profile.host,
        profile.ftp_port,
        &profile.user,
        &profile.password,
        profile.connect_timeout(),
    )
    .await
}

/// One-shot telnet connectivity test.
pub async fn test_telnet(profile: &Profile) -> Result<String, SyncError> {
    crate::telnet::probe(
        &ControlConfig::from_profile(profile),
        CancellationToken::new(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    async fn log_push(log: &Log, label: &str, entry: &str) {
        log.lock().await.push(format!("{}:{}", label, entry));
    }

    /// Scripted FTP server for one session. `fail_cwd` rejects every CWD
    /// to simulate a broken remote path.
    async fn fake_ftpd(
        listener: TcpListener,
        files: Vec<(&'static str, &'static str)>,
        fail_cwd: bool,
        log: Log,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        writer.write_all(b"220 fake ftpd ready.\r\n").await.unwrap();

        let mut pending_data: Option<TcpListener> = None;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let cmd = line.trim_end().to_string();
            log_push(&log, "ftp", &cmd).await;
            let verb = cmd.split(' ').next().unwrap_or("");
            match verb {
                "USER" => writer.write_all(b"331 Please specify the password.\r\n").await.unwrap(),
                "PASS" => writer.write_all(b"230 Login successful.\r\n").await.unwrap(),
                "TYPE" => writer.write_all(b"200 Switching mode.\r\n").await.unwrap(),
                "CWD" => {
                    if fail_cwd {
                        writer.write_all(b"550 Failed to change directory.\r\n").await.unwrap();
                    } else {
                        writer.write_all(b"250 Directory changed.\r\n").await.unwrap();
                    }
                }
                "PASV" => {
                    let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = data.local_addr().unwrap().port();
                    let reply = format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{}).\r\n",
                        port / 256,
                        port % 256
                    );
                    pending_data = Some(data);
                    writer.write_all(reply.as_bytes()).await.unwrap();
                }
                "NLST" => {
                    writer.write_all(b"150 Here comes the listing.\r\n").await.unwrap();
                    let data = pending_data.take().unwrap();
                    let (mut conn, _) = data.accept().await.unwrap();
                    for (name, _) in &files {
                        conn.write_all(format!("{}\r\n", name).as_bytes()).await.unwrap();
                    }
                    drop(conn);
                    writer.write_all(b"226 Transfer complete.\r\n").await.unwrap();
                }
                "RETR" => {
                    let name = cmd.splitn(2, ' ').nth(1).unwrap_or("");
                    match files.iter().find(|(n, _)| *n == name) {
                        Some((_, body)) => {
                            writer.write_all(b"150 Opening data connection.\r\n").await.unwrap();
                            let data = pending_data.take().unwrap();
                            let (mut conn, _) = data.accept().await.unwrap();
                            conn.write_all(body.as_bytes()).await.unwrap();
                            drop(conn);
                            writer.write_all(b"226 Transfer complete.\r\n").await.unwrap();
                        }
                        None => {
                            pending_data = None;
                            writer.write_all(b"550 Failed to open file.\r\n").await.unwrap();
                        }
                    }
                }
                "STOR" => {
                    writer.write_all(b"150 Ok to send data.\r\n").await.unwrap();
                    let data = pending_data.take().unwrap();
                    let (mut conn, _) = data.accept().await.unwrap();
                    let mut sink = Vec::new();
                    conn.read_to_end(&mut sink).await.unwrap();
                    drop(conn);
                    writer.write_all(b"226 Transfer complete.\r\n").await.unwrap();
                }
                "DELE" => writer.write_all(b"250 Delete operation successful.\r\n").await.unwrap(),
                "QUIT" => {
                    writer.write_all(b"221 Goodbye.\r\n").await.unwrap();
                    break;
                }
                _ => writer.write_all(b"502 Command not implemented.\r\n").await.unwrap(),
            }
        }
    }

    /// Accepts one telnet session and records the lines it receives.
    async fn fake_telnetd(listener: TcpListener, log: Log) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        writer.write_all(b"receiver login: ").await.unwrap();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                log_push(&log, "telnet", "<closed>").await;
                break;
            }
            log_push(&log, "telnet", line.trim_end()).await;
        }
    }

    /// Minimal keep-alive HTTP server recording request paths.
    async fn fake_httpd(listener: TcpListener, log: Log) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let log = log.clone();
            tokio::spawn(async move {
                let (read_half, mut writer) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                loop {
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                        break;
                    }
                    let path = request_line
                        .split(' ')
                        .nth(1)
                        .unwrap_or("")
                        .to_string();
                    let mut content_length = 0usize;
                    loop {
                        let mut header = String::new();
                        if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let header = header.trim_end();
                        if header.is_empty() {
                            break;
                        }
                        if let Some(value) = header
                            .to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(str::trim)
                            .and_then(|v| v.parse().ok())
                        {
                            content_length = value;
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    if content_length > 0 && reader.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    log_push(&log, "http", &path).await;
                    let payload = "<e2simplexmlresult><e2state>True</e2state></e2simplexmlresult>";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
                        payload.len(),
                        payload
                    );
                    if writer.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    fn test_profile(ftp_port: u16, telnet_port: u16, http_port: u16, control: &str, root: &PathBuf) -> Profile {
        toml::from_str(&format!(
            r#"
            name = "box"
            host = "127.0.0.1"
            user = "root"
            password = ""
            ftp_port = {ftp_port}
            telnet_port = {telnet_port}
            http_port = {http_port}
            control = "{control}"
            telnet_timeout_secs = 1
            connect_timeout_secs = 5
            data_path = "{data}"
            picon_path = "{picons}"
            "#,
            data = root.join("data").display(),
            picons = root.join("picons").display(),
        ))
        .unwrap()
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("e2sync-sync-{}", tag));
        let _ = std::fs::remove_dir_all(&root);
        root
    }

    async fn drain(mut rx: UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn seed_bouquets(data_dir: &PathBuf) {
        std::fs::create_dir_all(data_dir).unwrap();
        std::fs::write(data_dir.join("bouquets.tv"), "#NAME Bouquets (TV)\n").unwrap();
        std::fs::write(
            data_dir.join("userbouquet.favourites.tv"),
            "#NAME Favourites (TV)\n",
        )
        .unwrap();
        std::fs::write(data_dir.join("lamedb"), "eDVB services /4/\n").unwrap();
        std::fs::write(data_dir.join("satellites.xml"), "<satellites/>\n").unwrap();
    }

    #[tokio::test]
    async fn telnet_upload_brackets_transfer_with_stop_and_resume() {
        let ftp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let telnet_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ftp_port = ftp_listener.local_addr().unwrap().port();
        let telnet_port = telnet_listener.local_addr().unwrap().port();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(fake_ftpd(ftp_listener, vec![], false, log.clone()));
        tokio::spawn(fake_telnetd(telnet_listener, log.clone()));

        let root = temp_root("telnet-upload");
        let profile = test_profile(ftp_port, telnet_port, 0, "telnet", &root);
        seed_bouquets(&profile.data_dir());

        let syncer = Syncer::new(profile);
        let events = drain(
            syncer
                .upload(SyncKind::Bouquets, SyncOptions::default())
                .unwrap(),
        )
        .await;
        assert_eq!(events.last(), Some(&SyncEvent::Done(SyncKind::Bouquets)));

        let log = log.lock().await;
        let position = |needle: &str| {
            log.iter()
                .position(|e| e == needle)
                .unwrap_or_else(|| panic!("missing {:?} in {:?}", needle, *log))
        };
        let stop = position("telnet:init 4");
        let resume = position("telnet:init 3");
        let stores: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, e)| e.starts_with("ftp:STOR"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(stores.len(), 2, "log: {:?}", *log);
        assert!(stores.iter().all(|&s| stop < s && s < resume));
        // Tuning descriptors and the service database stay local on a
        // bouquets-only upload.
        assert!(!log.iter().any(|e| e == "ftp:STOR satellites.xml"));
        assert!(!log.iter().any(|e| e == "ftp:STOR lamedb"));
    }

    #[tokio::test]
    async fn http_upload_reloads_service_list_after_transfer() {
        let ftp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ftp_port = ftp_listener.local_addr().unwrap().port();
        let http_port = http_listener.local_addr().unwrap().port();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(fake_ftpd(ftp_listener, vec![], false, log.clone()));
        tokio::spawn(fake_httpd(http_listener, log.clone()));

        let root = temp_root("http-upload");
        let profile = test_profile(ftp_port, 0, http_port, "http", &root);
        seed_bouquets(&profile.data_dir());

        let syncer = Syncer::new(profile);
        let events = drain(
            syncer
                .upload(SyncKind::Bouquets, SyncOptions::default())
                .unwrap(),
        )
        .await;
        assert_eq!(events.last(), Some(&SyncEvent::Done(SyncKind::Bouquets)));
        assert!(events.contains(&SyncEvent::Progress("Sending info message...".to_string())));

        let log = log.lock().await;
        let message = log
            .iter()
            .position(|e| e.starts_with("http:/web/message?"))
            .unwrap_or_else(|| panic!("log: {:?}", *log));
        let reload = log
            .iter()
            .position(|e| e == "http:/web/servicelistreload?mode=2")
            .unwrap_or_else(|| panic!("log: {:?}", *log));
        let last_store = log
            .iter()
            .rposition(|e| e.starts_with("ftp:STOR"))
            .unwrap_or_else(|| panic!("log: {:?}", *log));
        assert!(message < last_store && last_store < reload);
        // Bouquets-only uploads never toggle standby.
        assert!(!log.iter().any(|e| e.starts_with("http:/web/powerstate")));
    }

    #[tokio::test]
    async fn transfer_failure_still_closes_control_channel() {
        let ftp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let telnet_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ftp_port = ftp_listener.local_addr().unwrap().port();
        let telnet_port = telnet_listener.local_addr().unwrap().port();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(fake_ftpd(ftp_listener, vec![], true, log.clone()));
        let telnetd = tokio::spawn(fake_telnetd(telnet_listener, log.clone()));

        let root = temp_root("failed-upload");
        let profile = test_profile(ftp_port, telnet_port, 0, "telnet", &root);
        seed_bouquets(&profile.data_dir());

        let syncer = Syncer::new(profile);
        let events = drain(
            syncer
                .upload(SyncKind::Bouquets, SyncOptions::default())
                .unwrap(),
        )
        .await;
        assert!(
            matches!(events.last(), Some(SyncEvent::Error(m)) if m.contains("550")),
            "events: {:?}",
            events
        );
        telnetd.await.unwrap();

        let log = log.lock().await;
        assert!(log.iter().any(|e| e == "telnet:init 4"));
        assert!(!log.iter().any(|e| e == "telnet:init 3"));
        assert!(log.iter().any(|e| e == "telnet:<closed>"));
    }

    #[tokio::test]
    async fn download_bouquets_writes_only_bouquet_files() {
        let ftp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ftp_port = ftp_listener.local_addr().unwrap().port();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(fake_ftpd(
            ftp_listener,
            vec![
                ("bouquets.tv", "#NAME Bouquets (TV)\n"),
                ("userbouquet.favourites.tv", "#NAME Favourites (TV)\n"),
                ("lamedb", "eDVB services /4/\n"),
            ],
            false,
            log.clone(),
        ));

        let root = temp_root("download");
        let profile = test_profile(ftp_port, 0, 0, "http", &root);
        let data_dir = profile.data_dir();

        let syncer = Syncer::new(profile);
        let events = drain(
            syncer
                .download(SyncKind::Bouquets, SyncOptions::default())
                .unwrap(),
        )
        .await;
        assert_eq!(events.last(), Some(&SyncEvent::Done(SyncKind::Bouquets)));
        assert!(data_dir.join("bouquets.tv").is_file());
        assert!(data_dir.join("userbouquet.favourites.tv").is_file());
        assert!(!data_dir.join("lamedb").exists());
    }

    #[tokio::test]
    async fn concurrent_operations_are_rejected() {
        // A listener that accepts but never greets keeps the first
        // operation pinned in its connect phase.
        let stall = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ftp_port = stall.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _conn = stall.accept().await;
            time::sleep(Duration::from_secs(60)).await;
        });

        let root = temp_root("busy");
        let profile = test_profile(ftp_port, 0, 0, "http", &root);
        let syncer = Syncer::new(profile);
        let _rx = syncer
            .download(SyncKind::Bouquets, SyncOptions::default())
            .unwrap();
        let second = syncer.download(SyncKind::Bouquets, SyncOptions::default());
        assert!(matches!(second, Err(SyncError::Busy)));
    }

    #[tokio::test]
    async fn epg_requests_fail_loudly() {
        let root = temp_root("epg");
        let profile = test_profile(1, 1, 1, "http", &root);
        let syncer = Syncer::new(profile);
        let events = drain(
            syncer
                .download(SyncKind::Epg, SyncOptions::default())
                .unwrap(),
        )
        .await;
        assert!(
            matches!(events.last(), Some(SyncEvent::Error(m)) if m.contains("Not implemented")),
            "events: {:?}",
            events
        );
    }
}
