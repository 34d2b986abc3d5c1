//! FTP transfer client.
//!
//! Hand-rolled passive-mode FTP over [`tokio::net::TcpStream`]. The
//! receiver's ftpd is a small busybox build, so only the classic command
//! set is used: USER/PASS, TYPE, PASV, CWD, NLST, LIST, RETR, STOR, DELE,
//! MKD, RMD, RNFR/RNTO.
//!
//! Directory listings and file names from older images are not always
//! valid UTF-8; all control-channel text is decoded tolerantly by dropping
//! undecodable bytes rather than failing the session.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, warn};

use e2sync_formats::files;

use crate::error::SyncError;

/// Optional per-step progress reporter. When absent, status lines go to
/// the log instead.
pub type Callback<'a> = Option<&'a (dyn Fn(&str) + Send + Sync)>;

fn report(callback: Callback<'_>, message: &str) {
    match callback {
        Some(cb) => cb(message),
        None => info!("{}", message),
    }
}

/// Decodes bytes as UTF-8, dropping undecodable sequences.
fn decode_tolerant(raw: &[u8]) -> String {
    let (text, _, _) = encoding_rs::UTF_8.decode(raw);
    text.chars().filter(|c| *c != '\u{FFFD}').collect()
}

/// One line of a `LIST` response, parsed leniently: whitespace-separated
/// fields, type taken from the first character of the mode column, name
/// from field 9 onwards (names may contain spaces).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ListEntry {
    pub is_dir: bool,
    pub name: String,
}

impl ListEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            return None;
        }
        Some(Self {
            is_dir: fields[0].starts_with('d'),
            name: fields[8..].join(" "),
        })
    }
}

/// Predicate selecting picon files: with an explicit filter set it is pure
/// membership, otherwise any file with a picon image suffix matches. Both
/// upload and download use the same predicate, so a filtered download
/// followed by a filtered upload touches exactly the same file set.
pub fn picon_filter(files_filter: Option<&HashSet<String>>) -> impl Fn(&str) -> bool + '_ {
    move |name: &str| match files_filter {
        Some(set) => set.contains(name),
        None => files::has_suffix(name, files::PICON_SUFFIXES),
    }
}

pub struct FtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    welcome: String,
}

impl FtpClient {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, SyncError> {
        let stream = time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SyncError::Timeout)?
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
            welcome: String::new(),
        };
        let (code, text) = client.read_response().await?;
        if code != 220 {
            return Err(SyncError::Connection(text));
        }
        client.welcome = text;
        Ok(client)
    }

    /// Server greeting, kept for connectivity tests.
    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), SyncError> {
        let (code, text) = self.command(&format!("USER {}", user)).await?;
        match code {
            230 => return Ok(()),
            331 | 332 => {}
            _ => return Err(SyncError::Auth(text)),
        }
        let (code, text) = self.command(&format!("PASS {}", password)).await?;
        if code >= 400 {
            return Err(SyncError::Auth(text));
        }
        Ok(())
    }

    pub async fn quit(mut self) {
        let _ = self.command("QUIT").await;
    }

    async fn read_line(&mut self) -> Result<String, SyncError> {
        let mut raw = Vec::new();
        time::timeout(self.timeout, self.reader.read_until(b'\n', &mut raw))
            .await
            .map_err(|_| SyncError::Timeout)??;
        if raw.is_empty() {
            return Err(SyncError::Connection(
                "Control connection closed".to_string(),
            ));
        }
        let mut line = decode_tolerant(&raw);
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Reads one reply, following `ddd-` multi-line replies through to the
    /// matching `ddd ` terminator.
    async fn read_response(&mut self) -> Result<(u16, String), SyncError> {
        let first = self.read_line().await?;
        let code: u16 = first
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| SyncError::Connection(format!("Malformed reply: {:?}", first)))?;
        let mut text = first.clone();
        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", &first[..3]);
            loop {
                let line = self.read_line().await?;
                text.push('\n');
                text.push_str(&line);
                if line.starts_with(&terminator) {
                    break;
                }
            }
        }
        debug!("ftp <- {}", text);
        Ok((code, text))
    }

    async fn command(&mut self, cmd: &str) -> Result<(u16, String), SyncError> {
        debug!("ftp -> {}", cmd);
        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await?;
        self.read_response().await
    }

    /// Sends a command that must succeed; error replies become
    /// [`SyncError::Transfer`].
    async fn voidcmd(&mut self, cmd: &str) -> Result<String, SyncError> {
        let (code, text) = self.command(cmd).await?;
        if code >= 400 {
            return Err(SyncError::Transfer(text));
        }
        Ok(text)
    }

    pub async fn cwd(&mut self, path: &str) -> Result<String, SyncError> {
        self.voidcmd(&format!("CWD {}", path)).await
    }

    pub async fn mkd(&mut self, path: &str) -> Result<String, SyncError> {
        self.voidcmd(&format!("MKD {}", path)).await
    }

    pub async fn rmd(&mut self, path: &str) -> Result<String, SyncError> {
        self.voidcmd(&format!("RMD {}", path)).await
    }

    /// Opens the passive-mode data connection advertised by a 227 reply.
    async fn open_data(&mut self) -> Result<TcpStream, SyncError> {
        let (code, text) = self.command("PASV").await?;
        if code != 227 {
            return Err(SyncError::Transfer(text));
        }
        let start = text.find('(');
        let end = text.rfind(')');
        let numbers: Vec<u16> = match (start, end) {
            (Some(s), Some(e)) if s < e => text[s + 1..e]
                .split(',')
                .filter_map(|n| n.trim().parse().ok())
                .collect(),
            _ => Vec::new(),
        };
        // Each of the six numbers is one octet; anything else is a lie.
        if numbers.len() != 6 || numbers.iter().any(|n| *n > 255) {
            return Err(SyncError::Connection(format!(
                "Malformed passive reply: {:?}",
                text
            )));
        }
        let addr = format!(
            "{}.{}.{}.{}",
            numbers[0], numbers[1], numbers[2], numbers[3]
        );
        let port = numbers[4] * 256 + numbers[5];
        time::timeout(self.timeout, TcpStream::connect((addr.as_str(), port)))
            .await
            .map_err(|_| SyncError::Timeout)?
            .map_err(|e| SyncError::Connection(e.to_string()))
    }

    /// Sets binary mode, opens the data connection and issues the transfer
    /// command. Returns the open data stream once the server has accepted
    /// the transfer.
    async fn start_transfer(&mut self, cmd: &str) -> Result<TcpStream, SyncError> {
        self.voidcmd("TYPE I").await?;
        let data = self.open_data().await?;
        let (code, text) = self.command(cmd).await?;
        if code >= 400 {
            return Err(SyncError::Transfer(text));
        }
        Ok(data)
    }

    /// Names in the current remote directory.
    pub async fn nlst(&mut self) -> Result<Vec<String>, SyncError> {
        let raw = self.retrieve_lines("NLST").await?;
        Ok(raw)
    }

    /// Long listing of `path` (or the current directory when empty).
    pub async fn dir(&mut self, path: &str) -> Result<Vec<String>, SyncError> {
        let cmd = if path.is_empty() {
            "LIST".to_string()
        } else {
            format!("LIST {}", path)
        };
        self.retrieve_lines(&cmd).await
    }

    async fn retrieve_lines(&mut self, cmd: &str) -> Result<Vec<String>, SyncError> {
        self.voidcmd("TYPE A").await?;
        let mut data = self.open_data().await?;
        let (code, text) = self.command(cmd).await?;
        if code >= 400 {
            return Err(SyncError::Transfer(text));
        }
        let mut raw = Vec::new();
        data.read_to_end(&mut raw).await?;
        drop(data);
        let (code, text) = self.read_response().await?;
        if code >= 400 {
            return Err(SyncError::Transfer(text));
        }
        Ok(decode_tolerant(&raw)
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn retr_to_file(&mut self, name: &str, local: &Path) -> Result<String, SyncError> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(local).await?;
        let mut data = self.start_transfer(&format!("RETR {}", name)).await?;
        tokio::io::copy(&mut data, &mut file).await?;
        file.flush().await?;
        drop(data);
        let (code, text) = self.read_response().await?;
        if code >= 400 {
            return Err(SyncError::Transfer(text));
        }
        Ok(text)
    }

    /// Downloads one file into `save_path`, reporting the final status
    /// line either way. Transfer rejections are reported and returned.
    pub async fn download_file(
        &mut self,
        name: &str,
        save_path: &Path,
        callback: Callback<'_>,
    ) -> Result<String, SyncError> {
        let local = save_path.join(name);
        match self.retr_to_file(name, &local).await {
            Ok(status) => {
                report(
                    callback,
                    &format!("Downloading file: {}.   Status: {}", name, status),
                );
                Ok(status)
            }
            Err(SyncError::Transfer(status)) => {
                report(
                    callback,
                    &format!("Downloading file: {}.   Status: {}", name, status),
                );
                Err(SyncError::Transfer(status))
            }
            Err(e) => Err(e),
        }
    }

    async fn stor_from_file(&mut self, name: &str, local: &Path) -> Result<String, SyncError> {
        let mut file = fs::File::open(local).await?;
        let mut data = self.start_transfer(&format!("STOR {}", name)).await?;
        tokio::io::copy(&mut file, &mut data).await?;
        data.shutdown().await?;
        drop(data);
        let (code, text) = self.read_response().await?;
        if code >= 400 {
            return Err(SyncError::Transfer(text));
        }
        Ok(text)
    }

    /// Uploads `local_dir/name` into the current remote directory. A
    /// missing local file is reported and skipped, not an error.
    pub async fn upload_file(
        &mut self,
        name: &str,
        local_dir: &Path,
        callback: Callback<'_>,
    ) -> Result<String, SyncError> {
        let src = local_dir.join(name);
        if !src.is_file() {
            let status = "500 File not found.".to_string();
            report(
                callback,
                &format!("Uploading file: {}.   Status: {}", name, status),
            );
            return Ok(status);
        }
        match self.stor_from_file(name, &src).await {
            Ok(status) => {
                report(
                    callback,
                    &format!("Uploading file: {}.   Status: {}", name, status),
                );
                Ok(status)
            }
            Err(SyncError::Transfer(status)) => {
                report(
                    callback,
                    &format!("Uploading file: {}.   Status: {}", name, status),
                );
                Err(SyncError::Transfer(status))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete_file(
        &mut self,
        name: &str,
        callback: Callback<'_>,
    ) -> Result<String, SyncError> {
        let (code, text) = self.command(&format!("DELE {}", name)).await?;
        report(
            callback,
            &format!("Deleting file: {}.   Status: {}", name, text),
        );
        if code >= 400 {
            return Err(SyncError::Transfer(text));
        }
        Ok(text)
    }

    pub async fn rename_file(
        &mut self,
        from: &str,
        to: &str,
        callback: Callback<'_>,
    ) -> Result<String, SyncError> {
        let (code, text) = self.command(&format!("RNFR {}", from)).await?;
        if code != 350 {
            report(
                callback,
                &format!("Renaming file: {} -> {}.   Status: {}", from, to, text),
            );
            return Err(SyncError::Transfer(text));
        }
        let (code, text) = self.command(&format!("RNTO {}", to)).await?;
        report(
            callback,
            &format!("Renaming file: {} -> {}.   Status: {}", from, to, text),
        );
        if code >= 400 {
            return Err(SyncError::Transfer(text));
        }
        Ok(text)
    }

    /// Downloads every file in the current remote directory whose name
    /// ends with one of `suffixes`. Per-file rejections are logged and
    /// skipped; session failures abort.
    pub async fn download_files(
        &mut self,
        save_path: &Path,
        suffixes: &[&str],
        callback: Callback<'_>,
    ) -> Result<(), SyncError> {
        let names = self.nlst().await?;
        for name in names {
            if !files::has_suffix(&name, suffixes) {
                continue;
            }
            match self.download_file(&name, save_path, callback).await {
                Ok(_) => {}
                Err(SyncError::Transfer(status)) => {
                    warn!("Skipped {}: {}", name, status);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Uploads every bouquet-suffixed file from `data_path` into the
    /// current remote directory, skipping tuning descriptor files.
    pub async fn upload_files(
        &mut self,
        data_path: &Path,
        suffixes: &[&str],
        callback: Callback<'_>,
    ) -> Result<(), SyncError> {
        let mut entries = fs::read_dir(data_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if files::is_descriptor_file(&name) {
                continue;
            }
            if !files::has_suffix(&name, suffixes) {
                continue;
            }
            match self.upload_file(&name, data_path, callback).await {
                Ok(_) => {}
                Err(SyncError::Transfer(status)) => {
                    warn!("Skipped {}: {}", name, status);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Deletes stale bouquet machinery from the current remote directory
    /// before an upload replaces it.
    pub async fn remove_unused_bouquets(&mut self, callback: Callback<'_>) -> Result<(), SyncError> {
        let names = self.nlst().await?;
        for name in names {
            if !files::has_prefix(&name, files::UNUSED_BOUQUET_PREFIXES) {
                continue;
            }
            match self.delete_file(&name, callback).await {
                Ok(_) => {}
                Err(SyncError::Transfer(status)) => {
                    warn!("Skipped {}: {}", name, status);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Uploads the bouquet set, optionally clearing unused bouquet files
    /// from the receiver first.
    pub async fn upload_bouquets(
        &mut self,
        data_path: &Path,
        remove_unused: bool,
        callback: Callback<'_>,
    ) -> Result<(), SyncError> {
        if remove_unused {
            self.remove_unused_bouquets(callback).await?;
        }
        self.upload_files(data_path, files::BOUQUET_SUFFIXES, callback)
            .await
    }

    /// Downloads the tuning descriptor files from their own remote
    /// directory.
    pub async fn download_xml(
        &mut self,
        save_path: &Path,
        xml_path: &str,
        names: &[&str],
        callback: Callback<'_>,
    ) -> Result<(), SyncError> {
        self.cwd(xml_path).await?;
        self.download_files(save_path, names, callback).await
    }

    pub async fn upload_xml(
        &mut self,
        data_path: &Path,
        xml_path: &str,
        names: &[&str],
        callback: Callback<'_>,
    ) -> Result<(), SyncError> {
        self.cwd(xml_path).await?;
        for name in names {
            if !data_path.join(name).is_file() {
                continue;
            }
            match self.upload_file(name, data_path, callback).await {
                Ok(_) => {}
                Err(SyncError::Transfer(status)) => {
                    warn!("Skipped {}: {}", name, status);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Recursively mirrors remote `path` below `save_path`. Per-file
    /// rejections are skipped; anything that breaks the session aborts.
    pub async fn download_dir(
        &mut self,
        path: &str,
        save_path: &Path,
        callback: Callback<'_>,
    ) -> Result<String, SyncError> {
        self.download_dir_inner(path.to_string(), save_path, callback)
            .await
    }

    fn download_dir_inner<'a>(
        &'a mut self,
        path: String,
        save_path: &'a Path,
        callback: Callback<'a>,
    ) -> BoxFuture<'a, Result<String, SyncError>> {
        Box::pin(async move {
            fs::create_dir_all(save_path.join(&path)).await?;
            let lines = self.dir(&path).await?;
            for line in lines {
                let Some(entry) = ListEntry::parse(&line) else {
                    continue;
                };
                let child = if path.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", path, entry.name)
                };
                if entry.is_dir {
                    self.download_dir_inner(child, save_path, callback).await?;
                } else {
                    match self.download_file(&child, save_path, callback).await {
                        Ok(_) => {}
                        Err(SyncError::Transfer(status)) => {
                            warn!("Skipped {}: {}", child, status);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            let status = "226 Transfer complete.".to_string();
            report(
                callback,
                &format!("Copy directory {}.   Status: {}", path, status),
            );
            Ok(status)
        })
    }

    /// Recursively uploads the contents of local `dir` into the current
    /// remote directory.
    pub async fn upload_dir(
        &mut self,
        dir: &Path,
        callback: Callback<'_>,
    ) -> Result<(), SyncError> {
        self.upload_dir_inner(dir.to_path_buf(), callback).await
    }

    fn upload_dir_inner<'a>(
        &'a mut self,
        dir: std::path::PathBuf,
        callback: Callback<'a>,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type().await?.is_dir() {
                    // A failed MKD usually means the directory exists.
                    if let Err(SyncError::Transfer(status)) = self.mkd(&name).await {
                        debug!("MKD {}: {}", name, status);
                    }
                    match self.cwd(&name).await {
                        Ok(_) => {}
                        Err(SyncError::Transfer(status)) => {
                            warn!("Skipped directory {}: {}", name, status);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    self.upload_dir_inner(entry.path(), callback).await?;
                    self.cwd("..").await?;
                } else {
                    match self.upload_file(&name, &dir, callback).await {
                        Ok(_) => {}
                        Err(SyncError::Transfer(status)) => {
                            warn!("Skipped {}: {}", name, status);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(())
        })
    }

    /// Recursively removes remote `path` and everything below it.
    pub async fn delete_dir(
        &mut self,
        path: &str,
        callback: Callback<'_>,
    ) -> Result<String, SyncError> {
        self.delete_dir_inner(path.to_string(), callback).await
    }

    fn delete_dir_inner<'a>(
        &'a mut self,
        path: String,
        callback: Callback<'a>,
    ) -> BoxFuture<'a, Result<String, SyncError>> {
        Box::pin(async move {
            let lines = self.dir(&path).await?;
            for line in lines {
                let Some(entry) = ListEntry::parse(&line) else {
                    continue;
                };
                let child = format!("{}/{}", path, entry.name);
                if entry.is_dir {
                    self.delete_dir_inner(child, callback).await?;
                } else {
                    match self.delete_file(&child, callback).await {
                        Ok(_) => {}
                        Err(SyncError::Transfer(status)) => {
                            warn!("Skipped {}: {}", child, status);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            let status = self.rmd(&path).await?;
            report(
                callback,
                &format!("Remove directory {}.   Status: {}", path, status),
            );
            Ok(status)
        })
    }

    /// Downloads picons from `src` into local `dest`. An unreachable picon
    /// directory is reported and the step ends without failing the sync.
    pub async fn download_picons(
        &mut self,
        src: &str,
        dest: &Path,
        callback: Callback<'_>,
        files_filter: Option<&HashSet<String>>,
    ) -> Result<(), SyncError> {
        match self.cwd(src).await {
            Ok(_) => {}
            Err(SyncError::Transfer(status)) => {
                report(callback, &status);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        let names = self.nlst().await?;
        let wanted = picon_filter(files_filter);
        for name in names {
            if !wanted(&name) {
                continue;
            }
            match self.download_file(&name, dest, callback).await {
                Ok(_) => {}
                Err(SyncError::Transfer(status)) => {
                    warn!("Skipped {}: {}", name, status);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Uploads picons from local `src` into remote `dest`, creating the
    /// remote directory when missing.
    pub async fn upload_picons(
        &mut self,
        src: &Path,
        dest: &str,
        callback: Callback<'_>,
        files_filter: Option<&HashSet<String>>,
    ) -> Result<(), SyncError> {
        match self.cwd(dest).await {
            Ok(_) => {}
            Err(SyncError::Transfer(_)) => {
                self.mkd(dest).await?;
                self.cwd(dest).await?;
            }
            Err(e) => return Err(e),
        }
        let wanted = picon_filter(files_filter);
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !wanted(&name) {
                continue;
            }
            match self.upload_file(&name, src, callback).await {
                Ok(_) => {}
                Err(SyncError::Transfer(status)) => {
                    warn!("Skipped {}: {}", name, status);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Deletes picons from remote `dest` (or the current directory).
    pub async fn delete_picons(
        &mut self,
        dest: Option<&str>,
        callback: Callback<'_>,
        files_filter: Option<&HashSet<String>>,
    ) -> Result<(), SyncError> {
        if let Some(dest) = dest {
            self.cwd(dest).await?;
        }
        let names = self.nlst().await?;
        let wanted = picon_filter(files_filter);
        for name in names {
            if !wanted(&name) {
                continue;
            }
            match self.delete_file(&name, callback).await {
                Ok(_) => {}
                Err(SyncError::Transfer(status)) => {
                    warn!("Skipped {}: {}", name, status);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// One-shot connectivity test: connect, log in, return the greeting.
pub async fn probe(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    timeout: Duration,
) -> Result<String, SyncError> {
    let mut client = FtpClient::connect(host, port, timeout).await?;
    client.login(user, password).await?;
    let welcome = client.welcome().to_string();
    client.quit().await;
    Ok(welcome)
}
