//! HTTP device API client.
//!
//! Talks to the receiver's OpenWebif-style web interface under `/web/`.
//! Every command maps to a fixed relative path; responses are small XML
//! documents that are flattened into string maps rather than typed
//! structures, since field sets vary wildly between firmware builds.
//!
//! The interface uses a form-token scheme on top of HTTP basic auth: each
//! request POSTs the current `sessionid` token as its body, and a 401
//! triggers a token refresh with credentials attached. At most three
//! consecutive challenges are attempted before the client gives up, so a
//! wrong password cannot loop forever.
//!
//! API errors are returned as [`ApiResponse::Error`], never raised: a
//! failed remote-control keypress should not tear down a sync session.

use std::collections::HashMap;

use bytes::Bytes;
use quick_xml::events::{BytesRef, Event};
use quick_xml::Reader;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SyncError;
use crate::profile::Profile;

const MAX_AUTH_CHALLENGES: u32 = 3;

/// Commands understood by the device web interface. Each maps to a fixed
/// relative path under `/web/`; parameterized commands end with their
/// query prefix and the caller appends the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    Zap,
    Info,
    Signal,
    Stream,
    StreamCurrent,
    Current,
    PowerState,
    Power,
    Token,
    Message,
    ServiceListReload,
    Play,
    PlayerList,
    PlayerPlay,
    PlayerNext,
    PlayerPrev,
    PlayerStop,
    PlayerRemove,
    Remote,
    Volume,
    Epg,
    TimerList,
    Grab,
}

impl Request {
    pub fn path(self) -> &'static str {
        match self {
            Request::Zap => "zap?sRef=",
            Request::Info => "about",
            Request::Signal => "signal",
            Request::Stream => "stream.m3u?ref=",
            Request::StreamCurrent => "streamcurrent.m3u",
            Request::Current => "getcurrent",
            Request::PowerState => "powerstate",
            Request::Power => "powerstate?newstate=",
            Request::Token => "session",
            Request::Message => "message?",
            Request::ServiceListReload => "servicelistreload?mode=",
            Request::Play => "mediaplayerplay?file=",
            Request::PlayerList => "mediaplayerlist?path=playlist",
            Request::PlayerPlay => "mediaplayercmd?command=play",
            Request::PlayerNext => "mediaplayercmd?command=next",
            Request::PlayerPrev => "mediaplayercmd?command=previous",
            Request::PlayerStop => "mediaplayercmd?command=stop",
            Request::PlayerRemove => "mediaplayerremove?file=",
            Request::Remote => "remotecontrol?command=",
            Request::Volume => "vol?set=set",
            Request::Epg => "epgservice?sRef=",
            Request::TimerList => "timerlist",
            Request::Grab => "grab?format=jpg&",
        }
    }
}

/// Power state codes accepted by the `powerstate?newstate=` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    ToggleStandby,
    DeepStandby,
    Reboot,
    RestartGui,
    Wakeup,
    Standby,
}

impl PowerState {
    pub fn code(self) -> &'static str {
        match self {
            PowerState::ToggleStandby => "0",
            PowerState::DeepStandby => "1",
            PowerState::Reboot => "2",
            PowerState::RestartGui => "3",
            PowerState::Wakeup => "4",
            PowerState::Standby => "5",
        }
    }
}

/// Remote control key codes for the `remotecontrol?command=` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKey {
    Power,
    Up,
    Down,
    Left,
    Right,
    Menu,
    Exit,
    Ok,
    Red,
    Green,
    Yellow,
    Blue,
    ChannelUp,
    ChannelDown,
    VolumeUp,
    VolumeDown,
    Mute,
}

impl RemoteKey {
    pub fn code(self) -> &'static str {
        match self {
            RemoteKey::Power => "116",
            RemoteKey::Up => "103",
            RemoteKey::Down => "108",
            RemoteKey::Left => "105",
            RemoteKey::Right => "106",
            RemoteKey::Menu => "139",
            RemoteKey::Exit => "174",
            RemoteKey::Ok => "352",
            RemoteKey::Red => "398",
            RemoteKey::Green => "399",
            RemoteKey::Yellow => "400",
            RemoteKey::Blue => "401",
            RemoteKey::ChannelUp => "402",
            RemoteKey::ChannelDown => "403",
            RemoteKey::VolumeUp => "115",
            RemoteKey::VolumeDown => "114",
            RemoteKey::Mute => "113",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// Raw payload for stream playlists and screenshots.
    Bytes(Bytes),
    /// A flat single-record document (`e2about`, `e2powerstate`, ...).
    Fields(HashMap<String, String>),
    /// A repeated-record document (EPG events, playlist entries, timers).
    List(Vec<HashMap<String, String>>),
    Error {
        reason: String,
    },
}

pub struct DeviceApi {
    base_url: String,
    client: reqwest::Client,
    user: String,
    password: String,
    token: Mutex<String>,
}

impl DeviceApi {
    pub fn new(profile: &Profile) -> Result<Self, SyncError> {
        let scheme = if profile.http_use_ssl { "https" } else { "http" };
        let base_url = format!("{}://{}:{}/web/", scheme, profile.host, profile.http_port);
        // Receivers ship self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(profile.connect_timeout())
            .build()
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        Ok(Self {
            base_url,
            client,
            user: profile.user.clone(),
            password: profile.password.clone(),
            token: Mutex::new("sessionid=0".to_string()),
        })
    }

    /// Sends one command, transparently refreshing the session token on a
    /// 401 challenge. Never returns `Err`; failures come back as
    /// [`ApiResponse::Error`].
    pub async fn send(&self, request: Request, params: Option<&str>) -> ApiResponse {
        for attempt in 0..MAX_AUTH_CHALLENGES {
            let response = self.post(request, params, attempt > 0).await;
            match response {
                Ok(r) if r.status() == StatusCode::UNAUTHORIZED => {
                    debug!("http 401 for {:?}, refreshing session token", request);
                    if let Err(reason) = self.refresh_token().await {
                        return ApiResponse::Error { reason };
                    }
                }
                Ok(r) if !r.status().is_success() => {
                    return ApiResponse::Error {
                        reason: format!("HTTP {}", r.status()),
                    }
                }
                Ok(r) => return Self::into_response(request, r).await,
                Err(e) => return ApiResponse::Error {
                    reason: e.to_string(),
                },
            }
        }
        ApiResponse::Error {
            reason: "Authentication failed after repeated challenges".to_string(),
        }
    }

    async fn post(
        &self,
        request: Request,
        params: Option<&str>,
        with_auth: bool,
    ) -> reqwest::Result<reqwest::Response> {
        let url = format!(
            "{}{}{}",
            self.base_url,
            request.path(),
            params.unwrap_or("")
        );
        debug!("http -> {}", url);
        let token = self.token.lock().await.clone();
        let mut builder = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(token);
        if with_auth {
            builder = builder.basic_auth(&self.user, Some(&self.password));
        }
        builder.send().await
    }

    async fn refresh_token(&self) -> Result<(), String> {
        let url = format!("{}{}", self.base_url, Request::Token.path());
        let body = self.token.lock().await.clone();
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err("Session request rejected".to_string());
        }
        let text = response.text().await.map_err(|e| e.to_string())?;
        let fields = flatten_xml(&text);
        let id = fields
            .get("e2sessionid")
            .cloned()
            .unwrap_or_else(|| "0".to_string());
        *self.token.lock().await = format!("sessionid={}", id);
        Ok(())
    }

    async fn into_response(request: Request, response: reqwest::Response) -> ApiResponse {
        match request {
            Request::Stream | Request::StreamCurrent | Request::Grab => {
                match response.bytes().await {
                    Ok(payload) => ApiResponse::Bytes(payload),
                    Err(e) => ApiResponse::Error {
                        reason: e.to_string(),
                    },
                }
            }
            _ => {
                let text = match response.text().await {
                    Ok(t) => t,
                    Err(e) => {
                        return ApiResponse::Error {
                            reason: e.to_string(),
                        }
                    }
                };
                match request {
                    Request::Current => {
                        let mut events = collect_items(&text, "e2event");
                        if events.is_empty() {
                            ApiResponse::Fields(HashMap::new())
                        } else {
                            ApiResponse::Fields(events.remove(0))
                        }
                    }
                    Request::Epg => ApiResponse::List(collect_items(&text, "e2event")),
                    Request::PlayerList => ApiResponse::List(collect_items(&text, "e2file")),
                    Request::TimerList => ApiResponse::List(collect_items(&text, "e2timer")),
                    _ => ApiResponse::Fields(flatten_xml(&text)),
                }
            }
        }
    }
}

/// Resolves a character or predefined entity reference to its text.
/// Custom DTD entities have no definition here and resolve to nothing.
fn resolve_entity(reference: &BytesRef) -> Option<String> {
    if let Ok(Some(ch)) = reference.resolve_char_ref() {
        return Some(ch.to_string());
    }
    let name = reference.decode().ok()?;
    let resolved = match name.as_ref() {
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        _ => return None,
    };
    Some(resolved.to_string())
}

/// Flattens a single-record XML document into tag -> text.
///
/// The reader splits element content around entity references, so text
/// is accumulated per element and committed at its end tag. Trimming
/// happens on the accumulated value, not per fragment, which keeps
/// interior whitespace around entities intact.
fn flatten_xml(xml: &str) -> HashMap<String, String> {
    let mut reader = Reader::from_str(xml);
    let mut fields = HashMap::new();
    let mut tag = String::new();
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                text.clear();
            }
            Ok(Event::Text(ref e)) => {
                if !tag.is_empty() {
                    if let Ok(chunk) = e.xml_content() {
                        text.push_str(&chunk);
                    }
                }
            }
            Ok(Event::GeneralRef(ref e)) => {
                if !tag.is_empty() {
                    if let Some(resolved) = resolve_entity(e) {
                        text.push_str(&resolved);
                    }
                }
            }
            Ok(Event::End(_)) => {
                let value = text.trim();
                if !tag.is_empty() && !value.is_empty() {
                    fields.insert(std::mem::take(&mut tag), value.to_string());
                }
                tag.clear();
                text.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    fields
}

/// Collects each `<item>...</item>` record of a repeated-record document
/// into its own tag -> text map.
fn collect_items(xml: &str, item: &str) -> Vec<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut items = Vec::new();
    let mut current: Option<HashMap<String, String>> = None;
    let mut tag = String::new();
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == item {
                    current = Some(HashMap::new());
                    tag.clear();
                    text.clear();
                } else if current.is_some() {
                    tag = name;
                    text.clear();
                }
            }
            Ok(Event::Text(ref e)) => {
                if current.is_some() && !tag.is_empty() {
                    if let Ok(chunk) = e.xml_content() {
                        text.push_str(&chunk);
                    }
                }
            }
            Ok(Event::GeneralRef(ref e)) => {
                if current.is_some() && !tag.is_empty() {
                    if let Some(resolved) = resolve_entity(e) {
                        text.push_str(&resolved);
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == item {
                    if let Some(record) = current.take() {
                        items.push(record);
                    }
                } else if let Some(record) = current.as_mut() {
                    if !tag.is_empty() {
                        record.insert(std::mem::take(&mut tag), text.trim().to_string());
                        text.clear();
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    items
}

/// Percent-encodes a query value the way browsers encode form fields.
pub fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
