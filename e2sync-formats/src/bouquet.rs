//! Bouquet (channel list) file codec.
//!
//! A bouquet set consists of an index file (`bouquets.tv` /
//! `bouquets.radio`) naming the user bouquet files, and one
//! `userbouquet.*.tv|radio` file per bouquet holding `#NAME`, `#SERVICE`
//! and `#DESCRIPTION` lines. Bouquets are rebuilt in full on every save;
//! there is no incremental diff.

use log::warn;

use crate::error::FormatError;

const NAME_PREFIX: &str = "#NAME ";
const SERVICE_PREFIX: &str = "#SERVICE ";
const DESCRIPTION_PREFIX: &str = "#DESCRIPTION ";

/// Bouquet list type, taken from the file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BouquetKind {
    Tv,
    Radio,
}

impl BouquetKind {
    /// Unknown suffixes map to TV, matching receiver behavior.
    pub fn from_suffix(suffix: &str) -> Self {
        match suffix {
            "radio" => BouquetKind::Radio,
            _ => BouquetKind::Tv,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            BouquetKind::Tv => "tv",
            BouquetKind::Radio => "radio",
        }
    }
}

/// What a single bouquet line refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular DVB service reference.
    Service,
    /// Stream entry (stream type 4097) carrying a URL field.
    Iptv,
    /// Visible separator (flags value 64).
    Marker,
    /// Hidden marker (flags value 832).
    Space,
}

/// One ordered entry of a bouquet.
///
/// `reference` is the raw string after `#SERVICE `, kept verbatim so the
/// file round-trips; `name` comes from a trailing URL-entry field or a
/// following `#DESCRIPTION` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BouquetEntry {
    pub kind: EntryKind,
    pub reference: String,
    pub name: Option<String>,
}

impl BouquetEntry {
    /// Decodes the payload of a `#SERVICE` line.
    pub fn decode(raw: &str) -> Result<Self, FormatError> {
        let reference = raw.trim();
        let fields: Vec<&str> = reference.split(':').collect();
        if fields.len() < 11 {
            return Err(FormatError::FieldCount {
                expected: 11,
                actual: fields.len(),
            });
        }

        let kind = match (fields[0], fields[1]) {
            (_, "64") => EntryKind::Marker,
            (_, "832") => EntryKind::Space,
            ("4097", _) => EntryKind::Iptv,
            _ => EntryKind::Service,
        };

        // Stream entries carry "url:name" in the trailing fields; the URL
        // itself is percent-encoded, so the name is everything past it.
        let name = if kind == EntryKind::Iptv && fields.len() > 11 && !fields[11].is_empty() {
            Some(fields[11..].join(":"))
        } else {
            None
        };

        Ok(Self {
            kind,
            reference: reference.to_string(),
            name,
        })
    }
}

/// A named ordered channel list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bouquet {
    pub name: String,
    pub kind: BouquetKind,
    pub entries: Vec<BouquetEntry>,
    pub locked: bool,
    pub hidden: bool,
    /// File name this bouquet was read from / will be written to.
    pub file: String,
}

/// The bouquet set for one list type: index name plus member bouquets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BouquetIndex {
    pub name: String,
    pub kind: BouquetKind,
    pub files: Vec<String>,
}

/// Parses an index file (`bouquets.tv`), returning the referenced user
/// bouquet file names in order.
pub fn parse_index(content: &str, kind: BouquetKind) -> BouquetIndex {
    let mut name = String::new();
    let mut files = Vec::new();

    for line in content.lines() {
        if let Some(n) = line.strip_prefix(NAME_PREFIX) {
            name = n.trim().to_string();
        } else if line.starts_with(SERVICE_PREFIX) {
            // The member file name sits between the quotes of
            // `... FROM BOUQUET "userbouquet.x.tv" ORDER BY bouquet`.
            let mut parts = line.split('"');
            if let (Some(_), Some(file)) = (parts.next(), parts.next()) {
                files.push(file.to_string());
            } else {
                warn!("Skipping malformed bouquet index line: {:?}", line);
            }
        }
    }

    BouquetIndex { name, kind, files }
}

/// Serializes an index file referencing the given bouquets.
pub fn write_index(index: &BouquetIndex) -> String {
    let mut out = format!("{}{}\n", NAME_PREFIX, index.name);
    for file in &index.files {
        out.push_str(&format!(
            "#SERVICE 1:7:{}:0:0:0:0:0:0:0:FROM BOUQUET \"{}\" ORDER BY bouquet\n",
            match index.kind {
                BouquetKind::Tv => "1",
                BouquetKind::Radio => "2",
            },
            file
        ));
    }
    out
}

/// Parses one user bouquet file.
///
/// Malformed `#SERVICE` lines are logged and skipped; the rest of the
/// file still parses.
pub fn parse_bouquet(content: &str, file: &str) -> Bouquet {
    let kind = BouquetKind::from_suffix(file.rsplit('.').next().unwrap_or(""));
    let mut name = String::new();
    let mut entries: Vec<BouquetEntry> = Vec::new();

    for line in content.lines() {
        if let Some(n) = line.strip_prefix(NAME_PREFIX) {
            name = n.trim().to_string();
        } else if let Some(raw) = line.strip_prefix(SERVICE_PREFIX) {
            match BouquetEntry::decode(raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping bouquet entry in '{}': {}", file, e),
            }
        } else if let Some(desc) = line.strip_prefix(DESCRIPTION_PREFIX) {
            if let Some(last) = entries.last_mut() {
                last.name = Some(desc.trim().to_string());
            }
        }
    }

    Bouquet {
        name,
        kind,
        entries,
        locked: false,
        hidden: false,
        file: file.to_string(),
    }
}

/// Serializes a user bouquet file in full.
pub fn write_bouquet(bouquet: &Bouquet) -> String {
    let mut out = format!("{}{}\n", NAME_PREFIX, bouquet.name);
    for entry in &bouquet.entries {
        out.push_str(SERVICE_PREFIX);
        out.push_str(&entry.reference);
        out.push('\n');
        if matches!(entry.kind, EntryKind::Marker | EntryKind::Space) {
            if let Some(name) = &entry.name {
                out.push_str(DESCRIPTION_PREFIX);
                out.push_str(name);
                out.push('\n');
            }
        }
    }
    out
}
