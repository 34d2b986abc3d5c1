//! Service reference (`fav_id`) codec.
//!
//! A service reference is a colon-delimited positional string such as
//! `1:0:19:2B66:3F3:1:C00000:0:0:0:`. It is used both as the dictionary
//! key for a service and as the on-wire form inside bouquet files, so the
//! raw string must survive a decode/encode round trip unchanged for any
//! value this crate produces.

use std::fmt;

use crate::error::FormatError;

/// Minimum number of colon-separated tokens in a full service reference.
/// The canonical form ends with a trailing colon, which yields an empty
/// eleventh token.
pub const MIN_REF_FIELDS: usize = 11;

/// One decoded service reference.
///
/// Field order on the wire: stream type, flags, service type, SID, TID,
/// NID, namespace, parent SID, parent TID, unused. The stream-type and
/// flags fields are decimal (IPTV streams use `4097`, markers `64`), the
/// rest are hexadecimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub stream_type: u32,
    pub flags: u32,
    pub service_type: u32,
    pub sid: u32,
    pub tid: u32,
    pub nid: u32,
    pub namespace: u32,
    pub parent_sid: u32,
    pub parent_tid: u32,
    pub unused: u32,
}

impl ServiceRef {
    /// Builds a plain DVB service reference with zeroed trailing fields.
    pub fn dvb(service_type: u32, sid: u32, tid: u32, nid: u32, namespace: u32) -> Self {
        Self {
            stream_type: 1,
            flags: 0,
            service_type,
            sid,
            tid,
            nid,
            namespace,
            parent_sid: 0,
            parent_tid: 0,
            unused: 0,
        }
    }

    /// Decodes a colon-delimited reference string.
    ///
    /// Validates the minimum field count and reports a decode failure for
    /// this single reference; callers parsing a batch are expected to log
    /// and skip, not abort.
    pub fn parse(raw: &str) -> Result<Self, FormatError> {
        let fields: Vec<&str> = raw.trim_start().split(':').collect();
        if fields.len() < MIN_REF_FIELDS {
            return Err(FormatError::FieldCount {
                expected: MIN_REF_FIELDS,
                actual: fields.len(),
            });
        }

        Ok(Self {
            stream_type: parse_dec(fields[0], 0)?,
            flags: parse_dec(fields[1], 1)?,
            service_type: parse_hex(fields[2], 2)?,
            sid: parse_hex(fields[3], 3)?,
            tid: parse_hex(fields[4], 4)?,
            nid: parse_hex(fields[5], 5)?,
            namespace: parse_hex(fields[6], 6)?,
            parent_sid: parse_hex(fields[7], 7)?,
            parent_tid: parse_hex(fields[8], 8)?,
            unused: parse_hex(fields[9], 9)?,
        })
    }

    /// Derives the picon file name for this reference.
    ///
    /// Purely positional: the ten reference fields joined with `_` plus a
    /// `.png` suffix. Identity fields use fixed hex widths, so two
    /// references with equal identity always yield the same name no
    /// matter how the source string was spelled.
    pub fn picon_id(&self) -> String {
        format!(
            "{}_{}_{:X}_{:04X}_{:04X}_{:04X}_{:08X}_{:X}_{:X}_{:X}.png",
            self.stream_type,
            self.flags,
            self.service_type,
            self.sid,
            self.tid,
            self.nid,
            self.namespace,
            self.parent_sid,
            self.parent_tid,
            self.unused
        )
    }

    /// The data-id form: the first eleven positional fields joined with
    /// colons (the eleventh is empty in the canonical spelling).
    pub fn data_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{:X}:{:04X}:{:04X}:{:04X}:{:08X}:{:X}:{:X}:{:X}:",
            self.stream_type,
            self.flags,
            self.service_type,
            self.sid,
            self.tid,
            self.nid,
            self.namespace,
            self.parent_sid,
            self.parent_tid,
            self.unused
        )
    }
}

fn parse_dec(value: &str, position: usize) -> Result<u32, FormatError> {
    let v = if value.is_empty() { "0" } else { value };
    v.parse().map_err(|_| FormatError::InvalidField {
        position,
        value: value.to_string(),
    })
}

fn parse_hex(value: &str, position: usize) -> Result<u32, FormatError> {
    let v = if value.is_empty() { "0" } else { value };
    u32::from_str_radix(v, 16).map_err(|_| FormatError::InvalidField {
        position,
        value: value.to_string(),
    })
}

/// A channel record as held by the receiver.
///
/// `fav_id` is the raw reference string exactly as read from the source
/// file; it is both the map key and the wire form, so it is never
/// re-normalized once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub reference: ServiceRef,
    pub name: String,
    pub package: String,
    /// Raw flags/CAS/PID tokens from the comma-delimited list
    /// (`p:...`, `c:00...`, `C:...`, `f:...`).
    pub flags: Vec<String>,
    pub fav_id: String,
}

impl Service {
    /// Decodes a service from its raw reference string.
    pub fn decode(raw: &str) -> Result<Self, FormatError> {
        let reference = ServiceRef::parse(raw)?;
        Ok(Self {
            reference,
            name: String::new(),
            package: String::new(),
            flags: Vec::new(),
            fav_id: raw.to_string(),
        })
    }

    /// Encodes the service back to its wire form.
    pub fn encode(&self) -> String {
        self.fav_id.clone()
    }

    /// The packed flag bit-field from the `f:` token, 0 when absent.
    pub fn flag_value(&self) -> u32 {
        self.flags
            .iter()
            .find(|t| t.starts_with("f:"))
            .and_then(|t| Flag::parse(t).ok())
            .unwrap_or(0)
    }
}

/// Service flag bits packed into the `f:` token of the flags list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Flag {
    /// Do not automatically update the service parameters.
    Keep = 1,
    Hide = 2,
    /// Always use the cached instead of current PIDs.
    Pids = 4,
    Lock = 8,
    /// Marked as new at the last scan.
    New = 0x20,
}

impl Flag {
    /// Parses the integer value of an `f:` token.
    ///
    /// Compatibility rule inherited from receiver-produced files: the
    /// value is usually decimal but may appear in hex. A token shorter
    /// than three characters yields 0; after stripping the two-character
    /// prefix, an all-digit remainder is read as decimal, anything else
    /// as hex. An all-digit hex value like "12" is therefore read as
    /// decimal 12; device-produced files depend on that reading.
    pub fn parse(token: &str) -> Result<u32, FormatError> {
        if token.len() < 3 {
            return Ok(0);
        }
        let value = token
            .get(2..)
            .ok_or_else(|| FormatError::InvalidFlagToken(token.to_string()))?;

        let parsed = if value.bytes().all(|b| b.is_ascii_digit()) {
            value.parse().ok()
        } else {
            u32::from_str_radix(value, 16).ok()
        };
        parsed.ok_or_else(|| FormatError::InvalidFlagToken(token.to_string()))
    }

    pub fn is_keep(value: u32) -> bool {
        value & (1 << 0) != 0
    }

    pub fn is_hide(value: u32) -> bool {
        value & (1 << 1) != 0
    }

    pub fn is_pids(value: u32) -> bool {
        value & (1 << 2) != 0
    }

    pub fn is_new(value: u32) -> bool {
        value & (1 << 5) != 0
    }
}

/// Display names for the numeric service-type codes.
pub const SERVICE_TYPE: &[(&str, &str)] = &[
    ("-2", "Data"),
    ("1", "TV"),
    ("2", "Radio"),
    ("3", "Data"),
    ("10", "Radio"),
    ("22", "TV (H264)"),
    ("25", "TV (HD)"),
    ("31", "TV (UHD)"),
];

/// Known CAS ids as they appear in the flags token list.
pub const CAS: &[(&str, &str)] = &[
    ("C:26", "BISS"),
    ("C:0B", "Conax"),
    ("C:06", "Irdeto"),
    ("C:18", "Nagravision"),
    ("C:05", "Viaccess"),
    ("C:01", "SECA"),
    ("C:0E", "PowerVu"),
    ("C:4A", "DRE-Crypt"),
    ("C:7B", "DRE-Crypt"),
    ("C:56", "Verimatrix"),
    ("C:09", "VideoGuard"),
];

/// Looks up the display name for a service-type code.
pub fn service_type_name(code: &str) -> Option<&'static str> {
    SERVICE_TYPE.iter().find(|(c, _)| *c == code).map(|(_, n)| *n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let r = ServiceRef::parse("1:0:19:2B66:3F3:1:C00000:0:0:0:").unwrap();
        assert_eq!(r.stream_type, 1);
        assert_eq!(r.flags, 0);
        assert_eq!(r.service_type, 0x19);
        assert_eq!(r.sid, 0x2B66);
        assert_eq!(r.tid, 0x3F3);
        assert_eq!(r.nid, 1);
        assert_eq!(r.namespace, 0xC00000);
    }

    #[test]
    fn test_parse_rejects_short_reference() {
        let err = ServiceRef::parse("1:0:19:2B66").unwrap_err();
        assert!(matches!(err, FormatError::FieldCount { actual: 4, .. }));
    }

    #[test]
    fn test_reference_round_trip() {
        let r = ServiceRef::dvb(0x19, 0x2B66, 0x3F3, 1, 0xC00000);
        let encoded = r.to_string();
        assert_eq!(ServiceRef::parse(&encoded).unwrap(), r);

        // IPTV-style stream type stays decimal.
        let mut iptv = r;
        iptv.stream_type = 4097;
        let encoded = iptv.to_string();
        assert!(encoded.starts_with("4097:"));
        assert_eq!(ServiceRef::parse(&encoded).unwrap(), iptv);
    }

    #[test]
    fn test_service_decode_keeps_raw_fav_id() {
        let raw = "1:0:19:2B66:3F3:1:C00000:0:0:0:";
        let s = Service::decode(raw).unwrap();
        assert_eq!(s.fav_id, raw);
        assert_eq!(s.encode(), raw);
        assert_eq!(Service::decode(&s.encode()).unwrap(), s);
    }

    #[test]
    fn test_picon_id_ignores_display_name() {
        let mut a = Service::decode("1:0:19:2B66:3F3:1:C00000:0:0:0:").unwrap();
        let mut b = a.clone();
        a.name = "First One".to_string();
        b.name = "Second One".to_string();
        assert_eq!(a.reference.picon_id(), b.reference.picon_id());
        assert!(a.reference.picon_id().ends_with(".png"));
    }

    #[test]
    fn test_picon_id_is_positional() {
        let r = ServiceRef::dvb(1, 0x6D66, 0x3F3, 1, 0xC00000);
        assert_eq!(r.picon_id(), "1_0_1_6D66_03F3_0001_00C00000_0_0_0.png");
    }

    #[test]
    fn test_flag_parse_decimal_first() {
        assert_eq!(Flag::parse("f:08").unwrap(), 8);
        assert_eq!(Flag::parse("f:40").unwrap(), 40);
        // Non-digit remainder falls back to hex.
        assert_eq!(Flag::parse("f:2a").unwrap(), 0x2A);
        // Too short for a value.
        assert_eq!(Flag::parse("f:").unwrap(), 0);
        assert_eq!(Flag::parse("").unwrap(), 0);
    }

    #[test]
    fn test_flag_bits() {
        assert!(Flag::is_keep(1));
        assert!(Flag::is_hide(2));
        assert!(Flag::is_pids(4));
        assert!(Flag::is_new(0x20));

        // Combinations compose by OR.
        assert!(Flag::is_keep(3));
        assert!(Flag::is_hide(3));
        assert!(!Flag::is_pids(3));
        assert!(!Flag::is_new(3));
    }

    #[test]
    fn test_flag_value_from_token_list() {
        let mut s = Service::decode("1:0:1:1:1:1:C00000:0:0:0:").unwrap();
        s.flags = vec!["p:Package".into(), "c:001234".into(), "f:40".into()];
        assert_eq!(s.flag_value(), 40);
    }
}
