//! Satellite descriptor (`satellites.xml`) codec.
//!
//! The descriptor file holds one `<sat>` element per satellite, each with
//! nested `<transponder>` elements whose tuning parameters are numeric
//! codes resolved through fixed lookup tables. The writer reproduces the
//! exact byte layout the receiver firmware and third-party editors
//! expect: declaration, a fixed explanatory comment block, four-space
//! indent and a stable attribute order.

use log::warn;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::FormatError;

/// Explanatory comment written into every descriptor file, byte-identical
/// on each save so that other tools reading the file see a stable header.
pub const DESCRIPTOR_COMMENT: &str = "This file was created in e2sync.\n\n\
usable flags are\n\
\t1: Network Scan\n\
\t2: use BAT\n\
\t4: use ONIT\n\
\t8: skip NITs of known networks\n\
\tand combinations of this.\n\n\
transponder parameters:\n\
polarization: 0 - Horizontal, 1 - Vertical, 2 - Left Circular, 3 - Right Circular\n\
fec_inner: 0 - Auto, 1 - 1/2, 2 - 2/3, 3 - 3/4, 4 - 5/6, 5 - 7/8, 6 -  8/9, 7 - 3/5,\n\
8 - 4/5, 9 - 9/10, 15 - None\n\
modulation: 0 - Auto, 1 - QPSK, 2 - 8PSK, 4 - 16APSK, 5 - 32APSK\n\
rolloff: 0 - 0.35, 1 - 0.25, 2 - 0.20, 3 - Auto\n\
pilot: 0 - Off, 1 - On, 2 - Auto\n\
inversion: 0 = Off, 1 = On, 2 = Auto (default)\n\
system: 0 = DVB-S, 1 = DVB-S2\n\
is_id: 0 - 255\n\
pls_mode: 0 - Root, 1 - Gold, 2 - Combo\n\
pls_code: 0 - 262142\n\n";

/// An ordered code-to-display lookup table for an enum-coded attribute.
///
/// The code sets are closed: parsing an unknown code is a per-record
/// format error. Reverse lookup returns the first matching code, which
/// matters because the FEC table is deliberately not injective (codes 1,
/// 10 and 19 all display as "1/2").
#[derive(Debug)]
pub struct LookupTable {
    name: &'static str,
    pairs: &'static [(&'static str, &'static str)],
}

impl LookupTable {
    /// Resolves a numeric code to its display value.
    pub fn value(&self, code: &str) -> Result<&'static str, FormatError> {
        self.pairs
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| *v)
            .ok_or(FormatError::UnknownCode {
                table: self.name,
                code: code.to_string(),
            })
    }

    /// Resolves a display value back to the first matching code.
    pub fn code(&self, value: &str) -> Option<&'static str> {
        self.pairs.iter().find(|(_, v)| *v == value).map(|(c, _)| *c)
    }

    /// True when the display value belongs to the closed set.
    pub fn contains_value(&self, value: &str) -> bool {
        self.pairs.iter().any(|(_, v)| *v == value)
    }

    /// True when no display value is shared by two codes. FEC fails this
    /// on purpose; see the write path notes in DESIGN.md.
    pub fn is_injective(&self) -> bool {
        for (i, (_, v)) in self.pairs.iter().enumerate() {
            if self.pairs[..i].iter().any(|(_, other)| other == v) {
                return false;
            }
        }
        true
    }
}

pub static POLARIZATION: LookupTable = LookupTable {
    name: "polarization",
    pairs: &[("0", "H"), ("1", "V"), ("2", "L"), ("3", "R")],
};

pub static FEC: LookupTable = LookupTable {
    name: "fec_inner",
    pairs: &[
        ("0", "Auto"),
        ("1", "1/2"),
        ("2", "2/3"),
        ("3", "3/4"),
        ("4", "5/6"),
        ("5", "7/8"),
        ("6", "8/9"),
        ("7", "3/5"),
        ("8", "4/5"),
        ("9", "9/10"),
        ("10", "1/2"),
        ("11", "2/3"),
        ("12", "3/4"),
        ("13", "5/6"),
        ("14", "7/8"),
        ("15", "8/9"),
        ("16", "3/5"),
        ("17", "4/5"),
        ("18", "9/10"),
        ("19", "1/2"),
        ("20", "2/3"),
        ("21", "3/4"),
        ("22", "5/6"),
        ("23", "7/8"),
        ("24", "8/9"),
        ("25", "3/5"),
        ("26", "4/5"),
        ("27", "9/10"),
        ("28", "Auto"),
    ],
};

pub static SYSTEM: LookupTable = LookupTable {
    name: "system",
    pairs: &[("0", "DVB-S"), ("1", "DVB-S2")],
};

pub static MODULATION: LookupTable = LookupTable {
    name: "modulation",
    pairs: &[
        ("0", "Auto"),
        ("1", "QPSK"),
        ("2", "8PSK"),
        ("4", "16APSK"),
        ("5", "32APSK"),
    ],
};

pub static PLS_MODE: LookupTable = LookupTable {
    name: "pls_mode",
    pairs: &[("0", "Root"), ("1", "Gold"), ("2", "Combo")],
};

/// Tuning parameters for one broadcast carrier.
///
/// Frequency, symbol rate and the optional multistream fields keep their
/// attribute strings; the four enum-coded fields hold display values
/// resolved through the lookup tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transponder {
    pub frequency: String,
    pub symbol_rate: String,
    pub polarization: String,
    pub fec_inner: String,
    pub system: String,
    pub modulation: String,
    pub pls_mode: Option<String>,
    pub pls_code: Option<String>,
    pub is_id: Option<String>,
}

/// A satellite with its scan flags, orbital position (tenths of a degree,
/// signed, as the attribute string) and ordered transponder list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Satellite {
    pub name: String,
    pub flags: String,
    pub position: String,
    pub transponders: Vec<Transponder>,
}

struct RawAttrs {
    pairs: Vec<(String, String)>,
}

impl RawAttrs {
    fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &'static str) -> Result<&str, FormatError> {
        self.get(key).ok_or(FormatError::MissingAttribute(key))
    }
}

fn read_attrs(e: &quick_xml::events::BytesStart) -> Result<RawAttrs, FormatError> {
    let mut pairs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| FormatError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| FormatError::Xml(e.to_string()))?
            .to_string();
        pairs.push((key, value));
    }
    Ok(RawAttrs { pairs })
}

fn parse_transponder(attrs: &RawAttrs) -> Result<Transponder, FormatError> {
    Ok(Transponder {
        frequency: attrs.required("frequency")?.to_string(),
        symbol_rate: attrs.required("symbol_rate")?.to_string(),
        polarization: POLARIZATION.value(attrs.required("polarization")?)?.to_string(),
        fec_inner: FEC.value(attrs.required("fec_inner")?)?.to_string(),
        system: SYSTEM.value(attrs.required("system")?)?.to_string(),
        modulation: MODULATION.value(attrs.required("modulation")?)?.to_string(),
        pls_mode: attrs.get("pls_mode").map(str::to_string),
        pls_code: attrs.get("pls_code").map(str::to_string),
        is_id: attrs.get("is_id").map(str::to_string),
    })
}

/// Parses a descriptor document.
///
/// A malformed document is an error; a single bad transponder is logged
/// and skipped so the file as a whole still parses.
pub fn parse_satellites(xml: &str) -> Result<Vec<Satellite>, FormatError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut satellites = Vec::new();
    let mut current: Option<Satellite> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"sat" => current = Some(parse_sat(&read_attrs(e)?)?),
                b"transponder" => push_transponder(current.as_mut(), &read_attrs(e)?),
                _ => {}
            },
            // A childless element never sees an `End` event.
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"sat" => satellites.push(parse_sat(&read_attrs(e)?)?),
                b"transponder" => push_transponder(current.as_mut(), &read_attrs(e)?),
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"sat" {
                    if let Some(sat) = current.take() {
                        satellites.push(sat);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(FormatError::Xml(e.to_string())),
        }
    }

    Ok(satellites)
}

fn parse_sat(attrs: &RawAttrs) -> Result<Satellite, FormatError> {
    Ok(Satellite {
        name: attrs.required("name")?.to_string(),
        flags: attrs.required("flags")?.to_string(),
        position: attrs.required("position")?.to_string(),
        transponders: Vec::new(),
    })
}

fn push_transponder(current: Option<&mut Satellite>, attrs: &RawAttrs) {
    if let Some(sat) = current {
        match parse_transponder(attrs) {
            Ok(tr) => sat.transponders.push(tr),
            Err(err) => warn!("Can't parse transponder for '{}' satellite: {}", sat.name, err),
        }
    }
}

/// Serializes the full descriptor document.
///
/// Enum display values that no longer resolve to a code fall back to "0"
/// rather than failing the write. That silently degrades the field, but
/// it is the established behavior of files already in the wild.
pub fn write_satellites(satellites: &[Satellite]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"iso-8859-1\"?>\n");
    out.push_str("<!--");
    out.push_str(DESCRIPTOR_COMMENT);
    out.push_str("-->\n");
    out.push_str("<satellites>\n");

    for sat in satellites {
        out.push_str(&format!(
            "    <sat name=\"{}\" flags=\"{}\" position=\"{}\"",
            escape_attr(&sat.name),
            escape_attr(&sat.flags),
            escape_attr(&sat.position)
        ));
        if sat.transponders.is_empty() {
            out.push_str("/>\n");
            continue;
        }
        out.push_str(">\n");
        for tr in &sat.transponders {
            out.push_str(&format!(
                "        <transponder frequency=\"{}\" symbol_rate=\"{}\" polarization=\"{}\" fec_inner=\"{}\" system=\"{}\" modulation=\"{}\"",
                escape_attr(&tr.frequency),
                escape_attr(&tr.symbol_rate),
                POLARIZATION.code(&tr.polarization).unwrap_or("0"),
                FEC.code(&tr.fec_inner).unwrap_or("0"),
                SYSTEM.code(&tr.system).unwrap_or("0"),
                MODULATION.code(&tr.modulation).unwrap_or("0"),
            ));
            if let Some(pls_mode) = &tr.pls_mode {
                out.push_str(&format!(" pls_mode=\"{}\"", escape_attr(pls_mode)));
            }
            if let Some(pls_code) = &tr.pls_code {
                out.push_str(&format!(" pls_code=\"{}\"", escape_attr(pls_code)));
            }
            if let Some(is_id) = &tr.is_id {
                out.push_str(&format!(" is_id=\"{}\"", escape_attr(is_id)));
            }
            out.push_str("/>\n");
        }
        out.push_str("    </sat>\n");
    }

    out.push_str("</satellites>\n");
    out
}

/// Pre-write guard: integer coercibility of the numeric fields and closed
/// set membership of every enum field. Not applied during parse.
pub fn is_transponder_valid(tr: &Transponder) -> bool {
    if tr.frequency.parse::<i64>().is_err() || tr.symbol_rate.parse::<i64>().is_err() {
        return false;
    }
    for opt in [&tr.pls_mode, &tr.pls_code, &tr.is_id] {
        if let Some(v) = opt {
            if v.parse::<i64>().is_err() {
                return false;
            }
        }
    }

    POLARIZATION.contains_value(&tr.polarization)
        && FEC.contains_value(&tr.fec_inner)
        && SYSTEM.contains_value(&tr.system)
        && MODULATION.contains_value(&tr.modulation)
}

fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
