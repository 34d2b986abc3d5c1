//! Fixed file names used by the receiver's configuration file set.
//!
//! The sync orchestrator asks this module which files belong to a given
//! data subset; the transfer layer only ever moves names matched here.

/// Suffixes of bouquet list files (`bouquets.tv`, `userbouquet.*.radio`, ...).
pub const BOUQUET_SUFFIXES: &[&str] = &["tv", "radio"];

/// Primary service database and block/allow list files.
pub const DATA_FILES: &[&str] = &["lamedb", "lamedb5", "blacklist", "whitelist"];

/// XML tuning descriptor files.
pub const DESCRIPTOR_FILES: &[&str] = &["satellites.xml", "terrestrial.xml", "cables.xml"];

/// Image extensions recognized as picons.
pub const PICON_SUFFIXES: &[&str] = &[".jpg", ".png"];

/// Prefixes of remote bouquet files that a "remove unused" upload deletes
/// before storing the new set.
pub const UNUSED_BOUQUET_PREFIXES: &[&str] = &["userbouquet.", "bouquets.xml", "ubouquets.xml"];

/// True when `name` ends with one of the given suffixes.
pub fn has_suffix(name: &str, suffixes: &[&str]) -> bool {
    suffixes.iter().any(|s| name.ends_with(s))
}

/// True when `name` starts with one of the given prefixes.
pub fn has_prefix(name: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p))
}

/// True for files that belong to the XML descriptor set.
pub fn is_descriptor_file(name: &str) -> bool {
    DESCRIPTOR_FILES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_match() {
        assert!(has_suffix("bouquets.tv", BOUQUET_SUFFIXES));
        assert!(has_suffix("userbouquet.favourites.radio", BOUQUET_SUFFIXES));
        assert!(!has_suffix("lamedb", BOUQUET_SUFFIXES));
        assert!(has_suffix("lamedb", DATA_FILES));
    }

    #[test]
    fn test_descriptor_names() {
        assert!(is_descriptor_file("satellites.xml"));
        assert!(!is_descriptor_file("satellites.xml.bak"));
    }
}
