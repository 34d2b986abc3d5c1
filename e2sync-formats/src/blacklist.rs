//! Parental lock block/allow list files.
//!
//! The receiver keeps locked service references in `blacklist` and
//! explicitly allowed ones in `whitelist`, one reference per line.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

pub const BLACKLIST_FILE: &str = "blacklist";
pub const WHITELIST_FILE: &str = "whitelist";

/// Reads a block/allow list file into a set of reference strings.
///
/// Empty lines are filtered out; a missing file reads as the empty set.
pub fn read_list(path: &Path) -> io::Result<HashSet<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e),
    }
}

/// Writes a block/allow list file, one reference per line.
pub fn write_list<'a, I>(path: &Path, references: I) -> io::Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let body: Vec<&str> = references.into_iter().collect();
    fs::write(path, body.join("\n"))
}
