//! Per-archive read options.
//!
//! Each archive on the command line carries its own option chain: include
//! globs, a prefix to strip, a prefix to prepend, and the legacy name
//! encoding for ZIP entries whose language-encoding flag is clear.

use glob::{MatchOptions, Pattern};

use crate::path::normalize_key;
use crate::{IndexError, Result};

/// Legacy encoding for non-UTF-8 ZIP entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZipLocale {
    #[default]
    None,
    /// Code page 932 (Shift_JIS), the common case for archives produced on
    /// Japanese Windows.
    Cp932,
}

#[derive(Debug, Default, Clone)]
pub struct ArchiveReadOptions {
    pub strip_prefix: String,
    pub add_prefix: String,
    pub zip_locale: ZipLocale,
    include_globs: Vec<Pattern>,
}

/// Glob matching keeps `*` inside one path segment; only `**` crosses
/// segments.
fn glob_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true, // both sides are already key-normalized
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

impl ArchiveReadOptions {
    /// Compile and append an include glob. Patterns are matched in key form.
    pub fn add_include_glob(&mut self, pattern: &str) -> Result<()> {
        let compiled =
            Pattern::new(&normalize_key(pattern)).map_err(|source| IndexError::Glob {
                pattern: pattern.to_string(),
                source,
            })?;
        self.include_globs.push(compiled);
        Ok(())
    }

    pub fn set_zip_locale(&mut self, locale: &str) -> Result<()> {
        if locale != "cp932" {
            return Err(IndexError::ZipLocale(locale.to_string()));
        }
        self.zip_locale = ZipLocale::Cp932;
        Ok(())
    }

    /// Map an archive-internal path to its mount path, or `None` when the
    /// include globs exclude it.
    ///
    /// Order: ensure a leading `/`, match include globs, strip
    /// `strip_prefix` (case-insensitively), prepend `add_prefix`.
    pub fn apply(&self, path: &str) -> Option<String> {
        let mut path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        if !self.include_globs.is_empty() {
            let key = normalize_key(&path);
            if !self
                .include_globs
                .iter()
                .any(|g| g.matches_with(&key, glob_options()))
            {
                return None;
            }
        }

        if !self.strip_prefix.is_empty()
            && normalize_key(&path).starts_with(&normalize_key(&self.strip_prefix))
        {
            if let Some(rest) = path.get(self.strip_prefix.len()..) {
                path = if rest.starts_with('/') {
                    rest.to_string()
                } else {
                    format!("/{rest}")
                };
            }
        }

        if !self.add_prefix.is_empty() {
            path = format!("{}{}", self.add_prefix, path);
        }

        Some(path)
    }

    /// Decode a ZIP entry name. Raw bytes are Shift_JIS when the entry's
    /// language-encoding flag is clear and the archive was opened with
    /// `ziplocale=cp932`; everything else is treated as UTF-8.
    pub fn decode_zip_name(&self, raw: &[u8], utf8_flag: bool) -> String {
        if !utf8_flag && self.zip_locale == ZipLocale::Cp932 {
            let (decoded, _, _) = encoding_rs::SHIFT_JIS.decode(raw);
            return decoded.into_owned();
        }
        String::from_utf8_lossy(raw).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensures_leading_slash() {
        let o = ArchiveReadOptions::default();
        assert_eq!(o.apply("data/a.bin").unwrap(), "/data/a.bin");
        assert_eq!(o.apply("/data/a.bin").unwrap(), "/data/a.bin");
    }

    #[test]
    fn include_globs_filter() {
        let mut o = ArchiveReadOptions::default();
        o.add_include_glob("/Data/**").unwrap();
        assert_eq!(o.apply("/data/sub/a.bin").unwrap(), "/data/sub/a.bin");
        assert!(o.apply("/other/a.bin").is_none());
    }

    #[test]
    fn single_star_stays_in_segment() {
        let mut o = ArchiveReadOptions::default();
        o.add_include_glob("/data/*.bin").unwrap();
        assert!(o.apply("/data/a.bin").is_some());
        assert!(o.apply("/data/sub/a.bin").is_none());
    }

    #[test]
    fn strip_prefix_is_case_insensitive() {
        let o = ArchiveReadOptions {
            strip_prefix: "/Content".to_string(),
            ..Default::default()
        };
        assert_eq!(o.apply("/content/a.txt").unwrap(), "/a.txt");
        assert_eq!(o.apply("/CONTENT/b.txt").unwrap(), "/b.txt");
        assert_eq!(o.apply("/elsewhere/c.txt").unwrap(), "/elsewhere/c.txt");
    }

    #[test]
    fn add_prefix_prepends() {
        let o = ArchiveReadOptions {
            add_prefix: "/mods".to_string(),
            ..Default::default()
        };
        assert_eq!(o.apply("/a.txt").unwrap(), "/mods/a.txt");
    }

    #[test]
    fn strip_then_add() {
        let o = ArchiveReadOptions {
            strip_prefix: "/content".to_string(),
            add_prefix: "/game".to_string(),
            ..Default::default()
        };
        assert_eq!(o.apply("/Content/x/y.dat").unwrap(), "/game/x/y.dat");
    }

    #[test]
    fn rejects_unknown_locale() {
        let mut o = ArchiveReadOptions::default();
        assert!(o.set_zip_locale("utf8").is_err());
        assert!(o.set_zip_locale("cp932").is_ok());
    }

    #[test]
    fn decodes_shift_jis_names() {
        let mut o = ArchiveReadOptions::default();
        o.set_zip_locale("cp932").unwrap();
        // "テスト" in Shift_JIS
        let raw = [0x83, 0x65, 0x83, 0x58, 0x83, 0x67];
        assert_eq!(o.decode_zip_name(&raw, false), "テスト");
        // utf8 flag set: bytes pass through as UTF-8
        assert_eq!(o.decode_zip_name("テスト".as_bytes(), true), "テスト");
    }
}
