//! Path key derivation.
//!
//! Every map lookup, glob match and whiteout comparison uses the *key* form
//! of a path; display paths keep their original case and codepoints and are
//! what callers see in listings.

use unicode_normalization::UnicodeNormalization;

/// Derive the lookup key: forward slashes, NFC normalization, then
/// code-point-wise lower-casing.
pub fn normalize_key(path: &str) -> String {
    let path = fix_separators(path);
    path.nfc().collect::<String>().to_lowercase()
}

/// Platform bridges may deliver `\`-separated paths; the index only ever
/// sees `/`.
pub fn fix_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Display-path parent: everything before the last `/`. Files directly under
/// the root return `""`, which the tree treats as `/`.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Final segment of a display path.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_cases_code_points() {
        assert_eq!(normalize_key("/Foo/Bar.TXT"), "/foo/bar.txt");
    }

    #[test]
    fn nfc_composes_decomposed_input() {
        // "é" as 'e' + combining acute vs the precomposed codepoint
        let decomposed = "/Ame\u{301}lie.txt";
        let composed = "/am\u{e9}lie.txt";
        assert_eq!(normalize_key(decomposed), composed);
        assert_eq!(normalize_key(composed), normalize_key(decomposed));
    }

    #[test]
    fn backslashes_become_slashes() {
        assert_eq!(normalize_key(r"\Data\File.bin"), "/data/file.bin");
    }

    #[test]
    fn parent_and_file_name() {
        assert_eq!(parent_dir("/a/b/c.txt"), "/a/b");
        assert_eq!(parent_dir("/c.txt"), "");
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(file_name("/c.txt"), "c.txt");
    }
}
