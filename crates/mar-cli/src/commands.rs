//! The declarative per-archive command surface.
//!
//! Each argument is either a terminal global option (`overlaydir=`,
//! `roprefix=`, `preload=`, `mountpoint=`, `pprof=`, `commandsfile=`,
//! `showhashes`), or a chain of per-archive options ending in an archive
//! path:
//!
//! ```text
//! addprefix=/mods:stripprefix=/content:onlyglob=/data/**:patch.mar
//! ```
//!
//! Archives load in argument order; later archives win on key collisions.
//! Blank lines and lines starting with `# ` are ignored, which is what makes
//! command files usable as annotated mount manifests.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;

use mar_index::{ArchiveReadOptions, ArchiveTree, FileSource};

/// What the caller should do after parsing one command.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// `showhashes` was seen: the hash dump has been printed, exit now.
    ShowHashes,
}

/// Everything the mount needs, accumulated across the command list.
#[derive(Default)]
pub struct MountSetup {
    pub tree: ArchiveTree,
    pub overlay_dir: Option<PathBuf>,
    pub ro_prefixes: Vec<String>,
    pub preload_globs: Vec<String>,
    pub mountpoint: Option<PathBuf>,
    pub pprof_addr: Option<String>,
}

fn ensure_leading_slash(s: &str) -> String {
    if s.is_empty() || s.starts_with('/') {
        s.to_string()
    } else {
        format!("/{s}")
    }
}

impl MountSetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one command string, loading archives and applying global
    /// options as they appear.
    pub fn parse_command(&mut self, command: &str) -> Result<Flow> {
        if command.is_empty() || command.starts_with("# ") {
            return Ok(Flow::Continue);
        }

        let mut options = ArchiveReadOptions::default();
        let mut rest = command.to_string();

        loop {
            if let Some(tail) = rest.strip_prefix("addprefix=") {
                let (value, next) = split_chain(tail, "addprefix")?;
                let mut prefix = ensure_leading_slash(&value);
                while prefix.ends_with('/') {
                    prefix.pop();
                }
                if !options.add_prefix.is_empty() {
                    bail!("additional prefix already set ({})", options.add_prefix);
                }
                options.add_prefix = prefix;
                rest = next;
                continue;
            }

            if let Some(tail) = rest.strip_prefix("stripprefix=") {
                let (value, next) = split_chain(tail, "stripprefix")?;
                if !options.strip_prefix.is_empty() {
                    bail!("strip prefix already set ({})", options.strip_prefix);
                }
                options.strip_prefix = ensure_leading_slash(&value);
                rest = next;
                continue;
            }

            if let Some(tail) = rest.strip_prefix("onlyglob=") {
                let (value, next) = split_chain(tail, "onlyglob")?;
                options.add_include_glob(&value)?;
                rest = next;
                continue;
            }

            if let Some(tail) = rest.strip_prefix("ziplocale=") {
                let (value, next) = split_chain(tail, "ziplocale")?;
                options.set_zip_locale(&value)?;
                rest = next;
                continue;
            }

            if let Some(value) = rest.strip_prefix("roprefix=") {
                self.ro_prefixes.push(ensure_leading_slash(value));
                return Ok(Flow::Continue);
            }

            if let Some(value) = rest.strip_prefix("overlaydir=") {
                self.overlay_dir = Some(PathBuf::from(value));
                return Ok(Flow::Continue);
            }

            if let Some(value) = rest.strip_prefix("preload=") {
                self.preload_globs.push(value.to_string());
                return Ok(Flow::Continue);
            }

            if let Some(value) = rest.strip_prefix("mountpoint=") {
                self.mountpoint = Some(PathBuf::from(value));
                return Ok(Flow::Continue);
            }

            if let Some(value) = rest.strip_prefix("pprof=") {
                self.pprof_addr = Some(value.to_string());
                return Ok(Flow::Continue);
            }

            if let Some(value) = rest.strip_prefix("commandsfile=") {
                return self.parse_commands_file(value);
            }

            if rest == "showhashes" {
                self.dump_hashes();
                return Ok(Flow::ShowHashes);
            }

            break;
        }

        if rest.ends_with(".zip") {
            self.tree
                .load_zip(std::path::Path::new(&rest), &options)
                .with_context(|| format!("failed to load zip archive {rest}"))?;
            return Ok(Flow::Continue);
        }
        if rest.ends_with(".mar") {
            self.tree
                .load_mar(std::path::Path::new(&rest), &options)
                .with_context(|| format!("failed to load MAR archive {rest}"))?;
            return Ok(Flow::Continue);
        }

        bail!("unknown file type (filename suffix): {rest}");
    }

    fn parse_commands_file(&mut self, path: &str) -> Result<Flow> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open commands file {path}"))?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            info!(file = path, command = line.as_str(), "loading command from file");
            if self.parse_command(&line)? == Flow::ShowHashes {
                return Ok(Flow::ShowHashes);
            }
        }
        Ok(Flow::Continue)
    }

    /// `hex(original_sha256)\t<path>` for every MAR entry loaded so far.
    fn dump_hashes(&self) {
        for (_, source) in self.tree.files() {
            if let FileSource::Mar { info, .. } = source {
                let hex: String = info
                    .original_sha256
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect();
                println!("{hex}\t{}", info.path);
            }
        }
    }
}

/// Split `value:next` for a chainable option; the chain must continue.
fn split_chain(tail: &str, option: &str) -> Result<(String, String)> {
    match tail.split_once(':') {
        Some((value, next)) => Ok((value.to_string(), next.to_string())),
        None => bail!("{option}= must be followed by more options or an archive path"),
    }
}
