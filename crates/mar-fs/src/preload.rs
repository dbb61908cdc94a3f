//! Background chunk warming.
//!
//! After startup, every preload glob is matched against the mounted file
//! keys and the matches are grouped by backing `.dat` shard; one worker
//! thread per shard reads each chunk's compressed bytes (discarding them) to
//! warm the OS page cache and the descriptor pools. Workers yield to user
//! traffic: while a user-initiated read happened within the last three
//! seconds, a worker sleeps instead of issuing its next chunk read.
//!
//! Preloading never populates the decompressed-chunk cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use glob::{MatchOptions, Pattern};
use tracing::{debug, info, warn};

use mar_format::index::dat_path;
use mar_index::{normalize_key, FileSource};

use crate::ops::MayakashiFs;

/// A user read within this window pauses preloading.
pub const USER_READ_WINDOW: Duration = Duration::from_secs(3);
/// How long a paused worker sleeps before re-checking.
pub const YIELD_SLEEP: Duration = Duration::from_secs(1);

fn glob_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Work list: backing shard → file keys to warm, in match order.
pub(crate) fn preload_plan(fs: &MayakashiFs) -> HashMap<PathBuf, Vec<String>> {
    let mut plan: HashMap<PathBuf, Vec<String>> = HashMap::new();

    for rule in fs.preload_globs() {
        let pattern = match Pattern::new(&normalize_key(rule)) {
            Ok(p) => p,
            Err(err) => {
                warn!(rule = rule.as_str(), error = %err, "invalid preload glob, skipping");
                continue;
            }
        };
        for (key, source) in fs.tree().files() {
            if !pattern.matches_with(key, glob_options()) {
                continue;
            }
            // only MAR entries have a shard to warm
            let FileSource::Mar {
                file_index,
                archive,
                ..
            } = source
            else {
                continue;
            };
            let shard = dat_path(archive, *file_index);
            debug!(rule = rule.as_str(), file = key, shard = %shard.display(), "preload match");
            plan.entry(shard).or_default().push(key.to_string());
        }
    }

    plan
}

/// Spawn one warming worker per backing shard. Returns the worker handles;
/// the mount loop typically never joins them.
pub fn spawn_preload(fs: &Arc<MayakashiFs>) -> Vec<JoinHandle<()>> {
    let plan = preload_plan(fs);
    let mut workers = Vec::with_capacity(plan.len());

    for (shard, keys) in plan {
        let fs = Arc::clone(fs);
        workers.push(std::thread::spawn(move || {
            for key in keys {
                let Some(source) = fs.tree().lookup_file(&key) else {
                    continue;
                };
                let FileSource::Mar {
                    info, body_offset, ..
                } = source
                else {
                    continue;
                };

                let mut ptr = *body_offset;
                for chunk in &info.chunks {
                    while fs.store().user_read_within(USER_READ_WINDOW) {
                        debug!(file = key.as_str(), "user read in progress, preload waiting");
                        std::thread::sleep(YIELD_SLEEP);
                    }
                    if let Err(err) =
                        fs.store()
                            .preload_read(&shard, ptr, chunk.compressed_length as usize)
                    {
                        warn!(file = key.as_str(), error = %err, "preload read failed");
                        break;
                    }
                    ptr += chunk.compressed_length as u64;
                }
            }
            info!(shard = %shard.display(), "preload finished");
        }));
    }

    workers
}
