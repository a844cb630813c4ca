//! The narrow contract between the dispatcher and a rule engine.
//!
//! An engine scans either a local file or a lazily fetched sequence of byte
//! ranges. Range sources follow a pull protocol: the engine asks for the
//! first descriptor, fetches its bytes into a buffer it owns, then asks for
//! the next one until the source is exhausted. Fetch failures never unwind
//! through the engine; the source records them and reports `failed()`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::error::{FetchError, ScanError};
use crate::model::{ChunkRequest, RuleMatch};
use crate::signatures::{files_with_extensions, SignatureEngine};
use crate::yara::{YaraEngine, YARA_EXTENSIONS};

pub trait ChunkSource: Send {
    /// Rewinds to offset 0. `None` for an empty subject.
    fn first(&mut self) -> Option<ChunkRequest>;

    /// The range after the last one handed out, `None` at the end.
    fn next(&mut self) -> Option<ChunkRequest>;

    /// Deferred fetch of a descriptor previously returned by `first`/`next`.
    /// `buf.len()` equals `chunk.length`.
    fn fetch(&mut self, chunk: ChunkRequest, buf: &mut [u8]);

    fn failed(&self) -> bool;

    fn take_error(&mut self) -> Option<FetchError>;

    /// Human-readable subject, such as an object key.
    fn label(&self) -> &str;
}

pub trait ScanEngine: Send + Sync {
    /// Matches for one local file, at most one entry per rule.
    fn scan_file(&self, path: &Path) -> Result<Vec<RuleMatch>, ScanError>;

    /// Matches for a chunked subject, at most one entry per rule.
    fn scan_chunks(&self, source: &mut dyn ChunkSource) -> Result<Vec<RuleMatch>, ScanError>;

    fn rule_count(&self) -> usize;

    /// `namespace:name` of every loaded rule, for listing.
    fn rule_names(&self) -> Vec<String>;
}

/// YARA rules when the directory holds any `.yar`/`.yara` file, the
/// built-in TOML signatures otherwise.
pub fn load_engine(dir: &Path, overlap: usize) -> Result<Arc<dyn ScanEngine>> {
    if files_with_extensions(dir, &YARA_EXTENSIONS).is_empty() {
        let engine = SignatureEngine::load_dir(dir)?.with_overlap(overlap);
        info!("compiled {} signature rule(s)", engine.rule_count());
        Ok(Arc::new(engine))
    } else {
        let engine = YaraEngine::load_dir(dir)?.with_overlap(overlap);
        info!("compiled {} yara rule(s)", engine.rule_count());
        Ok(Arc::new(engine))
    }
}
