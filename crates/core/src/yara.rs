//! YARA rule sets, compiled and evaluated by `yara-x`.
//!
//! Local files are scanned whole. Remote subjects are buffered up to
//! [`WHOLE_SUBJECT_LIMIT`] so conditions such as `filesize` or
//! `uint16(0) == 0x5A4D` see the real object; larger objects are scanned in
//! overlapping windows and their conditions are evaluated per window.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};
use yara_x::{Compiler, Rules, Scanner};

use crate::engine::{ChunkSource, ScanEngine};
use crate::error::{ScanError, ScanErrorKind};
use crate::model::RuleMatch;
use crate::signatures::{files_with_extensions, namespace_for, DEFAULT_OVERLAP};

pub const YARA_EXTENSIONS: [&str; 2] = ["yar", "yara"];
pub const WHOLE_SUBJECT_LIMIT: usize = 16 * 1024 * 1024;

pub struct YaraEngine {
    rules: Rules,
    names: Vec<String>,
    whole_subject_limit: usize,
    overlap: usize,
}

impl YaraEngine {
    /// Compiles every `*.yar`/`*.yara` file under `dir`, each in a namespace
    /// named after its relative path. Files that fail to compile are logged
    /// and skipped; zero usable rules is an error.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut compiler = Compiler::new();
        for path in files_with_extensions(dir, &YARA_EXTENSIONS) {
            info!("loading yara rules from {:?}", path);
            let text = fs::read_to_string(&path)
                .with_context(|| format!("error opening yara rules from {}", path.display()))?;
            compiler.new_namespace(&namespace_for(dir, &path));
            if let Err(err) = compiler.add_source(text.as_str()) {
                warn!("error compiling yara rules from {:?}: {}", path, err);
            }
        }

        let engine = Self::from_rules(compiler.build());
        if engine.names.is_empty() {
            return Err(anyhow!(
                "no rules to scan files with; place signatures in {}/*.yar",
                dir.display()
            ));
        }
        Ok(engine)
    }

    /// Compiles `(namespace, source)` pairs, skipping sources that fail.
    pub fn from_sources<'a>(sources: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut compiler = Compiler::new();
        for (namespace, text) in sources {
            compiler.new_namespace(namespace);
            if let Err(err) = compiler.add_source(text) {
                warn!("error compiling yara rules from {namespace:?}: {err}");
            }
        }
        Self::from_rules(compiler.build())
    }

    fn from_rules(rules: Rules) -> Self {
        let names = rules
            .iter()
            .map(|rule| format!("{}:{}", rule.namespace(), rule.identifier()))
            .collect();
        Self {
            rules,
            names,
            whole_subject_limit: WHOLE_SUBJECT_LIMIT,
            overlap: DEFAULT_OVERLAP,
        }
    }

    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_whole_subject_limit(mut self, limit: usize) -> Self {
        self.whole_subject_limit = limit.max(1);
        self
    }
}

fn engine_error(err: yara_x::ScanError) -> ScanError {
    ScanError::new(ScanErrorKind::Engine, err.to_string())
}

fn scan_into(
    scanner: &mut Scanner<'_>,
    data: &[u8],
    found: &mut Vec<RuleMatch>,
) -> Result<(), ScanError> {
    let results = scanner.scan(data).map_err(engine_error)?;
    found.extend(
        results
            .matching_rules()
            .map(|rule| RuleMatch::new(rule.identifier(), rule.namespace())),
    );
    Ok(())
}

fn deduplicated(mut found: Vec<RuleMatch>) -> Vec<RuleMatch> {
    found.sort();
    found.dedup();
    found
}

impl ScanEngine for YaraEngine {
    fn scan_file(&self, path: &Path) -> Result<Vec<RuleMatch>, ScanError> {
        let metadata = fs::metadata(path).map_err(|err| ScanError::from_local_io(&err))?;
        if !metadata.is_file() {
            return Err(ScanError::new(
                ScanErrorKind::Unmappable,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let mut scanner = Scanner::new(&self.rules);
        let results = scanner.scan_file(path).map_err(engine_error)?;
        Ok(deduplicated(
            results
                .matching_rules()
                .map(|rule| RuleMatch::new(rule.identifier(), rule.namespace()))
                .collect(),
        ))
    }

    fn scan_chunks(&self, source: &mut dyn ChunkSource) -> Result<Vec<RuleMatch>, ScanError> {
        let mut scanner = Scanner::new(&self.rules);
        let mut found = Vec::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut pending = false;
        let mut windowed = false;

        let mut next = source.first();
        while let Some(chunk) = next {
            let length = usize::try_from(chunk.length).map_err(|_| {
                ScanError::new(ScanErrorKind::Engine, "chunk larger than address space")
            })?;
            let start = buffer.len();
            buffer.resize(start + length, 0);
            source.fetch(chunk, &mut buffer[start..]);
            if source.failed() {
                return Ok(deduplicated(found));
            }
            pending = true;

            if buffer.len() > self.whole_subject_limit {
                if !windowed {
                    debug!(
                        "{} is larger than {} bytes, scanning it in windows",
                        source.label(),
                        self.whole_subject_limit
                    );
                    windowed = true;
                }
                scan_into(&mut scanner, &buffer, &mut found)?;
                let keep = self.overlap.min(buffer.len());
                buffer.drain(..buffer.len() - keep);
                pending = false;
            }
            next = source.next();
        }

        if pending {
            scan_into(&mut scanner, &buffer, &mut found)?;
        }
        Ok(deduplicated(found))
    }

    fn rule_count(&self) -> usize {
        self.names.len()
    }

    fn rule_names(&self) -> Vec<String> {
        self.names.clone()
    }
}
