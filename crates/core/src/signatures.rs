use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use regex::bytes::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use serde::Deserialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::engine::{ChunkSource, ScanEngine};
use crate::error::{ScanError, ScanErrorKind};
use crate::model::{RuleMatch, MAX_CHUNK_SIZE};
use crate::yara::YARA_EXTENSIONS;

pub const RULE_FILE_EXTENSION: &str = "toml";
pub const DEFAULT_OVERLAP: usize = 4096;

const PATTERN_SIZE_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    name: String,
    #[serde(default)]
    strings: Vec<String>,
    #[serde(default)]
    hex: Vec<String>,
    #[serde(default)]
    regex: Vec<String>,
    #[serde(default)]
    condition: Condition,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub namespace: String,
    pub condition: Condition,
    patterns: Range<usize>,
}

/// Rule files of either supported format under `dir`, in file-name order.
pub fn rule_files(dir: &Path) -> Vec<PathBuf> {
    let mut extensions = vec![RULE_FILE_EXTENSION];
    extensions.extend(YARA_EXTENSIONS);
    files_with_extensions(dir, &extensions)
}

pub(crate) fn files_with_extensions(dir: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable rule path under {}: {}", dir.display(), err);
                continue;
            }
        };
        let extension = entry.path().extension().and_then(|ext| ext.to_str());
        if entry.file_type().is_file()
            && extension.is_some_and(|extension| extensions.contains(&extension))
        {
            files.push(entry.into_path());
        }
    }
    files
}

/// Signature rules compiled into one byte-regex set.
///
/// Rule files are TOML documents holding `[[rule]]` tables; the file's path
/// relative to the rule directory (without extension) is the namespace.
///
/// ```toml
/// [[rule]]
/// name = "EICAR"
/// strings = ['X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!']
///
/// [[rule]]
/// name = "PeHeaderWithMarker"
/// hex = ["4D 5A ?? 00"]
/// regex = ['(?i)evil[-_]marker']
/// condition = "all"
/// ```
///
/// Assertions such as `^`, `$` and `\b` are judged against the whole
/// subject, not the block being searched.
#[derive(Debug)]
pub struct SignatureEngine {
    rules: Vec<CompiledRule>,
    set: RegexSet,
    /// The same patterns as `set`, for confirming a hit with context.
    regexes: Vec<Regex>,
    block_size: usize,
    overlap: usize,
}

impl SignatureEngine {
    /// Loads every `*.toml` file under `dir`. Files that fail to parse or
    /// compile are logged and skipped; zero usable rules is an error.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut sources = Vec::new();
        for path in files_with_extensions(dir, &[RULE_FILE_EXTENSION]) {
            let namespace = namespace_for(dir, &path);
            info!("loading rules from {:?}", path);
            let text = fs::read_to_string(&path)
                .with_context(|| format!("error opening rules from {}", path.display()))?;
            sources.push((namespace, text));
        }

        let engine = Self::from_sources(
            sources
                .iter()
                .map(|(namespace, text)| (namespace.as_str(), text.as_str())),
        )?;
        if engine.rules.is_empty() {
            return Err(anyhow!(
                "no rules to scan files with; place signatures in {}/*.{}",
                dir.display(),
                RULE_FILE_EXTENSION
            ));
        }
        Ok(engine)
    }

    /// Compiles `(namespace, toml)` pairs. A source that fails to parse or
    /// holds an invalid pattern is skipped as a whole.
    pub fn from_sources<'a>(sources: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut rules = Vec::new();
        let mut patterns: Vec<String> = Vec::new();

        for (namespace, text) in sources {
            match compile_source(namespace, text) {
                Ok(compiled) => {
                    for (name, condition, rule_patterns) in compiled {
                        let start = patterns.len();
                        patterns.extend(rule_patterns);
                        rules.push(CompiledRule {
                            name,
                            namespace: namespace.to_string(),
                            condition,
                            patterns: start..patterns.len(),
                        });
                    }
                }
                Err(err) => warn!("error compiling rules from {namespace:?}: {err:#}"),
            }
        }

        let set = RegexSetBuilder::new(&patterns)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .context("failed to compile rule set")?;
        let regexes = patterns
            .iter()
            .map(|pattern| RegexBuilder::new(pattern).size_limit(PATTERN_SIZE_LIMIT).build())
            .collect::<Result<Vec<_>, _>>()
            .context("failed to compile rule patterns")?;

        Ok(Self {
            rules,
            set,
            regexes,
            block_size: MAX_CHUNK_SIZE as usize,
            overlap: DEFAULT_OVERLAP,
        })
    }

    /// Bytes carried from one block into the next so patterns straddling a
    /// block boundary still match.
    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    fn matcher(&self) -> BlockMatcher<'_> {
        BlockMatcher {
            engine: self,
            seen: vec![false; self.set.len()],
            window: Vec::new(),
            context: false,
            fed: false,
        }
    }
}

impl ScanEngine for SignatureEngine {
    fn scan_file(&self, path: &Path) -> Result<Vec<RuleMatch>, ScanError> {
        let mut file = File::open(path).map_err(|err| ScanError::from_local_io(&err))?;
        let metadata = file
            .metadata()
            .map_err(|err| ScanError::from_local_io(&err))?;
        if !metadata.is_file() {
            return Err(ScanError::new(
                ScanErrorKind::Unmappable,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let mut matcher = self.matcher();
        let mut buf = vec![0_u8; self.block_size];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => matcher.feed(&buf[..read]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ScanError::from_local_io(&err)),
            }
        }
        Ok(matcher.finish())
    }

    fn scan_chunks(&self, source: &mut dyn ChunkSource) -> Result<Vec<RuleMatch>, ScanError> {
        let mut matcher = self.matcher();
        let mut buf = Vec::new();
        let mut next = source.first();
        while let Some(chunk) = next {
            let length = usize::try_from(chunk.length).map_err(|_| {
                ScanError::new(ScanErrorKind::Engine, "chunk larger than address space")
            })?;
            buf.clear();
            buf.resize(length, 0);
            source.fetch(chunk, &mut buf);
            if source.failed() {
                break;
            }
            matcher.feed(&buf);
            next = source.next();
        }
        Ok(matcher.finish())
    }

    fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn rule_names(&self) -> Vec<String> {
        self.rules
            .iter()
            .map(|rule| format!("{}:{} (match {:?})", rule.namespace, rule.name, rule.condition))
            .collect()
    }
}

struct BlockMatcher<'a> {
    engine: &'a SignatureEngine,
    seen: Vec<bool>,
    window: Vec<u8>,
    /// `window[0]` precedes the bytes still to be searched and only gives
    /// assertions their left context.
    context: bool,
    fed: bool,
}

impl BlockMatcher<'_> {
    fn feed(&mut self, block: &[u8]) {
        if block.is_empty() {
            return;
        }
        self.fed = true;
        self.window.extend_from_slice(block);
        let deferred = self.search(false);

        let len = self.window.len();
        let mut keep_from = len.saturating_sub(self.engine.overlap);
        if let Some(start) = deferred {
            let limit = len.saturating_sub(self.engine.overlap + MAX_CHUNK_SIZE as usize);
            keep_from = keep_from.min(start.max(limit));
        }
        let drop = keep_from.saturating_sub(1);
        if drop > 0 {
            self.window.drain(..drop);
            self.context = true;
        }
    }

    /// Marks confirmed patterns and returns where the earliest deferred hit
    /// starts. A hit ending on the last byte is deferred until more data or
    /// the end of the subject is known, since `$` and `\b` depend on it.
    fn search(&mut self, at_end: bool) -> Option<usize> {
        let haystack = self.window.as_slice();
        let from = usize::from(self.context);
        let mut deferred: Option<usize> = None;
        for index in self.engine.set.matches(haystack).iter() {
            if self.seen[index] {
                continue;
            }
            match self.engine.regexes[index].find_at(haystack, from) {
                Some(found) if at_end || found.end() < haystack.len() => self.seen[index] = true,
                Some(found) => {
                    deferred = Some(deferred.map_or(found.start(), |start| start.min(found.start())))
                }
                None => {}
            }
        }
        deferred
    }

    fn finish(mut self) -> Vec<RuleMatch> {
        if self.fed {
            self.search(true);
        }
        let mut matches = self
            .engine
            .rules
            .iter()
            .filter(|rule| {
                let mut hits = self.seen[rule.patterns.clone()].iter();
                match rule.condition {
                    Condition::Any => hits.any(|hit| *hit),
                    Condition::All => hits.all(|hit| *hit),
                }
            })
            .map(|rule| RuleMatch::new(rule.name.clone(), rule.namespace.clone()))
            .collect::<Vec<_>>();
        matches.sort();
        matches.dedup();
        matches
    }
}

type CompiledSource = Vec<(String, Condition, Vec<String>)>;

fn compile_source(namespace: &str, text: &str) -> Result<CompiledSource> {
    let file: RuleFile = toml::from_str(text).context("invalid rule file")?;
    let mut compiled = Vec::new();
    for spec in file.rules {
        let mut patterns = spec
            .strings
            .iter()
            .map(|literal| regex::escape(literal))
            .collect::<Vec<_>>();
        for hex in &spec.hex {
            patterns.push(
                hex_pattern(hex).with_context(|| format!("rule {}: bad hex {hex:?}", spec.name))?,
            );
        }
        patterns.extend(spec.regex.iter().cloned());

        if patterns.is_empty() {
            return Err(anyhow!("rule {} in {namespace} has no patterns", spec.name));
        }
        for pattern in &patterns {
            Regex::new(pattern).with_context(|| format!("rule {}: bad pattern", spec.name))?;
        }
        compiled.push((spec.name, spec.condition, patterns));
    }
    Ok(compiled)
}

/// Converts `"4D 5A ?? 00"` into a byte regex; `??` matches any byte.
fn hex_pattern(hex: &str) -> Result<String> {
    let digits = hex
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<Vec<_>>();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(anyhow!("hex string needs an even, non-zero number of digits"));
    }

    let mut pattern = String::from("(?s-u:");
    for pair in digits.chunks(2) {
        match pair {
            ['?', '?'] => pattern.push('.'),
            [high, low] if high.is_ascii_hexdigit() && low.is_ascii_hexdigit() => {
                pattern.push_str("\\x");
                pattern.push(*high);
                pattern.push(*low);
            }
            _ => return Err(anyhow!("invalid hex byte {:?}", pair.iter().collect::<String>())),
        }
    }
    pattern.push(')');
    Ok(pattern)
}

pub(crate) fn namespace_for(root: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(root).unwrap_or(file).with_extension("");
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
