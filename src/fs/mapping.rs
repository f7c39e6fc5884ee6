//! Bidirectional extension mapping between source files and their
//! transcoded targets.
//!
//! Each rule associates a source extension, a target extension and a
//! pipeline spec. The mapping is populated once at startup and read-only
//! afterwards, so lookups need no synchronization. Resolution walks every
//! dot-separated suffix of a path left to right, which lets `a.b.flac`
//! match a `flac` rule.

use std::borrow::Cow;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::warn;

/// Marker element consuming from a file location; the launcher resolves it
/// against the source path.
pub const FILESRC: &str = "filesrc name=filesrc";
/// Marker element consuming from the source file descriptor.
pub const FDSRC: &str = "fdsrc name=fdsrc";
/// Marker element producing into the artifact pipe.
pub const FDSINK: &str = "fdsink name=fdsink";

/// One transcode rule: source extension, target extension, and the wrapped
/// pipeline spec handed to the pipeline collaborator.
#[derive(Debug, PartialEq, Eq)]
pub struct TranscodeElement {
    pub source: String,
    pub target: String,
    pub pipeline: String,
}

/// Extension-indexed rule registry with unique source and target indices.
#[derive(Debug, Default)]
pub struct TranscodeMapping {
    by_source: FxHashMap<String, Arc<TranscodeElement>>,
    by_target: FxHashMap<String, Arc<TranscodeElement>>,
}

/// Put the user's pipeline spec in a source/sink sandwich so the launcher
/// always finds a named consumer and producer at the ends.
fn wrap_pipeline(pipeline: &str) -> String {
    if pipeline.is_empty() {
        format!("{FILESRC} ! {FDSINK}")
    } else {
        format!("{FILESRC} ! {pipeline} ! {FDSINK}")
    }
}

impl TranscodeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    /// Register a rule. Both extensions must be globally unique; a clash
    /// in either index drops the rule with a diagnostic.
    pub fn add(&mut self, source: &str, target: &str, pipeline: &str) {
        if self.by_source.contains_key(source) || self.by_target.contains_key(target) {
            warn!(
                source,
                target, "mapping from source extension or to target extension already specified - ignoring"
            );
            return;
        }
        let element = Arc::new(TranscodeElement {
            source: source.to_string(),
            target: target.to_string(),
            pipeline: wrap_pipeline(pipeline),
        });
        self.by_source.insert(source.to_string(), element.clone());
        self.by_target.insert(target.to_string(), element);
    }

    /// Map a target (virtual) path to its source path.
    ///
    /// Returns the path unchanged (borrowed) and no element when no
    /// suffix matches a target extension.
    pub fn source_from<'a>(
        &self,
        path: &'a str,
    ) -> (Cow<'a, str>, Option<Arc<TranscodeElement>>) {
        resolve(path, &self.by_target, |element| &element.source)
    }

    /// Map a source path to its target (virtual) path.
    pub fn target_from<'a>(
        &self,
        path: &'a str,
    ) -> (Cow<'a, str>, Option<Arc<TranscodeElement>>) {
        resolve(path, &self.by_source, |element| &element.target)
    }
}

/// Scan `path` for dot-separated suffixes and rewrite the leftmost one
/// present in `index` with the extension selected by `replacement`.
fn resolve<'a>(
    path: &'a str,
    index: &FxHashMap<String, Arc<TranscodeElement>>,
    replacement: impl Fn(&TranscodeElement) -> &str,
) -> (Cow<'a, str>, Option<Arc<TranscodeElement>>) {
    for (pos, _) in path.match_indices('.') {
        let suffix = &path[pos + 1..];
        if let Some(element) = index.get(suffix) {
            let resolved = format!("{}{}", &path[..pos + 1], replacement(element));
            return (Cow::Owned(resolved), Some(element.clone()));
        }
    }
    (Cow::Borrowed(path), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flac_to_mp3() -> TranscodeMapping {
        let mut mapping = TranscodeMapping::new();
        mapping.add("flac", "mp3", "");
        mapping
    }

    #[test]
    fn test_target_and_source_resolution() {
        let mapping = flac_to_mp3();

        let (target, element) = mapping.target_from("a/b.flac");
        assert_eq!(target, "a/b.mp3");
        assert!(element.is_some());

        let (source, element) = mapping.source_from("a/b.mp3");
        assert_eq!(source, "a/b.flac");
        assert!(element.is_some());
    }

    #[test]
    fn test_unmatched_path_is_borrowed() {
        let mapping = flac_to_mp3();
        let (resolved, element) = mapping.target_from("readme.txt");
        assert_eq!(resolved, "readme.txt");
        assert!(matches!(resolved, Cow::Borrowed(_)));
        assert!(element.is_none());
    }

    #[test]
    fn test_multi_dot_suffix_matches() {
        let mapping = flac_to_mp3();
        let (target, element) = mapping.target_from("album.1999/a.b.flac");
        assert_eq!(target, "album.1999/a.b.mp3");
        assert!(element.is_some());
    }

    #[test]
    fn test_round_trip_law() {
        let mapping = flac_to_mp3();
        let (source, _) = mapping.source_from("x/y.mp3");
        let (target, _) = mapping.target_from(&source);
        assert_eq!(target, "x/y.mp3");
    }

    #[test]
    fn test_pipeline_wrapping() {
        let mut mapping = TranscodeMapping::new();
        mapping.add("flac", "mp3", "flac -dc ! lame -");
        let (_, element) = mapping.source_from("x.mp3");
        assert_eq!(
            element.unwrap().pipeline,
            "filesrc name=filesrc ! flac -dc ! lame - ! fdsink name=fdsink"
        );

        mapping.add("wav", "ogg", "");
        let (_, element) = mapping.source_from("x.ogg");
        assert_eq!(
            element.unwrap().pipeline,
            "filesrc name=filesrc ! fdsink name=fdsink"
        );
    }

    #[test]
    fn test_duplicate_extensions_are_ignored() {
        let mut mapping = flac_to_mp3();
        mapping.add("flac", "ogg", "x");
        mapping.add("wav", "mp3", "y");
        assert_eq!(mapping.len(), 1);

        // original rule still intact
        let (target, _) = mapping.target_from("a.flac");
        assert_eq!(target, "a.mp3");
    }
}
