use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use keyswitch_sets_core::{
    classify_document, extract_articulations, SetEntry, SetError, Vocabulary,
};
use once_cell::sync::Lazy;
use plist::Value;
use walkdir::WalkDir;

/// Set entries keyed by set name, in discovery order. Re-inserting a name
/// replaces the entry but keeps the position of the first insertion.
pub type SetCollection = IndexMap<String, SetEntry>;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("duplicate articulation names in {}: {}", .path.display(), .names.join(", "))]
    DuplicateNames { path: PathBuf, names: Vec<String> },
    #[error("inputs file not found: {}", .0.display())]
    InputsFileNotFound(PathBuf),
    #[error("failed to read inputs file {}", .path.display())]
    InputsFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

static BRACKET_TAG: Lazy<regex_lite::Regex> = Lazy::new(|| {
    regex_lite::Regex::new(r"\[(.*?)\]")
        .unwrap_or_else(|err| panic!("invalid bracket tag pattern: {err}"))
});

static ENV_VAR: Lazy<regex_lite::Regex> = Lazy::new(|| {
    regex_lite::Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .unwrap_or_else(|err| panic!("invalid env var pattern: {err}"))
});

/// Derive the set name for an articulation set file.
///
/// Square-bracket tags anywhere in the file stem are lifted to the front of
/// the name in order of appearance, and what remains becomes the instrument
/// portion: `"Trumpet [Berlin Brass][Legato].plist"` names the set
/// `"Berlin Brass Legato Trumpet"`. Only the ends of the instrument portion
/// are trimmed, so a tag removed mid-stem leaves its surrounding spacing.
#[must_use]
pub fn set_name_for(path: &Path) -> String {
    let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or_default();
    let cleaned = BRACKET_TAG.replace_all(stem, "");
    let instrument = cleaned.trim();
    let tags: Vec<&str> = BRACKET_TAG
        .captures_iter(stem)
        .filter_map(|caps| caps.get(1))
        .map(|tag| tag.as_str().trim())
        .filter(|tag| !tag.is_empty())
        .collect();
    if tags.is_empty() {
        instrument.to_string()
    } else {
        format!("{} {instrument}", tags.join(" ")).trim().to_string()
    }
}

/// Load a plist document, returning `None` unless it parses to a non-empty
/// dictionary.
#[must_use]
pub fn load_document(path: &Path) -> Option<Value> {
    let document = match Value::from_file(path) {
        Ok(document) => document,
        Err(err) => {
            tracing::debug!("unreadable plist {} ({err})", path.display());
            return None;
        }
    };
    if document.as_dictionary().is_some_and(|dict| !dict.is_empty()) {
        Some(document)
    } else {
        tracing::debug!("plist {} has no top-level dictionary", path.display());
        None
    }
}

/// Build the named set entry for one articulation set file.
///
/// Unreadable files, documents without a top-level dictionary, and documents
/// whose records produce an empty entry all yield `Ok(None)`.
///
/// # Errors
/// Returns [`CollectError::DuplicateNames`] when the document repeats an
/// exact articulation name.
pub fn process_document(
    path: &Path,
    vocabulary: &Vocabulary,
) -> Result<Option<(String, SetEntry)>, CollectError> {
    let Some(document) = load_document(path) else {
        return Ok(None);
    };
    match classify_document(extract_articulations(&document), vocabulary) {
        Ok(Some(entry)) => Ok(Some((set_name_for(path), entry))),
        Ok(None) => Ok(None),
        Err(SetError::DuplicateNames(names)) => {
            Err(CollectError::DuplicateNames { path: path.to_path_buf(), names })
        }
    }
}

/// Collect set entries from every `.plist` file under a root directory.
///
/// The scan is recursive and visits entries in file-name order, so repeated
/// runs over the same tree produce the same collection order. A root that is
/// not a directory logs a warning and yields an empty collection.
///
/// # Errors
/// Returns [`CollectError::DuplicateNames`] when any scanned document repeats
/// an exact articulation name.
pub fn collect_from_root(
    root: &Path,
    vocabulary: &Vocabulary,
) -> Result<SetCollection, CollectError> {
    let mut collection = SetCollection::new();
    if root.is_dir() {
        scan_directory(root, vocabulary, &mut collection)?;
    } else {
        tracing::warn!("{} is not a directory, skipping", root.display());
    }
    Ok(collection)
}

fn scan_directory(
    dir: &Path,
    vocabulary: &Vocabulary,
    collection: &mut SetCollection,
) -> Result<(), CollectError> {
    let walker = WalkDir::new(dir).follow_links(false).sort_by_file_name();
    for entry in walker.into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() || !has_plist_extension(entry.path()) {
            continue;
        }
        if let Some((set_name, set_entry)) = process_document(entry.path(), vocabulary)? {
            collection.insert(set_name, set_entry);
        }
    }
    Ok(())
}

/// Collect set entries from an inputs file listing paths, directories, and
/// glob patterns, one per line.
///
/// Blank lines and `#` comments are skipped. Each entry is expanded for
/// environment variables and a leading tilde before matching. Directory
/// entries are scanned recursively, glob matches are processed in the order
/// the glob yields them, and entries that resolve to nothing are logged and
/// skipped. Later entries overwrite earlier sets with the same name.
///
/// # Errors
/// Returns [`CollectError::InputsFileNotFound`] when the inputs file itself
/// does not exist, [`CollectError::InputsFileRead`] when it cannot be read,
/// and [`CollectError::DuplicateNames`] when a listed document repeats an
/// exact articulation name.
pub fn collect_from_inputs_file(
    inputs_file: &Path,
    vocabulary: &Vocabulary,
) -> Result<SetCollection, CollectError> {
    let path = PathBuf::from(expand_entry(&inputs_file.to_string_lossy()));
    if !path.is_file() {
        return Err(CollectError::InputsFileNotFound(path));
    }
    let body = fs::read_to_string(&path)
        .map_err(|source| CollectError::InputsFileRead { path, source })?;

    let mut collection = SetCollection::new();
    for raw_line in body.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let expanded = expand_entry(line);
        let entry_path = Path::new(&expanded);
        if entry_path.is_dir() {
            scan_directory(entry_path, vocabulary, &mut collection)?;
        } else if has_glob_magic(&expanded) {
            collect_glob(&expanded, line, vocabulary, &mut collection)?;
        } else if !entry_path.is_file() {
            tracing::warn!("file not found (skipped): {line}");
        } else if !has_plist_extension(entry_path) {
            tracing::warn!("not a .plist (skipped): {line}");
        } else if let Some((set_name, set_entry)) = process_document(entry_path, vocabulary)? {
            collection.insert(set_name, set_entry);
        }
    }
    Ok(collection)
}

fn collect_glob(
    pattern: &str,
    origin: &str,
    vocabulary: &Vocabulary,
    collection: &mut SetCollection,
) -> Result<(), CollectError> {
    let paths = match glob::glob(pattern) {
        Ok(paths) => paths,
        Err(err) => {
            tracing::warn!("invalid glob pattern (skipped): {origin} ({err})");
            return Ok(());
        }
    };

    let mut matched = false;
    for result in paths {
        let Ok(path) = result else {
            continue;
        };
        matched = true;
        if path.is_file() && has_plist_extension(&path) {
            if let Some((set_name, set_entry)) = process_document(&path, vocabulary)? {
                collection.insert(set_name, set_entry);
            }
        } else if path.is_dir() {
            scan_directory(&path, vocabulary, collection)?;
        } else {
            tracing::warn!("not a file or directory (skipped): {}", path.display());
        }
    }
    if !matched {
        tracing::warn!("glob matched no files: {origin}");
    }
    Ok(())
}

/// Expand `$VAR`, `${VAR}`, and a leading tilde in an inputs-file entry.
/// Unknown variables are left as written.
fn expand_entry(entry: &str) -> String {
    let with_env = ENV_VAR.replace_all(entry, |caps: &regex_lite::Captures<'_>| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |group| group.as_str());
        match env::var(name) {
            Ok(value) => value,
            Err(_) => caps.get(0).map_or(String::new(), |whole| whole.as_str().to_string()),
        }
    });
    expand_tilde(&with_env)
}

fn expand_tilde(entry: &str) -> String {
    if entry == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    if let Some(rest) = entry.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    entry.to_string()
}

fn has_plist_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("plist"))
}

fn has_glob_magic(entry: &str) -> bool {
    entry.contains(|ch: char| matches!(ch, '*' | '?' | '['))
}

/// Order a collection by case-insensitive set name. Ties keep their current
/// relative order.
pub fn sort_sets(collection: &mut SetCollection) {
    collection.sort_by(|name_a, _, name_b, _| name_a.to_lowercase().cmp(&name_b.to_lowercase()));
}

#[cfg(test)]
mod tests {
    use keyswitch_sets_core::KeyswitchValue;
    use tempfile::TempDir;

    use super::*;

    fn temp_dir() -> TempDir {
        match TempDir::new() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        }
    }

    fn write_file(dir: &Path, file_name: &str, body: &str) -> PathBuf {
        let path = dir.join(file_name);
        if let Err(err) = fs::write(&path, body) {
            panic!("failed to write {}: {err}", path.display());
        }
        path
    }

    fn make_dir(path: &Path) {
        if let Err(err) = fs::create_dir_all(path) {
            panic!("failed to create {}: {err}", path.display());
        }
    }

    fn record(name: &str, symbol: &str, note: i64) -> String {
        format!(
            "<dict>\
             <key>ArticulationID</key><string>{name}</string>\
             <key>Symbol</key><string>{symbol}</string>\
             <key>Output</key><dict><key>MB1</key><integer>{note}</integer></dict>\
             </dict>"
        )
    }

    fn record_without_output(name: &str) -> String {
        format!("<dict><key>ArticulationID</key><string>{name}</string></dict>")
    }

    fn document(records: &[String]) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
             \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
             <plist version=\"1.0\"><dict><key>Articulations</key><array>{}</array></dict></plist>\n",
            records.join("")
        )
    }

    fn simple_document(name: &str, symbol: &str, note: i64) -> String {
        document(&[record(name, symbol, note)])
    }

    fn collection_keys(collection: &SetCollection) -> Vec<&str> {
        collection.keys().map(String::as_str).collect()
    }

    #[test]
    fn set_name_uses_plain_stem() {
        assert_eq!(set_name_for(Path::new("/tmp/Cello.plist")), "Cello");
    }

    #[test]
    fn set_name_lifts_bracket_tags_in_order() {
        let path = Path::new("/lib/Trumpet [Berlin Brass][Legato].plist");
        assert_eq!(set_name_for(path), "Berlin Brass Legato Trumpet");
    }

    #[test]
    fn set_name_handles_tag_only_stem() {
        assert_eq!(set_name_for(Path::new("[VSL].plist")), "VSL");
    }

    #[test]
    fn set_name_keeps_interior_spacing() {
        let path = Path::new("Cello [VSL] Solo.plist");
        assert_eq!(set_name_for(path), "VSL Cello  Solo");
    }

    #[test]
    fn set_name_ignores_empty_tags() {
        assert_eq!(set_name_for(Path::new("Viola [].plist")), "Viola");
    }

    #[test]
    fn load_document_accepts_dictionary_plists() {
        let dir = temp_dir();
        let path = write_file(dir.path(), "ok.plist", &simple_document("Staccato", "Staccato", 24));
        assert!(load_document(&path).is_some());
    }

    #[test]
    fn load_document_rejects_unparseable_files() {
        let dir = temp_dir();
        let path = write_file(dir.path(), "bad.plist", "not a property list");
        assert!(load_document(&path).is_none());
    }

    #[test]
    fn load_document_rejects_empty_dictionaries() {
        let dir = temp_dir();
        let body = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
                    <plist version=\"1.0\"><dict/></plist>\n";
        let path = write_file(dir.path(), "empty.plist", body);
        assert!(load_document(&path).is_none());
    }

    #[test]
    fn process_document_builds_named_entry() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        let path =
            write_file(dir.path(), "Cello [VSL].plist", &simple_document("Staccato", "Staccato", 24));

        let (set_name, entry) = match process_document(&path, &vocabulary) {
            Ok(Some(built)) => built,
            other => panic!("expected a set entry, got {other:?}"),
        };
        assert_eq!(set_name, "VSL Cello");
        assert_eq!(entry.articulation_key_map.get("staccato"), Some(&KeyswitchValue::Note(24)));
    }

    #[test]
    fn process_document_skips_entryless_documents() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        let body = document(&[record_without_output("Staccato")]);
        let path = write_file(dir.path(), "hollow.plist", &body);

        match process_document(&path, &vocabulary) {
            Ok(None) => {}
            other => panic!("expected no entry, got {other:?}"),
        }
    }

    #[test]
    fn process_document_reports_duplicates_with_path() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        let body = document(&[record("Spiccato", "", 20), record("Spiccato", "", 21)]);
        let path = write_file(dir.path(), "dup.plist", &body);

        let err = match process_document(&path, &vocabulary) {
            Err(err) => err,
            Ok(other) => panic!("duplicate names must fail, got {other:?}"),
        };
        match err {
            CollectError::DuplicateNames { path: reported, names } => {
                assert_eq!(reported, path);
                assert_eq!(names, vec!["Spiccato".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn root_scan_collects_recursively_in_name_order() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        write_file(dir.path(), "beta.plist", &simple_document("Accent", "Accent", 30));
        write_file(dir.path(), "alpha.plist", &simple_document("Accent", "Accent", 31));
        let nested = dir.path().join("omega");
        make_dir(&nested);
        write_file(&nested, "gamma.plist", &simple_document("Accent", "Accent", 32));

        let collection = match collect_from_root(dir.path(), &vocabulary) {
            Ok(collection) => collection,
            Err(err) => panic!("scan failed: {err}"),
        };
        assert_eq!(collection_keys(&collection), ["alpha", "beta", "gamma"]);
    }

    #[test]
    fn root_scan_honors_extension_case_and_skips_noise() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        write_file(dir.path(), "UPPER.PLIST", &simple_document("Tenuto", "Tenuto", 40));
        write_file(dir.path(), "notes.txt", "not articulation data");
        write_file(dir.path(), "broken.plist", "garbage bytes");

        let collection = match collect_from_root(dir.path(), &vocabulary) {
            Ok(collection) => collection,
            Err(err) => panic!("scan failed: {err}"),
        };
        assert_eq!(collection_keys(&collection), ["UPPER"]);
    }

    #[test]
    fn root_scan_skips_non_directory_roots() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        let file = write_file(dir.path(), "single.plist", &simple_document("Turn", "Turn", 50));

        let collection = match collect_from_root(&file, &vocabulary) {
            Ok(collection) => collection,
            Err(err) => panic!("scan failed: {err}"),
        };
        assert!(collection.is_empty());
    }

    #[test]
    fn inputs_file_missing_is_fatal() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        let missing = dir.path().join("inputs.txt");

        let err = match collect_from_inputs_file(&missing, &vocabulary) {
            Err(err) => err,
            Ok(other) => panic!("missing inputs file must fail, got {other:?}"),
        };
        assert!(matches!(err, CollectError::InputsFileNotFound(_)));
    }

    #[test]
    fn inputs_file_processes_files_directories_and_skips() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        let explicit =
            write_file(dir.path(), "Flute.plist", &simple_document("Trill", "Trill", 60));
        let library = dir.path().join("library");
        make_dir(&library);
        write_file(&library, "Oboe.plist", &simple_document("Trill", "Trill", 61));
        let readme = write_file(dir.path(), "readme.txt", "plain text");
        let missing = dir.path().join("gone.plist");

        let listing = format!(
            "# articulation sources\n\n{}\n{}\n{}\n{}\n",
            explicit.display(),
            library.display(),
            readme.display(),
            missing.display()
        );
        let inputs = write_file(dir.path(), "inputs.txt", &listing);

        let collection = match collect_from_inputs_file(&inputs, &vocabulary) {
            Ok(collection) => collection,
            Err(err) => panic!("collection failed: {err}"),
        };
        assert_eq!(collection_keys(&collection), ["Flute", "Oboe"]);
    }

    #[test]
    fn inputs_file_expands_globs() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        write_file(dir.path(), "b.plist", &simple_document("Mute", "Mute", 70));
        write_file(dir.path(), "a.plist", &simple_document("Mute", "Mute", 71));

        let listing = format!("{}/*.plist\n", dir.path().display());
        let inputs_dir = temp_dir();
        let inputs = write_file(inputs_dir.path(), "inputs.txt", &listing);

        let collection = match collect_from_inputs_file(&inputs, &vocabulary) {
            Ok(collection) => collection,
            Err(err) => panic!("collection failed: {err}"),
        };
        assert_eq!(collection_keys(&collection), ["a", "b"]);
    }

    #[test]
    fn inputs_file_tolerates_empty_globs() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        let listing = format!("{}/nothing-here-*.plist\n", dir.path().display());
        let inputs = write_file(dir.path(), "inputs.txt", &listing);

        let collection = match collect_from_inputs_file(&inputs, &vocabulary) {
            Ok(collection) => collection,
            Err(err) => panic!("collection failed: {err}"),
        };
        assert!(collection.is_empty());
    }

    #[test]
    fn inputs_file_expands_environment_variables() {
        let dir = temp_dir();
        let vocabulary = Vocabulary::default();
        write_file(dir.path(), "Harp.plist", &simple_document("Fermata", "Fermata", 80));
        env::set_var("KSS_LOGIC_TEST_ROOT", dir.path());

        let listing = "$KSS_LOGIC_TEST_ROOT/Harp.plist\n${KSS_LOGIC_TEST_ROOT}/Harp.plist\n";
        let inputs_dir = temp_dir();
        let inputs = write_file(inputs_dir.path(), "inputs.txt", listing);

        let collection = match collect_from_inputs_file(&inputs, &vocabulary) {
            Ok(collection) => collection,
            Err(err) => panic!("collection failed: {err}"),
        };
        assert_eq!(collection_keys(&collection), ["Harp"]);
    }

    #[test]
    fn inputs_file_last_entry_wins_for_repeated_names() {
        let first = temp_dir();
        let second = temp_dir();
        let vocabulary = Vocabulary::default();
        let cello_a =
            write_file(first.path(), "Cello.plist", &simple_document("Staccato", "Staccato", 10));
        let viola =
            write_file(first.path(), "Viola.plist", &simple_document("Staccato", "Staccato", 20));
        let cello_b =
            write_file(second.path(), "Cello.plist", &simple_document("Staccato", "Staccato", 30));

        let listing =
            format!("{}\n{}\n{}\n", cello_a.display(), viola.display(), cello_b.display());
        let inputs = write_file(first.path(), "inputs.txt", &listing);

        let collection = match collect_from_inputs_file(&inputs, &vocabulary) {
            Ok(collection) => collection,
            Err(err) => panic!("collection failed: {err}"),
        };
        assert_eq!(collection_keys(&collection), ["Cello", "Viola"]);
        let entry = match collection.get("Cello") {
            Some(entry) => entry,
            None => panic!("expected Cello entry"),
        };
        assert_eq!(entry.articulation_key_map.get("staccato"), Some(&KeyswitchValue::Note(30)));
    }

    #[test]
    fn expand_entry_leaves_unknown_variables() {
        assert_eq!(expand_entry("$KSS_LOGIC_UNSET_VAR/x"), "$KSS_LOGIC_UNSET_VAR/x");
    }

    #[test]
    fn expand_entry_resolves_tilde_prefix() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(PathBuf::from(expand_entry("~/sets")), home.join("sets"));
    }

    #[test]
    fn sort_sets_orders_case_insensitively() {
        let mut collection = SetCollection::new();
        collection.insert("delta".to_string(), SetEntry::default());
        collection.insert("Beta".to_string(), SetEntry::default());
        collection.insert("alpha".to_string(), SetEntry::default());

        sort_sets(&mut collection);
        assert_eq!(collection_keys(&collection), ["alpha", "Beta", "delta"]);
    }
}
