use std::collections::BTreeSet;

use indexmap::IndexMap;
use plist::{Dictionary, Value};
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SetError {
    #[error("duplicate articulation names: {}", .0.join(", "))]
    DuplicateNames(Vec<String>),
}

const MUSESCORE_DEFAULT_SYMBOLS: [&str; 14] = [
    "staccato",
    "staccatissimo",
    "tenuto",
    "accent",
    "marcato",
    "sforzato",
    "loure",
    "fermata",
    "trill",
    "mordent",
    "mordent inverted",
    "turn",
    "harmonics",
    "mute",
];

const LOWERCASE_TECHNIQUES: [&str; 6] =
    ["legato", "tremolo", "pizzicato", "col legno", "sul pont.", "sul tasto"];

/// Fixed vocabularies consulted during classification: the recognized
/// articulation symbols (matched against already-lowercased symbols) and the
/// technique names whose keys are written lowercased.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Vocabulary {
    recognized_symbols: BTreeSet<String>,
    lowercase_techniques: BTreeSet<String>,
}

impl Vocabulary {
    #[must_use]
    pub fn new(recognized_symbols: &[&str], lowercase_techniques: &[&str]) -> Self {
        Self {
            recognized_symbols: recognized_symbols.iter().map(|entry| (*entry).to_string()).collect(),
            lowercase_techniques: lowercase_techniques.iter().map(|entry| (*entry).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn is_recognized_symbol(&self, symbol: &str) -> bool {
        self.recognized_symbols.contains(symbol)
    }

    /// Derive the technique-map key for an exact name.
    ///
    /// The name is probed against the lowercase-technique vocabulary with
    /// whitespace runs collapsed and case folded, optionally with a single
    /// trailing period removed. On a match the collapsed lowercase form is the
    /// key (a trailing period survives); otherwise the exact name is returned
    /// unchanged.
    #[must_use]
    pub fn technique_key(&self, exact_name: &str) -> String {
        let collapsed = exact_name.split_whitespace().collect::<Vec<_>>().join(" ");
        let probe = collapsed.to_lowercase();
        let without_period = probe.strip_suffix('.').unwrap_or(&probe);
        if self.lowercase_techniques.contains(probe.as_str())
            || self.lowercase_techniques.contains(without_period)
        {
            probe
        } else {
            exact_name.to_string()
        }
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(&MUSESCORE_DEFAULT_SYMBOLS, &LOWERCASE_TECHNIQUES)
    }
}

/// Value stored per key in an output map: a bare MIDI note, or a
/// `"<note>|<velocity>"` composite when a velocity accompanies the note.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KeyswitchValue {
    Note(u8),
    NoteVelocity { note: u8, velocity: u8 },
}

impl Serialize for KeyswitchValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match *self {
            Self::Note(note) => serializer.serialize_u8(note),
            Self::NoteVelocity { note, velocity } => {
                serializer.serialize_str(&format!("{note}|{velocity}"))
            }
        }
    }
}

/// One document's output: two insertion-ordered keyswitch maps, serialized as
/// `articulationKeyMap` and `techniqueKeyMap`.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetEntry {
    pub articulation_key_map: IndexMap<String, KeyswitchValue>,
    pub technique_key_map: IndexMap<String, KeyswitchValue>,
}

impl SetEntry {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.articulation_key_map.is_empty() && self.technique_key_map.is_empty()
    }

    fn insert(&mut self, placement: Placement) {
        let map = match placement.destination {
            Destination::Articulation => &mut self.articulation_key_map,
            Destination::Technique => &mut self.technique_key_map,
        };
        map.insert(placement.key, placement.value);
    }
}

/// Fields resolved from one articulation record, discarded after
/// classification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedArticulation {
    pub exact_name: String,
    pub note: u8,
    pub velocity: Option<u8>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Destination {
    Articulation,
    Technique,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Placement {
    pub destination: Destination,
    pub key: String,
    pub value: KeyswitchValue,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Classification {
    Placed(Placement),
    Duplicate(String),
}

/// Running per-document state: names already classified and symbols already
/// holding an articulation-map slot. Created empty per document and discarded
/// when the document completes.
#[derive(Debug, Default)]
pub struct DocumentState {
    seen_names: BTreeSet<String>,
    claimed_symbols: BTreeSet<String>,
}

/// Return the articulation records of a loaded document.
///
/// Looks for `"Articulations"` and then `"articulations"`; the first key
/// present holding an array wins, even an empty one. Any other shape yields an
/// empty slice.
#[must_use]
pub fn extract_articulations(document: &Value) -> &[Value] {
    let Some(dict) = document.as_dictionary() else {
        return &[];
    };
    for key in ["Articulations", "articulations"] {
        if let Some(Value::Array(records)) = dict.get(key) {
            return records;
        }
    }
    &[]
}

/// Resolve the identity, keyswitch note, velocity, and symbol of one record.
///
/// Returns `None` when no exact name or no valid note can be derived; such
/// records are skipped without error.
#[must_use]
pub fn resolve_articulation(record: &Value) -> Option<ResolvedArticulation> {
    let dict = record.as_dictionary()?;
    let exact_name = resolve_exact_name(dict)?;
    let (note, velocity) = resolve_note_velocity(dict)?;
    let symbol = resolve_symbol(dict);
    Some(ResolvedArticulation { exact_name, note, velocity, symbol })
}

fn resolve_exact_name(record: &Dictionary) -> Option<String> {
    for key in ["ArticulationID", "Name"] {
        if let Some(name) = record.get(key).and_then(Value::as_string) {
            let trimmed = name.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn resolve_symbol(record: &Dictionary) -> Option<String> {
    let symbol = record.get("Symbol").and_then(Value::as_string)?.trim();
    if symbol.is_empty() {
        return None;
    }
    Some(symbol.to_lowercase())
}

fn resolve_note_velocity(record: &Dictionary) -> Option<(u8, Option<u8>)> {
    let output = record.get("Output")?;
    let candidates: &[Value] = match output {
        Value::Array(values) => values,
        single @ Value::Dictionary(_) => std::slice::from_ref(single),
        _ => return None,
    };

    for candidate in candidates {
        let Some(dict) = candidate.as_dictionary() else {
            continue;
        };
        let Some(note) = dict.get("MB1").and_then(midi_number) else {
            continue;
        };
        // Velocity comes from the same candidate that supplied the note.
        let velocity = dict.get("ValueLow").and_then(midi_number);
        return Some((note, velocity));
    }

    None
}

fn midi_number(value: &Value) -> Option<u8> {
    if let Some(number) = value.as_signed_integer() {
        return u8::try_from(number).ok().filter(|parsed| *parsed <= 127);
    }
    let text = value.as_string()?;
    if text.is_empty() || !text.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    text.parse::<u8>().ok().filter(|parsed| *parsed <= 127)
}

/// Decide the destination map and key for one resolved record.
///
/// A name already seen in this document signals a duplicate and leaves the
/// state otherwise untouched. A recognized symbol takes an articulation-map
/// slot on first use; reuses and everything else land in the technique map
/// under the (possibly case-normalized) exact name.
#[must_use]
pub fn classify_articulation(
    resolved: &ResolvedArticulation,
    state: &mut DocumentState,
    vocabulary: &Vocabulary,
) -> Classification {
    let value = match resolved.velocity {
        Some(velocity) => KeyswitchValue::NoteVelocity { note: resolved.note, velocity },
        None => KeyswitchValue::Note(resolved.note),
    };

    if !state.seen_names.insert(resolved.exact_name.clone()) {
        return Classification::Duplicate(resolved.exact_name.clone());
    }

    if let Some(symbol) = &resolved.symbol {
        if vocabulary.is_recognized_symbol(symbol) {
            if state.claimed_symbols.insert(symbol.clone()) {
                return Classification::Placed(Placement {
                    destination: Destination::Articulation,
                    key: symbol.clone(),
                    value,
                });
            }
            return Classification::Placed(Placement {
                destination: Destination::Technique,
                key: vocabulary.technique_key(&resolved.exact_name),
                value,
            });
        }
    }

    Classification::Placed(Placement {
        destination: Destination::Technique,
        key: vocabulary.technique_key(&resolved.exact_name),
        value,
    })
}

/// Classify every record of one document into a set entry.
///
/// Records that fail field resolution are skipped silently. Duplicate exact
/// names are collected across the whole document before failing so the
/// resulting error lists every offender. A document whose maps both end empty
/// yields `Ok(None)`.
///
/// # Errors
/// Returns [`SetError::DuplicateNames`] with one entry per repetition beyond
/// the first when any exact name occurs more than once.
pub fn classify_document(
    records: &[Value],
    vocabulary: &Vocabulary,
) -> Result<Option<SetEntry>, SetError> {
    let mut state = DocumentState::default();
    let mut entry = SetEntry::default();
    let mut duplicates: Vec<String> = Vec::new();

    for record in records {
        let Some(resolved) = resolve_articulation(record) else {
            continue;
        };
        match classify_articulation(&resolved, &mut state, vocabulary) {
            Classification::Placed(placement) => entry.insert(placement),
            Classification::Duplicate(name) => duplicates.push(name),
        }
    }

    if !duplicates.is_empty() {
        return Err(SetError::DuplicateNames(duplicates));
    }

    if entry.is_empty() {
        return Ok(None);
    }

    Ok(Some(entry))
}
