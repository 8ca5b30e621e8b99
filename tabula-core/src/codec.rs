//! BSON persistence codec for document bases.
//!
//! The container is self-describing: `{ attributes: [{name, signals}],
//! documents: [{name, text, cells, nuggets: [{start, end, signals}]}] }`.
//! Every signal entry carries its identifier (`kind`) and an inline type
//! tag, so entries whose identifier this build does not recognize round-trip
//! untouched. Transient signals are dropped on encode.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{Attribute, CellState, Document, DocumentBase, Nugget};
use crate::error::{CoreError, Result};
use crate::signals::{self, SignalMap, SignalValue};

/// Serialize a document base to BSON bytes.
///
/// The base is validated first; persisting an inconsistent base is refused.
/// Transient signals (the per-attribute matching caches) are not written.
///
/// # Errors
///
/// Returns [`CoreError::ConsistencyViolation`] if the base fails validation
/// and [`CoreError::PersistenceError`] if BSON encoding fails.
pub fn encode(base: &DocumentBase) -> Result<Vec<u8>> {
    base.validate()?;

    let stored = StoredBase {
        attributes: base
            .attributes()
            .iter()
            .map(|attr| StoredAttribute {
                name: attr.name().to_string(),
                signals: store_signals(&attr.signals),
            })
            .collect(),
        documents: base
            .documents()
            .iter()
            .map(|doc| StoredDocument {
                name: doc.name().to_string(),
                text: doc.text().to_string(),
                cells: doc
                    .cells()
                    .iter()
                    .map(|(attr, state)| (attr.clone(), StoredCell::from(state)))
                    .collect(),
                nuggets: doc
                    .nuggets()
                    .iter()
                    .map(|nugget| StoredNugget {
                        start: nugget.start() as u64,
                        end: nugget.end() as u64,
                        signals: store_signals(&nugget.signals),
                    })
                    .collect(),
                signals: store_signals(&doc.signals),
            })
            .collect(),
    };

    let bytes = bson::to_vec(&stored)
        .map_err(|e| CoreError::PersistenceError(format!("encoding failed: {e}")))?;
    debug!(
        documents = base.documents().len(),
        attributes = base.attributes().len(),
        bytes = bytes.len(),
        "encoded document base"
    );
    Ok(bytes)
}

/// Deserialize a document base from BSON bytes and validate it.
///
/// # Errors
///
/// Returns [`CoreError::PersistenceError`] if the bytes are not a valid
/// container and [`CoreError::ConsistencyViolation`] if the decoded base
/// fails validation.
pub fn decode(bytes: &[u8]) -> Result<DocumentBase> {
    let stored: StoredBase = bson::from_slice(bytes)
        .map_err(|e| CoreError::PersistenceError(format!("decoding failed: {e}")))?;

    let attributes = stored
        .attributes
        .into_iter()
        .map(|attr| {
            let mut attribute = Attribute::new(attr.name);
            attribute.signals = load_signals(attr.signals);
            attribute
        })
        .collect();

    let documents = stored
        .documents
        .into_iter()
        .enumerate()
        .map(|(doc_ix, doc)| {
            let mut document = Document::new(doc.name, doc.text);
            document.signals = load_signals(doc.signals);
            for nugget in doc.nuggets {
                let mut n = Nugget::new(doc_ix, nugget.start as usize, nugget.end as usize);
                n.signals = load_signals(nugget.signals);
                document.push_nugget(n);
            }
            for (attr, cell) in doc.cells {
                document.set_cell(attr, cell.into());
            }
            document
        })
        .collect();

    DocumentBase::new(documents, attributes)
}

fn store_signals(map: &SignalMap) -> Vec<StoredSignal> {
    map.iter()
        .filter(|(id, _)| signals::is_persistent(id))
        .map(|(id, value)| StoredSignal { kind: id.to_string(), value: StoredValue::from(value) })
        .collect()
}

fn load_signals(stored: Vec<StoredSignal>) -> SignalMap {
    let mut map = SignalMap::new();
    for signal in stored {
        map.set(signal.kind, signal.value.into());
    }
    map
}

#[derive(Serialize, Deserialize)]
struct StoredBase {
    attributes: Vec<StoredAttribute>,
    documents: Vec<StoredDocument>,
}

#[derive(Serialize, Deserialize)]
struct StoredAttribute {
    name: String,
    signals: Vec<StoredSignal>,
}

#[derive(Serialize, Deserialize)]
struct StoredDocument {
    name: String,
    text: String,
    #[serde(default)]
    cells: std::collections::BTreeMap<String, StoredCell>,
    nuggets: Vec<StoredNugget>,
    #[serde(default)]
    signals: Vec<StoredSignal>,
}

#[derive(Serialize, Deserialize)]
struct StoredNugget {
    start: u64,
    end: u64,
    #[serde(default)]
    signals: Vec<StoredSignal>,
}

#[derive(Serialize, Deserialize)]
struct StoredSignal {
    kind: String,
    value: StoredValue,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "tag", content = "value", rename_all = "kebab-case")]
enum StoredValue {
    Float(f64),
    Int(i64),
    #[serde(rename = "string")]
    Text(String),
    #[serde(rename = "vecf32")]
    FloatVec(Vec<f32>),
    Bytes(bson::Binary),
    NuggetRef(u64),
    Opaque { tag: String, bytes: bson::Binary },
}

fn binary(bytes: Vec<u8>) -> bson::Binary {
    bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes }
}

impl From<&SignalValue> for StoredValue {
    fn from(value: &SignalValue) -> Self {
        match value {
            SignalValue::Float(v) => StoredValue::Float(*v),
            SignalValue::Int(v) => StoredValue::Int(*v),
            SignalValue::Text(v) => StoredValue::Text(v.clone()),
            SignalValue::FloatVec(v) => StoredValue::FloatVec(v.clone()),
            SignalValue::Bytes(v) => StoredValue::Bytes(binary(v.clone())),
            SignalValue::NuggetRef(v) => StoredValue::NuggetRef(*v as u64),
            SignalValue::Opaque { tag, bytes } => {
                StoredValue::Opaque { tag: tag.clone(), bytes: binary(bytes.clone()) }
            }
        }
    }
}

impl From<StoredValue> for SignalValue {
    fn from(value: StoredValue) -> Self {
        match value {
            StoredValue::Float(v) => SignalValue::Float(v),
            StoredValue::Int(v) => SignalValue::Int(v),
            StoredValue::Text(v) => SignalValue::Text(v),
            StoredValue::FloatVec(v) => SignalValue::FloatVec(v),
            StoredValue::Bytes(v) => SignalValue::Bytes(v.bytes),
            StoredValue::NuggetRef(v) => SignalValue::NuggetRef(v as usize),
            StoredValue::Opaque { tag, bytes } => {
                SignalValue::Opaque { tag, bytes: bytes.bytes }
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
enum StoredCell {
    Matched { nugget: u64 },
    Empty,
    Failed { reason: String },
}

impl From<&CellState> for StoredCell {
    fn from(state: &CellState) -> Self {
        match state {
            CellState::Matched(ix) => StoredCell::Matched { nugget: *ix as u64 },
            CellState::Empty => StoredCell::Empty,
            CellState::Failed(reason) => StoredCell::Failed { reason: reason.clone() },
        }
    }
}

impl From<StoredCell> for CellState {
    fn from(stored: StoredCell) -> Self {
        match stored {
            StoredCell::Matched { nugget } => CellState::Matched(nugget as usize),
            StoredCell::Empty => CellState::Empty,
            StoredCell::Failed { reason } => CellState::Failed(reason),
        }
    }
}
