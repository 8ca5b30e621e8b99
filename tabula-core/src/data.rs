//! Data types for documents, nuggets, attributes, and the document base.
//!
//! A [`DocumentBase`] owns an ordered list of [`Attribute`]s (the target
//! table columns) and an ordered list of [`Document`]s. Each document owns
//! the nuggets extracted from its text; a [`Nugget`] stores only the span
//! offsets and refers back to its document by index, never by a cyclic
//! owning pointer.

use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::signals::{self, SignalMap};

/// A candidate cell value: a span of text inside one document.
///
/// The nugget does not store the span text itself; it is derived from the
/// owning document via [`Nugget::text`]. Two nuggets with the same document
/// and offsets denote the same span regardless of their signals.
#[derive(Debug, Clone, PartialEq)]
pub struct Nugget {
    document_index: usize,
    start: usize,
    end: usize,
    /// Signals attached to this nugget (embeddings, caches, provenance).
    pub signals: SignalMap,
}

impl Nugget {
    /// Create a nugget for the span `[start, end)` of the document at
    /// `document_index` in its base.
    pub fn new(document_index: usize, start: usize, end: usize) -> Self {
        Self { document_index, start, end, signals: SignalMap::new() }
    }

    /// Index of the owning document within its base.
    pub fn document_index(&self) -> usize {
        self.document_index
    }

    /// Index of the first character of the span (inclusive).
    pub fn start(&self) -> usize {
        self.start
    }

    /// Index of the first character after the span (exclusive).
    pub fn end(&self) -> usize {
        self.end
    }

    /// The span text, sliced from the owning document.
    pub fn text<'a>(&self, document: &'a Document) -> &'a str {
        &document.text()[self.start..self.end]
    }

    /// Whether this nugget covers the same span as another.
    ///
    /// This is the deduplication equality: signals are ignored.
    pub fn same_span(&self, other: &Nugget) -> bool {
        self.document_index == other.document_index
            && self.start == other.start
            && self.end == other.end
    }
}

/// The decided value of one table cell (one document, one attribute).
#[derive(Debug, Clone, PartialEq)]
pub enum CellState {
    /// The cell is populated by the nugget at this index in the document's
    /// nugget list.
    Matched(usize),
    /// The cell is empty: the user confirmed there is no match, the document
    /// has no candidates, or every candidate sits above the threshold.
    Empty,
    /// Ranking this document failed; the failure was isolated here so the
    /// rest of the column could proceed.
    Failed(String),
}

/// A textual document and the nuggets derived from it.
///
/// The document owns its text and its nugget list. Decided cells are stored
/// per attribute name in [`Document::cells`]; this is the persisted record
/// of confirmed (and guessed) matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    name: String,
    text: String,
    nuggets: Vec<Nugget>,
    cells: BTreeMap<String, CellState>,
    /// Signals attached to this document.
    pub signals: SignalMap,
}

impl Document {
    /// Create a document with no nuggets and no decided cells.
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            nuggets: Vec::new(),
            cells: BTreeMap::new(),
            signals: SignalMap::new(),
        }
    }

    /// Name of the document (unique within its base).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full text of the document.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Nuggets extracted from this document, in extraction order.
    pub fn nuggets(&self) -> &[Nugget] {
        &self.nuggets
    }

    /// Mutable access to the nugget list.
    pub fn nuggets_mut(&mut self) -> &mut Vec<Nugget> {
        &mut self.nuggets
    }

    /// Append a nugget, returning its index in the nugget list.
    pub fn push_nugget(&mut self, nugget: Nugget) -> usize {
        self.nuggets.push(nugget);
        self.nuggets.len() - 1
    }

    /// The decided cell for an attribute, if a decision has been made.
    pub fn cell(&self, attribute: &str) -> Option<&CellState> {
        self.cells.get(attribute)
    }

    /// Record the decided cell for an attribute.
    pub fn set_cell(&mut self, attribute: impl Into<String>, state: CellState) {
        self.cells.insert(attribute.into(), state);
    }

    /// All decided cells, keyed by attribute name.
    pub fn cells(&self) -> &BTreeMap<String, CellState> {
        &self.cells
    }
}

/// One target table column.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    name: String,
    /// Signals attached to this attribute (label, label embedding, caches).
    pub signals: SignalMap,
}

impl Attribute {
    /// Create an attribute with the given column name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), signals: SignalMap::new() }
    }

    /// Name of the attribute (unique within its base).
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The produced table: one row per document, one column per attribute.
///
/// Cells hold the matched span text; `None` marks an empty or failed cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Column names in attribute registration order.
    pub attributes: Vec<String>,
    /// One row per document, in document order.
    pub rows: Vec<TableRow>,
}

/// One row of a [`Table`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    /// Name of the document the row was extracted from.
    pub document: String,
    /// Cell texts aligned with [`Table::attributes`].
    pub cells: Vec<Option<String>>,
}

/// A collection of documents and attributes: the unit of storage and the
/// unit one matching engine acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentBase {
    documents: Vec<Document>,
    attributes: Vec<Attribute>,
}

impl DocumentBase {
    /// Create a document base and validate its consistency.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConsistencyViolation`] if names collide, a
    /// nugget's offsets are invalid, or any structural invariant fails.
    pub fn new(documents: Vec<Document>, attributes: Vec<Attribute>) -> Result<Self> {
        let base = Self { documents, attributes };
        base.validate()?;
        Ok(base)
    }

    /// Documents of the base, in registration order.
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Mutable access to the documents.
    pub fn documents_mut(&mut self) -> &mut [Document] {
        &mut self.documents
    }

    /// Attributes of the base, in registration order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Mutable access to the attributes.
    pub fn attributes_mut(&mut self) -> &mut [Attribute] {
        &mut self.attributes
    }

    /// Register a new attribute.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConsistencyViolation`] if the name is already
    /// taken.
    pub fn add_attribute(&mut self, attribute: Attribute) -> Result<()> {
        if self.attributes.iter().any(|a| a.name() == attribute.name()) {
            return Err(CoreError::ConsistencyViolation(format!(
                "attribute name '{}' is not unique",
                attribute.name()
            )));
        }
        self.attributes.push(attribute);
        Ok(())
    }

    /// Iterate over every nugget in the base together with its document index.
    pub fn nuggets(&self) -> impl Iterator<Item = (usize, &Nugget)> {
        self.documents
            .iter()
            .enumerate()
            .flat_map(|(ix, doc)| doc.nuggets().iter().map(move |n| (ix, n)))
    }

    /// Total number of nuggets across all documents.
    pub fn nugget_count(&self) -> usize {
        self.documents.iter().map(|d| d.nuggets().len()).sum()
    }

    /// Build the table representation of the decided cells.
    pub fn to_table(&self) -> Table {
        let attributes: Vec<String> =
            self.attributes.iter().map(|a| a.name().to_string()).collect();
        let rows = self
            .documents
            .iter()
            .map(|doc| TableRow {
                document: doc.name().to_string(),
                cells: attributes
                    .iter()
                    .map(|attr| match doc.cell(attr) {
                        Some(CellState::Matched(ix)) => {
                            doc.nuggets().get(*ix).map(|n| n.text(doc).to_string())
                        }
                        _ => None,
                    })
                    .collect(),
            })
            .collect();
        Table { attributes, rows }
    }

    /// Validate every structural invariant of the base.
    ///
    /// Checked invariants: unique document and attribute names; every
    /// nugget's back-reference points at its owning document; span offsets
    /// within bounds and on character boundaries; decided cells refer to
    /// registered attributes and existing nuggets; every signal payload
    /// matches the kind declared for its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConsistencyViolation`] naming the first violated
    /// invariant.
    pub fn validate(&self) -> Result<()> {
        let mut doc_names = std::collections::HashSet::new();
        for doc in &self.documents {
            if !doc_names.insert(doc.name()) {
                return Err(CoreError::ConsistencyViolation(format!(
                    "document name '{}' is not unique",
                    doc.name()
                )));
            }
        }

        let mut attr_names = std::collections::HashSet::new();
        for attr in &self.attributes {
            if !attr_names.insert(attr.name()) {
                return Err(CoreError::ConsistencyViolation(format!(
                    "attribute name '{}' is not unique",
                    attr.name()
                )));
            }
        }

        for (doc_ix, doc) in self.documents.iter().enumerate() {
            for nugget in doc.nuggets() {
                if nugget.document_index() != doc_ix {
                    return Err(CoreError::ConsistencyViolation(format!(
                        "nugget in document '{}' refers to document index {}",
                        doc.name(),
                        nugget.document_index()
                    )));
                }
                let (start, end) = (nugget.start(), nugget.end());
                if start >= end || end > doc.text().len() {
                    return Err(CoreError::ConsistencyViolation(format!(
                        "nugget span [{start}, {end}) is out of bounds in document '{}'",
                        doc.name()
                    )));
                }
                if !doc.text().is_char_boundary(start) || !doc.text().is_char_boundary(end) {
                    return Err(CoreError::ConsistencyViolation(format!(
                        "nugget span [{start}, {end}) splits a character in document '{}'",
                        doc.name()
                    )));
                }
            }

            for (attr, state) in doc.cells() {
                if !attr_names.contains(attr.as_str()) {
                    return Err(CoreError::ConsistencyViolation(format!(
                        "document '{}' has a cell for unknown attribute '{attr}'",
                        doc.name()
                    )));
                }
                if let CellState::Matched(ix) = state {
                    if *ix >= doc.nuggets().len() {
                        return Err(CoreError::ConsistencyViolation(format!(
                            "cell for '{attr}' in document '{}' refers to nugget {ix} of {}",
                            doc.name(),
                            doc.nuggets().len()
                        )));
                    }
                }
            }

            check_signal_kinds(&doc.signals, &format!("document '{}'", doc.name()))?;
            for nugget in doc.nuggets() {
                check_signal_kinds(
                    &nugget.signals,
                    &format!("nugget [{}, {}) in document '{}'", nugget.start(), nugget.end(), doc.name()),
                )?;
            }
        }

        for attr in &self.attributes {
            check_signal_kinds(&attr.signals, &format!("attribute '{}'", attr.name()))?;
        }

        Ok(())
    }
}

/// Verify that every signal on an entity matches its declared payload kind.
fn check_signal_kinds(map: &SignalMap, entity: &str) -> Result<()> {
    for (id, value) in map.iter() {
        if let Some(expected) = signals::expected_tag(id) {
            if value.tag() != expected {
                return Err(CoreError::ConsistencyViolation(format!(
                    "signal '{id}' on {entity} has kind {:?}, expected {:?}",
                    value.tag(),
                    expected
                )));
            }
        }
    }
    Ok(())
}
