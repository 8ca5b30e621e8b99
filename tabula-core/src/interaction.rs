//! Interaction protocol between the matching engine and the user.
//!
//! The feedback loop emits an [`InteractionRequest`] through an
//! [`InteractionCallback`] and blocks until the answer arrives. Requests
//! carry the document text, span offsets, and distances so a client can
//! render them without further round-trips.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One candidate nugget offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanCandidate {
    /// Index of the nugget in its document's nugget list.
    pub nugget_index: usize,
    /// Start offset of the span (inclusive).
    pub start: usize,
    /// End offset of the span (exclusive).
    pub end: usize,
    /// Current effective distance of the nugget to the attribute.
    pub distance: f64,
}

/// A request for user feedback, emitted by the feedback loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InteractionRequest {
    /// Ask whether the proposed nugget is the correct cell value.
    ConfirmProposal {
        /// Name of the attribute being matched.
        attribute: String,
        /// Index of the document in the base.
        document_index: usize,
        /// Name of the document.
        document_name: String,
        /// Full text of the document.
        document_text: String,
        /// The proposed span.
        proposal: SpanCandidate,
        /// 1-based number of this feedback round.
        round: usize,
    },
    /// Offer the document's best candidates and ask the user to pick.
    ChooseFromShortlist {
        /// Name of the attribute being matched.
        attribute: String,
        /// Index of the document in the base.
        document_index: usize,
        /// Name of the document.
        document_name: String,
        /// Full text of the document.
        document_text: String,
        /// Candidates ordered by ascending distance.
        candidates: Vec<SpanCandidate>,
        /// 1-based number of this feedback round.
        round: usize,
    },
    /// Ask the user to highlight the correct span directly.
    PickSpan {
        /// Name of the attribute being matched.
        attribute: String,
        /// Index of the document in the base.
        document_index: usize,
        /// Name of the document.
        document_name: String,
        /// Full text of the document.
        document_text: String,
    },
}

impl InteractionRequest {
    /// Index of the document the request is about.
    pub fn document_index(&self) -> usize {
        match self {
            InteractionRequest::ConfirmProposal { document_index, .. }
            | InteractionRequest::ChooseFromShortlist { document_index, .. }
            | InteractionRequest::PickSpan { document_index, .. } => *document_index,
        }
    }
}

/// The user's answer to an [`InteractionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchFeedback {
    /// The nugget at this index is the correct value for the document.
    Confirm {
        /// Index of the confirmed nugget in the document's nugget list.
        nugget_index: usize,
    },
    /// The nugget at this index is wrong for this document.
    Reject {
        /// Index of the rejected nugget in the document's nugget list.
        nugget_index: usize,
    },
    /// The correct value is a span not present among the candidates.
    CustomSpan {
        /// Start offset of the highlighted span (inclusive).
        start: usize,
        /// End offset of the highlighted span (exclusive).
        end: usize,
    },
    /// The document contains no value for this attribute.
    NoMatch,
    /// Stop interactive matching for this attribute.
    Stop,
}

/// Callback through which the engine asks the user for feedback.
///
/// `ask` may block the feedback loop for as long as the user takes; a client
/// that wants a deadline returns [`MatchFeedback::Stop`] when it expires.
#[async_trait]
pub trait InteractionCallback: Send + Sync {
    /// Present a request to the user and return their answer.
    async fn ask(&self, request: InteractionRequest) -> MatchFeedback;
}

/// Interaction callback for headless runs: always answers [`MatchFeedback::Stop`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInteraction;

#[async_trait]
impl InteractionCallback for NoInteraction {
    async fn ask(&self, _request: InteractionRequest) -> MatchFeedback {
        MatchFeedback::Stop
    }
}
