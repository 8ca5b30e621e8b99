//! The interactive feedback loop and the per-document cell decision.
//!
//! One feedback round asks the user about one document, integrates the
//! answer, and updates the confirmed sets and the distance threshold. The
//! loop walks an explicit state machine:
//!
//! ```text
//! Init -> Ranked -> Asking -> Updated -> (Ranked | Done)
//! ```
//!
//! Document selection front-loads confidence: among documents without a
//! decided cell, the one with the best (lowest-distance) proposal is asked
//! about first. A confirmation there tightens the confirmed-positive
//! neighborhood the most, and a rejection there is the strongest corrective
//! signal.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use tabula_core::data::{CellState, Document, DocumentBase};
use tabula_core::error::{CoreError, Result};
use tabula_core::interaction::{InteractionRequest, MatchFeedback, SpanCandidate};
use tabula_core::pipeline::StageContext;
use tabula_core::signals::{ids, SignalMap, SignalValue};
use tabula_core::statistics::Statistics;
use tabula_core::Nugget;

use crate::config::MatcherConfig;
use crate::distance::Distance;
use crate::embedding::{embed_with_retry, EmbeddingProvider};
use crate::threshold::ThresholdAdaptor;

/// States of the feedback loop for one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundState {
    /// The attribute has no ranking state yet.
    Init,
    /// Every cached distance is current and proposals are in place.
    Ranked,
    /// A request for the given document is out, awaiting the answer.
    Asking {
        /// Index of the document being asked about.
        document: usize,
    },
    /// An answer has been received and must be integrated.
    Updated {
        /// Index of the document the answer is about.
        document: usize,
        /// The user's answer.
        feedback: MatchFeedback,
    },
    /// Matching for this attribute has finished.
    Done,
}

/// Mutable matching state for the attribute currently being worked on.
struct ActiveMatch {
    attribute: String,
    /// Signal maps of the confirmed positive nuggets.
    positives: Vec<SignalMap>,
    /// Effective distances recorded for confirmed positives.
    positive_distances: Vec<f64>,
    /// Effective distances recorded for confirmed negatives.
    negative_distances: Vec<f64>,
    /// Rejected nugget indices per document; rejections bind only within
    /// their own document.
    rejected: HashMap<usize, HashSet<usize>>,
    /// Document that ran out of candidates and should be asked for a span.
    pending_pick: Option<usize>,
    /// Current distance threshold.
    tau: f64,
    /// Completed feedback rounds.
    rounds: usize,
}

impl ActiveMatch {
    fn new(attribute: String, tau: f64) -> Self {
        Self {
            attribute,
            positives: Vec::new(),
            positive_distances: Vec::new(),
            negative_distances: Vec::new(),
            rejected: HashMap::new(),
            pending_pick: None,
            tau,
            rounds: 0,
        }
    }

    fn banned(&self, document: usize) -> Option<&HashSet<usize>> {
        self.rejected.get(&document)
    }
}

/// The best candidate nugget of a document by cached distance.
///
/// Ties are broken by earlier span offset; nuggets in `banned` (rejected for
/// the active attribute) and nuggets without a cached distance are skipped.
pub(crate) fn best_candidate(
    document: &Document,
    banned: Option<&HashSet<usize>>,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (ix, nugget) in document.nuggets().iter().enumerate() {
        if banned.is_some_and(|b| b.contains(&ix)) {
            continue;
        }
        let Some(distance) = nugget.signals.float(ids::CACHED_DISTANCE) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((best_ix, best_distance)) => {
                distance < best_distance
                    || (distance == best_distance
                        && nugget.start() < document.nuggets()[best_ix].start())
            }
        };
        if better {
            best = Some((ix, distance));
        }
    }
    best
}

/// Recompute a document's proposal and store it under
/// `currently-highest-ranked`.
fn refresh_proposal(document: &mut Document, banned: Option<&HashSet<usize>>) {
    match best_candidate(document, banned) {
        Some((ix, _)) => {
            document.signals.set(ids::CURRENTLY_HIGHEST_RANKED, SignalValue::NuggetRef(ix));
        }
        None => {
            document.signals.remove(ids::CURRENTLY_HIGHEST_RANKED);
        }
    }
}

/// A document's current proposal and its distance, if any.
fn proposal(document: &Document) -> Option<(usize, f64)> {
    let ix = document.signals.nugget_ref(ids::CURRENTLY_HIGHEST_RANKED)?;
    let distance = document.nuggets().get(ix)?.signals.float(ids::CACHED_DISTANCE)?;
    Some((ix, distance))
}

/// Compute the label-based distances for one attribute and set every
/// document's initial proposal.
///
/// Documents that already carry a decided cell for the attribute are left
/// untouched. A document whose nuggets cannot be ranked (broken embedding)
/// has its cell set to [`CellState::Failed`] and the loop continues. A
/// document with no nuggets stays undecided: the feedback loop offers it to
/// the user for a hand-picked span once the ranked documents are dealt with,
/// and the finalizer empties it otherwise.
pub(crate) fn compute_initial_ranking(
    base: &mut DocumentBase,
    attribute_index: usize,
    distance: &dyn Distance,
    statistics: &mut Statistics,
) -> Result<()> {
    let attribute = base.attributes()[attribute_index].name().to_string();
    let attribute_signals = base.attributes()[attribute_index].signals.clone();

    let mut ranked = 0usize;
    for doc_ix in 0..base.documents().len() {
        if base.documents()[doc_ix].cell(&attribute).is_some() {
            statistics.incr("num_documents_already_decided");
            continue;
        }

        let document = &mut base.documents_mut()[doc_ix];
        if document.nuggets().is_empty() {
            statistics.incr("num_documents_with_no_nuggets");
            continue;
        }

        let mut failure: Option<String> = None;
        for nugget_ix in 0..document.nuggets().len() {
            let nugget = &document.nuggets()[nugget_ix];
            match distance.between(&nugget.signals, &attribute_signals) {
                Ok(d) => {
                    document.nuggets_mut()[nugget_ix]
                        .signals
                        .set(ids::CACHED_DISTANCE, SignalValue::Float(d));
                }
                Err(err) => {
                    failure = Some(err.to_string());
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            warn!(document = document.name(), %reason, "ranking failed, isolating document");
            document.signals.remove(ids::CURRENTLY_HIGHEST_RANKED);
            document.set_cell(attribute.clone(), CellState::Failed(reason));
            statistics.incr("num_documents_failed");
            continue;
        }

        refresh_proposal(document, None);
        ranked += 1;
    }

    statistics.record("num_documents_ranked", ranked);
    Ok(())
}

/// Fold a freshly confirmed positive into every cached distance and refresh
/// the proposals of undecided documents.
///
/// Cached distances only ever shrink here: the effective distance is the
/// minimum over the label distance and all confirmed positives, and the
/// existing cache already holds the minimum over the previous set.
fn fold_in_positive(
    base: &mut DocumentBase,
    state: &ActiveMatch,
    positive: &SignalMap,
    distance: &dyn Distance,
    statistics: &mut Statistics,
) {
    let attribute = state.attribute.clone();
    for doc_ix in 0..base.documents().len() {
        let decided = base.documents()[doc_ix].cell(&attribute).is_some();
        let document = &mut base.documents_mut()[doc_ix];

        let mut failure: Option<String> = None;
        for nugget_ix in 0..document.nuggets().len() {
            let nugget = &document.nuggets()[nugget_ix];
            let Some(cached) = nugget.signals.float(ids::CACHED_DISTANCE) else {
                continue;
            };
            match distance.between(&nugget.signals, positive) {
                Ok(d) if d < cached => {
                    document.nuggets_mut()[nugget_ix]
                        .signals
                        .set(ids::CACHED_DISTANCE, SignalValue::Float(d));
                }
                Ok(_) => {}
                Err(err) => {
                    failure = Some(err.to_string());
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            if !decided {
                warn!(document = document.name(), %reason, "re-ranking failed, isolating document");
                document.signals.remove(ids::CURRENTLY_HIGHEST_RANKED);
                document.set_cell(attribute.clone(), CellState::Failed(reason));
                statistics.incr("num_documents_failed");
            }
            continue;
        }

        if !decided {
            refresh_proposal(document, state.banned(doc_ix));
        }
    }
}

/// Select the document to ask about next: the best undecided proposal, or a
/// seeded-random undecided document on exploration rounds.
///
/// Undecided documents without any candidate (no nuggets, or everything
/// rejected) come last, as a span-picking request, once every ranked
/// document has been dealt with.
fn select_document(
    base: &DocumentBase,
    state: &ActiveMatch,
    config: &MatcherConfig,
    rng: &mut StdRng,
) -> Option<usize> {
    if let Some(doc_ix) = state.pending_pick {
        if base.documents()[doc_ix].cell(&state.attribute).is_none() {
            return Some(doc_ix);
        }
    }

    let undecided: Vec<usize> = base
        .documents()
        .iter()
        .enumerate()
        .filter(|(_, doc)| doc.cell(&state.attribute).is_none())
        .map(|(ix, _)| ix)
        .collect();

    let eligible: Vec<(usize, f64)> = undecided
        .iter()
        .filter_map(|&ix| proposal(&base.documents()[ix]).map(|(_, d)| (ix, d)))
        .collect();
    if eligible.is_empty() {
        // No ranked candidates left; offer the remaining documents for a
        // hand-picked span.
        return undecided.first().copied();
    }

    if config.explore_every > 0 && (state.rounds + 1) % config.explore_every == 0 {
        let pick = rng.gen_range(0..eligible.len());
        return Some(eligible[pick].0);
    }

    eligible
        .iter()
        .copied()
        .reduce(|best, candidate| if candidate.1 < best.1 { candidate } else { best })
        .map(|(ix, _)| ix)
}

/// Build the interaction request for the selected document.
fn build_request(
    base: &DocumentBase,
    state: &ActiveMatch,
    config: &MatcherConfig,
    doc_ix: usize,
) -> InteractionRequest {
    let document = &base.documents()[doc_ix];
    let attribute = state.attribute.clone();

    let Some((proposal_ix, proposal_distance)) = proposal(document) else {
        return InteractionRequest::PickSpan {
            attribute,
            document_index: doc_ix,
            document_name: document.name().to_string(),
            document_text: document.text().to_string(),
        };
    };

    if config.shortlist_len > 1 {
        let banned = state.banned(doc_ix);
        let mut candidates: Vec<SpanCandidate> = document
            .nuggets()
            .iter()
            .enumerate()
            .filter(|(ix, _)| !banned.is_some_and(|b| b.contains(ix)))
            .filter_map(|(ix, nugget)| {
                nugget.signals.float(ids::CACHED_DISTANCE).map(|distance| SpanCandidate {
                    nugget_index: ix,
                    start: nugget.start(),
                    end: nugget.end(),
                    distance,
                })
            })
            .collect();
        candidates
            .sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.start.cmp(&b.start)));
        candidates.truncate(config.shortlist_len);
        return InteractionRequest::ChooseFromShortlist {
            attribute,
            document_index: doc_ix,
            document_name: document.name().to_string(),
            document_text: document.text().to_string(),
            candidates,
            round: state.rounds + 1,
        };
    }

    let nugget = &document.nuggets()[proposal_ix];
    InteractionRequest::ConfirmProposal {
        attribute,
        document_index: doc_ix,
        document_name: document.name().to_string(),
        document_text: document.text().to_string(),
        proposal: SpanCandidate {
            nugget_index: proposal_ix,
            start: nugget.start(),
            end: nugget.end(),
            distance: proposal_distance,
        },
        round: state.rounds + 1,
    }
}

/// Record a confirmed positive: decide the cell, fold the positive into the
/// cached distances, and adapt the threshold.
fn integrate_confirm(
    base: &mut DocumentBase,
    state: &mut ActiveMatch,
    doc_ix: usize,
    nugget_ix: usize,
    distance: &dyn Distance,
    adaptor: &ThresholdAdaptor,
    config: &MatcherConfig,
    statistics: &mut Statistics,
) {
    let attribute = state.attribute.clone();
    let positive = base.documents()[doc_ix].nuggets()[nugget_ix].signals.clone();
    base.documents_mut()[doc_ix].set_cell(attribute, CellState::Matched(nugget_ix));
    statistics.incr("num_confirmed_match");

    fold_in_positive(base, state, &positive, distance, statistics);
    state.positives.push(positive);

    // The recorded positive distance is the nugget's effective distance
    // after the fold, which includes its zero distance to itself.
    let recorded = base.documents()[doc_ix].nuggets()[nugget_ix]
        .signals
        .float(ids::CACHED_DISTANCE)
        .unwrap_or(0.0);
    state.positive_distances.push(recorded);

    if config.adjust_threshold {
        state.tau = adaptor.recompute(&state.positive_distances, &state.negative_distances);
        statistics.push("max_distances", state.tau);
    }
}

/// Record a rejection: ban the nugget in its document, re-rank that
/// document, and adapt the threshold.
fn integrate_reject(
    base: &mut DocumentBase,
    state: &mut ActiveMatch,
    doc_ix: usize,
    nugget_ix: usize,
    adaptor: &ThresholdAdaptor,
    config: &MatcherConfig,
    statistics: &mut Statistics,
) {
    let document = &mut base.documents_mut()[doc_ix];
    if let Some(rejected_distance) =
        document.nuggets().get(nugget_ix).and_then(|n| n.signals.float(ids::CACHED_DISTANCE))
    {
        state.negative_distances.push(rejected_distance);
    }
    state.rejected.entry(doc_ix).or_default().insert(nugget_ix);
    statistics.incr("num_rejected");

    refresh_proposal(document, state.rejected.get(&doc_ix));
    if proposal(&base.documents()[doc_ix]).is_none() {
        // Every candidate is gone; ask the user for a span next round.
        state.pending_pick = Some(doc_ix);
    }

    if config.adjust_threshold {
        state.tau = adaptor.recompute(&state.positive_distances, &state.negative_distances);
        statistics.push("max_distances", state.tau);
    }
}

/// Integrate a custom span: synthesize (or find) the nugget, embed it on
/// demand, and treat it as a confirmed positive.
#[allow(clippy::too_many_arguments)]
async fn integrate_custom_span(
    base: &mut DocumentBase,
    state: &mut ActiveMatch,
    doc_ix: usize,
    start: usize,
    end: usize,
    distance: &dyn Distance,
    embedder: &dyn EmbeddingProvider,
    adaptor: &ThresholdAdaptor,
    config: &MatcherConfig,
    statistics: &mut Statistics,
) -> Result<()> {
    let document = &base.documents()[doc_ix];
    let text = document.text();
    let valid = start < end
        && end <= text.len()
        && text.is_char_boundary(start)
        && text.is_char_boundary(end);
    if !valid {
        warn!(document = document.name(), start, end, "ignoring invalid custom span");
        statistics.incr("num_invalid_custom_spans");
        return Ok(());
    }

    // A span the extractors already produced is confirmed in place.
    if let Some(existing) = document
        .nuggets()
        .iter()
        .position(|n| n.start() == start && n.end() == end)
    {
        statistics.incr("num_custom_match");
        integrate_confirm(base, state, doc_ix, existing, distance, adaptor, config, statistics);
        return Ok(());
    }

    let span_text = text[start..end].to_string();
    let embedding = embed_with_retry(embedder, &[span_text.as_str()])
        .await
        .map_err(CoreError::from)?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::EmbeddingFailure {
            cause: "provider returned no embedding for the custom span".into(),
        })?;

    let mut nugget = Nugget::new(doc_ix, start, end);
    nugget.signals.set(ids::TEXT_EMBEDDING, SignalValue::FloatVec(embedding));
    nugget.signals.set(ids::PROVENANCE, SignalValue::Text("user".into()));
    nugget.signals.set(ids::CACHED_DISTANCE, SignalValue::Float(0.0));
    let nugget_ix = base.documents_mut()[doc_ix].push_nugget(nugget);
    info!(document = base.documents()[doc_ix].name(), start, end, "synthesized custom nugget");

    statistics.incr("num_custom_match");
    integrate_confirm(base, state, doc_ix, nugget_ix, distance, adaptor, config, statistics);
    Ok(())
}

/// Run the feedback loop for one attribute.
///
/// Requires the initial ranking to be in place. On completion (including a
/// stop or an exhausted budget) the final threshold is written to the
/// attribute's `max-distance` signal for the finalizer.
///
/// # Errors
///
/// Returns [`CoreError::UserCancelled`] when the cancel token fires between
/// rounds or while a request is outstanding (the pending answer is
/// discarded), and [`CoreError::EmbeddingFailure`] if embedding a custom
/// span fails after the permitted retry.
pub(crate) async fn run_feedback_loop(
    base: &mut DocumentBase,
    attribute_index: usize,
    distance: &dyn Distance,
    embedder: &dyn EmbeddingProvider,
    config: &MatcherConfig,
    ctx: &StageContext,
    statistics: &mut Statistics,
) -> Result<()> {
    let attribute = base.attributes()[attribute_index].name().to_string();
    let adaptor = ThresholdAdaptor::new(config.default_max_distance);
    let mut state = ActiveMatch::new(attribute.clone(), adaptor.default_threshold());
    let mut rng = StdRng::seed_from_u64(
        ctx.seed ^ (attribute_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
    );
    statistics.push("max_distances", state.tau);

    let mut machine = RoundState::Init;
    loop {
        if ctx.cancel.is_cancelled() {
            statistics.record("cancelled", true);
            return Err(CoreError::UserCancelled);
        }

        machine = match machine {
            RoundState::Init => RoundState::Ranked,

            RoundState::Ranked => {
                if state.rounds >= config.max_feedback {
                    statistics.record("stopped_by_budget", true);
                    RoundState::Done
                } else {
                    match select_document(base, &state, config, &mut rng) {
                        Some(document) => RoundState::Asking { document },
                        None => RoundState::Done,
                    }
                }
            }

            RoundState::Asking { document } => {
                let request = build_request(base, &state, config, document);
                ctx.status.emit(
                    "interactive-feedback-loop",
                    None,
                    &format!(
                        "round {}: asking about document '{}'",
                        state.rounds + 1,
                        base.documents()[document].name()
                    ),
                );
                let feedback = ctx.interaction.ask(request).await;
                if ctx.cancel.is_cancelled() {
                    // Honor the cancellation by discarding the answer.
                    statistics.record("cancelled", true);
                    return Err(CoreError::UserCancelled);
                }
                RoundState::Updated { document, feedback }
            }

            RoundState::Updated { document, feedback } => {
                state.rounds += 1;
                statistics.incr("num_feedback");
                if state.pending_pick == Some(document) {
                    state.pending_pick = None;
                }

                let nugget_count = base.documents()[document].nuggets().len();
                match feedback {
                    MatchFeedback::Confirm { nugget_index } if nugget_index < nugget_count => {
                        integrate_confirm(
                            base,
                            &mut state,
                            document,
                            nugget_index,
                            distance,
                            &adaptor,
                            config,
                            statistics,
                        );
                        RoundState::Ranked
                    }
                    MatchFeedback::Reject { nugget_index } if nugget_index < nugget_count => {
                        integrate_reject(
                            base,
                            &mut state,
                            document,
                            nugget_index,
                            &adaptor,
                            config,
                            statistics,
                        );
                        RoundState::Ranked
                    }
                    MatchFeedback::Confirm { nugget_index }
                    | MatchFeedback::Reject { nugget_index } => {
                        warn!(document, nugget_index, "answer names an unknown nugget, ignoring");
                        statistics.incr("num_invalid_answers");
                        RoundState::Ranked
                    }
                    MatchFeedback::CustomSpan { start, end } => {
                        integrate_custom_span(
                            base,
                            &mut state,
                            document,
                            start,
                            end,
                            distance,
                            embedder,
                            &adaptor,
                            config,
                            statistics,
                        )
                        .await?;
                        RoundState::Ranked
                    }
                    MatchFeedback::NoMatch => {
                        base.documents_mut()[document]
                            .set_cell(attribute.clone(), CellState::Empty);
                        statistics.incr("num_no_match_in_document");
                        RoundState::Ranked
                    }
                    MatchFeedback::Stop => {
                        statistics.record("stopped_by_user", true);
                        RoundState::Done
                    }
                }
            }

            RoundState::Done => {
                base.attributes_mut()[attribute_index]
                    .signals
                    .set(ids::MAX_DISTANCE, SignalValue::Float(state.tau));
                statistics.record("num_rounds", state.rounds);
                statistics.record("final_max_distance", state.tau);
                info!(
                    attribute = %attribute,
                    rounds = state.rounds,
                    tau = state.tau,
                    "feedback loop finished"
                );
                return Ok(());
            }
        };
    }
}

/// Decide every remaining cell for one attribute by applying the threshold
/// to the current proposals.
pub(crate) fn finalize_cells(
    base: &mut DocumentBase,
    attribute_index: usize,
    statistics: &mut Statistics,
) -> Result<()> {
    let attribute = base.attributes()[attribute_index].name().to_string();
    let tau = base.attributes()[attribute_index]
        .signals
        .float(ids::MAX_DISTANCE)
        .ok_or_else(|| CoreError::MissingSignal {
            entity: format!("attribute '{attribute}'"),
            signal: ids::MAX_DISTANCE.into(),
            stage: "finalize-cells".into(),
        })?;

    for doc_ix in 0..base.documents().len() {
        if base.documents()[doc_ix].cell(&attribute).is_some() {
            continue;
        }
        let document = &mut base.documents_mut()[doc_ix];
        match proposal(document) {
            Some((nugget_ix, distance)) if distance <= tau => {
                document.set_cell(attribute.clone(), CellState::Matched(nugget_ix));
                statistics.incr("num_guessed_match");
            }
            _ => {
                document.set_cell(attribute.clone(), CellState::Empty);
                statistics.incr("num_blocked_by_max_distance");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_distances(distances: &[(usize, usize, f64)]) -> Document {
        let mut doc = Document::new("doc", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        for (start, end, d) in distances {
            let mut nugget = Nugget::new(0, *start, *end);
            nugget.signals.set(ids::CACHED_DISTANCE, SignalValue::Float(*d));
            doc.push_nugget(nugget);
        }
        doc
    }

    #[test]
    fn best_candidate_prefers_lower_distance() {
        let doc = doc_with_distances(&[(0, 4, 0.8), (4, 8, 0.2), (8, 12, 0.5)]);
        assert_eq!(best_candidate(&doc, None), Some((1, 0.2)));
    }

    #[test]
    fn best_candidate_breaks_ties_by_offset() {
        let doc = doc_with_distances(&[(10, 14, 0.4), (2, 6, 0.4)]);
        assert_eq!(best_candidate(&doc, None), Some((1, 0.4)));
    }

    #[test]
    fn best_candidate_skips_banned_nuggets() {
        let doc = doc_with_distances(&[(0, 4, 0.1), (4, 8, 0.3)]);
        let banned: HashSet<usize> = [0].into_iter().collect();
        assert_eq!(best_candidate(&doc, Some(&banned)), Some((1, 0.3)));
        let banned: HashSet<usize> = [0, 1].into_iter().collect();
        assert_eq!(best_candidate(&doc, Some(&banned)), None);
    }
}
