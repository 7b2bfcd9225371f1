//! Minimal object-set computation for a pair of branch tips
//!
//! Determines exactly which commit/tree/blob objects must travel to the
//! deconfliction service for it to reconstruct and analyze the divergence
//! between two branches:
//! - the commits unique to either tip, plus their common ancestor
//! - the trees those commits reference
//! - every object that resolves differently at some path across those trees
//!
//! The computation is strictly sequential; each toolchain query blocks
//! until it completes.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::object::{ObjectId, ObjectKind, ObjectSet, TreeEntry};
use crate::toolchain::{Toolchain, ToolchainError};

/// Result type for divergence operations
pub type Result<T> = std::result::Result<T, DivergenceError>;

/// Errors from the object-set computation
#[derive(Debug, thiserror::Error)]
pub enum DivergenceError {
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error("changes involving submodules are not supported (at {path})")]
    SubmoduleDivergence { path: String },

    #[error("{main} and {topic} share no common history")]
    DisjointHistories { main: ObjectId, topic: ObjectId },

    #[error("no objects selected for transfer")]
    EmptyObjectSet,
}

/// Reduce a set of tips to their single common-ancestor commit.
///
/// Repeatedly replaces the candidate set with its merge bases until one
/// remains. Criss-cross histories may take several iterations; each round
/// draws from strictly earlier history, so the loop terminates. Returns
/// `None` when the histories are unrelated.
pub fn unique_ancestor(tc: &dyn Toolchain, tips: &[ObjectId]) -> Result<Option<ObjectId>> {
    let mut candidates = tips.to_vec();
    loop {
        let bases = tc.merge_bases(&candidates)?;
        match bases.len() {
            0 => return Ok(None),
            1 => return Ok(Some(bases[0])),
            _ => candidates = bases,
        }
    }
}

/// Contents observed at one path while walking tree listings.
struct PathState {
    kind: ObjectKind,
    id: ObjectId,
    varies: bool,
}

/// Objects that resolve differently at the same path across the given trees.
///
/// The first tree to mention a path sets the baseline. The first mismatch
/// marks the path varying and selects both sides; once a path varies, every
/// distinct object later seen there is selected too, since any version may
/// need to be compared against any other. A submodule reference on either
/// side of a mismatch aborts the whole computation.
pub fn varying_paths(tc: &dyn Toolchain, trees: &[ObjectId]) -> Result<ObjectSet> {
    let mut paths: HashMap<String, PathState> = HashMap::new();
    let mut varying = ObjectSet::new();

    for tree in trees {
        for entry in tc.list_tree(*tree)? {
            let TreeEntry { path, kind, id } = entry;
            match paths.entry(path) {
                Entry::Vacant(slot) => {
                    slot.insert(PathState {
                        kind,
                        id,
                        varies: false,
                    });
                }
                Entry::Occupied(mut slot) => {
                    let state = slot.get_mut();
                    if state.varies {
                        varying.insert(id);
                    } else if state.kind != kind || state.id != id {
                        if state.kind == ObjectKind::Submodule || kind == ObjectKind::Submodule {
                            return Err(DivergenceError::SubmoduleDivergence {
                                path: slot.key().clone(),
                            });
                        }
                        state.varies = true;
                        varying.insert(state.id);
                        varying.insert(id);
                    }
                    // Otherwise: same contents as the baseline.
                }
            }
        }
    }
    Ok(varying)
}

/// Assemble the transfer pack for the divergence between `main` and `topic`.
///
/// Runs the full pipeline: unique ancestor, commits unique to either tip
/// (base included), their trees resolved in one batched query, the varying
/// objects across those trees, all packed in a single toolchain invocation.
pub fn divergence_pack(tc: &dyn Toolchain, main: ObjectId, topic: ObjectId) -> Result<Vec<u8>> {
    let base = unique_ancestor(tc, &[main, topic])?
        .ok_or(DivergenceError::DisjointHistories { main, topic })?;
    let commits = tc.commits_between(base, &[main, topic])?;
    let trees = tc.trees_of(&commits)?;
    let varying = varying_paths(tc, &trees)?;
    tracing::debug!(
        commits = commits.len(),
        trees = trees.len(),
        varying = varying.len(),
        "collected divergence set"
    );

    let mut need = ObjectSet::new();
    need.extend(commits);
    need.extend(trees);
    need.extend(varying);
    if need.is_empty() {
        return Err(DivergenceError::EmptyObjectSet);
    }
    Ok(tc.pack_objects(need.ids())?)
}
