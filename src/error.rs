use thiserror::Error;

/// Conditions that abort a run outright. Everything else travels as plain
/// `anyhow` context.
#[derive(Error, Debug)]
pub enum LightconeError {
    #[error("incomplete merger tree at z={z:.3}: expected {expected} chunk files, found {found}")]
    IncompleteTree { z: f64, expected: usize, found: usize },

    #[error("chunk files of z={z:.3} are numbered {found:?}, expected 0..{expected}")]
    ChunkGap {
        z: f64,
        expected: usize,
        found: Vec<usize>,
    },

    #[error("chunk count mismatch: z={z_this:.3} has {n_this} chunks, z={z_other:.3} has {n_other}")]
    ChunkCountMismatch {
        z_this: f64,
        n_this: usize,
        z_other: f64,
        n_other: usize,
    },

    #[error("no progenitor epoch after z={z:.3}; lower the stopping redshift")]
    MissingProgenitorEpoch { z: f64 },

    #[error("recorded state is for z={recorded:.6}, but the run resumes at z={requested:.6}")]
    ResumeMismatch { recorded: f64, requested: f64 },

    #[error("no checkpoint for z={z:.3} origin {origin} chunk {chunk}; cannot resume")]
    MissingCheckpoint { z: f64, origin: usize, chunk: usize },

    #[error("all-progenitors policy needs per-halo progenitor lists")]
    MissingProgenitorLists,

    #[error("malformed chunk {chunk} at z={z:.3}: {reason}")]
    MalformedChunk { z: f64, chunk: usize, reason: String },
}
