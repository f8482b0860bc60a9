//! Raw self-play episode arrays.
//!
//! Self-play dumps one tensor file per column under a shared prefix
//! (`<prefix>_boards.pt`, `<prefix>_scores.pt`, ...). The loader globs for
//! prefixes, keeps the most recent files and concatenates their columns
//! into one flat [`EpisodeSet`].

use std::path::{Path, PathBuf};

use tch::{Kind, Tensor};

use crate::{Result, TrainError};

/// Column-oriented step records over every loaded episode.
///
/// All columns are index-aligned over `len` steps. `episode` is
/// non-decreasing; steps sharing an id belong to one episode, in time
/// order.
pub struct EpisodeSet {
    /// Board states, row-major, `len · height · width` values
    pub boards: Vec<f32>,
    /// Cumulative score at each step
    pub score: Vec<f32>,
    /// Episode id per step, non-decreasing
    pub episode: Vec<i64>,
    /// Per-action child visit counts, `len · n_actions`
    pub visits: Vec<f32>,
    /// Per-action child value estimates, `len · n_actions`
    pub q_values: Vec<f32>,
    /// Externally estimated per-step value variance
    pub variance: Vec<f32>,
    /// Search policy distribution, `len · n_actions`
    pub policy: Vec<f32>,
    pub height: i64,
    pub width: i64,
    pub n_actions: i64,
}

impl EpisodeSet {
    /// Build a set from in-memory columns, checking index alignment.
    #[allow(clippy::too_many_arguments)]
    pub fn from_columns(
        boards: Vec<f32>,
        score: Vec<f32>,
        episode: Vec<i64>,
        visits: Vec<f32>,
        q_values: Vec<f32>,
        variance: Vec<f32>,
        policy: Vec<f32>,
        height: i64,
        width: i64,
        n_actions: i64,
    ) -> Result<Self> {
        let n = score.len();
        let cell = (height * width) as usize;
        let act = n_actions as usize;
        if boards.len() != n * cell {
            return Err(TrainError::Data(format!(
                "boards column holds {} values, expected {} ({} steps x {} cells)",
                boards.len(),
                n * cell,
                n,
                cell
            )));
        }
        for (name, len, per_step) in [
            ("episode", episode.len(), 1),
            ("visits", visits.len(), act),
            ("q_values", q_values.len(), act),
            ("variance", variance.len(), 1),
            ("policy", policy.len(), act),
        ] {
            if len != n * per_step {
                return Err(TrainError::Data(format!(
                    "column '{name}' holds {len} values, expected {}",
                    n * per_step
                )));
            }
        }
        if episode.windows(2).any(|w| w[0] > w[1]) {
            return Err(TrainError::Data(
                "episode ids must be non-decreasing".to_string(),
            ));
        }
        Ok(Self {
            boards,
            score,
            episode,
            visits,
            q_values,
            variance,
            policy,
            height,
            width,
            n_actions,
        })
    }

    /// Number of steps in the set.
    pub fn len(&self) -> usize {
        self.score.len()
    }

    pub fn is_empty(&self) -> bool {
        self.score.is_empty()
    }
}

/// Discover dump prefixes matching the glob patterns, most recent last.
pub fn discover_prefixes(patterns: &[String], last_nfiles: i64) -> Result<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        let full = format!("{pattern}_boards.pt");
        for entry in glob::glob(&full)
            .map_err(|e| TrainError::Config(format!("bad data pattern '{pattern}': {e}")))?
        {
            let path = entry.map_err(|e| TrainError::Io(e.into_error()))?;
            found.push(path);
        }
    }
    found.sort_by_key(|p| {
        p.metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });
    if last_nfiles > 0 && found.len() > last_nfiles as usize {
        found.drain(..found.len() - last_nfiles as usize);
    }
    // Strip the `_boards.pt` suffix back off to recover the prefix
    let prefixes = found
        .into_iter()
        .map(|p| {
            let s = p.to_string_lossy();
            PathBuf::from(s.trim_end_matches("_boards.pt"))
        })
        .collect();
    Ok(prefixes)
}

/// Load and concatenate every discovered dump.
///
/// Episode ids are offset per file so they stay non-decreasing across the
/// concatenation. An empty discovery result is an error: a training run
/// without data is a misconfiguration, not a no-op.
pub fn load_episode_sets(
    patterns: &[String],
    last_nfiles: i64,
    height: i64,
    width: i64,
    n_actions: i64,
) -> Result<EpisodeSet> {
    let prefixes = discover_prefixes(patterns, last_nfiles)?;
    if prefixes.is_empty() {
        return Err(TrainError::EmptyDataset);
    }

    let mut boards = Vec::new();
    let mut score = Vec::new();
    let mut episode: Vec<i64> = Vec::new();
    let mut visits = Vec::new();
    let mut q_values = Vec::new();
    let mut variance = Vec::new();
    let mut policy = Vec::new();

    for prefix in &prefixes {
        log::info!("📂 Loading self-play dump {}", prefix.display());
        let next_id = episode.last().map(|id| id + 1).unwrap_or(0);
        boards.extend(load_f32_column(prefix, "boards")?);
        score.extend(load_f32_column(prefix, "scores")?);
        let ids = load_i64_column(prefix, "episodes")?;
        episode.extend(ids.iter().map(|id| id + next_id));
        visits.extend(load_f32_column(prefix, "visits")?);
        q_values.extend(load_f32_column(prefix, "qvalues")?);
        variance.extend(load_f32_column(prefix, "variance")?);
        policy.extend(load_f32_column(prefix, "policy")?);
    }

    let set = EpisodeSet::from_columns(
        boards, score, episode, visits, q_values, variance, policy, height, width, n_actions,
    )?;
    log::info!(
        "✅ Loaded {} steps from {} dump(s)",
        set.len(),
        prefixes.len()
    );
    Ok(set)
}

fn load_tensor(prefix: &Path, column: &str) -> Result<Tensor> {
    let path = format!("{}_{column}.pt", prefix.display());
    Ok(Tensor::load(&path)?)
}

fn load_f32_column(prefix: &Path, column: &str) -> Result<Vec<f32>> {
    let t = load_tensor(prefix, column)?
        .to_kind(Kind::Float)
        .flatten(0, -1)
        .contiguous();
    Ok(Vec::<f32>::try_from(&t)?)
}

fn load_i64_column(prefix: &Path, column: &str) -> Result<Vec<i64>> {
    let t = load_tensor(prefix, column)?
        .to_kind(Kind::Int64)
        .flatten(0, -1)
        .contiguous();
    Ok(Vec::<i64>::try_from(&t)?)
}
