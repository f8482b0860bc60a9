//! Ensemble checkpointing in safetensors format.
//!
//! A single file holds every member's parameters plus the second-moment
//! trackers and Fisher estimates, with run metadata (cycle, normalizer)
//! carried in the safetensors header. The format is portable across
//! libtorch versions, unlike tch's native serialization.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use safetensors::serialize_to_file;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::config::TrainerConfig;
use crate::neural::ensemble::Ensemble;
use crate::training::ewc::{EwcRegularizer, SecondMomentTracker};
use crate::training::normalization::TargetNormalizer;
use crate::{Result, TrainError};

pub const CHECKPOINT_FILE: &str = "ensemble_checkpoint.safetensors";

const META_KEY: &str = "trainer_meta";

/// Run metadata stored alongside the tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub cycle: i64,
    pub n_members: usize,
    pub normalizer: Option<TargetNormalizer>,
    pub library_version: String,
    /// Echo of the configuration that produced this checkpoint, for
    /// post-hoc inspection only; loading never applies it.
    pub config: Option<TrainerConfig>,
}

/// Result of a checkpoint load attempt.
#[derive(Debug)]
pub enum Loaded {
    /// No file at the path; the caller keeps its fresh initialization
    Fresh,
    Restored(CheckpointMeta),
}

/// Write the full trainer state to `path` atomically (temp file + rename).
pub fn save(
    path: &Path,
    ensemble: &Ensemble,
    trackers: &[SecondMomentTracker],
    ewc: &EwcRegularizer,
    meta: &CheckpointMeta,
) -> Result<()> {
    let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    for m in 0..ensemble.len() {
        for (name, tensor) in ensemble.var_store(m).variables() {
            entries.push(entry(format!("member{m}/{name}"), &tensor)?);
        }
        for (name, tensor) in trackers[m].tensors() {
            entries.push(entry(format!("moments{m}/{name}"), tensor)?);
        }
        if let Some(fisher) = ewc.fisher_tensors(m) {
            for (name, tensor) in fisher {
                entries.push(entry(format!("fisher{m}/{name}"), tensor)?);
            }
        }
    }

    let views: HashMap<String, TensorView<'_>> = entries
        .iter()
        .map(|(name, shape, data)| {
            TensorView::new(Dtype::F32, shape.clone(), data).map(|v| (name.clone(), v))
        })
        .collect::<std::result::Result<_, _>>()?;

    let mut header = HashMap::new();
    header.insert(META_KEY.to_string(), serde_json::to_string(meta)?);

    let tmp = path.with_extension("safetensors.tmp");
    serialize_to_file(views, &Some(header), &tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Restore trainer state from `path`.
///
/// A missing file is not an error: cycle 0 has nothing to restore, so the
/// freshly initialized state stands and `Loaded::Fresh` is returned.
pub fn load(
    path: &Path,
    ensemble: &mut Ensemble,
    trackers: &mut [SecondMomentTracker],
    ewc: &mut EwcRegularizer,
) -> Result<Loaded> {
    if !path.exists() {
        log::info!("No checkpoint at {}, starting fresh", path.display());
        return Ok(Loaded::Fresh);
    }

    let mut buffer = Vec::new();
    File::open(path)?.read_to_end(&mut buffer)?;
    let meta = parse_meta(&buffer)?;
    if meta.n_members != ensemble.len() {
        return Err(TrainError::Config(format!(
            "checkpoint has {} members, configuration expects {}",
            meta.n_members,
            ensemble.len()
        )));
    }

    let tensors = SafeTensors::deserialize(&buffer)?;
    for m in 0..ensemble.len() {
        let vs = ensemble.var_store_mut(m);
        for (name, mut var) in vs.variables() {
            match tensors.tensor(&format!("member{m}/{name}")) {
                Ok(view) => {
                    let loaded = view_to_tensor(&view)?;
                    tch::no_grad(|| var.copy_(&loaded));
                }
                Err(_) => log::warn!("Checkpoint missing tensor member{m}/{name}"),
            }
        }

        trackers[m].restore(collect_group(&tensors, &format!("moments{m}/"))?);

        let fisher = collect_group(&tensors, &format!("fisher{m}/"))?;
        if !fisher.is_empty() {
            // The snapshot is the just-restored parameter set: the saved
            // run's drift reference was its own end-of-cycle state.
            ewc.install(m, fisher, ensemble.var_store(m));
        }
    }

    log::info!(
        "📦 Restored checkpoint from cycle {} ({} members)",
        meta.cycle,
        meta.n_members
    );
    Ok(Loaded::Restored(meta))
}

fn parse_meta(buffer: &[u8]) -> Result<CheckpointMeta> {
    let (_, header) = SafeTensors::read_metadata(buffer)?;
    let raw = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(META_KEY))
        .ok_or_else(|| TrainError::Config("checkpoint header missing metadata".into()))?;
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn entry(name: String, tensor: &Tensor) -> Result<(String, Vec<usize>, Vec<u8>)> {
    let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
    let flat = tensor
        .to_device(tch::Device::Cpu)
        .flatten(0, -1)
        .contiguous();
    let data: Vec<f32> = Vec::<f32>::try_from(&flat)?;
    let bytes: Vec<u8> = data.iter().flat_map(|x| x.to_le_bytes()).collect();
    Ok((name, shape, bytes))
}

fn view_to_tensor(view: &TensorView) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
    let floats: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Tensor::from_slice(&floats).reshape(&shape))
}

fn collect_group(tensors: &SafeTensors, prefix: &str) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::new();
    for (name, view) in tensors.tensors() {
        if let Some(stripped) = name.strip_prefix(prefix) {
            out.insert(stripped.to_string(), view_to_tensor(&view)?);
        }
    }
    Ok(out)
}
