//! Portable model export.
//!
//! Writes the averaged-ensemble weights as safetensors together with a JSON
//! manifest recording a reference forward pass (dummy input shape plus the
//! value/variance the ensemble produced for it), so a downstream converter
//! can verify numerical parity. An external converter command can be chained
//! on; its exit status is checked and surfaced rather than ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use safetensors::serialize_to_file;
use safetensors::tensor::{Dtype, TensorView};
use serde::Serialize;
use tch::{Device, Kind, Tensor};

use crate::checkpoint::entry;
use crate::neural::ensemble::Ensemble;
use crate::training::normalization::TargetNormalizer;
use crate::{Result, TrainError};

pub const WEIGHTS_FILE: &str = "ensemble_export.safetensors";
pub const MANIFEST_FILE: &str = "ensemble_export.json";

#[derive(Debug, Serialize)]
struct Manifest {
    library_version: String,
    n_members: usize,
    input_shape: Vec<i64>,
    reference_value: f64,
    reference_variance: f64,
    normalizer: Option<TargetNormalizer>,
}

/// Paths produced by a successful export.
#[derive(Debug)]
pub struct PortableArtifact {
    pub weights: PathBuf,
    pub manifest: PathBuf,
}

pub struct PortableExporter {
    export_dir: PathBuf,
    /// Optional external conversion command; `{}` placeholders are replaced
    /// with the weights path
    converter: Option<Vec<String>>,
}

impl PortableExporter {
    pub fn new(export_dir: impl Into<PathBuf>, converter: Option<Vec<String>>) -> Self {
        Self {
            export_dir: export_dir.into(),
            converter,
        }
    }

    pub fn export(
        &self,
        ensemble: &Ensemble,
        input_shape: (i64, i64),
        normalizer: Option<&TargetNormalizer>,
    ) -> Result<PortableArtifact> {
        std::fs::create_dir_all(&self.export_dir)?;
        let weights = self.export_dir.join(WEIGHTS_FILE);
        let manifest_path = self.export_dir.join(MANIFEST_FILE);

        let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
        for m in 0..ensemble.len() {
            for (name, tensor) in ensemble.var_store(m).variables() {
                entries.push(entry(format!("member{m}/{name}"), &tensor)?);
            }
        }
        let views: HashMap<String, TensorView<'_>> = entries
            .iter()
            .map(|(name, shape, data)| {
                TensorView::new(Dtype::F32, shape.clone(), data).map(|v| (name.clone(), v))
            })
            .collect::<std::result::Result<_, _>>()?;
        serialize_to_file(views, &None, &weights)?;

        let (h, w) = input_shape;
        let dummy = Tensor::zeros([1, 1, h, w], (Kind::Float, Device::Cpu));
        let out = tch::no_grad(|| ensemble.forward_eval(&dummy));
        let manifest = Manifest {
            library_version: crate::VERSION.to_string(),
            n_members: ensemble.len(),
            input_shape: vec![1, 1, h, w],
            reference_value: out.value.double_value(&[0, 0]),
            reference_variance: out.variance.double_value(&[0, 0]),
            normalizer: normalizer.cloned(),
        };
        let file = std::fs::File::create(&manifest_path)?;
        serde_json::to_writer_pretty(file, &manifest)?;

        if let Some(cmd) = &self.converter {
            run_converter(cmd, &weights)?;
        }

        log::info!("📤 Exported portable model to {}", weights.display());
        Ok(PortableArtifact {
            weights,
            manifest: manifest_path,
        })
    }
}

/// Run the conversion subprocess and surface any failure with its stderr.
fn run_converter(cmd: &[String], weights: &Path) -> Result<()> {
    let Some((program, args)) = cmd.split_first() else {
        return Err(TrainError::Config("empty converter command".into()));
    };
    let weights_str = weights.to_string_lossy();
    let args: Vec<String> = args
        .iter()
        .map(|a| a.replace("{}", &weights_str))
        .collect();

    log::info!("Running converter: {program} {}", args.join(" "));
    let output = Command::new(program).args(&args).output()?;
    if !output.status.success() {
        return Err(TrainError::ExportConversion {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::ensemble::EnsembleConfig;
    use crate::neural::net::NetConfig;

    fn small_ensemble() -> Ensemble {
        let cfg = EnsembleConfig {
            n_members: 2,
            sample_upper: Some(2),
            net: NetConfig {
                input_shape: (8, 6),
                filters: 4,
                hidden: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        Ensemble::new(&cfg, Device::Cpu).unwrap()
    }

    #[test]
    fn export_writes_weights_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = PortableExporter::new(dir.path(), None);
        let artifact = exporter.export(&small_ensemble(), (8, 6), None).unwrap();
        assert!(artifact.weights.exists());
        assert!(artifact.manifest.exists());
    }

    #[test]
    fn failing_converter_surfaces_status() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = vec!["false".to_string(), "{}".to_string()];
        let exporter = PortableExporter::new(dir.path(), Some(cmd));
        let err = exporter.export(&small_ensemble(), (8, 6), None).unwrap_err();
        assert!(matches!(err, TrainError::ExportConversion { .. }));
    }

    #[test]
    fn empty_converter_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = PortableExporter::new(dir.path(), Some(Vec::new()));
        let err = exporter.export(&small_ensemble(), (8, 6), None).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }
}
