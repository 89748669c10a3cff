//! Attest stage: sign provenance links for the rebuilt products.
//!
//! Products are split into the reproducible and unreproducible classes
//! using the engine's `summary.out`: a product whose rebuilt digest equals
//! the reference digest is reproducible. Without a summary, a reproducible
//! rebuild attests every product listed in the new build descriptor. Each
//! non-empty class is attested with its own key; a class without a key is
//! skipped.

use super::{PipelineContext, StageResult, failed};
use crate::error::{Result, StageError};
use crate::merger::{AttestationRequest, attest_products};
use crate::message::{Stage, StageMessage};
use camino::Utf8Path;
use log::{info, warn};
use rebuilder_common::buildinfo::BuildInfo;
use rebuilder_common::task::{BuildStatus, BuildTask, ReproducibilityClass};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;

/// Product summary written by the rebuild engine.
pub const SUMMARY_FILE: &str = "summary.out";

#[derive(Debug, Deserialize)]
struct Summary {
    files: BTreeMap<String, ProductDigests>,
}

#[derive(Debug, Deserialize)]
struct ProductDigests {
    #[serde(default)]
    old: Option<String>,
    #[serde(default)]
    new: Option<String>,
}

/// Products of one attempt, per class.
#[derive(Debug, Default, PartialEq, Eq)]
struct ProductSplit {
    reproducible: Vec<String>,
    unreproducible: Vec<String>,
}

impl ProductSplit {
    fn get(&self, class: ReproducibilityClass) -> &[String] {
        match class {
            ReproducibilityClass::Reproducible => &self.reproducible,
            ReproducibilityClass::Unreproducible => &self.unreproducible,
        }
    }
}

/// Attests the products of `task` and enqueues its report.
///
/// # Errors
///
/// Returns an `Attestation` cause carrying the task when the status is not
/// attestable, the artifacts or new build descriptor are missing, the
/// summary is malformed, or signing fails.
pub fn attest(context: &PipelineContext<'_>, mut task: BuildTask) -> StageResult<BuildTask> {
    attest_classes(context, &mut task).map_err(|cause| failed(Stage::Attest, &task, cause))?;
    context
        .queue
        .enqueue(StageMessage::Report { task: task.clone() })
        .map_err(|cause| failed(Stage::Attest, &task, cause))?;
    Ok(task)
}

fn attest_classes(context: &PipelineContext<'_>, task: &mut BuildTask) -> Result<()> {
    if !task.status.is_attestable() {
        return Err(StageError::attestation(
            task,
            format!("a {} rebuild cannot be attested", task.status),
        ));
    }
    let artifacts = task
        .artifacts
        .clone()
        .filter(|dir| dir.is_dir())
        .ok_or_else(|| StageError::attestation(task, "artifacts directory is missing"))?;
    let descriptor = task
        .descriptors
        .new
        .clone()
        .ok_or_else(|| StageError::attestation(task, "no new build descriptor"))?;
    let info = BuildInfo::parse(descriptor.as_str(), &fs::read_to_string(&descriptor)?)
        .map_err(|err| StageError::attestation(task, err.to_string()))?;

    let (ecosystem, project) = context.project_of(task)?;
    let split = split_products(task, &artifacts, &info)?;
    let binaries = info.binaries();

    for class in ReproducibilityClass::ALL {
        let products = split.get(class);
        if products.is_empty() {
            continue;
        }
        let Some(key) = project.signing_key(class) else {
            info!(
                "{}: no signing key for {} products, not attesting them",
                task.canonical(),
                class.as_str()
            );
            continue;
        };
        let attestation = attest_products(
            context.signer,
            &AttestationRequest {
                task,
                class,
                key,
                products,
                binaries: &binaries,
                artifacts: &artifacts,
                rebuild_dir: &context.config.common.rebuild_dir,
                ecosystem: &ecosystem,
            },
        )?;
        task.metadata.set(class, attestation.merged_link);
        task.files.set(class, attestation.binaries);
    }
    Ok(())
}

fn split_products(task: &BuildTask, artifacts: &Utf8Path, info: &BuildInfo) -> Result<ProductSplit> {
    let summary_path = artifacts.join(SUMMARY_FILE);
    if !summary_path.is_file() {
        if task.status != BuildStatus::Reproducible {
            return Err(StageError::attestation(task, "product summary is missing"));
        }
        let reproducible = info
            .checksums_sha256()
            .into_iter()
            .map(|entry| entry.file)
            .filter(|file| artifacts.join(file).is_file())
            .collect();
        return Ok(ProductSplit {
            reproducible,
            unreproducible: Vec::new(),
        });
    }

    let summary: Summary = serde_json::from_str(&fs::read_to_string(&summary_path)?)
        .map_err(|err| StageError::attestation(task, format!("malformed summary: {err}")))?;
    let mut split = ProductSplit::default();
    for (file, digests) in summary.files {
        if !artifacts.join(&file).is_file() {
            warn!("{}: product {file} is not in the artifacts", task.canonical());
            continue;
        }
        let matched = digests.old.is_some() && digests.old == digests.new;
        if matched {
            split.reproducible.push(file);
        } else {
            split.unreproducible.push(file);
        }
    }
    Ok(split)
}
