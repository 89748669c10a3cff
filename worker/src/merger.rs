//! Attestation Merger.
//!
//! Every rebuild attempt records one link per reproducibility class naming
//! the class's products. The link is stored per architecture as
//! `rebuild.{key}.{arch}.link`; all architecture links of a package version
//! are then merged into `rebuild.{key}.link`, re-signed once, and exposed
//! through a stable `metadata` symlink.
//!
//! Merging takes the first architecture link (in name order) as template,
//! drops its signatures and unions every link's `signed.products`. Product
//! sets are disjoint across architectures, so collisions never change the
//! result; re-running a merge over the same inputs yields the same products.

use crate::error::{Result, StageError};
use crate::layout::{METADATA_LINK, package_metadata_dir, sources_root};
use crate::signer::{REBUILD_STEP, SigningTool, key_prefix};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use rebuilder_common::dist::Ecosystem;
use rebuilder_common::task::{BuildTask, ReproducibilityClass};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;

/// Unsigned intermediate written during a merge; always removed afterwards.
const UNSIGNED_LINK: &str = "rebuild.link";

/// Inputs for attesting one class of a rebuilt task.
#[derive(Debug, Clone, Copy)]
pub struct AttestationRequest<'a> {
    /// Task being attested.
    pub task: &'a BuildTask,
    /// Class of the products.
    pub class: ReproducibilityClass,
    /// Signing key of the class.
    pub key: &'a str,
    /// Product file names, relative to `artifacts`.
    pub products: &'a [String],
    /// Binary package names declared by the new build descriptor.
    pub binaries: &'a [String],
    /// Artifacts directory of the attempt.
    pub artifacts: &'a Utf8Path,
    /// Durable rebuild root.
    pub rebuild_dir: &'a Utf8Path,
    /// Ecosystem of the task.
    pub ecosystem: &'a Ecosystem,
}

/// Result of attesting one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// Per-architecture link.
    pub arch_link: Utf8PathBuf,
    /// Merged, signed link covering every architecture.
    pub merged_link: Utf8PathBuf,
    /// Declared binaries whose products belong to the class.
    pub binaries: Vec<String>,
}

/// File name of the per-architecture link.
///
/// # Examples
///
/// ```
/// use rebuilder_worker::merger::arch_link_name;
///
/// assert_eq!(
///     arch_link_name("632F8C69E01B25C9E0C3ADF2F360C0D259FB650C", "amd64"),
///     "rebuild.632f8c69.amd64.link"
/// );
/// ```
#[must_use]
pub fn arch_link_name(key: &str, arch: &str) -> String {
    format!("rebuild.{}.{arch}.link", key_prefix(key))
}

/// File name of the merged link.
#[must_use]
pub fn merged_link_name(key: &str) -> String {
    format!("rebuild.{}.link", key_prefix(key))
}

/// Declared binaries whose product files (`{binary}_...`) are in `products`.
#[must_use]
pub fn binaries_in(binaries: &[String], products: &[String]) -> Vec<String> {
    let names: Vec<&str> = products
        .iter()
        .map(|product| product.split('_').next().unwrap_or(product))
        .collect();
    binaries
        .iter()
        .filter(|binary| names.contains(&binary.as_str()))
        .cloned()
        .collect()
}

/// Attests one class of a rebuilt task and refreshes the merged link.
///
/// # Errors
///
/// Returns [`StageError::Attestation`] when the signing tool fails, and
/// [`StageError::Io`] when the attestation tree cannot be written.
pub fn attest_products(
    signer: &dyn SigningTool,
    request: &AttestationRequest<'_>,
) -> Result<Attestation> {
    let identity = &request.task.identity;
    let scratch = tempfile::Builder::new()
        .prefix("in-toto-")
        .tempdir_in(request.artifacts)?;
    let scratch_dir = Utf8Path::from_path(scratch.path()).ok_or_else(|| {
        StageError::attestation(request.task, "scratch directory is not UTF-8")
    })?;

    let link = signer.run(
        REBUILD_STEP,
        request.products,
        request.key,
        scratch_dir,
        request.artifacts,
    )?;

    let root = sources_root(request.rebuild_dir, request.ecosystem, request.class);
    let package_dir = package_metadata_dir(&root, identity);
    fs::create_dir_all(&package_dir)?;
    let arch_link = package_dir.join(arch_link_name(request.key, identity.arch()));
    fs::copy(&link, &arch_link)?;

    for binary in request.binaries {
        link_binary(&root, binary, identity.name())?;
    }

    let merged_link = merge_links(signer, &package_dir, request.key)?;
    ensure_symlink(&package_dir.join(METADATA_LINK), &merged_link_name(request.key))?;
    debug!(
        "{}: {} link refreshed at {merged_link}",
        request.task.canonical(),
        request.class.as_str()
    );

    Ok(Attestation {
        arch_link,
        merged_link,
        binaries: binaries_in(request.binaries, request.products),
    })
}

/// Merges every `rebuild.{key}.*.link` in `dir` into a signed
/// `rebuild.{key}.link` and returns its path.
///
/// # Errors
///
/// Returns [`StageError::Attestation`] when no link exists, a link is
/// malformed, or signing fails. The unsigned intermediate is removed in
/// every case.
pub fn merge_links(signer: &dyn SigningTool, dir: &Utf8Path, key: &str) -> Result<Utf8PathBuf> {
    let links = arch_links(dir, key)?;
    let merged = merge_documents(dir, &links)?;

    let unsigned = dir.join(UNSIGNED_LINK);
    let payload = serde_json::to_vec(&merged).map_err(|err| merge_error(dir, err))?;
    let signed = fs::write(&unsigned, payload)
        .map_err(StageError::from)
        .and_then(|()| signer.sign(&unsigned, key));

    match fs::remove_file(&unsigned) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    signed
}

/// Union of the products of every architecture link of `key` in `dir`.
///
/// # Errors
///
/// Returns [`StageError::Attestation`] when a link cannot be read.
pub fn merged_products(dir: &Utf8Path, key: &str) -> Result<Value> {
    let links = arch_links(dir, key)?;
    let merged = merge_documents(dir, &links)?;
    Ok(merged
        .pointer("/signed/products")
        .cloned()
        .unwrap_or(Value::Null))
}

fn arch_links(dir: &Utf8Path, key: &str) -> Result<Vec<Utf8PathBuf>> {
    let pattern = format!(
        "{}/rebuild.{}.*.link",
        glob::Pattern::escape(dir.as_str()),
        key_prefix(key)
    );
    let entries = glob::glob(&pattern).map_err(|err| merge_error(dir, err))?;
    let mut links: Vec<Utf8PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .collect();
    links.sort();
    if links.is_empty() {
        return Err(merge_error(dir, format!("no {} links to merge", key_prefix(key))));
    }
    Ok(links)
}

fn merge_documents(dir: &Utf8Path, links: &[Utf8PathBuf]) -> Result<Value> {
    let mut template: Option<Value> = None;
    for link in links {
        let text = fs::read_to_string(link)?;
        let mut document: Value =
            serde_json::from_str(&text).map_err(|err| merge_error(link, err))?;
        let products = document
            .pointer_mut("/signed/products")
            .and_then(Value::as_object_mut)
            .map(std::mem::take)
            .ok_or_else(|| merge_error(link, "link has no products"))?;

        let merged = template.get_or_insert_with(|| {
            if let Some(object) = document.as_object_mut() {
                object.remove("signatures");
            }
            document
        });
        if let Some(target) = merged
            .pointer_mut("/signed/products")
            .and_then(Value::as_object_mut)
        {
            target.extend(products);
        }
    }
    template.ok_or_else(|| merge_error(dir, "no links to merge"))
}

/// Creates `{root}/{binary} -> {package}` unless the entry already exists.
fn link_binary(root: &Utf8Path, binary: &str, package: &str) -> Result<()> {
    ensure_symlink(&root.join(binary), package)
}

fn ensure_symlink(path: &Utf8Path, target: &str) -> Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        return Ok(());
    }
    match symlink(target, path) {
        Ok(()) => Ok(()),
        // Another worker created it first.
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(unix)]
fn symlink(target: &str, path: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn symlink(target: &str, path: &Utf8Path) -> std::io::Result<()> {
    let resolved = path.parent().map_or_else(|| target.into(), |dir| dir.join(target));
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(target, path)
    } else {
        std::os::windows::fs::symlink_file(target, path)
    }
}

fn merge_error(target: &Utf8Path, reason: impl ToString) -> StageError {
    StageError::Attestation {
        package: target.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[path = "merger_tests.rs"]
mod tests;
