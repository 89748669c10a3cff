//! Signing Tool seam: in-toto provenance links.
//!
//! `run` records a link naming product files (relative to a working
//! directory) as subjects; `sign` re-signs an unsigned link. Both fail
//! loudly on a non-zero exit.

use crate::error::{Result, StageError};
use crate::executor::{CommandExecutor, CommandOptions, SystemCommandExecutor, failure_reason};
use camino::{Utf8Path, Utf8PathBuf};

/// Step name recorded in every link.
pub const REBUILD_STEP: &str = "rebuild";

/// Lowercased first eight hex digits of a key id, used in link names.
///
/// # Examples
///
/// ```
/// use rebuilder_worker::signer::key_prefix;
///
/// assert_eq!(key_prefix("632F8C69E01B25C9E0C3ADF2F360C0D259FB650C"), "632f8c69");
/// assert_eq!(key_prefix("ABC"), "abc");
/// ```
#[must_use]
pub fn key_prefix(key: &str) -> String {
    key.chars().take(8).collect::<String>().to_lowercase()
}

/// Name of the link the tool writes for `step` signed with `key`.
#[must_use]
pub fn signed_link_name(step: &str, key: &str) -> String {
    format!("{step}.{}.link", key_prefix(key))
}

/// External provenance generator.
#[cfg_attr(test, mockall::automock)]
pub trait SigningTool: Send + Sync {
    /// Records a signed link for `products` (paths relative to `cwd`) into
    /// `metadata_dir` and returns the link path.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Attestation`] when the tool fails or writes no
    /// link.
    fn run(
        &self,
        step: &str,
        products: &[String],
        key: &str,
        metadata_dir: &Utf8Path,
        cwd: &Utf8Path,
    ) -> Result<Utf8PathBuf>;

    /// Signs the unsigned link at `link` with `key`, writing the signed link
    /// next to it, and returns the signed link path.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Attestation`] when the tool fails or writes no
    /// signed link.
    fn sign(&self, link: &Utf8Path, key: &str) -> Result<Utf8PathBuf>;
}

/// Signing tool driving the `in-toto-run` and `in-toto-sign` commands.
#[derive(Debug, Clone, Default)]
pub struct InTotoSigner<E = SystemCommandExecutor> {
    executor: E,
}

impl<E: CommandExecutor> InTotoSigner<E> {
    /// Creates a signer running commands through `executor`.
    pub const fn new(executor: E) -> Self {
        Self { executor }
    }

    fn invoke(&self, args: &[&str], cwd: &Utf8Path, target: &Utf8Path) -> Result<()> {
        let Some((cmd, rest)) = args.split_first() else {
            return Ok(());
        };
        let output = self
            .executor
            .run(cmd, rest, &CommandOptions::in_dir(cwd))
            .map_err(|err| attestation_error(target, format!("{cmd} failed: {err}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(attestation_error(
                target,
                format!("{cmd} failed: {}", failure_reason(&output)),
            ))
        }
    }
}

impl<E: CommandExecutor> SigningTool for InTotoSigner<E> {
    fn run(
        &self,
        step: &str,
        products: &[String],
        key: &str,
        metadata_dir: &Utf8Path,
        cwd: &Utf8Path,
    ) -> Result<Utf8PathBuf> {
        if products.is_empty() {
            return Err(attestation_error(metadata_dir, "no products to attest"));
        }
        let step_arg = format!("--step-name={step}");
        let mut args = vec!["in-toto-run", step_arg.as_str(), "--no-command", "--products"];
        args.extend(products.iter().map(String::as_str));
        args.extend(["--gpg", key, "--metadata-directory", metadata_dir.as_str()]);
        self.invoke(&args, cwd, metadata_dir)?;

        let link = metadata_dir.join(signed_link_name(step, key));
        if link.is_file() {
            Ok(link)
        } else {
            Err(attestation_error(&link, "in-toto-run wrote no link"))
        }
    }

    fn sign(&self, link: &Utf8Path, key: &str) -> Result<Utf8PathBuf> {
        let (Some(dir), Some(file_name), Some(step)) =
            (link.parent(), link.file_name(), link.file_stem())
        else {
            return Err(attestation_error(link, "not a link file"));
        };
        self.invoke(&["in-toto-sign", "--gpg", key, "-f", file_name], dir, link)?;

        let signed = dir.join(signed_link_name(step, key));
        if signed.is_file() {
            Ok(signed)
        } else {
            Err(attestation_error(&signed, "in-toto-sign wrote no signed link"))
        }
    }
}

fn attestation_error(target: &Utf8Path, reason: impl Into<String>) -> StageError {
    StageError::Attestation {
        package: target.to_string(),
        reason: reason.into(),
    }
}
