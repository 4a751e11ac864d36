//! Batch plans: several differently-configured copies of one base image.
//!
//! ```toml
//! base_image = "2021-03-04-raspios-buster-armhf-lite.img"
//! version_tag = "2021-03-04"
//!
//! [[jobs]]
//! suffix = "autologin-ssh"
//! features = ["autologin", "remote_access"]
//!
//! [[jobs]]
//! suffix = "mu"
//! features = ["autologin", "expand_storage", "package_install"]
//! package_preset = "mu"
//! ```
//!
//! Each job copies the base image, then provisions the copy in its own
//! session. Sessions share nothing but the cancel token.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::cli::{features_from_kinds, package_groups, CliError};
use crate::features::{FeatureKind, PackageGroup};
use crate::pty::Transcript;
use crate::runtime::image::{derived_copy_path, prepare_working_copy};
use crate::session::{Provisioner, ProvisioningRequest, RequestError, SessionReport};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to read batch plan '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse batch plan '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Batch plan has no jobs")]
    NoJobs,

    #[error("Job suffix '{0}' is used more than once")]
    DuplicateSuffix(String),

    #[error("Job '{suffix}': {source}")]
    Features {
        suffix: String,
        #[source]
        source: CliError,
    },

    #[error("Job '{suffix}': {source}")]
    Request {
        suffix: String,
        #[source]
        source: RequestError,
    },
}

fn default_requires_login() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchPlan {
    pub base_image: PathBuf,
    #[serde(default)]
    pub version_tag: Option<String>,
    /// Where copies go; next to the base image when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_requires_login")]
    pub requires_login: bool,
    pub jobs: Vec<BatchJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchJob {
    /// Appended to the base image name: `<stem>-<suffix>.img`.
    pub suffix: String,
    pub features: Vec<FeatureKind>,
    #[serde(default)]
    pub package_groups: Vec<PackageGroup>,
    #[serde(default)]
    pub package_preset: Option<String>,
}

impl BatchPlan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut plan: BatchPlan = toml::from_str(&content).map_err(|source| PlanError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        // Relative image paths are relative to the plan file.
        if let Some(dir) = path.parent() {
            if plan.base_image.is_relative() {
                plan.base_image = dir.join(&plan.base_image);
            }
            if let Some(out) = plan.output_dir.as_mut() {
                if out.is_relative() {
                    *out = dir.join(&*out);
                }
            }
        }
        Ok(plan)
    }

    /// Build every job's request up front so a bad job fails before any copy.
    pub fn requests(&self) -> Result<Vec<(PathBuf, ProvisioningRequest)>, PlanError> {
        if self.jobs.is_empty() {
            return Err(PlanError::NoJobs);
        }
        let mut requests: Vec<(PathBuf, ProvisioningRequest)> = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let output = self.output_path(job);
            if requests.iter().any(|(existing, _)| *existing == output) {
                return Err(PlanError::DuplicateSuffix(job.suffix.clone()));
            }
            let request = job.request(&output, self.version_tag.clone(), self.requires_login)?;
            requests.push((output, request));
        }
        Ok(requests)
    }

    pub fn output_path(&self, job: &BatchJob) -> PathBuf {
        let copy = derived_copy_path(&self.base_image, &job.suffix);
        match (&self.output_dir, copy.file_name()) {
            (Some(dir), Some(name)) => dir.join(name),
            _ => copy,
        }
    }
}

impl BatchJob {
    fn request(
        &self,
        output: &Path,
        version_tag: Option<String>,
        requires_login: bool,
    ) -> Result<ProvisioningRequest, PlanError> {
        let features_err = |source| PlanError::Features {
            suffix: self.suffix.clone(),
            source,
        };
        let mut groups =
            package_groups(self.package_preset.as_deref(), &[]).map_err(features_err)?;
        groups.extend(self.package_groups.iter().cloned());
        let features = features_from_kinds(&self.features, &groups).map_err(features_err)?;

        ProvisioningRequest::new(output, features)
            .map(|r| r.with_version_tag(version_tag).with_login(requires_login))
            .map_err(|source| PlanError::Request {
                suffix: self.suffix.clone(),
                source,
            })
    }
}

/// Result of one batch job.
#[derive(Debug, Serialize)]
pub struct JobOutcome {
    pub suffix: String,
    pub output: PathBuf,
    pub exit_code: i32,
    pub error: Option<String>,
    pub report: Option<SessionReport>,
}

impl JobOutcome {
    fn failed(suffix: &str, output: PathBuf, exit_code: i32, error: String) -> Self {
        Self {
            suffix: suffix.to_string(),
            output,
            exit_code,
            error: Some(error),
            report: None,
        }
    }
}

fn run_job(
    provisioner: &Provisioner,
    base: &Path,
    suffix: &str,
    output: PathBuf,
    request: ProvisioningRequest,
    cancel: &CancelToken,
) -> JobOutcome {
    if cancel.is_cancelled() {
        return JobOutcome::failed(suffix, output, 130, "cancelled before start".to_string());
    }
    if let Err(e) = prepare_working_copy(base, &output) {
        return JobOutcome::failed(suffix, output, 1, e.to_string());
    }

    let transcript_path = output.with_extension("log");
    let transcript = match Transcript::discard().with_file(&transcript_path) {
        Ok(transcript) => transcript,
        Err(e) => {
            tracing::warn!(job = suffix, "Cannot write transcript {}: {}", transcript_path.display(), e);
            Transcript::discard()
        }
    };

    tracing::info!(job = suffix, output = %output.display(), "Starting job");
    let outcome = provisioner.run(&request, cancel, transcript);
    JobOutcome {
        suffix: suffix.to_string(),
        output,
        exit_code: outcome.exit_code(),
        error: outcome.result.as_ref().err().map(|e| e.to_string()),
        report: Some(outcome.report),
    }
}

/// Run every job of `plan`, at most `parallel` at a time.
///
/// Outcomes come back in plan order.
pub async fn run_batch(
    provisioner: Arc<Provisioner>,
    plan: &BatchPlan,
    parallel: usize,
    cancel: CancelToken,
) -> Result<Vec<JobOutcome>, PlanError> {
    let requests = plan.requests()?;
    let semaphore = Arc::new(Semaphore::new(parallel.max(1)));
    let mut set = JoinSet::new();

    for (index, (output, request)) in requests.into_iter().enumerate() {
        let suffix = plan.jobs[index].suffix.clone();
        let base = plan.base_image.clone();
        let provisioner = Arc::clone(&provisioner);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();

        set.spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let job_suffix = suffix.clone();
            let job_output = output.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                run_job(&provisioner, &base, &job_suffix, job_output, request, &cancel)
            })
            .await;
            let outcome = joined.unwrap_or_else(|e| {
                JobOutcome::failed(&suffix, output, 1, format!("job panicked: {}", e))
            });
            (index, outcome)
        });
    }

    let mut outcomes: Vec<Option<JobOutcome>> = (0..plan.jobs.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, outcome)) => {
                tracing::info!(job = %outcome.suffix, exit_code = outcome.exit_code, "Job finished");
                outcomes[index] = Some(outcome);
            }
            Err(e) => tracing::error!("Batch task failed: {}", e),
        }
    }

    Ok(outcomes
        .into_iter()
        .zip(&plan.jobs)
        .map(|(outcome, job)| {
            outcome.unwrap_or_else(|| {
                let output = plan.output_path(job);
                JobOutcome::failed(&job.suffix, output, 1, "job did not report".to_string())
            })
        })
        .collect())
}

/// Exit code of the first failing job, or 0.
pub fn batch_exit_code(outcomes: &[JobOutcome]) -> i32 {
    outcomes
        .iter()
        .map(|o| o.exit_code)
        .find(|code| *code != 0)
        .unwrap_or(0)
}
