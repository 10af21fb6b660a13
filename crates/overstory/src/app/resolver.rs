//! Tiered merge resolver.
//!
//! Dequeues branch integrations FIFO and escalates each through four tiers:
//! clean merge, marker auto-resolve keeping the incoming side, AI
//! resolution per conflicted file, and full reimagination of the modified
//! files. The queue row receives exactly one final status update, and the
//! expertise record-back is fire-and-forget.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::app::conflict::{looks_like_code, resolve_keep_incoming};
use crate::app::mail::MailClient;
use crate::app::record::RecordSink;
use crate::domain::event::{EventKind, StoredEvent};
use crate::domain::mail::{MailMessage, MailType};
use crate::domain::merge::{
    ConflictHistory, MergeEntry, MergeResult, MergeStatus, MergeTier, PastResolution,
};
use crate::error::{Error, Result};
use crate::infra::BoxFuture;
use crate::infra::db::merge::MergeQueueStore;
use crate::infra::git::GitClient;
use crate::infra::ai::AiClient;

/// Async boundary to the external expertise service for conflict history.
#[cfg_attr(test, mockall::automock)]
pub trait ExpertiseClient: Send + Sync {
    /// Returns prior conflict knowledge scoped to a file set.
    fn conflict_history(&self, files: Vec<String>) -> BoxFuture<Result<ConflictHistory>>;

    /// Records the final outcome of one resolution attempt.
    fn record_outcome(
        &self,
        branch: String,
        tier: Option<MergeTier>,
        success: bool,
    ) -> BoxFuture<Result<()>>;
}

/// Expertise stub used when no service is configured.
pub struct NoopExpertiseClient;

impl ExpertiseClient for NoopExpertiseClient {
    fn conflict_history(&self, _files: Vec<String>) -> BoxFuture<Result<ConflictHistory>> {
        Box::pin(async { Ok(ConflictHistory::default()) })
    }

    fn record_outcome(
        &self,
        _branch: String,
        _tier: Option<MergeTier>,
        _success: bool,
    ) -> BoxFuture<Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Outcome of one tier attempt.
enum TierAttempt {
    Resolved,
    Failed(String),
}

/// State of the in-progress git merge across tiers.
#[derive(Default)]
struct MergeProbe {
    attempted: bool,
    in_progress: bool,
    conflicts: Vec<String>,
}

/// Serialized integrator of agent branches into the canonical branch.
pub struct MergeResolver {
    queue: MergeQueueStore,
    git: Arc<dyn GitClient>,
    ai: Arc<dyn AiClient>,
    expertise: Arc<dyn ExpertiseClient>,
    mail: MailClient,
    sink: RecordSink,
    canonical_branch: String,
    prose_code_line_ratio: f64,
}

impl MergeResolver {
    /// Creates a resolver over the queue, drivers, and notification stores.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: MergeQueueStore,
        git: Arc<dyn GitClient>,
        ai: Arc<dyn AiClient>,
        expertise: Arc<dyn ExpertiseClient>,
        mail: MailClient,
        sink: RecordSink,
        canonical_branch: impl Into<String>,
        prose_code_line_ratio: f64,
    ) -> Self {
        Self {
            queue,
            git,
            ai,
            expertise,
            mail,
            sink,
            canonical_branch: canonical_branch.into(),
            prose_code_line_ratio,
        }
    }

    /// Dequeues and resolves the next pending entry.
    ///
    /// Returns `None` when the queue is empty.
    ///
    /// # Errors
    /// Returns an error only for queue failures; tier failures are carried
    /// in the returned [`MergeResult`].
    pub async fn resolve_next(&self) -> Result<Option<MergeResult>> {
        let Some(entry) = self.queue.dequeue().await? else {
            return Ok(None);
        };

        Ok(Some(self.resolve_entry(entry).await?))
    }

    /// Runs the tier escalation for one claimed entry.
    ///
    /// # Errors
    /// Returns an error only for queue failures while recording the final
    /// status.
    pub async fn resolve_entry(&self, entry: MergeEntry) -> Result<MergeResult> {
        let history = match self
            .expertise
            .conflict_history(entry.files.clone())
            .await
        {
            Ok(history) => history,
            Err(err) => {
                debug!(branch = %entry.branch_name, "conflict history unavailable: {err}");

                ConflictHistory::default()
            }
        };

        let tiers: Vec<MergeTier> = MergeTier::ALL
            .into_iter()
            .filter(|tier| !history.skip_tiers.contains(tier))
            .collect();
        if !history.skip_tiers.is_empty() {
            debug!(
                branch = %entry.branch_name,
                skipped = history.skip_tiers.len(),
                "skipping tiers with repeated failures for this pattern"
            );
        }

        let mut probe = MergeProbe::default();
        let mut winning_tier = None;
        let mut last_error = None;

        for tier in tiers {
            let attempt = match tier {
                MergeTier::CleanMerge => self.attempt_clean_merge(&entry, &mut probe).await,
                MergeTier::AutoResolve => self.attempt_auto_resolve(&entry, &mut probe).await,
                MergeTier::AiResolve => {
                    self.attempt_ai_resolve(&entry, &mut probe, &history.past_resolutions)
                        .await
                }
                MergeTier::Reimagine => self.attempt_reimagine(&entry, &mut probe).await,
            };

            match attempt {
                Ok(TierAttempt::Resolved) => {
                    winning_tier = Some(tier);
                    break;
                }
                Ok(TierAttempt::Failed(detail)) => {
                    debug!(branch = %entry.branch_name, %tier, "tier failed: {detail}");
                    last_error = Some(detail);
                }
                Err(err) => {
                    // Driver failures (including deadline expiry) count as
                    // tier failure and escalate.
                    debug!(branch = %entry.branch_name, %tier, "tier errored: {err}");
                    last_error = Some(err.to_string());
                }
            }
        }

        if winning_tier.is_none() && probe.in_progress {
            if let Err(err) = self.git.abort_merge().await {
                trace!(branch = %entry.branch_name, "merge abort failed: {err}");
            }
        }

        let result = self
            .finish(entry, winning_tier, probe.conflicts, last_error)
            .await?;

        Ok(result)
    }

    /// Tier 1: plain no-edit/no-ff merge.
    async fn attempt_clean_merge(
        &self,
        entry: &MergeEntry,
        probe: &mut MergeProbe,
    ) -> Result<TierAttempt> {
        if self.start_merge(entry, probe).await? {
            return Ok(TierAttempt::Resolved);
        }

        Ok(TierAttempt::Failed(format!(
            "merge conflicts in {} file(s)",
            probe.conflicts.len()
        )))
    }

    /// Tier 2: strip conflict markers keeping the incoming side.
    ///
    /// All files are parsed before anything is written, so a malformed file
    /// aborts the tier without touching the working tree.
    async fn attempt_auto_resolve(
        &self,
        entry: &MergeEntry,
        probe: &mut MergeProbe,
    ) -> Result<TierAttempt> {
        if self.start_merge(entry, probe).await? {
            return Ok(TierAttempt::Resolved);
        }

        let workdir = self.git.workdir();
        let mut resolutions = Vec::with_capacity(probe.conflicts.len());
        for path in &probe.conflicts {
            let content = std::fs::read_to_string(workdir.join(path)).map_err(|err| {
                Error::merge(
                    format!("failed to read conflicted file {path}: {err}"),
                    &entry.branch_name,
                    Some("auto-resolve"),
                )
            })?;
            let Some(resolved) = resolve_keep_incoming(&content) else {
                return Ok(TierAttempt::Failed(format!(
                    "malformed conflict markers in {path}"
                )));
            };
            resolutions.push((path.clone(), resolved));
        }

        self.write_and_commit(
            entry,
            resolutions,
            &format!(
                "Merge {} (auto-resolved, kept incoming side)",
                entry.branch_name
            ),
            Vec::new(),
        )
        .await
    }

    /// Tier 3: per-file AI resolution gated by the prose detector.
    async fn attempt_ai_resolve(
        &self,
        entry: &MergeEntry,
        probe: &mut MergeProbe,
        past_resolutions: &[PastResolution],
    ) -> Result<TierAttempt> {
        if self.start_merge(entry, probe).await? {
            return Ok(TierAttempt::Resolved);
        }

        let workdir = self.git.workdir();
        let mut resolutions = Vec::with_capacity(probe.conflicts.len());
        for path in &probe.conflicts {
            let ours = self
                .git
                .show("HEAD".to_string(), path.clone())
                .await
                .map(|output| output.stdout)
                .unwrap_or_default();
            let theirs = self
                .git
                .show("MERGE_HEAD".to_string(), path.clone())
                .await
                .map(|output| output.stdout)
                .unwrap_or_default();
            let markers = std::fs::read_to_string(workdir.join(path)).unwrap_or_default();

            let prompt = conflict_prompt(path, &ours, &theirs, &markers, past_resolutions);
            let completion = match self.ai.complete(prompt).await {
                Ok(completion) => completion,
                Err(err) => {
                    return Ok(TierAttempt::Failed(format!(
                        "AI resolution failed for {path}: {err}"
                    )));
                }
            };

            if !looks_like_code(&completion, self.prose_code_line_ratio) {
                return Ok(TierAttempt::Failed(format!(
                    "AI output for {path} rejected: looks like prose"
                )));
            }
            resolutions.push((path.clone(), completion));
        }

        self.write_and_commit(
            entry,
            resolutions,
            &format!("Merge {} (AI-resolved conflicts)", entry.branch_name),
            Vec::new(),
        )
        .await
    }

    /// Tier 4: abort the merge and re-implement every modified path from
    /// both branch versions, committing a synthetic merge.
    async fn attempt_reimagine(
        &self,
        entry: &MergeEntry,
        probe: &mut MergeProbe,
    ) -> Result<TierAttempt> {
        if probe.in_progress {
            self.git.abort_merge().await?;
            probe.in_progress = false;
        }

        let mut resolutions = Vec::with_capacity(entry.files.len());
        for path in &entry.files {
            let ours = self
                .git
                .show(self.canonical_branch.clone(), path.clone())
                .await
                .map(|output| output.stdout)
                .unwrap_or_default();
            let theirs = self
                .git
                .show(entry.branch_name.clone(), path.clone())
                .await
                .map(|output| output.stdout)
                .unwrap_or_default();

            let prompt = reimagine_prompt(path, &ours, &theirs);
            let completion = match self.ai.complete(prompt).await {
                Ok(completion) => completion,
                Err(err) => {
                    return Ok(TierAttempt::Failed(format!(
                        "reimagination failed for {path}: {err}"
                    )));
                }
            };

            if !looks_like_code(&completion, self.prose_code_line_ratio) {
                return Ok(TierAttempt::Failed(format!(
                    "reimagined output for {path} rejected: looks like prose"
                )));
            }
            resolutions.push((path.clone(), completion));
        }

        self.write_and_commit(
            entry,
            resolutions,
            &format!("Reimagine merge of {}", entry.branch_name),
            vec![self.canonical_branch.clone(), entry.branch_name.clone()],
        )
        .await
    }

    /// Runs the merge once per entry and caches the conflict set.
    ///
    /// Returns `true` when the merge completed cleanly (possible when the
    /// clean-merge tier was skipped by history but the conflict never
    /// materializes).
    async fn start_merge(&self, entry: &MergeEntry, probe: &mut MergeProbe) -> Result<bool> {
        if probe.attempted {
            return Ok(false);
        }
        probe.attempted = true;

        let output = self.git.merge(entry.branch_name.clone()).await?;
        if output.success() {
            return Ok(true);
        }

        probe.in_progress = true;
        probe.conflicts = self.git.conflict_files().await?;

        Ok(false)
    }

    /// Writes resolved contents, stages them, and commits.
    async fn write_and_commit(
        &self,
        entry: &MergeEntry,
        resolutions: Vec<(String, String)>,
        message: &str,
        parents: Vec<String>,
    ) -> Result<TierAttempt> {
        let workdir = self.git.workdir();
        for (path, content) in &resolutions {
            let target = workdir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    Error::merge(
                        format!("failed to create directory for {path}: {err}"),
                        &entry.branch_name,
                        None,
                    )
                })?;
            }
            std::fs::write(&target, content).map_err(|err| {
                Error::merge(
                    format!("failed to write resolution for {path}: {err}"),
                    &entry.branch_name,
                    None,
                )
            })?;
            let staged = self.git.stage(path.clone()).await?;
            if !staged.success() {
                return Ok(TierAttempt::Failed(format!(
                    "failed to stage {path}: {}",
                    staged.detail()
                )));
            }
        }

        let committed = self.git.commit(message.to_string(), parents).await?;
        if !committed.success() {
            return Ok(TierAttempt::Failed(format!(
                "commit failed: {}",
                committed.detail()
            )));
        }

        Ok(TierAttempt::Resolved)
    }

    /// Records the single final status update, notifications, and the
    /// fire-and-forget expertise outcome.
    async fn finish(
        &self,
        entry: MergeEntry,
        tier: Option<MergeTier>,
        conflict_files: Vec<String>,
        error_message: Option<String>,
    ) -> Result<MergeResult> {
        let success = tier.is_some();
        let status = if success {
            MergeStatus::Merged
        } else if conflict_files.is_empty() {
            MergeStatus::Failed
        } else {
            MergeStatus::Conflict
        };

        self.queue
            .update_status(&entry.branch_name, status, tier)
            .await?;

        if success {
            info!(branch = %entry.branch_name, tier = %tier.map(|t| t.to_string()).unwrap_or_default(), "branch merged");
        } else {
            warn!(branch = %entry.branch_name, "merge unresolved after all tiers");
        }

        // Notification mail and event recording are best-effort.
        let mail_type = if success {
            MailType::Merged
        } else {
            MailType::MergeFailed
        };
        let mut notice = MailMessage::new(
            "merge-resolver",
            &entry.agent_name,
            &format!("{}: {}", mail_type, entry.branch_name),
            error_message.as_deref().unwrap_or("integrated cleanly"),
        );
        notice.mail_type = mail_type;
        if let Err(err) = self.mail.send(&notice).await {
            trace!(branch = %entry.branch_name, "merge notice not sent: {err}");
        }

        let mut event = StoredEvent::new(&entry.agent_name, EventKind::Custom);
        event.payload = Some(
            serde_json::json!({
                "merge": entry.branch_name,
                "status": status.to_string(),
                "tier": tier.map(|tier| tier.to_string()),
            })
            .to_string(),
        );
        self.sink.emit(event);

        let expertise = Arc::clone(&self.expertise);
        let branch = entry.branch_name.clone();
        tokio::spawn(async move {
            if let Err(err) = expertise.record_outcome(branch, tier, success).await {
                trace!("expertise record-back failed: {err}");
            }
        });

        let mut entry = entry;
        entry.status = status;
        entry.resolved_tier = tier;

        Ok(MergeResult {
            entry,
            success,
            tier,
            conflict_files,
            error_message,
        })
    }
}

fn conflict_prompt(
    path: &str,
    ours: &str,
    theirs: &str,
    markers: &str,
    past_resolutions: &[PastResolution],
) -> String {
    let mut prompt = format!(
        "Resolve the merge conflict in `{path}`. Produce the complete merged file \
         content and nothing else.\n\n--- canonical version ---\n{ours}\n\n\
         --- incoming version ---\n{theirs}\n\n--- conflict markers ---\n{markers}\n"
    );
    if !past_resolutions.is_empty() {
        prompt.push_str("\nPrior accepted resolutions for this conflict pattern:\n");
        for past in past_resolutions {
            prompt.push_str(&format!(
                "\n# {} ({})\n{}\n",
                past.file, past.summary, past.resolution
            ));
        }
    }

    prompt
}

fn reimagine_prompt(path: &str, ours: &str, theirs: &str) -> String {
    format!(
        "Re-implement `{path}` so it satisfies the union of the intents of both \
         versions below. Produce the complete file content and nothing else.\n\n\
         --- canonical version ---\n{ours}\n\n--- branch version ---\n{theirs}\n"
    )
}
