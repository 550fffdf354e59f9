use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::state::AppState;
use crate::core::time::Timestamp;
use crate::db::Backend;
use crate::jobs::{Job, JobError, JobOptions, JobOutput, JobWork};
use crate::models::analysis::{FileSimilarity, FileSummary, IndividualAnalysis, PairwiseAnalysis, PairwiseKey};
use crate::models::grading::{GradingInfo, ID_DELIM};
use crate::services::archive::gunzip_bytes;
use crate::services::similarity::{ShingleEngine, SimilarityEngine};

pub(crate) type AnalysisOutput = JobOutput<String, IndividualAnalysis>;
pub(crate) type AnalysisError = JobError<String, IndividualAnalysis>;
pub(crate) type PairwiseOutput = JobOutput<PairwiseKey, PairwiseAnalysis>;
pub(crate) type PairwiseError = JobError<PairwiseKey, PairwiseAnalysis>;

/// Split `course::assignment::user::short` into its parts.
pub(crate) fn split_submission_id(full_id: &str) -> Option<(&str, &str, &str, &str)> {
    let mut parts = full_id.split(ID_DELIM);
    let ids = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || [ids.0, ids.1, ids.2, ids.3].iter().any(|part| part.is_empty()) {
        return None;
    }
    Some(ids)
}

/// Line statistics for a set of submissions, computed once and cached in the backend.
pub(crate) async fn individual_analysis(
    state: &AppState,
    cancel: &CancellationToken,
    full_ids: Vec<String>,
    options: JobOptions,
) -> Result<AnalysisOutput, AnalysisError> {
    let job = Job {
        name: String::from("individual-analysis"),
        lock_key: String::from("analysis::individual"),
        pool_size: state.settings().jobs().regrade_pool_size.max(1),
        work_items: full_ids,
        options,
        work: Arc::new(AnalysisWork { backend: state.backend().clone() }),
        cancel: cancel.clone(),
    };

    job.run(state.locks(), state.shutdown().child_token()).await
}

/// Every distinct pair of the given submissions.
pub(crate) fn pairwise_keys(full_ids: &[String]) -> Vec<PairwiseKey> {
    let mut ids = full_ids.to_vec();
    ids.sort();
    ids.dedup();

    let mut keys = Vec::with_capacity(ids.len() * ids.len().saturating_sub(1) / 2);
    for (index, lhs) in ids.iter().enumerate() {
        for rhs in &ids[index + 1..] {
            keys.push(PairwiseKey::new(lhs, rhs));
        }
    }
    keys
}

/// Similarity of every pair of the given submissions, file by file.
/// One run at a time per course of the lowest pair.
pub(crate) async fn pairwise_analysis(
    state: &AppState,
    cancel: &CancellationToken,
    full_ids: &[String],
    options: JobOptions,
) -> Result<PairwiseOutput, PairwiseError> {
    let keys = pairwise_keys(full_ids);
    let Some(first) = keys.first() else {
        return Ok(PairwiseOutput::default());
    };

    let job = Job {
        name: String::from("pairwise-analysis"),
        lock_key: format!("analysis::pairwise::{}", first.course()),
        pool_size: state.settings().jobs().regrade_pool_size.max(1),
        work_items: keys,
        options,
        work: Arc::new(PairwiseWork {
            backend: state.backend().clone(),
            engines: vec![Arc::new(ShingleEngine::default())],
        }),
        cancel: cancel.clone(),
    };

    job.run(state.locks(), state.shutdown().child_token()).await
}

/// A submission's grading info and decompressed input files.
async fn fetch_inputs(
    backend: &dyn Backend,
    full_id: &str,
) -> anyhow::Result<(GradingInfo, BTreeMap<String, Vec<u8>>)> {
    let Some((course_id, assignment_id, user, short_id)) = split_submission_id(full_id) else {
        bail!("Malformed submission id '{full_id}'");
    };

    let course = backend
        .get_course(course_id)
        .await?
        .with_context(|| format!("Unknown course '{course_id}'"))?;
    let assignment = course
        .assignment(assignment_id)
        .with_context(|| format!("Unknown assignment '{course_id}{ID_DELIM}{assignment_id}'"))?;

    let result = backend
        .get_submission_contents(assignment, user, Some(short_id))
        .await?
        .with_context(|| format!("Unknown submission '{full_id}'"))?;
    let info = result.info.with_context(|| format!("Submission '{full_id}' has no grading info"))?;

    let mut files = BTreeMap::new();
    for (name, data) in result.input_files_gzip {
        let content = gunzip_bytes(&data).with_context(|| format!("Corrupt input file '{name}' in '{full_id}'"))?;
        files.insert(name, content);
    }

    Ok((info, files))
}

struct AnalysisWork {
    backend: Arc<dyn Backend>,
}

#[async_trait]
impl JobWork<String, IndividualAnalysis> for AnalysisWork {
    async fn work(&self, _cancel: &CancellationToken, full_id: &String) -> anyhow::Result<IndividualAnalysis> {
        let (info, inputs) = fetch_inputs(self.backend.as_ref(), full_id).await?;
        let files = inputs.iter().map(|(name, content)| FileSummary::from_content(name, content)).collect();

        let mut analysis = IndividualAnalysis {
            full_id: full_id.clone(),
            short_id: info.short_id,
            course_id: info.course_id,
            assignment_id: info.assignment_id,
            user: info.user,
            analysis_timestamp: Timestamp::now(),
            submission_start_time: info.grading_start_time,
            score: info.score,
            files,
            ..IndividualAnalysis::default()
        };
        analysis.total_files();

        Ok(analysis)
    }

    async fn retrieve(&self, full_ids: &[String]) -> anyhow::Result<BTreeMap<String, IndividualAnalysis>> {
        self.backend.get_individual_analysis(full_ids).await
    }

    async fn store(&self, outputs: &[IndividualAnalysis]) -> anyhow::Result<()> {
        self.backend.store_individual_analysis(outputs).await
    }

    async fn remove(&self, full_ids: &[String]) -> anyhow::Result<()> {
        self.backend.remove_individual_analysis(full_ids).await
    }
}

struct PairwiseWork {
    backend: Arc<dyn Backend>,
    engines: Vec<Arc<dyn SimilarityEngine>>,
}

#[async_trait]
impl JobWork<PairwiseKey, PairwiseAnalysis> for PairwiseWork {
    async fn work(&self, cancel: &CancellationToken, key: &PairwiseKey) -> anyhow::Result<PairwiseAnalysis> {
        let [lhs_id, rhs_id] = key.ids();
        let (_, lhs) = fetch_inputs(self.backend.as_ref(), lhs_id).await?;
        let (_, rhs) = fetch_inputs(self.backend.as_ref(), rhs_id).await?;
        if cancel.is_cancelled() {
            bail!("Pairwise analysis of '{key}' was canceled");
        }

        let engines = self.engines.clone();
        let (similarities, unmatched) = tokio::task::spawn_blocking(move || compare_files(&engines, &lhs, &rhs))
            .await
            .context("similarity computation panicked")?;

        Ok(PairwiseAnalysis::new(key.clone(), similarities, unmatched))
    }

    async fn retrieve(&self, keys: &[PairwiseKey]) -> anyhow::Result<BTreeMap<PairwiseKey, PairwiseAnalysis>> {
        self.backend.get_pairwise_analysis(keys).await
    }

    async fn store(&self, outputs: &[PairwiseAnalysis]) -> anyhow::Result<()> {
        self.backend.store_pairwise_analysis(outputs).await
    }

    async fn remove(&self, keys: &[PairwiseKey]) -> anyhow::Result<()> {
        self.backend.remove_pairwise_analysis(keys).await
    }
}

type FileSimilarities = BTreeMap<String, Vec<FileSimilarity>>;

/// Score files present on both sides with every engine. The rest are unmatched.
fn compare_files(
    engines: &[Arc<dyn SimilarityEngine>],
    lhs: &BTreeMap<String, Vec<u8>>,
    rhs: &BTreeMap<String, Vec<u8>>,
) -> (FileSimilarities, Vec<[String; 2]>) {
    let mut similarities = BTreeMap::new();
    let mut unmatched = Vec::new();

    for (name, left) in lhs {
        let Some(right) = rhs.get(name) else {
            unmatched.push([name.clone(), String::new()]);
            continue;
        };

        let (left, right) = (String::from_utf8_lossy(left), String::from_utf8_lossy(right));
        let scores = engines
            .iter()
            .map(|engine| FileSimilarity {
                filename: name.clone(),
                tool: engine.name().to_string(),
                version: engine.version().to_string(),
                score: engine.similarity(&left, &right),
            })
            .collect();
        similarities.insert(name.clone(), scores);
    }

    for name in rhs.keys().filter(|name| !lhs.contains_key(*name)) {
        unmatched.push([String::new(), name.clone()]);
    }

    (similarities, unmatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::grading::submission_full_id;
    use crate::test_support::{self, ASSIGNMENT_ID, COURSE_ID, OTHER, STUDENT};

    #[test]
    fn submission_ids_need_four_parts() {
        assert_eq!(
            split_submission_id("course101::hw0::a@b.c::100"),
            Some(("course101", "hw0", "a@b.c", "100"))
        );
        assert_eq!(split_submission_id("course101::hw0::a@b.c"), None);
        assert_eq!(split_submission_id("course101::hw0::::100"), None);
        assert_eq!(split_submission_id("a::b::c::d::e"), None);
    }

    #[tokio::test]
    async fn analysis_is_computed_once_and_cached() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let assignment = test_support::assignment(state).await;
        test_support::store_submission(state, &assignment, STUDENT, "100").await;

        let good = submission_full_id(COURSE_ID, ASSIGNMENT_ID, STUDENT, "100");
        let missing = submission_full_id(COURSE_ID, ASSIGNMENT_ID, STUDENT, "999");
        let options = JobOptions { wait_for_completion: true, ..JobOptions::default() };

        let output = individual_analysis(state, &CancellationToken::new(), vec![good.clone(), missing.clone()], options)
            .await
            .expect("analysis");
        let analysis = output.results.get(&good).expect("analysis");
        assert_eq!(analysis.user, STUDENT);
        assert!(analysis.lines > 0);
        assert!(output.work_errors.contains_key(&missing));

        let stored = state.backend().get_individual_analysis(&[good.clone()]).await.expect("stored");
        assert_eq!(stored.get(&good), Some(analysis));
    }

    #[test]
    fn pairs_skip_duplicates_and_identity() {
        let ids: Vec<String> = ["c", "a", "b", "a"].iter().map(|id| id.to_string()).collect();
        let keys = pairwise_keys(&ids);
        assert_eq!(keys, vec![PairwiseKey::new("a", "b"), PairwiseKey::new("a", "c"), PairwiseKey::new("b", "c")]);
        assert!(pairwise_keys(&ids[..1]).is_empty());
    }

    #[test]
    fn files_on_one_side_are_unmatched() {
        let engines: Vec<Arc<dyn SimilarityEngine>> = vec![Arc::new(ShingleEngine::default())];
        let lhs = BTreeMap::from([
            (String::from("main.py"), b"print(1)\n".to_vec()),
            (String::from("notes.txt"), b"hi".to_vec()),
        ]);
        let rhs = BTreeMap::from([
            (String::from("main.py"), b"print(1)\n".to_vec()),
            (String::from("extra.py"), b"x = 1".to_vec()),
        ]);

        let (similarities, unmatched) = compare_files(&engines, &lhs, &rhs);
        assert_eq!(similarities.keys().collect::<Vec<_>>(), vec!["main.py"]);
        assert_eq!(similarities["main.py"][0].tool, "shingle");
        assert_eq!(similarities["main.py"][0].score, 1.0);
        assert_eq!(
            unmatched,
            vec![[String::from("notes.txt"), String::new()], [String::new(), String::from("extra.py")]]
        );
    }

    #[tokio::test]
    async fn pairwise_analysis_compares_every_pair_and_caches() {
        let context = test_support::test_state().await;
        let state = &context.state;
        let assignment = test_support::assignment(state).await;
        let student = test_support::store_submission(state, &assignment, STUDENT, "100").await;
        let other = test_support::store_submission(state, &assignment, OTHER, "200").await;
        let missing = submission_full_id(COURSE_ID, ASSIGNMENT_ID, STUDENT, "999");

        let options = JobOptions { wait_for_completion: true, ..JobOptions::default() };
        let ids = vec![student.id.clone(), other.id.clone(), missing.clone()];
        let output = pairwise_analysis(state, &CancellationToken::new(), &ids, options)
            .await
            .expect("analysis");

        let key = PairwiseKey::new(&student.id, &other.id);
        let analysis = output.results.get(&key).expect("pair");
        assert_eq!(analysis.total_mean_similarity, 1.0);
        assert!(analysis.unmatched_files.is_empty());
        assert_eq!(output.work_errors.len(), 2);
        assert!(output.work_errors.keys().all(|key| key.ids().contains(&missing.as_str())));

        let stored = state.backend().get_pairwise_analysis(&[key.clone()]).await.expect("stored");
        assert_eq!(stored.get(&key), Some(analysis));
    }

    #[tokio::test]
    async fn fewer_than_two_submissions_is_a_no_op() {
        let context = test_support::test_state().await;
        let id = submission_full_id(COURSE_ID, ASSIGNMENT_ID, STUDENT, "100");
        let options = JobOptions { wait_for_completion: true, ..JobOptions::default() };

        let output = pairwise_analysis(&context.state, &CancellationToken::new(), &[id], options)
            .await
            .expect("analysis");
        assert!(output.results.is_empty());
        assert_eq!(output.remaining, 0);
    }
}
