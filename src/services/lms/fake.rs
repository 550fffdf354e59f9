use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{CommentUpdate, LmsAdapter, LmsScore, LmsUser};

#[derive(Debug, Default)]
struct FakeState {
    users: Vec<LmsUser>,
    scores: BTreeMap<String, Vec<LmsScore>>,
    uploads: BTreeMap<String, Vec<LmsScore>>,
    comment_updates: BTreeMap<String, Vec<CommentUpdate>>,
}

/// In-memory LMS for test courses. Uploads are applied and also recorded.
#[derive(Debug, Default)]
pub(crate) struct FakeLms {
    state: Mutex<FakeState>,
}

impl FakeLms {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_users(&self, users: Vec<LmsUser>) {
        self.state().users = users;
    }

    pub(crate) fn set_scores(&self, assignment_lms_id: &str, scores: Vec<LmsScore>) {
        self.state().scores.insert(assignment_lms_id.to_string(), scores);
    }

    pub(crate) fn uploads(&self, assignment_lms_id: &str) -> Vec<LmsScore> {
        self.state().uploads.get(assignment_lms_id).cloned().unwrap_or_default()
    }

    pub(crate) fn comment_updates(&self, assignment_lms_id: &str) -> Vec<CommentUpdate> {
        self.state().comment_updates.get(assignment_lms_id).cloned().unwrap_or_default()
    }

    pub(crate) fn reset(&self) {
        *self.state() = FakeState::default();
    }
}

#[async_trait]
impl LmsAdapter for FakeLms {
    async fn fetch_users(&self) -> anyhow::Result<Vec<LmsUser>> {
        Ok(self.state().users.clone())
    }

    async fn fetch_assignment_scores(&self, assignment_lms_id: &str) -> anyhow::Result<Vec<LmsScore>> {
        Ok(self.state().scores.get(assignment_lms_id).cloned().unwrap_or_default())
    }

    async fn update_assignment_scores(&self, assignment_lms_id: &str, scores: &[LmsScore]) -> anyhow::Result<()> {
        let mut state = self.state();
        state
            .uploads
            .entry(assignment_lms_id.to_string())
            .or_default()
            .extend(scores.iter().cloned());

        let stored = state.scores.entry(assignment_lms_id.to_string()).or_default();
        for score in scores {
            match stored.iter_mut().find(|existing| existing.user_id == score.user_id) {
                Some(existing) => {
                    existing.score = score.score;
                    existing.time = score.time;
                    existing.comments.extend(score.comments.iter().cloned());
                }
                None => stored.push(score.clone()),
            }
        }

        Ok(())
    }

    async fn update_comments(&self, assignment_lms_id: &str, comments: &[CommentUpdate]) -> anyhow::Result<()> {
        let mut state = self.state();
        state
            .comment_updates
            .entry(assignment_lms_id.to_string())
            .or_default()
            .extend(comments.iter().cloned());

        if let Some(stored) = state.scores.get_mut(assignment_lms_id) {
            for update in comments {
                let comment = stored
                    .iter_mut()
                    .filter(|score| score.user_id == update.user_id)
                    .flat_map(|score| score.comments.iter_mut())
                    .find(|comment| comment.id == update.comment.id);
                if let Some(comment) = comment {
                    comment.text = update.comment.text.clone();
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::lms::LmsComment;

    #[tokio::test]
    async fn uploads_update_stored_scores() {
        let lms = FakeLms::new();
        lms.set_scores(
            "a1",
            vec![LmsScore {
                user_id: String::from("u1"),
                score: 1.0,
                comments: vec![LmsComment { id: String::from("c1"), author: String::new(), text: String::from("old") }],
                ..LmsScore::default()
            }],
        );

        let upload = LmsScore { user_id: String::from("u1"), score: 5.0, ..LmsScore::default() };
        lms.update_assignment_scores("a1", &[upload]).await.expect("upload");
        lms.update_comments(
            "a1",
            &[CommentUpdate {
                user_id: String::from("u1"),
                comment: LmsComment { id: String::from("c1"), author: String::new(), text: String::from("new") },
            }],
        )
        .await
        .expect("comments");

        let scores = lms.fetch_assignment_scores("a1").await.expect("fetch");
        assert_eq!(scores[0].score, 5.0);
        assert_eq!(scores[0].comments[0].text, "new");
        assert_eq!(lms.uploads("a1").len(), 1);
        assert_eq!(lms.comment_updates("a1").len(), 1);
    }
}
