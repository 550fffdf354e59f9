//! Learning-management-system adapters.

mod canvas;
mod fake;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::time::Timestamp;
use crate::db::types::CourseRole;
use crate::models::course::{LmsConfig, LmsKind};

pub(crate) use canvas::CanvasAdapter;
pub(crate) use fake::FakeLms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LmsUser {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) email: String,
    pub(crate) role: CourseRole,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LmsComment {
    pub(crate) id: String,
    pub(crate) author: String,
    pub(crate) text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct LmsScore {
    pub(crate) user_id: String,
    pub(crate) score: f64,
    pub(crate) time: Option<Timestamp>,
    pub(crate) comments: Vec<LmsComment>,
}

/// An existing comment to rewrite in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommentUpdate {
    pub(crate) user_id: String,
    pub(crate) comment: LmsComment,
}

#[async_trait]
pub(crate) trait LmsAdapter: Send + Sync {
    async fn fetch_users(&self) -> anyhow::Result<Vec<LmsUser>>;

    async fn fetch_assignment_scores(&self, assignment_lms_id: &str) -> anyhow::Result<Vec<LmsScore>>;

    /// New comments attached to a score are posted along with it.
    async fn update_assignment_scores(&self, assignment_lms_id: &str, scores: &[LmsScore]) -> anyhow::Result<()>;

    async fn update_comments(&self, assignment_lms_id: &str, comments: &[CommentUpdate]) -> anyhow::Result<()>;
}

/// The adapter for a course's LMS config. Test courses share the process-wide fake.
pub(crate) fn adapter_for(config: &LmsConfig, fake: &Arc<FakeLms>) -> anyhow::Result<Arc<dyn LmsAdapter>> {
    match config.kind {
        LmsKind::Canvas => Ok(Arc::new(CanvasAdapter::new(config)?)),
        LmsKind::Test => Ok(fake.clone()),
    }
}
