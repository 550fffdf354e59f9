use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, LINK};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{CommentUpdate, LmsAdapter, LmsComment, LmsScore, LmsUser};
use crate::core::time::Timestamp;
use crate::db::types::CourseRole;
use crate::models::course::LmsConfig;

const PAGE_SIZE: u32 = 75;
const MAX_PAGES: usize = 200;

#[derive(Debug, Deserialize)]
struct CanvasUser {
    id: serde_json::Value,
    #[serde(default)]
    name: String,
    #[serde(rename = "login_id", default)]
    email: Option<String>,
    #[serde(default)]
    enrollments: Vec<CanvasEnrollment>,
}

#[derive(Debug, Deserialize)]
struct CanvasEnrollment {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    role: String,
}

#[derive(Debug, Deserialize)]
struct CanvasSubmission {
    user_id: serde_json::Value,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    submitted_at: Option<String>,
    #[serde(default)]
    submission_comments: Vec<CanvasComment>,
}

#[derive(Debug, Deserialize)]
struct CanvasComment {
    id: serde_json::Value,
    #[serde(default)]
    author_id: serde_json::Value,
    #[serde(default)]
    comment: String,
}

/// Canvas REST API with a bearer token.
#[derive(Debug, Clone)]
pub(crate) struct CanvasAdapter {
    client: Client,
    base_url: String,
    course_id: String,
    token: String,
}

impl CanvasAdapter {
    pub(crate) fn new(config: &LmsConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            bail!("Canvas LMS config needs a base URL");
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build Canvas HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            course_id: config.course_id.clone(),
            token: config.api_token.clone(),
        })
    }

    fn course_url(&self, path: &str) -> String {
        format!("{}/api/v1/courses/{}{}", self.base_url, self.course_id, path)
    }

    /// Every page of a list endpoint, following `Link: <...>; rel="next"`.
    async fn get_all<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(url);

        for _ in 0..MAX_PAGES {
            let Some(url) = next.take() else {
                return Ok(items);
            };

            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await
                .context("Failed to call Canvas API")?;

            let status = response.status();
            next = next_link(response.headers());
            let body = response.text().await.context("Failed to read Canvas response")?;
            if !status.is_success() {
                bail!("Canvas request failed (status {status}): {body}");
            }

            let page: Vec<T> = serde_json::from_str(&body)
                .with_context(|| format!("Canvas returned an unexpected body for {url}"))?;
            items.extend(page);
        }

        tracing::warn!(max_pages = MAX_PAGES, "Canvas listing hit the page limit");
        Ok(items)
    }

    async fn send_form(&self, request: reqwest::RequestBuilder, form: &[(String, String)]) -> Result<()> {
        let response = request
            .bearer_auth(&self.token)
            .form(form)
            .send()
            .await
            .context("Failed to call Canvas API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Canvas request failed (status {status}): {body}");
        }

        Ok(())
    }
}

#[async_trait]
impl LmsAdapter for CanvasAdapter {
    async fn fetch_users(&self) -> Result<Vec<LmsUser>> {
        let url = self.course_url(&format!("/users?include[]=enrollments&per_page={PAGE_SIZE}"));
        let users: Vec<CanvasUser> = self.get_all(url).await?;

        Ok(users
            .into_iter()
            .map(|user| LmsUser {
                id: id_string(&user.id),
                name: user.name,
                email: user.email.unwrap_or_default().trim().to_lowercase(),
                role: user
                    .enrollments
                    .iter()
                    .map(|enrollment| enrollment_role(&enrollment.kind).max(enrollment_role(&enrollment.role)))
                    .max()
                    .unwrap_or(CourseRole::Other),
            })
            .collect())
    }

    async fn fetch_assignment_scores(&self, assignment_lms_id: &str) -> Result<Vec<LmsScore>> {
        let url = self.course_url(&format!(
            "/assignments/{assignment_lms_id}/submissions?include[]=submission_comments&per_page={PAGE_SIZE}"
        ));
        let submissions: Vec<CanvasSubmission> = self.get_all(url).await?;

        Ok(submissions
            .into_iter()
            .map(|submission| LmsScore {
                user_id: id_string(&submission.user_id),
                score: submission.score.unwrap_or_default(),
                time: submission
                    .submitted_at
                    .as_deref()
                    .and_then(Timestamp::parse_rfc3339),
                comments: submission
                    .submission_comments
                    .into_iter()
                    .map(|comment| LmsComment {
                        id: id_string(&comment.id),
                        author: id_string(&comment.author_id),
                        text: comment.comment,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn update_assignment_scores(&self, assignment_lms_id: &str, scores: &[LmsScore]) -> Result<()> {
        if scores.is_empty() {
            return Ok(());
        }

        let mut form = Vec::new();
        for score in scores {
            form.push((format!("grade_data[{}][posted_grade]", score.user_id), score.score.to_string()));
            for comment in &score.comments {
                form.push((format!("grade_data[{}][text_comment]", score.user_id), comment.text.clone()));
            }
        }

        let url = self.course_url(&format!("/assignments/{assignment_lms_id}/submissions/update_grades"));
        self.send_form(self.client.post(url), &form)
            .await
            .with_context(|| format!("Failed to upload scores for LMS assignment '{assignment_lms_id}'"))
    }

    async fn update_comments(&self, assignment_lms_id: &str, comments: &[CommentUpdate]) -> Result<()> {
        for update in comments {
            let url = self.course_url(&format!(
                "/assignments/{assignment_lms_id}/submissions/{}/comments/{}",
                update.user_id, update.comment.id
            ));
            let form = [(String::from("comment"), update.comment.text.clone())];
            self.send_form(self.client.put(url), &form)
                .await
                .with_context(|| format!("Failed to update LMS comment '{}'", update.comment.id))?;
        }

        Ok(())
    }
}

/// Canvas enrollment types and role names mapped onto course roles.
fn enrollment_role(value: &str) -> CourseRole {
    match value {
        "ObserverEnrollment" | "DesignerEnrollment" => CourseRole::Other,
        "StudentEnrollment" => CourseRole::Student,
        "TaEnrollment" => CourseRole::Grader,
        "TA - Site Manager" => CourseRole::Admin,
        "TeacherEnrollment" => CourseRole::Owner,
        _ => CourseRole::Unknown,
    }
}

/// Canvas ids come back as numbers or strings depending on the endpoint.
fn id_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn next_link(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(LINK)?.to_str().ok()?;
    value.split(',').find_map(|part| {
        let (url, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        Some(url.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    })
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn enrollment_roles_take_the_highest() {
        let roles = [enrollment_role("StudentEnrollment"), enrollment_role("TA - Site Manager")];
        assert_eq!(roles.into_iter().max(), Some(CourseRole::Admin));
        assert_eq!(enrollment_role("custom"), CourseRole::Unknown);
    }

    #[test]
    fn next_page_comes_from_the_link_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://canvas/api/v1/x?page=1>; rel=\"current\", <https://canvas/api/v1/x?page=2>; rel=\"next\"",
            ),
        );
        assert_eq!(next_link(&headers).as_deref(), Some("https://canvas/api/v1/x?page=2"));
        assert_eq!(next_link(&HeaderMap::new()), None);
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        assert_eq!(id_string(&serde_json::json!(42)), "42");
        assert_eq!(id_string(&serde_json::json!("42")), "42");
        assert_eq!(id_string(&serde_json::Value::Null), "");
    }
}
