use anyhow::Context;

use crate::core::security;
use crate::core::state::AppState;
use crate::db::types::{CourseRole, ServerRole};
use crate::db::Backend;
use crate::models::user::ServerUser;
use crate::services::course_loader;

pub(crate) const TEST_COURSE_ID: &str = "course101";
/// Password of every seeded test user.
pub(crate) const TEST_PASSWORD: &str = "password";

/// The standard course users plus a server admin.
pub(crate) fn test_users() -> Vec<ServerUser> {
    let mut users: Vec<ServerUser> = [
        ("course-other@test.edulinq.org", CourseRole::Other),
        ("course-student@test.edulinq.org", CourseRole::Student),
        ("course-grader@test.edulinq.org", CourseRole::Grader),
        ("course-admin@test.edulinq.org", CourseRole::Admin),
        ("course-owner@test.edulinq.org", CourseRole::Owner),
    ]
    .into_iter()
    .map(|(email, role)| ServerUser::new(email, ServerRole::User).with_course(TEST_COURSE_ID, role))
    .collect();

    users.push(ServerUser::new("server-admin@test.edulinq.org", ServerRole::Admin));
    users
}

/// Insert the test users that are missing. Existing users are left untouched.
pub(crate) async fn seed_test_users(backend: &dyn Backend, with_passwords: bool) -> anyhow::Result<usize> {
    let existing = backend.get_server_users().await?;
    let mut missing = Vec::new();

    for mut user in test_users() {
        if existing.contains_key(&user.email) {
            continue;
        }
        if with_passwords {
            user.password_hash = Some(security::hash_password(TEST_PASSWORD)?);
        }
        missing.push(user);
    }

    if !missing.is_empty() {
        backend.upsert_users(&missing).await.context("Failed to seed test users")?;
        tracing::info!(count = missing.len(), "Seeded test users");
    }

    Ok(missing.len())
}

/// Optional test data, then every course under the courses root.
pub(crate) async fn startup(state: &AppState) -> anyhow::Result<()> {
    if state.settings().runtime().load_test_data {
        seed_test_users(state.backend().as_ref(), true).await?;
    }

    let courses = course_loader::load_courses_root(state).await?;
    tracing::info!(courses = courses.len(), "Startup complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryBackend;

    #[tokio::test]
    async fn seeding_only_adds_missing_users() {
        let backend = MemoryBackend::new();
        let mut custom = ServerUser::new("course-owner@test.edulinq.org", ServerRole::Creator);
        custom.name = Some(String::from("Custom"));
        backend.upsert_users(&[custom.clone()]).await.expect("upsert");

        assert_eq!(seed_test_users(&backend, false).await.expect("seed"), 5);
        assert_eq!(seed_test_users(&backend, false).await.expect("seed"), 0);

        let owner = backend.get_server_user(&custom.email).await.expect("get").expect("owner");
        assert_eq!(owner, custom);

        let student = backend
            .get_server_user("course-student@test.edulinq.org")
            .await
            .expect("get")
            .expect("student");
        assert_eq!(student.course_role(TEST_COURSE_ID), Some(CourseRole::Student));
        assert!(student.password_hash.is_none());
    }
}
