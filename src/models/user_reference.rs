use std::collections::BTreeSet;

use crate::db::types::CourseRole;
use crate::models::user::CourseUser;

/// A parsed selection of course users.
///
/// Each raw token is an email, a course role, `*` for every enrolled role, or any of
/// those with a leading `-` to exclude instead of include.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CourseUserReference {
    emails: BTreeSet<String>,
    exclude_emails: BTreeSet<String>,
    roles: BTreeSet<CourseRole>,
    exclude_roles: BTreeSet<CourseRole>,
}

impl CourseUserReference {
    /// Parse raw tokens. Unknown roles are reported and skipped, the rest still applies.
    pub(crate) fn parse<S: AsRef<str>>(raw_references: &[S]) -> (Self, Vec<String>) {
        let mut reference = Self::default();
        let mut warnings = Vec::new();

        for raw in raw_references {
            let raw = raw.as_ref();
            let mut token = raw.trim().to_lowercase();
            if token.is_empty() {
                continue;
            }

            let exclude = token.starts_with('-');
            if exclude {
                token = token[1..].trim().to_string();
            }

            if token.contains('@') {
                let target = if exclude { &mut reference.exclude_emails } else { &mut reference.emails };
                target.insert(token);
                continue;
            }

            let roles: Vec<CourseRole> = if token == "*" {
                CourseRole::ENROLLED.to_vec()
            } else {
                match token.parse::<CourseRole>() {
                    Ok(role) => vec![role],
                    Err(_) => {
                        warnings.push(format!(
                            "User reference '{raw}' contains an unknown course role: '{token}'."
                        ));
                        continue;
                    }
                }
            };

            let target = if exclude { &mut reference.exclude_roles } else { &mut reference.roles };
            target.extend(roles);
        }

        (reference, warnings)
    }

    pub(crate) fn all() -> Self {
        Self { roles: CourseRole::ENROLLED.into_iter().collect(), ..Self::default() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.roles.is_empty()
    }

    fn excludes(&self, email: &str, role: CourseRole) -> bool {
        self.exclude_emails.contains(email) || self.exclude_roles.contains(&role)
    }

    pub(crate) fn refers_to(&self, email: &str, role: CourseRole) -> bool {
        if self.excludes(email, role) {
            return false;
        }

        self.emails.contains(email) || self.roles.contains(&role)
    }

    /// Sorted, duplicate free emails of the course users this reference selects.
    pub(crate) fn resolve(&self, users: &[CourseUser]) -> Vec<String> {
        let mut emails = BTreeSet::new();
        for user in users {
            if user.role == CourseRole::Unknown {
                tracing::warn!(user = %user.email, "Course user has no role, skipping");
                continue;
            }

            let email = user.email.to_lowercase();
            if self.refers_to(&email, user.role) {
                emails.insert(email);
            }
        }

        emails.into_iter().collect()
    }
}
