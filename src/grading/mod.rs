pub(crate) mod analysis;
pub(crate) mod expected;
mod grade;
pub(crate) mod regrade;
pub(crate) mod reject;

pub(crate) use grade::{
    grade, resolve_proxy_time, timeout_message, GradeError, GradeOptions, GradeOutcome, CANCELED_MESSAGE,
};
