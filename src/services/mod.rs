pub(crate) mod archive;
pub(crate) mod course_loader;
pub(crate) mod email;
pub(crate) mod lms;
pub(crate) mod sandbox;
pub(crate) mod similarity;
