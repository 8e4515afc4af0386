//! Label and annotation keys shared by admission and the pod watcher.
//!
//! The job UUID label is the only coupling between the two halves of the
//! controller: the admitter writes it, the watcher reads it back.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Label carrying the upstream job UUID. Immutable once the Job is created.
pub const LABEL_JOB_UUID: &str = "buildkite.com/job-uuid";
/// Label marking resources created by this controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "stack-controller";

/// Prefix for annotations that carry upstream agent tags. The part after
/// the `/` is the start of the annotation name segment.
pub const ANNOTATION_TAG_PREFIX: &str = "buildkite.com/tag-";
/// Annotation holding the upstream command, for operators inspecting a Job
pub const ANNOTATION_COMMAND: &str = "buildkite.com/command";

/// Returns the raw job UUID label value, if the object carries one.
#[must_use]
pub fn job_uuid_label(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_JOB_UUID))
        .map(String::as_str)
}

/// Kubernetes limit for the name segment of a label or annotation key
pub const MAX_NAME_SEGMENT_LEN: usize = 63;

/// Annotation key for an agent tag, or `None` if nothing usable survives
/// sanitizing.
///
/// The whole name segment (`tag-<key>`) is kept within
/// [`MAX_NAME_SEGMENT_LEN`].
#[must_use]
pub fn tag_annotation_key(tag_key: &str) -> Option<String> {
    let (_, segment_prefix) = ANNOTATION_TAG_PREFIX
        .split_once('/')
        .unwrap_or(("", ANNOTATION_TAG_PREFIX));
    let suffix = sanitize_annotation_suffix(tag_key, MAX_NAME_SEGMENT_LEN - segment_prefix.len());
    if suffix.is_empty() {
        None
    } else {
        Some(format!("{ANNOTATION_TAG_PREFIX}{suffix}"))
    }
}

/// Makes an arbitrary string usable as the tail of an annotation name
/// segment, at most `max_len` characters long.
#[must_use]
pub fn sanitize_annotation_suffix(input: &str, max_len: usize) -> String {
    let mut sanitized = input.to_lowercase().replace([' ', '_', '/'], "-");
    sanitized.retain(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    let trimmed = sanitized.trim_matches(|c: char| !c.is_ascii_alphanumeric());

    let mut out = trimmed.to_string();
    if out.len() > max_len {
        out.truncate(max_len);
        if let Some(last) = out.rfind(|c: char| c.is_ascii_alphanumeric()) {
            out.truncate(last + 1);
        }
    }
    out
}
