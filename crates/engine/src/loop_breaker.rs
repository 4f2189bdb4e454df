use postproc_core::models::CommitRecord;

/// Number of trailing commits inspected for a loop.
pub const LOOP_WINDOW: usize = 5;

/// Whether the post-processor appears to be fighting itself: the last
/// [`LOOP_WINDOW`] commits were all authored by it.
pub fn has_loop(commits: &[CommitRecord], signature: &str) -> bool {
    if commits.len() < LOOP_WINDOW {
        return false;
    }
    commits[commits.len() - LOOP_WINDOW..].iter().all(|c| is_post_processor_commit(c, signature))
}

pub fn last_commit_is_post_processor(commits: &[CommitRecord], signature: &str) -> bool {
    commits.last().is_some_and(|c| is_post_processor_commit(c, signature))
}

/// Most recent commit that the post-processor did not push.
pub fn latest_commit_by_others<'a>(
    commits: &'a [CommitRecord],
    signature: &str,
) -> Option<&'a CommitRecord> {
    commits.iter().filter(|c| !is_post_processor_commit(c, signature)).max_by_key(|c| c.timestamp)
}

fn is_post_processor_commit(commit: &CommitRecord, signature: &str) -> bool {
    commit.message == signature
}
