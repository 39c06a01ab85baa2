//! Best-effort publication of generated issues to the tracker.
//!
//! Every input issue is attempted; failures are enumerated in the
//! report's `errors` list and never abort the batch. A report with
//! errors is still a completed publish run.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::PublishError;
use crate::models::{GeneratedIssue, PublishReport, PublishedIssue};

/// Issue tracker capability the publisher drives.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Create one ticket, returning the tracker's identifiers for it.
    async fn create_issue(&self, issue: &GeneratedIssue) -> Result<PublishedIssue, PublishError>;

    /// Resolve a tracking board number to its node id. Attachment is
    /// optional, so every failure mode collapses to `None`.
    async fn resolve_board_id(&self, number: u32) -> Option<String>;

    /// Attach a created ticket to a board; `None` on failure.
    async fn attach_to_board(&self, board_id: &str, node_id: &str) -> Option<String>;
}

/// Inputs for one publish run.
pub struct PublishRequest<'a> {
    pub issues: &'a [GeneratedIssue],
    /// Board to attach created tickets to, when configured.
    pub board_number: Option<u32>,
    /// Board id resolved earlier in the run; skips a fresh lookup.
    pub board_id: Option<String>,
}

/// The report plus the board id for the caller to cache.
pub struct PublishOutcome {
    pub report: PublishReport,
    pub board_id: Option<String>,
}

/// Publish every issue in order, collecting successes and failures.
///
/// A failed board resolution degrades the run: tickets are still
/// created, with one errors entry noting the board. A failed attach
/// leaves the ticket in `created` alongside an errors entry.
pub async fn publish(tracker: &dyn Tracker, request: PublishRequest<'_>) -> PublishOutcome {
    let mut report = PublishReport::default();

    let board_id = match (request.board_id, request.board_number) {
        (Some(id), _) => Some(id),
        (None, Some(number)) => {
            let resolved = tracker.resolve_board_id(number).await;
            if resolved.is_none() {
                warn!("Could not resolve tracking board #{}", number);
                report
                    .errors
                    .push(format!("Failed to resolve tracking board #{}", number));
            }
            resolved
        }
        (None, None) => None,
    };

    for issue in request.issues {
        let published = match tracker.create_issue(issue).await {
            Ok(published) => published,
            Err(e) => {
                warn!("Failed to create issue '{}': {}", issue.title, e);
                report
                    .errors
                    .push(format!("Failed to create issue '{}': {}", issue.title, e));
                continue;
            }
        };
        info!("Created issue #{}: {}", published.number, published.title);

        if let Some(board_id) = board_id.as_deref() {
            if published.node_id.is_empty() {
                report.errors.push(format!(
                    "Issue #{} has no node id, cannot attach it to the board",
                    published.number
                ));
            } else if tracker
                .attach_to_board(board_id, &published.node_id)
                .await
                .is_none()
            {
                report.errors.push(format!(
                    "Created issue #{} but failed to attach it to the board",
                    published.number
                ));
            }
        }
        report.created.push(published);
    }

    PublishOutcome { report, board_id }
}
