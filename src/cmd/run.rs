//! Interactive pipeline execution: `blueprint run`.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use blueprint::models::{PublishReport, Stage};

/// Spinner caption for the stage about to run.
fn stage_caption(stage: Stage) -> &'static str {
    match stage {
        Stage::Planning => "Planning the product...",
        Stage::Spec => "Writing the technical specification...",
        Stage::Task => "Breaking the specification into tasks...",
        Stage::Issue => "Writing issue bodies...",
        Stage::Publish => "Publishing issues to GitHub...",
        // The stage hook never fires for terminal stages.
        Stage::Done | Stage::Error => "",
    }
}

/// Render the publish outcome as a printable block.
///
/// Pure so tests can pin the layout without capturing stdout.
pub fn render_report(report: &PublishReport) -> String {
    let mut out = String::new();
    if report.created.is_empty() {
        out.push_str("\nNo issues were created.\n");
    } else {
        out.push_str(&format!(
            "\nCreated {} issue(s):\n",
            console::style(report.created.len()).green().bold()
        ));
        for issue in &report.created {
            out.push_str(&format!(
                "  {} {} {}\n",
                console::style(format!("#{}", issue.number)).cyan(),
                issue.title,
                console::style(&issue.url).dim()
            ));
        }
    }
    if !report.errors.is_empty() {
        out.push_str(&format!(
            "\n{} {} problem(s):\n",
            console::style("⚠").yellow(),
            report.errors.len()
        ));
        for error in &report.errors {
            out.push_str(&format!("  - {}\n", error));
        }
    }
    out
}

/// Drive one pipeline run end to end, prompting for the idea and for any
/// clarifying questions along the way.
pub async fn cmd_run(query: Option<String>) -> Result<()> {
    use blueprint::chat::{ChatApi, ChatClient};
    use blueprint::config::Config;
    use blueprint::github::GitHubTracker;
    use blueprint::pipeline::{PipelineRunner, RunStatus};
    use blueprint::publisher::Tracker;
    use blueprint::store::{MemoryStore, RecordStore};
    use dialoguer::Input;
    use indicatif::{ProgressBar, ProgressStyle};

    let config = Config::from_env();

    let query = match query {
        Some(q) if !q.trim().is_empty() => q,
        _ => Input::new()
            .with_prompt("What do you want to build?")
            .interact_text()
            .context("Failed to read the product idea")?,
    };

    let chat: Arc<dyn ChatApi> = Arc::new(ChatClient::new(
        config.chat.base_url.clone(),
        config.chat.user.clone(),
    )?);

    let tracker: Option<Arc<dyn Tracker>> = if config.tracker.is_configured() {
        let github = GitHubTracker::new(
            config.tracker.token.clone(),
            config.tracker.owner.clone(),
            config.tracker.repo.clone(),
        )?;
        Some(Arc::new(github))
    } else {
        println!(
            "{} GitHub is not configured (set GITHUB_TOKEN, GITHUB_OWNER, GITHUB_REPO); the publish stage will fail.",
            console::style("⚠").yellow()
        );
        None
    };

    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

    println!("Starting the planning pipeline...");
    println!("Answer any clarifying questions; the final plan is published as tracker issues.");
    println!();

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string"),
    );
    spinner.set_prefix("Stage");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let stage_spinner = spinner.clone();
    let runner = PipelineRunner::new(
        chat,
        tracker,
        store,
        config.chat.clone(),
        config.tracker.board_number,
    )
    .on_stage_start(move |stage| {
        stage_spinner.set_message(stage_caption(stage));
    });

    let (mut state, mut status) = runner.start(&query).await;

    // Clarifying questions pause the drive; each answer feeds back in
    // until the run terminates.
    let final_stage = loop {
        match status {
            RunStatus::AwaitingInput { stage, question } => {
                let answer: String = spinner
                    .suspend(|| {
                        println!();
                        println!("{} {}", console::style("?").cyan().bold(), question);
                        Input::new().with_prompt("Your answer").interact_text()
                    })
                    .context("Failed to read the clarifying answer")?;
                status = runner.resume(&mut state, stage, &answer).await?;
            }
            RunStatus::Finished(stage) => break stage,
        }
    };

    spinner.finish_and_clear();

    match final_stage {
        Stage::Done => {
            println!();
            println!(
                "{} Run {} complete.",
                console::style("✔").green().bold(),
                console::style(state.run_id).dim()
            );
            if let Some(report) = state
                .stage_output
                .get(&Stage::Publish)
                .and_then(|output| output.as_report())
            {
                print!("{}", render_report(report));
            }
            Ok(())
        }
        stage => {
            let reason = state
                .error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string());
            println!();
            println!("{} {}", console::style("Run failed:").red().bold(), reason);
            anyhow::bail!("pipeline run {} stopped at {}", state.run_id, stage)
        }
    }
}
