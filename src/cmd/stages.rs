//! Stage listing: `blueprint stages`.

use blueprint::models::Stage;

/// One-line description of what each stage does.
pub fn describe(stage: Stage) -> &'static str {
    match stage {
        Stage::Planning => "Turn the idea into a product plan (conversational)",
        Stage::Spec => "Write the technical specification (conversational)",
        Stage::Task => "Break the specification into a task list",
        Stage::Issue => "Write a tracker-ready body for each task",
        Stage::Publish => "Create the issues on GitHub and attach them to the board",
        Stage::Done => "Terminal: the run succeeded",
        Stage::Error => "Terminal: the run failed",
    }
}

pub fn cmd_stages() {
    println!();
    println!("{:<10} Description", "Stage");
    println!("{:<10} -----------", "--------");
    for stage in Stage::SEQUENCE {
        println!("{:<10} {}", stage.as_str(), describe(stage));
    }
    println!();
}
