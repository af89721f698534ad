use anyhow::Result;
use entropy_sync::{MirrorScores, SyncLimits};

use crate::config::AppConfig;

/// Show each repository's local revision and the health of its mirrors.
pub fn run(config: &AppConfig) -> Result<()> {
    let repositories = config.repositories(&[])?;
    if repositories.is_empty() {
        println!("No repositories configured.");
        return Ok(());
    }

    let threshold = SyncLimits::default().failure_threshold;
    let scores = MirrorScores::load(&config.scores_path(), threshold)?;

    for repo in &repositories {
        let revision = match repo.local_revision() {
            Some(r) => format!("revision {r}"),
            None => "never synced".to_owned(),
        };
        println!("{}  {revision}  {}", repo.id, repo.local_path.display());
        for mirror in &repo.metadata_mirrors {
            let score = scores.score(mirror);
            let state = if score.cooldown || score.score >= threshold {
                "quarantined"
            } else {
                "ok"
            };
            println!("    {mirror}  score {} ({state})", score.score);
        }
    }
    Ok(())
}
