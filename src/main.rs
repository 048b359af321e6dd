use anyhow::{bail, Context};
use branchdb::config::AppConfig;
use branchdb::logic::{BranchService, HistoryEntry, JobRunner, MergeStrategy, NewBranch};
use branchdb::model::{BranchAction, ObjectKey};
use branchdb::store::{BranchStore, NoPendingMigrations, PostgresStore};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    let config = AppConfig::load()?;
    let registry = config.registry()?;

    let database_url = config.database_url()?;
    let store = PostgresStore::new(
        &database_url,
        registry.clone(),
        &config.branching.main_schema,
        config.database.max_connections.unwrap_or(20),
    )
    .await?;
    store.migrate().await?;

    let service = Arc::new(BranchService::new(
        Arc::new(store),
        registry,
        config.branching.clone(),
    ));
    let runner = Arc::new(JobRunner::new(service.clone(), Arc::new(NoPendingMigrations)));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let squash = args.iter().any(|a| a == "--squash");
    let user = args
        .iter()
        .position(|a| a == "--user")
        .and_then(|i| args.get(i + 1))
        .cloned();
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();

    let command = positional.first().map(|s| s.as_str()).unwrap_or("help");
    match command {
        "branches" => {
            for branch in service.store().list_branches().await? {
                println!(
                    "{:<24} {:<20} last_sync={:?}",
                    branch.name,
                    branch.status.to_string(),
                    branch.last_sync
                );
            }
        }
        "create" => {
            let name = required(&positional, 1, "create <name>")?;
            let branch = service
                .create_branch(NewBranch {
                    name: name.to_string(),
                    owner: user.clone(),
                    description: None,
                })
                .await?;
            println!("created branch {} ({})", branch.name, branch.id);
            let outcome = runner
                .run(BranchAction::Provision, branch.id, user, true)
                .await;
            outcome.result?;
            println!("provisioned");
        }
        "provision" | "sync" | "merge" | "revert" | "migrate" | "archive" => {
            let name = required(&positional, 1, "<command> <branch>")?;
            let branch = service.get_by_name(name).await?;
            let report = if command == "merge" && squash {
                service
                    .merge(&branch.id, user.as_deref(), !dry_run, MergeStrategy::Squash)
                    .await?
            } else {
                let action = match command {
                    "provision" => BranchAction::Provision,
                    "sync" => BranchAction::Sync,
                    "merge" => BranchAction::Merge,
                    "revert" => BranchAction::Revert,
                    "migrate" => BranchAction::Migrate,
                    _ => BranchAction::Archive,
                };
                runner.run(action, branch.id, user, !dry_run).await.result?
            };
            println!(
                "{} {}: {} applied, {} skipped{}",
                report.operation,
                branch.name,
                report
                    .outcomes
                    .iter()
                    .filter(|o| o.disposition == branchdb::logic::Disposition::Applied)
                    .count(),
                report
                    .outcomes
                    .iter()
                    .filter(|o| o.disposition == branchdb::logic::Disposition::Skipped)
                    .count(),
                if report.dry_run { " (dry run)" } else { "" }
            );
        }
        "delete" => {
            let name = required(&positional, 1, "delete <branch>")?;
            let branch = service.get_by_name(name).await?;
            service.delete_branch(&branch.id).await?;
            println!("deleted branch {name}");
        }
        "diff" => {
            let name = required(&positional, 1, "diff <branch>")?;
            let branch = service.get_by_name(name).await?;
            for diff in service.refresh_diffs(&branch.id).await? {
                let marker = if diff.has_conflicts() { "!" } else { " " };
                println!(
                    "{marker} {} {}:{} conflicts={:?}",
                    diff.action, diff.object_type, diff.object_id, diff.conflicts
                );
            }
        }
        "ack" => {
            let name = required(&positional, 1, "ack <branch> <type:id>")?;
            let target = required(&positional, 2, "ack <branch> <type:id>")?;
            let branch = service.get_by_name(name).await?;
            let object = parse_object_key(target)?;
            if service.acknowledge(&branch.id, &object).await? {
                println!("acknowledged {object}");
            } else {
                println!("no diff recorded for {object}");
            }
        }
        "history" => {
            let name = required(&positional, 1, "history <branch>")?;
            let branch = service.get_by_name(name).await?;
            for entry in service.event_history(&branch.id).await? {
                match entry {
                    HistoryEntry::Event(event) => {
                        println!("{} {}", event.time.to_rfc3339(), event.kind)
                    }
                    HistoryEntry::Changes(summary) => {
                        println!("  ... {} changes", summary.count)
                    }
                }
            }
        }
        _ => {
            println!("branchdb: schema-isolated branching for a relational data store");
            println!();
            println!("usage: branchdb <command> [args] [--dry-run] [--squash] [--user <name>]");
            println!("  branches                list branches and their status");
            println!("  create <name>           create and provision a branch");
            println!("  provision <branch>      provision a new branch's namespace");
            println!("  sync <branch>           replay main's changelog into the branch");
            println!("  merge <branch>          replay the branch's changelog into main");
            println!("  revert <branch>         undo a merged branch");
            println!("  migrate <branch>        apply pending schema migrations");
            println!("  archive <branch>        deprovision and archive");
            println!("  delete <branch>         remove a branch entirely");
            println!("  diff <branch>           show per-object diffs and conflicts");
            println!("  ack <branch> <type:id>  acknowledge a conflicted object");
            println!("  history <branch>        show branch event history");
        }
    }

    Ok(())
}

fn required<'a>(positional: &'a [&'a String], index: usize, usage: &str) -> anyhow::Result<&'a str> {
    positional
        .get(index)
        .map(|s| s.as_str())
        .with_context(|| format!("usage: branchdb {usage}"))
}

fn parse_object_key(s: &str) -> anyhow::Result<ObjectKey> {
    let Some((object_type, id)) = s.split_once(':') else {
        bail!("expected <type:id>, got {s:?}");
    };
    Ok(ObjectKey::new(object_type, id.parse()?))
}
