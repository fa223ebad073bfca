use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lookalike::config::MatchConfig;
use lookalike::database::models::{NewTargetGroup, SelectionChoice};
use lookalike::database::{default_database_path, SqliteStore};
use lookalike::services::{ExportOptions, ProjectRunner, SourceMatches};
use lookalike::workers::TaskKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lookalike", version, about = "Match source images to their look-alikes")]
struct Cli {
    /// SQLite database (default: `<data dir>/lookalike/lookalike.db`)
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    /// JSON file with matching options
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCmd,
    },

    /// Index new files under the source and target roots
    Index { project: String },

    /// Index, then rank target candidates for every source image
    Compare { project: String },

    /// Show ranked candidates and selections
    Candidates {
        project: String,
        /// Candidates shown per target group
        #[arg(long, default_value_t = 3)]
        limit: usize,
    },

    /// Pick a candidate for a source in one target group
    Select {
        source: String,
        group: String,
        candidate: String,
    },

    /// Record that a source has no match in a target group
    NoMatch { source: String, group: String },

    /// Mark a source as reviewed
    Confirm {
        source: String,
        /// Clear the confirmation instead
        #[arg(long)]
        undo: bool,
    },

    /// Copy selected matches into an output tree
    Export {
        project: String,
        /// Output directory (default: `<source parent>/<name>_Output`)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
        /// Write a gray placeholder for "no match" selections
        #[arg(long)]
        placeholder: bool,
        /// Only export confirmed sources
        #[arg(long)]
        only_confirmed: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCmd {
    /// Create a project
    Create {
        #[arg(short, long)]
        name: String,
        /// Source directory
        #[arg(short, long, value_name = "DIR")]
        source: PathBuf,
        /// Target group as `name=DIR`, repeatable
        #[arg(short, long = "target", value_name = "NAME=DIR", value_parser = parse_target, required = true)]
        targets: Vec<NewTargetGroup>,
    },

    /// List projects, newest first
    List,

    /// Show one project
    Show { project: String },

    /// Stop a project's jobs and delete it with all its data
    Delete { project: String },
}

fn parse_target(raw: &str) -> Result<NewTargetGroup, String> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=DIR, got `{}`", raw))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=DIR, got `{}`", raw));
    }
    Ok(NewTargetGroup {
        name: name.to_string(),
        path: path.to_string(),
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MatchConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MatchConfig::default(),
    };
    let db_path = match cli.db {
        Some(path) => path,
        None => default_database_path()?,
    };
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let runner = ProjectRunner::new(Arc::new(store), config);

    match cli.command {
        Commands::Project { command } => match command {
            ProjectCmd::Create {
                name,
                source,
                targets,
            } => {
                let source = source
                    .canonicalize()
                    .with_context(|| format!("Source directory {:?} not found", source))?;
                let targets = targets
                    .into_iter()
                    .map(|target| {
                        let path = PathBuf::from(&target.path).canonicalize().with_context(|| {
                            format!("Target directory {:?} not found", target.path)
                        })?;
                        Ok(NewTargetGroup {
                            name: target.name,
                            path: path.to_string_lossy().to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                let project =
                    runner.create_project(&name, &source.to_string_lossy(), &targets)?;
                println!("▶ Created project {} ({})", project.name, project.id);
            }

            ProjectCmd::List => {
                let projects = runner.store().list_projects()?;
                if projects.is_empty() {
                    println!("No projects yet.");
                }
                for project in projects {
                    println!(
                        "{}  {:<10} {}  {}",
                        project.id,
                        project.status.as_str(),
                        project.name,
                        project.source_path
                    );
                }
            }

            ProjectCmd::Show { project } => {
                let project = runner.store().get_project(&project)?;
                println!("{} ({})", project.name, project.id);
                println!("  status:  {}", project.status.as_str());
                if let Some(message) = &project.error_message {
                    println!("  error:   {}", message);
                }
                println!("  source:  {}", project.source_path);
                for group in runner.store().target_groups(&project.id)? {
                    println!("  target:  {} = {} ({})", group.name, group.path, group.id);
                }
                let stats = runner.stats(&project.id)?;
                println!(
                    "  files:   {}/{} compared ({:.1}%)",
                    stats.processed, stats.total_files, stats.progress
                );
            }

            ProjectCmd::Delete { project } => {
                runner.delete_project(&project).await?;
                println!("▶ Deleted project {}", project);
            }
        },

        Commands::Index { project } => {
            let handle = runner.start_indexing(&project)?;
            benchmark("indexing", watch(&runner, &project, TaskKind::Indexing, handle)).await?;
            report_status(&runner, &project)?;
        }

        Commands::Compare { project } => {
            let handle = runner.start_comparison(&project)?;
            benchmark("comparison", watch(&runner, &project, TaskKind::Comparison, handle))
                .await?;
            report_status(&runner, &project)?;
        }

        Commands::Candidates { project, limit } => {
            for source in runner.matches(&project)? {
                print_matches(&source, limit);
            }
        }

        Commands::Select {
            source,
            group,
            candidate,
        } => {
            runner.select_candidate(&source, &group, &candidate)?;
            println!("▶ Selected {} for {}", candidate, source);
        }

        Commands::NoMatch { source, group } => {
            runner.mark_no_match(&source, &group)?;
            println!("▶ Marked {} as no match in {}", source, group);
        }

        Commands::Confirm { source, undo } => {
            runner.confirm(&source, !undo)?;
            println!("▶ {} {}", if undo { "Unconfirmed" } else { "Confirmed" }, source);
        }

        Commands::Export {
            project,
            output,
            placeholder,
            only_confirmed,
        } => {
            let options = ExportOptions {
                output_dir: output,
                use_placeholder: placeholder,
                only_confirmed,
            };
            let handle = runner.start_export(&project, options)?;
            benchmark("export", watch(&runner, &project, TaskKind::Export, handle)).await?;
        }
    }

    Ok(())
}

/// Mirror a job's progress in a bar until it exits. Ctrl-C cancels the job.
async fn watch(
    runner: &ProjectRunner,
    project_id: &str,
    kind: TaskKind,
    mut handle: JoinHandle<()>,
) -> Result<()> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg:<30!} [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("#>-"),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            result = &mut handle => {
                if let Err(e) = result {
                    bar.abandon_with_message("Job crashed");
                    bail!("{} job for {} crashed: {}", kind, project_id, e);
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                bar.set_message("Cancelling…");
                runner.cancel(project_id, kind);
            }
            _ = ticker.tick() => {
                if let Some(progress) = runner.progress(project_id, kind) {
                    bar.set_length(progress.total as u64);
                    bar.set_position(progress.processed as u64);
                    bar.set_message(progress.current_item);
                }
            }
        }
    }

    bar.finish_and_clear();
    Ok(())
}

fn report_status(runner: &ProjectRunner, project_id: &str) -> Result<()> {
    let project = runner.store().get_project(project_id)?;
    match &project.error_message {
        Some(message) => println!("✗ {} is {}: {}", project.name, project.status.as_str(), message),
        None => println!("▶ {} is {}", project.name, project.status.as_str()),
    }
    Ok(())
}

fn print_matches(source: &SourceMatches, limit: usize) {
    let mark = if source.confirmed { "✓" } else { " " };
    println!("{} {} ({})", mark, source.source.relative_path, source.source.id);

    for group in &source.groups {
        let selected = group.selection.as_ref().map(|s| &s.choice);
        match selected {
            Some(SelectionChoice::NoMatch) => println!("    [{}] no match", group.group.name),
            _ if group.candidates.is_empty() => println!("    [{}] no candidates", group.group.name),
            _ => println!("    [{}]", group.group.name),
        }

        for candidate in group.candidates.iter().take(limit) {
            let chosen = matches!(selected, Some(SelectionChoice::Candidate(id)) if *id == candidate.id);
            println!(
                "      {} #{:<2} {:>6.2}%  {}  ({})",
                if chosen { "▶" } else { " " },
                candidate.rank,
                candidate.similarity_score,
                candidate.file_path,
                candidate.id
            );
        }
    }
}

/// Await `f`, print how long it took (with `label`), and return its result.
async fn benchmark<T, F: std::future::Future<Output = T>>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f.await;
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
