use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use timeline::core::{BookKey, Project, TimelineView};
use timeline::projectors::outline_projector;
use timeline::storage::{JsonProjectRepository, OutlineParser, ProjectRepository};
use timeline::{Instruction, StarOutlineParser, format_outline, format_rows, try_apply};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "timeline",
    about = "Story timeline tooling built on the timeline crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import a star outline as a new book.
    Import(ImportArgs),

    /// Print a book's timeline.
    Show(ShowArgs),

    /// Apply a JSON list of instructions to a project.
    Apply(ApplyArgs),

    /// Validate a project's structure.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Outline file (`*` act, `**` chapter, `***` scene).
    outline: PathBuf,
    /// Project file to add the book to. Created when missing.
    #[arg(long)]
    project: PathBuf,
    /// Book title. Defaults to the outline's file stem.
    #[arg(long)]
    title: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Project file to read.
    project: PathBuf,
    /// Book to print ("series" or a book id). Defaults to the current book.
    #[arg(long)]
    book: Option<BookKey>,
    /// Emit JSON rows instead of an indented listing.
    #[arg(long, conflicts_with = "outline")]
    json: bool,
    /// Emit the book as star outline text.
    #[arg(long)]
    outline: bool,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    /// Project file to update.
    project: PathBuf,
    /// JSON file holding an array of instructions.
    instructions: PathBuf,
    /// Timeline view to apply the instructions under. The saved view is kept.
    #[arg(long, value_enum)]
    view: Option<ViewArg>,
    /// Report what would change without writing the project.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Project file to validate.
    project: PathBuf,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ViewArg {
    Default,
    Tabbed,
    Stacked,
}

impl From<ViewArg> for TimelineView {
    fn from(view: ViewArg) -> Self {
        match view {
            ViewArg::Default => TimelineView::Default,
            ViewArg::Tabbed => TimelineView::Tabbed,
            ViewArg::Stacked => TimelineView::Stacked,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Import(args) => handle_import(args),
        Commands::Show(args) => handle_show(args),
        Commands::Apply(args) => handle_apply(args),
        Commands::Check(args) => handle_check(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_import(args: ImportArgs) -> Result<()> {
    let ImportArgs {
        outline,
        project,
        title,
    } = args;
    let repo = JsonProjectRepository::new(&project);
    let mut current = if project.exists() {
        repo.load()?
    } else {
        debug!(path = ?project, "starting a new project");
        Project::new()
    };

    let parsed = StarOutlineParser.parse_file(&outline)?;
    let title = title.unwrap_or_else(|| {
        outline
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Untitled".to_string())
    });
    let id = parsed
        .add_to_project(&mut current, &title)
        .with_context(|| format!("importing {:?}", outline))?;
    current.settings.current_book = BookKey::Book(id);
    repo.save(&current)?;
    info!(book = %id, beats = parsed.entries.len(), levels = parsed.level_count(), "outline imported");
    Ok(())
}

fn handle_show(args: ShowArgs) -> Result<()> {
    let ShowArgs {
        project,
        book,
        json,
        outline,
    } = args;
    let current = JsonProjectRepository::new(&project).load()?;
    let book = book.unwrap_or(current.settings.current_book);

    if outline {
        let tree = current
            .tree(book)
            .with_context(|| format!("book {book} has no timeline"))?;
        print!("{}", format_outline(tree));
        return Ok(());
    }
    let rows = outline_projector::project_book(&current, book)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", format_rows(&rows));
    }
    Ok(())
}

fn handle_apply(args: ApplyArgs) -> Result<()> {
    let ApplyArgs {
        project,
        instructions,
        view,
        dry_run,
    } = args;
    let repo = JsonProjectRepository::new(&project);
    let loaded = repo.load()?;
    let saved_view = loaded.settings.timeline_view;

    let text = fs::read_to_string(&instructions)
        .with_context(|| format!("reading {:?}", instructions))?;
    let steps: Vec<Instruction> = serde_json::from_str(&text)
        .with_context(|| format!("decoding instructions {:?}", instructions))?;

    let mut current = Arc::new(loaded);
    if let Some(view) = view {
        Arc::make_mut(&mut current).settings.timeline_view = view.into();
    }
    let (applied, rejected) = run_instructions(&mut current, &steps);
    info!(applied, rejected, "instructions processed");

    if dry_run {
        return Ok(());
    }
    let mut result = Arc::unwrap_or_clone(current);
    if view.is_some() {
        result.settings.timeline_view = saved_view;
    }
    repo.save(&result)
}

/// Applies `steps` in order, skipping rejected ones. Returns (applied, rejected).
fn run_instructions(current: &mut Arc<Project>, steps: &[Instruction]) -> (usize, usize) {
    let mut applied = 0;
    let mut rejected = 0;
    for (index, step) in steps.iter().enumerate() {
        match try_apply(current.as_ref(), step) {
            Ok(next) => {
                *current = Arc::new(next);
                applied += 1;
            }
            Err(err) => {
                warn!(index, instruction = step.name(), error = %err, "instruction rejected");
                rejected += 1;
            }
        }
    }
    (applied, rejected)
}

fn handle_check(args: CheckArgs) -> Result<()> {
    let current = JsonProjectRepository::new(&args.project).load()?;
    for (book, tree) in &current.beats {
        let depth = tree
            .max_depth()
            .map_or_else(|| "empty".to_string(), |d| format!("depth {d}"));
        println!("{book}: {} beats, {depth}", tree.len());
    }
    println!(
        "ok: {} books, {} lines, {} cards",
        current.books.len(),
        current.lines.len(),
        current.cards.len()
    );
    Ok(())
}
