use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use classmark::app::App;
use classmark::config::Config;
use classmark::db::{Database, NewAnnotation};
use classmark::logging;
use classmark::training::TrainingPhase;

enum BehaviorCommand {
    List,
    Add {
        key: String,
        value: String,
        description: Option<String>,
    },
    Update {
        id: i64,
        key: String,
        value: String,
    },
    Delete(i64),
}

enum Command {
    Import(PathBuf),
    List,
    Annotate {
        media_id: i64,
        behavior: String,
        frame: Option<f64>,
        coordinates: Option<String>,
        annotator: Option<String>,
    },
    Annotations { media_id: i64, page: usize },
    Frames { media_id: i64, page: usize },
    Train,
    Status,
    Models,
    Evaluate { model_id: i64, media_id: i64 },
    Behaviors(BehaviorCommand),
    Stats,
    Clear { confirmed: bool },
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

/// Positional arguments and `--name value` options of one command.
struct CommandLine {
    positional: Vec<String>,
    options: Vec<(String, Option<String>)>,
}

impl CommandLine {
    fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    fn flag(&self, name: &str) -> bool {
        self.options.iter().any(|(n, _)| n == name)
    }

    fn arg(&self, index: usize, what: &str) -> String {
        match self.positional.get(index) {
            Some(value) => value.clone(),
            None => usage_error(&format!("missing {what}")),
        }
    }

    fn id(&self, index: usize, what: &str) -> i64 {
        let raw = self.arg(index, what);
        raw.parse()
            .unwrap_or_else(|_| usage_error(&format!("{what} must be a number, got '{raw}'")))
    }

    fn page(&self) -> usize {
        match self.option("--page") {
            Some(raw) => raw
                .parse()
                .unwrap_or_else(|_| usage_error(&format!("--page must be a number, got '{raw}'"))),
            None => 1,
        }
    }
}

const VALUE_OPTIONS: &[&str] = &["--frame", "--coords", "--annotator", "--page"];
const FLAG_OPTIONS: &[&str] = &["--yes"];

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {message}");
    eprintln!("Run 'classmark --help' for usage.");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut line = CommandLine {
        positional: Vec::new(),
        options: Vec::new(),
    };

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("classmark {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    usage_error("--config requires a path argument");
                }
            }
            _ if VALUE_OPTIONS.contains(&arg) => {
                if i + 1 < args.len() {
                    line.options.push((arg.to_string(), Some(args[i + 1].clone())));
                    i += 1;
                } else {
                    usage_error(&format!("{arg} requires a value"));
                }
            }
            _ if FLAG_OPTIONS.contains(&arg) => line.options.push((arg.to_string(), None)),
            _ if arg.starts_with("--") => usage_error(&format!("unknown option {arg}")),
            _ => line.positional.push(arg.to_string()),
        }
        i += 1;
    }

    if line.positional.is_empty() {
        print_help();
        std::process::exit(1);
    }
    let name = line.positional.remove(0);

    let command = match name.as_str() {
        "import" => Command::Import(PathBuf::from(line.arg(0, "file"))),
        "list" => Command::List,
        "annotate" => Command::Annotate {
            media_id: line.id(0, "media id"),
            behavior: line.arg(1, "behavior"),
            frame: line.option("--frame").map(|raw| {
                raw.parse()
                    .unwrap_or_else(|_| usage_error(&format!("--frame must be a number, got '{raw}'")))
            }),
            coordinates: line.option("--coords").map(str::to_string),
            annotator: line.option("--annotator").map(str::to_string),
        },
        "annotations" => Command::Annotations {
            media_id: line.id(0, "media id"),
            page: line.page(),
        },
        "frames" => Command::Frames {
            media_id: line.id(0, "media id"),
            page: line.page(),
        },
        "train" => Command::Train,
        "status" => Command::Status,
        "models" => Command::Models,
        "evaluate" => Command::Evaluate {
            model_id: line.id(0, "model id"),
            media_id: line.id(1, "media id"),
        },
        "behaviors" => Command::Behaviors(match line.positional.first().map(String::as_str) {
            None => BehaviorCommand::List,
            Some("add") => BehaviorCommand::Add {
                key: line.arg(1, "behavior key"),
                value: line.arg(2, "behavior label"),
                description: line.positional.get(3).cloned(),
            },
            Some("update") => BehaviorCommand::Update {
                id: line.id(1, "behavior id"),
                key: line.arg(2, "behavior key"),
                value: line.arg(3, "behavior label"),
            },
            Some("delete") => BehaviorCommand::Delete(line.id(1, "behavior id")),
            Some(other) => usage_error(&format!("unknown behaviors action '{other}'")),
        }),
        "stats" => Command::Stats,
        "clear" => Command::Clear {
            confirmed: line.flag("--yes"),
        },
        other => usage_error(&format!("unknown command '{other}'")),
    };

    Args {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"classmark - teaching behavior annotation and classifier training

USAGE:
    classmark [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    import <file>                      Copy an image or video into the uploads directory
    list                               List media records, newest first
    annotate <media-id> <behavior>     Record a behavior annotation
        [--frame N] [--coords S] [--annotator NAME]
    annotations <media-id> [--page N]  List annotations, 5 per page
    frames <media-id> [--page N]       Sample (if needed) and list video frames, 8 per page
    train                              Train a model on all annotated media
    status                             Show the latest training status
    models                             List trained models
    evaluate <model-id> <media-id>     Score a model against one annotated record
    behaviors                          List the behavior vocabulary
    behaviors add KEY VALUE [DESC]     Add a behavior
    behaviors update ID KEY VALUE      Rename a behavior
    behaviors delete ID                Remove a behavior
    stats                              Show record and model counts
    clear --yes                        Delete all media, annotations, models and frames

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    CLASSMARK_CONFIG    Path to config file (overrides default location)
    CLASSMARK_LOG       Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/classmark/config.toml"#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(&Config::config_dir().join("logs"));

    let config = match args.config_path {
        Some(path) => Config::load_from(&path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load()?,
    };

    let db = Database::open(config.db_path())?;
    let mut app = App::new(config, db)?;

    run(&mut app, args.command)
}

fn run(app: &mut App, command: Command) -> Result<()> {
    match command {
        Command::Import(path) => {
            let record = app.import_media(&path)?;
            println!("Imported {} as {} #{}", record.filename, record.kind.as_str(), record.id);
        }
        Command::List => {
            for record in app.list_media()? {
                println!(
                    "{:>5}  {:<6} {:<10} {}  {}",
                    record.id,
                    record.kind.as_str(),
                    record.status.as_str(),
                    record.upload_time,
                    record.filename
                );
            }
        }
        Command::Annotate {
            media_id,
            behavior,
            frame,
            coordinates,
            annotator,
        } => {
            let mut annotation = NewAnnotation::new(media_id, behavior);
            if let Some(frame) = frame {
                annotation = annotation.with_frame(frame);
            }
            if let Some(coordinates) = coordinates {
                annotation = annotation.with_coordinates(coordinates);
            }
            if let Some(annotator) = annotator {
                annotation = annotation.with_annotator(annotator);
            }

            let outcome = app.annotate(&annotation)?;
            println!("Saved annotation #{}", outcome.annotation_id);
            if !outcome.known_behavior {
                println!("Warning: '{}' is not in the behavior vocabulary", annotation.behavior);
            }
            if let Some(frames) = outcome.frames {
                println!("{frames} frames cached");
            }
            if let Some(warning) = outcome.frame_warning {
                println!("Warning: frames unavailable: {warning}");
            }
        }
        Command::Annotations { media_id, page } => {
            let listing = app.annotations_page(media_id, page)?;
            for a in &listing.items {
                let frame = a
                    .frame_index
                    .map(|f| format!("frame {f}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>5}  {:<20} {:<12} {:<10} {}",
                    a.id,
                    app.vocabulary.display(&a.behavior),
                    frame,
                    a.annotator,
                    a.created_at
                );
            }
            println!(
                "Page {}/{} ({} annotations)",
                listing.page, listing.total_pages, listing.total_items
            );
        }
        Command::Frames { media_id, page } => {
            let listing = app.frame_page(media_id, page)?;
            for frame in &listing.items {
                let marker = if frame.is_annotated { "*" } else { " " };
                println!("{marker} {:>4}  {}", frame.index, frame.path.display());
            }
            println!(
                "Page {}/{} ({} frames, * = annotated)",
                listing.page, listing.total_pages, listing.total_items
            );
        }
        Command::Train => train(app)?,
        Command::Status => {
            let status = app.training_status()?;
            println!(
                "{} {}% running={} {}",
                status.phase.as_str(),
                status.progress,
                status.running,
                status.message
            );
        }
        Command::Models => {
            for model in app.list_models()? {
                println!(
                    "{:>5}  {}  samples={} accuracy={} {}",
                    model.id,
                    model.training_time,
                    model.training_data_size,
                    percent(model.accuracy),
                    model.name
                );
            }
        }
        Command::Evaluate { model_id, media_id } => {
            let result = app.evaluate(model_id, media_id)?;
            for item in &result.items {
                let label = match item.frame_index {
                    Some(index) => format!("frame {index}"),
                    None => "image".to_string(),
                };
                println!(
                    "{:<12} predicted={:<18} truth={}",
                    label,
                    item.predicted,
                    item.ground_truth.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("{:<20} {:>9} {:>9} {:>9}", "class", "predicted", "truth", "accuracy");
            for (class, acc) in &result.class_accuracy {
                let predicted = result.class_counts.get(class).copied().unwrap_or(0);
                println!(
                    "{:<20} {:>9} {:>9} {:>8.1}%",
                    class,
                    predicted,
                    acc.total,
                    acc.accuracy * 100.0
                );
            }
            println!(
                "Overall: {}/{} correct ({:.1}%), evaluation #{}",
                result.correct,
                result.total,
                result.accuracy * 100.0,
                result.evaluation_id
            );
        }
        Command::Behaviors(action) => behaviors(app, action)?,
        Command::Stats => {
            let stats = app.stats()?;
            println!("Total files:     {}", stats.total_files);
            println!("Annotated files: {}", stats.annotated_files);
            println!("Models:          {}", stats.total_models);
            println!("Latest accuracy: {}", percent(stats.latest_accuracy));
        }
        Command::Clear { confirmed } => {
            if !confirmed {
                bail!("clear deletes every media file, annotation and model; pass --yes to confirm");
            }
            let report = app.clear_data()?;
            println!(
                "Removed {} media files, {} model files and {} frame directories",
                report.media_files, report.model_files, report.frame_dirs
            );
        }
    }
    Ok(())
}

fn train(app: &App) -> Result<()> {
    let job = app.start_training()?;
    println!("Training job {job} started");

    let mut last_progress = None;
    loop {
        let Some(status) = app.job_status(job)? else {
            bail!("training job {job} disappeared");
        };
        if last_progress != Some(status.progress) {
            println!("[{:>3}%] {}", status.progress, status.message);
            last_progress = Some(status.progress);
        }
        if !status.running {
            if status.phase == TrainingPhase::Failed {
                bail!("training failed: {}", status.message);
            }
            if let Some(model_id) = status.model_id {
                println!("Model #{model_id} saved");
            }
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}

fn behaviors(app: &mut App, action: BehaviorCommand) -> Result<()> {
    match action {
        BehaviorCommand::List => {
            for b in app.vocabulary.entries() {
                println!(
                    "{:>4}  {:<20} {:<24} {}",
                    b.id,
                    b.key,
                    b.value,
                    b.description.as_deref().unwrap_or("")
                );
            }
        }
        BehaviorCommand::Add {
            key,
            value,
            description,
        } => {
            let id = app.add_behavior(&key, &value, description.as_deref())?;
            println!("Added behavior #{id} ({key})");
        }
        BehaviorCommand::Update { id, key, value } => {
            if !app.update_behavior(id, &key, &value)? {
                bail!("behavior #{id} does not exist");
            }
            println!("Updated behavior #{id}");
        }
        BehaviorCommand::Delete(id) => {
            if !app.delete_behavior(id)? {
                bail!("behavior #{id} does not exist");
            }
            println!("Deleted behavior #{id}");
        }
    }
    Ok(())
}

fn percent(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}%", v * 100.0))
        .unwrap_or_else(|| "-".to_string())
}
