use std::collections::HashMap;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use analyzer_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use analyzer_contracts::events::EventWriter;
use analyzer_engine::config::load_dotenv;
use analyzer_engine::{
    AnalysisService, AnalyzerConfig, ChatSession, ChatTurn, Completion, StagedImage, TurnContent,
    MAX_STAGED_IMAGES,
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "product-analyzer",
    version,
    about = "Per-image product analysis with a hosted multimodal model"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Analyze(AnalyzeArgs),
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,
    #[arg(long)]
    query: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

const PROGRESS_INTERVAL: Duration = Duration::from_millis(400);

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("product-analyzer error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
    }
}

/// Builds services for the current model; keeps dotenv values and the event log across rebuilds.
struct ServiceFactory {
    dotenv: HashMap<String, String>,
    events: Option<EventWriter>,
}

impl ServiceFactory {
    fn new(env_file: Option<&Path>, events_path: Option<&Path>) -> Result<Self> {
        let dotenv = match env_file {
            Some(path) => load_dotenv(path)?,
            None => {
                let default_path = Path::new(".env");
                if default_path.is_file() {
                    load_dotenv(default_path)?
                } else {
                    HashMap::new()
                }
            }
        };
        let events = events_path
            .map(|path| EventWriter::new(path, format!("session-{}", unix_epoch_millis())));
        Ok(Self { dotenv, events })
    }

    fn config(&self, model: Option<String>) -> AnalyzerConfig {
        AnalyzerConfig::from_env_with_fallback(&self.dotenv).with_model(model)
    }

    fn build(&self, model: Option<String>) -> Result<AnalysisService> {
        let service = AnalysisService::from_config(&self.config(model))?;
        Ok(match self.events.clone() {
            Some(events) => service.with_events(events),
            None => service,
        })
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let factory = ServiceFactory::new(args.env_file.as_deref(), args.events.as_deref())?;
    let mut session = ChatSession::new(factory.build(args.model.clone())?);

    let (loaded, failures) = load_images(&args.images);
    for failure in &failures {
        eprintln!("{failure}");
    }
    if !failures.is_empty() {
        return Ok(1);
    }
    let dropped = session.stage_images(loaded);
    if dropped > 0 {
        eprintln!("{}", dropped_images_notice(dropped));
    }

    if !session.submit(&args.query) {
        eprintln!("{}", session.error_message().unwrap_or_default());
        return Ok(1);
    }
    match wait_with_progress(&mut session) {
        Some(Completion::Analyzed { .. }) => {}
        Some(Completion::Failed(err)) => {
            eprintln!("{err}");
            return Ok(1);
        }
        None => return Ok(1),
    }

    let Some(turn) = session.turns().last() else {
        return Ok(1);
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&analysis_rows(turn.images()))?);
    } else {
        for line in format_analysis_lines(turn.images()) {
            println!("{line}");
        }
    }
    Ok(0)
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let factory = ServiceFactory::new(args.env_file.as_deref(), args.events.as_deref())?;
    let mut session = ChatSession::new(factory.build(args.model.clone())?);

    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "Product analyzer started with {}. Stage up to {MAX_STAGED_IMAGES} images with /add, then type a query. /help lists commands.",
        session.service().model()
    );

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);

        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join("  "));
                println!("Any other text is submitted as a query about the staged images.");
            }
            "quit" => break,
            "stage_images" => {
                let paths = value_as_string_list(intent.command_args.get("paths"))
                    .into_iter()
                    .map(PathBuf::from)
                    .collect::<Vec<PathBuf>>();
                if paths.is_empty() {
                    println!("/add requires at least one image path");
                    continue;
                }
                let (loaded, failures) = load_images(&paths);
                for failure in failures {
                    println!("{failure}");
                }
                let dropped = session.stage_images(loaded);
                if dropped > 0 {
                    println!("{}", dropped_images_notice(dropped));
                }
                println!(
                    "Staged {}/{MAX_STAGED_IMAGES} image(s).",
                    session.staged().len()
                );
            }
            "remove_image" => {
                let Some(position) = intent
                    .command_args
                    .get("index")
                    .and_then(Value::as_u64)
                    .and_then(|value| usize::try_from(value).ok())
                else {
                    println!("/remove requires an image number from /images");
                    continue;
                };
                match session.remove_staged_at(position - 1) {
                    Some(image) => println!("Removed {}", image.label()),
                    None => println!("No staged image at position {position}"),
                }
            }
            "list_images" => {
                if session.staged().is_empty() {
                    println!("No images staged.");
                    continue;
                }
                for (index, image) in session.staged().iter().enumerate() {
                    let (width, height) = image.dimensions();
                    println!("{}. {} ({width}x{height})", index + 1, image.label());
                }
            }
            "clear_images" => {
                session.clear_staged();
                println!("Staging area cleared.");
            }
            "show_history" => {
                if session.turns().is_empty() {
                    println!("No conversation yet.");
                    continue;
                }
                for turn in session.turns() {
                    for history_line in format_turn(turn) {
                        println!("{history_line}");
                    }
                }
            }
            "set_model" => {
                let requested = value_as_non_empty_string(intent.command_args.get("model"));
                let Some(model) = requested else {
                    println!(
                        "Model: {} (provider {})",
                        session.service().model(),
                        session.service().provider_name()
                    );
                    continue;
                };
                let service = match factory.build(Some(model)) {
                    Ok(service) => service,
                    Err(err) => {
                        println!("Could not switch model: {err:#}");
                        continue;
                    }
                };
                println!(
                    "Model set to {} (provider {})",
                    service.model(),
                    service.provider_name()
                );
                session.replace_service(service);
            }
            "submit" => {
                let query = intent.query.unwrap_or_default();
                if !session.submit(&query) {
                    println!("{}", session.error_message().unwrap_or_default());
                    continue;
                }
                match wait_with_progress(&mut session) {
                    Some(Completion::Analyzed { .. }) => {
                        if let Some(turn) = session.turns().last() {
                            for result_line in format_analysis_lines(turn.images()) {
                                println!("{result_line}");
                            }
                        }
                    }
                    Some(Completion::Failed(err)) => println!("{err}"),
                    None => {}
                }
            }
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            _ => {
                println!("Unhandled action: {}", intent.action);
            }
        }
    }

    Ok(())
}

fn wait_with_progress(session: &mut ChatSession) -> Option<Completion> {
    eprint!(
        "Analyzing {} image(s) with {}",
        session
            .turns()
            .last()
            .map(|turn| turn.images().len())
            .unwrap_or_default(),
        session.service().model()
    );
    loop {
        if !session.is_loading() {
            eprintln!();
            return None;
        }
        if let Some(completion) = session.wait_timeout(PROGRESS_INTERVAL) {
            eprintln!();
            return Some(completion);
        }
        eprint!(".");
    }
}

fn load_images(paths: &[PathBuf]) -> (Vec<StagedImage>, Vec<String>) {
    let mut loaded = Vec::new();
    let mut failures = Vec::new();
    for path in paths {
        match StagedImage::open(path) {
            Ok(image) => loaded.push(image),
            Err(err) => failures.push(err.to_string()),
        }
    }
    (loaded, failures)
}

fn dropped_images_notice(dropped: usize) -> String {
    format!("Only {MAX_STAGED_IMAGES} images can be analyzed at once; ignored {dropped} extra image(s).")
}

fn format_analysis_lines(images: &[StagedImage]) -> Vec<String> {
    images
        .iter()
        .enumerate()
        .map(|(index, image)| {
            format!(
                "image{} ({}): {}",
                index + 1,
                image.label(),
                image.analysis_result().unwrap_or("(no analysis)")
            )
        })
        .collect()
}

fn analysis_rows(images: &[StagedImage]) -> Value {
    Value::Array(
        images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                json!({
                    "index": index + 1,
                    "id": image.id().to_string(),
                    "image": image.label(),
                    "source": image.source().map(|path| path.display().to_string()),
                    "analysis": image.analysis_result(),
                })
            })
            .collect(),
    )
}

fn format_turn(turn: &ChatTurn) -> Vec<String> {
    let stamp = turn.created_at().format("%H:%M:%S");
    match turn.content() {
        TurnContent::User { query, images } => {
            let labels = images
                .iter()
                .map(StagedImage::label)
                .collect::<Vec<String>>()
                .join(", ");
            vec![format!("[{stamp}] you: {query} [{labels}]")]
        }
        TurnContent::Bot { analyzed_images } => {
            let mut lines = vec![format!("[{stamp}] analyzer:")];
            lines.extend(
                format_analysis_lines(analyzed_images)
                    .into_iter()
                    .map(|line| format!("  {line}")),
            );
            lines
        }
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn value_as_string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn unix_epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use analyzer_contracts::events::read_event_log;
    use clap::Parser;
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> anyhow::Result<PathBuf> {
        let path = dir.join(name);
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 120, 30])))
            .save(&path)?;
        Ok(path)
    }

    #[test]
    fn analyze_args_parse_repeated_images() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "product-analyzer",
            "analyze",
            "--image",
            "a.png",
            "--image",
            "b.png",
            "--query",
            "Compare these",
            "--json",
        ])?;
        let Command::Analyze(args) = cli.command else {
            anyhow::bail!("expected analyze command");
        };
        assert_eq!(args.images, vec![PathBuf::from("a.png"), PathBuf::from("b.png")]);
        assert_eq!(args.query, "Compare these");
        assert!(args.json);
        Ok(())
    }

    #[test]
    fn analyze_requires_an_image() {
        assert!(Cli::try_parse_from(["product-analyzer", "analyze", "--query", "q"]).is_err());
    }

    #[test]
    fn dryrun_session_produces_labeled_lines_and_rows() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let paths = vec![
            write_png(temp.path(), "sneaker.png", 4, 2)?,
            write_png(temp.path(), "boot.png", 3, 3)?,
        ];
        let events_path = temp.path().join("events.jsonl");
        let factory = ServiceFactory::new(None, Some(events_path.as_path()))?;
        let mut session = ChatSession::new(factory.build(Some("dryrun-vision".to_string()))?);

        let (loaded, failures) = load_images(&paths);
        assert!(failures.is_empty());
        assert_eq!(session.stage_images(loaded), 0);
        assert!(session.submit("Describe"));
        assert_eq!(
            wait_with_progress(&mut session),
            Some(Completion::Analyzed { images: 2 })
        );

        let turn = session.turns().last().cloned();
        let images = turn.as_ref().map(ChatTurn::images).unwrap_or_default();
        assert_eq!(
            format_analysis_lines(images),
            vec![
                "image1 (sneaker.png): Dry-run analysis of a 4x2 image for \"Describe\"",
                "image2 (boot.png): Dry-run analysis of a 3x3 image for \"Describe\"",
            ]
        );
        let rows = analysis_rows(images);
        assert_eq!(rows[1]["index"], json!(2));
        assert_eq!(rows[1]["image"], json!("boot.png"));

        let logged = read_event_log(&events_path)?;
        assert_eq!(
            logged
                .iter()
                .map(|row| row.event.event_type())
                .collect::<Vec<&str>>(),
            vec!["analysis_submitted", "analysis_completed"]
        );
        Ok(())
    }

    #[test]
    fn load_images_reports_unreadable_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let bogus = temp.path().join("notes.png");
        fs::write(&bogus, "plain text")?;
        let (loaded, failures) = load_images(&[bogus, temp.path().join("missing.png")]);
        assert!(loaded.is_empty());
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|failure| failure.starts_with("Image Loading Error:")));
        Ok(())
    }

    #[test]
    fn history_lines_show_query_and_results() {
        let mut image = StagedImage::from_bitmap(DynamicImage::ImageRgb8(RgbImage::new(1, 1)))
            .unwrap_or_else(|err| panic!("{err}"));
        let user = ChatTurn::user("What is it?", vec![image.clone()]);
        image.set_analysis_result("A pixel");
        let bot = ChatTurn::bot(vec![image.clone()]);

        let user_lines = format_turn(&user);
        assert_eq!(user_lines.len(), 1);
        assert!(user_lines[0].contains("you: What is it? ["));

        let bot_lines = format_turn(&bot);
        assert_eq!(bot_lines.len(), 2);
        assert!(bot_lines[0].ends_with("analyzer:"));
        assert_eq!(
            bot_lines[1],
            format!("  image1 ({}): A pixel", image.label())
        );
    }

    #[test]
    fn factory_reads_model_from_env_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let env_path = temp.path().join("analyzer.env");
        fs::write(&env_path, "ANALYZER_MODEL=dryrun-from-file\n")?;
        let factory = ServiceFactory::new(Some(env_path.as_path()), None)?;
        if std::env::var("ANALYZER_MODEL").is_err() {
            assert_eq!(factory.build(None)?.model(), "dryrun-from-file");
        }
        assert_eq!(factory.build(Some("dryrun-x".to_string()))?.provider_name(), "dryrun");
        Ok(())
    }

    #[test]
    fn dropped_notice_mentions_cap() {
        assert_eq!(
            dropped_images_notice(2),
            "Only 4 images can be analyzed at once; ignored 2 extra image(s)."
        );
    }
}
