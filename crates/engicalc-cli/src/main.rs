use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use engicalc_core::html::{write_html, write_page};
use engicalc_core::telemetry::{self, TelemetryConfig};
use engicalc_core::{
    Config, DisplayNode, Document, DocumentSession, HttpEvaluator, LivePreview, assign_identities,
    extract_segments, run_preview,
};
use miette::{IntoDiagnostic, Result, WrapErr};

#[derive(Parser)]
#[command(
    version,
    about = "EngiCalc - live engineering calculations in Markdown",
    long_about = None
)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (.toml or .json). Defaults to <config dir>/engicalc/config.toml
    #[arg(long, global = true, env = "ENGICALC_CONFIG")]
    config: Option<PathBuf>,

    /// Calculation service base URL, overrides the config file
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every calculation and write the document as HTML
    Render {
        /// Markdown document
        source: PathBuf,

        /// Output file. Writes to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write only the document body instead of a standalone page
        #[arg(long)]
        fragment: bool,
    },
    /// Re-render the document whenever it changes on disk
    Watch {
        /// Markdown document
        source: PathBuf,

        /// Output file. Defaults to the source with an .html extension
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// How often to look for changes, in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// List the calculation blocks of a document with their identities
    Blocks {
        /// Markdown document
        source: PathBuf,
    },
    /// Ask the calculation service to syntax-check every block
    Check {
        /// Markdown document
        source: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_miette()?;

    let cli = Cli::parse();
    init_telemetry(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(endpoint) = cli.endpoint {
        config.evaluator.endpoint = endpoint;
    }

    match cli.command {
        Commands::Render {
            source,
            output,
            fragment,
        } => render_document(config, source, output, fragment).await?,
        Commands::Watch {
            source,
            output,
            interval_ms,
        } => watch_document(config, source, output, interval_ms).await?,
        Commands::Blocks { source } => list_blocks(config, source)?,
        Commands::Check { source } => check_blocks(config, source).await?,
    }

    Ok(())
}

fn init_telemetry(verbose: u8) {
    let config = TelemetryConfig::from_env("engicalc");
    let config = match verbose {
        0 => config,
        1 => config.with_level(tracing::Level::INFO),
        2 => config.with_level(tracing::Level::DEBUG),
        _ => config.with_level(tracing::Level::TRACE),
    };
    telemetry::init(config);
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("engicalc").join("config.toml"))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => match default_config_path() {
            Some(path) if path.is_file() => Config::load(&path)?,
            _ => Config::default(),
        },
    };
    Ok(config.with_env_overrides()?)
}

fn read_document(source: &Path) -> Result<Document> {
    Document::load(source).wrap_err_with(|| format!("loading {}", source.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn page_title(doc: &Document) -> String {
    doc.metadata
        .title
        .clone()
        .unwrap_or_else(|| doc.filename.clone())
}

async fn render_document(
    config: Config,
    source: PathBuf,
    output: Option<PathBuf>,
    fragment: bool,
) -> Result<()> {
    let doc = read_document(&source)?;
    let preview = LivePreview::from_config(config)?;

    let prepared = preview.prepare(&doc.content);
    preview.scheduler().wait_idle().await;
    let nodes = preview.render_prepared(&prepared);

    let html = if fragment {
        write_html(&nodes)
    } else {
        write_page(&page_title(&doc), &nodes)
    };

    match output {
        Some(path) => {
            std::fs::write(&path, html)
                .into_diagnostic()
                .wrap_err_with(|| format!("writing {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{html}"),
    }
    Ok(())
}

async fn watch_document(
    config: Config,
    source: PathBuf,
    output: Option<PathBuf>,
    interval_ms: u64,
) -> Result<()> {
    let output = output.unwrap_or_else(|| source.with_extension("html"));
    if output == source {
        return Err(miette::miette!(
            "Output would overwrite the source document: {}",
            source.display()
        ));
    }

    let doc = read_document(&source)?;
    let mut last_raw = doc.raw_content.clone();
    let title = page_title(&doc);
    let preview = LivePreview::from_config(config)?;

    let session = DocumentSession::new();
    session.set_current(Some(doc));

    let target = output.clone();
    let renderer = n0_future::task::spawn(run_preview(
        session.subscribe(),
        preview,
        move |nodes: Vec<DisplayNode>| {
            if let Err(error) = std::fs::write(&target, write_page(&title, &nodes)) {
                tracing::warn!(path = %target.display(), %error, "could not write preview");
            }
        },
    ));

    eprintln!(
        "Watching {} -> {} (Ctrl-C to stop)",
        source.display(),
        output.display()
    );

    let mut ticker = n0_future::time::interval(Duration::from_millis(interval_ms.max(50)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let raw = match std::fs::read_to_string(&source) {
            Ok(raw) if raw != last_raw => raw,
            Ok(_) => continue,
            Err(error) => {
                session.set_error(Some(error.to_string()));
                continue;
            }
        };

        match Document::parse(&file_name(&source), &raw) {
            Ok(doc) => {
                session.update_metadata(doc.metadata);
                session.update_content(doc.content);
                session.set_error(None);
            }
            Err(error) => {
                session.set_error(Some(error.to_string()));
                eprintln!("{:?}", miette::Report::new(error));
            }
        }
        last_raw = raw;
    }

    drop(session);
    renderer.await.into_diagnostic()?;
    Ok(())
}

fn list_blocks(config: Config, source: PathBuf) -> Result<()> {
    let doc = read_document(&source)?;
    let segments = extract_segments(&doc.content, &config.extractor);
    let blocks = assign_identities(&segments, config.identity);

    if blocks.is_empty() {
        println!("No calculation blocks in {}", source.display());
        return Ok(());
    }

    for block in &blocks {
        let first_line = block.code.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        println!(
            "{:>3}  {}  {:<8} {}",
            block.ordinal, block.id, block.language, first_line
        );
    }
    Ok(())
}

async fn check_blocks(config: Config, source: PathBuf) -> Result<()> {
    let doc = read_document(&source)?;
    let segments = extract_segments(&doc.content, &config.extractor);
    let blocks = assign_identities(&segments, config.identity);
    let evaluator = HttpEvaluator::from_config(&config.evaluator)?;

    let mut invalid = 0;
    for block in &blocks {
        let validation = evaluator.validate(&block.code).await?;
        if validation.valid {
            println!("ok       {}", block.id);
        } else {
            invalid += 1;
            println!(
                "invalid  {}: {}",
                block.id,
                validation.error.as_deref().unwrap_or("syntax error")
            );
        }
    }

    if invalid > 0 {
        return Err(miette::miette!(
            "{invalid} of {} calculation blocks failed validation",
            blocks.len()
        ));
    }
    println!("{} calculation blocks are valid", blocks.len());
    Ok(())
}

fn init_miette() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(3)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    miette::set_panic_hook();
    Ok(())
}
