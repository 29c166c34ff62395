mod cache;
mod commands;
mod config;
mod direct_link;
mod errors;
mod export;
mod generation;
mod models;
mod orchestrator;
mod preprocess;
mod providers;
mod retry;
mod server;
mod util;

use std::{
    io::Write as _,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};

use crate::{
    commands::{HELP_TEXT, SessionCommand},
    config::AppConfig,
    direct_link::{DirectLinkFetcher, HttpThumbnailSource},
    errors::{AppError, Result},
    generation::{GenerationBackend, HttpGenerationClient, UnconfiguredBackend},
    models::EncodedImage,
    orchestrator::ThumbnailSession,
    preprocess::ImagePreprocessor,
    providers::OpenRouterProvider,
    server::AppState,
    util::{DownloadWriter, format_local, now_local},
};

const DIRECT_LINK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "thumbnail-maker", version, about = "AI video thumbnail generator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the generation proxy (`POST /api/generate`).
    Serve {
        /// Overrides `[server] bind_addr`.
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Interactive console session (default).
    Session,
    /// Generate one thumbnail and save it.
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        headshot: Option<PathBuf>,
        #[arg(long)]
        face_lock: bool,
        /// Full HD instead of a fast preview.
        #[arg(long = "final")]
        final_quality: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Download an existing video thumbnail from its link.
    Fetch {
        url: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command.unwrap_or(Command::Session) {
        Command::Serve { bind } => serve(config, bind).await,
        Command::Session => run_session(config).await,
        Command::Generate {
            prompt,
            headshot,
            face_lock,
            final_quality,
            out,
        } => generate_once(config, &prompt, headshot.as_deref(), face_lock, final_quality, out).await,
        Command::Fetch { url, out } => {
            let dir = out.unwrap_or_else(|| config.output_dir.clone());
            fetch_once(&config, &url, &dir).await
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .compact()
        .with_timer(LocalTimer)
        .init();
}

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", format_local(&now_local(), "%Y-%m-%d %H:%M:%S%:z"))
    }
}

/// Proxy endpoint first, then the in-process provider, then a backend that
/// always reports the service as unconfigured.
fn build_backend(config: &AppConfig) -> Result<Arc<dyn GenerationBackend>> {
    if let Some(client) = HttpGenerationClient::from_config(&config.client)? {
        info!(target: "generation", "using generation proxy endpoint");
        return Ok(Arc::new(client));
    }
    if let Some(openrouter) = config.openrouter.as_ref() {
        info!(target: "generation", model = %openrouter.image_model, "using OpenRouter directly");
        return Ok(Arc::new(OpenRouterProvider::from_config(openrouter)?));
    }
    warn!(target: "generation", "no generation endpoint or OPENROUTER_API_KEY configured");
    Ok(Arc::new(UnconfiguredBackend))
}

fn direct_link_fetcher(config: &AppConfig) -> Result<DirectLinkFetcher<HttpThumbnailSource>> {
    let source = HttpThumbnailSource::new(DIRECT_LINK_TIMEOUT)?;
    Ok(DirectLinkFetcher::new(
        source,
        config.direct_link.thumbnail_base.clone(),
    ))
}

async fn serve(config: AppConfig, bind: Option<SocketAddr>) -> Result<()> {
    let addr = bind.unwrap_or(config.server.bind_addr);
    let provider = config
        .openrouter
        .as_ref()
        .map(OpenRouterProvider::from_config)
        .transpose()?;
    if provider.is_none() {
        warn!(target: "server", "OPENROUTER_API_KEY missing, /api/generate will answer 503");
    }

    let mut server_task = tokio::spawn(server::run_server(addr, AppState::new(provider)));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(target: "server", "shutdown signal received");
            server_task.abort();
            Ok(())
        }
        joined = &mut server_task => {
            joined.map_err(|err| AppError::other(format!("proxy task failed: {err}")))?
        }
    }
}

async fn generate_once(
    config: AppConfig,
    prompt: &str,
    headshot: Option<&Path>,
    face_lock: bool,
    final_quality: bool,
    out: Option<PathBuf>,
) -> Result<()> {
    let backend = build_backend(&config)?;
    let mut session = ThumbnailSession::from_config(backend, &config)
        .with_status_callback(Box::new(|status: &str| println!("{status}")));

    let image = match headshot {
        Some(path) => Some(
            ImagePreprocessor::new(config.preprocess.clone())
                .preprocess_file(path)
                .await
                .inspect_err(|err| eprintln!("{}", err.user_message()))?,
        ),
        None => None,
    };

    let outcome = if final_quality {
        session.generate_final(prompt, image.as_ref(), face_lock).await
    } else {
        session.generate_preview(prompt, image.as_ref(), face_lock).await
    };
    if let Err(err) = outcome {
        eprintln!("{}", err.message);
        return Err(AppError::Generation(err.cause));
    }

    let (variant, exported) = session
        .export_displayed(prompt)
        .inspect_err(|err| eprintln!("{}", err.user_message()))?;
    let writer = DownloadWriter::new(out.unwrap_or(config.output_dir)).await?;
    let saved = writer
        .save_thumbnail(&exported, prompt, variant, face_lock && image.is_some())
        .await?;
    println!("Saved {} (+ {})", saved.image_path.display(), saved.meta_path.display());
    Ok(())
}

async fn fetch_once(config: &AppConfig, url: &str, dir: &Path) -> Result<()> {
    let fetched = direct_link_fetcher(config)?
        .fetch(url)
        .await
        .inspect_err(|err| eprintln!("{}", err.user_message()))?;
    let saved = DownloadWriter::new(dir).await?.save_fetched(&fetched).await?;
    println!("Saved {} (+ {})", saved.image_path.display(), saved.meta_path.display());
    Ok(())
}

/// Inputs typed at the console, passed to the session on each flow.
struct Console {
    session: ThumbnailSession,
    preprocessor: ImagePreprocessor,
    fetcher: DirectLinkFetcher<HttpThumbnailSource>,
    output_dir: PathBuf,
    prompt: String,
    headshot: Option<EncodedImage>,
    face_lock: bool,
}

async fn run_session(config: AppConfig) -> Result<()> {
    let backend = build_backend(&config)?;
    let session = ThumbnailSession::from_config(backend, &config)
        .with_status_callback(Box::new(|status: &str| println!("... {status}")));

    let mut console = Console {
        session,
        preprocessor: ImagePreprocessor::new(config.preprocess.clone()),
        fetcher: direct_link_fetcher(&config)?,
        output_dir: config.output_dir.clone(),
        prompt: String::new(),
        headshot: None,
        face_lock: false,
    };

    println!("AI Thumbnail Maker, type `help` for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target: "orchestrator", "interrupted, leaving session");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match SessionCommand::parse(&line) {
                    Ok(Some(SessionCommand::Quit)) => break,
                    Ok(Some(command)) => console.handle(command).await,
                    Ok(None) => {}
                    Err(err) => println!("{err}"),
                }
            }
        }
    }

    Ok(())
}

impl Console {
    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Prompt(text) => {
                self.prompt = text;
                println!("Prompt set.");
            }
            SessionCommand::Headshot(path) => {
                self.session.reset();
                self.headshot = None;
                match self.preprocessor.preprocess_file(&path).await {
                    Ok(image) => {
                        self.headshot = Some(image);
                        println!("Headshot attached.");
                    }
                    Err(err) => {
                        warn!(target: "orchestrator", path = %path.display(), error = %err, "headshot rejected");
                        println!("{}", err.user_message());
                    }
                }
            }
            SessionCommand::ClearHeadshot => {
                self.session.reset();
                self.headshot = None;
                println!("Headshot removed.");
            }
            SessionCommand::FaceLock(enabled) => {
                self.face_lock = enabled;
                if self.headshot.is_none() && enabled {
                    println!("Face lock on. It applies once a headshot is attached.");
                } else {
                    println!("Face lock {}.", if enabled { "on" } else { "off" });
                }
            }
            SessionCommand::Preview => {
                match self
                    .session
                    .generate_preview(&self.prompt, self.headshot.as_ref(), self.face_lock)
                    .await
                {
                    Ok(_) => println!("Preview ready. `final` enhances it, `download` saves it."),
                    Err(err) => println!("{err}"),
                }
            }
            SessionCommand::Final => {
                match self
                    .session
                    .generate_final(&self.prompt, self.headshot.as_ref(), self.face_lock)
                    .await
                {
                    Ok(_) => println!("Full HD thumbnail ready. `download` saves it."),
                    Err(err) => println!("{err}"),
                }
            }
            SessionCommand::Download(dir) => {
                let dir = dir.unwrap_or_else(|| self.output_dir.clone());
                if let Err(err) = self.download(&dir).await {
                    error!(target: "orchestrator", error = %err, "download failed");
                    println!("{}", err.user_message());
                }
            }
            SessionCommand::Fetch { url, dir } => {
                let dir = dir.unwrap_or_else(|| self.output_dir.clone());
                match self.fetcher.fetch(&url).await {
                    Ok(fetched) => match DownloadWriter::new(&dir).await {
                        Ok(writer) => match writer.save_fetched(&fetched).await {
                            Ok(saved) => println!(
                                "Saved {} (+ {})",
                                saved.image_path.display(),
                                saved.meta_path.display()
                            ),
                            Err(err) => println!("{}", err.user_message()),
                        },
                        Err(err) => println!("{}", err.user_message()),
                    },
                    Err(err) => {
                        warn!(target: "direct_link", %url, error = %err, "fetch failed");
                        println!("{}", err.user_message());
                    }
                }
            }
            SessionCommand::Status => self.print_status(),
            SessionCommand::Help => println!("{HELP_TEXT}"),
            SessionCommand::Quit => {}
        }
    }

    async fn download(&self, dir: &Path) -> std::result::Result<(), errors::ExportError> {
        let (variant, exported) = self.session.export_displayed(&self.prompt)?;
        let writer = DownloadWriter::new(dir).await?;
        let saved = writer
            .save_thumbnail(
                &exported,
                &self.prompt,
                variant,
                self.face_lock && self.headshot.is_some(),
            )
            .await?;
        println!(
            "Saved {} ({variant}, + {})",
            saved.image_path.display(),
            saved.meta_path.display()
        );
        Ok(())
    }

    fn print_status(&self) {
        let prompt = if self.prompt.is_empty() { "<none>" } else { self.prompt.as_str() };
        println!("state:     {}", self.session.state());
        println!("backend:   {}", self.session.backend_name());
        println!("prompt:    {prompt}");
        println!("headshot:  {}", if self.headshot.is_some() { "attached" } else { "none" });
        println!("face lock: {}", if self.face_lock { "on" } else { "off" });
        match self.session.displayed() {
            Some((variant, _)) => println!("showing:   {variant}"),
            None => println!("showing:   nothing"),
        }
        if let Some(message) = self.session.error() {
            println!("error:     {message}");
        }
        println!("cached:    {}", self.session.cached_entries());
    }
}
