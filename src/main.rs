use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use storybook_pipeline::config::Config;
use storybook_pipeline::events::{Event, FnEventHandler};
use storybook_pipeline::render::{self, Txt2ImgFactory};
use storybook_pipeline::{ExecCtx, Orchestrator, RenderTarget, State};

#[derive(Parser)]
#[command(name = "storybook", version, about = "Turn a theme into an illustrated children's book")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "storybook.yml")]
    config: PathBuf,

    /// Do not echo streamed tokens
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and print its identifier
    New {
        /// Text model
        #[arg(short, long)]
        model: Option<String>,
        /// Rendering profile
        #[arg(short, long, default_value = "sdxl")]
        image_model: String,
    },
    /// Suggest three themes
    Topics { run_id: String },
    /// Choose the theme (suggested or your own)
    ChooseTopic { run_id: String, topic: String },
    /// Generate title, outline and all seven pages
    Storyline { run_id: String },
    /// Replace the generated title
    EditTitle { run_id: String, title: String },
    /// Replace a page's text or illustration description
    EditPage {
        run_id: String,
        /// 1-based page number
        page: usize,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Accept the storyline and start rendering
    ConfirmStoryline { run_id: String },
    /// Render missing images
    Render {
        run_id: String,
        /// Render only the next missing image
        #[arg(long)]
        next: bool,
    },
    /// Render one page's image again
    Regenerate {
        run_id: String,
        /// 1-based page number
        page: usize,
    },
    /// Render the cover again
    RegenerateCover { run_id: String },
    /// Accept the rendered images
    ConfirmImages { run_id: String },
    /// Write the book document
    Assemble { run_id: String },
    /// Show where a run stands
    Status { run_id: String },
}

fn page_index(page: usize) -> Result<usize> {
    page.checked_sub(1)
        .context("page numbers start at 1")
}

fn print_storyline(state: &State) {
    let Some(storyline) = &state.storyline else {
        return;
    };
    println!("# {}", storyline.title);
    for (i, page) in storyline.pages.iter().enumerate() {
        println!("\n## Seite {}\n{}\n> {}", i + 1, page.text, page.image_description);
    }
}

fn describe(target: RenderTarget) -> String {
    match target {
        RenderTarget::Cover => "cover".to_string(),
        RenderTarget::Page(i) => format!("page {}", i + 1),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let quiet = cli.quiet;
    let handler = Arc::new(FnEventHandler(move |event: Event| match event {
        Event::Token { chunk, .. } if !quiet => {
            eprint!("{}", chunk);
            let _ = std::io::stderr().flush();
        }
        Event::StageEnd { .. } if !quiet => eprintln!(),
        Event::ImageRendered { page, path } => match page {
            Some(page) => eprintln!("page {} -> {}", page, path),
            None => eprintln!("cover -> {}", path),
        },
        _ => {}
    }));

    let ctx = ExecCtx::builder(&config.text.base_url)
        .timeout(Duration::from_secs(config.text.timeout_secs))
        .streaming(config.text.streaming)
        .llm_config(config.text.llm_config())
        .event_handler(handler)
        .build()
        .context("building text backend context")?;

    let image_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.image.timeout_secs))
        .build()
        .context("building image client")?;
    let images = Arc::new(Txt2ImgFactory::new(image_client, &config.image.base_url));
    let orchestrator = Orchestrator::from_config(&config, ctx, images);

    match cli.command {
        Commands::New { model, image_model } => {
            let model = match model {
                Some(model) => model,
                None => config
                    .text
                    .models
                    .first()
                    .cloned()
                    .context("no text model configured")?,
            };
            let run_id = orchestrator
                .create_run(&model, &image_model)
                .await
                .with_context(|| format!("known profiles: {}", render::profile_keys().join(", ")))?;
            println!("{}", run_id);
        }
        Commands::Topics { run_id } => {
            for (i, topic) in orchestrator.suggest_topics(&run_id).await?.iter().enumerate() {
                println!("{}. {}", i + 1, topic);
            }
        }
        Commands::ChooseTopic { run_id, topic } => {
            orchestrator.choose_topic(&run_id, &topic).await?;
        }
        Commands::Storyline { run_id } => {
            let state = orchestrator
                .generate_storyline(&run_id)
                .await
                .context("storyline generation failed; run the command again to retry")?;
            print_storyline(&state);
        }
        Commands::EditTitle { run_id, title } => {
            let state = orchestrator.edit_title(&run_id, &title).await?;
            print_storyline(&state);
        }
        Commands::EditPage {
            run_id,
            page,
            text,
            description,
        } => {
            let state = orchestrator
                .edit_page(&run_id, page_index(page)?, text.as_deref(), description.as_deref())
                .await?;
            print_storyline(&state);
        }
        Commands::ConfirmStoryline { run_id } => {
            orchestrator.confirm_storyline(&run_id).await?;
        }
        Commands::Render { run_id, next } => {
            if next {
                match orchestrator.render_next(&run_id).await? {
                    Some(target) => println!("rendered {}", describe(target)),
                    None => println!("all images present"),
                }
            } else {
                let rendered = orchestrator
                    .render_all(&run_id)
                    .await
                    .context("rendering stopped; run the command again to resume")?;
                println!("rendered {} images", rendered.len());
            }
        }
        Commands::Regenerate { run_id, page } => {
            orchestrator.regenerate_page(&run_id, page_index(page)?).await?;
        }
        Commands::RegenerateCover { run_id } => {
            orchestrator.regenerate_cover(&run_id).await?;
        }
        Commands::ConfirmImages { run_id } => {
            orchestrator.confirm_images(&run_id).await?;
        }
        Commands::Assemble { run_id } => {
            let path = orchestrator.assemble(&run_id).await?;
            println!("{}", path.display());
        }
        Commands::Status { run_id } => {
            let status = orchestrator.status(&run_id).await?;
            println!("run:    {}", status.run_id);
            println!("step:   {}", status.step);
            if let Some(topic) = &status.topic {
                println!("topic:  {}", topic);
            }
            if let Some(title) = &status.title {
                println!("title:  {}", title);
                let pending: Vec<String> =
                    status.pending_pages.iter().map(|i| (i + 1).to_string()).collect();
                println!("cover:  {}", if status.cover_pending { "pending" } else { "done" });
                println!(
                    "pages:  {}",
                    if pending.is_empty() { "all rendered".to_string() } else { format!("pending {}", pending.join(", ")) }
                );
            }
        }
    }

    Ok(())
}
