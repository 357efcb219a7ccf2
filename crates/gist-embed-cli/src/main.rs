//! gist-embed — entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use gist_embed::config::resolve_config_path;
use gist_embed::{EmbedConfig, Resolver};
use gist_embed_cli::{http_resolver, render_html, Mode, RenderOptions};

#[derive(Parser)]
#[command(
    name = "gist-embed",
    about = "Resolve gist placeholders in HTML pages and inline the hosted content",
    version
)]
struct Cli {
    /// Path to a JSON config file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the resolver endpoint.
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve every target element of an HTML file.
    Render {
        /// Input HTML file.
        input: PathBuf,

        /// Data attribute naming the identifier (`gist-id`, `gistId` or `data-gist-id`).
        /// Read from the page's bootstrap script when omitted.
        #[arg(short, long)]
        attr: Option<String>,

        /// When to run the activation.
        #[arg(long, value_enum, default_value_t = Mode::Once)]
        mode: Mode,

        /// Container selector for `watch` and `poll`.
        #[arg(long)]
        container: Option<String>,

        /// Output file. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resolve one identifier and print the result as JSON.
    Fetch {
        identifier: String,
    },

    /// Print the effective configuration as JSON.
    Info,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   gist-embed completions bash > ~/.local/share/bash-completion/completions/gist-embed
    ///   gist-embed completions zsh > ~/.zfunc/_gist-embed
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = EmbedConfig::load(cli.config.as_deref())?;
    if let Some(endpoint) = cli.endpoint {
        config.resolver.endpoint = endpoint;
    }

    match cli.command {
        Commands::Render {
            input,
            attr,
            mode,
            container,
            output,
        } => {
            let source = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let resolver: Arc<dyn Resolver> = Arc::new(http_resolver(&config.resolver)?);
            let options = RenderOptions {
                attribute: attr,
                mode,
                container,
                config,
            };

            let (html, report) = render_html(&source, resolver, &options).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, html)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("{}", serde_json::to_string(&report)?);
                }
                None => println!("{html}"),
            }
            if !report.fired {
                std::process::exit(2);
            }
        }

        Commands::Fetch { identifier } => {
            let resolver = http_resolver(&config.resolver)?;
            match resolver.resolve(&identifier).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Info => {
            let info = serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "config_path": resolve_config_path(cli.config.as_deref()),
                "config": config,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "gist-embed", &mut std::io::stdout());
        }
    }

    Ok(())
}
