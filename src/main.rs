//! # Template Harness CLI (`tmpl`)
//!
//! The `tmpl` binary drives the retrieval and generation pipeline from the
//! command line.
//!
//! ## Usage
//!
//! ```bash
//! tmpl --config ./config/tmpl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tmpl init` | Create (or attach to) the template collection |
//! | `tmpl stats` | Show collection statistics |
//! | `tmpl clear` | Drop and recreate the collection empty |
//! | `tmpl reload [dir]` | Clear, then ingest a template directory |
//! | `tmpl search "<query>"` | Similarity search over templates |
//! | `tmpl severity <level>` | Templates of one severity |
//! | `tmpl tags <tag>...` | Templates sharing any (or `--match-mode all`) of the tags |
//! | `tmpl generate "<prompt>"` | Generate and validate a new template |
//! | `tmpl validate <file>` | Validate a template file |
//! | `tmpl run <file> --target <url>` | Run a template against a live target |
//! | `tmpl status` | Validator, store and model overview |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use template_harness::config::{self, Config};
use template_harness::embedding::create_provider;
use template_harness::index::open_index;
use template_harness::llm::{create_llm, LlmProvider};
use template_harness::loader;
use template_harness::logging;
use template_harness::models::{GenerationRequest, RetrievedMatch, TargetInfo, ValidationResult};
use template_harness::orchestrator::GenerationOrchestrator;
use template_harness::prompts::PromptSet;
use template_harness::retrieval::{RetrievalEngine, TagMatch};
use template_harness::status;
use template_harness::store::VectorStore;
use template_harness::validator::{validate_syntax, ValidationRunner};

/// Template Harness CLI: retrieval-augmented generation and validation of
/// Nuclei templates.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "tmpl",
    about = "Template Harness — retrieval-augmented generation and validation of Nuclei templates",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tmpl.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the template collection, or attach to an existing one.
    Init,

    /// Show collection statistics.
    Stats,

    /// Drop and recreate the collection empty.
    Clear,

    /// Clear the collection and ingest a template directory.
    ///
    /// Defaults to `[templates] dir` from the configuration.
    Reload {
        dir: Option<PathBuf>,
    },

    /// Similarity search over stored templates.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Templates of one severity (info, low, medium, high, critical).
    Severity {
        level: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Templates sharing the given tags.
    Tags {
        #[arg(required = true)]
        tags: Vec<String>,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// `any` keeps templates with at least one of the tags, `all` only
        /// those carrying every tag.
        #[arg(long, default_value = "any")]
        match_mode: TagMatch,

        #[arg(long)]
        json: bool,
    },

    /// Generate a template from a natural-language description.
    Generate {
        prompt: String,

        #[arg(long)]
        severity: Option<String>,

        /// Tag hint; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long)]
        author: Option<String>,

        /// Reference URL hint; repeatable.
        #[arg(long = "reference")]
        references: Vec<String>,

        /// URL of the endpoint the template should target.
        #[arg(long)]
        target_url: Option<String>,

        #[arg(long, default_value = "GET", requires = "target_url")]
        method: String,

        /// Parameter name; repeatable.
        #[arg(long = "param", requires = "target_url")]
        params: Vec<String>,

        /// `Name: value`; repeatable.
        #[arg(long = "header", requires = "target_url", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// `name=value`; repeatable.
        #[arg(long = "cookie", requires = "target_url", value_parser = parse_cookie)]
        cookies: Vec<(String, String)>,

        /// Write the accepted template to this file.
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Validate a template file.
    Validate {
        file: PathBuf,

        /// Only check YAML syntax and top-level keys; do not run the validator.
        #[arg(long)]
        syntax_only: bool,

        #[arg(long)]
        json: bool,
    },

    /// Run a template against a live target with the scanner binary.
    ///
    /// Arguments after `--` are passed to the scanner unchanged.
    Run {
        file: PathBuf,

        #[arg(long)]
        target: String,

        #[arg(long)]
        json: bool,

        #[arg(last = true)]
        extra_args: Vec<String>,
    },

    /// Show validator, store and model status.
    Status {
        #[arg(long)]
        json: bool,
    },
}

/// Components shared by the store-backed commands.
struct Pipeline {
    store: Arc<VectorStore>,
    retrieval: Arc<RetrievalEngine>,
}

async fn build_pipeline(cfg: &Config) -> Result<Pipeline> {
    let index = open_index(&cfg.store).await?;
    let embedder = create_provider(&cfg.embedding)?;
    let store = Arc::new(VectorStore::from_config(cfg, index, embedder)?);
    let retrieval = Arc::new(RetrievalEngine::new(store.clone(), cfg));
    Ok(Pipeline { store, retrieval })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pipeline = build_pipeline(&cfg).await?;
            pipeline.store.initialize().await?;
            println!(
                "Collection '{}' ready ({} backend).",
                pipeline.store.collection_name(),
                pipeline.store.backend()
            );
        }
        Commands::Stats => {
            let pipeline = build_pipeline(&cfg).await?;
            let stats = pipeline.retrieval.stats().await?;
            println!("collection: {}", stats.collection_name);
            println!("  chunks: {}", stats.total_chunks);
        }
        Commands::Clear => {
            let pipeline = build_pipeline(&cfg).await?;
            let status = pipeline.store.clear().await;
            if !status.success {
                bail!("{}", status.message);
            }
            println!("{}", status.message);
        }
        Commands::Reload { dir } => {
            let pipeline = build_pipeline(&cfg).await?;
            let dir = dir.unwrap_or_else(|| cfg.templates.dir.clone());

            if dir.is_dir() {
                let survey = loader::survey(&dir, &cfg.templates)?;
                if !survey.looks_valid() {
                    tracing::warn!(
                        dir = %dir.display(),
                        sampled = survey.sampled,
                        "No sampled file looks like a template"
                    );
                }
            }

            let report = pipeline.retrieval.reload(Some(&dir)).await?;
            println!("reload {}", dir.display());
            println!("  files loaded: {}", report.files_loaded);
            println!("  files skipped: {}", report.files_skipped);
            println!("  chunks written: {}", report.chunks_written);
            println!("ok");
        }
        Commands::Search {
            query,
            limit,
            threshold,
            json,
        } => {
            let pipeline = build_pipeline(&cfg).await?;
            let matches = pipeline.retrieval.search(&query, limit, threshold).await?;
            print_matches(&matches, json)?;
        }
        Commands::Severity { level, limit, json } => {
            let pipeline = build_pipeline(&cfg).await?;
            let matches = pipeline.retrieval.by_severity(&level, limit).await?;
            print_matches(&matches, json)?;
        }
        Commands::Tags {
            tags,
            limit,
            match_mode,
            json,
        } => {
            let pipeline = build_pipeline(&cfg).await?;
            let matches = pipeline.retrieval.by_tags(&tags, limit, match_mode).await?;
            print_matches(&matches, json)?;
        }
        Commands::Generate {
            prompt,
            severity,
            tags,
            author,
            references,
            target_url,
            method,
            params,
            headers,
            cookies,
            out,
            json,
        } => {
            let pipeline = build_pipeline(&cfg).await?;
            let llm: Arc<dyn LlmProvider> = create_llm(&cfg.llm)?;
            let validator = Arc::new(ValidationRunner::new(&cfg.validator));
            let prompts = PromptSet::load(&cfg.prompts)?;
            let orchestrator =
                GenerationOrchestrator::new(pipeline.retrieval, llm, validator, prompts, &cfg);

            let request = GenerationRequest {
                prompt,
                severity,
                tags,
                author,
                references,
                target: target_url.map(|url| TargetInfo {
                    url,
                    method,
                    parameters: params,
                    headers: headers.into_iter().collect(),
                    cookies: cookies.into_iter().collect(),
                }),
            };
            let result = orchestrator.generate_request(&request).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.success {
                println!("{}", result.content);
                eprintln!(
                    "generated {} in {} attempt(s)",
                    result.template_id, result.metadata.attempts
                );
            }

            if !result.success {
                bail!("generation failed: {}", result.validation.errors.join("; "));
            }
            if let Some(path) = out {
                write_output(&path, &result.content)?;
                eprintln!("wrote {}", path.display());
            }
        }
        Commands::Validate {
            file,
            syntax_only,
            json,
        } => {
            let result = if syntax_only {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                validate_syntax(&content)
            } else {
                ValidationRunner::new(&cfg.validator)
                    .validate_file(&file)
                    .await
            };
            print_validation(&result, json)?;
            result
                .ensure_valid()
                .with_context(|| format!("{} is not a valid template", file.display()))?;
        }
        Commands::Run {
            file,
            target,
            json,
            extra_args,
        } => {
            let run = ValidationRunner::new(&cfg.validator)
                .run_template(&file, &target, &extra_args)
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print!("{}", run.stdout);
                eprint!("{}", run.stderr);
            }
            if !run.success {
                bail!("running {} against {} failed", file.display(), target);
            }
        }
        Commands::Status { json } => {
            let pipeline = build_pipeline(&cfg).await?;
            let llm = create_llm(&cfg.llm)?;
            let validator = ValidationRunner::new(&cfg.validator);
            let snapshot = status::collect(&pipeline.retrieval, &validator, llm.as_ref()).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", status::render(&snapshot));
            }
        }
    }

    Ok(())
}

fn print_matches(matches: &[RetrievedMatch], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(matches)?);
        return Ok(());
    }
    if matches.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, m) in matches.iter().enumerate() {
        let meta = &m.metadata.template;
        println!(
            "{}. [{:.2}] {} ({})",
            i + 1,
            m.similarity,
            meta.template_id,
            if meta.severity.is_empty() { "unknown" } else { meta.severity.as_str() }
        );
        if !meta.name.is_empty() {
            println!("    name: {}", meta.name);
        }
        if !meta.tags.is_empty() {
            println!("    tags: {}", meta.tags.join(", "));
        }
        println!("    path: {}", meta.source_path);
        println!(
            "    chunk: {}/{}",
            m.metadata.chunk_index + 1,
            m.metadata.total_chunks
        );
        println!();
    }
    Ok(())
}

fn print_validation(result: &ValidationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("{}", if result.is_valid { "valid" } else { "invalid" });
    for error in &result.errors {
        println!("  error: {}", error);
    }
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected 'Name: value', got '{}'", raw)),
    }
}

fn parse_cookie(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected 'name=value', got '{}'", raw)),
    }
}

fn write_output(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}
