//! CLI for Charsheet - character sheet generation across AI image providers.

use anyhow::Context;
use charsheet::config::{default_prompt, Settings};
use charsheet::payload::{respond, GenerateRequestBody, PayloadResponse, SingleGenerationResponse};
use charsheet::projection::{global_banner, project, Badge};
use charsheet::{
    GenerationRequest, ImageInput, InvocationResultSet, Orchestrator, OrchestratorConfig,
    ProviderRegistry, ProviderSelection,
};
use clap::{Args, Parser, Subcommand};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "charsheet")]
#[command(about = "Generate character sheets from an avatar with several AI image models at once")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a character sheet with every selected model
    Generate(GenerateArgs),

    /// List registered providers and whether they are configured
    Providers,

    /// Run a JSON request body and print the response body
    Payload(PayloadArgs),
}

#[derive(Args)]
struct GenerateArgs {
    /// Instructions for the character sheet (default: stock prompt for the flow)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Avatar image (JPG, PNG or WebP)
    #[arg(short, long)]
    image: PathBuf,

    /// Layout template image to follow
    #[arg(short, long)]
    template: Option<PathBuf>,

    /// Selection as provider[:model[:label]], repeatable (default: stock set)
    #[arg(short, long = "select", value_parser = parse_selection)]
    selections: Vec<ProviderSelection>,

    /// Use only DEFAULT_PROVIDER with its default model
    #[arg(long, conflicts_with = "selections")]
    single: bool,

    /// Directory generated images are written to
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Per-selection timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Args)]
struct PayloadArgs {
    /// JSON request body file, or `-` for stdin
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is not an error.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("charsheet=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let registry = Arc::new(
        ProviderRegistry::with_defaults()
            .credentials_from_env()
            .build(),
    );

    match cli.command {
        Commands::Generate(args) => generate(args, &settings, registry, cli.json).await,
        Commands::Providers => list_providers(&registry, cli.json),
        Commands::Payload(args) => run_payload(args, &settings, registry).await,
    }
}

fn parse_selection(raw: &str) -> Result<ProviderSelection, String> {
    let mut parts = raw.splitn(3, ':').map(str::trim);
    let provider = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| format!("'{raw}': expected provider[:model[:label]]"))?;
    let model = parts.next().unwrap_or_default();
    let mut selection = ProviderSelection::new(raw, provider.to_ascii_lowercase(), model);
    if let Some(label) = parts.next().filter(|l| !l.is_empty()) {
        selection = selection.with_label(label);
    }
    Ok(selection)
}

/// Fills in default models and gives every selection a unique id.
fn resolve_selections(
    args: &GenerateArgs,
    settings: &Settings,
    registry: &ProviderRegistry,
) -> anyhow::Result<Vec<ProviderSelection>> {
    if args.single {
        let entry = registry.resolve(&settings.default_provider)?;
        return Ok(vec![ProviderSelection::new(
            entry.id(),
            entry.id(),
            entry.default_model(),
        )
        .with_label(entry.name())]);
    }
    if args.selections.is_empty() {
        return Ok(ProviderSelection::defaults());
    }

    let mut seen = HashSet::new();
    let mut selections = Vec::with_capacity(args.selections.len());
    for selection in &args.selections {
        let mut selection = selection.clone();
        if selection.model_id.is_empty() {
            // Unknown providers keep an empty model and fail on their own.
            if let Ok(entry) = registry.resolve(&selection.provider_id) {
                selection.model_id = entry.default_model().to_string();
            }
        }
        if selection.display_label.is_empty() {
            selection.display_label = selection.model_id.clone();
        }
        let base = format!("{}:{}", selection.provider_id, selection.model_id);
        let mut id = base.clone();
        let mut n = 1;
        while !seen.insert(id.clone()) {
            n += 1;
            id = format!("{base}#{n}");
        }
        selection.selection_id = id;
        selections.push(selection);
    }
    Ok(selections)
}

async fn generate(
    args: GenerateArgs,
    settings: &Settings,
    registry: Arc<ProviderRegistry>,
    json_output: bool,
) -> anyhow::Result<()> {
    let avatar = ImageInput::from_path(&args.image)
        .with_context(|| format!("reading avatar {}", args.image.display()))?;
    let template = match args.template {
        Some(ref path) => Some(
            ImageInput::from_path(path)
                .with_context(|| format!("reading template {}", path.display()))?,
        ),
        None => None,
    };
    let prompt = args
        .prompt
        .clone()
        .unwrap_or_else(|| default_prompt(template.is_some()).to_string());
    let mut request = GenerationRequest::new(prompt, avatar);
    if let Some(template) = template {
        request = request.with_template(template);
    }

    let selections = resolve_selections(&args, settings, &registry)?;

    let mut config = OrchestratorConfig::from(settings);
    if let Some(secs) = args.timeout {
        config.selection_timeout = Duration::from_secs(secs.max(1));
    }
    let orchestrator = Orchestrator::new(registry).with_config(config);

    let invocation = orchestrator.generate(request, selections.clone())?;

    if !json_output {
        eprintln!("Generating with {} model(s)...", selections.len());
    }
    let mut printed = HashSet::new();
    let mut updates = invocation.subscribe();
    while let Some(snapshot) = updates.next().await {
        if !json_output {
            print_settled(&selections, &snapshot, &mut printed);
        }
        if snapshot.is_settled() {
            break;
        }
    }

    let report = invocation.wait().await;
    if !json_output {
        print_settled(&selections, &report.results, &mut printed);
    }

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    let mut rows = Vec::with_capacity(report.results.len());
    let mut stems = HashSet::new();
    for outcome in &report.results {
        let output = match outcome.images().first() {
            Some(image) => {
                let path = args.output_dir.join(format!(
                    "{}.{}",
                    unique_stem(&outcome.selection_id, &mut stems),
                    image.format.extension()
                ));
                image.save(&path)?;
                Some(path)
            }
            None => None,
        };

        if !json_output {
            if let Some(ref path) = output {
                println!("{}: {}", outcome.selection_id, path.display());
            }
        }

        rows.push(serde_json::json!({
            "selectionId": outcome.selection_id,
            "providerId": outcome.provider_id,
            "modelId": outcome.model_id,
            "status": outcome.status_name(),
            "output": output.map(|p| p.display().to_string()),
            "error": outcome.error(),
            "durationMs": outcome.duration_ms,
        }));
    }

    if json_output {
        let result = serde_json::json!({
            "invocationId": report.invocation_id,
            "success": report.error.is_none(),
            "succeeded": report.results.success_count(),
            "failed": report.results.failure_count(),
            "results": rows,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(banner) = global_banner(&report.results) {
        eprintln!("{banner}");
    }

    match report.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn print_settled(
    selections: &[ProviderSelection],
    snapshot: &InvocationResultSet,
    printed: &mut HashSet<String>,
) {
    for row in project(selections, snapshot) {
        if matches!(row.badge, Badge::Success | Badge::Error) && printed.insert(row.selection_id.clone())
        {
            eprintln!("  {row}");
        }
    }
}

fn file_stem(selection_id: &str) -> String {
    selection_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File stem for a selection, suffixed when an earlier id mapped to it.
fn unique_stem(selection_id: &str, used: &mut HashSet<String>) -> String {
    let base = file_stem(selection_id);
    let mut stem = base.clone();
    let mut n = 1;
    while !used.insert(stem.clone()) {
        n += 1;
        stem = format!("{base}-{n}");
    }
    stem
}

fn list_providers(registry: &ProviderRegistry, json_output: bool) -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct ProviderInfo<'a> {
        id: &'a str,
        name: &'a str,
        default_model: &'a str,
        env_vars: Vec<String>,
        configured: bool,
    }

    let providers: Vec<ProviderInfo<'_>> = registry
        .entries()
        .iter()
        .map(|e| ProviderInfo {
            id: e.id(),
            name: e.name(),
            default_model: e.default_model(),
            env_vars: e.credential_env_vars(),
            configured: registry.has_credential(e.id()),
        })
        .collect();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&providers)?);
    } else {
        println!("Registered providers:\n");
        for p in &providers {
            let status = if p.configured { "✓" } else { "✗" };
            println!("  {} {} ({})", status, p.name, p.id);
            println!("    Default model: {}", p.default_model);
            println!("    API key: {}", p.env_vars.join(" or "));
        }
    }

    Ok(())
}

async fn run_payload(
    args: PayloadArgs,
    settings: &Settings,
    registry: Arc<ProviderRegistry>,
) -> anyhow::Result<()> {
    let text = read_input(&args.file)?;
    let orchestrator =
        Orchestrator::new(registry).with_config(OrchestratorConfig::from(settings));

    let response = match GenerateRequestBody::from_json(&text) {
        Ok(body) => respond(&orchestrator, body).await,
        Err(e) => PayloadResponse::Single(SingleGenerationResponse::from_error(&e)),
    };

    println!("{}", serde_json::to_string_pretty(&response)?);

    let status = response.status_code();
    if status != 200 {
        anyhow::bail!("request failed with HTTP status {status}");
    }
    Ok(())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection() {
        let s = parse_selection("Gemini:gemini-3-pro-image-preview:Gemini Pro").unwrap();
        assert_eq!(s.provider_id, "gemini");
        assert_eq!(s.model_id, "gemini-3-pro-image-preview");
        assert_eq!(s.display_label, "Gemini Pro");

        let s = parse_selection("flux").unwrap();
        assert_eq!(s.provider_id, "flux");
        assert!(s.model_id.is_empty());

        assert!(parse_selection(":model").is_err());
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(
            file_stem("flux:black-forest-labs/flux-kontext-pro#2"),
            "flux_black-forest-labs_flux-kontext-pro_2"
        );
    }

    #[test]
    fn test_colliding_ids_get_distinct_stems() {
        let mut used = HashSet::new();
        assert_eq!(unique_stem("flux:a/b", &mut used), "flux_a_b");
        assert_eq!(unique_stem("flux:a_b", &mut used), "flux_a_b-2");
        assert_eq!(unique_stem("flux_a_b", &mut used), "flux_a_b-3");
        assert_eq!(unique_stem("gemini:m", &mut used), "gemini_m");
    }

    #[test]
    fn test_prompt_is_optional() {
        let cli = Cli::try_parse_from(["charsheet", "generate", "-i", "avatar.png"]).unwrap();
        match cli.command {
            Commands::Generate(args) => assert!(args.prompt.is_none()),
            _ => panic!("expected generate"),
        }
    }
}
