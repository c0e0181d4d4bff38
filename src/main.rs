//! exegete CLI - search for natural-language prompts explaining a dataset.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use exegete::api;
use exegete::client::{CompletionsClient, HealthStatus};
use exegete::eval::{collect_runs, EvalHarness};
use exegete::models::{Config, Explanation, PromptCheck, RenderTemplate};
use exegete::scoring::Scorer;
use exegete::search::{create_run_dir, SuffixSearcher};
use exegete::Dataset;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "exegete")]
#[command(version)]
#[command(about = "Interpretable autoprompting: explain datasets with searched prompts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the iterative prompt search over a dataset
    Search {
        /// Path to the dataset JSONL file ({"input": ..., "output": ...})
        #[arg(short, long)]
        data: PathBuf,

        /// Base directory for the run (defaults to config output.dir)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Resume a previous run directory
        #[arg(long, conflicts_with = "out")]
        resume: Option<PathBuf>,

        /// Regex recognizing the known ground-truth description
        #[arg(long)]
        expect_pattern: Option<String>,

        /// Candidate prompt(s) injected at step 0 (repeatable)
        #[arg(long)]
        seed_prompt: Vec<String>,
    },

    /// Grow a shared explanation suffix by beam search
    Suffix {
        /// Path to the dataset JSONL file
        #[arg(short, long)]
        data: PathBuf,

        /// Base directory for the run (defaults to config output.dir)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Regex recognizing the known ground-truth description
        #[arg(long)]
        expect_pattern: Option<String>,
    },

    /// Evaluate fixed prompt(s) against a dataset, with baselines
    Eval {
        /// Path to the dataset JSONL file
        #[arg(short, long)]
        data: PathBuf,

        /// A single prompt text to evaluate
        #[arg(long, required_unless_present = "run", conflicts_with = "run")]
        prompt: Option<String>,

        /// Evaluate the ranked prompts of a previous run directory
        #[arg(long)]
        run: Option<PathBuf>,

        /// Human-written reference description, reported as its own row
        #[arg(long)]
        manual: Option<String>,
    },

    /// Aggregate results across prior runs
    Report {
        /// Glob of run directories, e.g. "runs/*"
        #[arg(long)]
        runs: String,
    },

    /// Validate configuration file
    Validate {
        /// Also ping each referenced endpoint's /models route
        #[arg(long)]
        ping: bool,
    },

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# exegete configuration file

[openrouter]
# API key (can also use OPENROUTER_API_KEY env var)
# api_key = "sk-or-..."
base_url = "https://openrouter.ai/api/v1"
timeout_secs = 180
max_retries = 3

# Additional OpenAI-compatible endpoints (vLLM, TGI, llama.cpp, ...)
# [endpoints.local]
# base_url = "http://localhost:8000/v1"
# api_key = "${VLLM_API_KEY}"

[proposer]
# Any completions-capable model; samples candidate prompts
model = { id = "openai/gpt-3.5-turbo-instruct", input_price_per_1m = 1.5, output_price_per_1m = 2.0 }
temperature = 1.0
top_p = 1.0
frequency_penalty = 1.0
max_prompt_tokens = 16
generation_stem = "To compute the output from the input, "
# seed_text = "Return the"

[scorer]
# Must support echo=true with logprobs (base models over vLLM work well)
# model = { endpoint = "local", id = "meta-llama/Llama-3.1-8B", input_price_per_1m = 0.0, output_price_per_1m = 0.0 }
model = { id = "meta-llama/llama-3.1-70b-instruct", input_price_per_1m = 0.6, output_price_per_1m = 0.6 }
batch_size = 8
max_concurrency = 4

[search]
population_size = 8
num_mutations = 4
num_random_generations = 4
batch_size = 8
n_shots = 1
single_shot_loss = false
max_steps = 100
early_stopping_rounds = 10
# max_examples = 2000
# max_cost_usd = 5.0
seed = 1
save_interval = 1

[suffix]
beam_width = 4
beam_width_extra = 8
max_new_tokens = 6
top_k = 20
max_expansions = 500

[data]
# train_split_frac = 0.8
max_dataset_size = 10000
input_prefix = "Input: "
output_prefix = "Output: "

[output]
dir = "runs"
track_costs = true
"#;
    println!("{example}");
}

/// Pull the ranked prompt texts out of a run's result.json.
fn load_run_prompts(run_dir: &std::path::Path, limit: usize) -> Result<Vec<(String, String)>> {
    let path = run_dir.join("result.json");
    let file =
        File::open(&path).with_context(|| format!("Failed to open result at {path:?}"))?;
    let explanation: Explanation = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {path:?}"))?;

    Ok(explanation
        .ranked
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, p)| (format!("rank_{}", i + 1), p.text))
        .collect())
}

fn accuracy_cell(accuracy: Option<f64>) -> String {
    match accuracy {
        Some(a) => format!("{:>5.1}%", a * 100.0),
        None => "    - ".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate { ping } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            config
                .validate_endpoints()
                .context("Endpoint validation failed")?;
            config
                .validate_settings()
                .context("Settings validation failed")?;

            for endpoint in config.referenced_endpoints() {
                if endpoint == "openrouter" {
                    config
                        .resolve_api_key()
                        .context("Failed to resolve OpenRouter API key")?;
                } else {
                    config
                        .resolve_endpoint_api_key(&endpoint)
                        .with_context(|| format!("Failed to resolve key for {endpoint:?}"))?;
                }
            }

            if ping {
                for endpoint in config.referenced_endpoints() {
                    let client = CompletionsClient::for_endpoint(&config, &endpoint, None)
                        .with_context(|| format!("Failed to build client for {endpoint:?}"))?;
                    let health = client.health_check().await;
                    match health.status {
                        HealthStatus::Healthy => info!(
                            "  Endpoint {}: healthy ({}ms)",
                            endpoint,
                            health.latency_ms.unwrap_or(0)
                        ),
                        _ => warn!(
                            "  Endpoint {}: {} ({})",
                            endpoint,
                            health.status,
                            health.error.unwrap_or_default()
                        ),
                    }
                }
            }

            info!("Configuration is valid");
            info!("  Proposer: {}", config.proposer.model.display_name());
            info!("  Scorer:   {}", config.scorer.model.display_name());
            info!(
                "  Search:   population {}, {} mutations + {} fresh per step, batch {}",
                config.search.population_size,
                config.search.num_mutations,
                config.search.num_random_generations,
                config.search.batch_size
            );
            return Ok(());
        }

        Commands::Search {
            data,
            out,
            resume,
            expect_pattern,
            seed_prompt,
        } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            config
                .validate_endpoints()
                .context("Endpoint validation failed")?;
            config
                .validate_settings()
                .context("Settings validation failed")?;

            let dataset =
                Dataset::from_jsonl(&data).with_context(|| format!("Failed to load {data:?}"))?;
            let (train, eval_split) = api::prepare_data(dataset.examples().to_vec(), &config)
                .context("Failed to prepare data")?;

            let check = expect_pattern
                .as_deref()
                .map(PromptCheck::new)
                .transpose()
                .context("Invalid --expect-pattern")?;

            let run_dir = match resume {
                Some(dir) => dir,
                None => create_run_dir(out.as_deref().unwrap_or(&config.output.dir))
                    .context("Failed to create run dir")?,
            };

            let engine = api::build_engine(&config, seed_prompt, check, run_dir.clone())
                .context("Failed to build search engine")?;

            // First Ctrl-C stops at the next step boundary; the
            // checkpoint makes the run resumable.
            let cancel = engine.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, stopping after the current step");
                    cancel.store(true, Ordering::Relaxed);
                }
            });

            let explanation = engine.run(&train, eval_split.as_ref()).await?;

            println!("\n=== Search Complete ===");
            println!("Best prompt:  {}", explanation.best.text);
            println!("Avg logprob:  {:.4}", explanation.best.avg_logprob);
            if let Some(acc) = explanation.best.accuracy {
                println!("Accuracy:     {:.1}%", acc * 100.0);
            }
            println!("Steps:        {}", explanation.stats.steps_run);
            println!("Scored:       {}", explanation.stats.candidates_scored);
            println!("Examples:     {}", explanation.stats.examples_consumed);
            println!("API calls:    {}", explanation.stats.api_calls);
            println!("Cost:         ${:.4}", explanation.stats.cost_usd);
            println!("Runtime:      {:.1}s", explanation.stats.runtime_secs);
            if let Some(reason) = explanation.stats.stop_reason {
                println!("Stopped:      {reason}");
            }
            println!("Run dir:      {}", run_dir.display());

            println!("\nTop prompts:");
            for (i, prompt) in explanation.ranked.iter().take(10).enumerate() {
                println!(
                    "{:>3}. {:>9.4}  {}  {}",
                    i + 1,
                    prompt.avg_logprob,
                    accuracy_cell(prompt.accuracy),
                    prompt.text
                );
            }
        }

        Commands::Suffix {
            data,
            out,
            expect_pattern,
        } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            config
                .validate_endpoints()
                .context("Endpoint validation failed")?;

            let dataset =
                Dataset::from_jsonl(&data).with_context(|| format!("Failed to load {data:?}"))?;

            let check = expect_pattern
                .as_deref()
                .map(PromptCheck::new)
                .transpose()
                .context("Invalid --expect-pattern")?;

            let (_, scorer_client) =
                api::build_clients(&config).context("Failed to build clients")?;
            let searcher = SuffixSearcher::new(
                Arc::clone(&scorer_client),
                config.scorer.model.clone(),
                RenderTemplate::from(&config.data),
                config.proposer.generation_stem.clone(),
                config.suffix.clone(),
            );

            let outcome = searcher.run(&dataset, check.as_ref()).await?;

            let run_dir = create_run_dir(out.as_deref().unwrap_or(&config.output.dir))
                .context("Failed to create run dir")?;
            let result_path = run_dir.join("suffix.json");
            serde_json::to_writer_pretty(
                File::create(&result_path)
                    .with_context(|| format!("Failed to create {result_path:?}"))?,
                &outcome,
            )
            .context("Failed to write suffix result")?;

            println!("\n=== Suffix Search Complete ===");
            println!("Expansions:   {}", outcome.expansions);
            println!("Candidates:   {}", outcome.candidates.len());
            println!("Cost:         ${:.4}", scorer_client.total_cost_usd());
            if let Some(matched) = &outcome.matched {
                println!("Matched:      {}", matched.text);
            }
            println!("Result:       {}", result_path.display());

            println!("\nTop suffixes:");
            for (i, candidate) in outcome.candidates.iter().take(10).enumerate() {
                println!(
                    "{:>3}. {:>10.3e}  {}",
                    i + 1,
                    candidate.running_prob,
                    candidate.text
                );
            }
        }

        Commands::Eval {
            data,
            prompt,
            run,
            manual,
        } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            config
                .validate_endpoints()
                .context("Endpoint validation failed")?;

            let dataset =
                Dataset::from_jsonl(&data).with_context(|| format!("Failed to load {data:?}"))?;

            let prompts = match (prompt, &run) {
                (Some(text), _) => vec![("prompt".to_string(), text)],
                (None, Some(dir)) => load_run_prompts(dir, config.search.population_size)?,
                (None, None) => unreachable!("clap enforces one of --prompt / --run"),
            };

            let (_, scorer_client) =
                api::build_clients(&config).context("Failed to build clients")?;
            let scorer = Scorer::new(
                Arc::clone(&scorer_client),
                &config.scorer,
                RenderTemplate::from(&config.data),
            );
            let harness = EvalHarness::new(
                scorer,
                config.search.n_shots,
                config.search.single_shot_loss,
            );

            let rows = harness
                .evaluate_many(&prompts, &dataset, manual.as_deref())
                .await?;

            println!("\n=== Evaluation Complete ===");
            println!("{:<10} {:>10} {:>7}  prompt", "label", "logprob", "acc");
            for row in &rows {
                println!(
                    "{:<10} {:>10.4} {:>6.1}%  {}",
                    row.label,
                    row.avg_logprob,
                    row.accuracy * 100.0,
                    row.prompt
                );
            }
            println!("Examples:     {}", dataset.len());
            println!("Cost:         ${:.4}", scorer_client.total_cost_usd());
        }

        Commands::Report { runs } => {
            let report = collect_runs(&runs)?;

            println!("\n=== Run Report ===");
            if report.runs.is_empty() {
                println!("No runs matched {runs:?}");
                return Ok(());
            }

            println!(
                "{:<34} {:>10} {:>7} {:>6} {:>9}  best prompt",
                "run", "logprob", "acc", "steps", "cost"
            );
            for run in &report.runs {
                println!(
                    "{:<34} {:>10.4} {:>7} {:>6} {:>8.4}$  {}",
                    run.run_dir,
                    run.best_avg_logprob,
                    accuracy_cell(run.best_accuracy).trim(),
                    run.steps_run,
                    run.cost_usd,
                    run.best_prompt
                );
            }
            println!("\nRuns:         {}", report.runs.len());
            println!("Total cost:   ${:.4}", report.total_cost_usd);
        }
    }

    Ok(())
}
