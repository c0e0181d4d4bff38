//! High-level entry point: explain a dataset in one call.

use crate::client::{CompletionsClient, RateLimiter};
use crate::models::{
    Config, Dataset, Example, Explanation, PromptCheck, RenderTemplate, Result,
};
use crate::scoring::Scorer;
use crate::search::{create_run_dir, Proposer, SearchEngine};
use std::sync::Arc;

/// Construct the proposer and scorer clients from config. Both share one
/// rate limiter, and one client is reused when both roles point at the
/// same endpoint.
pub fn build_clients(
    config: &Config,
) -> Result<(Arc<CompletionsClient>, Arc<CompletionsClient>)> {
    let limiter = Arc::new(RateLimiter::new());

    let proposer_client = Arc::new(CompletionsClient::for_endpoint(
        config,
        &config.proposer.model.endpoint,
        Some(Arc::clone(&limiter)),
    )?);

    let scorer_client = if config.scorer.model.endpoint == config.proposer.model.endpoint {
        Arc::clone(&proposer_client)
    } else {
        Arc::new(CompletionsClient::for_endpoint(
            config,
            &config.scorer.model.endpoint,
            Some(limiter),
        )?)
    };

    Ok((proposer_client, scorer_client))
}

/// Split raw examples into the loop's training data and the optional
/// held-back evaluation split, honoring the configured size cap.
pub fn prepare_data(examples: Vec<Example>, config: &Config) -> Result<(Dataset, Option<Dataset>)> {
    let dataset = Dataset::new(examples)?.truncated(config.data.max_dataset_size);
    match config.data.train_split_frac {
        Some(frac) => {
            let (train, eval) = dataset.split(frac)?;
            Ok((train, Some(eval)))
        }
        None => Ok((dataset, None)),
    }
}

/// Build a ready-to-run engine writing into `run_dir`.
pub fn build_engine(
    config: &Config,
    seeds: Vec<String>,
    check: Option<PromptCheck>,
    run_dir: std::path::PathBuf,
) -> Result<SearchEngine> {
    let (proposer_client, scorer_client) = build_clients(config)?;
    let template = RenderTemplate::from(&config.data);

    let proposer = Proposer::new(
        Arc::clone(&proposer_client),
        &config.proposer,
        template.clone(),
    );
    let scorer = Scorer::new(Arc::clone(&scorer_client), &config.scorer, template);

    SearchEngine::new(
        proposer,
        scorer,
        config.search.clone(),
        seeds,
        check,
        vec![proposer_client, scorer_client],
        run_dir,
    )
}

/// Search for a short natural-language prompt that explains how each
/// example's output follows from its input.
///
/// This is the whole library in one call: it validates the config,
/// builds the API clients, runs the iterative search to completion in a
/// fresh run directory under the configured output root, and returns the
/// prompts ranked by how well the scoring model predicts the outputs
/// with each prompt prepended.
pub async fn explain_dataset(examples: Vec<Example>, config: &Config) -> Result<Explanation> {
    config.validate_endpoints()?;
    config.validate_settings()?;

    let (train, eval) = prepare_data(examples, config)?;
    let run_dir = create_run_dir(&config.output.dir)?;
    let engine = build_engine(config, Vec::new(), None, run_dir)?;

    engine.run(&train, eval.as_ref()).await
}
