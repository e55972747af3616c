//! sled-decode CLI: multi-layer blended decoding
//!
//! Logs go to stderr; results are JSON on stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use sled_decode::{
    CalibrationConfig, Calibrator, Decoder, GenerationConfig, LayerStrategy, SledConfig,
    SledModel, SledService, Weighting,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sled-decode")]
#[command(about = "Multi-layer blended decoding for causal language models")]
#[command(version)]
struct Cli {
    /// Local model directory or HuggingFace model id
    #[arg(short, long, default_value = "Qwen/Qwen2.5-0.5B-Instruct")]
    model: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

/// Layer and weighting options shared by the subcommands
#[derive(clap::Args, Debug, Clone)]
struct SledArgs {
    /// Layer selection: last_k or all
    #[arg(long, default_value = "last_k")]
    layers: LayerStrategy,

    /// Number of final layers for last_k
    #[arg(short, long, default_value_t = 8)]
    k: usize,

    /// Weighting: uniform, depth_softmax or learned
    #[arg(long, default_value = "uniform")]
    weighting: Weighting,

    /// Learned weights artifact
    #[arg(long, default_value = "sled_weights.safetensors")]
    weights_path: PathBuf,
}

impl SledArgs {
    fn to_config(&self) -> SledConfig {
        SledConfig {
            layers: self.layers,
            k: self.k,
            weighting: self.weighting,
            weights_path: self.weights_path.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Generate a completion for one prompt
    Generate {
        /// Prompt text
        prompt: String,

        /// Sample from the final layer only
        #[arg(long)]
        baseline: bool,

        #[command(flatten)]
        sled: SledArgs,

        #[arg(long, default_value_t = 256)]
        max_new_tokens: usize,

        /// 0 = greedy
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,

        #[arg(long, default_value_t = 0.95)]
        top_p: f32,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Fit learned layer weights from a JSONL dataset
    Calibrate {
        /// Dataset with `prompt` and `answer` (or `completion`) per line
        #[arg(long, default_value = "eval/items.jsonl")]
        data: PathBuf,

        #[command(flatten)]
        sled: SledArgs,

        #[arg(long, default_value_t = 1.0)]
        alpha: f64,

        #[arg(long, default_value_t = 200)]
        max_items: usize,

        #[arg(long, default_value_t = 32)]
        max_new_tokens: usize,
    },
    /// Answer JSON-lines requests on stdin
    Serve {
        #[command(flatten)]
        sled: SledArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging on stderr so stdout stays machine-readable
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loading model...");
    let model = SledModel::from_pretrained_with_device(&cli.model, Some(cli.cpu))?;
    info!(
        "Model {} ({:?}) on {:?}: {} layers, {} hidden, vocab {}",
        model.model_id(),
        model.architecture(),
        model.device(),
        model.n_layers(),
        model.d_model(),
        model.vocab_size()
    );

    match cli.command {
        Command::Generate {
            prompt,
            baseline,
            sled,
            max_new_tokens,
            temperature,
            top_p,
            seed,
        } => {
            let config = GenerationConfig {
                max_new_tokens,
                temperature,
                top_p,
                seed,
            };
            let decoder = Decoder::new(model.backend(), model.tokenizer());
            let output = if baseline {
                let generation = decoder.generate_baseline(&prompt, &config)?;
                serde_json::json!({ "mode": "baseline", "generation": generation })
            } else {
                let (generation, metadata) =
                    decoder.generate_sled(&prompt, &config, &sled.to_config())?;
                serde_json::json!({ "mode": "sled", "generation": generation, "metadata": metadata })
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Calibrate {
            data,
            sled,
            alpha,
            max_items,
            max_new_tokens,
        } => {
            let config = CalibrationConfig {
                dataset_path: data,
                layers: sled.layers,
                k: sled.k,
                ridge_alpha: alpha,
                max_items,
                max_new_tokens_per_item: max_new_tokens,
                out_path: sled.weights_path,
            };
            let calibrator = Calibrator::new(model.backend(), model.tokenizer())?;
            let report = calibrator.fit(&config);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                std::process::exit(1);
            }
        }
        Command::Serve { sled } => {
            info!("Serving JSON-lines requests on stdin");
            let mut service =
                SledService::new(model.backend(), model.tokenizer(), sled.to_config());
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            service.serve(stdin.lock(), stdout.lock())?;
        }
    }

    Ok(())
}
