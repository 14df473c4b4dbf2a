//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! shardtrain train config.yaml
//! shardtrain train config.yaml --load-checkpoint full::ckpt/train_state.ckpt
//! shardtrain validate config.yaml
//! shardtrain inspect ckpt/train_state.ckpt --format json
//! shardtrain export ckpt/train_state.ckpt --output model.safetensors
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sharded training with streaming checkpoints
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "shardtrain")]
#[command(version)]
#[command(about = "Resumable sharded language model training with streaming checkpoints")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Train from a YAML configuration
    Train(TrainArgs),

    /// Validate a configuration file without training
    Validate(ValidateArgs),

    /// Show the metadata and leaves of a checkpoint
    Inspect(InspectArgs),

    /// Export the parameters of a checkpoint as SafeTensors
    Export(ExportArgs),
}

/// Arguments for the train command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct TrainArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Override the checkpoint directory
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Override the load source (scratch, params-only::P, full::P, pretrained::P)
    #[arg(long)]
    pub load_checkpoint: Option<String>,

    /// Override the dataset state file to resume the data iterators from
    #[arg(long)]
    pub load_dataset_state: Option<PathBuf>,

    /// Override total steps
    #[arg(long)]
    pub total_steps: Option<u64>,

    /// Override the weight of the pt loss
    #[arg(long)]
    pub pt_loss_weight: Option<f64>,

    /// Random seed for reproducibility
    #[arg(long)]
    pub seed: Option<u64>,

    /// Index of this process; only process 0 writes checkpoints
    #[arg(long)]
    pub process_index: Option<usize>,

    /// Dry run (validate config but don't train)
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Also check that data and checkpoint paths exist
    #[arg(long)]
    pub check_paths: bool,
}

/// Arguments for the inspect command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InspectArgs {
    /// Path to a checkpoint file
    #[arg(value_name = "CHECKPOINT")]
    pub checkpoint: PathBuf,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the export command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ExportArgs {
    /// Path to a checkpoint file
    #[arg(value_name = "CHECKPOINT")]
    pub checkpoint: PathBuf,

    /// Output SafeTensors file
    #[arg(short, long)]
    pub output: PathBuf,
}

/// Output format for the inspect command
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Unknown output format: {s}. Valid formats: text, json"
            )),
        }
    }
}

/// Parse CLI arguments from a string slice (for testing)
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Apply command-line overrides to a TrainSpec
pub fn apply_overrides(spec: &mut super::TrainSpec, args: &TrainArgs) {
    if let Some(dir) = &args.checkpoint_dir {
        spec.run.checkpoint_dir = dir.clone();
    }
    if let Some(source) = &args.load_checkpoint {
        spec.run.load_checkpoint = source.clone();
    }
    if let Some(path) = &args.load_dataset_state {
        spec.run.load_dataset_state = Some(path.clone());
    }
    if let Some(steps) = args.total_steps {
        spec.run.total_steps = steps;
    }
    if let Some(weight) = args.pt_loss_weight {
        spec.run.pt_loss_weight = weight;
    }
    if let Some(seed) = args.seed {
        spec.run.seed = seed;
    }
    if let Some(index) = args.process_index {
        spec.run.process_index = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_train_command() {
        let cli = parse_args(["shardtrain", "train", "config.yaml"]).unwrap();
        match cli.command {
            Command::Train(args) => {
                assert_eq!(args.config, PathBuf::from("config.yaml"));
                assert!(!args.dry_run);
                assert_eq!(args.load_checkpoint, None);
            }
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_parse_train_with_overrides() {
        let cli = parse_args([
            "shardtrain",
            "train",
            "config.yaml",
            "--total-steps",
            "1000",
            "--seed",
            "7",
            "--pt-loss-weight",
            "0.25",
            "--checkpoint-dir",
            "./out",
            "--load-checkpoint",
            "full::out/train_state.ckpt",
        ])
        .unwrap();

        match cli.command {
            Command::Train(args) => {
                assert_eq!(args.total_steps, Some(1000));
                assert_eq!(args.seed, Some(7));
                assert_eq!(args.pt_loss_weight, Some(0.25));
                assert_eq!(args.checkpoint_dir, Some(PathBuf::from("./out")));
                assert_eq!(
                    args.load_checkpoint.as_deref(),
                    Some("full::out/train_state.ckpt")
                );
            }
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_parse_train_dry_run() {
        let cli = parse_args(["shardtrain", "train", "config.yaml", "--dry-run"]).unwrap();
        match cli.command {
            Command::Train(args) => assert!(args.dry_run),
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_parse_validate_command() {
        let cli = parse_args(["shardtrain", "validate", "config.yaml", "--check-paths"]).unwrap();
        match cli.command {
            Command::Validate(args) => {
                assert_eq!(args.config, PathBuf::from("config.yaml"));
                assert!(args.check_paths);
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_parse_inspect_command() {
        let cli = parse_args(["shardtrain", "inspect", "train_state.ckpt", "-f", "json"]).unwrap();
        match cli.command {
            Command::Inspect(args) => {
                assert_eq!(args.checkpoint, PathBuf::from("train_state.ckpt"));
                assert_eq!(args.format, OutputFormat::Json);
            }
            _ => panic!("Expected Inspect command"),
        }
    }

    #[test]
    fn test_parse_export_requires_output() {
        assert!(parse_args(["shardtrain", "export", "train_state.ckpt"]).is_err());

        let cli = parse_args([
            "shardtrain",
            "export",
            "train_state.ckpt",
            "--output",
            "model.safetensors",
        ])
        .unwrap();
        match cli.command {
            Command::Export(args) => {
                assert_eq!(args.output, PathBuf::from("model.safetensors"));
            }
            _ => panic!("Expected Export command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = parse_args(["shardtrain", "-v", "validate", "config.yaml"]).unwrap();
        assert!(cli.verbose);
        assert!(!cli.quiet);

        let cli = parse_args(["shardtrain", "validate", "config.yaml", "--quiet"]).unwrap();
        assert!(cli.quiet);
    }

    #[test]
    fn test_unknown_format() {
        let result: Result<OutputFormat, _> = "yaml".parse();
        assert!(result.is_err());
        assert!(parse_args(["shardtrain", "inspect", "c.ckpt", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_apply_overrides() {
        use crate::config::schema::*;
        use crate::sharding::PartitionSpec;
        use crate::train::BigramConfig;

        let mut spec = TrainSpec {
            run: RunParams::default(),
            mesh: MeshSpec::default(),
            partition_rules: vec![PartitionRuleSpec {
                pattern: ".*".to_string(),
                spec: PartitionSpec::default(),
            }],
            optimizer: OptimSpec {
                name: "sgd".to_string(),
                lr: 0.1,
                end_lr: 0.0,
                warmup_steps: 0,
                decay_steps: 0,
                max_grad_norm: None,
                weight_decay_exclusions: vec![],
                params: Default::default(),
            },
            model: ModelSpec::Bigram(BigramConfig::new(8)),
            data: DataConfig {
                hf: PathBuf::from("hf.jsonl"),
                pt: PathBuf::from("pt.jsonl"),
                eval_hf: None,
                eval_pt: None,
                batch_size: 2,
                seq_len: 4,
                pad_token: 0,
            },
        };

        let args = TrainArgs {
            config: PathBuf::from("config.yaml"),
            checkpoint_dir: Some(PathBuf::from("/tmp/run")),
            load_checkpoint: Some("params-only::/tmp/run/train_state.ckpt".to_string()),
            load_dataset_state: None,
            total_steps: Some(500),
            pt_loss_weight: None,
            seed: Some(3),
            process_index: Some(1),
            dry_run: false,
        };
        apply_overrides(&mut spec, &args);

        assert_eq!(spec.run.checkpoint_dir, PathBuf::from("/tmp/run"));
        assert_eq!(spec.run.load_checkpoint, "params-only::/tmp/run/train_state.ckpt");
        assert_eq!(spec.run.total_steps, 500);
        assert_eq!(spec.run.seed, 3);
        assert_eq!(spec.run.process_index, 1);
        assert_eq!(spec.run.pt_loss_weight, 0.01);
        assert_eq!(spec.run.load_dataset_state, None);
    }
}
