//! `lgp` CLI - maintain and query an LGP annotation corpus

mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use lgp_corpus::captions::CaptionFormat;
use lgp_corpus::VectorField;

#[derive(Parser)]
#[command(name = "lgp")]
#[command(about = "Annotation reconciliation, embedding and search for LGP video corpora")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/lgp/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the annotation store and captions for every unparsed EAF file
    Parse,

    /// Extract annotation frames and phrase stills
    Frames,

    /// Generate embeddings for every video without them
    Embed,

    /// Push all embedded annotations to the search index
    Reindex,

    /// Run parse, frames, embed and reindex in order
    Pipeline,

    /// Render the caption track of a video
    Captions {
        /// Video id
        video: String,

        /// Caption format
        #[arg(short, long, value_enum, default_value = "vtt")]
        format: CaptionFormatArg,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the annotation store of a video as JSON
    Show {
        /// Video id
        video: String,

        /// Only this tier
        #[arg(short, long)]
        tier: Option<String>,
    },

    /// Add an annotation (a parent is created on referential tiers)
    Add {
        /// Video id
        video: String,

        #[arg(short, long)]
        tier: String,

        #[arg(long)]
        value: String,

        /// Start as milliseconds or HH:MM:SS.mmm
        #[arg(long, value_parser = parse_time)]
        start: u64,

        /// End as milliseconds or HH:MM:SS.mmm
        #[arg(long, value_parser = parse_time)]
        end: u64,

        /// Attach to this existing parent annotation
        #[arg(long = "ref")]
        ref_annotation: Option<String>,

        /// Opaque page to return to, echoed in the report
        #[arg(long)]
        return_to: Option<String>,
    },

    /// Change an annotation's value and optionally its time range
    Edit {
        /// Video id
        video: String,

        #[arg(short, long)]
        tier: String,

        /// Annotation id (e.g. a12)
        #[arg(short, long)]
        id: String,

        #[arg(long)]
        value: String,

        #[arg(long, value_parser = parse_time)]
        start: Option<u64>,

        #[arg(long, value_parser = parse_time)]
        end: Option<u64>,

        #[arg(long)]
        return_to: Option<String>,
    },

    /// Delete an annotation and everything that references it
    Delete {
        /// Video id
        video: String,

        #[arg(short, long)]
        tier: String,

        #[arg(short, long)]
        id: String,

        #[arg(long)]
        return_to: Option<String>,
    },

    /// Rate an annotation from 1 to 5
    Rate {
        /// Video id
        video: String,

        #[arg(short, long)]
        tier: String,

        #[arg(short, long)]
        id: String,

        #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
        rating: u8,
    },

    /// k-NN text search, scored against substring ground truth
    Search {
        /// Query text
        query: String,

        /// Vector field: base, average, best or annotation
        #[arg(short, long, default_value = "annotation")]
        field: VectorField,

        /// Number of results
        #[arg(short, default_value = "10")]
        k: usize,

        /// Tier used for ground truth (default: the expression tier)
        #[arg(short, long)]
        tier: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CaptionFormatArg {
    Vtt,
    Srt,
}

impl From<CaptionFormatArg> for CaptionFormat {
    fn from(arg: CaptionFormatArg) -> Self {
        match arg {
            CaptionFormatArg::Vtt => Self::Vtt,
            CaptionFormatArg::Srt => Self::Srt,
        }
    }
}

fn parse_time(input: &str) -> std::result::Result<u64, String> {
    lgp_corpus::time::parse_clock(input)
        .ok_or_else(|| format!("'{input}' is not milliseconds or HH:MM:SS[.mmm]"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = cmd::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Parse => cmd::batch::cmd_parse(&config).await?,
        Commands::Frames => cmd::batch::cmd_frames(&config).await?,
        Commands::Embed => cmd::batch::cmd_embed(&config).await?,
        Commands::Reindex => cmd::batch::cmd_reindex(&config).await?,
        Commands::Pipeline => cmd::batch::cmd_pipeline(&config).await?,
        Commands::Captions { video, format, output } => {
            cmd::captions::cmd_captions(&config, &video, format.into(), output).await?;
        }
        Commands::Show { video, tier } => {
            cmd::show::cmd_show(&config, &video, tier.as_deref()).await?;
        }
        Commands::Add {
            video,
            tier,
            value,
            start,
            end,
            ref_annotation,
            return_to,
        } => {
            let request = lgp_corpus::reconcile::AddRequest {
                tier_id: tier,
                value,
                start_ms: start,
                end_ms: end,
                ref_annotation_id: ref_annotation,
            };
            cmd::annotation::cmd_add(&config, &video, &request, return_to).await?;
        }
        Commands::Edit {
            video,
            tier,
            id,
            value,
            start,
            end,
            return_to,
        } => {
            let request = lgp_corpus::reconcile::EditRequest {
                tier_id: tier,
                annotation_id: id,
                value,
                start_ms: start,
                end_ms: end,
            };
            cmd::annotation::cmd_edit(&config, &video, &request, return_to).await?;
        }
        Commands::Delete {
            video,
            tier,
            id,
            return_to,
        } => {
            cmd::annotation::cmd_delete(&config, &video, &tier, &id, return_to).await?;
        }
        Commands::Rate { video, tier, id, rating } => {
            cmd::annotation::cmd_rate(&config, &video, &tier, &id, rating).await?;
        }
        Commands::Search { query, field, k, tier } => {
            cmd::search::cmd_search(&config, &query, field, k, tier.as_deref()).await?;
        }
    }

    Ok(())
}
