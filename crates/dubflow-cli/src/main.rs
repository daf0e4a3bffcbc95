//! Dubflow CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "dubflow")]
#[command(about = "Dubflow dubbing pipeline CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "DUBFLOW_API_URL", default_value = "http://localhost:8000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage dubbing tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Trigger a single pipeline stage
    Trigger {
        /// Task ID
        task_id: String,
        /// Stage: speaker-diarization, translate, voice-cloning, stitch-audio, export-video
        stage: String,
        /// Target language tag (not used by speaker-diarization)
        #[arg(long)]
        language: Option<String>,
    },
    /// Control the batch scheduler
    Batch {
        #[command(subcommand)]
        command: BatchCommands,
    },
    /// Show the currently executing stage, if any
    Running,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List tasks, newest first
    List {
        #[arg(long, default_value = "0")]
        offset: i64,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Show one task
    Show {
        /// Task ID
        task_id: String,
    },
    /// Upload a video (and optionally a subtitle) as a new task
    Upload {
        /// Video file
        video: PathBuf,
        /// Subtitle file (SRT)
        #[arg(long)]
        subtitle: Option<PathBuf>,
    },
    /// Delete a task and its files
    Delete {
        /// Task ID
        task_id: String,
    },
    /// Show the processing log of a task
    Logs {
        /// Task ID
        task_id: String,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        stage: Option<String>,
    },
}

#[derive(Subcommand)]
enum BatchCommands {
    /// Start a batch over one task
    Start {
        /// Task ID
        task_id: String,
        /// Target language tags
        #[arg(required = true)]
        languages: Vec<String>,
    },
    /// Stop the running batch
    Stop,
    /// Show the batch snapshot
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Tasks { command } => match command {
            TaskCommands::List { offset, limit } => {
                commands::tasks::list(&cli.api_url, offset, limit).await?;
            }
            TaskCommands::Show { task_id } => {
                commands::tasks::show(&cli.api_url, &task_id).await?;
            }
            TaskCommands::Upload { video, subtitle } => {
                commands::tasks::upload(&cli.api_url, &video, subtitle.as_deref()).await?;
            }
            TaskCommands::Delete { task_id } => {
                commands::tasks::delete(&cli.api_url, &task_id).await?;
            }
            TaskCommands::Logs {
                task_id,
                language,
                stage,
            } => {
                commands::tasks::logs(&cli.api_url, &task_id, language, stage).await?;
            }
        },
        Commands::Trigger {
            task_id,
            stage,
            language,
        } => {
            commands::tasks::trigger(&cli.api_url, &task_id, &stage, language).await?;
        }
        Commands::Batch { command } => match command {
            BatchCommands::Start { task_id, languages } => {
                commands::batch::start(&cli.api_url, &task_id, languages).await?;
            }
            BatchCommands::Stop => {
                commands::batch::stop(&cli.api_url).await?;
            }
            BatchCommands::Status => {
                commands::batch::status(&cli.api_url).await?;
            }
        },
        Commands::Running => {
            commands::batch::running(&cli.api_url).await?;
        }
    }

    Ok(())
}
