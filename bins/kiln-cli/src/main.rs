mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kiln-cli")]
#[command(about = "Kiln CLI - Submit code, poll jobs, inspect runtimes", long_about = None)]
struct Cli {
    /// Base URL of the Kiln API
    #[arg(long, env = "KILN_API_URL", default_value = "http://127.0.0.1:3000", global = true)]
    api_url: String,

    /// Caller identity sent as x-kiln-user
    #[arg(long, env = "KILN_USER", global = true)]
    user: Option<String>,

    /// Caller role sent as x-kiln-role (e.g. admin)
    #[arg(long, env = "KILN_ROLE", global = true)]
    role: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a source file for execution
    Submit {
        /// Language name (e.g., python, cpp, java)
        #[arg(short, long)]
        language: String,

        /// Source file to submit
        #[arg(short, long)]
        file: PathBuf,

        /// Standard input for a free-form run
        #[arg(long, conflicts_with_all = ["stdin_file", "challenge"])]
        stdin: Option<String>,

        /// Read standard input for a free-form run from a file
        #[arg(long, conflicts_with = "challenge")]
        stdin_file: Option<PathBuf>,

        /// Run against a challenge's test cases instead
        #[arg(short, long)]
        challenge: Option<String>,

        /// Poll until the job finishes (bounded)
        #[arg(short, long, default_value = "false")]
        wait: bool,
    },

    /// Show a job's current status and result
    Status {
        /// Job id returned by submit
        job_id: String,
    },

    /// Poll a job until it finishes or the attempt budget runs out
    Wait {
        /// Job id returned by submit
        job_id: String,

        /// Seconds between polls (minimum 1)
        #[arg(long, default_value = "2")]
        interval_secs: u64,

        /// Number of polls before giving up
        #[arg(long, default_value = "5")]
        max_attempts: u32,
    },

    /// List the runtimes a languages.json resolves to
    Languages {
        /// Path to languages.json
        #[arg(long, default_value = "config/languages.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            language,
            file,
            stdin,
            stdin_file,
            challenge,
            wait,
        } => {
            let client = commands::ApiClient::new(&cli.api_url, cli.user, cli.role)?;
            let input = commands::resolve_input(stdin, stdin_file.as_deref(), challenge)?;
            let job_id = commands::submit(&client, &language, &file, input).await?;
            if wait {
                commands::wait(&client, &job_id.to_string(), commands::DEFAULT_INTERVAL_SECS, commands::DEFAULT_MAX_ATTEMPTS)
                    .await?;
            }
        }
        Commands::Status { job_id } => {
            let client = commands::ApiClient::new(&cli.api_url, cli.user, cli.role)?;
            commands::status(&client, &job_id).await?;
        }
        Commands::Wait {
            job_id,
            interval_secs,
            max_attempts,
        } => {
            let client = commands::ApiClient::new(&cli.api_url, cli.user, cli.role)?;
            commands::wait(&client, &job_id, interval_secs, max_attempts).await?;
        }
        Commands::Languages { config } => {
            commands::list_languages(&config)?;
        }
    }

    Ok(())
}
