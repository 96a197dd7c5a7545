//! Flowdesk CLI - import, run, review and test AI-assisted workflows.
//!
//! Drives the same flowdesk-core engine a dashboard backend would embed,
//! with an offline `LocalAgent` in place of the LLM-backed one.

use clap::{Parser, Subcommand};

use flowdesk_cli::commands;
use flowdesk_core::state::AppState;

/// Flowdesk CLI - AI-assisted business workflows with human review
#[derive(Parser)]
#[command(name = "flowdesk", version, about = "Flowdesk CLI - AI-assisted business workflows with human review")]
pub struct Cli {
    /// Path to the SQLite database file (defaults to the configured path)
    #[arg(long, env = "FLOWDESK_DB_PATH")]
    db: Option<String>,

    /// Path to a YAML config file
    #[arg(long, env = "FLOWDESK_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage workflow definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Run a workflow, reviewing each suspended step interactively
    Run {
        /// Workflow ID
        workflow_id: String,
        /// Digital worker name to report instead of the workflow's assignee
        #[arg(long)]
        assignee: Option<String>,
        /// Approve proposed actions without prompting
        #[arg(long)]
        auto_approve: bool,
    },

    /// Run a test case against a workflow with mock data
    Test {
        /// Workflow ID
        workflow_id: String,
        /// Path to the test case YAML file
        #[arg(long)]
        case: String,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Import a workflow from a YAML file
    Import {
        /// Path to the workflow YAML file
        file: String,
    },
    /// List stored workflows
    List,
    /// Allow a workflow to run
    Activate {
        /// Workflow ID
        id: String,
    },
    /// Block new runs of a workflow
    Pause {
        /// Workflow ID
        id: String,
    },
    /// Validate a workflow YAML file without importing it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowdesk_core=warn,flowdesk_cli=info".into()),
        )
        .init();

    let Some(command) = cli.command else {
        // No subcommand: show help
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        return;
    };

    let result = match command {
        // Validation reads only the file; no database needed.
        Commands::Workflow {
            action: WorkflowAction::Validate { file },
        } => commands::workflow::validate(&file).await,
        command => match commands::init_state(cli.db.as_deref(), cli.config.as_deref()) {
            Ok(state) => dispatch(&state, command).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(state: &AppState, command: Commands) -> Result<(), String> {
    match command {
        Commands::Workflow { action } => match action {
            WorkflowAction::Import { file } => {
                commands::workflow::import(state, &file).await.map(|_| ())
            }
            WorkflowAction::List => commands::workflow::list(state).await,
            WorkflowAction::Activate { id } => commands::workflow::activate(state, &id).await,
            WorkflowAction::Pause { id } => commands::workflow::pause(state, &id).await,
            WorkflowAction::Validate { file } => commands::workflow::validate(&file).await,
        },

        Commands::Run {
            workflow_id,
            assignee,
            auto_approve,
        } => commands::run::run(state, &workflow_id, assignee, auto_approve).await,

        Commands::Test { workflow_id, case } => commands::test::run(state, &workflow_id, &case)
            .await
            .map(|_| ()),
    }
}
