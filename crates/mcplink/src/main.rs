//! mcplink - talk to a remote MCP server from the command line.
//!
//! Every command opens one connection, waits for it to settle (including a
//! browser round-trip when the server asks for OAuth), runs, and disconnects.

mod commands;

use clap::{Parser, Subcommand};
use commands::{build_options, ConnectArgs, Invocation};
use mcplink_util::log::{self, LogConfig, LogLevel};

#[derive(Parser)]
#[command(name = "mcplink")]
#[command(author, version, about = "Connect to MCP servers over HTTP or SSE", long_about = None)]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Print output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and show the session state
    Status,
    /// List tools
    Tools,
    /// Call a tool
    Call {
        /// Tool name
        name: String,
        /// Arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },
    /// List resources and resource templates
    Resources,
    /// Read a resource
    Read {
        /// Resource URI
        uri: String,
    },
    /// List prompts
    Prompts,
    /// Render a prompt
    Prompt {
        /// Prompt name
        name: String,
        /// Prompt argument as KEY=VALUE (repeatable)
        #[arg(short, long = "arg")]
        args: Vec<String>,
    },
    /// Remove stored OAuth credentials for the server
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    log::init(LogConfig {
        print: true,
        level: if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        },
        include_location: false,
    });

    let invocation = Invocation {
        options: build_options(&cli.connect, cli.verbose).await?,
        open_browser: !cli.connect.no_browser,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Status => commands::show_status(invocation).await,
        Commands::Tools => commands::list_tools(invocation).await,
        Commands::Call { name, args } => {
            commands::call_tool(invocation, &name, args.as_deref()).await
        }
        Commands::Resources => commands::list_resources(invocation).await,
        Commands::Read { uri } => commands::read_resource(invocation, &uri).await,
        Commands::Prompts => commands::list_prompts(invocation).await,
        Commands::Prompt { name, args } => commands::get_prompt(invocation, &name, &args).await,
        Commands::Logout => commands::logout(invocation).await,
    };

    if let Err(e) = &result {
        tracing::debug!(error = %e, "Command failed");
    }
    result
}
