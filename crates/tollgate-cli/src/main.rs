//! Tollgate CLI - policy adjudication for governed agents
//!
//! The `tollgate` command checks policy bundles, runs one-shot
//! adjudications and inspects recorded trajectories.
//!
//! ## Commands
//!
//! - `validate`: Check a policy/schema pair without evaluating anything
//! - `schema`: Generate a schema for an agent definition
//! - `adjudicate`: Adjudicate one step and record it in a trajectory
//! - `trajectories`: List or show recorded trajectories
//! - `agents`: List registered agents
//! - `analytics`: Aggregate metrics over recorded trajectories
//!
//! The store is configured through `TOLLGATE_DB_*` and defaults to
//! `surrealkv://.tollgate/db`; harness settings come from `TOLLGATE_*`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, Level};

use tollgate_core::{
    aggregate, Adjudication, Agent, AnalyticsFilter, AnalyticsReport, Content, Harness,
    HarnessConfig, HarnessError, Metric, Outcome, Page, PolicyBundle, PolicyEngine, PolicyIssue, PolicySchema,
    Role, RuleSetEngine, Stage, StepInput, Trajectory, TrajectoryFilter, TrajectoryHeader,
    TrajectoryId, TrajectoryStatus, TrajectoryStore,
};
use tollgate_state::SurrealTrajectoryStore;

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Policy adjudication and trajectory ledger for governed agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a policy set against a schema
    Validate {
        /// Policy rule-set file (JSON)
        #[arg(short, long)]
        policy: PathBuf,

        /// Schema file (JSON)
        #[arg(short, long)]
        schema: PathBuf,
    },

    /// Generate a schema declaring every action an agent can take
    Schema {
        /// Agent definition file (JSON)
        #[arg(short, long)]
        agent: PathBuf,

        /// Write the schema here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Adjudicate one step and record it
    Adjudicate(AdjudicateArgs),

    /// Inspect recorded trajectories
    Trajectories {
        #[command(subcommand)]
        action: TrajectoryAction,
    },

    /// Inspect registered agents
    Agents {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Aggregate metrics over recorded trajectories
    Analytics {
        /// Only trajectories of this agent
        #[arg(long)]
        agent: Option<String>,

        /// Created at or after (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Created at or before (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Metric to compute (repeatable; default: all)
        #[arg(short, long = "metric")]
        metrics: Vec<Metric>,
    },
}

#[derive(Args)]
struct AdjudicateArgs {
    /// Policy rule-set file (JSON)
    #[arg(short, long)]
    policy: PathBuf,

    /// Schema file (JSON); generated from the agent when omitted
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// Agent definition file (JSON)
    #[arg(short, long)]
    agent: PathBuf,

    /// Existing trajectory to append to (default: start a new one)
    #[arg(short, long)]
    trajectory: Option<String>,

    /// Interception point
    #[arg(long, default_value = "pre_tool")]
    stage: Stage,

    /// Who produced the content
    #[arg(long, default_value = "model")]
    role: Role,

    /// Prompt text
    #[arg(long, conflicts_with = "tool")]
    prompt: Option<String>,

    /// Tool name for a tool request or response
    #[arg(long)]
    tool: Option<String>,

    /// Tool request arguments (JSON)
    #[arg(long, requires = "tool", conflicts_with = "response")]
    args: Option<String>,

    /// Tool response (JSON)
    #[arg(long, requires = "tool")]
    response: Option<String>,

    /// Finalize the trajectory after recording the step
    #[arg(long)]
    finalize: Option<Outcome>,
}

#[derive(Subcommand)]
enum TrajectoryAction {
    /// List trajectory headers, oldest first
    List {
        #[arg(long)]
        agent: Option<String>,

        #[arg(long)]
        status: Option<TrajectoryStatus>,

        #[arg(long)]
        page_size: Option<usize>,

        /// Token from a previous page
        #[arg(long)]
        page_token: Option<String>,
    },

    /// Show one trajectory with every step
    Get { id: String },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List registered agents
    List {
        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        page_size: Option<usize>,

        #[arg(long)]
        page_token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tollgate_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Validate { policy, schema } => {
            let issues = cmd_validate(&policy, &schema)?;
            for issue in &issues {
                println!("{issue}");
            }
            if issues.iter().any(PolicyIssue::is_error) {
                bail!("policy set rejected");
            }
            println!("policy set OK ({} warning(s))", issues.len());
            Ok(())
        }
        Commands::Schema { agent, output } => {
            let schema = cmd_schema(&agent)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, schema)
                        .with_context(|| format!("Failed to write schema to {}", path.display()))?;
                    println!("Schema written to {}", path.display());
                }
                None => println!("{schema}"),
            }
            Ok(())
        }
        Commands::Adjudicate(args) => {
            let (store, config) = open_store().await?;
            print_json(&cmd_adjudicate(store, config, &args).await?)
        }
        Commands::Trajectories { action } => {
            let (store, config) = open_store().await?;
            match action {
                TrajectoryAction::List {
                    agent,
                    status,
                    page_size,
                    page_token,
                } => {
                    let filter = TrajectoryFilter {
                        agent_id: agent,
                        status,
                    };
                    let page = cmd_trajectory_list(
                        store.as_ref(),
                        &config,
                        &filter,
                        page_size,
                        page_token.as_deref(),
                    )
                    .await?;
                    print_json(&page)
                }
                TrajectoryAction::Get { id } => {
                    print_json(&cmd_trajectory_get(store.as_ref(), &id).await?)
                }
            }
        }
        Commands::Agents {
            action:
                AgentAction::List {
                    provider,
                    page_size,
                    page_token,
                },
        } => {
            let (store, config) = open_store().await?;
            let page = store
                .list_agents(
                    provider.as_deref(),
                    config.page_size(page_size),
                    page_token.as_deref(),
                )
                .await?;
            print_json(&page)
        }
        Commands::Analytics {
            agent,
            since,
            until,
            metrics,
        } => {
            let (store, config) = open_store().await?;
            let filter = AnalyticsFilter {
                agent_id: agent,
                start_time: since,
                end_time: until,
            };
            print_json(&cmd_analytics(store.as_ref(), &config, &filter, &metrics).await?)
        }
    }
}

/// Store and harness settings from the environment.
async fn open_store() -> Result<(Arc<dyn TrajectoryStore>, HarnessConfig)> {
    let config = HarnessConfig::from_env().context("Invalid harness configuration")?;
    let store = SurrealTrajectoryStore::from_env()
        .await
        .context("Failed to connect to Tollgate store")?;
    Ok((Arc::new(store), config))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_file(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {what} file: {}", path.display()))
}

fn load_agent(path: &Path) -> Result<Agent> {
    let text = read_file(path, "agent")?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid agent definition in {}", path.display()))
}

/// Every issue the built-in engine reports for the pair.
fn cmd_validate(policy: &Path, schema: &Path) -> Result<Vec<PolicyIssue>> {
    let policy_text = read_file(policy, "policy")?;
    let schema_text = read_file(schema, "schema")?;
    Ok(RuleSetEngine::new().validate(&policy_text, &schema_text))
}

fn cmd_schema(agent: &Path) -> Result<String> {
    let agent = load_agent(agent)?;
    Ok(PolicySchema::for_agent(&agent).to_json_pretty())
}

fn step_content(args: &AdjudicateArgs) -> Result<Content> {
    let parse = |flag: &str, text: &str| -> Result<Value> {
        serde_json::from_str(text).with_context(|| format!("--{flag} is not valid JSON"))
    };
    match (&args.prompt, &args.tool) {
        (Some(text), None) => Ok(Content::prompt(text.clone())),
        (None, Some(tool)) => match (&args.args, &args.response) {
            (_, Some(response)) => Ok(Content::tool_response(tool.clone(), parse("response", response)?)),
            (Some(a), None) => Ok(Content::tool_request(tool.clone(), parse("args", a)?)),
            (None, None) => Ok(Content::tool_request(tool.clone(), Value::Object(Default::default()))),
        },
        _ => bail!("pass either --prompt or --tool"),
    }
}

#[derive(Debug, Serialize)]
struct AdjudicationReport {
    trajectory_id: TrajectoryId,
    #[serde(flatten)]
    adjudication: Adjudication,
    #[serde(skip_serializing_if = "Option::is_none")]
    finalized: Option<Outcome>,
}

async fn cmd_adjudicate(
    store: Arc<dyn TrajectoryStore>,
    config: HarnessConfig,
    args: &AdjudicateArgs,
) -> Result<AdjudicationReport> {
    let agent = load_agent(&args.agent)?;
    let policy_text = read_file(&args.policy, "policy")?;
    let schema_text = match &args.schema {
        Some(path) => read_file(path, "schema")?,
        None => PolicySchema::for_agent(&agent).to_json_pretty(),
    };
    let content = step_content(args)?;

    let harness = Harness::with_rule_engine(
        store,
        PolicyBundle::new(policy_text, schema_text),
        config,
    )?;

    let trajectory_id = match &args.trajectory {
        Some(id) => {
            let id = TrajectoryId::from(id.as_str());
            let header = harness
                .store()
                .header(&id)
                .await
                .with_context(|| format!("Failed to load trajectory {id}"))?;
            if header.agent_id != agent.id {
                return Err(HarnessError::ResumeMismatch {
                    trajectory_id: id.to_string(),
                    owner: header.agent_id,
                    presented: agent.id.clone(),
                }
                .into());
            }
            if header.status == TrajectoryStatus::Suspended {
                harness.resume(&id, &agent.id).await?;
                info!("Resumed trajectory {}", id);
            }
            id
        }
        None => {
            let id = harness.initialize(&agent).await?;
            info!("Started trajectory {}", id);
            id
        }
    };

    let adjudication = harness
        .adjudicate_step(&trajectory_id, StepInput::new(args.stage, args.role, content))
        .await
        .with_context(|| format!("Adjudication failed for {trajectory_id}"))?;

    if let Some(outcome) = args.finalize {
        harness.finalize(&trajectory_id, outcome).await?;
    }

    Ok(AdjudicationReport {
        trajectory_id,
        adjudication,
        finalized: args.finalize,
    })
}

async fn cmd_trajectory_list(
    store: &dyn TrajectoryStore,
    config: &HarnessConfig,
    filter: &TrajectoryFilter,
    page_size: Option<usize>,
    page_token: Option<&str>,
) -> Result<Page<TrajectoryHeader>> {
    Ok(store
        .list(filter, config.page_size(page_size), page_token)
        .await?)
}

async fn cmd_trajectory_get(store: &dyn TrajectoryStore, id: &str) -> Result<Trajectory> {
    store
        .get(&TrajectoryId::from(id))
        .await
        .with_context(|| format!("Failed to load trajectory {id}"))
}

async fn cmd_analytics(
    store: &dyn TrajectoryStore,
    config: &HarnessConfig,
    filter: &AnalyticsFilter,
    metrics: &[Metric],
) -> Result<AnalyticsReport> {
    Ok(aggregate(
        store,
        filter,
        metrics,
        config.default_page_size,
        config.top_n,
    )
    .await?)
}
