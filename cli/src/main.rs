use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kbclient::app::{App, AppError};
use kbclient::config::{ClientConfig, ConfigError};
use kbclient::net::api::{auth, documents, graph, knowledge_bases, models, query};
use kbclient::net::types::{ProfileUpdate, RegisterRequest};
use kbclient::net::ApiError;
use kbclient::notice::{Notice, Notifier, TracingNotifier};
use kbclient::router::{Navigation, Resolved, RouterError};
use kbclient::session::SessionError;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("not logged in; run `kb login` first")]
    NotLoggedIn,
    #[error("nothing to update; pass at least one field")]
    NothingToUpdate,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("client setup failed: {0}")]
    App(#[from] AppError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("request failed: {0}")]
    Api(#[from] ApiError),
    #[error("navigation failed: {0}")]
    Router(#[from] RouterError),
    #[error("failed to read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "kb", about = "Knowledge-base API client")]
struct Cli {
    /// API base URL including the version prefix.
    #[arg(long, env = "KB_API_BASE_URL")]
    base_url: Option<String>,

    /// Directory holding the persisted session.
    #[arg(long, env = "KB_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Log every request and response to stderr.
    #[arg(long, short, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "KB_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Logout,
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "KB_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        full_name: Option<String>,
    },
    Whoami,
    Profile(ProfileCommand),
    /// Resolve a client route through the auth guard.
    Navigate {
        #[arg(default_value = "/")]
        path: String,
    },
    Api(ApiCommand),
}

#[derive(Args, Debug)]
struct ProfileCommand {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProfileSubcommand {
    Update {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ApiCommand {
    #[command(subcommand)]
    command: ApiSubcommand,
}

#[derive(Subcommand, Debug)]
enum ApiSubcommand {
    Kb(KbCommand),
    Documents(DocumentsCommand),
    Models(ModelsCommand),
    Graph(GraphCommand),
    Query(QueryCommand),
}

#[derive(Args, Debug)]
struct KbCommand {
    #[command(subcommand)]
    command: KbSubcommand,
}

#[derive(Subcommand, Debug)]
enum KbSubcommand {
    List,
    Read {
        id: i64,
    },
    Create {
        #[arg(long)]
        data: String,
    },
    Update {
        id: i64,
        #[arg(long)]
        data: String,
    },
    Delete {
        id: i64,
    },
}

#[derive(Args, Debug)]
struct DocumentsCommand {
    #[command(subcommand)]
    command: DocumentsSubcommand,
}

#[derive(Subcommand, Debug)]
enum DocumentsSubcommand {
    List {
        #[arg(long)]
        kb_id: Option<i64>,
        #[arg(long)]
        skip: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },
    Upload {
        #[arg(long)]
        kb_id: i64,
        file: PathBuf,
    },
    Read {
        id: i64,
    },
    Delete {
        id: i64,
    },
}

#[derive(Args, Debug)]
struct ModelsCommand {
    #[command(subcommand)]
    command: ModelsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ModelsSubcommand {
    List {
        #[arg(long)]
        model_type: Option<String>,
    },
    Read {
        id: i64,
    },
    Create {
        #[arg(long)]
        data: String,
    },
    Update {
        id: i64,
        #[arg(long)]
        data: String,
    },
    Delete {
        id: i64,
    },
    /// Make a model the default for its type.
    Default {
        id: i64,
    },
}

#[derive(Args, Debug)]
struct GraphCommand {
    #[command(subcommand)]
    command: GraphSubcommand,
}

#[derive(Subcommand, Debug)]
enum GraphSubcommand {
    Read {
        kb_id: i64,
        #[arg(long)]
        max_nodes: Option<u32>,
    },
    Stats {
        kb_id: i64,
    },
}

#[derive(Args, Debug)]
struct QueryCommand {
    #[command(subcommand)]
    command: QuerySubcommand,
}

#[derive(Subcommand, Debug)]
enum QuerySubcommand {
    Ask {
        #[arg(long)]
        kb_id: Option<i64>,
        #[arg(long)]
        data: String,
    },
    NewSession {
        #[arg(long)]
        kb_id: Option<i64>,
    },
    Sessions,
    Session {
        id: i64,
    },
}

/// Prints notices to stderr so stdout stays machine-readable.
struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, notice: Notice) {
        eprintln!("warning: {}", notice.message);
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = cli.base_url {
        config.api_base_url = base_url.trim().trim_end_matches('/').to_owned();
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    config.log_requests |= cli.verbose;

    // Verbose runs already stream logs to stderr; keep notices in that stream.
    let notifier: Arc<dyn Notifier> = if cli.verbose { Arc::new(TracingNotifier) } else { Arc::new(StderrNotifier) };
    let app = App::from_config(config, notifier)?;

    match cli.command {
        Command::Login { username, password } => {
            let user = app.session.login(&username, &password).await?;
            print_json(&serde_json::to_value(user)?)
        }
        Command::Logout => {
            app.session.logout();
            eprintln!("logged out");
            Ok(())
        }
        Command::Register { email, username, password, full_name } => {
            let request = RegisterRequest { email, username, password, full_name };
            let created = app.session.register(&request).await?;
            print_json(&created)
        }
        Command::Whoami => {
            let user = app.session.check_auth().await?.ok_or(CliError::NotLoggedIn)?;
            print_json(&serde_json::to_value(user)?)
        }
        Command::Profile(profile) => run_profile(&app, profile).await,
        Command::Navigate { path } => {
            let navigation = app.bootstrap(&path).await?;
            print_json(&navigation_json(&navigation))
        }
        Command::Api(api) => run_api(&app, api).await,
    }
}

async fn run_profile(app: &App, profile: ProfileCommand) -> Result<(), CliError> {
    match profile.command {
        ProfileSubcommand::Update { email, username, full_name, password } => {
            if !app.session.is_authenticated() {
                return Err(CliError::NotLoggedIn);
            }
            let update = ProfileUpdate { email, username, full_name, password };
            if update.is_empty() {
                return Err(CliError::NothingToUpdate);
            }
            let json = auth::update_current_user(app.client(), serde_json::to_value(&update)?).await?;
            app.session.get_user_info().await?;
            print_json(&json)
        }
    }
}

async fn run_api(app: &App, api: ApiCommand) -> Result<(), CliError> {
    if !app.session.is_authenticated() {
        return Err(CliError::NotLoggedIn);
    }
    let json = match api.command {
        ApiSubcommand::Kb(kb) => run_api_kb(app, kb).await?,
        ApiSubcommand::Documents(docs) => run_api_documents(app, docs).await?,
        ApiSubcommand::Models(models) => run_api_models(app, models).await?,
        ApiSubcommand::Graph(graph) => run_api_graph(app, graph).await?,
        ApiSubcommand::Query(query) => run_api_query(app, query).await?,
    };
    print_json(&json)
}

async fn run_api_kb(app: &App, kb: KbCommand) -> Result<Value, CliError> {
    let client = app.client();
    let json = match kb.command {
        KbSubcommand::List => knowledge_bases::list(client).await?,
        KbSubcommand::Read { id } => knowledge_bases::get(client, id).await?,
        KbSubcommand::Create { data } => knowledge_bases::create(client, parse_json(&data)?).await?,
        KbSubcommand::Update { id, data } => knowledge_bases::update(client, id, parse_json(&data)?).await?,
        KbSubcommand::Delete { id } => knowledge_bases::delete(client, id).await?,
    };
    Ok(json)
}

async fn run_api_documents(app: &App, docs: DocumentsCommand) -> Result<Value, CliError> {
    let client = app.client();
    let json = match docs.command {
        DocumentsSubcommand::List { kb_id, skip, limit } => {
            let kb_id = kb_id.map(|v| v.to_string());
            let skip = skip.map(|v| v.to_string());
            let limit = limit.map(|v| v.to_string());
            let params: Vec<(&str, &str)> = [("knowledge_base_id", &kb_id), ("skip", &skip), ("limit", &limit)]
                .into_iter()
                .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
                .collect();
            documents::list(client, &params).await?
        }
        DocumentsSubcommand::Upload { kb_id, file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .map_err(|source| CliError::ReadFile { path: file.clone(), source })?;
            let file_name = file
                .file_name()
                .map_or_else(|| "upload".to_owned(), |name| name.to_string_lossy().into_owned());
            documents::upload(client, kb_id, &file_name, bytes).await?
        }
        DocumentsSubcommand::Read { id } => documents::get(client, id).await?,
        DocumentsSubcommand::Delete { id } => documents::delete(client, id).await?,
    };
    Ok(json)
}

async fn run_api_models(app: &App, models: ModelsCommand) -> Result<Value, CliError> {
    let client = app.client();
    let json = match models.command {
        ModelsSubcommand::List { model_type } => match model_type {
            Some(model_type) => models::list(client, &[("model_type", model_type.as_str())]).await?,
            None => models::list(client, &[]).await?,
        },
        ModelsSubcommand::Read { id } => models::get(client, id).await?,
        ModelsSubcommand::Create { data } => models::create(client, parse_json(&data)?).await?,
        ModelsSubcommand::Update { id, data } => models::update(client, id, parse_json(&data)?).await?,
        ModelsSubcommand::Delete { id } => models::delete(client, id).await?,
        ModelsSubcommand::Default { id } => models::set_default(client, id).await?,
    };
    Ok(json)
}

async fn run_api_graph(app: &App, graph: GraphCommand) -> Result<Value, CliError> {
    let client = app.client();
    let json = match graph.command {
        GraphSubcommand::Read { kb_id, max_nodes } => match max_nodes {
            Some(max_nodes) => graph::get(client, kb_id, &[("max_nodes", max_nodes.to_string().as_str())]).await?,
            None => graph::get(client, kb_id, &[]).await?,
        },
        GraphSubcommand::Stats { kb_id } => graph::stats(client, kb_id).await?,
    };
    Ok(json)
}

async fn run_api_query(app: &App, command: QueryCommand) -> Result<Value, CliError> {
    let client = app.client();
    let json = match command.command {
        QuerySubcommand::Ask { kb_id, data } => query::query(client, kb_id, parse_json(&data)?).await?,
        QuerySubcommand::NewSession { kb_id } => query::create_session(client, kb_id).await?,
        QuerySubcommand::Sessions => query::sessions(client, &[]).await?,
        QuerySubcommand::Session { id } => query::session(client, id).await?,
    };
    Ok(json)
}

fn navigation_json(navigation: &Navigation) -> Value {
    let route = match &navigation.resolved {
        Resolved::Route { name, params } => {
            let params: Map<String, Value> =
                params.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
            json!({ "name": format!("{name:?}"), "params": params })
        }
        Resolved::NotFound => Value::Null,
    };
    json!({
        "location": navigation.location.full_path(),
        "route": route,
        "redirected_from": navigation.redirected_from,
    })
}

fn parse_json(raw: &str) -> Result<Value, CliError> {
    Ok(serde_json::from_str::<Value>(raw)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
