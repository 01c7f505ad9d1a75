#[cfg(test)]
#[path = "main_test.rs"]
mod main_test;

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use shortlink::config::{ClientConfig, ConfigError};
use shortlink::net::api::{ApiClient, ClientBuildError};
use shortlink::net::backend::{AuthBackend, ProfileBackend, UrlBackend};
use shortlink::net::envelope::ApiResponse;
use shortlink::net::types::{Credentials, IdentityPatch, NewUrl, NewUser, PasswordChange};
use shortlink::notify::{Notice, NoticeLevel, Notifier, Operation};
use shortlink::state::authz::{Gate, Requirement};
use shortlink::state::session::{SessionState, SessionStore};
use shortlink::state::verifier::{Navigator, SessionVerifier, VerifierConfig};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing credentials; pass --email and --password or set SHORTLINK_EMAIL/SHORTLINK_PASSWORD")]
    MissingCredentials,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("http client setup failed: {0}")]
    Client(#[from] ClientBuildError),
    #[error("{operation:?} failed: {message}")]
    Request { operation: Operation, message: String },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "shortlink", about = "Shortlink session and URL management CLI")]
struct Cli {
    /// Overrides the API origin from the environment config.
    #[arg(long, env = "SHORTLINK_API_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "SHORTLINK_REDIRECTOR_BASE_URL")]
    redirector_base_url: Option<String>,

    #[arg(long, env = "SHORTLINK_SESSION_COOKIE")]
    session_cookie: Option<String>,

    /// Sign in with these credentials before running the command.
    #[arg(long, env = "SHORTLINK_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "SHORTLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the session and print it.
    Status,
    Login,
    Logout,
    Profile(ProfileCommand),
    Url(UrlCommand),
    /// Check whether the current session satisfies a requirement.
    Can(CanArgs),
    /// Keep verifying the session until interrupted.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct ProfileCommand {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProfileSubcommand {
    Show,
    Create {
        #[arg(long)]
        name: String,
        #[arg(long = "new-email")]
        email: String,
        #[arg(long = "new-password")]
        password: String,
    },
    Rename {
        name: String,
    },
    Email {
        email: String,
    },
    Password {
        #[arg(long)]
        current: String,
        #[arg(long)]
        new: String,
        /// Defaults to the value of --new.
        #[arg(long)]
        confirm: Option<String>,
    },
    Deactivate,
}

#[derive(Args, Debug)]
struct UrlCommand {
    #[command(subcommand)]
    command: UrlSubcommand,
}

#[derive(Subcommand, Debug)]
enum UrlSubcommand {
    List,
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
    },
    Rename {
        id: String,
        name: String,
    },
    Retarget {
        id: String,
        url: String,
    },
    Delete {
        id: String,
    },
    /// Print the public redirect link for a short code.
    Link {
        shortened: String,
    },
}

#[derive(Args, Debug)]
struct CanArgs {
    #[arg(long)]
    authority: Option<String>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    any_of: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    all_of: Option<Vec<String>>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long, env = "SHORTLINK_POLL_INTERVAL_MINUTES")]
    interval_minutes: Option<u64>,
    #[arg(long, default_value = shortlink::state::verifier::DEFAULT_REDIRECT_PATH)]
    redirect_path: String,
    /// Treat the watched page as public (anonymous visitors allowed).
    #[arg(long)]
    public: bool,
    #[arg(long, requires = "public")]
    redirect_if_authenticated: bool,
    #[arg(long)]
    no_polling: bool,
}

struct CliContext {
    config: ClientConfig,
    client: Arc<ApiClient>,
    session: SessionStore,
    notifier: Arc<TerminalNotifier>,
}

impl CliContext {
    fn new(config: ClientConfig) -> Result<Self, CliError> {
        let client = Arc::new(ApiClient::new(&config)?);
        let session = SessionStore::from_client(client.clone());
        Ok(Self { config, client, session, notifier: Arc::new(TerminalNotifier) })
    }
}

struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn show(&self, notice: Notice) {
        let marker = match notice.level {
            NoticeLevel::Success => "ok",
            NoticeLevel::Error => "error",
        };
        eprintln!("[{marker}] {}: {}", notice.title, notice.message);
    }
}

struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, path: &str) {
        println!("navigate {path}");
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let ctx = CliContext::new(resolve_config(&cli)?)?;

    let credentials = match (cli.email, cli.password) {
        (Some(email), Some(password)) => Some(Credentials { email, password }),
        _ => None,
    };

    if matches!(cli.command, Command::Login) {
        let credentials = credentials.ok_or(CliError::MissingCredentials)?;
        return run_login(&ctx, &credentials).await;
    }
    if let Some(credentials) = &credentials {
        sign_in(&ctx, credentials).await?;
    }

    match cli.command {
        Command::Status => run_status(&ctx).await,
        Command::Login => Ok(()),
        Command::Logout => run_logout(&ctx).await,
        Command::Profile(profile) => run_profile(&ctx, profile.command).await,
        Command::Url(url) => run_url(&ctx, url.command).await,
        Command::Can(args) => run_can(&ctx, args).await,
        Command::Watch(args) => run_watch(&ctx, args).await,
    }
}

/// Environment config with command-line flags layered on top.
fn resolve_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config = config.with_api_base_url(base_url)?;
    }
    if let Some(redirector) = &cli.redirector_base_url {
        config = config.with_redirector_base_url(redirector)?;
    }
    if let Some(cookie) = &cli.session_cookie {
        config = config.with_session_cookie(cookie);
    }
    debug!(api_base_url = %config.api_base_url, "client config resolved");
    Ok(config)
}

async fn sign_in(ctx: &CliContext, credentials: &Credentials) -> Result<(), CliError> {
    debug!(email = %credentials.email, "signing in");
    let response = ctx.client.login(credentials).await;
    settle(ctx, Operation::Login, response)
}

async fn run_login(ctx: &CliContext, credentials: &Credentials) -> Result<(), CliError> {
    sign_in(ctx, credentials).await?;
    run_status(ctx).await
}

async fn run_status(ctx: &CliContext) -> Result<(), CliError> {
    ctx.session.initialize().await;
    print_json(&ctx.session.snapshot())
}

async fn run_logout(ctx: &CliContext) -> Result<(), CliError> {
    let response = ctx.session.logout().await;
    // Local state is already cleared; the remote outcome only decides the notice.
    if let Some(notice) = Operation::Logout.notice_for(&response) {
        ctx.notifier.show(notice);
    }
    print_json(&ctx.session.snapshot())
}

async fn run_profile(ctx: &CliContext, command: ProfileSubcommand) -> Result<(), CliError> {
    let client = &ctx.client;
    let identity = match command {
        ProfileSubcommand::Show => settle(ctx, Operation::ViewProfile, client.view_profile().await)?,
        ProfileSubcommand::Create { name, email, password } => {
            let user = NewUser { name, email, password };
            settle(ctx, Operation::CreateUser, client.create_user(&user).await)?
        }
        ProfileSubcommand::Rename { name } => {
            return print_json(&edit_identity(ctx, IdentityEdit::Name(name)).await?);
        }
        ProfileSubcommand::Email { email } => {
            return print_json(&edit_identity(ctx, IdentityEdit::Email(email)).await?);
        }
        ProfileSubcommand::Password { current, new, confirm } => {
            let change = PasswordChange {
                current_password: current,
                confirm_password: confirm.unwrap_or_else(|| new.clone()),
                password: new,
            };
            settle(ctx, Operation::ChangePassword, client.change_password(&change).await)?
        }
        ProfileSubcommand::Deactivate => {
            settle(ctx, Operation::Deactivate, client.deactivate().await)?;
            info!("account deactivated");
            return Ok(());
        }
    };
    print_json(&identity)
}

enum IdentityEdit {
    Name(String),
    Email(String),
}

/// Apply a name or email change and fold the confirmed identity into the
/// process session.
async fn edit_identity(ctx: &CliContext, edit: IdentityEdit) -> Result<SessionState, CliError> {
    ctx.session.initialize().await;
    let (operation, response) = match edit {
        IdentityEdit::Name(name) => (Operation::ChangeName, ctx.client.change_name(&name).await),
        IdentityEdit::Email(email) => (Operation::ChangeEmail, ctx.client.change_email(&email).await),
    };
    let identity = settle(ctx, operation, response)?;
    if !ctx.session.update_partial(IdentityPatch::from(identity)) {
        debug!("no signed-in identity to update");
    }
    Ok(ctx.session.snapshot())
}

async fn run_url(ctx: &CliContext, command: UrlSubcommand) -> Result<(), CliError> {
    let client = &ctx.client;
    let value = match command {
        UrlSubcommand::List => {
            let urls = settle(ctx, Operation::ListUrls, client.list_by_user().await)?;
            let rows = urls
                .into_iter()
                .map(|url| {
                    let link = client.redirect_url(&url.shortened);
                    let mut row = serde_json::to_value(url)?;
                    if let Some(map) = row.as_object_mut() {
                        map.insert("link".to_owned(), Value::String(link));
                    }
                    Ok(row)
                })
                .collect::<Result<Vec<_>, serde_json::Error>>()?;
            Value::Array(rows)
        }
        UrlSubcommand::Create { name, url } => {
            let new_url = NewUrl { url_name: name, url };
            serde_json::to_value(settle(ctx, Operation::CreateUrl, client.create_url(&new_url).await)?)?
        }
        UrlSubcommand::Rename { id, name } => {
            serde_json::to_value(settle(ctx, Operation::ChangeUrlName, client.change_url_name(&id, &name).await)?)?
        }
        UrlSubcommand::Retarget { id, url } => {
            serde_json::to_value(settle(ctx, Operation::ChangeUrl, client.change_url(&id, &url).await)?)?
        }
        UrlSubcommand::Delete { id } => {
            settle(ctx, Operation::DeleteUrl, client.delete_url(&id).await)?;
            json!({ "deleted": id })
        }
        UrlSubcommand::Link { shortened } => json!({ "link": client.redirect_url(&shortened) }),
    };
    print_json(&value)
}

async fn run_can(ctx: &CliContext, args: CanArgs) -> Result<(), CliError> {
    let gate = Gate::new(Requirement::from_parts(args.authority, args.any_of, args.all_of));
    ctx.session.initialize().await;
    let allowed = ctx.session.allows(&gate);
    debug!(requirement = ?gate.requirement(), allowed, "authorization check");
    print_json(&json!({ "allowed": allowed, "authorities": ctx.session.authorities() }))
}

async fn run_watch(ctx: &CliContext, args: WatchArgs) -> Result<(), CliError> {
    let base = if args.public { VerifierConfig::public() } else { VerifierConfig::protected() };
    let config = base
        .with_redirect_path(args.redirect_path)
        .with_polling(!args.no_polling)
        .with_interval_minutes(args.interval_minutes.unwrap_or(ctx.config.poll_interval_minutes))
        .with_redirect_if_authenticated(args.redirect_if_authenticated);

    let verifier = SessionVerifier::new(ctx.client.clone(), Arc::new(TerminalNavigator), ctx.notifier.clone(), config);
    let handle = verifier.start();
    tokio::signal::ctrl_c().await?;
    handle.stop().await;
    Ok(())
}

/// Show the notice for `response` and unwrap its payload.
fn settle<T>(ctx: &CliContext, operation: Operation, response: ApiResponse<T>) -> Result<T, CliError> {
    if let Some(notice) = operation.notice_for(&response) {
        ctx.notifier.show(notice);
    }
    response.into_result().map_err(|message| CliError::Request { operation, message })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
