// imbued - Local secret daemon and shell environment hydrator
//
// This is the main entry point for the application.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use imbued::auth::{Authenticator, PresenceCheck, MAX_AUTH_DURATION};
use imbued::cleaner;
use imbued::client;
use imbued::config::{self, Config};
use imbued::handlers::HandlerContext;
use imbued::platform::onepassword::{clear_session, load_session, save_session};
use imbued::platform::{native_credential_store, OnePassSession, Platform, TerminalPrompt, TouchIdPrompt};
use imbued::protocol::{Action, Command, Response};
use imbued::secrets::env_file::parse_dotenv;
use imbued::secrets::BackendRegistry;
use imbued::server::Server;
use imbued::tracking::{FileTracker, Tracker};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

/// imbued - Gate secrets behind user presence and inject them into your shell
#[derive(Parser, Debug)]
#[command(name = "imbued")]
#[command(version)]
#[command(about = "Gate secrets behind user presence and inject them into your shell", long_about = None)]
struct Cli {
    /// Path to the .imbued config file (default: search current and parent directories)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Maximum number of directory levels to search up for a .imbued file
    #[arg(long, global = true, default_value_t = 3)]
    max_levels: u32,

    /// Path to the audit log (default: ~/.imbued/logs/imbued.log)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Seconds for which an authentication stays valid (at most one year)
    #[arg(
        long,
        global = true,
        default_value_t = 3600,
        value_parser = clap::value_parser!(u64).range(1..=MAX_AUTH_DURATION.as_secs())
    )]
    auth_duration: u64,

    /// Unix socket path of the daemon (default: ~/.imbued/imbued.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Daemon operations
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },

    /// Talk to a running daemon
    Client {
        #[command(subcommand)]
        command: ClientCommands,
    },

    /// Manage backend credentials in the OS credential store
    Credentials {
        #[command(subcommand)]
        command: CredentialCommands,
    },

    /// Check prerequisites and system configuration
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ServerCommands {
    /// Start the daemon in the foreground
    Start {
        /// How to confirm user presence (default: touch-id on macOS, terminal elsewhere)
        #[arg(long, value_enum)]
        presence: Option<PresenceKind>,
    },
}

#[derive(Subcommand, Debug)]
enum ClientCommands {
    /// Check whether the calling shell is authenticated
    CheckAuth,

    /// Authenticate the calling shell
    Auth,

    /// Print one secret as NAME=value
    GetSecret {
        /// Secret name as listed in the .imbued file
        name: String,
    },

    /// List the secrets configured for this directory
    ListSecrets,

    /// Print `export` statements for every secret (use with eval)
    InjectEnv,

    /// Print `unset` statements for every secret (use with eval)
    CleanEnv,

    /// Show the resolved configuration
    ShowConfig,

    /// Store every secret from an env file in a backend
    Smelt {
        /// Env file to read
        file: PathBuf,

        /// Prefix prepended to each key before storing
        #[arg(long)]
        prefix: Option<String>,

        /// Backend to store into (default: the config's backend)
        #[arg(long)]
        backend: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CredentialCommands {
    /// Store 1Password credentials
    SetOnepass {
        /// 1Password service account token (prompted for when omitted)
        #[arg(long)]
        account_token: Option<String>,

        /// 1Password vault ID or name
        #[arg(long)]
        vault_id: Option<String>,
    },

    /// Check that 1Password credentials are stored
    CheckOnepass,

    /// Remove stored 1Password credentials
    ClearOnepass,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum PresenceKind {
    /// Touch ID or account password via `security authorize`
    TouchId,
    /// Confirmation on the daemon's terminal
    Terminal,
}

fn imbued_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to determine home directory")?;
    Ok(home.join(".imbued"))
}

fn socket_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.socket {
        Some(path) => Ok(path.clone()),
        None => Ok(imbued_dir()?.join("imbued.sock")),
    }
}

fn log_file_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.log_file {
        Some(path) => Ok(path.clone()),
        None => Ok(imbued_dir()?.join("logs").join("imbued.log")),
    }
}

/// Install the tracing subscriber; `RUST_LOG` overrides `default_filter`.
fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // stdout is reserved for output meant for `eval`.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn runtime() -> Result<Runtime> {
    Runtime::new().context("Failed to start async runtime")
}

/// Process id the daemon grants are keyed on: the shell that invoked us.
fn caller_process_id() -> String {
    std::os::unix::process::parent_id().to_string()
}

/// Quote `value` for POSIX shells.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn check_binary(name: &str) -> bool {
    which::which(name).is_ok()
}

fn run_server(cli: &Cli, presence: Option<PresenceKind>) -> Result<()> {
    init_logging("imbued=info");

    let socket = socket_path(cli)?;
    let log_file = log_file_path(cli)?;

    let tracker: Arc<dyn Tracker> = Arc::new(
        FileTracker::open(&log_file)
            .with_context(|| format!("Failed to initialize tracker at {}", log_file.display()))?,
    );

    let presence_kind = presence.unwrap_or(if cfg!(target_os = "macos") {
        PresenceKind::TouchId
    } else {
        PresenceKind::Terminal
    });
    let presence: Arc<dyn PresenceCheck> = match presence_kind {
        PresenceKind::TouchId => Arc::new(TouchIdPrompt::new()),
        PresenceKind::Terminal => Arc::new(TerminalPrompt),
    };

    let authenticator = Arc::new(Authenticator::new(
        Duration::from_secs(cli.auth_duration),
        presence,
    ));
    let backends = Arc::new(BackendRegistry::with_defaults(&Platform::native()));
    tracing::info!(
        backends = ?backends.names(),
        auth_duration_secs = cli.auth_duration,
        audit_log = %log_file.display(),
        presence = ?presence_kind,
        "starting imbued daemon"
    );

    let context = Arc::new(HandlerContext::new(
        authenticator,
        Arc::clone(&tracker),
        backends,
    ));
    cleaner::register_tracker(Arc::clone(&tracker));

    let result = runtime()?.block_on(async {
        let server = Server::bind(&socket, context)?;
        cleaner::register_socket(server.socket_path());
        cleaner::setup_signal_handlers();
        server.run().await
    });

    if let Err(e) = tracker.close() {
        tracing::warn!(error = %e, "failed to close audit log");
    }
    result
}

/// Connection to the daemon for one CLI invocation.
struct ClientSession {
    runtime: Runtime,
    socket: PathBuf,
    config: Option<String>,
    max_levels: u32,
}

impl ClientSession {
    fn new(cli: &Cli) -> Result<Self> {
        Ok(Self {
            runtime: runtime()?,
            socket: socket_path(cli)?,
            config: cli.config.clone(),
            max_levels: cli.max_levels,
        })
    }

    fn send(&self, command: Command) -> Result<Response> {
        self.runtime.block_on(client::request(&self.socket, &command))
    }

    /// `--config`, or the nearest `.imbued` the daemon can find from here.
    fn config_path(&self) -> Result<String> {
        if let Some(path) = &self.config {
            return Ok(path.clone());
        }

        let current_dir = std::env::current_dir().context("Failed to get current directory")?;
        let response = self
            .send(
                Command::new(Action::FindConfig)
                    .with_current_dir(current_dir.to_string_lossy())
                    .with_max_levels(self.max_levels),
            )
            .context("Failed to find config")?;

        response
            .get("config_path")
            .map(str::to_string)
            .context("Daemon response is missing config_path")
    }
}

fn run_client(cli: &Cli, command: &ClientCommands) -> Result<()> {
    init_logging("imbued=warn");
    let session = ClientSession::new(cli)?;
    let process_id = caller_process_id();

    match command {
        ClientCommands::CheckAuth => {
            let response = session.send(Command::new(Action::CheckAuth).with_process_id(&process_id))?;
            if response.get("authenticated") == Some("true") {
                eprintln!("✓ Process {} is authenticated", process_id);
            } else {
                eprintln!("✗ Process {} is not authenticated", process_id);
                std::process::exit(1);
            }
        }
        ClientCommands::Auth => {
            let config_path = session.config_path()?;
            eprintln!("🔐 Authenticating process {}...", process_id);
            let response = session
                .send(
                    Command::new(Action::Authenticate)
                        .with_config_path(config_path)
                        .with_process_id(&process_id),
                )
                .context("Authentication failed")?;
            eprintln!("✓ {}", response.output.as_deref().unwrap_or("Authentication successful"));
        }
        ClientCommands::GetSecret { name } => {
            let config_path = session.config_path()?;
            let response = session
                .send(
                    Command::new(Action::GetSecret)
                        .with_config_path(config_path)
                        .with_secret_name(name)
                        .with_process_id(&process_id),
                )
                .context("Failed to get secret")?;
            println!(
                "{}={}",
                response.get("env_name").unwrap_or_default(),
                response.get("value").unwrap_or_default()
            );
        }
        ClientCommands::ListSecrets => {
            let config_path = session.config_path()?;
            let response = session
                .send(Command::new(Action::ListSecrets).with_config_path(config_path))
                .context("Failed to list secrets")?;
            println!("Available secrets:");
            for (secret, env_name) in response.data.unwrap_or_default() {
                println!("  {} (env: {})", secret, env_name);
            }
        }
        ClientCommands::InjectEnv => {
            let config_path = session.config_path()?;
            let response = session
                .send(
                    Command::new(Action::InjectEnv)
                        .with_config_path(config_path)
                        .with_process_id(&process_id),
                )
                .context("Failed to inject env")?;
            if let Some(output) = &response.output {
                eprintln!("{}", output);
            }
            for (env_name, value) in response.data.unwrap_or_default() {
                println!("export {}={}", env_name, shell_quote(&value));
            }
        }
        ClientCommands::CleanEnv => {
            let config_path = session.config_path()?;
            let response = session
                .send(Command::new(Action::CleanEnv).with_config_path(config_path))
                .context("Failed to clean env")?;
            for env_name in response.data.unwrap_or_default().into_keys() {
                println!("unset {}", env_name);
            }
        }
        ClientCommands::ShowConfig => {
            let config_path = session.config_path()?;
            let response = session
                .send(Command::new(Action::ShowConfig).with_config_path(config_path))
                .context("Failed to show config")?;
            for (key, value) in response.data.unwrap_or_default() {
                println!("{}: {}", key, value);
            }
        }
        ClientCommands::Smelt {
            file,
            prefix,
            backend,
        } => run_smelt(&session, &process_id, file, prefix.as_deref(), backend.as_deref())?,
    }

    Ok(())
}

fn run_smelt(
    session: &ClientSession,
    process_id: &str,
    file: &Path,
    prefix: Option<&str>,
    backend: Option<&str>,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to open env file: {}", file.display()))?;
    let parsed = parse_dotenv(&content);
    if parsed.is_empty() {
        anyhow::bail!("No secrets found in {}. Expected 'KEY=value' lines.", file.display());
    }

    let prefix = prefix.unwrap_or_default();
    let environment: BTreeMap<String, String> = parsed
        .into_iter()
        .map(|(key, value)| (format!("{}{}", prefix, key), value))
        .collect();
    let count = environment.len();

    let config_path = session.config_path()?;
    let mut command = Command::new(Action::StoreSecrets)
        .with_config_path(config_path)
        .with_process_id(process_id)
        .with_environment(environment);
    if let Some(backend) = backend {
        command = command.with_backend_type(backend);
    }

    session.send(command).context("Failed to store secrets")?;
    println!("✓ Stored {} secret(s) from {}", count, file.display());
    Ok(())
}

fn run_credentials(command: &CredentialCommands) -> Result<()> {
    init_logging("imbued=warn");
    let store = native_credential_store();

    match command {
        CredentialCommands::SetOnepass {
            account_token,
            vault_id,
        } => {
            let account_token = match account_token {
                Some(token) => token.clone(),
                None => dialoguer::Password::new()
                    .with_prompt("1Password service account token")
                    .interact()
                    .context("Failed to read account token")?,
            };
            let vault_id = match vault_id {
                Some(id) => id.clone(),
                None => dialoguer::Input::<String>::new()
                    .with_prompt("1Password vault ID")
                    .interact_text()
                    .context("Failed to read vault ID")?,
            };
            if account_token.trim().is_empty() {
                anyhow::bail!("account-token is required");
            }
            if vault_id.trim().is_empty() {
                anyhow::bail!("vault-id is required");
            }

            save_session(
                store.as_ref(),
                &OnePassSession {
                    account_token,
                    vault_id,
                },
            )
            .context("Failed to store 1Password credentials")?;
            println!("✓ 1Password credentials stored");
        }
        CredentialCommands::CheckOnepass => {
            let session = load_session(store.as_ref())?;
            let visible: String = session.account_token.chars().take(10).collect();
            println!("✓ 1Password credentials found:");
            println!("  Account token: {}***", visible);
            println!("  Vault ID: {}", session.vault_id);
        }
        CredentialCommands::ClearOnepass => {
            clear_session(store.as_ref()).context("Failed to clear 1Password credentials")?;
            println!("✓ 1Password credentials cleared");
        }
    }

    Ok(())
}

fn run_doctor(cli: &Cli) -> Result<()> {
    println!("🔍 imbued Doctor");
    println!("Checking prerequisites...\n");

    let mut all_checks_passed = true;

    // Check 1: security (keychain and Touch ID)
    print!("1. Checking if 'security' is installed... ");
    if check_binary("security") {
        println!("✓");
    } else {
        println!("⊘");
        println!("   ⚠️  'security' not found: keychain backend and Touch ID are unavailable");
        println!("   💡 Use 'imbued server start --presence terminal' on this host");
    }

    // Check 2: 1Password CLI
    print!("2. Checking if 'op' is installed... ");
    if check_binary("op") {
        println!("✓");
    } else {
        println!("⊘");
        println!("   ⚠️  'op' not found: the onepass backend is unavailable");
        println!("   📦 Install from: https://developer.1password.com/docs/cli/");
    }

    // Check 3: daemon socket
    let socket = socket_path(cli)?;
    print!("3. Checking daemon socket {}... ", socket.display());
    if socket.exists() {
        println!("✓");
    } else {
        println!("✗");
        println!("   ❌ Daemon is not running");
        println!("   💡 Start it with: imbued server start");
        all_checks_passed = false;
    }

    // Check 4: configuration
    print!("4. Checking for a .imbued config... ");
    let config_path = match &cli.config {
        Some(path) => Ok(PathBuf::from(path)),
        None => std::env::current_dir()
            .context("Failed to get current directory")
            .and_then(|dir| config::find_config(dir, cli.max_levels as usize)),
    };
    match config_path.and_then(|path| {
        let config = Config::from_file(&path)?;
        config.validate()?;
        Ok((path, config))
    }) {
        Ok((path, config)) => {
            println!("✓");
            println!(
                "   📄 {} ({} secret(s), backend: {})",
                path.display(),
                config.secrets.len(),
                config.backend_type
            );
        }
        Err(e) => {
            println!("✗");
            println!("   ❌ {:#}", e);
            all_checks_passed = false;
        }
    }

    println!();
    if all_checks_passed {
        println!("✅ All checks passed! Your system is ready.");
        Ok(())
    } else {
        println!("❌ Some checks failed. Please fix the issues above.");
        Err(anyhow::anyhow!("Doctor checks failed"))
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Server {
            command: ServerCommands::Start { presence },
        } => run_server(&cli, *presence),
        Commands::Client { command } => run_client(&cli, command),
        Commands::Credentials { command } => run_credentials(command),
        Commands::Doctor => run_doctor(&cli),
    };

    if let Err(e) = result {
        eprintln!("\nError: {:#}", e);
        if matches!(cli.command, Commands::Client { .. } | Commands::Server { .. }) {
            eprintln!("💡 Run 'imbued doctor' to check your configuration.");
        }
        std::process::exit(1);
    }
}
