use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reset SIGPIPE to default behavior so piping (e.g. `hostq queue list 1 | head`)
/// exits cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use hostq::batch::BatchCoordinator;
use hostq::config::parser;
use hostq::config::types::Settings;
use hostq::device::{DeviceActionManager, LocalMdmCommander, MdmCommandStatus};
use hostq::output::formatter;
use hostq::queue::ActivityQueue;
use hostq::scripts::{RunOptions, ScriptExecutor, ScriptLibrary};
use hostq::state::backend::StateBackend;
use hostq::state::models::{
    ActivityType, Host, HostId, NewActivity, Platform, ScriptResultPayload, ScriptScope,
};
use hostq::state::sqlite::SqliteBackend;

/// hostq - per-host activity queue with script runs and device lock/wipe
#[derive(Parser)]
#[command(name = "hostq", version, about, long_about = None)]
struct Cli {
    /// Settings file, relative to the working directory
    #[arg(short, long, default_value = "hostq.yaml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the settings file and the database
    #[arg(short, long, default_value = ".")]
    working_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state database
    Init,

    /// Host registry
    Host {
        #[command(subcommand)]
        command: HostCommands,
    },

    /// Saved scripts
    Script {
        #[command(subcommand)]
        command: ScriptCommands,
    },

    /// Automations referencing saved scripts
    Automation {
        #[command(subcommand)]
        command: AutomationCommands,
    },

    /// Run a script on a host
    Run {
        host_id: HostId,

        /// Saved script to run
        #[arg(long, conflicts_with_all = ["file", "body"])]
        script_id: Option<i64>,

        /// Read an ad-hoc script body from a file
        #[arg(long, conflicts_with = "body")]
        file: Option<PathBuf>,

        /// Ad-hoc script body
        #[arg(long)]
        body: Option<String>,

        #[arg(long, default_value = "0")]
        priority: i64,

        /// The caller waits for the result
        #[arg(long)]
        sync: bool,

        #[arg(long)]
        requester: Option<String>,
    },

    /// Script execution results
    Result {
        #[command(subcommand)]
        command: ResultCommands,
    },

    /// Per-host activity queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Lock, unlock and wipe
    Device {
        #[command(subcommand)]
        command: DeviceCommands,
    },

    /// Run one saved script on many hosts
    Batch {
        #[command(subcommand)]
        command: BatchCommands,
    },

    /// Delete script contents no longer referenced anywhere
    Cleanup,
}

#[derive(Subcommand)]
enum HostCommands {
    /// Register or update a host
    Register {
        id: HostId,

        /// darwin, ios, ipados, windows, or a linux distribution name
        #[arg(long)]
        platform: String,

        #[arg(long)]
        uuid: Option<String>,

        #[arg(long)]
        team: Option<i64>,

        /// The host has no agent enrolled
        #[arg(long)]
        no_agent: bool,

        #[arg(long)]
        scripts_disabled: bool,
    },

    /// Show a host record
    Show { id: HostId },
}

#[derive(Subcommand)]
enum ScriptCommands {
    /// Save a new script
    Add {
        name: String,

        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        team: Option<i64>,
    },

    /// Replace a script's contents
    Edit {
        id: i64,

        #[arg(long)]
        file: PathBuf,
    },

    /// Delete a script
    Delete { id: i64 },

    /// List scripts of a scope
    List {
        #[arg(long)]
        team: Option<i64>,
    },

    /// Make a scope's scripts match a manifest
    Sync { manifest: PathBuf },
}

#[derive(Subcommand)]
enum AutomationCommands {
    /// Point an automation at a script
    Link { name: String, script_id: i64 },

    /// Remove an automation
    Unlink { name: String },
}

#[derive(Subcommand)]
enum ResultCommands {
    /// Show an execution
    Show { execution_id: String },

    /// Record the result reported by a host
    Report {
        host_id: HostId,
        execution_id: String,

        #[arg(long, allow_hyphen_values = true)]
        exit_code: i64,

        #[arg(long, default_value = "")]
        output: String,

        /// Runtime in seconds
        #[arg(long, default_value = "0")]
        runtime: i64,

        #[arg(long)]
        timed_out: bool,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Enqueue a raw activity
    Add {
        host_id: HostId,

        /// script, software_install, software_uninstall or mdm_command
        #[arg(long = "type")]
        activity_type: String,

        #[arg(long, default_value = "0")]
        priority: i64,

        /// Activity payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Pending activities of a host
    List { host_id: HostId },

    /// The activated activity of a host
    Ready { host_id: HostId },

    /// Activate the next activity of a host
    Activate { host_id: HostId },

    /// Cancel a pending activity
    Cancel {
        host_id: HostId,
        execution_id: String,
    },

    /// Mark the activated install or MDM command of a host as finished
    Complete {
        host_id: HostId,
        execution_id: String,
    },
}

#[derive(Subcommand)]
enum DeviceCommands {
    Lock { host_id: HostId },
    Unlock { host_id: HostId },
    Wipe { host_id: HostId },
    Status { host_id: HostId },

    /// Record a device's answer to an MDM command
    MdmResult {
        host_id: HostId,
        command_id: String,

        /// acknowledged, error or pending
        #[arg(long)]
        status: String,
    },
}

#[derive(Subcommand)]
enum BatchCommands {
    /// Run a saved script on a set of hosts
    Run {
        script_id: i64,

        #[arg(required = true, num_args = 1..)]
        hosts: Vec<HostId>,

        #[arg(long)]
        requester: Option<String>,
    },

    /// Show aggregate progress of a batch
    Summary {
        batch_id: String,

        /// Also list per-host rows
        #[arg(long)]
        hosts: bool,
    },
}

#[tokio::main]
async fn main() {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(&cli).await {
        formatter::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Init => cmd_init(cli).await,
        Commands::Host { command } => cmd_host(cli, command).await,
        Commands::Script { command } => cmd_script(cli, command).await,
        Commands::Automation { command } => cmd_automation(cli, command).await,
        Commands::Run {
            host_id,
            script_id,
            file,
            body,
            priority,
            sync,
            requester,
        } => {
            let options = RunOptions {
                priority: *priority,
                requester: requester.clone(),
                sync_request: *sync,
            };
            cmd_run(cli, *host_id, *script_id, file.as_deref(), body.as_deref(), options).await
        }
        Commands::Result { command } => cmd_result(cli, command).await,
        Commands::Queue { command } => cmd_queue(cli, command).await,
        Commands::Device { command } => cmd_device(cli, command).await,
        Commands::Batch { command } => cmd_batch(cli, command).await,
        Commands::Cleanup => cmd_cleanup(cli).await,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Settings and an initialized store for one command.
struct App {
    settings: Settings,
    store: Arc<SqliteBackend>,
}

impl App {
    fn backend(&self) -> Arc<dyn StateBackend> {
        self.store.clone()
    }

    fn library(&self) -> ScriptLibrary {
        ScriptLibrary::new(self.backend(), &self.settings)
    }

    fn executor(&self) -> ScriptExecutor {
        ScriptExecutor::new(self.backend(), &self.settings)
    }

    fn devices(&self) -> DeviceActionManager {
        DeviceActionManager::new(self.backend(), Arc::new(self.mdm()))
    }

    fn mdm(&self) -> LocalMdmCommander {
        LocalMdmCommander::new(self.store.clone())
    }
}

fn resolve(working_dir: &str, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        Path::new(working_dir).join(p)
    }
}

async fn open_app(cli: &Cli) -> Result<App> {
    let settings = parser::load_settings(&resolve(&cli.working_dir, &cli.config))?;
    let db_path = resolve(&cli.working_dir, &settings.database);
    let db_path = db_path
        .to_str()
        .with_context(|| format!("Database path is not valid UTF-8: {}", db_path.display()))?
        .to_string();
    let store = SqliteBackend::open_with(&db_path, &settings)?;
    store.initialize().await?;
    Ok(App {
        settings,
        store: Arc::new(store),
    })
}

fn read_script_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script file: {}", path.display()))
}

fn scope_label(scope: ScriptScope) -> String {
    match scope {
        ScriptScope::Global => "global scope".to_string(),
        ScriptScope::Team(id) => format!("team {}", id),
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_init(cli: &Cli) -> Result<()> {
    let app = open_app(cli).await?;
    formatter::print_success(&format!(
        "Initialized hostq state at {}",
        resolve(&cli.working_dir, &app.settings.database).display()
    ));
    Ok(())
}

async fn cmd_host(cli: &Cli, command: &HostCommands) -> Result<()> {
    let app = open_app(cli).await?;
    match command {
        HostCommands::Register {
            id,
            platform,
            uuid,
            team,
            no_agent,
            scripts_disabled,
        } => {
            let mut host = match app.store.get_host(*id).await {
                Ok(existing) => existing,
                Err(e) if hostq::error::is_not_found(&e) => Host::new(*id, Platform::Other),
                Err(e) => return Err(e),
            };
            host.platform = Platform::parse(platform);
            if let Some(uuid) = uuid {
                host.uuid = uuid.clone();
            }
            host.team_id = *team;
            host.has_agent = !no_agent;
            host.scripts_enabled = !scripts_disabled;
            app.store.upsert_host(&host).await?;
            formatter::print_success(&format!(
                "Registered host {} ({}, {})",
                host.id, host.platform, host.uuid
            ));
        }
        HostCommands::Show { id } => {
            let host = app.store.get_host(*id).await?;
            formatter::print_host(&host);
        }
    }
    Ok(())
}

async fn cmd_script(cli: &Cli, command: &ScriptCommands) -> Result<()> {
    let app = open_app(cli).await?;
    let library = app.library();
    match command {
        ScriptCommands::Add { name, file, team } => {
            let contents = read_script_file(file)?;
            let script = library
                .create(ScriptScope::from_team(*team), name, &contents)
                .await?;
            formatter::print_success(&format!(
                "Saved script {} as '{}' in {}",
                script.id,
                script.name,
                scope_label(script.scope())
            ));
        }
        ScriptCommands::Edit { id, file } => {
            let contents = read_script_file(file)?;
            let change = library.update_contents(*id, &contents).await?;
            formatter::print_success(&format!(
                "Updated script '{}'; canceled pending runs on {} host(s)",
                change.value.name,
                change.affected_hosts.len()
            ));
        }
        ScriptCommands::Delete { id } => {
            let affected = library.delete(*id).await?;
            formatter::print_success(&format!(
                "Deleted script {}; canceled pending runs on {} host(s)",
                id,
                affected.len()
            ));
        }
        ScriptCommands::List { team } => {
            let scripts = library.list(ScriptScope::from_team(*team)).await?;
            formatter::print_script_list(&scripts);
        }
        ScriptCommands::Sync { manifest } => {
            let (scope, desired) = parser::load_scripts_manifest(manifest)?;
            let change = library.batch_set(scope, &desired).await?;
            formatter::print_success(&format!(
                "{} now has {} script(s); canceled pending runs on {} host(s)",
                scope_label(scope),
                change.value.len(),
                change.affected_hosts.len()
            ));
        }
    }
    Ok(())
}

async fn cmd_automation(cli: &Cli, command: &AutomationCommands) -> Result<()> {
    let app = open_app(cli).await?;
    let library = app.library();
    match command {
        AutomationCommands::Link { name, script_id } => {
            library.link_automation(name, *script_id).await?;
            formatter::print_success(&format!("Linked '{}' to script {}", name, script_id));
        }
        AutomationCommands::Unlink { name } => {
            library.unlink_automation(name).await?;
            formatter::print_success(&format!("Unlinked '{}'", name));
        }
    }
    Ok(())
}

async fn cmd_run(
    cli: &Cli,
    host_id: HostId,
    script_id: Option<i64>,
    file: Option<&Path>,
    body: Option<&str>,
    options: RunOptions,
) -> Result<()> {
    let app = open_app(cli).await?;
    let executor = app.executor();
    let result = match (script_id, file, body) {
        (Some(script_id), _, _) => executor.run_saved_script(host_id, script_id, options).await?,
        (None, Some(path), _) => {
            let body = read_script_file(path)?;
            executor.new_execution_request(host_id, &body, options).await?
        }
        (None, None, Some(body)) => executor.new_execution_request(host_id, body, options).await?,
        (None, None, None) => bail!("One of --script-id, --file or --body is required"),
    };
    formatter::print_success(&format!(
        "Queued execution {} on host {}",
        result.execution_id, host_id
    ));
    Ok(())
}

async fn cmd_result(cli: &Cli, command: &ResultCommands) -> Result<()> {
    let app = open_app(cli).await?;
    let executor = app.executor();
    match command {
        ResultCommands::Show { execution_id } => {
            let result = executor.get_result(execution_id).await?;
            formatter::print_script_result(&result);
        }
        ResultCommands::Report {
            host_id,
            execution_id,
            exit_code,
            output,
            runtime,
            timed_out,
        } => {
            let recorded = executor
                .record_result(ScriptResultPayload {
                    host_id: *host_id,
                    execution_id: execution_id.clone(),
                    output: output.clone(),
                    runtime: *runtime,
                    exit_code: *exit_code,
                    timed_out: *timed_out,
                })
                .await?;
            if recorded.duplicate {
                println!("{}", "Result already recorded; nothing changed.".dimmed());
            } else {
                formatter::print_success(&format!("Recorded result for {}", execution_id));
            }
        }
    }
    Ok(())
}

async fn cmd_queue(cli: &Cli, command: &QueueCommands) -> Result<()> {
    let app = open_app(cli).await?;
    let queue = ActivityQueue::new(app.backend());
    match command {
        QueueCommands::Add {
            host_id,
            activity_type,
            priority,
            payload,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(payload).context("Activity payload is not valid JSON")?;
            let activity = queue
                .enqueue(NewActivity {
                    host_id: *host_id,
                    activity_type: ActivityType::parse(activity_type)?,
                    priority: *priority,
                    payload,
                })
                .await?;
            formatter::print_success(&format!(
                "Enqueued {} {} on host {}",
                activity.activity_type, activity.execution_id, host_id
            ));
        }
        QueueCommands::List { host_id } => {
            let activities = queue.list_pending(*host_id).await?;
            formatter::print_activity_list(*host_id, &activities);
        }
        QueueCommands::Ready { host_id } => {
            let activities = queue.list_ready(*host_id).await?;
            formatter::print_activity_list(*host_id, &activities);
        }
        QueueCommands::Activate { host_id } => match queue.activate_next(*host_id).await? {
            Some(activity) => formatter::print_success(&format!(
                "Activated {} on host {}",
                activity.execution_id, host_id
            )),
            None => println!(
                "{}",
                format!("Nothing to activate on host {}.", host_id).dimmed()
            ),
        },
        QueueCommands::Cancel {
            host_id,
            execution_id,
        } => {
            let canceled = queue.cancel(*host_id, execution_id).await?;
            let mut msg = format!("Canceled {}", canceled.execution_id);
            if let Some(next) = canceled.next_activated {
                msg.push_str(&format!("; activated {}", next));
            }
            formatter::print_success(&msg);
        }
        QueueCommands::Complete {
            host_id,
            execution_id,
        } => {
            let completed = queue.complete(*host_id, execution_id).await?;
            let mut msg = if completed.removed {
                format!("Completed {}", completed.execution_id)
            } else {
                format!("{} was already completed", completed.execution_id)
            };
            if let Some(next) = completed.next_activated {
                msg.push_str(&format!("; activated {}", next));
            }
            formatter::print_success(&msg);
        }
    }
    Ok(())
}

async fn cmd_device(cli: &Cli, command: &DeviceCommands) -> Result<()> {
    let app = open_app(cli).await?;
    let devices = app.devices();
    match command {
        DeviceCommands::Lock { host_id } => {
            let action_ref = devices.request_lock(*host_id).await?;
            formatter::print_success(&format!("Lock requested on host {} ({})", host_id, action_ref));
        }
        DeviceCommands::Unlock { host_id } => {
            let action_ref = devices.request_unlock(*host_id).await?;
            formatter::print_success(&format!(
                "Unlock requested on host {} ({})",
                host_id, action_ref
            ));
            let status = devices.get_status(*host_id).await?;
            formatter::print_device_status(&status);
        }
        DeviceCommands::Wipe { host_id } => {
            let action_ref = devices.request_wipe(*host_id).await?;
            formatter::print_success(&format!("Wipe requested on host {} ({})", host_id, action_ref));
        }
        DeviceCommands::Status { host_id } => {
            let status = devices.get_status(*host_id).await?;
            formatter::print_device_status(&status);
        }
        DeviceCommands::MdmResult {
            host_id,
            command_id,
            status,
        } => {
            let host = app.store.get_host(*host_id).await?;
            let status = MdmCommandStatus::parse(status);
            app.mdm().record_result(command_id, &host.uuid, status).await?;
            if status == MdmCommandStatus::Pending {
                formatter::print_success(&format!("Command {} still pending", command_id));
                return Ok(());
            }
            let succeeded = status == MdmCommandStatus::Acknowledged;
            match devices
                .on_mdm_command_result(*host_id, command_id, succeeded)
                .await?
            {
                Some(kind) => formatter::print_success(&format!(
                    "Applied {} result for host {}",
                    kind, host_id
                )),
                None => println!(
                    "{}",
                    format!("Command {} is not a pending action of host {}.", command_id, host_id)
                        .dimmed()
                ),
            }
        }
    }
    Ok(())
}

async fn cmd_batch(cli: &Cli, command: &BatchCommands) -> Result<()> {
    let app = open_app(cli).await?;
    let coordinator = BatchCoordinator::new(app.backend());
    match command {
        BatchCommands::Run {
            script_id,
            hosts,
            requester,
        } => {
            let batch_id = coordinator
                .execute_on_hosts(*script_id, hosts, requester.as_deref())
                .await?;
            formatter::print_success(&format!("Started batch {}", batch_id));
        }
        BatchCommands::Summary { batch_id, hosts } => {
            let summary = coordinator.summary(batch_id).await?;
            let rows = if *hosts {
                coordinator.host_results(batch_id).await?
            } else {
                vec![]
            };
            formatter::print_batch_summary(&summary, &rows);
        }
    }
    Ok(())
}

async fn cmd_cleanup(cli: &Cli) -> Result<()> {
    let app = open_app(cli).await?;
    let removed = app.library().cleanup_unused_contents().await?;
    formatter::print_success(&format!("Removed {} unused script content row(s)", removed));
    Ok(())
}
