//! panemux
//!
//! Session host and command-line client for keyed pty sessions.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use panemux::config::Config;
use panemux::host::Host;
use panemux::ipc::{decode_data, encode_data, IpcClient, IpcRequest, IpcResponse, IpcSessionInfo};
use panemux::session::ShutdownReport;
use tokio::io::AsyncBufReadExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// panemux - long-lived terminal sessions keyed by pane identifiers.
#[derive(Parser, Debug)]
#[command(name = "panemux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the session host in the foreground
    Serve,

    /// Show host status
    Status,

    /// Stop the running host, shutting every session down
    Stop {
        /// Seconds to wait for the host to exit
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Create a session, or attach to the live one with the same key
    Create {
        /// Session key, e.g. "shell:1"
        key: String,

        /// Working directory (default: current directory)
        #[arg(long, short = 'd', value_name = "DIR")]
        dir: Option<PathBuf>,

        #[arg(long, default_value = "80")]
        cols: u16,

        #[arg(long, default_value = "24")]
        rows: u16,

        /// Command to type into the new session (repeatable)
        #[arg(long = "command", short = 'x', value_name = "CMD")]
        commands: Vec<String>,

        /// Program to run instead of the default shell
        #[arg(long)]
        program: Option<String>,

        /// Environment variable for the process, as NAME=VALUE (repeatable)
        #[arg(long = "env", short = 'e', value_name = "NAME=VALUE")]
        env: Vec<String>,

        /// Arguments for --program
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Send input to a session
    Write {
        key: String,

        /// Text to send
        text: String,

        /// Do not append a newline
        #[arg(long, short = 'n')]
        no_newline: bool,
    },

    /// Resize a session's terminal
    Resize { key: String, cols: u16, rows: u16 },

    /// Send a signal to a session's process group
    Signal {
        key: String,

        /// Signal name or number: TERM, KILL, INT, HUP, QUIT
        signal: String,
    },

    /// Kill a session immediately and forget it
    Kill { key: String },

    /// Stop a session gracefully (SIGTERM, then SIGKILL)
    Stop {
        key: String,

        /// Milliseconds to wait after SIGTERM
        #[arg(long, value_name = "MS")]
        grace_ms: Option<u64>,

        /// Milliseconds to wait after SIGKILL
        #[arg(long, value_name = "MS")]
        kill_timeout_ms: Option<u64>,
    },

    /// Restart a session from its original request
    Restart { key: String },

    /// Stream a session's output; stdin lines are sent as input
    Attach {
        key: String,

        /// Skip the scrollback replay
        #[arg(long)]
        no_replay: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = init_tracing(&config, cli.verbose)?;

    match cli.command {
        Commands::Serve => {
            config.validate()?;
            tracing::info!("panemux host starting...");

            let host = Host::new(config);
            let reports = host.serve().await?;
            let forced = reports.iter().filter(|r| r.forced).count();
            tracing::info!(sessions = reports.len(), forced, "panemux host exited");
        }
        Commands::Status => match query_status(&config).await {
            Ok(status) => {
                println!("{}", status);
            }
            Err(e) => {
                eprintln!("Host is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Stop { timeout } => match stop_host(&config, timeout).await {
            Ok(()) => println!("Host stopped"),
            Err(e) => {
                eprintln!("Failed to stop host: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(cmd) => {
            if let Err(e) = run_sessions_command(&config, cmd).await {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Initializes tracing: stderr always, plus the configured log file.
///
/// `--verbose` forces debug; otherwise `RUST_LOG` wins over the configured level.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match &config.daemon.log_file {
        Some(path) => {
            let (dir, file_name) = split_log_path(path)?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

fn split_log_path(path: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log_file has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(file_name)))
}

async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
    let socket_path = config.socket_path();
    IpcClient::connect_with_timeout(&socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "host is not running (cannot connect to {})",
                socket_path.display()
            )
        })
}

/// Status information returned from the host.
#[derive(Debug)]
struct HostStatus {
    running: bool,
    uptime_secs: u64,
    session_count: usize,
    live_sessions: usize,
    pid: u32,
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Host Status: {}",
            if self.running { "running" } else { "stopping" }
        )?;
        writeln!(f, "  PID:      {}", self.pid)?;
        writeln!(f, "  Uptime:   {}", format_duration(self.uptime_secs))?;
        write!(
            f,
            "  Sessions: {} ({} live)",
            self.session_count, self.live_sessions
        )
    }
}

async fn query_status(config: &Config) -> anyhow::Result<HostStatus> {
    let mut client = connect(config).await?;

    match client.status().await? {
        IpcResponse::Status {
            running,
            uptime_secs,
            session_count,
            live_sessions,
            pid,
        } => Ok(HostStatus {
            running,
            uptime_secs,
            session_count,
            live_sessions,
            pid,
        }),
        IpcResponse::Error { message } => anyhow::bail!("Host returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from host"),
    }
}

/// Sends `Stop` and waits for the socket to go away.
async fn stop_host(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = config.socket_path();
    let mut client = connect(config).await?;

    println!("Sending shutdown request...");
    match client.stop().await? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for host to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Host returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from host"),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for host to exit ({}s)", timeout_secs)
}

async fn run_sessions_command(config: &Config, cmd: SessionsCommands) -> anyhow::Result<()> {
    let mut client = connect(config).await?;

    match cmd {
        SessionsCommands::List { json } => {
            let sessions = client.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        SessionsCommands::Create {
            key,
            dir,
            cols,
            rows,
            commands,
            program,
            env,
            args,
        } => {
            let working_dir = match dir {
                Some(dir) => dir,
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            let env = env
                .iter()
                .map(|pair| parse_env_pair(pair))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let response = client
                .send(IpcRequest::CreateOrAttach {
                    key,
                    working_dir,
                    cols,
                    rows,
                    initial_commands: commands,
                    program,
                    args,
                    env,
                })
                .await?;
            match response {
                IpcResponse::Attached { session, spawned } => {
                    let verb = if spawned { "Created" } else { "Attached to" };
                    println!(
                        "{} session {} (pid {})",
                        verb,
                        session.key,
                        session.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
                    );
                }
                IpcResponse::Error { message } => anyhow::bail!("{}", message),
                _ => anyhow::bail!("Unexpected response from host"),
            }
        }
        SessionsCommands::Write {
            key,
            text,
            no_newline,
        } => {
            let mut data = text.into_bytes();
            if !no_newline {
                data.push(b'\n');
            }
            client.write(&key, &data).await?;
        }
        SessionsCommands::Resize { key, cols, rows } => {
            client.resize(&key, cols, rows).await?;
        }
        SessionsCommands::Signal { key, signal } => {
            client.signal(&key, &signal).await?;
            println!("Sent {} to session {}", signal, key);
        }
        SessionsCommands::Kill { key } => {
            if client.kill(&key).await? {
                println!("Session {} killed", key);
            } else {
                println!("No session {}", key);
            }
        }
        SessionsCommands::Stop {
            key,
            grace_ms,
            kill_timeout_ms,
        } => {
            let report = client.stop_session(&key, grace_ms, kill_timeout_ms).await?;
            print_shutdown_report(&report);
        }
        SessionsCommands::Restart { key } => {
            let session = client.restart(&key).await?;
            println!(
                "Restarted session {} (instance {})",
                session.key, session.instance_id
            );
        }
        SessionsCommands::Attach { key, no_replay } => {
            let code = attach(client, &key, !no_replay).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}

/// Streams output to stdout and forwards stdin lines until the session
/// exits, stdin closes, or Ctrl-C. Returns the exit code to use.
async fn attach(mut client: IpcClient, key: &str, replay: bool) -> anyhow::Result<i32> {
    client.subscribe(key, replay).await?;

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = client.next_event() => match event? {
                IpcResponse::Output { data, .. } => {
                    let bytes = decode_data(&data).context("Host sent invalid output encoding")?;
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
                IpcResponse::Exited { code, signal, .. } => {
                    stdout.flush()?;
                    match (&code, &signal) {
                        (_, Some(signal)) => eprintln!("\n[session {} terminated by {}]", key, signal),
                        (Some(code), None) => eprintln!("\n[session {} exited with {}]", key, code),
                        (None, None) => eprintln!("\n[session {} exited]", key),
                    }
                    return Ok(code.unwrap_or(1));
                }
                IpcResponse::Error { message } => eprintln!("[host: {}]", message),
                _ => {}
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let request = IpcRequest::Write {
                        key: key.to_string(),
                        data: encode_data(format!("{}\n", line).as_bytes()),
                    };
                    client.send_streaming(request).await?;
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[detached from {}]", key);
                return Ok(0);
            }
        }
    }
}

fn parse_env_pair(pair: &str) -> anyhow::Result<(String, String)> {
    match pair.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => anyhow::bail!("invalid environment variable {:?}, expected NAME=VALUE", pair),
    }
}

fn print_shutdown_report(report: &ShutdownReport) {
    if !report.existed {
        println!("No session {}", report.key);
        return;
    }

    let phases: Vec<String> = report.phases.iter().map(|p| p.to_string()).collect();
    println!("Session {} stopped: {}", report.key, phases.join(" -> "));
    if report.forced {
        println!("  Process ignored SIGTERM and was killed");
    }
    if let Some(exit) = &report.exit {
        println!("  Exit: {}", exit);
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let key_width = sessions
        .iter()
        .map(|s| s.key.len())
        .max()
        .unwrap_or(3)
        .max(3);

    println!(
        "{:<key_width$}  {:>7}  {:<8}  {:>9}  {:>12}  PROGRAM",
        "KEY",
        "PID",
        "STATE",
        "SIZE",
        "ACTIVE",
        key_width = key_width
    );
    println!("{}", "-".repeat(key_width + 52));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if session.alive {
            "running".to_string()
        } else {
            match (&session.exit_code, &session.exit_signal) {
                (_, Some(signal)) => truncate_str(signal, 8),
                (Some(code), None) => format!("exit {}", code),
                (None, None) => "exited".to_string(),
            }
        };
        let size = format!("{}x{}", session.cols, session.rows);

        println!(
            "{:<key_width$}  {:>7}  {:<8}  {:>9}  {:>12}  {}",
            session.key,
            pid,
            state,
            size,
            format_relative_time(session.last_activity),
            truncate_str(&session.program, 30),
            key_width = key_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp in milliseconds as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["panemux", "serve"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["panemux", "status", "-v", "--config", "/tmp/p.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.toml")));
    }

    #[test]
    fn test_stop_default_timeout() {
        let cli = Cli::try_parse_from(["panemux", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { timeout } => assert_eq!(timeout, 30),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["panemux", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_create_full() {
        let cli = Cli::try_parse_from([
            "panemux", "sessions", "create", "dev:1", "-d", "/srv", "--cols", "120", "-x", "make",
            "-x", "make test", "-e", "FOO=bar", "--program", "/bin/bash", "--", "-l",
        ])
        .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Create {
                key,
                dir,
                cols,
                rows,
                commands,
                program,
                env,
                args,
            }) => {
                assert_eq!(key, "dev:1");
                assert_eq!(dir, Some(PathBuf::from("/srv")));
                assert_eq!((cols, rows), (120, 24));
                assert_eq!(commands, vec!["make", "make test"]);
                assert_eq!(program.as_deref(), Some("/bin/bash"));
                assert_eq!(env, vec!["FOO=bar"]);
                assert_eq!(args, vec!["-l"]);
            }
            _ => panic!("Expected Sessions Create command"),
        }
    }

    #[test]
    fn test_sessions_stop_timeouts() {
        let cli = Cli::try_parse_from([
            "panemux", "sessions", "stop", "dev:1", "--grace-ms", "2000",
        ])
        .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Stop {
                key,
                grace_ms,
                kill_timeout_ms,
            }) => {
                assert_eq!(key, "dev:1");
                assert_eq!(grace_ms, Some(2000));
                assert_eq!(kill_timeout_ms, None);
            }
            _ => panic!("Expected Sessions Stop command"),
        }
    }

    #[test]
    fn test_sessions_resize_requires_dimensions() {
        assert!(Cli::try_parse_from(["panemux", "sessions", "resize", "dev:1", "80"]).is_err());
        let cli = Cli::try_parse_from(["panemux", "sessions", "resize", "dev:1", "80", "24"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sessions(SessionsCommands::Resize { cols: 80, rows: 24, .. })
        ));
    }

    #[test]
    fn test_sessions_attach_no_replay() {
        let cli = Cli::try_parse_from(["panemux", "sessions", "attach", "shell:2", "--no-replay"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Attach { key, no_replay }) => {
                assert_eq!(key, "shell:2");
                assert!(no_replay);
            }
            _ => panic!("Expected Sessions Attach command"),
        }
    }

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_env_pair("EMPTY=").unwrap().1, "");
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn test_split_log_path() {
        let (dir, file) = split_log_path(Path::new("/var/log/panemux.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log"));
        assert_eq!(file, PathBuf::from("panemux.log"));

        let (dir, _) = split_log_path(Path::new("host.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("/usr/local/bin/zsh", 10), "/usr/lo...");
    }
}
