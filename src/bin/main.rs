use std::{
    error::Error,
    fs, io,
    os::fd::AsRawFd,
    path::PathBuf,
    process,
};

use nix::{sys::signal, unistd::Pid, unistd::Uid};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use unitd::{
    cli::{Cli, Commands, parse_args},
    config::load_catalog,
    error::ControlError,
    ipc::{self, ControlCommand, ControlResponse},
    note::AdminSub,
    path::ServicePath,
    runtime::{self, RuntimeMode},
    supervisor::{Supervisor, admin_note},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let euid = Uid::effective();

    let runtime_mode = if args.sys {
        if !euid.is_root() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "--sys requires root privileges",
            )
            .into());
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };

    runtime::init(runtime_mode);
    init_logging(&args);

    if euid.is_root() && runtime_mode == RuntimeMode::User {
        warn!("Running as root without --sys; state will be stored in userspace paths");
    }

    match args.command {
        Commands::Start { catalog, daemonize: daemonize_flag } => {
            if supervisor_running() {
                warn!("unitd supervisor already running; aborting duplicate start");
                return Ok(());
            }
            let catalog_path = resolve_catalog_path(&catalog)?;
            info!("Starting unitd supervisor with catalog {:?}", catalog_path);
            if daemonize_flag {
                daemonize()?;
            } else {
                register_signal_handler()?;
            }
            let catalog = load_catalog(&catalog_path)?;
            let mut supervisor = Supervisor::from_catalog(catalog)?;
            if let Err(err) = supervisor.run() {
                error!("Supervisor exited with error: {err}");
            }
        }
        Commands::Enable { path } => {
            let path = parse_path(&path)?;
            send_admin(&path, AdminSub::Enable)?;
        }
        Commands::Disable { path } => {
            let path = parse_path(&path)?;
            send_admin(&path, AdminSub::Disable)?;
        }
        Commands::Restart { path } => {
            let path = parse_path(&path)?;
            send_admin(&path, AdminSub::Restart)?;
        }
        Commands::Status { json } => match ipc::send_command(&ControlCommand::Status)? {
            ControlResponse::Status(snapshot) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                } else {
                    for unit in &snapshot.units {
                        let pid = unit
                            .main_pid
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "-".into());
                        println!(
                            "{:<32} {:<8} {:<12} {:>8} {}",
                            unit.path,
                            unit.kind,
                            unit.state,
                            pid,
                            unit.status_text.as_deref().unwrap_or(""),
                        );
                    }
                    for vertex in &snapshot.vertices {
                        let mut flags = String::new();
                        if vertex.enabled {
                            flags.push_str(" enabled");
                        }
                        if vertex.to_offline {
                            flags.push_str(" to-offline");
                        }
                        if vertex.to_disable {
                            flags.push_str(" to-disable");
                        }
                        println!("{:<32} {:?}{}", vertex.path, vertex.state, flags);
                    }
                }
            }
            other => {
                return Err(io::Error::other(format!(
                    "unexpected supervisor response: {other:?}"
                ))
                .into());
            }
        },
        Commands::Shutdown => match ipc::send_command(&ControlCommand::Shutdown) {
            Ok(ControlResponse::Message(message)) => println!("{message}"),
            Ok(_) => {}
            Err(ControlError::NotAvailable) => {
                warn!("No running unitd supervisor found");
            }
            Err(err) => return Err(err.into()),
        },
    }

    Ok(())
}

fn parse_path(raw: &str) -> Result<ServicePath, Box<dyn Error>> {
    ServicePath::parse(raw)
        .ok_or_else(|| format!("invalid service path '{raw}'").into())
}

fn send_admin(path: &ServicePath, sub: AdminSub) -> Result<(), Box<dyn Error>> {
    let command = ControlCommand::Note(admin_note(path, sub));
    match ipc::send_command(&command) {
        Ok(ControlResponse::Ok) => {
            println!("{sub} request for '{path}' accepted");
            Ok(())
        }
        Ok(ControlResponse::Message(message)) => {
            println!("{message}");
            Ok(())
        }
        Ok(ControlResponse::Error(message)) => Err(ControlError::Server(message).into()),
        Ok(other) => Err(io::Error::other(format!(
            "unexpected supervisor response: {other:?}"
        ))
        .into()),
        Err(ControlError::NotAvailable) => {
            warn!("No running unitd supervisor found; is it started?");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Supervisor runs write to a log file; one-shot commands go to stderr.
    let daemon_invocation = matches!(args.command, Commands::Start { .. });
    if !daemon_invocation {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    }

    let log_dir = runtime::log_dir();
    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory {:?}: {}", log_dir, err);
    }
    let log_path = log_dir.join("supervisor.log");

    let file = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open supervisor log file {:?}: {}", log_path, e);
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || file.try_clone().expect("clone log handle"))
        .with_ansi(false)
        .try_init();
}

fn resolve_catalog_path(path: &str) -> Result<PathBuf, Box<dyn Error>> {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        return Ok(candidate);
    }

    let cwd_candidate = std::env::current_dir()?.join(&candidate);
    if cwd_candidate.exists() {
        return Ok(cwd_candidate.canonicalize().unwrap_or(cwd_candidate));
    }

    for dir in runtime::config_dirs() {
        let candidate_path = dir.join(&candidate);
        if candidate_path.exists() {
            return Ok(candidate_path);
        }
    }

    Ok(cwd_candidate)
}

fn supervisor_running() -> bool {
    match ipc::read_supervisor_pid() {
        Ok(Some(pid)) => {
            let target = Pid::from_raw(pid);
            match signal::kill(target, None) {
                Ok(_) => true,
                Err(err) => {
                    if err == nix::Error::from(nix::errno::Errno::ESRCH) {
                        let _ = ipc::cleanup_runtime();
                        false
                    } else {
                        warn!("Failed to query supervisor pid {pid}: {err}");
                        false
                    }
                }
            }
        }
        Ok(None) | Err(_) => {
            if let Ok(path) = ipc::socket_path()
                && path.exists()
            {
                warn!("Found stale socket without PID file, cleaning up");
                let _ = ipc::cleanup_runtime();
            }
            false
        }
    }
}

/// Detaches the supervisor from the invoking terminal. The second fork
/// sheds session leadership so a controlling terminal can never be
/// reacquired; after it the new session needs no process-group surgery.
/// Logging goes to the supervisor log file, so stdio lands on /dev/null.
fn daemonize() -> io::Result<()> {
    use nix::unistd::{self, ForkResult};

    if let ForkResult::Parent { .. } = unsafe { unistd::fork() }? {
        process::exit(0);
    }
    unistd::setsid()?;
    if let ForkResult::Parent { .. } = unsafe { unistd::fork() }? {
        process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(devnull.as_raw_fd(), target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn register_signal_handler() -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        println!("unitd is shutting down");
        match ipc::send_command(&ControlCommand::Shutdown) {
            Ok(_) => {}
            Err(_) => process::exit(0),
        }
    })?;
    Ok(())
}
