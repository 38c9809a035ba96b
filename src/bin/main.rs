use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use marche::{
    cli::{Cli, Commands, parse_args},
    config::{Config, load_config},
    daemon::Daemon,
    privilege::{self, PidFile},
    status::Status,
};

/// How often a one-shot request re-polls its service.
const WAIT_POLL: Duration = Duration::from_millis(200);

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let config = load_config(Some(args.config.as_path()))?;
    init_logging(&args, &config);

    match args.command {
        Commands::Serve { daemonize } => serve(&config, daemonize)?,
        Commands::List => {
            for service in build_daemon(&config)?.refresh()? {
                println!("{service}");
            }
        }
        Commands::Status { service, json } => {
            let daemon = build_daemon(&config)?;
            daemon.refresh()?;
            let statuses = match service {
                Some(service) => {
                    let status = daemon.service_status(&service)?;
                    vec![(service, status)]
                }
                None => daemon.statuses()?,
            };
            if json {
                let map: serde_json::Map<String, serde_json::Value> = statuses
                    .into_iter()
                    .map(|(name, status)| (name, serde_json::json!(status)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (name, status) in statuses {
                    println!("{name:<32} {status}");
                }
            }
        }
        Commands::Start { service } => {
            let daemon = build_daemon(&config)?;
            daemon.refresh()?;
            daemon.start_service(&service)?;
            report(&daemon, &service)?;
        }
        Commands::Stop { service } => {
            let daemon = build_daemon(&config)?;
            daemon.refresh()?;
            daemon.stop_service(&service)?;
            report(&daemon, &service)?;
        }
        Commands::Restart { service } => {
            let daemon = build_daemon(&config)?;
            daemon.refresh()?;
            daemon.restart_service(&service)?;
            report(&daemon, &service)?;
        }
        Commands::Logs { service } => {
            let daemon = build_daemon(&config)?;
            daemon.refresh()?;
            for (source, lines) in daemon.service_logs(&service)? {
                println!("==> {source} <==");
                print!("{lines}");
                if !lines.is_empty() && !lines.ends_with('\n') {
                    println!();
                }
            }
        }
        Commands::Deps { service } => {
            let daemon = build_daemon(&config)?;
            daemon.refresh()?;
            for dependency in daemon.dependencies(&service)? {
                println!("{dependency}");
            }
        }
    }

    Ok(())
}

fn init_logging(args: &Cli, config: &Config) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(config.daemon.loglevel.as_deref().unwrap_or("info"))
        })
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_daemon(config: &Config) -> Result<Daemon, Box<dyn Error>> {
    Ok(Daemon::from_config(config)?)
}

/// Waits out the operation, then prints the service status.
///
/// The background command reads from pipes owned by this process, so a
/// one-shot invocation must not exit before the command does.
fn report(daemon: &Daemon, service: &str) -> Result<(), Box<dyn Error>> {
    let mut status = daemon.service_status(service)?;
    while status.is_transitional() {
        thread::sleep(WAIT_POLL);
        status = daemon.service_status(service)?;
    }
    println!("{service}: {status}");
    Ok(())
}

fn serve(config: &Config, daemonize: bool) -> Result<(), Box<dyn Error>> {
    if daemonize {
        privilege::daemonize()?;
    }
    privilege::set_user(config.daemon.user.as_deref(), config.daemon.group.as_deref())?;
    let _pid_file = match &config.daemon.piddir {
        Some(dir) => Some(PidFile::acquire(dir)?),
        None => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })?;

    let daemon = build_daemon(config)?;
    let interval = config.daemon.poll_interval()?;
    info!(
        "marched serving {} job(s), polling every {:?}",
        daemon.jobs().len(),
        interval
    );

    let mut last: Vec<(String, Status)> = Vec::new();
    while running.load(Ordering::SeqCst) {
        if let Err(err) = daemon.refresh() {
            error!("service discovery failed: {err}");
        }

        match daemon.statuses() {
            Ok(statuses) => {
                for (service, status) in &statuses {
                    let previous = last.iter().find(|(name, _)| name == service);
                    if previous.map(|(_, old)| old) != Some(status) {
                        info!("{service}: {status}");
                    }
                }
                last = statuses;
            }
            Err(err) => warn!("status poll failed: {err}"),
        }

        let deadline = Instant::now() + interval;
        while running.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
    }

    info!("marched shutting down");
    Ok(())
}
