use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, tick, unbounded, Receiver};
use parking_lot::RwLock;
use sysinfo::System;
use tracing::{info, warn};

use bit_helper::capture::{ScreenCapture, XcapCapture};
use bit_helper::config::Config;
use bit_helper::messaging::{Command, CommandResult, Event, EventBus};
use bit_helper::notify::{AudioNotifier, Notifier, SilentNotifier};
use bit_helper::templates::{self, ProfileRegistry, TemplateRef};
use bit_helper::{matcher, AppResult, AutomationController, ControllerFactory, NativeDevices};

const LOG_TARGET_STARTUP: &str = "bit_helper::startup";

#[derive(Parser)]
#[command(name = "bit-helper", version, about = "Find templates on screen and click them")]
struct Cli {
    /// Config file to use instead of config/config.json next to the executable
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run one automation group per profile and read commands from stdin
    Run {
        /// Stored profile to run; repeat for several independent groups
        #[arg(short, long = "profile")]
        profiles: Vec<String>,

        /// Initial confidence threshold (0.50-1.00)
        #[arg(long)]
        confidence: Option<f32>,

        /// Capture every monitor instead of the primary one
        #[arg(long)]
        all_monitors: bool,

        /// Single unscaled matching pass
        #[arg(long)]
        single_scale: bool,

        /// Do not play notification sounds
        #[arg(long)]
        mute: bool,
    },

    /// Manage stored template profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// List monitors in capture order
    Monitors,

    /// Match a template against a screenshot file
    Match {
        screen: PathBuf,
        template: PathBuf,

        #[arg(long)]
        confidence: Option<f32>,

        #[arg(long)]
        single_scale: bool,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// List profile names and template counts
    List,
    /// Show the templates of one profile
    Show { name: String },
    /// Create or replace a profile
    Save {
        name: String,
        #[arg(required = true)]
        templates: Vec<String>,
    },
    /// Delete a profile
    Delete { name: String },
}

fn initialize_tracing() {
    use tracing_appender::rolling;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Get log directory in user config folder
    let log_dir = dirs::config_dir()
        .map(|dir| dir.join("BitHelper").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Failed to create log directory: {}", e);
    }

    let file_appender = rolling::daily(&log_dir, "bit-helper.log");

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true);

    // Console output would interleave with the operator prompt in release builds
    #[cfg(debug_assertions)]
    {
        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(console_layer)
            .init();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();
    }

    info!("Log directory: {}", log_dir.display());
}

fn log_runtime_environment() {
    let version = env!("CARGO_PKG_VERSION");
    let os_name = System::long_os_version()
        .or_else(System::name)
        .unwrap_or_else(|| "Unknown OS".to_string());
    let kernel = System::kernel_version().unwrap_or_else(|| "Unknown Kernel".to_string());
    let architecture = std::env::consts::ARCH;

    info!(target: LOG_TARGET_STARTUP, "Starting Bit Helper v{} on ({})", version, architecture);
    info!(target: LOG_TARGET_STARTUP, "Operating System: {} (kernel {})", os_name, kernel);

    match XcapCapture::new().monitors() {
        Ok(monitors) => {
            info!(target: LOG_TARGET_STARTUP, "Monitors: {} detected", monitors.len());
            for monitor in &monitors {
                tracing::debug!(target: LOG_TARGET_STARTUP, "  {}", monitor.label());
            }
        }
        Err(err) => warn!(target: LOG_TARGET_STARTUP, "Monitor enumeration failed: {err}"),
    }
}

fn load_config(path: Option<&Path>) -> AppResult<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();

    initialize_tracing();
    log_runtime_environment();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Cmd::Run {
            profiles,
            confidence,
            all_monitors,
            single_scale,
            mute,
        } => {
            let mut config = config;
            if let Some(value) = confidence {
                config.confidence_threshold = value;
            }
            if all_monitors {
                config.capture_target = bit_helper::capture::CaptureTarget::AllMonitors;
            }
            if single_scale {
                config.scan.multi_scale = false;
            }
            config.validate()?;
            run(config, profiles, mute)
        }
        Cmd::Profiles { action } => manage_profiles(&config, action),
        Cmd::Monitors => list_monitors(),
        Cmd::Match {
            screen,
            template,
            confidence,
            single_scale,
        } => match_files(&config, &screen, &template, confidence, single_scale),
    }
}

fn run(config: Config, profiles: Vec<String>, mute: bool) -> AppResult<()> {
    let registry = ProfileRegistry::load(&config.profiles_file)?;
    let registry = Arc::new(RwLock::new(registry));

    let notifier: Arc<dyn Notifier> = if mute {
        Arc::new(SilentNotifier)
    } else {
        match AudioNotifier::spawn() {
            Ok(notifier) => Arc::new(notifier),
            Err(err) => {
                warn!("Audio thread unavailable, sounds disabled: {err}");
                Arc::new(SilentNotifier)
            }
        }
    };

    let bus = EventBus::new();
    let factory = ControllerFactory::new(config, registry, Arc::new(NativeDevices))
        .with_notifier(notifier)
        .with_bus(bus.clone());

    let groups: Vec<AutomationController> = if profiles.is_empty() {
        vec![factory.create("main")]
    } else {
        profiles.iter().map(|name| factory.create(name.as_str())).collect()
    };

    let (events, subscription) = bus.subscribe();
    let printer = thread::spawn(move || print_events(events));

    for group in &groups {
        // Groups named after a profile start right away
        if profiles.iter().any(|p| p == group.group()) {
            match group.start(Some(group.group())) {
                Ok(()) => println!("{}", group.status_line()),
                Err(err) => println!("[{}] {:#}", group.group(), anyhow::Error::new(err)),
            }
        }
    }

    let (done_tx, done_rx) = unbounded::<()>();
    let ticker_groups = groups.clone();
    let ticker = thread::spawn(move || status_ticker(ticker_groups, done_rx));

    print_help();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read operator input")?;
        if line.trim().is_empty() {
            continue;
        }
        if line.trim() == "help" {
            print_help();
            continue;
        }

        let (targets, text) = select_groups(&groups, &line);
        if targets.is_empty() {
            println!("No such group");
            continue;
        }

        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };
        let quit = command == Command::Quit;

        for group in targets {
            match group.execute(command.clone()) {
                CommandResult::Success => println!("[{}] {}: ok", group.group(), command.description()),
                CommandResult::SuccessWithValue(value) => println!("{}", value),
                CommandResult::Error(message) => println!("[{}] {}", group.group(), message),
            }
        }

        if quit {
            break;
        }
    }

    for group in &groups {
        if group.status().is_active() {
            let _ = group.stop();
        }
    }
    drop(done_tx);
    let _ = ticker.join();

    bus.publish(Event::Shutdown);
    let _ = printer.join();
    bus.unsubscribe(subscription);
    info!("Exiting");
    Ok(())
}

/// `@name command` targets one group, anything else targets all of them
fn select_groups<'a>(
    groups: &'a [AutomationController],
    line: &'a str,
) -> (Vec<&'a AutomationController>, &'a str) {
    let line = line.trim();
    match line.strip_prefix('@') {
        Some(rest) => {
            let (name, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, "status"));
            let targets = groups.iter().filter(|g| g.group() == name).collect();
            (targets, text)
        }
        None => (groups.iter().collect(), line),
    }
}

fn print_events(events: Receiver<Event>) {
    while let Ok(event) = events.recv() {
        match event {
            Event::Shutdown => break,
            // Status changes are already visible on the ticker
            Event::StatusChanged { .. } => {}
            other => println!("{}", other.description()),
        }
    }
}

/// Print the elapsed time of every active group once per second
fn status_ticker(groups: Vec<AutomationController>, done: Receiver<()>) {
    let ticker = tick(Duration::from_secs(1));
    loop {
        select! {
            recv(ticker) -> _ => {
                for group in groups.iter().filter(|g| g.status().is_active()) {
                    println!("{}", group.status_line());
                }
            }
            recv(done) -> _ => break,
        }
    }
}

fn print_help() {
    println!("Commands (prefix with @group to target one group):");
    println!("  start [profile] | stop | pause | resume | toggle");
    println!("  confidence <0.50-1.00> | reset | profile <name>");
    println!("  add <image> | remove <index> | loot add <image> | loot remove <index>");
    println!("  status | help | quit");
}

fn manage_profiles(config: &Config, action: ProfileAction) -> AppResult<()> {
    let mut registry = ProfileRegistry::load(&config.profiles_file)?;

    match action {
        ProfileAction::List => {
            if registry.is_empty() {
                println!("No profiles in {}", registry.path().display());
            }
            for name in registry.names() {
                let count = registry.get(&name).map_or(0, |t| t.len());
                println!("{:<24} {} template(s)", name, count);
            }
        }
        ProfileAction::Show { name } => {
            let templates = registry.load_templates(&name)?;
            for (index, template) in templates.iter().enumerate() {
                let state = if template.is_decoded() { "" } else { "  (unreadable)" };
                let location = template
                    .path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                println!("{:>3}  {:<24} {}{}", index, template.name(), location, state);
            }
        }
        ProfileAction::Save { name, templates } => {
            for path in &templates {
                if let Err(err) = TemplateRef::try_from_path(path) {
                    warn!("{err}");
                    println!("Warning: {} cannot be decoded", path);
                }
            }
            registry.upsert(&name, templates)?;
            registry.save()?;
            println!("Saved profile {}", name);
        }
        ProfileAction::Delete { name } => {
            registry.remove(&name)?;
            registry.save()?;
            println!("Deleted profile {}", name);
        }
    }
    Ok(())
}

fn list_monitors() -> AppResult<()> {
    let monitors = XcapCapture::new()
        .monitors()
        .context("Failed to enumerate monitors")?;
    for (index, monitor) in monitors.iter().enumerate() {
        println!("{:>2}  {}", index, monitor.label());
    }
    Ok(())
}

fn match_files(
    config: &Config,
    screen: &Path,
    template: &Path,
    confidence: Option<f32>,
    single_scale: bool,
) -> AppResult<()> {
    let threshold = bit_helper::config::validate_confidence(
        confidence.unwrap_or(config.confidence_threshold),
    )?;
    let scales = if single_scale {
        matcher::ScaleRange::unscaled()
    } else {
        config.scan.scale_range()
    };

    let screen = templates::decode(screen)?;
    let template_image = templates::decode(template)?;

    let Some(best) = matcher::find_best(&screen, &template_image, &scales) else {
        bail!("Template is larger than the screen at every scale");
    };

    let verdict = if best.score > threshold { "match" } else { "no match" };
    println!(
        "{}: score {:.4} at ({}, {}) scale {:.3} size {}x{} (threshold {:.2})",
        verdict, best.score, best.x, best.y, best.scale, best.width, best.height, threshold
    );
    Ok(())
}
