use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use listening_lab::admin::{AdminSession, ClearStatus};
use listening_lab::catalog::{self, FsStimulusStore};
use listening_lab::config::AppConfig;
use listening_lab::gate::Rating;
use listening_lab::playback::{AudioSink, CommandSink, NullSink};
use listening_lab::recorder::{self, ResponseRecorder};
use listening_lab::session::{Command, Experiment, Identity, Outcome, SessionError, SessionState, View};
use listening_lab::table::{self, AppendOnlyTable, Backend, memory::MemoryTable};

#[derive(Parser)]
#[command(name = "listening-lab", version, about = "Perceptual listening experiment runner")]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the results table
    #[arg(long, global = true)]
    results: Option<PathBuf>,

    /// Results storage backend
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendArg>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Csv,
    Sqlite,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Csv => Backend::Csv,
            BackendArg::Sqlite => Backend::Sqlite,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the trials that would be presented, and any unpaired files
    Discover,

    /// Run a listening session for one participant
    Run {
        /// Participant ID (prompted for if omitted)
        #[arg(short, long)]
        participant: Option<String>,

        /// Shuffle seed (defaults to config seed, then random)
        #[arg(long)]
        seed: Option<u64>,

        /// Keep results in memory instead of writing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Open the admin shell (record count, export, clear)
    Admin,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let mut config = AppConfig::load(cli.config.as_deref());
    if let Some(backend) = cli.backend {
        config.backend = backend.into();
    }

    // Resolve results path: CLI > config > XDG default
    let results_path = cli.results.unwrap_or_else(|| config.resolve_results_path());

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout();

    match cli.command {
        Commands::Discover => {
            let found = catalog::discover(
                &FsStimulusStore,
                config.variant,
                &config.stimulus_dirs(),
                config.orphans,
            );
            let found = match found {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("{e}");
                    eprintln!("  {}", e.hint());
                    anyhow::bail!("Discovery failed");
                }
            };

            println!("{} trials ({:?} variant):", found.trials.len(), config.variant);
            for trial in found.trials.iter() {
                println!("  {}", trial.label());
            }
            if !found.orphans.is_empty() {
                println!();
                println!("Unpaired files (excluded):");
                for file in &found.orphans {
                    println!("  {}", file.path().display());
                }
            }
        }

        Commands::Run { participant, seed, dry_run } => {
            let table = open_table(&config, &results_path, dry_run)?;
            let seed = seed.or(config.seed);

            let participant = match participant {
                Some(p) => p,
                None => match prompt(&mut input, &mut out, "Participant ID: ")? {
                    Some(p) => p,
                    None => return Ok(()),
                },
            };

            match Identity::parse(&participant, config.admin_pin.as_deref()) {
                Ok(Identity::Admin) => {
                    let mut admin = AdminSession::new(table, recorder::columns(config.variant));
                    admin_shell(&mut admin, &mut input, &mut out)?;
                }
                Ok(Identity::Participant(id)) => {
                    let recorder = ResponseRecorder::new(table, config.variant);
                    let experiment = Experiment::new(
                        Arc::new(FsStimulusStore),
                        config.stimulus_dirs(),
                        config.orphans,
                        recorder,
                    )
                    .with_sink(audio_sink(&config));

                    let state = match experiment.begin(&id, seed) {
                        Ok(s) => s,
                        Err(e) => {
                            report(&e, &mut out)?;
                            anyhow::bail!("Could not start the session");
                        }
                    };
                    run_session(&experiment, state, seed, &mut input, &mut out)?;
                }
                Err(e) => {
                    report(&e, &mut out)?;
                    anyhow::bail!("Invalid participant ID");
                }
            }
        }

        Commands::Admin => {
            let Some(pin) = config.admin_pin.as_deref().filter(|p| !p.is_empty()) else {
                anyhow::bail!("Admin access is disabled. Set admin_pin in the config file.");
            };
            let entered = prompt(&mut input, &mut out, "PIN: ")?.unwrap_or_default();
            if entered.trim() != pin {
                anyhow::bail!("Wrong PIN");
            }
            let table = open_table(&config, &results_path, false)?;
            let mut admin = AdminSession::new(table, recorder::columns(config.variant));
            admin_shell(&mut admin, &mut input, &mut out)?;
        }
    }

    Ok(())
}

fn open_table(
    config: &AppConfig,
    path: &std::path::Path,
    dry_run: bool,
) -> Result<Arc<dyn AppendOnlyTable>> {
    if dry_run {
        log::info!("Dry run: results are kept in memory only");
        return Ok(Arc::new(MemoryTable::new()));
    }
    log::info!("Results: {}", path.display());
    let table = table::open(config.backend, path)
        .with_context(|| format!("Failed to open results table {}", path.display()))?;
    Ok(Arc::from(table))
}

fn audio_sink(config: &AppConfig) -> Box<dyn AudioSink> {
    match CommandSink::from_argv(&config.player) {
        Some(sink) => Box::new(sink),
        None => Box::new(NullSink),
    }
}

/// Print `label` and read one line. `None` at end of input.
fn prompt(input: &mut impl BufRead, out: &mut impl Write, label: &str) -> Result<Option<String>> {
    write!(out, "{label}")?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn report(err: &SessionError, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Error: {err}")?;
    if let Some(hint) = err.hint() {
        writeln!(out, "  {hint}")?;
    }
    Ok(())
}

/// Participant loop: one command per line, state rendered after each.
fn run_session(
    experiment: &Experiment,
    mut state: SessionState,
    seed: Option<u64>,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> Result<()> {
    render(&state.view(), out)?;

    loop {
        let Some(line) = prompt(input, out, "> ")? else {
            break;
        };
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            continue;
        };

        match word {
            "q" | "quit" => break,
            "h" | "help" => print_help(out)?,
            "reset" => match experiment.reset(&state, seed) {
                Ok(fresh) => state = fresh,
                Err(e) if e.is_fatal() => {
                    report(&e, out)?;
                    anyhow::bail!("Session ended");
                }
                Err(e) => report(&e, out)?,
            },
            _ => match parse_command(word, words, &state) {
                Ok(command) => match experiment.apply(&mut state, command) {
                    Ok(outcome) => describe(&outcome, out)?,
                    Err(e) => report(&e, out)?,
                },
                Err(msg) => writeln!(out, "{msg}")?,
            },
        }

        if state.is_finished() {
            writeln!(out, "All trials complete. Thank you!")?;
            break;
        }
        render(&state.view(), out)?;
    }
    Ok(())
}

fn parse_command<'a>(
    word: &str,
    mut args: impl Iterator<Item = &'a str>,
    state: &SessionState,
) -> std::result::Result<Command, String> {
    let phase = state.gate().active();
    match word {
        "p" | "play" => phase.map(Command::Play).ok_or_else(|| "Nothing to play.".to_string()),
        "r" | "rate" => {
            let phase = phase.ok_or_else(|| "Nothing to rate.".to_string())?;
            let mut values = [0u8; 3];
            for v in values.iter_mut() {
                *v = args
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| "Usage: r <valence> <arousal> <diff> (each 1-5)".to_string())?;
            }
            let rating = Rating::new(values[0], values[1], values[2]).map_err(|e| e.to_string())?;
            Ok(Command::ConfirmRating(phase, rating))
        }
        other => Err(format!("Unknown command '{other}'. Type 'help' for commands.")),
    }
}

fn render(view: &View, out: &mut impl Write) -> Result<()> {
    writeln!(out)?;
    let Some(label) = &view.trial_label else {
        return Ok(());
    };
    writeln!(out, "Trial {}/{}  [{}]", view.position + 1, view.total, label)?;
    if let Some(phase) = view.phase {
        writeln!(out, "  Phase: {}  ({})", phase, view.stimuli.join(", "))?;
        if view.can_rate {
            writeln!(out, "  Played {}x. Rate with: r <valence> <arousal> <diff>", view.play_count)?;
        } else {
            writeln!(out, "  Press p to play before rating.")?;
        }
    }
    Ok(())
}

fn describe(outcome: &Outcome, out: &mut impl Write) -> Result<()> {
    match outcome {
        Outcome::Played { play_count, stimuli, .. } => {
            writeln!(out, "Played {} (x{})", stimuli.join(" then "), play_count)?
        }
        Outcome::PhaseConfirmed { next } => writeln!(out, "Saved. Next: {next} phase.")?,
        Outcome::TrialRecorded { position, .. } => writeln!(out, "Trial {position} saved.")?,
        Outcome::Advanced { position, .. } => writeln!(out, "Moved to trial {}.", position + 1)?,
    }
    Ok(())
}

fn print_help(out: &mut impl Write) -> Result<()> {
    writeln!(out, "p              play the current stimuli")?;
    writeln!(out, "r <v> <a> <d>  confirm valence, arousal and difference (1-5)")?;
    writeln!(out, "reset          start over with a new order")?;
    writeln!(out, "q              quit (unsaved trial is discarded)")?;
    Ok(())
}

/// Admin loop: count, export, two-step clear.
fn admin_shell(admin: &mut AdminSession, input: &mut impl BufRead, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Admin mode. Commands: count, export [PATH], clear, cancel, quit")?;
    loop {
        let Some(line) = prompt(input, out, "admin> ")? else {
            break;
        };
        let mut words = line.split_whitespace();
        match words.next() {
            None => continue,
            Some("q" | "quit" | "logout") => break,
            Some("count") => match admin.row_count() {
                Ok(n) => writeln!(out, "{n} records")?,
                Err(e) => writeln!(out, "Error: {e}")?,
            },
            Some("export") => match (admin.export(), words.next()) {
                (Ok(csv), Some(path)) => match std::fs::write(path, csv) {
                    Ok(()) => writeln!(out, "Wrote {path}")?,
                    Err(e) => writeln!(out, "Error writing {path}: {e}")?,
                },
                (Ok(csv), None) => write!(out, "{csv}")?,
                (Err(e), _) => writeln!(out, "Error: {e}")?,
            },
            Some("clear") => match admin.request_clear() {
                Ok(ClearStatus::Armed) => {
                    writeln!(out, "This deletes ALL results. Type 'clear' again to confirm.")?
                }
                Ok(ClearStatus::Cleared) => writeln!(out, "All results cleared (header kept).")?,
                Err(e) => {
                    writeln!(out, "Error clearing results: {e}")?;
                    writeln!(out, "  The results file may not be writable.")?;
                }
            },
            Some("cancel") => {
                admin.cancel_clear();
                writeln!(out, "Clear cancelled.")?;
            }
            Some(other) => writeln!(out, "Unknown command '{other}'")?,
        }
    }
    Ok(())
}
