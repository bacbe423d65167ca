//! Protospect command-line driver.
//!
//! Wires capture sources into the core engine, runs the event loop, and
//! handles everything deliberately kept out of the core: protocol-name
//! interning, the signature database, verdict printing, and statistics
//! output.
//!
//! Typical usage:
//! - learn from labeled captures and store the signatures:
//!   `protospect --learn dns:dns.pcap --learn ssh:ssh.pcap --signdb sig.db`
//! - classify a capture against a stored database:
//!   `protospect --signdb sig.db traffic.pcap`
//!
//! Exit codes: 0 on success, 2 for usage or startup errors, 3 when a
//! detection source fails to start, 4 when no signatures are available.

mod labels;
mod samplefile;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use protospect_core::{
    Action, Config, Core, Engine, Event, EventKind, Label, SourceSpec, VerdictConfig,
    VerdictPolicy,
};
use tracing_subscriber::EnvFilter;

use labels::LabelMap;

#[derive(Parser, Debug)]
#[command(name = "protospect")]
#[command(
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (commit ",
        env!("PROTOSPECT_BUILD_COMMIT"),
        ", built ",
        env!("PROTOSPECT_BUILD_DATE"),
        ")"
    )
)]
#[command(
    about = "Statistical application-protocol classifier for TCP/UDP traffic.",
    long_about = None,
    after_help = "Examples:\n  protospect --learn dns:dumps/dns.pcap --signdb sig.db\n  protospect --signdb sig.db \"eth0 udp\"\n  protospect --testdb tests.db --signdb sig.db --stats"
)]
struct Cli {
    /// Detection sources: capture file path or interface name, optionally
    /// followed by a space-separated capture filter
    #[arg(value_name = "SOURCE")]
    sources: Vec<String>,

    /// Training source as PROTO:SPEC (may repeat)
    #[arg(long = "learn", value_name = "PROTO:SPEC")]
    learn: Vec<String>,

    /// File with one "PROTO SPEC" training source per line
    #[arg(long = "learndb", value_name = "FILE")]
    learndb: Option<PathBuf>,

    /// Testing source as PROTO:SPEC; classifications feed the confusion
    /// statistics instead of the model (may repeat)
    #[arg(long = "test", value_name = "PROTO:SPEC")]
    test: Vec<String>,

    /// File with one "PROTO SPEC" testing source per line
    #[arg(long = "testdb", value_name = "FILE")]
    testdb: Option<PathBuf>,

    /// Signature database: loaded before the run, rewritten after it
    #[arg(long = "signdb", value_name = "FILE")]
    signdb: Option<PathBuf>,

    /// Standard KISS signatures (drop the size/delay/jitter/proto features)
    #[arg(long = "kiss-std")]
    kiss_std: bool,

    /// Verdict is the latest classification (default)
    #[arg(long = "verdict-simple", group = "verdict")]
    verdict_simple: bool,

    /// Verdict keeps the most confident classification
    #[arg(long = "verdict-best", group = "verdict")]
    verdict_best: bool,

    /// EWMA verdict smoothing with history length N
    #[arg(long = "verdict-ewma-len", value_name = "N", group = "verdict")]
    verdict_ewma_len: Option<u32>,

    /// Verdicts below this confidence (percent) become "unknown"
    #[arg(long = "verdict-threshold", value_name = "PERCENT")]
    verdict_threshold: Option<f64>,

    /// Print run statistics as JSON when finished
    #[arg(long)]
    stats: bool,

    /// Print the probability vector of every classification
    #[arg(long = "print-probs")]
    print_probs: bool,

    /// Debug level (0 = warnings only, 3 = full trace)
    #[arg(long, value_name = "N")]
    debug: Option<u8>,

    /// Informational output
    #[arg(long, short)]
    verbose: bool,

    /// Override the training batch delay (tests only).
    #[arg(long = "training-delay-ms", value_name = "MS", hide = true)]
    training_delay_ms: Option<u64>,
}

struct CliError {
    code: u8,
    message: String,
}

impl CliError {
    fn usage(message: impl Into<String>) -> Self {
        CliError {
            code: 2,
            message: message.into(),
        }
    }

    fn detection_source(message: impl Into<String>) -> Self {
        CliError {
            code: 3,
            message: message.into(),
        }
    }

    fn no_signatures() -> Self {
        CliError {
            code: 4,
            message: "no signatures available: add --learn/--learndb sources or a --signdb file"
                .to_string(),
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::usage(format!("{err:#}"))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err.message);
            ExitCode::from(err.code)
        }
    }
}

fn init_tracing(cli: &Cli) {
    let level = match cli.debug {
        Some(0) | None if !cli.verbose => "warn",
        Some(0) | None => "info",
        Some(1) => "info",
        Some(2) => "debug",
        Some(_) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    if cli.sources.is_empty()
        && cli.learn.is_empty()
        && cli.learndb.is_none()
        && cli.test.is_empty()
        && cli.testdb.is_none()
        && cli.signdb.is_none()
    {
        return Err(CliError::usage(
            "nothing to do: give at least one traffic source or a --signdb file",
        ));
    }

    let config = build_config(&cli);
    let mut engine = Engine::new(config);
    let mut labels = LabelMap::new();

    // training and testing sources; failures here are startup errors
    for spec in &cli.learn {
        let (label, spec) = split_labeled_spec(spec, &mut labels)?;
        add_source(&mut engine, spec, label, false)
            .map_err(|e| CliError::usage(format!("training source {spec:?}: {e}")))?;
    }
    if let Some(path) = &cli.learndb {
        for (label, spec) in read_source_db(path, &mut labels)? {
            add_source(&mut engine, &spec, label, false)
                .map_err(|e| CliError::usage(format!("training source {spec:?}: {e}")))?;
        }
    }
    for spec in &cli.test {
        let (label, spec) = split_labeled_spec(spec, &mut labels)?;
        add_source(&mut engine, spec, label, true)
            .map_err(|e| CliError::usage(format!("testing source {spec:?}: {e}")))?;
    }
    if let Some(path) = &cli.testdb {
        for (label, spec) in read_source_db(path, &mut labels)? {
            add_source(&mut engine, &spec, label, true)
                .map_err(|e| CliError::usage(format!("testing source {spec:?}: {e}")))?;
        }
    }

    // detection sources have their own exit code on failure
    for spec in &cli.sources {
        add_source(&mut engine, spec, 0, false)
            .map_err(|e| CliError::detection_source(format!("detection source {spec:?}: {e}")))?;
    }

    // preload the signature database into the staging queue and commit
    if let Some(path) = &cli.signdb {
        if path.exists() {
            let samples = samplefile::read(path, &mut labels)?;
            let core = engine.core_mut();
            for sign in samples {
                core.train_enqueue(sign);
            }
            core.train_commit();
        }
    }

    let has_training = engine
        .core()
        .sources
        .iter()
        .any(|s| s.label != 0 && !s.testing)
        || engine.core().classifier.training_len() > 0;
    let needs_model = !cli.sources.is_empty()
        || engine.core().sources.iter().any(|s| s.testing);
    if needs_model && !has_training {
        return Err(CliError::no_signatures());
    }

    let labels = Rc::new(labels);
    install_output_handlers(&mut engine, &labels, cli.print_probs);
    engine.subscribe(
        EventKind::Finished,
        false,
        Box::new(|core: &mut Core, _event: &Event| {
            core.stop();
            Action::Continue
        }),
    );

    engine.run();

    if cli.stats {
        let report = engine.core().report();
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::usage(format!("statistics serialization failed: {e}")))?;
        println!("{json}");
    }

    if let Some(path) = &cli.signdb {
        let written = samplefile::write(path, engine.core().classifier.training_set(), &labels)?;
        if cli.verbose {
            eprintln!("{}: wrote {written} signatures", path.display());
        }
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Config {
    let policy = if cli.verdict_best {
        VerdictPolicy::Best
    } else if cli.verdict_ewma_len.is_some() {
        VerdictPolicy::Ewma
    } else {
        VerdictPolicy::Simple
    };
    let defaults = VerdictConfig::default();
    let verdict = VerdictConfig {
        policy,
        ewma_len: cli.verdict_ewma_len.unwrap_or(defaults.ewma_len),
        threshold: cli
            .verdict_threshold
            .map(|pct| pct / 100.0)
            .unwrap_or(defaults.threshold),
    };

    let mut config = Config {
        kiss_std: cli.kiss_std,
        verdict,
        ..Config::default()
    };
    if let Some(delay) = cli.training_delay_ms {
        config.training_delay_ms = delay;
    }
    config
}

/// Splits `PROTO:SPEC` and interns the protocol name.
fn split_labeled_spec<'a>(
    spec: &'a str,
    labels: &mut LabelMap,
) -> Result<(Label, &'a str), CliError> {
    let Some((proto, rest)) = spec.split_once(':') else {
        return Err(CliError::usage(format!(
            "expected PROTO:SPEC, got {spec:?}"
        )));
    };
    if proto.is_empty() || rest.is_empty() {
        return Err(CliError::usage(format!(
            "expected PROTO:SPEC, got {spec:?}"
        )));
    }
    let label = labels.intern(proto)?;
    Ok((label, rest))
}

/// Reads a learndb/testdb file: one `PROTO SPEC` per line, `#` comments.
fn read_source_db(path: &Path, labels: &mut LabelMap) -> Result<Vec<(Label, String)>, CliError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CliError::usage(format!("failed to read {}: {e}", path.display())))?;

    let mut entries = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((proto, spec)) = line.split_once(char::is_whitespace) else {
            return Err(CliError::usage(format!(
                "{}:{}: expected \"PROTO SPEC\"",
                path.display(),
                lineno + 1
            )));
        };
        let label = labels.intern(proto)?;
        entries.push((label, spec.trim().to_string()));
    }
    Ok(entries)
}

fn add_source(
    engine: &mut Engine,
    spec_str: &str,
    label: Label,
    testing: bool,
) -> Result<(), protospect_core::SourceError> {
    let spec = SourceSpec::parse(spec_str);
    engine.add_spec_source(&spec, label, testing).map(|_| ())
}

fn install_output_handlers(engine: &mut Engine, labels: &Rc<LabelMap>, print_probs: bool) {
    let names = Rc::clone(labels);
    engine.subscribe_after(
        EventKind::EndpointVerdictChanged,
        false,
        Box::new(move |core: &mut Core, event: &Event| {
            if let Event::EndpointVerdictChanged(key) = event {
                if let Some(ep) = core.endpoints.get(key) {
                    println!(
                        "{} verdict {} (confidence {:.3})",
                        key.addr,
                        names.display(ep.verdict),
                        ep.verdict_prob
                    );
                }
            }
            Action::Continue
        }),
    );

    if print_probs {
        let names = Rc::clone(labels);
        engine.subscribe_after(
            EventKind::EndpointClassification,
            false,
            Box::new(move |_core: &mut Core, event: &Event| {
                if let Event::EndpointClassification(result) = event {
                    let mut parts = Vec::new();
                    for (label, &p) in result.probs.iter().enumerate() {
                        if p > 0.0 {
                            parts.push(format!("{}={:.3}", names.display(label as Label), p));
                        }
                    }
                    println!("{} probs: {}", result.ep.addr, parts.join(" "));
                }
                Action::Continue
            }),
        );
    }
}
