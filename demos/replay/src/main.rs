//! Replay a switch recording against a machine configuration
//!
//! The machine runs in virtual time, so the printed trace only depends on the
//! configuration, the recording and the `--follow` rules.
//!
//! ```text
//! plunger-replay --config demos/replay/config.ron --recording demos/replay/sample.rec \
//!     --follow lFlipper=lFlipperBtn --follow rFlipper=rFlipperBtn --format text
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use plunger_core::{
    Machine, MachineConfig, NodeSpec, OutputBindings, OutputKey, Runtime, ScriptedTransport,
    SwitchId, Value,
};
use plunger_journal::{ExportFormat, OutputTrace, Recording, Replayer, TraceExporter, UnknownSwitch};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "plunger-replay", version, about = "Replay a switch recording and print the resolved output trace")]
struct Args {
    /// Machine configuration (RON)
    #[arg(short, long)]
    config: PathBuf,

    /// Switch recording (`<ms> <switch> <0|1>` per line)
    #[arg(short, long)]
    recording: PathBuf,

    /// Output follows a switch while the game node is running: `output=switch`
    #[arg(long = "follow", value_name = "OUTPUT=SWITCH")]
    follow: Vec<String>,

    /// Export format: ron, json, csv or text
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Keep running this long after the last transition (ms)
    #[arg(long, default_value_t = 1000)]
    tail: u64,

    /// Skip transitions for switches the configuration does not declare
    #[arg(long)]
    skip_unknown: bool,

    /// Also list every device call after the trace
    #[arg(long)]
    calls: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = MachineConfig::load(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let recording = Recording::load(&args.recording)
        .with_context(|| format!("loading recording {}", args.recording.display()))?;
    let format: ExportFormat = args.format.parse()?;
    let rules = parse_follow_rules(&args.follow)?;
    info!(
        switches = config.switches.len(),
        actuators = config.actuators.len(),
        transitions = recording.len(),
        "replay starting"
    );

    let transport = ScriptedTransport::new();
    let mut runtime = Runtime::virtual_time(config, transport.clone());
    runtime.with(|m| install_game(m, &rules));

    let trace = OutputTrace::attach(&mut runtime);
    let policy = if args.skip_unknown {
        UnknownSwitch::Skip
    } else {
        UnknownSwitch::Fail
    };
    let summary = Replayer::new(&recording)
        .on_unknown_switch(policy)
        .with_tail(args.tail)
        .run(&mut runtime)?;
    let trace = trace.finish(&mut runtime);
    runtime.shutdown();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    TraceExporter::new(&trace)
        .with_recording(&recording)
        .export_to(&mut out, format)?;
    if args.calls {
        writeln!(out)?;
        for call in transport.calls() {
            writeln!(out, "{:>8} {} {:?}", call.at, call.key, call.command)?;
        }
    }

    info!(
        applied = summary.applied,
        skipped = summary.skipped,
        changes = trace.len(),
        end = summary.end_time,
        "replay done"
    );
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();
}

fn parse_follow_rules(raw: &[String]) -> Result<Vec<(OutputKey, SwitchId)>> {
    raw.iter()
        .map(|rule| match rule.split_once('=') {
            Some((output, switch)) if !output.is_empty() && !switch.is_empty() => {
                Ok((OutputKey::new(output), SwitchId::new(switch)))
            }
            _ => bail!("bad follow rule `{}`, expected OUTPUT=SWITCH", rule),
        })
        .collect()
}

/// One "game" node under the root; every rule binds an output to a switch state
fn install_game(m: &mut Machine, rules: &[(OutputKey, SwitchId)]) {
    let root = m.root();
    let game = m.create_node(NodeSpec::named("game").exclusive(1));
    let bindings = rules.iter().fold(OutputBindings::new(), |bindings, (output, switch)| {
        debug!(%output, %switch, "follow rule");
        let switch = switch.clone();
        bindings.computed(output.clone(), move |s| Ok(Some(Value::Bool(s.closed(&switch)))))
    });
    m.bind_outputs(game, bindings);
    m.attach(root, game, 0);
}
