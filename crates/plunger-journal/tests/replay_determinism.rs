//! Replaying a recording twice against the same configuration yields the same trace

use plunger_core::{
    on, ActuatorConfig, Flow, Machine, MachineConfig, NodeSpec, OutputBindings, OutputKey,
    Runtime, ScriptedTransport, SwitchConfig, SwitchId, Value,
};
use plunger_journal::{OutputTrace, Recording, Replayer, SwitchRecorder, Trace};

const RECORDING: &str = "\
# start a game, flip a few times, tilt
100 start 1
160 start 0
400 lFlipperBtn 1
480 lFlipperBtn 0
500 lFlipperBtn 1
520 lFlipperBtn 0
900 start 1
950 start 0
1500 tilt 1
1600 tilt 0
";

fn config() -> MachineConfig {
    MachineConfig::default()
        .with_switch(SwitchConfig::new("start", "Start Button"))
        .with_switch(SwitchConfig::new("tilt", "Tilt Bob"))
        .with_switch(SwitchConfig::new("lFlipperBtn", "Left Flipper Button"))
        .with_actuator(ActuatorConfig::plain("gi", true))
        .with_actuator(ActuatorConfig::escalating("lFlipper", 20, 40, 3, 5, 200))
        .with_actuator(ActuatorConfig::momentary("kicker", 30, 50))
        .with_output("music", "attract")
}

fn install_game(m: &mut Machine) {
    let root = m.root();
    let game = m.create_node(NodeSpec::named("game").exclusive(1));
    m.bind_outputs(
        game,
        OutputBindings::new()
            .computed("gi", |s| Ok(Some(Value::Bool(!s.closed(&"tilt".into())))))
            .computed("lFlipper", |s| {
                Ok(Some(Value::Bool(s.closed(&"lFlipperBtn".into()))))
            })
            .constant("music", "game"),
    );
    m.listen(game, on::switch_closed("start"), move |m, _| {
        let kick = m.create_node(NodeSpec::named("kickout").exclusive(2));
        m.bind_outputs(kick, OutputBindings::new().constant("kicker", true));
        m.attach(game, kick, 0);
        m.call_in_for(kick, 300, "kickout done", move |m| {
            m.end(kick);
            Ok(())
        });
        Ok(Flow::Keep)
    });
    m.attach(root, game, 0);
}

fn replay(recording: &Recording) -> (Trace, usize) {
    let transport = ScriptedTransport::new();
    let mut rt = Runtime::virtual_time(config(), transport.clone());
    rt.with(install_game);
    let trace = OutputTrace::attach(&mut rt);
    Replayer::new(recording).with_tail(500).run(&mut rt).unwrap();
    (trace.finish(&mut rt), transport.calls().len())
}

#[test]
fn replay_is_deterministic() {
    let recording = Recording::parse(RECORDING).unwrap();
    let (first, first_calls) = replay(&recording);
    let (second, second_calls) = replay(&recording);

    assert!(!first.is_empty());
    assert_eq!(first.first_divergence(&second), None);
    assert_eq!(first, second);
    assert_eq!(first_calls, second_calls);
}

#[test]
fn trace_reflects_switch_driven_outputs() {
    let recording = Recording::parse(RECORDING).unwrap();
    let (trace, _) = replay(&recording);

    let gi: Vec<_> = trace
        .for_key(&OutputKey::new("gi"))
        .map(|e| (e.at, e.value.clone()))
        .collect();
    assert_eq!(
        gi,
        vec![(1500, Some(Value::Bool(false))), (1600, Some(Value::Bool(true)))]
    );

    let kicker: Vec<_> = trace
        .for_key(&OutputKey::new("kicker"))
        .map(|e| (e.at, e.value.clone()))
        .collect();
    assert_eq!(
        kicker,
        vec![
            (100, Some(Value::Bool(true))),
            (400, Some(Value::Bool(false))),
            (900, Some(Value::Bool(true))),
            (1200, Some(Value::Bool(false))),
        ]
    );
}

#[test]
fn recorded_session_replays_identically() {
    let mut live = Runtime::virtual_time(config(), ScriptedTransport::new());
    live.with(install_game);
    let recorder = SwitchRecorder::attach(&mut live);
    let live_trace = OutputTrace::attach(&mut live);
    let start = SwitchId::new("start");
    for (at, closed) in [(250, true), (310, false), (700, true), (760, false)] {
        live.advance_to(at).unwrap();
        live.feed_switch(&start, closed).unwrap();
    }
    live.advance_to(1500).unwrap();
    let recording = recorder.finish(&mut live);
    let live_trace = live_trace.finish(&mut live);

    let mut rt = Runtime::virtual_time(config(), ScriptedTransport::new());
    rt.with(install_game);
    let trace = OutputTrace::attach(&mut rt);
    Replayer::new(&recording).run_to(&mut rt, 1500).unwrap();
    let replayed = trace.finish(&mut rt);

    assert_eq!(recording.len(), 4);
    assert_eq!(live_trace, replayed);
}
