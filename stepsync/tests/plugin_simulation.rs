//! Deterministic plugin tests on a manual clock.
//!
//! The plugin runs against a scripted in-memory channel and a timing-wheel
//! ticker driven by [`ManualClock`], so every timing edge (including a reply
//! that becomes ready exactly when the budget runs out) is reproducible.
//!
//! ```bash
//! RUST_LOG=stepsync=debug cargo test --features tracing --test plugin_simulation -- --nocapture
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Once;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stepsync::channel::ScriptedConnector;
use stepsync::protocol::{Reply, Request};
use stepsync::runtime::timing::{Duration, ManualClock, Millis, WheelTicker};
use stepsync::{
    AppOptions, Collaborators, HandshakeError, Phase, ServicePlugin, SharedOptions, StepDriver,
    StepOptions, StepOutcome,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        stepsync::init_tracing();
    });
}

const ADDR: &str = "tcp://127.0.0.1:9999";
const TICK_MS: u64 = 100;

#[derive(Default)]
struct Recorder {
    outcomes: RefCell<Vec<StepOutcome>>,
}

impl StepDriver for Recorder {
    fn step_complete(&self, outcome: StepOutcome) {
        self.outcomes.borrow_mut().push(outcome);
    }
}

struct Sim {
    script: ScriptedConnector,
    ack: Rc<Cell<bool>>,
    clock: Rc<ManualClock>,
    ticker: Rc<WheelTicker<Rc<ManualClock>>>,
    options: Rc<SharedOptions>,
    recorder: Rc<Recorder>,
    plugin: ServicePlugin<ScriptedConnector>,
}

impl Sim {
    fn new() -> Self {
        init_test_tracing();
        let script = ScriptedConnector::new();
        let ack = Rc::new(Cell::new(true));
        {
            let ack = Rc::clone(&ack);
            script.respond_with(move |request| match request {
                Request::Start if ack.get() => Some(Reply::Started),
                _ => None,
            });
        }
        let clock = Rc::new(ManualClock::new());
        let ticker = Rc::new(WheelTicker::new(Rc::clone(&clock)));
        let options = Rc::new(SharedOptions::new(
            AppOptions {
                service_address: ADDR.into(),
            },
            StepOptions {
                service_enabled: true,
                timeout_sec: 1.0,
            },
        ));
        let recorder = Rc::new(Recorder::default());
        let plugin = ServicePlugin::new(
            "sim",
            script.clone(),
            Collaborators {
                ticker: ticker.clone(),
                clock: clock.clone(),
                driver: recorder.clone(),
                options: options.clone(),
            },
        );
        plugin.on_plugin_enable().expect("scripted channel opens");
        Self {
            script,
            ack,
            clock,
            ticker,
            options,
            recorder,
            plugin,
        }
    }

    fn set_step(&self, enabled: bool, timeout_ms: u64) {
        self.options.set_step(StepOptions {
            service_enabled: enabled,
            timeout_sec: timeout_ms as f64 / 1000.0,
        });
    }

    /// Advances the clock one millisecond at a time, turning the ticker after each.
    fn advance(&self, ms: u64) {
        for _ in 0..ms {
            self.step_ms();
        }
    }

    fn step_ms(&self) {
        self.clock.advance(Duration::<Millis>::from_millis(1));
        self.ticker.turn();
    }

    fn reports(&self) -> usize {
        self.recorder.outcomes.borrow().len()
    }

    fn last(&self) -> Option<bool> {
        self.recorder
            .outcomes
            .borrow()
            .last()
            .map(StepOutcome::is_success)
    }
}

#[test]
fn disabled_step_succeeds_without_network() {
    let sim = Sim::new();
    sim.set_step(false, 5000);
    let connects = sim.script.connects();

    sim.plugin.run_step();
    assert_eq!(sim.last(), Some(true));
    assert_eq!(sim.script.connects(), connects);
    assert!(sim.script.sent().is_empty());
    assert_eq!(sim.ticker.pending(), 0);
}

#[test]
fn enabled_step_without_address_fails_without_network() {
    let sim = Sim::new();
    sim.options.set_address("");
    sim.plugin.on_app_options_changed("sim").unwrap();
    assert!(!sim.plugin.has_channel());
    let connects = sim.script.connects();

    sim.plugin.run_step();
    let outcomes = sim.recorder.outcomes.borrow();
    assert!(matches!(
        outcomes.as_slice(),
        [StepOutcome::Failure(HandshakeError::ChannelAbsent)]
    ));
    assert_eq!(sim.script.connects(), connects);
    assert!(sim.script.sent().is_empty());
}

#[test]
fn unacknowledged_start_fails_and_closes() {
    let sim = Sim::new();
    sim.ack.set(false);
    sim.plugin.run_step();
    assert_eq!(sim.last(), Some(false));
    assert!(!sim.plugin.has_channel());
    assert_eq!(sim.plugin.phase(), Phase::Failed);
    assert_eq!(sim.ticker.pending(), 0);
}

#[test]
fn budget_is_measured_from_the_acknowledgment() {
    let sim = Sim::new();
    sim.set_step(true, 250);
    sim.advance(1000);
    sim.plugin.run_step();

    // Ticks at +100 and +200 are inside the budget, +300 is past it.
    sim.advance(299);
    assert_eq!(sim.reports(), 0);
    sim.advance(1);
    assert_eq!(sim.last(), Some(false));
    assert!(!sim.plugin.has_channel());
}

#[test]
fn options_changed_mid_session_do_not_affect_it() {
    let sim = Sim::new();
    sim.set_step(true, 200);
    sim.plugin.run_step();
    sim.set_step(true, 60_000);
    sim.advance(200);
    assert_eq!(sim.last(), Some(false));
}

#[test]
fn unexpected_completion_reply_is_reported() {
    let sim = Sim::new();
    sim.plugin.run_step();
    sim.script.push_reply(Reply::Other("half-done".into()));
    sim.advance(TICK_MS);
    let outcomes = sim.recorder.outcomes.borrow();
    match outcomes.as_slice() {
        [StepOutcome::Failure(HandshakeError::UnexpectedReply(payload))] => {
            assert_eq!(payload, "half-done");
        }
        other => panic!("unexpected outcomes {other:?}"),
    }
}

#[test]
fn address_change_abandons_session() {
    let sim = Sim::new();
    sim.plugin.run_step();
    sim.advance(150);
    sim.options.set_address("tcp://127.0.0.1:10000");
    sim.plugin.on_app_options_changed("sim").unwrap();
    assert_eq!(sim.ticker.pending(), 0);
    assert!(sim.plugin.has_channel());

    sim.script.push_reply(Reply::Completed);
    sim.advance(2000);
    assert_eq!(sim.reports(), 0);
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    NoAck,
    Reply { kind: u8, at_ms: u64 },
    Silent,
    Abandon { at_ms: u64 },
}

fn first_tick_at_or_after(ms: u64) -> u64 {
    ms.div_ceil(TICK_MS).max(1)
}

#[test]
fn every_session_reports_exactly_once() {
    let sim = Sim::new();
    let mut rng = StdRng::seed_from_u64(0x5eed_57e9);
    let mut expected_reports = 0;

    for session in 0..1000 {
        // Half the budgets land on a tick so reply and timeout can coincide.
        let timeout_ms: u64 = if rng.random_bool(0.5) {
            rng.random_range(0..=6) * TICK_MS
        } else {
            rng.random_range(0..=600)
        };
        sim.set_step(true, timeout_ms);

        let scenario = match rng.random_range(0..10) {
            0 => Scenario::NoAck,
            1 => Scenario::Silent,
            2 => Scenario::Abandon {
                at_ms: rng.random_range(1..=timeout_ms.max(1)),
            },
            3 | 4 => Scenario::Reply {
                kind: rng.random_range(0..3),
                at_ms: timeout_ms.max(1),
            },
            _ => Scenario::Reply {
                kind: rng.random_range(0..3),
                at_ms: rng.random_range(1..=timeout_ms + 300),
            },
        };
        sim.ack.set(!matches!(scenario, Scenario::NoAck));

        let before = sim.reports();
        sim.plugin.run_step();

        let budget_tick = first_tick_at_or_after(timeout_ms);
        let horizon = (budget_tick + 4) * TICK_MS;
        for t in 1..=horizon {
            sim.clock.advance(Duration::<Millis>::from_millis(1));
            match scenario {
                Scenario::Reply { kind, at_ms } if at_ms == t => {
                    sim.script.push_reply(match kind {
                        0 => Reply::Completed,
                        1 => Reply::Error,
                        _ => Reply::Other("garbage".into()),
                    });
                }
                Scenario::Abandon { at_ms } if at_ms == t => {
                    sim.plugin.on_plugin_disable();
                    sim.plugin.on_plugin_enable().unwrap();
                }
                _ => {}
            }
            sim.ticker.turn();
        }

        let reported = sim.reports() - before;
        if let Scenario::Abandon { .. } = scenario {
            // Abandonment always precedes the budget tick.
            assert_eq!(reported, 0, "session {session}: abandoned session reported");
        } else {
            assert_eq!(reported, 1, "session {session} {scenario:?}: {reported} reports");
            expected_reports += 1;
        }
        assert_eq!(sim.ticker.pending(), 0, "session {session}: tick left behind");

        if let Scenario::Reply { kind, at_ms } = scenario {
            // A reply that is ready when the budget tick fires still counts.
            let reply_wins = first_tick_at_or_after(at_ms) <= budget_tick;
            let success = kind == 0 && reply_wins;
            assert_eq!(
                sim.last(),
                Some(success),
                "session {session}: timeout {timeout_ms}ms, {scenario:?}"
            );
        }

        if !sim.plugin.has_channel() {
            sim.plugin.on_plugin_enable().unwrap();
        }
    }

    assert_eq!(sim.reports(), expected_reports);
}
