//! Host-facing plugin: lifecycle hooks around the handshake.
//!
//! The host drives a [`ServicePlugin`] through four hooks. `run_step` never
//! returns an outcome; it is delivered later, exactly once, through
//! [`StepDriver::step_complete`]. Completion polling runs on the injected
//! [`Ticker`], so the thread that calls `run_step` is only held for the
//! start acknowledgment.
//!
//! Any hook that resets the channel (enable, disable, an address change, or a
//! new step) abandons the session in flight: its tick is cancelled and no
//! outcome is reported for it.
//!
//! Everything here is single-threaded. Collaborators are shared through `Rc`
//! and the plugin may be re-entered from `step_complete`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::channel::{ChannelError, ChannelManager, Connector};
use crate::config::{EndpointConfig, OptionsProvider, POLL_INTERVAL};
use crate::handshake::{Phase, Progress, Session, StepOutcome};
use crate::runtime::timing::{Clock, TickHandle, Ticker};
use crate::trace::{debug, info, warn};

/// Name used when the host does not pick one.
pub const DEFAULT_PLUGIN_NAME: &str = "stepsync.service_plugin";

/// The host's step sequencer.
pub trait StepDriver {
    /// Receives the terminal outcome of the step started by `run_step`.
    fn step_complete(&self, outcome: StepOutcome);
}

impl<F: Fn(StepOutcome)> StepDriver for F {
    fn step_complete(&self, outcome: StepOutcome) {
        self(outcome);
    }
}

/// Everything the plugin consults but does not own.
pub struct Collaborators {
    pub ticker: Rc<dyn Ticker>,
    pub clock: Rc<dyn Clock>,
    pub driver: Rc<dyn StepDriver>,
    pub options: Rc<dyn OptionsProvider>,
}

struct Active {
    id: u64,
    session: Session,
    tick: Option<TickHandle>,
}

struct State {
    active: Option<Active>,
    last_phase: Phase,
    next_id: u64,
}

struct Shared<K: Connector> {
    name: String,
    channels: RefCell<ChannelManager<K>>,
    state: RefCell<State>,
    ticker: Rc<dyn Ticker>,
    clock: Rc<dyn Clock>,
    driver: Rc<dyn StepDriver>,
    options: Rc<dyn OptionsProvider>,
}

/// Synchronizes protocol steps with an external service.
///
/// Cloning yields another handle to the same plugin.
pub struct ServicePlugin<K: Connector> {
    shared: Rc<Shared<K>>,
}

impl<K: Connector> Clone for ServicePlugin<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

/// Non-owning handle, for drivers that need to start the next step.
pub struct WeakServicePlugin<K: Connector> {
    shared: Weak<Shared<K>>,
}

impl<K: Connector> Clone for WeakServicePlugin<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<K: Connector> WeakServicePlugin<K> {
    #[must_use]
    pub fn upgrade(&self) -> Option<ServicePlugin<K>> {
        self.shared.upgrade().map(|shared| ServicePlugin { shared })
    }
}

impl<K> ServicePlugin<K>
where
    K: Connector + 'static,
    K::Channel: 'static,
{
    /// Creates a plugin with no channel open. Call
    /// [`on_plugin_enable`](Self::on_plugin_enable) to connect.
    pub fn new(name: impl Into<String>, connector: K, collaborators: Collaborators) -> Self {
        let Collaborators {
            ticker,
            clock,
            driver,
            options,
        } = collaborators;
        Self {
            shared: Rc::new(Shared {
                name: name.into(),
                channels: RefCell::new(ChannelManager::new(connector)),
                state: RefCell::new(State {
                    active: None,
                    last_phase: Phase::Idle,
                    next_id: 0,
                }),
                ticker,
                clock,
                driver,
                options,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Phase of the session in flight, or of the last one.
    #[must_use]
    pub fn phase(&self) -> Phase {
        let state = self.shared.state.borrow();
        state
            .active
            .as_ref()
            .map_or(state.last_phase, |active| active.session.phase())
    }

    /// Whether a channel is open.
    #[must_use]
    pub fn has_channel(&self) -> bool {
        self.shared.channels.borrow().is_open()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakServicePlugin<K> {
        WeakServicePlugin {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Opens the channel to the configured address.
    ///
    /// # Errors
    ///
    /// Returns the [`ChannelError`] if the address is invalid or the channel
    /// cannot be created; no channel is left open in that case.
    pub fn on_plugin_enable(&self) -> Result<(), ChannelError> {
        info!(plugin = %self.shared.name, "plugin enabled");
        self.shared.reset_channel()
    }

    /// Abandons any session in flight and closes the channel.
    pub fn on_plugin_disable(&self) {
        info!(plugin = %self.shared.name, "plugin disabled");
        self.shared.abandon();
        self.shared.channels.borrow_mut().close_all();
    }

    /// Re-opens the channel when this plugin's options changed.
    ///
    /// # Errors
    ///
    /// Same as [`on_plugin_enable`](Self::on_plugin_enable).
    pub fn on_app_options_changed(&self, plugin_name: &str) -> Result<(), ChannelError> {
        if plugin_name != self.shared.name {
            return Ok(());
        }
        debug!(plugin = %self.shared.name, "options changed");
        self.shared.reset_channel()
    }

    /// Starts the step. The outcome arrives through the driver.
    pub fn run_step(&self) {
        Shared::run_step(&self.shared);
    }
}

impl<K> Shared<K>
where
    K: Connector + 'static,
    K::Channel: 'static,
{
    fn reset_channel(&self) -> Result<(), ChannelError> {
        self.abandon();
        let app = self.options.app_options();
        self.channels.borrow_mut().reset(&app.service_address)
    }

    /// Drops the session in flight without reporting it and closes its channel.
    fn abandon(&self) {
        let active = {
            let mut state = self.state.borrow_mut();
            let active = state.active.take();
            if active.is_some() {
                state.last_phase = Phase::Idle;
            }
            active
        };
        let Some(active) = active else {
            return;
        };
        warn!(
            plugin = %self.name,
            session = active.id,
            phase = %active.session.phase(),
            "abandoning step in flight"
        );
        if let Some(tick) = active.tick {
            self.ticker.cancel_tick(tick);
        }
        // The channel still carries the abandoned session's unanswered request.
        self.channels.borrow_mut().close_all();
    }

    fn run_step(this: &Rc<Self>) {
        this.abandon();

        let id = {
            let mut state = this.state.borrow_mut();
            state.next_id += 1;
            state.next_id
        };

        let app = this.options.app_options();
        let step = this.options.step_options();
        let config = match EndpointConfig::from_options(&app, &step) {
            Ok(config) => config,
            Err(e) => return this.finish(id, Phase::Failed, StepOutcome::Failure(e.into())),
        };
        debug!(
            plugin = %this.name,
            session = id,
            enabled = config.enabled,
            address = %config.address,
            "step started"
        );

        let mut session = Session::new(&config);
        if config.enabled {
            let reset = this.channels.borrow_mut().reset(&config.address);
            if let Err(e) = reset {
                return this.finish(id, Phase::Failed, StepOutcome::Failure(e.into()));
            }
        }

        let progress = session.begin(&mut *this.channels.borrow_mut(), &this.clock);
        match progress {
            Progress::Pending => {}
            Progress::Done(outcome) => return this.finish(id, session.phase(), outcome),
            Progress::Inactive => return,
        }

        this.state.borrow_mut().active = Some(Active {
            id,
            session,
            tick: None,
        });

        let weak = Rc::downgrade(this);
        match this
            .ticker
            .schedule_tick(POLL_INTERVAL, Box::new(move || Self::on_tick(&weak, id)))
        {
            Ok(handle) => {
                if let Some(active) = this.state.borrow_mut().active.as_mut() {
                    active.tick = Some(handle);
                }
            }
            Err(e) => {
                let taken = this.take_active(id);
                if taken.is_some() {
                    this.channels.borrow_mut().close_all();
                    this.finish(id, Phase::Failed, StepOutcome::Failure(e.into()));
                }
            }
        }
    }

    fn on_tick(weak: &Weak<Self>, id: u64) -> bool {
        let Some(this) = weak.upgrade() else {
            return false;
        };
        let progress = {
            let mut state = this.state.borrow_mut();
            let Some(active) = state.active.as_mut().filter(|active| active.id == id) else {
                // Abandoned after this tick was already due.
                return false;
            };
            active.session.poll(&mut *this.channels.borrow_mut(), &this.clock)
        };
        match progress {
            Progress::Pending => true,
            Progress::Done(outcome) => {
                if let Some(active) = this.take_active(id) {
                    this.finish(id, active.session.phase(), outcome);
                }
                false
            }
            Progress::Inactive => {
                this.take_active(id);
                false
            }
        }
    }

    fn take_active(&self, id: u64) -> Option<Active> {
        let mut state = self.state.borrow_mut();
        if state.active.as_ref().is_some_and(|active| active.id == id) {
            state.active.take()
        } else {
            None
        }
    }

    /// Records the terminal phase, then reports. No borrow is held while the
    /// driver runs, so it may start the next step.
    fn finish(&self, _id: u64, phase: Phase, outcome: StepOutcome) {
        self.state.borrow_mut().last_phase = phase;
        info!(plugin = %self.name, session = _id, outcome = %outcome, "step complete");
        self.driver.step_complete(outcome);
    }
}

impl<K: Connector> Drop for Shared<K> {
    fn drop(&mut self) {
        if let Some(tick) = self.state.get_mut().active.take().and_then(|a| a.tick) {
            self.ticker.cancel_tick(tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use super::*;
    use crate::channel::ScriptedConnector;
    use crate::handshake::HandshakeError;
    use crate::config::{AppOptions, SharedOptions, StepOptions};
    use crate::protocol::{Reply, Request};
    use crate::runtime::timing::{self, ManualClock, Millis, WheelTicker};

    const ADDR: &str = "tcp://127.0.0.1:9999";

    #[derive(Default)]
    struct Recorder {
        outcomes: RefCell<Vec<StepOutcome>>,
    }

    impl StepDriver for Recorder {
        fn step_complete(&self, outcome: StepOutcome) {
            self.outcomes.borrow_mut().push(outcome);
        }
    }

    struct Harness {
        script: ScriptedConnector,
        clock: Rc<ManualClock>,
        ticker: Rc<WheelTicker<Rc<ManualClock>>>,
        options: Rc<SharedOptions>,
        recorder: Rc<Recorder>,
        plugin: ServicePlugin<ScriptedConnector>,
    }

    impl Harness {
        fn new(enabled: bool, timeout_sec: f64) -> Self {
            Self::build(enabled, timeout_sec, None)
        }

        /// A harness whose ticker holds at most `capacity` ticks.
        fn with_ticker_capacity(enabled: bool, timeout_sec: f64, capacity: usize) -> Self {
            Self::build(enabled, timeout_sec, NonZeroUsize::new(capacity))
        }

        fn build(enabled: bool, timeout_sec: f64, capacity: Option<NonZeroUsize>) -> Self {
            let script = ScriptedConnector::new();
            script.respond_with(|request| match request {
                Request::Start => Some(Reply::Started),
                _ => None,
            });
            let clock = Rc::new(ManualClock::new());
            let ticker = Rc::new(match capacity {
                Some(capacity) => WheelTicker::with_capacity(Rc::clone(&clock), capacity),
                None => WheelTicker::new(Rc::clone(&clock)),
            });
            let options = Rc::new(SharedOptions::new(
                AppOptions {
                    service_address: ADDR.into(),
                },
                StepOptions {
                    service_enabled: enabled,
                    timeout_sec,
                },
            ));
            let recorder = Rc::new(Recorder::default());
            let plugin = ServicePlugin::new(
                DEFAULT_PLUGIN_NAME,
                script.clone(),
                Collaborators {
                    ticker: ticker.clone(),
                    clock: clock.clone(),
                    driver: recorder.clone(),
                    options: options.clone(),
                },
            );
            Self {
                script,
                clock,
                ticker,
                options,
                recorder,
                plugin,
            }
        }

        fn advance(&self, ms: u64) {
            for _ in 0..ms {
                self.clock.advance(timing::Duration::<Millis>::from_millis(1));
                self.ticker.turn();
            }
        }

        fn outcomes(&self) -> usize {
            self.recorder.outcomes.borrow().len()
        }

        fn last_success(&self) -> Option<bool> {
            self.recorder.outcomes.borrow().last().map(StepOutcome::is_success)
        }
    }

    #[test]
    fn enable_opens_and_disable_closes() {
        let h = Harness::new(true, 1.0);
        assert!(!h.plugin.has_channel());
        h.plugin.on_plugin_enable().unwrap();
        assert!(h.plugin.has_channel());
        h.plugin.on_plugin_disable();
        assert!(!h.plugin.has_channel());
        h.plugin.on_plugin_disable();
        assert_eq!(h.script.open_channels(), 0);
    }

    #[test]
    fn options_change_for_other_plugin_is_ignored() {
        let h = Harness::new(true, 1.0);
        h.plugin.on_plugin_enable().unwrap();
        h.options.set_address("");
        h.plugin.on_app_options_changed("someone.else").unwrap();
        assert!(h.plugin.has_channel());
        h.plugin.on_app_options_changed(DEFAULT_PLUGIN_NAME).unwrap();
        assert!(!h.plugin.has_channel());
    }

    #[test]
    fn invalid_address_reported_on_enable() {
        let h = Harness::new(true, 1.0);
        h.options.set_address("localhost:9999");
        assert!(matches!(
            h.plugin.on_plugin_enable(),
            Err(ChannelError::InvalidAddress(_))
        ));
        assert!(!h.plugin.has_channel());
    }

    #[test]
    fn disabled_step_reports_success_synchronously() {
        let h = Harness::new(false, 1.0);
        h.plugin.run_step();
        assert_eq!(h.last_success(), Some(true));
        assert_eq!(h.plugin.phase(), Phase::Completed);
        assert_eq!(h.script.connects(), 0);
        assert!(h.script.sent().is_empty());
        assert_eq!(h.ticker.pending(), 0);
    }

    #[test]
    fn step_completes_on_tick() {
        let h = Harness::new(true, 1.0);
        h.plugin.run_step();
        assert_eq!(h.plugin.phase(), Phase::AwaitingCompletion);
        assert_eq!(h.outcomes(), 0);
        assert_eq!(h.ticker.pending(), 1);

        h.advance(250);
        assert_eq!(h.outcomes(), 0);
        h.script.push_reply(Reply::Completed);
        h.advance(100);
        assert_eq!(h.last_success(), Some(true));
        assert_eq!(h.outcomes(), 1);
        assert_eq!(h.ticker.pending(), 0);
        assert_eq!(h.plugin.phase(), Phase::Completed);
    }

    #[test]
    fn timeout_reports_failure_and_closes() {
        let h = Harness::new(true, 0.3);
        h.plugin.run_step();
        h.advance(299);
        assert_eq!(h.outcomes(), 0);
        h.advance(1);
        assert_eq!(h.last_success(), Some(false));
        assert!(!h.plugin.has_channel());
        h.advance(1000);
        assert_eq!(h.outcomes(), 1);
    }

    #[test]
    fn invalid_timeout_fails_the_step() {
        let h = Harness::new(true, -1.0);
        h.plugin.run_step();
        let outcomes = h.recorder.outcomes.borrow();
        assert!(matches!(
            outcomes.as_slice(),
            [StepOutcome::Failure(HandshakeError::InvalidTimeout(_))]
        ));
    }

    #[test]
    fn new_step_abandons_the_previous_one() {
        let h = Harness::new(true, 1.0);
        h.plugin.run_step();
        h.advance(100);
        h.plugin.run_step();
        assert_eq!(h.ticker.pending(), 1);
        h.script.push_reply(Reply::Completed);
        h.advance(100);
        assert_eq!(h.outcomes(), 1, "abandoned session reports nothing");
        assert_eq!(h.script.connects(), 2);
    }

    #[test]
    fn disable_abandons_without_report() {
        let h = Harness::new(true, 1.0);
        h.plugin.run_step();
        h.plugin.on_plugin_disable();
        assert_eq!(h.plugin.phase(), Phase::Idle);
        assert_eq!(h.ticker.pending(), 0);
        h.advance(2000);
        assert_eq!(h.outcomes(), 0);
    }

    #[test]
    fn disabled_step_closes_the_abandoned_channel() {
        let h = Harness::new(true, 1.0);
        h.plugin.run_step();
        assert!(h.plugin.has_channel());

        h.options.set_step(StepOptions {
            service_enabled: false,
            timeout_sec: 1.0,
        });
        h.plugin.run_step();
        assert!(!h.plugin.has_channel());
        assert_eq!(h.script.open_channels(), 0);
        assert_eq!(h.ticker.pending(), 0);
        assert_eq!(h.outcomes(), 1);
        assert_eq!(h.last_success(), Some(true));
        assert_eq!(h.script.sent(), vec![Request::Start, Request::NotifyCompletion]);
    }

    #[test]
    fn refused_connect_fails_the_step_once() {
        let h = Harness::new(true, 1.0);
        h.script.refuse_connections(true);
        h.plugin.run_step();
        {
            let outcomes = h.recorder.outcomes.borrow();
            assert!(matches!(
                outcomes.as_slice(),
                [StepOutcome::Failure(HandshakeError::Channel(_))]
            ));
        }
        assert!(!h.plugin.has_channel());
        assert_eq!(h.plugin.phase(), Phase::Failed);
        assert_eq!(h.ticker.pending(), 0);
        h.advance(2000);
        assert_eq!(h.outcomes(), 1);
    }

    #[test]
    fn full_ticker_fails_the_step_and_closes() {
        let h = Harness::with_ticker_capacity(true, 1.0, 1);
        h.ticker
            .schedule_tick(Duration::from_secs(60), Box::new(|| true))
            .unwrap();

        h.plugin.run_step();
        {
            let outcomes = h.recorder.outcomes.borrow();
            assert!(matches!(
                outcomes.as_slice(),
                [StepOutcome::Failure(HandshakeError::Scheduler(_))]
            ));
        }
        assert!(!h.plugin.has_channel());
        assert_eq!(h.script.open_channels(), 0);
        assert_eq!(h.plugin.phase(), Phase::Failed);
        assert_eq!(h.ticker.pending(), 1);
    }

    #[test]
    fn dropping_the_plugin_cancels_its_tick() {
        let h = Harness::new(true, 1.0);
        h.plugin.run_step();
        assert_eq!(h.ticker.pending(), 1);
        let Harness { plugin, ticker, .. } = h;
        drop(plugin);
        assert_eq!(ticker.pending(), 0);
    }

    #[test]
    fn driver_can_start_the_next_step_from_the_callback() {
        let script = ScriptedConnector::new();
        script.respond_with(|request| match request {
            Request::Start => Some(Reply::Started),
            Request::NotifyCompletion => Some(Reply::Completed),
            Request::Other(_) => None,
        });
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

        let slot: Rc<RefCell<Option<WeakServicePlugin<ScriptedConnector>>>> = Rc::default();
        let completed = Rc::new(RefCell::new(0_u32));
        let driver = {
            let slot = Rc::clone(&slot);
            let completed = Rc::clone(&completed);
            move |outcome: StepOutcome| {
                assert!(outcome.is_success());
                *completed.borrow_mut() += 1;
                if *completed.borrow() < 3
                    && let Some(plugin) = slot.borrow().as_ref().and_then(WeakServicePlugin::upgrade)
                {
                    plugin.run_step();
                }
            }
        };
        let plugin = ServicePlugin::new(
            "chain",
            script.clone(),
            Collaborators {
                ticker: ticker.clone(),
                clock: clock.clone(),
                driver: Rc::new(driver),
                options,
            },
        );
        *slot.borrow_mut() = Some(plugin.downgrade());

        plugin.run_step();
        for _ in 0..1000 {
            clock.advance(timing::Duration::from_millis(1));
            ticker.turn();
        }
        assert_eq!(*completed.borrow(), 3);
        assert_eq!(script.connects(), 3);
        assert_eq!(ticker.pending(), 0);
    }
}
