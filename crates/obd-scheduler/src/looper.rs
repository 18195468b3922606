//! Command Looper
//!
//! Drives one adapter session: selects a connector candidate, runs its
//! initialization until it reports a connection, then runs measurement
//! cycles at the connector's preferred period. Fatal conditions stop the
//! looper and are reported through the [`ConnectionListener`]; the looper
//! never reopens the transport itself.

use crate::config::LooperConfig;
use crate::listener::{ConnectionListener, DataListener};
use crate::monitor::{LiveMonitor, SuccessClock};
use obd_connector::{default_candidates, ConnectionState, Connector, ConnectorOptions};
use obd_protocol::{CommandState, ObdError, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Builds a fresh list of connector candidates for one initialization phase
pub type CandidateFactory =
    Box<dyn Fn(&Transport, &ConnectorOptions) -> Vec<Box<dyn Connector>> + Send + Sync>;

/// Sleep unless the session ends first; `false` once cancelled
async fn pause(session: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = session.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Looper phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialization,
    CommandExecution,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Initialization => "Initialization",
            Phase::CommandExecution => "CommandExecution",
        }
    }

    fn index(&self) -> usize {
        match self {
            Phase::Initialization => 0,
            Phase::CommandExecution => 1,
        }
    }
}

/// Adapter session state machine
pub struct CommandLooper {
    transport: Transport,
    device_name: String,
    data_listener: Arc<dyn DataListener>,
    connection_listener: Arc<dyn ConnectionListener>,
    config: LooperConfig,
    factory: CandidateFactory,

    candidates: Vec<Box<dyn Connector>>,
    adapter: Option<usize>,
    attempted: usize,
    tries: u32,
    request_period: Duration,
    phase_counts: [u32; 2],
    clock: SuccessClock,
    monitor: Option<LiveMonitor>,
    session: CancellationToken,
    user_stop: Arc<AtomicBool>,
}

impl CommandLooper {
    pub fn new(
        transport: Transport,
        device_name: impl Into<String>,
        data_listener: Arc<dyn DataListener>,
        connection_listener: Arc<dyn ConnectionListener>,
        config: LooperConfig,
    ) -> Self {
        Self {
            transport,
            device_name: device_name.into(),
            data_listener,
            connection_listener,
            config,
            factory: Box::new(default_candidates),
            candidates: Vec::new(),
            adapter: None,
            attempted: 0,
            tries: 0,
            request_period: Duration::from_millis(100),
            phase_counts: [0; 2],
            clock: SuccessClock::default(),
            monitor: None,
            session: CancellationToken::new(),
            user_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the default candidate list (ELM327, AposW3, OBDLink MX, DriveDeck Sport)
    pub fn with_candidates<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Transport, &ConnectorOptions) -> Vec<Box<dyn Connector>> + Send + Sync + 'static,
    {
        self.factory = Box::new(factory);
        self
    }

    /// Spawn the looper on the tokio runtime
    pub fn start(self) -> LooperHandle {
        let session = self.session.clone();
        let user_stop = self.user_stop.clone();
        let task = tokio::spawn(self.run());
        LooperHandle {
            session,
            user_stop,
            task,
        }
    }

    async fn run(mut self) {
        info!("Command looper started for device '{}'", self.device_name);

        let mut phase = self.switch_phase(Phase::Initialization, None);
        while let Some(current) = phase {
            phase = match current {
                Phase::Initialization => self.initialization_step().await,
                Phase::CommandExecution => self.command_execution_step().await,
            };
        }

        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.shutdown_adapter();
        info!("Exiting command looper");
    }

    fn current_adapter(&self) -> Option<&dyn Connector> {
        self.adapter
            .and_then(|index| self.candidates.get(index))
            .map(|adapter| adapter.as_ref())
    }

    fn is_connected(&self) -> bool {
        self.current_adapter()
            .is_some_and(|adapter| adapter.connection_state() >= ConnectionState::Connected)
    }

    fn shutdown_adapter(&self) {
        if let Some(adapter) = self.current_adapter() {
            adapter.prepare_shutdown();
            adapter.shutdown();
        }
    }

    fn request_connection_retry(&self, reason: &ObdError) {
        if self.user_stop.load(Ordering::SeqCst) {
            return;
        }
        self.connection_listener.request_connection_retry(reason);
    }

    fn switch_phase(&mut self, phase: Phase, reason: Option<&ObdError>) -> Option<Phase> {
        match reason {
            Some(reason) => info!("Switching to phase {} / Reason: {}", phase.name(), reason),
            None => info!("Switching to phase {}", phase.name()),
        }

        let count = &mut self.phase_counts[phase.index()];
        *count += 1;
        let count = *count;
        if count >= self.config.max_phase_count {
            warn!("Too often in phase {}: {}", phase.name(), count);
            self.request_connection_retry(&ObdError::PhaseRepeated {
                phase: phase.name(),
                count,
            });
            return None;
        }

        match phase {
            Phase::Initialization => {
                self.shutdown_adapter();
                self.candidates = (self.factory)(&self.transport, &self.config.connector);
                self.adapter = None;
                self.attempted = 0;
                self.tries = 0;
            }
            Phase::CommandExecution => {
                self.connection_listener.on_connection_verified();
                self.data_listener.on_connected(&self.device_name);
                self.start_monitoring();
            }
        }
        Some(phase)
    }

    fn start_monitoring(&mut self) {
        if let Some(previous) = self.monitor.take() {
            previous.stop();
        }
        self.clock.touch();

        let adapter = self
            .current_adapter()
            .map(|adapter| adapter.shutdown_handle())
            .unwrap_or_default();
        self.monitor = Some(LiveMonitor::start(
            self.clock.clone(),
            self.config.max_no_data_time(),
            adapter,
            self.session.clone(),
            self.connection_listener.clone(),
            self.session.child_token(),
        ));
    }

    fn connection_established(&mut self) -> Option<Phase> {
        if let Some(adapter) = self.current_adapter() {
            info!(
                "OBD adapter {} verified the responses. Connection established",
                adapter.name()
            );
        }
        self.phase_counts[Phase::CommandExecution.index()] = 0;
        self.switch_phase(Phase::CommandExecution, None)
    }

    /// Pick the preferred candidate first, then move on round-robin once the
    /// current one has used up its tries
    fn select_adapter(&mut self) -> Result<(), ObdError> {
        let count = self.candidates.len();
        if count == 0 {
            return Err(ObdError::AllAdaptersFailed("no adapter candidates".to_string()));
        }

        match self.adapter {
            None => {
                let preferred = self
                    .candidates
                    .iter()
                    .position(|adapter| adapter.supports_device(&self.device_name))
                    .unwrap_or(0);
                info!(
                    "Using {} connector as the preferred adapter",
                    self.candidates[preferred].name()
                );
                self.adapter = Some(preferred);
                self.attempted = 1;
                self.tries = 0;
            }
            Some(index) => {
                self.tries += 1;
                let adapter = &self.candidates[index];
                if self.tries >= adapter.maximum_tries_for_initialization() {
                    adapter.prepare_shutdown();
                    adapter.shutdown();
                    if adapter.connection_state() >= ConnectionState::Connected {
                        // a connected adapter claims the device exclusively
                        return Err(ObdError::AllAdaptersFailed(adapter.name().to_string()));
                    }
                    if self.attempted >= count {
                        let names: Vec<&str> = self.candidates.iter().map(|c| c.name()).collect();
                        return Err(ObdError::AllAdaptersFailed(names.join(", ")));
                    }

                    self.adapter = Some((index + 1) % count);
                    self.attempted += 1;
                    self.tries = 0;
                }
            }
        }

        if let Some(adapter) = self.adapter.and_then(|index| self.candidates.get_mut(index)) {
            self.request_period = adapter.preferred_request_period();
            adapter.start_executions();
        }
        Ok(())
    }

    async fn initialization_step(&mut self) -> Option<Phase> {
        if self.session.is_cancelled() {
            return None;
        }
        if self.is_connected() {
            return self.connection_established();
        }

        if let Err(e) = self.select_adapter() {
            warn!("{}", e);
            self.connection_listener.on_all_adapters_failed();
            return None;
        }

        let session = self.session.clone();
        let adapter = self.adapter.and_then(|index| self.candidates.get_mut(index))?;
        let status = format!("Trying {}.", adapter.name());
        info!("{}", status);
        self.connection_listener.on_status_update(&status);

        let result = tokio::select! {
            _ = session.cancelled() => return None,
            result = adapter.execute_initialization_commands() => result,
        };
        match result {
            Ok(()) => {}
            Err(e @ ObdError::AdapterFailed(_)) => warn!("{}", e),
            Err(e) => {
                self.request_connection_retry(&e);
                return None;
            }
        }

        if self.is_connected() {
            return self.connection_established();
        }

        if !pause(&self.session, self.config.adapter_try_period()).await {
            return None;
        }
        Some(Phase::Initialization)
    }

    async fn command_execution_step(&mut self) -> Option<Phase> {
        if !pause(&self.session, self.request_period).await {
            return None;
        }

        let session = self.session.clone();
        let adapter = self.adapter.and_then(|index| self.candidates.get_mut(index))?;
        let result = tokio::select! {
            _ = session.cancelled() => return None,
            result = adapter.execute_request_commands() => result,
        };

        match result {
            Ok(commands) => {
                let mut forwarded = false;
                for command in commands
                    .iter()
                    .filter(|command| command.state() == CommandState::Finished)
                {
                    self.data_listener.receive_update(command);
                    forwarded = true;
                }
                if forwarded {
                    self.clock.touch();
                    self.phase_counts[Phase::Initialization.index()] = 0;
                }
                Some(Phase::CommandExecution)
            }
            Err(e @ ObdError::ConnectionLost(_)) => self.switch_phase(Phase::Initialization, Some(&e)),
            Err(ObdError::Cancelled) => None,
            Err(e) if e.is_transport() => {
                self.request_connection_retry(&e);
                None
            }
            Err(e) => {
                error!("Unexpected error during command execution: {}", e);
                Some(Phase::CommandExecution)
            }
        }
    }
}

/// Control handle for a spawned [`CommandLooper`]
#[derive(Debug)]
pub struct LooperHandle {
    session: CancellationToken,
    user_stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LooperHandle {
    /// User-requested stop; no connection retry is requested afterwards
    pub fn stop(&self) {
        info!("Stopping the command execution");
        self.user_stop.store(true, Ordering::SeqCst);
        self.session.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait for the looper task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Command looper task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, LooperEvent};
    use obd_connector::{AposW3, Elm327};
    use obd_protocol::mock::{MockConfig, MockElm327};
    use tokio::sync::mpsc;

    fn looper(config: MockConfig, device_name: &str) -> (CommandLooper, mpsc::Receiver<LooperEvent>) {
        let transport = MockElm327::new(config).spawn();
        let (listener, rx) = ChannelListener::new(256);
        let listener = Arc::new(listener);
        let looper = CommandLooper::new(
            transport,
            device_name,
            listener.clone(),
            listener,
            LooperConfig::default(),
        );
        (looper, rx)
    }

    /// Receive events until `stop` matches one, returning everything seen
    async fn events_until<F>(rx: &mut mpsc::Receiver<LooperEvent>, stop: F) -> Vec<LooperEvent>
    where
        F: Fn(&LooperEvent) -> bool,
    {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = stop(&event);
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn status_updates(events: &[LooperEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                LooperEvent::StatusUpdate(status) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_forwards_measurements() {
        let (looper, mut rx) = looper(MockConfig::slow_reset(), "OBDII");
        let handle = looper.start();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::Update(_))).await;
        assert_eq!(status_updates(&events), vec!["Trying ELM327."]);
        assert!(events.iter().any(|e| matches!(e, LooperEvent::ConnectionVerified)));
        assert!(events
            .iter()
            .any(|e| matches!(e, LooperEvent::Connected(name) if name == "OBDII")));

        handle.stop();
        handle.join().await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, LooperEvent::ConnectionRetry(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_next_candidate() {
        // a regular reset banner is not enough for the ELM327 profile
        let (looper, mut rx) = looper(MockConfig::default(), "OBDII");
        let handle = looper.start();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::Update(_))).await;
        assert_eq!(
            status_updates(&events),
            vec!["Trying ELM327.", "Trying AposW3."]
        );

        handle.stop();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_name_selects_preferred_adapter() {
        let (looper, mut rx) = looper(MockConfig::default(), "APOS OBD_W3");
        let handle = looper.start();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::ConnectionVerified)).await;
        assert_eq!(status_updates(&events), vec!["Trying AposW3."]);

        handle.stop();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_adapter_exhausts_all_candidates() {
        let (looper, mut rx) = looper(MockConfig::silent(), "Unknown");
        let handle = looper.start();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::AllAdaptersFailed)).await;
        assert_eq!(
            status_updates(&events)
                .iter()
                .filter(|s| s.as_str() == "Trying OBDLink MX.")
                .count(),
            2
        );
        assert!(status_updates(&events).contains(&"Trying DriveDeck Sport.".to_string()));
        assert!(!events.iter().any(|e| matches!(e, LooperEvent::ConnectionVerified)));

        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_candidates_round_robin() {
        let transport = MockElm327::new(MockConfig::silent()).spawn();
        let (listener, mut rx) = ChannelListener::new(64);
        let listener = Arc::new(listener);
        let handle = CommandLooper::new(
            transport,
            "APOS OBD_W3",
            listener.clone(),
            listener,
            LooperConfig::default(),
        )
        .with_candidates(|transport, options| {
            vec![
                Box::new(Elm327::connector(transport.clone(), options.clone())) as Box<dyn Connector>,
                Box::new(AposW3::connector(transport.clone(), options.clone())),
            ]
        })
        .start();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::AllAdaptersFailed)).await;
        // preferred first, then wrap around to the start of the list
        assert_eq!(
            status_updates(&events),
            vec!["Trying AposW3.", "Trying ELM327."]
        );
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_connection_loss_requests_retry() {
        let config = MockConfig {
            searching_replies: 10_000,
            ..MockConfig::slow_reset()
        };
        let (looper, mut rx) = looper(config, "OBDII");
        let handle = looper.start();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::ConnectionRetry(_))).await;
        assert!(events.iter().any(|e| matches!(e, LooperEvent::ConnectionVerified)));
        assert!(matches!(
            events.last(),
            Some(LooperEvent::ConnectionRetry(ObdError::PhaseRepeated {
                phase: "Initialization",
                count: 2
            }))
        ));
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_requests_retry() {
        let config = MockConfig {
            hang_up_after: Some(9),
            ..MockConfig::slow_reset()
        };
        let (looper, mut rx) = looper(config, "OBDII");
        let handle = looper.start();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::ConnectionRetry(_))).await;
        assert!(matches!(
            events.last(),
            Some(LooperEvent::ConnectionRetry(e)) if e.is_transport()
        ));
        handle.join().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_stop_during_initialization() {
        let (looper, mut rx) = looper(MockConfig::silent(), "OBDII");
        let handle = looper.start();

        events_until(&mut rx, |e| matches!(e, LooperEvent::StatusUpdate(_))).await;
        assert!(handle.is_running());
        handle.stop();
        handle.join().await;

        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(
                event,
                LooperEvent::ConnectionRetry(_) | LooperEvent::AllAdaptersFailed
            ));
        }
    }

    /// Adapter that only claims the device once it is being torn down
    #[derive(Default)]
    struct ClaimsOnShutdown {
        claimed: AtomicBool,
        shutdown: CancellationToken,
    }

    #[async_trait::async_trait]
    impl Connector for ClaimsOnShutdown {
        fn name(&self) -> &'static str {
            "Claiming"
        }

        fn supports_device(&self, device_name: &str) -> bool {
            device_name == "CLAIMING"
        }

        fn connection_state(&self) -> ConnectionState {
            if self.claimed.load(Ordering::SeqCst) {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }

        async fn execute_initialization_commands(&mut self) -> Result<(), ObdError> {
            Ok(())
        }

        async fn execute_request_commands(&mut self) -> Result<Vec<obd_protocol::Command>, ObdError> {
            Ok(Vec::new())
        }

        fn maximum_tries_for_initialization(&self) -> u32 {
            1
        }

        fn preferred_request_period(&self) -> Duration {
            Duration::from_millis(100)
        }

        fn shutdown_handle(&self) -> CancellationToken {
            self.shutdown.clone()
        }

        fn prepare_shutdown(&self) {
            self.claimed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_adapter_is_never_replaced() {
        // an ELM327 would connect on this mock if it were ever tried
        let transport = MockElm327::new(MockConfig::slow_reset()).spawn();
        let (listener, mut rx) = ChannelListener::new(64);
        let listener = Arc::new(listener);
        let handle = CommandLooper::new(
            transport,
            "CLAIMING",
            listener.clone(),
            listener,
            LooperConfig::default(),
        )
        .with_candidates(|transport, options| {
            vec![
                Box::new(ClaimsOnShutdown::default()) as Box<dyn Connector>,
                Box::new(Elm327::connector(transport.clone(), options.clone())),
            ]
        })
        .start();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::AllAdaptersFailed)).await;
        assert_eq!(status_updates(&events), vec!["Trying Claiming."]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, LooperEvent::ConnectionVerified | LooperEvent::ConnectionRetry(_))));
        handle.join().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_window_requests_retry() {
        // connects on the AT commands, then every PID answers NO DATA
        let config = MockConfig {
            supported_mask: 0,
            ..MockConfig::slow_reset()
        };
        let (looper, mut rx) = looper(config, "OBDII");
        let handle = looper.start();

        events_until(&mut rx, |e| matches!(e, LooperEvent::Connected(_))).await;
        let measuring_since = tokio::time::Instant::now();

        let events = events_until(&mut rx, |e| matches!(e, LooperEvent::ConnectionRetry(_))).await;
        let elapsed = measuring_since.elapsed();
        assert!(!events.iter().any(|e| matches!(e, LooperEvent::Update(_))));
        assert!(matches!(
            events.last(),
            Some(LooperEvent::ConnectionRetry(ObdError::NoData(60)))
        ));
        // checked every 20s: still inside the window at 60s, expired at 80s
        assert!(
            elapsed >= Duration::from_secs(79) && elapsed <= Duration::from_secs(81),
            "fired after {:?}",
            elapsed
        );

        handle.join().await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, LooperEvent::ConnectionRetry(_)));
        }
    }
}
