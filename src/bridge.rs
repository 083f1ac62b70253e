//! Bridge controller.
//!
//! Owns the [`BridgeSession`] and drives the forwarding loops between the
//! tester and the IUT.
//!
//! ```text
//!             ┌──────────── tester -> IUT ────────────┐
//! Tester ─HCI─┤ decode ─ CommandSet::encode ─ register ├─2-wire─► IUT
//!             │                                         │
//! Tester ◄────┤ intercept ─ CommandSet::decode ─ resolve├◄─2-wire─ IUT
//!             └──────────── IUT -> tester ─────────────┘
//! ```
//!
//! States go `Idle -> Running -> Draining -> Stopped` and are published on
//! a watch channel. In synchronous mode a single loop forwards one command
//! and waits for its reply before reading the next. In asynchronous mode
//! each direction runs in its own task and tester-bound frames go through
//! the writer task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::config::BridgeConfig;
use crate::correlation::{CorrelationKey, CorrelationTable, PendingCommand};
use crate::error::{BridgeError, Result};
use crate::handler::{build_command_set, CommandSet};
use crate::intercept::Interceptor;
use crate::protocol::hci::{self, status};
use crate::protocol::{Frame, HciCodec, TwoWireCodec};
use crate::transport::{BoxedReader, BoxedWriter, FrameReader, FrameSink, FrameWriter, Transport};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default time to wait for outstanding replies when stopping.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type TesterReader = FrameReader<BoxedReader, HciCodec>;
type IutReader = FrameReader<BoxedReader, TwoWireCodec>;
type IutWriter = FrameWriter<BoxedWriter, TwoWireCodec>;

/// Outcome of one loop step; a failure names the direction it ends.
type Step<T> = std::result::Result<T, DirectionFailure>;

/// How the loops are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One command at a time; IUT events are only seen while a reply is awaited.
    Synchronous,
    /// Both directions forward independently.
    #[default]
    Asynchronous,
}

/// Lifecycle of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Forwarding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    TesterToIut,
    IutToTester,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TesterToIut => f.write_str("tester -> IUT"),
            Self::IutToTester => f.write_str("IUT -> tester"),
        }
    }
}

/// A direction that ended on an error.
#[derive(Debug)]
pub struct DirectionFailure {
    pub direction: Direction,
    pub error: BridgeError,
}

impl DirectionFailure {
    pub fn new(direction: Direction, error: BridgeError) -> Self {
        Self { direction, error }
    }

    fn joined(direction: Direction, error: JoinError) -> Self {
        Self::new(direction, BridgeError::Io(std::io::Error::other(error.to_string())))
    }
}

impl fmt::Display for DirectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.direction, self.error)
    }
}

/// Runtime settings of a bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub mode: Mode,
    /// Expire commands the IUT has not answered within this time.
    pub response_timeout: Option<Duration>,
    pub drain_timeout: Duration,
    pub writer: WriterConfig,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            response_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            writer: WriterConfig::default(),
        }
    }
}

/// Counters kept while the bridge runs.
#[derive(Debug, Default)]
pub struct BridgeStats {
    commands: AtomicU64,
    replies: AtomicU64,
    events: AtomicU64,
    intercepted: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
}

impl BridgeStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commands: self.commands.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            intercepted: self.intercepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Commands forwarded to the IUT.
    pub commands: u64,
    /// Replies forwarded to the tester.
    pub replies: u64,
    /// Spontaneous events forwarded to the tester.
    pub events: u64,
    /// Tester-bound frames changed by an interception rule.
    pub intercepted: u64,
    /// Frames dropped because they could not be decoded or translated.
    pub malformed: u64,
    /// Commands answered locally instead of being forwarded.
    pub rejected: u64,
    /// Commands that timed out waiting for the IUT.
    pub expired: u64,
}

/// What `run` returns.
#[derive(Debug)]
pub struct BridgeReport {
    pub stats: StatsSnapshot,
    pub failures: Vec<DirectionFailure>,
}

impl BridgeReport {
    /// Both directions ended without an error.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Cloneable stop request, raced against every blocking read.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once `trigger` has been called on any clone.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do with a command read from the tester.
enum Admission {
    Forward { wire: Frame, key: CorrelationKey },
    /// Answer the tester without involving the IUT.
    Reply(Frame),
    Drop,
}

/// A frame read from either side, after error classification.
enum Received {
    Frame(Frame),
    Skip,
    End,
}

/// A tester-bound frame and the pending command it answered.
struct Routed {
    resolved: Option<CorrelationKey>,
    /// Answers a command rather than being a spontaneous event.
    reply: bool,
    frame: Option<Frame>,
}

/// State shared by the loops of one running bridge.
pub struct BridgeSession {
    settings: BridgeSettings,
    commands: Box<dyn CommandSet>,
    interceptor: Interceptor,
    table: CorrelationTable,
    stats: BridgeStats,
    state: watch::Sender<BridgeState>,
}

impl BridgeSession {
    fn new(settings: BridgeSettings, commands: Box<dyn CommandSet>, interceptor: Interceptor) -> Self {
        let (state, _) = watch::channel(BridgeState::Idle);
        Self {
            settings,
            commands,
            interceptor,
            table: CorrelationTable::new(),
            stats: BridgeStats::default(),
            state,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Bridge state changed");
        }
    }

    fn classify(&self, direction: Direction, read: Result<Frame>) -> Step<Received> {
        match read {
            Ok(frame) => Ok(Received::Frame(frame)),
            Err(BridgeError::MalformedFrame(reason)) => {
                tracing::warn!(%direction, %reason, "Dropping malformed frame");
                BridgeStats::bump(&self.stats.malformed);
                Ok(Received::Skip)
            }
            Err(BridgeError::Closed) => {
                tracing::info!(%direction, "Connection closed");
                Ok(Received::End)
            }
            Err(error) => Err(DirectionFailure::new(direction, error)),
        }
    }

    fn admit(&self, command: &Frame) -> Admission {
        if !command.is_command() {
            tracing::warn!(%command, "Dropping non-command packet from tester");
            return Admission::Drop;
        }

        let wire = match self.commands.encode_command(command) {
            Ok(wire) => wire,
            Err(BridgeError::UnsupportedCommand(opcode)) => {
                tracing::warn!(
                    opcode = format_args!("0x{:04X}", opcode),
                    command_set = self.commands.name(),
                    "Unsupported command, answering locally"
                );
                BridgeStats::bump(&self.stats.rejected);
                return Admission::Reply(hci::command_complete(opcode, &[status::UNKNOWN_COMMAND]));
            }
            Err(error) => {
                tracing::warn!(%command, %error, "Dropping untranslatable command");
                BridgeStats::bump(&self.stats.malformed);
                return Admission::Drop;
            }
        };

        let key = self.commands.command_key(command);
        match self.table.register(key, PendingCommand::new(key)) {
            Ok(()) => Admission::Forward { wire, key },
            Err(error) => {
                tracing::warn!(%error, "Command already in flight, rejecting");
                BridgeStats::bump(&self.stats.rejected);
                Admission::Reply(hci::command_complete(command.opcode(), &[status::COMMAND_DISALLOWED]))
            }
        }
    }

    /// Translate one tester command and send it on, or answer it locally.
    ///
    /// Returns the key now pending, if the command reached the IUT.
    async fn forward_command<S: FrameSink>(
        &self,
        command: &Frame,
        iut: &mut IutWriter,
        tester: &mut S,
    ) -> Step<Option<CorrelationKey>> {
        tracing::info!("Tester -> IUT :: {}", command);

        match self.admit(command) {
            Admission::Drop => Ok(None),
            Admission::Reply(reply) => {
                tracing::info!("Bridge -> Tester :: {}", reply);
                tester
                    .send_frame(reply)
                    .await
                    .map_err(|e| DirectionFailure::new(Direction::IutToTester, e))?;
                Ok(None)
            }
            Admission::Forward { wire, key } => {
                if let Err(error) = iut.write_frame(&wire).await {
                    let _ = self.table.resolve(&key);
                    return Err(DirectionFailure::new(Direction::TesterToIut, error));
                }
                BridgeStats::bump(&self.stats.commands);
                Ok(Some(key))
            }
        }
    }

    fn route_reply(&self, reply: &Frame) -> Routed {
        let key = self.commands.reply_key(reply);
        let resolved = key.and_then(|key| match self.table.resolve(&key) {
            Ok(pending) => {
                tracing::debug!(%key, elapsed = ?pending.age(), "Reply correlated");
                Some(key)
            }
            Err(error) => {
                tracing::warn!(%error, "Reply without pending command, forwarding anyway");
                None
            }
        });
        let dropped = Routed {
            resolved,
            reply: key.is_some(),
            frame: None,
        };

        let frame = match self.commands.decode_response(reply) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%reply, %error, "Dropping untranslatable IUT frame");
                BridgeStats::bump(&self.stats.malformed);
                return dropped;
            }
        };

        let (frame, intercepted) = match self.interceptor.intercept(&frame) {
            Some(rewritten) => {
                tracing::info!(original = %frame, rewritten = %rewritten, "Intercepted");
                (rewritten, true)
            }
            None => (frame, false),
        };

        // Both modes drop what the tester codec cannot carry, before it
        // reaches either sink.
        if let Err(error) = hci::check_encodable(&frame) {
            tracing::warn!(%frame, %error, "Dropping frame the tester cannot receive");
            BridgeStats::bump(&self.stats.malformed);
            return dropped;
        }
        if intercepted {
            BridgeStats::bump(&self.stats.intercepted);
        }

        Routed {
            frame: Some(frame),
            ..dropped
        }
    }

    /// Route one IUT frame to the tester.
    async fn deliver<S: FrameSink>(&self, reply: &Frame, tester: &mut S) -> Step<Option<CorrelationKey>> {
        let routed = self.route_reply(reply);
        let Some(frame) = routed.frame else {
            return Ok(routed.resolved);
        };

        tracing::info!("IUT -> Tester :: {}", frame);
        match tester.send_frame(frame).await {
            Ok(()) if routed.reply => BridgeStats::bump(&self.stats.replies),
            Ok(()) => BridgeStats::bump(&self.stats.events),
            Err(error) if error.is_fatal() || matches!(error, BridgeError::Closed) => {
                return Err(DirectionFailure::new(Direction::IutToTester, error));
            }
            Err(error) => {
                tracing::warn!(%error, "Dropping frame for the tester");
                BridgeStats::bump(&self.stats.malformed);
            }
        }
        Ok(routed.resolved)
    }

    fn expire_stale(&self, timeout: Duration) {
        for pending in self.table.expire_older_than(timeout) {
            tracing::warn!(key = %pending.key, age = ?pending.age(), "No response from IUT, expiring command");
            BridgeStats::bump(&self.stats.expired);
        }
    }

    /// Wait for the IUT to answer what is still pending, bounded by the
    /// drain timeout.
    async fn wait_drained(&self) {
        if self.table.is_empty() {
            return;
        }
        tracing::info!(pending = self.table.len(), "Waiting for outstanding replies");
        if tokio::time::timeout(self.settings.drain_timeout, self.table.wait_empty())
            .await
            .is_err()
        {
            tracing::warn!(pending = self.table.len(), "Drain timeout elapsed");
        }
    }

    fn abandon_pending(&self) {
        for pending in self.table.clear() {
            tracing::warn!(key = %pending.key, age = ?pending.age(), "Abandoning command without response");
        }
    }

    // --- synchronous mode ---

    async fn run_synchronous(&self, tester: Transport, iut: Transport, shutdown: &ShutdownSignal) -> Vec<DirectionFailure> {
        let (mut tester_reader, mut tester_writer) = tester.framed::<HciCodec>();
        let (mut iut_reader, mut iut_writer) = iut.framed::<TwoWireCodec>();

        let result = self
            .sync_loop(&mut tester_reader, &mut tester_writer, &mut iut_reader, &mut iut_writer, shutdown)
            .await;

        // An awaited reply was drained inside the loop; nothing else reads
        // the IUT once it is gone.
        self.set_state(BridgeState::Draining);
        if let Err(e) = tester_writer.shutdown().await {
            tracing::debug!(error = %e, "Tester shutdown failed");
        }

        result.err().into_iter().collect()
    }

    async fn sync_loop(
        &self,
        tester_reader: &mut TesterReader,
        tester_writer: &mut FrameWriter<BoxedWriter, HciCodec>,
        iut_reader: &mut IutReader,
        iut_writer: &mut IutWriter,
        shutdown: &ShutdownSignal,
    ) -> Step<()> {
        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.triggered() => return Ok(()),
                read = tester_reader.read_frame() => read,
            };
            let command = match self.classify(Direction::TesterToIut, read)? {
                Received::Frame(frame) => frame,
                Received::Skip => continue,
                Received::End => return Ok(()),
            };

            let Some(key) = self.forward_command(&command, iut_writer, tester_writer).await? else {
                continue;
            };
            if !self.await_reply(key, iut_reader, tester_writer, shutdown).await? {
                return Ok(());
            }
        }
    }

    /// Forward IUT frames until the reply for `key` arrives.
    ///
    /// Returns `false` when the bridge should stop.
    async fn await_reply(
        &self,
        key: CorrelationKey,
        iut_reader: &mut IutReader,
        tester: &mut FrameWriter<BoxedWriter, HciCodec>,
        shutdown: &ShutdownSignal,
    ) -> Step<bool> {
        let deadline = self
            .settings
            .response_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let next = async {
                match deadline {
                    Some(at) => tokio::time::timeout_at(at, iut_reader.read_frame()).await.ok(),
                    None => Some(iut_reader.read_frame().await),
                }
            };
            let read = tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    self.drain_reply(key, iut_reader, tester).await?;
                    return Ok(false);
                }
                read = next => read,
            };

            let Some(read) = read else {
                if let Ok(pending) = self.table.resolve(&key) {
                    tracing::warn!(key = %pending.key, age = ?pending.age(), "No response from IUT, expiring command");
                    BridgeStats::bump(&self.stats.expired);
                }
                return Ok(true);
            };

            let reply = match self.classify(Direction::IutToTester, read)? {
                Received::Frame(frame) => frame,
                Received::Skip => continue,
                Received::End => return Ok(false),
            };
            if self.deliver(&reply, tester).await? == Some(key) {
                return Ok(true);
            }
        }
    }

    /// Keep forwarding IUT frames until `key` is answered or the drain
    /// timeout elapses.
    async fn drain_reply(
        &self,
        key: CorrelationKey,
        iut_reader: &mut IutReader,
        tester: &mut FrameWriter<BoxedWriter, HciCodec>,
    ) -> Step<()> {
        self.set_state(BridgeState::Draining);
        tracing::info!(%key, "Waiting for outstanding reply");
        let deadline = tokio::time::Instant::now() + self.settings.drain_timeout;

        while self.table.contains(&key) {
            let Ok(read) = tokio::time::timeout_at(deadline, iut_reader.read_frame()).await else {
                tracing::warn!(%key, "Drain timeout elapsed");
                break;
            };
            match self.classify(Direction::IutToTester, read)? {
                Received::Frame(reply) => {
                    self.deliver(&reply, tester).await?;
                }
                Received::Skip => {}
                Received::End => break,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSession")
            .field("settings", &self.settings)
            .field("commands", &self.commands.name())
            .field("rules", &self.interceptor.rules().len())
            .field("pending", &self.table.len())
            .finish()
    }
}

// --- asynchronous mode ---

async fn tester_to_iut(
    session: Arc<BridgeSession>,
    mut tester: TesterReader,
    mut iut: IutWriter,
    mut to_tester: WriterHandle,
    shutdown: ShutdownSignal,
    stop: ShutdownSignal,
) -> Step<()> {
    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.triggered() => return Ok(()),
            _ = stop.triggered() => return Ok(()),
            read = tester.read_frame() => read,
        };
        match session.classify(Direction::TesterToIut, read)? {
            Received::Frame(command) => {
                session.forward_command(&command, &mut iut, &mut to_tester).await?;
            }
            Received::Skip => {}
            Received::End => return Ok(()),
        }
    }
}

async fn iut_to_tester(
    session: Arc<BridgeSession>,
    mut iut: IutReader,
    mut to_tester: WriterHandle,
    stop: ShutdownSignal,
) -> Step<()> {
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.triggered() => return Ok(()),
            read = iut.read_frame() => read,
        };
        match session.classify(Direction::IutToTester, read)? {
            Received::Frame(reply) => {
                session.deliver(&reply, &mut to_tester).await?;
            }
            Received::Skip => {}
            Received::End => return Ok(()),
        }
    }
}

async fn sweep(session: Arc<BridgeSession>, timeout: Duration, stop: ShutdownSignal) {
    let period = (timeout / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.triggered() => return,
            _ = ticker.tick() => session.expire_stale(timeout),
        }
    }
}

fn record(failures: &mut Vec<DirectionFailure>, direction: Direction, joined: std::result::Result<Step<()>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        // The writer task reports its own failure.
        Ok(Err(failure)) if matches!(failure.error, BridgeError::Closed) => {}
        Ok(Err(failure)) => failures.push(failure),
        Err(error) => failures.push(DirectionFailure::joined(direction, error)),
    }
}

async fn run_asynchronous(
    session: Arc<BridgeSession>,
    tester: Transport,
    iut: Transport,
    shutdown: ShutdownSignal,
) -> Vec<DirectionFailure> {
    let stop = ShutdownSignal::new();
    let (_, tester_reader, tester_writer) = tester.into_parts();
    let (iut_reader, iut_writer) = iut.framed::<TwoWireCodec>();
    let (to_tester, writer_task) =
        spawn_writer_task::<_, HciCodec>(tester_writer, session.settings.writer.clone());

    let mut commands: JoinHandle<Step<()>> = tokio::spawn(tester_to_iut(
        session.clone(),
        FrameReader::new(tester_reader),
        iut_writer,
        to_tester.clone(),
        shutdown,
        stop.clone(),
    ));
    let mut replies: JoinHandle<Step<()>> =
        tokio::spawn(iut_to_tester(session.clone(), iut_reader, to_tester, stop.clone()));
    let sweeper = session
        .settings
        .response_timeout
        .map(|timeout| tokio::spawn(sweep(session.clone(), timeout, stop.clone())));

    let mut failures = Vec::new();

    // Whichever direction ends first starts the drain.
    let (ended, joined) = tokio::select! {
        joined = &mut commands => (Direction::TesterToIut, joined),
        joined = &mut replies => (Direction::IutToTester, joined),
    };
    record(&mut failures, ended, joined);
    let (mut remaining, remaining_direction) = match ended {
        Direction::TesterToIut => (replies, Direction::IutToTester),
        Direction::IutToTester => (commands, Direction::TesterToIut),
    };

    session.set_state(BridgeState::Draining);
    let finished = if remaining_direction == Direction::IutToTester {
        // Replies can still arrive: give them the drain timeout.
        tokio::select! {
            joined = &mut remaining => Some(joined),
            _ = session.wait_drained() => None,
        }
    } else {
        None
    };

    stop.trigger();
    let joined = match finished {
        Some(joined) => joined,
        None => remaining.await,
    };
    record(&mut failures, remaining_direction, joined);

    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => failures.push(DirectionFailure::new(Direction::IutToTester, error)),
        Err(error) => failures.push(DirectionFailure::joined(Direction::IutToTester, error)),
    }

    failures
}

/// Bidirectional HCI <-> 2-wire bridge.
///
/// # Example
///
/// ```
/// use hci_bridge::bridge::{Bridge, BridgeSettings, BridgeState, ShutdownSignal};
/// use hci_bridge::handler::{build_command_set, CommandSetKind};
/// use hci_bridge::intercept::Interceptor;
/// use hci_bridge::transport::Transport;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (tester, _tester_peer) = tokio::io::duplex(256);
/// let (iut, _iut_peer) = tokio::io::duplex(256);
///
/// let bridge = Bridge::new(
///     BridgeSettings::default(),
///     build_command_set(CommandSetKind::Ble),
///     Interceptor::default(),
/// );
/// assert_eq!(bridge.state(), BridgeState::Idle);
///
/// let shutdown = ShutdownSignal::new();
/// shutdown.trigger();
/// let report = bridge
///     .run(Transport::from_stream("tester", tester), Transport::from_stream("iut", iut), shutdown)
///     .await;
/// assert!(report.is_clean());
/// # }
/// ```
pub struct Bridge {
    session: Arc<BridgeSession>,
}

impl Bridge {
    pub fn new(settings: BridgeSettings, commands: Box<dyn CommandSet>, interceptor: Interceptor) -> Self {
        Self {
            session: Arc::new(BridgeSession::new(settings, commands, interceptor)),
        }
    }

    /// Build a bridge from a loaded configuration.
    ///
    /// Fails if an interception rule does not compile.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let interceptor = Interceptor::from_config(&config.intercept)?;
        Ok(Self::new(
            config.settings(),
            build_command_set(config.command_set),
            interceptor,
        ))
    }

    pub fn state(&self) -> BridgeState {
        *self.session.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.session.state.subscribe()
    }

    /// Forward between the two transports until a direction ends or
    /// `shutdown` fires, then drain and stop.
    pub async fn run(self, tester: Transport, iut: Transport, shutdown: ShutdownSignal) -> BridgeReport {
        let session = self.session;
        tracing::info!(
            mode = ?session.settings.mode,
            command_set = session.commands.name(),
            tester = tester.name(),
            iut = iut.name(),
            rules = session.interceptor.rules().len(),
            "Starting bridge"
        );
        session.set_state(BridgeState::Running);

        let failures = match session.settings.mode {
            Mode::Synchronous => session.run_synchronous(tester, iut, &shutdown).await,
            Mode::Asynchronous => run_asynchronous(session.clone(), tester, iut, shutdown).await,
        };

        session.abandon_pending();
        session.set_state(BridgeState::Stopped);

        for failure in &failures {
            tracing::error!(direction = %failure.direction, error = %failure.error, "Direction failed");
        }
        let stats = session.stats.snapshot();
        tracing::info!(?stats, "Bridge stopped");

        BridgeReport { stats, failures }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::duplex;

    use super::*;
    use crate::handler::{BleCommands, RfCommands};
    use crate::intercept::{Action, InterceptionRule};
    use crate::protocol::hci::opcodes;
    use crate::protocol::FrameKind;

    fn session(interceptor: Interceptor) -> BridgeSession {
        BridgeSession::new(BridgeSettings::default(), Box::new(BleCommands::new()), interceptor)
    }

    #[test]
    fn test_admit_registers_command() {
        let session = session(Interceptor::default());
        let reset = Frame::command(opcodes::RESET, Bytes::new());

        let Admission::Forward { wire, key } = session.admit(&reset) else {
            panic!("reset should be forwarded");
        };
        assert_eq!(wire.opcode(), opcodes::RESET);
        assert!(session.table.contains(&key));
    }

    #[test]
    fn test_admit_rejects_duplicate() {
        let session = session(Interceptor::default());
        let reset = Frame::command(opcodes::RESET, Bytes::new());

        assert!(matches!(session.admit(&reset), Admission::Forward { .. }));
        let Admission::Reply(reply) = session.admit(&reset) else {
            panic!("duplicate should be answered locally");
        };
        assert_eq!(reply.payload(), &[0x01, 0x03, 0x0C, status::COMMAND_DISALLOWED]);
        assert_eq!(session.stats().rejected, 1);
        assert_eq!(session.table.len(), 1);
    }

    #[test]
    fn test_admit_unsupported_command() {
        let session = BridgeSession::new(
            BridgeSettings::default(),
            Box::new(RfCommands::new()),
            Interceptor::default(),
        );
        let Admission::Reply(reply) = session.admit(&Frame::command(0x2006, Bytes::new())) else {
            panic!("unsupported command should be answered locally");
        };
        assert_eq!(reply.payload(), &[0x01, 0x06, 0x20, status::UNKNOWN_COMMAND]);
        assert!(session.table.is_empty());
    }

    #[test]
    fn test_admit_drops_events_from_tester() {
        let session = session(Interceptor::default());
        assert!(matches!(
            session.admit(&Frame::event(0x05, Bytes::new())),
            Admission::Drop
        ));
    }

    #[test]
    fn test_route_reply_resolves_and_intercepts() {
        let rule = InterceptionRule::new(opcodes::RESET, Action::Status(0x01)).kind(FrameKind::Response);
        let session = session(Interceptor::new(vec![rule]));
        let reset = Frame::command(opcodes::RESET, Bytes::new());
        assert!(matches!(session.admit(&reset), Admission::Forward { .. }));

        let routed = session.route_reply(&Frame::response(opcodes::RESET, Bytes::from_static(&[0x00])));

        assert_eq!(routed.resolved, Some(CorrelationKey::new(opcodes::RESET)));
        assert_eq!(routed.frame.unwrap().payload(), &[0x01, 0x03, 0x0C, 0x01]);
        assert!(session.table.is_empty());
        assert_eq!(session.stats().intercepted, 1);
    }

    #[test]
    fn test_route_reply_unknown_key_still_forwarded() {
        let session = session(Interceptor::default());
        let routed = session.route_reply(&Frame::response(opcodes::RESET, Bytes::from_static(&[0x00])));

        assert_eq!(routed.resolved, None);
        assert!(routed.frame.is_some());
    }

    #[test]
    fn test_route_reply_drops_what_the_tester_cannot_receive() {
        let session = session(Interceptor::default());

        let event = session.route_reply(&Frame::event(0x0100, Bytes::from_static(&[0x00])));
        assert!(event.frame.is_none());
        assert!(!event.reply);

        let reset = Frame::command(opcodes::RESET, Bytes::new());
        assert!(matches!(session.admit(&reset), Admission::Forward { .. }));
        let oversized = session.route_reply(&Frame::response(opcodes::RESET, Bytes::from(vec![0u8; 253])));
        assert!(oversized.frame.is_none());
        // The command is answered even though the reply is dropped.
        assert_eq!(oversized.resolved, Some(CorrelationKey::new(opcodes::RESET)));

        assert_eq!(session.stats().malformed, 2);
        assert!(session.table.is_empty());
    }

    #[test]
    fn test_expire_stale_counts() {
        let session = session(Interceptor::default());
        let key = CorrelationKey::new(opcodes::RESET);
        let mut pending = PendingCommand::new(key);
        pending.issued -= Duration::from_secs(1);
        session.table.register(key, pending).unwrap();

        session.expire_stale(Duration::from_millis(100));

        assert!(session.table.is_empty());
        assert_eq!(session.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };
        assert!(!signal.is_triggered());

        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already-triggered signals resolve immediately.
        signal.triggered().await;
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (tester, tester_peer) = duplex(64);
        let (iut, _iut_peer) = duplex(64);
        let bridge = Bridge::new(
            BridgeSettings::default(),
            Box::new(BleCommands::new()),
            Interceptor::default(),
        );
        let mut states = bridge.subscribe();
        assert_eq!(*states.borrow_and_update(), BridgeState::Idle);

        // Tester hangs up immediately.
        drop(tester_peer);
        let report = bridge
            .run(
                Transport::from_stream("tester", tester),
                Transport::from_stream("iut", iut),
                ShutdownSignal::new(),
            )
            .await;

        assert_eq!(*states.borrow(), BridgeState::Stopped);
        assert_eq!(report.stats, StatsSnapshot::default());
    }

    #[test]
    fn test_display() {
        assert_eq!(Direction::TesterToIut.to_string(), "tester -> IUT");
        assert_eq!(BridgeState::Draining.to_string(), "draining");
    }
}
