//! Agent dispatch simulator
//!
//! Spawns simulated agents behind direct transports and drives ordered,
//! unordered and reconcilable commands through the dispatch engine. Answers
//! lost on the wire for reconcilable commands are reported through the
//! command-state store, so `send_sync` can recover them.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentclient::{
    kinds, AgentError, AgentId, AgentManager, AgentSession, Answer, AnswerObserver, Command,
    CommandResult, DirectTransport, DisconnectReason, DispatchOptions, Listener, ListenerTimeout,
    MemoryCommandStateStore, Request, Sequence,
};
use agentconfig::AgentConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentsim")]
#[command(about = "Simulate agents behind the command dispatch engine", long_about = None)]
struct Cli {
    /// Agent configuration file path
    #[arg(
        short = 'c',
        long,
        env = "AGENT_CONF",
        default_value = "/etc/cloud/agent.conf"
    )]
    conf: String,

    /// Number of simulated agents
    #[arg(short, long, default_value = "3")]
    agents: u64,

    /// Commands issued to each agent
    #[arg(short = 'n', long, default_value = "12")]
    commands: usize,

    /// Endpoint kind of the simulated agents
    #[arg(short, long, default_value = "kvm")]
    kind: String,

    /// Probability that an answer is lost on the wire
    #[arg(long, default_value = "0.2")]
    loss_rate: f64,

    /// Base agent latency in milliseconds
    #[arg(long, default_value = "20")]
    latency_ms: u64,

    /// Per-pass wait for synchronous commands, in seconds
    #[arg(short, long, default_value = "3")]
    timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Default)]
struct Tally {
    answered: AtomicUsize,
    recovered: AtomicUsize,
    timed_out: AtomicUsize,
    failed: AtomicUsize,
    observed: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: &agentclient::Result<Answer>) {
        let counter = match outcome {
            Ok(_) => &self.answered,
            Err(e) if e.is_timeout() => &self.timed_out,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Observer(Arc<Tally>);

#[async_trait]
impl AnswerObserver for Observer {
    async fn on_answer(&self, _agent_id: AgentId, _answer: &Answer) {
        self.0.observed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Listener for fire-and-forget ordered commands
struct AsyncOutcome {
    tally: Arc<Tally>,
    timeout: Duration,
}

#[async_trait]
impl Listener for AsyncOutcome {
    async fn process_answers(&self, agent_id: AgentId, seq: Sequence, answer: &Answer) {
        debug!("Agent {}: async seq {} answered (success={})", agent_id, seq, answer.is_success());
        self.tally.answered.fetch_add(1, Ordering::Relaxed);
    }

    async fn process_disconnect(&self, agent_id: AgentId, seq: Sequence, reason: DisconnectReason) {
        debug!("Agent {}: async seq {} dropped: {}", agent_id, seq, reason);
        self.tally.failed.fetch_add(1, Ordering::Relaxed);
    }

    async fn process_timeout(&self, agent_id: AgentId, seq: Sequence) {
        debug!("Agent {}: async seq {} timed out", agent_id, seq);
        self.tally.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    fn timeout(&self) -> ListenerTimeout {
        ListenerTimeout::After(self.timeout)
    }
}

/// Wire behaviour of one simulated agent
#[derive(Clone)]
struct AgentBehaviour {
    latency: Duration,
    loss_rate: f64,
    store: Arc<MemoryCommandStateStore>,
    tally: Arc<Tally>,
}

async fn run_agent(
    id: AgentId,
    behaviour: AgentBehaviour,
    mut requests: mpsc::Receiver<Request>,
    answers: mpsc::Sender<Answer>,
) {
    while let Some(request) = requests.recv().await {
        let (jitter, lost) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..=behaviour.latency.as_millis() as u64), rng.gen_bool(behaviour.loss_rate))
        };
        tokio::time::sleep(behaviour.latency + Duration::from_millis(jitter)).await;

        let results = request
            .commands()
            .iter()
            .map(|c| CommandResult::ok(c.kind.clone(), "done"))
            .collect();
        let answer = Answer::new(&request, results);

        if !lost {
            if answers.send(answer).await.is_err() {
                break;
            }
            continue;
        }

        if request.reconcilable_command().is_some() {
            debug!("Agent {}: answer for seq {} lost, reporting out of band", id, request.seq());
            behaviour.store.record_answer(answer).await;
            behaviour.tally.recovered.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("Agent {}: answer for seq {} lost", id, request.seq());
        }
    }
    debug!("Simulated agent {} stopped", id);
}

async fn drive(session: Arc<AgentSession>, commands: usize, timeout: Duration, tally: Arc<Tally>) {
    for i in 0..commands {
        match i % 3 {
            0 => {
                let request =
                    session.new_request(vec![Command::new(kinds::STOP).reconcilable()], true);
                let outcome = session.send_sync(request, Some(timeout)).await;
                tally.record(&outcome);
            }
            1 => {
                let request = session.new_request(vec![Command::new("CopyCommand")], true);
                let listener = Arc::new(AsyncOutcome {
                    tally: Arc::clone(&tally),
                    timeout,
                });
                if let Err(e) = session.send(request, Some(listener)).await {
                    warn!("Agent {}: send failed: {}", session.id(), e);
                    tally.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                let request = session.new_request(vec![Command::new(kinds::PING_TEST)], false);
                let outcome = session.send_sync(request, Some(timeout)).await;
                if let Err(AgentError::Unavailable { reason, .. }) = &outcome {
                    warn!("Agent {}: {}", session.id(), reason);
                }
                tally.record(&outcome);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --debug
    let default_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    anyhow::ensure!(
        (0.0..=1.0).contains(&cli.loss_rate),
        "--loss-rate must be between 0 and 1"
    );

    let manager = if Path::new(&cli.conf).exists() {
        debug!("Loading configuration from: {}", cli.conf);
        let config = AgentConfig::from_file(&cli.conf).context("Failed to parse agent config")?;
        AgentManager::from_config(config).context("Invalid dispatch options")?
    } else {
        debug!("Configuration file not found: {}, using simulator defaults", cli.conf);
        AgentManager::new(DispatchOptions {
            reconcile_commands_enabled: true,
            reconcile_poll_interval: agentconfig::Duration(Duration::from_millis(250)),
            ..DispatchOptions::default()
        })
    };

    let store = Arc::new(MemoryCommandStateStore::new());
    let manager = Arc::new(manager.with_store(store.clone()));
    let tally = Arc::new(Tally::default());
    manager
        .answer_bus()
        .register(Arc::new(Observer(Arc::clone(&tally))))
        .await;

    let behaviour = AgentBehaviour {
        latency: Duration::from_millis(cli.latency_ms),
        loss_rate: cli.loss_rate,
        store,
        tally: Arc::clone(&tally),
    };

    let mut drivers = Vec::new();
    for id in 1..=cli.agents {
        let (transport, requests) = DirectTransport::new(id, 64);
        let (answer_tx, answer_rx) = mpsc::channel(64);

        let session = manager
            .get_or_create(id, &format!("sim-{}", id), &cli.kind, Arc::new(transport))
            .await
            .with_context(|| format!("Failed to create session for agent {}", id))?;
        session.ready();
        Arc::clone(&session).spawn_answer_pump(answer_rx);
        tokio::spawn(run_agent(id, behaviour.clone(), requests, answer_tx));

        drivers.push(drive(
            session,
            cli.commands,
            Duration::from_secs(cli.timeout),
            Arc::clone(&tally),
        ));
    }

    info!("Driving {} agents with {} commands each", cli.agents, cli.commands);
    let started = Instant::now();
    futures::future::join_all(drivers).await;

    // Let async listeners settle before tearing down
    tokio::time::sleep(Duration::from_millis(cli.latency_ms * 4)).await;
    manager.disconnect_all(DisconnectReason::Disconnected).await;

    println!("agents:     {}", cli.agents);
    println!("commands:   {}", cli.agents as usize * cli.commands);
    println!("answered:   {}", tally.answered.load(Ordering::Relaxed));
    println!("recovered:  {}", tally.recovered.load(Ordering::Relaxed));
    println!("timed out:  {}", tally.timed_out.load(Ordering::Relaxed));
    println!("failed:     {}", tally.failed.load(Ordering::Relaxed));
    println!("observed:   {}", tally.observed.load(Ordering::Relaxed));
    println!("elapsed:    {:.2?}", started.elapsed());

    Ok(())
}
