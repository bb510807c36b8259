//! Durable command-state store consulted while reconciling
//!
//! The engine only polls the store; it never holds a lock in it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{Answer, Command, Sequence};

/// Lifecycle of a reconcilable command as recorded out of band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandState {
    Pending,
    /// The agent aborted the command; it cannot be salvaged
    Interrupted,
    /// The agent lost track of the command, e.g. after a restart
    Dangling,
    Answered,
    TimedOut,
}

#[async_trait]
pub trait CommandStateStore: Send + Sync {
    async fn get_state_and_answer(
        &self,
        seq: Sequence,
        command: &Command,
    ) -> Result<(CommandState, Option<Answer>), StoreError>;

    async fn update_state(
        &self,
        seq: Sequence,
        commands: &[Command],
        state: CommandState,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Record {
    kinds: Vec<String>,
    state: CommandState,
    answer: Option<Answer>,
}

/// Process-local [`CommandStateStore`]
#[derive(Debug, Default)]
pub struct MemoryCommandStateStore {
    records: RwLock<HashMap<Sequence, Record>>,
}

impl MemoryCommandStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an answer reported out of band (e.g. by a restarted agent)
    pub async fn record_answer(&self, answer: Answer) {
        let mut records = self.records.write().await;
        let kinds = answer.results.iter().map(|r| r.kind.clone()).collect();
        let record = records.entry(answer.seq).or_insert_with(|| Record {
            kinds,
            state: CommandState::Pending,
            answer: None,
        });
        record.state = CommandState::Answered;
        record.answer = Some(answer);
    }

    pub async fn set_state(&self, seq: Sequence, state: CommandState) {
        let mut records = self.records.write().await;
        records
            .entry(seq)
            .or_insert_with(|| Record {
                kinds: Vec::new(),
                state,
                answer: None,
            })
            .state = state;
    }

    pub async fn state(&self, seq: Sequence) -> Option<CommandState> {
        self.records.read().await.get(&seq).map(|r| r.state)
    }

    pub async fn kinds(&self, seq: Sequence) -> Vec<String> {
        self.records
            .read()
            .await
            .get(&seq)
            .map(|r| r.kinds.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CommandStateStore for MemoryCommandStateStore {
    async fn get_state_and_answer(
        &self,
        seq: Sequence,
        _command: &Command,
    ) -> Result<(CommandState, Option<Answer>), StoreError> {
        let records = self.records.read().await;
        let record = records.get(&seq).ok_or(StoreError::NotFound(seq))?;
        Ok((record.state, record.answer.clone()))
    }

    async fn update_state(
        &self,
        seq: Sequence,
        commands: &[Command],
        state: CommandState,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.entry(seq).or_insert_with(|| Record {
            kinds: Vec::new(),
            state,
            answer: None,
        });
        record.kinds = commands.iter().map(|c| c.kind.clone()).collect();
        record.state = state;
        Ok(())
    }
}
