//! Recording driver for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::driver::row::Row;
use crate::driver::traits::{Driver, QueryRunner};
use crate::error::AppError;

type Responder = dyn Fn(&str, &[JsonValue]) -> Result<Vec<Row>, AppError> + Send + Sync;

/// A statement seen by a mock runner.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub runner: usize,
    pub sql: String,
    pub params: Vec<JsonValue>,
}

struct MockState {
    statements: Mutex<Vec<Statement>>,
    responder: Box<Responder>,
    created: AtomicUsize,
    released: AtomicUsize,
}

/// Driver whose runners record every statement and answer through a responder.
///
/// Transaction control is recorded as `BEGIN`, `COMMIT` and `ROLLBACK`
/// statements and also goes through the responder, so tests can make any of
/// them fail.
#[derive(Clone)]
pub(crate) struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::with_responder(|_, _| Ok(Vec::new()))
    }

    pub fn with_responder(
        responder: impl Fn(&str, &[JsonValue]) -> Result<Vec<Row>, AppError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::new(MockState {
                statements: Mutex::new(Vec::new()),
                responder: Box::new(responder),
                created: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.state.statements.lock().unwrap().clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    pub fn runners_created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn runners_released(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn create_query_runner(&self) -> Result<Arc<dyn QueryRunner>, AppError> {
        let id = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockRunner {
            id,
            state: self.state.clone(),
            transaction_active: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }))
    }
}

pub(crate) struct MockRunner {
    id: usize,
    state: Arc<MockState>,
    transaction_active: AtomicBool,
    released: AtomicBool,
}

impl MockRunner {
    fn run(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>, AppError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AppError::RunnerReleased);
        }
        self.state.statements.lock().unwrap().push(Statement {
            runner: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        (self.state.responder)(sql, params)
    }
}

#[async_trait]
impl QueryRunner for MockRunner {
    async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>, AppError> {
        self.run(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<u64, AppError> {
        self.run(sql, params).map(|rows| rows.len() as u64)
    }

    async fn start_transaction(&self) -> Result<(), AppError> {
        if self.transaction_active.load(Ordering::SeqCst) {
            return Err(AppError::TransactionAlreadyStarted);
        }
        self.run("BEGIN", &[])?;
        self.transaction_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), AppError> {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return Err(AppError::TransactionNotActive);
        }
        self.run("COMMIT", &[])?;
        self.transaction_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<(), AppError> {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return Err(AppError::TransactionNotActive);
        }
        self.run("ROLLBACK", &[])?;
        self.transaction_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_transaction_active(&self) -> bool {
        self.transaction_active.load(Ordering::SeqCst)
    }

    async fn release(&self) -> Result<(), AppError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(AppError::RunnerReleased);
        }
        self.state.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
