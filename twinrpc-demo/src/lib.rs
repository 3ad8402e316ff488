use serde::{Deserialize, Serialize};
use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};
use twinrpc::{Context, Error, ErrorKind, Result};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub calls: u64,
    pub notes: Vec<String>,
}

#[twinrpc::service]
pub trait Calculator {
    async fn add(&self, a: i64, b: i64) -> Result<i64>;

    /// Fails with `InvalidArgument` when `b` is zero.
    async fn divide(&self, a: i64, b: i64) -> Result<i64>;

    /// Sums `values`, reporting progress to the caller's `Progress` service
    /// when it bound one.
    async fn sum(&self, values: Vec<i64>) -> Result<i64>;

    #[oneway]
    async fn record(&self, note: String) -> Result<()>;

    async fn stats(&self) -> Result<Stats>;
}

/// Bound by clients that want progress reports.
#[twinrpc::service]
pub trait Progress {
    async fn report(&self, done: usize, total: usize) -> Result<()>;
}

#[derive(Default)]
pub struct CalculatorImpl {
    calls: AtomicU64,
    notes: Mutex<Vec<String>>,
}

impl CalculatorImpl {
    fn count(&self) {
        self.calls.fetch_add(1, Ordering::AcqRel);
    }
}

impl Calculator for CalculatorImpl {
    async fn add(&self, a: i64, b: i64) -> Result<i64> {
        self.count();
        a.checked_add(b)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "overflow".into()))
    }

    async fn divide(&self, a: i64, b: i64) -> Result<i64> {
        self.count();
        a.checked_div(b)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "division by zero".into()))
    }

    async fn sum(&self, values: Vec<i64>) -> Result<i64> {
        self.count();
        let mut progress =
            Context::current().map(|ctx| ctx.peer().get_remote_service::<ProgressProxy>());
        let mut total = 0i64;
        for (i, value) in values.iter().enumerate() {
            total = total.saturating_add(*value);
            if let Some(listener) = &progress {
                match listener.report(i + 1, values.len()).await {
                    Ok(()) => {}
                    // the caller did not bind a listener.
                    Err(err) if err.kind == ErrorKind::BindError => progress = None,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(total)
    }

    async fn record(&self, note: String) -> Result<()> {
        self.count();
        tracing::info!("note: {note}");
        if let Ok(mut notes) = self.notes.lock() {
            notes.push(note);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Stats> {
        let notes = self.notes.lock().map(|n| n.clone()).unwrap_or_default();
        Ok(Stats {
            calls: self.calls.load(Ordering::Acquire),
            notes,
        })
    }
}
