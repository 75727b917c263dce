use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;

use crate::rail::{
    has_identifier_shape, RailClient, RailPaymentRequest, RailRefundRequest, RailResponse,
    RailStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    AlwaysSuccess,
    AlwaysFailure,
    AlwaysTimeout,
    AlwaysPending,
}

impl FromStr for MockBehavior {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ALWAYS_SUCCESS" => Ok(Self::AlwaysSuccess),
            "ALWAYS_FAILURE" => Ok(Self::AlwaysFailure),
            "ALWAYS_TIMEOUT" => Ok(Self::AlwaysTimeout),
            "ALWAYS_PENDING" => Ok(Self::AlwaysPending),
            other => Err(anyhow::anyhow!("unknown mock rail behavior: {other}")),
        }
    }
}

/// In-process rail used for local runs and tests. Counts every call so
/// callers can assert the rail was (or was not) reached.
pub struct MockRail {
    pub behavior: MockBehavior,
    fixed_reference: Option<String>,
    status_outcome: Mutex<RailStatus>,
    validate_calls: AtomicUsize,
    payment_calls: AtomicUsize,
    refund_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl MockRail {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            fixed_reference: None,
            status_outcome: Mutex::new(RailStatus::Pending),
            validate_calls: AtomicUsize::new(0),
            payment_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    /// Every successful call reports this rail reference.
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.fixed_reference = Some(reference.into());
        self
    }

    /// What `check_status` answers from now on.
    pub fn set_status_outcome(&self, status: RailStatus) {
        if let Ok(mut guard) = self.status_outcome.lock() {
            *guard = status;
        }
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn payment_calls(&self) -> usize {
        self.payment_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn reference(&self) -> String {
        self.fixed_reference
            .clone()
            .unwrap_or_else(|| format!("mock_txn_{}", uuid::Uuid::new_v4().simple()))
    }

    fn respond(&self) -> Result<RailResponse> {
        match self.behavior {
            MockBehavior::AlwaysSuccess => Ok(RailResponse::succeeded(self.reference())),
            MockBehavior::AlwaysFailure => Ok(RailResponse::declined("MOCK_DECLINED", "mock decline")),
            MockBehavior::AlwaysTimeout => Err(anyhow::anyhow!("mock rail timeout")),
            MockBehavior::AlwaysPending => Ok(RailResponse::with_status(
                RailStatus::Pending,
                Some(self.reference()),
            )),
        }
    }
}

#[async_trait::async_trait]
impl RailClient for MockRail {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn validate_identifier(&self, identifier: &str) -> Result<bool> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(has_identifier_shape(identifier))
    }

    async fn process_payment(&self, _request: RailPaymentRequest) -> Result<RailResponse> {
        self.payment_calls.fetch_add(1, Ordering::SeqCst);
        self.respond()
    }

    async fn process_refund(&self, _request: RailRefundRequest) -> Result<RailResponse> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.respond()
    }

    async fn check_status(&self, reference: &str) -> Result<RailResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let status = self
            .status_outcome
            .lock()
            .map(|s| *s)
            .map_err(|_| anyhow::anyhow!("mock rail status lock poisoned"))?;
        Ok(match status {
            RailStatus::Failed => RailResponse::declined("MOCK_DECLINED", "mock decline"),
            other => RailResponse::with_status(other, Some(reference.to_string())),
        })
    }
}
