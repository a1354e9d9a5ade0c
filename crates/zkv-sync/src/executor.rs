//! Crypto task executor: runs key derivation and cipher work on a dedicated
//! worker thread so PBKDF2 never stalls the async runtime.
//!
//! ```text
//! caller ──WorkerRequest{id, op}──▶ std mpsc ──▶ zkv-crypto-worker thread
//!    ▲                                                   │
//!    └── oneshot ◀── dispatcher task ◀── tokio mpsc ◀────┘ (id, result)
//! ```
//!
//! Each request gets a correlation id and a pending one-shot reply. A request
//! that outlives the task timeout is removed from the pending map and fails
//! with `WorkerTimeout`; its late result is discarded.
//!
//! When no worker is available (disabled, no runtime, spawn failure, closed
//! channel, after shutdown) the same operation runs on the caller's task
//! after a cooperative yield.

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use zkv_core::config::ExecutorConfig;
use zkv_core::types::{EncryptedEnvelope, KdfParams, UserCredentialRecord};
use zkv_core::{ZkvError, ZkvResult};
use zkv_crypto::{AuthenticatedCipher, CredentialParams, VerifyOutcome};

const WORKER_THREAD_NAME: &str = "zkv-crypto-worker";

/// A unit of crypto work.
pub enum CryptoOp {
    Encrypt {
        plaintext: String,
        secret: SecretString,
        params: KdfParams,
    },
    Decrypt {
        envelope: EncryptedEnvelope,
        secret: SecretString,
    },
    /// Validate a secret against a credential record.
    Verify {
        record: Box<UserCredentialRecord>,
        secret: SecretString,
    },
    Enroll {
        owner_id: String,
        secret: SecretString,
        hint: Option<String>,
    },
}

impl CryptoOp {
    pub fn type_name(&self) -> &'static str {
        match self {
            CryptoOp::Encrypt { .. } => "encrypt",
            CryptoOp::Decrypt { .. } => "decrypt",
            CryptoOp::Verify { .. } => "verify",
            CryptoOp::Enroll { .. } => "enroll",
        }
    }
}

#[derive(Debug)]
pub enum CryptoOutput {
    Envelope(EncryptedEnvelope),
    Plaintext(String),
    Verified(VerifyOutcome),
    Enrolled(Box<UserCredentialRecord>),
}

struct WorkerRequest {
    id: u64,
    op: CryptoOp,
}

type Reply = oneshot::Sender<ZkvResult<CryptoOutput>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

/// Everything needed to execute an op, shared by the worker and the inline path.
#[derive(Clone)]
struct OpRunner {
    cipher: AuthenticatedCipher,
    credential_params: CredentialParams,
}

impl OpRunner {
    fn run(&self, op: CryptoOp) -> ZkvResult<CryptoOutput> {
        match op {
            CryptoOp::Encrypt {
                plaintext,
                secret,
                params,
            } => self
                .cipher
                .encrypt(&plaintext, &secret, &params)
                .map(CryptoOutput::Envelope),
            CryptoOp::Decrypt { envelope, secret } => self
                .cipher
                .decrypt(&envelope, &secret)
                .map(CryptoOutput::Plaintext),
            CryptoOp::Verify { record, secret } => {
                zkv_crypto::verify(&self.cipher, &record, &secret, &self.credential_params)
                    .map(CryptoOutput::Verified)
            }
            CryptoOp::Enroll {
                owner_id,
                secret,
                hint,
            } => zkv_crypto::enroll(
                &self.cipher,
                &owner_id,
                &secret,
                hint,
                &self.credential_params,
            )
            .map(|record| CryptoOutput::Enrolled(Box::new(record))),
        }
    }
}

struct WorkerHandle {
    requests: std_mpsc::Sender<WorkerRequest>,
}

pub struct CryptoTaskExecutor {
    runner: OpRunner,
    timeout: Duration,
    next_id: AtomicU64,
    pending: PendingMap,
    worker: Mutex<Option<WorkerHandle>>,
}

impl CryptoTaskExecutor {
    /// Start the worker thread, or configure the inline fallback when the
    /// worker is disabled or cannot start.
    pub fn start(
        config: &ExecutorConfig,
        cipher: AuthenticatedCipher,
        credential_params: CredentialParams,
    ) -> Self {
        let runner = OpRunner {
            cipher,
            credential_params,
        };
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let worker = if config.use_worker {
            spawn_worker(runner.clone(), pending.clone())
        } else {
            info!("crypto worker disabled by config; running tasks inline");
            None
        };

        CryptoTaskExecutor {
            runner,
            timeout: config.task_timeout(),
            next_id: AtomicU64::new(1),
            pending,
            worker: Mutex::new(worker),
        }
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stop the worker. Later tasks run inline; queued tasks still complete.
    pub fn shutdown(&self) {
        if self.worker.lock().take().is_some() {
            info!("crypto worker shutting down");
        }
    }

    /// Submit an op and await its result.
    pub async fn run(&self, op: CryptoOp) -> ZkvResult<CryptoOutput> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let requests = self.worker.lock().as_ref().map(|w| w.requests.clone());
        let Some(requests) = requests else {
            return self.run_inline(op).await;
        };

        let task_type = op.type_name();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        if let Err(std_mpsc::SendError(request)) = requests.send(WorkerRequest { id, op }) {
            self.pending.lock().remove(&id);
            warn!(task_id = id, "crypto worker channel closed; running task inline");
            self.worker.lock().take();
            return self.run_inline(request.op).await;
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ZkvError::Other(anyhow::anyhow!(
                "crypto worker dropped task {id}"
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(task_id = id, task_type, timeout_ms, "crypto task timed out");
                Err(ZkvError::WorkerTimeout {
                    task_id: id,
                    timeout_ms,
                })
            }
        }
    }

    pub async fn encrypt(
        &self,
        plaintext: String,
        secret: &SecretString,
        params: KdfParams,
    ) -> ZkvResult<EncryptedEnvelope> {
        match self
            .run(CryptoOp::Encrypt {
                plaintext,
                secret: dup_secret(secret),
                params,
            })
            .await?
        {
            CryptoOutput::Envelope(envelope) => Ok(envelope),
            other => Err(unexpected("encrypt", &other)),
        }
    }

    pub async fn decrypt(
        &self,
        envelope: EncryptedEnvelope,
        secret: &SecretString,
    ) -> ZkvResult<String> {
        match self
            .run(CryptoOp::Decrypt {
                envelope,
                secret: dup_secret(secret),
            })
            .await?
        {
            CryptoOutput::Plaintext(plaintext) => Ok(plaintext),
            other => Err(unexpected("decrypt", &other)),
        }
    }

    pub async fn verify(
        &self,
        record: UserCredentialRecord,
        secret: &SecretString,
    ) -> ZkvResult<VerifyOutcome> {
        match self
            .run(CryptoOp::Verify {
                record: Box::new(record),
                secret: dup_secret(secret),
            })
            .await?
        {
            CryptoOutput::Verified(outcome) => Ok(outcome),
            other => Err(unexpected("verify", &other)),
        }
    }

    pub async fn enroll(
        &self,
        owner_id: &str,
        secret: &SecretString,
        hint: Option<String>,
    ) -> ZkvResult<UserCredentialRecord> {
        match self
            .run(CryptoOp::Enroll {
                owner_id: owner_id.to_string(),
                secret: dup_secret(secret),
                hint,
            })
            .await?
        {
            CryptoOutput::Enrolled(record) => Ok(*record),
            other => Err(unexpected("enroll", &other)),
        }
    }

    async fn run_inline(&self, op: CryptoOp) -> ZkvResult<CryptoOutput> {
        tokio::task::yield_now().await;
        self.runner.run(op)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for CryptoTaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(runner: OpRunner, pending: PendingMap) -> Option<WorkerHandle> {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(h) => h,
        Err(_) => {
            warn!("no tokio runtime; crypto tasks will run inline");
            return None;
        }
    };

    let (req_tx, req_rx) = std_mpsc::channel::<WorkerRequest>();
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<(u64, ZkvResult<CryptoOutput>)>();

    let spawned = std::thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || worker_loop(req_rx, resp_tx, runner));
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn crypto worker; crypto tasks will run inline");
        return None;
    }

    // Ends once the worker thread exits and drops its response sender.
    handle.spawn(async move {
        while let Some((id, result)) = resp_rx.recv().await {
            let reply = pending.lock().remove(&id);
            match reply {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => debug!(task_id = id, "discarding result of abandoned crypto task"),
            }
        }
        debug!("crypto worker dispatcher stopped");
    });

    info!("crypto worker started");
    Some(WorkerHandle { requests: req_tx })
}

fn worker_loop(
    requests: std_mpsc::Receiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<(u64, ZkvResult<CryptoOutput>)>,
    runner: OpRunner,
) {
    while let Ok(WorkerRequest { id, op }) = requests.recv() {
        let result = runner.run(op);
        if responses.send((id, result)).is_err() {
            break;
        }
    }
    debug!("crypto worker thread exiting");
}

fn dup_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

fn unexpected(op: &str, output: &CryptoOutput) -> ZkvError {
    let kind = match output {
        CryptoOutput::Envelope(_) => "envelope",
        CryptoOutput::Plaintext(_) => "plaintext",
        CryptoOutput::Verified(_) => "verification",
        CryptoOutput::Enrolled(_) => "credential",
    };
    ZkvError::Other(anyhow::anyhow!("{op} task returned {kind} output"))
}
