//! Shared fixtures and in-memory collaborators for unit tests.

use crate::api::gateway::{InstanceOutcome, InstanceStatus, MessageGateway, SendOutcome};
use crate::api::models::{ChipPair, Connection, ConnectionStatus, Message, RunStatus, Usage};
use crate::api::openai::{Generated, GenerationRequest, TextGenerator};
use crate::error::{Error, Result};
use crate::storage::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Keeps the directory alive as long as the store.
pub struct TempStore {
    pub store: Store,
    _dir: TempDir,
}

pub fn temp_store() -> TempStore {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("maturador.sqlite")).unwrap();
    TempStore { store, _dir: dir }
}

pub fn connection(id: &str, name: &str, status: ConnectionStatus) -> Connection {
    Connection {
        id: id.into(),
        name: name.into(),
        status,
        phone: format!("+551100000{id}"),
        instance_name: crate::utils::instance_name_for(name),
        qr_code: None,
        profile_name: None,
        ai_model: None,
        conversations_count: 0,
        last_active: Utc::now(),
    }
}

pub fn pair(id: &str, first: &str, second: &str) -> ChipPair {
    ChipPair {
        id: id.into(),
        first_chip_id: first.into(),
        first_chip_name: String::new(),
        second_chip_id: second.into(),
        second_chip_name: String::new(),
        is_active: true,
        messages_count: 0,
        last_activity: Utc::now(),
        status: RunStatus::Stopped,
        use_instance_prompt: false,
        instance_prompt: None,
    }
}

pub fn message(id: &str, pair_id: &str, from: &str, to: &str) -> Message {
    Message {
        id: id.into(),
        pair_id: pair_id.into(),
        from_chip_id: from.into(),
        from_chip_name: from.to_uppercase(),
        to_chip_id: to.into(),
        to_chip_name: to.to_uppercase(),
        content: format!("line {id}"),
        timestamp: Utc::now(),
        model: "gpt-4o-mini".into(),
        usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
        gateway_message_id: None,
    }
}

/// Two active chips "a"/"b" named Acct-A/Acct-B, paired as "p1".
pub fn seeded_store() -> TempStore {
    let t = temp_store();
    t.store.insert_connection(&connection("a", "Acct-A", ConnectionStatus::Active)).unwrap();
    t.store.insert_connection(&connection("b", "Acct-B", ConnectionStatus::Active)).unwrap();
    t.store.insert_pair(&pair("p1", "a", "b")).unwrap();
    t
}

#[derive(Default)]
pub struct FakeGenerator {
    pub requests: Mutex<Vec<GenerationRequest>>,
    pub fail: AtomicBool,
    pub panic: AtomicBool,
    /// When set, each call waits for a permit after recording its request.
    pub gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeGenerator {
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release(&self) {
        *self.gate.lock().unwrap() = None;
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generated> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.panic.load(Ordering::SeqCst) {
            panic!("generator blew up");
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Remote("text generation failed: HTTP 500".into()));
        }
        Ok(Generated {
            text: format!("line {n} from {}", request.speaker_name),
            usage: Some(Usage { prompt_tokens: 12, completion_tokens: 6, total_tokens: 18 }),
            model: "fake-model".into(),
        })
    }
}

/// (instance, recipient, text)
pub type SentMessage = (String, String, String);

#[derive(Default)]
pub struct FakeGateway {
    pub sent: Mutex<Vec<SentMessage>>,
    pub reject: AtomicBool,
    /// Transport failure instead of a gateway answer.
    pub error: AtomicBool,
    pub unconfigured: AtomicBool,
    pub status: Mutex<Option<InstanceStatus>>,
}

impl FakeGateway {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn answer_status(&self, status: Option<InstanceStatus>) {
        *self.status.lock().unwrap() = status;
    }
}

#[async_trait]
impl MessageGateway for FakeGateway {
    fn ensure_configured(&self) -> Result<()> {
        if self.unconfigured.load(Ordering::SeqCst) {
            return Err(Error::Config("Evolution API credentials not configured".into()));
        }
        Ok(())
    }

    async fn create_instance(&self, instance_name: &str, _display_name: &str) -> Result<InstanceOutcome> {
        if self.reject.load(Ordering::SeqCst) {
            return Ok(InstanceOutcome::Rejected { error: "instance already exists".into() });
        }
        Ok(InstanceOutcome::Created {
            instance_name: instance_name.to_string(),
            qr_code: Some(format!("QR-{instance_name}")),
        })
    }

    async fn send_message(&self, instance_name: &str, recipient: &str, text: &str) -> Result<SendOutcome> {
        if self.error.load(Ordering::SeqCst) {
            return Err(Error::remote("gateway send-message", "connection refused"));
        }
        if self.reject.load(Ordering::SeqCst) {
            return Ok(SendOutcome::Rejected { error: "number not on whatsapp".into() });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((instance_name.to_string(), recipient.to_string(), text.to_string()));
        Ok(SendOutcome::Sent { message_id: Some(format!("MSG{}", sent.len())) })
    }

    async fn fetch_status(&self, instance_name: &str) -> Result<InstanceStatus> {
        self.status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Remote(format!("gateway instance {instance_name} not found")))
    }
}
