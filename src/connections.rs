use crate::api::events::Notifier;
use crate::api::gateway::{ConnectionState, InstanceOutcome, MessageGateway};
use crate::api::models::{Connection, ConnectionStatus};
use crate::error::{Error, Result};
use crate::storage::Store;
use crate::utils::{generate_phone, instance_name_for};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// Free-form label of the model this chip talks with.
    #[serde(default)]
    pub ai_model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Free-form label of the model this chip talks with.
    #[serde(default)]
    pub ai_model: Option<String>,
}

/// Known chips and their handshake state with the gateway.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Store,
    gateway: Arc<dyn MessageGateway>,
    notifier: Notifier,
}

fn set_status(c: &mut Connection, next: ConnectionStatus) {
    if c.status.can_transition_to(next) {
        c.status = next;
    } else {
        log::warn!(
            "connection {} cannot go from {} to {}, marking error",
            c.name,
            c.status.as_str(),
            next.as_str()
        );
        c.status = ConnectionStatus::Error;
    }
    c.last_active = Utc::now();
}

impl ConnectionRegistry {
    pub fn new(store: Store, gateway: Arc<dyn MessageGateway>, notifier: Notifier) -> Self {
        Self { store, gateway, notifier }
    }

    pub fn list(&self) -> Result<Vec<Connection>> {
        self.store.list_connections()
    }

    pub fn get(&self, id: &str) -> Result<Connection> {
        self.store
            .get_connection(id)?
            .ok_or_else(|| Error::NotFound(format!("connection {id}")))
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.list()?.iter().filter(|c| c.is_active()).count())
    }

    fn validate_name(&self, name: &str, except_id: Option<&str>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Validation("connection name is required".into()));
        }
        if self.store.connection_name_taken(name, except_id)? {
            return Err(Error::Validation(format!("a connection named '{name}' already exists")));
        }
        Ok(())
    }

    /// Registers a chip and opens its gateway instance. A refused handshake
    /// still stores the chip, as `inactive`.
    pub async fn create(&self, input: NewConnection) -> Result<Connection> {
        let name = input.name.trim().to_string();
        self.validate_name(&name, None)?;
        self.gateway.ensure_configured()?;

        let instance_name = instance_name_for(&name);
        let phone = input
            .phone
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(generate_phone);

        let (status, qr_code) = match self.gateway.create_instance(&instance_name, &name).await {
            Ok(InstanceOutcome::Created { qr_code, .. }) => (ConnectionStatus::Active, qr_code),
            Ok(InstanceOutcome::Rejected { error }) => {
                self.notifier.error("Connection failed", format!("{name}: {error}"));
                (ConnectionStatus::Inactive, None)
            }
            Err(e @ Error::Config(_)) => return Err(e),
            Err(e) => {
                self.notifier.error("Connection failed", format!("{name}: {e}"));
                (ConnectionStatus::Inactive, None)
            }
        };

        let connection = Connection {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            status,
            phone,
            instance_name,
            qr_code,
            profile_name: None,
            ai_model: input.ai_model.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()),
            conversations_count: 0,
            last_active: Utc::now(),
        };
        self.store.insert_connection(&connection)?;
        if connection.is_active() {
            self.notifier.success(
                "Connection created",
                format!("{} is ready; scan the QR code to link it", connection.name),
            );
        }
        Ok(connection)
    }

    pub fn update(&self, id: &str, update: ConnectionUpdate) -> Result<Connection> {
        let mut connection = self.get(id)?;
        if let Some(name) = update.name {
            let name = name.trim().to_string();
            self.validate_name(&name, Some(id))?;
            connection.name = name;
        }
        if let Some(phone) = update.phone {
            let phone = phone.trim().to_string();
            if phone.is_empty() {
                return Err(Error::Validation("phone cannot be empty".into()));
            }
            connection.phone = phone;
        }
        if let Some(model) = update.ai_model {
            let model = model.trim().to_string();
            connection.ai_model = if model.is_empty() { None } else { Some(model) };
        }
        connection.last_active = Utc::now();
        self.store.update_connection(&connection)?;
        Ok(connection)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let connection = self.get(id)?;
        let pairs = self.store.pairs_referencing(id)?;
        if pairs > 0 {
            return Err(Error::Validation(format!(
                "{} is used by {pairs} pair(s); remove them first",
                connection.name
            )));
        }
        self.store.delete_connection(id)?;
        Ok(())
    }

    /// Asks the gateway for the instance state and a fresh QR code.
    pub async fn synchronize(&self, id: &str) -> Result<Connection> {
        let mut connection = self.get(id)?;
        self.gateway.ensure_configured()?;

        set_status(&mut connection, ConnectionStatus::Connecting);
        self.store.update_connection(&connection)?;

        let status = match self.gateway.fetch_status(&connection.instance_name).await {
            Ok(status) => status,
            Err(e) => {
                set_status(&mut connection, ConnectionStatus::Error);
                self.store.update_connection(&connection)?;
                self.notifier.error("Sync failed", format!("{}: {e}", connection.name));
                return Err(e);
            }
        };

        if status.qr_code.is_some() {
            connection.qr_code = status.qr_code.clone();
        }
        match status.state {
            ConnectionState::Open => {
                set_status(&mut connection, ConnectionStatus::Active);
                if let Some(profile) = status.profile {
                    if let Some(phone) = profile.phone.filter(|p| !p.is_empty()) {
                        connection.phone = phone;
                    }
                    connection.profile_name = profile.display_name.or(connection.profile_name);
                }
                self.notifier.success("Connection synced", format!("{} is connected", connection.name));
            }
            _ if status.qr_code.is_some() => {
                set_status(&mut connection, ConnectionStatus::Connecting);
                self.notifier.info("Scan required", format!("Scan the QR code to link {}", connection.name));
            }
            state => {
                set_status(&mut connection, ConnectionStatus::Error);
                self.notifier.error(
                    "Sync failed",
                    format!("{} is not connected ({state:?})", connection.name),
                );
            }
        }
        self.store.update_connection(&connection)?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::events::NoticeLevel;
    use crate::api::gateway::{InstanceStatus, Profile};
    use crate::test_utils::*;
    use std::sync::atomic::Ordering;

    fn registry(t: &TempStore) -> (ConnectionRegistry, Arc<FakeGateway>, Notifier) {
        let gateway = Arc::new(FakeGateway::default());
        let notifier = Notifier::default();
        (ConnectionRegistry::new(t.store.clone(), gateway.clone(), notifier.clone()), gateway, notifier)
    }

    fn new(name: &str) -> NewConnection {
        NewConnection { name: name.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn create_assigns_defaults_and_activates() {
        let t = temp_store();
        let (reg, _, _) = registry(&t);
        let c = reg.create(new("  Chip Vendas ")).await.unwrap();
        assert_eq!(c.name, "Chip Vendas");
        assert_eq!(c.instance_name, "chip_vendas");
        assert!(c.phone.starts_with("+5511"));
        assert_eq!(c.status, ConnectionStatus::Active);
        assert_eq!(c.qr_code.as_deref(), Some("QR-chip_vendas"));
        assert_eq!(reg.get(&c.id).unwrap(), c);
        assert_eq!(reg.active_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_and_blank_names_are_rejected() {
        let t = temp_store();
        let (reg, _, _) = registry(&t);
        reg.create(new("Chip A")).await.unwrap();
        assert!(matches!(reg.create(new("chip a")).await, Err(Error::Validation(_))));
        assert!(matches!(reg.create(new("   ")).await, Err(Error::Validation(_))));
        assert_eq!(reg.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refused_handshake_stores_inactive_chip() {
        let t = temp_store();
        let (reg, gateway, notifier) = registry(&t);
        gateway.reject.store(true, Ordering::SeqCst);
        let c = reg.create(NewConnection { name: "Chip B".into(), phone: Some("+5511912345678".into()), ai_model: None }).await.unwrap();
        assert_eq!(c.status, ConnectionStatus::Inactive);
        assert_eq!(c.phone, "+5511912345678");
        assert_eq!(notifier.recent()[0].level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn missing_gateway_credentials_persist_nothing() {
        let t = temp_store();
        let (reg, gateway, _) = registry(&t);
        gateway.unconfigured.store(true, Ordering::SeqCst);
        assert!(matches!(reg.create(new("Chip C")).await, Err(Error::Config(_))));
        assert!(reg.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_open_instance_adopts_profile() {
        let t = temp_store();
        let (reg, gateway, _) = registry(&t);
        let c = reg.create(new("Chip A")).await.unwrap();
        gateway.answer_status(Some(InstanceStatus {
            state: ConnectionState::Open,
            qr_code: None,
            profile: Some(Profile {
                phone: Some("5511999990000".into()),
                display_name: Some("Loja A".into()),
            }),
        }));
        let synced = reg.synchronize(&c.id).await.unwrap();
        assert_eq!(synced.status, ConnectionStatus::Active);
        assert_eq!(synced.phone, "5511999990000");
        assert_eq!(synced.profile_name.as_deref(), Some("Loja A"));
    }

    #[tokio::test]
    async fn sync_with_pending_qr_stays_connecting() {
        let t = temp_store();
        let (reg, gateway, _) = registry(&t);
        let c = reg.create(new("Chip A")).await.unwrap();
        gateway.answer_status(Some(InstanceStatus {
            state: ConnectionState::Closed,
            qr_code: Some("2@fresh".into()),
            profile: None,
        }));
        let synced = reg.synchronize(&c.id).await.unwrap();
        assert_eq!(synced.status, ConnectionStatus::Connecting);
        assert_eq!(synced.qr_code.as_deref(), Some("2@fresh"));
    }

    #[tokio::test]
    async fn sync_failure_marks_error() {
        let t = temp_store();
        let (reg, gateway, notifier) = registry(&t);
        let c = reg.create(new("Chip A")).await.unwrap();
        gateway.answer_status(None);
        assert!(matches!(reg.synchronize(&c.id).await, Err(Error::Remote(_))));
        assert_eq!(reg.get(&c.id).unwrap().status, ConnectionStatus::Error);
        assert_eq!(notifier.recent()[0].title, "Sync failed");
    }

    #[tokio::test]
    async fn update_renames_and_checks_uniqueness() {
        let t = temp_store();
        let (reg, _, _) = registry(&t);
        let a = reg.create(new("Chip A")).await.unwrap();
        reg.create(new("Chip B")).await.unwrap();
        let update = |name: &str| ConnectionUpdate { name: Some(name.into()), ..Default::default() };
        assert!(matches!(reg.update(&a.id, update("chip b")), Err(Error::Validation(_))));
        let renamed = reg.update(&a.id, update("CHIP A")).unwrap();
        assert_eq!(renamed.name, "CHIP A");
        assert!(matches!(reg.update("ghost", update("x")), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn model_label_is_kept_and_can_be_cleared() {
        let t = temp_store();
        let (reg, _, _) = registry(&t);
        let c = reg
            .create(NewConnection { name: "Chip A".into(), ai_model: Some(" ChatGPT ".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(c.ai_model.as_deref(), Some("ChatGPT"));
        assert_eq!(reg.get(&c.id).unwrap().ai_model.as_deref(), Some("ChatGPT"));

        let cleared = reg
            .update(&c.id, ConnectionUpdate { ai_model: Some("  ".into()), ..Default::default() })
            .unwrap();
        assert_eq!(cleared.ai_model, None);
        assert_eq!(reg.get(&c.id).unwrap().ai_model, None);
    }

    #[test]
    fn delete_refuses_paired_chips() {
        let t = seeded_store();
        let (reg, _, _) = registry(&t);
        assert!(matches!(reg.delete("a"), Err(Error::Validation(_))));
        t.store.delete_pair("p1").unwrap();
        reg.delete("a").unwrap();
        assert!(matches!(reg.get("a"), Err(Error::NotFound(_))));
    }
}
