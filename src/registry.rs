//! Target registry: the fixed targets plus operator-managed custom ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::events::{Event, EventSink};

/// Identifier of the public DNS fixed target.
pub const GOOGLE_DNS: &str = "8.8.8.8";
/// Identifier the default gateway is tracked under, whatever its address.
pub const GATEWAY: &str = "gateway";

/// Registry error types.
#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("invalid target: {0} is neither an IP address nor a resolvable hostname")]
    InvalidTarget(String),
    #[error("target {0} already exists")]
    DuplicateTarget(String),
    #[error("target {0} not found")]
    NotFound(String),
    #[error("target {0} is built in and cannot be changed")]
    FixedTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Fixed,
    Custom,
}

/// A monitored destination. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub kind: TargetKind,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    fn fixed(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            kind: TargetKind::Fixed,
            updated_at: Utc::now(),
        }
    }
}

/// Owns every [`Target`]. Custom targets keep insertion order, which is
/// the order they are probed in.
pub struct TargetRegistry {
    fixed: Vec<Target>,
    custom: RwLock<Vec<Target>>,
    events: EventSink,
}

impl TargetRegistry {
    pub fn new(events: EventSink) -> Self {
        Self {
            fixed: vec![
                Target::fixed(GOOGLE_DNS, "Google DNS"),
                Target::fixed(GATEWAY, "Default Gateway"),
            ],
            custom: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Fixed targets in probe order.
    pub fn fixed(&self) -> &[Target] {
        &self.fixed
    }

    /// Every target, fixed first.
    pub async fn list(&self) -> Vec<Target> {
        let custom = self.custom.read().await;
        self.fixed.iter().chain(custom.iter()).cloned().collect()
    }

    pub async fn custom(&self) -> Vec<Target> {
        self.custom.read().await.clone()
    }

    /// Enabled custom targets in registry order.
    pub async fn enabled_custom(&self) -> Vec<Target> {
        self.custom
            .read()
            .await
            .iter()
            .filter(|t| t.enabled)
            .cloned()
            .collect()
    }

    pub async fn add(&self, id: &str, name: &str, enabled: bool) -> Result<Target, RegistryError> {
        let id = id.trim();
        if self.is_fixed(id) {
            return Err(RegistryError::DuplicateTarget(id.to_string()));
        }
        validate_target(id).await?;

        let target = Target {
            id: id.to_string(),
            name: display_name(id, name),
            enabled,
            kind: TargetKind::Custom,
            updated_at: Utc::now(),
        };

        {
            let mut custom = self.custom.write().await;
            if custom.iter().any(|t| t.id == target.id) {
                tracing::warn!("Target {} already exists", target.id);
                return Err(RegistryError::DuplicateTarget(target.id));
            }
            custom.push(target.clone());
            tracing::info!("Target added: {} ({}), {} custom targets", target.name, target.id, custom.len());
        }

        self.events.publish(Event::TargetAdded(target.clone()));
        Ok(target)
    }

    /// Rename and/or reconfigure a custom target in place.
    ///
    /// `enabled: None` keeps the current enabled state.
    pub async fn update(
        &self,
        id: &str,
        new_id: &str,
        name: &str,
        enabled: Option<bool>,
    ) -> Result<Target, RegistryError> {
        let new_id = new_id.trim();
        if self.is_fixed(id) {
            return Err(RegistryError::FixedTarget(id.to_string()));
        }
        if !self.custom.read().await.iter().any(|t| t.id == id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        if new_id != id {
            if self.is_fixed(new_id) {
                return Err(RegistryError::DuplicateTarget(new_id.to_string()));
            }
            validate_target(new_id).await?;
        }

        let updated = {
            let mut custom = self.custom.write().await;
            if new_id != id && custom.iter().any(|t| t.id == new_id) {
                return Err(RegistryError::DuplicateTarget(new_id.to_string()));
            }
            let target = custom
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            target.id = new_id.to_string();
            target.name = display_name(new_id, name);
            if let Some(enabled) = enabled {
                target.enabled = enabled;
            }
            target.updated_at = Utc::now();
            target.clone()
        };

        tracing::info!("Target updated: {} -> {} ({})", id, updated.id, updated.name);
        self.events.publish(Event::TargetUpdated {
            old_id: id.to_string(),
            target: updated.clone(),
        });
        Ok(updated)
    }

    pub async fn remove(&self, id: &str) -> Result<Target, RegistryError> {
        if self.is_fixed(id) {
            return Err(RegistryError::FixedTarget(id.to_string()));
        }

        let removed = {
            let mut custom = self.custom.write().await;
            let pos = custom
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let removed = custom.remove(pos);
            tracing::info!("Target removed: {}, {} custom targets remain", id, custom.len());
            removed
        };

        self.events.publish(Event::TargetRemoved(removed.clone()));
        Ok(removed)
    }

    fn is_fixed(&self, id: &str) -> bool {
        self.fixed.iter().any(|t| t.id == id)
    }
}

fn display_name(id: &str, name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        format!("Target {}", id)
    } else {
        name.to_string()
    }
}

/// Accept an IP literal, or a syntactically valid hostname that resolves.
///
/// Resolution is attempted once; later lookup failures surface as failed probes.
pub async fn validate_target(id: &str) -> Result<(), RegistryError> {
    if id.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if !is_hostname(id) {
        return Err(RegistryError::InvalidTarget(id.to_string()));
    }

    match tokio::net::lookup_host((id, 0)).await.map(|mut addrs| addrs.next().is_some()) {
        Ok(true) => Ok(()),
        Ok(false) => Err(RegistryError::InvalidTarget(id.to_string())),
        Err(e) => {
            tracing::warn!("Lookup of {} failed: {}", id, e);
            Err(RegistryError::InvalidTarget(id.to_string()))
        }
    }
}

fn is_hostname(s: &str) -> bool {
    let s = s.strip_suffix('.').unwrap_or(s);
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn registry() -> TargetRegistry {
        TargetRegistry::new(EventSink::new())
    }

    #[tokio::test]
    async fn test_add_and_list_keeps_order() {
        let reg = registry();
        assert_ok!(reg.add("203.0.113.9", "Edge", true).await);
        assert_ok!(reg.add("198.51.100.7", "", false).await);

        let all = reg.list().await;
        let ids: Vec<_> = all.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![GOOGLE_DNS, GATEWAY, "203.0.113.9", "198.51.100.7"]);
        assert_eq!(all[3].name, "Target 198.51.100.7");

        let enabled: Vec<_> = reg.enabled_custom().await.into_iter().map(|t| t.id).collect();
        assert_eq!(enabled, vec!["203.0.113.9"]);
    }

    #[tokio::test]
    async fn test_duplicate_add_fails() {
        let reg = registry();
        assert_ok!(reg.add("203.0.113.9", "Edge", true).await);
        assert_eq!(
            reg.add("203.0.113.9", "Again", true).await,
            Err(RegistryError::DuplicateTarget("203.0.113.9".to_string()))
        );
        assert_eq!(
            reg.add(GOOGLE_DNS, "Shadow", true).await,
            Err(RegistryError::DuplicateTarget(GOOGLE_DNS.to_string()))
        );
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let reg = registry();
        let err = assert_err!(reg.add("not a host!", "Bad", true).await);
        assert!(matches!(err, RegistryError::InvalidTarget(_)));
        assert!(reg.custom().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_fails() {
        let reg = registry();
        assert_eq!(
            reg.remove("192.0.2.1").await,
            Err(RegistryError::NotFound("192.0.2.1".to_string()))
        );
        assert!(matches!(reg.remove(GATEWAY).await, Err(RegistryError::FixedTarget(_))));
    }

    #[tokio::test]
    async fn test_rename_collision_fails() {
        let reg = registry();
        assert_ok!(reg.add("203.0.113.9", "A", true).await);
        assert_ok!(reg.add("203.0.113.10", "B", true).await);

        assert_eq!(
            reg.update("203.0.113.9", "203.0.113.10", "A", None).await,
            Err(RegistryError::DuplicateTarget("203.0.113.10".to_string()))
        );
        assert!(matches!(
            reg.update("192.0.2.50", "192.0.2.51", "X", None).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_missing_target_reports_not_found_before_validation() {
        let reg = registry();
        assert_eq!(
            reg.update("192.0.2.50", "not a host!", "X", None).await,
            Err(RegistryError::NotFound("192.0.2.50".to_string()))
        );
    }

    #[tokio::test]
    async fn test_hostname_lookup_accepts_localhost() {
        assert_ok!(validate_target("localhost").await);
    }

    #[tokio::test]
    async fn test_rename_preserves_enabled_and_position() {
        let reg = registry();
        assert_ok!(reg.add("203.0.113.9", "A", false).await);
        assert_ok!(reg.add("203.0.113.10", "B", true).await);

        let updated = assert_ok!(reg.update("203.0.113.9", "203.0.113.11", "A2", None).await);
        assert!(!updated.enabled);

        let custom = reg.custom().await;
        assert_eq!(custom[0].id, "203.0.113.11");
        assert_eq!(custom[0].name, "A2");

        let toggled = assert_ok!(reg.update("203.0.113.11", "203.0.113.11", "A2", Some(true)).await);
        assert!(toggled.enabled);
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        let reg = TargetRegistry::new(sink);

        assert_ok!(reg.add("203.0.113.9", "A", true).await);
        assert_ok!(reg.update("203.0.113.9", "203.0.113.8", "A", None).await);
        assert_ok!(reg.remove("203.0.113.8").await);

        assert_eq!(rx.recv().await.unwrap().kind(), "target_added");
        match rx.recv().await.unwrap() {
            Event::TargetUpdated { old_id, target } => {
                assert_eq!(old_id, "203.0.113.9");
                assert_eq!(target.id, "203.0.113.8");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Event::TargetRemoved(target) => assert_eq!(target.id, "203.0.113.8"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_hostname_syntax() {
        assert!(is_hostname("example.com"));
        assert!(is_hostname("my-host"));
        assert!(!is_hostname("-bad.com"));
        assert!(!is_hostname("a..b"));
        assert!(!is_hostname("has space"));
    }
}
